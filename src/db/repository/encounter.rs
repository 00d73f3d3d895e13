use std::str::FromStr;

use chrono::{NaiveDate, NaiveDateTime};
use rusqlite::{params, Connection, OptionalExtension};

use crate::db::DatabaseError;
use crate::models::enums::*;
use crate::models::*;

use super::{DATETIME_FMT, DATE_FMT};

/// Insert an encounter, skipping on natural-key conflict.
/// Returns true when a row was written.
pub fn insert_encounter(conn: &Connection, enc: &Encounter) -> Result<bool, DatabaseError> {
    let changed = conn.execute(
        "INSERT INTO encounters (encounter_id, patient_id, facility_id, encounter_date,
         encounter_datetime, encounter_type, admission_source, visit_reason)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
         ON CONFLICT (encounter_id) DO NOTHING",
        params![
            enc.encounter_id,
            enc.patient_id,
            enc.facility_id,
            enc.encounter_date.format(DATE_FMT).to_string(),
            enc.encounter_datetime.format(DATETIME_FMT).to_string(),
            enc.encounter_type.as_str(),
            enc.admission_source,
            enc.visit_reason,
        ],
    )?;
    Ok(changed > 0)
}

pub fn get_encounter(conn: &Connection, encounter_id: &str) -> Result<Option<Encounter>, DatabaseError> {
    let row = conn
        .query_row(
            "SELECT encounter_id, patient_id, facility_id, encounter_date, encounter_datetime,
             encounter_type, admission_source, visit_reason
             FROM encounters WHERE encounter_id = ?1",
            params![encounter_id],
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, String>(5)?,
                    row.get::<_, Option<String>>(6)?,
                    row.get::<_, Option<String>>(7)?,
                ))
            },
        )
        .optional()?;

    let Some((id, patient_id, facility_id, date, datetime, enc_type, source, reason)) = row else {
        return Ok(None);
    };

    Ok(Some(Encounter {
        encounter_date: NaiveDate::parse_from_str(&date, DATE_FMT)
            .map_err(|e| DatabaseError::ConstraintViolation(format!("{id}: {e}")))?,
        encounter_datetime: NaiveDateTime::parse_from_str(&datetime, DATETIME_FMT)
            .map_err(|e| DatabaseError::ConstraintViolation(format!("{id}: {e}")))?,
        encounter_id: id,
        patient_id,
        facility_id,
        encounter_type: EncounterType::from_str(&enc_type)?,
        admission_source: source,
        visit_reason: reason,
    }))
}

/// Earliest and latest encounter date, or None when there are no encounters.
pub fn get_encounter_date_range(
    conn: &Connection,
) -> Result<Option<(NaiveDate, NaiveDate)>, DatabaseError> {
    let (min, max): (Option<String>, Option<String>) = conn.query_row(
        "SELECT MIN(encounter_date), MAX(encounter_date) FROM encounters",
        [],
        |row| Ok((row.get(0)?, row.get(1)?)),
    )?;

    match (min, max) {
        (Some(min), Some(max)) => {
            let parse = |s: &str| {
                NaiveDate::parse_from_str(s, DATE_FMT)
                    .map_err(|e| DatabaseError::ConstraintViolation(format!("encounter_date {s}: {e}")))
            };
            Ok(Some((parse(&min)?, parse(&max)?)))
        }
        _ => Ok(None),
    }
}
