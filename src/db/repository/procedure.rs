use std::str::FromStr;

use chrono::NaiveDateTime;
use rusqlite::{params, Connection};

use crate::db::DatabaseError;
use crate::models::enums::*;
use crate::models::*;

use super::DATETIME_FMT;

/// Insert a procedure, skipping when `(encounter_id, procedure_code)` exists.
/// Returns true when a row was written.
pub fn insert_procedure(conn: &Connection, proc: &Procedure) -> Result<bool, DatabaseError> {
    let changed = conn.execute(
        "INSERT INTO procedures (encounter_id, procedure_code, procedure_name, body_part,
         laterality, view_position, modality, procedure_datetime)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
         ON CONFLICT (encounter_id, procedure_code) DO NOTHING",
        params![
            proc.encounter_id,
            proc.procedure_code,
            proc.procedure_name,
            proc.body_part,
            proc.laterality.as_str(),
            proc.view_position,
            proc.modality.as_str(),
            proc.procedure_datetime.format(DATETIME_FMT).to_string(),
        ],
    )?;
    Ok(changed > 0)
}

pub fn get_procedures_for_encounter(
    conn: &Connection,
    encounter_id: &str,
) -> Result<Vec<Procedure>, DatabaseError> {
    let mut stmt = conn.prepare(
        "SELECT procedure_id, encounter_id, procedure_code, procedure_name, body_part,
         laterality, view_position, modality, procedure_datetime
         FROM procedures WHERE encounter_id = ?1 ORDER BY procedure_id",
    )?;

    let rows = stmt.query_map(params![encounter_id], |row| {
        Ok((
            row.get::<_, i64>(0)?,
            row.get::<_, String>(1)?,
            row.get::<_, String>(2)?,
            row.get::<_, String>(3)?,
            row.get::<_, Option<String>>(4)?,
            row.get::<_, String>(5)?,
            row.get::<_, Option<String>>(6)?,
            row.get::<_, String>(7)?,
            row.get::<_, String>(8)?,
        ))
    })?;

    let mut procedures = Vec::new();
    for row in rows {
        let (id, encounter_id, code, name, body_part, laterality, view, modality, datetime) = row?;
        procedures.push(Procedure {
            procedure_id: Some(id),
            procedure_datetime: NaiveDateTime::parse_from_str(&datetime, DATETIME_FMT)
                .map_err(|e| DatabaseError::ConstraintViolation(format!("{code}: {e}")))?,
            encounter_id,
            procedure_code: code,
            procedure_name: name,
            body_part,
            laterality: Laterality::from_str(&laterality)?,
            view_position: view,
            modality: Modality::from_str(&modality)?,
        });
    }
    Ok(procedures)
}

/// Procedures whose code starts with `prefix`, then all the others.
pub fn count_procedures_by_prefix(conn: &Connection, prefix: &str) -> Result<(i64, i64), DatabaseError> {
    let counts = conn.query_row(
        "SELECT COALESCE(SUM(substr(procedure_code, 1, length(?1)) = ?1), 0),
                COALESCE(SUM(substr(procedure_code, 1, length(?1)) <> ?1), 0)
         FROM procedures",
        params![prefix],
        |row| Ok((row.get::<_, i64>(0)?, row.get::<_, i64>(1)?)),
    )?;
    Ok(counts)
}
