use std::str::FromStr;

use chrono::NaiveDate;
use rusqlite::{params, Connection, OptionalExtension};

use crate::db::DatabaseError;
use crate::models::enums::*;
use crate::models::*;

use super::DATE_FMT;

/// Insert a patient, skipping on natural-key conflict.
/// Returns true when a row was written.
pub fn insert_patient(conn: &Connection, patient: &Patient) -> Result<bool, DatabaseError> {
    let changed = conn.execute(
        "INSERT INTO patients (patient_id, date_of_birth, gender, primary_language,
         address_city, insurance_id, external_ref, is_active)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
         ON CONFLICT (patient_id) DO NOTHING",
        params![
            patient.patient_id,
            patient.date_of_birth.format(DATE_FMT).to_string(),
            patient.gender.as_str(),
            patient.primary_language,
            patient.address_city,
            patient.insurance_id,
            patient.external_ref,
            patient.is_active as i32,
        ],
    )?;
    Ok(changed > 0)
}

pub fn get_patient(conn: &Connection, patient_id: &str) -> Result<Option<Patient>, DatabaseError> {
    let row = conn
        .query_row(
            "SELECT patient_id, date_of_birth, gender, primary_language, address_city,
             insurance_id, external_ref, is_active
             FROM patients WHERE patient_id = ?1",
            params![patient_id],
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, Option<String>>(3)?,
                    row.get::<_, Option<String>>(4)?,
                    row.get::<_, Option<String>>(5)?,
                    row.get::<_, Option<String>>(6)?,
                    row.get::<_, i32>(7)?,
                ))
            },
        )
        .optional()?;

    let Some((patient_id, dob, gender, language, city, insurance, external, active)) = row else {
        return Ok(None);
    };

    Ok(Some(Patient {
        date_of_birth: NaiveDate::parse_from_str(&dob, DATE_FMT)
            .map_err(|e| DatabaseError::ConstraintViolation(format!("{patient_id}: {e}")))?,
        patient_id,
        gender: Gender::from_str(&gender)?,
        primary_language: language,
        address_city: city,
        insurance_id: insurance,
        external_ref: external,
        is_active: active != 0,
    }))
}

/// Soft delete. Patients are never removed; encounters keep pointing at them.
pub fn deactivate_patient(conn: &Connection, patient_id: &str) -> Result<(), DatabaseError> {
    let changed = conn.execute(
        "UPDATE patients SET is_active = 0 WHERE patient_id = ?1",
        params![patient_id],
    )?;
    if changed == 0 {
        return Err(DatabaseError::NotFound {
            entity_type: "patient".into(),
            id: patient_id.into(),
        });
    }
    Ok(())
}
