use std::collections::HashMap;

use rusqlite::{params, Connection};

use crate::db::DatabaseError;
use crate::models::*;

/// Insert a catalog entry, skipping when the id already exists.
pub fn insert_diagnosis(conn: &Connection, diag: &Diagnosis) -> Result<bool, DatabaseError> {
    let changed = conn.execute(
        "INSERT INTO diagnoses (diagnosis_id, diagnosis_code, diagnosis_name, diagnosis_category, severity)
         VALUES (?1, ?2, ?3, ?4, ?5)
         ON CONFLICT (diagnosis_id) DO NOTHING",
        params![
            diag.diagnosis_id,
            diag.diagnosis_code,
            diag.diagnosis_name,
            diag.diagnosis_category,
            diag.severity.as_str(),
        ],
    )?;
    Ok(changed > 0)
}

/// ICD code → catalog id, for resolving mapped findings without a query per row.
pub fn get_diagnosis_code_map(conn: &Connection) -> Result<HashMap<String, String>, DatabaseError> {
    let mut stmt = conn.prepare("SELECT diagnosis_code, diagnosis_id FROM diagnoses")?;
    let map = stmt
        .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))?
        .collect::<Result<HashMap<_, _>, _>>()?;
    Ok(map)
}

/// Link a diagnosis to an encounter, skipping when the pair is already linked.
pub fn insert_encounter_diagnosis(
    conn: &Connection,
    link: &EncounterDiagnosis,
) -> Result<bool, DatabaseError> {
    let changed = conn.execute(
        "INSERT INTO encounter_diagnoses (encounter_id, diagnosis_id, diagnosis_rank, is_primary, notes)
         VALUES (?1, ?2, ?3, ?4, ?5)
         ON CONFLICT (encounter_id, diagnosis_id) DO NOTHING",
        params![
            link.encounter_id,
            link.diagnosis_id,
            link.diagnosis_rank,
            link.is_primary as i32,
            link.notes,
        ],
    )?;
    Ok(changed > 0)
}

pub fn get_encounter_diagnoses(
    conn: &Connection,
    encounter_id: &str,
) -> Result<Vec<EncounterDiagnosis>, DatabaseError> {
    let mut stmt = conn.prepare(
        "SELECT encounter_id, diagnosis_id, diagnosis_rank, is_primary, notes
         FROM encounter_diagnoses WHERE encounter_id = ?1 ORDER BY diagnosis_rank",
    )?;
    let links = stmt
        .query_map(params![encounter_id], |row| {
            Ok(EncounterDiagnosis {
                encounter_id: row.get(0)?,
                diagnosis_id: row.get(1)?,
                diagnosis_rank: row.get(2)?,
                is_primary: row.get::<_, i32>(3)? != 0,
                notes: row.get(4)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(links)
}
