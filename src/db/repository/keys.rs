use std::collections::HashSet;

use rusqlite::{params, Connection};
use serde::Serialize;

use crate::db::DatabaseError;

/// Operational entities that carry a natural key the loaders deduplicate on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyedEntity {
    Facility,
    Patient,
    Encounter,
    /// Keyed on `procedure_code`. Only unique on its own when scoped to a
    /// source whose codes are globally unique (the NIH codes are); the store
    /// enforces the `(encounter_id, procedure_code)` pair regardless.
    Procedure,
    Diagnosis,
    Report,
}

impl KeyedEntity {
    pub fn table(&self) -> &'static str {
        match self {
            Self::Facility => "facilities",
            Self::Patient => "patients",
            Self::Encounter => "encounters",
            Self::Procedure => "procedures",
            Self::Diagnosis => "diagnoses",
            Self::Report => "reports",
        }
    }

    pub fn key_column(&self) -> &'static str {
        match self {
            Self::Facility => "facility_id",
            Self::Patient => "patient_id",
            Self::Encounter => "encounter_id",
            Self::Procedure => "procedure_code",
            Self::Diagnosis => "diagnosis_id",
            Self::Report => "report_id",
        }
    }
}

impl std::fmt::Display for KeyedEntity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.table())
    }
}

/// All natural keys currently stored for `entity`, optionally restricted to
/// keys starting with `prefix`. One round trip regardless of table size.
pub fn fetch_natural_keys(
    conn: &Connection,
    entity: KeyedEntity,
    prefix: Option<&str>,
) -> Result<HashSet<String>, DatabaseError> {
    let column = entity.key_column();
    let table = entity.table();

    let keys = match prefix {
        Some(prefix) => {
            // substr comparison instead of LIKE: prefixes contain '_' which LIKE treats as a wildcard
            let mut stmt = conn.prepare(&format!(
                "SELECT DISTINCT {column} FROM {table} WHERE substr({column}, 1, length(?1)) = ?1"
            ))?;
            let keys = stmt
                .query_map(params![prefix], |row| row.get::<_, String>(0))?
                .collect::<Result<HashSet<_>, _>>()?;
            keys
        }
        None => {
            let mut stmt = conn.prepare(&format!("SELECT DISTINCT {column} FROM {table}"))?;
            let keys = stmt
                .query_map([], |row| row.get::<_, String>(0))?
                .collect::<Result<HashSet<_>, _>>()?;
            keys
        }
    };

    Ok(keys)
}
