//! Surrogate keys for the warehouse dimensions.
//!
//! Each dimension table is its own append-only key map: the `<x>_key`
//! column is an AUTOINCREMENT surrogate handed out the first time a natural
//! key is seen, and the natural-key column(s) next to it are UNIQUE. Rows are
//! only ever inserted with ON CONFLICT DO NOTHING, so a key once assigned
//! never changes and is never reused.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::LazyLock;

use regex::Regex;
use rusqlite::{params_from_iter, Connection, OptionalExtension};
use serde::Serialize;

use crate::db::DatabaseError;

static NON_DIGITS: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\D").unwrap());

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Dimension {
    Facility,
    Patient,
    Procedure,
    Diagnosis,
}

const FACILITY_SOURCE: &str = "
    INSERT INTO dim_facility (facility_id, facility_name, facility_type, location)
    SELECT f.facility_id, f.facility_name, f.facility_type, f.address_city
    FROM facilities f
    WHERE {filter}
    ORDER BY f.facility_id
    ON CONFLICT (facility_id) DO NOTHING";

// Age is taken at the first encounter; patients without one are aged today.
const PATIENT_SOURCE: &str = "
    INSERT INTO dim_patient (patient_id, age, sex, age_group, location)
    SELECT s.patient_id, s.age, s.sex,
        CASE
            WHEN s.age < 18 THEN 'Pediatric'
            WHEN s.age <= 35 THEN 'Young Adult'
            WHEN s.age <= 55 THEN 'Middle Age'
            WHEN s.age <= 75 THEN 'Senior'
            ELSE 'Elderly'
        END,
        s.location
    FROM (
        SELECT p.patient_id, p.gender AS sex, p.address_city AS location,
            CAST(strftime('%Y', v.at) AS INTEGER) - CAST(strftime('%Y', p.date_of_birth) AS INTEGER)
                - (strftime('%m-%d', v.at) < strftime('%m-%d', p.date_of_birth)) AS age
        FROM patients p
        JOIN (
            SELECT p2.patient_id, COALESCE(MIN(e.encounter_date), date('now')) AS at
            FROM patients p2
            LEFT JOIN encounters e ON e.patient_id = p2.patient_id
            GROUP BY p2.patient_id
        ) v ON v.patient_id = p.patient_id
        WHERE {filter}
    ) s
    WHERE true
    ORDER BY s.patient_id
    ON CONFLICT (patient_id) DO NOTHING";

const PROCEDURE_SOURCE: &str = "
    INSERT INTO dim_procedure (encounter_id, procedure_code, procedure_name, modality, projection, body_part)
    SELECT p.encounter_id, p.procedure_code, p.procedure_name,
        p.modality, p.view_position, p.body_part
    FROM procedures p
    WHERE {filter}
    ORDER BY p.procedure_id
    ON CONFLICT (encounter_id, procedure_code) DO NOTHING";

const DIAGNOSIS_SOURCE: &str = "
    INSERT INTO dim_diagnosis (diagnosis_id, diagnosis_code, diagnosis_name, category, severity)
    SELECT d.diagnosis_id, d.diagnosis_code, d.diagnosis_name, d.diagnosis_category, d.severity
    FROM diagnoses d
    WHERE {filter}
    ORDER BY d.diagnosis_id
    ON CONFLICT (diagnosis_id) DO NOTHING";

impl Dimension {
    pub fn table(&self) -> &'static str {
        match self {
            Self::Facility => "dim_facility",
            Self::Patient => "dim_patient",
            Self::Procedure => "dim_procedure",
            Self::Diagnosis => "dim_diagnosis",
        }
    }

    pub fn key_column(&self) -> &'static str {
        match self {
            Self::Facility => "facility_key",
            Self::Patient => "patient_key",
            Self::Procedure => "procedure_key",
            Self::Diagnosis => "diagnosis_key",
        }
    }

    /// Columns that together hold the natural key.
    pub fn natural_columns(&self) -> &'static [&'static str] {
        match self {
            Self::Facility => &["facility_id"],
            Self::Patient => &["patient_id"],
            Self::Procedure => &["encounter_id", "procedure_code"],
            Self::Diagnosis => &["diagnosis_id"],
        }
    }

    /// Operational table the dimension is built from.
    pub fn source_table(&self) -> &'static str {
        match self {
            Self::Facility => "facilities",
            Self::Patient => "patients",
            Self::Procedure => "procedures",
            Self::Diagnosis => "diagnoses",
        }
    }

    /// Natural key columns on the operational source row, in
    /// [`Dimension::natural_columns`] order.
    fn source_key_columns(&self) -> &'static [&'static str] {
        match self {
            Self::Facility => &["f.facility_id"],
            Self::Patient => &["p.patient_id"],
            Self::Procedure => &["p.encounter_id", "p.procedure_code"],
            Self::Diagnosis => &["d.diagnosis_id"],
        }
    }

    fn insert_sql(&self, filter: &str) -> String {
        let template = match self {
            Self::Facility => FACILITY_SOURCE,
            Self::Patient => PATIENT_SOURCE,
            Self::Procedure => PROCEDURE_SOURCE,
            Self::Diagnosis => DIAGNOSIS_SOURCE,
        };
        template.replace("{filter}", filter)
    }
}

impl fmt::Display for Dimension {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.table())
    }
}

/// `a = ?1 AND b = ?2 ...` over `columns`.
fn match_clause(columns: &[&str]) -> String {
    columns
        .iter()
        .enumerate()
        .map(|(i, column)| format!("{column} = ?{}", i + 1))
        .collect::<Vec<_>>()
        .join(" AND ")
}

/// Natural key of one dimension row. A procedure is identified by its
/// operational (encounter, code) pair, kept as two separate values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DimensionKey<'a> {
    Facility(&'a str),
    Patient(&'a str),
    Procedure {
        encounter_id: &'a str,
        procedure_code: &'a str,
    },
    Diagnosis(&'a str),
}

impl<'a> DimensionKey<'a> {
    pub fn dimension(&self) -> Dimension {
        match self {
            Self::Facility(_) => Dimension::Facility,
            Self::Patient(_) => Dimension::Patient,
            Self::Procedure { .. } => Dimension::Procedure,
            Self::Diagnosis(_) => Dimension::Diagnosis,
        }
    }

    fn values(&self) -> Vec<&'a str> {
        match *self {
            Self::Facility(id) | Self::Patient(id) | Self::Diagnosis(id) => vec![id],
            Self::Procedure {
                encounter_id,
                procedure_code,
            } => vec![encounter_id, procedure_code],
        }
    }
}

impl fmt::Display for DimensionKey<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Procedure {
                encounter_id,
                procedure_code,
            } => write!(f, "({encounter_id}, {procedure_code})"),
            Self::Facility(id) | Self::Patient(id) | Self::Diagnosis(id) => f.write_str(id),
        }
    }
}

pub struct SurrogateKeyMapper<'c> {
    conn: &'c Connection,
}

impl<'c> SurrogateKeyMapper<'c> {
    pub fn new(conn: &'c Connection) -> Self {
        Self { conn }
    }

    /// Assign keys to every operational row not yet in the dimension.
    /// Returns the number of keys handed out.
    pub fn assign(&self, dimension: Dimension) -> Result<usize, DatabaseError> {
        let added = self.conn.execute(&dimension.insert_sql("true"), [])?;
        tracing::debug!(dimension = %dimension, added, "Surrogate keys assigned");
        Ok(added)
    }

    pub fn key_for(&self, natural_key: DimensionKey<'_>) -> Result<Option<i64>, DatabaseError> {
        let dimension = natural_key.dimension();
        let sql = format!(
            "SELECT {} FROM {} WHERE {}",
            dimension.key_column(),
            dimension.table(),
            match_clause(dimension.natural_columns())
        );
        let key = self
            .conn
            .query_row(&sql, params_from_iter(natural_key.values()), |row| row.get(0))
            .optional()?;
        Ok(key)
    }

    /// Existing key, or a new one built from the operational row with that
    /// natural key. Fails with `NotFound` when no such row exists.
    pub fn get_or_assign(&self, natural_key: DimensionKey<'_>) -> Result<i64, DatabaseError> {
        if let Some(key) = self.key_for(natural_key)? {
            return Ok(key);
        }

        let dimension = natural_key.dimension();
        let filter = match_clause(dimension.source_key_columns());
        self.conn.execute(
            &dimension.insert_sql(&filter),
            params_from_iter(natural_key.values()),
        )?;

        self.key_for(natural_key)?
            .ok_or_else(|| DatabaseError::NotFound {
                entity_type: dimension.source_table().into(),
                id: natural_key.to_string(),
            })
    }
}

/// Integer formed by the digits of `natural_key` (`PAT0010001` → 10001).
///
/// Audit helper only: distinct keys can share a value, so surrogate keys
/// are never derived this way. `None` when there are no digits or the
/// value does not fit an i64.
pub fn derived_numeric_key(natural_key: &str) -> Option<i64> {
    let digits = NON_DIGITS.replace_all(natural_key, "");
    if digits.is_empty() {
        return None;
    }
    digits.parse().ok()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DerivationCollision {
    pub derived: i64,
    pub natural_keys: Vec<String>,
}

/// Groups of distinct natural keys in `dimension` that share a derived
/// numeric key. Composite keys are shown with their parts joined by `:`.
pub fn find_derivation_collisions(
    conn: &Connection,
    dimension: Dimension,
) -> Result<Vec<DerivationCollision>, DatabaseError> {
    let columns = dimension.natural_columns();
    let sql = format!(
        "SELECT {} FROM {} ORDER BY {}",
        columns.join(", "),
        dimension.table(),
        columns.join(", ")
    );
    let mut stmt = conn.prepare(&sql)?;
    let keys = stmt
        .query_map([], |row| {
            (0..columns.len())
                .map(|i| row.get::<_, String>(i))
                .collect::<Result<Vec<_>, _>>()
                .map(|parts| parts.join(":"))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    let mut groups: BTreeMap<i64, Vec<String>> = BTreeMap::new();
    for key in keys {
        if let Some(derived) = derived_numeric_key(&key) {
            groups.entry(derived).or_default().push(key);
        }
    }

    Ok(groups
        .into_iter()
        .filter(|(_, keys)| keys.len() > 1)
        .map(|(derived, natural_keys)| DerivationCollision {
            derived,
            natural_keys,
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rusqlite::params;

    use crate::db::sqlite::{count_rows, open_memory_database};

    fn seed_patients(conn: &Connection) {
        conn.execute_batch(
            "INSERT INTO facilities (facility_id, facility_name, facility_type)
                 VALUES ('FAC000001', 'General', 'Hospital');
             INSERT INTO patients (patient_id, date_of_birth, gender, address_city) VALUES
                 ('PAT0010001', '1980-06-15', 'F', 'Kigali'),
                 ('NIH_PAT_10001', '1967-01-01', 'M', 'Kigali'),
                 ('NIH_PAT_7', '2015-03-01', 'Other', NULL);
             INSERT INTO encounters (encounter_id, patient_id, facility_id, encounter_date,
                 encounter_datetime, encounter_type) VALUES
                 ('E1', 'PAT0010001', 'FAC000001', '2024-06-14', '2024-06-14 09:00:00', 'Outpatient'),
                 ('E2', 'PAT0010001', 'FAC000001', '2025-01-01', '2025-01-01 09:00:00', 'Outpatient'),
                 ('E3', 'NIH_PAT_10001', 'FAC000001', '2024-01-01', '2024-01-01 10:00:00', 'Emergency'),
                 ('E4', 'NIH_PAT_7', 'FAC000001', '2024-01-01', '2024-01-01 11:00:00', 'Inpatient');",
        )
        .unwrap();
    }

    #[test]
    fn assign_is_append_only() {
        let conn = open_memory_database().unwrap();
        seed_patients(&conn);
        let mapper = SurrogateKeyMapper::new(&conn);

        assert_eq!(mapper.assign(Dimension::Patient).unwrap(), 3);
        let ids = ["PAT0010001", "NIH_PAT_10001", "NIH_PAT_7"];
        let key = |id: &str| mapper.key_for(DimensionKey::Patient(id)).unwrap().unwrap();
        let before: Vec<i64> = ids.iter().map(|id| key(*id)).collect();

        conn.execute(
            "INSERT INTO patients (patient_id, date_of_birth, gender) VALUES ('PAT0000002', '1990-01-01', 'M')",
            [],
        )
        .unwrap();
        assert_eq!(mapper.assign(Dimension::Patient).unwrap(), 1);
        assert_eq!(mapper.assign(Dimension::Patient).unwrap(), 0);

        let after: Vec<i64> = ids.iter().map(|id| key(*id)).collect();
        assert_eq!(after, before);
        assert!(key("PAT0000002") > *before.iter().max().unwrap());
    }

    #[test]
    fn patient_age_is_taken_at_first_encounter() {
        let conn = open_memory_database().unwrap();
        seed_patients(&conn);
        SurrogateKeyMapper::new(&conn).assign(Dimension::Patient).unwrap();

        let (age, group): (i64, String) = conn
            .query_row(
                "SELECT age, age_group FROM dim_patient WHERE patient_id = 'PAT0010001'",
                [],
                |r| Ok((r.get(0)?, r.get(1)?)),
            )
            .unwrap();
        // 2024-06-14 is the day before the 44th birthday
        assert_eq!(age, 43);
        assert_eq!(group, "Middle Age");

        let group: String = conn
            .query_row(
                "SELECT age_group FROM dim_patient WHERE patient_id = 'NIH_PAT_7'",
                [],
                |r| r.get(0),
            )
            .unwrap();
        assert_eq!(group, "Pediatric");
    }

    #[test]
    fn age_bands_match_age_group_for_age() {
        use crate::models::enums::AgeGroup;

        let conn = open_memory_database().unwrap();
        conn.execute(
            "INSERT INTO facilities (facility_id, facility_name, facility_type) VALUES ('FAC000001', 'General', 'Hospital')",
            [],
        )
        .unwrap();
        let ages = [0_i64, 17, 18, 35, 36, 55, 56, 75, 76, 90];
        for age in ages {
            let id = format!("PAT{age:07}");
            conn.execute(
                "INSERT INTO patients (patient_id, date_of_birth, gender) VALUES (?1, ?2, 'F')",
                params![id, format!("{}-01-01", 2024 - age)],
            )
            .unwrap();
            conn.execute(
                "INSERT INTO encounters (encounter_id, patient_id, facility_id, encounter_date,
                     encounter_datetime, encounter_type)
                 VALUES (?1, ?2, 'FAC000001', '2024-01-01', '2024-01-01 09:00:00', 'Outpatient')",
                params![format!("{id}_ENC"), id],
            )
            .unwrap();
        }
        SurrogateKeyMapper::new(&conn).assign(Dimension::Patient).unwrap();

        for age in ages {
            let (stored_age, group): (i64, String) = conn
                .query_row(
                    "SELECT age, age_group FROM dim_patient WHERE patient_id = ?1",
                    params![format!("PAT{age:07}")],
                    |r| Ok((r.get(0)?, r.get(1)?)),
                )
                .unwrap();
            assert_eq!(stored_age, age);
            assert_eq!(group, AgeGroup::for_age(age).as_str(), "age {age}");
        }
    }

    #[test]
    fn digit_collision_gets_distinct_keys_and_is_reported() {
        let conn = open_memory_database().unwrap();
        seed_patients(&conn);
        let mapper = SurrogateKeyMapper::new(&conn);
        mapper.assign(Dimension::Patient).unwrap();

        let synthetic = mapper.key_for(DimensionKey::Patient("PAT0010001")).unwrap().unwrap();
        let nih = mapper.key_for(DimensionKey::Patient("NIH_PAT_10001")).unwrap().unwrap();
        assert_ne!(synthetic, nih);

        let collisions = find_derivation_collisions(&conn, Dimension::Patient).unwrap();
        assert_eq!(
            collisions,
            vec![DerivationCollision {
                derived: 10001,
                natural_keys: vec!["NIH_PAT_10001".into(), "PAT0010001".into()],
            }]
        );
    }

    #[test]
    fn get_or_assign_single_key() {
        let conn = open_memory_database().unwrap();
        seed_patients(&conn);
        let mapper = SurrogateKeyMapper::new(&conn);

        let key = mapper.get_or_assign(DimensionKey::Patient("NIH_PAT_7")).unwrap();
        assert_eq!(count_rows(&conn, "dim_patient").unwrap(), 1);
        assert_eq!(mapper.get_or_assign(DimensionKey::Patient("NIH_PAT_7")).unwrap(), key);

        let err = mapper.get_or_assign(DimensionKey::Patient("PAT9999999")).unwrap_err();
        assert!(matches!(err, DatabaseError::NotFound { .. }));
    }

    #[test]
    fn procedure_natural_key_is_the_operational_pair() {
        let conn = open_memory_database().unwrap();
        seed_patients(&conn);
        conn.execute_batch(
            "INSERT INTO procedures (encounter_id, procedure_code, procedure_name, modality, procedure_datetime)
                 VALUES ('E1', 'CXR', 'X-Ray Chest', 'X-Ray', '2024-06-14 09:00:00'),
                        ('E2', 'CXR', 'X-Ray Chest', 'X-Ray', '2025-01-01 09:00:00');",
        )
        .unwrap();
        let mapper = SurrogateKeyMapper::new(&conn);
        assert_eq!(mapper.assign(Dimension::Procedure).unwrap(), 2);

        let e2 = DimensionKey::Procedure {
            encounter_id: "E2",
            procedure_code: "CXR",
        };
        assert!(mapper.key_for(e2).unwrap().is_some());
    }

    #[test]
    fn separator_in_ids_does_not_merge_procedures() {
        let conn = open_memory_database().unwrap();
        seed_patients(&conn);
        conn.execute_batch(
            "INSERT INTO encounters (encounter_id, patient_id, facility_id, encounter_date,
                 encounter_datetime, encounter_type) VALUES
                 ('E:1', 'PAT0010001', 'FAC000001', '2024-06-14', '2024-06-14 09:00:00', 'Outpatient'),
                 ('E', 'PAT0010001', 'FAC000001', '2024-06-14', '2024-06-14 10:00:00', 'Outpatient');
             INSERT INTO procedures (encounter_id, procedure_code, procedure_name, modality, procedure_datetime)
                 VALUES ('E:1', 'X', 'X-Ray Chest', 'X-Ray', '2024-06-14 09:00:00'),
                        ('E', '1:X', 'CT Chest', 'CT', '2024-06-14 10:00:00');",
        )
        .unwrap();
        let mapper = SurrogateKeyMapper::new(&conn);
        assert_eq!(mapper.assign(Dimension::Procedure).unwrap(), 2);

        let xray = mapper
            .key_for(DimensionKey::Procedure { encounter_id: "E:1", procedure_code: "X" })
            .unwrap()
            .unwrap();
        let ct = mapper
            .get_or_assign(DimensionKey::Procedure { encounter_id: "E", procedure_code: "1:X" })
            .unwrap();
        assert_ne!(xray, ct);

        let modality: String = conn
            .query_row("SELECT modality FROM dim_procedure WHERE procedure_key = ?1", params![ct], |r| r.get(0))
            .unwrap();
        assert_eq!(modality, "CT");
    }

    #[test]
    fn derived_numeric_key_strips_non_digits() {
        assert_eq!(derived_numeric_key("PAT0010001"), Some(10001));
        assert_eq!(derived_numeric_key("DIAG029"), Some(29));
        assert_eq!(derived_numeric_key("NIH_PAT_ABC"), None);
        assert_eq!(derived_numeric_key("NIH_00000001_000"), Some(1000));
        assert_eq!(derived_numeric_key("12345678901234567890123"), None);
    }
}
