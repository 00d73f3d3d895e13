//! Repository layer: entity-scoped database operations.
//!
//! Every insert here is "insert, skip on natural-key conflict": the boolean
//! result says whether a row was actually written. Any other constraint
//! failure (CHECK, NOT NULL, FOREIGN KEY) comes back as an error.

mod diagnosis;
mod encounter;
mod facility;
mod keys;
mod patient;
mod procedure;
mod report;

/// Storage format for calendar dates.
pub const DATE_FMT: &str = "%Y-%m-%d";
/// Storage format for timestamps (second precision).
pub const DATETIME_FMT: &str = "%Y-%m-%d %H:%M:%S";

pub use diagnosis::*;
pub use encounter::*;
pub use facility::*;
pub use keys::*;
pub use patient::*;
pub use procedure::*;
pub use report::*;

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{NaiveDate, NaiveDateTime};
    use crate::db::sqlite::open_memory_database;
    use crate::db::DatabaseError;
    use crate::models::*;
    use crate::models::enums::*;
    use rusqlite::{params, Connection};

    fn test_db() -> Connection {
        open_memory_database().unwrap()
    }

    fn ts(s: &str) -> NaiveDateTime {
        NaiveDateTime::parse_from_str(s, DATETIME_FMT).unwrap()
    }

    fn make_facility(conn: &Connection, id: &str, facility_type: FacilityType) {
        insert_facility(conn, &Facility {
            facility_id: id.into(),
            facility_name: format!("{id} General"),
            facility_type,
            address_city: Some("Kigali".into()),
            address_state: Some("Kigali Province".into()),
            total_beds: Some(120),
            has_emergency: true,
        })
        .unwrap();
    }

    fn make_patient(conn: &Connection, id: &str) -> Patient {
        let patient = Patient {
            patient_id: id.into(),
            date_of_birth: NaiveDate::from_ymd_opt(1980, 3, 14).unwrap(),
            gender: Gender::Female,
            primary_language: Some("Kinyarwanda".into()),
            address_city: Some("Kigali".into()),
            insurance_id: Some("INS100200".into()),
            external_ref: None,
            is_active: true,
        };
        insert_patient(conn, &patient).unwrap();
        patient
    }

    fn make_encounter(conn: &Connection, id: &str, patient_id: &str, facility_id: &str) -> Encounter {
        let enc = Encounter {
            encounter_id: id.into(),
            patient_id: patient_id.into(),
            facility_id: facility_id.into(),
            encounter_date: NaiveDate::from_ymd_opt(2024, 5, 2).unwrap(),
            encounter_datetime: ts("2024-05-02 09:30:00"),
            encounter_type: EncounterType::Outpatient,
            admission_source: Some("Referral".into()),
            visit_reason: Some("Chest pain".into()),
        };
        insert_encounter(conn, &enc).unwrap();
        enc
    }

    fn make_catalog(conn: &Connection) {
        for (id, code, name) in [
            ("DIAG001", "J18.9", "Pneumonia"),
            ("DIAG029", "R91.8", "Abnormal Lung Finding"),
        ] {
            insert_diagnosis(conn, &Diagnosis {
                diagnosis_id: id.into(),
                diagnosis_code: code.into(),
                diagnosis_name: name.into(),
                diagnosis_category: Some("Respiratory".into()),
                severity: Severity::Moderate,
            })
            .unwrap();
        }
    }

    fn chest_xray(encounter_id: &str, code: &str) -> Procedure {
        Procedure {
            procedure_id: None,
            encounter_id: encounter_id.into(),
            procedure_code: code.into(),
            procedure_name: "X-Ray Chest".into(),
            body_part: Some("Chest".into()),
            laterality: Laterality::NotApplicable,
            view_position: Some("PA".into()),
            modality: Modality::XRay,
            procedure_datetime: ts("2024-05-02 09:45:00"),
        }
    }

    #[test]
    fn patient_round_trip() {
        let conn = test_db();
        let patient = make_patient(&conn, "PAT0000001");
        let loaded = get_patient(&conn, "PAT0000001").unwrap().unwrap();
        assert_eq!(loaded.patient_id, patient.patient_id);
        assert_eq!(loaded.date_of_birth, patient.date_of_birth);
        assert_eq!(loaded.gender, Gender::Female);
        assert!(loaded.is_active);
        assert!(get_patient(&conn, "PAT9999999").unwrap().is_none());
    }

    #[test]
    fn duplicate_patient_is_skipped_not_errored() {
        let conn = test_db();
        let patient = make_patient(&conn, "PAT0000001");
        assert!(!insert_patient(&conn, &patient).unwrap());
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM patients", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 1);
    }

    #[test]
    fn soft_delete_keeps_row() {
        let conn = test_db();
        make_patient(&conn, "PAT0000001");
        deactivate_patient(&conn, "PAT0000001").unwrap();
        let loaded = get_patient(&conn, "PAT0000001").unwrap().unwrap();
        assert!(!loaded.is_active);
        assert!(matches!(
            deactivate_patient(&conn, "PAT0000404"),
            Err(DatabaseError::NotFound { .. })
        ));
    }

    #[test]
    fn encounter_requires_existing_patient() {
        let conn = test_db();
        make_facility(&conn, "FAC000001", FacilityType::Hospital);
        let enc = Encounter {
            encounter_id: "ENC0000001".into(),
            patient_id: "PAT_MISSING".into(),
            facility_id: "FAC000001".into(),
            encounter_date: NaiveDate::from_ymd_opt(2024, 5, 2).unwrap(),
            encounter_datetime: ts("2024-05-02 09:30:00"),
            encounter_type: EncounterType::Emergency,
            admission_source: None,
            visit_reason: None,
        };
        let err = insert_encounter(&conn, &enc).unwrap_err();
        assert!(err.is_constraint());
    }

    #[test]
    fn encounter_round_trip_and_date_range() {
        let conn = test_db();
        assert!(get_encounter_date_range(&conn).unwrap().is_none());
        make_facility(&conn, "FAC000001", FacilityType::Hospital);
        make_patient(&conn, "PAT0000001");
        make_encounter(&conn, "ENC0000001", "PAT0000001", "FAC000001");

        let enc = get_encounter(&conn, "ENC0000001").unwrap().unwrap();
        assert_eq!(enc.encounter_type, EncounterType::Outpatient);
        assert_eq!(enc.encounter_datetime, ts("2024-05-02 09:30:00"));

        let (min, max) = get_encounter_date_range(&conn).unwrap().unwrap();
        assert_eq!(min, max);
        assert_eq!(min, NaiveDate::from_ymd_opt(2024, 5, 2).unwrap());
    }

    #[test]
    fn procedure_pair_is_unique() {
        let conn = test_db();
        make_facility(&conn, "FAC000001", FacilityType::Hospital);
        make_patient(&conn, "PAT0000001");
        make_encounter(&conn, "ENC0000001", "PAT0000001", "FAC000001");
        make_encounter(&conn, "ENC0000002", "PAT0000001", "FAC000001");

        assert!(insert_procedure(&conn, &chest_xray("ENC0000001", "71046")).unwrap());
        assert!(!insert_procedure(&conn, &chest_xray("ENC0000001", "71046")).unwrap());
        // Same code on another encounter is a different procedure
        assert!(insert_procedure(&conn, &chest_xray("ENC0000002", "71046")).unwrap());

        let procs = get_procedures_for_encounter(&conn, "ENC0000001").unwrap();
        assert_eq!(procs.len(), 1);
        assert_eq!(procs[0].modality, Modality::XRay);
        assert_eq!(procs[0].laterality, Laterality::NotApplicable);
        assert!(procs[0].procedure_id.is_some());
    }

    #[test]
    fn invalid_modality_is_a_constraint_error_not_a_skip() {
        let conn = test_db();
        make_facility(&conn, "FAC000001", FacilityType::Hospital);
        make_patient(&conn, "PAT0000001");
        make_encounter(&conn, "ENC0000001", "PAT0000001", "FAC000001");

        let err = conn
            .execute(
                "INSERT INTO procedures (encounter_id, procedure_code, procedure_name, modality, procedure_datetime)
                 VALUES ('ENC0000001', 'BAD', 'Bad', 'PET', '2024-05-02 10:00:00')
                 ON CONFLICT (encounter_id, procedure_code) DO NOTHING",
                [],
            )
            .map_err(DatabaseError::from)
            .unwrap_err();
        assert!(err.is_constraint());
    }

    #[test]
    fn procedure_counts_split_by_source() {
        let conn = test_db();
        make_facility(&conn, "FAC000001", FacilityType::Hospital);
        make_patient(&conn, "PAT0000001");
        make_encounter(&conn, "ENC0000001", "PAT0000001", "FAC000001");
        insert_procedure(&conn, &chest_xray("ENC0000001", "NIH_00000001_000")).unwrap();
        insert_procedure(&conn, &chest_xray("ENC0000001", "NIH_00000002_000")).unwrap();
        insert_procedure(&conn, &chest_xray("ENC0000001", "71046")).unwrap();
        // Underscore must not act as a wildcard
        insert_procedure(&conn, &chest_xray("ENC0000001", "NIHX0001")).unwrap();

        assert_eq!(count_procedures_by_prefix(&conn, "NIH_").unwrap(), (2, 2));
        assert_eq!(count_procedures_by_prefix(&conn, "7").unwrap(), (1, 3));
    }

    #[test]
    fn only_one_primary_diagnosis_per_encounter() {
        let conn = test_db();
        make_facility(&conn, "FAC000001", FacilityType::Hospital);
        make_patient(&conn, "PAT0000001");
        make_encounter(&conn, "ENC0000001", "PAT0000001", "FAC000001");
        make_catalog(&conn);

        let link = |diag: &str, rank: u32, primary: bool| EncounterDiagnosis {
            encounter_id: "ENC0000001".into(),
            diagnosis_id: diag.into(),
            diagnosis_rank: rank,
            is_primary: primary,
            notes: None,
        };
        assert!(insert_encounter_diagnosis(&conn, &link("DIAG001", 1, true)).unwrap());
        let err = insert_encounter_diagnosis(&conn, &link("DIAG029", 2, true)).unwrap_err();
        assert!(err.is_constraint());
        assert!(insert_encounter_diagnosis(&conn, &link("DIAG029", 2, false)).unwrap());

        let links = get_encounter_diagnoses(&conn, "ENC0000001").unwrap();
        assert_eq!(links.iter().filter(|l| l.is_primary).count(), 1);
        assert_eq!(links[0].diagnosis_id, "DIAG001");
    }

    #[test]
    fn diagnosis_code_map_resolves_codes() {
        let conn = test_db();
        make_catalog(&conn);
        let map = get_diagnosis_code_map(&conn).unwrap();
        assert_eq!(map.get("J18.9").map(String::as_str), Some("DIAG001"));
        assert_eq!(map.len(), 2);
    }

    #[test]
    fn report_round_trip() {
        let conn = test_db();
        make_facility(&conn, "FAC000001", FacilityType::Hospital);
        make_patient(&conn, "PAT0000001");
        make_encounter(&conn, "ENC0000001", "PAT0000001", "FAC000001");
        let report = Report {
            report_id: "ENC0000001_RPT".into(),
            encounter_id: "ENC0000001".into(),
            report_type: ReportType::Final,
            report_status: ReportStatus::Signed,
            report_text: "No acute cardiopulmonary process.".into(),
            findings: Some("Clear lungs.".into()),
            impression: Some("Normal chest.".into()),
            recommendations: None,
            dictated_datetime: ts("2024-05-02 10:00:00"),
            signed_datetime: Some(ts("2024-05-02 12:00:00")),
        };
        assert!(insert_report(&conn, &report).unwrap());
        assert!(!insert_report(&conn, &report).unwrap());

        let reports = get_reports_for_encounter(&conn, "ENC0000001").unwrap();
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].report_status, ReportStatus::Signed);
        assert_eq!(reports[0].signed_datetime, Some(ts("2024-05-02 12:00:00")));
    }

    #[test]
    fn deleting_encounter_cascades() {
        let conn = test_db();
        make_facility(&conn, "FAC000001", FacilityType::Hospital);
        make_patient(&conn, "PAT0000001");
        make_encounter(&conn, "ENC0000001", "PAT0000001", "FAC000001");
        insert_procedure(&conn, &chest_xray("ENC0000001", "71046")).unwrap();

        conn.execute("DELETE FROM encounters WHERE encounter_id = ?1", params!["ENC0000001"])
            .unwrap();
        assert!(get_procedures_for_encounter(&conn, "ENC0000001").unwrap().is_empty());
    }

    #[test]
    fn hospital_ids_are_sorted_and_filtered() {
        let conn = test_db();
        make_facility(&conn, "FAC000003", FacilityType::Hospital);
        make_facility(&conn, "FAC000001", FacilityType::Hospital);
        make_facility(&conn, "FAC000002", FacilityType::Clinic);
        let ids = get_facility_ids_by_type(&conn, FacilityType::Hospital).unwrap();
        assert_eq!(ids, vec!["FAC000001".to_string(), "FAC000003".to_string()]);
        let clinic = get_facility(&conn, "FAC000002").unwrap().unwrap();
        assert_eq!(clinic.facility_type, FacilityType::Clinic);
    }

    #[test]
    fn natural_keys_scoped_by_prefix() {
        let conn = test_db();
        make_facility(&conn, "FAC000001", FacilityType::Hospital);
        make_patient(&conn, "PAT0000001");
        make_patient(&conn, "NIH_PAT_42");
        make_patient(&conn, "NIHXPAT_43");

        let all = fetch_natural_keys(&conn, KeyedEntity::Patient, None).unwrap();
        assert_eq!(all.len(), 3);

        let nih = fetch_natural_keys(&conn, KeyedEntity::Patient, Some("NIH_")).unwrap();
        assert_eq!(nih.len(), 1);
        assert!(nih.contains("NIH_PAT_42"));
    }
}
