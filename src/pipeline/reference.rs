//! Reference data the imaging ingest depends on: the diagnosis master
//! catalog and the hospital registry.

use std::collections::HashMap;

use rusqlite::Connection;
use serde::Serialize;

use crate::db::repository::{
    get_diagnosis_code_map, get_facility_ids_by_type, insert_diagnosis, insert_facility,
};
use crate::db::DatabaseError;
use crate::models::enums::{FacilityType, Severity};
use crate::models::{Diagnosis, Facility};

use super::error::PipelineError;
use super::normalize::{stable_index, NIH_TO_ICD10};

/// (id, ICD-10 code, name, category, severity)
const DIAGNOSIS_CATALOG: &[(&str, &str, &str, &str, Severity)] = &[
    ("DIAG001", "J18.9", "Pneumonia", "Respiratory", Severity::Moderate),
    ("DIAG005", "J81.0", "Acute Pulmonary Edema", "Respiratory", Severity::Severe),
    ("DIAG006", "J93.0", "Spontaneous Tension Pneumothorax", "Respiratory", Severity::Severe),
    ("DIAG007", "J98.4", "Other Disorders of Lung", "Respiratory", Severity::Mild),
    ("DIAG010", "J84.9", "Interstitial Lung Disease", "Respiratory", Severity::Severe),
    ("DIAG028", "D49.2", "Neoplasm of Uncertain Behavior", "Oncology", Severity::Moderate),
    ("DIAG029", "R91.8", "Abnormal Lung Finding", "Radiology", Severity::Mild),
    ("DIAG035", "J43.9", "Emphysema", "Respiratory", Severity::Severe),
    ("DIAG037", "J94.8", "Pleural Effusion", "Respiratory", Severity::Moderate),
    ("DIAG050", "J18.1", "Lobar Pneumonia", "Respiratory", Severity::Moderate),
    ("DIAG051", "J98.11", "Atelectasis", "Respiratory", Severity::Moderate),
    ("DIAG052", "I51.7", "Cardiomegaly", "Cardiovascular", Severity::Moderate),
    ("DIAG053", "K44.9", "Diaphragmatic Hernia", "Gastrointestinal", Severity::Mild),
];

/// (id, name, type, city, beds, emergency)
const FACILITY_REGISTRY: &[(&str, &str, FacilityType, &str, Option<i64>, bool)] = &[
    ("FAC000001", "King Faisal Hospital", FacilityType::Hospital, "Kigali", Some(160), true),
    ("FAC000002", "CHUK University Teaching Hospital", FacilityType::Hospital, "Kigali", Some(519), true),
    ("FAC000003", "Rwanda Military Hospital", FacilityType::Hospital, "Kigali", Some(400), true),
    ("FAC000004", "CHUB University Teaching Hospital", FacilityType::Hospital, "Huye", Some(480), true),
    ("FAC000005", "Ruhengeri Referral Hospital", FacilityType::Hospital, "Musanze", Some(300), true),
    ("FAC000006", "Kacyiru Health Clinic", FacilityType::Clinic, "Kigali", None, false),
    ("FAC000007", "Kigali Diagnostic Imaging Center", FacilityType::ImagingCenter, "Kigali", None, false),
];

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct SeedReport {
    pub diagnoses_inserted: usize,
    pub facilities_inserted: usize,
}

/// Insert the catalog and registry, skipping entries that already exist.
pub fn seed_reference_data(conn: &Connection) -> Result<SeedReport, DatabaseError> {
    let tx = conn.unchecked_transaction()?;
    let mut report = SeedReport::default();

    for (id, code, name, category, severity) in DIAGNOSIS_CATALOG {
        let inserted = insert_diagnosis(
            &tx,
            &Diagnosis {
                diagnosis_id: id.to_string(),
                diagnosis_code: code.to_string(),
                diagnosis_name: name.to_string(),
                diagnosis_category: Some(category.to_string()),
                severity: *severity,
            },
        )?;
        report.diagnoses_inserted += inserted as usize;
    }

    for (id, name, facility_type, city, beds, emergency) in FACILITY_REGISTRY {
        let inserted = insert_facility(
            &tx,
            &Facility {
                facility_id: id.to_string(),
                facility_name: name.to_string(),
                facility_type: *facility_type,
                address_city: Some(city.to_string()),
                address_state: None,
                total_beds: *beds,
                has_emergency: *emergency,
            },
        )?;
        report.facilities_inserted += inserted as usize;
    }

    tx.commit()?;
    tracing::info!(
        diagnoses = report.diagnoses_inserted,
        facilities = report.facilities_inserted,
        "Reference data seeded"
    );
    Ok(report)
}

/// Reference lookups loaded once per run.
#[derive(Debug, Clone)]
pub struct ReferenceCache {
    hospitals: Vec<String>,
    diagnosis_ids: HashMap<String, String>,
}

impl ReferenceCache {
    /// Fails when there is no hospital to attach encounters to, or when a
    /// code the finding mapping can produce is absent from the catalog.
    pub fn load(conn: &Connection) -> Result<Self, PipelineError> {
        let hospitals = get_facility_ids_by_type(conn, FacilityType::Hospital)?;
        if hospitals.is_empty() {
            return Err(PipelineError::MissingReference(
                "no facilities of type Hospital".into(),
            ));
        }

        let diagnosis_ids = get_diagnosis_code_map(conn)?;
        let mut missing: Vec<&str> = NIH_TO_ICD10
            .iter()
            .map(|(_, code, _)| *code)
            .filter(|code| !diagnosis_ids.contains_key(*code))
            .collect();
        missing.sort_unstable();
        missing.dedup();
        if !missing.is_empty() {
            return Err(PipelineError::MissingReference(format!(
                "diagnosis catalog lacks {}",
                missing.join(", ")
            )));
        }

        tracing::debug!(
            hospitals = hospitals.len(),
            diagnoses = diagnosis_ids.len(),
            "Reference cache loaded"
        );
        Ok(Self {
            hospitals,
            diagnosis_ids,
        })
    }

    pub fn diagnosis_id(&self, icd_code: &str) -> Option<&str> {
        self.diagnosis_ids.get(icd_code).map(String::as_str)
    }

    /// Hospital for an encounter, stable for a given natural key.
    pub fn hospital_for(&self, key: &str) -> &str {
        &self.hospitals[stable_index(key, "facility", self.hospitals.len())]
    }
}
