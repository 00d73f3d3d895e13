use std::collections::BTreeMap;

use chrono::{NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};

use crate::models::enums::{EncounterType, Gender, Modality, ReportStatus, ReportType};

/// Columns of the imaging extract the pipeline understands. Anything else
/// in the header is dropped at the extract boundary.
pub const KNOWN_COLUMNS: &[&str] = &[
    "Image Index",
    "Finding Labels",
    "Patient ID",
    "Patient Age",
    "Patient Gender",
    "View Position",
    "report_type",
    "report_status",
    "report_text",
    "findings",
    "impression",
    "recommendations",
];

/// One raw CSV row. Every field is optional here; presence and shape are
/// checked when the row becomes an [`ImagingRecord`].
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct SourceRow {
    #[serde(rename = "Image Index")]
    pub image_index: Option<String>,
    #[serde(rename = "Finding Labels")]
    pub finding_labels: Option<String>,
    #[serde(rename = "Patient ID")]
    pub patient_id: Option<String>,
    #[serde(rename = "Patient Age")]
    pub patient_age: Option<String>,
    #[serde(rename = "Patient Gender")]
    pub patient_gender: Option<String>,
    #[serde(rename = "View Position")]
    pub view_position: Option<String>,
    pub report_type: Option<String>,
    pub report_status: Option<String>,
    pub report_text: Option<String>,
    pub findings: Option<String>,
    pub impression: Option<String>,
    pub recommendations: Option<String>,
}

/// A finding label resolved to its ICD-10 code, in source order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MappedFinding {
    pub label: String,
    pub icd_code: &'static str,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReportText {
    pub report_type: ReportType,
    pub report_status: ReportStatus,
    pub report_text: String,
    pub findings: Option<String>,
    pub impression: Option<String>,
    pub recommendations: Option<String>,
}

/// A validated imaging row with every natural key already derived.
#[derive(Debug, Clone, Serialize)]
pub struct ImagingRecord {
    /// 1-based data row in the source file.
    pub row: usize,
    pub procedure_code: String,
    pub encounter_id: String,
    pub report_id: String,
    pub patient_id: String,
    pub external_patient_id: String,
    pub patient_age: u32,
    pub date_of_birth: NaiveDate,
    pub gender: Gender,
    pub view_position: Option<String>,
    pub modality: Modality,
    pub encounter_datetime: NaiveDateTime,
    pub encounter_type: EncounterType,
    /// At most three, deduplicated by ICD code; the first is the primary.
    pub findings: Vec<MappedFinding>,
    pub unmapped_labels: Vec<String>,
    pub report: Option<ReportText>,
}

/// Rows written by one committed chunk of imaging records.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ImagingTally {
    pub patients_created: usize,
    pub encounters_created: usize,
    pub procedures_created: usize,
    pub diagnoses_assigned: usize,
    pub reports_created: usize,
}

impl std::ops::AddAssign for ImagingTally {
    fn add_assign(&mut self, rhs: Self) {
        self.patients_created += rhs.patients_created;
        self.encounters_created += rhs.encounters_created;
        self.procedures_created += rhs.procedures_created;
        self.diagnoses_assigned += rhs.diagnoses_assigned;
        self.reports_created += rhs.reports_created;
    }
}

/// Summary of one ingest run.
#[derive(Debug, Clone, Default, Serialize)]
pub struct IngestStats {
    pub run_id: String,
    pub records_read: usize,
    /// New records handed to the loader (attempted-and-new).
    pub records_processed: usize,
    /// Records whose natural key was already stored or repeated in the input.
    pub records_skipped: usize,
    pub chunks_committed: usize,
    #[serde(flatten)]
    pub written: ImagingTally,
    pub transform_errors: Vec<String>,
    /// Finding labels with no ICD-10 mapping, by occurrence count.
    pub unmapped_labels: BTreeMap<String, usize>,
    pub duration_ms: u64,
}

impl IngestStats {
    pub fn transform_error_count(&self) -> usize {
        self.transform_errors.len()
    }
}
