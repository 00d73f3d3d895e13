use serde::{Deserialize, Serialize};

use super::enums::Severity;

/// Master catalog entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Diagnosis {
    pub diagnosis_id: String,
    pub diagnosis_code: String,
    pub diagnosis_name: String,
    pub diagnosis_category: Option<String>,
    pub severity: Severity,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EncounterDiagnosis {
    pub encounter_id: String,
    pub diagnosis_id: String,
    pub diagnosis_rank: u32,
    pub is_primary: bool,
    pub notes: Option<String>,
}
