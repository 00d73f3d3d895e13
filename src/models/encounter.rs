use chrono::{NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};

use super::enums::EncounterType;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Encounter {
    pub encounter_id: String,
    pub patient_id: String,
    pub facility_id: String,
    pub encounter_date: NaiveDate,
    pub encounter_datetime: NaiveDateTime,
    pub encounter_type: EncounterType,
    pub admission_source: Option<String>,
    pub visit_reason: Option<String>,
}
