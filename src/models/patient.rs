use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use super::enums::Gender;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Patient {
    pub patient_id: String,
    pub date_of_birth: NaiveDate,
    pub gender: Gender,
    pub primary_language: Option<String>,
    pub address_city: Option<String>,
    pub insurance_id: Option<String>,
    /// Identifier of the patient in the system the record came from.
    pub external_ref: Option<String>,
    pub is_active: bool,
}
