use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

use super::enums::{Laterality, Modality};

/// An imaging procedure. `procedure_id` is assigned by the store; the pair
/// `(encounter_id, procedure_code)` is what identifies it across loads.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Procedure {
    pub procedure_id: Option<i64>,
    pub encounter_id: String,
    pub procedure_code: String,
    pub procedure_name: String,
    pub body_part: Option<String>,
    pub laterality: Laterality,
    pub view_position: Option<String>,
    pub modality: Modality,
    pub procedure_datetime: NaiveDateTime,
}
