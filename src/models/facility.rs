use serde::{Deserialize, Serialize};

use super::enums::FacilityType;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Facility {
    pub facility_id: String,
    pub facility_name: String,
    pub facility_type: FacilityType,
    pub address_city: Option<String>,
    pub address_state: Option<String>,
    pub total_beds: Option<i64>,
    pub has_emergency: bool,
}
