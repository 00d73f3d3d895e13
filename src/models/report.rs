use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

use super::enums::{ReportStatus, ReportType};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Report {
    pub report_id: String,
    pub encounter_id: String,
    pub report_type: ReportType,
    pub report_status: ReportStatus,
    pub report_text: String,
    pub findings: Option<String>,
    pub impression: Option<String>,
    pub recommendations: Option<String>,
    pub dictated_datetime: NaiveDateTime,
    pub signed_datetime: Option<NaiveDateTime>,
}
