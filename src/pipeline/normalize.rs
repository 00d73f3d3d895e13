//! Natural-key derivation and row normalization for the imaging extract.
//!
//! Every key produced here is a pure function of the source identifiers, so
//! the same input row maps to the same stored rows on every run. Values the
//! extract does not carry (encounter date, encounter type, facility) are
//! assigned from a SHA-256 digest of the procedure key for the same reason.

use std::collections::HashSet;
use std::path::Path;
use std::str::FromStr;
use std::sync::LazyLock;

use chrono::{Duration, NaiveDate, NaiveDateTime};
use regex::Regex;
use sha2::{Digest, Sha256};

use crate::config::DEFAULT_ENCOUNTER_WINDOW_DAYS;
use crate::models::enums::{EncounterType, Gender, Modality, ReportStatus, ReportType};

use super::error::TransformError;
use super::types::{ImagingRecord, MappedFinding, ReportText, SourceRow};

/// Findings kept per encounter.
pub const MAX_FINDINGS: usize = 3;

/// NIH finding label → (ICD-10 code, catalog name).
pub const NIH_TO_ICD10: &[(&str, &str, &str)] = &[
    ("Atelectasis", "J98.11", "Atelectasis"),
    ("Cardiomegaly", "I51.7", "Cardiomegaly"),
    ("Effusion", "J94.8", "Pleural Effusion"),
    ("Infiltration", "J98.4", "Other Disorders of Lung"),
    ("Mass", "D49.2", "Neoplasm of Uncertain Behavior"),
    ("Nodule", "R91.8", "Abnormal Lung Finding"),
    ("Pneumonia", "J18.9", "Pneumonia"),
    ("Pneumothorax", "J93.0", "Spontaneous Tension Pneumothorax"),
    ("Consolidation", "J18.1", "Lobar Pneumonia"),
    ("Edema", "J81.0", "Acute Pulmonary Edema"),
    ("Emphysema", "J43.9", "Emphysema"),
    ("Fibrosis", "J84.9", "Interstitial Lung Disease"),
    ("Pleural_Thickening", "J94.8", "Pleural Effusion"),
    ("Hernia", "K44.9", "Diaphragmatic Hernia"),
    ("No Finding", "R91.8", "Abnormal Lung Finding"),
];

static AGE_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\s*(\d{1,3})\s*[Yy]?\s*$").unwrap());

/// Where a record came from. The tag is part of every natural key it owns,
/// so keys from different sources never collide.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceTag {
    Nih,
    Synthetic,
}

impl SourceTag {
    /// Prefix shared by every procedure code of this source.
    pub fn procedure_prefix(&self) -> &'static str {
        match self {
            Self::Nih => "NIH_",
            Self::Synthetic => "PROC",
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Nih => "NIH Dataset",
            Self::Synthetic => "Synthetic Data",
        }
    }

    /// Prefix shared by every patient id of this source.
    pub fn patient_prefix(&self) -> &'static str {
        match self {
            Self::Nih => "NIH_PAT_",
            Self::Synthetic => "PAT",
        }
    }
}

/// `00000001_000.png` → `NIH_00000001_000`.
pub fn procedure_code(row: usize, image_index: Option<&str>) -> Result<String, TransformError> {
    let raw = required(row, "Image Index", image_index)?;
    let stem = Path::new(raw)
        .file_stem()
        .and_then(|s| s.to_str())
        .filter(|s| !s.is_empty())
        .ok_or_else(|| TransformError::InvalidField {
            row,
            field: "Image Index",
            value: raw.to_string(),
        })?;
    Ok(format!("{}{stem}", SourceTag::Nih.procedure_prefix()))
}

pub fn encounter_key(procedure_code: &str) -> String {
    format!("{procedure_code}_ENC")
}

pub fn report_key(encounter_id: &str) -> String {
    format!("{encounter_id}_RPT")
}

/// External NIH patient id → `NIH_PAT_<id>`.
pub fn nih_patient_key(row: usize, external_id: Option<&str>) -> Result<String, TransformError> {
    let raw = required(row, "Patient ID", external_id)?;
    Ok(format!("{}{raw}", SourceTag::Nih.patient_prefix()))
}

/// Canonical synthetic patient id, `PAT0000042`.
pub fn synthetic_patient_key(number: u32) -> String {
    format!("{}{number:07}", SourceTag::Synthetic.patient_prefix())
}

pub fn icd_for_label(label: &str) -> Option<&'static str> {
    NIH_TO_ICD10
        .iter()
        .find(|(l, _, _)| *l == label)
        .map(|(_, code, _)| *code)
}

/// Split `A|B|C`, map each label, drop repeated codes and keep the first
/// [`MAX_FINDINGS`]. Returns the mapped findings and the unknown labels.
pub fn map_findings(labels: &str) -> (Vec<MappedFinding>, Vec<String>) {
    let mut mapped = Vec::new();
    let mut unmapped = Vec::new();
    let mut seen_codes = HashSet::new();

    for label in labels.split('|').map(str::trim).filter(|l| !l.is_empty()) {
        match icd_for_label(label) {
            Some(code) => {
                if mapped.len() < MAX_FINDINGS && seen_codes.insert(code) {
                    mapped.push(MappedFinding {
                        label: label.to_string(),
                        icd_code: code,
                    });
                }
            }
            None => unmapped.push(label.to_string()),
        }
    }

    (mapped, unmapped)
}

pub fn modality_for_view(view_position: Option<&str>) -> Modality {
    match view_position.map(str::trim) {
        Some("CT") => Modality::Ct,
        Some("MR") => Modality::Mri,
        Some("US") => Modality::Ultrasound,
        // DX, CR, PA, AP and anything unknown are plain radiographs
        _ => Modality::XRay,
    }
}

/// Accepts `58` and `058Y`.
pub fn parse_age(row: usize, raw: Option<&str>) -> Result<u32, TransformError> {
    let raw = required(row, "Patient Age", raw)?;
    AGE_PATTERN
        .captures(raw)
        .and_then(|c| c.get(1))
        .and_then(|m| m.as_str().parse::<u32>().ok())
        .ok_or_else(|| TransformError::InvalidField {
            row,
            field: "Patient Age",
            value: raw.to_string(),
        })
}

/// Stable value in `0..n` for `key`. `salt` separates independent choices
/// made from the same key.
pub fn stable_index(key: &str, salt: &str, n: usize) -> usize {
    if n == 0 {
        return 0;
    }
    let mut hasher = Sha256::new();
    hasher.update(salt.as_bytes());
    hasher.update(b":");
    hasher.update(key.as_bytes());
    let digest = hasher.finalize();
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest[..8]);
    (u64::from_be_bytes(bytes) % n as u64) as usize
}

fn required<'a>(
    row: usize,
    field: &'static str,
    value: Option<&'a str>,
) -> Result<&'a str, TransformError> {
    value
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .ok_or(TransformError::MissingField { row, field })
}

fn optional(value: &Option<String>) -> Option<String> {
    value
        .as_deref()
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(String::from)
}

const IMAGING_ENCOUNTER_TYPES: [EncounterType; 3] = [
    EncounterType::Inpatient,
    EncounterType::Outpatient,
    EncounterType::Emergency,
];

/// Turns raw rows into [`ImagingRecord`]s relative to a fixed reference date.
#[derive(Debug, Clone)]
pub struct Normalizer {
    reference_date: NaiveDate,
    window_days: i64,
}

impl Normalizer {
    pub fn new(reference_date: NaiveDate) -> Self {
        Self {
            reference_date,
            window_days: DEFAULT_ENCOUNTER_WINDOW_DAYS,
        }
    }

    pub fn reference_date(&self) -> NaiveDate {
        self.reference_date
    }

    /// Encounter timestamp inside the window ending at the reference date.
    pub fn encounter_datetime(&self, key: &str) -> NaiveDateTime {
        let span = (self.window_days + 1) as usize;
        let offset = stable_index(key, "day", span) as i64;
        let hour = stable_index(key, "hour", 24) as u32;
        let date = self.reference_date - Duration::days(self.window_days - offset);
        date.and_hms_opt(hour, 0, 0).unwrap_or_default()
    }

    pub fn encounter_type(&self, key: &str) -> EncounterType {
        IMAGING_ENCOUNTER_TYPES[stable_index(key, "type", IMAGING_ENCOUNTER_TYPES.len())]
    }

    pub fn transform(&self, row: usize, source: &SourceRow) -> Result<ImagingRecord, TransformError> {
        let procedure_code = procedure_code(row, source.image_index.as_deref())?;
        let patient_id = nih_patient_key(row, source.patient_id.as_deref())?;
        let external_patient_id = required(row, "Patient ID", source.patient_id.as_deref())?.to_string();
        let patient_age = parse_age(row, source.patient_age.as_deref())?;

        let encounter_id = encounter_key(&procedure_code);
        let report_id = report_key(&encounter_id);
        let encounter_datetime = self.encounter_datetime(&procedure_code);

        let (findings, unmapped_labels) =
            map_findings(source.finding_labels.as_deref().unwrap_or_default());

        let report = match optional(&source.report_text) {
            Some(text) => Some(ReportText {
                report_type: parse_or(row, "report_type", &source.report_type, ReportType::Final)?,
                report_status: parse_or(
                    row,
                    "report_status",
                    &source.report_status,
                    ReportStatus::Signed,
                )?,
                report_text: text,
                findings: optional(&source.findings),
                impression: optional(&source.impression),
                recommendations: optional(&source.recommendations),
            }),
            None => None,
        };

        Ok(ImagingRecord {
            row,
            encounter_type: self.encounter_type(&procedure_code),
            date_of_birth: self.reference_date - Duration::days(i64::from(patient_age) * 365),
            gender: Gender::from_source(source.patient_gender.as_deref().unwrap_or_default()),
            view_position: optional(&source.view_position),
            modality: modality_for_view(source.view_position.as_deref()),
            procedure_code,
            encounter_id,
            report_id,
            patient_id,
            external_patient_id,
            patient_age,
            encounter_datetime,
            findings,
            unmapped_labels,
            report,
        })
    }
}

fn parse_or<T: FromStr>(
    row: usize,
    field: &'static str,
    value: &Option<String>,
    fallback: T,
) -> Result<T, TransformError> {
    match optional(value) {
        Some(v) => T::from_str(&v).map_err(|_| TransformError::InvalidField { row, field, value: v }),
        None => Ok(fallback),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reference() -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 6, 30).unwrap()
    }

    fn nih_row(index: &str, patient: &str) -> SourceRow {
        SourceRow {
            image_index: Some(index.into()),
            finding_labels: Some("Effusion|Pneumonia".into()),
            patient_id: Some(patient.into()),
            patient_age: Some("058Y".into()),
            patient_gender: Some("F".into()),
            view_position: Some("PA".into()),
            ..Default::default()
        }
    }

    #[test]
    fn natural_keys_follow_source_identifiers() {
        let code = procedure_code(1, Some("00000001_000.png")).unwrap();
        assert_eq!(code, "NIH_00000001_000");
        assert_eq!(encounter_key(&code), "NIH_00000001_000_ENC");
        assert_eq!(report_key(&encounter_key(&code)), "NIH_00000001_000_ENC_RPT");
        assert_eq!(nih_patient_key(1, Some("10001")).unwrap(), "NIH_PAT_10001");
        assert_eq!(synthetic_patient_key(10001), "PAT0010001");
    }

    #[test]
    fn missing_identifier_is_a_transform_error() {
        assert_eq!(
            procedure_code(4, Some("  ")).unwrap_err(),
            TransformError::MissingField { row: 4, field: "Image Index" }
        );
        assert!(matches!(
            nih_patient_key(5, None),
            Err(TransformError::MissingField { row: 5, .. })
        ));
    }

    #[test]
    fn findings_dedupe_by_code_and_cap_at_three() {
        // Nodule and No Finding share R91.8; Effusion and Pleural_Thickening share J94.8
        let (mapped, unmapped) =
            map_findings("Nodule|No Finding|Effusion|Pleural_Thickening|Mass|Hernia|Bogus");
        let codes: Vec<_> = mapped.iter().map(|f| f.icd_code).collect();
        assert_eq!(codes, vec!["R91.8", "J94.8", "D49.2"]);
        assert_eq!(unmapped, vec!["Bogus".to_string()]);
    }

    #[test]
    fn empty_labels_map_to_nothing() {
        let (mapped, unmapped) = map_findings("");
        assert!(mapped.is_empty());
        assert!(unmapped.is_empty());
    }

    #[test]
    fn modality_mapping() {
        assert_eq!(modality_for_view(Some("PA")), Modality::XRay);
        assert_eq!(modality_for_view(Some("AP")), Modality::XRay);
        assert_eq!(modality_for_view(Some("CT")), Modality::Ct);
        assert_eq!(modality_for_view(Some("MR")), Modality::Mri);
        assert_eq!(modality_for_view(Some("US")), Modality::Ultrasound);
        assert_eq!(modality_for_view(Some("LL")), Modality::XRay);
        assert_eq!(modality_for_view(None), Modality::XRay);
    }

    #[test]
    fn age_formats() {
        assert_eq!(parse_age(1, Some("58")).unwrap(), 58);
        assert_eq!(parse_age(1, Some("058Y")).unwrap(), 58);
        assert!(parse_age(1, Some("fifty")).is_err());
        assert!(parse_age(1, None).is_err());
    }

    #[test]
    fn stable_index_is_deterministic_and_bounded() {
        for key in ["NIH_00000001_000", "NIH_00000002_000", "x"] {
            let a = stable_index(key, "day", 731);
            assert_eq!(a, stable_index(key, "day", 731));
            assert!(a < 731);
        }
        assert_eq!(stable_index("anything", "salt", 0), 0);
    }

    #[test]
    fn transform_is_repeatable() {
        let normalizer = Normalizer::new(reference());
        let row = nih_row("00000007_001.png", "7");
        let a = normalizer.transform(1, &row).unwrap();
        let b = normalizer.transform(1, &row).unwrap();
        assert_eq!(a.encounter_datetime, b.encounter_datetime);
        assert_eq!(a.encounter_type, b.encounter_type);
        assert_eq!(a.patient_id, "NIH_PAT_7");
        assert_eq!(a.gender, Gender::Female);
        assert_eq!(a.date_of_birth, reference() - Duration::days(58 * 365));
        assert_eq!(a.modality, Modality::XRay);
        assert_eq!(a.findings.len(), 2);
    }

    #[test]
    fn encounter_dates_stay_in_window() {
        let normalizer = Normalizer::new(reference());
        let earliest = reference() - Duration::days(DEFAULT_ENCOUNTER_WINDOW_DAYS);
        for i in 0..200 {
            let dt = normalizer.encounter_datetime(&format!("NIH_{i:08}_000"));
            assert!(dt.date() >= earliest && dt.date() <= reference());
        }
    }

    #[test]
    fn report_only_when_text_present() {
        let normalizer = Normalizer::new(reference());
        let mut row = nih_row("00000009_000.png", "9");
        assert!(normalizer.transform(1, &row).unwrap().report.is_none());

        row.report_text = Some("Clear lungs.".into());
        let report = normalizer.transform(1, &row).unwrap().report.unwrap();
        assert_eq!(report.report_type, ReportType::Final);
        assert_eq!(report.report_status, ReportStatus::Signed);

        row.report_status = Some("Lost".into());
        assert!(matches!(
            normalizer.transform(3, &row),
            Err(TransformError::InvalidField { field: "report_status", .. })
        ));
    }
}
