//! NIH imaging ingest: extract → normalize → existing-key filter → load.

use std::time::{Duration, Instant};

use chrono::{Duration as ChronoDuration, NaiveDate};
use rusqlite::Connection;
use uuid::Uuid;

use crate::config::PipelineConfig;
use crate::db::repository::{
    count_procedures_by_prefix, insert_encounter, insert_encounter_diagnosis, insert_patient,
    insert_procedure, insert_report, KeyedEntity,
};
use crate::db::DatabaseError;
use crate::models::enums::{Laterality, ReportStatus};
use crate::models::{Encounter, EncounterDiagnosis, Patient, Procedure, Report};

use super::error::PipelineError;
use super::existing::ExistingKeys;
use super::extract::{read_source, Extracted};
use super::loader::{BatchLoader, ChunkWriter, NaturalKey, Tally};
use super::normalize::{Normalizer, SourceTag};
use super::reference::ReferenceCache;
use super::types::{ImagingRecord, ImagingTally, IngestStats};

const IMAGING_CITY: &str = "Kigali";
const IMAGING_LANGUAGE: &str = "English";
const ADMISSION_SOURCE: &str = "Direct Admission";
const VISIT_REASON: &str = "Scheduled Imaging";
/// Time between dictation and signature of a signed report.
const SIGNING_DELAY_HOURS: i64 = 2;

impl NaturalKey for ImagingRecord {
    fn natural_key(&self) -> &str {
        &self.procedure_code
    }
}

impl Tally for ImagingTally {
    fn rows_written(&self) -> usize {
        self.patients_created
            + self.encounters_created
            + self.procedures_created
            + self.diagnoses_assigned
            + self.reports_created
    }
}

/// Writes patient, encounter, procedure, diagnosis links and report for
/// each record of a chunk. Every insert skips on natural-key conflict.
pub struct ImagingChunkWriter<'a> {
    reference: &'a ReferenceCache,
}

impl<'a> ImagingChunkWriter<'a> {
    pub fn new(reference: &'a ReferenceCache) -> Self {
        Self { reference }
    }

    fn write_record(&self, conn: &Connection, rec: &ImagingRecord) -> Result<ImagingTally, DatabaseError> {
        let mut tally = ImagingTally::default();

        let patient = Patient {
            patient_id: rec.patient_id.clone(),
            date_of_birth: rec.date_of_birth,
            gender: rec.gender,
            primary_language: Some(IMAGING_LANGUAGE.into()),
            address_city: Some(IMAGING_CITY.into()),
            insurance_id: Some(format!("INS{}", rec.external_patient_id)),
            external_ref: Some(rec.external_patient_id.clone()),
            is_active: true,
        };
        tally.patients_created += insert_patient(conn, &patient)? as usize;

        let encounter = Encounter {
            encounter_id: rec.encounter_id.clone(),
            patient_id: rec.patient_id.clone(),
            facility_id: self.reference.hospital_for(&rec.procedure_code).to_string(),
            encounter_date: rec.encounter_datetime.date(),
            encounter_datetime: rec.encounter_datetime,
            encounter_type: rec.encounter_type,
            admission_source: Some(ADMISSION_SOURCE.into()),
            visit_reason: Some(VISIT_REASON.into()),
        };
        tally.encounters_created += insert_encounter(conn, &encounter)? as usize;

        let procedure = Procedure {
            procedure_id: None,
            encounter_id: rec.encounter_id.clone(),
            procedure_code: rec.procedure_code.clone(),
            procedure_name: format!("{} Chest", rec.modality),
            body_part: Some("Chest".into()),
            laterality: Laterality::NotApplicable,
            view_position: rec.view_position.clone(),
            modality: rec.modality,
            procedure_datetime: rec.encounter_datetime,
        };
        tally.procedures_created += insert_procedure(conn, &procedure)? as usize;

        // Ranks are assigned after catalog resolution so rank 1 (the primary)
        // always exists when any diagnosis does.
        let resolved = rec.findings.iter().filter_map(|f| {
            self.reference
                .diagnosis_id(f.icd_code)
                .map(|id| (id, f.label.as_str()))
        });
        for (i, (diagnosis_id, label)) in resolved.enumerate() {
            let rank = i as u32 + 1;
            let link = EncounterDiagnosis {
                encounter_id: rec.encounter_id.clone(),
                diagnosis_id: diagnosis_id.to_string(),
                diagnosis_rank: rank,
                is_primary: rank == 1,
                notes: Some(format!("NIH finding: {label}")),
            };
            tally.diagnoses_assigned += insert_encounter_diagnosis(conn, &link)? as usize;
        }

        if let Some(text) = &rec.report {
            let signed = (text.report_status == ReportStatus::Signed)
                .then(|| rec.encounter_datetime + ChronoDuration::hours(SIGNING_DELAY_HOURS));
            let report = Report {
                report_id: rec.report_id.clone(),
                encounter_id: rec.encounter_id.clone(),
                report_type: text.report_type,
                report_status: text.report_status,
                report_text: text.report_text.clone(),
                findings: text.findings.clone(),
                impression: text.impression.clone(),
                recommendations: text.recommendations.clone(),
                dictated_datetime: rec.encounter_datetime,
                signed_datetime: signed,
            };
            tally.reports_created += insert_report(conn, &report)? as usize;
        }

        Ok(tally)
    }
}

impl ChunkWriter<ImagingRecord> for ImagingChunkWriter<'_> {
    type Tally = ImagingTally;

    fn write_chunk(&self, conn: &Connection, chunk: &[ImagingRecord]) -> Result<ImagingTally, DatabaseError> {
        let mut tally = ImagingTally::default();
        for rec in chunk {
            tally += self.write_record(conn, rec)?;
        }
        Ok(tally)
    }
}

/// One configured imaging ingest.
pub struct ImagingEtl {
    config: PipelineConfig,
    normalizer: Normalizer,
    loader: BatchLoader,
}

impl ImagingEtl {
    pub fn new(config: PipelineConfig, reference_date: NaiveDate) -> Result<Self, PipelineError> {
        config.validate()?;
        let loader = BatchLoader::new(config.batch_size)?;
        Ok(Self {
            normalizer: Normalizer::new(reference_date),
            config,
            loader,
        })
    }

    /// Read the configured input file and ingest it.
    pub fn run(&self, conn: &Connection) -> Result<IngestStats, PipelineError> {
        let extracted = read_source(&self.config.input_path)?;
        self.run_extracted(conn, extracted)
    }

    /// Ingest rows that were already extracted.
    pub fn run_extracted(&self, conn: &Connection, extracted: Extracted) -> Result<IngestStats, PipelineError> {
        let reference = ReferenceCache::load(conn)?;
        self.ingest(conn, &reference, extracted)
    }

    fn ingest(
        &self,
        conn: &Connection,
        reference: &ReferenceCache,
        extracted: Extracted,
    ) -> Result<IngestStats, PipelineError> {
        let run_id = Uuid::new_v4().to_string();
        let span = tracing::info_span!("ingest", run_id = %run_id);
        let _guard = span.enter();
        let start = Instant::now();

        tracing::info!(
            incremental = self.config.incremental,
            batch_size = self.loader.batch_size(),
            "Starting imaging ingest"
        );

        let mut stats = IngestStats {
            run_id,
            records_read: extracted.len(),
            transform_errors: extracted.errors.iter().map(ToString::to_string).collect(),
            ..IngestStats::default()
        };

        let mut records = Vec::with_capacity(extracted.rows.len());
        for (row, source) in &extracted.rows {
            match self.normalizer.transform(*row, source) {
                Ok(rec) => {
                    for label in &rec.unmapped_labels {
                        *stats.unmapped_labels.entry(label.clone()).or_insert(0) += 1;
                    }
                    records.push(rec);
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Record rejected");
                    stats.transform_errors.push(e.to_string());
                }
            }
        }

        let existing = if self.config.incremental {
            ExistingKeys::load(conn, KeyedEntity::Procedure, Some(SourceTag::Nih.procedure_prefix()))?
        } else {
            ExistingKeys::empty(KeyedEntity::Procedure)
        };
        tracing::info!(existing = existing.len(), candidates = records.len(), "Existing keys loaded");

        let writer = ImagingChunkWriter::new(reference);
        let report = self.loader.load(conn, records, &existing, &writer)?;

        stats.records_processed = report.records_processed;
        stats.records_skipped = report.records_skipped;
        stats.chunks_committed = report.chunks_committed;
        stats.written = report.tally;
        stats.duration_ms = start.elapsed().as_millis() as u64;

        tracing::info!(
            processed = stats.records_processed,
            skipped = stats.records_skipped,
            failed = stats.transform_error_count(),
            patients = stats.written.patients_created,
            encounters = stats.written.encounters_created,
            procedures = stats.written.procedures_created,
            diagnoses = stats.written.diagnoses_assigned,
            reports = stats.written.reports_created,
            duration_ms = stats.duration_ms,
            "Imaging ingest complete"
        );
        if !stats.unmapped_labels.is_empty() {
            tracing::warn!(labels = ?stats.unmapped_labels, "Finding labels without an ICD-10 mapping");
        }

        Ok(stats)
    }
}

/// Run the ingest `runs` times with `delay` in between. Every run after the
/// first should skip everything the earlier runs loaded.
pub fn simulate(
    etl: &ImagingEtl,
    conn: &Connection,
    runs: usize,
    delay: Duration,
) -> Result<Vec<IngestStats>, PipelineError> {
    let mut history = Vec::with_capacity(runs);
    for run in 1..=runs {
        tracing::info!(run, of = runs, "Simulated incremental run");
        history.push(etl.run(conn)?);
        if run < runs && !delay.is_zero() {
            std::thread::sleep(delay);
        }
    }
    Ok(history)
}

/// Stored procedures per source, labelled for display. Codes without the
/// imaging prefix count as synthetic.
pub fn procedure_counts_by_source(conn: &Connection) -> Result<Vec<(String, i64)>, DatabaseError> {
    let (nih, synthetic) = count_procedures_by_prefix(conn, SourceTag::Nih.procedure_prefix())?;
    Ok(vec![
        (SourceTag::Nih.label().to_string(), nih),
        (SourceTag::Synthetic.label().to_string(), synthetic),
    ])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::repository::{get_encounter, get_encounter_diagnoses, get_reports_for_encounter};
    use crate::db::sqlite::{count_rows, open_memory_database};
    use crate::pipeline::reference::seed_reference_data;
    use crate::pipeline::types::SourceRow;

    fn reference_date() -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 6, 30).unwrap()
    }

    fn seeded_db() -> Connection {
        let conn = open_memory_database().unwrap();
        seed_reference_data(&conn).unwrap();
        conn
    }

    fn etl(batch_size: usize, incremental: bool) -> ImagingEtl {
        let config = PipelineConfig {
            batch_size,
            incremental,
            ..PipelineConfig::default()
        };
        ImagingEtl::new(config, reference_date()).unwrap()
    }

    fn row(image: usize, patient: usize, labels: &str) -> SourceRow {
        SourceRow {
            image_index: Some(format!("{patient:08}_{image:03}.png")),
            finding_labels: Some(labels.into()),
            patient_id: Some(patient.to_string()),
            patient_age: Some("45".into()),
            patient_gender: Some("M".into()),
            view_position: Some("PA".into()),
            ..Default::default()
        }
    }

    fn batch(n: usize) -> Vec<SourceRow> {
        (0..n).map(|i| row(i % 3, i / 3 + 1, "Effusion|Pneumonia")).collect()
    }

    #[test]
    fn ingest_writes_every_entity() {
        let conn = seeded_db();
        let mut input = batch(6);
        input[0].report_text = Some("Small right effusion.".into());

        let stats = etl(4, true).run_extracted(&conn, Extracted::from_rows(input)).unwrap();
        assert_eq!(stats.records_read, 6);
        assert_eq!(stats.records_processed, 6);
        assert_eq!(stats.chunks_committed, 2);
        assert_eq!(stats.written.patients_created, 2);
        assert_eq!(stats.written.encounters_created, 6);
        assert_eq!(stats.written.procedures_created, 6);
        assert_eq!(stats.written.diagnoses_assigned, 12);
        assert_eq!(stats.written.reports_created, 1);

        let enc = get_encounter(&conn, "NIH_00000001_000_ENC").unwrap().unwrap();
        assert_eq!(enc.patient_id, "NIH_PAT_1");
        let reports = get_reports_for_encounter(&conn, "NIH_00000001_000_ENC").unwrap();
        assert_eq!(reports[0].report_id, "NIH_00000001_000_ENC_RPT");
        assert!(reports[0].signed_datetime.is_some());
    }

    #[test]
    fn rerun_is_idempotent() {
        let conn = seeded_db();
        let pipeline = etl(4, true);
        pipeline.run_extracted(&conn, Extracted::from_rows(batch(9))).unwrap();
        let before = count_rows(&conn, "encounter_diagnoses").unwrap();

        let again = pipeline.run_extracted(&conn, Extracted::from_rows(batch(9))).unwrap();
        assert_eq!(again.records_processed, 0);
        assert_eq!(again.records_skipped, 9);
        assert_eq!(count_rows(&conn, "procedures").unwrap(), 9);
        assert_eq!(count_rows(&conn, "encounter_diagnoses").unwrap(), before);
    }

    #[test]
    fn incremental_run_loads_only_new_records() {
        let conn = seeded_db();
        let pipeline = etl(5, true);
        pipeline.run_extracted(&conn, Extracted::from_rows(batch(9))).unwrap();

        let grown = pipeline.run_extracted(&conn, Extracted::from_rows(batch(15))).unwrap();
        assert_eq!(grown.records_processed, 6);
        assert_eq!(grown.records_skipped, 9);
        assert_eq!(grown.written.patients_created, 2);
        assert_eq!(count_rows(&conn, "procedures").unwrap(), 15);
        assert_eq!(count_rows(&conn, "patients").unwrap(), 5);
    }

    #[test]
    fn full_reload_writes_nothing_twice() {
        let conn = seeded_db();
        etl(4, true).run_extracted(&conn, Extracted::from_rows(batch(6))).unwrap();

        let reload = etl(4, false).run_extracted(&conn, Extracted::from_rows(batch(6))).unwrap();
        assert_eq!(reload.records_processed, 6);
        assert_eq!(reload.records_skipped, 0);
        assert_eq!(reload.written, ImagingTally::default());
    }

    #[test]
    fn bad_rows_are_counted_not_fatal() {
        let conn = seeded_db();
        let mut input = batch(3);
        input[1].image_index = None;
        input[2].patient_age = Some("unknown".into());

        let stats = etl(10, true).run_extracted(&conn, Extracted::from_rows(input)).unwrap();
        assert_eq!(stats.records_processed, 1);
        assert_eq!(stats.transform_error_count(), 2);
        assert!(stats.transform_errors[0].contains("Row 2"));
    }

    #[test]
    fn unmapped_labels_are_tallied() {
        let conn = seeded_db();
        let input = vec![row(0, 1, "Bogus|Pneumonia"), row(1, 1, "Bogus")];

        let stats = etl(10, true).run_extracted(&conn, Extracted::from_rows(input)).unwrap();
        assert_eq!(stats.unmapped_labels.get("Bogus"), Some(&2));
        // The second record has no mapped finding and therefore no diagnosis
        assert_eq!(stats.written.diagnoses_assigned, 1);
    }

    #[test]
    fn exactly_one_primary_per_diagnosed_encounter() {
        let conn = seeded_db();
        let input = vec![
            row(0, 1, "Nodule|No Finding|Mass|Hernia|Edema"),
            row(1, 1, "Cardiomegaly"),
            row(2, 1, "Bogus"),
        ];
        etl(10, true).run_extracted(&conn, Extracted::from_rows(input)).unwrap();

        let links = get_encounter_diagnoses(&conn, "NIH_00000001_000_ENC").unwrap();
        assert_eq!(links.len(), 3);
        assert_eq!(links.iter().filter(|l| l.is_primary).count(), 1);
        assert!(links[0].is_primary && links[0].diagnosis_rank == 1);

        let unlinked = get_encounter_diagnoses(&conn, "NIH_00000001_002_ENC").unwrap();
        assert!(unlinked.is_empty());
    }

    #[test]
    fn missing_hospitals_abort_before_loading() {
        let conn = open_memory_database().unwrap();
        let err = etl(10, true)
            .run_extracted(&conn, Extracted::from_rows(batch(3)))
            .unwrap_err();
        assert!(matches!(err, PipelineError::MissingReference(_)));
        assert_eq!(count_rows(&conn, "patients").unwrap(), 0);
    }

    #[test]
    fn procedure_counts_are_labelled_by_source() {
        let conn = seeded_db();
        etl(10, true).run_extracted(&conn, Extracted::from_rows(batch(3))).unwrap();
        conn.execute_batch(
            "INSERT INTO encounters (encounter_id, patient_id, facility_id, encounter_date,
                 encounter_datetime, encounter_type)
                 VALUES ('ENC0000001', 'NIH_PAT_1', 'FAC000001', '2025-01-02', '2025-01-02 10:00:00', 'Outpatient');
             INSERT INTO procedures (encounter_id, procedure_code, procedure_name, modality, procedure_datetime)
                 VALUES ('ENC0000001', 'PROC0000001', 'CT Head', 'CT', '2025-01-02 10:15:00');",
        )
        .unwrap();

        assert_eq!(
            procedure_counts_by_source(&conn).unwrap(),
            vec![("NIH Dataset".to_string(), 3), ("Synthetic Data".to_string(), 1)]
        );
    }

    #[test]
    fn simulate_reads_the_configured_file() {
        use std::io::Write;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nih_with_reports.csv");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(file, "Image Index,Finding Labels,Patient ID,Patient Age,Patient Gender,View Position,report_text").unwrap();
        writeln!(file, "00000001_000.png,Effusion,1,58,M,PA,Effusion noted.").unwrap();
        writeln!(file, "00000002_000.png,No Finding,2,33,F,AP,").unwrap();
        drop(file);

        let conn = seeded_db();
        let config = PipelineConfig {
            input_path: path,
            ..PipelineConfig::default()
        };
        let pipeline = ImagingEtl::new(config, reference_date()).unwrap();

        let history = simulate(&pipeline, &conn, 3, Duration::ZERO).unwrap();
        assert_eq!(history.len(), 3);
        assert_eq!(history[0].records_processed, 2);
        assert_eq!(history[0].written.reports_created, 1);
        assert_eq!(history[1].records_skipped, 2);
        assert_eq!(history[2].records_processed, 0);
    }
}
