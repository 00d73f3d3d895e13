//! Warehouse population from the operational store.
//!
//! Steps always run in [`PopulateStep::ORDER`], each in its own
//! transaction. A failed step stops the run; steps already committed stay.
//! Every insert skips rows whose natural key is already present, so a run
//! only adds what the operational store gained since the last one.

use std::time::Instant;

use chrono::{Datelike, NaiveDate, Weekday};
use rusqlite::{params, Connection};
use serde::Serialize;
use thiserror::Error;
use uuid::Uuid;

use crate::db::repository::get_encounter_date_range;
use crate::db::sqlite::count_rows;
use crate::db::DatabaseError;

use super::mapper::{Dimension, SurrogateKeyMapper};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PopulateStep {
    DimTime,
    DimFacility,
    DimPatient,
    DimProcedure,
    DimDiagnosis,
    FactEncounters,
    BridgeEncounterProcedures,
    BridgeEncounterDiagnoses,
}

impl PopulateStep {
    pub const ORDER: [PopulateStep; 8] = [
        Self::DimTime,
        Self::DimFacility,
        Self::DimPatient,
        Self::DimProcedure,
        Self::DimDiagnosis,
        Self::FactEncounters,
        Self::BridgeEncounterProcedures,
        Self::BridgeEncounterDiagnoses,
    ];

    pub fn table(&self) -> &'static str {
        match self {
            Self::DimTime => "dim_time",
            Self::DimFacility => "dim_facility",
            Self::DimPatient => "dim_patient",
            Self::DimProcedure => "dim_procedure",
            Self::DimDiagnosis => "dim_diagnosis",
            Self::FactEncounters => "fact_encounters",
            Self::BridgeEncounterProcedures => "bridge_encounter_procedures",
            Self::BridgeEncounterDiagnoses => "bridge_encounter_diagnoses",
        }
    }

    /// Steps whose output this step joins against.
    pub fn prerequisites(&self) -> &'static [PopulateStep] {
        match self {
            Self::FactEncounters => &[Self::DimTime, Self::DimFacility, Self::DimPatient],
            Self::BridgeEncounterProcedures => &[Self::FactEncounters, Self::DimProcedure],
            Self::BridgeEncounterDiagnoses => &[Self::FactEncounters, Self::DimDiagnosis],
            _ => &[],
        }
    }

    /// Operational rows (or dates) that have no counterpart in this step's
    /// table yet.
    fn unmapped_sql(&self) -> &'static str {
        match self {
            Self::DimTime => {
                "SELECT COUNT(DISTINCT e.encounter_date) FROM encounters e
                 LEFT JOIN dim_time t ON t.full_date = e.encounter_date
                 WHERE t.date_id IS NULL"
            }
            Self::DimFacility => {
                "SELECT COUNT(*) FROM facilities f
                 LEFT JOIN dim_facility d ON d.facility_id = f.facility_id
                 WHERE d.facility_key IS NULL"
            }
            Self::DimPatient => {
                "SELECT COUNT(*) FROM patients p
                 LEFT JOIN dim_patient d ON d.patient_id = p.patient_id
                 WHERE d.patient_key IS NULL"
            }
            Self::DimProcedure => {
                "SELECT COUNT(*) FROM procedures p
                 LEFT JOIN dim_procedure d ON d.encounter_id = p.encounter_id AND d.procedure_code = p.procedure_code
                 WHERE d.procedure_key IS NULL"
            }
            Self::DimDiagnosis => {
                "SELECT COUNT(*) FROM diagnoses x
                 LEFT JOIN dim_diagnosis d ON d.diagnosis_id = x.diagnosis_id
                 WHERE d.diagnosis_key IS NULL"
            }
            Self::FactEncounters => {
                "SELECT COUNT(*) FROM encounters e
                 LEFT JOIN fact_encounters f ON f.encounter_id = e.encounter_id
                 WHERE f.encounter_key IS NULL"
            }
            Self::BridgeEncounterProcedures => {
                "SELECT COUNT(*) FROM procedures p
                 JOIN fact_encounters f ON f.encounter_id = p.encounter_id
                 JOIN dim_procedure d ON d.encounter_id = p.encounter_id AND d.procedure_code = p.procedure_code
                 LEFT JOIN bridge_encounter_procedures b
                     ON b.encounter_key = f.encounter_key AND b.procedure_key = d.procedure_key
                 WHERE b.bridge_id IS NULL"
            }
            Self::BridgeEncounterDiagnoses => {
                "SELECT COUNT(*) FROM encounter_diagnoses ed
                 JOIN fact_encounters f ON f.encounter_id = ed.encounter_id
                 JOIN dim_diagnosis d ON d.diagnosis_id = ed.diagnosis_id
                 LEFT JOIN bridge_encounter_diagnoses b
                     ON b.encounter_key = f.encounter_key AND b.diagnosis_key = d.diagnosis_key
                 WHERE b.bridge_id IS NULL"
            }
        }
    }
}

impl std::fmt::Display for PopulateStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.table())
    }
}

#[derive(Error, Debug)]
pub enum PopulateError {
    #[error("{step} cannot run: {missing} is missing rows for the operational data")]
    OrderingViolation {
        step: PopulateStep,
        missing: PopulateStep,
    },

    #[error("{step} failed: {source}")]
    Step {
        step: PopulateStep,
        #[source]
        source: DatabaseError,
    },

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),
}

#[derive(Debug, Clone, Serialize)]
pub struct StepReport {
    pub step: PopulateStep,
    pub rows_added: usize,
    pub total_rows: i64,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct PopulateReport {
    pub run_id: String,
    pub rebuilt: bool,
    pub steps: Vec<StepReport>,
    pub duration_ms: u64,
}

const FACT_ENCOUNTERS_SQL: &str = "
    INSERT INTO fact_encounters (encounter_id, patient_key, facility_key, date_id, encounter_type,
        procedure_count, diagnosis_count, report_count)
    SELECT e.encounter_id, dp.patient_key, df.facility_key, t.date_id, e.encounter_type,
        (SELECT COUNT(*) FROM procedures p WHERE p.encounter_id = e.encounter_id),
        (SELECT COUNT(*) FROM encounter_diagnoses ed WHERE ed.encounter_id = e.encounter_id),
        (SELECT COUNT(*) FROM reports r WHERE r.encounter_id = e.encounter_id)
    FROM encounters e
    JOIN dim_patient dp ON dp.patient_id = e.patient_id
    JOIN dim_facility df ON df.facility_id = e.facility_id
    JOIN dim_time t ON t.full_date = e.encounter_date
    WHERE true
    ORDER BY e.encounter_id
    ON CONFLICT (encounter_id) DO NOTHING";

const BRIDGE_PROCEDURES_SQL: &str = "
    INSERT INTO bridge_encounter_procedures (encounter_key, procedure_key)
    SELECT f.encounter_key, d.procedure_key
    FROM procedures p
    JOIN fact_encounters f ON f.encounter_id = p.encounter_id
    JOIN dim_procedure d ON d.encounter_id = p.encounter_id AND d.procedure_code = p.procedure_code
    WHERE true
    ON CONFLICT (encounter_key, procedure_key) DO NOTHING";

const BRIDGE_DIAGNOSES_SQL: &str = "
    INSERT INTO bridge_encounter_diagnoses (encounter_key, diagnosis_key, diagnosis_type, diagnosis_rank)
    SELECT f.encounter_key, d.diagnosis_key,
        CASE WHEN ed.is_primary = 1 THEN 'Primary' ELSE 'Secondary' END,
        ed.diagnosis_rank
    FROM encounter_diagnoses ed
    JOIN fact_encounters f ON f.encounter_id = ed.encounter_id
    JOIN dim_diagnosis d ON d.diagnosis_id = ed.diagnosis_id
    WHERE true
    ON CONFLICT (encounter_key, diagnosis_key) DO NOTHING";

/// Remove every warehouse row, bridges first. AUTOINCREMENT counters are
/// kept, so keys issued after a rebuild never repeat earlier ones.
pub fn clear_warehouse(conn: &Connection) -> Result<usize, DatabaseError> {
    let tx = conn.unchecked_transaction()?;
    let mut removed = 0;
    for step in PopulateStep::ORDER.iter().rev() {
        removed += tx.execute(&format!("DELETE FROM {}", step.table()), [])?;
    }
    tx.commit()?;
    tracing::info!(removed, "Warehouse cleared");
    Ok(removed)
}

pub struct WarehousePopulator<'c> {
    conn: &'c Connection,
}

impl<'c> WarehousePopulator<'c> {
    pub fn new(conn: &'c Connection) -> Self {
        Self { conn }
    }

    /// Run every step in order, optionally clearing the warehouse first.
    pub fn run(&self, rebuild: bool) -> Result<PopulateReport, PopulateError> {
        let run_id = Uuid::new_v4().to_string();
        let span = tracing::info_span!("populate", run_id = %run_id);
        let _guard = span.enter();
        let start = Instant::now();

        if rebuild {
            clear_warehouse(self.conn)?;
        }

        let mut steps = Vec::with_capacity(PopulateStep::ORDER.len());
        for step in PopulateStep::ORDER {
            steps.push(self.run_step(step)?);
        }

        let report = PopulateReport {
            run_id,
            rebuilt: rebuild,
            steps,
            duration_ms: start.elapsed().as_millis() as u64,
        };
        tracing::info!(
            added = report.steps.iter().map(|s| s.rows_added).sum::<usize>(),
            duration_ms = report.duration_ms,
            "Warehouse population complete"
        );
        Ok(report)
    }

    /// Run one step after checking that its prerequisites cover the
    /// operational data.
    pub fn run_step(&self, step: PopulateStep) -> Result<StepReport, PopulateError> {
        self.check_prerequisites(step)?;

        let start = Instant::now();
        let rows_added = self
            .execute_step(step)
            .map_err(|source| PopulateError::Step { step, source })?;
        let total_rows = count_rows(self.conn, step.table())?;

        tracing::info!(step = %step, rows_added, total_rows, "Populate step committed");
        Ok(StepReport {
            step,
            rows_added,
            total_rows,
            duration_ms: start.elapsed().as_millis() as u64,
        })
    }

    fn check_prerequisites(&self, step: PopulateStep) -> Result<(), PopulateError> {
        for missing in step.prerequisites() {
            let unmapped: i64 = self.conn.query_row(missing.unmapped_sql(), [], |row| row.get(0))
                .map_err(DatabaseError::from)?;
            if unmapped > 0 {
                tracing::error!(step = %step, missing = %missing, unmapped, "Populate ordering violated");
                return Err(PopulateError::OrderingViolation {
                    step,
                    missing: *missing,
                });
            }
        }
        Ok(())
    }

    fn execute_step(&self, step: PopulateStep) -> Result<usize, DatabaseError> {
        let tx = self.conn.unchecked_transaction()?;
        let added = {
            let mapper = SurrogateKeyMapper::new(&tx);
            match step {
                PopulateStep::DimTime => populate_dim_time(&tx)?,
                PopulateStep::DimFacility => mapper.assign(Dimension::Facility)?,
                PopulateStep::DimPatient => mapper.assign(Dimension::Patient)?,
                PopulateStep::DimProcedure => mapper.assign(Dimension::Procedure)?,
                PopulateStep::DimDiagnosis => mapper.assign(Dimension::Diagnosis)?,
                PopulateStep::FactEncounters => tx.execute(FACT_ENCOUNTERS_SQL, [])?,
                PopulateStep::BridgeEncounterProcedures => tx.execute(BRIDGE_PROCEDURES_SQL, [])?,
                PopulateStep::BridgeEncounterDiagnoses => tx.execute(BRIDGE_DIAGNOSES_SQL, [])?,
            }
        };
        tx.commit()?;
        Ok(added)
    }
}

/// Calendar rows for every day between the first and last encounter date.
fn populate_dim_time(conn: &Connection) -> Result<usize, DatabaseError> {
    let Some((first, last)) = get_encounter_date_range(conn)? else {
        tracing::warn!("No encounter dates found, dim_time left unchanged");
        return Ok(0);
    };

    let mut stmt = conn.prepare(
        "INSERT INTO dim_time (date_id, full_date, year, quarter, month, month_name, week,
         day_of_month, day_of_week, day_name, is_weekend, is_holiday, fiscal_year, fiscal_quarter)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, 0, ?12, ?13)
         ON CONFLICT (date_id) DO NOTHING",
    )?;

    let mut added = 0;
    for day in first.iter_days().take_while(|d| *d <= last) {
        let row = CalendarDay::from(day);
        added += stmt.execute(params![
            row.date_id,
            day.format("%Y-%m-%d").to_string(),
            day.year(),
            row.quarter,
            day.month(),
            day.format("%B").to_string(),
            day.iso_week().week(),
            day.day(),
            row.day_of_week,
            day.format("%A").to_string(),
            row.is_weekend,
            day.year(),
            row.quarter,
        ])?;
    }
    Ok(added)
}

struct CalendarDay {
    date_id: i64,
    quarter: u32,
    /// Monday = 1 … Sunday = 7
    day_of_week: u32,
    is_weekend: bool,
}

impl From<NaiveDate> for CalendarDay {
    fn from(day: NaiveDate) -> Self {
        Self {
            date_id: i64::from(day.year()) * 10_000 + i64::from(day.month()) * 100 + i64::from(day.day()),
            quarter: (day.month() - 1) / 3 + 1,
            day_of_week: day.weekday().number_from_monday(),
            is_weekend: matches!(day.weekday(), Weekday::Sat | Weekday::Sun),
        }
    }
}
