//! Warehouse QA battery.
//!
//! Every check is read-only and runs with `PRAGMA query_only` switched on.
//! Findings are reported, never raised: a failing or erroring check does
//! not stop the battery and does not change the process exit status.

use std::fmt::Write as _;
use std::path::Path;
use std::time::Instant;

use rusqlite::types::ValueRef;
use rusqlite::Connection;
use serde::Serialize;
use uuid::Uuid;

use crate::db::DatabaseError;
use crate::models::enums::{
    AgeGroup, DiagnosisType, EncounterType, FacilityType, Gender, Laterality, Modality,
    ReportStatus, ReportType, Severity,
};

use super::mapper::{find_derivation_collisions, Dimension};

/// Sample rows kept per failing check.
pub const SAMPLE_LIMIT: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CheckStatus {
    Pass,
    Fail,
    Error,
}

impl CheckStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pass => "PASS",
            Self::Fail => "FAIL",
            Self::Error => "ERROR",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckKind {
    Violation,
    Reconciliation,
}

#[derive(Debug, Clone, Serialize)]
pub struct CheckResult {
    pub id: u32,
    pub name: String,
    pub kind: CheckKind,
    pub status: CheckStatus,
    /// Violating rows, or the absolute count difference for reconciliations.
    pub violations: i64,
    pub columns: Vec<String>,
    pub samples: Vec<Vec<String>>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct QaReport {
    pub run_id: String,
    pub checks: Vec<CheckResult>,
    pub duration_ms: u64,
}

impl QaReport {
    pub fn count(&self, status: CheckStatus) -> usize {
        self.checks.iter().filter(|c| c.status == status).count()
    }

    pub fn all_passed(&self) -> bool {
        self.checks.iter().all(|c| c.status == CheckStatus::Pass)
    }

    pub fn to_markdown(&self) -> String {
        let mut md = String::from("# Warehouse QA Results\n\n");
        let _ = writeln!(
            md,
            "{} checks: {} passed, {} failed, {} errored.\n",
            self.checks.len(),
            self.count(CheckStatus::Pass),
            self.count(CheckStatus::Fail),
            self.count(CheckStatus::Error),
        );

        for check in &self.checks {
            let _ = writeln!(md, "## {}. {} ({})\n", check.id, check.name, check.status.as_str());
            if let Some(err) = &check.error {
                let _ = writeln!(md, "`{err}`\n");
            } else if check.samples.is_empty() {
                md.push_str("_No rows returned, OK_\n\n");
            } else {
                let _ = writeln!(md, "| {} |", check.columns.join(" | "));
                let _ = writeln!(
                    md,
                    "|{}|",
                    check.columns.iter().map(|c| format!(":{}", "-".repeat(c.len().max(3)))).collect::<Vec<_>>().join("|")
                );
                for row in &check.samples {
                    let _ = writeln!(md, "| {} |", row.join(" | "));
                }
                md.push('\n');
            }
        }
        md
    }

    /// Write [`QaReport::to_markdown`] to `path`, creating parent directories.
    pub fn write_summary(&self, path: &Path) -> std::io::Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        std::fs::write(path, self.to_markdown())
    }
}

/// A check expressed as a query returning the violating rows.
struct ViolationQuery {
    name: &'static str,
    sql: String,
}

/// Operational vs warehouse row counts; `multiplier` warehouse rows are
/// expected per operational row.
struct Reconciliation {
    name: &'static str,
    source: &'static str,
    target: &'static str,
    multiplier: i64,
}

fn not_in(table: &str, column: &str, allowed: String) -> String {
    format!(
        "SELECT '{table}.{column}' AS field, {column} AS value FROM {table}
         WHERE {column} NOT IN ({allowed})"
    )
}

fn violation_queries() -> Vec<ViolationQuery> {
    let invalid_enums = [
        not_in("facilities", "facility_type", FacilityType::sql_list()),
        not_in("patients", "gender", Gender::sql_list()),
        not_in("encounters", "encounter_type", EncounterType::sql_list()),
        not_in("procedures", "modality", Modality::sql_list()),
        not_in("procedures", "laterality", Laterality::sql_list()),
        not_in("diagnoses", "severity", Severity::sql_list()),
        not_in("reports", "report_type", ReportType::sql_list()),
        not_in("reports", "report_status", ReportStatus::sql_list()),
        not_in("dim_patient", "age_group", AgeGroup::sql_list()),
        not_in("bridge_encounter_diagnoses", "diagnosis_type", DiagnosisType::sql_list()),
    ]
    .join(" UNION ALL ");

    vec![
        // 1. Duplicate natural keys in dimensions and fact
        ViolationQuery {
            name: "Duplicate patient ids in dim_patient",
            sql: "SELECT patient_id, COUNT(*) AS n FROM dim_patient GROUP BY patient_id HAVING COUNT(*) > 1".into(),
        },
        ViolationQuery {
            name: "Duplicate encounter ids in fact_encounters",
            sql: "SELECT encounter_id, COUNT(*) AS n FROM fact_encounters GROUP BY encounter_id HAVING COUNT(*) > 1".into(),
        },
        ViolationQuery {
            name: "Duplicate procedure keys in dim_procedure",
            sql: "SELECT encounter_id, procedure_code, COUNT(*) AS n FROM dim_procedure
                  GROUP BY encounter_id, procedure_code HAVING COUNT(*) > 1".into(),
        },
        ViolationQuery {
            name: "Duplicate diagnosis ids in dim_diagnosis",
            sql: "SELECT diagnosis_id, COUNT(*) AS n FROM dim_diagnosis GROUP BY diagnosis_id HAVING COUNT(*) > 1".into(),
        },
        // 2. Orphaned foreign keys in fact and bridges
        ViolationQuery {
            name: "Fact rows without a patient",
            sql: "SELECT f.encounter_id, f.patient_key FROM fact_encounters f
                  LEFT JOIN dim_patient d ON d.patient_key = f.patient_key
                  WHERE d.patient_key IS NULL".into(),
        },
        ViolationQuery {
            name: "Fact rows without a facility",
            sql: "SELECT f.encounter_id, f.facility_key FROM fact_encounters f
                  LEFT JOIN dim_facility d ON d.facility_key = f.facility_key
                  WHERE d.facility_key IS NULL".into(),
        },
        ViolationQuery {
            name: "Fact rows without a calendar date",
            sql: "SELECT f.encounter_id, f.date_id FROM fact_encounters f
                  LEFT JOIN dim_time t ON t.date_id = f.date_id
                  WHERE t.date_id IS NULL".into(),
        },
        ViolationQuery {
            name: "Orphan rows in bridge_encounter_procedures",
            sql: "SELECT b.encounter_key, b.procedure_key FROM bridge_encounter_procedures b
                  LEFT JOIN fact_encounters f ON f.encounter_key = b.encounter_key
                  LEFT JOIN dim_procedure d ON d.procedure_key = b.procedure_key
                  WHERE f.encounter_key IS NULL OR d.procedure_key IS NULL".into(),
        },
        ViolationQuery {
            name: "Orphan rows in bridge_encounter_diagnoses",
            sql: "SELECT b.encounter_key, b.diagnosis_key FROM bridge_encounter_diagnoses b
                  LEFT JOIN fact_encounters f ON f.encounter_key = b.encounter_key
                  LEFT JOIN dim_diagnosis d ON d.diagnosis_key = b.diagnosis_key
                  WHERE f.encounter_key IS NULL OR d.diagnosis_key IS NULL".into(),
        },
        // 3. Missing required fields
        ViolationQuery {
            name: "Patients missing demographics",
            sql: "SELECT patient_id, age, sex, age_group FROM dim_patient
                  WHERE age IS NULL OR sex IS NULL OR age_group IS NULL".into(),
        },
        ViolationQuery {
            name: "Encounters missing dates",
            sql: "SELECT encounter_id, encounter_date FROM encounters
                  WHERE encounter_date IS NULL OR encounter_date = ''".into(),
        },
        // 4. Enumerated values outside the allowed sets
        ViolationQuery {
            name: "Invalid enumerated values",
            sql: invalid_enums,
        },
        // 5. Exactly one primary diagnosis per diagnosed encounter
        ViolationQuery {
            name: "Encounters without exactly one primary diagnosis",
            sql: "SELECT encounter_id, SUM(is_primary) AS primaries FROM encounter_diagnoses
                  GROUP BY encounter_id HAVING SUM(is_primary) <> 1".into(),
        },
        ViolationQuery {
            name: "Fact encounters without exactly one primary bridge row",
            sql: "SELECT encounter_key, SUM(diagnosis_type = 'Primary') AS primaries
                  FROM bridge_encounter_diagnoses
                  GROUP BY encounter_key HAVING SUM(diagnosis_type = 'Primary') <> 1".into(),
        },
    ]
}

fn reconciliations() -> [Reconciliation; 7] {
    [
        Reconciliation { name: "patients vs dim_patient", source: "patients", target: "dim_patient", multiplier: 1 },
        Reconciliation { name: "facilities vs dim_facility", source: "facilities", target: "dim_facility", multiplier: 1 },
        Reconciliation { name: "diagnoses vs dim_diagnosis", source: "diagnoses", target: "dim_diagnosis", multiplier: 1 },
        Reconciliation { name: "procedures vs dim_procedure", source: "procedures", target: "dim_procedure", multiplier: 1 },
        Reconciliation { name: "encounters vs fact_encounters", source: "encounters", target: "fact_encounters", multiplier: 1 },
        Reconciliation {
            name: "procedures vs bridge_encounter_procedures",
            source: "procedures",
            target: "bridge_encounter_procedures",
            multiplier: 1,
        },
        Reconciliation {
            name: "encounter_diagnoses vs bridge_encounter_diagnoses",
            source: "encounter_diagnoses",
            target: "bridge_encounter_diagnoses",
            multiplier: 1,
        },
    ]
}

/// Run the full battery. Only failing to toggle `query_only` is an error.
pub fn run_qa(conn: &Connection) -> Result<QaReport, DatabaseError> {
    let run_id = Uuid::new_v4().to_string();
    let span = tracing::info_span!("qa", run_id = %run_id);
    let _guard = span.enter();
    let start = Instant::now();

    let previous: bool = conn.query_row("PRAGMA query_only", [], |row| row.get::<_, i64>(0))? != 0;
    conn.pragma_update(None, "query_only", true)?;

    let checks = run_checks(conn);

    conn.pragma_update(None, "query_only", previous)?;

    let report = QaReport {
        run_id,
        checks,
        duration_ms: start.elapsed().as_millis() as u64,
    };
    tracing::info!(
        passed = report.count(CheckStatus::Pass),
        failed = report.count(CheckStatus::Fail),
        errored = report.count(CheckStatus::Error),
        "QA battery complete"
    );
    for check in report.checks.iter().filter(|c| c.status != CheckStatus::Pass) {
        tracing::warn!(id = check.id, check = %check.name, status = check.status.as_str(), violations = check.violations, "QA finding");
    }
    Ok(report)
}

fn run_checks(conn: &Connection) -> Vec<CheckResult> {
    let mut checks = Vec::new();
    let mut next_id = 1u32;
    let mut id = || {
        let current = next_id;
        next_id += 1;
        current
    };

    for query in violation_queries() {
        checks.push(run_violation(conn, id(), query.name, &query.sql));
    }
    checks.push(run_collision_check(conn, id()));
    for rec in reconciliations() {
        checks.push(run_reconciliation(conn, id(), &rec));
    }
    checks
}

fn run_violation(conn: &Connection, id: u32, name: &str, sql: &str) -> CheckResult {
    let outcome = (|| -> Result<(i64, Vec<String>, Vec<Vec<String>>), DatabaseError> {
        let total: i64 = conn.query_row(&format!("SELECT COUNT(*) FROM ({sql})"), [], |r| r.get(0))?;
        let mut stmt = conn.prepare(&format!("{sql} LIMIT {SAMPLE_LIMIT}"))?;
        let columns: Vec<String> = stmt.column_names().into_iter().map(String::from).collect();
        let width = columns.len();
        let samples = stmt
            .query_map([], |row| {
                (0..width)
                    .map(|i| row.get_ref(i).map(render_value))
                    .collect::<Result<Vec<_>, _>>()
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok((total, columns, samples))
    })();

    match outcome {
        Ok((violations, columns, samples)) => CheckResult {
            id,
            name: name.into(),
            kind: CheckKind::Violation,
            status: if violations == 0 { CheckStatus::Pass } else { CheckStatus::Fail },
            violations,
            columns,
            samples,
            error: None,
        },
        Err(e) => errored(id, name, CheckKind::Violation, e),
    }
}

fn run_collision_check(conn: &Connection, id: u32) -> CheckResult {
    let name = "Natural keys colliding under digit-stripping";
    let mut collisions = Vec::new();
    for dim in [Dimension::Patient, Dimension::Facility, Dimension::Diagnosis] {
        match find_derivation_collisions(conn, dim) {
            Ok(found) => collisions.extend(found.into_iter().map(|c| (dim, c))),
            Err(e) => return errored(id, name, CheckKind::Violation, e),
        }
    }

    let samples = collisions
        .iter()
        .take(SAMPLE_LIMIT)
        .map(|(dim, c)| vec![dim.table().to_string(), c.derived.to_string(), c.natural_keys.join(", ")])
        .collect();
    CheckResult {
        id,
        name: name.into(),
        kind: CheckKind::Violation,
        status: if collisions.is_empty() { CheckStatus::Pass } else { CheckStatus::Fail },
        violations: collisions.len() as i64,
        columns: vec!["dimension".into(), "derived".into(), "natural_keys".into()],
        samples,
        error: None,
    }
}

fn run_reconciliation(conn: &Connection, id: u32, rec: &Reconciliation) -> CheckResult {
    let counts = (|| -> Result<(i64, i64), DatabaseError> {
        let source = conn.query_row(&format!("SELECT COUNT(*) FROM {}", rec.source), [], |r| r.get(0))?;
        let target = conn.query_row(&format!("SELECT COUNT(*) FROM {}", rec.target), [], |r| r.get(0))?;
        Ok((source, target))
    })();

    match counts {
        Ok((source, target)) => {
            let expected = source * rec.multiplier;
            let diff = (target - expected).abs();
            CheckResult {
                id,
                name: format!("Reconcile {}", rec.name),
                kind: CheckKind::Reconciliation,
                status: if diff == 0 { CheckStatus::Pass } else { CheckStatus::Fail },
                violations: diff,
                columns: vec!["source".into(), "target".into(), "expected".into(), "actual".into()],
                samples: vec![vec![
                    rec.source.into(),
                    rec.target.into(),
                    expected.to_string(),
                    target.to_string(),
                ]],
                error: None,
            }
        }
        Err(e) => errored(id, &format!("Reconcile {}", rec.name), CheckKind::Reconciliation, e),
    }
}

fn errored(id: u32, name: &str, kind: CheckKind, err: DatabaseError) -> CheckResult {
    CheckResult {
        id,
        name: name.into(),
        kind,
        status: CheckStatus::Error,
        violations: 0,
        columns: Vec::new(),
        samples: Vec::new(),
        error: Some(err.to_string()),
    }
}

fn render_value(value: ValueRef<'_>) -> String {
    match value {
        ValueRef::Null => "NULL".into(),
        ValueRef::Integer(i) => i.to_string(),
        ValueRef::Real(f) => f.to_string(),
        ValueRef::Text(t) => String::from_utf8_lossy(t).into_owned(),
        ValueRef::Blob(b) => format!("<{} bytes>", b.len()),
    }
}
