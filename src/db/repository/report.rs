use std::str::FromStr;

use chrono::NaiveDateTime;
use rusqlite::{params, Connection};

use crate::db::DatabaseError;
use crate::models::enums::*;
use crate::models::*;

use super::DATETIME_FMT;

pub fn insert_report(conn: &Connection, report: &Report) -> Result<bool, DatabaseError> {
    let changed = conn.execute(
        "INSERT INTO reports (report_id, encounter_id, report_type, report_status, report_text,
         findings, impression, recommendations, dictated_datetime, signed_datetime)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
         ON CONFLICT (report_id) DO NOTHING",
        params![
            report.report_id,
            report.encounter_id,
            report.report_type.as_str(),
            report.report_status.as_str(),
            report.report_text,
            report.findings,
            report.impression,
            report.recommendations,
            report.dictated_datetime.format(DATETIME_FMT).to_string(),
            report.signed_datetime.map(|d| d.format(DATETIME_FMT).to_string()),
        ],
    )?;
    Ok(changed > 0)
}

pub fn get_reports_for_encounter(
    conn: &Connection,
    encounter_id: &str,
) -> Result<Vec<Report>, DatabaseError> {
    let mut stmt = conn.prepare(
        "SELECT report_id, encounter_id, report_type, report_status, report_text, findings,
         impression, recommendations, dictated_datetime, signed_datetime
         FROM reports WHERE encounter_id = ?1 ORDER BY dictated_datetime",
    )?;

    let rows = stmt.query_map(params![encounter_id], |row| {
        Ok((
            row.get::<_, String>(0)?,
            row.get::<_, String>(1)?,
            row.get::<_, String>(2)?,
            row.get::<_, String>(3)?,
            row.get::<_, String>(4)?,
            row.get::<_, Option<String>>(5)?,
            row.get::<_, Option<String>>(6)?,
            row.get::<_, Option<String>>(7)?,
            row.get::<_, String>(8)?,
            row.get::<_, Option<String>>(9)?,
        ))
    })?;

    let parse = |id: &str, s: &str| {
        NaiveDateTime::parse_from_str(s, DATETIME_FMT)
            .map_err(|e| DatabaseError::ConstraintViolation(format!("{id}: {e}")))
    };

    let mut reports = Vec::new();
    for row in rows {
        let (id, encounter_id, rtype, status, text, findings, impression, recs, dictated, signed) = row?;
        reports.push(Report {
            dictated_datetime: parse(&id, &dictated)?,
            signed_datetime: signed.as_deref().map(|s| parse(&id, s)).transpose()?,
            report_type: ReportType::from_str(&rtype)?,
            report_status: ReportStatus::from_str(&status)?,
            report_id: id,
            encounter_id,
            report_text: text,
            findings,
            impression,
            recommendations: recs,
        });
    }
    Ok(reports)
}
