//! Error types for the imaging ETL.
//!
//! `TransformError` is per record and never aborts a run; it is collected
//! into the run statistics. `PipelineError` is what stops a run.

use std::path::PathBuf;

use thiserror::Error;

use crate::config::ConfigError;
use crate::db::DatabaseError;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransformError {
    #[error("Row {row}: missing {field}")]
    MissingField { row: usize, field: &'static str },

    #[error("Row {row}: invalid {field} '{value}'")]
    InvalidField {
        row: usize,
        field: &'static str,
        value: String,
    },

    #[error("Row {row}: unreadable record ({reason})")]
    Unreadable { row: usize, reason: String },
}

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Input not found: {0}")]
    InputNotFound(PathBuf),

    #[error("Missing reference data: {0}")]
    MissingReference(String),

    #[error("Chunk {chunk_index} failed (last committed chunk: {last_committed_chunk:?}): {source}")]
    LoadFailed {
        chunk_index: usize,
        last_committed_chunk: Option<usize>,
        #[source]
        source: DatabaseError,
    },
}
