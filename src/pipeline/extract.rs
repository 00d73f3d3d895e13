use std::io::Read;
use std::path::Path;

use super::error::{PipelineError, TransformError};
use super::types::{SourceRow, KNOWN_COLUMNS};

/// Raw rows read from the imaging extract.
#[derive(Debug, Default)]
pub struct Extracted {
    /// (1-based data row, row)
    pub rows: Vec<(usize, SourceRow)>,
    /// Rows the CSV reader could not decode.
    pub errors: Vec<TransformError>,
    /// Header columns that are not carried into the pipeline.
    pub dropped_columns: Vec<String>,
}

impl Extracted {
    pub fn from_rows(rows: Vec<SourceRow>) -> Self {
        Self {
            rows: rows.into_iter().enumerate().map(|(i, r)| (i + 1, r)).collect(),
            ..Self::default()
        }
    }

    pub fn len(&self) -> usize {
        self.rows.len() + self.errors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

pub fn read_source(path: &Path) -> Result<Extracted, PipelineError> {
    if !path.exists() {
        return Err(PipelineError::InputNotFound(path.to_path_buf()));
    }
    let file = std::fs::File::open(path)?;
    let extracted = read_from(file)?;
    tracing::info!(path = %path.display(), rows = extracted.len(), "Extracted imaging records");
    Ok(extracted)
}

pub fn read_from<R: Read>(reader: R) -> Result<Extracted, PipelineError> {
    let mut rdr = csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .flexible(true)
        .from_reader(reader);

    let headers = rdr.headers()?.clone();
    let dropped_columns: Vec<String> = headers
        .iter()
        .filter(|h| !KNOWN_COLUMNS.contains(h))
        .map(String::from)
        .collect();
    if !dropped_columns.is_empty() {
        tracing::info!(columns = ?dropped_columns, "Dropping columns not used by the pipeline");
    }
    if !headers.iter().any(|h| h == "Image Index") {
        tracing::warn!("Extract has no 'Image Index' column; every row will be rejected");
    }

    let mut extracted = Extracted {
        dropped_columns,
        ..Extracted::default()
    };

    for (i, result) in rdr.deserialize::<SourceRow>().enumerate() {
        let row = i + 1;
        match result {
            Ok(source) => extracted.rows.push((row, source)),
            Err(e) => extracted.errors.push(TransformError::Unreadable {
                row,
                reason: e.to_string(),
            }),
        }
    }

    Ok(extracted)
}
