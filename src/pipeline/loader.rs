//! Chunked insert-or-skip loader.
//!
//! Generic over the record (anything with a natural key) and over the
//! writer that turns one chunk into rows. The loader owns the parts that
//! must not vary between entities: pre-filtering against the existing-key
//! snapshot, input-order chunking, one transaction per chunk and the
//! partial-failure contract.

use std::collections::HashSet;
use std::ops::AddAssign;
use std::time::Instant;

use rusqlite::Connection;
use serde::Serialize;

use crate::config::ConfigError;
use crate::db::DatabaseError;

use super::error::PipelineError;
use super::existing::ExistingKeys;

/// A record the loader can deduplicate.
pub trait NaturalKey {
    fn natural_key(&self) -> &str;
}

/// What a writer reports for one committed chunk.
pub trait Tally: Default + AddAssign {
    fn rows_written(&self) -> usize;
}

impl Tally for usize {
    fn rows_written(&self) -> usize {
        *self
    }
}

/// Writes one chunk inside the transaction the loader opened.
///
/// Each row must be written as "insert, skip on natural-key conflict". Any
/// error rolls the whole chunk back.
pub trait ChunkWriter<R> {
    type Tally: Tally;

    fn write_chunk(&self, conn: &Connection, chunk: &[R]) -> Result<Self::Tally, DatabaseError>;
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct LoadReport<T> {
    /// New records handed to the writer.
    pub records_processed: usize,
    /// Records already stored, or repeated earlier in the same input.
    pub records_skipped: usize,
    pub chunks_committed: usize,
    pub rows_written: usize,
    pub tally: T,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, Copy)]
pub struct BatchLoader {
    batch_size: usize,
}

impl BatchLoader {
    pub fn new(batch_size: usize) -> Result<Self, ConfigError> {
        if batch_size == 0 {
            return Err(ConfigError::InvalidValue {
                key: crate::config::ENV_BATCH_SIZE,
                value: "0".into(),
                reason: "batch size must be at least 1".into(),
            });
        }
        Ok(Self { batch_size })
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Drop records whose key is in `existing` or was already seen earlier
    /// in `records`. Order is preserved. Returns the survivors and the
    /// number dropped.
    pub fn filter_new<R: NaturalKey>(records: Vec<R>, existing: &ExistingKeys) -> (Vec<R>, usize) {
        let total = records.len();
        let mut seen = HashSet::with_capacity(total);
        let fresh: Vec<R> = records
            .into_iter()
            .filter(|r| {
                let key = r.natural_key();
                !existing.contains(key) && seen.insert(key.to_string())
            })
            .collect();
        let skipped = total - fresh.len();
        (fresh, skipped)
    }

    /// Load `records` chunk by chunk. Chunks committed before a failure stay
    /// committed; the failing chunk is rolled back and reported.
    pub fn load<R, W>(
        &self,
        conn: &Connection,
        records: Vec<R>,
        existing: &ExistingKeys,
        writer: &W,
    ) -> Result<LoadReport<W::Tally>, PipelineError>
    where
        R: NaturalKey,
        W: ChunkWriter<R>,
    {
        let start = Instant::now();
        let (fresh, skipped) = Self::filter_new(records, existing);

        let mut report = LoadReport {
            records_processed: fresh.len(),
            records_skipped: skipped,
            ..LoadReport::default()
        };

        let total_chunks = fresh.len().div_ceil(self.batch_size);
        let mut last_committed: Option<usize> = None;

        for (chunk_index, chunk) in fresh.chunks(self.batch_size).enumerate() {
            let tally = match write_in_transaction(conn, writer, chunk) {
                Ok(tally) => tally,
                Err(err) if err.is_busy() => {
                    tracing::warn!(chunk_index, error = %err, "Chunk hit a locked database, retrying once");
                    write_in_transaction(conn, writer, chunk).map_err(|source| {
                        PipelineError::LoadFailed {
                            chunk_index,
                            last_committed_chunk: last_committed,
                            source,
                        }
                    })?
                }
                Err(source) => {
                    tracing::error!(
                        chunk_index,
                        last_committed_chunk = ?last_committed,
                        error = %source,
                        "Chunk rolled back"
                    );
                    return Err(PipelineError::LoadFailed {
                        chunk_index,
                        last_committed_chunk: last_committed,
                        source,
                    });
                }
            };

            tracing::debug!(
                chunk = chunk_index + 1,
                total_chunks,
                records = chunk.len(),
                rows = tally.rows_written(),
                "Chunk committed"
            );
            report.rows_written += tally.rows_written();
            report.tally += tally;
            report.chunks_committed += 1;
            last_committed = Some(chunk_index);
        }

        report.duration_ms = start.elapsed().as_millis() as u64;
        Ok(report)
    }
}

fn write_in_transaction<R, W>(conn: &Connection, writer: &W, chunk: &[R]) -> Result<W::Tally, DatabaseError>
where
    W: ChunkWriter<R>,
{
    let tx = conn.unchecked_transaction()?;
    let tally = writer.write_chunk(&tx, chunk)?;
    tx.commit()?;
    Ok(tally)
}
