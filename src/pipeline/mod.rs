//! Imaging ETL.
//!
//! Extract (CSV) → normalize into typed records with natural keys → drop
//! keys already stored → load in chunked insert-or-skip transactions.

pub mod error;
pub mod existing;
pub mod extract;
pub mod imaging;
pub mod loader;
pub mod normalize;
pub mod reference;
pub mod types;

pub use error::{PipelineError, TransformError};
pub use existing::ExistingKeys;
pub use imaging::{procedure_counts_by_source, simulate, ImagingEtl};
pub use loader::{BatchLoader, ChunkWriter, LoadReport, NaturalKey};
pub use types::{ImagingRecord, IngestStats, SourceRow};
