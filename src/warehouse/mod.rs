//! Star-schema warehouse: surrogate keys, ordered population and QA.

pub mod mapper;
pub mod populate;
pub mod qa;

pub use mapper::{Dimension, DimensionKey, SurrogateKeyMapper};
pub use populate::{PopulateError, PopulateReport, PopulateStep, WarehousePopulator};
pub use qa::{run_qa, CheckStatus, QaReport};
