pub mod enums;

mod diagnosis;
mod encounter;
mod facility;
mod patient;
mod procedure;
mod report;

pub use diagnosis::*;
pub use encounter::*;
pub use facility::*;
pub use patient::*;
pub use procedure::*;
pub use report::*;
