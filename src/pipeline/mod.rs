pub mod coordinator;
pub mod summary;

pub use coordinator::{stream_name, Coordinator, RunError, RunOutcome, RunPhase};
pub use summary::{PassSummary, RunSummary};
