//! Pipeline supervision: the task table and the coordinator.
//!
//! - [`table::TaskTable`] — the encapsulated, lock-guarded task store
//! - [`coordinator::Coordinator`] — fan-out per package, per-triple merge
//!   barrier, cancellation, and report assembly

pub mod coordinator;
pub mod table;

pub use coordinator::{Coordinator, PipelineError};
pub use table::TaskTable;
