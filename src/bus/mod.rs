//! The bus worker and the shared line it owns.

pub mod arbiter;
pub mod line;

pub use arbiter::{BusArbiter, PollStep, POLL_SEQUENCE};
pub use line::{BusOwnership, SharedLine};
