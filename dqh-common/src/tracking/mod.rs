//! Lifecycle trackers over the bookkeeping tables
//!
//! Every call threads its run identifiers explicitly; there is no ambient
//! "current run".

mod audit_log;
mod batch_status;
mod validation_run;

pub use audit_log::AuditLog;
pub use batch_status::BatchStatusTracker;
pub use validation_run::{CounterDrift, ValidationRunTracker};
