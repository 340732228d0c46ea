//! Reconciliation pipeline.
//!
//! - `Engine`: stage transitions, batch reconciliation, re-drive
//! - `build_engine`: wiring from `Config`
//! - reports returned by ingest, run and status

mod engine;
mod guard;
mod report;
mod retry;
mod setup;

pub use engine::{Engine, EngineSettings};
pub use guard::IdentityLocks;
pub use report::{FailedRecord, IngestReport, Observation, RecordOutcome, RunReport, StatusReport};
pub use retry::{RetryPolicy, with_timeout};
pub use setup::{build_engine, open_store};
