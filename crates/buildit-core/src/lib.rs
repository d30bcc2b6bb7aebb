//! Core domain types and traits for BuildIt.
//!
//! This crate contains:
//! - Job, worker and target identifiers
//! - The job record and its state machine
//! - Store, queue, build environment and notifier traits
//! - Payload validation and retry helpers

pub mod clock;
pub mod error;
pub mod executor;
pub mod id;
pub mod job;
pub mod notify;
pub mod payload;
pub mod queue;
pub mod retry;
pub mod store;
pub mod target;

pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{Error, Result};
pub use id::{JobId, WorkerId};
pub use job::{
    Completion, ExpiryOutcome, FailureCause, Job, JobEvent, JobResult, JobStatus, TargetSummary,
    WorkerInfo,
};
pub use notify::Notifier;
pub use queue::JobQueue;
pub use store::JobStore;
pub use target::{Target, TargetRegistry};
