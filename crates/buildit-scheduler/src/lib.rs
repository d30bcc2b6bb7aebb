//! Job dispatch and worker coordination for BuildIt.
//!
//! - [`Dispatcher`]: validates submissions, creates jobs, publishes them
//! - [`WorkerAgent`]: claims jobs for one target, runs and heartbeats them
//! - [`LeaseMonitor`]: requeues jobs whose worker went silent
//! - [`NotificationRelay`]: delivers terminal job events to front-ends

pub mod dispatcher;
pub mod lease_monitor;
pub mod notify;
pub mod shutdown;
pub mod worker;

pub use dispatcher::{Dispatcher, FleetStatus, Submitted};
pub use lease_monitor::{LeaseMonitor, ScanReport};
pub use notify::{LogNotifier, NotificationRelay, WebhookNotifier};
pub use shutdown::install_shutdown_handler;
pub use worker::{AgentConfig, JobOutcome, WorkerAgent};
