//! PostgreSQL implementations of the store and queue traits.

pub mod job;
pub mod queue;

pub use job::{JobRecord, PgJobStore};
pub use queue::PgJobQueue;
