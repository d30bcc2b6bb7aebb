//! Storage layer for BuildIt job dispatch.
//!
//! Provides the PostgreSQL job store and notification queue, plus
//! in-memory equivalents for tests and single-node setups.

pub mod error;
pub mod memory;
pub mod repo;

pub use error::{DbError, DbResult};
pub use memory::{MemoryJobQueue, MemoryJobStore};
pub use repo::{PgJobQueue, PgJobStore};

use buildit_core::TargetRegistry;
use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;
use std::sync::Arc;

/// Settings shared by every store implementation.
#[derive(Debug, Clone)]
pub struct StoreSettings {
    /// Targets `create` accepts.
    pub targets: TargetRegistry,
    /// Lease losses after which a job is given up as `Lost`.
    pub max_attempts: u32,
}

impl StoreSettings {
    pub fn new(targets: TargetRegistry, max_attempts: u32) -> Self {
        Self {
            targets,
            max_attempts,
        }
    }
}

/// Create a new database connection pool.
pub async fn create_pool(database_url: &str) -> DbResult<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(database_url)
        .await?;
    Ok(pool)
}

/// Run database migrations.
pub async fn run_migrations(pool: &PgPool) -> DbResult<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

/// Connect, migrate, and build the PostgreSQL store and queue on one pool.
pub async fn connect(
    database_url: &str,
    settings: StoreSettings,
) -> DbResult<(Arc<PgJobStore>, Arc<PgJobQueue>)> {
    let pool = create_pool(database_url).await?;
    run_migrations(&pool).await?;
    let store = Arc::new(PgJobStore::new(pool.clone(), settings));
    let queue = Arc::new(PgJobQueue::new(pool));
    Ok((store, queue))
}
