//! `PostgreSQL` ledger and policy store for the reservation engine.
//!
//! This crate provides the durable side of the engine:
//!
//! - [`PostgresLedger`]: the [`PersistentLedger`](reservation_core::ledger::PersistentLedger),
//!   with `(policy_id, request_id)` uniqueness enforced by the schema
//! - [`PostgresPolicyStore`]: the [`PolicyStore`](reservation_core::policy::PolicyStore)
//!
//! Queries are built at runtime with `sqlx::query` so the crate compiles without a
//! live database.
//!
//! # Example
//!
//! ```no_run
//! use reservation_postgres::{PostgresLedger, PostgresPolicyStore, connect, migrate};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let pool = connect("postgres://localhost/reservations", 10).await?;
//! migrate(&pool).await?;
//!
//! let ledger = PostgresLedger::new(pool.clone());
//! let policies = PostgresPolicyStore::new(pool);
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

mod ledger;
mod policy;

pub use ledger::PostgresLedger;
pub use policy::PostgresPolicyStore;
pub use sqlx::PgPool;

use sqlx::postgres::PgPoolOptions;
use std::time::Duration;

/// Open a connection pool.
///
/// # Errors
///
/// Returns the `sqlx` error if no connection can be established.
pub async fn connect(database_url: &str, max_connections: u32) -> Result<PgPool, sqlx::Error> {
    let pool = PgPoolOptions::new()
        .max_connections(max_connections)
        .acquire_timeout(Duration::from_secs(5))
        .connect(database_url)
        .await?;
    tracing::info!(max_connections, "PostgreSQL pool connected");
    Ok(pool)
}

/// Apply the embedded schema migrations.
///
/// # Errors
///
/// Returns the migration error if a migration fails to apply.
pub async fn migrate(pool: &PgPool) -> Result<(), sqlx::migrate::MigrateError> {
    sqlx::migrate!("./migrations").run(pool).await
}

/// Whether a `sqlx` error means the database could not be reached at all.
pub(crate) const fn is_unreachable(error: &sqlx::Error) -> bool {
    matches!(
        error,
        sqlx::Error::Io(_)
            | sqlx::Error::Tls(_)
            | sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::WorkerCrashed
    )
}
