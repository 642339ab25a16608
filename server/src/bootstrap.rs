//! Wires the production backends from configuration.
//!
//! PostgreSQL holds the ledger and policies, Redis the counter, lock and outcomes,
//! Redpanda the issuance queue.

use crate::config::Config;
use reservation_core::environment::SystemClock;
use reservation_core::queue::QueueError;
use reservation_postgres::{PostgresLedger, PostgresPolicyStore};
use reservation_redis::{RedisLock, RedisQuantityCache, RedisResultStore};
use reservation_redpanda::RedpandaIssuanceQueue;
use reservation_runtime::Backends;
use std::sync::Arc;
use thiserror::Error;
use tracing::info;

/// A backend could not be brought up.
#[derive(Error, Debug)]
pub enum BootstrapError {
    /// `PostgreSQL` connection failed
    #[error("postgres: {0}")]
    Postgres(#[from] sqlx::Error),

    /// Schema migration failed
    #[error("migration: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    /// Redis connection failed
    #[error("redis: {0}")]
    Redis(#[from] redis::RedisError),

    /// Producer creation failed
    #[error("redpanda: {0}")]
    Redpanda(#[from] QueueError),
}

/// Connect every backend and apply migrations.
///
/// # Errors
///
/// Returns [`BootstrapError`] naming the first backend that failed.
pub async fn connect_backends(config: &Config) -> Result<Backends, BootstrapError> {
    let pool =
        reservation_postgres::connect(&config.postgres.url, config.postgres.max_connections)
            .await?;
    reservation_postgres::migrate(&pool).await?;
    info!("Database migrations applied");

    let redis = reservation_redis::connect(&config.redis.url).await?;

    let queue = RedpandaIssuanceQueue::builder()
        .brokers(&config.redpanda.brokers)
        .topic(&config.redpanda.topic)
        .consumer_group(&config.redpanda.consumer_group)
        .build()?;

    Ok(Backends {
        policies: Arc::new(PostgresPolicyStore::new(pool.clone())),
        counter: Arc::new(RedisQuantityCache::new(redis.clone())),
        lock: Arc::new(RedisLock::new(redis.clone())),
        queue: Arc::new(queue),
        results: Arc::new(RedisResultStore::new(redis)),
        ledger: Arc::new(PostgresLedger::new(pool)),
        clock: Arc::new(SystemClock),
    })
}
