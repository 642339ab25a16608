//! # Reservation Redis
//!
//! Redis implementations of the engine's shared coordination state:
//!
//! - [`RedisQuantityCache`]: per-policy counter, atomic via Lua (`DECRBY` only on an existing key)
//! - [`RedisLock`]: `SET NX PX` lock with compare-and-delete release
//! - [`RedisResultStore`]: JSON outcome records with write-once terminal states
//!
//! All three share one [`ConnectionManager`], which reconnects on its own and is cheap
//! to clone per call.
//!
//! ## Example
//!
//! ```no_run
//! use reservation_redis::{RedisLock, RedisQuantityCache, RedisResultStore, connect};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let conn = connect("redis://127.0.0.1:6379").await?;
//! let counter = RedisQuantityCache::new(conn.clone());
//! let lock = RedisLock::new(conn.clone());
//! let results = RedisResultStore::new(conn);
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

mod counter;
mod lock;
mod outcome;

pub use counter::RedisQuantityCache;
pub use lock::RedisLock;
pub use outcome::RedisResultStore;
pub use redis::aio::ConnectionManager;

use redis::{Client, RedisError};
use std::time::Duration;

/// Open a managed connection.
///
/// # Errors
///
/// Returns [`RedisError`] if the URL is invalid or the server is unreachable.
pub async fn connect(redis_url: &str) -> Result<ConnectionManager, RedisError> {
    let client = Client::open(redis_url)?;
    let conn = ConnectionManager::new(client).await?;
    tracing::info!(url = %redis_url, "Connected to Redis");
    Ok(conn)
}

/// Milliseconds for `PX`, never zero (Redis rejects a zero expiry).
#[allow(clippy::cast_possible_truncation)] // Leases and TTLs are far below u64::MAX ms
fn expiry_millis(duration: Duration) -> u64 {
    (duration.as_millis() as u64).max(1)
}

/// Whether an error means the server could not be reached at all.
fn is_unreachable(error: &RedisError) -> bool {
    error.is_io_error() || error.is_connection_refusal() || error.is_connection_dropped()
}
