//! Shared state store abstraction.
//!
//! The limiter needs two things from the store: hash-like field access for
//! the bucket record, and two atomic conditional operations for the lease
//! that serializes access to it. Anything offering those (a Redis server, or
//! an in-process map for tests) can back a fleet of limiters.

mod memory;
mod remote;
mod state;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::info;

use crate::config::{StoreBackend, StoreConfig};
use crate::error::Result;

pub use memory::MemoryStore;
pub use remote::RedisStore;
pub use state::{LimiterState, MAX_PERMITS, NEXT_FREE_TICKET_MICROS, STORED_PERMITS};

/// Key-value service holding limiter records and lock leases.
///
/// None of the field operations are transactional; callers serialize
/// read-modify-write sequences through the lease operations.
#[async_trait]
pub trait StateStore: Send + Sync + 'static {
    /// Read the given fields of a hash. Missing fields come back as `None`.
    async fn hash_get(&self, key: &str, fields: &[&str]) -> Result<Vec<Option<String>>>;

    /// Write the given fields of a hash, creating it if needed.
    async fn hash_set(&self, key: &str, entries: &[(&str, String)]) -> Result<()>;

    /// Atomically set `key = value` with expiry `lease`, only if `key` is
    /// absent. Returns whether the value was set.
    async fn set_if_absent(&self, key: &str, value: &str, lease: Duration) -> Result<bool>;

    /// Atomically delete `key` only if its value equals `expected`.
    /// Returns whether a record was deleted.
    async fn delete_if_equals(&self, key: &str, expected: &str) -> Result<bool>;
}

/// Build the store selected by configuration.
pub async fn connect(config: &StoreConfig) -> Result<Arc<dyn StateStore>> {
    match config.backend {
        StoreBackend::Memory => {
            info!("Using in-memory store; state is not shared between processes");
            Ok(Arc::new(MemoryStore::new()))
        }
        StoreBackend::Redis => {
            let store = RedisStore::connect(
                &config.url,
                config.connect_timeout(),
                config.io_timeout(),
            )
            .await?;
            Ok(Arc::new(store))
        }
    }
}
