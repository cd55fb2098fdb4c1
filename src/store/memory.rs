//! In-process store.
//!
//! Holds hashes and leases in memory. Limiters sharing one `MemoryStore`
//! behave exactly like processes sharing a remote store, which makes it the
//! store of choice for tests and single-process deployments.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::trace;

use crate::error::Result;

use super::StateStore;

/// A lease record and the instant it lapses.
#[derive(Debug, Clone)]
struct Lease {
    value: String,
    expires_at: Instant,
}

/// Process-local implementation of [`StateStore`].
#[derive(Debug, Default)]
pub struct MemoryStore {
    hashes: DashMap<String, HashMap<String, String>>,
    /// Leases sit behind one mutex so check-then-write is atomic.
    leases: Mutex<HashMap<String, Lease>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current holder of a lease, if it has not lapsed.
    pub fn lease_holder(&self, key: &str) -> Option<String> {
        let leases = self.leases.lock();
        leases
            .get(key)
            .filter(|lease| lease.expires_at > Instant::now())
            .map(|lease| lease.value.clone())
    }

    /// Number of hashes held.
    pub fn len(&self) -> usize {
        self.hashes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hashes.is_empty()
    }
}

#[async_trait]
impl StateStore for MemoryStore {
    async fn hash_get(&self, key: &str, fields: &[&str]) -> Result<Vec<Option<String>>> {
        let values = match self.hashes.get(key) {
            Some(hash) => fields.iter().map(|f| hash.get(*f).cloned()).collect(),
            None => vec![None; fields.len()],
        };
        Ok(values)
    }

    async fn hash_set(&self, key: &str, entries: &[(&str, String)]) -> Result<()> {
        let mut hash = self.hashes.entry(key.to_string()).or_default();
        for (field, value) in entries {
            hash.insert((*field).to_string(), value.clone());
        }
        Ok(())
    }

    async fn set_if_absent(&self, key: &str, value: &str, lease: Duration) -> Result<bool> {
        let now = Instant::now();
        let mut leases = self.leases.lock();

        if let Some(existing) = leases.get(key) {
            if existing.expires_at > now {
                return Ok(false);
            }
            trace!(key = %key, holder = %existing.value, "Lease lapsed");
        }

        leases.insert(
            key.to_string(),
            Lease {
                value: value.to_string(),
                expires_at: now + lease,
            },
        );
        Ok(true)
    }

    async fn delete_if_equals(&self, key: &str, expected: &str) -> Result<bool> {
        let now = Instant::now();
        let mut leases = self.leases.lock();

        let matches = leases
            .get(key)
            .map(|lease| lease.expires_at > now && lease.value == expected)
            .unwrap_or(false);
        if matches {
            leases.remove(key);
        }
        Ok(matches)
    }
}
