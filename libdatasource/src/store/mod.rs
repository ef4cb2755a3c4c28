//! Coordination store contract.
//!
//! The datasource never keeps authoritative state in memory; everything lives
//! behind a linearizable key/value store with etcd v3 semantics. Two adapters
//! implement the contract: [`XlineStore`] for production and [`MemoryStore`]
//! for tests and single-process setups.

use std::time::Duration;

use async_trait::async_trait;

use crate::error::Result;

pub mod memory;
pub mod xline;

pub use memory::MemoryStore;
pub use xline::{XlineConfig, XlineStore};

pub type LeaseId = i64;

/// A value together with the bookkeeping needed for conditional writes.
///
/// `version` follows etcd: 1 on creation, incremented by every write and reset
/// when the key is deleted. A missing key is treated as version 0.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Versioned {
    pub value: Vec<u8>,
    pub version: i64,
    pub mod_revision: i64,
    pub lease: Option<LeaseId>,
}

impl Versioned {
    pub fn as_str(&self) -> Result<&str> {
        std::str::from_utf8(&self.value)
            .map_err(|e| crate::error::DatasourceError::Other(anyhow::anyhow!(e)))
    }
}

#[async_trait]
pub trait CoordinationStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Versioned>>;

    /// All keys starting with `prefix`, sorted by key.
    async fn get_prefix(&self, prefix: &str) -> Result<Vec<(String, Versioned)>>;

    async fn put(&self, key: &str, value: Vec<u8>) -> Result<()>;

    /// Writes `value` only if the key is currently at `expected_version`.
    /// An expected version of 0 means the key must not exist.
    async fn compare_and_swap(
        &self,
        key: &str,
        expected_version: i64,
        value: Vec<u8>,
        lease: Option<LeaseId>,
    ) -> Result<bool>;

    /// Deletes the key only if it is currently at `expected_version`.
    async fn compare_and_delete(&self, key: &str, expected_version: i64) -> Result<bool>;

    /// Returns whether a key was actually removed.
    async fn delete(&self, key: &str) -> Result<bool>;

    async fn grant_lease(&self, ttl: Duration) -> Result<LeaseId>;

    /// Refreshes the lease, returning the remaining TTL in seconds.
    /// A non-positive answer means the lease no longer exists.
    async fn keep_alive(&self, lease: LeaseId) -> Result<i64>;

    async fn revoke_lease(&self, lease: LeaseId) -> Result<()>;

    async fn put_with_lease(&self, key: &str, value: Vec<u8>, lease: LeaseId) -> Result<()>;
}
