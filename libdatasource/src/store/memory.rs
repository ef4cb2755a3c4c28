use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use log::debug;
use tokio::time::Instant;

use crate::error::{DatasourceError, Result};
use crate::store::{CoordinationStore, LeaseId, Versioned};

#[derive(Debug, Clone)]
struct Entry {
    value: Vec<u8>,
    version: i64,
    mod_revision: i64,
    lease: Option<LeaseId>,
}

#[derive(Debug)]
struct LeaseState {
    ttl: Duration,
    expires_at: Instant,
    keys: HashSet<String>,
}

#[derive(Debug, Default)]
struct Inner {
    kvs: BTreeMap<String, Entry>,
    leases: HashMap<LeaseId, LeaseState>,
    revision: i64,
    next_lease: LeaseId,
}

impl Inner {
    /// Drops expired leases together with the keys attached to them.
    fn purge_expired(&mut self) {
        let now = Instant::now();
        let expired: Vec<LeaseId> = self
            .leases
            .iter()
            .filter(|(_, l)| l.expires_at <= now)
            .map(|(id, _)| *id)
            .collect();
        for id in expired {
            self.drop_lease(id);
        }
    }

    fn drop_lease(&mut self, id: LeaseId) -> bool {
        let Some(lease) = self.leases.remove(&id) else {
            return false;
        };
        let mut removed = false;
        for key in lease.keys {
            if self.kvs.get(&key).is_some_and(|e| e.lease == Some(id)) {
                self.kvs.remove(&key);
                removed = true;
            }
        }
        if removed {
            self.revision += 1;
        }
        debug!("memory store: lease {id} dropped");
        true
    }

    fn version_of(&self, key: &str) -> i64 {
        self.kvs.get(key).map_or(0, |e| e.version)
    }

    fn write(&mut self, key: &str, value: Vec<u8>, lease: Option<LeaseId>) -> Result<()> {
        if let Some(id) = lease {
            let state = self
                .leases
                .get_mut(&id)
                .ok_or_else(|| DatasourceError::not_found(format!("lease {id}")))?;
            state.keys.insert(key.to_string());
        }
        if let Some(old) = self.kvs.get(key).and_then(|e| e.lease)
            && Some(old) != lease
            && let Some(state) = self.leases.get_mut(&old)
        {
            state.keys.remove(key);
        }

        self.revision += 1;
        let version = self.version_of(key) + 1;
        self.kvs.insert(
            key.to_string(),
            Entry {
                value,
                version,
                mod_revision: self.revision,
                lease,
            },
        );
        Ok(())
    }

    fn remove(&mut self, key: &str) -> bool {
        match self.kvs.remove(key) {
            Some(entry) => {
                if let Some(state) = entry.lease.and_then(|id| self.leases.get_mut(&id)) {
                    state.keys.remove(key);
                }
                self.revision += 1;
                true
            }
            None => false,
        }
    }
}

fn to_versioned(entry: &Entry) -> Versioned {
    Versioned {
        value: entry.value.clone(),
        version: entry.version,
        mod_revision: entry.mod_revision,
        lease: entry.lease,
    }
}

/// Deterministic in-process coordination store with etcd versioning rules.
///
/// Lease expiry follows the tokio clock, so tests running with paused time
/// can drive expiry with `tokio::time::advance`. Availability can be toggled
/// to simulate a partition from the store.
#[derive(Debug)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
    available: AtomicBool,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                next_lease: 1,
                ..Default::default()
            }),
            available: AtomicBool::new(true),
        }
    }

    /// When `false`, every call fails with `Unavailable` until re-enabled.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    pub fn revision(&self) -> i64 {
        self.lock().map(|inner| inner.revision).unwrap_or_default()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Inner>> {
        if !self.available.load(Ordering::SeqCst) {
            return Err(DatasourceError::Unavailable(
                "memory store marked unavailable".to_string(),
            ));
        }
        let mut inner = self
            .inner
            .lock()
            .map_err(|_| DatasourceError::Other(anyhow::anyhow!("memory store poisoned")))?;
        inner.purge_expired();
        Ok(inner)
    }
}

#[async_trait]
impl CoordinationStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<Versioned>> {
        let inner = self.lock()?;
        Ok(inner.kvs.get(key).map(to_versioned))
    }

    async fn get_prefix(&self, prefix: &str) -> Result<Vec<(String, Versioned)>> {
        let inner = self.lock()?;
        Ok(inner
            .kvs
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, e)| (k.clone(), to_versioned(e)))
            .collect())
    }

    async fn put(&self, key: &str, value: Vec<u8>) -> Result<()> {
        let mut inner = self.lock()?;
        inner.write(key, value, None)
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected_version: i64,
        value: Vec<u8>,
        lease: Option<LeaseId>,
    ) -> Result<bool> {
        let mut inner = self.lock()?;
        if inner.version_of(key) != expected_version {
            return Ok(false);
        }
        inner.write(key, value, lease)?;
        Ok(true)
    }

    async fn compare_and_delete(&self, key: &str, expected_version: i64) -> Result<bool> {
        let mut inner = self.lock()?;
        if inner.version_of(key) != expected_version {
            return Ok(false);
        }
        inner.remove(key);
        Ok(true)
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let mut inner = self.lock()?;
        Ok(inner.remove(key))
    }

    async fn grant_lease(&self, ttl: Duration) -> Result<LeaseId> {
        let mut inner = self.lock()?;
        let id = inner.next_lease;
        inner.next_lease += 1;
        inner.leases.insert(
            id,
            LeaseState {
                ttl,
                expires_at: Instant::now() + ttl,
                keys: HashSet::new(),
            },
        );
        Ok(id)
    }

    async fn keep_alive(&self, lease: LeaseId) -> Result<i64> {
        let mut inner = self.lock()?;
        match inner.leases.get_mut(&lease) {
            Some(state) => {
                state.expires_at = Instant::now() + state.ttl;
                Ok(state.ttl.as_secs().max(1) as i64)
            }
            None => Ok(0),
        }
    }

    async fn revoke_lease(&self, lease: LeaseId) -> Result<()> {
        let mut inner = self.lock()?;
        inner.drop_lease(lease);
        Ok(())
    }

    async fn put_with_lease(&self, key: &str, value: Vec<u8>, lease: LeaseId) -> Result<()> {
        let mut inner = self.lock()?;
        inner.write(key, value, Some(lease))
    }
}
