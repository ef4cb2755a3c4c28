//! Cluster-wide leadership over a lease-bound store key.
//!
//! The leader key `{prefix}/leader` is created with a compare-and-swap on
//! "key absent" and bound to a store lease. Each [`LeaderElection`] carries a
//! random term token written into the key, so only the very process that
//! wrote it may replace it; two processes sharing an `instance_id` still
//! exclude each other.
//!
//! A background task refreshes the lease every `ttl / 3`. Leadership is only
//! claimed for [`ElectionConfig::lease_validity`] past the moment the last
//! successful grant or renewal was *sent*: the store starts the TTL no
//! earlier than that, so a slow response can never stretch local leadership
//! past the store-side lease. The task steps down once that window lapses or
//! after `max_renew_failures` consecutive failures, whichever comes first.

use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use log::{debug, error, info, warn};
use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex as AsyncMutex, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep};
use tokio_util::sync::CancellationToken;

use crate::error::{DatasourceError, Result};
use crate::store::{CoordinationStore, LeaseId};

pub const DEFAULT_LEASE_TTL: Duration = Duration::from_secs(15);
pub const DEFAULT_MAX_RENEW_FAILURES: u32 = 3;

#[derive(Debug, Clone)]
pub struct ElectionConfig {
    pub instance_id: String,
    pub lease_ttl: Duration,
    pub max_renew_failures: u32,
}

impl ElectionConfig {
    pub fn new(instance_id: impl Into<String>) -> Self {
        Self {
            instance_id: instance_id.into(),
            lease_ttl: DEFAULT_LEASE_TTL,
            max_renew_failures: DEFAULT_MAX_RENEW_FAILURES,
        }
    }

    pub fn renew_interval(&self) -> Duration {
        self.lease_ttl / 3
    }

    /// How long a grant or renewal keeps this instance leader, counted from
    /// when the request was sent. Slightly shorter than the TTL to absorb
    /// clock drift between this process and the store.
    pub fn lease_validity(&self) -> Duration {
        self.lease_ttl - self.lease_ttl / 6
    }
}

/// Value stored under the leader key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaderRecord {
    #[serde(rename = "Instance")]
    pub instance: String,
    #[serde(rename = "AcquiredAt")]
    pub acquired_at: DateTime<Utc>,
    /// Per-process token of the writer.
    #[serde(rename = "Term", default)]
    pub term: String,
}

/// Local renewal bookkeeping. Business data never lives here.
struct LeaderState {
    leader: AtomicBool,
    closed: AtomicBool,
    lease: Mutex<Option<LeaseId>>,
    last_renewed: Mutex<Option<Instant>>,
    notify: watch::Sender<bool>,
}

impl LeaderState {
    /// `sent_at` is when the successful request left this process.
    fn touch(&self, sent_at: Instant) {
        if let Ok(mut at) = self.last_renewed.lock() {
            *at = Some(sent_at);
        }
    }

    fn renewed_within(&self, ttl: Duration) -> bool {
        self.last_renewed
            .lock()
            .ok()
            .and_then(|at| *at)
            .is_some_and(|at| at.elapsed() < ttl)
    }

    fn set_lease(&self, lease: Option<LeaseId>) -> Option<LeaseId> {
        match self.lease.lock() {
            Ok(mut slot) => std::mem::replace(&mut *slot, lease),
            Err(_) => None,
        }
    }

    fn step_up(&self, lease: LeaseId, sent_at: Instant) {
        self.set_lease(Some(lease));
        self.touch(sent_at);
        self.leader.store(true, Ordering::SeqCst);
        self.notify.send_replace(true);
    }

    fn step_down(&self) {
        if self.leader.swap(false, Ordering::SeqCst) {
            self.notify.send_replace(false);
        }
    }
}

struct RenewalTask {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

pub struct LeaderElection {
    store: Arc<dyn CoordinationStore>,
    key: String,
    config: ElectionConfig,
    term: String,
    state: Arc<LeaderState>,
    task: AsyncMutex<Option<RenewalTask>>,
}

impl LeaderElection {
    pub fn new(store: Arc<dyn CoordinationStore>, prefix: &str, config: ElectionConfig) -> Self {
        let (notify, _) = watch::channel(false);
        Self {
            store,
            key: format!("{prefix}/leader"),
            config,
            term: format!("{:016x}", rand::rng().random::<u64>()),
            state: Arc::new(LeaderState {
                leader: AtomicBool::new(false),
                closed: AtomicBool::new(false),
                lease: Mutex::new(None),
                last_renewed: Mutex::new(None),
                notify,
            }),
            task: AsyncMutex::new(None),
        }
    }

    pub fn instance_id(&self) -> &str {
        &self.config.instance_id
    }

    /// Synchronous leadership check consulted before every mutation.
    ///
    /// Also false once the last successful renewal was sent longer than
    /// [`ElectionConfig::lease_validity`] ago, so a stalled renewal task
    /// cannot keep a stale answer alive.
    pub fn is_leader(&self) -> bool {
        !self.state.closed.load(Ordering::SeqCst)
            && self.state.leader.load(Ordering::SeqCst)
            && self.state.renewed_within(self.config.lease_validity())
    }

    pub fn is_closed(&self) -> bool {
        self.state.closed.load(Ordering::SeqCst)
    }

    /// `Closed` after shutdown, `NotLeader` without a valid lease.
    pub fn ensure_writable(&self) -> Result<()> {
        if self.is_closed() {
            return Err(DatasourceError::Closed);
        }
        if !self.is_leader() {
            return Err(DatasourceError::NotLeader);
        }
        Ok(())
    }

    /// Receives `true`/`false` on every leadership transition.
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.state.notify.subscribe()
    }

    /// Current holder as recorded in the store, if any.
    pub async fn leader(&self) -> Result<Option<LeaderRecord>> {
        match self.store.get(&self.key).await? {
            Some(v) => Ok(Some(serde_json::from_slice(&v.value)?)),
            None => Ok(None),
        }
    }

    /// Tries once to become leader. Fails fast with `LeadershipHeld` when
    /// another live instance owns the key; see [`Self::campaign`] for the
    /// waiting variant.
    pub async fn become_leader(&self) -> Result<()> {
        if self.is_closed() {
            return Err(DatasourceError::Closed);
        }

        let mut task = self.task.lock().await;
        if self.is_leader() {
            return Ok(());
        }
        // A renewal task from a lost term may still be winding down.
        if let Some(old) = task.take() {
            old.cancel.cancel();
            let _ = old.handle.await;
        }

        let sent_at = Instant::now();
        let lease = self.store.grant_lease(self.config.lease_ttl).await?;
        match self.try_acquire(lease).await {
            Ok(None) => {}
            Ok(Some(holder)) => {
                self.revoke_quietly(lease).await;
                return Err(DatasourceError::LeadershipHeld(holder));
            }
            Err(e) => {
                self.revoke_quietly(lease).await;
                return Err(e);
            }
        }

        // Shutdown may have raced with acquisition.
        if self.is_closed() {
            self.revoke_quietly(lease).await;
            return Err(DatasourceError::Closed);
        }

        self.state.step_up(lease, sent_at);
        info!(
            "{} became leader (lease {lease}, ttl {:?})",
            self.config.instance_id, self.config.lease_ttl
        );

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(renew_loop(
            self.store.clone(),
            self.state.clone(),
            self.config.clone(),
            lease,
            cancel.clone(),
        ));
        *task = Some(RenewalTask { cancel, handle });
        Ok(())
    }

    /// Returns `None` when the key now carries `lease`, otherwise the holder.
    async fn try_acquire(&self, lease: LeaseId) -> Result<Option<String>> {
        let record = serde_json::to_vec(&LeaderRecord {
            instance: self.config.instance_id.clone(),
            acquired_at: Utc::now(),
            term: self.term.clone(),
        })?;

        if self
            .store
            .compare_and_swap(&self.key, 0, record.clone(), Some(lease))
            .await?
        {
            return Ok(None);
        }

        let Some(current) = self.store.get(&self.key).await? else {
            // The previous holder vanished between the two calls.
            return Err(DatasourceError::Conflict);
        };
        let holder: LeaderRecord = serde_json::from_slice(&current.value)?;
        // Same instance_id is not enough: another live process may share it.
        if holder.term != self.term {
            return Ok(Some(holder.instance));
        }

        // Left over from an earlier lease of this same process.
        if self
            .store
            .compare_and_swap(&self.key, current.version, record, Some(lease))
            .await?
        {
            if let Some(old) = current.lease {
                self.revoke_quietly(old).await;
            }
            Ok(None)
        } else {
            Err(DatasourceError::Conflict)
        }
    }

    /// Retries [`Self::become_leader`] with capped exponential backoff until
    /// leadership is acquired or `cancel` fires.
    pub async fn campaign(&self, cancel: &CancellationToken) -> Result<()> {
        let mut backoff = Duration::from_millis(200);
        let max_backoff = self.config.lease_ttl;

        loop {
            match self.become_leader().await {
                Ok(()) => return Ok(()),
                Err(DatasourceError::LeadershipHeld(holder)) => {
                    debug!("leadership held by {holder}, waiting {backoff:?}");
                }
                Err(e) if e.is_retryable() => {
                    warn!("leader election attempt failed: {e}, retrying in {backoff:?}");
                }
                Err(e) => return Err(e),
            }

            tokio::select! {
                _ = cancel.cancelled() => return Err(DatasourceError::Closed),
                _ = sleep(backoff) => {}
            }
            backoff = std::cmp::min(backoff * 2, max_backoff);
        }
    }

    /// Stops renewal and releases the lease so a waiting instance can take
    /// over within one TTL. Every later mutation fails with `Closed`.
    /// Calling it again is a no-op.
    pub async fn shutdown(&self) -> Result<()> {
        if self.state.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.state.step_down();

        if let Some(task) = self.task.lock().await.take() {
            task.cancel.cancel();
            let _ = task.handle.await;
        }

        let Some(lease) = self.state.set_lease(None) else {
            return Ok(());
        };
        // Revoking deletes the lease-bound leader key with it.
        match self.store.revoke_lease(lease).await {
            Ok(()) => {
                info!("{} released leadership", self.config.instance_id);
                Ok(())
            }
            Err(e) => {
                error!("failed to revoke leadership lease {lease}: {e}");
                Err(e)
            }
        }
    }

    async fn revoke_quietly(&self, lease: LeaseId) {
        if let Err(e) = self.store.revoke_lease(lease).await {
            warn!("failed to revoke lease {lease}: {e}");
        }
    }
}

impl Drop for LeaderElection {
    fn drop(&mut self) {
        if let Some(task) = self.task.get_mut().take() {
            task.cancel.cancel();
        }
    }
}

async fn renew_loop(
    store: Arc<dyn CoordinationStore>,
    state: Arc<LeaderState>,
    config: ElectionConfig,
    lease: LeaseId,
    cancel: CancellationToken,
) {
    let interval = config.renew_interval();
    let mut failures = 0u32;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = sleep(interval) => {}
        }

        let sent_at = Instant::now();
        let res = tokio::select! {
            _ = cancel.cancelled() => return,
            res = store.keep_alive(lease) => res,
        };

        match res {
            Ok(ttl) if ttl > 0 => {
                failures = 0;
                state.touch(sent_at);
                debug!("leadership lease {lease} renewed, ttl {ttl}s");
            }
            Ok(_) => {
                error!("leadership lease {lease} expired on the store, stepping down");
                state.step_down();
                return;
            }
            Err(e) => {
                failures += 1;
                warn!(
                    "renewing leadership lease {lease} failed ({failures}/{}): {e}",
                    config.max_renew_failures
                );
                if failures >= config.max_renew_failures.max(1) {
                    error!("lost leadership after {failures} failed renewals");
                    state.step_down();
                    return;
                }
                if !state.renewed_within(config.lease_validity()) {
                    error!("leadership lease {lease} may have expired on the store, stepping down");
                    state.step_down();
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn election(store: Arc<MemoryStore>, id: &str) -> LeaderElection {
        let mut cfg = ElectionConfig::new(id);
        cfg.lease_ttl = Duration::from_secs(3);
        LeaderElection::new(store, "/test", cfg)
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_leader() {
        let store = Arc::new(MemoryStore::new());
        let a = election(store.clone(), "a");
        let b = election(store.clone(), "b");

        a.become_leader().await.unwrap();
        assert!(a.is_leader());

        let err = b.become_leader().await.unwrap_err();
        assert!(matches!(err, DatasourceError::LeadershipHeld(ref h) if h == "a"));
        assert!(!b.is_leader());
        assert!(matches!(b.ensure_writable(), Err(DatasourceError::NotLeader)));

        assert_eq!(b.leader().await.unwrap().unwrap().instance, "a");

        // Renewal keeps the lease alive well past one TTL.
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(a.is_leader());
        assert!(b.become_leader().await.is_err());

        a.shutdown().await.unwrap();
        b.shutdown().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_become_leader_is_reentrant() {
        let store = Arc::new(MemoryStore::new());
        let a = election(store.clone(), "a");
        a.become_leader().await.unwrap();
        a.become_leader().await.unwrap();
        assert!(a.is_leader());
        a.shutdown().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_shared_instance_id_does_not_split_leadership() {
        let store = Arc::new(MemoryStore::new());
        let first = election(store.clone(), "cp-a");
        let second = election(store.clone(), "cp-a");
        first.become_leader().await.unwrap();

        let err = second.become_leader().await.unwrap_err();
        assert!(matches!(err, DatasourceError::LeadershipHeld(ref h) if h == "cp-a"));
        assert!(first.is_leader());
        assert!(!second.is_leader());

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(first.is_leader());
        assert!(second.become_leader().await.is_err());

        first.shutdown().await.unwrap();
        second.become_leader().await.unwrap();
        assert!(second.is_leader());
        second.shutdown().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_brief_outage_keeps_leadership() {
        let store = Arc::new(MemoryStore::new());
        let a = election(store.clone(), "a");
        a.become_leader().await.unwrap();

        // One renewal (at 1s) fails, the next one (at 2s) succeeds.
        tokio::time::sleep(Duration::from_millis(500)).await;
        store.set_available(false);
        tokio::time::sleep(Duration::from_millis(1000)).await;
        assert!(a.is_leader());
        store.set_available(true);

        tokio::time::sleep(Duration::from_millis(1000)).await;
        assert!(a.is_leader());
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(a.is_leader());

        let b = election(store.clone(), "b");
        assert!(b.become_leader().await.is_err());
        a.shutdown().await.unwrap();
    }

    /// Answers writes late and never renews.
    struct SlowStore {
        inner: MemoryStore,
        delay: Duration,
    }

    #[async_trait::async_trait]
    impl CoordinationStore for SlowStore {
        async fn get(&self, key: &str) -> Result<Option<crate::store::Versioned>> {
            self.inner.get(key).await
        }

        async fn get_prefix(&self, prefix: &str) -> Result<Vec<(String, crate::store::Versioned)>> {
            self.inner.get_prefix(prefix).await
        }

        async fn put(&self, key: &str, value: Vec<u8>) -> Result<()> {
            self.inner.put(key, value).await
        }

        async fn compare_and_swap(
            &self,
            key: &str,
            expected_version: i64,
            value: Vec<u8>,
            lease: Option<LeaseId>,
        ) -> Result<bool> {
            let res = self
                .inner
                .compare_and_swap(key, expected_version, value, lease)
                .await;
            sleep(self.delay).await;
            res
        }

        async fn compare_and_delete(&self, key: &str, expected_version: i64) -> Result<bool> {
            self.inner.compare_and_delete(key, expected_version).await
        }

        async fn delete(&self, key: &str) -> Result<bool> {
            self.inner.delete(key).await
        }

        async fn grant_lease(&self, ttl: Duration) -> Result<LeaseId> {
            self.inner.grant_lease(ttl).await
        }

        async fn keep_alive(&self, _lease: LeaseId) -> Result<i64> {
            Err(DatasourceError::Unavailable("renewals dropped".to_string()))
        }

        async fn revoke_lease(&self, lease: LeaseId) -> Result<()> {
            self.inner.revoke_lease(lease).await
        }

        async fn put_with_lease(&self, key: &str, value: Vec<u8>, lease: LeaseId) -> Result<()> {
            self.inner.put_with_lease(key, value, lease).await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_acquisition_does_not_outlive_store_lease() {
        let store: Arc<dyn CoordinationStore> = Arc::new(SlowStore {
            inner: MemoryStore::new(),
            delay: Duration::from_secs(2),
        });
        let mut cfg = ElectionConfig::new("a");
        cfg.lease_ttl = Duration::from_secs(3);
        let a = LeaderElection::new(store.clone(), "/test", cfg.clone());
        cfg.instance_id = "b".to_string();
        let b = LeaderElection::new(store.clone(), "/test", cfg);

        // The lease is granted at 0s but the answer only arrives at 2s.
        a.become_leader().await.unwrap();
        assert!(a.is_leader());

        // The store lease is gone at 3s.
        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert!(!a.is_leader());

        b.become_leader().await.unwrap();
        assert!(b.is_leader());
        assert!(!a.is_leader());

        a.shutdown().await.unwrap();
        b.shutdown().await.unwrap();
    }

    #[test]
    fn test_lease_validity_is_shorter_than_ttl() {
        let cfg = ElectionConfig::new("a");
        assert!(cfg.lease_validity() < cfg.lease_ttl);
        assert!(cfg.renew_interval() < cfg.lease_validity());
    }

    #[tokio::test(start_paused = true)]
    async fn test_steps_down_after_failed_renewals() {
        let store = Arc::new(MemoryStore::new());
        let a = election(store.clone(), "a");
        let mut rx = a.subscribe();
        a.become_leader().await.unwrap();
        assert!(*rx.borrow_and_update());

        store.set_available(false);
        tokio::time::sleep(Duration::from_secs(4)).await;
        assert!(!a.is_leader());
        assert!(matches!(a.ensure_writable(), Err(DatasourceError::NotLeader)));
        rx.changed().await.unwrap();
        assert!(!*rx.borrow());

        // Once the store is back and the stale lease has expired, another instance wins.
        store.set_available(true);
        let b = election(store.clone(), "b");
        b.become_leader().await.unwrap();
        assert!(b.is_leader());
        b.shutdown().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_hands_over_and_is_idempotent() {
        let store = Arc::new(MemoryStore::new());
        let a = election(store.clone(), "a");
        let b = election(store.clone(), "b");
        a.become_leader().await.unwrap();

        a.shutdown().await.unwrap();
        a.shutdown().await.unwrap();
        assert!(matches!(a.ensure_writable(), Err(DatasourceError::Closed)));
        assert!(matches!(a.become_leader().await, Err(DatasourceError::Closed)));

        b.become_leader().await.unwrap();
        assert!(b.is_leader());
        b.shutdown().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_campaign_waits_for_release() {
        let store = Arc::new(MemoryStore::new());
        let a = Arc::new(election(store.clone(), "a"));
        let b = Arc::new(election(store.clone(), "b"));
        a.become_leader().await.unwrap();

        let cancel = CancellationToken::new();
        let waiter = {
            let b = b.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { b.campaign(&cancel).await })
        };

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(!b.is_leader());
        a.shutdown().await.unwrap();

        waiter.await.unwrap().unwrap();
        assert!(b.is_leader());
        b.shutdown().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_campaign_stops_on_cancel() {
        let store = Arc::new(MemoryStore::new());
        let a = election(store.clone(), "a");
        let b = election(store.clone(), "b");
        a.become_leader().await.unwrap();

        let cancel = CancellationToken::new();
        cancel.cancel();
        assert!(matches!(
            b.campaign(&cancel).await,
            Err(DatasourceError::Closed)
        ));
        a.shutdown().await.unwrap();
    }
}
