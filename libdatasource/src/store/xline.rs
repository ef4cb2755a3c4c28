use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use etcd_client::{
    Client, Compare, CompareOp, ConnectOptions, GetOptions, KeyValue, LeaseKeepAliveStream,
    LeaseKeeper, PutOptions, Txn, TxnOp,
};
use log::{debug, info, warn};
use serde::Deserialize;
use tokio::sync::Mutex;
use tokio::time::timeout;

use crate::error::{DatasourceError, Result};
use crate::store::{CoordinationStore, LeaseId, Versioned};

const DEFAULT_PREFIX: &str = "/rkbs";
const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 5;

#[derive(Debug, Clone, Deserialize)]
pub struct XlineConfig {
    pub endpoints: Vec<String>,
    #[serde(default = "default_prefix")]
    pub prefix: String,
    pub username: Option<String>,
    pub password: Option<String>,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

fn default_prefix() -> String {
    DEFAULT_PREFIX.to_string()
}

fn default_request_timeout() -> u64 {
    DEFAULT_REQUEST_TIMEOUT_SECS
}

impl XlineConfig {
    pub fn new(endpoints: Vec<String>) -> Self {
        Self {
            endpoints,
            prefix: default_prefix(),
            username: None,
            password: None,
            request_timeout_secs: DEFAULT_REQUEST_TIMEOUT_SECS,
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs.max(1))
    }
}

/// Coordination store backed by an xline (etcd v3 compatible) cluster.
///
/// The etcd client multiplexes over one channel and is cheap to clone, so
/// every call works on its own handle and no local lock is held across a
/// round trip. Each request is bounded by the configured timeout.
///
/// Keep-alive streams are opened once per lease and reused by every renewal
/// until the lease is revoked or the stream breaks.
#[derive(Clone)]
pub struct XlineStore {
    client: Client,
    request_timeout: Duration,
    keepers: Arc<Mutex<HashMap<LeaseId, KeepAlive>>>,
}

struct KeepAlive {
    keeper: LeaseKeeper,
    stream: LeaseKeepAliveStream,
}

impl XlineStore {
    pub async fn connect(config: &XlineConfig) -> Result<Self> {
        let mut opts = ConnectOptions::default()
            .with_connect_timeout(config.request_timeout())
            .with_timeout(config.request_timeout());
        if let (Some(user), Some(pass)) = (&config.username, &config.password) {
            opts = opts.with_user(user.clone(), pass.clone());
        }

        let client = timeout(
            config.request_timeout(),
            Client::connect(config.endpoints.clone(), Some(opts)),
        )
        .await??;
        info!("connected to xline endpoints {:?}", config.endpoints);

        Ok(Self {
            client,
            request_timeout: config.request_timeout(),
            keepers: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    async fn open_keep_alive(&self, lease: LeaseId) -> Result<KeepAlive> {
        let mut cli = self.cli();
        let (keeper, stream) = self.bounded(cli.lease_keep_alive(lease)).await?;
        Ok(KeepAlive { keeper, stream })
    }

    fn cli(&self) -> Client {
        self.client.clone()
    }

    async fn bounded<T, F>(&self, fut: F) -> Result<T>
    where
        F: Future<Output = std::result::Result<T, etcd_client::Error>>,
    {
        Ok(timeout(self.request_timeout, fut).await??)
    }
}

fn kv_to_versioned(kv: &KeyValue) -> Versioned {
    Versioned {
        value: kv.value().to_vec(),
        version: kv.version(),
        mod_revision: kv.mod_revision(),
        lease: (kv.lease() != 0).then_some(kv.lease()),
    }
}

#[async_trait]
impl CoordinationStore for XlineStore {
    async fn get(&self, key: &str) -> Result<Option<Versioned>> {
        let mut cli = self.cli();
        let resp = self.bounded(cli.get(key, None)).await?;
        Ok(resp.kvs().first().map(kv_to_versioned))
    }

    async fn get_prefix(&self, prefix: &str) -> Result<Vec<(String, Versioned)>> {
        let mut cli = self.cli();
        let resp = self
            .bounded(cli.get(prefix, Some(GetOptions::new().with_prefix())))
            .await?;

        let mut items = Vec::with_capacity(resp.kvs().len());
        for kv in resp.kvs() {
            match std::str::from_utf8(kv.key()) {
                Ok(key) => items.push((key.to_string(), kv_to_versioned(kv))),
                Err(e) => warn!("Ignoring non UTF-8 key under {prefix}: {e}"),
            }
        }
        items.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(items)
    }

    async fn put(&self, key: &str, value: Vec<u8>) -> Result<()> {
        let mut cli = self.cli();
        self.bounded(cli.put(key, value, None)).await?;
        Ok(())
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected_version: i64,
        value: Vec<u8>,
        lease: Option<LeaseId>,
    ) -> Result<bool> {
        let opts = lease.map(|id| PutOptions::new().with_lease(id));
        let cmp = Compare::version(key, CompareOp::Equal, expected_version);
        let txn = Txn::new()
            .when([cmp])
            .and_then([TxnOp::put(key, value, opts)]);

        let mut cli = self.cli();
        let resp = self.bounded(cli.txn(txn)).await?;
        if !resp.succeeded() {
            debug!("compare-and-swap on {key} at version {expected_version} lost");
        }
        Ok(resp.succeeded())
    }

    async fn compare_and_delete(&self, key: &str, expected_version: i64) -> Result<bool> {
        let cmp = Compare::version(key, CompareOp::Equal, expected_version);
        let txn = Txn::new().when([cmp]).and_then([TxnOp::delete(key, None)]);

        let mut cli = self.cli();
        let resp = self.bounded(cli.txn(txn)).await?;
        Ok(resp.succeeded())
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let mut cli = self.cli();
        let resp = self.bounded(cli.delete(key, None)).await?;
        Ok(resp.deleted() > 0)
    }

    async fn grant_lease(&self, ttl: Duration) -> Result<LeaseId> {
        let mut cli = self.cli();
        let secs = ttl.as_secs().max(1) as i64;
        let resp = self.bounded(cli.lease_grant(secs, None)).await?;
        Ok(resp.id())
    }

    async fn keep_alive(&self, lease: LeaseId) -> Result<i64> {
        let mut keepers = self.keepers.lock().await;
        // Opening a stream already sends the first keep-alive request.
        let mut ka = match keepers.remove(&lease) {
            Some(mut ka) => {
                let sent = self.bounded(ka.keeper.keep_alive()).await;
                match sent {
                    Ok(()) => ka,
                    Err(e) => {
                        debug!("keep-alive stream for lease {lease} broke: {e}, reopening");
                        self.open_keep_alive(lease).await?
                    }
                }
            }
            None => self.open_keep_alive(lease).await?,
        };

        let resp = self.bounded(ka.stream.message()).await?;
        match resp {
            Some(resp) => {
                let ttl = resp.ttl();
                if ttl > 0 {
                    keepers.insert(lease, ka);
                }
                Ok(ttl)
            }
            None => Err(DatasourceError::Unavailable(
                "keep-alive stream closed".to_string(),
            )),
        }
    }

    async fn revoke_lease(&self, lease: LeaseId) -> Result<()> {
        self.keepers.lock().await.remove(&lease);
        let mut cli = self.cli();
        match self.bounded(cli.lease_revoke(lease)).await {
            Ok(_) => Ok(()),
            // Already expired or revoked.
            Err(DatasourceError::NotFound(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn put_with_lease(&self, key: &str, value: Vec<u8>, lease: LeaseId) -> Result<()> {
        let mut cli = self.cli();
        self.bounded(cli.put(key, value, Some(PutOptions::new().with_lease(lease))))
            .await?;
        Ok(())
    }
}
