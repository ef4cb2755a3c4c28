use std::collections::BTreeMap;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use log::info;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::config::{DatasourceConfig, ElectionSettings};
use crate::election::{LeaderElection, LeaderRecord};
use crate::error::Result;
use crate::interface::MachineInterface;
use crate::machine::{MacAddress, Machine};
use crate::pool::{AddressPool, Allocator};
use crate::registry::NodeRegistry;
use crate::retry::RetryPolicy;
use crate::store::{CoordinationStore, MemoryStore, XlineConfig, XlineStore};
use crate::variables::ClusterVariables;

pub const TEST_CLUSTER_NAME: &str = "test-cluster";
pub const TEST_POOL: &str = "10.10.10.2-10.10.10.254";
pub const TEST_COREOS_VERSION: &str = "1068.2.0";

/// One handle over leadership, address allocation, the machine registry and
/// cluster variables.
///
/// Built once at process start and shared (behind an `Arc`) with every request
/// handler. It owns no authoritative state: everything lives in the
/// coordination store, and every mutation checks for shutdown and leadership
/// before touching it.
pub struct Datasource {
    config: DatasourceConfig,
    election: Arc<LeaderElection>,
    allocator: Arc<Allocator>,
    registry: Arc<NodeRegistry>,
    variables: ClusterVariables,
}

impl Datasource {
    /// Connects to the configured xline cluster.
    pub async fn connect(config: DatasourceConfig) -> Result<Self> {
        config.validate()?;
        let store = XlineStore::connect(&config.xline_config).await?;
        Self::with_store(config, Arc::new(store))
    }

    pub fn with_store(config: DatasourceConfig, store: Arc<dyn CoordinationStore>) -> Result<Self> {
        config.validate()?;
        let prefix = config.xline_config.prefix.clone();
        let retry = RetryPolicy::default();

        let election = Arc::new(LeaderElection::new(
            store.clone(),
            &prefix,
            config.election_config(),
        ));
        let allocator = Arc::new(Allocator::new(
            store.clone(),
            election.clone(),
            config.pool,
            &prefix,
            retry,
        ));
        let registry = Arc::new(NodeRegistry::new(
            store.clone(),
            election.clone(),
            allocator.clone(),
            &prefix,
            &config.hostname_prefix,
            retry,
        ));
        let variables = ClusterVariables::new(store, election.clone(), &prefix, retry);

        info!(
            "datasource for cluster {} ready (pool {}, instance {})",
            config.cluster_name,
            config.pool,
            election.instance_id()
        );
        Ok(Self {
            config,
            election,
            allocator,
            registry,
            variables,
        })
    }

    /// Deterministic in-memory datasource for tests, seeded with
    /// `coreos-version = 1068.2.0`.
    pub async fn for_test() -> Result<Self> {
        Self::for_test_with(Arc::new(MemoryStore::new()), TEST_POOL.parse()?).await
    }

    /// Like [`Self::for_test`] over a caller-owned store and pool, so several
    /// instances can share one store or a test can inject faults.
    pub async fn for_test_with(store: Arc<MemoryStore>, pool: AddressPool) -> Result<Self> {
        let config = test_config(pool);
        let variable = format!("{}/variables/coreos-version", config.xline_config.prefix);
        if store.get(&variable).await?.is_none() {
            store
                .put(&variable, TEST_COREOS_VERSION.as_bytes().to_vec())
                .await?;
        }
        Self::with_store(config, store)
    }

    pub fn config(&self) -> &DatasourceConfig {
        &self.config
    }

    pub fn cluster_name(&self) -> &str {
        &self.config.cluster_name
    }

    pub fn coordination_endpoints(&self) -> &[String] {
        &self.config.xline_config.endpoints
    }

    pub fn workspace_path(&self) -> &Path {
        &self.config.workspace
    }

    /// Static files served to booting machines.
    pub fn files_path(&self) -> PathBuf {
        self.config.workspace.join("files")
    }

    pub fn pool(&self) -> &AddressPool {
        self.allocator.pool()
    }

    pub fn version(&self) -> &'static str {
        env!("CARGO_PKG_VERSION")
    }

    pub fn machine_interface(&self, mac: MacAddress) -> MachineInterface {
        MachineInterface::new(mac, self.registry.clone())
    }

    pub async fn list_machines(&self) -> Result<Vec<Machine>> {
        self.registry.list_machines().await
    }

    pub async fn allocations(&self) -> Result<Vec<(Ipv4Addr, MacAddress)>> {
        self.allocator.allocations().await
    }

    pub fn instance_id(&self) -> &str {
        self.election.instance_id()
    }

    pub async fn become_leader(&self) -> Result<()> {
        self.election.become_leader().await
    }

    pub async fn campaign(&self, cancel: &CancellationToken) -> Result<()> {
        self.election.campaign(cancel).await
    }

    pub fn is_leader(&self) -> bool {
        self.election.is_leader()
    }

    pub async fn leader(&self) -> Result<Option<LeaderRecord>> {
        self.election.leader().await
    }

    pub fn subscribe_leadership(&self) -> watch::Receiver<bool> {
        self.election.subscribe()
    }

    pub async fn shutdown(&self) -> Result<()> {
        self.election.shutdown().await
    }

    pub async fn get_cluster_variable(&self, name: &str) -> Result<String> {
        self.variables.get(name).await
    }

    pub async fn set_variable(&self, name: &str, value: &str) -> Result<()> {
        self.variables.set(name, value).await
    }

    pub async fn delete_variable(&self, name: &str) -> Result<()> {
        self.variables.delete(name).await
    }

    pub async fn get_and_delete_variable(&self, name: &str) -> Result<String> {
        self.variables.get_and_delete(name).await
    }

    pub async fn list_variables(&self) -> Result<BTreeMap<String, String>> {
        self.variables.list().await
    }
}

fn test_config(pool: AddressPool) -> DatasourceConfig {
    DatasourceConfig {
        cluster_name: TEST_CLUSTER_NAME.to_string(),
        workspace: std::env::temp_dir().join("rkbs-test-workspace"),
        pool,
        hostname_prefix: "node".to_string(),
        xline_config: XlineConfig::new(vec!["http://127.0.0.1:2379".to_string()]),
        election: ElectionSettings::default(),
    }
}
