use std::collections::BTreeMap;
use std::sync::Arc;

use crate::election::LeaderElection;
use crate::error::Result;
use crate::keyspace::KeySpace;
use crate::retry::RetryPolicy;
use crate::store::CoordinationStore;

/// Cluster-wide settings under `{prefix}/variables/{name}`, a namespace
/// separate from machine flags.
pub struct ClusterVariables {
    store: Arc<dyn CoordinationStore>,
    election: Arc<LeaderElection>,
    dir: String,
    retry: RetryPolicy,
}

impl ClusterVariables {
    pub fn new(
        store: Arc<dyn CoordinationStore>,
        election: Arc<LeaderElection>,
        prefix: &str,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            store,
            election,
            dir: format!("{prefix}/variables"),
            retry,
        }
    }

    fn space(&self) -> KeySpace<'_> {
        KeySpace::new(
            self.store.as_ref(),
            self.election.as_ref(),
            self.dir.clone(),
            self.retry,
        )
    }

    pub async fn get(&self, name: &str) -> Result<String> {
        self.space().get(name).await
    }

    pub async fn set(&self, name: &str, value: &str) -> Result<()> {
        self.space().set(name, value).await
    }

    /// Deleting a variable that is not set succeeds.
    pub async fn delete(&self, name: &str) -> Result<()> {
        self.space().delete(name).await
    }

    pub async fn get_and_delete(&self, name: &str) -> Result<String> {
        self.space().take(name).await
    }

    pub async fn list(&self) -> Result<BTreeMap<String, String>> {
        self.space().list().await
    }
}
