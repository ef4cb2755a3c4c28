use std::collections::BTreeMap;
use std::net::Ipv4Addr;
use std::sync::Arc;

use async_trait::async_trait;
use log::warn;

use crate::error::Result;
use crate::machine::{MacAddress, Machine};
use crate::registry::NodeRegistry;

/// Flag operations handed to the template renderer for one machine.
///
/// The renderer receives this as an explicit parameter instead of helper
/// functions captured from ambient state.
#[async_trait]
pub trait FlagAccess: Send + Sync {
    async fn resolve(&self, key: &str) -> Result<String>;

    async fn assign(&self, key: &str, value: &str) -> Result<()>;

    async fn take_and_clear(&self, key: &str) -> Result<String>;

    async fn clear(&self, key: &str) -> Result<()>;

    /// A missing or unreadable flag renders as an empty string, one absent
    /// value must not block generating a whole boot configuration.
    async fn resolve_or_empty(&self, key: &str) -> String {
        match self.resolve(key).await {
            Ok(value) => value,
            Err(e) if e.is_not_found() => {
                warn!("flag {key} is not set, rendering it empty");
                String::new()
            }
            Err(e) => {
                warn!("failed to read flag {key}: {e}, rendering it empty");
                String::new()
            }
        }
    }
}

/// Handle over the registry bound to a single MAC address.
#[derive(Clone)]
pub struct MachineInterface {
    mac: MacAddress,
    registry: Arc<NodeRegistry>,
}

impl MachineInterface {
    pub(crate) fn new(mac: MacAddress, registry: Arc<NodeRegistry>) -> Self {
        Self { mac, registry }
    }

    pub fn mac_address(&self) -> MacAddress {
        self.mac
    }

    pub async fn machine(
        &self,
        create_if_missing: bool,
        preferred: Option<Ipv4Addr>,
    ) -> Result<Machine> {
        self.registry
            .machine(&self.mac, create_if_missing, preferred)
            .await
    }

    /// Hostname of an already registered machine.
    pub async fn hostname(&self) -> Result<String> {
        Ok(self.machine(false, None).await?.hostname)
    }

    pub async fn check_in(&self) -> Result<Machine> {
        self.registry.check_in(&self.mac).await
    }

    pub async fn get_flag(&self, key: &str) -> Result<String> {
        self.registry.get_flag(&self.mac, key).await
    }

    pub async fn list_flags(&self) -> Result<BTreeMap<String, String>> {
        self.registry.list_flags(&self.mac).await
    }

    pub async fn set_flag(&self, key: &str, value: &str) -> Result<()> {
        self.registry.set_flag(&self.mac, key, value).await
    }

    pub async fn delete_flag(&self, key: &str) -> Result<()> {
        self.registry.delete_flag(&self.mac, key).await
    }

    pub async fn get_and_delete_flag(&self, key: &str) -> Result<String> {
        self.registry.get_and_delete_flag(&self.mac, key).await
    }
}

#[async_trait]
impl FlagAccess for MachineInterface {
    async fn resolve(&self, key: &str) -> Result<String> {
        self.get_flag(key).await
    }

    async fn assign(&self, key: &str, value: &str) -> Result<()> {
        self.set_flag(key, value).await
    }

    async fn take_and_clear(&self, key: &str) -> Result<String> {
        self.get_and_delete_flag(key).await
    }

    async fn clear(&self, key: &str) -> Result<()> {
        self.delete_flag(key).await
    }
}
