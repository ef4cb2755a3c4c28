use std::collections::BTreeMap;
use std::net::Ipv4Addr;
use std::sync::Arc;

use chrono::Utc;
use log::{info, warn};

use crate::election::LeaderElection;
use crate::error::{DatasourceError, Result};
use crate::keyspace::KeySpace;
use crate::machine::{MacAddress, Machine, MachineInfo, derive_hostname};
use crate::pool::Allocator;
use crate::retry::{RetryPolicy, retry_on_conflict};
use crate::store::CoordinationStore;

/// Per-machine records and flags.
///
/// Layout below the cluster prefix:
/// `machines/{mac}/info` holds the JSON [`MachineInfo`],
/// `machines/{mac}/flags/{name}` holds one flag each.
pub struct NodeRegistry {
    store: Arc<dyn CoordinationStore>,
    election: Arc<LeaderElection>,
    allocator: Arc<Allocator>,
    dir: String,
    hostname_prefix: String,
    retry: RetryPolicy,
}

impl NodeRegistry {
    pub fn new(
        store: Arc<dyn CoordinationStore>,
        election: Arc<LeaderElection>,
        allocator: Arc<Allocator>,
        prefix: &str,
        hostname_prefix: &str,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            store,
            election,
            allocator,
            dir: format!("{prefix}/machines"),
            hostname_prefix: hostname_prefix.to_string(),
            retry,
        }
    }

    fn info_key(&self, mac: &MacAddress) -> String {
        format!("{}/{}/info", self.dir, mac.key())
    }

    fn flags(&self, mac: &MacAddress) -> KeySpace<'_> {
        KeySpace::new(
            self.store.as_ref(),
            self.election.as_ref(),
            format!("{}/{}/flags", self.dir, mac.key()),
            self.retry,
        )
    }

    pub async fn get_flag(&self, mac: &MacAddress, name: &str) -> Result<String> {
        self.flags(mac).get(name).await
    }

    pub async fn list_flags(&self, mac: &MacAddress) -> Result<BTreeMap<String, String>> {
        self.flags(mac).list().await
    }

    pub async fn set_flag(&self, mac: &MacAddress, name: &str, value: &str) -> Result<()> {
        self.flags(mac).set(name, value).await
    }

    /// Deleting a flag that is not set succeeds.
    pub async fn delete_flag(&self, mac: &MacAddress, name: &str) -> Result<()> {
        self.flags(mac).delete(name).await
    }

    pub async fn get_and_delete_flag(&self, mac: &MacAddress, name: &str) -> Result<String> {
        self.flags(mac).take(name).await
    }

    async fn load_info(&self, mac: &MacAddress) -> Result<Option<(MachineInfo, i64)>> {
        match self.store.get(&self.info_key(mac)).await? {
            Some(v) => Ok(Some((serde_json::from_slice(&v.value)?, v.version))),
            None => Ok(None),
        }
    }

    /// Looks up the machine behind `mac`, registering it first when
    /// `create_if_missing` is set. `preferred` is a hint for the address of a
    /// machine seen for the first time.
    pub async fn machine(
        &self,
        mac: &MacAddress,
        create_if_missing: bool,
        preferred: Option<Ipv4Addr>,
    ) -> Result<Machine> {
        if let Some((info, _)) = self.load_info(mac).await? {
            return Ok(Machine::from_info(*mac, info));
        }

        let ip = self
            .allocator
            .allocate(mac, create_if_missing, preferred)
            .await?;
        let now = Utc::now();
        let info = MachineInfo {
            ip,
            hostname: derive_hostname(&self.hostname_prefix, ip),
            first_seen: now,
            last_seen: now,
        };

        // An address without a record (e.g. after a crash between the two
        // writes) is served as-is by non-leaders and completed by the leader.
        if !self.election.is_leader() {
            return Ok(Machine::from_info(*mac, info));
        }

        let value = serde_json::to_vec(&info)?;
        if self
            .store
            .compare_and_swap(&self.info_key(mac), 0, value, None)
            .await?
        {
            info!("Registered machine {} as {}", mac, info.hostname);
            return Ok(Machine::from_info(*mac, info));
        }

        match self.load_info(mac).await? {
            Some((stored, _)) => Ok(Machine::from_info(*mac, stored)),
            None => Err(DatasourceError::Conflict),
        }
    }

    /// Records that the machine has just booted against this control plane.
    pub async fn check_in(&self, mac: &MacAddress) -> Result<Machine> {
        let key = &self.info_key(mac);
        retry_on_conflict(self.retry, "check_in", || async move {
            self.election.ensure_writable()?;
            let (mut info, version) = self
                .load_info(mac)
                .await?
                .ok_or_else(|| DatasourceError::not_found(format!("machine {mac}")))?;
            info.last_seen = Utc::now();
            let value = serde_json::to_vec(&info)?;
            if !self
                .store
                .compare_and_swap(key, version, value, None)
                .await?
            {
                return Err(DatasourceError::Conflict);
            }
            Ok(Machine::from_info(*mac, info))
        })
        .await
    }

    /// Every registered machine, ordered by address.
    pub async fn list_machines(&self) -> Result<Vec<Machine>> {
        let prefix = format!("{}/", self.dir);
        let mut machines = Vec::new();
        for (key, v) in self.store.get_prefix(&prefix).await? {
            let Some(mac) = machine_of_info_key(&key[prefix.len()..]) else {
                continue;
            };
            let mac: MacAddress = match mac.parse() {
                Ok(mac) => mac,
                Err(e) => {
                    warn!("Ignoring machine record under bad key {key}: {e}");
                    continue;
                }
            };
            match serde_json::from_slice::<MachineInfo>(&v.value) {
                Ok(info) => machines.push(Machine::from_info(mac, info)),
                Err(e) => warn!("Ignoring unreadable machine record {key}: {e}"),
            }
        }
        machines.sort_by_key(|m| m.ip);
        Ok(machines)
    }
}

/// `{mac}/info` below the machines directory; flags such as
/// `{mac}/flags/info` do not count.
fn machine_of_info_key(rest: &str) -> Option<&str> {
    rest.strip_suffix("/info").filter(|mac| !mac.contains('/'))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_info_key_matching() {
        assert_eq!(
            machine_of_info_key("52:54:00:00:00:01/info"),
            Some("52:54:00:00:00:01")
        );
        assert_eq!(machine_of_info_key("52:54:00:00:00:01/flags/info"), None);
        assert_eq!(machine_of_info_key("52:54:00:00:00:01/flags/state"), None);
    }
}
