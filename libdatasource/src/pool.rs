use std::collections::BTreeMap;
use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;
use std::sync::Arc;

use ipnetwork::Ipv4Network;
use log::{info, warn};
use serde::{Deserialize, Deserializer, Serialize};

use crate::election::LeaderElection;
use crate::error::{DatasourceError, Result};
use crate::machine::MacAddress;
use crate::retry::{RetryPolicy, retry_on_conflict};
use crate::store::CoordinationStore;

/// Largest pool accepted by configuration. The allocation table is one
/// JSON value of at most ~38 bytes per entry, and a full table must stay
/// under the store's request size limit (1.5 MiB by default on etcd).
pub const MAX_POOL_SIZE: u64 = 32_768;

/// Contiguous, inclusive range of IPv4 addresses handed out to machines.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddressPool {
    start: Ipv4Addr,
    end: Ipv4Addr,
}

impl AddressPool {
    pub fn new(start: Ipv4Addr, end: Ipv4Addr) -> Result<Self> {
        if start > end {
            return Err(DatasourceError::InvalidConfig(format!(
                "pool start {start} is after pool end {end}"
            )));
        }
        Ok(Self { start, end })
    }

    /// Usable hosts of a network; network and broadcast addresses are
    /// skipped for prefixes up to /30.
    pub fn from_network(net: Ipv4Network) -> Result<Self> {
        let first = u32::from(net.network());
        let last = u32::from(net.broadcast());
        if net.prefix() >= 31 {
            return Self::new(first.into(), last.into());
        }
        Self::new((first + 1).into(), (last - 1).into())
    }

    pub fn start(&self) -> Ipv4Addr {
        self.start
    }

    pub fn end(&self) -> Ipv4Addr {
        self.end
    }

    pub fn size(&self) -> u64 {
        u64::from(u32::from(self.end)) - u64::from(u32::from(self.start)) + 1
    }

    pub fn contains(&self, ip: Ipv4Addr) -> bool {
        self.start <= ip && ip <= self.end
    }

    /// Addresses in ascending order.
    pub fn addresses(self) -> impl Iterator<Item = Ipv4Addr> {
        (u32::from(self.start)..=u32::from(self.end)).map(Ipv4Addr::from)
    }
}

impl FromStr for AddressPool {
    type Err = DatasourceError;

    /// Accepts `10.0.0.2-10.0.0.254`, `10.0.0.0/24` or a single address.
    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        let bad = |e: &dyn fmt::Display| {
            DatasourceError::InvalidConfig(format!("bad address pool {s:?}: {e}"))
        };

        if let Some((start, end)) = s.split_once('-') {
            let start = start.trim().parse::<Ipv4Addr>().map_err(|e| bad(&e))?;
            let end = end.trim().parse::<Ipv4Addr>().map_err(|e| bad(&e))?;
            return Self::new(start, end);
        }
        if s.contains('/') {
            let net = s.parse::<Ipv4Network>().map_err(|e| bad(&e))?;
            return Self::from_network(net);
        }
        let ip = s.parse::<Ipv4Addr>().map_err(|e| bad(&e))?;
        Self::new(ip, ip)
    }
}

impl fmt::Display for AddressPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.start, self.end)
    }
}

impl<'de> Deserialize<'de> for AddressPool {
    fn deserialize<D: Deserializer<'de>>(d: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(d)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Persisted allocation set. The key's store version doubles as the
/// allocation cursor: every allocation is a compare-and-swap against it.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AllocationTable {
    #[serde(rename = "Allocations", default)]
    pub allocations: BTreeMap<Ipv4Addr, MacAddress>,
}

impl AllocationTable {
    pub fn address_of(&self, mac: &MacAddress) -> Option<Ipv4Addr> {
        self.allocations
            .iter()
            .find(|(_, m)| *m == mac)
            .map(|(ip, _)| *ip)
    }

    /// The preferred address when it is in the pool and free, otherwise the
    /// lowest free address of the pool.
    pub fn pick(&self, pool: &AddressPool, preferred: Option<Ipv4Addr>) -> Option<Ipv4Addr> {
        if let Some(ip) = preferred {
            if pool.contains(ip) && !self.allocations.contains_key(&ip) {
                return Some(ip);
            }
            warn!("Preferred address {ip} is outside {pool} or taken, picking the lowest free");
        }
        pool.addresses().find(|ip| !self.allocations.contains_key(ip))
    }
}

/// Hands out pool addresses to MAC addresses.
///
/// Reads are served by any instance; extending the allocation set requires
/// holding the leadership lease.
pub struct Allocator {
    store: Arc<dyn CoordinationStore>,
    election: Arc<LeaderElection>,
    pool: AddressPool,
    key: String,
    retry: RetryPolicy,
}

impl Allocator {
    pub fn new(
        store: Arc<dyn CoordinationStore>,
        election: Arc<LeaderElection>,
        pool: AddressPool,
        prefix: &str,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            store,
            election,
            pool,
            key: format!("{prefix}/pool/allocations"),
            retry,
        }
    }

    pub fn pool(&self) -> &AddressPool {
        &self.pool
    }

    async fn load(&self) -> Result<(AllocationTable, i64)> {
        match self.store.get(&self.key).await? {
            Some(v) => Ok((serde_json::from_slice(&v.value)?, v.version)),
            None => Ok((AllocationTable::default(), 0)),
        }
    }

    pub async fn lookup(&self, mac: &MacAddress) -> Result<Option<Ipv4Addr>> {
        let (table, _) = self.load().await?;
        Ok(table.address_of(mac))
    }

    pub async fn allocations(&self) -> Result<Vec<(Ipv4Addr, MacAddress)>> {
        let (table, _) = self.load().await?;
        Ok(table.allocations.into_iter().collect())
    }

    /// Returns the address bound to `mac`, binding a new one first when
    /// `create_if_missing` is set. An existing binding is never changed.
    pub async fn allocate(
        &self,
        mac: &MacAddress,
        create_if_missing: bool,
        preferred: Option<Ipv4Addr>,
    ) -> Result<Ipv4Addr> {
        if let Some(ip) = self.lookup(mac).await? {
            return Ok(ip);
        }
        if !create_if_missing {
            return Err(DatasourceError::not_found(format!("address for {mac}")));
        }

        retry_on_conflict(self.retry, "allocate", || self.try_allocate(mac, preferred)).await
    }

    async fn try_allocate(&self, mac: &MacAddress, preferred: Option<Ipv4Addr>) -> Result<Ipv4Addr> {
        self.election.ensure_writable()?;

        let (mut table, version) = self.load().await?;
        if let Some(ip) = table.address_of(mac) {
            return Ok(ip);
        }

        let ip = table
            .pick(&self.pool, preferred)
            .ok_or(DatasourceError::PoolExhausted)?;
        table.allocations.insert(ip, *mac);

        let value = serde_json::to_vec(&table)?;
        if !self
            .store
            .compare_and_swap(&self.key, version, value, None)
            .await?
        {
            return Err(DatasourceError::Conflict);
        }

        info!("Allocated {ip} to {mac} from pool {}", self.pool);
        Ok(ip)
    }
}
