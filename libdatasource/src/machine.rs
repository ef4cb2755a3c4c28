use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use macaddr::MacAddr6;
use serde::{Deserialize, Serialize};

use crate::error::{DatasourceError, Result};

/// Hardware address of a network-booting machine, the registry's natural key.
///
/// Rendered lowercase with colons so the same card always maps to the same
/// store key regardless of how a caller spelled it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MacAddress(MacAddr6);

impl MacAddress {
    pub fn new(bytes: [u8; 6]) -> Self {
        let [a, b, c, d, e, f] = bytes;
        MacAddress(MacAddr6::new(a, b, c, d, e, f))
    }

    pub fn into_inner(self) -> MacAddr6 {
        self.0
    }

    /// Path segment used under `{prefix}/machines/`.
    pub fn key(&self) -> String {
        self.to_string()
    }
}

impl From<MacAddr6> for MacAddress {
    fn from(mac: MacAddr6) -> Self {
        MacAddress(mac)
    }
}

impl FromStr for MacAddress {
    type Err = DatasourceError;

    fn from_str(s: &str) -> Result<Self> {
        MacAddr6::from_str(s.trim())
            .map(MacAddress)
            .map_err(|e| DatasourceError::InvalidKey(format!("{s} ({e})")))
    }
}

impl fmt::Display for MacAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let b = self.0.as_bytes();
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            b[0], b[1], b[2], b[3], b[4], b[5]
        )
    }
}

impl Serialize for MacAddress {
    fn serialize<S: serde::Serializer>(&self, s: S) -> std::result::Result<S::Ok, S::Error> {
        s.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for MacAddress {
    fn deserialize<D: serde::Deserializer<'de>>(d: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(d)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Persisted per-machine record, stored as JSON under `{prefix}/machines/{mac}/info`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MachineInfo {
    #[serde(rename = "IP")]
    pub ip: Ipv4Addr,
    #[serde(rename = "Hostname")]
    pub hostname: String,
    #[serde(rename = "FirstSeen")]
    pub first_seen: DateTime<Utc>,
    #[serde(rename = "LastSeen")]
    pub last_seen: DateTime<Utc>,
}

/// A registered machine as handed to the renderer and the API layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Machine {
    pub mac: MacAddress,
    pub ip: Ipv4Addr,
    pub hostname: String,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

impl Machine {
    pub fn from_info(mac: MacAddress, info: MachineInfo) -> Self {
        Machine {
            mac,
            ip: info.ip,
            hostname: info.hostname,
            first_seen: info.first_seen,
            last_seen: info.last_seen,
        }
    }
}

impl fmt::Display for Machine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}, {})", self.hostname, self.mac, self.ip)
    }
}

/// `10.10.10.2` with prefix `node` becomes `node-10-10-10-2`.
pub fn derive_hostname(prefix: &str, ip: Ipv4Addr) -> String {
    let [a, b, c, d] = ip.octets();
    if prefix.is_empty() {
        format!("{a}-{b}-{c}-{d}")
    } else {
        format!("{prefix}-{a}-{b}-{c}-{d}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mac_normalisation() {
        let a: MacAddress = "FF:FF:FF:FF:FF:FE".parse().unwrap();
        let b: MacAddress = "ff-ff-ff-ff-ff-fe".parse().unwrap();
        assert_eq!(a, b);
        assert_eq!(a.key(), "ff:ff:ff:ff:ff:fe");
        assert!("not-a-mac".parse::<MacAddress>().is_err());
    }

    #[test]
    fn test_hostname_derivation() {
        let ip = Ipv4Addr::new(10, 10, 10, 2);
        assert_eq!(derive_hostname("node", ip), "node-10-10-10-2");
        assert_eq!(derive_hostname("", ip), "10-10-10-2");
    }

    #[test]
    fn test_machine_info_json_shape() {
        let now = Utc::now();
        let info = MachineInfo {
            ip: Ipv4Addr::new(10, 0, 0, 7),
            hostname: "node-10-0-0-7".to_string(),
            first_seen: now,
            last_seen: now,
        };
        let json = serde_json::to_value(&info).unwrap();
        assert_eq!(json["IP"], "10.0.0.7");
        assert_eq!(json["Hostname"], "node-10-0-0-7");
    }
}
