use std::path::PathBuf;
use std::time::Duration;

use rand::Rng;
use serde::Deserialize;

use crate::election::{DEFAULT_LEASE_TTL, DEFAULT_MAX_RENEW_FAILURES, ElectionConfig};
use crate::error::{DatasourceError, Result};
use crate::pool::{AddressPool, MAX_POOL_SIZE};
use crate::store::XlineConfig;

const MIN_LEASE_TTL_SECS: u64 = 3;

#[derive(Debug, Clone, Deserialize)]
pub struct DatasourceConfig {
    pub cluster_name: String,
    pub workspace: PathBuf,
    pub pool: AddressPool,
    #[serde(default = "default_hostname_prefix")]
    pub hostname_prefix: String,
    pub xline_config: XlineConfig,
    #[serde(default)]
    pub election: ElectionSettings,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ElectionSettings {
    #[serde(default = "default_lease_ttl")]
    pub lease_ttl_secs: u64,
    #[serde(default = "default_max_renew_failures")]
    pub max_renew_failures: u32,
    pub instance_id: Option<String>,
}

impl Default for ElectionSettings {
    fn default() -> Self {
        Self {
            lease_ttl_secs: default_lease_ttl(),
            max_renew_failures: default_max_renew_failures(),
            instance_id: None,
        }
    }
}

fn default_hostname_prefix() -> String {
    "node".to_string()
}

fn default_lease_ttl() -> u64 {
    DEFAULT_LEASE_TTL.as_secs()
}

fn default_max_renew_failures() -> u32 {
    DEFAULT_MAX_RENEW_FAILURES
}

/// `HOSTNAME`-pid-random, unique enough to tell instances apart in the leader key.
pub fn default_instance_id() -> String {
    let host = std::env::var("HOSTNAME").unwrap_or_else(|_| "rkbs".to_string());
    let salt: u16 = rand::rng().random();
    format!("{host}-{}-{salt:04x}", std::process::id())
}

impl DatasourceConfig {
    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: String| Err(DatasourceError::InvalidConfig(msg));

        if self.cluster_name.trim().is_empty() {
            return invalid("cluster_name must not be empty".to_string());
        }
        if self.pool.size() > MAX_POOL_SIZE {
            return invalid(format!(
                "pool {} holds {} addresses, at most {MAX_POOL_SIZE} are supported",
                self.pool,
                self.pool.size()
            ));
        }
        if self.xline_config.endpoints.is_empty() {
            return invalid("at least one xline endpoint is required".to_string());
        }
        let prefix = &self.xline_config.prefix;
        if !prefix.starts_with('/') || prefix.ends_with('/') {
            return invalid(format!(
                "key prefix {prefix:?} must start with '/' and not end with one"
            ));
        }
        if self.election.lease_ttl_secs < MIN_LEASE_TTL_SECS {
            return invalid(format!(
                "lease_ttl_secs ({}) must be at least {MIN_LEASE_TTL_SECS}",
                self.election.lease_ttl_secs
            ));
        }
        if self.election.max_renew_failures == 0 {
            return invalid("max_renew_failures must be positive".to_string());
        }
        Ok(())
    }

    pub fn election_config(&self) -> ElectionConfig {
        ElectionConfig {
            instance_id: self
                .election
                .instance_id
                .clone()
                .unwrap_or_else(default_instance_id),
            lease_ttl: Duration::from_secs(self.election.lease_ttl_secs),
            max_renew_failures: self.election.max_renew_failures,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> DatasourceConfig {
        DatasourceConfig {
            cluster_name: "c".to_string(),
            workspace: PathBuf::from("/tmp/ws"),
            pool: "10.0.0.2-10.0.0.10".parse().unwrap(),
            hostname_prefix: default_hostname_prefix(),
            xline_config: XlineConfig::new(vec!["http://127.0.0.1:2379".to_string()]),
            election: ElectionSettings::default(),
        }
    }

    #[test]
    fn test_validate() {
        assert!(base().validate().is_ok());

        let mut cfg = base();
        cfg.xline_config.endpoints.clear();
        assert!(cfg.validate().is_err());

        let mut cfg = base();
        cfg.election.lease_ttl_secs = 1;
        assert!(cfg.validate().is_err());

        let mut cfg = base();
        cfg.xline_config.prefix = "/rkbs/".to_string();
        assert!(cfg.validate().is_err());

        let mut cfg = base();
        cfg.cluster_name = " ".to_string();
        assert!(cfg.validate().is_err());

        // A /16 would outgrow a single allocation-table value, a /17 fits.
        let mut cfg = base();
        cfg.pool = "10.0.0.0/16".parse().unwrap();
        assert!(matches!(
            cfg.validate(),
            Err(DatasourceError::InvalidConfig(_))
        ));
        cfg.pool = "10.0.0.0/17".parse().unwrap();
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_election_config_defaults() {
        let cfg = base().election_config();
        assert_eq!(cfg.lease_ttl, Duration::from_secs(15));
        assert_eq!(cfg.renew_interval(), Duration::from_secs(5));
        assert!(!cfg.instance_id.is_empty());

        let mut base = base();
        base.election.instance_id = Some("cp-1".to_string());
        assert_eq!(base.election_config().instance_id, "cp-1");
    }
}
