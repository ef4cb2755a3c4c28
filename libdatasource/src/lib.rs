//! Control-plane core of the rk8s bare-metal bootstrap server.
//!
//! Tracks every machine that network-boots against the cluster, hands each
//! one a stable address from a configured pool, keeps per-machine flags and
//! cluster-wide variables, and elects the single instance allowed to change
//! any of it. All state lives in an xline (etcd v3) cluster; see
//! [`store::CoordinationStore`].

pub mod config;
pub mod datasource;
pub mod election;
pub mod error;
pub mod interface;
mod keyspace;
pub mod machine;
pub mod pool;
pub mod registry;
pub mod retry;
pub mod store;
pub mod variables;

pub use config::DatasourceConfig;
pub use datasource::Datasource;
pub use election::{ElectionConfig, LeaderElection, LeaderRecord};
pub use error::{DatasourceError, Result};
pub use interface::{FlagAccess, MachineInterface};
pub use machine::{MacAddress, Machine};
pub use pool::AddressPool;
pub use store::{CoordinationStore, MemoryStore, XlineConfig, XlineStore};
