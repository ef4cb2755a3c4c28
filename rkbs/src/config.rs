use anyhow::{Context, Result};
use libdatasource::DatasourceConfig;
use serde::Deserialize;
use std::fs;
use std::path::Path;

#[derive(Debug, Deserialize)]
pub struct Config {
    // env_logger filter, RUST_LOG still wins
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(flatten)]
    pub datasource: DatasourceConfig,
}

fn default_log_level() -> String {
    "info".to_string()
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config from {}", path.display()))?;
    let cfg: Config = serde_yaml::from_str(&content).context("Failed to parse YAML config")?;
    cfg.datasource
        .validate()
        .with_context(|| format!("Invalid config in {}", path.display()))?;
    Ok(cfg)
}
