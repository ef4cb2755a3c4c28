mod cli;
mod config;

use crate::config::load_config;
use anyhow::Context;
use clap::Parser;
use cli::{Cli, Commands};
use libdatasource::{Datasource, DatasourceConfig, DatasourceError};
use log::{error, info, warn};
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match &cli.command {
        Commands::Start { config } => {
            let cfg = load_config(config)?;
            env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(&cfg.log_level))
                .format_timestamp_secs()
                .target(env_logger::Target::Stdout)
                .init();
            run(cfg.datasource).await?;
        }
    }

    Ok(())
}

async fn run(config: DatasourceConfig) -> anyhow::Result<()> {
    let ds = Datasource::connect(config)
        .await
        .context("Failed to connect to xline")?;
    info!(
        "[rkbs] {} serving cluster {} from {}",
        ds.version(),
        ds.cluster_name(),
        ds.workspace_path().display()
    );

    let cancel = CancellationToken::new();
    let signal = cancel.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("received Ctrl-C, shutting down"),
            Err(e) => error!("failed to listen for Ctrl-C: {e}"),
        }
        signal.cancel();
    });

    let result = hold_leadership(&ds, &cancel).await;
    if let Err(e) = ds.shutdown().await {
        warn!("shutdown did not release leadership cleanly: {e}");
    }
    result
}

/// Campaigns until leader, then again every time leadership is lost.
async fn hold_leadership(ds: &Datasource, cancel: &CancellationToken) -> anyhow::Result<()> {
    let mut leadership = ds.subscribe_leadership();
    loop {
        match ds.campaign(cancel).await {
            Ok(()) => info!("instance {} is now the leader", ds.instance_id()),
            Err(DatasourceError::Closed) if cancel.is_cancelled() => return Ok(()),
            Err(e) => return Err(e).context("leader campaign failed"),
        }

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                changed = leadership.changed() => {
                    changed.context("leadership watch closed")?;
                    if !*leadership.borrow_and_update() {
                        warn!("instance {} lost leadership, campaigning again", ds.instance_id());
                        break;
                    }
                }
            }
        }
    }
}
