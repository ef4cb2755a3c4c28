use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "rkbs", version, about = "RK8s bare-metal bootstrap daemon")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start the bootstrap control plane with a config file
    Start {
        #[arg(short, long)]
        config: PathBuf,
    },
}
