//! capa-gc CLI library

pub mod commands;
pub mod error;

pub use error::{Error, Result};

use clap::{Parser, Subcommand};

/// capa-gc - external-resource garbage collection for CAPA clusters
#[derive(Parser, Debug)]
#[command(name = "capa-gc")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to the kubeconfig of the management cluster
    #[arg(long, global = true, env = "CAPA_GC_KUBECONFIG")]
    pub kubeconfig: Option<String>,

    /// Emit logs as JSON
    #[arg(long, global = true, env = "CAPA_GC_JSON_LOGS")]
    pub json_logs: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Mark a cluster so its external resources are collected on deletion
    Enable(commands::gc::GcArgs),
    /// Opt a cluster out of external-resource collection
    Disable(commands::gc::GcArgs),
    /// Choose which resource kinds are collected for a cluster
    Configure(commands::gc::ConfigureArgs),
}

impl Cli {
    /// Run the CLI command
    pub async fn run(self) -> Result<()> {
        let kubeconfig = self.kubeconfig.as_deref();
        match self.command {
            Commands::Enable(args) => commands::gc::enable(kubeconfig, args).await,
            Commands::Disable(args) => commands::gc::disable(kubeconfig, args).await,
            Commands::Configure(args) => commands::gc::configure(kubeconfig, args).await,
        }
    }
}
