//! converge CLI library

pub mod commands;
pub mod config;
pub mod error;

pub use error::{Error, Result};

use clap::{Args, Parser, Subcommand};

/// converge - declarative reconciliation client for Kyma clusters
#[derive(Parser, Debug)]
#[command(name = "converge")]
#[command(version, about, long_about = None)]
pub struct Cli {
    #[command(flatten)]
    pub global: GlobalArgs,

    #[command(subcommand)]
    pub command: Commands,
}

/// Flags shared by every command; unset values fall back to
/// `~/.converge/config.json` and then to built-in defaults
#[derive(Args, Debug, Clone, Default)]
pub struct GlobalArgs {
    /// Path to the kubeconfig file
    #[arg(long, global = true)]
    pub kubeconfig: Option<String>,

    /// Name of the Kyma resource
    #[arg(long, global = true)]
    pub kyma_name: Option<String>,

    /// Namespace of the Kyma resource
    #[arg(long, short = 'n', global = true)]
    pub namespace: Option<String>,

    /// Field manager recorded for server-side apply
    #[arg(long, global = true)]
    pub field_owner: Option<String>,

    /// How long to wait for readiness (e.g. 90s, 5m)
    #[arg(long, global = true)]
    pub timeout: Option<String>,

    /// Enable debug logging
    #[arg(long, short = 'v', global = true)]
    pub verbose: bool,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Server-side apply every object in a manifest
    Apply(commands::apply::ApplyArgs),
    /// Enable, disable and inspect Kyma modules
    Module(commands::module::ModuleArgs),
    /// Block until the Kyma resource is ready
    Wait(commands::wait::WaitArgs),
}

impl Cli {
    /// Run the CLI command
    pub async fn run(self) -> Result<()> {
        match self.command {
            Commands::Apply(args) => commands::apply::run(&self.global, args).await,
            Commands::Module(args) => commands::module::run(&self.global, args).await,
            Commands::Wait(args) => commands::wait::run(&self.global, args).await,
        }
    }
}
