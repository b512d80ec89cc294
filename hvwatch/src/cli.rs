//! CLI argument parsing for HVWatch

use std::path::PathBuf;

use clap::Parser;

/// Hypervisor watcher - evacuates VMs off compute nodes reported down
#[derive(Debug, Parser)]
#[command(name = "hvwatch")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "/etc/hvwatch/config.yaml")]
    pub config: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info", env = "HVWATCH_LOG_LEVEL")]
    pub log_level: String,

    /// Output logs in JSON format
    #[arg(long, default_value = "false", env = "HVWATCH_LOG_JSON")]
    pub log_json: bool,

    /// Dry run mode - log evacuations but don't issue them
    #[arg(long, default_value = "false")]
    pub dry_run: bool,

    /// Run a single reconciliation cycle and exit
    #[arg(long)]
    pub once: bool,
}

impl Cli {
    /// Parse CLI arguments
    pub fn parse_args() -> Self {
        Self::parse()
    }
}
