//! CLI argument definitions for the `arbokd` daemon.

use clap::Parser;
use std::path::PathBuf;

/// Arbok tunnel server
#[derive(Parser)]
#[command(name = "arbokd", version, about = "Expose local services over encrypted tunnels")]
pub struct Cli {
    /// Path to the configuration file
    #[arg(long, default_value = "config.sample.toml")]
    pub config: PathBuf,
}
