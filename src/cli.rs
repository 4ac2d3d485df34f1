//! Thin CLI front-end: loads config and drives `PercyCore`'s public
//! lifecycle operations. No browser automation lives here.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "percy-core", version, about = "Local daemon for visual-snapshot asset discovery")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Load config, start the core, and block until SIGINT/SIGTERM.
    Start {
        #[arg(long, value_name = "PATH")]
        config: PathBuf,

        /// Overrides `config.port`.
        #[arg(long)]
        port: Option<u16>,

        /// Overrides `config.server` to false.
        #[arg(long)]
        no_server: bool,
    },

    /// Load and validate config without starting anything.
    Validate {
        #[arg(long, value_name = "PATH")]
        config: PathBuf,
    },

    /// Print whether a running instance is reachable and its last known state.
    Health {
        #[arg(long, default_value_t = crate::config::Config::default().port)]
        port: u16,
    },
}

/// Loads a config file, merges `PERCY_TOKEN`/env overrides (file < env <
/// CLI-flag precedence).
pub fn load_config(path: &std::path::Path) -> anyhow::Result<crate::config::Config> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow::anyhow!("failed to read config file {}: {e}", path.display()))?;
    let config: crate::config::Config = serde_json::from_str(&raw)
        .map_err(|e| anyhow::anyhow!("failed to parse config file {}: {e}", path.display()))?;
    Ok(config.apply_env_overrides())
}
