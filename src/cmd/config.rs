//! `config show`: print the effective, on-disk-plus-override configuration
//! a command would actually run with — both the raw `IonifyConfig` and the
//! canonicalized `RtcCore` (which carries the `VersionHash` the Version
//! Canonicalizer computed from it).

use anyhow::{Context, Result};
use clap::{Args, Subcommand};
use ionify::config;
use std::path::PathBuf;

#[derive(Clone, Debug, Args)]
#[command(name = "config")]
pub struct Config {
    #[command(subcommand)]
    command: Command,
}

#[derive(Clone, Debug, Subcommand)]
enum Command {
    /// Show Ionify's effective configuration.
    Show {
        /// Project root to resolve relative paths against [default: current
        /// directory]
        #[arg(long, env = "IONIFY_ROOT")]
        root: Option<PathBuf>,
    },
}

impl Config {
    #[tracing::instrument(level = "trace", skip(self, config_path))]
    pub async fn run(self, config_path: Option<PathBuf>) -> Result<()> {
        match self.command {
            Command::Show { root } => {
                let cwd = std::env::current_dir().context("reading current directory")?;
                let path = config_path.unwrap_or_else(|| cwd.join(config::CONFIG_FILE_NAME));
                let mut cfg = config::load(&path)?;
                if let Some(root) = root {
                    cfg.root = root;
                }
                println!("{cfg:#?}");
                let rtc = config::rt::build(cfg, &cwd)?;
                println!("---");
                println!("{rtc:#?}");
            }
        }
        Ok(())
    }
}
