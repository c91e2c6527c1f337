#![deny(clippy::expect_used)]
#![deny(clippy::unwrap_used)]
#![cfg_attr(test, allow(clippy::expect_used, clippy::unwrap_used))]

mod cmd;

use anyhow::{Context, Result};
use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use std::io::IsTerminal;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing_subscriber::prelude::*;

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Ionify::parse();

    let colored = init_color(&cli);

    tracing_subscriber::registry()
        // Filter spans based on the RUST_LOG env var.
        .with(eval_logging(&cli))
        // Send a copy of all spans to stdout as JSON.
        .with(
            tracing_subscriber::fmt::layer()
                .with_ansi(colored)
                .with_target(false)
                .with_level(true)
                .compact(),
        )
        // Install this registry as the global tracing registry.
        .try_init()
        .context("error initializing logging")?;

    tracing::info!(
        "starting {} {}",
        env!("CARGO_PKG_NAME"),
        env!("CARGO_PKG_VERSION")
    );

    Ok(match cli.run().await {
        Err(err) => {
            tracing::error!("{err}");
            for (n, cause) in err.chain().enumerate().skip(1) {
                tracing::info!("  {n}: {cause}");
            }
            ExitCode::FAILURE
        }
        Ok(()) => ExitCode::SUCCESS,
    })
}

fn init_color(cli: &Ionify) -> bool {
    if cli.no_color {
        return false;
    }

    match cli.color {
        ColorMode::Always => true,
        ColorMode::Never => false,
        ColorMode::Auto => std::io::stdout().is_terminal(),
    }
}

fn eval_logging(cli: &Ionify) -> tracing_subscriber::EnvFilter {
    // allow overriding everything with RUST_LOG or --log
    if let Some(directives) = &cli.log {
        return tracing_subscriber::EnvFilter::new(directives);
    }

    // allow some sub-commands to be more silent, as their main purpose is to output to the console
    let prefer_silence = cli.prefer_silence();

    let silent = cli.quiet || prefer_silence;

    let directives = match (cli.verbose, silent) {
        // quiet overrides verbose
        (_, true) => "error,ionify=warn",
        // increase verbosity
        (0, false) => "error,ionify=info",
        (1, false) => "error,ionify=debug",
        (_, false) => "error,ionify=trace",
    };

    tracing_subscriber::EnvFilter::new(directives)
}

/// Build, watch & serve a web application from its dependency graph.
#[derive(Parser)]
#[command(about, author, version)]
struct Ionify {
    #[command(subcommand)]
    action: IonifySubcommands,
    /// Path to the Ionify config file
    #[arg(long, env = "IONIFY_CONFIG", global(true))]
    pub config: Option<PathBuf>,
    /// Enable verbose logging.
    #[arg(short, long, global(true), action=ArgAction::Count)]
    pub verbose: u8,
    /// Be more quiet, conflicts with --verbose
    #[arg(short, long, global(true), conflicts_with("verbose"))]
    pub quiet: bool,
    /// Provide a RUST_LOG filter, conflicts with --verbose and --quiet
    #[arg(long, global(true), conflicts_with_all(["verbose", "quiet"]), env("RUST_LOG"))]
    pub log: Option<String>,

    /// Color mode
    #[arg(long, env = "IONIFY_COLOR", global(true), value_enum, conflicts_with = "no_color", default_value_t = ColorMode::Auto)]
    pub color: ColorMode,

    /// Support for `NO_COLOR` environment variable
    #[arg(long, env = "NO_COLOR", global(true))]
    pub no_color: bool,
}

impl Ionify {
    pub fn prefer_silence(&self) -> bool {
        matches!(self.action, IonifySubcommands::Config(_))
    }
}

#[derive(Clone, Debug, Default, ValueEnum)]
#[value(rename_all = "lower")]
enum ColorMode {
    /// Enable color when running on a TTY
    #[default]
    Auto,
    /// Always enable color
    Always,
    /// Never enable color
    Never,
}

impl Ionify {
    #[tracing::instrument(level = "trace", skip(self))]
    pub async fn run(self) -> Result<()> {
        match self.action {
            IonifySubcommands::Build(inner) => inner.run(self.config).await,
            IonifySubcommands::Watch(inner) => inner.run(self.config).await,
            IonifySubcommands::Serve(inner) => inner.run(self.config).await,
            IonifySubcommands::Clean(inner) => inner.run(self.config).await,
            IonifySubcommands::Config(inner) => inner.run(self.config).await,
        }
    }
}

#[derive(Subcommand)]
enum IonifySubcommands {
    /// Build every module reachable from the configured entry points once.
    Build(cmd::build::Build),
    /// Build, then stay resident and re-transform whatever changes.
    Watch(cmd::watch::Watch),
    /// Build, watch & serve the app with hot module replacement.
    Serve(cmd::serve::Serve),
    /// Clean build output and/or stale content-addressable store entries.
    Clean(cmd::clean::Clean),
    /// Inspect Ionify's effective configuration.
    Config(cmd::config::Config),
}

#[cfg(test)]
mod tests {
    use crate::Ionify;

    #[test]
    fn verify_cli() {
        use clap::CommandFactory;
        Ionify::command().debug_assert();
    }
}
