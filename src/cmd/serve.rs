//! `serve`: run the Dev Dispatcher (C11) against the project root — a
//! background task drains the Watcher (C7) into `dispatcher::handle_change`,
//! and one HTTP listener is bound per configured address (`spec.md` §6),
//! all sharing the same graceful-shutdown broadcast.

use crate::cmd::runtime::Runtime;
use anyhow::{Context, Result};
use clap::Args;
use ionify::config;
use ionify::dispatcher::{self, AppState};
use ionify::hmr::HmrCoordinator;
use ionify::watch::FsWatcher;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::broadcast;

#[derive(Clone, Debug, Args)]
#[command(name = "serve")]
#[command(next_help_heading = "Serve")]
pub struct Serve {
    /// Project root [default: current directory]
    #[arg(long, env = "IONIFY_ROOT")]
    pub root: Option<PathBuf>,

    /// Port to listen on [default: from config, or 8080]
    #[arg(short, long, env = "IONIFY_PORT")]
    pub port: Option<u16>,
}

impl Serve {
    #[tracing::instrument(level = "trace", skip(self, config_path))]
    pub async fn run(self, config_path: Option<PathBuf>) -> Result<()> {
        let cwd = std::env::current_dir().context("reading current directory")?;
        let path = config_path.unwrap_or_else(|| cwd.join(config::CONFIG_FILE_NAME));
        let mut cfg = config::load(&path)?;
        if let Some(root) = self.root {
            cfg.root = root;
        }
        if let Some(port) = self.port {
            cfg.port = port;
        }
        let rtc = config::rt::build(cfg, &cwd)?;

        let runtime = Runtime::open(&rtc)?;
        let watcher = Arc::new(FsWatcher::new().context("starting filesystem watcher")?);
        watcher.watch(&rtc.root).ok();
        let hmr = HmrCoordinator::new();

        let state = Arc::new(AppState {
            root: rtc.root.clone(),
            graph: runtime.graph.clone(),
            resolver: runtime.resolver.clone(),
            transform: runtime.transform.clone(),
            cas: runtime.cas.clone(),
            hmr: hmr.clone(),
            watcher: watcher.clone(),
        });

        let watch_task = tokio::spawn({
            let state = state.clone();
            let watcher = watcher.clone();
            async move {
                while let Some(event) = watcher.recv().await {
                    dispatcher::handle_change(&state, event.path, event.kind).await;
                }
            }
        });

        let (shutdown_tx, _) = broadcast::channel(1);
        let router = dispatcher::router(state.clone());

        let mut servers = Vec::with_capacity(rtc.addresses.len());
        for address in &rtc.addresses {
            let addr = SocketAddr::new(*address, rtc.port);
            let router = router.clone();
            let shutdown_rx = shutdown_tx.subscribe();
            tracing::info!(%addr, "dev server listening");
            servers.push(tokio::spawn(dispatcher::run_server(addr, router, shutdown_rx)));
        }

        tokio::signal::ctrl_c().await.context("waiting for Ctrl+C")?;
        tracing::info!("received Ctrl+C, shutting down");
        let _ = shutdown_tx.send(());

        for server in servers {
            match server.await.context("server task panicked")? {
                Ok(()) => {}
                Err(err) => tracing::warn!(error = ?err, "dev server exited with an error"),
            }
        }

        watch_task.abort();
        watcher.close_all();
        hmr.close();
        runtime.graph.flush().await.context("flushing graph store")?;
        Ok(())
    }
}
