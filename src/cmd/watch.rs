//! `watch`: build once, then stay resident and re-transform whatever the
//! Watcher (C7) says is affected via the Graph Store's `collect_affected`
//! BFS (`spec.md` §4.7, §2 "Data flow (dev)") — without the HTTP surface
//! `serve` adds on top.

use crate::cmd::build::{discover_entries, spawn_pool, walk_graph};
use crate::cmd::runtime::Runtime;
use anyhow::{Context, Result};
use clap::Args;
use ionify::config::{self, RtcCore};
use ionify::data::ModuleId;
use ionify::hash::hash_bytes;
use ionify::watch::{ChangeKind, FsWatcher};
use ionify::worker_pool::Job;
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Clone, Debug, Args)]
#[command(name = "watch")]
#[command(next_help_heading = "Watch")]
pub struct Watch {
    /// Entry point(s) to build from; overrides the `entry` list in the
    /// config file.
    pub target: Vec<PathBuf>,

    /// Project root [default: current directory]
    #[arg(long, env = "IONIFY_ROOT")]
    pub root: Option<PathBuf>,

    /// Worker pool size [default: cpu_count - 1]
    #[arg(long, env = "IONIFY_WORKERS")]
    pub workers: Option<usize>,
}

impl Watch {
    #[tracing::instrument(level = "trace", skip(self, config_path))]
    pub async fn run(self, config_path: Option<PathBuf>) -> Result<()> {
        let cwd = std::env::current_dir().context("reading current directory")?;
        let path = config_path.unwrap_or_else(|| cwd.join(config::CONFIG_FILE_NAME));
        let mut cfg = config::load(&path)?;
        if !self.target.is_empty() {
            cfg.entry = self.target;
        }
        if let Some(root) = self.root {
            cfg.root = root;
        }
        if self.workers.is_some() {
            cfg.workers = self.workers;
        }
        let rtc = config::rt::build(cfg, &cwd)?;

        let runtime = Runtime::open(&rtc)?;
        let watcher = Arc::new(FsWatcher::new().context("starting filesystem watcher")?);

        let entries = discover_entries(&rtc.entry, &rtc.root)?;
        anyhow::ensure!(
            !entries.is_empty(),
            "no entry points configured and none could be discovered under {}",
            rtc.root.display()
        );

        initial_build(&runtime, &rtc, &entries).await?;
        for entry in &entries {
            watcher.watch(entry).ok();
        }
        for node in runtime.graph.snapshot()? {
            watcher.watch(&node.id.path).ok();
        }

        tracing::info!("watching for changes, press Ctrl+C to stop");
        loop {
            tokio::select! {
                event = watcher.recv() => {
                    let Some(event) = event else { break };
                    if let Err(err) = on_change(&runtime, &watcher, event.path, event.kind).await {
                        tracing::warn!(error = ?err, "failed to process change");
                    }
                }
                _ = tokio::signal::ctrl_c() => {
                    tracing::info!("shutting down watcher");
                    break;
                }
            }
        }

        watcher.close_all();
        runtime.graph.flush().await.context("flushing graph store")?;
        Ok(())
    }
}

async fn initial_build(runtime: &Runtime, rtc: &RtcCore, entries: &[PathBuf]) -> Result<()> {
    let modules = walk_graph(&runtime.graph, &runtime.resolver, entries).await?;
    let pool = spawn_pool(rtc);
    let jobs: Vec<Job> = modules
        .iter()
        .enumerate()
        .map(|(i, m)| Job {
            id: i as u64,
            path: m.id.path.clone(),
            ext: m
                .id
                .path
                .extension()
                .and_then(|e| e.to_str())
                .unwrap_or("")
                .to_string(),
            code: m.code.clone(),
            module_hash: Some(m.hash.to_hex()),
        })
        .collect();
    let results = pool.run_many(jobs).await.context("running initial transform jobs")?;
    pool.close();

    for (module, result) in modules.iter().zip(results) {
        match result {
            Ok(output) => {
                runtime
                    .cas
                    .write(&rtc.version, &module.hash.to_hex(), module.kind.artifact_name(), output.code.as_bytes())
                    .await
                    .unwrap_or_else(|err| tracing::warn!(error = ?err, "CAS write failed, continuing"));
            }
            Err(message) => tracing::warn!(path = %module.id, error = %message, "initial transform failed"),
        }
    }

    tracing::info!(count = modules.len(), "initial build complete");
    Ok(())
}

/// Re-transform every module `collect_affected` names from a single file
/// event, logging a one-line summary per module — the terminal-facing
/// equivalent of the HMR update the dev server would push instead.
async fn on_change(runtime: &Runtime, watcher: &FsWatcher, path: PathBuf, kind: ChangeKind) -> Result<()> {
    let id = ModuleId::new(&path);

    if matches!(kind, ChangeKind::Deleted) {
        runtime.graph.remove(&id)?;
        watcher.unwatch(&path).ok();
        tracing::info!(path = %path.display(), "deleted");
        return Ok(());
    }

    let bytes = tokio::fs::read(&path)
        .await
        .with_context(|| format!("reading {}", path.display()))?;
    let content_hash = hash_bytes(&bytes);
    let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("").to_ascii_lowercase();
    let module_kind = ionify::data::ModuleKind::from_extension(&ext);
    let code = String::from_utf8_lossy(&bytes).into_owned();

    let mut static_deps = Vec::new();
    if matches!(module_kind, ionify::data::ModuleKind::Js) {
        for specifier in ionify::scan::extract_specifiers(&code) {
            if let Some(resolved) = runtime.resolver.resolve(&specifier, &path) {
                watcher.watch(&resolved).ok();
                static_deps.push(ModuleId::new(resolved));
            }
        }
    }
    runtime
        .graph
        .record(id.clone(), Some(content_hash), static_deps, vec![], module_kind)?;

    let affected = runtime.graph.collect_affected(&[id])?;
    for affected_id in &affected {
        let Some(node) = runtime.graph.get(affected_id)? else {
            continue;
        };
        let Some(hash) = node.content_hash else { continue };
        let code = match tokio::fs::read_to_string(&node.id.path).await {
            Ok(c) => c,
            Err(err) => {
                tracing::warn!(path = %node.id, error = %err, "skipping unreadable affected module");
                continue;
            }
        };
        match runtime
            .transform
            .run(&node.id.path, &hash.to_hex(), code, node.kind.artifact_name())
            .await
        {
            Ok(_) => tracing::info!(module = %node.id, "re-transformed"),
            Err(err) => tracing::warn!(module = %node.id, error = %err, "re-transform failed"),
        }
    }

    Ok(())
}
