//! `build`: the one-shot build data flow from `spec.md` §2 — "entries → BFS
//! via Resolver + Graph Store → Worker Pool over unique modules → CAS
//! writes → hand off plan + CAS to external planner/emitter." The chunk
//! layout algorithm itself is out of scope; this command produces the plan
//! (root modules plus every module's CAS key) that such a planner consumes.

use crate::cmd::runtime::Runtime;
use anyhow::{Context, Result};
use clap::Args;
use ionify::config::{self, IonifyConfig, RtcCore};
use ionify::data::{ContentHash, ModuleId, ModuleKind};
use ionify::error::ResolveError;
use ionify::graph::GraphStore;
use ionify::hash::hash_bytes;
use ionify::loader::{LoaderRegistry, PassthroughLoader};
use ionify::resolver::Resolver;
use ionify::scan::extract_specifiers;
use ionify::worker_pool::{Job, JobOutput, WorkerFn, WorkerPool};
use serde::Serialize;
use std::collections::{HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Build every module reachable from the entry points once, transform it,
/// and write the resulting plan + CAS artifacts for an external emitter.
#[derive(Clone, Debug, Args)]
#[command(name = "build")]
#[command(next_help_heading = "Build")]
pub struct Build {
    /// Entry point(s) to build from; overrides the `entry` list in the
    /// config file.
    pub target: Vec<PathBuf>,

    /// Project root [default: current directory]
    #[arg(long, env = "IONIFY_ROOT")]
    pub root: Option<PathBuf>,

    /// Output directory recorded in the plan [default: dist]
    #[arg(short, long, env = "IONIFY_DIST")]
    pub dist: Option<PathBuf>,

    /// Worker pool size [default: cpu_count - 1]
    #[arg(long, env = "IONIFY_WORKERS")]
    pub workers: Option<usize>,
}

impl Build {
    fn apply_to(self, mut cfg: IonifyConfig) -> IonifyConfig {
        if !self.target.is_empty() {
            cfg.entry = self.target;
        }
        if let Some(root) = self.root {
            cfg.root = root;
        }
        if let Some(dist) = self.dist {
            cfg.dist = dist;
        }
        if self.workers.is_some() {
            cfg.workers = self.workers;
        }
        cfg
    }

    #[tracing::instrument(level = "trace", skip(self, config_path))]
    pub async fn run(self, config_path: Option<PathBuf>) -> Result<()> {
        let cwd = std::env::current_dir().context("reading current directory")?;
        let path = config_path.unwrap_or_else(|| cwd.join(config::CONFIG_FILE_NAME));
        let cfg = config::load(&path)?;
        let cfg = self.apply_to(cfg);
        let configured_entries = cfg.entry.clone();
        let rtc = config::rt::build(cfg, &cwd)?;

        let runtime = Runtime::open(&rtc)?;

        let entries = discover_entries(&rtc.entry, &rtc.root)?;
        anyhow::ensure!(
            !entries.is_empty(),
            "no entry points configured and none could be discovered under {}",
            rtc.root.display()
        );

        let modules = walk_graph(&runtime.graph, &runtime.resolver, &entries).await?;
        tracing::info!(count = modules.len(), "discovered modules");

        let pool = spawn_pool(&rtc);
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

        let results = pool.run_many(jobs).await.context("running transform jobs")?;
        pool.close();

        let mut plan_modules = Vec::with_capacity(modules.len());
        for (module, result) in modules.iter().zip(results) {
            let module_hash = module.hash.to_hex();
            match result {
                Ok(output) => {
                    if let Err(err) = runtime
                        .cas
                        .write(&rtc.version, &module_hash, module.kind.artifact_name(), output.code.as_bytes())
                        .await
                    {
                        tracing::warn!(error = ?err, path = %module.id, "CAS write failed, continuing");
                    }
                    plan_modules.push(PlanModule {
                        path: module.id.path.display().to_string(),
                        module_hash,
                        kind: format!("{:?}", module.kind),
                    });
                }
                Err(message) => {
                    anyhow::bail!("transform failed for {}: {message}", module.id);
                }
            }
        }

        runtime.graph.flush().await.context("flushing graph store")?;

        let roots = select_plan_roots(&configured_entries, &runtime.graph)?;
        let plan = BuildPlan {
            version: rtc.version.0.clone(),
            dist: rtc.dist.display().to_string(),
            roots: roots.iter().map(|id| id.path.display().to_string()).collect(),
            modules: plan_modules,
        };
        let plan_path = rtc.ionify_dir.join("plan.json");
        tokio::fs::write(&plan_path, serde_json::to_vec_pretty(&plan)?)
            .await
            .with_context(|| format!("writing {}", plan_path.display()))?;

        tracing::info!(
            plan = %plan_path.display(),
            cas = %runtime.cas.root().display(),
            "build plan written; hand off to the chunk-layout planner"
        );
        Ok(())
    }
}

pub(crate) struct ModuleRecord {
    pub(crate) id: ModuleId,
    pub(crate) hash: ContentHash,
    pub(crate) kind: ModuleKind,
    pub(crate) code: String,
}

/// BFS from `entries` over the Resolver + Graph Store, recording every
/// module it visits. A `visited` set over paths keeps cyclic import graphs
/// (legitimate in JS per `spec.md` §9) from looping forever.
pub(crate) async fn walk_graph(graph: &GraphStore, resolver: &Resolver, entries: &[PathBuf]) -> Result<Vec<ModuleRecord>> {
    let mut visited: HashSet<PathBuf> = HashSet::new();
    let mut queue: VecDeque<PathBuf> = entries.iter().cloned().collect();
    let mut out = Vec::new();

    while let Some(path) = queue.pop_front() {
        if !visited.insert(path.clone()) {
            continue;
        }

        let bytes = match tokio::fs::read(&path).await {
            Ok(b) => b,
            Err(err) => {
                tracing::warn!(path = %path.display(), error = %err, "skipping unreadable module");
                continue;
            }
        };
        let kind = ModuleKind::from_path(&path);
        let hash = hash_bytes(&bytes);
        let id = ModuleId::new(&path);
        let code = String::from_utf8_lossy(&bytes).into_owned();

        let mut static_deps = Vec::new();
        if matches!(kind, ModuleKind::Js) {
            for specifier in extract_specifiers(&code) {
                let relative = specifier.starts_with("./") || specifier.starts_with("../");
                // Resolve strictly so a `node_modules/<pkg>` directory that
                // exists but has no usable entry point fails the build
                // instead of silently vanishing. A bare specifier that
                // resolves to nothing at all is still tolerated as an
                // external dependency; a relative specifier never is, since
                // it can only ever name a local file.
                match resolver.resolve_strict(&specifier, &path) {
                    Ok(resolved) => {
                        static_deps.push(ModuleId::new(resolved.clone()));
                        queue.push_back(resolved);
                    }
                    Err(ResolveError::NotFound { .. }) if !relative => {}
                    Err(err) => return Err(err.into()),
                }
            }
        }

        graph.record(id.clone(), Some(hash), static_deps, vec![], kind)?;
        out.push(ModuleRecord { id, hash, kind, code });
    }

    Ok(out)
}

pub(crate) fn spawn_pool(rtc: &RtcCore) -> WorkerPool {
    // Export the active `VersionHash` once, right before workers exist, so
    // a worker (in-process today, a native subprocess for a future
    // `Transformer` plugin) can assert via `IONIFY_CONFIG_HASH` that it was
    // spawned under the version it's about to be handed jobs for
    // (`spec.md` §6). This is the one place per process that does it: it
    // runs single-threaded, before `WorkerPool::new` spawns any worker
    // thread, so nothing else is concurrently reading or writing process
    // environment.
    //
    // SAFETY: no other thread exists yet that could read or write process
    // environment concurrently with this call.
    unsafe {
        std::env::set_var("IONIFY_CONFIG_HASH", &rtc.version.0);
    }

    let size = rtc.workers.unwrap_or_else(WorkerPool::default_size);
    let registry = Arc::new(LoaderRegistry::new(vec![Arc::new(PassthroughLoader)]));
    let work: WorkerFn = Arc::new(move |job: &Job| {
        registry
            .run_chain(&job.path, job.module_hash.as_deref().unwrap_or(""), job.code.clone())
            .map(|out| JobOutput {
                code: out.code,
                map: out.map,
                kind: job.ext.clone(),
            })
            .map_err(|e| e.to_string())
    });
    WorkerPool::new(size, rtc.max_queue_bytes, work)
}

/// When no entry is configured, fall back to `index.html` in the root, then
/// every top-level `*.html`, then (deterministically) the first top-level
/// source file — a convenience for a cold build, distinct from the
/// plan-root fallback in [`select_plan_roots`], which operates on the
/// already-built graph per `spec.md` §8.
pub(crate) fn discover_entries(configured: &[PathBuf], root: &Path) -> Result<Vec<PathBuf>> {
    if !configured.is_empty() {
        return Ok(configured.to_vec());
    }

    let index_html = root.join("index.html");
    if index_html.is_file() {
        return Ok(vec![index_html]);
    }

    let mut html_entries = Vec::new();
    let mut source_entries = Vec::new();
    let read_dir = match std::fs::read_dir(root) {
        Ok(rd) => rd,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e).with_context(|| format!("reading {}", root.display())),
    };
    for entry in read_dir {
        let entry = entry?;
        let path = entry.path();
        if !path.is_file() {
            continue;
        }
        match path.extension().and_then(|e| e.to_str()) {
            Some("html") => html_entries.push(path),
            Some("js" | "ts" | "jsx" | "tsx") => source_entries.push(path),
            _ => {}
        }
    }

    html_entries.sort();
    if !html_entries.is_empty() {
        return Ok(html_entries);
    }

    source_entries.sort();
    Ok(source_entries.into_iter().take(1).collect())
}

/// "Empty entry list → planner falls back to graph orphans (nodes with no
/// dependents); if still empty, pick the first module by deterministic
/// order" (`spec.md` §8).
fn select_plan_roots(configured: &[PathBuf], graph: &GraphStore) -> Result<Vec<ModuleId>> {
    if !configured.is_empty() {
        return Ok(configured.iter().map(ModuleId::new).collect());
    }

    let mut snapshot = graph.snapshot()?;
    snapshot.sort_by(|a, b| a.id.cmp(&b.id));

    let mut orphans = Vec::new();
    for node in &snapshot {
        if graph.dependents(&node.id)?.is_empty() {
            orphans.push(node.id.clone());
        }
    }
    if !orphans.is_empty() {
        return Ok(orphans);
    }

    Ok(snapshot.into_iter().next().map(|n| vec![n.id]).unwrap_or_default())
}

#[derive(Serialize)]
struct PlanModule {
    path: String,
    module_hash: String,
    kind: String,
}

#[derive(Serialize)]
struct BuildPlan {
    version: String,
    dist: String,
    roots: Vec<String>,
    modules: Vec<PlanModule>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use ionify::data::VersionHash;

    #[test]
    fn discover_entries_prefers_index_html() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("index.html"), "<html></html>").unwrap();
        std::fs::write(dir.path().join("other.html"), "<html></html>").unwrap();
        let found = discover_entries(&[], dir.path()).unwrap();
        assert_eq!(found, vec![dir.path().join("index.html")]);
    }

    #[test]
    fn discover_entries_falls_back_to_first_source_file() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("b.ts"), "").unwrap();
        std::fs::write(dir.path().join("a.ts"), "").unwrap();
        let found = discover_entries(&[], dir.path()).unwrap();
        assert_eq!(found, vec![dir.path().join("a.ts")]);
    }

    #[tokio::test]
    async fn walk_graph_tolerates_missing_bare_specifier_as_external() {
        let dir = tempfile::tempdir().unwrap();
        let entry = dir.path().join("entry.ts");
        std::fs::write(&entry, "import 'some-external-package';").unwrap();

        let graph = GraphStore::init(dir.path().join("store"), VersionHash("v1".into())).unwrap();
        let resolver = Resolver::new(dir.path(), Default::default());
        let modules = walk_graph(&graph, &resolver, &[entry]).await.unwrap();
        assert_eq!(modules.len(), 1);
    }

    #[tokio::test]
    async fn walk_graph_fails_on_missing_relative_specifier() {
        let dir = tempfile::tempdir().unwrap();
        let entry = dir.path().join("entry.ts");
        std::fs::write(&entry, "import './missing.ts';").unwrap();

        let graph = GraphStore::init(dir.path().join("store"), VersionHash("v1".into())).unwrap();
        let resolver = Resolver::new(dir.path(), Default::default());
        let err = walk_graph(&graph, &resolver, &[entry]).await.unwrap_err();
        assert!(err.to_string().contains("missing.ts") || err.to_string().contains("cannot resolve"));
    }

    #[test]
    fn select_plan_roots_falls_back_to_orphans_then_first_module() {
        let dir = tempfile::tempdir().unwrap();
        let graph = GraphStore::init(dir.path(), VersionHash("v1".into())).unwrap();
        let a = ModuleId::new("/a.ts");
        let b = ModuleId::new("/b.ts");
        graph
            .record(a.clone(), None, vec![b.clone()], vec![], ModuleKind::Js)
            .unwrap();
        graph
            .record(b.clone(), None, vec![], vec![], ModuleKind::Js)
            .unwrap();

        // `a` has no dependents; `b` is depended on by `a`. Orphan = `a`.
        let roots = select_plan_roots(&[], &graph).unwrap();
        assert_eq!(roots, vec![a]);
    }
}
