//! Shared bootstrap for every subcommand that actually runs the core
//! pipeline (`build`, `watch`, `serve`): open the Graph Store under the
//! current version, construct the Resolver, CAS and Transform Engine.
//! `config`/`clean` don't need this — they only touch the on-disk config
//! and CAS directories directly.

use anyhow::{Context, Result};
use ionify::cas::Cas;
use ionify::config::RtcCore;
use ionify::graph::GraphStore;
use ionify::loader::{LoaderRegistry, PassthroughLoader};
use ionify::resolver::Resolver;
use ionify::transform::TransformEngine;
use std::sync::Arc;

/// The set of long-lived components every pipeline-driving command needs.
/// Concrete parser/minifier/CSS loaders are external plugins (`spec.md`
/// §1); until one is registered, the `PassthroughLoader` lets every
/// `transform` call exercise the real cache/CAS/in-flight-dedup machinery
/// without requiring an external engine.
pub struct Runtime {
    pub graph: Arc<GraphStore>,
    pub resolver: Arc<Resolver>,
    pub cas: Arc<Cas>,
    pub transform: Arc<TransformEngine>,
}

impl Runtime {
    pub fn open(rtc: &RtcCore) -> Result<Self> {
        std::fs::create_dir_all(&rtc.ionify_dir)
            .with_context(|| format!("creating {}", rtc.ionify_dir.display()))?;

        let graph = Arc::new(
            GraphStore::init(rtc.graph_dir(), rtc.version.clone())
                .context("opening graph store")?,
        );
        let resolver = Arc::new(Resolver::new(rtc.root.clone(), rtc.resolver_options.clone()));
        let cas = Arc::new(Cas::new(rtc.cas_dir()));
        let registry = LoaderRegistry::new(vec![Arc::new(PassthroughLoader)]);
        let transform = Arc::new(TransformEngine::new(
            registry,
            cas.clone(),
            rtc.version.clone(),
            rtc.transform_cache_max,
        ));

        Ok(Self {
            graph,
            resolver,
            cas,
            transform,
        })
    }
}
