//! Canonicalized runtime configuration: the on-disk [`IonifyConfig`] plus
//! environment/CLI overrides, resolved into absolute paths and folded into a
//! [`VersionHash`] via the Version Canonicalizer.

use crate::config::model::IonifyConfig;
use crate::data::VersionHash;
use crate::resolver::ResolverOptions;
use crate::version::{compute_version, VersionInput};
use std::collections::BTreeMap;
use std::net::IpAddr;
use std::path::{Path, PathBuf};

/// The fully resolved configuration a running instance operates under.
#[derive(Clone, Debug)]
pub struct RtcCore {
    pub root: PathBuf,
    pub dist: PathBuf,
    pub ionify_dir: PathBuf,
    pub entry: Vec<PathBuf>,
    pub addresses: Vec<IpAddr>,
    pub port: u16,
    pub transform_cache_max: usize,
    pub workers: Option<usize>,
    pub max_queue_bytes: Option<u64>,
    pub resolver_options: ResolverOptions,
    pub version: VersionHash,
}

impl RtcCore {
    pub fn graph_dir(&self) -> PathBuf {
        self.ionify_dir.join("graph.db")
    }

    pub fn cas_dir(&self) -> PathBuf {
        self.ionify_dir.join("cas")
    }

    pub fn cache_dir(&self) -> PathBuf {
        self.ionify_dir.join("cache")
    }
}

/// Build the runtime configuration from the on-disk model plus overrides
/// already folded into it (see [`apply_env_overrides`]). `root` is made
/// absolute via [`std::fs::canonicalize`] or, if the project hasn't been
/// created yet, resolved lexically against the current directory.
#[tracing::instrument(level = "debug", skip(config))]
pub fn build(mut config: IonifyConfig, cwd: &Path) -> anyhow::Result<RtcCore> {
    apply_env_overrides(&mut config);

    let root = resolve_root(&config.root, cwd);
    let dist = root.join(&config.dist);
    let entry = config
        .entry
        .iter()
        .map(|p| resolve_root(p, &root))
        .collect::<Vec<_>>();

    let input = VersionInput {
        parser_mode: config.parser_mode,
        minifier: config.minifier,
        treeshake: config.treeshake.clone().map(Into::into),
        scope_hoist: config.scope_hoist.clone(),
        plugins: config.plugins.clone(),
        entry: entry.iter().map(|p| p.display().to_string()).collect(),
        css_options: config.css_options.clone(),
        asset_options: config.asset_options.clone(),
    };
    let version = compute_version(input);

    Ok(RtcCore {
        ionify_dir: root.join(".ionify"),
        dist,
        entry,
        addresses: config.addresses,
        port: config.port,
        transform_cache_max: config.transform_cache_max,
        workers: config.workers,
        max_queue_bytes: config.max_queue_bytes,
        resolver_options: ResolverOptions {
            aliases: config.aliases,
            extensions: None,
        },
        root,
        version,
    })
}

fn resolve_root(path: &Path, base: &Path) -> PathBuf {
    let joined = if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    };
    std::fs::canonicalize(&joined).unwrap_or(joined)
}

/// Fold the environment variables enumerated in `spec.md` §6 into `config`,
/// read once at startup. `IONIFY_CONFIG_HASH` is exported separately, once
/// the Worker Pool is about to spawn (see `cmd::build::spawn_pool`), never
/// read here.
pub fn apply_env_overrides(config: &mut IonifyConfig) {
    use crate::version::{Minifier, ParserMode, ScopeHoistOptions, TreeshakeMode};
    use std::env::var;

    if let Ok(v) = var("IONIFY_PARSER") {
        config.parser_mode = parse_enum(&v, &[
            ("oxc", ParserMode::Oxc),
            ("swc", ParserMode::Swc),
            ("hybrid", ParserMode::Hybrid),
        ]);
    }
    if let Ok(v) = var("IONIFY_MINIFIER") {
        config.minifier = parse_enum(&v, &[
            ("oxc", Minifier::Oxc),
            ("swc", Minifier::Swc),
            ("auto", Minifier::Auto),
        ]);
    }
    if let Ok(v) = var("IONIFY_TREESHAKE") {
        if v.eq_ignore_ascii_case("off") || v.eq_ignore_ascii_case("false") {
            config.treeshake = None;
        } else if let Some(mode) = parse_enum(&v, &[
            ("safe", TreeshakeMode::Safe),
            ("aggressive", TreeshakeMode::Aggressive),
        ]) {
            let entry = config
                .treeshake
                .get_or_insert(crate::config::model::TreeshakeConfig {
                    mode,
                    include: Vec::new(),
                    exclude: Vec::new(),
                });
            entry.mode = mode;
        }
    }
    if let Ok(v) = var("IONIFY_TREESHAKE_INCLUDE") {
        if let Some(entry) = config.treeshake.as_mut() {
            entry.include = split_csv(&v);
        }
    }
    if let Ok(v) = var("IONIFY_TREESHAKE_EXCLUDE") {
        if let Some(entry) = config.treeshake.as_mut() {
            entry.exclude = split_csv(&v);
        }
    }

    let scope_hoist_enabled = var("IONIFY_SCOPE_HOIST").ok();
    if let Some(v) = &scope_hoist_enabled {
        if v.eq_ignore_ascii_case("off") || v.eq_ignore_ascii_case("false") {
            config.scope_hoist = None;
        } else {
            config.scope_hoist.get_or_insert_with(ScopeHoistOptions::default);
        }
    }
    if let Some(opts) = config.scope_hoist.as_mut() {
        if let Some(v) = bool_var("IONIFY_SCOPE_HOIST_INLINE") {
            opts.inline_functions = v;
        }
        if let Some(v) = bool_var("IONIFY_SCOPE_HOIST_CONST") {
            opts.constant_folding = v;
        }
        if let Some(v) = bool_var("IONIFY_SCOPE_HOIST_COMBINE") {
            opts.combine_variables = v;
        }
    }

    if let Ok(v) = var("IONIFY_OPTIMIZATION_LEVEL") {
        config
            .asset_options
            .insert("optimization_level".to_string(), serde_json::Value::String(v));
    }
    if let Some(v) = bool_var("IONIFY_SOURCEMAPS") {
        config
            .css_options
            .insert("sourcemaps".to_string(), serde_json::Value::Bool(v));
    }
    if let Ok(v) = var("IONIFY_DEV_TRANSFORM_CACHE_MAX") {
        if let Ok(n) = v.parse() {
            config.transform_cache_max = n;
        }
    }
}

fn parse_enum<T: Copy>(raw: &str, table: &[(&str, T)]) -> Option<T> {
    table
        .iter()
        .find(|(name, _)| name.eq_ignore_ascii_case(raw))
        .map(|(_, value)| *value)
}

fn bool_var(name: &str) -> Option<bool> {
    std::env::var(name)
        .ok()
        .map(|v| !(v.eq_ignore_ascii_case("off") || v.eq_ignore_ascii_case("false") || v == "0"))
}

fn split_csv(v: &str) -> Vec<String> {
    v.split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

#[allow(dead_code)]
fn empty_map() -> BTreeMap<String, serde_json::Value> {
    BTreeMap::new()
}

#[cfg(test)]
mod tests {
    use super::*;

    // `std::env::set_var`/`remove_var` are `unsafe` as of the 2024 edition
    // (the underlying POSIX getenv/setenv storage isn't safe to mutate
    // concurrently) and `cargo test` runs tests on multiple threads in one
    // process, so this test serializes against any other test in this
    // module that touches process environment.
    static ENV_LOCK: std::sync::Mutex<()> = std::sync::Mutex::new(());

    #[test]
    fn env_overrides_parser_mode() {
        let _guard = ENV_LOCK.lock().unwrap();
        // SAFETY: `ENV_LOCK` is held for the duration of the mutation and
        // the read in `apply_env_overrides`, so no other thread in this
        // process observes a torn environment.
        unsafe {
            std::env::set_var("IONIFY_PARSER", "swc");
        }
        let mut cfg = IonifyConfig::default();
        apply_env_overrides(&mut cfg);
        assert_eq!(cfg.parser_mode, Some(crate::version::ParserMode::Swc));
        // SAFETY: see above.
        unsafe {
            std::env::remove_var("IONIFY_PARSER");
        }
    }

    #[test]
    fn build_is_deterministic_for_equal_configs() {
        let dir = tempfile::tempdir().unwrap();
        let cfg_a = IonifyConfig::default();
        let cfg_b = IonifyConfig::default();
        let rtc_a = build(cfg_a, dir.path()).unwrap();
        let rtc_b = build(cfg_b, dir.path()).unwrap();
        assert_eq!(rtc_a.version.0, rtc_b.version.0);
    }
}
