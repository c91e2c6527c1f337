//! On-disk project configuration, loaded from `Ionify.toml` (or a path given
//! via `--config`). Every field has a default so an empty file is valid.

use crate::version::{Minifier, ParserMode, ScopeHoistOptions, TreeshakeMode, TreeshakeOptions};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::IpAddr;
use std::path::PathBuf;

fn default_root() -> PathBuf {
    PathBuf::from(".")
}

fn default_dist() -> PathBuf {
    PathBuf::from("dist")
}

fn default_addresses() -> Vec<IpAddr> {
    vec![IpAddr::from([127, 0, 0, 1])]
}

fn default_port() -> u16 {
    8080
}

fn default_transform_cache_max() -> usize {
    crate::transform::DEFAULT_LRU_CAPACITY
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct IonifyConfig {
    /// Project root; every relative path in this file and on the CLI is
    /// resolved against it.
    #[serde(default = "default_root")]
    pub root: PathBuf,
    /// Entry points, relative to `root`. Empty means "let the planner pick".
    pub entry: Vec<PathBuf>,
    #[serde(default = "default_dist")]
    pub dist: PathBuf,

    pub parser_mode: Option<ParserMode>,
    pub minifier: Option<Minifier>,
    pub treeshake: Option<TreeshakeConfig>,
    pub scope_hoist: Option<ScopeHoistOptions>,
    pub plugins: Vec<String>,
    #[serde(default)]
    pub css_options: BTreeMap<String, serde_json::Value>,
    #[serde(default)]
    pub asset_options: BTreeMap<String, serde_json::Value>,

    /// Alias table consulted by the resolver, e.g. `"@/*" = "src/*"`.
    #[serde(default)]
    pub aliases: BTreeMap<String, String>,

    #[serde(default = "default_addresses")]
    pub addresses: Vec<IpAddr>,
    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(default = "default_transform_cache_max")]
    pub transform_cache_max: usize,
    /// Worker pool size; `None` defers to `WorkerPool::default_size()`.
    pub workers: Option<usize>,
    /// Soft byte budget on queued-but-unstarted transform jobs.
    pub max_queue_bytes: Option<u64>,
}

impl Default for IonifyConfig {
    fn default() -> Self {
        Self {
            root: default_root(),
            entry: Vec::new(),
            dist: default_dist(),
            parser_mode: None,
            minifier: None,
            treeshake: None,
            scope_hoist: None,
            plugins: Vec::new(),
            css_options: BTreeMap::new(),
            asset_options: BTreeMap::new(),
            aliases: BTreeMap::new(),
            addresses: default_addresses(),
            port: default_port(),
            transform_cache_max: default_transform_cache_max(),
            workers: None,
            max_queue_bytes: None,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct TreeshakeConfig {
    pub mode: TreeshakeMode,
    #[serde(default)]
    pub include: Vec<String>,
    #[serde(default)]
    pub exclude: Vec<String>,
}

impl From<TreeshakeConfig> for TreeshakeOptions {
    fn from(cfg: TreeshakeConfig) -> Self {
        TreeshakeOptions {
            mode: cfg.mode,
            include: cfg.include,
            exclude: cfg.exclude,
        }
    }
}

/// Load the configuration file at `path`, or fall back to defaults if it
/// doesn't exist. A present-but-invalid file is an error.
#[tracing::instrument(level = "debug")]
pub fn load(path: &std::path::Path) -> anyhow::Result<IonifyConfig> {
    use anyhow::Context;

    match std::fs::read_to_string(path) {
        Ok(contents) => {
            toml::from_str(&contents).with_context(|| format!("parsing {}", path.display()))
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(IonifyConfig::default()),
        Err(e) => Err(e).with_context(|| format!("reading {}", path.display())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_parses_to_defaults() {
        let cfg: IonifyConfig = toml::from_str("").unwrap();
        assert_eq!(cfg.dist, PathBuf::from("dist"));
        assert_eq!(cfg.port, 8080);
    }

    #[test]
    fn partial_file_keeps_other_defaults() {
        let cfg: IonifyConfig = toml::from_str("port = 3000\nplugins = [\"a\"]\n").unwrap();
        assert_eq!(cfg.port, 3000);
        assert_eq!(cfg.plugins, vec!["a".to_string()]);
        assert_eq!(cfg.dist, PathBuf::from("dist"));
    }
}
