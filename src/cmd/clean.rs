//! `clean`: reclaim on-disk build output and CAS (C5) space. Per `spec.md`
//! §9, invalidation after a configuration change is free — the new version
//! simply sees an empty CAS directory — so by default this only garbage
//! collects stale versions rather than wiping the current one.

use anyhow::{Context, Result};
use clap::Args;
use ionify::cas::Cas;
use ionify::common::remove_dir_all;
use ionify::config;
use std::path::PathBuf;

#[derive(Clone, Debug, Args)]
#[command(name = "clean")]
#[command(next_help_heading = "Clean")]
pub struct Clean {
    /// The output dir for all final assets [default: dist]
    #[arg(short, long, env = "IONIFY_CLEAN_DIST")]
    pub dist: Option<PathBuf>,

    /// Project root [default: current directory]
    #[arg(long, env = "IONIFY_ROOT")]
    pub root: Option<PathBuf>,

    /// Only garbage-collect CAS entries from stale configuration versions,
    /// keeping the current version's cache and graph intact. Without this
    /// flag, `.ionify` is removed entirely.
    #[arg(long, env = "IONIFY_CLEAN_EXCEPT_CURRENT")]
    pub except_current: bool,
}

impl Clean {
    #[tracing::instrument(level = "trace", skip(self, config_path))]
    pub async fn run(self, config_path: Option<PathBuf>) -> Result<()> {
        let cwd = std::env::current_dir().context("reading current directory")?;
        let path = config_path.unwrap_or_else(|| cwd.join(config::CONFIG_FILE_NAME));
        let mut cfg = config::load(&path)?;
        if let Some(root) = self.root {
            cfg.root = root;
        }
        if let Some(dist) = self.dist {
            cfg.dist = dist;
        }
        let rtc = config::rt::build(cfg, &cwd)?;

        remove_dir_all(rtc.dist.clone())
            .await
            .context("failed to clean dist directory")?;
        tracing::info!(dist = %rtc.dist.display(), "removed dist directory");

        if self.except_current {
            let cas = Cas::new(rtc.cas_dir());
            let removed = cas
                .gc_except(&rtc.version)
                .await
                .context("failed to garbage-collect the content-addressable store")?;
            tracing::info!(count = removed.len(), "removed stale CAS versions");
        } else {
            remove_dir_all(rtc.ionify_dir.clone())
                .await
                .context("failed to clean .ionify directory")?;
            tracing::info!(dir = %rtc.ionify_dir.display(), "removed .ionify directory");
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ionify::data::VersionHash;

    #[tokio::test]
    async fn except_current_keeps_current_cas_version() {
        let dir = tempfile::tempdir().unwrap();
        let cas = Cas::new(dir.path().join("cas"));
        let old = VersionHash("old".into());
        let current = VersionHash("current".into());
        cas.write(&old, "m", "transformed.js", b"a").await.unwrap();
        cas.write(&current, "m", "transformed.js", b"b").await.unwrap();

        let removed = cas.gc_except(&current).await.unwrap();
        assert_eq!(removed.len(), 1);
        assert!(cas.read(&old, "m", "transformed.js").await.unwrap().is_none());
        assert!(cas.read(&current, "m", "transformed.js").await.unwrap().is_some());
    }
}
