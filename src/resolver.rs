//! Resolver (C4): maps a specifier plus importer directory to an absolute
//! module path, following a subset of Node's resolution algorithm plus a
//! user/tsconfig-style alias table. Results (including misses) are memoized
//! for the process lifetime.

use crate::error::ResolveError;
use dashmap::DashMap;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Default extension probe order, applied whenever a candidate path has no
/// extension of its own.
pub const DEFAULT_EXTENSIONS: &[&str] = &["ts", "tsx", "js", "jsx", "mjs", "cjs", "json"];

#[derive(Clone, Debug, Default, Deserialize)]
pub struct ResolverOptions {
    /// User-declared or tsconfig-derived alias table. A trailing `*` in the
    /// key expands once against a matching `*` in the value.
    pub aliases: BTreeMap<String, String>,
    pub extensions: Option<Vec<String>>,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
struct CacheKey {
    importer: PathBuf,
    specifier: String,
}

pub struct Resolver {
    root: PathBuf,
    options: ResolverOptions,
    cache: DashMap<CacheKey, Option<PathBuf>>,
}

impl Resolver {
    pub fn new(root: impl Into<PathBuf>, options: ResolverOptions) -> Self {
        Self {
            root: root.into(),
            options,
            cache: DashMap::new(),
        }
    }

    fn extensions(&self) -> &[String] {
        static DEFAULT: once_cell::sync::Lazy<Vec<String>> = once_cell::sync::Lazy::new(|| {
            DEFAULT_EXTENSIONS.iter().map(|s| s.to_string()).collect()
        });
        self.options.extensions.as_deref().unwrap_or(&DEFAULT)
    }

    /// Resolve tolerantly: returns `None` on a miss instead of an error.
    /// Loaders that can proceed without the dependency should call this.
    pub fn resolve(&self, specifier: &str, importer: &Path) -> Option<PathBuf> {
        let key = CacheKey {
            importer: importer.to_path_buf(),
            specifier: specifier.to_string(),
        };
        if let Some(cached) = self.cache.get(&key) {
            return cached.clone();
        }
        let result = self.resolve_uncached(specifier, importer);
        self.cache.insert(key, result.clone());
        result
    }

    /// Resolve strictly: callers that require the dependency to exist.
    ///
    /// Distinguishes a package that was never found on disk (`NotFound`) from
    /// one whose `node_modules/<pkg>` directory exists but whose manifest and
    /// `index.*` fallback both failed to yield a usable entry point
    /// (`NoEntryPoint`) — the former means "add it to `package.json`", the
    /// latter means "this package is broken".
    pub fn resolve_strict(
        &self,
        specifier: &str,
        importer: &Path,
    ) -> Result<PathBuf, ResolveError> {
        if let Some(found) = self.resolve(specifier, importer) {
            return Ok(found);
        }
        let importer_dir = importer.parent().unwrap_or(&self.root);
        if let Some(package) = self.bare_package_dir_with_no_entry(specifier, importer_dir) {
            return Err(ResolveError::NoEntryPoint { package });
        }
        Err(ResolveError::NotFound {
            specifier: specifier.to_string(),
            importer: crate::data::ModuleId::new(importer),
        })
    }

    /// True when `specifier` names a bare package (no subpath) whose
    /// `node_modules/<pkg>` directory exists on the ancestor chain, even
    /// though [`Self::resolve_from_node_modules`] could not find an entry
    /// point inside it.
    fn bare_package_dir_with_no_entry(&self, specifier: &str, importer_dir: &Path) -> Option<String> {
        let (package, subpath) = split_package_specifier(specifier);
        if !subpath.is_empty() {
            return None;
        }
        importer_dir
            .ancestors()
            .map(|dir| dir.join("node_modules").join(package))
            .find(|node_modules| node_modules.is_dir())
            .map(|_| package.to_string())
    }

    fn resolve_uncached(&self, specifier: &str, importer: &Path) -> Option<PathBuf> {
        let importer_dir = importer.parent().unwrap_or(&self.root);

        if Path::new(specifier).is_absolute() {
            return self.probe(Path::new(specifier));
        }

        if specifier.starts_with("./") || specifier.starts_with("../") {
            return self.probe(&importer_dir.join(specifier));
        }

        if let Some(aliased) = self.apply_alias(specifier) {
            if let Some(found) = self.probe(&aliased) {
                return Some(found);
            }
        }

        self.resolve_from_node_modules(specifier, importer_dir)
    }

    fn apply_alias(&self, specifier: &str) -> Option<PathBuf> {
        for (pattern, target) in &self.options.aliases {
            if let Some(prefix) = pattern.strip_suffix('*') {
                if let Some(rest) = specifier.strip_prefix(prefix) {
                    if let Some(target_prefix) = target.strip_suffix('*') {
                        return Some(self.root.join(format!("{target_prefix}{rest}")));
                    }
                }
            } else if pattern == specifier {
                return Some(self.root.join(target));
            }
        }
        None
    }

    fn resolve_from_node_modules(&self, specifier: &str, importer_dir: &Path) -> Option<PathBuf> {
        let (package, subpath) = split_package_specifier(specifier);

        for dir in importer_dir.ancestors() {
            let node_modules = dir.join("node_modules").join(package);
            if !node_modules.is_dir() {
                continue;
            }

            if !subpath.is_empty() {
                if let Some(found) = self.probe(&node_modules.join(subpath)) {
                    return Some(found);
                }
                continue;
            }

            if let Some(entry) = self.package_entry(&node_modules) {
                return Some(entry);
            }
        }

        None
    }

    /// Resolve a package directory's entry point: `exports` (`import` then
    /// `default` condition), then `module`/`main` fields, then `index.<ext>`.
    fn package_entry(&self, package_dir: &Path) -> Option<PathBuf> {
        let manifest_path = package_dir.join("package.json");
        if let Ok(contents) = std::fs::read_to_string(&manifest_path) {
            if let Ok(manifest) = serde_json::from_str::<serde_json::Value>(&contents) {
                if let Some(entry) = exports_entry(&manifest) {
                    if let Some(found) = self.probe(&package_dir.join(entry)) {
                        return Some(found);
                    }
                }
                for field in ["module", "main"] {
                    if let Some(entry) = manifest.get(field).and_then(|v| v.as_str()) {
                        if let Some(found) = self.probe(&package_dir.join(entry)) {
                            return Some(found);
                        }
                    }
                }
            }
        }
        self.probe(&package_dir.join("index"))
    }

    /// Probe a candidate path: as-is, then with each extension appended, then
    /// as a directory's `index.<ext>`.
    fn probe(&self, candidate: &Path) -> Option<PathBuf> {
        if candidate.is_file() {
            return Some(candidate.to_path_buf());
        }
        for ext in self.extensions() {
            let with_ext = append_extension(candidate, ext);
            if with_ext.is_file() {
                return Some(with_ext);
            }
        }
        if candidate.is_dir() {
            for ext in self.extensions() {
                let index = candidate.join(format!("index.{ext}"));
                if index.is_file() {
                    return Some(index);
                }
            }
        }
        None
    }

    /// Drop every cached result; called after a configuration reset.
    pub fn clear(&self) {
        self.cache.clear();
    }
}

fn append_extension(path: &Path, ext: &str) -> PathBuf {
    let mut s = path.as_os_str().to_os_string();
    s.push(".");
    s.push(ext);
    PathBuf::from(s)
}

fn split_package_specifier(specifier: &str) -> (&str, &str) {
    if let Some(scope_rest) = specifier.strip_prefix('@') {
        if let Some(slash) = scope_rest.find('/') {
            let pkg_len = 1 + slash;
            let (pkg, rest) = specifier.split_at(pkg_len);
            return (pkg, rest.trim_start_matches('/'));
        }
        return (specifier, "");
    }
    match specifier.find('/') {
        Some(idx) => (&specifier[..idx], specifier[idx + 1..].trim_start_matches('/')),
        None => (specifier, ""),
    }
}

/// Apply the `exports` field's conditions in declared order, defaulting to
/// `import` then `default` as `spec.md` §4.4 mandates.
fn exports_entry(manifest: &serde_json::Value) -> Option<&str> {
    let exports = manifest.get("exports")?;
    match exports {
        serde_json::Value::String(s) => Some(s.as_str()),
        serde_json::Value::Object(map) => {
            if let Some(root) = map.get(".") {
                return pick_condition(root);
            }
            pick_condition(exports)
        }
        _ => None,
    }
}

fn pick_condition(value: &serde_json::Value) -> Option<&str> {
    match value {
        serde_json::Value::String(s) => Some(s.as_str()),
        serde_json::Value::Object(map) => {
            for condition in ["import", "default"] {
                if let Some(v) = map.get(condition) {
                    if let Some(s) = pick_condition(v) {
                        return Some(s);
                    }
                }
            }
            None
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_scoped_package_specifier() {
        assert_eq!(split_package_specifier("@scope/pkg/sub"), ("@scope/pkg", "sub"));
        assert_eq!(split_package_specifier("lodash/debounce"), ("lodash", "debounce"));
        assert_eq!(split_package_specifier("lodash"), ("lodash", ""));
    }

    #[test]
    fn exports_prefers_import_condition() {
        let manifest: serde_json::Value = serde_json::json!({
            "exports": { ".": { "import": "./esm.js", "default": "./cjs.js" } }
        });
        assert_eq!(exports_entry(&manifest), Some("./esm.js"));
    }

    #[test]
    fn relative_specifiers_never_consult_node_modules() {
        let dir = tempfile::tempdir().unwrap();
        let resolver = Resolver::new(dir.path(), ResolverOptions::default());
        let importer = dir.path().join("src/entry.ts");
        assert_eq!(resolver.resolve("./missing", &importer), None);
    }

    #[test]
    fn resolve_strict_distinguishes_missing_from_broken_package() {
        let dir = tempfile::tempdir().unwrap();
        let resolver = Resolver::new(dir.path(), ResolverOptions::default());
        let importer = dir.path().join("src/entry.ts");

        let missing = resolver.resolve_strict("nowhere", &importer).unwrap_err();
        assert!(matches!(missing, ResolveError::NotFound { .. }));

        let broken_pkg = dir.path().join("node_modules/broken");
        std::fs::create_dir_all(&broken_pkg).unwrap();
        let broken = resolver.resolve_strict("broken", &importer).unwrap_err();
        assert!(matches!(broken, ResolveError::NoEntryPoint { package } if package == "broken"));
    }

    #[test]
    fn misses_are_cached() {
        let dir = tempfile::tempdir().unwrap();
        let resolver = Resolver::new(dir.path(), ResolverOptions::default());
        let importer = dir.path().join("src/entry.ts");
        assert_eq!(resolver.resolve("nope", &importer), None);
        assert_eq!(resolver.cache.len(), 1);
        assert_eq!(resolver.resolve("nope", &importer), None);
        assert_eq!(resolver.cache.len(), 1);
    }
}
