//! Core data model shared by every component: module identity, content and
//! version hashes, the persisted graph node shape, and the HMR update
//! envelope.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};

/// Identity of a module: an absolute filesystem path plus an optional query
/// suffix (`?inline`, `?module`, ...). Equality and hashing are over both
/// parts together, so `foo.css` and `foo.css?inline` are distinct modules.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ModuleId {
    pub path: PathBuf,
    pub query: Option<String>,
}

impl ModuleId {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            query: None,
        }
    }

    pub fn with_query(path: impl Into<PathBuf>, query: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            query: Some(query.into()),
        }
    }

    pub fn as_path(&self) -> &Path {
        &self.path
    }

    /// The canonical string used when hashing or persisting this id.
    pub fn canonical_key(&self) -> String {
        match &self.query {
            Some(q) => format!("{}?{q}", self.path.display()),
            None => self.path.display().to_string(),
        }
    }
}

impl fmt::Display for ModuleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.canonical_key())
    }
}

/// 32-byte SHA-256 digest, hex-encoded wherever it needs to cross a
/// serialization boundary.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ContentHash(pub [u8; 32]);

impl ContentHash {
    pub fn to_hex(self) -> String {
        hex_encode(&self.0)
    }
}

impl fmt::Debug for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ContentHash({})", self.to_hex())
    }
}

impl Serialize for ContentHash {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for ContentHash {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        let bytes = hex_decode(&s).map_err(serde::de::Error::custom)?;
        if bytes.len() != 32 {
            return Err(serde::de::Error::custom("content hash must be 32 bytes"));
        }
        let mut arr = [0u8; 32];
        arr.copy_from_slice(&bytes);
        Ok(ContentHash(arr))
    }
}

/// First 16 hex characters of a SHA-256 digest over the canonical
/// configuration; namespaces every on-disk artifact.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct VersionHash(pub String);

impl fmt::Display for VersionHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The kind of a module, derived from its extension unless a loader
/// overrides it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ModuleKind {
    Js,
    Css,
    CssModule,
    Asset,
    Json,
}

impl ModuleKind {
    pub fn from_extension(ext: &str) -> Self {
        match ext.to_ascii_lowercase().as_str() {
            "js" | "jsx" | "ts" | "tsx" | "mjs" | "cjs" | "html" => ModuleKind::Js,
            "css" => ModuleKind::Css,
            "json" => ModuleKind::Json,
            _ => ModuleKind::Asset,
        }
    }

    /// Like [`Self::from_extension`], but also recognizes the `*.module.css`
    /// filename convention from `spec.md` §6 ("`?module` on CSS (or
    /// `*.module.css`) → CSS Modules with a local-name mapping export").
    pub fn from_path(path: &std::path::Path) -> Self {
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or("")
            .to_ascii_lowercase();
        let kind = Self::from_extension(&ext);
        if kind == ModuleKind::Css && Self::has_module_stem(path) {
            ModuleKind::CssModule
        } else {
            kind
        }
    }

    fn has_module_stem(path: &std::path::Path) -> bool {
        path.file_stem()
            .and_then(|s| s.to_str())
            .is_some_and(|s| s.ends_with(".module"))
    }

    /// The CAS artifact name a transformed copy of this kind is stored
    /// under (`spec.md` §3).
    pub fn artifact_name(self) -> &'static str {
        match self {
            ModuleKind::Css | ModuleKind::CssModule => "transformed.css",
            _ => "transformed.js",
        }
    }
}

/// A single node of the persistent dependency graph.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleNode {
    pub id: ModuleId,
    pub content_hash: Option<ContentHash>,
    pub kind: ModuleKind,
    pub static_deps: Vec<ModuleId>,
    pub dynamic_deps: Vec<ModuleId>,
    pub config_hash: Option<VersionHash>,
    pub mtime_ms: Option<u64>,
}

impl ModuleNode {
    pub fn new(id: ModuleId, kind: ModuleKind) -> Self {
        Self {
            id,
            content_hash: None,
            kind,
            static_deps: Vec::new(),
            dynamic_deps: Vec::new(),
            config_hash: None,
            mtime_ms: None,
        }
    }

    /// All ids this node depends on, static deps first, in insertion order.
    pub fn all_deps(&self) -> impl Iterator<Item = &ModuleId> {
        self.static_deps.iter().chain(self.dynamic_deps.iter())
    }
}

/// The reason a module is included in an [`HmrUpdate`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UpdateReason {
    Changed,
    Dependent,
    Deleted,
}

/// One module entry inside a queued HMR batch.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingModule {
    pub abs_path: PathBuf,
    pub url: String,
    pub content_hash: Option<ContentHash>,
    pub reason: UpdateReason,
}

/// A batch of module changes queued for a client to fetch via `apply`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingUpdate {
    pub id: String,
    pub modules: Vec<PendingModule>,
    pub created_at_ms: u64,
}

fn hex_encode(bytes: &[u8]) -> String {
    use std::fmt::Write;
    let mut s = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        let _ = write!(s, "{b:02x}");
    }
    s
}

fn hex_decode(s: &str) -> Result<Vec<u8>, String> {
    if s.len() % 2 != 0 {
        return Err("odd-length hex string".into());
    }
    (0..s.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&s[i..i + 2], 16).map_err(|e| e.to_string()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn module_id_equality_includes_query() {
        let a = ModuleId::new("/a/b.css");
        let b = ModuleId::with_query("/a/b.css", "inline");
        assert_ne!(a, b);
        assert_eq!(a, ModuleId::new("/a/b.css"));
    }

    #[test]
    fn content_hash_round_trips_through_hex() {
        let hash = ContentHash([7u8; 32]);
        let hex = hash.to_hex();
        let decoded = hex_decode(&hex).unwrap();
        assert_eq!(decoded, vec![7u8; 32]);
    }
}
