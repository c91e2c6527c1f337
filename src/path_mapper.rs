//! Path Mapper (C3): translates between absolute filesystem paths and the
//! public URLs the dev dispatcher serves, escaping out-of-root paths behind
//! a base64url-encoded module prefix.
//!
//! Per `spec.md` §9, the base64url encoding is a compatibility device only;
//! `decode` always re-derives an absolute path and checks it against `root`
//! rather than trusting the prefix as a security boundary.

use anyhow::{anyhow, Result};
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use std::path::{Component, Path, PathBuf};

/// URL path segment used to address modules outside of `root`.
pub const MODULE_PREFIX: &str = "@ionify";

/// Compute the public URL for `abs_path` relative to `root`.
pub fn public_path_for(root: &Path, abs_path: &Path) -> String {
    match relative_within(root, abs_path) {
        Some(rel) => format!("/{}", path_to_posix(&rel)),
        None => format!(
            "/{MODULE_PREFIX}/{}",
            URL_SAFE_NO_PAD.encode(abs_path.to_string_lossy().as_bytes())
        ),
    }
}

/// Reverse of [`public_path_for`]. Rejects any non-prefixed url whose
/// resolution would escape `root`, and any malformed base64url payload.
pub fn decode(root: &Path, url: &str) -> Result<PathBuf> {
    let trimmed = url.trim_start_matches('/');

    if let Some(encoded) = trimmed.strip_prefix(&format!("{MODULE_PREFIX}/")) {
        let bytes = URL_SAFE_NO_PAD
            .decode(encoded)
            .map_err(|e| anyhow!("malformed module-prefix path: {e}"))?;
        let path = PathBuf::from(
            String::from_utf8(bytes).map_err(|e| anyhow!("non-utf8 module path: {e}"))?,
        );
        return Ok(path);
    }

    let candidate = normalize(&root.join(trimmed));
    let root = normalize(root);
    if !candidate.starts_with(&root) {
        return Err(anyhow!(
            "path '{}' escapes root '{}'",
            candidate.display(),
            root.display()
        ));
    }
    Ok(candidate)
}

/// If `abs_path` lives under `root`, return the relative path; otherwise
/// `None`. Both paths are lexically normalized first, no filesystem access.
fn relative_within(root: &Path, abs_path: &Path) -> Option<PathBuf> {
    let root = normalize(root);
    let abs_path = normalize(abs_path);
    abs_path
        .strip_prefix(&root)
        .ok()
        .map(|rel| rel.to_path_buf())
}

/// Lexical normalization (no symlink resolution, no filesystem access):
/// resolves `.`/`..` components so traversal segments can't smuggle a path
/// out of `root` before the `starts_with` check runs.
fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::ParentDir => {
                out.pop();
            }
            Component::CurDir => {}
            other => out.push(other.as_os_str()),
        }
    }
    out
}

fn path_to_posix(path: &Path) -> String {
    path.iter()
        .map(|c| c.to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inside_root_maps_to_relative_url() {
        let root = Path::new("/proj/src");
        let url = public_path_for(root, Path::new("/proj/src/a/b.ts"));
        assert_eq!(url, "/a/b.ts");
        assert_eq!(decode(root, &url).unwrap(), PathBuf::from("/proj/src/a/b.ts"));
    }

    #[test]
    fn outside_root_uses_module_prefix() {
        let root = Path::new("/proj/src");
        let url = public_path_for(root, Path::new("/other/lib.ts"));
        assert!(url.starts_with("/@ionify/"));
        assert_eq!(decode(root, &url).unwrap(), PathBuf::from("/other/lib.ts"));
    }

    #[test]
    fn traversal_outside_root_is_rejected() {
        let root = Path::new("/proj/src");
        assert!(decode(root, "/../../etc/passwd").is_err());
    }

    #[test]
    fn malformed_module_prefix_is_rejected() {
        let root = Path::new("/proj/src");
        assert!(decode(root, "/@ionify/not-base64!!!").is_err());
    }

    proptest::proptest! {
        #[test]
        fn round_trips_for_arbitrary_relative_segments(seg in "[a-zA-Z0-9_]{1,12}") {
            let root = Path::new("/proj/src");
            let p = root.join(&seg).join("mod.ts");
            let url = public_path_for(root, &p);
            proptest::prop_assert_eq!(decode(root, &url).unwrap(), p);
        }
    }
}
