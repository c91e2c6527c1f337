//! Version Canonicalizer (C2): normalizes a configuration record into a
//! byte-identical serialization for logically equal inputs, then hashes it
//! into a [`VersionHash`] that namespaces every derived artifact.

use crate::data::VersionHash;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParserMode {
    Oxc,
    Swc,
    Hybrid,
}

impl Default for ParserMode {
    fn default() -> Self {
        ParserMode::Hybrid
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Minifier {
    Oxc,
    Swc,
    Auto,
}

impl Default for Minifier {
    fn default() -> Self {
        Minifier::Auto
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TreeshakeMode {
    Safe,
    Aggressive,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TreeshakeOptions {
    pub mode: TreeshakeMode,
    pub include: Vec<String>,
    pub exclude: Vec<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScopeHoistOptions {
    pub inline_functions: bool,
    pub constant_folding: bool,
    pub combine_variables: bool,
}

/// The input record to canonicalize, as received from the configuration
/// layer. Fields mirror `spec.md` §4.2 exactly.
#[derive(Clone, Debug, Default)]
pub struct VersionInput {
    pub parser_mode: Option<ParserMode>,
    pub minifier: Option<Minifier>,
    pub treeshake: Option<TreeshakeOptions>,
    pub scope_hoist: Option<ScopeHoistOptions>,
    pub plugins: Vec<String>,
    pub entry: Vec<String>,
    pub css_options: BTreeMap<String, serde_json::Value>,
    pub asset_options: BTreeMap<String, serde_json::Value>,
}

/// The normalized, serializable form. `BTreeMap`/sorted `Vec` fields give a
/// canonical `serde_json` encoding regardless of input ordering.
#[derive(Serialize)]
struct CanonicalRecord {
    parser_mode: ParserMode,
    minifier: Minifier,
    treeshake: Option<TreeshakeOptions>,
    scope_hoist: Option<ScopeHoistOptions>,
    plugins: Vec<String>,
    entry: Option<Vec<String>>,
    css_options: Option<BTreeMap<String, serde_json::Value>>,
    asset_options: Option<BTreeMap<String, serde_json::Value>>,
}

fn sorted_dedup(mut v: Vec<String>) -> Vec<String> {
    v.sort();
    v.dedup();
    v
}

/// Apply every normalization rule from `spec.md` §4.2 and produce the
/// canonical record ready for serialization.
fn canonicalize(input: VersionInput) -> CanonicalRecord {
    let treeshake = input.treeshake.map(|mut t| {
        t.include = sorted_dedup(t.include);
        t.exclude = sorted_dedup(t.exclude);
        t
    });

    let entry = {
        let e = sorted_dedup(input.entry);
        if e.is_empty() {
            None
        } else {
            Some(e)
        }
    };

    let css_options = (!input.css_options.is_empty()).then_some(input.css_options);
    let asset_options = (!input.asset_options.is_empty()).then_some(input.asset_options);

    CanonicalRecord {
        parser_mode: input.parser_mode.unwrap_or_default(),
        minifier: input.minifier.unwrap_or_default(),
        treeshake,
        scope_hoist: input.scope_hoist,
        plugins: sorted_dedup(input.plugins),
        entry,
        css_options,
        asset_options,
    }
}

/// Compute the 16-hex `VersionHash` for a configuration input. Two inputs
/// that differ only in key ordering, set-like array ordering, or equivalent
/// `null`/absence must hash identically.
#[allow(clippy::expect_used)]
pub fn compute_version(input: VersionInput) -> VersionHash {
    let canonical = canonicalize(input);
    // serde_json serializes struct fields in declaration order and BTreeMap
    // keys in sorted order, which is sufficient for byte-identical output
    // across calls given the same canonical record. `CanonicalRecord` holds
    // only strings, bools, numbers and nested maps/vecs of the same, none
    // of which can fail to serialize.
    let bytes = serde_json::to_vec(&canonical).expect("canonical record is always serializable");
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    let digest = hasher.finalize();
    VersionHash(hex_prefix(&digest, 16))
}

fn hex_prefix(bytes: &[u8], hex_chars: usize) -> String {
    use std::fmt::Write;
    let mut s = String::with_capacity(hex_chars);
    for b in bytes {
        if s.len() >= hex_chars {
            break;
        }
        let _ = write!(s, "{b:02x}");
    }
    s.truncate(hex_chars);
    s
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plugin_order_does_not_affect_hash() {
        let a = VersionInput {
            parser_mode: Some(ParserMode::Oxc),
            plugins: vec!["a".into(), "b".into()],
            ..Default::default()
        };
        let b = VersionInput {
            parser_mode: Some(ParserMode::Oxc),
            plugins: vec!["b".into(), "a".into()],
            ..Default::default()
        };
        assert_eq!(compute_version(a).0, compute_version(b).0);
    }

    #[test]
    fn differing_parser_mode_changes_hash() {
        let a = VersionInput {
            parser_mode: Some(ParserMode::Oxc),
            plugins: vec!["a".into()],
            ..Default::default()
        };
        let b = VersionInput {
            parser_mode: Some(ParserMode::Swc),
            plugins: vec!["a".into()],
            ..Default::default()
        };
        assert_ne!(compute_version(a).0, compute_version(b).0);
    }

    #[test]
    fn empty_entry_is_equivalent_to_absent() {
        let a = VersionInput {
            entry: vec![],
            ..Default::default()
        };
        let b = VersionInput::default();
        assert_eq!(compute_version(a).0, compute_version(b).0);
    }

    proptest::proptest! {
        #[test]
        fn canonicalization_ignores_array_order(mut plugins in proptest::collection::vec("[a-z]{1,6}", 0..8)) {
            let a = VersionInput { plugins: plugins.clone(), ..Default::default() };
            plugins.reverse();
            let b = VersionInput { plugins, ..Default::default() };
            proptest::prop_assert_eq!(compute_version(a).0, compute_version(b).0);
        }
    }
}
