//! Ionify config.
//!
//! Ionify follows the same layered configuration approach `trunk` does:
//! reasonable defaults, an optional on-disk configuration file, then
//! CLI/env overrides on top.
//!
//! * [`model`] is the on-disk, `serde`-deserializable project shape
//!   (`IonifyConfig`, loaded from `Ionify.toml`).
//! * [`rt`] is the canonicalized runtime configuration (`RtcCore`): absolute
//!   paths, environment overrides folded in, and the `VersionHash` computed
//!   via the Version Canonicalizer (`spec.md` §4.2).
//!
//! The command line structs living in [`crate::cmd`] parse overrides via
//! `clap`, then call [`model::load`] followed by [`rt::build`] to produce
//! the `RtcCore` a command actually runs against.

pub mod model;
pub mod rt;

pub use model::{load, IonifyConfig};
pub use rt::RtcCore;

/// Default name of the on-disk config file, looked for in the project root
/// unless `--config` overrides it.
pub const CONFIG_FILE_NAME: &str = "Ionify.toml";

/// Default name of the directory holding persisted graph/CAS/cache state.
pub const IONIFY_DIR: &str = ".ionify";
