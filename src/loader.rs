//! Loader Registry (C8, loader half): the ordered chain of pluggable
//! transform stages. Concrete parsers/minifiers/CSS processors are external
//! `Loader` implementations; this crate only defines the contract, the
//! ordering rule, and a passthrough stub used by tests.

use crate::error::TransformError;
use crate::hash::hash_many;
use std::sync::Arc;

/// Context handed to a loader for one transform attempt.
pub struct LoaderContext<'a> {
    pub path: &'a std::path::Path,
    pub code: String,
    pub module_hash: &'a str,
}

/// The result of a successful transform.
#[derive(Clone, Debug)]
pub struct LoaderOutput {
    pub code: String,
    pub map: Option<String>,
}

/// A single transform stage. Loaders are sorted ascending by `order`, ties
/// broken by registration order; each loader sees the previous loader's
/// output. Returning `Ok(None)` means "pass through unchanged".
pub trait Loader: Send + Sync {
    fn name(&self) -> &str;
    fn order(&self) -> i32;
    fn test(&self, ctx: &LoaderContext<'_>) -> bool;
    fn transform(&self, ctx: &LoaderContext<'_>) -> Result<Option<LoaderOutput>, TransformError>;
}

/// A no-op loader used by tests to exercise the pipeline without depending
/// on an external parser engine.
pub struct PassthroughLoader;

impl Loader for PassthroughLoader {
    fn name(&self) -> &str {
        "passthrough"
    }

    fn order(&self) -> i32 {
        0
    }

    fn test(&self, _ctx: &LoaderContext<'_>) -> bool {
        true
    }

    fn transform(&self, _ctx: &LoaderContext<'_>) -> Result<Option<LoaderOutput>, TransformError> {
        Ok(None)
    }
}

/// Holds every registered loader, sorted once at construction time.
pub struct LoaderRegistry {
    loaders: Vec<Arc<dyn Loader>>,
}

impl LoaderRegistry {
    pub fn new(mut loaders: Vec<Arc<dyn Loader>>) -> Self {
        // `sort_by_key` is stable, so registration order breaks ties as
        // `spec.md` §4.8 requires.
        loaders.sort_by_key(|l| l.order());
        Self { loaders }
    }

    /// Loaders (in chain order) whose `test` predicate matches this context.
    pub fn matching<'a>(&'a self, ctx: &LoaderContext<'_>) -> Vec<&'a Arc<dyn Loader>> {
        self.loaders.iter().filter(|l| l.test(ctx)).collect()
    }

    /// `hash(names of matching loaders in order)`, used to key the transform
    /// cache so a config/loader-set change never serves a stale artifact.
    pub fn signature_hash(matching: &[&Arc<dyn Loader>]) -> crate::data::ContentHash {
        let names: Vec<&[u8]> = matching.iter().map(|l| l.name().as_bytes()).collect();
        hash_many(&names)
    }

    /// Run the matching chain against `code`, returning the final output
    /// (original code unchanged if every loader passed through).
    pub fn run_chain(
        &self,
        path: &std::path::Path,
        module_hash: &str,
        mut code: String,
    ) -> Result<LoaderOutput, TransformError> {
        let ctx_probe = LoaderContext {
            path,
            code: code.clone(),
            module_hash,
        };
        let matching = self.matching(&ctx_probe);

        let mut map = None;
        for loader in matching {
            let ctx = LoaderContext {
                path,
                code: code.clone(),
                module_hash,
            };
            if let Some(out) = loader.transform(&ctx)? {
                code = out.code;
                map = out.map.or(map);
            }
        }

        Ok(LoaderOutput { code, map })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct TagLoader(&'static str, i32);
    impl Loader for TagLoader {
        fn name(&self) -> &str {
            self.0
        }
        fn order(&self) -> i32 {
            self.1
        }
        fn test(&self, _ctx: &LoaderContext<'_>) -> bool {
            true
        }
        fn transform(&self, ctx: &LoaderContext<'_>) -> Result<Option<LoaderOutput>, TransformError> {
            Ok(Some(LoaderOutput {
                code: format!("{}/{}", ctx.code, self.0),
                map: None,
            }))
        }
    }

    #[test]
    fn loaders_run_in_order_ties_by_registration() {
        let registry = LoaderRegistry::new(vec![
            Arc::new(TagLoader("b", 1)),
            Arc::new(TagLoader("a", 0)),
            Arc::new(TagLoader("c", 1)),
        ]);
        let out = registry
            .run_chain(std::path::Path::new("x.ts"), "hash", "src".into())
            .unwrap();
        assert_eq!(out.code, "src/a/b/c");
    }
}
