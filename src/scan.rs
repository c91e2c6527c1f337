//! Lightweight specifier scanning shared by the Dev Dispatcher and the
//! `build` command. This is not the concrete parser (an external
//! `Transformer`'s concern per `spec.md` §1); it only recognizes enough
//! surface syntax — `import ... from '...'`, bare `import '...'`, and
//! `require('...')` — to feed the Resolver and build graph edges without a
//! full AST.

use once_cell::sync::Lazy;
use regex::Regex;

// The pattern is a fixed string literal checked at compile time by
// inspection; it cannot fail to parse at runtime.
#[allow(clippy::expect_used)]
static IMPORT_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?:import\s+(?:[^'"]*?from\s+)?|require\()\s*['"]([^'"]+)['"]"#)
        .expect("static regex is valid")
});

pub fn extract_specifiers(code: &str) -> Vec<String> {
    IMPORT_RE
        .captures_iter(code)
        .filter_map(|c| c.get(1).map(|m| m.as_str().to_string()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extract_specifiers_handles_import_and_require() {
        let code = r#"
            import foo from "./foo";
            import './side-effect';
            const bar = require('bar');
        "#;
        let specs = extract_specifiers(code);
        assert_eq!(specs, vec!["./foo", "./side-effect", "bar"]);
    }
}
