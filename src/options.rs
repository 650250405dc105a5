use std::collections::BTreeMap;

use rustc_hash::FxHashSet;
use serde::{Deserialize, Serialize};

/// Helpers every template can call without registration.
pub const BUILTIN_HELPERS: [&str; 8] = [
    "helperMissing",
    "blockHelperMissing",
    "each",
    "if",
    "unless",
    "with",
    "log",
    "lookup",
];

/// Caller-facing compile options.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(default)]
pub struct CompileOptions {
    pub data: bool,
    pub compat: bool,
    /// Overlay on the built-in helper set; `false` removes a built-in.
    pub known_helpers: BTreeMap<String, bool>,
    pub known_helpers_only: bool,
    pub no_escape: bool,
    pub strict: bool,
    pub assume_objects: bool,
    pub prevent_indent: bool,
    pub ignore_standalone: bool,
    pub explicit_partial_context: bool,
}

impl Default for CompileOptions {
    fn default() -> Self {
        CompileOptions {
            data: true,
            compat: false,
            known_helpers: BTreeMap::new(),
            known_helpers_only: false,
            no_escape: false,
            strict: false,
            assume_objects: false,
            prevent_indent: false,
            ignore_standalone: false,
            explicit_partial_context: false,
        }
    }
}

impl CompileOptions {
    pub fn known_helper(mut self, name: impl Into<String>) -> Self {
        self.known_helpers.insert(name.into(), true);
        self
    }

    /// Freeze the options for one compilation. The known-helper set is built
    /// fresh; `self` is left untouched.
    pub fn resolve(&self) -> CompilerConfig {
        let mut known_helpers: FxHashSet<String> =
            BUILTIN_HELPERS.iter().map(|h| h.to_string()).collect();
        for (name, known) in &self.known_helpers {
            if *known {
                known_helpers.insert(name.clone());
            } else {
                known_helpers.remove(name);
            }
        }
        CompilerConfig {
            options: self.clone(),
            known_helpers,
        }
    }
}

/// Immutable configuration shared by both compiler passes.
#[derive(Debug, Clone)]
pub struct CompilerConfig {
    pub options: CompileOptions,
    known_helpers: FxHashSet<String>,
}

impl CompilerConfig {
    pub fn is_known_helper(&self, name: &str) -> bool {
        self.known_helpers.contains(name)
    }
}

impl Default for CompilerConfig {
    fn default() -> Self {
        CompileOptions::default().resolve()
    }
}

impl std::ops::Deref for CompilerConfig {
    type Target = CompileOptions;

    fn deref(&self) -> &CompileOptions {
        &self.options
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtins_known_by_default() {
        let config = CompileOptions::default().resolve();
        for name in BUILTIN_HELPERS {
            assert!(config.is_known_helper(name));
        }
        assert!(!config.is_known_helper("custom"));
    }

    #[test]
    fn test_overlay_adds_and_removes() {
        let mut options = CompileOptions::default().known_helper("custom");
        options.known_helpers.insert("each".to_string(), false);
        let config = options.resolve();
        assert!(config.is_known_helper("custom"));
        assert!(!config.is_known_helper("each"));
        assert!(config.is_known_helper("if"));
        // caller's map is not merged with built-ins
        assert_eq!(options.known_helpers.len(), 2);
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let options: CompileOptions = serde_json::from_str(r#"{"strict": true}"#).unwrap();
        assert!(options.strict);
        assert!(options.data);
    }
}
