//! Path exclusion rules for context assembly.
//!
//! Matching is substring/suffix based rather than a glob engine: a path is
//! ignored when its string form contains a pattern, or ends with the pattern
//! once `*` wildcards are stripped. False positives on names that merely
//! contain a banned substring are accepted.

use std::fs;
use std::path::Path;

use tracing::{debug, warn};

/// Patterns that are always ignored.
pub const DEFAULT_IGNORES: &[&str] = &[
    "__pycache__",
    ".git",
    "node_modules",
    ".venv",
    "venv",
    ".idea",
    ".vscode",
    "*.pyc",
    "*.pyo",
    "*.so",
    "*.dll",
    "*.exe",
    "*.bin",
    "*.jpg",
    "*.png",
    "*.gif",
    "*.pdf",
];

/// Built-in ignores plus the patterns loaded for one project.
///
/// Immutable once built; a new context builder loads a fresh set.
#[derive(Debug, Clone, Default)]
pub struct IgnoreRules {
    patterns: Vec<String>,
}

impl IgnoreRules {
    /// Create a rule set from extra patterns (built-ins always apply).
    pub fn new<I, S>(patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            patterns: patterns
                .into_iter()
                .filter_map(|p| normalize_pattern(p.as_ref()))
                .collect(),
        }
    }

    /// Load patterns from `<root>/.gitignore` if it exists.
    ///
    /// Blank lines, comments and negations are skipped. A file that cannot be
    /// read yields an empty loaded set.
    pub fn load(root: &Path) -> Self {
        let path = root.join(".gitignore");
        if !path.is_file() {
            return Self::default();
        }
        match fs::read_to_string(&path) {
            Ok(content) => {
                let rules = Self::new(content.lines());
                debug!(count = rules.patterns.len(), "loaded ignore patterns");
                rules
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "failed to read ignore file");
                Self::default()
            }
        }
    }

    /// Add one more pattern.
    pub fn with_pattern(mut self, pattern: &str) -> Self {
        if let Some(p) = normalize_pattern(pattern) {
            self.patterns.push(p);
        }
        self
    }

    /// Patterns loaded on top of [`DEFAULT_IGNORES`].
    pub fn patterns(&self) -> &[String] {
        &self.patterns
    }

    /// Returns `true` if `path` matches a built-in or loaded pattern.
    pub fn should_ignore(&self, path: &Path) -> bool {
        should_ignore(path, self)
    }
}

/// Returns `true` if `path` should be excluded from context.
pub fn should_ignore(path: &Path, rules: &IgnoreRules) -> bool {
    let path_str = path.to_string_lossy();
    DEFAULT_IGNORES
        .iter()
        .copied()
        .chain(rules.patterns.iter().map(String::as_str))
        .any(|pattern| matches_pattern(&path_str, pattern))
}

fn matches_pattern(path: &str, pattern: &str) -> bool {
    if path.contains(pattern) {
        return true;
    }
    let suffix = pattern.replace('*', "");
    !suffix.is_empty() && path.ends_with(&suffix)
}

fn normalize_pattern(raw: &str) -> Option<String> {
    let line = raw.trim();
    if line.is_empty() || line.starts_with('#') || line.starts_with('!') {
        return None;
    }
    let trimmed = line.trim_start_matches('/').trim_end_matches('/');
    if trimmed.is_empty() {
        return None;
    }
    Some(trimmed.to_owned())
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::*;

    #[test]
    fn test_should_ignore_default_directories() {
        let rules = IgnoreRules::default();
        for path in [
            "pkg/__pycache__/mod.cpython-311.pyc",
            ".git/HEAD",
            "web/node_modules/react/index.js",
            ".venv/bin/python",
            ".vscode/settings.json",
        ] {
            assert!(rules.should_ignore(Path::new(path)), "{path} should be ignored");
        }
    }

    #[test]
    fn test_should_ignore_wildcard_extensions_by_suffix() {
        let rules = IgnoreRules::default();
        assert!(rules.should_ignore(Path::new("build/lib.so")));
        assert!(rules.should_ignore(Path::new("assets/logo.png")));
        assert!(!rules.should_ignore(Path::new("src/main.py")));
    }

    #[test]
    fn test_should_accept_substring_false_positive() {
        // "venv" inside an unrelated name still matches.
        let rules = IgnoreRules::default();
        assert!(rules.should_ignore(Path::new("docs/venv_setup.md")));
    }

    #[test]
    fn test_should_apply_loaded_patterns() {
        let rules = IgnoreRules::new(["target/", "*.log", "/dist"]);
        assert_eq!(rules.patterns(), ["target", "*.log", "dist"]);
        assert!(rules.should_ignore(Path::new("target")));
        assert!(rules.should_ignore(Path::new("logs/app.log")));
        assert!(rules.should_ignore(Path::new("dist/bundle.js")));
        assert!(!rules.should_ignore(Path::new("src/lib.rs")));
    }

    #[test]
    fn test_should_skip_comments_negations_and_bare_wildcards() {
        let rules = IgnoreRules::new(["# comment", "", "!keep.py", "*", "/"]);
        assert_eq!(rules.patterns(), ["*"]);
        // A bare `*` only matches a literal asterisk, never every path.
        assert!(!rules.should_ignore(Path::new("src/main.py")));
    }

    #[test]
    fn test_should_load_gitignore_from_root() {
        let dir = tempfile::TempDir::new().expect("should create temp dir");
        std::fs::write(dir.path().join(".gitignore"), "# build output\nbuild/\n\n*.tmp\n")
            .expect("should write gitignore");

        let rules = IgnoreRules::load(dir.path());
        assert_eq!(rules.patterns(), ["build", "*.tmp"]);
        assert!(rules.should_ignore(&PathBuf::from("build/out.js")));
    }

    #[test]
    fn test_should_load_empty_rules_without_gitignore() {
        let dir = tempfile::TempDir::new().expect("should create temp dir");
        let rules = IgnoreRules::load(dir.path()).with_pattern(".kpa-backups");
        assert_eq!(rules.patterns(), [".kpa-backups"]);
    }
}
