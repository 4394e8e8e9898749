//! Context assembly: tree summary, relevance ranking and budgeted snippets.
//!
//! A [`ContextBundle`] is rebuilt for every task because the project may have
//! changed between calls. Its invariant: the estimated tokens of the tree plus
//! every included snippet never exceed the configured budget. Files are taken
//! in relevance order and inclusion stops at the first file that would
//! overflow (first-fit, not best-fit).

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use tracing::{debug, instrument};
use walkdir::WalkDir;

use crate::binary::is_binary;
use crate::config::ContextConfig;
use crate::ignore::IgnoreRules;
use crate::tokens::estimate_tokens;

/// Text used in place of snippets when no file made it into the bundle.
pub const NO_FILES_SENTINEL: &str = "No relevant files found.";

/// Well-known entry points added while few relevant files have been found.
const ENTRY_POINTS: &[&str] = &["main.py", "app.py", "index.js", "main.js", "Main.java"];

/// Entry points are only added while fewer than this many files were found.
const ENTRY_POINT_THRESHOLD: usize = 5;

/// Characters of snippet text included in the planning context.
const PLAN_SNIPPET_CHARS: usize = 1000;

/// Depth-bounded textual rendering of the project tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProjectTree(String);

impl ProjectTree {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

impl fmt::Display for ProjectTree {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A file found during traversal that passed the ignore and binary filters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CandidateFile {
    /// Path on disk.
    pub path: PathBuf,
    /// Path relative to the traversal root, used in prompts.
    pub relative: PathBuf,
    /// Extension without the leading dot.
    pub extension: Option<String>,
    /// Always `true` for returned candidates; binary files are dropped.
    pub is_text: bool,
}

/// One file included in a bundle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snippet {
    pub path: PathBuf,
    /// Header line plus content, possibly truncated.
    pub content: String,
    pub tokens: usize,
}

/// Tree summary and budgeted snippets handed to a generation backend.
#[derive(Debug, Clone)]
pub struct ContextBundle {
    pub tree: String,
    pub snippets: Vec<Snippet>,
    /// Estimated tokens of the tree plus all snippets.
    pub token_estimate: usize,
}

impl ContextBundle {
    /// Snippets joined by blank lines, or [`NO_FILES_SENTINEL`] when empty.
    pub fn snippets_text(&self) -> String {
        if self.snippets.is_empty() {
            return NO_FILES_SENTINEL.to_owned();
        }
        self.snippets
            .iter()
            .map(|s| s.content.as_str())
            .collect::<Vec<_>>()
            .join("\n\n")
    }

    /// Tree plus the first snippet characters, used by the planning step.
    pub fn planning_text(&self) -> String {
        let snippets = self.snippets_text();
        let excerpt: String = snippets.chars().take(PLAN_SNIPPET_CHARS).collect();
        format!("{}\n\n{}", self.tree, excerpt)
    }
}

/// Builds [`ContextBundle`]s for one project root.
#[derive(Debug, Clone)]
pub struct ContextBuilder {
    root: PathBuf,
    rules: IgnoreRules,
    config: ContextConfig,
}

impl ContextBuilder {
    /// Create a builder, loading ignore patterns from `<root>/.gitignore`.
    pub fn new(root: impl Into<PathBuf>, config: ContextConfig) -> Self {
        let root = root.into();
        let rules = IgnoreRules::load(&root);
        Self::with_rules(root, config, rules)
    }

    /// Create a builder with an explicit rule set.
    pub fn with_rules(root: impl Into<PathBuf>, config: ContextConfig, rules: IgnoreRules) -> Self {
        Self {
            root: root.into(),
            rules,
            config,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn rules(&self) -> &IgnoreRules {
        &self.rules
    }

    /// Render the directory tree under `root` up to `max_depth` levels.
    ///
    /// Directories come before files, each group sorted by name. Ignored
    /// entries are skipped along with their subtrees, and unreadable
    /// directories end that branch silently.
    pub fn build_tree(&self, root: &Path, max_depth: usize) -> ProjectTree {
        let name = root
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| ".".to_owned());
        let mut lines = vec![format!("Project Root: {name}/")];
        self.walk_tree(root, root, "", 0, max_depth, &mut lines);
        ProjectTree(lines.join("\n"))
    }

    fn walk_tree(
        &self,
        root: &Path,
        dir: &Path,
        prefix: &str,
        depth: usize,
        max_depth: usize,
        lines: &mut Vec<String>,
    ) {
        if depth >= max_depth {
            return;
        }

        let Ok(read_dir) = fs::read_dir(dir) else {
            return;
        };

        let mut entries: Vec<(PathBuf, bool)> = read_dir
            .filter_map(|e| e.ok())
            .map(|e| {
                let path = e.path();
                let is_dir = path.is_dir();
                (path, is_dir)
            })
            .filter(|(path, _)| !self.is_ignored(root, path))
            .collect();

        entries.sort_by(|(a, a_dir), (b, b_dir)| {
            b_dir.cmp(a_dir).then_with(|| a.file_name().cmp(&b.file_name()))
        });

        let total = entries.len();
        for (i, (path, is_dir)) in entries.iter().enumerate() {
            let is_last = i + 1 == total;
            let connector = if is_last { "└── " } else { "├── " };
            let child_prefix = if is_last { "    " } else { "│   " };
            let name = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();

            if *is_dir {
                lines.push(format!("{prefix}{connector}{name}/"));
                let next = format!("{prefix}{child_prefix}");
                self.walk_tree(root, path, &next, depth + 1, max_depth, lines);
            } else {
                lines.push(format!("{prefix}{connector}{name}"));
            }
        }
    }

    /// Rank files under `root` by relevance to `task`.
    ///
    /// Files whose name contains any whitespace token of the task (case
    /// insensitive) come first, in walk order. While fewer than five files
    /// have been found, well-known entry points are collected too and follow
    /// the matches. A task without tokens matches every eligible file. At
    /// most `maxFiles` candidates are returned.
    #[instrument(skip(self, root, extensions), fields(root = %root.display()))]
    pub fn find_relevant(
        &self,
        task: &str,
        root: &Path,
        extensions: &[String],
    ) -> Vec<CandidateFile> {
        let task_lower = task.to_lowercase();
        let keywords: Vec<&str> = task_lower.split_whitespace().collect();

        let mut matched = Vec::new();
        let mut entry_points = Vec::new();

        let walker = WalkDir::new(root)
            .follow_links(false)
            .sort_by(|a, b| {
                a.file_type()
                    .is_dir()
                    .cmp(&b.file_type().is_dir())
                    .then_with(|| a.file_name().cmp(b.file_name()))
            })
            .into_iter()
            .filter_entry(|e| e.depth() == 0 || !self.is_ignored(root, e.path()));

        for entry in walker.filter_map(|e| e.ok()) {
            if !entry.file_type().is_file() {
                continue;
            }
            let file_name = entry.file_name().to_string_lossy();
            if !extensions.iter().any(|ext| file_name.ends_with(ext.as_str())) {
                continue;
            }
            if is_binary(entry.path()) {
                continue;
            }

            let name_lower = file_name.to_lowercase();
            let is_match =
                keywords.is_empty() || keywords.iter().any(|k| name_lower.contains(k));

            if is_match {
                matched.push(self.candidate(root, entry.path()));
            } else if matched.len() + entry_points.len() < ENTRY_POINT_THRESHOLD
                && ENTRY_POINTS.contains(&file_name.as_ref())
            {
                entry_points.push(self.candidate(root, entry.path()));
            }
        }

        debug!(
            matched = matched.len(),
            entry_points = entry_points.len(),
            "ranked relevant files"
        );

        matched
            .into_iter()
            .chain(entry_points)
            .take(self.config.max_files)
            .collect()
    }

    /// Read a candidate as a snippet, capped at `maxLines` lines.
    ///
    /// Unreadable files produce an explanatory placeholder instead of failing.
    pub fn read_snippet(&self, file: &CandidateFile) -> String {
        let display = file.relative.display();
        let bytes = match fs::read(&file.path) {
            Ok(bytes) => bytes,
            Err(e) => return format!("# File: {display}\n# Error reading file: {e}"),
        };
        let text = String::from_utf8_lossy(&bytes);
        let lines: Vec<&str> = text.split_inclusive('\n').collect();
        let max_lines = self.config.max_lines;

        if lines.len() > max_lines {
            format!(
                "# File: {display} (truncated - showing first {max_lines} lines)\n{}\n... ({} more lines)",
                lines[..max_lines].concat(),
                lines.len() - max_lines
            )
        } else {
            format!("# File: {display}\n{text}")
        }
    }

    /// Build the budgeted context for `task`.
    #[instrument(skip(self))]
    pub fn build_context(&self, task: &str) -> ContextBundle {
        let budget = self.config.max_tokens;
        let tree = fit_to_budget(
            self.build_tree(&self.root, self.config.max_depth).into_string(),
            budget,
        );
        let mut total = estimate_tokens(&tree);

        let mut snippets = Vec::new();
        for file in self.find_relevant(task, &self.root, &self.config.extensions) {
            let content = self.read_snippet(&file);
            let tokens = estimate_tokens(&content);
            if total + tokens > budget {
                debug!(
                    file = %file.relative.display(),
                    tokens,
                    total,
                    budget,
                    "budget reached, dropping remaining files"
                );
                break;
            }
            total += tokens;
            snippets.push(Snippet {
                path: file.relative,
                content,
                tokens,
            });
        }

        debug!(files = snippets.len(), tokens = total, "built context bundle");
        ContextBundle {
            tree,
            snippets,
            token_estimate: total,
        }
    }

    fn is_ignored(&self, root: &Path, path: &Path) -> bool {
        let relative = path.strip_prefix(root).unwrap_or(path);
        self.rules.should_ignore(relative)
    }

    fn candidate(&self, root: &Path, path: &Path) -> CandidateFile {
        CandidateFile {
            path: path.to_path_buf(),
            relative: path.strip_prefix(root).unwrap_or(path).to_path_buf(),
            extension: path
                .extension()
                .map(|e| e.to_string_lossy().into_owned()),
            is_text: true,
        }
    }
}

/// Cut `text` at a line boundary so its estimate fits within `budget`.
fn fit_to_budget(text: String, budget: usize) -> String {
    if estimate_tokens(&text) <= budget {
        return text;
    }
    let mut kept = String::new();
    for line in text.lines() {
        let candidate_len = kept.chars().count() + line.chars().count() + usize::from(!kept.is_empty());
        if candidate_len / 4 > budget {
            break;
        }
        if !kept.is_empty() {
            kept.push('\n');
        }
        kept.push_str(line);
    }
    kept
}
