//! Prompt template registry backed by `minijinja`.
//!
//! Built-in templates are compiled into the binary. Directories loaded with
//! [`PromptManager::load_dir`] override built-ins that share a name, which is
//! how a project customizes wording without touching control flow.

use std::collections::BTreeSet;
use std::fs;
use std::path::Path;

use minijinja::{Environment, ErrorKind};
use tracing::debug;

use crate::error::PmError;
use crate::template::PromptTemplate;

/// Templates shipped with the crate, as `(name, source)`.
const BUILTIN_TEMPLATES: &[(&str, &str)] = &[
    ("system/en", include_str!("../templates/system/en.j2")),
    ("system/es", include_str!("../templates/system/es.j2")),
    ("plan", include_str!("../templates/plan.j2")),
    ("implement", include_str!("../templates/implement.j2")),
    ("modify", include_str!("../templates/modify.j2")),
];

/// File extensions recognized by [`PromptManager::load_dir`].
const TEMPLATE_EXTENSIONS: &[&str] = &["j2", "jinja"];

/// Manages prompt templates and renders them with context variables.
#[derive(Debug)]
pub struct PromptManager {
    env: Environment<'static>,
    names: BTreeSet<String>,
}

impl PromptManager {
    /// Create a manager with all built-in templates registered.
    ///
    /// # Errors
    ///
    /// Returns `PmError::InvalidTemplate` if a built-in template fails to parse.
    pub fn new() -> Result<Self, PmError> {
        let mut pm = Self {
            env: Environment::new(),
            names: BTreeSet::new(),
        };
        for (name, source) in BUILTIN_TEMPLATES {
            pm.add_template(PromptTemplate::new(*name, *source))?;
        }
        Ok(pm)
    }

    /// Load all `.j2` / `.jinja` templates from a directory, recursively.
    ///
    /// Template names are the path relative to `dir` without the extension,
    /// using `/` as separator (`system/en.j2` becomes `system/en`).
    ///
    /// # Errors
    ///
    /// Returns `PmError::Read` if the directory cannot be read and
    /// `PmError::InvalidTemplate` if a template fails to parse.
    pub fn load_dir(&mut self, dir: &Path) -> Result<(), PmError> {
        self.load_dir_inner(dir, dir)
    }

    fn load_dir_inner(&mut self, root: &Path, dir: &Path) -> Result<(), PmError> {
        let read_err = |source| PmError::Read {
            path: dir.to_path_buf(),
            source,
        };
        let mut entries: Vec<_> = fs::read_dir(dir)
            .map_err(read_err)?
            .filter_map(|e| e.ok())
            .collect();
        entries.sort_by_key(|e| e.file_name());

        for entry in entries {
            let path = entry.path();
            if path.is_dir() {
                self.load_dir_inner(root, &path)?;
                continue;
            }

            let is_template = path
                .extension()
                .and_then(|e| e.to_str())
                .is_some_and(|ext| TEMPLATE_EXTENSIONS.contains(&ext));
            if !is_template {
                continue;
            }

            let Ok(relative) = path.with_extension("").strip_prefix(root).map(Path::to_path_buf)
            else {
                continue;
            };
            let name = relative
                .components()
                .map(|c| c.as_os_str().to_string_lossy())
                .collect::<Vec<_>>()
                .join("/");

            let source = fs::read_to_string(&path).map_err(|source| PmError::Read {
                path: path.clone(),
                source,
            })?;
            debug!(name = %name, path = %path.display(), "loaded prompt template");
            self.add_template(PromptTemplate::new(name, source))?;
        }

        Ok(())
    }

    /// Register a single template, replacing any template with the same name.
    ///
    /// # Errors
    ///
    /// Returns `PmError::InvalidTemplate` if the source fails to parse.
    pub fn add_template(&mut self, template: PromptTemplate) -> Result<(), PmError> {
        let PromptTemplate { name, source } = template;
        self.env
            .add_template_owned(name.clone(), source)
            .map_err(|e| PmError::InvalidTemplate {
                name: name.clone(),
                reason: e.to_string(),
            })?;
        self.names.insert(name);
        Ok(())
    }

    /// Render a template by name with the given context.
    ///
    /// # Errors
    ///
    /// Returns `PmError::TemplateNotFound` for unknown names and
    /// `PmError::Render` if rendering fails.
    pub fn render(&self, name: &str, ctx: &serde_json::Value) -> Result<String, PmError> {
        let template = self.env.get_template(name).map_err(|e| match e.kind() {
            ErrorKind::TemplateNotFound => PmError::TemplateNotFound(name.to_owned()),
            _ => PmError::Render {
                name: name.to_owned(),
                reason: e.to_string(),
            },
        })?;
        template
            .render(ctx)
            .map_err(|e| PmError::Render {
                name: name.to_owned(),
                reason: e.to_string(),
            })
    }

    /// Names of all registered templates, sorted.
    pub fn list_templates(&self) -> Vec<&str> {
        self.names.iter().map(String::as_str).collect()
    }
}
