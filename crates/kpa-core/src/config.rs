//! Configuration types for kpa-core.
//!
//! Two layers feed a run: [`EngineConfig`] carries per-invocation choices
//! (backend, model, temperature, language) and [`ProjectConfig`] is read from
//! `.kpa/config.yaml`. Invocation values win whenever both are set.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use typed_builder::TypedBuilder;

/// Name of the per-project state directory (config and logs).
pub const STATE_DIR: &str = ".kpa";

// ── Engine Configuration (CLI-level) ─────────────────────────

/// Per-invocation settings for one [`Engine`](crate::Engine).
///
/// # Examples
///
/// ```
/// use std::path::PathBuf;
/// use kpa_core::EngineConfig;
///
/// let config = EngineConfig::builder()
///     .work_dir(PathBuf::from("/tmp/my-project"))
///     .backend("groq")
///     .temperature(0.2_f32)
///     .build();
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, TypedBuilder)]
pub struct EngineConfig {
    /// Project root the context is built from and edits are applied to.
    work_dir: PathBuf,

    /// Backend mode override: `auto` or a provider name.
    #[builder(default, setter(strip_option, into))]
    #[serde(skip_serializing_if = "Option::is_none")]
    backend: Option<String>,

    /// Model override (takes precedence over config.yaml).
    #[builder(default, setter(strip_option, into))]
    #[serde(skip_serializing_if = "Option::is_none")]
    model: Option<String>,

    /// Sampling temperature override.
    #[builder(default, setter(strip_option))]
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,

    /// Emit extra context details while running.
    #[builder(default)]
    verbose: bool,

    /// Skip confirmation prompts.
    #[builder(default)]
    force: bool,

    /// Response language override.
    #[builder(default, setter(strip_option))]
    #[serde(skip_serializing_if = "Option::is_none")]
    language: Option<Language>,
}

impl EngineConfig {
    /// Returns the working directory.
    pub fn work_dir(&self) -> &PathBuf {
        &self.work_dir
    }

    /// Returns the backend mode override, if set.
    pub fn backend(&self) -> Option<&str> {
        self.backend.as_deref()
    }

    /// Returns the model override, if set.
    pub fn model(&self) -> Option<&str> {
        self.model.as_deref()
    }

    /// Returns the temperature override, if set.
    pub fn temperature(&self) -> Option<f32> {
        self.temperature
    }

    /// Returns whether verbose output was requested.
    pub fn verbose(&self) -> bool {
        self.verbose
    }

    /// Returns whether confirmations are skipped.
    pub fn force(&self) -> bool {
        self.force
    }

    /// Returns the language override, if set.
    pub fn language(&self) -> Option<Language> {
        self.language
    }

    /// Returns the `.kpa` directory path for this project.
    pub fn state_dir(&self) -> PathBuf {
        self.work_dir.join(STATE_DIR)
    }

    /// Returns the path to `config.yaml` inside the `.kpa` directory.
    pub fn config_path(&self) -> PathBuf {
        self.state_dir().join("config.yaml")
    }

    /// Replace overrides with the given values where they are `Some`.
    pub fn with_overrides(
        mut self,
        backend: Option<String>,
        model: Option<String>,
        temperature: Option<f32>,
        language: Option<Language>,
    ) -> Self {
        self.backend = backend.or(self.backend);
        self.model = model.or(self.model);
        self.temperature = temperature.or(self.temperature);
        self.language = language.or(self.language);
        self
    }
}

// ── Project Configuration (.kpa/config.yaml) ────────────────

/// Project-level configuration, deserialized from `.kpa/config.yaml`.
///
/// Every key is optional; an empty file yields the built-in defaults.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectConfig {
    /// Generation backend settings.
    #[serde(default)]
    pub backend: BackendConfig,

    /// Context assembly limits.
    #[serde(default)]
    pub context: ContextConfig,

    /// Backup location and retention.
    #[serde(default)]
    pub backups: BackupConfig,

    /// Prompt template search paths.
    #[serde(default)]
    pub prompts: PromptsConfig,

    /// Response language.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language: Option<Language>,
}

// ── Sub-configuration types ──────────────────────────────────

/// Generation backend configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackendConfig {
    /// `auto`, `ollama`, `openai` or `groq`.
    #[serde(default = "default_backend_mode")]
    pub mode: String,

    /// Model name; each backend falls back to its own default when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,

    /// Base URL of the local Ollama daemon.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ollama_url: Option<String>,

    /// Transport timeout for one generation request.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    /// Sampling temperature.
    #[serde(default = "default_temperature")]
    pub temperature: f32,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            mode: default_backend_mode(),
            model: None,
            ollama_url: None,
            timeout_secs: default_timeout_secs(),
            temperature: default_temperature(),
        }
    }
}

/// Context assembly configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContextConfig {
    /// Token budget for tree plus snippets.
    #[serde(default = "default_max_tokens")]
    pub max_tokens: usize,

    /// Maximum depth of the tree summary.
    #[serde(default = "default_max_depth")]
    pub max_depth: usize,

    /// Lines read per file before truncation.
    #[serde(default = "default_max_lines")]
    pub max_lines: usize,

    /// Maximum number of relevant files considered.
    #[serde(default = "default_max_files")]
    pub max_files: usize,

    /// File extensions eligible for inclusion (with leading dot).
    #[serde(default = "default_extensions")]
    pub extensions: Vec<String>,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            max_tokens: default_max_tokens(),
            max_depth: default_max_depth(),
            max_lines: default_max_lines(),
            max_files: default_max_files(),
            extensions: default_extensions(),
        }
    }
}

/// Backup location and retention policy.
///
/// Backups are never removed unless `keepLast` or `maxAgeDays` is set and a
/// prune is requested, either explicitly or via `autoPrune`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupConfig {
    /// Backup directory, relative to the working directory.
    #[serde(default = "default_backup_dir")]
    pub dir: PathBuf,

    /// Keep at most this many backups per original file name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub keep_last: Option<usize>,

    /// Remove backups older than this many days.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_age_days: Option<u64>,

    /// Prune automatically after every run.
    #[serde(default)]
    pub auto_prune: bool,
}

impl Default for BackupConfig {
    fn default() -> Self {
        Self {
            dir: default_backup_dir(),
            keep_last: None,
            max_age_days: None,
            auto_prune: false,
        }
    }
}

/// Directories holding prompt overrides.
///
/// A file named like a built-in prompt (`plan.j2`, `system/es.j2`) shadows it.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PromptsConfig {
    /// Override directories, loaded in order; later ones win.
    #[serde(default)]
    pub include: Vec<PathBuf>,
}

/// Language the model is asked to answer in.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    #[default]
    En,
    Es,
}

impl Language {
    /// Detect the language from `KP_LANG`, then `LANG`.
    pub fn from_env() -> Self {
        let lang = std::env::var("KP_LANG")
            .or_else(|_| std::env::var("LANG"))
            .unwrap_or_default();
        Self::from_locale(&lang)
    }

    /// Map a locale string such as `es_MX.UTF-8` to a language.
    pub fn from_locale(locale: &str) -> Self {
        if locale.starts_with("es") {
            Self::Es
        } else {
            Self::En
        }
    }

    /// Name of the system prompt template for this language.
    pub fn system_template(self) -> &'static str {
        match self {
            Self::En => "system/en",
            Self::Es => "system/es",
        }
    }
}

// ── Default value functions for serde ────────────────────────

fn default_backend_mode() -> String {
    "auto".to_owned()
}

fn default_timeout_secs() -> u64 {
    120
}

fn default_temperature() -> f32 {
    0.7
}

fn default_max_tokens() -> usize {
    8000
}

fn default_max_depth() -> usize {
    3
}

fn default_max_lines() -> usize {
    200
}

fn default_max_files() -> usize {
    10
}

fn default_backup_dir() -> PathBuf {
    PathBuf::from(".kpa-backups")
}

/// Extensions considered code by default.
pub fn default_extensions() -> Vec<String> {
    [
        ".py", ".js", ".ts", ".jsx", ".tsx", ".java", ".cpp", ".c", ".h", ".cs", ".go", ".rs",
        ".rb", ".php", ".swift", ".kt", ".scala", ".html", ".css", ".scss", ".sql", ".sh", ".bat",
        ".json", ".yaml", ".yml",
    ]
    .iter()
    .map(|s| (*s).to_owned())
    .collect()
}

// ── Config loading ───────────────────────────────────────────

/// Load [`ProjectConfig`] from the `.kpa/config.yaml` file.
///
/// A missing file is not an error and yields [`ProjectConfig::default`].
///
/// # Errors
///
/// Returns `CoreError::Io` if the file exists but cannot be read.
/// Returns `CoreError::Yaml` if the file contains invalid YAML.
pub fn load_project_config(config_path: &Path) -> Result<ProjectConfig, crate::CoreError> {
    if !config_path.exists() {
        return Ok(ProjectConfig::default());
    }
    let content = std::fs::read_to_string(config_path)?;
    if content.trim().is_empty() {
        return Ok(ProjectConfig::default());
    }
    let config: ProjectConfig = serde_yaml::from_str(&content)?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use serde_json::json;

    use super::*;

    #[test]
    fn test_should_build_engine_config_with_defaults() {
        let config = EngineConfig::builder()
            .work_dir(PathBuf::from("/tmp/project"))
            .build();

        assert_eq!(config.work_dir(), &PathBuf::from("/tmp/project"));
        assert!(config.backend().is_none());
        assert!(config.model().is_none());
        assert!(config.temperature().is_none());
        assert!(!config.verbose());
        assert!(!config.force());
    }

    #[test]
    fn test_should_build_engine_config_with_overrides() {
        let config = EngineConfig::builder()
            .work_dir(PathBuf::from("/tmp/project"))
            .backend("ollama")
            .model("codellama:13b")
            .temperature(0.1_f32)
            .force(true)
            .language(Language::Es)
            .build();

        assert_eq!(config.backend(), Some("ollama"));
        assert_eq!(config.model(), Some("codellama:13b"));
        assert_eq!(config.temperature(), Some(0.1));
        assert!(config.force());
        assert_eq!(config.language(), Some(Language::Es));
    }

    #[test]
    fn test_should_apply_only_present_overrides() {
        let config = EngineConfig::builder()
            .work_dir(PathBuf::from("/tmp/project"))
            .model("kept")
            .build()
            .with_overrides(Some("groq".to_owned()), None, Some(0.3), None);

        assert_eq!(config.backend(), Some("groq"));
        assert_eq!(config.model(), Some("kept"));
        assert_eq!(config.temperature(), Some(0.3));
        assert_eq!(config.language(), None);
    }

    #[test]
    fn test_should_compute_state_paths() {
        let config = EngineConfig::builder()
            .work_dir(PathBuf::from("/home/user/project"))
            .build();

        assert_eq!(config.state_dir(), PathBuf::from("/home/user/project/.kpa"));
        assert_eq!(
            config.config_path(),
            PathBuf::from("/home/user/project/.kpa/config.yaml")
        );
    }

    #[test]
    fn test_should_deserialize_default_project_config() {
        let config: ProjectConfig = serde_yaml::from_str("{}").expect("should parse YAML");

        assert_eq!(config.backend.mode, "auto");
        assert!(config.backend.model.is_none());
        assert_eq!(config.backend.timeout_secs, 120);
        assert!((config.backend.temperature - 0.7).abs() < f32::EPSILON);
        assert_eq!(config.context.max_tokens, 8000);
        assert_eq!(config.context.max_depth, 3);
        assert_eq!(config.context.max_lines, 200);
        assert_eq!(config.context.max_files, 10);
        assert!(config.context.extensions.contains(&".py".to_owned()));
        assert_eq!(config.backups.dir, PathBuf::from(".kpa-backups"));
        assert!(config.backups.keep_last.is_none());
        assert!(!config.backups.auto_prune);
        assert!(config.language.is_none());
    }

    #[test]
    fn test_should_deserialize_full_project_config() {
        let yaml = r#"
backend:
  mode: ollama
  model: codellama:13b
  ollamaUrl: http://gpu-box:11434
  timeoutSecs: 300
  temperature: 0.2
context:
  maxTokens: 4000
  maxDepth: 2
  maxLines: 80
  maxFiles: 5
  extensions: [".rs", ".toml"]
backups:
  dir: .backups
  keepLast: 3
  maxAgeDays: 14
  autoPrune: true
prompts:
  include:
    - prompts
language: es
"#;

        let config: ProjectConfig = serde_yaml::from_str(yaml).expect("should parse YAML");

        assert_eq!(config.backend.mode, "ollama");
        assert_eq!(config.backend.model.as_deref(), Some("codellama:13b"));
        assert_eq!(
            config.backend.ollama_url.as_deref(),
            Some("http://gpu-box:11434")
        );
        assert_eq!(config.backend.timeout_secs, 300);
        assert_eq!(config.context.max_tokens, 4000);
        assert_eq!(config.context.extensions, vec![".rs", ".toml"]);
        assert_eq!(config.backups.keep_last, Some(3));
        assert_eq!(config.backups.max_age_days, Some(14));
        assert!(config.backups.auto_prune);
        assert_eq!(config.prompts.include.len(), 1);
        assert_eq!(config.language, Some(Language::Es));
    }

    #[test]
    fn test_should_serialize_engine_config_to_json() {
        let config = EngineConfig::builder()
            .work_dir(PathBuf::from("/tmp/project"))
            .model("gpt-4")
            .build();

        let value = serde_json::to_value(&config).expect("should serialize");
        assert_eq!(value["work_dir"], json!("/tmp/project"));
        assert_eq!(value["model"], json!("gpt-4"));
        assert!(value.get("backend").is_none());
        assert!(value.get("temperature").is_none());
    }

    #[test]
    fn test_should_map_locale_to_language() {
        assert_eq!(Language::from_locale("es_MX.UTF-8"), Language::Es);
        assert_eq!(Language::from_locale("en_US.UTF-8"), Language::En);
        assert_eq!(Language::from_locale(""), Language::En);
        assert_eq!(Language::Es.system_template(), "system/es");
    }

    #[test]
    fn test_should_load_default_when_config_file_missing() {
        let path = PathBuf::from("/nonexistent/config.yaml");
        let config = load_project_config(&path).expect("should return default");
        assert_eq!(config.backend.mode, "auto");
    }

    #[test]
    fn test_should_load_config_from_tempfile() {
        let dir = tempfile::TempDir::new().expect("should create temp dir");
        let config_path = dir.path().join("config.yaml");
        std::fs::write(&config_path, "backend:\n  mode: groq\ncontext:\n  maxTokens: 100\n")
            .expect("should write config");

        let config = load_project_config(&config_path).expect("should load config");
        assert_eq!(config.backend.mode, "groq");
        assert_eq!(config.context.max_tokens, 100);
        assert_eq!(config.context.max_depth, 3);
    }

    #[test]
    fn test_should_reject_invalid_yaml() {
        let dir = tempfile::TempDir::new().expect("should create temp dir");
        let config_path = dir.path().join("config.yaml");
        std::fs::write(&config_path, "context:\n  maxTokens: lots\n").expect("should write config");

        let err = load_project_config(&config_path).unwrap_err();
        assert!(matches!(err, crate::CoreError::Yaml(_)));
    }
}
