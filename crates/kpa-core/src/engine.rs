//! Core execution engine.
//!
//! The [`Engine`] drives one task through the workflow
//! `Idle → TaskReceived → ContextBuilt → Planned → Implemented → EditsApplied
//! → Verified → Reported`, dropping to `Aborted` on an unready backend, a
//! configuration problem or cancellation. Generation calls run one at a time
//! and edits are applied in the order the model proposed them.

use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::Local;
use futures::StreamExt;
use kpa_pm::PromptManager;
use serde_json::json;
use tokio::sync::mpsc::UnboundedSender;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::backend::{Backend, BackendOptions, Fragment, GenerationRequest, select};
use crate::backup::{BackupEntry, BackupStore, RetentionPolicy};
use crate::config::{EngineConfig, Language, ProjectConfig, STATE_DIR, load_project_config};
use crate::context::ContextBuilder;
use crate::error::CoreError;
use crate::events::{AppliedEdit, Phase, RunEvent, RunReport, WorkflowState, emit};
use crate::ignore::IgnoreRules;
use crate::mutate::{EditAction, FileMutator, MutationOutcome, MutationStatus, Prompter};
use crate::parse::{extract_edits, first_fenced_block};

/// Characters of the current file content sent with a single-file edit.
const MODIFY_CONTENT_CHARS: usize = 2000;

/// Characters of the tree summary included in verbose context events.
const TREE_EXCERPT_CHARS: usize = 500;

type ProgressTx = Option<UnboundedSender<RunEvent>>;

/// Orchestrates context, generation and file edits for one project.
///
/// # Examples
///
/// ```no_run
/// use std::path::PathBuf;
/// use std::sync::Arc;
/// use kpa_core::{AcceptDefaults, Engine, EngineConfig};
/// use tokio_util::sync::CancellationToken;
///
/// # async fn example() -> Result<(), kpa_core::CoreError> {
/// let config = EngineConfig::builder()
///     .work_dir(PathBuf::from("."))
///     .build();
///
/// let engine = Engine::new(config, Arc::new(AcceptDefaults)).await?;
/// let report = engine
///     .run("add a hello function", None, CancellationToken::new())
///     .await?;
/// println!("success: {}", report.success);
/// # Ok(())
/// # }
/// ```
pub struct Engine {
    config: EngineConfig,
    project_config: ProjectConfig,
    prompts: PromptManager,
    backend: Backend,
    context: ContextBuilder,
    mutator: FileMutator,
    language: Language,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("work_dir", self.config.work_dir())
            .field("backend", &self.backend.name())
            .field("model", &self.backend.model())
            .field("language", &self.language)
            .finish_non_exhaustive()
    }
}

impl Engine {
    /// Create an engine, selecting the backend from config and environment.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::Configuration` for an unknown backend name,
    /// `CoreError::NoBackendAvailable` when `auto` finds nothing usable, and
    /// `CoreError::Yaml` / `CoreError::Prompt` for a bad config or template.
    pub async fn new(config: EngineConfig, prompter: Arc<dyn Prompter>) -> Result<Self, CoreError> {
        Self::with_options(config, BackendOptions::from_env(), prompter).await
    }

    /// Like [`Engine::new`], with API keys and endpoints taken from `options`.
    ///
    /// The model comes from `config`, then `options`, then the project file.
    /// An Ollama URL in `options` wins over the project file.
    ///
    /// # Errors
    ///
    /// Same as [`Engine::new`].
    #[instrument(skip_all)]
    pub async fn with_options(
        config: EngineConfig,
        mut options: BackendOptions,
        prompter: Arc<dyn Prompter>,
    ) -> Result<Self, CoreError> {
        let project_config = load_project_config(&config.config_path())?;

        let mode = config
            .backend()
            .map(str::to_owned)
            .unwrap_or_else(|| project_config.backend.mode.clone());
        options.model = config
            .model()
            .map(str::to_owned)
            .or(options.model)
            .or_else(|| project_config.backend.model.clone());
        if options.ollama_url.is_none() {
            options.ollama_url = project_config.backend.ollama_url.clone();
        }

        let backend = select(&mode, &options).await?;
        Self::assemble(config, project_config, backend, prompter)
    }

    /// Create an engine around an already constructed backend.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::Yaml` or `CoreError::Prompt` for a bad config or
    /// template directory.
    pub fn with_backend(
        config: EngineConfig,
        backend: Backend,
        prompter: Arc<dyn Prompter>,
    ) -> Result<Self, CoreError> {
        let project_config = load_project_config(&config.config_path())?;
        Self::assemble(config, project_config, backend, prompter)
    }

    fn assemble(
        config: EngineConfig,
        project_config: ProjectConfig,
        backend: Backend,
        prompter: Arc<dyn Prompter>,
    ) -> Result<Self, CoreError> {
        let work_dir = config.work_dir().clone();
        info!(work_dir = %work_dir.display(), backend = backend.name(), "initializing engine");

        let mut prompts = PromptManager::new()?;
        for dir in &project_config.prompts.include {
            prompts.load_dir(&work_dir.join(dir))?;
        }

        let backup_dir = &project_config.backups.dir;
        let mut rules = IgnoreRules::load(&work_dir).with_pattern(STATE_DIR);
        if let Some(name) = backup_dir.file_name() {
            rules = rules.with_pattern(&name.to_string_lossy());
        }
        let context = ContextBuilder::with_rules(&work_dir, project_config.context.clone(), rules);

        let store = BackupStore::new(work_dir.join(backup_dir));
        let mutator = FileMutator::new(&work_dir, store, prompter);

        let language = config
            .language()
            .or(project_config.language)
            .unwrap_or_else(Language::from_env);

        Ok(Self {
            config,
            project_config,
            prompts,
            backend,
            context,
            mutator,
            language,
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn project_config(&self) -> &ProjectConfig {
        &self.project_config
    }

    pub fn backend(&self) -> &Backend {
        &self.backend
    }

    pub fn language(&self) -> Language {
        self.language
    }

    // ── Task workflow ────────────────────────────────────────

    /// Run `task` through the full workflow.
    ///
    /// Progress goes to `progress_tx` when given. Cancelling `cancel` during a
    /// probe, a stream read or a confirmation aborts the run; edits already
    /// applied stay in place and can be undone with [`Engine::rollback`].
    ///
    /// # Errors
    ///
    /// Returns `CoreError::BackendUnavailable` when the probe fails,
    /// `CoreError::Cancelled` on cancellation and `CoreError::Prompt` when a
    /// template cannot be rendered.
    #[instrument(skip(self, progress_tx, cancel))]
    pub async fn run(
        &self,
        task: &str,
        progress_tx: ProgressTx,
        cancel: CancellationToken,
    ) -> Result<RunReport, CoreError> {
        let mut state = WorkflowState::Idle;
        match self.run_workflow(task, &progress_tx, &cancel, &mut state).await {
            Ok(report) => Ok(report),
            Err(e) => {
                warn!(%state, error = %e, "run aborted");
                emit(
                    &progress_tx,
                    RunEvent::Aborted {
                        state,
                        reason: e.to_string(),
                    },
                );
                emit(&progress_tx, RunEvent::StateChanged(WorkflowState::Aborted));
                Err(e)
            }
        }
    }

    async fn run_workflow(
        &self,
        task: &str,
        tx: &ProgressTx,
        cancel: &CancellationToken,
        state: &mut WorkflowState,
    ) -> Result<RunReport, CoreError> {
        let mut advance = |next: WorkflowState| {
            debug!(from = %*state, to = %next, "workflow transition");
            *state = next;
            emit(tx, RunEvent::StateChanged(next));
        };

        self.ensure_ready(tx, cancel).await?;
        advance(WorkflowState::TaskReceived);

        // Full-project context; relevance then falls back to walk order.
        let bundle = self.context.build_context("");
        emit(
            tx,
            RunEvent::ContextBuilt {
                files: bundle.snippets.iter().map(|s| s.path.clone()).collect(),
                tokens: bundle.token_estimate,
                tree_excerpt: self
                    .config
                    .verbose()
                    .then(|| bundle.tree.chars().take(TREE_EXCERPT_CHARS).collect()),
            },
        );
        advance(WorkflowState::ContextBuilt);

        let system = self.system_prompt()?;

        let plan_prompt = self.prompts.render(
            "plan",
            &json!({ "task": task, "context": bundle.planning_text() }),
        )?;
        let (plan, plan_diagnostics) = self
            .generate(Phase::Plan, plan_prompt, &system, tx, cancel)
            .await?;
        advance(WorkflowState::Planned);

        let implement_prompt = self.prompts.render(
            "implement",
            &json!({
                "task": task,
                "file_tree": bundle.tree,
                "code_snippets": bundle.snippets_text(),
            }),
        )?;
        let (implementation, implement_diagnostics) = self
            .generate(Phase::Implement, implement_prompt, &system, tx, cancel)
            .await?;
        advance(WorkflowState::Implemented);

        let proposals = extract_edits(&implementation);
        if proposals.is_empty() {
            info!("no file edits found in response");
            emit(tx, RunEvent::NoEdits);
        }

        let interactive = !self.config.force();
        let mut edits = Vec::with_capacity(proposals.len());
        for proposal in proposals {
            let outcome = match contained_path(&proposal.path) {
                Ok(path) => {
                    let mutation = async {
                        if self.mutator.resolve(path).exists() {
                            self.mutator.modify(path, &proposal.content, interactive).await
                        } else {
                            self.mutator.create(path, &proposal.content, interactive).await
                        }
                    };
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => return Err(CoreError::Cancelled),
                        outcome = mutation => outcome,
                    }
                }
                Err(reason) => MutationOutcome {
                    path: proposal.path.clone(),
                    action: EditAction::Create,
                    status: MutationStatus::Failed(reason),
                    backup: None,
                },
            };
            emit(tx, RunEvent::EditApplied(outcome.clone()));
            edits.push(outcome);
        }
        let success = edits.iter().all(MutationOutcome::success);
        advance(WorkflowState::EditsApplied);

        // No checks are run on the result yet.
        advance(WorkflowState::Verified);

        advance(WorkflowState::Reported);
        info!(success, edits = edits.len(), "run finished");

        if self.project_config.backups.auto_prune
            && let Err(e) = self.prune_backups()
        {
            warn!(error = %e, "automatic backup prune failed");
        }

        Ok(RunReport {
            state: WorkflowState::Reported,
            success,
            plan,
            implementation,
            edits,
            diagnostics: plan_diagnostics + implement_diagnostics,
        })
    }

    // ── Single-file edit ─────────────────────────────────────

    /// Ask the model to rewrite one existing file according to `task`.
    ///
    /// The first fenced block of the response (or the whole response when
    /// there is none) replaces the file, through the usual backup and
    /// confirmation steps.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::Mutation` if the file is missing or the response
    /// is empty, `CoreError::BackendUnavailable` when the probe fails and
    /// `CoreError::Cancelled` on cancellation.
    #[instrument(skip(self, path, progress_tx, cancel), fields(path = %path.display()))]
    pub async fn modify_file(
        &self,
        path: &Path,
        task: &str,
        progress_tx: ProgressTx,
        cancel: CancellationToken,
    ) -> Result<AppliedEdit, CoreError> {
        let tx = &progress_tx;
        let target = self.mutator.resolve(path);
        if !target.is_file() {
            return Err(CoreError::Mutation {
                path: path.to_path_buf(),
                reason: "file does not exist".to_owned(),
            });
        }

        self.ensure_ready(tx, &cancel).await?;

        let current = String::from_utf8_lossy(&std::fs::read(&target)?).into_owned();
        let excerpt: String = current.chars().take(MODIFY_CONTENT_CHARS).collect();
        let prompt = self.prompts.render(
            "modify",
            &json!({
                "file_path": path.display().to_string(),
                "current_content": excerpt,
                "task": task,
            }),
        )?;
        let system = self.system_prompt()?;
        let (response, _) = self
            .generate(Phase::Modify, prompt, &system, tx, &cancel)
            .await?;

        let content = first_fenced_block(&response).unwrap_or(response);
        let content = content.trim();
        if content.is_empty() {
            return Err(CoreError::Mutation {
                path: path.to_path_buf(),
                reason: "backend returned no content".to_owned(),
            });
        }

        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(CoreError::Cancelled),
            outcome = self.mutator.modify(path, content, !self.config.force()) => outcome,
        };
        emit(tx, RunEvent::EditApplied(outcome.clone()));
        Ok(outcome)
    }

    // ── Backups ──────────────────────────────────────────────

    /// Undo applied edits, newest first.
    ///
    /// Modified and deleted files are restored from their backups; files the
    /// run created are removed. Edits that did not apply are skipped. Returns
    /// the paths that were reverted.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::Io` on the first restore or removal that fails.
    #[instrument(skip_all, fields(edits = edits.len()))]
    pub fn rollback(&self, edits: &[AppliedEdit]) -> Result<Vec<PathBuf>, CoreError> {
        let mut reverted = Vec::new();
        for edit in edits.iter().rev().filter(|e| e.success()) {
            match (&edit.backup, edit.action) {
                (Some(record), _) => self.mutator.store().restore(record)?,
                (None, EditAction::Create) => std::fs::remove_file(self.mutator.resolve(&edit.path))?,
                (None, action) => {
                    warn!(path = %edit.path.display(), %action, "no backup to roll back from");
                    continue;
                }
            }
            reverted.push(edit.path.clone());
        }
        info!(reverted = reverted.len(), "rollback finished");
        Ok(reverted)
    }

    /// Backups on disk, newest first.
    pub fn list_backups(&self) -> Result<Vec<BackupEntry>, CoreError> {
        self.mutator.store().list()
    }

    /// Apply the configured retention policy. Does nothing without one.
    pub fn prune_backups(&self) -> Result<Vec<PathBuf>, CoreError> {
        self.prune_backups_with(&RetentionPolicy::from(&self.project_config.backups))
    }

    /// Apply an explicit retention policy.
    pub fn prune_backups_with(&self, policy: &RetentionPolicy) -> Result<Vec<PathBuf>, CoreError> {
        self.mutator.store().prune(policy, Local::now().naive_local())
    }

    // ── Internals ────────────────────────────────────────────

    async fn ensure_ready(&self, tx: &ProgressTx, cancel: &CancellationToken) -> Result<(), CoreError> {
        let ready = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(CoreError::Cancelled),
            ready = self.backend.probe() => ready,
        };
        if !ready {
            return Err(CoreError::BackendUnavailable {
                backend: self.backend.name().to_owned(),
                hint: unavailable_hint(&self.backend),
            });
        }
        emit(
            tx,
            RunEvent::BackendReady {
                backend: self.backend.name().to_owned(),
                model: self.backend.model().to_owned(),
            },
        );
        Ok(())
    }

    fn system_prompt(&self) -> Result<String, CoreError> {
        Ok(self
            .prompts
            .render(self.language.system_template(), &json!({}))?)
    }

    /// Drain one generation stream. Returns the text and the diagnostic count.
    async fn generate(
        &self,
        phase: Phase,
        prompt: String,
        system: &str,
        tx: &ProgressTx,
        cancel: &CancellationToken,
    ) -> Result<(String, usize), CoreError> {
        let request = GenerationRequest::builder()
            .prompt(prompt)
            .system(system)
            .temperature(
                self.config
                    .temperature()
                    .unwrap_or(self.project_config.backend.temperature),
            )
            .timeout(Duration::from_secs(self.project_config.backend.timeout_secs))
            .build();

        let mut stream = self.backend.stream(request);
        let mut text = String::new();
        let mut diagnostics = 0;

        loop {
            let fragment = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(CoreError::Cancelled),
                fragment = stream.next() => fragment,
            };
            match fragment {
                Some(Fragment::Text(chunk)) => {
                    text.push_str(&chunk);
                    emit(tx, RunEvent::Text { phase, text: chunk });
                }
                Some(Fragment::Diagnostic(message)) => {
                    diagnostics += 1;
                    emit(tx, RunEvent::Diagnostic { phase, message });
                }
                None => break,
            }
        }

        debug!(?phase, chars = text.len(), diagnostics, "generation finished");
        Ok((text, diagnostics))
    }
}

/// Reject proposal paths that are absolute or climb out of the project.
fn contained_path(path: &Path) -> Result<&Path, String> {
    let escapes = path
        .components()
        .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir));
    if escapes {
        Err(format!("refusing path outside the project: {}", path.display()))
    } else {
        Ok(path)
    }
}

fn unavailable_hint(backend: &Backend) -> String {
    match backend {
        Backend::Ollama(b) => format!(
            "no Ollama daemon answered at {}; start it with `ollama serve` and pull {}",
            b.base_url(),
            b.model()
        ),
        Backend::OpenAi(_) => "OPENAI_API_KEY is not set".to_owned(),
        Backend::Groq(_) => "GROQ_API_KEY is not set".to_owned(),
    }
}
