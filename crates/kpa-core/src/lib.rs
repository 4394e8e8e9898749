//! Core engine for kpa.
//!
//! Builds a token-budgeted picture of a project, streams plans and code from
//! a local or hosted model, and applies the proposed file edits with backups.

pub mod backend;
mod backup;
mod binary;
mod config;
mod context;
mod engine;
mod error;
mod events;
mod ignore;
mod mutate;
mod parse;
mod tokens;

pub use backend::{Backend, BackendKind, BackendOptions, Fragment, GenerationRequest};
pub use backup::{BackupEntry, BackupRecord, BackupStore, RetentionPolicy};
pub use binary::is_binary;
pub use config::{
    BackendConfig, BackupConfig, ContextConfig, EngineConfig, Language, ProjectConfig,
    PromptsConfig, STATE_DIR, load_project_config,
};
pub use context::{CandidateFile, ContextBuilder, ContextBundle, NO_FILES_SENTINEL, ProjectTree, Snippet};
pub use engine::Engine;
pub use error::CoreError;
pub use events::{AppliedEdit, Phase, RunEvent, RunReport, WorkflowState};
pub use ignore::{DEFAULT_IGNORES, IgnoreRules, should_ignore};
pub use mutate::{
    AcceptDefaults, EditAction, EditPreview, FileMutator, MutationOutcome, MutationStatus,
    PREVIEW_CHARS, Prompter,
};
pub use parse::{EditProposal, extract_edits, first_fenced_block};
pub use tokens::estimate_tokens;
