//! Progress events and results of a workflow run.
//!
//! The engine pushes [`RunEvent`]s to an optional unbounded channel while a
//! run is in flight; the CLI renders them as they arrive. The final
//! [`RunReport`] is returned once the run reaches [`WorkflowState::Reported`].

use std::fmt;
use std::path::PathBuf;

use serde::Serialize;
use tokio::sync::mpsc::UnboundedSender;

use crate::mutate::{EditPreview, MutationOutcome};

/// Outcome of one applied (or attempted) edit within a run.
pub type AppliedEdit = MutationOutcome;

// ── Workflow state ───────────────────────────────────────────

/// States of the task workflow, in the order a successful run visits them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum WorkflowState {
    Idle,
    TaskReceived,
    ContextBuilt,
    Planned,
    Implemented,
    EditsApplied,
    Verified,
    Reported,
    Aborted,
}

impl fmt::Display for WorkflowState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::TaskReceived => "task received",
            Self::ContextBuilt => "context built",
            Self::Planned => "planned",
            Self::Implemented => "implemented",
            Self::EditsApplied => "edits applied",
            Self::Verified => "verified",
            Self::Reported => "reported",
            Self::Aborted => "aborted",
        };
        f.write_str(name)
    }
}

/// Which generation call a streamed fragment belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Plan,
    Implement,
    Modify,
}

// ── Run events ───────────────────────────────────────────────

#[derive(Debug, Clone)]
pub enum RunEvent {
    /// The workflow moved to a new state.
    StateChanged(WorkflowState),

    /// The backend answered its readiness probe.
    BackendReady { backend: String, model: String },

    /// Context was assembled.
    ContextBuilt {
        files: Vec<PathBuf>,
        tokens: usize,
        /// Start of the tree summary, only in verbose mode.
        tree_excerpt: Option<String>,
    },

    /// Model output, in arrival order.
    Text { phase: Phase, text: String },

    /// A transport or provider problem reported by the backend.
    Diagnostic { phase: Phase, message: String },

    /// The implementation contained no tagged file blocks.
    NoEdits,

    /// An edit about to be applied. Prompters that print through the event
    /// stream send this so previews stay in order with the rest of the run.
    Preview(EditPreview),

    /// One file mutation finished.
    EditApplied(AppliedEdit),

    /// The run stopped early.
    Aborted { state: WorkflowState, reason: String },
}

/// Send `event` if anyone is listening. A closed receiver is ignored.
pub(crate) fn emit(tx: &Option<UnboundedSender<RunEvent>>, event: RunEvent) {
    if let Some(tx) = tx {
        let _ = tx.send(event);
    }
}

// ── Run report ───────────────────────────────────────────────

/// Everything a finished run produced.
#[derive(Debug, Clone)]
pub struct RunReport {
    pub state: WorkflowState,
    /// Logical AND of every mutation outcome; `true` when there were none.
    pub success: bool,
    pub plan: String,
    pub implementation: String,
    pub edits: Vec<AppliedEdit>,
    /// Diagnostic fragments received across both generation calls.
    pub diagnostics: usize,
}

impl RunReport {
    /// Paths whose mutation did not apply.
    pub fn failed_paths(&self) -> Vec<&PathBuf> {
        self.edits
            .iter()
            .filter(|e| !e.success())
            .map(|e| &e.path)
            .collect()
    }
}
