//! Terminal output and interactive confirmation.
//!
//! Run events, edit previews included, share one channel and are printed by
//! one loop. Questions arrive on a second channel; before asking one, the
//! loop drains every event already queued, so model text and the preview of
//! an edit always appear before the question about it.

use std::io::{self, Write};

use async_trait::async_trait;
use kpa_core::{
    AppliedEdit, EditAction, EditPreview, MutationStatus, Phase, Prompter, RunEvent,
    WorkflowState,
};
use tokio::sync::mpsc::{
    UnboundedReceiver, UnboundedSender, WeakUnboundedSender, unbounded_channel,
};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

/// A yes/no question for the console loop.
#[derive(Debug)]
pub struct ConfirmRequest {
    pub question: String,
    pub default: bool,
    pub reply: oneshot::Sender<bool>,
}

/// [`Prompter`] that forwards to the console loop.
///
/// Previews go on the run's event channel through a weak handle, so the
/// prompter never keeps that channel open after the engine is done with it.
#[derive(Debug, Clone)]
pub struct TerminalPrompter {
    questions: UnboundedSender<ConfirmRequest>,
    events: WeakUnboundedSender<RunEvent>,
}

#[async_trait]
impl Prompter for TerminalPrompter {
    fn preview(&self, preview: &EditPreview) {
        if let Some(events) = self.events.upgrade() {
            let _ = events.send(RunEvent::Preview(preview.clone()));
        }
    }

    async fn confirm(&self, question: &str, default: bool) -> bool {
        let (reply, answer) = oneshot::channel();
        let request = ConfirmRequest {
            question: question.to_owned(),
            default,
            reply,
        };
        if self.questions.send(request).is_err() {
            return false;
        }
        answer.await.unwrap_or(false)
    }
}

/// Printer for one command.
#[derive(Debug)]
pub struct Console {
    events: UnboundedReceiver<RunEvent>,
    questions: UnboundedReceiver<ConfirmRequest>,
    verbose: bool,
}

impl Console {
    /// A console, the prompter that talks to it, and the event sender to
    /// hand to the engine. The console stops once that sender is dropped.
    pub fn new(verbose: bool) -> (Self, TerminalPrompter, UnboundedSender<RunEvent>) {
        let (events_tx, events) = unbounded_channel();
        let (questions_tx, questions) = unbounded_channel();
        let prompter = TerminalPrompter {
            questions: questions_tx,
            events: events_tx.downgrade(),
        };
        let console = Self {
            events,
            questions,
            verbose,
        };
        (console, prompter, events_tx)
    }

    /// Print events until the event sender closes or `cancel` fires.
    pub async fn run(&mut self, cancel: CancellationToken) {
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    self.drain_events();
                    return;
                }
                event = self.events.recv() => match event {
                    Some(event) => self.render(event),
                    None => return,
                },
                Some(request) = self.questions.recv() => {
                    self.drain_events();
                    self.ask(request, &cancel).await;
                }
            }
        }
    }

    fn drain_events(&mut self) {
        while let Ok(event) = self.events.try_recv() {
            self.render(event);
        }
    }

    async fn ask(&self, request: ConfirmRequest, cancel: &CancellationToken) {
        let ConfirmRequest {
            question,
            default,
            reply,
        } = request;
        let hint = if default { "[Y/n]" } else { "[y/N]" };
        print!("\n{question} {hint} ");
        let _ = io::stdout().flush();

        let read = tokio::task::spawn_blocking(|| {
            let mut line = String::new();
            io::stdin().read_line(&mut line).map(|n| (n, line))
        });
        let answer = tokio::select! {
            _ = cancel.cancelled() => false,
            read = read => match read {
                Ok(Ok((0, _))) => false,
                Ok(Ok((_, line))) => parse_answer(&line, default),
                _ => false,
            },
        };
        let _ = reply.send(answer);
    }

    fn render(&self, event: RunEvent) {
        match event {
            RunEvent::BackendReady { backend, model } => {
                println!("Using {backend} ({model})");
            }
            RunEvent::ContextBuilt {
                files,
                tokens,
                tree_excerpt,
            } => {
                println!("Context: {} file(s), ~{tokens} tokens", files.len());
                if self.verbose {
                    if let Some(tree) = tree_excerpt {
                        println!("\nProject structure:\n{tree}");
                    }
                    for file in &files {
                        println!("  - {}", file.display());
                    }
                }
            }
            RunEvent::StateChanged(state) => self.render_state(state),
            RunEvent::Text { text, .. } => {
                print!("{text}");
                let _ = io::stdout().flush();
            }
            RunEvent::Diagnostic { phase, message } => {
                eprintln!("{message} ({})", phase_name(phase));
            }
            RunEvent::NoEdits => {
                println!("No file operations detected in response.");
                println!("You may need to apply the suggestions above by hand.");
            }
            RunEvent::Preview(preview) => print_preview(&preview),
            RunEvent::EditApplied(edit) => println!("{}", describe_edit(&edit)),
            RunEvent::Aborted { .. } => {}
        }
    }

    fn render_state(&self, state: WorkflowState) {
        match state {
            WorkflowState::ContextBuilt => println!("\nCreating implementation plan...\n"),
            WorkflowState::Planned => println!("\n\nImplementing solution...\n"),
            WorkflowState::Implemented => println!("\n"),
            WorkflowState::Verified => println!("Basic verification complete"),
            _ => {}
        }
    }
}

fn phase_name(phase: Phase) -> &'static str {
    match phase {
        Phase::Plan => "while planning",
        Phase::Implement => "while implementing",
        Phase::Modify => "while modifying",
    }
}

fn print_preview(preview: &EditPreview) {
    let path = preview.path.display();
    match (preview.action, &preview.before) {
        (EditAction::Create, None) => println!("\nNew file: {path}"),
        (EditAction::Create, Some(_)) => println!("\nOverwriting {path}:"),
        (EditAction::Modify, _) => println!("\nChanges to {path}:"),
        (EditAction::Delete, _) => println!("\nDeleting {path}"),
    }
    if let Some(before) = &preview.before
        && preview.action != EditAction::Delete
    {
        println!("Old content:\n{before}");
        println!("\nNew content:");
    }
    if let Some(after) = &preview.after {
        println!("{after}");
    }
    if preview.truncated {
        println!("... (content truncated)");
    }
}

/// One line describing the outcome of an edit.
pub fn describe_edit(edit: &AppliedEdit) -> String {
    let path = edit.path.display();
    let verb = match edit.action {
        EditAction::Create => "Created",
        EditAction::Modify => "Modified",
        EditAction::Delete => "Deleted",
    };
    match &edit.status {
        MutationStatus::Applied => match &edit.backup {
            Some(record) => format!("✓ {verb} {path} (backup: {})", record.backup.display()),
            None => format!("✓ {verb} {path}"),
        },
        MutationStatus::Declined => format!("- Skipped {path}"),
        MutationStatus::Failed(reason) => format!("✗ Failed to {} {path}: {reason}", edit.action),
    }
}

/// Interpret a yes/no answer; anything unrecognized is "no".
pub fn parse_answer(input: &str, default: bool) -> bool {
    match input.trim().to_lowercase().as_str() {
        "" => default,
        "y" | "yes" | "s" | "si" | "sí" => true,
        _ => false,
    }
}
