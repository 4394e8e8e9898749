//! Create, modify and delete files behind a preview and a confirmation gate.
//!
//! Modify and delete always attempt a backup first. A failed backup is logged
//! and the mutation goes ahead without it. A failed write after a successful
//! backup restores the file from that backup.

use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use tracing::{info, instrument, warn};

use crate::backup::{BackupRecord, BackupStore};

/// Characters of before/after content shown in a preview.
pub const PREVIEW_CHARS: usize = 500;

type WriteFn = fn(&Path, &[u8]) -> io::Result<()>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EditAction {
    Create,
    Modify,
    Delete,
}

impl fmt::Display for EditAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Create => "create",
            Self::Modify => "modify",
            Self::Delete => "delete",
        })
    }
}

/// Bounded before/after excerpt shown ahead of a mutation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EditPreview {
    pub path: PathBuf,
    pub action: EditAction,
    /// Current content excerpt; `None` for a new file.
    pub before: Option<String>,
    /// Proposed content excerpt; `None` for a deletion.
    pub after: Option<String>,
    /// Whether the proposed content was cut to fit the excerpt.
    pub truncated: bool,
}

/// User interaction needed by [`FileMutator`].
#[async_trait]
pub trait Prompter: Send + Sync {
    /// Show a preview. Called before every confirmation.
    fn preview(&self, preview: &EditPreview);

    /// Ask a yes/no question; `default` applies to an empty answer.
    async fn confirm(&self, question: &str, default: bool) -> bool;
}

/// Prompter that shows nothing and accepts every default.
#[derive(Debug, Clone, Copy, Default)]
pub struct AcceptDefaults;

#[async_trait]
impl Prompter for AcceptDefaults {
    fn preview(&self, _preview: &EditPreview) {}

    async fn confirm(&self, _question: &str, default: bool) -> bool {
        default
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MutationStatus {
    Applied,
    Declined,
    Failed(String),
}

/// Result of one mutation. Failures are reported here, never raised.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MutationOutcome {
    pub path: PathBuf,
    pub action: EditAction,
    pub status: MutationStatus,
    pub backup: Option<BackupRecord>,
}

impl MutationOutcome {
    pub fn success(&self) -> bool {
        self.status == MutationStatus::Applied
    }

    fn new(path: &Path, action: EditAction, status: MutationStatus) -> Self {
        Self {
            path: path.to_path_buf(),
            action,
            status,
            backup: None,
        }
    }

    fn with_backup(mut self, backup: Option<BackupRecord>) -> Self {
        self.backup = backup;
        self
    }
}

/// Applies single-file edits under a project root.
#[derive(Clone)]
pub struct FileMutator {
    root: PathBuf,
    store: BackupStore,
    prompter: Arc<dyn Prompter>,
    write_fn: WriteFn,
}

impl fmt::Debug for FileMutator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FileMutator")
            .field("root", &self.root)
            .field("store", &self.store)
            .finish_non_exhaustive()
    }
}

fn write_file(path: &Path, content: &[u8]) -> io::Result<()> {
    fs::write(path, content)
}

impl FileMutator {
    pub fn new(root: impl Into<PathBuf>, store: BackupStore, prompter: Arc<dyn Prompter>) -> Self {
        Self {
            root: root.into(),
            store,
            prompter,
            write_fn: write_file,
        }
    }

    #[cfg(test)]
    pub(crate) fn with_write_fn(mut self, write_fn: WriteFn) -> Self {
        self.write_fn = write_fn;
        self
    }

    pub fn store(&self) -> &BackupStore {
        &self.store
    }

    /// `path` resolved against the project root.
    pub fn resolve(&self, path: &Path) -> PathBuf {
        self.root.join(path)
    }

    /// Write a new file, creating parent directories.
    ///
    /// An existing target is only overwritten after a default-no
    /// confirmation when `interactive`, and is backed up first.
    #[instrument(skip(self, path, content), fields(path = %path.display()))]
    pub async fn create(&self, path: &Path, content: &str, interactive: bool) -> MutationOutcome {
        let target = self.resolve(path);
        let action = EditAction::Create;
        let existing = target.exists();

        let before = if existing { read_lossy(&target) } else { None };
        self.prompter
            .preview(&preview(path, action, before.as_deref(), Some(content)));
        if interactive {
            let (question, default) = if existing {
                (format!("{} already exists. Overwrite?", path.display()), false)
            } else {
                (format!("Create file {}?", path.display()), true)
            };
            if !self.prompter.confirm(&question, default).await {
                return MutationOutcome::new(path, action, MutationStatus::Declined);
            }
        }

        let backup = if existing { self.try_backup(&target) } else { None };

        let result = match target.parent() {
            Some(parent) => fs::create_dir_all(parent),
            None => Ok(()),
        }
        .and_then(|()| (self.write_fn)(&target, content.as_bytes()));

        let status = match result {
            Ok(()) => {
                info!("created file");
                MutationStatus::Applied
            }
            Err(e) => {
                warn!(error = %e, "failed to create file");
                MutationStatus::Failed(e.to_string())
            }
        };
        MutationOutcome::new(path, action, status).with_backup(backup)
    }

    /// Replace the content of an existing file.
    #[instrument(skip(self, path, content), fields(path = %path.display()))]
    pub async fn modify(&self, path: &Path, content: &str, interactive: bool) -> MutationOutcome {
        let target = self.resolve(path);
        let action = EditAction::Modify;

        if !target.is_file() {
            return MutationOutcome::new(
                path,
                action,
                MutationStatus::Failed("file does not exist".to_owned()),
            );
        }

        let backup = self.try_backup(&target);

        let before = read_lossy(&target);
        self.prompter
            .preview(&preview(path, action, before.as_deref(), Some(content)));
        if interactive
            && !self
                .prompter
                .confirm(&format!("Modify file {}?", path.display()), true)
                .await
        {
            return MutationOutcome::new(path, action, MutationStatus::Declined).with_backup(backup);
        }

        let status = match (self.write_fn)(&target, content.as_bytes()) {
            Ok(()) => {
                info!("modified file");
                MutationStatus::Applied
            }
            Err(e) => {
                warn!(error = %e, "failed to modify file");
                if let Some(record) = &backup
                    && let Err(restore_err) = self.store.restore(record)
                {
                    warn!(error = %restore_err, "failed to restore backup");
                }
                MutationStatus::Failed(e.to_string())
            }
        };
        MutationOutcome::new(path, action, status).with_backup(backup)
    }

    /// Remove a file. The confirmation defaults to "no".
    #[instrument(skip(self, path), fields(path = %path.display()))]
    pub async fn delete(&self, path: &Path, interactive: bool) -> MutationOutcome {
        let target = self.resolve(path);
        let action = EditAction::Delete;

        if !target.is_file() {
            return MutationOutcome::new(
                path,
                action,
                MutationStatus::Failed("file does not exist".to_owned()),
            );
        }

        let backup = self.try_backup(&target);

        let before = read_lossy(&target);
        self.prompter
            .preview(&preview(path, action, before.as_deref(), None));
        if interactive
            && !self
                .prompter
                .confirm(&format!("Delete file {}?", path.display()), false)
                .await
        {
            return MutationOutcome::new(path, action, MutationStatus::Declined).with_backup(backup);
        }

        let status = match fs::remove_file(&target) {
            Ok(()) => {
                info!("deleted file");
                MutationStatus::Applied
            }
            Err(e) => {
                warn!(error = %e, "failed to delete file");
                MutationStatus::Failed(e.to_string())
            }
        };
        MutationOutcome::new(path, action, status).with_backup(backup)
    }

    fn try_backup(&self, target: &Path) -> Option<BackupRecord> {
        match self.store.create(target) {
            Ok(record) => Some(record),
            Err(e) => {
                warn!(error = %e, "could not create backup, continuing without one");
                None
            }
        }
    }
}

fn read_lossy(path: &Path) -> Option<String> {
    fs::read(path)
        .ok()
        .map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
}

fn excerpt(text: &str) -> (String, bool) {
    let mut chars = text.chars();
    let head: String = chars.by_ref().take(PREVIEW_CHARS).collect();
    (head, chars.next().is_some())
}

fn preview(path: &Path, action: EditAction, before: Option<&str>, after: Option<&str>) -> EditPreview {
    let after = after.map(excerpt);
    EditPreview {
        path: path.to_path_buf(),
        action,
        before: before.map(|b| excerpt(b).0),
        truncated: after.as_ref().is_some_and(|(_, t)| *t),
        after: after.map(|(a, _)| a),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;

    /// Records previews and questions and answers from a fixed script.
    #[derive(Default)]
    struct ScriptedPrompter {
        answers: Mutex<Vec<bool>>,
        previews: Mutex<Vec<EditPreview>>,
        questions: Mutex<Vec<(String, bool)>>,
    }

    impl ScriptedPrompter {
        fn answering(answers: &[bool]) -> Arc<Self> {
            Arc::new(Self {
                answers: Mutex::new(answers.iter().rev().copied().collect()),
                ..Self::default()
            })
        }
    }

    #[async_trait]
    impl Prompter for ScriptedPrompter {
        fn preview(&self, preview: &EditPreview) {
            self.previews.lock().expect("lock").push(preview.clone());
        }

        async fn confirm(&self, question: &str, default: bool) -> bool {
            self.questions
                .lock()
                .expect("lock")
                .push((question.to_owned(), default));
            self.answers.lock().expect("lock").pop().unwrap_or(default)
        }
    }

    fn setup(prompter: Arc<dyn Prompter>) -> (tempfile::TempDir, FileMutator) {
        let dir = tempfile::TempDir::new().expect("should create temp dir");
        let store = BackupStore::new(dir.path().join(".kpa-backups"));
        let mutator = FileMutator::new(dir.path(), store, prompter);
        (dir, mutator)
    }

    fn failing_write(_path: &Path, _content: &[u8]) -> io::Result<()> {
        Err(io::Error::new(io::ErrorKind::PermissionDenied, "disk says no"))
    }

    #[tokio::test]
    async fn test_should_create_file_with_parent_directories() {
        let (dir, mutator) = setup(Arc::new(AcceptDefaults));
        let outcome = mutator
            .create(Path::new("pkg/sub/new.py"), "x = 1", false)
            .await;

        assert!(outcome.success());
        assert_eq!(
            fs::read_to_string(dir.path().join("pkg/sub/new.py")).expect("should read"),
            "x = 1"
        );
        assert!(outcome.backup.is_none());
    }

    #[tokio::test]
    async fn test_should_ask_before_overwriting_on_create() {
        let prompter = ScriptedPrompter::answering(&[false]);
        let (dir, mutator) = setup(prompter.clone());
        fs::write(dir.path().join("a.py"), "old").expect("should write file");

        let outcome = mutator.create(Path::new("a.py"), "new", true).await;

        assert!(!outcome.success());
        assert_eq!(outcome.status, MutationStatus::Declined);
        assert!(outcome.backup.is_none());
        assert_eq!(fs::read_to_string(dir.path().join("a.py")).expect("should read"), "old");
        assert_eq!(
            *prompter.questions.lock().expect("lock"),
            vec![("a.py already exists. Overwrite?".to_owned(), false)]
        );
        let previews = prompter.previews.lock().expect("lock");
        assert_eq!(previews[0].before.as_deref(), Some("old"));
    }

    #[tokio::test]
    async fn test_should_overwrite_on_create_when_confirmed() {
        let prompter = ScriptedPrompter::answering(&[true]);
        let (dir, mutator) = setup(prompter.clone());
        fs::write(dir.path().join("a.py"), "old").expect("should write file");

        let outcome = mutator.create(Path::new("a.py"), "new", true).await;

        assert!(outcome.success());
        assert_eq!(fs::read_to_string(dir.path().join("a.py")).expect("should read"), "new");
        let backup = outcome.backup.expect("should have backup");
        assert_eq!(fs::read_to_string(backup.backup).expect("should read"), "old");
    }

    #[tokio::test]
    async fn test_should_back_up_before_forced_overwrite() {
        let (dir, mutator) = setup(Arc::new(AcceptDefaults));
        fs::write(dir.path().join("a.py"), "old").expect("should write file");

        let outcome = mutator.create(Path::new("a.py"), "new", false).await;

        assert!(outcome.success());
        let backup = outcome.backup.expect("should have backup");
        assert_eq!(fs::read_to_string(backup.backup).expect("should read"), "old");
    }

    #[tokio::test]
    async fn test_should_modify_with_backup_and_preview() {
        let prompter = ScriptedPrompter::answering(&[true]);
        let (dir, mutator) = setup(prompter.clone());
        fs::write(dir.path().join("m.py"), "before").expect("should write file");

        let outcome = mutator.modify(Path::new("m.py"), "after", true).await;

        assert!(outcome.success());
        assert_eq!(fs::read_to_string(dir.path().join("m.py")).expect("should read"), "after");
        let backup = outcome.backup.expect("should have backup");
        assert_eq!(fs::read_to_string(backup.backup).expect("should read"), "before");

        let previews = prompter.previews.lock().expect("lock");
        assert_eq!(previews.len(), 1);
        assert_eq!(previews[0].before.as_deref(), Some("before"));
        assert_eq!(previews[0].after.as_deref(), Some("after"));
        let questions = prompter.questions.lock().expect("lock");
        assert_eq!(questions[0], ("Modify file m.py?".to_owned(), true));
    }

    #[tokio::test]
    async fn test_should_leave_file_untouched_when_modify_declined() {
        let (dir, mutator) = setup(ScriptedPrompter::answering(&[false]));
        fs::write(dir.path().join("m.py"), "before").expect("should write file");

        let outcome = mutator.modify(Path::new("m.py"), "after", true).await;

        assert_eq!(outcome.status, MutationStatus::Declined);
        assert_eq!(fs::read_to_string(dir.path().join("m.py")).expect("should read"), "before");
    }

    #[tokio::test]
    async fn test_should_fail_modify_of_missing_file() {
        let (_dir, mutator) = setup(Arc::new(AcceptDefaults));
        let outcome = mutator.modify(Path::new("ghost.py"), "x", false).await;
        assert_eq!(
            outcome.status,
            MutationStatus::Failed("file does not exist".to_owned())
        );
    }

    #[tokio::test]
    async fn test_should_restore_content_when_write_fails() {
        let (dir, mutator) = setup(Arc::new(AcceptDefaults));
        let mutator = mutator.with_write_fn(failing_write);
        let path = dir.path().join("keep.py");
        fs::write(&path, "precious").expect("should write file");

        let outcome = mutator.modify(Path::new("keep.py"), "overwritten", false).await;

        assert!(!outcome.success());
        assert!(outcome.backup.is_some());
        assert_eq!(fs::read_to_string(&path).expect("should read"), "precious");
    }

    #[tokio::test]
    async fn test_should_default_delete_confirmation_to_no() {
        let prompter = ScriptedPrompter::answering(&[]);
        let (dir, mutator) = setup(prompter.clone());
        let path = dir.path().join("d.py");
        fs::write(&path, "bye").expect("should write file");

        let outcome = mutator.delete(Path::new("d.py"), true).await;

        assert_eq!(outcome.status, MutationStatus::Declined);
        assert!(path.exists());
        assert_eq!(
            prompter.questions.lock().expect("lock")[0],
            ("Delete file d.py?".to_owned(), false)
        );
        assert!(outcome.backup.is_some());
    }

    #[tokio::test]
    async fn test_should_delete_after_backup_when_not_interactive() {
        let (dir, mutator) = setup(Arc::new(AcceptDefaults));
        let path = dir.path().join("d.py");
        fs::write(&path, "bye").expect("should write file");

        let outcome = mutator.delete(Path::new("d.py"), false).await;

        assert!(outcome.success());
        assert!(!path.exists());
        let backup = outcome.backup.expect("should have backup");
        assert_eq!(fs::read_to_string(backup.backup).expect("should read"), "bye");
    }

    #[test]
    fn test_should_truncate_preview_excerpt() {
        let long = "y".repeat(PREVIEW_CHARS + 20);
        let p = preview(Path::new("f.py"), EditAction::Create, None, Some(&long));
        assert!(p.truncated);
        assert_eq!(p.after.map(|a| a.chars().count()), Some(PREVIEW_CHARS));
        assert!(p.before.is_none());
    }
}
