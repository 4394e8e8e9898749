//! Timestamped copies of files taken before they are overwritten or removed.
//!
//! Backups are named `<file>.<YYYYMMDD_HHMMSS>.backup`. A second backup of the
//! same file name within one second gets a counter,
//! `<file>.<YYYYMMDD_HHMMSS>.<n>.backup`, so no backup is ever overwritten.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use chrono::{Local, NaiveDateTime, TimeDelta};
use tracing::{debug, info, instrument, warn};

use crate::CoreError;
use crate::config::BackupConfig;

const TIMESTAMP_FORMAT: &str = "%Y%m%d_%H%M%S";
const SUFFIX: &str = ".backup";

/// A backup taken by this process, tied to the file it protects.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupRecord {
    pub original: PathBuf,
    pub backup: PathBuf,
    pub created_at: NaiveDateTime,
}

/// A backup found on disk, parsed back from its file name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupEntry {
    pub path: PathBuf,
    pub original_name: String,
    pub created_at: NaiveDateTime,
    pub sequence: u32,
}

/// Which backups [`BackupStore::prune`] removes. Empty means none.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RetentionPolicy {
    /// Keep at most this many backups per original file name.
    pub keep_last: Option<usize>,
    /// Remove backups older than this many days.
    pub max_age_days: Option<u64>,
}

impl RetentionPolicy {
    pub fn is_empty(&self) -> bool {
        self.keep_last.is_none() && self.max_age_days.is_none()
    }
}

impl From<&BackupConfig> for RetentionPolicy {
    fn from(config: &BackupConfig) -> Self {
        Self {
            keep_last: config.keep_last,
            max_age_days: config.max_age_days,
        }
    }
}

/// The backup directory of one project.
#[derive(Debug, Clone)]
pub struct BackupStore {
    dir: PathBuf,
}

impl BackupStore {
    /// The directory is created on first use, not here.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Copy `path` into the store.
    pub fn create(&self, path: &Path) -> Result<BackupRecord, CoreError> {
        self.create_at(path, Local::now().naive_local())
    }

    #[instrument(skip(self, path), fields(dir = %self.dir.display(), path = %path.display()))]
    pub(crate) fn create_at(
        &self,
        path: &Path,
        now: NaiveDateTime,
    ) -> Result<BackupRecord, CoreError> {
        let name = path
            .file_name()
            .ok_or_else(|| CoreError::Mutation {
                path: path.to_path_buf(),
                reason: "path has no file name to back up".to_owned(),
            })?
            .to_string_lossy()
            .into_owned();

        fs::create_dir_all(&self.dir)?;

        let stamp = now.format(TIMESTAMP_FORMAT).to_string();
        let mut backup = self.dir.join(format!("{name}.{stamp}{SUFFIX}"));
        let mut n = 1u32;
        while backup.exists() {
            backup = self.dir.join(format!("{name}.{stamp}.{n}{SUFFIX}"));
            n += 1;
        }

        fs::copy(path, &backup)?;
        debug!(backup = %backup.display(), "backup created");

        Ok(BackupRecord {
            original: path.to_path_buf(),
            backup,
            created_at: now,
        })
    }

    /// Copy a backup over the file it was taken from.
    #[instrument(skip(self, record), fields(original = %record.original.display()))]
    pub fn restore(&self, record: &BackupRecord) -> Result<(), CoreError> {
        fs::copy(&record.backup, &record.original)?;
        info!(backup = %record.backup.display(), "file restored from backup");
        Ok(())
    }

    /// Every recognizable backup, newest first.
    pub fn list(&self) -> Result<Vec<BackupEntry>, CoreError> {
        let read_dir = match fs::read_dir(&self.dir) {
            Ok(rd) => rd,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut entries: Vec<BackupEntry> = read_dir
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_ok_and(|t| t.is_file()))
            .filter_map(|e| parse_entry(e.path()))
            .collect();

        entries.sort_by(|a, b| {
            b.created_at
                .cmp(&a.created_at)
                .then_with(|| b.sequence.cmp(&a.sequence))
                .then_with(|| a.original_name.cmp(&b.original_name))
        });
        Ok(entries)
    }

    /// Remove backups outside `policy`. Returns the removed paths.
    #[instrument(skip(self), fields(dir = %self.dir.display()))]
    pub fn prune(
        &self,
        policy: &RetentionPolicy,
        now: NaiveDateTime,
    ) -> Result<Vec<PathBuf>, CoreError> {
        if policy.is_empty() {
            return Ok(Vec::new());
        }

        let max_age = policy
            .max_age_days
            .and_then(|d| i64::try_from(d).ok())
            .and_then(TimeDelta::try_days);

        let mut seen: HashMap<String, usize> = HashMap::new();
        let mut removed = Vec::new();

        for entry in self.list()? {
            let rank = seen.entry(entry.original_name.clone()).or_default();
            *rank += 1;

            let over_count = policy.keep_last.is_some_and(|k| *rank > k);
            let too_old = max_age.is_some_and(|age| now - entry.created_at > age);
            if !(over_count || too_old) {
                continue;
            }

            match fs::remove_file(&entry.path) {
                Ok(()) => removed.push(entry.path),
                Err(e) => warn!(path = %entry.path.display(), error = %e, "failed to remove backup"),
            }
        }

        info!(removed = removed.len(), "pruned backups");
        Ok(removed)
    }
}

fn parse_entry(path: PathBuf) -> Option<BackupEntry> {
    let name = path.file_name()?.to_str()?;
    let stem = name.strip_suffix(SUFFIX)?;
    let (head, last) = stem.rsplit_once('.')?;

    let (original_name, stamp, sequence) = if let Some(ts) = parse_timestamp(last) {
        (head, ts, 0)
    } else {
        let sequence: u32 = last.parse().ok()?;
        let (original_name, stamp) = head.rsplit_once('.')?;
        (original_name, parse_timestamp(stamp)?, sequence)
    };

    Some(BackupEntry {
        original_name: original_name.to_owned(),
        created_at: stamp,
        sequence,
        path,
    })
}

fn parse_timestamp(s: &str) -> Option<NaiveDateTime> {
    NaiveDateTime::parse_from_str(s, TIMESTAMP_FORMAT).ok()
}
