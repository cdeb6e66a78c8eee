//! Durable mirror of the scheduler's pending set.
//!
//! One pretty-printed JSON file per test definition, named by its identity.
//! Persistence is best-effort: failures are logged and never propagate into
//! scheduling decisions.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use anyhow::{Context, Result};
use tracing::{debug, error, info, warn};

use super::definition::TestDefinition;

const EXTENSION: &str = "json";

pub struct SchedulerStorage {
    dir: PathBuf,
    realtime: bool,
}

impl SchedulerStorage {
    /// Open (or create) the storage directory.
    pub fn open(dir: impl Into<PathBuf>, realtime: bool) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("failed to create scheduler directory: {}", dir.display()))?;
        debug!(dir = %dir.display(), realtime, "scheduler storage opened");
        Ok(Self { dir, realtime })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Write-through mode mirrors every add/remove immediately.
    pub fn is_realtime(&self) -> bool {
        self.realtime
    }

    pub fn set_realtime(&mut self, realtime: bool) {
        self.realtime = realtime;
    }

    pub fn path_for(&self, test: &TestDefinition) -> PathBuf {
        self.dir.join(format!("{}.{}", test.id, EXTENSION))
    }

    pub(crate) fn test_added(&self, test: &TestDefinition) {
        if self.realtime {
            self.store(test);
        }
    }

    pub(crate) fn test_removed(&self, test: &TestDefinition) {
        if !self.realtime {
            return;
        }
        let path = self.path_for(test);
        match std::fs::remove_file(&path) {
            Ok(()) => debug!(path = %path.display(), "deleted scheduler file"),
            Err(e) => warn!(path = %path.display(), error = %e, "unable to remove scheduler file"),
        }
    }

    /// Write one definition, replacing any previous file atomically.
    pub fn store(&self, test: &TestDefinition) {
        if let Err(e) = self.try_store(test) {
            error!(test_id = %test.id, error = %e, "failed to persist test definition");
        }
    }

    fn try_store(&self, test: &TestDefinition) -> Result<()> {
        let path = self.path_for(test);
        let tmp = path.with_extension("tmp");
        let json = test.to_json().context("failed to serialize test definition")?;
        std::fs::write(&tmp, json)
            .with_context(|| format!("failed to write {}", tmp.display()))?;
        std::fs::rename(&tmp, &path)
            .with_context(|| format!("failed to rename {} to {}", tmp.display(), path.display()))?;
        Ok(())
    }

    /// Batched mode: write every pending definition and drop files for
    /// definitions that are no longer pending.  No-op in write-through mode.
    pub fn flush<'a>(&self, tests: impl IntoIterator<Item = &'a TestDefinition>) {
        if self.realtime {
            return;
        }

        let mut keep = HashSet::new();
        for test in tests {
            self.store(test);
            keep.insert(self.path_for(test));
        }

        for path in self.definition_files() {
            if !keep.contains(&path) {
                if let Err(e) = std::fs::remove_file(&path) {
                    warn!(path = %path.display(), error = %e, "unable to remove stale scheduler file");
                }
            }
        }
        info!(stored = keep.len(), "scheduler storage flushed");
    }

    /// Read every definition file.  Unreadable or malformed files are
    /// skipped with a logged error.
    pub fn load(&self) -> Vec<TestDefinition> {
        let mut tests = Vec::new();

        for path in self.definition_files() {
            let content = match std::fs::read_to_string(&path) {
                Ok(c) => c,
                Err(e) => {
                    error!(path = %path.display(), error = %e, "error opening scheduler file");
                    continue;
                }
            };
            match TestDefinition::from_json(&content) {
                Ok(test) => tests.push(test),
                Err(e) => {
                    error!(path = %path.display(), error = %e, "error reading scheduler file");
                }
            }
        }

        info!(count = tests.len(), dir = %self.dir.display(), "loaded pending test definitions");
        tests
    }

    /// Definition files ordered by modification time, then name, so a reload
    /// approximates insertion order.
    fn definition_files(&self) -> Vec<PathBuf> {
        let entries = match std::fs::read_dir(&self.dir) {
            Ok(e) => e,
            Err(e) => {
                error!(dir = %self.dir.display(), error = %e, "unable to scan scheduler directory");
                return Vec::new();
            }
        };

        let mut files: Vec<(SystemTime, PathBuf)> = entries
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_type().map(|t| t.is_file()).unwrap_or(false))
            .map(|entry| entry.path())
            .filter(|path| path.extension().and_then(|e| e.to_str()) == Some(EXTENSION))
            .map(|path| {
                let modified = std::fs::metadata(&path)
                    .and_then(|m| m.modified())
                    .unwrap_or(SystemTime::UNIX_EPOCH);
                (modified, path)
            })
            .collect();

        files.sort();
        files.into_iter().map(|(_, path)| path).collect()
    }
}
