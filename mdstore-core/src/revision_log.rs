//! Revision log abstraction
//!
//! A revision log is any backend that offers a linearized, append-only
//! commit log per path, point-in-time retrieval of a path's bytes, and a way
//! to enumerate the changes below one directory. Revision numbers here are
//! backend-global; the versioned store turns them into dense per-object
//! counters.

use crate::error::Result;
use crate::version::VersionState;
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Progress is reported at least once per this many units of work
pub const PROGRESS_BATCH: u64 = 100;

/// Backend-native kind of change to a path
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChangeKind {
    Add,
    Modify,
    /// Path re-added after a delete without being a fresh create
    Replace,
    Delete,
}

impl ChangeKind {
    /// Map onto the state callers see
    pub fn state(self) -> VersionState {
        match self {
            ChangeKind::Add => VersionState::Created,
            ChangeKind::Modify | ChangeKind::Replace => VersionState::Updated,
            ChangeKind::Delete => VersionState::Deleted,
        }
    }

    pub fn code(self) -> char {
        match self {
            ChangeKind::Add => 'A',
            ChangeKind::Modify => 'M',
            ChangeKind::Replace => 'R',
            ChangeKind::Delete => 'D',
        }
    }
}

/// One commit as seen through a directory log query
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEntry {
    pub revision: u64,
    pub author: String,
    pub timestamp: DateTime<Utc>,
    pub message: String,
    /// Changed paths below the queried directory
    pub changed_paths: BTreeMap<String, ChangeKind>,
}

/// One change to a single path
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeRecord {
    /// Backend-global revision
    pub revision: u64,
    pub author: String,
    pub timestamp: DateTime<Utc>,
    pub kind: ChangeKind,
}

/// A single-path commit
#[derive(Debug, Clone)]
pub struct CommitRequest {
    pub path: String,
    pub state: VersionState,
    /// New bytes; `None` only for deletes
    pub content: Option<Bytes>,
    pub author: String,
    pub message: String,
}

/// Result of a successful commit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommitInfo {
    pub revision: u64,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerifyPhase {
    /// Walking the revision log itself
    Revisions,
    /// Comparing local content with history, object by object
    Objects,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VerifyProgress {
    pub phase: VerifyPhase,
    pub done: u64,
    pub total: u64,
}

impl VerifyProgress {
    pub fn percent(&self) -> u64 {
        if self.total == 0 {
            100
        } else {
            self.done * 100 / self.total
        }
    }
}

/// Callback receiving coarse verification progress
pub type ProgressFn = dyn Fn(VerifyProgress) + Send + Sync;

/// Summary of a successful verification
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct VerifyReport {
    pub revisions: u64,
    pub blobs: u64,
    pub objects: u64,
}

/// Directory part of a log path (`/0000/00/x.xml` → `/0000/00`)
pub fn parent_dir(path: &str) -> &str {
    match path.rfind('/') {
        Some(0) | None => "/",
        Some(idx) => &path[..idx],
    }
}

/// Adapter over a revision-controlled repository.
///
/// Commits to the same path must be linearized by the implementation: each
/// receives a strictly greater revision and timestamp than the previous one.
#[async_trait]
pub trait RevisionLog: Send + Sync {
    /// Human-readable location, for log messages
    fn location(&self) -> String;

    async fn latest_revision(&self) -> Result<u64>;

    /// All commits touching a path below `dir`, oldest first.
    ///
    /// This is a full log scan and by far the most expensive call of the
    /// store. Implementations may cache results but must drop the cache on
    /// every commit.
    async fn log(&self, dir: &str) -> Result<Vec<LogEntry>>;

    /// Changes to exactly `path`, oldest first (scans the parent directory)
    async fn changes_affecting(&self, path: &str) -> Result<Vec<ChangeRecord>> {
        let entries = self.log(parent_dir(path)).await?;
        Ok(entries
            .into_iter()
            .filter_map(|entry| {
                let kind = *entry.changed_paths.get(path)?;
                Some(ChangeRecord {
                    revision: entry.revision,
                    author: entry.author,
                    timestamp: entry.timestamp,
                    kind,
                })
            })
            .collect())
    }

    /// Bytes of `path` as of backend `revision`
    async fn fetch(&self, path: &str, revision: u64) -> Result<Bytes>;

    async fn commit(&self, request: CommitRequest) -> Result<CommitInfo>;

    /// Every path that was ever committed, live or deleted
    async fn tracked_paths(&self) -> Result<Vec<String>>;

    /// Integrity walk over the whole backend; may take long
    async fn verify(&self, progress: Option<&ProgressFn>) -> Result<VerifyReport>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_mapping() {
        assert_eq!(ChangeKind::Add.state(), VersionState::Created);
        assert_eq!(ChangeKind::Modify.state(), VersionState::Updated);
        assert_eq!(ChangeKind::Replace.state(), VersionState::Updated);
        assert_eq!(ChangeKind::Delete.state(), VersionState::Deleted);
        assert_eq!(ChangeKind::Replace.code(), 'R');
    }

    #[test]
    fn test_parent_dir() {
        assert_eq!(parent_dir("/0000/00/doc_00000042.xml"), "/0000/00");
        assert_eq!(parent_dir("/doc_42.xml"), "/");
        assert_eq!(parent_dir("doc.xml"), "/");
    }

    #[test]
    fn test_progress_percent() {
        let p = VerifyProgress { phase: VerifyPhase::Revisions, done: 250, total: 1000 };
        assert_eq!(p.percent(), 25);
        let empty = VerifyProgress { phase: VerifyPhase::Objects, done: 0, total: 0 };
        assert_eq!(empty.percent(), 100);
    }
}
