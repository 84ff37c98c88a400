//! Version records: one historical state of an object

use crate::content::Content;
use crate::error::Result;
use crate::handle::MetadataHandle;
use crate::store::Store;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Whether a version was the result of a create, an update or a delete
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum VersionState {
    /// Initial version (the only state an unversioned store reports)
    Created,
    Updated,
    /// Object was deleted; the version carries no content
    Deleted,
}

impl VersionState {
    /// Single-letter code: `C`, `U` or `D`
    pub fn type_char(self) -> char {
        match self {
            VersionState::Created => 'C',
            VersionState::Updated => 'U',
            VersionState::Deleted => 'D',
        }
    }

    pub fn verb(self) -> &'static str {
        match self {
            VersionState::Created => "created",
            VersionState::Updated => "updated",
            VersionState::Deleted => "deleted",
        }
    }
}

impl fmt::Display for VersionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            VersionState::Created => "CREATED",
            VersionState::Updated => "UPDATED",
            VersionState::Deleted => "DELETED",
        };
        f.write_str(name)
    }
}

/// Plain data describing one version of an object
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionInfo {
    /// Dense per-object counter starting at 1
    pub revision: u64,
    pub author: String,
    pub date: DateTime<Utc>,
    pub state: VersionState,
}

/// A version of an object together with the store it came from.
///
/// Records are immutable. [`VersionRecord::metadata`] builds a fresh handle
/// at this revision which queries the store again; nothing is cached here.
#[derive(Clone)]
pub struct VersionRecord {
    id: u64,
    info: VersionInfo,
    store: Store,
}

impl VersionRecord {
    pub(crate) fn new(store: Store, id: u64, info: VersionInfo) -> Self {
        tracing::debug!(
            "Instantiating version info for {}, revision {}",
            store.full_id(id),
            info.revision
        );
        Self { id, info, store }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn revision(&self) -> u64 {
        self.info.revision
    }

    pub fn author(&self) -> &str {
        &self.info.author
    }

    pub fn date(&self) -> DateTime<Utc> {
        self.info.date
    }

    pub fn state(&self) -> VersionState {
        self.info.state
    }

    pub fn type_char(&self) -> char {
        self.info.state.type_char()
    }

    pub fn is_deleted(&self) -> bool {
        self.info.state == VersionState::Deleted
    }

    pub fn info(&self) -> &VersionInfo {
        &self.info
    }

    /// Handle bound to this object at this revision
    pub fn metadata(&self) -> MetadataHandle {
        self.store.handle_at(self.id, self.info.revision)
    }

    /// Content at this revision; `None` for a deleted revision
    pub async fn content(&self) -> Result<Option<Content>> {
        self.store
            .backend()
            .read(self.id, Some(self.info.revision))
            .await
    }

    /// Make this revision's content current again.
    ///
    /// Appends a new version; fails with a usage error for deleted revisions.
    pub async fn restore(&self, author: &str) -> Result<MetadataHandle> {
        self.metadata().restore(author).await
    }
}

impl fmt::Debug for VersionRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VersionRecord")
            .field("id", &self.id)
            .field("revision", &self.info.revision)
            .field("author", &self.info.author)
            .field("date", &self.info.date)
            .field("state", &self.info.state)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_codes() {
        assert_eq!(VersionState::Created.type_char(), 'C');
        assert_eq!(VersionState::Updated.type_char(), 'U');
        assert_eq!(VersionState::Deleted.type_char(), 'D');
        assert_eq!(VersionState::Updated.verb(), "updated");
        assert_eq!(VersionState::Deleted.to_string(), "DELETED");
    }

    #[test]
    fn test_info_serializes() {
        let info = VersionInfo {
            revision: 2,
            author: "bob".into(),
            date: DateTime::from_timestamp_millis(1_700_000_000_000).unwrap(),
            state: VersionState::Updated,
        };
        let json = serde_json::to_string(&info).unwrap();
        let back: VersionInfo = serde_json::from_str(&json).unwrap();
        assert_eq!(back, info);
    }
}
