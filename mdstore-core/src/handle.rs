//! Per-object handles

use crate::content::Content;
use crate::error::{Result, StoreError};
use crate::store::Store;
use crate::version::{VersionInfo, VersionRecord, VersionState};
use chrono::{DateTime, Utc};

/// What a handle operation observed
#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot {
    pub id: u64,
    pub revision: Option<u64>,
    pub last_modified: Option<DateTime<Utc>>,
    pub content: Option<Content>,
}

/// Handle on one object of a store, optionally bound to a revision.
///
/// Handles cache the result of their last operation. Nothing is shared
/// between handles; two handles on the same id see each other's changes
/// only through the store.
#[derive(Debug, Clone)]
pub struct MetadataHandle {
    store: Store,
    id: u64,
    full_id: String,
    revision: Option<u64>,
    last_modified: Option<DateTime<Utc>>,
    content: Option<Content>,
    synced: bool,
}

impl MetadataHandle {
    pub(crate) fn new(store: Store, id: u64, revision: Option<u64>) -> Self {
        let full_id = store.full_id(id);
        Self {
            store,
            id,
            full_id,
            revision,
            last_modified: None,
            content: None,
            synced: false,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn full_id(&self) -> &str {
        &self.full_id
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    /// Base id of the owning store
    pub fn base(&self) -> &str {
        self.store.id()
    }

    pub fn doc_type(&self) -> Option<&str> {
        self.store.backend().config().doc_type.as_deref()
    }

    pub fn revision(&self) -> Option<u64> {
        self.revision
    }

    pub fn last_modified(&self) -> Option<DateTime<Utc>> {
        self.last_modified
    }

    pub fn content(&self) -> Option<&Content> {
        self.content.as_ref()
    }

    /// Whether the last operation on this handle succeeded
    pub fn is_synced(&self) -> bool {
        self.synced
    }

    fn snapshot(&self) -> Snapshot {
        Snapshot {
            id: self.id,
            revision: self.revision,
            last_modified: self.last_modified,
            content: self.content.clone(),
        }
    }

    fn settle<T>(&mut self, operation: &str, outcome: Result<T>) -> Result<T> {
        match outcome {
            Ok(value) => {
                self.synced = true;
                Ok(value)
            }
            Err(e) => {
                tracing::debug!("{} of {} failed: {}", operation, self.full_id, e);
                self.synced = false;
                Err(e)
            }
        }
    }

    async fn latest_info(&self) -> Result<Option<VersionInfo>> {
        Ok(self.store.backend().versions(self.id).await?.pop())
    }

    /// Bind to the newest version and return its date
    async fn follow_latest(&mut self) -> Result<()> {
        let latest = self.latest_info().await?;
        self.revision = latest.as_ref().map(|v| v.revision);
        self.last_modified = latest.map(|v| v.date);
        Ok(())
    }

    pub async fn create(&mut self, content: Content, author: &str) -> Result<Snapshot> {
        let outcome = self.create_inner(content, author).await;
        self.settle("Create", outcome)
    }

    async fn create_inner(&mut self, content: Content, author: &str) -> Result<Snapshot> {
        self.store
            .backend()
            .create(self.id, content.clone(), author)
            .await?;
        self.follow_latest().await?;
        self.content = Some(content);
        Ok(self.snapshot())
    }

    /// Read the bound revision, binding to the latest if none is set.
    ///
    /// Returns `None` when the bound revision is a deleted version.
    pub async fn read(&mut self) -> Result<Option<Content>> {
        let outcome = self.read_inner().await;
        self.settle("Read", outcome)
    }

    async fn read_inner(&mut self) -> Result<Option<Content>> {
        if self.revision.is_none() {
            tracing::debug!("No revision of {} requested, using the latest", self.full_id);
            self.revision = self.latest_info().await?.map(|v| v.revision);
        }
        let backend = self.store.backend();
        let content = backend.read(self.id, self.revision).await?;
        self.last_modified = match content.as_ref().and_then(Content::last_modified) {
            Some(date) => Some(date),
            None => Some(backend.last_modified(self.id, self.revision).await?),
        };
        self.content = content.clone();
        Ok(content)
    }

    pub async fn update(&mut self, content: Content, author: &str) -> Result<Snapshot> {
        let outcome = self.update_inner(content, author).await;
        self.settle("Update", outcome)
    }

    async fn update_inner(&mut self, content: Content, author: &str) -> Result<Snapshot> {
        self.store
            .backend()
            .update(self.id, content.clone(), author)
            .await?;
        self.follow_latest().await?;
        self.content = Some(content);
        Ok(self.snapshot())
    }

    pub async fn delete(&mut self, author: &str) -> Result<Snapshot> {
        let outcome = self.delete_inner(author).await;
        self.settle("Delete", outcome)
    }

    async fn delete_inner(&mut self, author: &str) -> Result<Snapshot> {
        self.store.backend().delete(self.id, author).await?;
        self.follow_latest().await?;
        self.content = None;
        Ok(self.snapshot())
    }

    /// Make the bound revision current again.
    ///
    /// Returns a new handle at the resulting latest revision.
    pub async fn restore(&mut self, author: &str) -> Result<MetadataHandle> {
        let outcome = self.restore_inner(author).await;
        self.settle("Restore", outcome)
    }

    async fn restore_inner(&self, author: &str) -> Result<MetadataHandle> {
        let revision = self.revision.ok_or_else(|| {
            StoreError::usage(format!(
                "Cannot restore {} without a revision",
                self.full_id
            ))
        })?;
        self.store
            .backend()
            .restore(self.id, revision, author)
            .await?;
        tracing::info!("Restored {} to revision {}", self.full_id, revision);

        let mut latest = self.store.handle(self.id);
        latest.follow_latest().await?;
        latest.synced = true;
        Ok(latest)
    }

    pub async fn versions(&self) -> Result<Vec<VersionRecord>> {
        self.store.versions(self.id).await
    }

    /// Version record of the bound revision
    pub async fn version(&self) -> Result<VersionRecord> {
        let revision = self.revision.ok_or_else(|| {
            StoreError::usage(format!("Handle of {} is not bound to a revision", self.full_id))
        })?;
        self.store.version(self.id, revision).await
    }

    pub async fn version_last(&self) -> Result<Option<VersionRecord>> {
        self.store.last_version(self.id).await
    }

    /// Whether the bound revision is a deleted version
    pub async fn is_deleted(&self) -> Result<bool> {
        Ok(self.version().await?.state() == VersionState::Deleted)
    }

    /// Whether the newest version is a deleted version
    pub async fn is_deleted_in_repository(&self) -> Result<bool> {
        Ok(self
            .latest_info()
            .await?
            .map(|v| v.state == VersionState::Deleted)
            .unwrap_or(false))
    }

    /// Set the local file time; the `synced` flag is left as it was
    pub async fn set_last_modified(&mut self, date: DateTime<Utc>) -> Result<()> {
        self.store.backend().set_last_modified(self.id, date).await?;
        self.last_modified = Some(date);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StoreConfig;
    use tempfile::TempDir;

    async fn store(tmp: &TempDir) -> Store {
        Store::open(StoreConfig::new("doc", tmp.path())).await.unwrap()
    }

    #[tokio::test]
    async fn test_handle_tracks_last_operation() {
        let tmp = TempDir::new().unwrap();
        let store = store(&tmp).await;

        let mut handle = store.handle(9);
        assert!(!handle.is_synced());
        let snapshot = handle.create(Content::from("<a/>"), "erin").await.unwrap();
        assert!(handle.is_synced());
        assert_eq!(snapshot.revision, Some(1));
        assert_eq!(snapshot.content.unwrap().as_text(), "<a/>");

        let err = handle.create(Content::from("<a/>"), "erin").await.unwrap_err();
        assert!(matches!(err, StoreError::AlreadyExists(_)));
        assert!(!handle.is_synced());

        let snapshot = handle.delete("erin").await.unwrap();
        assert!(snapshot.content.is_none());
        assert_eq!(snapshot.revision, None);
    }

    #[tokio::test]
    async fn test_restore_requires_revision() {
        let tmp = TempDir::new().unwrap();
        let store = store(&tmp).await;
        store.create(2, Content::from("<a/>"), "u").await.unwrap();

        let mut unbound = store.handle(2);
        assert!(unbound.restore("u").await.unwrap_err().is_usage());
        assert!(!unbound.is_synced());
    }

    #[tokio::test]
    async fn test_read_binds_latest_revision() {
        let tmp = TempDir::new().unwrap();
        let store = store(&tmp).await;
        store.create(4, Content::from("<a/>"), "u").await.unwrap();

        let mut handle = store.handle(4);
        let content = handle.read().await.unwrap().unwrap();
        assert_eq!(content.as_text(), "<a/>");
        assert_eq!(handle.revision(), Some(1));
        assert!(handle.last_modified().is_some());
        assert!(!handle.is_deleted().await.unwrap());
        assert!(!handle.is_deleted_in_repository().await.unwrap());
        assert_eq!(handle.base(), "doc");
        assert_eq!(handle.full_id(), "doc_00000004");
    }

    #[tokio::test]
    async fn test_set_last_modified_keeps_synced() {
        let tmp = TempDir::new().unwrap();
        let store = store(&tmp).await;
        store.create(5, Content::from("<a/>"), "u").await.unwrap();
        let date = DateTime::parse_from_rfc3339("2001-02-03T04:05:06Z")
            .unwrap()
            .with_timezone(&Utc);

        let mut handle = store.handle(5);
        handle.set_last_modified(date).await.unwrap();
        assert_eq!(handle.last_modified(), Some(date));
        assert!(!handle.is_synced());

        handle.read().await.unwrap();
        assert!(handle.is_synced());
        assert_eq!(handle.last_modified(), Some(date));

        store.delete(5, "u").await.unwrap();
        assert!(handle.set_last_modified(Utc::now()).await.unwrap_err().is_not_found());
        assert!(handle.is_synced());
        assert_eq!(handle.last_modified(), Some(date));
    }
}
