//! Store abstraction and the shared store handle

use crate::config::StoreConfig;
use crate::content::Content;
use crate::content_store::LocalStore;
use crate::error::{Result, StoreError};
use crate::handle::MetadataHandle;
use crate::revision_log::{ProgressFn, VerifyReport};
use crate::slot::SlotLayout;
use crate::version::{VersionInfo, VersionRecord};
use crate::versioned::VersionedStore;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::fmt;
use std::sync::Arc;

/// Reject ids the slot layout cannot address
pub(crate) fn check_id(id: u64) -> Result<()> {
    if id < 1 {
        return Err(StoreError::usage(format!("ID {} must be >= 1", id)));
    }
    Ok(())
}

/// Operations every metadata store offers, versioned or not.
///
/// Revisions passed in and returned are the dense per-object counters
/// (1, 2, 3, ...), never backend revision numbers.
#[async_trait]
pub trait MetadataStore: Send + Sync {
    fn config(&self) -> &StoreConfig;

    fn layout(&self) -> &SlotLayout;

    /// `{store id}_{padded id}`
    fn full_id(&self, id: u64) -> String {
        let base = &self.config().id;
        match self.layout().pad(id) {
            Ok(padded) => format!("{}_{}", base, padded),
            Err(_) => format!("{}_{}", base, id),
        }
    }

    /// An id above every id this store has seen
    async fn next_free_id(&self) -> Result<u64>;

    async fn exists(&self, id: u64) -> Result<bool>;

    async fn list_ids(&self) -> Result<Vec<u64>>;

    async fn create(&self, id: u64, content: Content, author: &str) -> Result<()>;

    /// Content at a revision (latest when `None`); `None` for a deleted revision
    async fn read(&self, id: u64, revision: Option<u64>) -> Result<Option<Content>>;

    /// Like [`MetadataStore::read`] but demanding a deleted revision is a usage error
    async fn require(&self, id: u64, revision: Option<u64>) -> Result<Content> {
        self.read(id, revision).await?.ok_or_else(|| {
            StoreError::usage(format!(
                "{} is deleted in the requested revision and has no content",
                self.full_id(id)
            ))
        })
    }

    async fn update(&self, id: u64, content: Content, author: &str) -> Result<()>;

    async fn delete(&self, id: u64, author: &str) -> Result<()>;

    /// Make the content of `revision` current again
    async fn restore(&self, id: u64, revision: u64, author: &str) -> Result<()> {
        let content = self.read(id, Some(revision)).await?.ok_or_else(|| {
            StoreError::usage(format!(
                "Cannot restore revision {} of {}, it is a deleted version",
                revision,
                self.full_id(id)
            ))
        })?;
        self.update(id, content, author).await
    }

    /// All versions of an object, oldest first; empty for unknown ids
    async fn versions(&self, id: u64) -> Result<Vec<VersionInfo>>;

    async fn last_modified(&self, id: u64, revision: Option<u64>) -> Result<DateTime<Utc>>;

    async fn set_last_modified(&self, id: u64, date: DateTime<Utc>) -> Result<()>;

    /// Whether local content matches the latest committed revision
    async fn is_up_to_date(&self, id: u64) -> Result<bool>;

    async fn verify(&self, progress: Option<&ProgressFn>) -> Result<VerifyReport>;
}

/// Cloneable handle to a metadata store
#[derive(Clone)]
pub struct Store {
    inner: Arc<dyn MetadataStore>,
}

impl Store {
    pub fn new<S: MetadataStore + 'static>(store: S) -> Self {
        Self {
            inner: Arc::new(store),
        }
    }

    pub fn from_arc(inner: Arc<dyn MetadataStore>) -> Self {
        Self { inner }
    }

    /// Open the store described by `config`; versioned when it has a history section
    pub async fn open(config: StoreConfig) -> Result<Self> {
        if config.history.is_some() {
            Ok(Self::new(VersionedStore::open(config).await?))
        } else {
            Ok(Self::new(LocalStore::open(config)?))
        }
    }

    pub fn backend(&self) -> &dyn MetadataStore {
        self.inner.as_ref()
    }

    pub fn id(&self) -> &str {
        &self.inner.config().id
    }

    pub fn full_id(&self, id: u64) -> String {
        self.inner.full_id(id)
    }

    /// Handle for `id` without any revision bound yet
    pub fn handle(&self, id: u64) -> MetadataHandle {
        MetadataHandle::new(self.clone(), id, None)
    }

    pub fn handle_at(&self, id: u64, revision: u64) -> MetadataHandle {
        MetadataHandle::new(self.clone(), id, Some(revision))
    }

    pub async fn next_free_id(&self) -> Result<u64> {
        self.inner.next_free_id().await
    }

    pub async fn exists(&self, id: u64) -> Result<bool> {
        self.inner.exists(id).await
    }

    pub async fn create(&self, id: u64, content: Content, author: &str) -> Result<MetadataHandle> {
        let mut handle = self.handle(id);
        handle.create(content, author).await?;
        Ok(handle)
    }

    /// Create under a freshly allocated id
    pub async fn create_next(&self, content: Content, author: &str) -> Result<MetadataHandle> {
        let id = self.inner.next_free_id().await?;
        self.create(id, content, author).await
    }

    /// Handle at the latest revision, `None` if the id is unknown
    pub async fn retrieve(&self, id: u64) -> Result<Option<MetadataHandle>> {
        if !self.inner.exists(id).await? {
            return Ok(None);
        }
        let mut handle = self.handle(id);
        handle.read().await?;
        Ok(Some(handle))
    }

    pub async fn update(&self, id: u64, content: Content, author: &str) -> Result<MetadataHandle> {
        let mut handle = self.handle(id);
        handle.update(content, author).await?;
        Ok(handle)
    }

    pub async fn delete(&self, id: u64, author: &str) -> Result<()> {
        self.handle(id).delete(author).await.map(|_| ())
    }

    pub async fn versions(&self, id: u64) -> Result<Vec<VersionRecord>> {
        let infos = self.inner.versions(id).await?;
        Ok(infos
            .into_iter()
            .map(|info| VersionRecord::new(self.clone(), id, info))
            .collect())
    }

    pub async fn version(&self, id: u64, revision: u64) -> Result<VersionRecord> {
        let mut versions = self.versions(id).await?;
        let count = versions.len();
        if revision == 0 || revision as usize > count {
            return Err(StoreError::not_found(format!(
                "Revision {} of {} not found, last revision is {}",
                revision,
                self.full_id(id),
                count
            )));
        }
        Ok(versions.swap_remove(revision as usize - 1))
    }

    pub async fn first_version(&self, id: u64) -> Result<Option<VersionRecord>> {
        Ok(self.versions(id).await?.into_iter().next())
    }

    pub async fn last_version(&self, id: u64) -> Result<Option<VersionRecord>> {
        Ok(self.versions(id).await?.pop())
    }

    pub async fn verify(&self, progress: Option<&ProgressFn>) -> Result<VerifyReport> {
        self.inner.verify(progress).await
    }
}

impl fmt::Debug for Store {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Store")
            .field("id", &self.id())
            .field("base_dir", &self.inner.config().base_dir)
            .field("versioned", &self.inner.config().history.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_check_id() {
        assert!(check_id(0).unwrap_err().is_usage());
        assert!(check_id(1).is_ok());
    }

    #[tokio::test]
    async fn test_open_unversioned() {
        let tmp = TempDir::new().unwrap();
        let store = Store::open(StoreConfig::new("doc", tmp.path())).await.unwrap();
        assert_eq!(store.full_id(42), "doc_00000042");

        let handle = store.create_next(Content::from("<a/>"), "dave").await.unwrap();
        assert_eq!(handle.id(), 1);
        assert_eq!(handle.revision(), Some(1));

        let found = store.retrieve(1).await.unwrap().unwrap();
        assert_eq!(found.content().unwrap().as_text(), "<a/>");
        assert!(store.retrieve(2).await.unwrap().is_none());

        let version = store.version(1, 1).await.unwrap();
        assert_eq!(version.author(), "dave");
        assert!(store.version(1, 2).await.unwrap_err().is_not_found());
    }
}
