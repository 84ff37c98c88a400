//! Versioned metadata store
//!
//! Composes a local content backend, holding the current bytes of every live
//! object, with a revision log that records each create, update and delete.
//! Reads of the latest content are served locally; anything historical goes
//! to the log.
//!
//! An object moves through three states:
//!
//! ```text
//! untracked --create--> live --delete--> tombstoned --create/update--> live
//! ```
//!
//! Tombstoned objects keep their history, so `exists` stays true for them.

use crate::config::StoreConfig;
use crate::content::{Content, ContentBackend};
use crate::content_store::FsContentStore;
use crate::disk_log::DiskRevisionLog;
use crate::error::{Result, StoreError};
use crate::ids::IdAllocator;
use crate::revision_log::{
    CommitInfo, CommitRequest, ProgressFn, RevisionLog, VerifyPhase, VerifyProgress,
    VerifyReport, PROGRESS_BATCH,
};
use crate::slot::SlotLayout;
use crate::store::{check_id, MetadataStore};
use crate::version::{VersionInfo, VersionState};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::BTreeSet;
use std::sync::Arc;

/// A version together with the backend revision it was committed in
#[derive(Debug, Clone)]
struct TrackedVersion {
    info: VersionInfo,
    backend_revision: u64,
}

pub struct VersionedStore {
    config: StoreConfig,
    layout: SlotLayout,
    prefix: String,
    content: Arc<dyn ContentBackend>,
    log: Arc<dyn RevisionLog>,
    sync_last_modified: bool,
    ids: IdAllocator,
}

impl VersionedStore {
    /// Open a store with filesystem content and a disk revision log
    pub async fn open(config: StoreConfig) -> Result<Self> {
        let history = config.history.clone().ok_or_else(|| {
            StoreError::configuration(format!("Store {} has no history configured", config.id))
        })?;
        let content = FsContentStore::open(config.clone())?;
        let log = DiskRevisionLog::open(&history.repository, history.scan_cache_capacity)?;
        tracing::info!(
            "Opened versioned store {} at {:?} with revision log {:?}",
            config.id,
            config.base_dir,
            history.repository
        );
        Self::new(config, Arc::new(content), Arc::new(log)).await
    }

    /// Compose a store from arbitrary backends
    pub async fn new(
        config: StoreConfig,
        content: Arc<dyn ContentBackend>,
        log: Arc<dyn RevisionLog>,
    ) -> Result<Self> {
        let layout = config.validate()?;
        let prefix = config.prefix();
        let sync_last_modified = config
            .history
            .as_ref()
            .map(|h| h.sync_last_modified)
            .unwrap_or(true);
        let store = Self {
            config,
            layout,
            prefix,
            content,
            log,
            sync_last_modified,
            ids: IdAllocator::default(),
        };
        store.seed_ids().await?;
        Ok(store)
    }

    pub fn content_backend(&self) -> &Arc<dyn ContentBackend> {
        &self.content
    }

    pub fn revision_log(&self) -> &Arc<dyn RevisionLog> {
        &self.log
    }

    /// Ids of tombstoned objects count as used
    async fn seed_ids(&self) -> Result<()> {
        self.ids.observe(self.content.highest_stored_id().await?);
        for path in self.log.tracked_paths().await? {
            if let Some(id) = self.id_from_log_path(&path) {
                self.ids.observe(id);
            }
        }
        Ok(())
    }

    /// Path of an object inside the revision log
    pub fn log_path(&self, id: u64) -> Result<String> {
        let parts = self
            .layout
            .relative_path(id, &self.prefix, &self.config.suffix)?;
        Ok(format!("/{}", parts.join("/")))
    }

    fn id_from_log_path(&self, path: &str) -> Option<u64> {
        let name = path.rsplit('/').next()?;
        self.layout
            .id_from_file_name(name, &self.prefix, &self.config.suffix)
    }

    fn committer<'a>(&'a self, author: &'a str) -> Result<&'a str> {
        if let Some(committer) = &self.config.committer {
            return Ok(committer);
        }
        if author.trim().is_empty() {
            return Err(StoreError::configuration(format!(
                "No author given for a change in store {}",
                self.config.id
            )));
        }
        Ok(author)
    }

    /// Per-object history with dense revision numbers
    async fn history(&self, id: u64) -> Result<Vec<TrackedVersion>> {
        let path = self.log_path(id)?;
        let changes = self.log.changes_affecting(&path).await.map_err(|e| {
            StoreError::persistence(
                format!("Could not get versions of {}", self.full_id(id)),
                e,
            )
        })?;
        Ok(changes
            .into_iter()
            .enumerate()
            .map(|(index, change)| TrackedVersion {
                info: VersionInfo {
                    revision: index as u64 + 1,
                    author: change.author,
                    date: change.timestamp,
                    state: change.kind.state(),
                },
                backend_revision: change.revision,
            })
            .collect())
    }

    async fn commit(
        &self,
        id: u64,
        state: VersionState,
        content: Option<&Content>,
        author: &str,
    ) -> Result<CommitInfo> {
        let full_id = self.full_id(id);
        let request = CommitRequest {
            path: self.log_path(id)?,
            state,
            content: content.map(|c| c.data().clone()),
            author: author.to_string(),
            message: format!("{} metadata object {} in store", state.verb(), full_id),
        };
        let info = self.log.commit(request).await.map_err(|e| {
            StoreError::persistence(
                format!("Could not commit {} of {} to {}", state, full_id, self.log.location()),
                e,
            )
        })?;
        tracing::info!(
            "Commit of {} {} finished, new revision {}",
            state,
            full_id,
            info.revision
        );

        if state != VersionState::Deleted && self.sync_last_modified {
            if let Err(e) = self.content.set_last_modified(id, info.timestamp).await {
                tracing::warn!(
                    "Could not set last modified of {} to commit date: {}",
                    full_id,
                    e
                );
            }
        }
        Ok(info)
    }

    /// Rewrite the local content of every live object from the revision log.
    ///
    /// Returns the number of objects written.
    pub async fn refresh_local_cache(&self) -> Result<usize> {
        let mut refreshed = 0;
        for path in self.log.tracked_paths().await? {
            let Some(id) = self.id_from_log_path(&path) else {
                tracing::warn!("Ignoring foreign path {} in revision log", path);
                continue;
            };
            let history = self.history(id).await?;
            let Some(latest) = history.last() else {
                continue;
            };
            if latest.info.state == VersionState::Deleted {
                continue;
            }

            let data = self.log.fetch(&path, latest.backend_revision).await?;
            let content = Content::new(data);
            if self.content.exists(id).await? {
                self.content.update(id, &content).await?;
            } else {
                self.content.create(id, &content).await?;
            }
            if let Err(e) = self.content.set_last_modified(id, latest.info.date).await {
                tracing::warn!("Could not set last modified of {}: {}", self.full_id(id), e);
            }
            refreshed += 1;
        }
        tracing::info!(
            "Refreshed {} objects of store {} from {}",
            refreshed,
            self.config.id,
            self.log.location()
        );
        Ok(refreshed)
    }

    /// Compare local content with the live/deleted state in history
    async fn check_consistency(&self, progress: Option<&ProgressFn>) -> Result<u64> {
        let mut ids: BTreeSet<u64> = self.content.list_ids().await?.into_iter().collect();
        for path in self.log.tracked_paths().await? {
            ids.extend(self.id_from_log_path(&path));
        }

        let total = ids.len() as u64;
        let mut problems = Vec::new();
        for (index, id) in ids.into_iter().enumerate() {
            let done = index as u64 + 1;
            let local = self.content.exists(id).await?;
            let live = self
                .history(id)
                .await?
                .last()
                .map(|v| v.info.state != VersionState::Deleted)
                .unwrap_or(false);
            match (local, live) {
                (true, false) => problems.push(StoreError::inconsistent(format!(
                    "{} has local content but no live revision",
                    self.full_id(id)
                ))),
                (false, true) => problems.push(StoreError::inconsistent(format!(
                    "{} is live in history but has no local content",
                    self.full_id(id)
                ))),
                _ => {}
            }

            if done % PROGRESS_BATCH == 0 || done == total {
                tracing::info!("Checked {}/{} objects of store {}", done, total, self.config.id);
                if let Some(report) = progress {
                    report(VerifyProgress {
                        phase: VerifyPhase::Objects,
                        done,
                        total,
                    });
                }
            }
        }

        if problems.is_empty() {
            return Ok(total);
        }
        for problem in &problems {
            tracing::error!("{}", problem);
        }
        let count = problems.len();
        Err(StoreError::persistence(
            format!(
                "Store {} has {} inconsistent object(s)",
                self.config.id, count
            ),
            problems.swap_remove(0),
        ))
    }
}

#[async_trait]
impl MetadataStore for VersionedStore {
    fn config(&self) -> &StoreConfig {
        &self.config
    }

    fn layout(&self) -> &SlotLayout {
        &self.layout
    }

    async fn next_free_id(&self) -> Result<u64> {
        let highest = self.content.highest_stored_id().await?;
        let max = self.layout.max_id();
        self.ids.next(highest, max).ok_or_else(|| {
            StoreError::configuration(format!(
                "Store {} has no free id left, slot layout {} ends at {}",
                self.config().id,
                self.layout,
                max
            ))
        })
    }

    async fn exists(&self, id: u64) -> Result<bool> {
        if self.content.exists(id).await? {
            return Ok(true);
        }
        Ok(!self.history(id).await?.is_empty())
    }

    /// Ids with local content; tombstoned ids are not listed
    async fn list_ids(&self) -> Result<Vec<u64>> {
        self.content.list_ids().await
    }

    async fn create(&self, id: u64, content: Content, author: &str) -> Result<()> {
        check_id(id)?;
        let author = self.committer(author)?;
        self.content.create(id, &content).await?;
        self.ids.observe(id);
        if let Err(e) = self.commit(id, VersionState::Created, Some(&content), author).await {
            tracing::error!(
                "{} was stored locally but not committed, verification will report it",
                self.full_id(id)
            );
            return Err(e);
        }
        Ok(())
    }

    async fn read(&self, id: u64, revision: Option<u64>) -> Result<Option<Content>> {
        check_id(id)?;
        if revision.is_none() && self.content.exists(id).await? {
            return self.content.read(id).await.map(Some);
        }

        let history = self.history(id).await?;
        let Some(latest) = history.last() else {
            return Err(StoreError::not_found(format!(
                "{} does not exist in store",
                self.full_id(id)
            )));
        };
        let revision = match revision {
            None => latest.info.revision,
            Some(0) => return Err(StoreError::usage("Revision must be >= 1")),
            Some(rev) => rev,
        };
        let Some(version) = history.get(revision as usize - 1) else {
            return Err(StoreError::not_found(format!(
                "Revision {} of {} not found, last revision is {}",
                revision,
                self.full_id(id),
                latest.info.revision
            )));
        };
        if version.info.state == VersionState::Deleted {
            return Ok(None);
        }

        let content = if version.info.revision == latest.info.revision
            && self.content.exists(id).await?
        {
            self.content.read(id).await?
        } else {
            let path = self.log_path(id)?;
            let data = self
                .log
                .fetch(&path, version.backend_revision)
                .await
                .map_err(|e| {
                    StoreError::persistence(
                        format!("Could not read revision {} of {}", revision, self.full_id(id)),
                        e,
                    )
                })?;
            Content::new(data).with_doc_type(self.config.doc_type.clone())
        };
        Ok(Some(content.with_last_modified(version.info.date)))
    }

    async fn update(&self, id: u64, content: Content, author: &str) -> Result<()> {
        check_id(id)?;
        let author = self.committer(author)?;
        if self.content.exists(id).await? {
            self.content.update(id, &content).await?;
        } else {
            match self.history(id).await?.last() {
                None => {
                    return Err(StoreError::not_found(format!(
                        "{} does not exist in store",
                        self.full_id(id)
                    )));
                }
                Some(latest) if latest.info.state == VersionState::Deleted => {
                    tracing::info!(
                        "{} is deleted in repository, recreating it",
                        self.full_id(id)
                    );
                    self.content.create(id, &content).await?;
                }
                Some(_) => {
                    return Err(StoreError::inconsistent(format!(
                        "{} is live in history but has no local content",
                        self.full_id(id)
                    )));
                }
            }
        }
        self.commit(id, VersionState::Updated, Some(&content), author)
            .await?;
        Ok(())
    }

    async fn delete(&self, id: u64, author: &str) -> Result<()> {
        check_id(id)?;
        let author = self.committer(author)?;
        if !self.content.exists(id).await? {
            return Err(StoreError::not_found(format!(
                "{} does not exist in store",
                self.full_id(id)
            )));
        }
        if let Err(e) = self.commit(id, VersionState::Deleted, None, author).await {
            tracing::error!("Error while deleting {} in revision log: {}", self.full_id(id), e);
        }
        self.content.delete(id).await
    }

    async fn restore(&self, id: u64, revision: u64, author: &str) -> Result<()> {
        check_id(id)?;
        let history = self.history(id).await?;
        let version = revision
            .checked_sub(1)
            .and_then(|index| history.get(index as usize))
            .ok_or_else(|| {
                StoreError::not_found(format!(
                    "Revision {} of {} not found",
                    revision,
                    self.full_id(id)
                ))
            })?;
        if version.info.state == VersionState::Deleted {
            return Err(StoreError::usage(format!(
                "Cannot restore revision {} of {}, it is a deleted version",
                revision,
                self.full_id(id)
            )));
        }
        let content = self.require(id, Some(revision)).await?;
        tracing::info!("Restoring {} to revision {}", self.full_id(id), revision);
        self.update(id, content, author).await
    }

    async fn versions(&self, id: u64) -> Result<Vec<VersionInfo>> {
        Ok(self
            .history(id)
            .await?
            .into_iter()
            .map(|tracked| tracked.info)
            .collect())
    }

    async fn last_modified(&self, id: u64, revision: Option<u64>) -> Result<DateTime<Utc>> {
        let history = self.history(id).await?;
        let Some(latest) = history.last() else {
            return Err(StoreError::not_found(format!(
                "{} does not exist in store",
                self.full_id(id)
            )));
        };
        match revision {
            None => Ok(latest.info.date),
            Some(0) => Err(StoreError::usage("Revision must be >= 1")),
            Some(rev) => history
                .get(rev as usize - 1)
                .map(|v| v.info.date)
                .ok_or_else(|| {
                    StoreError::not_found(format!(
                        "Revision {} of {} not found, last revision is {}",
                        rev,
                        self.full_id(id),
                        latest.info.revision
                    ))
                }),
        }
    }

    async fn set_last_modified(&self, id: u64, date: DateTime<Utc>) -> Result<()> {
        self.content.set_last_modified(id, date).await
    }

    async fn is_up_to_date(&self, id: u64) -> Result<bool> {
        check_id(id)?;
        if !self.content.exists(id).await? {
            return Ok(false);
        }
        let history = self.history(id).await?;
        let Some(latest) = history.last() else {
            return Ok(false);
        };
        if latest.info.state == VersionState::Deleted {
            return Ok(false);
        }
        let local = self.content.read(id).await?;
        let committed = self
            .log
            .fetch(&self.log_path(id)?, latest.backend_revision)
            .await?;
        Ok(local.data() == &committed)
    }

    async fn verify(&self, progress: Option<&ProgressFn>) -> Result<VerifyReport> {
        let report = self.log.verify(progress).await.map_err(|e| {
            StoreError::persistence(
                format!(
                    "Revision log of store {} contains errors and could not be verified",
                    self.config.id
                ),
                e,
            )
        })?;
        let objects = self.check_consistency(progress).await?;
        tracing::info!(
            "Verified store {}: {} revisions, {} objects",
            self.config.id,
            report.revisions,
            objects
        );
        Ok(VerifyReport { objects, ..report })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HistoryConfig;
    use tempfile::TempDir;

    async fn open(tmp: &TempDir) -> VersionedStore {
        let config = StoreConfig::new("doc", tmp.path().join("data"))
            .with_history(HistoryConfig::new(tmp.path().join("svn")));
        VersionedStore::open(config).await.unwrap()
    }

    #[tokio::test]
    async fn test_log_path() {
        let tmp = TempDir::new().unwrap();
        let store = open(&tmp).await;
        assert_eq!(store.log_path(42).unwrap(), "/0000/00/doc_00000042.xml");
        assert_eq!(store.id_from_log_path("/0000/00/doc_00000042.xml"), Some(42));
        assert_eq!(store.id_from_log_path("/0000/00/other.xml"), None);
    }

    #[tokio::test]
    async fn test_missing_author_is_rejected() {
        let tmp = TempDir::new().unwrap();
        let store = open(&tmp).await;
        let err = store.create(1, Content::from("<a/>"), " ").await.unwrap_err();
        assert!(matches!(err, StoreError::Configuration(_)));
        assert!(!store.exists(1).await.unwrap());
    }

    #[tokio::test]
    async fn test_committer_override() {
        let tmp = TempDir::new().unwrap();
        let config = StoreConfig::new("doc", tmp.path().join("data"))
            .with_committer("robot")
            .with_history(HistoryConfig::new(tmp.path().join("svn")));
        let store = VersionedStore::open(config).await.unwrap();
        store.create(1, Content::from("<a/>"), "").await.unwrap();
        assert_eq!(store.versions(1).await.unwrap()[0].author, "robot");
    }

    #[tokio::test]
    async fn test_commit_aligns_file_time() {
        let tmp = TempDir::new().unwrap();
        let store = open(&tmp).await;
        store.create(5, Content::from("<a/>"), "u").await.unwrap();
        let version = store.versions(5).await.unwrap().pop().unwrap();
        let local = store.content.last_modified(5).await.unwrap();
        assert_eq!(local.timestamp_millis(), version.date.timestamp_millis());
    }

    #[tokio::test]
    async fn test_ids_seeded_from_history() {
        let tmp = TempDir::new().unwrap();
        {
            let store = open(&tmp).await;
            store.create(30, Content::from("<a/>"), "u").await.unwrap();
            store.delete(30, "u").await.unwrap();
        }
        let store = open(&tmp).await;
        assert_eq!(store.next_free_id().await.unwrap(), 31);
        assert!(store.exists(30).await.unwrap());
        assert!(store.list_ids().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_refresh_local_cache() {
        let tmp = TempDir::new().unwrap();
        let store = open(&tmp).await;
        store.create(1, Content::from("<a/>"), "u").await.unwrap();
        store.create(2, Content::from("<b/>"), "u").await.unwrap();
        store.update(2, Content::from("<b>2</b>"), "u").await.unwrap();
        store.create(3, Content::from("<c/>"), "u").await.unwrap();
        store.delete(3, "u").await.unwrap();

        std::fs::remove_dir_all(tmp.path().join("data")).unwrap();
        assert_eq!(store.refresh_local_cache().await.unwrap(), 2);
        assert_eq!(store.content.read(2).await.unwrap().as_text(), "<b>2</b>");
        assert!(!store.content.exists(3).await.unwrap());
        assert!(store.is_up_to_date(1).await.unwrap());
    }
}
