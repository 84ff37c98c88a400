//! Filesystem content store
//!
//! Keeps the current bytes of every object in one file per id, placed by
//! the slot layout below the store's base directory.

use crate::config::StoreConfig;
use crate::content::{Content, ContentBackend};
use crate::disk_log::write_atomic;
use crate::error::{Result, StoreError};
use crate::ids::IdAllocator;
use crate::revision_log::{ProgressFn, VerifyReport};
use crate::slot::SlotLayout;
use crate::store::{check_id, MetadataStore};
use crate::version::{VersionInfo, VersionState};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tokio::sync::RwLock;

/// Local content of a store, one file per object.
///
/// Writes are placed atomically, but concurrent writers to the same id are
/// not coordinated: the last write wins.
pub struct FsContentStore {
    config: StoreConfig,
    layout: SlotLayout,
    prefix: String,
}

impl FsContentStore {
    pub fn open(config: StoreConfig) -> Result<Self> {
        let layout = config.validate()?;
        fs::create_dir_all(&config.base_dir).map_err(|e| {
            StoreError::persistence(
                format!("Failed to create base directory {:?}", config.base_dir),
                e,
            )
        })?;
        let prefix = config.prefix();
        Ok(Self {
            config,
            layout,
            prefix,
        })
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    pub fn layout(&self) -> &SlotLayout {
        &self.layout
    }

    pub fn base_dir(&self) -> &Path {
        &self.config.base_dir
    }

    /// Absolute location of an object's file
    pub fn slot_path(&self, id: u64) -> Result<PathBuf> {
        let parts = self
            .layout
            .relative_path(id, &self.prefix, &self.config.suffix)?;
        let mut path = self.config.base_dir.clone();
        path.extend(parts);
        Ok(path)
    }

    fn full_id(&self, id: u64) -> String {
        match self.layout.pad(id) {
            Ok(padded) => format!("{}_{}", self.config.id, padded),
            Err(_) => format!("{}_{}", self.config.id, id),
        }
    }

    fn prepare(&self, id: u64, content: &Content) -> Result<PathBuf> {
        check_id(id)?;
        if self.config.force_structured {
            content.ensure_structured()?;
        }
        self.slot_path(id)
    }

    fn parse_file_name(&self, name: &str) -> Option<u64> {
        self.layout
            .id_from_file_name(name, &self.prefix, &self.config.suffix)
    }

    /// Entry names of a directory, highest first; empty if it does not exist
    fn sorted_names(dir: &Path) -> io::Result<Vec<(String, bool)>> {
        let mut names = Vec::new();
        let entries = match fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(names),
            Err(e) => return Err(e),
        };
        for entry in entries {
            let entry = entry?;
            let is_dir = entry.file_type()?.is_dir();
            names.push((entry.file_name().to_string_lossy().into_owned(), is_dir));
        }
        names.sort_unstable_by(|a, b| b.0.cmp(&a.0));
        Ok(names)
    }

    fn is_slot_dir(&self, name: &str, level: usize) -> bool {
        name.len() == self.layout.widths()[level] && name.bytes().all(|b| b.is_ascii_digit())
    }

    fn highest_in(&self, dir: &Path, level: usize) -> io::Result<Option<u64>> {
        let names = Self::sorted_names(dir)?;
        if level == self.layout.depth() {
            return Ok(names
                .iter()
                .filter(|(_, is_dir)| !is_dir)
                .find_map(|(name, _)| self.parse_file_name(name)));
        }
        for (name, is_dir) in names {
            if is_dir && self.is_slot_dir(&name, level) {
                if let Some(id) = self.highest_in(&dir.join(&name), level + 1)? {
                    return Ok(Some(id));
                }
            }
        }
        Ok(None)
    }

    fn collect_ids(&self, dir: &Path, level: usize, ids: &mut Vec<u64>) -> io::Result<()> {
        for (name, is_dir) in Self::sorted_names(dir)? {
            if level == self.layout.depth() {
                if !is_dir {
                    ids.extend(self.parse_file_name(&name));
                }
            } else if is_dir && self.is_slot_dir(&name, level) {
                self.collect_ids(&dir.join(&name), level + 1, ids)?;
            }
        }
        Ok(())
    }

    /// Remove slot directories left empty by a delete
    fn prune_empty_dirs(&self, file: &Path) {
        let mut dir = file.parent();
        while let Some(current) = dir {
            if current == self.config.base_dir || !current.starts_with(&self.config.base_dir) {
                break;
            }
            // fails on non-empty directories, which ends the walk
            if fs::remove_dir(current).is_err() {
                break;
            }
            dir = current.parent();
        }
    }

    pub(crate) fn highest_stored_id_sync(&self) -> Result<u64> {
        self.highest_in(&self.config.base_dir, 0)
            .map(|id| id.unwrap_or(0))
            .map_err(|e| {
                StoreError::persistence(
                    format!("Failed to scan {:?} for stored ids", self.config.base_dir),
                    e,
                )
            })
    }
}

#[async_trait]
impl ContentBackend for FsContentStore {
    async fn create(&self, id: u64, content: &Content) -> Result<()> {
        let path = self.prepare(id, content)?;
        if path.exists() {
            return Err(StoreError::AlreadyExists(format!(
                "{} already exists in store",
                self.full_id(id)
            )));
        }
        write_atomic(&path, content.data()).map_err(|e| {
            StoreError::persistence(format!("Failed to create {}", self.full_id(id)), e)
        })?;
        tracing::debug!("Created {} at {:?}", self.full_id(id), path);
        Ok(())
    }

    async fn read(&self, id: u64) -> Result<Content> {
        check_id(id)?;
        let path = self.slot_path(id)?;
        let data = match fs::read(&path) {
            Ok(data) => data,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(StoreError::not_found(format!(
                    "{} does not exist in store",
                    self.full_id(id)
                )));
            }
            Err(e) => {
                return Err(StoreError::persistence(
                    format!("Failed to read {}", self.full_id(id)),
                    e,
                ));
            }
        };
        let mut content = Content::new(data).with_doc_type(self.config.doc_type.clone());
        if let Ok(modified) = fs::metadata(&path).and_then(|m| m.modified()) {
            content = content.with_last_modified(DateTime::<Utc>::from(modified));
        }
        Ok(content)
    }

    async fn update(&self, id: u64, content: &Content) -> Result<()> {
        let path = self.prepare(id, content)?;
        if !path.exists() {
            return Err(StoreError::not_found(format!(
                "{} does not exist in store",
                self.full_id(id)
            )));
        }
        write_atomic(&path, content.data()).map_err(|e| {
            StoreError::persistence(format!("Failed to update {}", self.full_id(id)), e)
        })?;
        tracing::debug!("Updated {}", self.full_id(id));
        Ok(())
    }

    async fn delete(&self, id: u64) -> Result<()> {
        check_id(id)?;
        let path = self.slot_path(id)?;
        if !path.exists() {
            return Err(StoreError::not_found(format!(
                "{} does not exist in store",
                self.full_id(id)
            )));
        }
        fs::remove_file(&path).map_err(|e| {
            StoreError::persistence(format!("Failed to delete {}", self.full_id(id)), e)
        })?;
        if path.exists() {
            return Err(StoreError::inconsistent(format!(
                "Deleted {} still exists in store",
                self.full_id(id)
            )));
        }
        self.prune_empty_dirs(&path);
        tracing::debug!("Deleted {}", self.full_id(id));
        Ok(())
    }

    async fn exists(&self, id: u64) -> Result<bool> {
        check_id(id)?;
        Ok(self.slot_path(id)?.is_file())
    }

    async fn last_modified(&self, id: u64) -> Result<DateTime<Utc>> {
        check_id(id)?;
        let path = self.slot_path(id)?;
        match fs::metadata(&path).and_then(|m| m.modified()) {
            Ok(modified) => Ok(DateTime::<Utc>::from(modified)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Err(StoreError::not_found(format!(
                "{} does not exist in store",
                self.full_id(id)
            ))),
            Err(e) => Err(StoreError::persistence(
                format!("Failed to read file time of {}", self.full_id(id)),
                e,
            )),
        }
    }

    async fn set_last_modified(&self, id: u64, date: DateTime<Utc>) -> Result<()> {
        check_id(id)?;
        let path = self.slot_path(id)?;
        if !path.is_file() {
            return Err(StoreError::not_found(format!(
                "{} does not exist in store",
                self.full_id(id)
            )));
        }
        fs::File::options()
            .write(true)
            .open(&path)
            .and_then(|file| file.set_modified(SystemTime::from(date)))
            .map_err(|e| {
                StoreError::persistence(
                    format!("Failed to set file time of {}", self.full_id(id)),
                    e,
                )
            })
    }

    async fn list_ids(&self) -> Result<Vec<u64>> {
        let mut ids = Vec::new();
        self.collect_ids(&self.config.base_dir, 0, &mut ids)
            .map_err(|e| {
                StoreError::persistence(
                    format!("Failed to list ids below {:?}", self.config.base_dir),
                    e,
                )
            })?;
        ids.sort_unstable();
        Ok(ids)
    }

    async fn highest_stored_id(&self) -> Result<u64> {
        self.highest_stored_id_sync()
    }
}

/// Unversioned metadata store.
///
/// Every object has exactly one version: revision 1, dated with the file's
/// modification time. Authors are only remembered for the lifetime of the
/// process.
pub struct LocalStore {
    content: FsContentStore,
    ids: IdAllocator,
    last_writers: RwLock<HashMap<u64, String>>,
}

impl LocalStore {
    pub fn open(config: StoreConfig) -> Result<Self> {
        let content = FsContentStore::open(config)?;
        let ids = IdAllocator::new(content.highest_stored_id_sync()?);
        tracing::info!(
            "Opened unversioned store {} at {:?}",
            content.config.id,
            content.base_dir()
        );
        Ok(Self {
            content,
            ids,
            last_writers: RwLock::new(HashMap::new()),
        })
    }

    pub fn content(&self) -> &FsContentStore {
        &self.content
    }

    async fn remember_writer(&self, id: u64, author: &str) {
        let author = if author.trim().is_empty() {
            "unknown"
        } else {
            author
        };
        self.last_writers.write().await.insert(id, author.to_string());
    }

    fn only_revision(&self, id: u64, revision: Option<u64>) -> Result<()> {
        match revision {
            None | Some(1) => Ok(()),
            Some(0) => Err(StoreError::usage("Revision must be >= 1")),
            Some(rev) => Err(StoreError::not_found(format!(
                "Revision {} of {} not found, an unversioned store only keeps revision 1",
                rev,
                self.full_id(id)
            ))),
        }
    }
}

#[async_trait]
impl MetadataStore for LocalStore {
    fn config(&self) -> &StoreConfig {
        &self.content.config
    }

    fn layout(&self) -> &SlotLayout {
        &self.content.layout
    }

    async fn next_free_id(&self) -> Result<u64> {
        let highest = self.content.highest_stored_id().await?;
        let max = self.content.layout.max_id();
        self.ids.next(highest, max).ok_or_else(|| {
            StoreError::configuration(format!(
                "Store {} has no free id left, slot layout {} ends at {}",
                self.config().id,
                self.content.layout,
                max
            ))
        })
    }

    async fn exists(&self, id: u64) -> Result<bool> {
        self.content.exists(id).await
    }

    async fn list_ids(&self) -> Result<Vec<u64>> {
        self.content.list_ids().await
    }

    async fn create(&self, id: u64, content: Content, author: &str) -> Result<()> {
        self.content.create(id, &content).await?;
        self.ids.observe(id);
        self.remember_writer(id, author).await;
        Ok(())
    }

    async fn read(&self, id: u64, revision: Option<u64>) -> Result<Option<Content>> {
        self.only_revision(id, revision)?;
        self.content.read(id).await.map(Some)
    }

    async fn update(&self, id: u64, content: Content, author: &str) -> Result<()> {
        self.content.update(id, &content).await?;
        self.remember_writer(id, author).await;
        Ok(())
    }

    async fn delete(&self, id: u64, _author: &str) -> Result<()> {
        self.content.delete(id).await?;
        self.last_writers.write().await.remove(&id);
        Ok(())
    }

    async fn versions(&self, id: u64) -> Result<Vec<VersionInfo>> {
        if !self.content.exists(id).await? {
            return Ok(Vec::new());
        }
        let date = self.content.last_modified(id).await?;
        let author = self
            .last_writers
            .read()
            .await
            .get(&id)
            .cloned()
            .unwrap_or_else(|| "unknown".to_string());
        Ok(vec![VersionInfo {
            revision: 1,
            author,
            date,
            state: VersionState::Created,
        }])
    }

    async fn last_modified(&self, id: u64, revision: Option<u64>) -> Result<DateTime<Utc>> {
        self.only_revision(id, revision)?;
        self.content.last_modified(id).await
    }

    async fn set_last_modified(&self, id: u64, date: DateTime<Utc>) -> Result<()> {
        self.content.set_last_modified(id, date).await
    }

    async fn is_up_to_date(&self, id: u64) -> Result<bool> {
        Err(StoreError::usage(format!(
            "Store {} keeps no history to compare {} with",
            self.config().id,
            self.full_id(id)
        )))
    }

    async fn verify(&self, _progress: Option<&ProgressFn>) -> Result<VerifyReport> {
        Err(StoreError::usage(format!(
            "Store {} does not support integrity verification",
            self.config().id
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn open(tmp: &TempDir) -> FsContentStore {
        let config = StoreConfig::new("doc", tmp.path().join("data")).with_slot_layout("2-2-2");
        FsContentStore::open(config).unwrap()
    }

    #[tokio::test]
    async fn test_create_read_update() {
        let tmp = TempDir::new().unwrap();
        let store = open(&tmp);

        store.create(42, &Content::from("<root/>")).await.unwrap();
        assert_eq!(
            store.slot_path(42).unwrap(),
            tmp.path().join("data").join("00").join("00").join("doc_000042.xml")
        );
        assert_eq!(store.read(42).await.unwrap().data().as_ref(), b"<root/>");

        let err = store.create(42, &Content::from("<root/>")).await.unwrap_err();
        assert!(matches!(err, StoreError::AlreadyExists(_)));

        store.update(42, &Content::from("<root><x/></root>")).await.unwrap();
        assert_eq!(store.read(42).await.unwrap().as_text(), "<root><x/></root>");
    }

    #[tokio::test]
    async fn test_missing_ids() {
        let tmp = TempDir::new().unwrap();
        let store = open(&tmp);
        assert!(!store.exists(7).await.unwrap());
        assert!(store.read(7).await.unwrap_err().is_not_found());
        assert!(store.update(7, &Content::from("<a/>")).await.unwrap_err().is_not_found());
        assert!(store.delete(7).await.unwrap_err().is_not_found());
        assert!(store.exists(0).await.unwrap_err().is_usage());
    }

    #[tokio::test]
    async fn test_structured_content_is_validated_before_write() {
        let tmp = TempDir::new().unwrap();
        let store = open(&tmp);
        let err = store.create(1, &Content::from("not xml")).await.unwrap_err();
        assert!(matches!(err, StoreError::Validation { .. }));
        assert!(!store.exists(1).await.unwrap());

        let config = StoreConfig::new("bin", tmp.path().join("bin")).with_force_structured(false);
        let raw = FsContentStore::open(config).unwrap();
        raw.create(1, &Content::from("not xml")).await.unwrap();
    }

    #[tokio::test]
    async fn test_delete_prunes_directories() {
        let tmp = TempDir::new().unwrap();
        let store = open(&tmp);
        store.create(123456, &Content::from("<a/>")).await.unwrap();
        store.create(42, &Content::from("<a/>")).await.unwrap();
        store.delete(123456).await.unwrap();
        assert!(!store.exists(123456).await.unwrap());
        assert!(!tmp.path().join("data").join("12").exists());
        assert!(tmp.path().join("data").join("00").join("00").exists());
    }

    #[tokio::test]
    async fn test_list_and_highest_ids() {
        let tmp = TempDir::new().unwrap();
        let store = open(&tmp);
        assert_eq!(store.highest_stored_id().await.unwrap(), 0);
        for id in [5, 123456, 42, 9901] {
            store.create(id, &Content::from("<a/>")).await.unwrap();
        }
        // foreign files are ignored
        fs::write(tmp.path().join("data").join("00").join("00").join("notes.txt"), "x").unwrap();

        assert_eq!(store.list_ids().await.unwrap(), vec![5, 42, 9901, 123456]);
        assert_eq!(store.highest_stored_id().await.unwrap(), 123456);
    }

    #[tokio::test]
    async fn test_set_last_modified() {
        let tmp = TempDir::new().unwrap();
        let store = open(&tmp);
        store.create(3, &Content::from("<a/>")).await.unwrap();
        let date = DateTime::from_timestamp(1_500_000_000, 0).unwrap();
        store.set_last_modified(3, date).await.unwrap();
        assert_eq!(store.last_modified(3).await.unwrap(), date);
        assert_eq!(store.read(3).await.unwrap().last_modified(), Some(date));
    }

    #[tokio::test]
    async fn test_local_store_history() {
        let tmp = TempDir::new().unwrap();
        let config = StoreConfig::new("doc", tmp.path().join("data")).with_doc_type("mods");
        let store = LocalStore::open(config).unwrap();

        assert!(store.versions(1).await.unwrap().is_empty());
        store.create(1, Content::from("<a/>"), "").await.unwrap();
        let versions = store.versions(1).await.unwrap();
        assert_eq!(versions.len(), 1);
        assert_eq!(versions[0].author, "unknown");
        assert_eq!(versions[0].state, VersionState::Created);

        store.update(1, Content::from("<b/>"), "carol").await.unwrap();
        assert_eq!(store.versions(1).await.unwrap()[0].author, "carol");

        let content = store.read(1, Some(1)).await.unwrap().unwrap();
        assert_eq!(content.doc_type(), Some("mods"));
        assert!(store.read(1, Some(2)).await.unwrap_err().is_not_found());

        assert!(store.verify(None).await.unwrap_err().is_usage());
        assert!(store.is_up_to_date(1).await.unwrap_err().is_usage());
    }

    #[tokio::test]
    async fn test_local_store_ids_are_not_reused() {
        let tmp = TempDir::new().unwrap();
        let store = LocalStore::open(StoreConfig::new("doc", tmp.path().join("data"))).unwrap();
        let first = store.next_free_id().await.unwrap();
        store.create(first, Content::from("<a/>"), "u").await.unwrap();
        let second = store.next_free_id().await.unwrap();
        store.create(second, Content::from("<a/>"), "u").await.unwrap();
        store.delete(second, "u").await.unwrap();
        let third = store.next_free_id().await.unwrap();
        assert!(first < second && second < third);
    }

    #[tokio::test]
    async fn test_local_store_ids_end_at_layout_limit() {
        let tmp = TempDir::new().unwrap();
        let config = StoreConfig::new("doc", tmp.path().join("data")).with_slot_layout("1");
        let store = LocalStore::open(config).unwrap();
        store.create(8, Content::from("<a/>"), "u").await.unwrap();
        assert_eq!(store.next_free_id().await.unwrap(), 9);
        let err = store.next_free_id().await.unwrap_err();
        assert!(matches!(err, StoreError::Configuration(_)));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_create_alongside_pruning_delete() {
        let tmp = TempDir::new().unwrap();
        let store = Arc::new(open(&tmp));

        // ids 1 and 2 share the slot directory 00/00
        let tasks: Vec<_> = [1u64, 2]
            .into_iter()
            .map(|id| {
                let store = store.clone();
                tokio::spawn(async move {
                    for _ in 0..200 {
                        store.create(id, &Content::from("<a/>")).await.unwrap();
                        store.delete(id).await.unwrap();
                    }
                })
            })
            .collect();
        for task in tasks {
            task.await.unwrap();
        }

        assert!(store.list_ids().await.unwrap().is_empty());
        assert!(!tmp.path().join("data").join("00").exists());
    }
}
