//! Disk-persistent revision log
//!
//! Every commit touches exactly one path. Blobs are content-addressed and
//! stored compressed, commit records are written once per revision and the
//! HEAD state of each path is kept in a sled database for O(log n) lookups.

use crate::error::{Result, StoreError};
use crate::object::ObjectId;
use crate::revision_log::{
    ChangeKind, CommitInfo, CommitRequest, LogEntry, ProgressFn, RevisionLog, VerifyPhase,
    VerifyProgress, VerifyReport, PROGRESS_BATCH,
};
use crate::version::VersionState;
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use lru::LruCache;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;

const ZSTD_LEVEL: i32 = 3;

/// One revision on disk
#[derive(Debug, Clone, Serialize, Deserialize)]
struct CommitRecord {
    revision: u64,
    author: String,
    message: String,
    timestamp_ms: i64,
    changes: Vec<PathChange>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct PathChange {
    path: String,
    kind: ChangeKind,
    /// Blob of the new content; `None` for deletes
    object: Option<ObjectId>,
}

/// sled value describing a path at HEAD
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
struct HeadRecord {
    revision: u64,
    object: Option<ObjectId>,
    live: bool,
}

impl HeadRecord {
    fn serialize(&self) -> Result<Vec<u8>> {
        bincode::serialize(self)
            .map_err(|e| StoreError::persistence("Failed to serialize head record", e))
    }

    fn deserialize(data: &[u8]) -> Result<Self> {
        bincode::deserialize(data)
            .map_err(|e| StoreError::persistence("Failed to deserialize head record", e))
    }
}

fn millis_to_date(ms: i64) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp_millis(ms)
        .ok_or_else(|| StoreError::inconsistent(format!("Commit timestamp {} is out of range", ms)))
}

/// Revision log kept in a local directory
///
/// Layout on disk:
/// ```text
/// {root}/
///   uuid                              repository UUID
///   refs/head                         latest revision number (text)
///   objects/{hash[0..2]}/{hash[2..]}  zstd-compressed blobs
///   revs/{rev}.bin                    commit records (bincode)
///   index.db/                         sled database of HEAD state per path
/// ```
pub struct DiskRevisionLog {
    root: PathBuf,
    uuid: String,
    head: AtomicU64,
    /// Serializes commits; holds the timestamp of the latest one
    commit_lock: Mutex<i64>,
    head_index: sled::Db,
    scan_cache: std::sync::Mutex<LruCache<String, Arc<Vec<LogEntry>>>>,
}

impl DiskRevisionLog {
    /// Open or create a revision log at the given path
    pub fn open(path: &Path, scan_cache_capacity: usize) -> Result<Self> {
        let root = path.to_path_buf();
        let io = |e: std::io::Error| {
            StoreError::persistence(format!("Failed to prepare revision log at {:?}", root), e)
        };

        fs::create_dir_all(root.join("objects")).map_err(io)?;
        fs::create_dir_all(root.join("revs")).map_err(io)?;
        fs::create_dir_all(root.join("refs")).map_err(io)?;

        let uuid_path = root.join("uuid");
        let uuid = if uuid_path.exists() {
            fs::read_to_string(&uuid_path).map_err(io)?.trim().to_string()
        } else {
            let u = uuid::Uuid::new_v4().to_string();
            fs::write(&uuid_path, &u).map_err(io)?;
            u
        };

        let head_path = root.join("refs").join("head");
        let head = if head_path.exists() {
            let text = fs::read_to_string(&head_path).map_err(io)?;
            text.trim().parse::<u64>().map_err(|e| {
                StoreError::persistence(format!("Corrupt head ref in {:?}", root), e)
            })?
        } else {
            0
        };

        let index_path = root.join("index.db");
        let head_index = sled::open(&index_path).map_err(|e| {
            StoreError::persistence(format!("Failed to open sled database at {:?}", index_path), e)
        })?;

        let capacity = NonZeroUsize::new(scan_cache_capacity).ok_or_else(|| {
            StoreError::configuration("Scan cache capacity must be positive")
        })?;

        let mut log = Self {
            root,
            uuid,
            head: AtomicU64::new(head),
            commit_lock: Mutex::new(0),
            head_index,
            scan_cache: std::sync::Mutex::new(LruCache::new(capacity)),
        };

        if head > 0 {
            let last = log.load_commit(head)?;
            *log.commit_lock.get_mut() = last.timestamp_ms;

            if log.head_index.is_empty() {
                let paths = log.rebuild_index(head)?;
                tracing::info!(
                    "Rebuilt HEAD index of {:?} from {} revisions ({} paths)",
                    log.root,
                    head,
                    paths
                );
            }
        }

        Ok(log)
    }

    pub fn uuid(&self) -> &str {
        &self.uuid
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    // ==================== Object Store ====================

    fn object_path(&self, id: &ObjectId) -> PathBuf {
        let hex = id.to_hex();
        self.root.join("objects").join(&hex[..2]).join(&hex[2..])
    }

    fn store_object(&self, data: &[u8]) -> Result<ObjectId> {
        let id = ObjectId::from_data(data);
        let path = self.object_path(&id);
        if path.exists() {
            return Ok(id);
        }
        let compressed = zstd::encode_all(data, ZSTD_LEVEL)
            .map_err(|e| StoreError::persistence(format!("Failed to compress blob {}", id), e))?;
        write_atomic(&path, &compressed)
            .map_err(|e| StoreError::persistence(format!("Failed to store blob {}", id), e))?;
        Ok(id)
    }

    fn load_object(&self, id: &ObjectId) -> Result<Bytes> {
        let path = self.object_path(id);
        let compressed = fs::read(&path).map_err(|e| {
            StoreError::persistence(format!("Blob {} not found at {:?}", id, path), e)
        })?;
        let data = zstd::decode_all(compressed.as_slice())
            .map_err(|e| StoreError::persistence(format!("Failed to decompress blob {}", id), e))?;
        if !id.matches(&data) {
            return Err(StoreError::inconsistent(format!(
                "Blob {} does not hash to its id",
                id
            )));
        }
        Ok(Bytes::from(data))
    }

    // ==================== Commit Store ====================

    fn commit_path(&self, rev: u64) -> PathBuf {
        self.root.join("revs").join(format!("{}.bin", rev))
    }

    fn store_commit(&self, record: &CommitRecord) -> Result<()> {
        let data = bincode::serialize(record).map_err(|e| {
            StoreError::persistence(format!("Failed to serialize r{}", record.revision), e)
        })?;
        write_atomic(&self.commit_path(record.revision), &data).map_err(|e| {
            StoreError::persistence(format!("Failed to write r{}", record.revision), e)
        })
    }

    fn load_commit(&self, rev: u64) -> Result<CommitRecord> {
        let path = self.commit_path(rev);
        let data = fs::read(&path)
            .map_err(|e| StoreError::persistence(format!("Commit r{} not found", rev), e))?;
        let record: CommitRecord = bincode::deserialize(&data)
            .map_err(|e| StoreError::persistence(format!("Commit r{} is unreadable", rev), e))?;
        if record.revision != rev {
            return Err(StoreError::inconsistent(format!(
                "Commit file of r{} holds r{}",
                rev, record.revision
            )));
        }
        Ok(record)
    }

    fn save_head(&self, rev: u64) -> Result<()> {
        let path = self.root.join("refs").join("head");
        write_atomic(&path, rev.to_string().as_bytes())
            .map_err(|e| StoreError::persistence(format!("Failed to advance head to r{}", rev), e))
    }

    // ==================== HEAD Index ====================

    fn head_get(&self, path: &str) -> Result<Option<HeadRecord>> {
        let value = self.head_index.get(path.as_bytes()).map_err(|e| {
            StoreError::persistence(format!("Failed to read HEAD entry of {}", path), e)
        })?;
        value.map(|v| HeadRecord::deserialize(&v)).transpose()
    }

    fn head_insert(&self, path: &str, record: &HeadRecord) -> Result<()> {
        self.head_index
            .insert(path.as_bytes(), record.serialize()?)
            .map_err(|e| {
                StoreError::persistence(format!("Failed to update HEAD entry of {}", path), e)
            })?;
        Ok(())
    }

    /// Replay every commit into a map of path → HEAD state
    fn replay(&self, head: u64) -> Result<BTreeMap<String, HeadRecord>> {
        let mut state = BTreeMap::new();
        for rev in 1..=head {
            let record = self.load_commit(rev)?;
            for change in record.changes {
                state.insert(
                    change.path,
                    HeadRecord {
                        revision: rev,
                        object: change.object,
                        live: change.kind != ChangeKind::Delete,
                    },
                );
            }
        }
        Ok(state)
    }

    fn rebuild_index(&self, head: u64) -> Result<usize> {
        let state = self.replay(head)?;
        for (path, record) in &state {
            self.head_insert(path, record)?;
        }
        self.head_index
            .flush()
            .map_err(|e| StoreError::persistence("Failed to flush HEAD index", e))?;
        Ok(state.len())
    }

    fn clear_scan_cache(&self) {
        self.scan_cache
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clear();
    }
}

const WRITE_ATTEMPTS: usize = 3;

/// Write via a temporary sibling and rename into place.
///
/// A concurrent delete may prune the parent directory between creating it
/// and writing the temporary file; that `NotFound` is retried.
pub(crate) fn write_atomic(path: &Path, data: &[u8]) -> std::io::Result<()> {
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let mut attempt = 1;
    loop {
        match write_once(path, &file_name, data) {
            Err(e) if e.kind() == std::io::ErrorKind::NotFound && attempt < WRITE_ATTEMPTS => {
                tracing::debug!("Parent of {:?} vanished during write, retrying", path);
                attempt += 1;
            }
            result => return result,
        }
    }
}

fn write_once(path: &Path, file_name: &str, data: &[u8]) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let tmp_path = path.with_file_name(format!(".{}.{}.tmp", file_name, uuid::Uuid::new_v4()));
    let result = fs::write(&tmp_path, data).and_then(|_| fs::rename(&tmp_path, path));
    if result.is_err() {
        let _ = fs::remove_file(&tmp_path);
    }
    result
}

#[async_trait]
impl RevisionLog for DiskRevisionLog {
    fn location(&self) -> String {
        self.root.display().to_string()
    }

    async fn latest_revision(&self) -> Result<u64> {
        Ok(self.head.load(Ordering::SeqCst))
    }

    async fn log(&self, dir: &str) -> Result<Vec<LogEntry>> {
        let dir = dir.trim_end_matches('/');
        {
            let mut cache = self
                .scan_cache
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            if let Some(hit) = cache.get(dir) {
                return Ok(hit.as_ref().clone());
            }
        }

        let head = self.head.load(Ordering::SeqCst);
        tracing::debug!("Scanning {} revisions of {:?} below {}/", head, self.root, dir);
        let prefix = format!("{}/", dir);
        let mut entries = Vec::new();
        for rev in 1..=head {
            let record = self.load_commit(rev)?;
            let changed_paths: BTreeMap<String, ChangeKind> = record
                .changes
                .iter()
                .filter(|c| c.path.starts_with(&prefix))
                .map(|c| (c.path.clone(), c.kind))
                .collect();
            if changed_paths.is_empty() {
                continue;
            }
            entries.push(LogEntry {
                revision: record.revision,
                author: record.author,
                timestamp: millis_to_date(record.timestamp_ms)?,
                message: record.message,
                changed_paths,
            });
        }

        // a commit that raced the scan makes the result stale; don't cache it
        if self.head.load(Ordering::SeqCst) == head {
            self.scan_cache
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .put(dir.to_string(), Arc::new(entries.clone()));
        }
        Ok(entries)
    }

    async fn fetch(&self, path: &str, revision: u64) -> Result<Bytes> {
        let head = self.head.load(Ordering::SeqCst);
        if revision == 0 || revision > head {
            return Err(StoreError::not_found(format!(
                "Revision r{} does not exist, latest is r{}",
                revision, head
            )));
        }
        for rev in (1..=revision).rev() {
            let record = self.load_commit(rev)?;
            if let Some(change) = record.changes.iter().find(|c| c.path == path) {
                return match change.object {
                    Some(id) if change.kind != ChangeKind::Delete => self.load_object(&id),
                    _ => Err(StoreError::not_found(format!(
                        "{} is deleted in r{}",
                        path, revision
                    ))),
                };
            }
        }
        Err(StoreError::not_found(format!(
            "{} does not exist in r{}",
            path, revision
        )))
    }

    async fn commit(&self, request: CommitRequest) -> Result<CommitInfo> {
        if !request.path.starts_with('/') {
            return Err(StoreError::usage(format!(
                "Log path {} must be absolute",
                request.path
            )));
        }
        if request.author.trim().is_empty() {
            return Err(StoreError::usage(format!(
                "Commit of {} has no author",
                request.path
            )));
        }

        let mut last_timestamp = self.commit_lock.lock().await;

        let live = self
            .head_get(&request.path)?
            .map(|h| h.live)
            .unwrap_or(false);
        let kind = match request.state {
            VersionState::Created => ChangeKind::Add,
            VersionState::Updated if live => ChangeKind::Modify,
            VersionState::Updated => ChangeKind::Replace,
            VersionState::Deleted if live => ChangeKind::Delete,
            VersionState::Deleted => {
                return Err(StoreError::not_found(format!(
                    "{} is not present at HEAD",
                    request.path
                )));
            }
        };

        let object = match kind {
            ChangeKind::Delete => None,
            _ => {
                let data = request.content.as_ref().ok_or_else(|| {
                    StoreError::usage(format!("Commit of {} carries no content", request.path))
                })?;
                Some(self.store_object(data)?)
            }
        };

        let revision = self.head.load(Ordering::SeqCst) + 1;
        let timestamp_ms = Utc::now().timestamp_millis().max(*last_timestamp + 1);
        let record = CommitRecord {
            revision,
            author: request.author,
            message: request.message,
            timestamp_ms,
            changes: vec![PathChange {
                path: request.path.clone(),
                kind,
                object,
            }],
        };

        self.store_commit(&record)?;
        self.head_insert(
            &request.path,
            &HeadRecord {
                revision,
                object,
                live: kind != ChangeKind::Delete,
            },
        )?;
        self.head_index
            .flush()
            .map_err(|e| StoreError::persistence("Failed to flush HEAD index", e))?;
        self.save_head(revision)?;

        self.head.store(revision, Ordering::SeqCst);
        *last_timestamp = timestamp_ms;
        self.clear_scan_cache();

        tracing::info!(
            "Committed r{} ({} {}) by {}",
            revision,
            kind.code(),
            request.path,
            record.author
        );

        Ok(CommitInfo {
            revision,
            timestamp: millis_to_date(timestamp_ms)?,
        })
    }

    async fn tracked_paths(&self) -> Result<Vec<String>> {
        let mut paths = Vec::new();
        for item in self.head_index.iter() {
            let (key, _) = item
                .map_err(|e| StoreError::persistence("Failed to iterate HEAD index", e))?;
            paths.push(String::from_utf8_lossy(&key).into_owned());
        }
        Ok(paths)
    }

    async fn verify(&self, progress: Option<&ProgressFn>) -> Result<VerifyReport> {
        let head = self.head.load(Ordering::SeqCst);
        if head == 0 {
            tracing::warn!("Revision log {:?} has no revisions, nothing to verify", self.root);
            return Ok(VerifyReport::default());
        }

        tracing::info!("Verifying revision log {:?} ({} revisions)", self.root, head);
        let mut problems: Vec<StoreError> = Vec::new();
        let mut checked: HashSet<ObjectId> = HashSet::new();
        let mut state: BTreeMap<String, HeadRecord> = BTreeMap::new();
        let mut previous_ms = i64::MIN;

        for rev in 1..=head {
            match self.load_commit(rev) {
                Ok(record) => {
                    if record.author.trim().is_empty() {
                        problems.push(StoreError::inconsistent(format!("r{} has no author", rev)));
                    }
                    if record.timestamp_ms <= previous_ms {
                        problems.push(StoreError::inconsistent(format!(
                            "r{} is not newer than its predecessor",
                            rev
                        )));
                    }
                    previous_ms = record.timestamp_ms;

                    for change in record.changes {
                        match (change.kind, change.object) {
                            (ChangeKind::Delete, _) => {}
                            (_, Some(id)) => {
                                if checked.insert(id) {
                                    if let Err(e) = self.load_object(&id) {
                                        problems.push(StoreError::persistence(
                                            format!("r{} {}: blob {} is damaged", rev, change.path, id),
                                            e,
                                        ));
                                    }
                                }
                            }
                            (_, None) => problems.push(StoreError::inconsistent(format!(
                                "r{} {}: change carries no blob",
                                rev, change.path
                            ))),
                        }
                        state.insert(
                            change.path,
                            HeadRecord {
                                revision: rev,
                                object: change.object,
                                live: change.kind != ChangeKind::Delete,
                            },
                        );
                    }
                }
                Err(e) => problems.push(e),
            }

            if rev % PROGRESS_BATCH == 0 || rev == head {
                tracing::info!("Verified r{}/{} ({}%)", rev, head, rev * 100 / head);
                if let Some(report) = progress {
                    report(VerifyProgress {
                        phase: VerifyPhase::Revisions,
                        done: rev,
                        total: head,
                    });
                }
            } else {
                tracing::debug!("Verified r{}", rev);
            }
        }

        for (path, expected) in &state {
            match self.head_get(path) {
                Ok(Some(actual)) if actual == *expected => {}
                Ok(_) => problems.push(StoreError::inconsistent(format!(
                    "HEAD index entry of {} disagrees with the commit history",
                    path
                ))),
                Err(e) => problems.push(e),
            }
        }

        if !problems.is_empty() {
            for problem in &problems {
                tracing::error!("{}", problem);
            }
            let count = problems.len();
            let first = problems.swap_remove(0);
            return Err(StoreError::persistence(
                format!(
                    "Revision log {:?} contains {} error(s) and could not be verified",
                    self.root, count
                ),
                first,
            ));
        }

        tracing::info!("Verified revision log {:?}", self.root);
        Ok(VerifyReport {
            revisions: head,
            blobs: checked.len() as u64,
            objects: 0,
        })
    }
}
