//! mdstore Core Library
//!
//! Versioned storage of metadata documents:
//! - Slot path layout mapping numeric ids to a directory hierarchy
//! - Filesystem content store holding the current bytes of each object
//! - Revision log abstraction and a disk-persistent implementation
//! - Versioned store composing both, with per-object version history
//! - Store handles, per-object handles and version records

pub mod config;
pub mod content;
pub mod content_store;
pub mod disk_log;
pub mod error;
pub mod handle;
pub mod ids;
pub mod object;
pub mod revision_log;
pub mod slot;
pub mod store;
pub mod version;
pub mod versioned;

pub use config::{HistoryConfig, StoreConfig};
pub use content::{Content, ContentBackend};
pub use content_store::{FsContentStore, LocalStore};
pub use disk_log::DiskRevisionLog;
pub use error::{BoxError, Result, StoreError};
pub use handle::{MetadataHandle, Snapshot};
pub use ids::IdAllocator;
pub use object::ObjectId;
pub use revision_log::{
    ChangeKind, ChangeRecord, CommitInfo, CommitRequest, LogEntry, ProgressFn, RevisionLog,
    VerifyPhase, VerifyProgress, VerifyReport,
};
pub use slot::SlotLayout;
pub use store::{MetadataStore, Store};
pub use version::{VersionInfo, VersionRecord, VersionState};
pub use versioned::VersionedStore;
