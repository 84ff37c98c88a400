//! Store configuration
//!
//! One `StoreConfig` per document type. It is read once (usually from a JSON
//! file next to the data) and is immutable for the lifetime of the store.

use crate::error::{Result, StoreError};
use crate::slot::SlotLayout;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Configuration of a single metadata store
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Base identifier, e.g. `DocPortal_document`
    pub id: String,
    /// Directory holding the current content of every object
    pub base_dir: PathBuf,
    /// Document type tag attached to content read from the store
    #[serde(default)]
    pub doc_type: Option<String>,
    /// Digit-group widths, e.g. `4-2-2`
    #[serde(default = "default_slot_layout")]
    pub slot_layout: String,
    /// Reject payloads that are not well-formed XML
    #[serde(default = "default_true")]
    pub force_structured: bool,
    /// File name prefix; defaults to `{id}_`
    #[serde(default)]
    pub prefix: Option<String>,
    #[serde(default = "default_suffix")]
    pub suffix: String,
    /// Identity recorded on every commit instead of the caller's
    #[serde(default)]
    pub committer: Option<String>,
    /// Revision history; absent for a plain, unversioned store
    #[serde(default)]
    pub history: Option<HistoryConfig>,
}

/// Revision log settings of a versioned store
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryConfig {
    /// Location of the revision log repository
    pub repository: PathBuf,
    /// Set local file times to the commit timestamp after each commit.
    /// May fail under restrictive permissions; such failures are only logged.
    #[serde(default = "default_true")]
    pub sync_last_modified: bool,
    /// Number of directory scans kept by the revision log
    #[serde(default = "default_scan_cache")]
    pub scan_cache_capacity: usize,
}

fn default_slot_layout() -> String {
    "4-2-2".to_string()
}

fn default_true() -> bool {
    true
}

fn default_suffix() -> String {
    ".xml".to_string()
}

fn default_scan_cache() -> usize {
    256
}

impl HistoryConfig {
    pub fn new(repository: impl Into<PathBuf>) -> Self {
        Self {
            repository: repository.into(),
            sync_last_modified: true,
            scan_cache_capacity: default_scan_cache(),
        }
    }
}

impl StoreConfig {
    /// Unversioned store with default layout and XML enforcement
    pub fn new(id: impl Into<String>, base_dir: impl Into<PathBuf>) -> Self {
        Self {
            id: id.into(),
            base_dir: base_dir.into(),
            doc_type: None,
            slot_layout: default_slot_layout(),
            force_structured: true,
            prefix: None,
            suffix: default_suffix(),
            committer: None,
            history: None,
        }
    }

    pub fn with_history(mut self, history: HistoryConfig) -> Self {
        self.history = Some(history);
        self
    }

    pub fn with_slot_layout(mut self, layout: impl Into<String>) -> Self {
        self.slot_layout = layout.into();
        self
    }

    pub fn with_force_structured(mut self, force: bool) -> Self {
        self.force_structured = force;
        self
    }

    pub fn with_doc_type(mut self, doc_type: impl Into<String>) -> Self {
        self.doc_type = Some(doc_type.into());
        self
    }

    pub fn with_committer(mut self, committer: impl Into<String>) -> Self {
        self.committer = Some(committer.into());
        self
    }

    /// File name prefix in effect
    pub fn prefix(&self) -> String {
        self.prefix.clone().unwrap_or_else(|| format!("{}_", self.id))
    }

    /// Parse the configured layout
    pub fn layout(&self) -> Result<SlotLayout> {
        self.slot_layout.parse()
    }

    /// Fail fast on settings a store cannot run with
    pub fn validate(&self) -> Result<SlotLayout> {
        if self.id.trim().is_empty() {
            return Err(StoreError::configuration("Store id must not be empty"));
        }
        if let Some(committer) = &self.committer {
            if committer.trim().is_empty() {
                return Err(StoreError::configuration(format!(
                    "Committer override of store {} is empty",
                    self.id
                )));
            }
        }
        if let Some(history) = &self.history {
            if history.scan_cache_capacity == 0 {
                return Err(StoreError::configuration(format!(
                    "Scan cache capacity of store {} must be positive",
                    self.id
                )));
            }
        }
        self.layout()
    }

    /// Load a store configuration from a JSON file
    pub fn load(path: &Path) -> Result<Self> {
        let data = fs::read_to_string(path).map_err(|e| {
            StoreError::configuration(format!("Failed to read store config {:?}: {}", path, e))
        })?;
        let config: StoreConfig = serde_json::from_str(&data).map_err(|e| {
            StoreError::configuration(format!("Failed to parse store config {:?}: {}", path, e))
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Save the configuration as pretty JSON
    pub fn save(&self, path: &Path) -> Result<()> {
        let data = serde_json::to_string_pretty(self)
            .map_err(|e| StoreError::persistence("Failed to serialize store config", e))?;
        let tmp_path = path.with_extension("tmp");
        fs::write(&tmp_path, data)
            .and_then(|_| fs::rename(&tmp_path, path))
            .map_err(|e| StoreError::persistence(format!("Failed to write {:?}", path), e))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_defaults_from_minimal_json() {
        let json = r#"{ "id": "DocPortal_document", "base_dir": "/data/doc" }"#;
        let config: StoreConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.slot_layout, "4-2-2");
        assert!(config.force_structured);
        assert_eq!(config.suffix, ".xml");
        assert_eq!(config.prefix(), "DocPortal_document_");
        assert!(config.history.is_none());
    }

    #[test]
    fn test_history_defaults() {
        let json = r#"{
            "id": "doc",
            "base_dir": "/data/doc",
            "history": { "repository": "/data/svn" }
        }"#;
        let config: StoreConfig = serde_json::from_str(json).unwrap();
        let history = config.history.unwrap();
        assert!(history.sync_last_modified);
        assert_eq!(history.scan_cache_capacity, 256);
    }

    #[test]
    fn test_validate_rejects_bad_settings() {
        assert!(StoreConfig::new("", "/tmp/x").validate().is_err());
        assert!(StoreConfig::new("doc", "/tmp/x")
            .with_slot_layout("4-a")
            .validate()
            .is_err());
        assert!(StoreConfig::new("doc", "/tmp/x")
            .with_committer(" ")
            .validate()
            .is_err());
    }

    #[test]
    fn test_save_and_load() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("store.json");
        let config = StoreConfig::new("doc", tmp.path().join("data"))
            .with_doc_type("mods")
            .with_history(HistoryConfig::new(tmp.path().join("svn")));
        config.save(&path).unwrap();

        let loaded = StoreConfig::load(&path).unwrap();
        assert_eq!(loaded.id, "doc");
        assert_eq!(loaded.doc_type.as_deref(), Some("mods"));
        assert_eq!(
            loaded.history.unwrap().repository,
            tmp.path().join("svn")
        );
    }
}
