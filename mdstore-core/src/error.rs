//! Error taxonomy shared by every store layer

/// Boxed cause carried by persistence and validation errors
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Result type for store operations
pub type Result<T> = std::result::Result<T, StoreError>;

/// Errors that can occur during store operations
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The id (or revision) is unknown to the backend that was asked
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Already exists: {0}")]
    AlreadyExists(String),

    /// The caller violated the contract for the object's current state
    #[error("Usage error: {0}")]
    Usage(String),

    /// Structured content enforcement rejected the payload before any write
    #[error("Validation failed: {message}")]
    Validation {
        message: String,
        #[source]
        source: Option<BoxError>,
    },

    /// Local I/O or revision log failure
    #[error("Persistence error: {message}")]
    Persistence {
        message: String,
        #[source]
        source: Option<BoxError>,
    },

    #[error("Configuration error: {0}")]
    Configuration(String),
}

impl StoreError {
    pub fn not_found(message: impl Into<String>) -> Self {
        Self::NotFound(message.into())
    }

    pub fn usage(message: impl Into<String>) -> Self {
        Self::Usage(message.into())
    }

    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration(message.into())
    }

    /// Persistence error chaining the underlying cause
    pub fn persistence<E>(message: impl Into<String>, source: E) -> Self
    where
        E: Into<BoxError>,
    {
        Self::Persistence {
            message: message.into(),
            source: Some(source.into()),
        }
    }

    /// Persistence error detected by the store itself (no lower-level cause)
    pub fn inconsistent(message: impl Into<String>) -> Self {
        Self::Persistence {
            message: message.into(),
            source: None,
        }
    }

    pub fn validation<E>(message: impl Into<String>, source: E) -> Self
    where
        E: Into<BoxError>,
    {
        Self::Validation {
            message: message.into(),
            source: Some(source.into()),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    pub fn is_usage(&self) -> bool {
        matches!(self, Self::Usage(_))
    }

    pub fn is_persistence(&self) -> bool {
        matches!(self, Self::Persistence { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error;

    #[test]
    fn test_persistence_chains_cause() {
        let io = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "read-only");
        let err = StoreError::persistence("Failed to create doc_00000001", io);
        assert!(err.is_persistence());
        let cause = err.source().expect("cause must be kept");
        assert_eq!(cause.to_string(), "read-only");
    }

    #[test]
    fn test_display() {
        let err = StoreError::usage("ID 0 must be >= 1");
        assert_eq!(err.to_string(), "Usage error: ID 0 must be >= 1");
        assert!(err.is_usage());
        assert!(!err.is_not_found());
    }
}
