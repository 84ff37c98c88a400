//! Content-addressed blob identifiers used by the disk revision log

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// SHA-256 of a blob's raw (uncompressed) bytes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ObjectId([u8; 32]);

impl ObjectId {
    pub fn new(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Compute ObjectId from data
    pub fn from_data(data: &[u8]) -> Self {
        let hash = Sha256::digest(data);
        Self(hash.into())
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Parse from hexadecimal string
    pub fn from_hex(hex_str: &str) -> Result<Self, hex::FromHexError> {
        let bytes = hex::decode(hex_str)?;
        if bytes.len() != 32 {
            return Err(hex::FromHexError::InvalidStringLength);
        }
        let mut arr = [0u8; 32];
        arr.copy_from_slice(&bytes);
        Ok(Self(arr))
    }

    /// Whether `data` hashes to this id
    pub fn matches(&self, data: &[u8]) -> bool {
        Self::from_data(data) == *self
    }
}

impl std::fmt::Display for ObjectId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_object_id_hex() {
        let id = ObjectId::from_data(b"<root/>");
        let hex = id.to_hex();
        assert_eq!(hex.len(), 64);
        assert_eq!(ObjectId::from_hex(&hex).unwrap(), id);
        assert!(ObjectId::from_hex("abcd").is_err());
    }

    #[test]
    fn test_matches() {
        let id = ObjectId::from_data(b"<root/>");
        assert!(id.matches(b"<root/>"));
        assert!(!id.matches(b"<root />"));
    }
}
