//! Document payloads and the local content backend interface

use crate::error::{Result, StoreError};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use quick_xml::events::Event;
use quick_xml::Reader;

/// A document payload.
///
/// The bytes are opaque to the store; `doc_type` and `last_modified` are
/// tags that travel with the payload when it is read back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Content {
    data: Bytes,
    doc_type: Option<String>,
    last_modified: Option<DateTime<Utc>>,
}

impl Content {
    pub fn new(data: impl Into<Bytes>) -> Self {
        Self {
            data: data.into(),
            doc_type: None,
            last_modified: None,
        }
    }

    pub fn with_doc_type(mut self, doc_type: Option<String>) -> Self {
        self.doc_type = doc_type;
        self
    }

    pub fn with_last_modified(mut self, date: DateTime<Utc>) -> Self {
        self.last_modified = Some(date);
        self
    }

    pub fn data(&self) -> &Bytes {
        &self.data
    }

    pub fn into_bytes(self) -> Bytes {
        self.data
    }

    pub fn doc_type(&self) -> Option<&str> {
        self.doc_type.as_deref()
    }

    pub fn last_modified(&self) -> Option<DateTime<Utc>> {
        self.last_modified
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Lossy UTF-8 view, mostly for logging and tests
    pub fn as_text(&self) -> String {
        String::from_utf8_lossy(&self.data).into_owned()
    }

    /// Name of the document's root element, if it is XML
    pub fn root_element(&self) -> Option<String> {
        let mut reader = Reader::from_reader(self.data.as_ref());
        let mut buf = Vec::new();
        loop {
            match reader.read_event_into(&mut buf) {
                Ok(Event::Start(e)) | Ok(Event::Empty(e)) => {
                    return Some(String::from_utf8_lossy(e.name().as_ref()).into_owned());
                }
                Ok(Event::Eof) | Err(_) => return None,
                _ => {}
            }
            buf.clear();
        }
    }

    /// Check the payload is well-formed XML with exactly one root element
    pub fn ensure_structured(&self) -> Result<()> {
        let mut reader = Reader::from_reader(self.data.as_ref());
        let mut buf = Vec::new();
        let mut depth = 0usize;
        let mut roots = 0usize;

        loop {
            let event = reader
                .read_event_into(&mut buf)
                .map_err(|e| StoreError::validation("Content failed to parse as XML", e))?;
            match event {
                Event::Start(_) => {
                    if depth == 0 {
                        roots += 1;
                    }
                    depth += 1;
                }
                Event::End(_) => {
                    depth = depth.saturating_sub(1);
                }
                Event::Empty(_) => {
                    if depth == 0 {
                        roots += 1;
                    }
                }
                Event::Text(text) if depth == 0 => {
                    if !text.iter().all(u8::is_ascii_whitespace) {
                        return Err(invalid("text outside of the root element"));
                    }
                }
                Event::CData(_) if depth == 0 => {
                    return Err(invalid("CDATA outside of the root element"));
                }
                Event::Eof => break,
                _ => {}
            }
            buf.clear();
        }

        if depth != 0 {
            return Err(invalid("unclosed element at end of document"));
        }
        match roots {
            1 => Ok(()),
            0 => Err(invalid("document has no root element")),
            n => Err(invalid(&format!("document has {} root elements", n))),
        }
    }
}

fn invalid(reason: &str) -> StoreError {
    StoreError::Validation {
        message: format!("Content failed to parse as XML: {}", reason),
        source: None,
    }
}

impl From<&'static str> for Content {
    fn from(s: &'static str) -> Self {
        Content::new(Bytes::from_static(s.as_bytes()))
    }
}

impl From<Vec<u8>> for Content {
    fn from(v: Vec<u8>) -> Self {
        Content::new(v)
    }
}

impl From<String> for Content {
    fn from(s: String) -> Self {
        Content::new(s.into_bytes())
    }
}

/// Local storage of the current content of each object.
///
/// Implementations know nothing about history. Writes to the same id are
/// not serialized by the backend itself.
#[async_trait]
pub trait ContentBackend: Send + Sync {
    /// Store new content; fails with `AlreadyExists` if the id is present
    async fn create(&self, id: u64, content: &Content) -> Result<()>;

    async fn read(&self, id: u64) -> Result<Content>;

    /// Overwrite existing content; fails with `NotFound` if absent
    async fn update(&self, id: u64, content: &Content) -> Result<()>;

    async fn delete(&self, id: u64) -> Result<()>;

    async fn exists(&self, id: u64) -> Result<bool>;

    async fn last_modified(&self, id: u64) -> Result<DateTime<Utc>>;

    async fn set_last_modified(&self, id: u64, date: DateTime<Utc>) -> Result<()>;

    /// All ids with current content, ascending
    async fn list_ids(&self) -> Result<Vec<u64>>;

    /// Highest id with current content, 0 for an empty store
    async fn highest_stored_id(&self) -> Result<u64>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_structured_accepts_documents() {
        assert!(Content::from("<root/>").ensure_structured().is_ok());
        assert!(Content::from("<root><x/></root>").ensure_structured().is_ok());
        assert!(
            Content::from("<?xml version=\"1.0\"?>\n<!-- c -->\n<root a=\"1\">t</root>\n")
                .ensure_structured()
                .is_ok()
        );
    }

    #[test]
    fn test_structured_rejects_garbage() {
        for bad in ["", "plain text", "<a><b></a>", "<a/><b/>", "<a>", "x<a/>"] {
            let err = Content::from(bad).ensure_structured().unwrap_err();
            assert!(
                matches!(err, StoreError::Validation { .. }),
                "expected validation error for {:?}",
                bad
            );
        }
    }

    #[test]
    fn test_root_element() {
        assert_eq!(Content::from("<bingo/>").root_element().as_deref(), Some("bingo"));
        assert_eq!(Content::from("<?xml version=\"1.0\"?><bango>x</bango>").root_element().as_deref(), Some("bango"));
        assert_eq!(Content::from("binary").root_element(), None);
    }
}
