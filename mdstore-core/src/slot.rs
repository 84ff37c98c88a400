//! Slot path layout
//!
//! Maps a numeric object id to a hierarchy of fixed-width digit groups so a
//! store can hold millions of objects without huge directories. A layout of
//! `4-2-2` pads ids to eight digits; the first two groups become directories
//! and the file name carries the whole padded id:
//!
//! ```text
//! id 42  →  0000/00/document_00000042.xml
//! ```

use crate::error::{Result, StoreError};
use std::fmt;
use std::str::FromStr;

/// Largest total width; `u64::MAX` has 20 decimal digits
const MAX_TOTAL_WIDTH: usize = 20;

/// Digit-group widths, the last group being the leaf
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotLayout {
    widths: Vec<usize>,
    total: usize,
}

impl SlotLayout {
    pub fn new(widths: Vec<usize>) -> Result<Self> {
        if widths.is_empty() {
            return Err(StoreError::configuration("Slot layout has no digit groups"));
        }
        if widths.iter().any(|w| *w == 0) {
            return Err(StoreError::configuration(format!(
                "Slot layout {:?} contains a zero-width group",
                widths
            )));
        }
        let total: usize = widths.iter().sum();
        if total > MAX_TOTAL_WIDTH {
            return Err(StoreError::configuration(format!(
                "Slot layout {:?} is {} digits wide, at most {} are supported",
                widths, total, MAX_TOTAL_WIDTH
            )));
        }
        Ok(Self { widths, total })
    }

    pub fn widths(&self) -> &[usize] {
        &self.widths
    }

    /// Number of digits every id is padded to
    pub fn id_width(&self) -> usize {
        self.total
    }

    /// Largest id representable in this layout
    pub fn max_id(&self) -> u64 {
        if self.total >= MAX_TOTAL_WIDTH {
            u64::MAX
        } else {
            10u64.pow(self.total as u32) - 1
        }
    }

    /// Zero-pad an id to the layout width.
    ///
    /// An id that does not fit is a configuration problem of the store, not
    /// something a retry could fix.
    pub fn pad(&self, id: u64) -> Result<String> {
        let padded = format!("{:0width$}", id, width = self.total);
        if padded.len() > self.total {
            return Err(StoreError::configuration(format!(
                "ID {} does not fit into slot layout {} ({} digits)",
                id, self, self.total
            )));
        }
        Ok(padded)
    }

    /// Slice the padded id into one segment per digit group
    pub fn segments(&self, id: u64) -> Result<Vec<String>> {
        let padded = self.pad(id)?;
        let mut segments = Vec::with_capacity(self.widths.len());
        let mut offset = 0;
        for width in &self.widths {
            segments.push(padded[offset..offset + width].to_string());
            offset += width;
        }
        Ok(segments)
    }

    /// Directory segments followed by the file name for an id
    pub fn relative_path(&self, id: u64, prefix: &str, suffix: &str) -> Result<Vec<String>> {
        let padded = self.pad(id)?;
        let mut parts = self.segments(id)?;
        parts.pop();
        parts.push(format!("{}{}{}", prefix, padded, suffix));
        Ok(parts)
    }

    /// Parse an id back out of a slot file name
    pub fn id_from_file_name(&self, name: &str, prefix: &str, suffix: &str) -> Option<u64> {
        let digits = name.strip_prefix(prefix)?.strip_suffix(suffix)?;
        if digits.len() != self.total || !digits.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        digits.parse().ok()
    }

    /// Number of directory levels above the slot files
    pub fn depth(&self) -> usize {
        self.widths.len() - 1
    }
}

impl FromStr for SlotLayout {
    type Err = StoreError;

    fn from_str(text: &str) -> Result<Self> {
        let widths = text
            .split('-')
            .map(|part| {
                part.trim().parse::<usize>().map_err(|_| {
                    StoreError::configuration(format!("Invalid slot layout '{}'", text))
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Self::new(widths)
    }
}

impl fmt::Display for SlotLayout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self.widths.iter().map(|w| w.to_string()).collect();
        write!(f, "{}", parts.join("-"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_segments_two_two_two() {
        let layout = SlotLayout::new(vec![2, 2, 2]).unwrap();
        assert_eq!(layout.segments(42).unwrap(), vec!["00", "00", "42"]);
        assert_eq!(layout.segments(123456).unwrap(), vec!["12", "34", "56"]);
    }

    #[test]
    fn test_id_too_large_is_configuration_error() {
        let layout = SlotLayout::new(vec![2, 2, 2]).unwrap();
        let err = layout.segments(1_000_000).unwrap_err();
        assert!(matches!(err, StoreError::Configuration(_)));
        assert_eq!(layout.max_id(), 999_999);
    }

    #[test]
    fn test_parse_layout() {
        let layout: SlotLayout = "4-2-2".parse().unwrap();
        assert_eq!(layout.widths(), &[4, 2, 2]);
        assert_eq!(layout.id_width(), 8);
        assert_eq!(layout.to_string(), "4-2-2");

        assert!("".parse::<SlotLayout>().is_err());
        assert!("4-x-2".parse::<SlotLayout>().is_err());
        assert!("4-0-2".parse::<SlotLayout>().is_err());
        assert!("10-10-1".parse::<SlotLayout>().is_err());
    }

    #[test]
    fn test_relative_path_and_back() {
        let layout: SlotLayout = "4-2-2".parse().unwrap();
        let parts = layout.relative_path(42, "document_", ".xml").unwrap();
        assert_eq!(parts, vec!["0000", "00", "document_00000042.xml"]);
        assert_eq!(
            layout.id_from_file_name("document_00000042.xml", "document_", ".xml"),
            Some(42)
        );
        assert_eq!(layout.id_from_file_name("document_42.xml", "document_", ".xml"), None);
        assert_eq!(layout.id_from_file_name("other_00000042.xml", "document_", ".xml"), None);
        assert_eq!(layout.depth(), 2);
    }

    proptest! {
        #[test]
        fn prop_segments_reassemble_padded_id(id in 0u64..100_000_000) {
            let layout: SlotLayout = "4-2-2".parse().unwrap();
            let segments = layout.segments(id).unwrap();
            prop_assert_eq!(segments.len(), 3);
            prop_assert_eq!(segments.concat(), format!("{:08}", id));
        }

        #[test]
        fn prop_distinct_ids_get_distinct_paths(a in 1u64..1_000_000, b in 1u64..1_000_000) {
            prop_assume!(a != b);
            let layout: SlotLayout = "2-2-2".parse().unwrap();
            prop_assert_ne!(layout.segments(a).unwrap(), layout.segments(b).unwrap());
        }
    }
}
