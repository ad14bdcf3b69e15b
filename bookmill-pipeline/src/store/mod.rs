//! Versioned artifact storage
//!
//! Every pipeline output is written as an immutable, numbered version per
//! (kind, item). Versions are dense from 1. A version's payload is either a
//! JSON document or a tombstone (`None`), which marks an intentionally empty
//! or pruned item.
//!
//! Most kinds live in the book database ([`VersionStore`]). Renderings are
//! kept as one JSON file per version ([`FileVersionChain`]) with their current
//! pointer in the database. [`ArtifactStore`] routes each call to the right one.

pub mod artifacts;
pub mod edit;
pub mod file_chain;
pub mod pointers;
pub mod versions;

pub use artifacts::ArtifactStore;
pub use edit::{FieldEdit, FieldPath, PathSegment};
pub use file_chain::FileVersionChain;
pub use versions::VersionStore;

use bookmill_common::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Version number; positive and dense per item
pub type Version = u32;

/// Payload of one version; `None` is a tombstone
pub type Payload = Option<serde_json::Value>;

/// Bounded number of allocate-and-insert attempts before giving up
pub(crate) const MAX_ALLOCATION_ATTEMPTS: usize = 5;

/// Named category of versioned output
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ArtifactKind {
    /// Raw text per page
    TextExtraction,
    /// Whole-book metadata, item `book`
    Metadata,
    /// Text groups per page
    TextClassification,
    /// One item per section, `<page>_<section>`
    Sectioning,
    /// Rendered section, file-backed
    Rendering,
}

impl ArtifactKind {
    pub const ALL: [ArtifactKind; 5] = [
        ArtifactKind::TextExtraction,
        ArtifactKind::Metadata,
        ArtifactKind::TextClassification,
        ArtifactKind::Sectioning,
        ArtifactKind::Rendering,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ArtifactKind::TextExtraction => "text-extraction",
            ArtifactKind::Metadata => "metadata",
            ArtifactKind::TextClassification => "text-classification",
            ArtifactKind::Sectioning => "sectioning",
            ArtifactKind::Rendering => "rendering",
        }
    }

    /// Kinds whose reads default to an explicit current version
    pub fn has_current_pointer(self) -> bool {
        matches!(self, ArtifactKind::TextExtraction | ArtifactKind::Rendering)
    }

    /// Kinds persisted as one file per version
    pub fn is_file_backed(self) -> bool {
        matches!(self, ArtifactKind::Rendering)
    }

    /// Kinds whose items are several per page and support composite page reads
    pub fn is_page_scoped(self) -> bool {
        matches!(self, ArtifactKind::Sectioning | ArtifactKind::Rendering)
    }

    pub(crate) fn require_current_pointer(self) -> Result<()> {
        if self.has_current_pointer() {
            Ok(())
        } else {
            Err(Error::InvalidInput(format!(
                "artifact kind '{}' has no current version",
                self
            )))
        }
    }

    pub(crate) fn require_page_scoped(self) -> Result<()> {
        if self.is_page_scoped() {
            Ok(())
        } else {
            Err(Error::InvalidInput(format!(
                "artifact kind '{}' has no page view",
                self
            )))
        }
    }
}

impl fmt::Display for ArtifactKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ArtifactKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        ArtifactKind::ALL
            .into_iter()
            .find(|k| k.as_str() == s)
            .ok_or_else(|| Error::InvalidInput(format!("unknown artifact kind '{}'", s)))
    }
}

/// A resolved read: which version was served and its payload
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VersionedPayload {
    pub version: Version,
    /// True when this is the kind's current version
    pub is_current: bool,
    pub data: Payload,
}

/// One item inside a page view
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PageItem {
    pub item_id: String,
    pub version: Version,
    pub data: serde_json::Value,
}

/// Read-only page view assembled from the items under one page
///
/// `items` may be empty when every item's effective version is a tombstone.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PageComposite {
    pub kind: ArtifactKind,
    pub page_id: String,
    pub items: Vec<PageItem>,
}

/// Result of an edit-protocol write
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct EditOutcome {
    pub base_version: Version,
    pub version: Version,
}

/// Normalize a JSON `null` document to a tombstone
pub(crate) fn normalize_payload(data: Payload) -> Payload {
    match data {
        Some(serde_json::Value::Null) => None,
        other => other,
    }
}

/// Fail fast once the book's pool was closed by a delete
pub(crate) fn ensure_open(pool: &sqlx::SqlitePool, label: &str) -> Result<()> {
    if pool.is_closed() {
        return Err(Error::BookDeleted(label.to_string()));
    }
    Ok(())
}

pub(crate) fn validate_version(version: Version) -> Result<()> {
    if version == 0 {
        return Err(Error::InvalidInput("versions start at 1".to_string()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_round_trips_through_str() {
        for kind in ArtifactKind::ALL {
            assert_eq!(kind.as_str().parse::<ArtifactKind>().unwrap(), kind);
        }
        assert!("rendition".parse::<ArtifactKind>().is_err());
    }

    #[test]
    fn test_kind_serializes_kebab_case() {
        let json = serde_json::to_string(&ArtifactKind::TextClassification).unwrap();
        assert_eq!(json, "\"text-classification\"");
    }

    #[test]
    fn test_kind_capabilities() {
        assert!(ArtifactKind::TextExtraction.has_current_pointer());
        assert!(ArtifactKind::Rendering.has_current_pointer());
        assert!(!ArtifactKind::TextClassification.has_current_pointer());
        assert!(!ArtifactKind::Sectioning.has_current_pointer());
        assert!(ArtifactKind::Rendering.is_file_backed());
        assert!(ArtifactKind::Sectioning.is_page_scoped());
        assert!(!ArtifactKind::Metadata.is_page_scoped());
    }

    #[test]
    fn test_null_document_is_tombstone() {
        assert_eq!(normalize_payload(Some(serde_json::Value::Null)), None);
        assert_eq!(
            normalize_payload(Some(serde_json::json!({}))),
            Some(serde_json::json!({}))
        );
    }
}
