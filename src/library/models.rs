//! Domain models
//!
//! Persisted entities produced by the materialization pipeline

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

pub type ItemId = u64;
pub type CollectionId = u64;
pub type CreatorId = u64;

/// Tag kind for tags entered by a user or trusted by an import
pub const TAG_KIND_USER: u8 = 0;
/// Tag kind for tags added automatically during capture
pub const TAG_KIND_AUTOMATIC: u8 = 1;

/// Creator name as stored
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CreatorName {
    pub first_name: String,
    pub last_name: String,
    /// 1 when the whole name lives in `last_name` (institutions)
    pub field_mode: u8,
}

impl CreatorName {
    pub fn new(first_name: &str, last_name: &str, field_mode: u8) -> Self {
        Self {
            first_name: normalize_name_part(first_name),
            last_name: normalize_name_part(last_name),
            field_mode,
        }
    }
}

/// Trim and collapse internal whitespace so equal names compare equal
pub fn normalize_name_part(part: &str) -> String {
    part.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// A creator attached to an item with its role
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemCreator {
    pub creator_id: CreatorId,
    pub creator_type: String,
    pub order: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemTag {
    pub name: String,
    pub kind: u8,
}

/// How an attachment's content is held
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkMode {
    /// Content copied from a local file
    ImportedFile,
    /// Content downloaded from a URL
    ImportedUrl,
    /// Only the URL is kept
    LinkedUrl,
    /// Placeholder for a local file that did not exist
    MissingFile,
}

/// Attachment ready to be persisted
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewAttachment {
    pub parent: Option<ItemId>,
    pub link_mode: LinkMode,
    pub title: String,
    pub url: Option<String>,
    pub path: Option<PathBuf>,
    pub content_type: Option<String>,
    #[serde(skip)]
    pub content: Option<Vec<u8>>,
}

/// Item as held by a store
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoredItem {
    pub id: ItemId,
    pub item_type: String,
    pub fields: BTreeMap<String, String>,
    pub creators: Vec<ItemCreator>,
    pub tags: Vec<ItemTag>,
    pub related: Vec<ItemId>,
    pub parent: Option<ItemId>,
    /// Note body, for notes
    pub note: Option<String>,
    /// Attachment details, for attachments
    pub attachment: Option<NewAttachment>,
}

impl StoredItem {
    pub fn is_note(&self) -> bool {
        self.item_type == "note"
    }

    pub fn is_attachment(&self) -> bool {
        self.item_type == "attachment"
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoredCollection {
    pub id: CollectionId,
    pub name: String,
    pub parent: Option<CollectionId>,
    pub items: Vec<ItemId>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_creator_name_normalized() {
        let a = CreatorName::new("  Ada ", "Lovelace", 0);
        let b = CreatorName::new("Ada", "  Lovelace  ", 0);
        assert_eq!(a, b);
        assert_eq!(normalize_name_part("Jean   Paul\tSartre"), "Jean Paul Sartre");
    }
}
