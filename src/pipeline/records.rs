//! Scraped records
//!
//! Loosely-typed objects emitted by translator code. None of these are
//! persisted directly; they go through the item saver.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Item, note or standalone attachment built by a translator
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScrapedItem {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub item_type: Option<String>,
    /// Translator-local identifier used by `see_also` and collections
    #[serde(default, rename = "itemID", skip_serializing_if = "Option::is_none")]
    pub item_id: Option<String>,
    #[serde(default)]
    pub creators: Vec<ScrapedCreator>,
    #[serde(default)]
    pub tags: Vec<ScrapedTag>,
    #[serde(default)]
    pub notes: Vec<ScrapedNote>,
    #[serde(default)]
    pub attachments: Vec<ScrapedAttachment>,
    #[serde(default)]
    pub see_also: Vec<String>,
    /// Body of a note record
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
    /// Free-form content fields (`title`, `date`, `url`, ...)
    #[serde(flatten)]
    pub fields: BTreeMap<String, String>,
}

impl ScrapedItem {
    pub fn new(item_type: impl Into<String>) -> Self {
        Self {
            item_type: Some(item_type.into()),
            ..Default::default()
        }
    }

    /// Set a content field; empty values are ignored
    pub fn set_field(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let value = value.into();
        if !value.trim().is_empty() {
            self.fields.insert(name.into(), value);
        }
    }

    pub fn field(&self, name: &str) -> Option<&str> {
        self.fields.get(name).map(String::as_str)
    }

    pub fn is_note(&self) -> bool {
        self.item_type.as_deref() == Some("note")
    }

    pub fn is_attachment(&self) -> bool {
        self.item_type.as_deref() == Some("attachment")
    }

    /// View a standalone attachment record as an attachment
    pub fn as_attachment(&self) -> ScrapedAttachment {
        ScrapedAttachment {
            url: self.field("url").map(str::to_string),
            path: self.field("path").map(str::to_string),
            title: self.field("title").map(str::to_string),
            mime_type: self.field("mimeType").map(str::to_string),
            snapshot: self.field("snapshot").map(|v| v != "false"),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScrapedCreator {
    #[serde(default)]
    pub first_name: String,
    #[serde(default)]
    pub last_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub creator_type: Option<String>,
    /// 1 for single-field names
    #[serde(default)]
    pub field_mode: u8,
}

impl ScrapedCreator {
    pub fn new(first_name: &str, last_name: &str, creator_type: Option<&str>) -> Self {
        Self {
            first_name: first_name.to_string(),
            last_name: last_name.to_string(),
            creator_type: creator_type.map(str::to_string),
            field_mode: 0,
        }
    }
}

/// Tag as a plain string or with an explicit kind
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ScrapedTag {
    Plain(String),
    Typed {
        tag: String,
        #[serde(rename = "type")]
        kind: u8,
    },
}

impl ScrapedTag {
    pub fn name(&self) -> &str {
        match self {
            ScrapedTag::Plain(tag) | ScrapedTag::Typed { tag, .. } => tag,
        }
    }
}

impl From<&str> for ScrapedTag {
    fn from(tag: &str) -> Self {
        ScrapedTag::Plain(tag.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScrapedNote {
    pub note: String,
}

impl From<&str> for ScrapedNote {
    fn from(note: &str) -> Self {
        ScrapedNote { note: note.to_string() }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScrapedAttachment {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
    /// `Some(false)` asks for a link without fetching content
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snapshot: Option<bool>,
}

/// Collection built by an import translator
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ScrapedCollection {
    pub name: String,
    #[serde(default)]
    pub children: Vec<CollectionChild>,
}

impl ScrapedCollection {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            children: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum CollectionChild {
    /// Reference to an item by its translator-local `itemID`
    Item { id: String },
    Collection(ScrapedCollection),
}
