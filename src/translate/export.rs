//! Export item getter
//!
//! Pull-side source for export translators. Items are handed out one at a
//! time in a translator-friendly form: type-specific field names alongside
//! their base aliases, creators and tags inline, child notes and attachments
//! nested. With embedded files, attachment content is copied next to the
//! output and referenced by relative path.

use crate::core::error::{Result, TranslateError};
use crate::library::models::{CollectionId, ItemId, LinkMode, StoredCollection, StoredItem};
use crate::library::schema;
use crate::library::store::LibraryStore;
use crate::pipeline::records::{ScrapedCreator, ScrapedTag};
use serde::Serialize;
use std::collections::{BTreeMap, HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, warn};

/// Directory (under the export directory) holding copied attachment content
pub const FILES_DIR: &str = "files";

/// What an export covers
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExportSelection {
    /// Every top-level item and every collection
    Library,
    Items(Vec<ItemId>),
    /// One collection and everything below it
    Collection(CollectionId),
}

/// Item as seen by an export translator
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportItem {
    #[serde(rename = "itemID")]
    pub item_id: ItemId,
    pub item_type: String,
    /// Type-specific names plus their base-field aliases
    #[serde(flatten)]
    pub fields: BTreeMap<String, String>,
    /// Type-specific names only, without aliases
    pub unique_fields: BTreeMap<String, String>,
    pub creators: Vec<ScrapedCreator>,
    pub tags: Vec<ScrapedTag>,
    pub notes: Vec<ExportNote>,
    pub attachments: Vec<ExportAttachment>,
    /// Persistent ids of related items
    pub see_also: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

impl ExportItem {
    pub fn field(&self, name: &str) -> Option<&str> {
        self.fields.get(name).map(String::as_str)
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportNote {
    #[serde(rename = "itemID")]
    pub item_id: ItemId,
    pub note: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportAttachment {
    #[serde(rename = "itemID")]
    pub item_id: ItemId,
    pub title: String,
    pub url: Option<String>,
    /// Relative to the export directory when files are embedded
    pub path: Option<String>,
    pub mime_type: Option<String>,
    pub link_mode: LinkMode,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportCollection {
    pub id: CollectionId,
    pub name: String,
    pub parent: Option<CollectionId>,
    pub items: Vec<ItemId>,
    pub collections: Vec<CollectionId>,
}

/// Output locations for an export with embedded files.
///
/// `/out/lib.ris` becomes `/out/lib/lib.ris`, with attachment content under
/// `/out/lib/files/<itemId>/`.
pub fn embedded_layout(target: &Path) -> Result<(PathBuf, PathBuf)> {
    let name = target
        .file_stem()
        .ok_or_else(|| TranslateError::Validation(format!("invalid export path: {}", target.display())))?;
    let parent = target.parent().unwrap_or_else(|| Path::new("."));
    let dir = parent.join(name);
    let file_name = target.file_name().unwrap_or(name);
    Ok((dir.join(file_name), dir))
}

pub struct ItemGetter {
    store: Arc<dyn LibraryStore>,
    items: VecDeque<ItemId>,
    collections: VecDeque<StoredCollection>,
    all_collections: Vec<StoredCollection>,
    file_dir: Option<PathBuf>,
}

impl ItemGetter {
    pub fn new(store: Arc<dyn LibraryStore>, selection: &ExportSelection) -> Result<Self> {
        let all_collections = store.collections()?;
        let (items, collections) = match selection {
            ExportSelection::Library => (store.item_ids()?, all_collections.clone()),
            ExportSelection::Items(ids) => (ids.clone(), Vec::new()),
            ExportSelection::Collection(id) => {
                let tree = collection_tree(&all_collections, *id);
                if tree.is_empty() {
                    return Err(TranslateError::NotFound(format!("collection {}", id)));
                }
                let mut seen = HashSet::new();
                let items = tree
                    .iter()
                    .flat_map(|c| c.items.iter().copied())
                    .filter(|id| seen.insert(*id))
                    .collect();
                (items, tree)
            }
        };
        debug!(items = items.len(), collections = collections.len(), "Prepared export");

        Ok(Self {
            store,
            items: items.into(),
            collections: collections.into(),
            all_collections,
            file_dir: None,
        })
    }

    /// Copy attachment content under `dir` and export relative paths
    pub fn with_file_dir(mut self, dir: Option<PathBuf>) -> Self {
        self.file_dir = dir;
        self
    }

    /// Items not yet handed out
    pub fn remaining(&self) -> usize {
        self.items.len()
    }

    pub fn next_item(&mut self) -> Result<Option<ExportItem>> {
        while let Some(id) = self.items.pop_front() {
            match self.store.get_item(id)? {
                Some(stored) => return self.to_export(stored).map(Some),
                None => warn!(item = id, "Skipping export of missing item"),
            }
        }
        Ok(None)
    }

    pub fn next_collection(&mut self) -> Option<ExportCollection> {
        let collection = self.collections.pop_front()?;
        let children = self
            .all_collections
            .iter()
            .filter(|c| c.parent == Some(collection.id))
            .map(|c| c.id)
            .collect();
        Some(ExportCollection {
            id: collection.id,
            name: collection.name,
            parent: collection.parent,
            items: collection.items,
            collections: children,
        })
    }

    fn to_export(&self, stored: StoredItem) -> Result<ExportItem> {
        let mut item = ExportItem {
            item_id: stored.id,
            item_type: stored.item_type.clone(),
            note: stored.note.clone(),
            see_also: stored.related.iter().map(|id| id.to_string()).collect(),
            ..Default::default()
        };

        let schema = schema::item_type(&stored.item_type);
        for (canonical, value) in &stored.fields {
            match schema.and_then(|s| s.specific_field(canonical)) {
                Some(specific) => {
                    item.unique_fields.insert(specific.to_string(), value.clone());
                    item.fields.insert(specific.to_string(), value.clone());
                }
                None => {
                    item.unique_fields.insert(canonical.clone(), value.clone());
                }
            }
            item.fields.insert(canonical.clone(), value.clone());
        }

        for creator in &stored.creators {
            match self.store.get_creator(creator.creator_id)? {
                Some(name) => item.creators.push(ScrapedCreator {
                    first_name: name.first_name,
                    last_name: name.last_name,
                    creator_type: Some(creator.creator_type.clone()),
                    field_mode: name.field_mode,
                }),
                None => warn!(item = stored.id, creator = creator.creator_id, "Creator missing from store"),
            }
        }

        item.tags = stored
            .tags
            .iter()
            .map(|t| ScrapedTag::Typed {
                tag: t.name.clone(),
                kind: t.kind,
            })
            .collect();

        if stored.is_attachment() {
            if let Some(attachment) = self.export_attachment(&stored)? {
                if let Some(path) = attachment.path {
                    item.fields.insert("path".to_string(), path);
                }
                if let Some(mime) = attachment.mime_type {
                    item.fields.insert("mimeType".to_string(), mime);
                }
            }
            return Ok(item);
        }

        for child_id in self.store.child_ids(stored.id)? {
            let Some(child) = self.store.get_item(child_id)? else {
                continue;
            };
            if child.is_note() {
                item.notes.push(ExportNote {
                    item_id: child.id,
                    note: child.note.clone().unwrap_or_default(),
                });
            } else if let Some(attachment) = self.export_attachment(&child)? {
                item.attachments.push(attachment);
            }
        }
        Ok(item)
    }

    fn export_attachment(&self, stored: &StoredItem) -> Result<Option<ExportAttachment>> {
        let Some(attachment) = stored.attachment.as_ref() else {
            return Ok(None);
        };

        let mut path = attachment.path.as_ref().map(|p| p.display().to_string());
        if let Some(dir) = &self.file_dir {
            let file_name = attachment_file_name(stored.id, attachment);
            let relative = PathBuf::from(FILES_DIR).join(stored.id.to_string()).join(&file_name);
            let copied = match (&attachment.content, attachment.link_mode) {
                (Some(bytes), _) => {
                    write_file(&dir.join(&relative), bytes)?;
                    true
                }
                (None, LinkMode::ImportedFile) => match &attachment.path {
                    Some(source) => match copy_file(source, &dir.join(&relative)) {
                        Ok(()) => true,
                        Err(e) => {
                            warn!(item = stored.id, source = %source.display(), error = %e, "Attachment file not copied");
                            false
                        }
                    },
                    None => false,
                },
                _ => false,
            };
            if copied {
                path = Some(relative.to_string_lossy().replace('\\', "/"));
            }
        }

        Ok(Some(ExportAttachment {
            item_id: stored.id,
            title: attachment.title.clone(),
            url: attachment.url.clone(),
            path,
            mime_type: attachment.content_type.clone(),
            link_mode: attachment.link_mode,
        }))
    }
}

fn write_file(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, bytes)?;
    Ok(())
}

fn copy_file(source: &Path, dest: &Path) -> Result<()> {
    if let Some(parent) = dest.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::copy(source, dest)?;
    Ok(())
}

fn attachment_file_name(id: ItemId, attachment: &crate::library::models::NewAttachment) -> String {
    let from_path = attachment
        .path
        .as_ref()
        .and_then(|p| p.file_name())
        .map(|n| n.to_string_lossy().to_string());
    let from_url = attachment
        .url
        .as_deref()
        .and_then(|u| url::Url::parse(u).ok())
        .and_then(|u| u.path_segments().and_then(|s| s.last().map(str::to_string)))
        .filter(|s| !s.is_empty());

    from_path.or(from_url).unwrap_or_else(|| {
        let ext = attachment
            .content_type
            .as_deref()
            .and_then(mime_guess::get_mime_extensions_str)
            .and_then(|exts| exts.first())
            .copied()
            .unwrap_or("bin");
        format!("attachment-{}.{}", id, ext)
    })
}

/// `root` and all of its descendants, parents first
fn collection_tree(all: &[StoredCollection], root: CollectionId) -> Vec<StoredCollection> {
    let mut out = Vec::new();
    let mut queue: VecDeque<CollectionId> = VecDeque::from([root]);
    while let Some(id) = queue.pop_front() {
        if let Some(collection) = all.iter().find(|c| c.id == id) {
            out.push(collection.clone());
            queue.extend(all.iter().filter(|c| c.parent == Some(id)).map(|c| c.id));
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::library::models::{CreatorName, ItemCreator, NewAttachment};
    use crate::library::MemoryStore;

    fn thesis(store: &MemoryStore) -> ItemId {
        let mut fields = BTreeMap::new();
        fields.insert("title".to_string(), "On Graphs".to_string());
        fields.insert("publisher".to_string(), "MIT".to_string());
        fields.insert("type".to_string(), "PhD Thesis".to_string());
        let id = store.create_item("thesis", fields).unwrap();
        let creator = store.create_creator(&CreatorName::new("Ada", "Lovelace", 0)).unwrap();
        store
            .set_creators(id, vec![ItemCreator { creator_id: creator, creator_type: "author".into(), order: 0 }])
            .unwrap();
        store.add_tags(id, 1, &["graphs".to_string()]).unwrap();
        store.create_note("<p>Read later</p>", Some(id)).unwrap();
        id
    }

    #[test]
    fn test_fields_and_aliases() {
        let store = Arc::new(MemoryStore::new());
        let id = thesis(&store);
        let mut getter = ItemGetter::new(store.clone(), &ExportSelection::Items(vec![id])).unwrap();
        let item = getter.next_item().unwrap().unwrap();

        assert_eq!(item.field("university"), Some("MIT"));
        assert_eq!(item.field("publisher"), Some("MIT"));
        assert_eq!(item.unique_fields.get("university").map(String::as_str), Some("MIT"));
        assert!(!item.unique_fields.contains_key("publisher"));
        assert_eq!(item.unique_fields.get("thesisType").map(String::as_str), Some("PhD Thesis"));
        assert_eq!(item.creators[0].last_name, "Lovelace");
        assert_eq!(item.tags, vec![ScrapedTag::Typed { tag: "graphs".into(), kind: 1 }]);
        assert_eq!(item.notes.len(), 1);
        assert!(getter.next_item().unwrap().is_none());
    }

    #[test]
    fn test_collection_selection_is_recursive() {
        let store = Arc::new(MemoryStore::new());
        let a = thesis(&store);
        let b = store.create_item("book", BTreeMap::new()).unwrap();
        let top = store.create_collection("Top", None).unwrap();
        let sub = store.create_collection("Sub", Some(top)).unwrap();
        store.add_to_collection(top, &[a]).unwrap();
        store.add_to_collection(sub, &[b, a]).unwrap();

        let mut getter = ItemGetter::new(store.clone(), &ExportSelection::Collection(top)).unwrap();
        assert_eq!(getter.remaining(), 2);
        let first = getter.next_collection().unwrap();
        assert_eq!(first.name, "Top");
        assert_eq!(first.collections, vec![sub]);
        assert_eq!(getter.next_collection().unwrap().name, "Sub");
        assert!(getter.next_collection().is_none());

        assert!(ItemGetter::new(store, &ExportSelection::Collection(999)).is_err());
    }

    #[test]
    fn test_embedded_files_copied() {
        let store = Arc::new(MemoryStore::new());
        let id = store.create_item("book", BTreeMap::new()).unwrap();
        store
            .create_attachment(NewAttachment {
                parent: Some(id),
                link_mode: LinkMode::ImportedUrl,
                title: "Full Text".into(),
                url: Some("https://example.org/paper.pdf".into()),
                path: None,
                content_type: Some("application/pdf".into()),
                content: Some(b"%PDF-1.4".to_vec()),
            })
            .unwrap();

        let out = tempfile::tempdir().unwrap();
        let (file, dir) = embedded_layout(&out.path().join("lib.ris")).unwrap();
        assert_eq!(file, out.path().join("lib").join("lib.ris"));

        let mut getter = ItemGetter::new(store, &ExportSelection::Library)
            .unwrap()
            .with_file_dir(Some(dir.clone()));
        let item = getter.next_item().unwrap().unwrap();
        let attachment = &item.attachments[0];
        let relative = attachment.path.clone().unwrap();
        assert_eq!(relative, format!("files/{}/paper.pdf", attachment.item_id));
        assert_eq!(std::fs::read(dir.join(relative)).unwrap(), b"%PDF-1.4");
    }

    #[test]
    fn test_missing_attachment_file_skipped() {
        let store = Arc::new(MemoryStore::new());
        let id = store.create_item("book", BTreeMap::new()).unwrap();
        let out = tempfile::tempdir().unwrap();
        let gone = out.path().join("gone.pdf");
        store
            .create_attachment(NewAttachment {
                parent: Some(id),
                link_mode: LinkMode::ImportedFile,
                title: "Lost".into(),
                url: None,
                path: Some(gone.clone()),
                content_type: Some("application/pdf".into()),
                content: None,
            })
            .unwrap();

        let (_, dir) = embedded_layout(&out.path().join("lib.ris")).unwrap();
        let mut getter = ItemGetter::new(store, &ExportSelection::Items(vec![id]))
            .unwrap()
            .with_file_dir(Some(dir));
        let item = getter.next_item().unwrap().unwrap();
        assert_eq!(item.attachments.len(), 1);
        assert_eq!(item.attachments[0].path.as_deref(), Some(gone.display().to_string().as_str()));
    }
}
