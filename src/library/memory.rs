//! In-memory library store
//!
//! Reference [`LibraryStore`] used by the command line tool and tests.

use crate::core::error::{Result, TranslateError};
use crate::library::models::{
    CollectionId, CreatorId, CreatorName, ItemCreator, ItemId, ItemTag, NewAttachment, StoredCollection,
    StoredItem,
};
use crate::library::store::LibraryStore;
use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};

#[derive(Default)]
struct Inner {
    next_id: u64,
    items: BTreeMap<ItemId, StoredItem>,
    creators: BTreeMap<CreatorId, CreatorName>,
    collections: BTreeMap<CollectionId, StoredCollection>,
}

impl Inner {
    fn allocate(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn item_mut(&mut self, id: ItemId) -> Result<&mut StoredItem> {
        self.items
            .get_mut(&id)
            .ok_or_else(|| TranslateError::Store(format!("item {} does not exist", id)))
    }
}

#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, Inner>> {
        self.inner
            .lock()
            .map_err(|_| TranslateError::Store("library store lock poisoned".to_string()))
    }

    /// Number of distinct creators
    pub fn creator_count(&self) -> usize {
        self.lock().map(|inner| inner.creators.len()).unwrap_or(0)
    }
}

impl LibraryStore for MemoryStore {
    fn create_item(&self, item_type: &str, fields: BTreeMap<String, String>) -> Result<ItemId> {
        let mut inner = self.lock()?;
        let id = inner.allocate();
        inner.items.insert(
            id,
            StoredItem {
                id,
                item_type: item_type.to_string(),
                fields,
                ..Default::default()
            },
        );
        Ok(id)
    }

    fn create_note(&self, note: &str, parent: Option<ItemId>) -> Result<ItemId> {
        let mut inner = self.lock()?;
        if let Some(parent) = parent {
            inner.item_mut(parent)?;
        }
        let id = inner.allocate();
        inner.items.insert(
            id,
            StoredItem {
                id,
                item_type: "note".to_string(),
                parent,
                note: Some(note.to_string()),
                ..Default::default()
            },
        );
        Ok(id)
    }

    fn create_attachment(&self, attachment: NewAttachment) -> Result<ItemId> {
        let mut inner = self.lock()?;
        if let Some(parent) = attachment.parent {
            inner.item_mut(parent)?;
        }
        let id = inner.allocate();
        let mut fields = BTreeMap::new();
        fields.insert("title".to_string(), attachment.title.clone());
        if let Some(url) = &attachment.url {
            fields.insert("url".to_string(), url.clone());
        }
        inner.items.insert(
            id,
            StoredItem {
                id,
                item_type: "attachment".to_string(),
                fields,
                parent: attachment.parent,
                attachment: Some(attachment),
                ..Default::default()
            },
        );
        Ok(id)
    }

    fn find_creator(&self, name: &CreatorName) -> Result<Option<CreatorId>> {
        let inner = self.lock()?;
        Ok(inner
            .creators
            .iter()
            .find(|(_, existing)| *existing == name)
            .map(|(id, _)| *id))
    }

    fn create_creator(&self, name: &CreatorName) -> Result<CreatorId> {
        let mut inner = self.lock()?;
        let id = inner.allocate();
        inner.creators.insert(id, name.clone());
        Ok(id)
    }

    fn set_creators(&self, item: ItemId, creators: Vec<ItemCreator>) -> Result<()> {
        let mut inner = self.lock()?;
        if let Some(missing) = creators.iter().find(|c| !inner.creators.contains_key(&c.creator_id)) {
            return Err(TranslateError::Store(format!("creator {} does not exist", missing.creator_id)));
        }
        inner.item_mut(item)?.creators = creators;
        Ok(())
    }

    fn add_tags(&self, item: ItemId, kind: u8, tags: &[String]) -> Result<()> {
        let mut inner = self.lock()?;
        let stored = inner.item_mut(item)?;
        for name in tags {
            if !stored.tags.iter().any(|t| &t.name == name) {
                stored.tags.push(ItemTag { name: name.clone(), kind });
            }
        }
        Ok(())
    }

    fn add_related(&self, item: ItemId, related: ItemId) -> Result<()> {
        let mut inner = self.lock()?;
        inner.item_mut(related)?;
        let stored = inner.item_mut(item)?;
        if !stored.related.contains(&related) {
            stored.related.push(related);
        }
        let other = inner.item_mut(related)?;
        if !other.related.contains(&item) {
            other.related.push(item);
        }
        Ok(())
    }

    fn create_collection(&self, name: &str, parent: Option<CollectionId>) -> Result<CollectionId> {
        let mut inner = self.lock()?;
        if let Some(parent) = parent {
            if !inner.collections.contains_key(&parent) {
                return Err(TranslateError::Store(format!("collection {} does not exist", parent)));
            }
        }
        let id = inner.allocate();
        inner.collections.insert(
            id,
            StoredCollection {
                id,
                name: name.to_string(),
                parent,
                items: Vec::new(),
            },
        );
        Ok(id)
    }

    fn add_to_collection(&self, collection: CollectionId, items: &[ItemId]) -> Result<()> {
        let mut inner = self.lock()?;
        let stored = inner
            .collections
            .get_mut(&collection)
            .ok_or_else(|| TranslateError::Store(format!("collection {} does not exist", collection)))?;
        for item in items {
            if !stored.items.contains(item) {
                stored.items.push(*item);
            }
        }
        Ok(())
    }

    fn get_item(&self, id: ItemId) -> Result<Option<StoredItem>> {
        Ok(self.lock()?.items.get(&id).cloned())
    }

    fn item_ids(&self) -> Result<Vec<ItemId>> {
        Ok(self
            .lock()?
            .items
            .values()
            .filter(|item| item.parent.is_none())
            .map(|item| item.id)
            .collect())
    }

    fn child_ids(&self, parent: ItemId) -> Result<Vec<ItemId>> {
        Ok(self
            .lock()?
            .items
            .values()
            .filter(|item| item.parent == Some(parent))
            .map(|item| item.id)
            .collect())
    }

    fn get_creator(&self, id: CreatorId) -> Result<Option<CreatorName>> {
        Ok(self.lock()?.creators.get(&id).cloned())
    }

    fn get_collection(&self, id: CollectionId) -> Result<Option<StoredCollection>> {
        Ok(self.lock()?.collections.get(&id).cloned())
    }

    fn collections(&self) -> Result<Vec<StoredCollection>> {
        Ok(self.lock()?.collections.values().cloned().collect())
    }
}
