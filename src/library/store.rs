//! Persistence interface consumed by the materialization pipeline and exports
//!
//! The engine never owns domain storage; it drives whatever implements
//! [`LibraryStore`].

use crate::core::error::Result;
use crate::library::models::{
    CollectionId, CreatorId, CreatorName, ItemCreator, ItemId, NewAttachment, StoredCollection, StoredItem,
};
use std::collections::BTreeMap;

pub trait LibraryStore: Send + Sync {
    /// Create a regular item with canonical field names
    fn create_item(&self, item_type: &str, fields: BTreeMap<String, String>) -> Result<ItemId>;

    /// Create a note, standalone or under `parent`
    fn create_note(&self, note: &str, parent: Option<ItemId>) -> Result<ItemId>;

    fn create_attachment(&self, attachment: NewAttachment) -> Result<ItemId>;

    /// Existing creator with exactly this normalized name
    fn find_creator(&self, name: &CreatorName) -> Result<Option<CreatorId>>;

    fn create_creator(&self, name: &CreatorName) -> Result<CreatorId>;

    fn set_creators(&self, item: ItemId, creators: Vec<ItemCreator>) -> Result<()>;

    /// Attach a batch of tags sharing one kind
    fn add_tags(&self, item: ItemId, kind: u8, tags: &[String]) -> Result<()>;

    /// Link two items as related (both directions)
    fn add_related(&self, item: ItemId, related: ItemId) -> Result<()>;

    fn create_collection(&self, name: &str, parent: Option<CollectionId>) -> Result<CollectionId>;

    fn add_to_collection(&self, collection: CollectionId, items: &[ItemId]) -> Result<()>;

    fn get_item(&self, id: ItemId) -> Result<Option<StoredItem>>;

    /// Ids of all top-level items in creation order
    fn item_ids(&self) -> Result<Vec<ItemId>>;

    /// Ids of child notes and attachments of an item
    fn child_ids(&self, parent: ItemId) -> Result<Vec<ItemId>>;

    fn get_creator(&self, id: CreatorId) -> Result<Option<CreatorName>>;

    fn get_collection(&self, id: CollectionId) -> Result<Option<StoredCollection>>;

    /// All collections in creation order
    fn collections(&self) -> Result<Vec<StoredCollection>>;
}
