//! Domain library: models, item type schema and the persistence interface

pub mod memory;
pub mod models;
pub mod schema;
pub mod store;

pub use memory::MemoryStore;
pub use models::{
    CollectionId, CreatorId, CreatorName, ItemCreator, ItemId, ItemTag, LinkMode, NewAttachment,
    StoredCollection, StoredItem, TAG_KIND_AUTOMATIC, TAG_KIND_USER,
};
pub use schema::{item_type, ItemTypeSchema};
pub use store::LibraryStore;
