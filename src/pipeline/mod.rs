//! Materialization pipeline
//!
//! Scraped records in, persisted library entities out.

pub mod attachments;
pub mod records;
pub mod saver;

pub use attachments::{AttachmentFetcher, FetchedContent, HttpFetcher};
pub use records::{
    CollectionChild, ScrapedAttachment, ScrapedCollection, ScrapedCreator, ScrapedItem, ScrapedNote, ScrapedTag,
};
pub use saver::{short_title, ItemSaver};
