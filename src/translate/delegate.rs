//! Nested translators
//!
//! A translator can load another translator and run it as a child
//! operation. Records the child completes flow to the parent's pipeline
//! unless the caller subscribes to them with `on_item`; selection prompts
//! go to the nearest ancestor with a handler. Child failures surface as
//! errors to the calling translator.

use super::session::Session;
use super::{Services, Translate};
use crate::core::error::{Result, TranslateError};
use crate::library::models::{CollectionId, ItemId};
use crate::pipeline::records::ScrapedItem;
use crate::translator::types::{Document, FoundTranslator, Mode, OptionMap};
use std::sync::Arc;

/// Handle on a child operation, given to translator code
#[derive(Clone)]
pub struct ChildTranslator {
    translate: Translate,
}

impl ChildTranslator {
    pub(crate) fn new(mode: Mode, services: Services, parent: Arc<Session>) -> Self {
        Self {
            translate: Translate::child(mode, services, parent),
        }
    }

    pub fn mode(&self) -> Mode {
        self.translate.mode()
    }

    pub fn set_translator(&self, id: &str) -> Result<()> {
        self.translate.set_translator(id)
    }

    pub fn set_string(&self, text: impl Into<String>) {
        self.translate.set_string(text);
    }

    pub fn set_document(&self, document: Document) {
        self.translate.set_document(document);
    }

    pub fn set_search(&self, query: ScrapedItem) {
        self.translate.set_search(query);
    }

    pub fn set_items(&self, items: Vec<ItemId>) {
        self.translate.set_items(items);
    }

    pub fn set_collection(&self, collection: CollectionId) {
        self.translate.set_collection(collection);
    }

    pub fn set_display_options(&self, options: OptionMap) {
        self.translate.set_display_options(options);
    }

    /// Receive the child's records instead of saving them
    pub fn on_item(&self, handler: impl Fn(ScrapedItem) + Send + Sync + 'static) {
        self.translate.handlers().on_item(Arc::new(handler));
    }

    /// Detect translators for the child's input
    pub fn get_translators(&self) -> Result<Vec<FoundTranslator>> {
        self.translate.get_translators()?;
        if self.translate.phase().is_busy() {
            return Err(TranslateError::Execution(
                "nested detection did not complete synchronously".to_string(),
            ));
        }
        Ok(self.translate.found())
    }

    /// Run the child.
    ///
    /// Returns once the child's entry point returns. A child that suspended
    /// with `wait()` keeps delivering records until it signals `done()`.
    pub fn translate(&self) -> Result<()> {
        self.translate.translate()?;
        match self.translate.success() {
            Some(false) => Err(self.translate.take_error().unwrap_or_else(|| {
                TranslateError::Execution(format!("nested {} translation failed", self.translate.mode()))
            })),
            _ => Ok(()),
        }
    }

    /// Text written by a nested export
    pub fn output(&self) -> Option<String> {
        self.translate.output()
    }
}
