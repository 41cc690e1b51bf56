//! Capability surfaces handed to translator code
//!
//! Each operation mode gets its own scope type. Translator code can only
//! reach the host through the methods on these scopes; everything else in the
//! engine stays out of its reach. Scopes are cheap clones over the session
//! that created them, so code that calls `wait()` can move a clone to another
//! thread and signal `done()` from there.

use super::types::{Mode, TranslatorDescriptor};
use super::utilities;
use crate::core::error::{Result, TranslateError};
use crate::io::graph::GraphHandle;
use crate::pipeline::records::{ScrapedCollection, ScrapedItem};
use crate::translate::delegate::ChildTranslator;
use crate::translate::events::SelectCandidate;
use crate::translate::export::{ExportCollection, ExportItem};
use crate::translate::session::Session;
use serde_json::Value;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;

/// Capabilities shared by every mode
#[derive(Clone)]
pub struct Scope {
    session: Arc<Session>,
}

impl Scope {
    pub(crate) fn new(session: Arc<Session>) -> Self {
        Self { session }
    }

    pub fn mode(&self) -> Mode {
        self.session.mode()
    }

    pub fn translator(&self) -> &TranslatorDescriptor {
        self.session.descriptor()
    }

    /// Log a message against this translator
    pub fn debug(&self, message: &str) {
        self.session.debug(message);
    }

    /// Set an engine-affecting option (e.g. `dataMode`)
    pub fn configure(&self, key: &str, value: Value) {
        self.session.configure(key, value);
    }

    /// Declare a display option; an existing value is kept
    pub fn add_option(&self, key: &str, default: Value) {
        self.session.add_option(key, default);
    }

    pub fn get_option(&self, key: &str) -> Option<Value> {
        self.session.get_option(key)
    }

    /// Switch to asynchronous completion: returning from the entry point no
    /// longer finishes the phase, a later `done()` does.
    pub fn wait(&self) {
        self.session.request_async();
    }

    /// Signal successful completion
    pub fn done(&self) {
        self.session.signal_done(Ok(Value::Bool(true)));
    }

    /// Signal completion with a value. For detection this is the detection
    /// result; during execution `false` marks the run as failed.
    pub fn done_with(&self, value: Value) {
        self.session.signal_done(Ok(value));
    }

    /// Signal failure
    pub fn fail(&self, error: TranslateError) {
        self.session.signal_done(Err(error));
    }

    /// Create a nested operation that runs another translator
    pub fn load_translator(&self, mode: Mode) -> Result<ChildTranslator> {
        let current = self.session.mode();
        if mode == Mode::Export && matches!(current, Mode::Web | Mode::Search) {
            return Err(TranslateError::SecurityViolation(format!(
                "{} translators may not load export translators",
                current
            )));
        }
        self.session.load_translator(mode)
    }

    pub fn utilities(&self) -> Utilities {
        Utilities
    }

    pub(crate) fn session(&self) -> &Arc<Session> {
        &self.session
    }
}

/// Namespace for the structured-data helpers
#[derive(Debug, Clone, Copy)]
pub struct Utilities;

impl Utilities {
    pub fn trim_internal(&self, text: &str) -> String {
        utilities::trim_internal(text)
    }

    pub fn clean_author(
        &self,
        raw: &str,
        creator_type: Option<&str>,
        single_field: bool,
    ) -> crate::pipeline::records::ScrapedCreator {
        utilities::clean_author(raw, creator_type, single_field)
    }

    pub fn clean_doi(&self, text: &str) -> Option<String> {
        utilities::clean_doi(text)
    }

    pub fn clean_isbn(&self, text: &str) -> Option<String> {
        utilities::clean_isbn(text)
    }

    pub fn str_to_date(&self, text: &str) -> utilities::DateParts {
        utilities::str_to_date(text)
    }

    pub fn unescape_html(&self, html: &str) -> String {
        utilities::unescape_html(html)
    }
}

/// Record under construction; `complete()` hands it to the pipeline
pub struct NewItem {
    session: Arc<Session>,
    record: ScrapedItem,
}

impl NewItem {
    pub fn complete(self) -> Result<()> {
        self.session.complete_item(self.record)
    }
}

impl Deref for NewItem {
    type Target = ScrapedItem;

    fn deref(&self) -> &ScrapedItem {
        &self.record
    }
}

impl DerefMut for NewItem {
    fn deref_mut(&mut self) -> &mut ScrapedItem {
        &mut self.record
    }
}

/// Collection under construction (import only)
pub struct NewCollection {
    session: Arc<Session>,
    collection: ScrapedCollection,
}

impl NewCollection {
    pub fn complete(self) -> Result<()> {
        self.session.complete_collection(self.collection)
    }
}

impl Deref for NewCollection {
    type Target = ScrapedCollection;

    fn deref(&self) -> &ScrapedCollection {
        &self.collection
    }
}

impl DerefMut for NewCollection {
    fn deref_mut(&mut self) -> &mut ScrapedCollection {
        &mut self.collection
    }
}

fn new_item(session: &Arc<Session>, item_type: &str) -> NewItem {
    let mut record = ScrapedItem::default();
    if !item_type.is_empty() {
        record.item_type = Some(item_type.to_string());
    }
    NewItem {
        session: session.clone(),
        record,
    }
}

/// Import capabilities: push-style records and collections, text or graph input
#[derive(Clone)]
pub struct ImportScope {
    scope: Scope,
}

impl ImportScope {
    /// An empty `item_type` leaves the type for the translator to fill in
    pub fn new_item(&self, item_type: &str) -> NewItem {
        new_item(self.scope.session(), item_type)
    }

    pub fn new_collection(&self, name: &str) -> NewCollection {
        NewCollection {
            session: self.scope.session().clone(),
            collection: ScrapedCollection::new(name),
        }
    }

    /// Line mode: the next line without its terminator. Block mode: all
    /// remaining text. `None` at end of input.
    pub fn read(&self) -> Result<Option<String>> {
        self.scope.session().read_text()
    }

    /// Up to `count` characters (block mode)
    pub fn read_chars(&self, count: usize) -> Result<Option<String>> {
        self.scope.session().read_chars(count)
    }

    pub fn set_character_set(&self, label: &str) -> Result<()> {
        self.scope.session().set_input_charset(label)
    }

    /// Graph mode: the input parsed into a statement store
    pub fn graph(&self) -> Result<GraphHandle> {
        self.scope.session().graph()
    }
}

impl Deref for ImportScope {
    type Target = Scope;

    fn deref(&self) -> &Scope {
        &self.scope
    }
}

/// Web capture capabilities
#[derive(Clone)]
pub struct WebScope {
    scope: Scope,
}

impl WebScope {
    pub fn new_item(&self, item_type: &str) -> NewItem {
        new_item(self.scope.session(), item_type)
    }

    /// Ask the caller which candidates to keep.
    ///
    /// Returns every candidate unchanged when nobody handles selection.
    pub fn select_items(&self, candidates: Vec<SelectCandidate>) -> Result<Vec<SelectCandidate>> {
        self.scope.session().select_items(candidates)
    }
}

impl Deref for WebScope {
    type Target = Scope;

    fn deref(&self) -> &Scope {
        &self.scope
    }
}

/// Search capabilities
#[derive(Clone)]
pub struct SearchScope {
    scope: Scope,
}

impl SearchScope {
    pub fn new_item(&self, item_type: &str) -> NewItem {
        new_item(self.scope.session(), item_type)
    }

    pub fn select_items(&self, candidates: Vec<SelectCandidate>) -> Result<Vec<SelectCandidate>> {
        self.scope.session().select_items(candidates)
    }
}

impl Deref for SearchScope {
    type Target = Scope;

    fn deref(&self) -> &Scope {
        &self.scope
    }
}

/// Export capabilities: pull-style items and collections, text or graph output
#[derive(Clone)]
pub struct ExportScope {
    scope: Scope,
}

impl ExportScope {
    pub fn next_item(&self) -> Result<Option<ExportItem>> {
        self.scope.session().next_item()
    }

    /// Only yields collections when the translator configured `getCollections`
    pub fn next_collection(&self) -> Result<Option<ExportCollection>> {
        self.scope.session().next_collection()
    }

    pub fn write(&self, text: &str) -> Result<()> {
        self.scope.session().write(text)
    }

    pub fn set_character_set(&self, label: &str) -> Result<()> {
        self.scope.session().set_output_charset(label)
    }

    /// Graph mode: a store serialized to the output when the export completes
    pub fn graph(&self) -> Result<GraphHandle> {
        self.scope.session().graph()
    }
}

impl Deref for ExportScope {
    type Target = Scope;

    fn deref(&self) -> &Scope {
        &self.scope
    }
}

/// The capability set for one context, tagged by mode
#[derive(Clone)]
pub enum Capabilities {
    Import(ImportScope),
    Export(ExportScope),
    Web(WebScope),
    Search(SearchScope),
}

impl Capabilities {
    /// The capabilities every mode shares
    pub fn scope(&self) -> &Scope {
        match self {
            Capabilities::Import(scope) => scope,
            Capabilities::Export(scope) => scope,
            Capabilities::Web(scope) => scope,
            Capabilities::Search(scope) => scope,
        }
    }

    pub fn mode(&self) -> Mode {
        match self {
            Capabilities::Import(_) => Mode::Import,
            Capabilities::Export(_) => Mode::Export,
            Capabilities::Web(_) => Mode::Web,
            Capabilities::Search(_) => Mode::Search,
        }
    }
}

/// Assembles the capability set matching a session's mode
pub struct CapabilityBuilder {
    session: Arc<Session>,
}

impl CapabilityBuilder {
    pub(crate) fn new(session: Arc<Session>) -> Self {
        Self { session }
    }

    pub fn build(self) -> Capabilities {
        let mode = self.session.mode();
        let scope = Scope::new(self.session);
        match mode {
            Mode::Import => Capabilities::Import(ImportScope { scope }),
            Mode::Export => Capabilities::Export(ExportScope { scope }),
            Mode::Web => Capabilities::Web(WebScope { scope }),
            Mode::Search => Capabilities::Search(SearchScope { scope }),
        }
    }
}
