//! Operation state
//!
//! Everything an operation remembers between calls, behind one mutex.
//! Translator code and handlers never run while this state is locked.

use super::export::ExportSelection;
use super::session::Session;
use crate::core::error::TranslateError;
use crate::io::reader::ImportSource;
use crate::io::writer::ExportTarget;
use crate::library::models::ItemId;
use crate::pipeline::records::ScrapedItem;
use crate::pipeline::saver::ItemSaver;
use crate::translator::search::TranslatorSearch;
use crate::translator::types::{Document, FoundTranslator, OptionMap, TranslatorDescriptor, TranslatorId};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use tokio::sync::oneshot;

/// Lifecycle phase
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Phase {
    #[default]
    Idle,
    Detecting,
    Executing,
    Completing,
    Done,
}

impl Phase {
    pub fn is_busy(&self) -> bool {
        matches!(self, Phase::Detecting | Phase::Executing | Phase::Completing)
    }
}

/// What happens when a detection search finishes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum AfterDetect {
    /// Deliver the found set to the caller
    Report,
    /// Search mode: run the found translators in order
    Execute,
}

/// The operation's input and output bindings
#[derive(Debug, Clone, Default)]
pub(crate) struct Targets {
    pub import: Option<ImportSource>,
    pub document: Option<Document>,
    pub query: Option<ScrapedItem>,
    pub selection: Option<ExportSelection>,
    pub output: Option<ExportTarget>,
}

#[derive(Default)]
pub(crate) struct OperationState {
    pub phase: Phase,
    pub targets: Targets,
    /// Explicitly selected translators
    pub translators: Vec<Arc<TranslatorDescriptor>>,
    /// Caller-supplied display options
    pub display_options: OptionMap,

    pub search: Option<TranslatorSearch>,
    pub after_detect: Option<AfterDetect>,
    pub found: Vec<FoundTranslator>,
    /// Options configured during detection, carried into execution
    pub detect_options: HashMap<TranslatorId, OptionMap>,

    pub exec_queue: VecDeque<FoundTranslator>,
    pub saver: Option<Arc<Mutex<ItemSaver>>>,
    /// Session whose completion the operation is waiting for
    pub session: Option<Arc<Session>>,

    pub completed: bool,
    pub success: Option<bool>,
    pub last_error: Option<TranslateError>,
    pub output: Option<String>,
    pub saved: Vec<ItemId>,

    pub detect_waiters: Vec<oneshot::Sender<crate::core::error::Result<Vec<FoundTranslator>>>>,
    pub done_waiters: Vec<oneshot::Sender<bool>>,
}

impl OperationState {
    /// Whether `session` is the one the operation is waiting on
    pub fn is_current(&self, session: &Arc<Session>) -> bool {
        self.session.as_ref().map_or(false, |s| Arc::ptr_eq(s, session))
    }

    /// Clear results of a previous run
    pub fn reset_run(&mut self) {
        self.completed = false;
        self.success = None;
        self.last_error = None;
        self.output = None;
        self.saved.clear();
        self.exec_queue.clear();
        self.saver = None;
        self.session = None;
    }
}
