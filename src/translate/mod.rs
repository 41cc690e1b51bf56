//! Operation orchestrator
//!
//! A [`Translate`] is one import, export, web capture or search operation.
//! It moves through `Idle -> Detecting -> Executing -> Completing -> Done`,
//! creating a fresh [`Session`] whenever the phase or translator changes, and
//! fires the terminal `done` notification exactly once per run.
//!
//! The core is synchronous: translator code runs on the calling thread and
//! may suspend with `wait()`, in which case whichever thread later calls
//! `done()` drives the operation forward. `detect()` and `run()` wrap this
//! for async callers.

pub mod delegate;
pub mod events;
pub mod export;
pub mod report;
pub mod session;
mod state;

pub use delegate::ChildTranslator;
pub use events::{Handlers, SelectCandidate, SubscriptionId};
pub use export::{ExportAttachment, ExportCollection, ExportItem, ExportNote, ExportSelection};
pub use report::{ErrorReporter, HttpReporter};
pub use session::{Session, SessionPhase};
pub use state::Phase;

use crate::core::config::{IoConfig, PrefsConfig};
use crate::core::error::{ErrorReport, Result, TranslateError};
use crate::io::charset::Charset;
use crate::io::reader::ImportSource;
use crate::io::writer::{ExportTarget, TextWriter};
use crate::library::models::{CollectionId, ItemId};
use crate::library::store::LibraryStore;
use crate::pipeline::attachments::AttachmentFetcher;
use crate::pipeline::records::ScrapedItem;
use crate::pipeline::saver::ItemSaver;
use crate::translator::engine::ScriptEngine;
use crate::translator::registry::TranslatorRegistry;
use crate::translator::sandbox::{Capabilities, CapabilityBuilder};
use crate::translator::search::{SearchStep, SearchTarget, TranslatorSearch};
use crate::translator::types::{Detection, Document, FoundTranslator, Mode, OptionMap, TranslatorDescriptor};
use events::SelectHandler;
use export::{embedded_layout, ItemGetter};
use serde_json::Value;
use session::{
    detection_value, truthy, EntryInput, EntryOutcome, SessionInit, EXPORT_CHARSET_OPTION, EXPORT_FILE_DATA_OPTION,
};
use state::{AfterDetect, OperationState, Targets};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};

/// Detection result naming several records rather than an item type
const MULTIPLE_ITEM_TYPE: &str = "multiple";

/// Collaborators shared by every operation
#[derive(Clone)]
pub struct Services {
    pub registry: Arc<dyn TranslatorRegistry>,
    pub engine: Arc<dyn ScriptEngine>,
    pub store: Arc<dyn LibraryStore>,
    pub fetcher: Arc<dyn AttachmentFetcher>,
    pub reporter: Option<Arc<dyn ErrorReporter>>,
    pub prefs: PrefsConfig,
    pub io: IoConfig,
}

impl Services {
    pub fn new(
        registry: Arc<dyn TranslatorRegistry>,
        engine: Arc<dyn ScriptEngine>,
        store: Arc<dyn LibraryStore>,
        fetcher: Arc<dyn AttachmentFetcher>,
    ) -> Self {
        Self {
            registry,
            engine,
            store,
            fetcher,
            reporter: None,
            prefs: PrefsConfig::default(),
            io: IoConfig::default(),
        }
    }

    pub fn with_prefs(mut self, prefs: PrefsConfig) -> Self {
        self.prefs = prefs;
        self
    }

    pub fn with_io(mut self, io: IoConfig) -> Self {
        self.io = io;
        self
    }

    pub fn with_reporter(mut self, reporter: Arc<dyn ErrorReporter>) -> Self {
        self.reporter = Some(reporter);
        self
    }
}

/// One translation operation
///
/// Cheap to clone; clones share the same operation.
#[derive(Clone)]
pub struct Translate {
    op: Arc<Operation>,
}

pub(crate) struct Operation {
    pub(crate) mode: Mode,
    pub(crate) services: Services,
    pub(crate) handlers: Handlers,
    /// Session of the translator that created this operation, if nested
    pub(crate) parent: Option<Arc<Session>>,
    state: Mutex<OperationState>,
}

impl Translate {
    pub fn new(mode: Mode, services: Services) -> Self {
        Self::build(mode, services, None)
    }

    pub(crate) fn child(mode: Mode, services: Services, parent: Arc<Session>) -> Self {
        Self::build(mode, services, Some(parent))
    }

    fn build(mode: Mode, services: Services, parent: Option<Arc<Session>>) -> Self {
        Self {
            op: Arc::new(Operation {
                mode,
                services,
                handlers: Handlers::new(),
                parent,
                state: Mutex::new(OperationState::default()),
            }),
        }
    }

    pub fn mode(&self) -> Mode {
        self.op.mode
    }

    /// Event subscriptions for this operation
    pub fn handlers(&self) -> &Handlers {
        &self.op.handlers
    }

    pub fn phase(&self) -> Phase {
        self.op.lock().phase
    }

    /// Bind a file: the import input, or the export output
    pub fn set_location(&self, path: impl Into<PathBuf>) -> Result<()> {
        let path = path.into();
        let mut state = self.op.lock();
        match self.op.mode {
            Mode::Import => state.targets.import = Some(ImportSource::File(path)),
            Mode::Export => state.targets.output = Some(ExportTarget::File(path)),
            mode => {
                return Err(TranslateError::Validation(format!(
                    "{} operations do not take a file location",
                    mode
                )))
            }
        }
        Ok(())
    }

    /// Import from an in-memory string
    pub fn set_string(&self, text: impl Into<String>) {
        self.op.lock().targets.import = Some(ImportSource::Text(text.into()));
    }

    pub fn set_document(&self, document: Document) {
        self.op.lock().targets.document = Some(document);
    }

    /// Search query: a partial record (e.g. just a DOI or ISBN)
    pub fn set_search(&self, query: ScrapedItem) {
        self.op.lock().targets.query = Some(query);
    }

    pub fn set_items(&self, items: Vec<ItemId>) {
        self.op.lock().targets.selection = Some(ExportSelection::Items(items));
    }

    pub fn set_collection(&self, collection: CollectionId) {
        self.op.lock().targets.selection = Some(ExportSelection::Collection(collection));
    }

    pub fn set_library(&self) {
        self.op.lock().targets.selection = Some(ExportSelection::Library);
    }

    /// Select one translator by ID
    pub fn set_translator(&self, id: &str) -> Result<()> {
        let descriptor = self
            .op
            .services
            .registry
            .get(id)
            .ok_or_else(|| TranslateError::NotFound(format!("translator {}", id)))?;
        self.set_translators(vec![descriptor]);
        Ok(())
    }

    /// Select translators explicitly; an empty list clears the selection
    pub fn set_translators(&self, translators: Vec<Arc<TranslatorDescriptor>>) {
        self.op.lock().translators = translators;
    }

    /// Display options overriding the translator's header defaults
    pub fn set_display_options(&self, options: OptionMap) {
        self.op.lock().display_options = options;
    }

    /// Start detection.
    ///
    /// Results arrive through the `translators` handlers and `found()`. When
    /// every detection routine completes synchronously they are available
    /// as soon as this returns. A search already in progress is cancelled.
    pub fn get_translators(&self) -> Result<()> {
        self.op.start_detection(None)
    }

    /// Start the operation with the selected translator.
    ///
    /// In search mode without a selection, detection runs first and the found
    /// translators are tried in order.
    pub fn translate(&self) -> Result<()> {
        self.op.start_translate(None)
    }

    /// Cancel a running detection search
    pub fn cancel(&self) {
        self.op.cancel();
    }

    /// Translators found by the last completed detection
    pub fn found(&self) -> Vec<FoundTranslator> {
        self.op.lock().found.clone()
    }

    /// Outcome of the last run; `None` until it completes
    pub fn success(&self) -> Option<bool> {
        self.op.lock().success
    }

    /// Output of an export to an in-memory string
    pub fn output(&self) -> Option<String> {
        self.op.lock().output.clone()
    }

    /// Items persisted by the last run
    pub fn saved_items(&self) -> Vec<ItemId> {
        self.op.lock().saved.clone()
    }

    /// Error that failed the last run
    pub fn take_error(&self) -> Option<TranslateError> {
        self.op.lock().last_error.take()
    }

    /// Run detection and wait for the found set
    pub async fn detect(&self) -> Result<Vec<FoundTranslator>> {
        let (tx, rx) = oneshot::channel();
        let op = self.op.clone();
        tokio::task::spawn_blocking(move || op.start_detection(Some(tx)))
            .await
            .map_err(TranslateError::execution)??;
        rx.await.map_err(|_| TranslateError::Cancelled)?
    }

    /// Run the operation and wait for completion
    pub async fn run(&self) -> Result<bool> {
        let (tx, rx) = oneshot::channel();
        let op = self.op.clone();
        tokio::task::spawn_blocking(move || op.start_translate(Some(tx)))
            .await
            .map_err(TranslateError::execution)??;
        rx.await.map_err(|_| TranslateError::Cancelled)
    }
}

impl Operation {
    fn lock(&self) -> MutexGuard<'_, OperationState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Selection handler of this operation or the nearest ancestor
    pub(crate) fn select_handler(&self) -> Option<SelectHandler> {
        self.handlers.select_handler().or_else(|| {
            self.parent
                .as_ref()
                .and_then(|parent| parent.operation().ok())
                .and_then(|op| op.select_handler())
        })
    }

    fn search_target(&self, targets: &Targets) -> SearchTarget {
        match self.mode {
            Mode::Import => match &targets.import {
                Some(ImportSource::File(path)) => SearchTarget::Named(path.to_string_lossy().into_owned()),
                Some(ImportSource::Text(_)) => SearchTarget::Anonymous,
                None => SearchTarget::Unbound,
            },
            Mode::Web => match &targets.document {
                Some(document) => SearchTarget::Named(document.url.to_string()),
                None => SearchTarget::Unbound,
            },
            Mode::Search => match &targets.query {
                Some(_) => SearchTarget::Anonymous,
                None => SearchTarget::Unbound,
            },
            Mode::Export => SearchTarget::Unbound,
        }
    }

    fn check_target(&self, targets: &Targets) -> Result<()> {
        let missing = match self.mode {
            Mode::Import if targets.import.is_none() => Some("import location or string"),
            Mode::Web if targets.document.is_none() => Some("document"),
            Mode::Search if targets.query.is_none() => Some("search query"),
            _ => None,
        };
        match missing {
            Some(what) => Err(TranslateError::MissingTarget(what)),
            None => Ok(()),
        }
    }

    // ---- detection ----

    fn start_detection(
        self: &Arc<Self>,
        waiter: Option<oneshot::Sender<Result<Vec<FoundTranslator>>>>,
    ) -> Result<()> {
        {
            let mut state = self.lock();
            if matches!(state.phase, Phase::Executing | Phase::Completing) {
                return Err(TranslateError::Execution(
                    "cannot detect translators while a translation is running".to_string(),
                ));
            }
            if let Some(previous) = state.search.take() {
                debug!(mode = %self.mode, "Cancelling previous translator search");
                previous.cancel();
                for waiter in std::mem::take(&mut state.detect_waiters) {
                    let _ = waiter.send(Err(TranslateError::Cancelled));
                }
            }

            let candidates = if state.translators.is_empty() {
                self.services.registry.get_all_for_type(self.mode)
            } else {
                state.translators.clone()
            };
            let target = self.search_target(&state.targets);
            debug!(mode = %self.mode, candidates = candidates.len(), target = ?target, "Detecting translators");

            state.session = None;
            state.found.clear();
            state.detect_options.clear();
            state.search = Some(TranslatorSearch::new(self.mode, target, candidates));
            state.after_detect = Some(AfterDetect::Report);
            state.phase = Phase::Detecting;
            if let Some(waiter) = waiter {
                state.detect_waiters.push(waiter);
            }
        }
        self.drive_search();
        Ok(())
    }

    /// Run detection steps until the search suspends or ends
    fn drive_search(self: &Arc<Self>) {
        loop {
            let step = {
                let mut state = self.lock();
                let Some(search) = state.search.as_mut() else {
                    return;
                };
                let step = search.next();
                if !matches!(step, SearchStep::Detect(_)) {
                    state.search = None;
                }
                step
            };

            match step {
                SearchStep::Detect(descriptor) => {
                    let found = FoundTranslator {
                        descriptor,
                        item_type: None,
                    };
                    let session = match self.new_session(SessionPhase::Detect, &found) {
                        Ok(session) => session,
                        Err(e) => {
                            warn!(translator = %found.descriptor.label, error = %e, "Could not start detection");
                            let mut state = self.lock();
                            if let Some(search) = state.search.as_mut() {
                                search.record(&found.descriptor, Detection::NotFound);
                            }
                            continue;
                        }
                    };
                    self.lock().session = Some(session.clone());

                    match self.run_entry(&session) {
                        EntryOutcome::Finished(result) => {
                            if !self.record_detection(&session, result) {
                                return;
                            }
                        }
                        EntryOutcome::Suspended => {
                            debug!(translator = %session.descriptor().label, "Detection waiting for done()");
                            return;
                        }
                    }
                }
                SearchStep::Finished(found) => {
                    self.finish_detection(found);
                    return;
                }
                SearchStep::Cancelled => {
                    self.cancelled_detection();
                    return;
                }
            }
        }
    }

    /// Feed a detection outcome to the search; false if the session is stale
    fn record_detection(&self, session: &Arc<Session>, result: Result<Value>) -> bool {
        session.close_io();
        let descriptor = session.descriptor();
        let detection = match result {
            Ok(value) => Detection::from_value(&value),
            Err(e) => {
                warn!(translator = %descriptor.label, id = %descriptor.id, error = %e, "Detection failed");
                Detection::NotFound
            }
        };

        let mut state = self.lock();
        if !state.is_current(session) {
            debug!(translator = %descriptor.label, "Dropping result of a superseded detection");
            return false;
        }
        state.session = None;
        if detection.is_found() {
            state
                .detect_options
                .insert(descriptor.id.clone(), session.config_snapshot());
        }
        if let Some(search) = state.search.as_mut() {
            search.record(descriptor, detection);
        }
        true
    }

    fn finish_detection(self: &Arc<Self>, found: Vec<FoundTranslator>) {
        let (after, waiters) = {
            let mut state = self.lock();
            state.found = found.clone();
            let after = state.after_detect.take();
            if after != Some(AfterDetect::Execute) {
                state.phase = Phase::Idle;
            }
            (after, std::mem::take(&mut state.detect_waiters))
        };

        info!(mode = %self.mode, count = found.len(), "Translator detection finished");
        self.handlers.translators(&found);
        for waiter in waiters {
            let _ = waiter.send(Ok(found.clone()));
        }

        if after == Some(AfterDetect::Execute) {
            if found.is_empty() {
                self.complete(
                    None,
                    None,
                    Err(TranslateError::NotFound("no translator can handle this input".to_string())),
                );
                return;
            }
            {
                let mut state = self.lock();
                state.exec_queue = found.into();
                state.phase = Phase::Executing;
            }
            self.execute_next();
        }
    }

    fn cancelled_detection(self: &Arc<Self>) {
        let (after, waiters) = {
            let mut state = self.lock();
            state.session = None;
            let after = state.after_detect.take();
            if after != Some(AfterDetect::Execute) {
                state.phase = Phase::Idle;
            }
            (after, std::mem::take(&mut state.detect_waiters))
        };
        info!(mode = %self.mode, "Translator detection cancelled");
        for waiter in waiters {
            let _ = waiter.send(Err(TranslateError::Cancelled));
        }
        if after == Some(AfterDetect::Execute) {
            self.complete(None, None, Err(TranslateError::Cancelled));
        }
    }

    fn cancel(self: &Arc<Self>) {
        let in_flight = {
            let mut state = self.lock();
            let searching = match &state.search {
                Some(search) => {
                    search.cancel();
                    true
                }
                None => false,
            };
            searching && state.session.take().is_some()
        };
        // A suspended detection would otherwise only notice on its done()
        if in_flight {
            self.drive_search();
        }
    }

    // ---- execution ----

    fn start_translate(self: &Arc<Self>, waiter: Option<oneshot::Sender<bool>>) -> Result<()> {
        let detect_first = {
            let mut state = self.lock();
            if state.phase.is_busy() {
                return Err(TranslateError::Execution("operation already running".to_string()));
            }
            self.check_target(&state.targets)?;
            let detect_first = self.mode == Mode::Search && state.translators.is_empty();
            if state.translators.is_empty() && !detect_first {
                return Err(TranslateError::NoTranslator);
            }

            state.reset_run();
            if self.parent.is_none() {
                let mut saver = ItemSaver::new(
                    self.services.store.clone(),
                    self.services.fetcher.clone(),
                    self.services.prefs.clone(),
                    self.mode,
                );
                let base_dir = state
                    .targets
                    .import
                    .as_ref()
                    .and_then(|source| source.path())
                    .and_then(|path| path.parent())
                    .map(|dir| dir.to_path_buf());
                saver.set_base_dir(base_dir);
                state.saver = Some(Arc::new(Mutex::new(saver)));
            }
            if let Some(waiter) = waiter {
                state.done_waiters.push(waiter);
            }

            if detect_first {
                let candidates = self.services.registry.get_all_for_type(Mode::Search);
                state.found.clear();
                state.detect_options.clear();
                state.search = Some(TranslatorSearch::new(Mode::Search, SearchTarget::Anonymous, candidates));
                state.after_detect = Some(AfterDetect::Execute);
                state.phase = Phase::Detecting;
            } else {
                // Search tries every selected translator, the other modes run the first
                let take = if self.mode == Mode::Search { state.translators.len() } else { 1 };
                let queue: Vec<FoundTranslator> = state
                    .translators
                    .iter()
                    .take(take)
                    .map(|descriptor| FoundTranslator {
                        descriptor: descriptor.clone(),
                        item_type: state
                            .found
                            .iter()
                            .find(|f| f.descriptor.id == descriptor.id)
                            .and_then(|f| f.item_type.clone()),
                    })
                    .collect();
                state.exec_queue = queue.into();
                state.phase = Phase::Executing;
            }
            detect_first
        };

        info!(mode = %self.mode, nested = self.parent.is_some(), "Starting translation");
        if detect_first {
            self.drive_search();
        } else {
            self.execute_next();
        }
        Ok(())
    }

    fn execute_next(self: &Arc<Self>) {
        let next = self.lock().exec_queue.pop_front();
        let Some(found) = next else {
            self.complete(None, None, Err(TranslateError::NoTranslator));
            return;
        };

        let session = match self.new_session(SessionPhase::Execute, &found) {
            Ok(session) => session,
            Err(e) => {
                self.complete(None, Some(&found.descriptor), Err(e));
                return;
            }
        };
        self.lock().session = Some(session.clone());
        info!(mode = %self.mode, translator = %found.descriptor.label, "Running translator");

        match self.run_entry(&session) {
            EntryOutcome::Finished(result) => self.finish_execution(&session, result),
            EntryOutcome::Suspended => {
                debug!(translator = %found.descriptor.label, "Translation waiting for done()");
            }
        }
    }

    fn finish_execution(self: &Arc<Self>, session: &Arc<Session>, result: Result<Value>) {
        let descriptor = session.descriptor();
        let result = match result {
            Ok(Value::Bool(false)) => Err(TranslateError::Execution(format!("{} reported failure", descriptor.label))),
            Ok(_) => Ok(()),
            Err(e) => Err(e),
        };

        if self.mode == Mode::Search {
            let more = !self.lock().exec_queue.is_empty();
            let empty = session.items_completed() == 0;
            if more && (result.is_err() || empty) {
                match &result {
                    Err(e) => warn!(translator = %descriptor.label, error = %e, "Search translator failed; trying the next one"),
                    Ok(()) => info!(translator = %descriptor.label, "Search translator found nothing; trying the next one"),
                }
                session.close_io();
                self.lock().session = None;
                self.execute_next();
                return;
            }
        }

        self.complete(Some(session), Some(session.descriptor_arc()), result);
    }

    /// Called by a session once its `done()` has been delivered
    pub(crate) fn resume(self: &Arc<Self>, session: &Arc<Session>, outcome: Result<Value>) {
        if !self.lock().is_current(session) {
            debug!(translator = %session.descriptor().label, "Ignoring done() from a superseded session");
            return;
        }
        match session.phase() {
            SessionPhase::Detect => {
                if self.record_detection(session, outcome) {
                    self.drive_search();
                }
            }
            SessionPhase::Execute => self.finish_execution(session, outcome),
        }
    }

    fn new_session(self: &Arc<Self>, phase: SessionPhase, found: &FoundTranslator) -> Result<Arc<Session>> {
        let descriptor = found.descriptor.clone();
        let (targets, detected, caller_display, saver) = {
            let state = self.lock();
            (
                state.targets.clone(),
                state.detect_options.get(&descriptor.id).cloned(),
                state.display_options.clone(),
                state.saver.clone(),
            )
        };

        let mut config = descriptor.config_options.clone();
        if phase == SessionPhase::Execute {
            if let Some(detected) = detected {
                config.extend(detected);
            }
        }
        let mut display = descriptor.display_options.clone();
        display.extend(caller_display);

        let input = match self.mode {
            Mode::Web => targets.document.clone().map(EntryInput::Document),
            Mode::Search => targets.query.clone().map(EntryInput::Query),
            _ => None,
        }
        .unwrap_or(EntryInput::None);

        let (writer, getter) = if self.mode == Mode::Export && phase == SessionPhase::Execute {
            let (writer, getter) = self.export_io(&targets, &display)?;
            (Some(writer), Some(getter))
        } else {
            (None, None)
        };

        if phase == SessionPhase::Execute && matches!(self.mode, Mode::Web | Mode::Search) {
            if let Some(saver) = &saver {
                saver
                    .lock()
                    .unwrap_or_else(|p| p.into_inner())
                    .set_default_item_type(found.item_type.clone().filter(|t| t != MULTIPLE_ITEM_TYPE));
            }
        }

        let default_charset = Charset::for_label(&self.services.io.default_import_charset).unwrap_or(Charset::Utf8);
        Ok(Session::new(
            self,
            SessionInit {
                phase,
                descriptor,
                config,
                display,
                input,
                source: targets.import,
                default_charset,
                writer,
                getter,
                saver,
            },
        ))
    }

    /// Output writer and item source for an export session
    fn export_io(&self, targets: &Targets, display: &OptionMap) -> Result<(TextWriter, ItemGetter)> {
        let selection = targets.selection.clone().unwrap_or(ExportSelection::Library);
        let mut getter = ItemGetter::new(self.services.store.clone(), &selection)?;
        let mut output = targets.output.clone().unwrap_or(ExportTarget::Memory);

        if display.get(EXPORT_FILE_DATA_OPTION).map_or(false, truthy) {
            if let ExportTarget::File(path) = &output {
                let (file, dir) = embedded_layout(path)?;
                std::fs::create_dir_all(&dir)?;
                debug!(dir = %dir.display(), "Exporting attachment files alongside output");
                getter = getter.with_file_dir(Some(dir));
                output = ExportTarget::File(file);
            }
        }

        let charset = Charset::for_label(&self.services.io.export_charset).unwrap_or(Charset::Utf8);
        let mut writer = TextWriter::new(output, charset, self.services.io.write_bom);
        if let Some(label) = display.get(EXPORT_CHARSET_OPTION).and_then(Value::as_str) {
            writer.set_charset(label)?;
        }
        Ok((writer, getter))
    }

    /// Call the session's entry point for its mode and phase
    fn run_entry(&self, session: &Arc<Session>) -> EntryOutcome {
        let code = match self.services.engine.eval(session.descriptor()) {
            Ok(code) => code,
            Err(e) => return EntryOutcome::Finished(Err(e)),
        };
        let capabilities = CapabilityBuilder::new(session.clone()).build();
        let detect = session.phase() == SessionPhase::Detect;

        session.begin_entry();
        let returned = match (&capabilities, session.input()) {
            (Capabilities::Import(scope), _) if detect => code.detect_import(scope).map(detection_value),
            (Capabilities::Import(scope), _) => code.do_import(scope).map(|_| Value::Bool(true)),
            (Capabilities::Web(scope), EntryInput::Document(document)) if detect => {
                code.detect_web(scope, document, &document.url).map(detection_value)
            }
            (Capabilities::Web(scope), EntryInput::Document(document)) => {
                code.do_web(scope, document, &document.url).map(|_| Value::Bool(true))
            }
            (Capabilities::Search(scope), EntryInput::Query(query)) if detect => {
                code.detect_search(scope, query).map(detection_value)
            }
            (Capabilities::Search(scope), EntryInput::Query(query)) => {
                code.do_search(scope, query).map(|_| Value::Bool(true))
            }
            (Capabilities::Export(_), _) if detect => Ok(Value::Bool(true)),
            (Capabilities::Export(scope), _) => code.do_export(scope).map(|_| Value::Bool(true)),
            (Capabilities::Web(_), _) => Err(TranslateError::MissingTarget("document")),
            (Capabilities::Search(_), _) => Err(TranslateError::MissingTarget("search query")),
        };
        session.after_entry(returned)
    }

    // ---- completion ----

    /// Finish the run. Every path ends here; only the first call counts.
    fn complete(
        &self,
        session: Option<&Arc<Session>>,
        translator: Option<&Arc<TranslatorDescriptor>>,
        outcome: Result<()>,
    ) {
        let saver = {
            let mut state = self.lock();
            if state.completed {
                debug!(mode = %self.mode, "Operation already completed");
                return;
            }
            state.completed = true;
            state.phase = Phase::Completing;
            state.session = None;
            state.saver.clone()
        };

        let mut outcome = outcome;
        let mut output = None;
        if let Some(session) = session {
            if let Err(e) = session.finish_io() {
                warn!(error = %e, "Closing translation output failed");
                if outcome.is_ok() {
                    outcome = Err(e);
                }
            }
            output = session.output();
        }

        let mut saved = Vec::new();
        if let Some(saver) = saver {
            let mut saver = saver.lock().unwrap_or_else(|p| p.into_inner());
            if let Err(e) = saver.finish() {
                warn!(error = %e, "Resolving related items failed");
            }
            saved = saver.saved_items().to_vec();
        }

        let success = outcome.is_ok();
        let failure = outcome.err();
        match &failure {
            Some(e) => self.report_failure(e, translator.map(|t| &**t)),
            None => info!(mode = %self.mode, items = saved.len(), "Translation complete"),
        }

        let waiters = {
            let mut state = self.lock();
            state.phase = Phase::Done;
            state.success = Some(success);
            state.last_error = failure;
            state.output = output;
            state.saved = saved;
            std::mem::take(&mut state.done_waiters)
        };
        for waiter in waiters {
            let _ = waiter.send(success);
        }
        self.handlers.done(success);
    }

    fn report_failure(&self, e: &TranslateError, translator: Option<&TranslatorDescriptor>) {
        let report = ErrorReport::new(
            e,
            translator.map(|t| t.id.clone()),
            translator.map(|t| t.last_updated.clone()),
        );
        error!(
            mode = %self.mode,
            translator = translator.map(|t| t.label.as_str()).unwrap_or("none"),
            error = %e,
            trace_id = %report.trace_id,
            "Translation failed"
        );
        self.handlers.error(e, &report);

        let wanted = self.mode == Mode::Web
            && self.parent.is_none()
            && self.services.prefs.report_translation_failure
            && translator.map_or(false, |t| t.in_repository);
        if let (true, Some(reporter)) = (wanted, &self.services.reporter) {
            if let Err(re) = reporter.report(&report) {
                warn!(error = %re, "Could not send failure report");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::library::memory::MemoryStore;
    use crate::pipeline::attachments::tests::StaticFetcher;
    use crate::translator::engine::{NativeEngine, TranslatorCode};
    use crate::translator::registry::{StaticSource, TranslatorCache};
    use crate::translator::sandbox::{ImportScope, SearchScope, WebScope};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use url::Url;

    fn header(id: &str, types: u8, target: &str, priority: i32) -> String {
        format!(
            r#"{{"translatorID": "{id}", "label": "{id}", "translatorType": {types}, "target": "{target}", "priority": {priority}, "lastUpdated": "2024-03-01 10:00:00", "inRepository": true}}
native:{id}"#
        )
    }

    fn leak(text: String) -> &'static str {
        Box::leak(text.into_boxed_str())
    }

    struct Fixture {
        services: Services,
        store: Arc<MemoryStore>,
    }

    fn fixture(headers: Vec<String>, engine: NativeEngine) -> Fixture {
        let cache = TranslatorCache::new().with_source(StaticSource::new("test", headers.into_iter().map(leak).collect()));
        cache.init().unwrap();
        let store = Arc::new(MemoryStore::new());
        let services = Services::new(
            Arc::new(cache),
            Arc::new(engine),
            store.clone(),
            Arc::new(StaticFetcher::ok()),
        );
        Fixture { services, store }
    }

    /// Imports one journal article per non-empty input line
    struct LineImporter;

    impl TranslatorCode for LineImporter {
        fn detect_import(&self, scope: &ImportScope) -> Result<Detection> {
            Ok(scope.read()?.map_or(false, |text| text.starts_with("TY")).into())
        }

        fn do_import(&self, scope: &ImportScope) -> Result<()> {
            scope.configure("dataMode", Value::from("line"));
            while let Some(line) = scope.read()? {
                if line.trim().is_empty() {
                    continue;
                }
                let mut item = scope.new_item("journalArticle");
                item.set_field("title", line.trim());
                item.complete()?;
            }
            Ok(())
        }
    }

    /// Suspends and signals done() from another thread
    struct Deferred;

    impl TranslatorCode for Deferred {
        fn do_import(&self, scope: &ImportScope) -> Result<()> {
            scope.wait();
            let scope = scope.clone();
            std::thread::spawn(move || {
                let mut item = scope.new_item("book");
                item.set_field("title", "Later");
                item.complete().unwrap();
                scope.done();
            });
            Ok(())
        }
    }

    /// Calls done() twice
    struct DoubleDone;

    impl TranslatorCode for DoubleDone {
        fn do_import(&self, scope: &ImportScope) -> Result<()> {
            scope.wait();
            scope.done();
            scope.done();
            Ok(())
        }
    }

    #[test]
    fn test_import_saves_records() {
        let mut engine = NativeEngine::new();
        engine.register("lines", Arc::new(LineImporter));
        let fx = fixture(vec![header("lines", 1, "txt", 100)], engine);

        let translate = Translate::new(Mode::Import, fx.services.clone());
        translate.set_string("First\n\nSecond\n");
        translate.set_translator("lines").unwrap();

        let done = Arc::new(AtomicUsize::new(0));
        let d = done.clone();
        translate.handlers().on_done(Arc::new(move |success: bool| {
            assert!(success);
            d.fetch_add(1, Ordering::SeqCst);
        }));

        translate.translate().unwrap();
        assert_eq!(translate.success(), Some(true));
        assert_eq!(translate.phase(), Phase::Done);
        assert_eq!(translate.saved_items().len(), 2);
        assert_eq!(done.load(Ordering::SeqCst), 1);
        assert_eq!(fx.store.item_ids().unwrap().len(), 2);
    }

    #[test]
    fn test_translate_without_translator() {
        let fx = fixture(vec![], NativeEngine::new());
        let translate = Translate::new(Mode::Import, fx.services);
        translate.set_string("anything");
        assert!(matches!(translate.translate(), Err(TranslateError::NoTranslator)));
        assert_eq!(translate.success(), None);
    }

    #[test]
    fn test_missing_target() {
        let fx = fixture(vec![header("lines", 1, "txt", 100)], NativeEngine::new());
        let translate = Translate::new(Mode::Import, fx.services);
        translate.set_translator("lines").unwrap();
        assert!(matches!(translate.translate(), Err(TranslateError::MissingTarget(_))));
    }

    #[test]
    fn test_done_delivered_once() {
        let mut engine = NativeEngine::new();
        engine.register("twice", Arc::new(DoubleDone));
        let fx = fixture(vec![header("twice", 1, "txt", 100)], engine);

        let translate = Translate::new(Mode::Import, fx.services);
        translate.set_string("x");
        translate.set_translator("twice").unwrap();
        let done = Arc::new(AtomicUsize::new(0));
        let d = done.clone();
        translate.handlers().on_done(Arc::new(move |_: bool| {
            d.fetch_add(1, Ordering::SeqCst);
        }));

        translate.translate().unwrap();
        assert_eq!(done.load(Ordering::SeqCst), 1);
        assert_eq!(translate.success(), Some(true));
    }

    #[tokio::test]
    async fn test_async_done_from_other_thread() {
        let mut engine = NativeEngine::new();
        engine.register("deferred", Arc::new(Deferred));
        let fx = fixture(vec![header("deferred", 1, "txt", 100)], engine);

        let translate = Translate::new(Mode::Import, fx.services.clone());
        translate.set_string("ignored");
        translate.set_translator("deferred").unwrap();

        assert!(translate.run().await.unwrap());
        assert_eq!(translate.saved_items().len(), 1);
    }

    #[test]
    fn test_import_fallback_ignores_extension() {
        let mut engine = NativeEngine::new();
        engine.register("lines", Arc::new(LineImporter));
        let fx = fixture(vec![header("lines", 1, "ris", 100)], engine);

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("refs.txt");
        std::fs::write(&path, "TY  - JOUR\n").unwrap();

        let translate = Translate::new(Mode::Import, fx.services);
        translate.set_location(&path).unwrap();
        translate.get_translators().unwrap();

        let found = translate.found();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].descriptor.id, "lines");
        assert_eq!(translate.phase(), Phase::Idle);
    }

    #[tokio::test]
    async fn test_detect_reports_found_set() {
        let mut engine = NativeEngine::new();
        engine.register("lines", Arc::new(LineImporter));
        let fx = fixture(vec![header("lines", 1, "ris", 100)], engine);

        let translate = Translate::new(Mode::Import, fx.services);
        translate.set_string("no match here");
        assert!(translate.detect().await.unwrap().is_empty());

        translate.set_string("TY  - BOOK");
        assert_eq!(translate.detect().await.unwrap().len(), 1);
    }

    struct Picker;

    impl TranslatorCode for Picker {
        fn detect_web(&self, _scope: &WebScope, _document: &Document, _url: &Url) -> Result<Detection> {
            Ok("multiple".into())
        }

        fn do_web(&self, scope: &WebScope, _document: &Document, _url: &Url) -> Result<()> {
            let chosen = scope.select_items(vec![
                ("a".to_string(), "Alpha".to_string()),
                ("b".to_string(), "Beta".to_string()),
            ])?;
            for (_, title) in chosen {
                let mut item = scope.new_item("webpage");
                item.set_field("title", title);
                item.complete()?;
            }
            scope.select_items(Vec::new())?;
            Ok(())
        }
    }

    #[test]
    fn test_select_items_and_empty_selection() {
        let mut engine = NativeEngine::new();
        engine.register("picker", Arc::new(Picker));
        let fx = fixture(vec![header("picker", 4, "^https?://example\\\\.org/", 100)], engine);

        let translate = Translate::new(Mode::Web, fx.services);
        let url = Url::parse("https://example.org/list").unwrap();
        translate.set_document(Document::new(url, "<html></html>"));
        translate
            .handlers()
            .on_select(Arc::new(|candidates: &[SelectCandidate]| vec![candidates[1].0.clone()]));
        let errors = Arc::new(AtomicUsize::new(0));
        let e = errors.clone();
        translate.handlers().on_error(Arc::new(move |error: &TranslateError, _: &ErrorReport| {
            assert!(matches!(error, TranslateError::InvalidSelection(_)));
            e.fetch_add(1, Ordering::SeqCst);
        }));

        translate.get_translators().unwrap();
        assert_eq!(translate.found()[0].item_type.as_deref(), Some("multiple"));
        translate.set_translator("picker").unwrap();
        translate.translate().unwrap();

        // Beta was saved before the empty selection failed the run
        assert_eq!(translate.success(), Some(false));
        assert_eq!(translate.saved_items().len(), 1);
        assert_eq!(errors.load(Ordering::SeqCst), 1);
    }

    struct Exporter;

    impl TranslatorCode for Exporter {
        fn detect_web(&self, _scope: &WebScope, _document: &Document, _url: &Url) -> Result<Detection> {
            Ok(Detection::Found)
        }

        fn do_web(&self, scope: &WebScope, _document: &Document, _url: &Url) -> Result<()> {
            scope.load_translator(Mode::Export).map(|_| ())
        }
    }

    #[test]
    fn test_web_cannot_load_export_translator() {
        let mut engine = NativeEngine::new();
        engine.register("sneaky", Arc::new(Exporter));
        let fx = fixture(vec![header("sneaky", 4, "", 100)], engine);

        let translate = Translate::new(Mode::Web, fx.services);
        translate.set_document(Document::new(Url::parse("https://example.org/").unwrap(), ""));
        translate.set_translator("sneaky").unwrap();
        translate.translate().unwrap();

        assert_eq!(translate.success(), Some(false));
        assert!(matches!(translate.take_error(), Some(TranslateError::SecurityViolation(_))));
    }

    struct Finder {
        results: usize,
    }

    impl TranslatorCode for Finder {
        fn detect_search(&self, _scope: &SearchScope, query: &ScrapedItem) -> Result<Detection> {
            Ok(query.field("DOI").is_some().into())
        }

        fn do_search(&self, scope: &SearchScope, query: &ScrapedItem) -> Result<()> {
            for _ in 0..self.results {
                let mut item = scope.new_item("journalArticle");
                item.set_field("title", "Resolved");
                item.set_field("DOI", query.field("DOI").unwrap_or_default());
                item.complete()?;
            }
            Ok(())
        }
    }

    #[test]
    fn test_search_advances_past_empty_translator() {
        let mut engine = NativeEngine::new();
        engine.register("empty", Arc::new(Finder { results: 0 }));
        engine.register("full", Arc::new(Finder { results: 1 }));
        let fx = fixture(vec![header("empty", 8, "", 10), header("full", 8, "", 20)], engine);

        let translate = Translate::new(Mode::Search, fx.services);
        let mut query = ScrapedItem::default();
        query.set_field("DOI", "10.1000/xyz");
        translate.set_search(query);

        translate.translate().unwrap();
        assert_eq!(translate.found().len(), 2);
        assert_eq!(translate.success(), Some(true));
        assert_eq!(translate.saved_items().len(), 1);
    }

    /// Records tags as typed and untyped
    struct Tagger;

    impl TranslatorCode for Tagger {
        fn do_import(&self, scope: &ImportScope) -> Result<()> {
            let mut item = scope.new_item("book");
            item.set_field("title", "Tagged");
            item.tags.push("plain".into());
            item.tags.push(crate::pipeline::records::ScrapedTag::Typed {
                tag: "auto".to_string(),
                kind: crate::library::models::TAG_KIND_AUTOMATIC,
            });
            item.complete()
        }
    }

    #[test]
    fn test_detection_items_ignored() {
        struct Eager;
        impl TranslatorCode for Eager {
            fn detect_import(&self, scope: &ImportScope) -> Result<Detection> {
                let mut item = scope.new_item("book");
                item.set_field("title", "Too early");
                item.complete()?;
                Ok(Detection::Found)
            }
        }

        let mut engine = NativeEngine::new();
        engine.register("eager", Arc::new(Eager));
        let fx = fixture(vec![header("eager", 1, "", 100)], engine);

        let translate = Translate::new(Mode::Import, fx.services);
        translate.set_string("x");
        translate.get_translators().unwrap();
        assert_eq!(translate.found().len(), 1);
        assert!(fx.store.item_ids().unwrap().is_empty());
    }

    #[test]
    fn test_typed_tags_keep_kind() {
        let mut engine = NativeEngine::new();
        engine.register("tagger", Arc::new(Tagger));
        let fx = fixture(vec![header("tagger", 1, "", 100)], engine);

        let translate = Translate::new(Mode::Import, fx.services);
        translate.set_string("x");
        translate.set_translator("tagger").unwrap();
        translate.translate().unwrap();

        let id = translate.saved_items()[0];
        let item = fx.store.get_item(id).unwrap().unwrap();
        let auto = item.tags.iter().find(|t| t.name == "auto").unwrap();
        assert_eq!(auto.kind, crate::library::models::TAG_KIND_AUTOMATIC);
    }

    /// Untyped web records, typed by whatever detection reported
    struct DetectedAs(&'static str);

    impl TranslatorCode for DetectedAs {
        fn detect_web(&self, _scope: &WebScope, _document: &Document, _url: &Url) -> Result<Detection> {
            Ok(self.0.into())
        }

        fn do_web(&self, scope: &WebScope, _document: &Document, _url: &Url) -> Result<()> {
            let mut item = scope.new_item("");
            item.set_field("title", "Page");
            item.complete()
        }
    }

    fn detect_and_run_web(services: &Services, id: &str) -> Translate {
        let translate = Translate::new(Mode::Web, services.clone());
        translate.set_document(Document::new(Url::parse("https://example.org/a").unwrap(), ""));
        translate.get_translators().unwrap();
        translate.set_translator(id).unwrap();
        translate.translate().unwrap();
        translate
    }

    #[test]
    fn test_multiple_is_not_a_default_item_type() {
        let mut engine = NativeEngine::new();
        engine.register("single", Arc::new(DetectedAs("book")));
        engine.register("multi", Arc::new(DetectedAs("multiple")));
        let fx = fixture(vec![header("single", 4, "", 10), header("multi", 4, "", 20)], engine);

        let single = detect_and_run_web(&fx.services, "single");
        assert_eq!(single.success(), Some(true), "{:?}", single.take_error());
        let item = fx.store.get_item(single.saved_items()[0]).unwrap().unwrap();
        assert_eq!(item.item_type, "book");

        let multi = detect_and_run_web(&fx.services, "multi");
        assert_eq!(multi.success(), Some(false));
        match multi.take_error() {
            Some(TranslateError::Validation(message)) => assert!(message.contains("no itemType"), "{}", message),
            other => panic!("unexpected outcome: {:?}", other),
        }
    }

    fn fixture_with_builtins(headers: Vec<String>, mut engine: NativeEngine) -> Fixture {
        crate::translators::register_builtins(&mut engine);
        let cache = TranslatorCache::new()
            .with_source(StaticSource::new("test", headers.into_iter().map(leak).collect()))
            .with_source(crate::translators::builtin_source());
        cache.init().unwrap();
        let store = Arc::new(MemoryStore::new());
        let services = Services::new(
            Arc::new(cache),
            Arc::new(engine),
            store.clone(),
            Arc::new(StaticFetcher::ok()),
        );
        Fixture { services, store }
    }

    const CHILD_RIS: &str = "TY  - JOUR\nTI  - Delegated Article\nAU  - Hopper, Grace\nPY  - 1952\nER  - \n";

    /// Web translator that hands the page text to a nested importer
    struct Delegator {
        child: &'static str,
    }

    impl TranslatorCode for Delegator {
        fn detect_web(&self, _scope: &WebScope, _document: &Document, _url: &Url) -> Result<Detection> {
            Ok(Detection::Found)
        }

        fn do_web(&self, scope: &WebScope, document: &Document, _url: &Url) -> Result<()> {
            let child = scope.load_translator(Mode::Import)?;
            child.set_translator(self.child)?;
            child.set_string(document.content.clone());
            child.translate()
        }
    }

    /// Import translator whose records are all rejected by the caller
    struct Broken;

    impl TranslatorCode for Broken {
        fn do_import(&self, _scope: &ImportScope) -> Result<()> {
            Err(TranslateError::Execution("broken record".to_string()))
        }
    }

    #[test]
    fn test_nested_import_saves_into_parent() {
        let mut engine = NativeEngine::new();
        engine.register("delegator", Arc::new(Delegator { child: crate::translators::RIS_ID }));
        let fx = fixture_with_builtins(vec![header("delegator", 4, "", 100)], engine);

        let translate = Translate::new(Mode::Web, fx.services);
        translate.set_document(Document::new(Url::parse("https://example.org/cite.ris").unwrap(), CHILD_RIS));
        translate.set_translator("delegator").unwrap();
        translate.translate().unwrap();

        assert_eq!(translate.success(), Some(true), "{:?}", translate.take_error());
        let saved = translate.saved_items();
        assert_eq!(saved.len(), 1);
        let item = fx.store.get_item(saved[0]).unwrap().unwrap();
        assert_eq!(item.item_type, "journalArticle");
        assert_eq!(item.fields.get("title").map(String::as_str), Some("Delegated Article"));
    }

    #[test]
    fn test_nested_failure_fails_parent() {
        let mut engine = NativeEngine::new();
        engine.register("delegator", Arc::new(Delegator { child: "broken" }));
        engine.register("broken", Arc::new(Broken));
        let fx = fixture_with_builtins(vec![header("delegator", 4, "", 100), header("broken", 1, "", 100)], engine);

        let translate = Translate::new(Mode::Web, fx.services);
        translate.set_document(Document::new(Url::parse("https://example.org/").unwrap(), "x"));
        translate.set_translator("delegator").unwrap();
        translate.translate().unwrap();

        assert_eq!(translate.success(), Some(false));
        match translate.take_error() {
            Some(TranslateError::Execution(message)) => assert!(message.contains("broken record"), "{}", message),
            other => panic!("unexpected outcome: {:?}", other),
        }
        assert!(fx.store.item_ids().unwrap().is_empty());
    }

    /// Web translator that runs another web translator on the same page
    struct WebRelay {
        child: &'static str,
    }

    impl TranslatorCode for WebRelay {
        fn do_web(&self, scope: &WebScope, document: &Document, _url: &Url) -> Result<()> {
            let child = scope.load_translator(Mode::Web)?;
            child.set_translator(self.child)?;
            child.set_document(document.clone());
            child.translate()
        }
    }

    /// Offers two candidates and saves the chosen ones
    struct Chooser;

    impl TranslatorCode for Chooser {
        fn do_web(&self, scope: &WebScope, _document: &Document, _url: &Url) -> Result<()> {
            let chosen = scope.select_items(vec![
                ("a".to_string(), "Alpha".to_string()),
                ("b".to_string(), "Beta".to_string()),
            ])?;
            for (_, title) in chosen {
                let mut item = scope.new_item("webpage");
                item.set_field("title", title);
                item.complete()?;
            }
            Ok(())
        }
    }

    #[test]
    fn test_nested_selection_reaches_root_handler() {
        let mut engine = NativeEngine::new();
        engine.register("outer", Arc::new(WebRelay { child: "middle" }));
        engine.register("middle", Arc::new(WebRelay { child: "chooser" }));
        engine.register("chooser", Arc::new(Chooser));
        let fx = fixture(
            vec![header("outer", 4, "", 100), header("middle", 4, "", 100), header("chooser", 4, "", 100)],
            engine,
        );

        let translate = Translate::new(Mode::Web, fx.services);
        translate.set_document(Document::new(Url::parse("https://example.org/list").unwrap(), ""));
        let prompts = Arc::new(AtomicUsize::new(0));
        let p = prompts.clone();
        translate.handlers().on_select(Arc::new(move |candidates: &[SelectCandidate]| {
            p.fetch_add(1, Ordering::SeqCst);
            vec![candidates[1].0.clone()]
        }));
        translate.set_translator("outer").unwrap();
        translate.translate().unwrap();

        assert_eq!(translate.success(), Some(true), "{:?}", translate.take_error());
        assert_eq!(prompts.load(Ordering::SeqCst), 1);
        let saved = translate.saved_items();
        assert_eq!(saved.len(), 1);
        let item = fx.store.get_item(saved[0]).unwrap().unwrap();
        assert_eq!(item.fields.get("title").map(String::as_str), Some("Beta"));
    }
}
