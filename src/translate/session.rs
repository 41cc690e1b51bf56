//! Execution sessions
//!
//! A session is one translator running in one phase (detection or
//! execution) of an operation. It owns the phase's I/O handles and option
//! maps, tracks the `wait()`/`done()` completion protocol, and routes
//! completed records into the pipeline. A new session is built whenever the
//! phase or the translator changes.

use super::delegate::ChildTranslator;
use super::events::SelectCandidate;
use super::export::{ExportCollection, ExportItem, ItemGetter};
use super::Operation;
use crate::core::error::{Result, TranslateError};
use crate::io::charset::Charset;
use crate::io::graph::{GraphHandle, GraphStore};
use crate::io::handles::HandleSet;
use crate::io::reader::{ImportSource, TextReader};
use crate::io::writer::TextWriter;
use crate::io::DataMode;
use crate::pipeline::records::{ScrapedCollection, ScrapedItem};
use crate::pipeline::saver::ItemSaver;
use crate::translator::logger::{DefaultTranslatorLogger, TranslatorLogger};
use crate::translator::types::{Detection, Document, Mode, OptionMap, TranslatorDescriptor};
use serde_json::Value;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use tracing::{debug, warn};

/// Config option selecting the data-access mode
pub const DATA_MODE_OPTION: &str = "dataMode";
/// Config option asking export to enumerate collections
pub const GET_COLLECTIONS_OPTION: &str = "getCollections";
/// Display option asking export to copy attachment files
pub const EXPORT_FILE_DATA_OPTION: &str = "exportFileData";
/// Display option naming the export charset
pub const EXPORT_CHARSET_OPTION: &str = "exportCharset";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    Detect,
    Execute,
}

/// Result of calling an entry point
pub(crate) enum EntryOutcome {
    /// The phase finished with this value
    Finished(Result<Value>),
    /// `wait()` was called; a later `done()` finishes the phase
    Suspended,
}

#[derive(Default)]
struct Completion {
    async_requested: bool,
    in_entry: bool,
    /// `done()` seen while the entry point was still running
    early: Option<Result<Value>>,
    delivered: bool,
}

/// What the entry point works on besides its I/O
#[derive(Debug, Clone)]
pub(crate) enum EntryInput {
    None,
    Document(Document),
    Query(ScrapedItem),
}

#[derive(Default)]
struct IoState {
    data_mode: Option<DataMode>,
    reader: Option<Arc<Mutex<TextReader>>>,
    writer: Option<Arc<Mutex<TextWriter>>>,
    graph: Option<GraphHandle>,
    handles: HandleSet,
}

pub(crate) struct SessionInit {
    pub phase: SessionPhase,
    pub descriptor: Arc<TranslatorDescriptor>,
    pub config: OptionMap,
    pub display: OptionMap,
    pub input: EntryInput,
    pub source: Option<ImportSource>,
    pub default_charset: Charset,
    pub writer: Option<TextWriter>,
    pub getter: Option<ItemGetter>,
    pub saver: Option<Arc<Mutex<ItemSaver>>>,
}

pub struct Session {
    operation: Weak<Operation>,
    mode: Mode,
    phase: SessionPhase,
    descriptor: Arc<TranslatorDescriptor>,
    logger: DefaultTranslatorLogger,
    config: Mutex<OptionMap>,
    display: Mutex<OptionMap>,
    input: EntryInput,
    source: Option<ImportSource>,
    default_charset: Charset,
    completion: Mutex<Completion>,
    io: Mutex<IoState>,
    getter: Mutex<Option<ItemGetter>>,
    saver: Option<Arc<Mutex<ItemSaver>>>,
    items_completed: AtomicUsize,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|p| p.into_inner())
}

impl Session {
    pub(crate) fn new(operation: &Arc<Operation>, init: SessionInit) -> Arc<Self> {
        let mut io = IoState::default();
        let writer = init.writer.map(|writer| {
            let writer = Arc::new(Mutex::new(writer));
            io.handles.register(writer.clone());
            writer
        });
        io.writer = writer;

        Arc::new(Self {
            operation: Arc::downgrade(operation),
            mode: operation.mode,
            phase: init.phase,
            logger: DefaultTranslatorLogger::new(init.descriptor.label.clone()),
            descriptor: init.descriptor,
            config: Mutex::new(init.config),
            display: Mutex::new(init.display),
            input: init.input,
            source: init.source,
            default_charset: init.default_charset,
            completion: Mutex::new(Completion::default()),
            io: Mutex::new(io),
            getter: Mutex::new(init.getter),
            saver: init.saver,
            items_completed: AtomicUsize::new(0),
        })
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub fn phase(&self) -> SessionPhase {
        self.phase
    }

    pub fn descriptor(&self) -> &TranslatorDescriptor {
        &self.descriptor
    }

    pub(crate) fn descriptor_arc(&self) -> &Arc<TranslatorDescriptor> {
        &self.descriptor
    }

    pub(crate) fn input(&self) -> &EntryInput {
        &self.input
    }

    /// Records handed to the pipeline (or forwarded) so far
    pub fn items_completed(&self) -> usize {
        self.items_completed.load(Ordering::SeqCst)
    }

    pub(crate) fn operation(&self) -> Result<Arc<Operation>> {
        self.operation.upgrade().ok_or(TranslateError::Cancelled)
    }

    // ---- options ----

    pub fn debug(&self, message: &str) {
        let echo = match self.operation.upgrade() {
            Some(op) => op.handlers.debug(message),
            None => true,
        };
        if echo {
            self.logger.debug(message);
        }
    }

    pub fn configure(&self, key: &str, value: Value) {
        lock(&self.config).insert(key.to_string(), value);
    }

    pub fn add_option(&self, key: &str, default: Value) {
        lock(&self.display).entry(key.to_string()).or_insert(default);
    }

    pub fn get_option(&self, key: &str) -> Option<Value> {
        lock(&self.display).get(key).cloned()
    }

    pub(crate) fn config_snapshot(&self) -> OptionMap {
        lock(&self.config).clone()
    }

    fn config_flag(&self, key: &str) -> bool {
        lock(&self.config).get(key).map_or(false, truthy)
    }

    // ---- completion protocol ----

    pub fn request_async(&self) {
        lock(&self.completion).async_requested = true;
    }

    pub(crate) fn begin_entry(&self) {
        lock(&self.completion).in_entry = true;
    }

    /// Decide what the entry point's return means
    pub(crate) fn after_entry(&self, returned: Result<Value>) -> EntryOutcome {
        let mut completion = lock(&self.completion);
        completion.in_entry = false;

        if let Some(early) = completion.early.take() {
            completion.delivered = true;
            return EntryOutcome::Finished(early);
        }
        match returned {
            Err(e) => {
                completion.delivered = true;
                EntryOutcome::Finished(Err(e))
            }
            Ok(value) if !completion.async_requested => {
                completion.delivered = true;
                EntryOutcome::Finished(Ok(value))
            }
            Ok(_) => EntryOutcome::Suspended,
        }
    }

    /// `done()` from translator code, possibly on another thread
    pub fn signal_done(self: &Arc<Self>, outcome: Result<Value>) {
        {
            let mut completion = lock(&self.completion);
            if completion.delivered || completion.early.is_some() {
                debug!(translator = %self.descriptor.label, "done() called again; ignoring");
                return;
            }
            if completion.in_entry {
                completion.early = Some(outcome);
                return;
            }
            completion.delivered = true;
        }

        match self.operation.upgrade() {
            Some(op) => op.resume(self, outcome),
            None => debug!(translator = %self.descriptor.label, "done() after the operation was dropped"),
        }
    }

    // ---- records ----

    pub fn complete_item(&self, record: ScrapedItem) -> Result<()> {
        if self.phase == SessionPhase::Detect {
            debug!(translator = %self.descriptor.label, "Ignoring item completed during detection");
            return Ok(());
        }
        let op = self.operation()?;
        self.items_completed.fetch_add(1, Ordering::SeqCst);

        if op.handlers.has_item_handlers() {
            op.handlers.item(&record);
            return Ok(());
        }
        if let Some(parent) = &op.parent {
            return parent.complete_item(record);
        }

        let saver = self
            .saver
            .as_ref()
            .ok_or_else(|| TranslateError::Execution("no item saver for this session".to_string()))?;
        let result = lock(saver).materialize(record.clone(), None);
        match result {
            Ok(Some(id)) => {
                op.handlers.item_done(id, &record);
                Ok(())
            }
            Ok(None) => Ok(()),
            Err(e) if e.is_record_local() => {
                warn!(translator = %self.descriptor.label, error = %e, "Record not saved");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    pub fn complete_collection(&self, collection: ScrapedCollection) -> Result<()> {
        if self.phase == SessionPhase::Detect {
            debug!(translator = %self.descriptor.label, "Ignoring collection completed during detection");
            return Ok(());
        }
        let op = self.operation()?;
        if let Some(parent) = &op.parent {
            return parent.complete_collection(collection);
        }

        let saver = self
            .saver
            .as_ref()
            .ok_or_else(|| TranslateError::Execution("no item saver for this session".to_string()))?;
        let id = lock(saver).save_collection(&collection, None)?;
        op.handlers.collection_done(id, &collection);
        Ok(())
    }

    pub fn select_items(&self, candidates: Vec<SelectCandidate>) -> Result<Vec<SelectCandidate>> {
        if candidates.is_empty() {
            return Err(TranslateError::InvalidSelection(
                "selectItems called with no candidates".to_string(),
            ));
        }
        let op = self.operation()?;
        let Some(handler) = op.select_handler() else {
            return Ok(candidates);
        };

        let approved = handler(&candidates);
        Ok(candidates
            .into_iter()
            .filter(|(key, _)| approved.iter().any(|k| k == key))
            .collect())
    }

    pub fn load_translator(self: &Arc<Self>, mode: Mode) -> Result<ChildTranslator> {
        let op = self.operation()?;
        debug!(translator = %self.descriptor.label, child_mode = %mode, "Loading nested translator");
        Ok(ChildTranslator::new(mode, op.services.clone(), self.clone()))
    }

    // ---- I/O ----

    fn data_mode(&self, io: &mut IoState) -> DataMode {
        *io.data_mode
            .get_or_insert_with(|| DataMode::from_option(lock(&self.config).get(DATA_MODE_OPTION)))
    }

    fn reader(&self, io: &mut IoState) -> Result<Arc<Mutex<TextReader>>> {
        if let Some(reader) = &io.reader {
            return Ok(reader.clone());
        }
        let source = self
            .source
            .clone()
            .ok_or(TranslateError::MissingTarget("import input"))?;
        let reader = Arc::new(Mutex::new(TextReader::new(source, self.default_charset)));
        io.handles.register(reader.clone());
        io.reader = Some(reader.clone());
        Ok(reader)
    }

    fn writer(&self, io: &IoState) -> Result<Arc<Mutex<TextWriter>>> {
        io.writer.clone().ok_or(TranslateError::MissingTarget("export output"))
    }

    pub fn read_text(&self) -> Result<Option<String>> {
        let mut io = lock(&self.io);
        let mode = self.data_mode(&mut io);
        let reader = self.reader(&mut io)?;
        drop(io);

        let mut reader = lock(&reader);
        match mode {
            DataMode::Line => reader.read_line(),
            DataMode::Block => reader.read_all(),
            DataMode::Graph => Err(TranslateError::Execution(
                "read() is not available in graph data mode".to_string(),
            )),
        }
    }

    pub fn read_chars(&self, count: usize) -> Result<Option<String>> {
        let mut io = lock(&self.io);
        let reader = self.reader(&mut io)?;
        drop(io);
        let mut reader = lock(&reader);
        reader.read_chars(count)
    }

    pub fn set_input_charset(&self, label: &str) -> Result<()> {
        let charset = Charset::for_label(label)
            .ok_or_else(|| TranslateError::Validation(format!("Unknown character set: {}", label)))?;
        let mut io = lock(&self.io);
        let reader = self.reader(&mut io)?;
        drop(io);
        let mut reader = lock(&reader);
        reader.set_charset(charset)
    }

    pub fn write(&self, text: &str) -> Result<()> {
        let writer = self.writer(&lock(&self.io))?;
        let mut writer = lock(&writer);
        writer.write(text)
    }

    pub fn set_output_charset(&self, label: &str) -> Result<()> {
        let writer = self.writer(&lock(&self.io))?;
        let mut writer = lock(&writer);
        writer.set_charset(label)
    }

    /// Graph store for graph data mode.
    ///
    /// On import the whole input is parsed into the store on first access.
    pub fn graph(&self) -> Result<GraphHandle> {
        let mut io = lock(&self.io);
        if self.data_mode(&mut io) != DataMode::Graph {
            return Err(TranslateError::Execution(format!(
                "graph access requires {} to be \"rdf\"",
                DATA_MODE_OPTION
            )));
        }
        if let Some(graph) = &io.graph {
            return Ok(graph.clone());
        }

        let mut store = GraphStore::new();
        if self.mode == Mode::Import {
            let reader = self.reader(&mut io)?;
            let text = lock(&reader).read_all()?.unwrap_or_default();
            let count = store.parse_ntriples(&text)?;
            debug!(translator = %self.descriptor.label, statements = count, "Parsed import graph");
        }
        let graph = store.into_handle();
        io.graph = Some(graph.clone());
        Ok(graph)
    }

    pub fn next_item(&self) -> Result<Option<ExportItem>> {
        match lock(&self.getter).as_mut() {
            Some(getter) => getter.next_item(),
            None => Ok(None),
        }
    }

    pub fn next_collection(&self) -> Result<Option<ExportCollection>> {
        if !self.config_flag(GET_COLLECTIONS_OPTION) {
            return Ok(None);
        }
        Ok(lock(&self.getter).as_mut().and_then(|getter| getter.next_collection()))
    }

    /// Flush output (serializing a graph export first) and close every handle
    pub(crate) fn finish_io(&self) -> Result<()> {
        let mut io = lock(&self.io);
        let mut result = Ok(());

        if self.mode == Mode::Export {
            if let (Some(graph), Some(writer)) = (io.graph.clone(), io.writer.clone()) {
                let text = lock(&graph).serialize();
                result = lock(&writer).write(&text);
            }
            if let Some(writer) = io.writer.clone() {
                let flushed = lock(&writer).flush();
                if result.is_ok() {
                    result = flushed;
                }
            }
        }

        io.handles.close_all();
        result
    }

    pub(crate) fn close_io(&self) {
        lock(&self.io).handles.close_all();
    }

    /// Text captured by an in-memory export
    pub(crate) fn output(&self) -> Option<String> {
        let writer = lock(&self.io).writer.clone()?;
        let writer = lock(&writer);
        writer.output().map(str::to_string)
    }
}

/// Loose truthiness for option values
pub(crate) fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map_or(false, |f| f != 0.0),
        Value::String(s) => !s.is_empty() && s != "false",
        Value::Array(_) | Value::Object(_) => true,
    }
}

/// Detection result as the value carried by `done()`
pub(crate) fn detection_value(detection: Detection) -> Value {
    match detection {
        Detection::NotFound => Value::Bool(false),
        Detection::Found => Value::Bool(true),
        Detection::Type(t) => Value::String(t),
    }
}
