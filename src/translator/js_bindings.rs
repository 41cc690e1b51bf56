//! JavaScript bindings for script translators
//!
//! Exposes one capability scope to a V8 runtime as ops, and wraps those ops
//! in the `Biblio` global that translator code calls. Ops only ever reach the
//! host through the [`Capabilities`] they were built with, so a script gets
//! exactly what its mode allows.

use crate::io::graph::{GraphHandle, GraphStore, Node};
use crate::pipeline::records::{ScrapedCollection, ScrapedItem};
use crate::translate::delegate::ChildTranslator;
use crate::translate::events::SelectCandidate;
use crate::translate::export::{ExportCollection, ExportItem};
use crate::translator::sandbox::{Capabilities, ExportScope, ImportScope, NewItem};
use crate::translator::types::{Document, Mode};
use anyhow::{anyhow, bail, Context, Result};
use deno_core::{op2, Extension, JsRuntime, Op, OpState, RuntimeOptions};
use serde_json::{json, Value};
use std::sync::{Arc, Mutex, MutexGuard};
use url::Url;

/// Global the runtime invokes entry points through
pub(crate) const INVOKE_FN: &str = "__biblio_invoke";

/// Per-runtime host state the ops work against
pub(crate) struct ScriptHost {
    capabilities: Capabilities,
    children: Vec<ScriptChild>,
    graph: Option<GraphHandle>,
    /// The script called `wait()`
    pub(crate) waiting: bool,
    /// The script called `done()`
    pub(crate) signalled: bool,
}

impl ScriptHost {
    pub(crate) fn new(capabilities: Capabilities) -> Self {
        Self {
            capabilities,
            children: Vec::new(),
            graph: None,
            waiting: false,
            signalled: false,
        }
    }

    fn unavailable(&self, what: &str) -> anyhow::Error {
        anyhow!("{} is not available to {} translators", what, self.capabilities.mode())
    }

    fn import(&self) -> Result<&ImportScope> {
        match &self.capabilities {
            Capabilities::Import(scope) => Ok(scope),
            _ => Err(self.unavailable("reading input")),
        }
    }

    fn export(&self) -> Result<&ExportScope> {
        match &self.capabilities {
            Capabilities::Export(scope) => Ok(scope),
            _ => Err(self.unavailable("writing output")),
        }
    }

    fn new_item(&self) -> Result<NewItem> {
        match &self.capabilities {
            Capabilities::Import(scope) => Ok(scope.new_item("")),
            Capabilities::Web(scope) => Ok(scope.new_item("")),
            Capabilities::Search(scope) => Ok(scope.new_item("")),
            Capabilities::Export(_) => Err(self.unavailable("Item.complete()")),
        }
    }

    fn graph(&mut self) -> Result<GraphHandle> {
        if let Some(graph) = &self.graph {
            return Ok(graph.clone());
        }
        let graph = match &self.capabilities {
            Capabilities::Import(scope) => scope.graph()?,
            Capabilities::Export(scope) => scope.graph()?,
            _ => return Err(self.unavailable("RDF")),
        };
        self.graph = Some(graph.clone());
        Ok(graph)
    }
}

/// A nested translator created by `loadTranslator`
struct ScriptChild {
    translator: ChildTranslator,
    /// Records held back for the script's `itemDone` handlers
    captured: Option<Arc<Mutex<Vec<ScrapedItem>>>>,
}

impl ScriptChild {
    fn call(&mut self, method: &str, args: &[Value]) -> Result<Value> {
        let translator = &self.translator;
        match method {
            "setTranslator" => translator.set_translator(&string_arg(args, 0)?)?,
            "setString" => translator.set_string(string_arg(args, 0)?),
            "setDocument" => translator.set_document(document_arg(args, 0)?),
            "setSearch" => translator.set_search(record_arg(args, 0)?),
            "setDisplayOptions" => match args.first() {
                Some(Value::Object(options)) => translator.set_display_options(options.clone()),
                _ => bail!("setDisplayOptions expects an object"),
            },
            "captureItems" => {
                if self.captured.is_none() {
                    let captured = Arc::new(Mutex::new(Vec::new()));
                    let sink = captured.clone();
                    translator.on_item(move |item| lock(&sink).push(item));
                    self.captured = Some(captured);
                }
            }
            "getTranslators" => {
                let found = translator.get_translators()?;
                return Ok(found
                    .iter()
                    .map(|f| {
                        json!({
                            "translatorID": f.descriptor.id,
                            "label": f.descriptor.label,
                            "itemType": f.item_type,
                        })
                    })
                    .collect());
            }
            "translate" => {
                translator.translate()?;
                let items = match &self.captured {
                    Some(captured) => std::mem::take(&mut *lock(captured)),
                    None => Vec::new(),
                };
                return Ok(serde_json::to_value(items)?);
            }
            "output" => return Ok(json!(translator.output())),
            other => bail!("unknown nested translator method: {}", other),
        }
        Ok(Value::Null)
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|p| p.into_inner())
}

fn arg(args: &[Value], index: usize) -> Result<&Value> {
    match args.get(index) {
        Some(Value::Null) | None => Err(anyhow!("missing argument {}", index + 1)),
        Some(value) => Ok(value),
    }
}

fn string_arg(args: &[Value], index: usize) -> Result<String> {
    Ok(match arg(args, index)? {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    })
}

fn optional_string(args: &[Value], index: usize) -> Option<String> {
    string_arg(args, index).ok()
}

fn document_arg(args: &[Value], index: usize) -> Result<Document> {
    let value = arg(args, index)?;
    let url = value
        .get("url")
        .and_then(Value::as_str)
        .ok_or_else(|| anyhow!("document has no url"))?;
    let mut document = Document::new(
        Url::parse(url).with_context(|| format!("invalid document url: {}", url))?,
        value.get("content").and_then(Value::as_str).unwrap_or_default(),
    );
    if let Some(content_type) = value.get("contentType").and_then(Value::as_str) {
        document.content_type = Some(content_type.to_string());
    }
    Ok(document)
}

fn record_arg(args: &[Value], index: usize) -> Result<ScrapedItem> {
    decode_record(arg(args, index)?.clone())
}

/// Numbers cross from V8 as floats; integral ones become integers again so
/// counters such as `fieldMode` decode.
fn integral(value: Value) -> Value {
    match value {
        Value::Number(n) => match n.as_f64() {
            Some(f) if n.is_f64() && f.fract() == 0.0 && f.abs() < 9.0e15 => json!(f as i64),
            _ => Value::Number(n),
        },
        Value::Array(values) => Value::Array(values.into_iter().map(integral).collect()),
        Value::Object(map) => Value::Object(map.into_iter().map(|(k, v)| (k, integral(v))).collect()),
        other => other,
    }
}

fn decode_record(value: Value) -> Result<ScrapedItem> {
    serde_json::from_value(integral(value)).context("invalid item")
}

fn nodes(list: Vec<Node>) -> Result<Value> {
    Ok(serde_json::to_value(list)?)
}

/// A node argument: a URI or prefixed name string, or a node object
fn node_arg(graph: &GraphStore, args: &[Value], index: usize) -> Result<Node> {
    match arg(args, index)? {
        Value::String(name) => Ok(graph.resource(name)),
        other => serde_json::from_value(other.clone()).context("invalid RDF node"),
    }
}

fn graph_call(graph: &GraphHandle, method: &str, args: &[Value]) -> Result<Value> {
    let mut graph = lock(graph);
    Ok(match method {
        "addNamespace" => {
            graph.add_namespace(&string_arg(args, 0)?, &string_arg(args, 1)?);
            Value::Null
        }
        "newResource" => serde_json::to_value(graph.new_resource())?,
        "addStatement" => {
            let subject = node_arg(&graph, args, 0)?;
            let predicate = string_arg(args, 1)?;
            let object = if args.get(3).and_then(Value::as_bool).unwrap_or(false) {
                Node::Literal(string_arg(args, 2)?)
            } else {
                node_arg(&graph, args, 2)?
            };
            Value::Bool(graph.add_statement(&subject, &predicate, object)?)
        }
        "getTargets" => {
            let subject = node_arg(&graph, args, 0)?;
            nodes(graph.get_targets(&subject, &string_arg(args, 1)?))?
        }
        "getSources" => {
            let object = node_arg(&graph, args, 1)?;
            nodes(graph.get_sources(&string_arg(args, 0)?, &object))?
        }
        "getArcsOut" => json!(graph.get_arcs_out(&node_arg(&graph, args, 0)?)),
        "getAllResources" => nodes(graph.get_all_resources())?,
        "getContainerElements" => nodes(graph.get_container_elements(&node_arg(&graph, args, 0)?))?,
        "getStatementsMatching" => {
            let subject = node_arg(&graph, args, 0).ok();
            let predicate = optional_string(args, 1);
            let object = node_arg(&graph, args, 2).ok();
            let statements = graph.get_statements_matching(subject.as_ref(), predicate.as_deref(), object.as_ref());
            Value::Array(
                statements
                    .into_iter()
                    .map(|s| json!({"subject": s.subject, "predicate": s.predicate, "object": s.object}))
                    .collect(),
            )
        }
        other => bail!("unknown RDF method: {}", other),
    })
}

// ---- ops ----

#[op2]
fn op_biblio_debug(state: &mut OpState, #[serde] message: serde_json::Value) {
    let host = state.borrow::<ScriptHost>();
    match message {
        Value::String(text) => host.capabilities.scope().debug(&text),
        other => host.capabilities.scope().debug(&other.to_string()),
    }
}

#[op2]
fn op_biblio_configure(state: &mut OpState, #[string] key: String, #[serde] value: serde_json::Value) {
    state.borrow::<ScriptHost>().capabilities.scope().configure(&key, value);
}

#[op2]
fn op_biblio_add_option(state: &mut OpState, #[string] key: String, #[serde] value: serde_json::Value) {
    state.borrow::<ScriptHost>().capabilities.scope().add_option(&key, value);
}

#[op2]
#[serde]
fn op_biblio_get_option(state: &mut OpState, #[string] key: String) -> Option<Value> {
    state.borrow::<ScriptHost>().capabilities.scope().get_option(&key)
}

/// `wait()` and `done(value)`
#[op2]
fn op_biblio_completion(
    state: &mut OpState,
    #[string] kind: String,
    #[serde] value: Option<Value>,
) -> Result<(), anyhow::Error> {
    let host = state.borrow_mut::<ScriptHost>();
    match kind.as_str() {
        "wait" => {
            host.waiting = true;
            host.capabilities.scope().wait();
        }
        "done" => {
            host.signalled = true;
            match value {
                Some(value) => host.capabilities.scope().done_with(value),
                None => host.capabilities.scope().done(),
            }
        }
        other => bail!("unknown completion signal: {}", other),
    }
    Ok(())
}

#[op2]
fn op_biblio_complete_item(state: &mut OpState, #[serde] record: serde_json::Value) -> Result<(), anyhow::Error> {
    let record = decode_record(record)?;
    let mut item = state.borrow::<ScriptHost>().new_item()?;
    *item = record;
    Ok(item.complete()?)
}

#[op2]
fn op_biblio_complete_collection(state: &mut OpState, #[serde] collection: serde_json::Value) -> Result<(), anyhow::Error> {
    let collection: ScrapedCollection = serde_json::from_value(collection).context("invalid collection")?;
    let host = state.borrow::<ScriptHost>();
    let mut target = host.import()?.new_collection(&collection.name);
    *target = collection;
    Ok(target.complete()?)
}

#[op2]
#[serde]
fn op_biblio_select_items(
    state: &mut OpState,
    #[serde] candidates: Vec<SelectCandidate>,
) -> Result<Vec<SelectCandidate>, anyhow::Error> {
    let host = state.borrow::<ScriptHost>();
    match &host.capabilities {
        Capabilities::Web(scope) => Ok(scope.select_items(candidates)?),
        Capabilities::Search(scope) => Ok(scope.select_items(candidates)?),
        _ => Err(host.unavailable("selectItems")),
    }
}

/// Line, block or `count`-character read; `None` at end of input
#[op2]
#[string]
fn op_biblio_read(state: &mut OpState, #[serde] count: Option<usize>) -> Result<Option<String>, anyhow::Error> {
    let scope = state.borrow::<ScriptHost>().import()?;
    Ok(match count {
        Some(count) => scope.read_chars(count)?,
        None => scope.read()?,
    })
}

#[op2]
fn op_biblio_write(state: &mut OpState, #[serde] text: serde_json::Value) -> Result<(), anyhow::Error> {
    let scope = state.borrow::<ScriptHost>().export()?;
    match text {
        Value::String(text) => scope.write(&text)?,
        other => scope.write(&other.to_string())?,
    }
    Ok(())
}

#[op2]
fn op_biblio_set_character_set(state: &mut OpState, #[serde] label: serde_json::Value) -> Result<(), anyhow::Error> {
    let label = label.as_str().ok_or_else(|| anyhow!("character set must be a string"))?;
    let host = state.borrow::<ScriptHost>();
    match &host.capabilities {
        Capabilities::Import(scope) => Ok(scope.set_character_set(label)?),
        Capabilities::Export(scope) => Ok(scope.set_character_set(label)?),
        _ => Err(host.unavailable("setCharacterSet")),
    }
}

#[op2]
#[serde]
fn op_biblio_next_item(state: &mut OpState) -> Result<Option<ExportItem>, anyhow::Error> {
    Ok(state.borrow::<ScriptHost>().export()?.next_item()?)
}

#[op2]
#[serde]
fn op_biblio_next_collection(state: &mut OpState) -> Result<Option<ExportCollection>, anyhow::Error> {
    Ok(state.borrow::<ScriptHost>().export()?.next_collection()?)
}

#[op2]
#[serde]
fn op_biblio_utility(
    state: &mut OpState,
    #[string] name: String,
    #[serde] args: Vec<Value>,
) -> Result<serde_json::Value, anyhow::Error> {
    let utilities = state.borrow::<ScriptHost>().capabilities.scope().utilities();
    Ok(match name.as_str() {
        "trimInternal" => json!(utilities.trim_internal(&string_arg(&args, 0)?)),
        "cleanAuthor" => {
            let single = args.get(2).and_then(Value::as_bool).unwrap_or(false);
            let creator_type = optional_string(&args, 1);
            serde_json::to_value(utilities.clean_author(&string_arg(&args, 0)?, creator_type.as_deref(), single))?
        }
        "cleanDOI" => json!(utilities.clean_doi(&string_arg(&args, 0)?)),
        "cleanISBN" => json!(utilities.clean_isbn(&string_arg(&args, 0)?)),
        "strToDate" => {
            let date = utilities.str_to_date(&string_arg(&args, 0)?);
            json!({"year": date.year, "month": date.month, "day": date.day, "sql": date.to_sql()})
        }
        "unescapeHTML" => json!(utilities.unescape_html(&string_arg(&args, 0)?)),
        other => bail!("unknown utility: {}", other),
    })
}

#[op2]
#[serde]
fn op_biblio_rdf(
    state: &mut OpState,
    #[string] method: String,
    #[serde] args: Vec<Value>,
) -> Result<serde_json::Value, anyhow::Error> {
    let graph = state.borrow_mut::<ScriptHost>().graph()?;
    graph_call(&graph, &method, &args)
}

#[op2]
#[serde]
fn op_biblio_load_translator(state: &mut OpState, #[string] mode: String) -> Result<usize, anyhow::Error> {
    let mode: Mode = mode.parse()?;
    let host = state.borrow_mut::<ScriptHost>();
    let translator = host.capabilities.scope().load_translator(mode)?;
    host.children.push(ScriptChild {
        translator,
        captured: None,
    });
    Ok(host.children.len() - 1)
}

#[op2]
#[serde]
fn op_biblio_child(
    state: &mut OpState,
    #[serde] handle: usize,
    #[string] method: String,
    #[serde] args: Vec<Value>,
) -> Result<serde_json::Value, anyhow::Error> {
    let host = state.borrow_mut::<ScriptHost>();
    let child = host
        .children
        .get_mut(handle)
        .ok_or_else(|| anyhow!("unknown nested translator: {}", handle))?;
    child.call(&method, &args)
}

const BINDINGS_JS: &str = r#"
"use strict";
(() => {
    const ops = Deno.core.ops;
    const LISTS = ["creators", "tags", "notes", "attachments", "seeAlso"];

    function compact(value) {
        if (Array.isArray(value)) {
            return value.filter((v) => v !== undefined && v !== null).map(compact);
        }
        if (value && typeof value === "object") {
            const out = {};
            for (const [key, v] of Object.entries(value)) {
                if (v !== undefined && v !== null && typeof v !== "function") out[key] = compact(v);
            }
            return out;
        }
        return value;
    }

    function plainRecord(record) {
        const out = {};
        for (const [key, value] of Object.entries(record)) {
            if (value === undefined || value === null || typeof value === "function") continue;
            if (LISTS.includes(key)) {
                if (!Array.isArray(value)) continue;
                if (key === "seeAlso") out[key] = value.map(String);
                else if (key === "notes") out[key] = value.map((n) => (typeof n === "object" ? compact(n) : { note: String(n) }));
                else if (key === "tags") out[key] = value.map((t) => (typeof t === "object" ? compact(t) : String(t)));
                else out[key] = compact(value);
            } else if (typeof value !== "object") {
                out[key] = String(value);
            }
        }
        return out;
    }

    function plainCollection(collection) {
        return {
            name: String(collection.name || ""),
            children: (collection.children || []).map((child) => {
                if (child instanceof Collection || (child && child.type === "collection")) {
                    return Object.assign({ type: "collection" }, plainCollection(child));
                }
                const id = child && typeof child === "object" ? (child.itemID ?? child.id) : child;
                return { type: "item", id: String(id) };
            }),
        };
    }

    class Item {
        constructor(itemType) {
            if (itemType) this.itemType = itemType;
            this.creators = [];
            this.tags = [];
            this.notes = [];
            this.attachments = [];
            this.seeAlso = [];
        }
        complete() {
            ops.op_biblio_complete_item(plainRecord(this));
        }
    }

    class Collection {
        constructor(name) {
            this.name = name || "";
            this.children = [];
        }
        complete() {
            ops.op_biblio_complete_collection(plainCollection(this));
        }
    }

    class Translator {
        constructor(handle) {
            this._handle = handle;
            this._handlers = {};
        }
        _call(method, ...args) {
            return ops.op_biblio_child(this._handle, method, args);
        }
        setTranslator(translator) {
            const id = translator && typeof translator === "object" ? translator.translatorID : translator;
            this._call("setTranslator", String(id));
        }
        setString(text) { this._call("setString", String(text)); }
        setDocument(doc) { this._call("setDocument", doc); }
        setSearch(item) { this._call("setSearch", plainRecord(item)); }
        setDisplayOptions(options) { this._call("setDisplayOptions", options || {}); }
        setHandler(name, handler) {
            (this._handlers[name] = this._handlers[name] || []).push(handler);
            if (name === "itemDone") this._call("captureItems");
        }
        getTranslators() { return this._call("getTranslators"); }
        getOutput() { return this._call("output"); }
        translate() {
            let items;
            try {
                items = this._call("translate");
            } catch (e) {
                for (const handler of this._handlers.error || []) handler(this, e);
                throw e;
            }
            for (const raw of items) {
                const item = Object.assign(new Item(), raw);
                for (const handler of this._handlers.itemDone || []) handler(this, item);
            }
            for (const handler of this._handlers.done || []) handler(this, true);
        }
    }

    const orFalse = (value) => (value === null || value === undefined ? false : value);

    globalThis.Biblio = {
        Item,
        Collection,
        debug: (message) => ops.op_biblio_debug(message ?? null),
        configure: (key, value) => ops.op_biblio_configure(String(key), value ?? null),
        addOption: (key, value) => ops.op_biblio_add_option(String(key), value ?? null),
        getOption: (key) => ops.op_biblio_get_option(String(key)) ?? undefined,
        wait: () => ops.op_biblio_completion("wait", null),
        done: (value) => ops.op_biblio_completion("done", value ?? null),
        read: (count) => orFalse(ops.op_biblio_read(count ?? null)),
        write: (text) => ops.op_biblio_write(String(text)),
        setCharacterSet: (label) => ops.op_biblio_set_character_set(String(label)),
        nextItem: () => orFalse(ops.op_biblio_next_item()),
        nextCollection: () => orFalse(ops.op_biblio_next_collection()),
        selectItems(items, callback) {
            const picked = ops.op_biblio_select_items(Object.entries(items).map(([k, v]) => [String(k), String(v)]));
            const result = picked.length ? Object.fromEntries(picked) : false;
            if (typeof callback === "function") {
                callback(result);
                return undefined;
            }
            return result;
        },
        loadTranslator: (mode) => new Translator(ops.op_biblio_load_translator(String(mode))),
        Utilities: {
            trimInternal: (text) => ops.op_biblio_utility("trimInternal", [String(text)]),
            cleanAuthor: (raw, type, single) => ops.op_biblio_utility("cleanAuthor", [String(raw), type ?? null, !!single]),
            cleanDOI: (text) => orFalse(ops.op_biblio_utility("cleanDOI", [String(text)])),
            cleanISBN: (text) => orFalse(ops.op_biblio_utility("cleanISBN", [String(text)])),
            strToDate: (text) => ops.op_biblio_utility("strToDate", [String(text)]),
            unescapeHTML: (html) => ops.op_biblio_utility("unescapeHTML", [String(html)]),
        },
        RDF: {
            addNamespace: (prefix, uri) => ops.op_biblio_rdf("addNamespace", [prefix, uri]),
            newResource: () => ops.op_biblio_rdf("newResource", []),
            addStatement: (subject, predicate, object, literal) =>
                ops.op_biblio_rdf("addStatement", [subject, predicate, object, !!literal]),
            getTargets: (subject, predicate) => ops.op_biblio_rdf("getTargets", [subject, predicate]),
            getSources: (predicate, object) => ops.op_biblio_rdf("getSources", [predicate, object]),
            getArcsOut: (subject) => ops.op_biblio_rdf("getArcsOut", [subject]),
            getAllResources: () => ops.op_biblio_rdf("getAllResources", []),
            getContainerElements: (container) => ops.op_biblio_rdf("getContainerElements", [container]),
            getStatementsMatching: (subject, predicate, object) =>
                ops.op_biblio_rdf("getStatementsMatching", [subject ?? null, predicate ?? null, object ?? null]),
            getResourceURI: (node) => (typeof node === "string" ? node : node.value),
        },
    };

    globalThis.__biblio_invoke = async function (name, args) {
        globalThis.__biblio_status = "pending";
        globalThis.__biblio_result = undefined;
        globalThis.__biblio_error = undefined;
        try {
            const entry = globalThis[name];
            if (typeof entry !== "function") {
                globalThis.__biblio_status = "missing";
                return;
            }
            const result = await entry(...args);
            globalThis.__biblio_result = JSON.stringify(result === undefined ? null : result);
            globalThis.__biblio_status = "success";
        } catch (e) {
            globalThis.__biblio_error = e && e.stack ? String(e.stack) : String(e);
            globalThis.__biblio_status = "error";
        }
    };
})();
"#;

/// Create a runtime with the host ops bound to `capabilities`
pub(crate) fn create_runtime(capabilities: Capabilities) -> Result<JsRuntime> {
    let ext = Extension {
        name: "biblio_host",
        ops: std::borrow::Cow::Borrowed(&[
            op_biblio_debug::DECL,
            op_biblio_configure::DECL,
            op_biblio_add_option::DECL,
            op_biblio_get_option::DECL,
            op_biblio_completion::DECL,
            op_biblio_complete_item::DECL,
            op_biblio_complete_collection::DECL,
            op_biblio_select_items::DECL,
            op_biblio_read::DECL,
            op_biblio_write::DECL,
            op_biblio_set_character_set::DECL,
            op_biblio_next_item::DECL,
            op_biblio_next_collection::DECL,
            op_biblio_utility::DECL,
            op_biblio_rdf::DECL,
            op_biblio_load_translator::DECL,
            op_biblio_child::DECL,
        ]),
        ..Default::default()
    };

    let mut runtime = JsRuntime::new(RuntimeOptions {
        extensions: vec![ext],
        ..Default::default()
    });
    runtime.op_state().borrow_mut().put(ScriptHost::new(capabilities));

    runtime
        .execute_script("<biblio_bindings>", BINDINGS_JS.to_string().into())
        .context("Failed to initialize translator bindings")?;
    Ok(runtime)
}
