//! JavaScript translator engine
//!
//! Runs a descriptor's script body in a fresh V8 runtime for every entry
//! point call, with the session's capabilities bound as ops. Each call gets
//! its own thread and a current-thread tokio runtime to drive the event
//! loop, so nested translators never share an isolate with their caller.

use super::engine::{NativeEngine, ScriptEngine, TranslatorCode};
use super::js_bindings::{self, ScriptHost, INVOKE_FN};
use super::sandbox::{Capabilities, ExportScope, ImportScope, SearchScope, WebScope};
use super::types::{Detection, Document, TranslatorDescriptor};
use crate::core::error::{Result, TranslateError};
use crate::pipeline::records::ScrapedItem;
use anyhow::{anyhow, bail, Context};
use deno_core::{v8, JsRuntime};
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::debug;
use url::Url;

/// Engine for translators written in JavaScript
#[derive(Debug, Default, Clone, Copy)]
pub struct JsEngine;

impl JsEngine {
    pub fn new() -> Self {
        Self
    }
}

impl ScriptEngine for JsEngine {
    fn eval(&self, descriptor: &TranslatorDescriptor) -> Result<Arc<dyn TranslatorCode>> {
        let source = descriptor.source()?;
        debug!(translator = %descriptor.label, bytes = source.len(), "Loading script translator");
        Ok(Arc::new(JsTranslator {
            label: descriptor.label.clone(),
            source: source.to_string(),
        }))
    }
}

/// Native bindings first, script code for everything else.
///
/// A descriptor whose body starts with a `native:` directive, or whose ID
/// has a native registration, runs natively. Any other body is JavaScript.
#[derive(Default, Clone)]
pub struct DefaultEngine {
    native: NativeEngine,
    script: JsEngine,
}

impl DefaultEngine {
    pub fn new(native: NativeEngine) -> Self {
        Self {
            native,
            script: JsEngine,
        }
    }

    /// Bundled translators plus JavaScript
    pub fn with_builtins() -> Self {
        Self::new(NativeEngine::with_builtins())
    }
}

impl ScriptEngine for DefaultEngine {
    fn eval(&self, descriptor: &TranslatorDescriptor) -> Result<Arc<dyn TranslatorCode>> {
        if self.native.binds(descriptor)? {
            self.native.eval(descriptor)
        } else {
            self.script.eval(descriptor)
        }
    }
}

/// What an entry point call produced
enum Invocation {
    Returned(Value),
    /// The script does not define the entry point
    Missing,
}

struct JsTranslator {
    label: String,
    source: String,
}

impl JsTranslator {
    fn detect(&self, capabilities: Capabilities, entry: &'static str, args: Vec<Value>) -> Result<Detection> {
        match self.call(capabilities, entry, args)? {
            Invocation::Returned(value) => Ok(Detection::from_value(&value)),
            Invocation::Missing => Ok(Detection::NotFound),
        }
    }

    fn execute(&self, capabilities: Capabilities, entry: &'static str, args: Vec<Value>) -> Result<()> {
        match self.call(capabilities, entry, args)? {
            Invocation::Returned(_) => Ok(()),
            Invocation::Missing => Err(TranslateError::MissingEntryPoint(entry)),
        }
    }

    fn call(&self, capabilities: Capabilities, entry: &'static str, args: Vec<Value>) -> Result<Invocation> {
        std::thread::scope(|s| s.spawn(move || self.run(capabilities, entry, args)).join())
            .unwrap_or_else(|_| Err(TranslateError::Execution(format!("{} panicked in {}", self.label, entry))))
    }

    fn run(&self, capabilities: Capabilities, entry: &'static str, args: Vec<Value>) -> Result<Invocation> {
        let runtime = tokio::runtime::Builder::new_current_thread().enable_all().build()?;
        runtime
            .block_on(self.invoke(capabilities, entry, args))
            .map_err(|e| TranslateError::Execution(format!("{}: {}: {:#}", self.label, entry, e)))
    }

    async fn invoke(&self, capabilities: Capabilities, entry: &str, args: Vec<Value>) -> anyhow::Result<Invocation> {
        let mut runtime = js_bindings::create_runtime(capabilities)?;
        runtime
            .execute_script("<translator>", self.source.clone().into())
            .with_context(|| format!("Failed to evaluate {}", self.label))?;

        // Call the invoke helper through V8 so arguments need no new script
        {
            let scope = &mut runtime.handle_scope();
            let context = scope.get_current_context();
            let global = context.global(scope);

            let invoke_name = v8::String::new(scope, INVOKE_FN).ok_or_else(|| anyhow!("Failed to allocate string"))?;
            let invoke_val = global
                .get(scope, invoke_name.into())
                .ok_or_else(|| anyhow!("{} not found", INVOKE_FN))?;
            let invoke_func = v8::Local::<v8::Function>::try_from(invoke_val)
                .map_err(|_| anyhow!("{} is not a function", INVOKE_FN))?;

            let entry_v8 = v8::String::new(scope, entry).ok_or_else(|| anyhow!("Failed to allocate string"))?;
            let args_json = serde_json::to_string(&args)?;
            let args_json_v8 =
                v8::String::new(scope, &args_json).ok_or_else(|| anyhow!("Failed to allocate string"))?;
            let args_val = v8::json::parse(scope, args_json_v8)
                .ok_or_else(|| anyhow!("Failed to parse arguments JSON in V8"))?;

            let recv = v8::undefined(scope).into();
            if invoke_func.call(scope, recv, &[entry_v8.into(), args_val]).is_none() {
                bail!("Failed to call {}", entry);
            }
        }

        runtime
            .run_event_loop(Default::default())
            .await
            .context("Failed to run event loop")?;

        let status = global_string(&mut runtime, "__biblio_status").unwrap_or_default();
        let (waiting, signalled) = {
            let state = runtime.op_state();
            let state = state.borrow();
            let host = state.borrow::<ScriptHost>();
            (host.waiting, host.signalled)
        };

        match status.as_str() {
            "missing" => Ok(Invocation::Missing),
            "error" => {
                let message = global_string(&mut runtime, "__biblio_error").unwrap_or_else(|| "unknown error".to_string());
                Err(anyhow!(message))
            }
            "success" if waiting && !signalled => bail!("called wait() but never done()"),
            "success" => {
                let result = global_string(&mut runtime, "__biblio_result").unwrap_or_else(|| "null".to_string());
                Ok(Invocation::Returned(
                    serde_json::from_str(&result).with_context(|| format!("Invalid result from {}", entry))?,
                ))
            }
            "pending" => bail!("event loop finished but {} is still pending", entry),
            other => bail!("invalid execution status: {:?}", other),
        }
    }
}

/// A global as a string, `None` when unset
fn global_string(runtime: &mut JsRuntime, key: &str) -> Option<String> {
    let scope = &mut runtime.handle_scope();
    let context = scope.get_current_context();
    let global = context.global(scope);
    let key = v8::String::new(scope, key)?;
    let value = global.get(scope, key.into())?;
    if value.is_undefined() || value.is_null() {
        return None;
    }
    Some(value.to_string(scope)?.to_rust_string_lossy(scope))
}

fn document_value(document: &Document, url: &Url) -> Value {
    json!({
        "url": url.as_str(),
        "content": document.content,
        "contentType": document.content_type,
    })
}

fn query_value(query: &ScrapedItem) -> Result<Value> {
    serde_json::to_value(query).map_err(|e| TranslateError::Serialization(e.to_string()))
}

impl TranslatorCode for JsTranslator {
    fn detect_import(&self, scope: &ImportScope) -> Result<Detection> {
        self.detect(Capabilities::Import(scope.clone()), "detectImport", Vec::new())
    }

    fn do_import(&self, scope: &ImportScope) -> Result<()> {
        self.execute(Capabilities::Import(scope.clone()), "doImport", Vec::new())
    }

    fn detect_web(&self, scope: &WebScope, document: &Document, url: &Url) -> Result<Detection> {
        let args = vec![document_value(document, url), json!(url.as_str())];
        self.detect(Capabilities::Web(scope.clone()), "detectWeb", args)
    }

    fn do_web(&self, scope: &WebScope, document: &Document, url: &Url) -> Result<()> {
        let args = vec![document_value(document, url), json!(url.as_str())];
        self.execute(Capabilities::Web(scope.clone()), "doWeb", args)
    }

    fn detect_search(&self, scope: &SearchScope, query: &ScrapedItem) -> Result<Detection> {
        self.detect(Capabilities::Search(scope.clone()), "detectSearch", vec![query_value(query)?])
    }

    fn do_search(&self, scope: &SearchScope, query: &ScrapedItem) -> Result<()> {
        self.execute(Capabilities::Search(scope.clone()), "doSearch", vec![query_value(query)?])
    }

    fn do_export(&self, scope: &ExportScope) -> Result<()> {
        self.execute(Capabilities::Export(scope.clone()), "doExport", Vec::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::library::memory::MemoryStore;
    use crate::library::store::LibraryStore;
    use crate::pipeline::attachments::tests::StaticFetcher;
    use crate::translate::{SelectCandidate, Services, Translate};
    use crate::translator::registry::{DirectorySource, TranslatorCache};
    use crate::translator::types::Mode;
    use crate::translators::{builtin_source, RIS_ID};
    use std::collections::BTreeMap;
    use std::path::Path;

    fn services(dir: &Path) -> (Services, Arc<MemoryStore>) {
        let cache = TranslatorCache::new()
            .with_source(DirectorySource::new(dir))
            .with_source(builtin_source());
        cache.init().unwrap();
        let store = Arc::new(MemoryStore::new());
        let services = Services::new(
            Arc::new(cache),
            Arc::new(DefaultEngine::with_builtins()),
            store.clone(),
            Arc::new(StaticFetcher::ok()),
        );
        (services, store)
    }

    fn write_translator(dir: &Path, file: &str, header: &str, body: &str) {
        std::fs::write(dir.join(file), format!("{}\n{}\n", header, body)).unwrap();
    }

    const LINES_HEADER: &str = r#"{"translatorID":"js-1","translatorType":1,"target":"txt"}"#;

    const LINES_BODY: &str = r#"
function detectImport() { return true; }
function doImport() {
    Biblio.configure("dataMode", "line");
    var line;
    while ((line = Biblio.read()) !== false) {
        if (!line.trim()) continue;
        var item = new Biblio.Item("book");
        item.title = line.trim();
        item.creators.push({ lastName: "Anonymous", creatorType: "author", fieldMode: 1 });
        item.complete();
    }
}
"#;

    fn run_import(services: &Services, id: &str, text: &str) -> Translate {
        let translate = Translate::new(Mode::Import, services.clone());
        translate.set_string(text);
        translate.set_translator(id).unwrap();
        translate.translate().unwrap();
        translate
    }

    #[test]
    fn test_script_import_from_directory() {
        let dir = tempfile::tempdir().unwrap();
        write_translator(dir.path(), "t.js", LINES_HEADER, LINES_BODY);
        let (services, store) = services(dir.path());

        let translate = run_import(&services, "js-1", "Dune\n\nHyperion\n");
        assert_eq!(translate.success(), Some(true), "{:?}", translate.take_error());

        let saved = translate.saved_items();
        assert_eq!(saved.len(), 2);
        let first = store.get_item(saved[0]).unwrap().unwrap();
        assert_eq!(first.item_type, "book");
        assert_eq!(first.fields.get("title").map(String::as_str), Some("Dune"));
        assert_eq!(first.creators.len(), 1);
    }

    #[test]
    fn test_script_detection() {
        let dir = tempfile::tempdir().unwrap();
        write_translator(
            dir.path(),
            "bib.js",
            r#"{"translatorID":"js-bib","label":"Bib","translatorType":1,"priority":10}"#,
            r#"function detectImport() { var text = Biblio.read(); return text !== false && text.startsWith("@"); }"#,
        );
        let (services, _) = services(dir.path());

        let translate = Translate::new(Mode::Import, services.clone());
        translate.set_string("@book{dune}");
        translate.get_translators().unwrap();
        assert!(translate.found().iter().any(|f| f.descriptor.id == "js-bib"));

        translate.set_string("plain text");
        translate.get_translators().unwrap();
        assert!(!translate.found().iter().any(|f| f.descriptor.id == "js-bib"));
    }

    #[test]
    fn test_missing_entry_point_fails() {
        let dir = tempfile::tempdir().unwrap();
        write_translator(dir.path(), "t.js", LINES_HEADER, "function detectImport() { return true; }");
        let (services, _) = services(dir.path());

        let translate = run_import(&services, "js-1", "x");
        assert_eq!(translate.success(), Some(false));
        assert!(matches!(
            translate.take_error(),
            Some(TranslateError::MissingEntryPoint("doImport"))
        ));
    }

    #[test]
    fn test_thrown_error_fails_run() {
        let dir = tempfile::tempdir().unwrap();
        write_translator(dir.path(), "t.js", LINES_HEADER, r#"function doImport() { throw new Error("bad input"); }"#);
        let (services, _) = services(dir.path());

        let translate = run_import(&services, "js-1", "x");
        assert_eq!(translate.success(), Some(false));
        match translate.take_error() {
            Some(TranslateError::Execution(message)) => assert!(message.contains("bad input"), "{}", message),
            other => panic!("unexpected outcome: {:?}", other),
        }
    }

    #[test]
    fn test_wait_and_done_from_promise() {
        let dir = tempfile::tempdir().unwrap();
        write_translator(
            dir.path(),
            "t.js",
            LINES_HEADER,
            r#"
function doImport() {
    Biblio.wait();
    Promise.resolve("Later").then(function (title) {
        var item = new Biblio.Item("book");
        item.title = title;
        item.complete();
        Biblio.done();
    });
}
"#,
        );
        let (services, _) = services(dir.path());

        let translate = run_import(&services, "js-1", "x");
        assert_eq!(translate.success(), Some(true), "{:?}", translate.take_error());
        assert_eq!(translate.saved_items().len(), 1);
    }

    #[test]
    fn test_wait_without_done_fails() {
        let dir = tempfile::tempdir().unwrap();
        write_translator(dir.path(), "t.js", LINES_HEADER, "function doImport() { Biblio.wait(); }");
        let (services, _) = services(dir.path());

        let translate = run_import(&services, "js-1", "x");
        assert_eq!(translate.success(), Some(false));
        match translate.take_error() {
            Some(TranslateError::Execution(message)) => assert!(message.contains("never done"), "{}", message),
            other => panic!("unexpected outcome: {:?}", other),
        }
    }

    #[test]
    fn test_script_export() {
        let dir = tempfile::tempdir().unwrap();
        write_translator(
            dir.path(),
            "list.js",
            r#"{"translatorID":"js-list","label":"Title List","translatorType":2}"#,
            r#"
function doExport() {
    var item;
    while ((item = Biblio.nextItem())) {
        Biblio.write(item.itemType + ": " + item.title + "\n");
    }
}
"#,
        );
        let (services, store) = services(dir.path());
        let mut fields = BTreeMap::new();
        fields.insert("title".to_string(), "Dune".to_string());
        let id = store.create_item("book", fields).unwrap();

        let translate = Translate::new(Mode::Export, services);
        translate.set_items(vec![id]);
        translate.set_translator("js-list").unwrap();
        translate.translate().unwrap();
        assert_eq!(translate.success(), Some(true), "{:?}", translate.take_error());
        assert_eq!(translate.output().as_deref(), Some("book: Dune\n"));
    }

    #[test]
    fn test_script_delegates_to_native_importer() {
        let dir = tempfile::tempdir().unwrap();
        let body = format!(
            r#"
function detectWeb(doc, url) {{ return doc.content.indexOf("TY  -") >= 0 ? "journalArticle" : false; }}
function doWeb(doc, url) {{
    var importer = Biblio.loadTranslator("import");
    importer.setTranslator("{}");
    importer.setString(doc.content);
    importer.setHandler("itemDone", function (obj, item) {{
        item.url = url;
        item.complete();
    }});
    importer.translate();
}}
"#,
            RIS_ID
        );
        write_translator(
            dir.path(),
            "cite.js",
            r#"{"translatorID":"js-cite","label":"Citation Page","translatorType":4}"#,
            &body,
        );
        let (services, store) = services(dir.path());

        let translate = Translate::new(Mode::Web, services);
        let url = Url::parse("https://example.org/cite").unwrap();
        translate.set_document(Document::new(url, "TY  - JOUR\nTI  - Nested\nER  - \n"));
        translate.get_translators().unwrap();
        assert_eq!(translate.found()[0].descriptor.id, "js-cite");
        translate.set_translator("js-cite").unwrap();
        translate.translate().unwrap();
        assert_eq!(translate.success(), Some(true), "{:?}", translate.take_error());

        let saved = translate.saved_items();
        assert_eq!(saved.len(), 1);
        let item = store.get_item(saved[0]).unwrap().unwrap();
        assert_eq!(item.item_type, "journalArticle");
        assert_eq!(item.fields.get("title").map(String::as_str), Some("Nested"));
        assert_eq!(item.fields.get("url").map(String::as_str), Some("https://example.org/cite"));
    }

    #[test]
    fn test_script_selection_and_utilities() {
        let dir = tempfile::tempdir().unwrap();
        write_translator(
            dir.path(),
            "list.js",
            r#"{"translatorID":"js-pick","label":"Picker","translatorType":4}"#,
            r#"
function doWeb(doc, url) {
    var picked = Biblio.selectItems({ a: "Alpha", b: "Beta" });
    for (var key in picked) {
        var item = new Biblio.Item("webpage");
        item.title = Biblio.Utilities.trimInternal("  " + picked[key] + "  ");
        item.creators.push(Biblio.Utilities.cleanAuthor("Turing, Alan", "author", false));
        item.complete();
    }
}
"#,
        );
        let (services, store) = services(dir.path());

        let translate = Translate::new(Mode::Web, services);
        translate.set_document(Document::new(Url::parse("https://example.org/list").unwrap(), ""));
        translate
            .handlers()
            .on_select(Arc::new(|candidates: &[SelectCandidate]| vec![candidates[1].0.clone()]));
        translate.set_translator("js-pick").unwrap();
        translate.translate().unwrap();
        assert_eq!(translate.success(), Some(true), "{:?}", translate.take_error());

        let saved = translate.saved_items();
        assert_eq!(saved.len(), 1);
        let item = store.get_item(saved[0]).unwrap().unwrap();
        assert_eq!(item.fields.get("title").map(String::as_str), Some("Beta"));
        assert_eq!(item.creators.len(), 1);
    }

    #[test]
    fn test_default_engine_dispatch() {
        let engine = DefaultEngine::with_builtins();
        let ris = TranslatorDescriptor::new(RIS_ID, "RIS", crate::translator::types::TranslatorTypes::IMPORT)
            .with_source("native:ris");
        assert!(engine.native.binds(&ris).unwrap());
        assert!(engine.eval(&ris).is_ok());

        let script = TranslatorDescriptor::new("js", "Script", crate::translator::types::TranslatorTypes::IMPORT)
            .with_source("function doImport() {}");
        assert!(!engine.native.binds(&script).unwrap());
        assert!(engine.eval(&script).is_ok());
    }
}
