//! Script engine seam
//!
//! The engine turns a descriptor's code into something callable. Everything
//! above this module only sees [`TranslatorCode`], so the isolation mechanism
//! can be swapped without touching orchestration.

use super::sandbox::{ExportScope, ImportScope, SearchScope, WebScope};
use super::types::{Detection, Document, TranslatorDescriptor};
use crate::core::error::{Result, TranslateError};
use crate::pipeline::records::ScrapedItem;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;
use url::Url;

/// Prefix of the directive that binds a descriptor to native code
pub const NATIVE_DIRECTIVE: &str = "native:";

/// Entry points a translator may provide
///
/// Detection routines that are not provided report "not found"; missing
/// `do*` routines fail with [`TranslateError::MissingEntryPoint`]. Scopes are
/// cheap to clone, so code that calls `wait()` can move a clone elsewhere and
/// call `done()` later.
pub trait TranslatorCode: Send + Sync {
    fn detect_import(&self, _scope: &ImportScope) -> Result<Detection> {
        Ok(Detection::NotFound)
    }

    fn do_import(&self, _scope: &ImportScope) -> Result<()> {
        Err(TranslateError::MissingEntryPoint("doImport"))
    }

    fn detect_web(&self, _scope: &WebScope, _document: &Document, _url: &Url) -> Result<Detection> {
        Ok(Detection::NotFound)
    }

    fn do_web(&self, _scope: &WebScope, _document: &Document, _url: &Url) -> Result<()> {
        Err(TranslateError::MissingEntryPoint("doWeb"))
    }

    fn detect_search(&self, _scope: &SearchScope, _query: &ScrapedItem) -> Result<Detection> {
        Ok(Detection::NotFound)
    }

    fn do_search(&self, _scope: &SearchScope, _query: &ScrapedItem) -> Result<()> {
        Err(TranslateError::MissingEntryPoint("doSearch"))
    }

    fn do_export(&self, _scope: &ExportScope) -> Result<()> {
        Err(TranslateError::MissingEntryPoint("doExport"))
    }
}

/// Evaluates translator code into callable entry points
pub trait ScriptEngine: Send + Sync {
    fn eval(&self, descriptor: &TranslatorDescriptor) -> Result<Arc<dyn TranslatorCode>>;
}

/// Engine for translators implemented in Rust.
///
/// A descriptor's body names its implementation with a `native:<name>` line;
/// without one, the translator ID is used as the name.
#[derive(Default, Clone)]
pub struct NativeEngine {
    translators: HashMap<String, Arc<dyn TranslatorCode>>,
}

impl NativeEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Engine with the bundled translators registered
    pub fn with_builtins() -> Self {
        let mut engine = Self::new();
        crate::translators::register_builtins(&mut engine);
        engine
    }

    pub fn register(&mut self, name: impl Into<String>, code: Arc<dyn TranslatorCode>) {
        self.translators.insert(name.into(), code);
    }

    /// Whether `descriptor` runs natively: its body names a binding, or
    /// code is registered under its ID
    pub fn binds(&self, descriptor: &TranslatorDescriptor) -> Result<bool> {
        let source = descriptor.source()?;
        Ok(Self::directive(source).is_some() || self.translators.contains_key(&descriptor.id))
    }

    fn directive(source: &str) -> Option<&str> {
        source
            .lines()
            .map(str::trim)
            .find(|line| !line.is_empty())
            .and_then(|line| line.strip_prefix(NATIVE_DIRECTIVE))
            .map(str::trim)
    }

    fn binding_name(descriptor: &TranslatorDescriptor) -> Result<String> {
        let source = descriptor.source()?;
        Ok(match Self::directive(source) {
            Some(name) => name.to_string(),
            None => descriptor.id.clone(),
        })
    }
}

impl ScriptEngine for NativeEngine {
    fn eval(&self, descriptor: &TranslatorDescriptor) -> Result<Arc<dyn TranslatorCode>> {
        let name = Self::binding_name(descriptor)?;
        debug!(translator = %descriptor.label, binding = %name, "Loading native translator");
        self.translators.get(&name).cloned().ok_or_else(|| {
            TranslateError::Execution(format!("no code registered for {} ({})", descriptor.label, name))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::translator::types::TranslatorTypes;

    struct Empty;
    impl TranslatorCode for Empty {}

    #[test]
    fn test_directive_binding() {
        let mut engine = NativeEngine::new();
        engine.register("empty", Arc::new(Empty));

        let bound = TranslatorDescriptor::new("some-id", "Bound", TranslatorTypes::IMPORT)
            .with_source("\n  native:empty\n");
        assert!(engine.eval(&bound).is_ok());

        let by_id = TranslatorDescriptor::new("empty", "By ID", TranslatorTypes::IMPORT);
        assert!(engine.eval(&by_id).is_ok());

        let unknown = TranslatorDescriptor::new("nope", "Unknown", TranslatorTypes::IMPORT);
        assert!(matches!(engine.eval(&unknown), Err(TranslateError::Execution(_))));

        assert!(engine.binds(&bound).unwrap());
        assert!(engine.binds(&by_id).unwrap());
        let script = TranslatorDescriptor::new("js", "Script", TranslatorTypes::IMPORT)
            .with_source("function doImport() {}");
        assert!(!engine.binds(&script).unwrap());
    }
}
