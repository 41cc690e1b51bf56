//! Translators
//!
//! Descriptors and the registry that caches them, the engine seam that turns
//! translator code into callable entry points (natively or on V8), the
//! per-mode capability surfaces and the detection search.

pub mod engine;
mod js_bindings;
pub mod js_engine;
pub mod logger;
pub mod registry;
pub mod sandbox;
pub mod search;
pub mod types;
pub mod utilities;

pub use engine::{NativeEngine, ScriptEngine, TranslatorCode};
pub use js_engine::{DefaultEngine, JsEngine};
pub use logger::{DefaultTranslatorLogger, TranslatorLogger};
pub use registry::{DescriptorSource, DirectorySource, StaticSource, TranslatorCache, TranslatorRegistry};
pub use sandbox::{
    Capabilities, CapabilityBuilder, ExportScope, ImportScope, NewCollection, NewItem, Scope, SearchScope,
    WebScope,
};
pub use search::{SearchStep, SearchTarget, TranslatorSearch};
pub use types::{
    Detection, Document, FoundTranslator, Mode, OptionMap, TranslatorDescriptor, TranslatorId, TranslatorTypes,
};
