//! Bundled translators
//!
//! Native implementations registered with [`NativeEngine::with_builtins`]
//! and the translator files that describe them.

pub mod ris;
pub mod triples;

use crate::translator::engine::NativeEngine;
use crate::translator::registry::StaticSource;
use std::sync::Arc;

pub const RIS_ID: &str = "32d59d2d-b65a-4da4-b0a3-bdd3cfb979e7";
pub const TRIPLES_ID: &str = "5e3ad958-ac79-463d-812b-a86a9235c28f";

const RIS_FILE: &str = r#"{
    "translatorID": "32d59d2d-b65a-4da4-b0a3-bdd3cfb979e7",
    "label": "RIS",
    "translatorType": 3,
    "target": "ris",
    "lastUpdated": "2024-05-02 09:30:00",
    "inRepository": true,
    "priority": 100,
    "configOptions": {"dataMode": "line"},
    "displayOptions": {"exportCharset": "UTF-8", "exportNotes": true, "exportFileData": false}
}
native:ris
"#;

const TRIPLES_FILE: &str = r#"{
    "translatorID": "5e3ad958-ac79-463d-812b-a86a9235c28f",
    "label": "Bibliographic Triples",
    "translatorType": 3,
    "target": "nt",
    "lastUpdated": "2024-04-18 16:05:00",
    "inRepository": true,
    "priority": 50,
    "configOptions": {"dataMode": "rdf"},
    "displayOptions": {"exportNotes": true}
}
native:triples
"#;

/// Register the bundled implementations
pub fn register_builtins(engine: &mut NativeEngine) {
    engine.register("ris", Arc::new(ris::Ris));
    engine.register("triples", Arc::new(triples::Triples));
}

/// Descriptor source for the bundled translator files
pub fn builtin_source() -> StaticSource {
    StaticSource::new("builtin", vec![RIS_FILE, TRIPLES_FILE])
}
