//! Biblio Translate Library
//!
//! This library provides the translator execution engine: the translator
//! registry, I/O virtualization, per-mode capability scopes, detection,
//! the item materialization pipeline and the operation orchestrator.

pub mod core;
pub mod io;
pub mod library;
pub mod pipeline;
pub mod translate;
pub mod translator;
pub mod translators;

// Re-export commonly used types
pub use crate::core::{EngineConfig, Result, TranslateError};
pub use translate::{Services, Translate};
pub use translator::{Mode, NativeEngine, TranslatorCache};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
