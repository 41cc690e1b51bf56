//! Ambient services shared by the engine:
//! - Configuration management
//! - Structured logging system
//! - Error handling and type system

pub mod config;
pub mod error;
pub mod logging;

pub use config::{EngineConfig, GlobalArgs, PrefsConfig};
pub use error::{ErrorContext, ErrorReport, Result, TranslateError};
pub use logging::Logger;
