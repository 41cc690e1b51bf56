//! Error type system for the translation engine
//!
//! This module provides:
//! - One error enum covering the engine's failure taxonomy
//! - Classification of record-local (recoverable) vs operation-level errors
//! - Error context helpers
//! - Diagnostic reports with trace IDs

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Main error type for the translation engine
#[derive(Debug, thiserror::Error)]
pub enum TranslateError {
    // Translator metadata errors
    #[error("Translator metadata error: {0}")]
    Metadata(String),

    #[error("Translator not found: {0}")]
    NotFound(String),

    #[error("No translator selected")]
    NoTranslator,

    #[error("Translator does not define {0}")]
    MissingEntryPoint(&'static str),

    // Translator code errors
    #[error("Detection failed in {translator}: {message}")]
    Detection { translator: String, message: String },

    #[error("Translation failed: {0}")]
    Execution(String),

    // Record and request errors
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Invalid selection: {0}")]
    InvalidSelection(String),

    #[error("No target set: {0}")]
    MissingTarget(&'static str),

    // Security errors
    #[error("Security violation: {0}")]
    SecurityViolation(String),

    // Collaborator errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Store error: {0}")]
    Store(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Operation cancelled")]
    Cancelled,
}

impl TranslateError {
    /// Get the error type name used in logs and failure reports
    pub fn error_type(&self) -> &'static str {
        match self {
            TranslateError::Metadata(_) => "MetadataError",
            TranslateError::NotFound(_) => "NotFound",
            TranslateError::NoTranslator => "NoTranslator",
            TranslateError::MissingEntryPoint(_) => "MissingEntryPoint",
            TranslateError::Detection { .. } => "DetectionError",
            TranslateError::Execution(_) => "ExecutionError",
            TranslateError::Validation(_) => "ValidationError",
            TranslateError::InvalidSelection(_) => "InvalidSelection",
            TranslateError::MissingTarget(_) => "MissingTarget",
            TranslateError::SecurityViolation(_) => "SecurityViolation",
            TranslateError::Io(_) => "IoError",
            TranslateError::Network(_) => "NetworkError",
            TranslateError::Store(_) => "StoreError",
            TranslateError::Serialization(_) => "SerializationError",
            TranslateError::Config(_) => "ConfigError",
            TranslateError::Cancelled => "Cancelled",
        }
    }

    /// Whether the error only affects the record being processed.
    ///
    /// Record-local errors are logged and processing continues; everything
    /// else ends the operation with `success = false`.
    pub fn is_record_local(&self) -> bool {
        matches!(
            self,
            TranslateError::Network(_) | TranslateError::NotFound(_)
        )
    }

    /// Wrap an arbitrary error raised by translator code during execution
    pub fn execution(err: impl fmt::Display) -> Self {
        TranslateError::Execution(err.to_string())
    }
}

impl From<serde_json::Error> for TranslateError {
    fn from(err: serde_json::Error) -> Self {
        TranslateError::Serialization(err.to_string())
    }
}

/// Result type alias for operations that can fail with TranslateError
pub type Result<T> = std::result::Result<T, TranslateError>;

/// Context extension trait for adding context to errors
pub trait ErrorContext<T> {
    /// Add context to an error, classifying it as an execution error
    fn context(self, context: impl Into<String>) -> Result<T>;

    /// Add context to an error using a closure
    fn with_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String;
}

impl<T, E> ErrorContext<T> for std::result::Result<T, E>
where
    E: std::fmt::Display,
{
    fn context(self, context: impl Into<String>) -> Result<T> {
        self.map_err(|e| TranslateError::Execution(format!("{}: {}", context.into(), e)))
    }

    fn with_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String,
    {
        self.map_err(|e| TranslateError::Execution(format!("{}: {}", f(), e)))
    }
}

/// Diagnostic report produced when an operation fails
///
/// The same report backs the generated diagnostic string handed to `error`
/// handlers and the outbound failure report for web captures.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorReport {
    /// Unique trace ID for this failure
    pub trace_id: String,
    /// Translator that was running, if any
    pub translator_id: Option<String>,
    /// Translator's last-updated timestamp
    pub last_updated: Option<String>,
    /// System diagnostics string (no user data)
    pub diagnostics: String,
    /// Error type identifier
    pub error_type: String,
    /// Human-readable error message
    pub message: String,
}

impl ErrorReport {
    /// Build a report for an error raised by the given translator
    pub fn new(
        error: &TranslateError,
        translator_id: Option<String>,
        last_updated: Option<String>,
    ) -> Self {
        Self {
            trace_id: Uuid::new_v4().to_string(),
            translator_id,
            last_updated,
            diagnostics: system_diagnostics(),
            error_type: error.error_type().to_string(),
            message: error.to_string(),
        }
    }

    /// Structured error dump sent with the outbound report
    pub fn error_dump(&self) -> String {
        serde_json::json!({
            "type": self.error_type,
            "message": self.message,
            "traceId": self.trace_id,
        })
        .to_string()
    }

    /// Form fields for the outbound report
    pub fn form_fields(&self) -> Vec<(&'static str, String)> {
        vec![
            ("translatorID", self.translator_id.clone().unwrap_or_default()),
            ("lastUpdated", self.last_updated.clone().unwrap_or_default()),
            ("diagnostic", self.diagnostics.clone()),
            ("errorData", self.error_dump()),
        ]
    }
}

impl fmt::Display for ErrorReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}] {} (translator: {}, last updated: {}, {}, trace_id: {})",
            self.error_type,
            self.message,
            self.translator_id.as_deref().unwrap_or("none"),
            self.last_updated.as_deref().unwrap_or("unknown"),
            self.diagnostics,
            self.trace_id
        )
    }
}

/// Anonymized description of the running engine
pub fn system_diagnostics() -> String {
    format!(
        "{}/{} ({}; {})",
        env!("CARGO_PKG_NAME"),
        env!("CARGO_PKG_VERSION"),
        std::env::consts::OS,
        std::env::consts::ARCH
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_types() {
        assert_eq!(TranslateError::Metadata("x".into()).error_type(), "MetadataError");
        assert_eq!(
            TranslateError::InvalidSelection("empty".into()).error_type(),
            "InvalidSelection"
        );
        assert_eq!(TranslateError::NoTranslator.error_type(), "NoTranslator");
    }

    #[test]
    fn test_record_local() {
        assert!(TranslateError::Network("timeout".into()).is_record_local());
        assert!(!TranslateError::Validation("no title".into()).is_record_local());
        assert!(!TranslateError::Execution("boom".into()).is_record_local());
    }

    #[test]
    fn test_report_form_fields() {
        let error = TranslateError::Execution("doWeb threw".into());
        let report = ErrorReport::new(&error, Some("abc".into()), Some("2024-01-01 00:00:00".into()));

        let fields = report.form_fields();
        assert_eq!(fields[0], ("translatorID", "abc".to_string()));
        assert_eq!(fields[1].1, "2024-01-01 00:00:00");
        assert!(fields[3].1.contains("doWeb threw"));
        assert!(!report.trace_id.is_empty());
        assert!(report.to_string().contains("ExecutionError"));
    }

    #[test]
    fn test_error_context() {
        let result: std::result::Result<(), std::io::Error> =
            Err(std::io::Error::new(std::io::ErrorKind::NotFound, "file not found"));

        let err = result.context("Failed to open import file").unwrap_err();
        assert!(err.to_string().contains("Failed to open import file"));
        assert!(err.to_string().contains("file not found"));
        assert_eq!(err.error_type(), "ExecutionError");
    }
}
