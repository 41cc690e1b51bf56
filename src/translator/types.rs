//! Translator type definitions
//!
//! This module defines translator descriptors, operation modes and the
//! values exchanged with translator detection routines.

use crate::core::error::{Result, TranslateError};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use tracing::warn;
use url::Url;

/// Stable translator identifier
pub type TranslatorId = String;

/// Option maps carried by descriptors and execution contexts
pub type OptionMap = Map<String, Value>;

/// Priority used when a header does not declare one
pub const DEFAULT_PRIORITY: i32 = 100;

/// Operation mode
///
/// Fixed when an operation is created. Decides the target type, the entry
/// points a translator must provide and the capabilities it is given.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    /// Read records from a file or string
    Import,
    /// Write library items to a file or string
    Export,
    /// Scrape records from a web document
    Web,
    /// Resolve records from an identifier query
    Search,
}

impl Mode {
    pub const ALL: [Mode; 4] = [Mode::Import, Mode::Export, Mode::Web, Mode::Search];

    /// Bit for this mode in a translator type mask
    pub fn type_bit(&self) -> TranslatorTypes {
        match self {
            Mode::Import => TranslatorTypes::IMPORT,
            Mode::Export => TranslatorTypes::EXPORT,
            Mode::Web => TranslatorTypes::WEB,
            Mode::Search => TranslatorTypes::SEARCH,
        }
    }

    /// Name of the detection entry point for this mode
    pub fn detect_entry_point(&self) -> Option<&'static str> {
        match self {
            Mode::Import => Some("detectImport"),
            Mode::Web => Some("detectWeb"),
            Mode::Search => Some("detectSearch"),
            Mode::Export => None,
        }
    }

    /// Name of the execution entry point for this mode
    pub fn do_entry_point(&self) -> &'static str {
        match self {
            Mode::Import => "doImport",
            Mode::Export => "doExport",
            Mode::Web => "doWeb",
            Mode::Search => "doSearch",
        }
    }
}

impl std::fmt::Display for Mode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Mode::Import => write!(f, "import"),
            Mode::Export => write!(f, "export"),
            Mode::Web => write!(f, "web"),
            Mode::Search => write!(f, "search"),
        }
    }
}

impl std::str::FromStr for Mode {
    type Err = TranslateError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "import" => Ok(Mode::Import),
            "export" => Ok(Mode::Export),
            "web" => Ok(Mode::Web),
            "search" => Ok(Mode::Search),
            other => Err(TranslateError::Validation(format!("unknown mode: {}", other))),
        }
    }
}

/// Bit set over the four modes a translator can serve
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TranslatorTypes(u8);

impl TranslatorTypes {
    pub const IMPORT: TranslatorTypes = TranslatorTypes(1);
    pub const EXPORT: TranslatorTypes = TranslatorTypes(2);
    pub const WEB: TranslatorTypes = TranslatorTypes(4);
    pub const SEARCH: TranslatorTypes = TranslatorTypes(8);

    /// Accepts only masks made of the four known bits
    pub fn from_bits(bits: u8) -> Option<Self> {
        if bits == 0 || bits & !0x0F != 0 {
            None
        } else {
            Some(TranslatorTypes(bits))
        }
    }

    pub fn bits(&self) -> u8 {
        self.0
    }

    pub fn supports(&self, mode: Mode) -> bool {
        self.0 & mode.type_bit().0 != 0
    }

    pub fn modes(&self) -> Vec<Mode> {
        Mode::ALL.into_iter().filter(|m| self.supports(*m)).collect()
    }
}

impl std::ops::BitOr for TranslatorTypes {
    type Output = TranslatorTypes;

    fn bitor(self, rhs: TranslatorTypes) -> TranslatorTypes {
        TranslatorTypes(self.0 | rhs.0)
    }
}

impl std::fmt::Debug for TranslatorTypes {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.modes()).finish()
    }
}

/// Metadata header at the top of a translator file
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TranslatorHeader {
    #[serde(rename = "translatorID")]
    pub translator_id: String,

    /// Falls back to the ID when missing
    #[serde(default)]
    pub label: String,

    /// Bit mask of supported modes
    pub translator_type: u8,

    /// File extension (import) or URL pattern (web)
    #[serde(default)]
    pub target: Option<String>,

    #[serde(default)]
    pub last_updated: String,

    #[serde(default)]
    pub in_repository: bool,

    #[serde(default = "default_priority")]
    pub priority: i32,

    #[serde(default)]
    pub config_options: OptionMap,

    #[serde(default)]
    pub display_options: OptionMap,
}

fn default_priority() -> i32 {
    DEFAULT_PRIORITY
}

/// Where a translator's code lives
#[derive(Debug, Clone)]
enum SourceLocation {
    Inline(String),
    /// Body starts `offset` bytes into the file, after the header
    File { path: PathBuf, offset: usize },
}

/// Immutable translator metadata plus lazily loaded code
///
/// Descriptors are created when the registry loads and live for the rest of
/// the process. The code body is only read the first time it is needed.
#[derive(Debug)]
pub struct TranslatorDescriptor {
    /// Unique translator ID
    pub id: TranslatorId,

    /// Human-readable name
    pub label: String,

    /// Modes the translator serves
    pub types: TranslatorTypes,

    /// Pre-filter pattern: a file extension for import, a URL regex for web
    pub target: Option<String>,

    /// Last modification timestamp, reported with failures
    pub last_updated: String,

    /// Whether the translator comes from the shared repository
    pub in_repository: bool,

    /// Lower runs first
    pub priority: i32,

    /// Engine-affecting switches (e.g. `dataMode`)
    pub config_options: OptionMap,

    /// User-facing toggles (e.g. `exportFileData`)
    pub display_options: OptionMap,

    location: SourceLocation,
    code: OnceLock<String>,
    import_pattern: OnceLock<Option<Regex>>,
    web_pattern: OnceLock<Option<Regex>>,
}

impl TranslatorDescriptor {
    /// Create a descriptor with inline (possibly empty) code
    pub fn new(id: impl Into<String>, label: impl Into<String>, types: TranslatorTypes) -> Self {
        Self {
            id: id.into(),
            label: label.into(),
            types,
            target: None,
            last_updated: String::new(),
            in_repository: false,
            priority: DEFAULT_PRIORITY,
            config_options: OptionMap::new(),
            display_options: OptionMap::new(),
            location: SourceLocation::Inline(String::new()),
            code: OnceLock::new(),
            import_pattern: OnceLock::new(),
            web_pattern: OnceLock::new(),
        }
    }

    pub fn with_target(mut self, target: impl Into<String>) -> Self {
        self.target = Some(target.into());
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_last_updated(mut self, last_updated: impl Into<String>) -> Self {
        self.last_updated = last_updated.into();
        self
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.location = SourceLocation::Inline(source.into());
        self.code = OnceLock::new();
        self
    }

    pub fn with_config_option(mut self, key: &str, value: Value) -> Self {
        self.config_options.insert(key.to_string(), value);
        self
    }

    pub fn with_display_option(mut self, key: &str, value: Value) -> Self {
        self.display_options.insert(key.to_string(), value);
        self
    }

    /// Build a descriptor from a parsed header
    pub fn from_header(header: TranslatorHeader) -> Result<Self> {
        if header.translator_id.trim().is_empty() {
            return Err(TranslateError::Metadata("translatorID is empty".to_string()));
        }
        let types = TranslatorTypes::from_bits(header.translator_type).ok_or_else(|| {
            TranslateError::Metadata(format!(
                "{} has an invalid translatorType: {}",
                header.translator_id, header.translator_type
            ))
        })?;

        let label = if header.label.trim().is_empty() {
            header.translator_id.clone()
        } else {
            header.label
        };
        let mut descriptor = Self::new(header.translator_id, label, types)
            .with_priority(header.priority)
            .with_last_updated(header.last_updated);
        descriptor.target = header.target.filter(|t| !t.is_empty());
        descriptor.in_repository = header.in_repository;
        descriptor.config_options = header.config_options;
        descriptor.display_options = header.display_options;
        Ok(descriptor)
    }

    /// Parse translator file text: a JSON header followed by the code body.
    ///
    /// With a `path`, the body is not kept and is re-read from the file on
    /// first use.
    pub fn parse(text: &str, path: Option<&Path>) -> Result<Self> {
        let mut stream = serde_json::Deserializer::from_str(text).into_iter::<TranslatorHeader>();
        let header = match stream.next() {
            Some(Ok(header)) => header,
            Some(Err(e)) => return Err(TranslateError::Metadata(format!("invalid header: {}", e))),
            None => return Err(TranslateError::Metadata("missing header".to_string())),
        };
        let offset = stream.byte_offset();

        let mut descriptor = Self::from_header(header)?;
        descriptor.location = match path {
            Some(path) => SourceLocation::File {
                path: path.to_path_buf(),
                offset,
            },
            None => SourceLocation::Inline(strip_body(&text[offset..]).to_string()),
        };
        Ok(descriptor)
    }

    pub fn supports(&self, mode: Mode) -> bool {
        self.types.supports(mode)
    }

    /// Translator code, loading it on first access
    pub fn source(&self) -> Result<&str> {
        if let Some(code) = self.code.get() {
            return Ok(code);
        }
        let loaded = match &self.location {
            SourceLocation::Inline(code) => code.clone(),
            SourceLocation::File { path, offset } => {
                let text = std::fs::read_to_string(path)?;
                let body = text.get(*offset..).ok_or_else(|| {
                    TranslateError::Metadata(format!("{} changed on disk since it was loaded", path.display()))
                })?;
                strip_body(body).to_string()
            }
        };
        Ok(self.code.get_or_init(|| loaded))
    }

    /// Structural pre-filter against an import path or a web URL.
    ///
    /// Descriptors without a target, and modes other than import and web,
    /// always pass. A pattern that does not compile never matches.
    pub fn matches_target(&self, mode: Mode, target: &str) -> bool {
        let Some(pattern) = self.target.as_deref() else {
            return true;
        };
        let compiled = match mode {
            Mode::Import => self
                .import_pattern
                .get_or_init(|| self.compile(&format!(r"(?i)\.(?:{})$", pattern))),
            Mode::Web => self.web_pattern.get_or_init(|| self.compile(pattern)),
            Mode::Export | Mode::Search => return true,
        };
        compiled.as_ref().map_or(false, |re| re.is_match(target))
    }

    fn compile(&self, pattern: &str) -> Option<Regex> {
        match Regex::new(pattern) {
            Ok(re) => Some(re),
            Err(e) => {
                warn!(translator = %self.label, pattern, error = %e, "Invalid target pattern");
                None
            }
        }
    }
}

fn strip_body(body: &str) -> &str {
    body.trim_start_matches(|c: char| c == '\n' || c == '\r')
}

/// Result of a detection routine
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Detection {
    NotFound,
    Found,
    /// Found, naming the kind of result (e.g. an item type)
    Type(String),
}

impl Detection {
    pub fn is_found(&self) -> bool {
        !matches!(self, Detection::NotFound)
    }

    pub fn item_type(&self) -> Option<&str> {
        match self {
            Detection::Type(t) => Some(t),
            _ => None,
        }
    }

    /// Interpret a loosely-typed detection value (truthy or a type string)
    pub fn from_value(value: &Value) -> Self {
        match value {
            Value::Null => Detection::NotFound,
            Value::Bool(found) => Detection::from(*found),
            Value::String(s) if s.is_empty() => Detection::NotFound,
            Value::String(s) => Detection::Type(s.clone()),
            Value::Number(n) => Detection::from(n.as_f64().map_or(false, |f| f != 0.0)),
            Value::Array(_) | Value::Object(_) => Detection::Found,
        }
    }
}

impl From<bool> for Detection {
    fn from(found: bool) -> Self {
        if found {
            Detection::Found
        } else {
            Detection::NotFound
        }
    }
}

impl From<&str> for Detection {
    fn from(item_type: &str) -> Self {
        Detection::from_value(&Value::String(item_type.to_string()))
    }
}

/// A translator whose detection succeeded
#[derive(Debug, Clone)]
pub struct FoundTranslator {
    pub descriptor: std::sync::Arc<TranslatorDescriptor>,
    /// Result subtype reported by detection, if any
    pub item_type: Option<String>,
}

/// Web page handed to web translators
#[derive(Debug, Clone)]
pub struct Document {
    pub url: Url,
    pub content: String,
    pub content_type: Option<String>,
}

impl Document {
    pub fn new(url: Url, content: impl Into<String>) -> Self {
        Self {
            url,
            content: content.into(),
            content_type: Some("text/html".to_string()),
        }
    }
}
