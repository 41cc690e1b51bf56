//! I/O virtualization layer
//!
//! Translators see their input and output through one of three data-access
//! modes, regardless of whether the physical side is a file or a string:
//! - Block: `read()` returns all remaining text, `read(n)` a character run
//! - Line: `read()` returns one line with CR/LF/CRLF normalized away
//! - Graph: the input is parsed into a [`graph::GraphStore`] (and the store
//!   is serialized to the output at the end of an export)

pub mod charset;
pub mod graph;
pub mod handles;
pub mod reader;
pub mod writer;

pub use charset::Charset;
pub use graph::{ContainerKind, GraphHandle, GraphStore, Node, Statement};
pub use handles::{HandleSet, IoHandle};
pub use reader::{ImportSource, TextReader};
pub use writer::{ExportTarget, TextWriter};

use serde_json::Value;

/// Data-access mode requested through the `dataMode` config option
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DataMode {
    #[default]
    Block,
    Line,
    Graph,
}

impl DataMode {
    /// Interpret a `dataMode` option value; unknown values fall back to block
    pub fn from_option(value: Option<&Value>) -> Self {
        match value.and_then(Value::as_str) {
            Some("line") => DataMode::Line,
            Some("rdf") | Some("rdf/xml") | Some("graph") => DataMode::Graph,
            Some("block") | None => DataMode::Block,
            Some(other) => {
                tracing::warn!(data_mode = %other, "Unknown data mode, using block");
                DataMode::Block
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_data_mode_from_option() {
        assert_eq!(DataMode::from_option(None), DataMode::Block);
        assert_eq!(DataMode::from_option(Some(&json!("line"))), DataMode::Line);
        assert_eq!(DataMode::from_option(Some(&json!("rdf"))), DataMode::Graph);
        assert_eq!(DataMode::from_option(Some(&json!("tape"))), DataMode::Block);
    }
}
