//! Import-side text reader
//!
//! Wraps a file or an in-memory string and hands translators decoded text in
//! blocks, fixed-size character runs or normalized lines. The charset is
//! fixed lazily on first read, from a byte-order mark when one is present.

use crate::core::error::Result;
use crate::io::charset::{detect_bom, Charset, TextDecoder};
use crate::io::handles::IoHandle;
use std::fs::File;
use std::io::{Cursor, Read, Seek, SeekFrom};
use std::path::PathBuf;
use tracing::debug;

const DEFAULT_CHUNK_SIZE: usize = 8 * 1024;

/// Where imported text comes from
#[derive(Debug, Clone)]
pub enum ImportSource {
    File(PathBuf),
    Text(String),
}

impl ImportSource {
    /// Path used for target-pattern matching and relative attachment paths
    pub fn path(&self) -> Option<&std::path::Path> {
        match self {
            ImportSource::File(path) => Some(path.as_path()),
            ImportSource::Text(_) => None,
        }
    }
}

trait ByteStream: Read + Seek + Send {}
impl<T: Read + Seek + Send> ByteStream for T {}

/// Incremental decoding reader over an [`ImportSource`]
pub struct TextReader {
    source: ImportSource,
    default_charset: Charset,
    charset: Option<Charset>,
    stream: Option<Box<dyn ByteStream>>,
    decoder: Option<TextDecoder>,
    /// Byte offset just past any byte-order mark
    data_start: u64,
    buffer: String,
    cursor: usize,
    eof: bool,
    closed: bool,
    chunk_size: usize,
}

impl TextReader {
    /// Create a reader; nothing is opened until the first read
    pub fn new(source: ImportSource, default_charset: Charset) -> Self {
        Self {
            source,
            default_charset,
            charset: None,
            stream: None,
            decoder: None,
            data_start: 0,
            buffer: String::new(),
            cursor: 0,
            eof: false,
            closed: false,
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }

    #[cfg(test)]
    pub(crate) fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    pub fn source(&self) -> &ImportSource {
        &self.source
    }

    /// The charset in use, once known
    pub fn charset(&self) -> Option<Charset> {
        self.charset
    }

    /// Override the charset chosen by detection.
    ///
    /// An open stream is rewound to just past the byte-order mark and decoding
    /// restarts with the new charset. In-memory strings are already decoded, so
    /// the call is a no-op for them.
    pub fn set_charset(&mut self, charset: Charset) -> Result<()> {
        if matches!(self.source, ImportSource::Text(_)) {
            debug!(charset = %charset, "Ignoring charset override for in-memory input");
            return Ok(());
        }

        self.charset = Some(charset);
        if let Some(stream) = self.stream.as_mut() {
            stream.seek(SeekFrom::Start(self.data_start))?;
            self.decoder = Some(charset.decoder());
            self.buffer.clear();
            self.cursor = 0;
            self.eof = false;
        }
        Ok(())
    }

    /// Everything not yet consumed, or `None` at end of input
    pub fn read_all(&mut self) -> Result<Option<String>> {
        self.ensure_started()?;
        while !self.eof {
            self.fill()?;
        }
        let rest = self.take(self.buffer.len() - self.cursor);
        Ok(if rest.is_empty() { None } else { Some(rest) })
    }

    /// Up to `count` characters, or `None` at end of input
    pub fn read_chars(&mut self, count: usize) -> Result<Option<String>> {
        self.ensure_started()?;
        loop {
            let pending = &self.buffer[self.cursor..];
            if let Some((offset, _)) = pending.char_indices().nth(count) {
                return Ok(Some(self.take(offset)));
            }
            if self.eof {
                let len = pending.len();
                let rest = self.take(len);
                return Ok(if rest.is_empty() { None } else { Some(rest) });
            }
            self.fill()?;
        }
    }

    /// The next line without its terminator, or `None` at end of input.
    ///
    /// CR, LF and CRLF all end a line.
    pub fn read_line(&mut self) -> Result<Option<String>> {
        self.ensure_started()?;
        loop {
            let pending = &self.buffer[self.cursor..];
            if let Some(index) = pending.find(|c| c == '\r' || c == '\n') {
                let is_cr = pending.as_bytes()[index] == b'\r';
                if is_cr && index + 1 == pending.len() && !self.eof {
                    // The LF of a CRLF may be in the next chunk
                    self.fill()?;
                    continue;
                }
                let terminator = if is_cr && pending.as_bytes().get(index + 1) == Some(&b'\n') {
                    2
                } else {
                    1
                };
                let line = self.take(index);
                self.cursor += terminator;
                return Ok(Some(line));
            }
            if self.eof {
                let len = pending.len();
                if len == 0 {
                    return Ok(None);
                }
                let rest = self.take(len);
                return Ok(Some(rest));
            }
            self.fill()?;
        }
    }

    fn take(&mut self, len: usize) -> String {
        let out = self.buffer[self.cursor..self.cursor + len].to_string();
        self.cursor += len;
        out
    }

    fn ensure_started(&mut self) -> Result<()> {
        if self.stream.is_some() || self.eof {
            return Ok(());
        }
        if self.closed {
            self.eof = true;
            return Ok(());
        }

        let mut stream: Box<dyn ByteStream> = match &self.source {
            ImportSource::File(path) => Box::new(File::open(path)?),
            ImportSource::Text(text) => {
                let text = text.strip_prefix('\u{feff}').unwrap_or(text);
                Box::new(Cursor::new(text.as_bytes().to_vec()))
            }
        };

        let charset = match &self.source {
            ImportSource::Text(_) => Charset::Utf8,
            ImportSource::File(path) => {
                let detected = detect_bom(&mut stream)?;
                match (self.charset, detected) {
                    (None, Some(found)) => {
                        debug!(path = %path.display(), charset = %found, "Byte-order mark detected");
                        found
                    }
                    (None, None) => self.default_charset,
                    (Some(known), Some(found)) if known == found => known,
                    (Some(known), Some(_)) => {
                        stream.seek(SeekFrom::Start(0))?;
                        known
                    }
                    (Some(known), None) => known,
                }
            }
        };

        self.data_start = stream.stream_position()?;
        self.charset = Some(charset);
        self.decoder = Some(charset.decoder());
        self.stream = Some(stream);
        Ok(())
    }

    fn fill(&mut self) -> Result<()> {
        let (Some(stream), Some(decoder)) = (self.stream.as_mut(), self.decoder.as_mut()) else {
            self.eof = true;
            return Ok(());
        };

        if self.cursor > 0 && self.cursor * 2 >= self.buffer.len() {
            self.buffer.drain(..self.cursor);
            self.cursor = 0;
        }

        let mut chunk = vec![0u8; self.chunk_size];
        let read = stream.read(&mut chunk)?;
        if read == 0 {
            decoder.decode(&[], true, &mut self.buffer);
            self.eof = true;
        } else {
            decoder.decode(&chunk[..read], false, &mut self.buffer);
        }
        Ok(())
    }
}

impl IoHandle for TextReader {
    fn describe(&self) -> String {
        match &self.source {
            ImportSource::File(path) => format!("reader {}", path.display()),
            ImportSource::Text(_) => "reader <string>".to_string(),
        }
    }

    fn close(&mut self) -> Result<()> {
        self.stream = None;
        self.decoder = None;
        self.closed = true;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::io::Write;

    fn file_with(bytes: &[u8]) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(bytes).unwrap();
        file.flush().unwrap();
        file
    }

    #[test]
    fn test_utf8_bom_is_consumed() {
        let file = file_with(b"\xEF\xBB\xBFhello");
        let mut reader = TextReader::new(ImportSource::File(file.path().to_path_buf()), Charset::Utf8);

        assert_eq!(reader.read_all().unwrap().as_deref(), Some("hello"));
        assert_eq!(reader.charset(), Some(Charset::Utf8));
        assert_eq!(reader.read_all().unwrap(), None);
    }

    #[test]
    fn test_utf16le_bom_selects_decoder() {
        let mut bytes = vec![0xFF, 0xFE];
        bytes.extend(Charset::Utf16Le.encode("TY  - BOOK\r\nER  - "));
        let file = file_with(&bytes);
        let mut reader = TextReader::new(ImportSource::File(file.path().to_path_buf()), Charset::Utf8);

        assert_eq!(reader.read_line().unwrap().as_deref(), Some("TY  - BOOK"));
        assert_eq!(reader.charset(), Some(Charset::Utf16Le));
        assert_eq!(reader.read_line().unwrap().as_deref(), Some("ER  - "));
        assert_eq!(reader.read_line().unwrap(), None);
    }

    #[test]
    fn test_default_charset_without_bom() {
        let latin1 = Charset::for_label("windows-1252").unwrap();
        let file = file_with(&latin1.encode("café"));
        let mut reader = TextReader::new(ImportSource::File(file.path().to_path_buf()), latin1);
        assert_eq!(reader.read_all().unwrap().as_deref(), Some("café"));
    }

    #[test]
    fn test_set_charset_restarts_after_bom() {
        let file = file_with(b"\xEF\xBB\xBFcaf\xE9");
        let mut reader = TextReader::new(ImportSource::File(file.path().to_path_buf()), Charset::Utf8);
        assert_eq!(reader.read_chars(2).unwrap().as_deref(), Some("ca"));

        reader.set_charset(Charset::for_label("windows-1252").unwrap()).unwrap();
        assert_eq!(reader.read_all().unwrap().as_deref(), Some("café"));
    }

    #[test]
    fn test_read_chars() {
        let mut reader = TextReader::new(ImportSource::Text("αβγδ".to_string()), Charset::Utf8);
        assert_eq!(reader.read_chars(3).unwrap().as_deref(), Some("αβγ"));
        assert_eq!(reader.read_chars(3).unwrap().as_deref(), Some("δ"));
        assert_eq!(reader.read_chars(3).unwrap(), None);
    }

    #[test]
    fn test_text_source_strips_bom_char() {
        let mut reader = TextReader::new(ImportSource::Text("\u{feff}x\ny".to_string()), Charset::Utf8);
        assert_eq!(reader.read_line().unwrap().as_deref(), Some("x"));
        assert_eq!(reader.read_line().unwrap().as_deref(), Some("y"));
    }

    #[test]
    fn test_crlf_split_across_chunks() {
        let file = file_with(b"ab\r\ncd");
        let mut reader =
            TextReader::new(ImportSource::File(file.path().to_path_buf()), Charset::Utf8).with_chunk_size(3);
        assert_eq!(reader.read_line().unwrap().as_deref(), Some("ab"));
        assert_eq!(reader.read_line().unwrap().as_deref(), Some("cd"));
        assert_eq!(reader.read_line().unwrap(), None);
    }

    #[test]
    fn test_close_is_idempotent() {
        let mut reader = TextReader::new(ImportSource::Text("abc".to_string()), Charset::Utf8);
        reader.close().unwrap();
        reader.close().unwrap();
        assert_eq!(reader.read_all().unwrap(), None);
    }

    proptest! {
        #[test]
        fn prop_line_endings_normalize(
            lines in prop::collection::vec("[a-z ]{0,12}", 1..12),
            endings in prop::collection::vec(0usize..3, 12),
            chunk in 1usize..7,
        ) {
            let mut text = String::new();
            for (i, line) in lines.iter().enumerate() {
                text.push_str(line);
                text.push_str(["\n", "\r", "\r\n"][endings[i]]);
            }
            let file = file_with(text.as_bytes());
            let mut reader = TextReader::new(ImportSource::File(file.path().to_path_buf()), Charset::Utf8)
                .with_chunk_size(chunk);

            let mut read = Vec::new();
            while let Some(line) = reader.read_line().unwrap() {
                read.push(line);
            }
            prop_assert_eq!(read, lines);
        }
    }
}
