//! Export-side text writer

use crate::core::error::{Result, TranslateError};
use crate::io::charset::Charset;
use crate::io::handles::IoHandle;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::PathBuf;

/// Where exported text goes
#[derive(Debug, Clone)]
pub enum ExportTarget {
    File(PathBuf),
    /// Captured in memory and returned by the operation's `output()`
    Memory,
}

/// Encoding writer over an [`ExportTarget`]
pub struct TextWriter {
    target: ExportTarget,
    charset: Charset,
    write_bom: bool,
    file: Option<BufWriter<File>>,
    memory: String,
    written: bool,
    closed: bool,
}

impl TextWriter {
    /// `write_bom` asks for a byte-order mark ahead of the first write
    pub fn new(target: ExportTarget, charset: Charset, write_bom: bool) -> Self {
        Self {
            target,
            charset,
            write_bom,
            file: None,
            memory: String::new(),
            written: false,
            closed: false,
        }
    }

    pub fn charset(&self) -> Charset {
        self.charset
    }

    /// Switch the output charset from a label.
    ///
    /// A `+BOM` suffix (as in `UTF-8+BOM`) requests a byte-order mark; a plain
    /// label keeps whatever mark setting the writer already had. Has no
    /// effect on bytes already written.
    pub fn set_charset(&mut self, label: &str) -> Result<()> {
        let (name, bom) = match label.len().checked_sub(4).filter(|&at| label.is_char_boundary(at)) {
            Some(at) if label[at..].eq_ignore_ascii_case("+bom") => (&label[..at], true),
            _ => (label, false),
        };
        self.charset = Charset::for_label(name)
            .ok_or_else(|| TranslateError::Validation(format!("Unknown character set: {}", label)))?;
        self.write_bom = self.write_bom || bom;
        Ok(())
    }

    /// Append text, opening the file and emitting any mark on first use
    pub fn write(&mut self, text: &str) -> Result<()> {
        if self.closed {
            return Err(TranslateError::Execution("write after output was closed".to_string()));
        }

        let text = if self.charset.uses_cr_line_endings() {
            text.replace("\r\n", "\r").replace('\n', "\r")
        } else {
            text.to_string()
        };

        match &self.target {
            ExportTarget::Memory => self.memory.push_str(&text),
            ExportTarget::File(path) => {
                if self.file.is_none() {
                    self.file = Some(BufWriter::new(File::create(path)?));
                }
                if let Some(file) = self.file.as_mut() {
                    if !self.written && self.write_bom {
                        if let Some(bom) = self.charset.bom() {
                            file.write_all(bom)?;
                        }
                    }
                    file.write_all(&self.charset.encode(&text))?;
                }
            }
        }
        self.written = true;
        Ok(())
    }

    /// Text captured by a memory target
    pub fn output(&self) -> Option<&str> {
        match self.target {
            ExportTarget::Memory => Some(&self.memory),
            ExportTarget::File(_) => None,
        }
    }

    pub fn flush(&mut self) -> Result<()> {
        if let Some(file) = self.file.as_mut() {
            file.flush()?;
        }
        Ok(())
    }
}

impl IoHandle for TextWriter {
    fn describe(&self) -> String {
        match &self.target {
            ExportTarget::File(path) => format!("writer {}", path.display()),
            ExportTarget::Memory => "writer <string>".to_string(),
        }
    }

    /// An export that never wrote still leaves an empty file behind
    fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        match self.file.take() {
            Some(mut file) => Ok(file.flush()?),
            None => {
                if let ExportTarget::File(path) = &self.target {
                    File::create(path)?;
                }
                Ok(())
            }
        }
    }
}
