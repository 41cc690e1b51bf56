//! Character set handling
//!
//! Byte-order-mark detection, incremental decoding and encoding for the
//! UTF family plus the legacy encodings known to `encoding_rs`.

use encoding_rs::{CoderResult, Decoder, Encoding};
use std::io::{self, Read, Seek, SeekFrom};

/// A character set usable for translator I/O
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Charset {
    Utf8,
    Utf16Be,
    Utf16Le,
    Utf32Be,
    Utf32Le,
    /// Any other encoding supported by `encoding_rs`
    Legacy(&'static Encoding),
}

/// Known byte-order marks, in the order they are declared.
///
/// Detection picks the longest fully matched mark, so the 32-bit marks win
/// over the 16-bit marks they share a prefix with.
pub const BYTE_ORDER_MARKS: [(Charset, &[u8]); 5] = [
    (Charset::Utf8, &[0xEF, 0xBB, 0xBF]),
    (Charset::Utf16Be, &[0xFE, 0xFF]),
    (Charset::Utf16Le, &[0xFF, 0xFE]),
    (Charset::Utf32Be, &[0x00, 0x00, 0xFE, 0xFF]),
    (Charset::Utf32Le, &[0xFF, 0xFE, 0x00, 0x00]),
];

const LONGEST_MARK: usize = 4;

impl Charset {
    /// Resolve a charset label such as "UTF-8", "utf-16le" or "macintosh"
    pub fn for_label(label: &str) -> Option<Charset> {
        let normalized = label.trim().to_ascii_lowercase();
        match normalized.as_str() {
            "utf-8" | "utf8" => return Some(Charset::Utf8),
            "utf-16be" => return Some(Charset::Utf16Be),
            "utf-16le" | "utf-16" => return Some(Charset::Utf16Le),
            "utf-32be" | "utf-32" => return Some(Charset::Utf32Be),
            "utf-32le" => return Some(Charset::Utf32Le),
            _ => {}
        }

        let encoding = Encoding::for_label(normalized.as_bytes())?;
        Some(if encoding == encoding_rs::UTF_8 {
            Charset::Utf8
        } else if encoding == encoding_rs::UTF_16BE {
            Charset::Utf16Be
        } else if encoding == encoding_rs::UTF_16LE {
            Charset::Utf16Le
        } else {
            Charset::Legacy(encoding)
        })
    }

    /// Canonical name of the charset
    pub fn name(&self) -> &'static str {
        match self {
            Charset::Utf8 => "UTF-8",
            Charset::Utf16Be => "UTF-16BE",
            Charset::Utf16Le => "UTF-16LE",
            Charset::Utf32Be => "UTF-32BE",
            Charset::Utf32Le => "UTF-32LE",
            Charset::Legacy(encoding) => encoding.name(),
        }
    }

    /// Byte-order mark for the UTF charsets
    pub fn bom(&self) -> Option<&'static [u8]> {
        BYTE_ORDER_MARKS
            .iter()
            .find(|(charset, _)| charset == self)
            .map(|(_, mark)| *mark)
    }

    /// Mac Roman needs CR line endings on output
    pub fn uses_cr_line_endings(&self) -> bool {
        matches!(self, Charset::Legacy(encoding) if *encoding == encoding_rs::MACINTOSH)
    }

    /// Create an incremental decoder that does not strip or sniff marks
    pub fn decoder(&self) -> TextDecoder {
        match self {
            Charset::Utf8 => TextDecoder::Encoding(encoding_rs::UTF_8.new_decoder_without_bom_handling()),
            Charset::Utf16Be => {
                TextDecoder::Encoding(encoding_rs::UTF_16BE.new_decoder_without_bom_handling())
            }
            Charset::Utf16Le => {
                TextDecoder::Encoding(encoding_rs::UTF_16LE.new_decoder_without_bom_handling())
            }
            Charset::Utf32Be => TextDecoder::Utf32 { big_endian: true, pending: Vec::new() },
            Charset::Utf32Le => TextDecoder::Utf32 { big_endian: false, pending: Vec::new() },
            Charset::Legacy(encoding) => TextDecoder::Encoding(encoding.new_decoder_without_bom_handling()),
        }
    }

    /// Encode text into bytes of this charset (without a mark)
    pub fn encode(&self, text: &str) -> Vec<u8> {
        match self {
            Charset::Utf8 => text.as_bytes().to_vec(),
            Charset::Utf16Be => text.encode_utf16().flat_map(|unit| unit.to_be_bytes()).collect(),
            Charset::Utf16Le => text.encode_utf16().flat_map(|unit| unit.to_le_bytes()).collect(),
            Charset::Utf32Be => text.chars().flat_map(|c| (c as u32).to_be_bytes()).collect(),
            Charset::Utf32Le => text.chars().flat_map(|c| (c as u32).to_le_bytes()).collect(),
            Charset::Legacy(encoding) => encoding.encode(text).0.into_owned(),
        }
    }
}

impl std::fmt::Display for Charset {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Look for a byte-order mark at the current position.
///
/// Reads one byte at a time, up to the longest known mark. On a match the
/// stream is left just past the mark; otherwise it is rewound to where it was.
pub fn detect_bom<R: Read + Seek>(reader: &mut R) -> io::Result<Option<Charset>> {
    let start = reader.stream_position()?;
    let mut prefix: Vec<u8> = Vec::with_capacity(LONGEST_MARK);
    let mut best: Option<(Charset, usize)> = None;

    while prefix.len() < LONGEST_MARK {
        let mut byte = [0u8; 1];
        if reader.read(&mut byte)? == 0 {
            break;
        }
        prefix.push(byte[0]);

        let mut still_possible = false;
        for (charset, mark) in BYTE_ORDER_MARKS.iter() {
            if mark.len() >= prefix.len() && mark.starts_with(&prefix) {
                if mark.len() == prefix.len() {
                    best = Some((*charset, mark.len()));
                } else {
                    still_possible = true;
                }
            }
        }
        if !still_possible {
            break;
        }
    }

    match best {
        Some((charset, len)) => {
            reader.seek(SeekFrom::Start(start + len as u64))?;
            Ok(Some(charset))
        }
        None => {
            reader.seek(SeekFrom::Start(start))?;
            Ok(None)
        }
    }
}

/// Incremental decoder producing UTF-8 text
pub enum TextDecoder {
    Encoding(Decoder),
    Utf32 { big_endian: bool, pending: Vec<u8> },
}

impl TextDecoder {
    /// Decode a chunk, appending to `out`. `last` flushes any partial sequence.
    pub fn decode(&mut self, bytes: &[u8], last: bool, out: &mut String) {
        match self {
            TextDecoder::Encoding(decoder) => {
                let needed = decoder
                    .max_utf8_buffer_length(bytes.len())
                    .unwrap_or(bytes.len() * 3 + 16);
                out.reserve(needed);
                let mut consumed = 0;
                loop {
                    let (result, read, _had_errors) =
                        decoder.decode_to_string(&bytes[consumed..], out, last);
                    consumed += read;
                    match result {
                        CoderResult::InputEmpty => break,
                        CoderResult::OutputFull => out.reserve(needed.max(64)),
                    }
                }
            }
            TextDecoder::Utf32 { big_endian, pending } => {
                pending.extend_from_slice(bytes);
                let whole = pending.len() / 4 * 4;
                for unit in pending[..whole].chunks_exact(4) {
                    let quad = [unit[0], unit[1], unit[2], unit[3]];
                    let value = if *big_endian {
                        u32::from_be_bytes(quad)
                    } else {
                        u32::from_le_bytes(quad)
                    };
                    out.push(char::from_u32(value).unwrap_or(char::REPLACEMENT_CHARACTER));
                }
                pending.drain(..whole);
                if last && !pending.is_empty() {
                    pending.clear();
                    out.push(char::REPLACEMENT_CHARACTER);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_detect_utf8_bom() {
        let mut cursor = Cursor::new(b"\xEF\xBB\xBFhello".to_vec());
        assert_eq!(detect_bom(&mut cursor).unwrap(), Some(Charset::Utf8));
        assert_eq!(cursor.position(), 3);
    }

    #[test]
    fn test_detect_prefers_utf32le_over_utf16le() {
        let mut cursor = Cursor::new(vec![0xFF, 0xFE, 0x00, 0x00, b'a', 0, 0, 0]);
        assert_eq!(detect_bom(&mut cursor).unwrap(), Some(Charset::Utf32Le));
        assert_eq!(cursor.position(), 4);
    }

    #[test]
    fn test_detect_utf16le_rewinds_past_prefix() {
        let mut cursor = Cursor::new(vec![0xFF, 0xFE, b'a', 0x00]);
        assert_eq!(detect_bom(&mut cursor).unwrap(), Some(Charset::Utf16Le));
        assert_eq!(cursor.position(), 2);
    }

    #[test]
    fn test_no_bom_rewinds() {
        let mut cursor = Cursor::new(b"TY  - BOOK".to_vec());
        assert_eq!(detect_bom(&mut cursor).unwrap(), None);
        assert_eq!(cursor.position(), 0);

        let mut partial = Cursor::new(vec![0xEF, 0xBB]);
        assert_eq!(detect_bom(&mut partial).unwrap(), None);
        assert_eq!(partial.position(), 0);
    }

    #[test]
    fn test_labels() {
        assert_eq!(Charset::for_label("UTF-8"), Some(Charset::Utf8));
        assert_eq!(Charset::for_label("utf-32le"), Some(Charset::Utf32Le));
        assert!(Charset::for_label("macintosh").unwrap().uses_cr_line_endings());
        assert_eq!(Charset::for_label("windows-1252").unwrap().name(), "windows-1252");
        assert!(Charset::for_label("no-such-charset").is_none());
    }

    #[test]
    fn test_utf32_decoder_handles_split_units() {
        let bytes = Charset::Utf32Be.encode("hé");
        let mut decoder = Charset::Utf32Be.decoder();
        let mut out = String::new();
        decoder.decode(&bytes[..5], false, &mut out);
        decoder.decode(&bytes[5..], true, &mut out);
        assert_eq!(out, "hé");
    }

    #[test]
    fn test_utf16_round_trip() {
        let bytes = Charset::Utf16Le.encode("Zoë");
        let mut decoder = Charset::Utf16Le.decoder();
        let mut out = String::new();
        decoder.decode(&bytes, true, &mut out);
        assert_eq!(out, "Zoë");
    }
}
