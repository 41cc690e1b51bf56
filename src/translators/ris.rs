//! RIS import and export
//!
//! Line-oriented tagged format: each line is `XX  - value`, records start at
//! `TY` and end at `ER`.

use crate::core::error::Result;
use crate::pipeline::records::{ScrapedAttachment, ScrapedItem};
use crate::translate::export::ExportItem;
use crate::translator::engine::TranslatorCode;
use crate::translator::sandbox::{ExportScope, ImportScope, NewItem};
use crate::translator::types::Detection;
use lazy_static::lazy_static;
use regex::Regex;

lazy_static! {
    static ref TAG_LINE: Regex = Regex::new(r"^([A-Z][A-Z0-9])\s{1,2}-(?:\s(.*))?$").unwrap();
}

/// RIS type code to item type; unknown codes import as `document`
const TYPES: &[(&str, &str)] = &[
    ("JOUR", "journalArticle"),
    ("BOOK", "book"),
    ("CHAP", "bookSection"),
    ("THES", "thesis"),
    ("RPRT", "report"),
    ("ELEC", "webpage"),
    ("CONF", "conferencePaper"),
    ("MGZN", "magazineArticle"),
    ("NEWS", "newspaperArticle"),
    ("GEN", "document"),
];

fn item_type_for(code: &str) -> &'static str {
    TYPES
        .iter()
        .find(|(c, _)| *c == code)
        .map(|(_, t)| *t)
        .unwrap_or("document")
}

fn code_for(item_type: &str) -> &'static str {
    TYPES
        .iter()
        .find(|(_, t)| *t == item_type)
        .map(|(c, _)| *c)
        .unwrap_or("GEN")
}

/// Split a tagged line into (tag, value)
fn parse_line(line: &str) -> Option<(String, String)> {
    let caps = TAG_LINE.captures(line.trim_end())?;
    let value = caps.get(2).map_or("", |m| m.as_str()).trim();
    Some((caps[1].to_string(), value.to_string()))
}

pub struct Ris;

impl Ris {
    fn apply(&self, scope: &ImportScope, item: &mut ScrapedItem, tag: &str, value: String) {
        let utils = scope.utilities();
        let item_type = item.item_type.clone().unwrap_or_default();
        match tag {
            "TI" | "T1" => item.set_field("title", value),
            "ST" => item.set_field("shortTitle", value),
            "AU" | "A1" => item.creators.push(utils.clean_author(&value, Some("author"), false)),
            "A2" | "ED" => item.creators.push(utils.clean_author(&value, Some("editor"), false)),
            "A3" => item.creators.push(utils.clean_author(&value, Some("seriesEditor"), false)),
            "PY" | "Y1" | "DA" => {
                if item.field("date").is_none() || tag == "DA" {
                    item.set_field("date", value.trim_end_matches('/').replace('/', "-"));
                }
            }
            "T2" | "JO" | "JF" => {
                let field = match item_type.as_str() {
                    "bookSection" => "bookTitle",
                    "conferencePaper" => "proceedingsTitle",
                    "webpage" => "websiteTitle",
                    _ => "publicationTitle",
                };
                item.set_field(field, value);
            }
            "VL" => item.set_field("volume", value),
            "IS" => item.set_field("issue", value),
            "SP" => item.set_field("pages", value),
            "EP" => {
                let pages = match item.field("pages") {
                    Some(start) => format!("{}-{}", start, value),
                    None => value,
                };
                item.set_field("pages", pages);
            }
            "PB" => {
                let field = match item_type.as_str() {
                    "thesis" => "university",
                    "report" => "institution",
                    _ => "publisher",
                };
                item.set_field(field, value);
            }
            "M3" => {
                let field = match item_type.as_str() {
                    "thesis" => "thesisType",
                    "report" => "reportType",
                    _ => "extra",
                };
                item.set_field(field, value);
            }
            "CY" => item.set_field("place", value),
            "SN" => match utils.clean_isbn(&value) {
                Some(isbn) => item.set_field("ISBN", isbn),
                None => item.set_field("ISSN", value),
            },
            "DO" => {
                if let Some(doi) = utils.clean_doi(&value) {
                    item.set_field("DOI", doi);
                }
            }
            "UR" => item.set_field("url", value),
            "AB" => item.set_field("abstractNote", value),
            "LA" => item.set_field("language", value),
            "ET" => item.set_field("edition", value),
            "KW" => item.tags.push(value.as_str().into()),
            "N1" => item.notes.push(value.as_str().into()),
            "ID" => item.item_id = Some(value),
            "L1" => item.attachments.push(ScrapedAttachment {
                path: Some(value),
                ..Default::default()
            }),
            other => scope.debug(&format!("Discarding unknown RIS tag {}", other)),
        }
    }
}

impl TranslatorCode for Ris {
    fn detect_import(&self, scope: &ImportScope) -> Result<Detection> {
        while let Some(line) = scope.read()? {
            if line.trim().is_empty() {
                continue;
            }
            let found = matches!(parse_line(line.trim_start_matches('\u{feff}')), Some((tag, _)) if tag == "TY");
            return Ok(found.into());
        }
        Ok(Detection::NotFound)
    }

    fn do_import(&self, scope: &ImportScope) -> Result<()> {
        let mut current: Option<Pending> = None;

        while let Some(line) = scope.read()? {
            let Some((tag, value)) = parse_line(line.trim_start_matches('\u{feff}')) else {
                // Continuation of the previous value
                let extra = line.trim();
                if let (Some(pending), false) = (current.as_mut(), extra.is_empty()) {
                    pending.append(extra);
                }
                continue;
            };

            if tag == "TY" {
                if let Some(pending) = current.take() {
                    scope.debug("RIS record without ER; completing it");
                    pending.complete(self, scope)?;
                }
                current = Some(Pending::new(scope.new_item(item_type_for(&value))));
            } else if tag == "ER" {
                if let Some(pending) = current.take() {
                    pending.complete(self, scope)?;
                }
            } else {
                match current.as_mut() {
                    Some(pending) => pending.push(tag, value),
                    None => scope.debug(&format!("RIS tag {} outside a record", tag)),
                }
            }
        }

        if let Some(pending) = current.take() {
            pending.complete(self, scope)?;
        }
        Ok(())
    }

    fn do_export(&self, scope: &ExportScope) -> Result<()> {
        let export_notes = scope
            .get_option("exportNotes")
            .and_then(|v| v.as_bool())
            .unwrap_or(true);

        while let Some(item) = scope.next_item()? {
            if item.item_type == "note" || item.item_type == "attachment" {
                continue;
            }
            let mut out = String::new();
            write_record(&mut out, &item, export_notes);
            scope.write(&out)?;
        }
        Ok(())
    }
}

/// Record being assembled. Tags are applied in order at completion, once
/// `TY` has fixed the item type.
struct Pending {
    item: NewItem,
    tags: Vec<(String, String)>,
}

impl Pending {
    fn new(item: NewItem) -> Self {
        Self { item, tags: Vec::new() }
    }

    fn push(&mut self, tag: String, value: String) {
        self.tags.push((tag, value));
    }

    /// Continuation line of the last value
    fn append(&mut self, extra: &str) {
        if let Some((_, value)) = self.tags.last_mut() {
            if !value.is_empty() {
                value.push(' ');
            }
            value.push_str(extra);
        }
    }

    fn complete(mut self, ris: &Ris, scope: &ImportScope) -> Result<()> {
        for (tag, value) in std::mem::take(&mut self.tags) {
            ris.apply(scope, &mut self.item, &tag, value);
        }
        self.item.complete()
    }
}

fn line(out: &mut String, tag: &str, value: &str) {
    for part in value.lines() {
        let part = part.trim();
        if !part.is_empty() {
            out.push_str(tag);
            out.push_str("  - ");
            out.push_str(part);
            out.push_str("\r\n");
        }
    }
}

fn write_record(out: &mut String, item: &ExportItem, export_notes: bool) {
    line(out, "TY", code_for(&item.item_type));
    if let Some(title) = item.field("title") {
        line(out, "TI", title);
    }
    for creator in &item.creators {
        let tag = match creator.creator_type.as_deref() {
            Some("editor") => "ED",
            Some("seriesEditor") => "A3",
            _ => "AU",
        };
        let name = if creator.field_mode == 1 || creator.first_name.is_empty() {
            creator.last_name.clone()
        } else {
            format!("{}, {}", creator.last_name, creator.first_name)
        };
        line(out, tag, &name);
    }
    if let Some(date) = item.field("date") {
        let year = date.get(..4).filter(|y| y.chars().all(|c| c.is_ascii_digit()));
        if let Some(year) = year {
            line(out, "PY", year);
        }
        line(out, "DA", &date.replace('-', "/"));
    }
    if let Some(publication) = item.field("publicationTitle") {
        let tag = if item.item_type == "journalArticle" { "JO" } else { "T2" };
        line(out, tag, publication);
    }
    for (field, tag) in [
        ("volume", "VL"),
        ("issue", "IS"),
        ("publisher", "PB"),
        ("place", "CY"),
        ("edition", "ET"),
        ("type", "M3"),
        ("DOI", "DO"),
        ("url", "UR"),
        ("abstractNote", "AB"),
        ("language", "LA"),
        ("shortTitle", "ST"),
    ] {
        if let Some(value) = item.field(field) {
            line(out, tag, value);
        }
    }
    if let Some(pages) = item.field("pages") {
        match pages.split_once('-') {
            Some((start, end)) => {
                line(out, "SP", start);
                line(out, "EP", end);
            }
            None => line(out, "SP", pages),
        }
    }
    if let Some(sn) = item.field("ISBN").or_else(|| item.field("ISSN")) {
        line(out, "SN", sn);
    }
    for tag in &item.tags {
        line(out, "KW", tag.name());
    }
    if export_notes {
        for note in &item.notes {
            line(out, "N1", &note.note);
        }
    }
    for attachment in &item.attachments {
        if let Some(path) = attachment.path.as_deref().or(attachment.url.as_deref()) {
            line(out, "L1", path);
        }
    }
    out.push_str("ER  - \r\n\r\n");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::library::store::LibraryStore;
    use crate::translate::Translate;
    use crate::translator::types::Mode;
    use crate::translators::tests::{builtin_services, export_with, import_with};
    use crate::translators::RIS_ID;

    const SAMPLE: &str = "TY  - JOUR\r\nTI  - A Mathematical Theory\r\n  of Communication\r\nAU  - Shannon, Claude E.\r\nPY  - 1948/07/01/\r\nJO  - Bell System Technical Journal\r\nVL  - 27\r\nIS  - 3\r\nSP  - 379\r\nEP  - 423\r\nDO  - https://doi.org/10.1002/j.1538-7305.1948.tb01338.x\r\nKW  - information theory\r\nER  - \r\n\r\nTY  - BOOK\r\nTI  - Cybernetics\r\nAU  - Wiener, Norbert\r\nSN  - 9780262730099\r\nER  - \r\n";

    #[test]
    fn test_parse_line() {
        assert_eq!(parse_line("TY  - JOUR"), Some(("TY".to_string(), "JOUR".to_string())));
        assert_eq!(parse_line("ER  -"), Some(("ER".to_string(), String::new())));
        assert_eq!(parse_line("continuation text"), None);
    }

    #[test]
    fn test_import_records() {
        let (services, store) = builtin_services();
        let ids = import_with(&services, RIS_ID, SAMPLE);
        assert_eq!(ids.len(), 2);

        let article = store.get_item(ids[0]).unwrap().unwrap();
        assert_eq!(article.item_type, "journalArticle");
        assert_eq!(article.fields["title"], "A Mathematical Theory of Communication");
        assert_eq!(article.fields["date"], "1948-07-01");
        assert_eq!(article.fields["pages"], "379-423");
        assert_eq!(article.fields["DOI"], "10.1002/j.1538-7305.1948.tb01338.x");

        let book = store.get_item(ids[1]).unwrap().unwrap();
        assert_eq!(book.item_type, "book");
        assert_eq!(book.fields["ISBN"], "9780262730099");
    }

    #[test]
    fn test_detects_ris_text() {
        let (services, _) = builtin_services();
        let translate = Translate::new(Mode::Import, services);
        translate.set_string(SAMPLE);
        translate.get_translators().unwrap();
        let found: Vec<String> = translate.found().iter().map(|f| f.descriptor.id.clone()).collect();
        assert_eq!(found, vec![RIS_ID.to_string()]);
    }

    #[test]
    fn test_export_round_trip() {
        let (services, _) = builtin_services();
        let ids = import_with(&services, RIS_ID, SAMPLE);
        let text = export_with(&services, RIS_ID, ids);

        assert!(text.starts_with("TY  - JOUR\r\n"));
        assert!(text.contains("TI  - A Mathematical Theory of Communication\r\n"));
        assert!(text.contains("AU  - Shannon, Claude E.\r\n"));
        assert!(text.contains("SP  - 379\r\nEP  - 423\r\n"));
        assert_eq!(text.matches("ER  - ").count(), 2);

        let again = import_with(&services, RIS_ID, &text);
        assert_eq!(again.len(), 2);
    }
}
