//! Item type schema
//!
//! Which fields and creator roles each item type accepts, and how
//! type-specific field names map onto canonical base fields. Items are stored
//! under canonical names; exports present both names.

use lazy_static::lazy_static;
use std::collections::HashMap;

/// Role used when a declared creator role is not valid for the item type
pub const FALLBACK_CREATOR_TYPE: &str = "contributor";

/// Schema for one item type
#[derive(Debug)]
pub struct ItemTypeSchema {
    pub name: &'static str,
    /// Valid field names as this type spells them
    pub fields: Vec<&'static str>,
    /// Type-specific field name to canonical base field name
    base_of: HashMap<&'static str, &'static str>,
    /// Valid creator roles; the first is the primary role
    pub creator_types: Vec<&'static str>,
}

impl ItemTypeSchema {
    /// Canonical storage name for a field, or `None` when the type rejects it.
    ///
    /// Accepts either spelling: `university` and `publisher` both resolve to
    /// `publisher` on a thesis.
    pub fn canonical_field(&self, name: &str) -> Option<&'static str> {
        if let Some(base) = self.base_of.get(name) {
            return Some(*base);
        }
        if let Some(field) = self.fields.iter().find(|f| **f == name) {
            return Some(*field);
        }
        self.base_of.values().find(|base| **base == name).copied()
    }

    /// Type-specific spelling of a canonical field
    pub fn specific_field(&self, canonical: &str) -> Option<&'static str> {
        self.base_of
            .iter()
            .find(|(_, base)| **base == canonical)
            .map(|(specific, _)| *specific)
    }

    /// Whether `specific` is stored under a different canonical name
    pub fn is_base_mapped(&self, specific: &str) -> bool {
        self.base_of.contains_key(specific)
    }

    pub fn has_field(&self, name: &str) -> bool {
        self.canonical_field(name).is_some()
    }

    pub fn primary_creator_type(&self) -> &'static str {
        self.creator_types.first().copied().unwrap_or(FALLBACK_CREATOR_TYPE)
    }

    /// Resolve a declared role; `None` when it had to fall back
    pub fn creator_type(&self, declared: Option<&str>) -> Option<&'static str> {
        match declared {
            None => Some(self.primary_creator_type()),
            Some(role) => self.creator_types.iter().find(|t| **t == role).copied(),
        }
    }
}

const COMMON_TAIL: &[&str] = &[
    "language",
    "shortTitle",
    "url",
    "accessDate",
    "archive",
    "archiveLocation",
    "libraryCatalog",
    "callNumber",
    "rights",
    "extra",
];

fn schema(
    name: &'static str,
    fields: &[&'static str],
    mapped: &[(&'static str, &'static str)],
    creator_types: &[&'static str],
) -> ItemTypeSchema {
    let mut all = vec!["title", "abstractNote"];
    all.extend_from_slice(fields);
    all.extend(mapped.iter().map(|(specific, _)| *specific));
    all.extend_from_slice(COMMON_TAIL);
    ItemTypeSchema {
        name,
        fields: all,
        base_of: mapped.iter().copied().collect(),
        creator_types: creator_types.to_vec(),
    }
}

lazy_static! {
    static ref ITEM_TYPES: HashMap<&'static str, ItemTypeSchema> = {
        let types = vec![
            schema(
                "book",
                &["series", "seriesNumber", "volume", "numberOfVolumes", "edition", "place",
                  "publisher", "date", "numPages", "ISBN"],
                &[],
                &["author", "contributor", "editor", "translator", "seriesEditor"],
            ),
            schema(
                "bookSection",
                &["series", "seriesNumber", "volume", "numberOfVolumes", "edition", "place",
                  "publisher", "date", "pages", "ISBN"],
                &[("bookTitle", "publicationTitle")],
                &["author", "contributor", "editor", "bookAuthor", "translator", "seriesEditor"],
            ),
            schema(
                "journalArticle",
                &["publicationTitle", "volume", "issue", "pages", "date", "series", "seriesTitle",
                  "journalAbbreviation", "DOI", "ISSN"],
                &[],
                &["author", "contributor", "editor", "translator", "reviewedAuthor"],
            ),
            schema(
                "magazineArticle",
                &["publicationTitle", "volume", "issue", "date", "pages", "ISSN"],
                &[],
                &["author", "contributor", "translator", "reviewedAuthor"],
            ),
            schema(
                "newspaperArticle",
                &["publicationTitle", "place", "edition", "date", "section", "pages", "ISSN"],
                &[],
                &["author", "contributor", "translator", "reviewedAuthor"],
            ),
            schema(
                "thesis",
                &["place", "date", "numPages"],
                &[("thesisType", "type"), ("university", "publisher")],
                &["author", "contributor"],
            ),
            schema(
                "report",
                &["seriesTitle", "place", "date", "pages"],
                &[("reportNumber", "number"), ("reportType", "type"), ("institution", "publisher")],
                &["author", "contributor", "translator", "seriesEditor"],
            ),
            schema(
                "webpage",
                &["date"],
                &[("websiteTitle", "publicationTitle"), ("websiteType", "type")],
                &["author", "contributor", "translator"],
            ),
            schema(
                "conferencePaper",
                &["date", "conferenceName", "place", "publisher", "volume", "pages", "series",
                  "DOI", "ISBN"],
                &[("proceedingsTitle", "publicationTitle")],
                &["author", "contributor", "editor", "translator", "seriesEditor"],
            ),
            schema(
                "document",
                &["publisher", "date"],
                &[],
                &["author", "contributor", "editor", "translator", "reviewedAuthor"],
            ),
        ];
        let mut map: HashMap<&'static str, ItemTypeSchema> =
            types.into_iter().map(|t| (t.name, t)).collect();
        map.insert(
            "note",
            ItemTypeSchema { name: "note", fields: Vec::new(), base_of: HashMap::new(), creator_types: Vec::new() },
        );
        map.insert(
            "attachment",
            ItemTypeSchema {
                name: "attachment",
                fields: vec!["title", "url", "accessDate"],
                base_of: HashMap::new(),
                creator_types: Vec::new(),
            },
        );
        map
    };
}

/// Look up the schema for an item type
pub fn item_type(name: &str) -> Option<&'static ItemTypeSchema> {
    ITEM_TYPES.get(name)
}

/// All regular (non-note, non-attachment) item type names, sorted
pub fn regular_item_types() -> Vec<&'static str> {
    let mut names: Vec<&'static str> = ITEM_TYPES
        .keys()
        .copied()
        .filter(|name| *name != "note" && *name != "attachment")
        .collect();
    names.sort_unstable();
    names
}
