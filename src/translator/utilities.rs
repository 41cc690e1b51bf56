//! Structured-data utilities exposed to translators
//!
//! Small, pure helpers translators use to clean scraped values before they
//! become record fields.

use crate::pipeline::records::ScrapedCreator;
use lazy_static::lazy_static;
use regex::Regex;

lazy_static! {
    static ref WHITESPACE: Regex = Regex::new(r"\s+").unwrap();
    static ref DOI: Regex = Regex::new(r#"10\.\d{4,9}/[^\s"<>]+"#).unwrap();
    static ref ISBN_CHARS: Regex = Regex::new(r"[^0-9Xx]").unwrap();
    static ref YEAR: Regex = Regex::new(r"\b(1[0-9]{3}|20[0-9]{2})\b").unwrap();
    static ref ISO_DATE: Regex = Regex::new(r"\b(\d{4})-(\d{1,2})(?:-(\d{1,2}))?\b").unwrap();
    static ref SLASH_DATE: Regex = Regex::new(r"\b(\d{1,2})/(\d{1,2})/(\d{4})\b").unwrap();
    static ref DAY: Regex = Regex::new(r"\b(\d{1,2})(?:st|nd|rd|th)?\b").unwrap();
    static ref ENTITY: Regex = Regex::new(r"&(#[xX][0-9A-Fa-f]+|#[0-9]+|[A-Za-z]+);").unwrap();
    static ref TAG: Regex = Regex::new(r"<[^>]*>").unwrap();
}

const MONTHS: [&str; 12] = [
    "jan", "feb", "mar", "apr", "may", "jun", "jul", "aug", "sep", "oct", "nov", "dec",
];

/// Trim and collapse runs of whitespace
pub fn trim_internal(text: &str) -> String {
    WHITESPACE.replace_all(text.trim(), " ").into_owned()
}

/// Split a raw author string into a creator.
///
/// "Last, First" and "First Last" are both understood. With `single_field`
/// the whole string becomes the last name (institutional authors).
pub fn clean_author(raw: &str, creator_type: Option<&str>, single_field: bool) -> ScrapedCreator {
    let name = trim_internal(raw.trim_matches(|c: char| c == ',' || c == ';' || c.is_whitespace()));

    if single_field {
        let mut creator = ScrapedCreator::new("", &name, creator_type);
        creator.field_mode = 1;
        return creator;
    }

    let (first, last) = match name.split_once(',') {
        Some((last, first)) => (first.trim().to_string(), last.trim().to_string()),
        None => match name.rsplit_once(' ') {
            Some((first, last)) => (first.to_string(), last.to_string()),
            None => (String::new(), name.clone()),
        },
    };
    ScrapedCreator::new(first.trim_end_matches('.'), &last, creator_type)
}

/// Extract a bare DOI from a string
pub fn clean_doi(text: &str) -> Option<String> {
    DOI.find(text)
        .map(|m| m.as_str().trim_end_matches(|c: char| c == '.' || c == ',' || c == ';').to_string())
}

/// Validate and normalize an ISBN-10 or ISBN-13; returns digits only
pub fn clean_isbn(text: &str) -> Option<String> {
    let digits = ISBN_CHARS.replace_all(text, "").to_uppercase();
    match digits.len() {
        10 if isbn10_valid(&digits) => Some(digits),
        13 if isbn13_valid(&digits) => Some(digits),
        _ => None,
    }
}

fn isbn10_valid(isbn: &str) -> bool {
    let mut sum = 0;
    for (i, c) in isbn.chars().enumerate() {
        let value = match c {
            'X' if i == 9 => 10,
            c => match c.to_digit(10) {
                Some(d) => d,
                None => return false,
            },
        };
        sum += value * (10 - i as u32);
    }
    sum % 11 == 0
}

fn isbn13_valid(isbn: &str) -> bool {
    let mut sum = 0;
    for (i, c) in isbn.chars().enumerate() {
        let Some(d) = c.to_digit(10) else {
            return false;
        };
        sum += if i % 2 == 0 { d } else { d * 3 };
    }
    sum % 10 == 0
}

/// Parts of a loosely formatted date
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DateParts {
    pub year: Option<u32>,
    pub month: Option<u32>,
    pub day: Option<u32>,
}

impl DateParts {
    /// `YYYY-MM-DD` with unknown parts zeroed, or `None` without a year
    pub fn to_sql(&self) -> Option<String> {
        self.year.map(|year| {
            format!("{:04}-{:02}-{:02}", year, self.month.unwrap_or(0), self.day.unwrap_or(0))
        })
    }
}

/// Pull year, month and day out of a free-form date
pub fn str_to_date(text: &str) -> DateParts {
    if let Some(caps) = ISO_DATE.captures(text) {
        return DateParts {
            year: caps[1].parse().ok(),
            month: caps[2].parse().ok().filter(|m| (1..=12).contains(m)),
            day: caps.get(3).and_then(|d| d.as_str().parse().ok()).filter(|d| (1..=31).contains(d)),
        };
    }
    if let Some(caps) = SLASH_DATE.captures(text) {
        // US order
        return DateParts {
            year: caps[3].parse().ok(),
            month: caps[1].parse().ok().filter(|m| (1..=12).contains(m)),
            day: caps[2].parse().ok().filter(|d| (1..=31).contains(d)),
        };
    }

    let mut parts = DateParts::default();
    let mut rest = text.to_string();
    if let Some(m) = YEAR.find(text) {
        parts.year = m.as_str().parse().ok();
        rest.replace_range(m.range(), " ");
    }

    let lower = rest.to_lowercase();
    parts.month = MONTHS
        .iter()
        .position(|name| lower.contains(name))
        .map(|i| i as u32 + 1);
    if parts.month.is_some() {
        parts.day = DAY
            .captures(&rest)
            .and_then(|caps| caps[1].parse().ok())
            .filter(|d| (1..=31).contains(d));
    }
    parts
}

/// Strip tags and decode common HTML entities.
///
/// Entities are decoded in one pass, so decoded text is never decoded again
/// (`&#38;lt;` yields `&lt;`). Unknown named entities are kept as written.
pub fn unescape_html(html: &str) -> String {
    let text = TAG.replace_all(html, "");
    ENTITY
        .replace_all(&text, |caps: &regex::Captures| {
            let name = &caps[1];
            let decoded = match name.strip_prefix('#') {
                Some(number) => {
                    let code = match number.strip_prefix(['x', 'X']) {
                        Some(hex) => u32::from_str_radix(hex, 16).ok(),
                        None => number.parse().ok(),
                    };
                    code.and_then(char::from_u32).map(String::from)
                }
                None => named_entity(name).map(String::from),
            };
            decoded.unwrap_or_else(|| caps[0].to_string())
        })
        .into_owned()
}

fn named_entity(name: &str) -> Option<&'static str> {
    Some(match name {
        "nbsp" => " ",
        "lt" => "<",
        "gt" => ">",
        "quot" => "\"",
        "apos" => "'",
        "amp" => "&",
        _ => return None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clean_author_forms() {
        let inverted = clean_author("Turing, Alan M.", Some("author"), false);
        assert_eq!(inverted.last_name, "Turing");
        assert_eq!(inverted.first_name, "Alan M");

        let natural = clean_author("  Grace   Hopper ", None, false);
        assert_eq!(natural.first_name, "Grace");
        assert_eq!(natural.last_name, "Hopper");

        let institution = clean_author("World Health Organization", None, true);
        assert_eq!(institution.last_name, "World Health Organization");
        assert_eq!(institution.field_mode, 1);
    }

    #[test]
    fn test_clean_doi() {
        assert_eq!(
            clean_doi("https://doi.org/10.1000/xyz123.").as_deref(),
            Some("10.1000/xyz123")
        );
        assert_eq!(clean_doi("no identifier here"), None);
    }

    #[test]
    fn test_clean_isbn() {
        assert_eq!(clean_isbn("ISBN 0-306-40615-2").as_deref(), Some("0306406152"));
        assert_eq!(clean_isbn("978-0-306-40615-7").as_deref(), Some("9780306406157"));
        assert_eq!(clean_isbn("978-0-306-40615-8"), None);
        assert_eq!(clean_isbn("12345"), None);
    }

    #[test]
    fn test_str_to_date() {
        assert_eq!(str_to_date("2021-03-04").to_sql().as_deref(), Some("2021-03-04"));
        assert_eq!(str_to_date("4 March 1999").to_sql().as_deref(), Some("1999-03-04"));
        assert_eq!(str_to_date("Spring 1987").to_sql().as_deref(), Some("1987-00-00"));
        assert_eq!(str_to_date("12/25/2005").to_sql().as_deref(), Some("2005-12-25"));
        assert_eq!(str_to_date("undated").to_sql(), None);
    }

    #[test]
    fn test_unescape_html() {
        assert_eq!(unescape_html("<b>Fish &amp; Chips</b>&#33;"), "Fish & Chips!");
        assert_eq!(unescape_html("&lt;tag&gt; &#x41;"), "<tag> A");
        assert_eq!(unescape_html("&#38;lt;"), "&lt;");
        assert_eq!(unescape_html("&amp;amp; &copy;"), "&amp; &copy;");
        assert_eq!(trim_internal("  a \n\t b  "), "a b");
    }
}
