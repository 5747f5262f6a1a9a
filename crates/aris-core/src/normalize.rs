//! Text normalization and deduplication-key construction.

use unicode_normalization::char::is_combining_mark;
use unicode_normalization::UnicodeNormalization;

use crate::CellValue;

pub const KEY_DELIMITER: char = '|';

/// Key produced when street, number and postal code are all empty.
pub const EMPTY_KEY: &str = "||";

/// Textual placeholders tabular libraries emit for missing cells.
const MISSING_PLACEHOLDERS: &[&str] = &["nan", "none", "null", "nat", "<na>"];

const APOSTROPHES: &[char] = &['\'', '\u{2019}', '\u{2018}', '\u{02BC}', '`', '\u{00B4}'];

/// Canonicalize one text field for comparison.
///
/// Missing input collapses to the empty string. Otherwise the text is trimmed,
/// stripped of diacritics, apostrophes become spaces and whitespace runs are
/// collapsed. Case is preserved.
pub fn normalize(text: &str) -> String {
    let trimmed = text.trim();
    if is_missing(trimmed) {
        return String::new();
    }

    let stripped = trimmed
        .nfd()
        .filter(|c| !is_combining_mark(*c))
        .map(|c| if APOSTROPHES.contains(&c) { ' ' } else { c })
        .collect::<String>();

    collapse_whitespace(&stripped)
}

pub fn normalize_cell(cell: &CellValue) -> String {
    cell.to_text()
        .map(|text| normalize(&text))
        .unwrap_or_default()
}

/// Build the `street|number|postal` identity key.
///
/// Every segment is normalized and lower-cased. The street keeps single
/// spaces between words; number and postal code lose all whitespace. The key
/// always has three segments, so an absent postal code leaves a trailing
/// delimiter.
pub fn build_key(street: &str, number: &str, postal: Option<&str>) -> String {
    let street = key_segment(street);
    let number = compact(&key_segment(number));
    let postal = postal.map(|p| compact(&key_segment(p))).unwrap_or_default();
    format!("{street}{KEY_DELIMITER}{number}{KEY_DELIMITER}{postal}")
}

fn key_segment(text: &str) -> String {
    let normalized = normalize(text).to_lowercase();
    if normalized.contains(KEY_DELIMITER) {
        collapse_whitespace(&normalized.replace(KEY_DELIMITER, " "))
    } else {
        normalized
    }
}

fn compact(text: &str) -> String {
    text.chars().filter(|c| !c.is_whitespace()).collect()
}

fn collapse_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn is_missing(trimmed: &str) -> bool {
    trimmed.is_empty()
        || MISSING_PLACEHOLDERS
            .iter()
            .any(|placeholder| trimmed.eq_ignore_ascii_case(placeholder))
}
