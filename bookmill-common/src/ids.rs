//! Identifier validation for labels, pages and items
//!
//! Labels and item ids end up in file names and SQL keys, so they are
//! restricted to `[A-Za-z0-9_-]`.

use crate::{Error, Result};

const MAX_ID_LEN: usize = 128;

fn is_safe_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_' || c == '-'
}

fn validate_safe(what: &str, value: &str) -> Result<()> {
    if value.is_empty() {
        return Err(Error::InvalidInput(format!("{} must not be empty", what)));
    }
    if value.len() > MAX_ID_LEN {
        return Err(Error::InvalidInput(format!(
            "{} exceeds {} characters",
            what, MAX_ID_LEN
        )));
    }
    if !value.chars().all(is_safe_char) {
        return Err(Error::InvalidInput(format!(
            "{} '{}' contains characters outside [A-Za-z0-9_-]",
            what, value
        )));
    }
    Ok(())
}

/// Validate a document label
pub fn validate_label(label: &str) -> Result<()> {
    validate_safe("label", label)
}

/// Validate an item id (page, section or whole-book item)
pub fn validate_item_id(item_id: &str) -> Result<()> {
    validate_safe("item id", item_id)
}

/// Validate a page id of the form `pg` followed by digits (`pg001`)
pub fn validate_page_id(page_id: &str) -> Result<()> {
    match page_id.strip_prefix("pg") {
        Some(digits) if !digits.is_empty() && digits.chars().all(|c| c.is_ascii_digit()) => Ok(()),
        _ => Err(Error::InvalidInput(format!(
            "page id '{}' must look like pg001",
            page_id
        ))),
    }
}

/// True if `item_id` belongs to `page_id`: equal to it, or `<page>_<rest>`
pub fn item_in_page(item_id: &str, page_id: &str) -> bool {
    match item_id.strip_prefix(page_id) {
        Some("") => true,
        Some(rest) => rest.starts_with('_'),
        None => false,
    }
}

/// Page id prefix of an item id (`pg001_s002` -> `pg001`)
pub fn page_of(item_id: &str) -> &str {
    item_id.split('_').next().unwrap_or(item_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_labels() {
        assert!(validate_label("moby-dick_1851").is_ok());
        assert!(validate_label("").is_err());
        assert!(validate_label("../etc").is_err());
        assert!(validate_label("a b").is_err());
        assert!(validate_label(&"x".repeat(129)).is_err());
    }

    #[test]
    fn test_page_ids() {
        assert!(validate_page_id("pg001").is_ok());
        assert!(validate_page_id("pg1234").is_ok());
        assert!(validate_page_id("pg").is_err());
        assert!(validate_page_id("page1").is_err());
        assert!(validate_page_id("pg01a").is_err());
    }

    #[test]
    fn test_item_in_page() {
        assert!(item_in_page("pg001", "pg001"));
        assert!(item_in_page("pg001_s001", "pg001"));
        assert!(!item_in_page("pg0010_s001", "pg001"));
        assert!(!item_in_page("pg002_s001", "pg001"));
        assert_eq!(page_of("pg003_s001"), "pg003");
        assert_eq!(page_of("pg003"), "pg003");
    }
}
