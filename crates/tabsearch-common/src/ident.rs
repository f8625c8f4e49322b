//! Identifier sanitization and SQL quoting
//!
//! Every table and column name that ends up inside a generated statement goes
//! through one of these functions. They are pure so the generated SQL can be
//! tested without a database.

use crate::error::{CommonError, Result};
use std::collections::HashMap;

/// Maximum length of the slug part of a normalized column name
pub const COLUMN_SLUG_MAX_LEN: usize = 50;

/// Sanitize a raw file header into a usable column name.
///
/// Characters outside `[A-Za-z0-9_]` become `_`. An empty result, or one that
/// starts with a digit, gets a leading `_`.
pub fn sanitize_header(raw: &str) -> String {
    let mut name: String = raw
        .trim()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' { c } else { '_' })
        .collect();

    if name.is_empty() || name.starts_with(|c: char| c.is_ascii_digit()) {
        name.insert(0, '_');
    }
    name
}

/// Make header names unique by appending `_2`, `_3`, ... to repeats.
pub fn dedupe_names(names: Vec<String>) -> Vec<String> {
    let mut seen: HashMap<String, usize> = HashMap::new();
    let mut out = Vec::with_capacity(names.len());

    for name in names {
        let mut candidate = name.clone();
        let mut n = *seen.get(&name).unwrap_or(&0);
        while seen.contains_key(&candidate) {
            n += 1;
            candidate = format!("{}_{}", name, n + 1);
        }
        seen.insert(name, n);
        seen.insert(candidate.clone(), 0);
        out.push(candidate);
    }
    out
}

/// Lowercase, collapse every run of non-alphanumeric characters into a single
/// `_`, trim separators at the ends, and cut to `max_len` characters.
///
/// Applying it twice gives the same result as applying it once.
pub fn slugify(raw: &str, max_len: usize) -> String {
    let lowered = raw.to_lowercase();
    let words: Vec<&str> = lowered
        .split(|c: char| !c.is_ascii_alphanumeric())
        .filter(|w| !w.is_empty())
        .collect();
    let slug: String = words.join("_").chars().take(max_len).collect();
    slug.trim_end_matches('_').to_string()
}

/// Column name used in normalized tables: `c{index:03}_{slug}`.
///
/// The positional prefix keeps names unique even when two headers slugify to
/// the same text.
pub fn positional_identifier(index: usize, raw: &str) -> String {
    format!("c{:03}_{}", index, slugify(raw, COLUMN_SLUG_MAX_LEN))
}

/// Quote an identifier with backticks, escaping backslashes and backticks.
pub fn quote_identifier(name: &str) -> String {
    let mut out = String::with_capacity(name.len() + 2);
    out.push('`');
    for c in name.chars() {
        if c == '`' || c == '\\' {
            out.push('\\');
        }
        out.push(c);
    }
    out.push('`');
    out
}

/// Quote a string literal with single quotes, escaping backslashes and quotes.
pub fn quote_literal(value: &str) -> String {
    let mut out = String::with_capacity(value.len() + 2);
    out.push('\'');
    for c in value.chars() {
        match c {
            '\'' => out.push_str("\\'"),
            '\\' => out.push_str("\\\\"),
            '\0' => out.push_str("\\0"),
            _ => out.push(c),
        }
    }
    out.push('\'');
    out
}

/// Check that a table name read back from storage is a bare identifier.
///
/// Generated names only ever contain `[A-Za-z0-9_]`; anything else means the
/// bookkeeping tables were edited by hand and the name must not reach SQL.
pub fn validate_table_name(name: &str) -> Result<&str> {
    let valid = !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_')
        && !name.starts_with(|c: char| c.is_ascii_digit());

    if valid {
        Ok(name)
    } else {
        Err(CommonError::InvalidIdentifier(name.to_string()))
    }
}
