//! Table naming
//!
//! An input file gets an item name `{index:03}_{slug}_{YYYYmmdd_HHMMSS}`.
//! Its raw staging table is `_input_log_{item}` and its normalized table is
//! `table_{item}`.

use chrono::NaiveDateTime;
use tabsearch_common::ident::slugify;

pub const RAW_TABLE_PREFIX: &str = "_input_log_";
pub const NORMALIZED_TABLE_PREFIX: &str = "table_";

/// Maximum length of the file-stem slug inside an item name
pub const ITEM_SLUG_MAX_LEN: usize = 16;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableNames {
    pub item_name: String,
    pub raw_table: String,
    pub normalized_table: String,
}

impl TableNames {
    pub fn new(index: usize, file_stem: &str, at: NaiveDateTime) -> Self {
        let item_name = format!(
            "{:03}_{}_{}",
            index,
            slugify(file_stem, ITEM_SLUG_MAX_LEN),
            at.format("%Y%m%d_%H%M%S")
        );
        Self::for_item(item_name)
    }

    pub fn for_item(item_name: String) -> Self {
        Self {
            raw_table: format!("{}{}", RAW_TABLE_PREFIX, item_name),
            normalized_table: format!("{}{}", NORMALIZED_TABLE_PREFIX, item_name),
            item_name,
        }
    }
}

/// Normalized table name for a raw table name, if it follows the raw prefix
pub fn normalized_name_for(raw_table: &str) -> Option<String> {
    raw_table
        .strip_prefix(RAW_TABLE_PREFIX)
        .map(|item| format!("{}{}", NORMALIZED_TABLE_PREFIX, item))
}
