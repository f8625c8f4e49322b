//! Tabsearch Common Library
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! Shared types and utilities for the tabsearch workspace.
//!
//! # Overview
//!
//! - **Error Handling**: Custom error types and result types
//! - **Identifiers**: Pure functions that turn arbitrary header text into
//!   safe SQL identifiers and quote names and literals for generated SQL
//! - **Logging**: Subscriber setup shared by every binary
//!
//! # Example
//!
//! ```
//! use tabsearch_common::ident::{positional_identifier, quote_identifier};
//!
//! let column = positional_identifier(3, "Unit Price ($)");
//! assert_eq!(column, "c003_unit_price");
//! assert_eq!(quote_identifier(&column), "`c003_unit_price`");
//! ```

pub mod error;
pub mod ident;
pub mod logging;

// Re-export commonly used types
pub use error::{CommonError, Result};
