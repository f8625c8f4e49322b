//! Error types shared across tabsearch crates

use thiserror::Error;

/// Result type alias for common operations
pub type Result<T> = std::result::Result<T, CommonError>;

#[derive(Error, Debug)]
pub enum CommonError {
    /// A name read back from storage is not safe to splice into SQL
    #[error("Invalid identifier: {0:?}")]
    InvalidIdentifier(String),
}
