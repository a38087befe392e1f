//! Error Types for the Document Model
//!
//! All parsing and page-shape failures in this crate surface as [`Error`].
//!
//! ## Error Categories
//!
//! - `MalformedRecord`: a log line or document body is structurally wrong
//!   (not a `[kind, body]` pair, wrong leading document, record missing a
//!   declared field)
//! - `UnknownDocumentKind`: the `kind` tag of a log line is not one we know
//! - `RaggedPage`: a columnar page whose parallel arrays disagree in length
//! - `Json`: the underlying serde_json failure, converted via `#[from]` so
//!   `?` works everywhere

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("malformed record: {0}")]
    MalformedRecord(String),

    #[error("unknown document kind: {0}")]
    UnknownDocumentKind(String),

    #[error("ragged page: column {column:?} has {found} rows, expected {expected}")]
    RaggedPage {
        column: String,
        found: usize,
        expected: usize,
    },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
