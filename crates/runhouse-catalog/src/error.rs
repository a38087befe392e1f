//! Catalog Error Types
//!
//! Lookup failures carry enough context to let a caller refine the query:
//! the key that missed, the candidate uids of an ambiguous prefix, the
//! number of runs actually available for an out-of-range recency index.

use thiserror::Error;

use runhouse_store::StoreError;

pub type Result<T> = std::result::Result<T, CatalogError>;

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("no run matching key {key:?}")]
    KeyNotFound { key: String },

    #[error(
        "multiple matches to partial uid {prefix:?}; up to {} listed here: {}",
        crate::catalog::PREFIX_MATCH_CAP,
        .candidates.join(", ")
    )]
    AmbiguousKey {
        prefix: String,
        candidates: Vec<String>,
    },

    #[error("catalog only contains {len} runs (requested {index} from the end)")]
    OutOfRange { index: u64, len: u64 },

    #[error("misconfigured catalog: {0}")]
    Misconfigured(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl From<runhouse_core::Error> for CatalogError {
    fn from(e: runhouse_core::Error) -> Self {
        CatalogError::Store(StoreError::from(e))
    }
}
