//! Run Catalog: Lookup, Search Scoping, Ordered Enumeration
//!
//! A [`Catalog`] is a read-only ordered-map view over a store's runs:
//! `keys` / `values` / `items` enumerate matching runs most-recent-first,
//! `get` resolves the overloaded key forms interactive clients use, and
//! `search` derives a narrower catalog without touching this one.
//!
//! ## Key Forms
//!
//! Integer keys overload two distinct, mutually exclusive meanings,
//! distinguished only by sign - the "give me the Nth-to-last run" and
//! "give me run number N" idioms clients use interchangeably:
//!
//! - `-1` is the most recent matching run, `-2` the one before it; an
//!   offset past the end is an out-of-range error reporting the count
//! - a non-negative integer is a scan id; lookup returns the *most
//!   recent* run with that scan id (scan ids recycle over time)
//! - anything else is a uid: exact match first, then prefix match,
//!   capped at [`PREFIX_MATCH_CAP`] candidates - one hit resolves, many
//!   is an ambiguity error listing them, zero is not-found
//!
//! String keys that parse as integers ("-1", "42") behave like the
//! integers they parse to, since interactive clients often deliver them
//! that way.

use std::fmt;
use std::sync::Arc;

use futures::stream::{BoxStream, StreamExt, TryStreamExt};

use runhouse_core::Query;
use runhouse_store::DocumentStore;

use crate::error::{CatalogError, Result};
use crate::handler::HandlerRegistry;
use crate::run::RunEntry;

/// Most prefix-match candidates fetched (and listed in the ambiguity
/// error) before giving up; keeps a short prefix from scanning the world.
pub const PREFIX_MATCH_CAP: usize = 10;

/// A lookup key for [`Catalog::get`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Key {
    /// Most recent run with this scan id.
    ScanId(i64),
    /// 1-based offset from the most recent matching run.
    FromEnd(u64),
    /// Exact uid, or uid prefix.
    Name(String),
}

impl Key {
    fn parse(text: &str) -> Key {
        match text.trim().parse::<i64>() {
            Ok(n) if n < 0 => Key::FromEnd(n.unsigned_abs()),
            Ok(n) => Key::ScanId(n),
            Err(_) => Key::Name(text.to_string()),
        }
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Key::ScanId(n) => write!(f, "{n}"),
            Key::FromEnd(n) => write!(f, "-{n}"),
            Key::Name(name) => write!(f, "{name}"),
        }
    }
}

impl From<&str> for Key {
    fn from(text: &str) -> Key {
        Key::parse(text)
    }
}

impl From<String> for Key {
    fn from(text: String) -> Key {
        Key::parse(&text)
    }
}

impl From<i64> for Key {
    fn from(n: i64) -> Key {
        if n < 0 {
            Key::FromEnd(n.unsigned_abs())
        } else {
            Key::ScanId(n)
        }
    }
}

impl From<i32> for Key {
    fn from(n: i32) -> Key {
        Key::from(n as i64)
    }
}

/// Read-only, query-scoped view over a store's runs.
#[derive(Clone)]
pub struct Catalog {
    store: Arc<dyn DocumentStore>,
    query: Query,
    handlers: HandlerRegistry,
}

impl Catalog {
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        Self {
            store,
            query: Query::All,
            handlers: HandlerRegistry::default(),
        }
    }

    pub fn with_handler_registry(mut self, handlers: HandlerRegistry) -> Self {
        self.handlers = handlers;
        self
    }

    /// The query scoping this view; `Query::All` for an unscoped catalog.
    pub fn query(&self) -> &Query {
        &self.query
    }

    pub fn handler_registry(&self) -> &HandlerRegistry {
        &self.handlers
    }

    /// Derive a catalog whose scope is this one's query AND `query`.
    /// The receiver is untouched; both views share the backing store.
    pub fn search(&self, query: Query) -> Catalog {
        Catalog {
            store: self.store.clone(),
            query: self.query.clone().and(query),
            handlers: self.handlers.clone(),
        }
    }

    /// Number of runs in scope.
    pub async fn len(&self) -> Result<u64> {
        Ok(self.store.count_runs(&self.query).await?)
    }

    pub async fn is_empty(&self) -> Result<bool> {
        Ok(self.len().await? == 0)
    }

    /// Uids of matching runs, most recent first. Each call re-issues the
    /// enumeration, so a fresh stream reflects current storage state.
    pub async fn keys(&self) -> Result<BoxStream<'static, Result<String>>> {
        let runs = self.store.list_runs(&self.query).await?;
        Ok(runs.map_ok(|start| start.uid).err_into().boxed())
    }

    /// Run entries, most recent first.
    pub async fn values(&self) -> Result<BoxStream<'static, Result<RunEntry>>> {
        let store = self.store.clone();
        let runs = self.store.list_runs(&self.query).await?;
        Ok(runs
            .err_into()
            .and_then(move |start| {
                let store = store.clone();
                async move { RunEntry::load(store, start).await }
            })
            .boxed())
    }

    /// `(uid, entry)` pairs, most recent first.
    pub async fn items(&self) -> Result<BoxStream<'static, Result<(String, RunEntry)>>> {
        let values = self.values().await?;
        Ok(values
            .map_ok(|entry| (entry.uid().to_string(), entry))
            .boxed())
    }

    /// Resolve a key to a run entry; see the module docs for key forms.
    pub async fn get(&self, key: impl Into<Key>) -> Result<RunEntry> {
        let key = key.into();
        tracing::debug!(key = %key, "catalog lookup");
        match key {
            Key::ScanId(scan_id) => {
                let scoped = self.query.clone().and(Query::eq("scan_id", scan_id));
                let mut runs = self.store.list_runs(&scoped).await?;
                match runs.try_next().await? {
                    Some(start) => RunEntry::load(self.store.clone(), start).await,
                    None => Err(CatalogError::KeyNotFound {
                        key: scan_id.to_string(),
                    }),
                }
            }
            Key::FromEnd(offset) => {
                let mut runs = self.store.list_runs(&self.query).await?;
                let mut remaining = offset;
                while let Some(start) = runs.try_next().await? {
                    remaining -= 1;
                    if remaining == 0 {
                        return RunEntry::load(self.store.clone(), start).await;
                    }
                }
                Err(CatalogError::OutOfRange {
                    index: offset,
                    len: self.store.count_runs(&self.query).await?,
                })
            }
            Key::Name(name) => {
                let exact = self.query.clone().and(Query::eq("uid", name.clone()));
                let mut runs = self.store.list_runs(&exact).await?;
                if let Some(start) = runs.try_next().await? {
                    return RunEntry::load(self.store.clone(), start).await;
                }
                drop(runs);

                let prefixed = self
                    .query
                    .clone()
                    .and(Query::prefix("uid", name.clone()));
                let runs = self.store.list_runs(&prefixed).await?;
                let mut candidates: Vec<_> =
                    runs.take(PREFIX_MATCH_CAP).try_collect().await?;
                if candidates.len() > 1 {
                    return Err(CatalogError::AmbiguousKey {
                        prefix: name,
                        candidates: candidates.into_iter().map(|start| start.uid).collect(),
                    });
                }
                match candidates.pop() {
                    Some(start) => RunEntry::load(self.store.clone(), start).await,
                    None => Err(CatalogError::KeyNotFound { key: name }),
                }
            }
        }
    }

    /// Whether `get(key)` would succeed.
    pub async fn contains(&self, key: impl Into<Key>) -> bool {
        self.get(key).await.is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_parse_like_interactive_clients_expect() {
        assert_eq!(Key::from("-1"), Key::FromEnd(1));
        assert_eq!(Key::from("-12"), Key::FromEnd(12));
        assert_eq!(Key::from("42"), Key::ScanId(42));
        assert_eq!(Key::from("0"), Key::ScanId(0));
        assert_eq!(Key::from(-3), Key::FromEnd(3));
        assert_eq!(Key::from(7), Key::ScanId(7));
        assert_eq!(Key::from("abc123"), Key::Name("abc123".to_string()));
        // Not a valid integer, so it falls back to a uid lookup.
        assert_eq!(Key::from("1e3"), Key::Name("1e3".to_string()));
    }
}
