//! Structured Filters over Start Documents
//!
//! A [`Query`] is an opaque filter evaluated against a run's start document.
//! Catalogs narrow their view with `search(query)`, which composes the new
//! filter onto the existing scope with logical AND; an empty query matches
//! every run.
//!
//! ## Evaluation
//!
//! Queries are evaluated here, in Rust, against the raw JSON of the start
//! document. Every storage backend goes through the same `matches` call, so
//! adding a backend never means translating the query language; the engine
//! never branches on backend identity.
//!
//! Field paths are dot-separated into nested objects ("md.sample.name").
//! Numeric comparisons coerce through f64, so `5` matches `5.0`.

use std::cmp::Ordering;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A filter over run start documents.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub enum Query {
    /// Matches every document; identity of [`Query::and`].
    #[default]
    All,
    Eq(String, Value),
    Ne(String, Value),
    Gt(String, Value),
    Gte(String, Value),
    Lt(String, Value),
    Lte(String, Value),
    In(String, Vec<Value>),
    /// Field present (true) or absent (false).
    Exists(String, bool),
    /// String field starts with the given prefix.
    Prefix(String, String),
    And(Vec<Query>),
    Or(Vec<Query>),
    Not(Box<Query>),
}

impl Query {
    pub fn eq(path: impl Into<String>, value: impl Into<Value>) -> Query {
        Query::Eq(path.into(), value.into())
    }

    pub fn ne(path: impl Into<String>, value: impl Into<Value>) -> Query {
        Query::Ne(path.into(), value.into())
    }

    pub fn gt(path: impl Into<String>, value: impl Into<Value>) -> Query {
        Query::Gt(path.into(), value.into())
    }

    pub fn gte(path: impl Into<String>, value: impl Into<Value>) -> Query {
        Query::Gte(path.into(), value.into())
    }

    pub fn lt(path: impl Into<String>, value: impl Into<Value>) -> Query {
        Query::Lt(path.into(), value.into())
    }

    pub fn lte(path: impl Into<String>, value: impl Into<Value>) -> Query {
        Query::Lte(path.into(), value.into())
    }

    pub fn one_of(path: impl Into<String>, values: impl IntoIterator<Item = impl Into<Value>>) -> Query {
        Query::In(path.into(), values.into_iter().map(Into::into).collect())
    }

    pub fn exists(path: impl Into<String>) -> Query {
        Query::Exists(path.into(), true)
    }

    pub fn prefix(path: impl Into<String>, prefix: impl Into<String>) -> Query {
        Query::Prefix(path.into(), prefix.into())
    }

    /// True for the empty query (matches everything).
    pub fn is_all(&self) -> bool {
        matches!(self, Query::All)
    }

    /// AND-compose two queries. Associative; `All` is the identity, and
    /// nested `And`s are flattened so repeated scoping stays shallow.
    pub fn and(self, other: Query) -> Query {
        match (self, other) {
            (Query::All, q) | (q, Query::All) => q,
            (Query::And(mut a), Query::And(b)) => {
                a.extend(b);
                Query::And(a)
            }
            (Query::And(mut a), q) => {
                a.push(q);
                Query::And(a)
            }
            (q, Query::And(b)) => {
                let mut clauses = vec![q];
                clauses.extend(b);
                Query::And(clauses)
            }
            (a, b) => Query::And(vec![a, b]),
        }
    }

    /// Evaluate this query against a start document.
    pub fn matches(&self, doc: &Value) -> bool {
        match self {
            Query::All => true,
            Query::Eq(path, value) => lookup(doc, path).is_some_and(|v| values_eq(v, value)),
            // Like the usual document-store semantics, Ne also matches
            // documents where the field is absent.
            Query::Ne(path, value) => lookup(doc, path).is_none_or(|v| !values_eq(v, value)),
            Query::Gt(path, value) => cmp_matches(doc, path, value, Ordering::is_gt),
            Query::Gte(path, value) => cmp_matches(doc, path, value, Ordering::is_ge),
            Query::Lt(path, value) => cmp_matches(doc, path, value, Ordering::is_lt),
            Query::Lte(path, value) => cmp_matches(doc, path, value, Ordering::is_le),
            Query::In(path, values) => {
                lookup(doc, path).is_some_and(|v| values.iter().any(|w| values_eq(v, w)))
            }
            Query::Exists(path, wanted) => lookup(doc, path).is_some() == *wanted,
            Query::Prefix(path, prefix) => lookup(doc, path)
                .and_then(Value::as_str)
                .is_some_and(|s| s.starts_with(prefix.as_str())),
            Query::And(clauses) => clauses.iter().all(|q| q.matches(doc)),
            Query::Or(clauses) => clauses.iter().any(|q| q.matches(doc)),
            Query::Not(inner) => !inner.matches(doc),
        }
    }
}

fn lookup<'a>(doc: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = doc;
    for part in path.split('.') {
        current = current.get(part)?;
    }
    Some(current)
}

fn values_eq(a: &Value, b: &Value) -> bool {
    if let (Some(x), Some(y)) = (a.as_f64(), b.as_f64()) {
        return x == y;
    }
    a == b
}

fn compare(a: &Value, b: &Value) -> Option<Ordering> {
    if let (Some(x), Some(y)) = (a.as_f64(), b.as_f64()) {
        return x.partial_cmp(&y);
    }
    if let (Some(x), Some(y)) = (a.as_str(), b.as_str()) {
        return Some(x.cmp(y));
    }
    None
}

fn cmp_matches(doc: &Value, path: &str, value: &Value, accept: fn(Ordering) -> bool) -> bool {
    lookup(doc, path)
        .and_then(|v| compare(v, value))
        .is_some_and(accept)
}
