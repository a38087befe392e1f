//! Document Data Structures
//!
//! This module defines the documents that make up a run - one complete
//! data-acquisition session.
//!
//! ## Document Lifecycle
//!
//! A run begins with a [`RunStart`], emits [`Descriptor`]s that declare the
//! shape of its event streams, then [`Event`]s / [`EventPage`]s carrying the
//! measured values, [`Resource`]s and [`Datum`]s referencing externally
//! stored assets, and finally (if the run completed) a single [`RunStop`].
//!
//! ## Structure
//!
//! - **RunStart**: uid, start time, optional scan id, arbitrary user fields
//! - **RunStop**: finalization metadata; absent while a run is in progress
//! - **Descriptor**: named schema for one stream of events within a run
//! - **Event / EventPage**: one time-sample / a columnar batch of samples
//! - **Resource / Datum / DatumPage**: an external asset / one reference
//!   into it / a columnar batch of such references
//!
//! ## Design Decisions
//!
//! - All document structs carry a `#[serde(flatten)]` map so user-defined
//!   fields round-trip untouched; this layer only interprets the fields it
//!   reads (uid, time, scan id, linkage)
//! - Timestamps are f64 seconds since the Unix epoch, the convention of the
//!   acquisition tooling that writes these documents
//! - [`Document`] is the tagged union used by the append-log line format:
//!   each line is a two-element JSON array `[kind, body]`

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};

/// Arbitrary user-defined document fields, preserved through round-trips.
pub type Fields = serde_json::Map<String, Value>;

/// Creation metadata for a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunStart {
    /// Globally unique run identifier
    pub uid: String,

    /// Start time, seconds since epoch
    pub time: f64,

    /// Domain-assigned scan number; not unique over time
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scan_id: Option<i64>,

    /// User-defined start fields (plan name, sample, operator, ...)
    #[serde(flatten)]
    pub extra: Fields,
}

/// Finalization metadata for a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunStop {
    /// Unique identifier of this stop document
    pub uid: String,

    /// Uid of the run this document closes
    pub run_start: String,

    /// Stop time, seconds since epoch
    pub time: f64,

    /// Outcome reported by the acquisition ("success", "abort", ...)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_status: Option<String>,

    #[serde(flatten)]
    pub extra: Fields,
}

/// Schema entry for one named field of an event stream.
///
/// A key is "external" when its value lives in an externally stored asset
/// and must be resolved through a [`Resource`] / [`Datum`] pair instead of
/// being read inline.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct DataKey {
    /// Present iff the field's value is stored externally; the string names
    /// the storage flavor (e.g. "FILESTORE:")
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external: Option<String>,

    #[serde(flatten)]
    pub extra: Fields,
}

impl DataKey {
    pub fn is_external(&self) -> bool {
        self.external.is_some()
    }
}

/// Schema declaration for one stream of events within a run.
///
/// Immutable once created; every event references exactly one descriptor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Descriptor {
    pub uid: String,

    /// Uid of the owning run
    pub run_start: String,

    /// Creation time, seconds since epoch
    pub time: f64,

    /// Stream name (e.g. "primary", "baseline")
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    /// Field name to schema entry
    #[serde(default)]
    pub data_keys: BTreeMap<String, DataKey>,

    #[serde(flatten)]
    pub extra: Fields,
}

impl Descriptor {
    /// Names of the data keys whose values must be resolved externally.
    pub fn external_keys(&self) -> Vec<String> {
        self.data_keys
            .iter()
            .filter(|(_, key)| key.is_external())
            .map(|(name, _)| name.clone())
            .collect()
    }
}

/// One time-sample within a descriptor's stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub uid: String,

    /// Uid of the owning descriptor
    pub descriptor: String,

    /// 1-based, monotonically increasing within the stream
    pub seq_num: u64,

    /// Sample time, seconds since epoch
    pub time: f64,

    /// Inline field values, keyed by data key name
    #[serde(default)]
    pub data: BTreeMap<String, Value>,

    /// Per-field measurement times
    #[serde(default)]
    pub timestamps: BTreeMap<String, Value>,

    /// For external fields: false until the value has been resolved via a
    /// datum lookup
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub filled: BTreeMap<String, bool>,
}

/// A columnar batch of consecutive events for one descriptor.
///
/// Parallel arrays, one entry per event; `first_index` is the global
/// 0-based position of the first row within the descriptor's full stream.
/// Pages for a descriptor are contiguous and non-overlapping, so
/// concatenating them in `first_index` order reconstructs the stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventPage {
    pub descriptor: String,

    /// Global index of the first row
    #[serde(default)]
    pub first_index: u64,

    pub seq_num: Vec<u64>,
    pub time: Vec<f64>,
    pub uid: Vec<String>,

    #[serde(default)]
    pub data: BTreeMap<String, Vec<Value>>,

    #[serde(default)]
    pub timestamps: BTreeMap<String, Vec<Value>>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub filled: BTreeMap<String, Vec<bool>>,
}

/// Reference to an externally stored asset (e.g. a detector file) and the
/// handler spec needed to interpret it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Resource {
    pub uid: String,

    /// Uid of the owning run
    #[serde(default)]
    pub run_start: String,

    /// Handler spec name used to pick an interpreter for the asset
    pub spec: String,

    /// Mount-point-like prefix of the asset path
    #[serde(default)]
    pub root: String,

    pub resource_path: String,

    #[serde(default)]
    pub resource_kwargs: Fields,

    #[serde(flatten)]
    pub extra: Fields,
}

/// One reference to a value within a resource.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Datum {
    pub datum_id: String,

    /// Uid of the owning resource
    pub resource: String,

    #[serde(default)]
    pub datum_kwargs: Fields,
}

/// Columnar batch of datums for one resource, index-ordered like
/// [`EventPage`] (datums carry no timestamps).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatumPage {
    pub resource: String,

    /// Global index of the first row
    #[serde(default)]
    pub first_index: u64,

    pub datum_id: Vec<String>,

    #[serde(default)]
    pub datum_kwargs: BTreeMap<String, Vec<Value>>,
}

/// One document of any kind, as it appears in the append-log line format.
///
/// Each log line is a two-element JSON array `[kind, body]` with kind in
/// `start | descriptor | event | event_page | resource | datum |
/// datum_page | stop`. Lines appear in non-decreasing time order and a
/// completed file ends with its stop document.
#[derive(Debug, Clone, PartialEq)]
pub enum Document {
    Start(RunStart),
    Descriptor(Descriptor),
    Event(Event),
    EventPage(EventPage),
    Resource(Resource),
    Datum(Datum),
    DatumPage(DatumPage),
    Stop(RunStop),
}

impl Document {
    /// The `kind` tag used by the line format.
    pub fn kind(&self) -> &'static str {
        match self {
            Document::Start(_) => "start",
            Document::Descriptor(_) => "descriptor",
            Document::Event(_) => "event",
            Document::EventPage(_) => "event_page",
            Document::Resource(_) => "resource",
            Document::Datum(_) => "datum",
            Document::DatumPage(_) => "datum_page",
            Document::Stop(_) => "stop",
        }
    }

    /// Parse one `[kind, body]` log line.
    pub fn from_line(line: &str) -> Result<Document> {
        let (kind, body): (String, Value) = serde_json::from_str(line)?;
        Self::from_parts(&kind, body)
    }

    /// Build a document from an already-split kind tag and body.
    pub fn from_parts(kind: &str, body: Value) -> Result<Document> {
        let doc = match kind {
            "start" => Document::Start(serde_json::from_value(body)?),
            "descriptor" => Document::Descriptor(serde_json::from_value(body)?),
            "event" => Document::Event(serde_json::from_value(body)?),
            "event_page" => Document::EventPage(serde_json::from_value(body)?),
            "resource" => Document::Resource(serde_json::from_value(body)?),
            "datum" => Document::Datum(serde_json::from_value(body)?),
            "datum_page" => Document::DatumPage(serde_json::from_value(body)?),
            "stop" => Document::Stop(serde_json::from_value(body)?),
            other => return Err(Error::UnknownDocumentKind(other.to_string())),
        };
        Ok(doc)
    }

    /// Serialize back to the `[kind, body]` line format (no trailing newline).
    pub fn to_line(&self) -> Result<String> {
        let body = match self {
            Document::Start(d) => serde_json::to_value(d)?,
            Document::Descriptor(d) => serde_json::to_value(d)?,
            Document::Event(d) => serde_json::to_value(d)?,
            Document::EventPage(d) => serde_json::to_value(d)?,
            Document::Resource(d) => serde_json::to_value(d)?,
            Document::Datum(d) => serde_json::to_value(d)?,
            Document::DatumPage(d) => serde_json::to_value(d)?,
            Document::Stop(d) => serde_json::to_value(d)?,
        };
        Ok(serde_json::to_string(&(self.kind(), body))?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn start_line_roundtrip() {
        let line = r#"["start", {"uid": "abc123", "time": 1.5, "scan_id": 7, "plan_name": "count"}]"#;
        let doc = Document::from_line(line).unwrap();
        let start = match &doc {
            Document::Start(s) => s,
            other => panic!("expected start, got {}", other.kind()),
        };
        assert_eq!(start.uid, "abc123");
        assert_eq!(start.scan_id, Some(7));
        assert_eq!(start.extra.get("plan_name"), Some(&json!("count")));

        let reparsed = Document::from_line(&doc.to_line().unwrap()).unwrap();
        assert_eq!(reparsed, doc);
    }

    #[test]
    fn unknown_kind_is_an_error() {
        let err = Document::from_line(r#"["bulk_events", {}]"#).unwrap_err();
        assert!(matches!(err, Error::UnknownDocumentKind(k) if k == "bulk_events"));
    }

    #[test]
    fn not_a_pair_is_malformed() {
        assert!(Document::from_line(r#"{"uid": "abc"}"#).is_err());
        assert!(Document::from_line("").is_err());
    }

    #[test]
    fn external_keys_come_from_the_external_marker() {
        let descriptor: Descriptor = serde_json::from_value(json!({
            "uid": "d1",
            "run_start": "r1",
            "time": 2.0,
            "data_keys": {
                "temperature": {"dtype": "number", "shape": []},
                "image": {"dtype": "array", "shape": [512, 512], "external": "FILESTORE:"}
            }
        }))
        .unwrap();
        assert_eq!(descriptor.external_keys(), vec!["image".to_string()]);
    }
}
