//! Runhouse Storage Backends
//!
//! This crate defines the one capability interface the query engine needs
//! from storage - [`DocumentStore`] - and three implementations of it.
//!
//! ## Purpose
//!
//! Runs live in physically different places: newline-delimited append logs
//! on disk, an embedded SQLite database, or plain memory. The catalog layer
//! must behave identically over all of them, so every backend is reached
//! only through this trait, held as `Arc<dyn DocumentStore>`; nothing above
//! this crate branches on backend identity.
//!
//! ## The Contract
//!
//! - `list_runs(query)` enumerates start documents matching a
//!   [`Query`], ordered by start time **descending** (most recent first)
//! - `get_event_pages` / `get_datum_pages` return lazy page streams sorted
//!   by `first_index` ascending, restricted to pages whose index range
//!   intersects `[skip, skip + limit)`; nothing outside that range is
//!   materialized
//! - the remaining operations are point lookups (stop document, descriptor
//!   list, resource, datum-to-resource)
//!
//! The trait is read-only. The in-memory and SQLite backends additionally
//! expose inherent `insert_*` / `append_*` registration methods for the
//! ingest tooling that populates them; the append-log backend registers
//! runs by scanning its files instead (see [`jsonl`]).
//!
//! ## Implementations
//!
//! - [`MemoryStore`]: everything in process memory; also the test double
//! - [`SqliteStore`]: sqlx-backed document tables with indexed page ranges
//! - [`JsonlStore`]: append-log files re-indexed incrementally by mtime

pub mod error;
pub mod jsonl;
pub mod memory;
pub mod sqlite;

pub use error::{Result, StoreError};
pub use jsonl::{JsonlConfig, JsonlStore};
pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

use async_trait::async_trait;
use futures::stream::BoxStream;

use runhouse_core::{DatumPage, Descriptor, EventPage, Query, Resource, RunStart, RunStop};

/// A lazy sequence of documents; errors surface as stream items when the
/// failing portion is consumed.
pub type DocumentStream<T> = BoxStream<'static, Result<T>>;

/// The narrow storage contract the query engine is written against.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Start documents matching `query`, ordered by start time descending.
    /// Each call re-issues the enumeration against current storage state.
    async fn list_runs(&self, query: &Query) -> Result<DocumentStream<RunStart>>;

    /// Number of runs matching `query`.
    async fn count_runs(&self, query: &Query) -> Result<u64>;

    /// The stop document for a run, or `None` while the run is in progress
    /// (or the run is unknown).
    async fn get_run_stop(&self, run_uid: &str) -> Result<Option<RunStop>>;

    /// A run's descriptors, ordered by creation time ascending.
    async fn get_descriptors(&self, run_uid: &str) -> Result<Vec<Descriptor>>;

    /// Total number of events recorded for a descriptor.
    async fn count_events(&self, descriptor_uid: &str) -> Result<u64>;

    /// Event pages for one descriptor whose `[first_index, last_index]`
    /// range intersects `[skip, skip + limit)`, sorted by `first_index`
    /// ascending. `limit = None` means unbounded.
    async fn get_event_pages(
        &self,
        descriptor_uid: &str,
        skip: u64,
        limit: Option<u64>,
    ) -> Result<DocumentStream<EventPage>>;

    /// A run's resources, in registration order.
    async fn get_resources(&self, run_uid: &str) -> Result<Vec<Resource>>;

    async fn get_resource(&self, resource_uid: &str) -> Result<Resource>;

    /// The uid of the resource a datum belongs to.
    async fn lookup_resource_for_datum(&self, datum_id: &str) -> Result<String>;

    /// Datum pages for one resource, same slicing contract as
    /// [`get_event_pages`](Self::get_event_pages).
    async fn get_datum_pages(
        &self,
        resource_uid: &str,
        skip: u64,
        limit: Option<u64>,
    ) -> Result<DocumentStream<DatumPage>>;
}
