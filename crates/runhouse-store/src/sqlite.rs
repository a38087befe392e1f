//! SQLite Document Store
//!
//! Implements [`DocumentStore`] on an embedded SQLite database via sqlx.
//! This is the "external document store" backend: documents arrive from
//! acquisition tooling through the `insert_*` / `append_*` registration
//! methods and are served back through the read-only trait.
//!
//! ## Layout
//!
//! One table per document kind. Each row stores the full document as JSON
//! plus the columns queries touch: uid, time, scan id, linkage, and for
//! pages the `[first_index, last_index]` range. Page cursors translate the
//! slicing contract directly into SQL
//! (`last_index >= skip AND first_index < skip + limit ORDER BY
//! first_index`), fetching rows in small batches so unconsumed tails of a
//! cursor are never read from disk.
//!
//! Query filters are evaluated in Rust against the stored JSON, the same
//! code path every other backend uses.
//!
//! ## Constructors
//!
//! - `new(path)` opens or creates a database file and runs migrations
//! - `new_in_memory()` is the test/ephemeral variant
//! - `connect(url)` parses `sqlite:`-style connection strings and rejects
//!   ones that name no database

use futures::stream::{self, StreamExt, TryStreamExt};
use serde_json::Value;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use std::path::Path;
use std::str::FromStr;

use async_trait::async_trait;
use runhouse_core::{
    DatumPage, Descriptor, EventPage, Query, RecordPage, Resource, RunStart, RunStop,
};

use crate::error::{Result, StoreError};
use crate::{DocumentStore, DocumentStream};

/// Rows fetched per round-trip while draining a page cursor.
const PAGE_FETCH_BATCH: i64 = 16;

/// SQLite-backed implementation of [`DocumentStore`].
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Open (or create) a database file and run migrations.
    pub async fn new<P: AsRef<Path>>(path: P) -> Result<Self> {
        let options =
            SqliteConnectOptions::from_str(&format!("sqlite://{}", path.as_ref().display()))?
                .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(10)
            .connect_with(options)
            .await?;
        sqlx::migrate!("./migrations").run(&pool).await?;
        Ok(Self { pool })
    }

    /// In-memory database, for tests and ephemeral catalogs.
    pub async fn new_in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;
        sqlx::migrate!("./migrations").run(&pool).await?;
        Ok(Self { pool })
    }

    /// Open from a connection string. The string must name a database
    /// target; there is no way to guess one.
    pub async fn connect(url: &str) -> Result<Self> {
        let target = url
            .strip_prefix("sqlite://")
            .or_else(|| url.strip_prefix("sqlite:"))
            .ok_or_else(|| {
                StoreError::Misconfigured(format!(
                    "unsupported connection string {url:?}; expected sqlite://<path>"
                ))
            })?;
        if target.is_empty() {
            return Err(StoreError::Misconfigured(format!(
                "connection string {url:?} does not name a database; did you forget to include one?"
            )));
        }
        if target == ":memory:" {
            Self::new_in_memory().await
        } else {
            Self::new(target).await
        }
    }

    // -- registration ------------------------------------------------------

    pub async fn insert_run_start(&self, start: &RunStart) -> Result<()> {
        let document = serde_json::to_string(start)?;
        sqlx::query(
            "INSERT OR REPLACE INTO run_start (uid, time, scan_id, document) VALUES (?, ?, ?, ?)",
        )
        .bind(&start.uid)
        .bind(start.time)
        .bind(start.scan_id)
        .bind(document)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn insert_run_stop(&self, stop: &RunStop) -> Result<()> {
        let known: Option<(i64,)> = sqlx::query_as("SELECT 1 FROM run_start WHERE uid = ?")
            .bind(&stop.run_start)
            .fetch_optional(&self.pool)
            .await?;
        if known.is_none() {
            return Err(StoreError::not_found("run", &stop.run_start));
        }
        let document = serde_json::to_string(stop)?;
        sqlx::query("INSERT OR REPLACE INTO run_stop (run_start, time, document) VALUES (?, ?, ?)")
            .bind(&stop.run_start)
            .bind(stop.time)
            .bind(document)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn insert_descriptor(&self, descriptor: &Descriptor) -> Result<()> {
        let document = serde_json::to_string(descriptor)?;
        sqlx::query(
            "INSERT OR REPLACE INTO descriptor (uid, run_start, time, document) VALUES (?, ?, ?, ?)",
        )
        .bind(&descriptor.uid)
        .bind(&descriptor.run_start)
        .bind(descriptor.time)
        .bind(document)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Append a page to its descriptor's stream; `first_index` is assigned
    /// here, continuing from the last stored page.
    pub async fn append_event_page(&self, page: &EventPage) -> Result<u64> {
        page.check()?;
        let mut tx = self.pool.begin().await?;
        let row = sqlx::query("SELECT MAX(last_index) AS last FROM event_page WHERE descriptor = ?")
            .bind(&page.descriptor)
            .fetch_one(&mut *tx)
            .await?;
        let last: Option<i64> = row.try_get("last")?;
        let first_index = last.map_or(0, |l| l + 1) as u64;

        let mut stored = page.clone();
        stored.first_index = first_index;
        let document = serde_json::to_string(&stored)?;
        let first_time = stored.time.first().copied().unwrap_or(0.0);
        sqlx::query(
            "INSERT INTO event_page (descriptor, first_index, last_index, first_time, document) \
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(&stored.descriptor)
        .bind(first_index as i64)
        .bind(stored.last_index() as i64)
        .bind(first_time)
        .bind(document)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(first_index)
    }

    pub async fn insert_resource(&self, resource: &Resource) -> Result<()> {
        let document = serde_json::to_string(resource)?;
        sqlx::query("INSERT OR REPLACE INTO resource (uid, run_start, document) VALUES (?, ?, ?)")
            .bind(&resource.uid)
            .bind(&resource.run_start)
            .bind(document)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Append a datum page and index its datum ids for reverse lookup.
    pub async fn append_datum_page(&self, page: &DatumPage) -> Result<u64> {
        page.check()?;
        let mut tx = self.pool.begin().await?;
        let row = sqlx::query("SELECT MAX(last_index) AS last FROM datum_page WHERE resource = ?")
            .bind(&page.resource)
            .fetch_one(&mut *tx)
            .await?;
        let last: Option<i64> = row.try_get("last")?;
        let first_index = last.map_or(0, |l| l + 1) as u64;

        let mut stored = page.clone();
        stored.first_index = first_index;
        let document = serde_json::to_string(&stored)?;
        sqlx::query(
            "INSERT INTO datum_page (resource, first_index, last_index, document) \
             VALUES (?, ?, ?, ?)",
        )
        .bind(&stored.resource)
        .bind(first_index as i64)
        .bind(stored.last_index() as i64)
        .bind(document)
        .execute(&mut *tx)
        .await?;
        for datum_id in &stored.datum_id {
            sqlx::query("INSERT OR REPLACE INTO datum (datum_id, resource) VALUES (?, ?)")
                .bind(datum_id)
                .bind(&stored.resource)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(first_index)
    }

    // -- internals ---------------------------------------------------------

    async fn matching_starts(&self, query: &Query) -> Result<Vec<RunStart>> {
        let rows = sqlx::query("SELECT document FROM run_start ORDER BY time DESC, uid ASC")
            .fetch_all(&self.pool)
            .await?;
        let mut starts = Vec::new();
        for row in rows {
            let document: String = row.try_get("document")?;
            let value: Value = serde_json::from_str(&document)?;
            if query.matches(&value) {
                starts.push(serde_json::from_value(value)?);
            }
        }
        Ok(starts)
    }
}

/// Batched, lazily-driven page cursor: each poll of the stream fetches at
/// most [`PAGE_FETCH_BATCH`] intersecting rows, keyed forward on
/// `first_index`, so abandoning the stream stops all database work.
fn page_stream<P>(
    pool: SqlitePool,
    table: &'static str,
    key_column: &'static str,
    key: String,
    skip: u64,
    limit: Option<u64>,
) -> DocumentStream<P>
where
    P: RecordPage + serde::de::DeserializeOwned,
{
    let end = limit.map(|l| skip.saturating_add(l));
    if end == Some(skip) {
        return stream::empty().boxed();
    }
    let batches = stream::try_unfold(
        (pool, key, None::<u64>),
        move |(pool, key, after)| async move {
            let mut sql = format!(
                "SELECT document FROM {table} WHERE {key_column} = ? AND last_index >= ?"
            );
            if end.is_some() {
                sql.push_str(" AND first_index < ?");
            }
            if after.is_some() {
                sql.push_str(" AND first_index > ?");
            }
            sql.push_str(" ORDER BY first_index ASC LIMIT ?");

            let mut query = sqlx::query(&sql).bind(&key).bind(skip as i64);
            if let Some(end) = end {
                query = query.bind(end as i64);
            }
            if let Some(after) = after {
                query = query.bind(after as i64);
            }
            let rows = query.bind(PAGE_FETCH_BATCH).fetch_all(&pool).await?;

            let mut pages: Vec<P> = Vec::with_capacity(rows.len());
            for row in rows {
                let document: String = row.try_get("document")?;
                pages.push(serde_json::from_str(&document)?);
            }
            match pages.last().map(|p| p.first_index()) {
                Some(high_water) => {
                    Ok::<_, StoreError>(Some((pages, (pool, key, Some(high_water)))))
                }
                None => Ok(None),
            }
        },
    );
    batches
        .map_ok(|pages| stream::iter(pages.into_iter().map(Ok)))
        .try_flatten()
        .boxed()
}

#[async_trait]
impl DocumentStore for SqliteStore {
    async fn list_runs(&self, query: &Query) -> Result<DocumentStream<RunStart>> {
        let starts = self.matching_starts(query).await?;
        Ok(stream::iter(starts.into_iter().map(Ok)).boxed())
    }

    async fn count_runs(&self, query: &Query) -> Result<u64> {
        Ok(self.matching_starts(query).await?.len() as u64)
    }

    async fn get_run_stop(&self, run_uid: &str) -> Result<Option<RunStop>> {
        let row = sqlx::query("SELECT document FROM run_stop WHERE run_start = ?")
            .bind(run_uid)
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => {
                let document: String = row.try_get("document")?;
                Ok(Some(serde_json::from_str(&document)?))
            }
            None => Ok(None),
        }
    }

    async fn get_descriptors(&self, run_uid: &str) -> Result<Vec<Descriptor>> {
        let rows = sqlx::query(
            "SELECT document FROM descriptor WHERE run_start = ? ORDER BY time ASC, uid ASC",
        )
        .bind(run_uid)
        .fetch_all(&self.pool)
        .await?;
        let mut descriptors = Vec::with_capacity(rows.len());
        for row in rows {
            let document: String = row.try_get("document")?;
            descriptors.push(serde_json::from_str(&document)?);
        }
        Ok(descriptors)
    }

    async fn count_events(&self, descriptor_uid: &str) -> Result<u64> {
        let row = sqlx::query(
            "SELECT COALESCE(SUM(last_index - first_index + 1), 0) AS n \
             FROM event_page WHERE descriptor = ?",
        )
        .bind(descriptor_uid)
        .fetch_one(&self.pool)
        .await?;
        let n: i64 = row.try_get("n")?;
        Ok(n as u64)
    }

    async fn get_event_pages(
        &self,
        descriptor_uid: &str,
        skip: u64,
        limit: Option<u64>,
    ) -> Result<DocumentStream<EventPage>> {
        Ok(page_stream(
            self.pool.clone(),
            "event_page",
            "descriptor",
            descriptor_uid.to_string(),
            skip,
            limit,
        ))
    }

    async fn get_resources(&self, run_uid: &str) -> Result<Vec<Resource>> {
        let rows = sqlx::query("SELECT document FROM resource WHERE run_start = ? ORDER BY uid ASC")
            .bind(run_uid)
            .fetch_all(&self.pool)
            .await?;
        let mut resources = Vec::with_capacity(rows.len());
        for row in rows {
            let document: String = row.try_get("document")?;
            resources.push(serde_json::from_str(&document)?);
        }
        Ok(resources)
    }

    async fn get_resource(&self, resource_uid: &str) -> Result<Resource> {
        let row = sqlx::query("SELECT document FROM resource WHERE uid = ?")
            .bind(resource_uid)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| StoreError::not_found("resource", resource_uid))?;
        let document: String = row.try_get("document")?;
        Ok(serde_json::from_str(&document)?)
    }

    async fn lookup_resource_for_datum(&self, datum_id: &str) -> Result<String> {
        let row = sqlx::query("SELECT resource FROM datum WHERE datum_id = ?")
            .bind(datum_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| StoreError::not_found("datum", datum_id))?;
        Ok(row.try_get("resource")?)
    }

    async fn get_datum_pages(
        &self,
        resource_uid: &str,
        skip: u64,
        limit: Option<u64>,
    ) -> Result<DocumentStream<DatumPage>> {
        Ok(page_stream(
            self.pool.clone(),
            "datum_page",
            "resource",
            resource_uid.to_string(),
            skip,
            limit,
        ))
    }
}
