//! In-memory Document Store
//!
//! Holds every document in process memory. This is the backing store for
//! append-log catalogs (which register parsed runs into it conceptually)
//! and the test double for everything above the [`DocumentStore`] trait,
//! the same way an in-memory database stands in for the real one in the
//! backend tests.
//!
//! Registration happens through the inherent `insert_*` / `append_*`
//! methods; pages get contiguous `first_index` values assigned on append,
//! so the contiguity invariant holds by construction.

use std::collections::BTreeMap;

use futures::stream::{self, StreamExt};
use serde_json::Value;
use tokio::sync::RwLock;

use async_trait::async_trait;
use runhouse_core::{
    DatumPage, Descriptor, Document, EventPage, Query, RecordPage, Resource, RunStart, RunStop,
};

use crate::error::{Result, StoreError};
use crate::{DocumentStore, DocumentStream};

#[derive(Default)]
struct Inner {
    /// run uid -> (start, raw start json for query matching, stop)
    runs: BTreeMap<String, RunRecord>,
    /// descriptor uid -> descriptor
    descriptors: BTreeMap<String, Descriptor>,
    /// descriptor uid -> pages, contiguous, ascending first_index
    event_pages: BTreeMap<String, Vec<EventPage>>,
    /// resource uid -> resource
    resources: BTreeMap<String, Resource>,
    /// resource uid -> pages, contiguous, ascending first_index
    datum_pages: BTreeMap<String, Vec<DatumPage>>,
    /// datum id -> resource uid
    datum_to_resource: BTreeMap<String, String>,
}

struct RunRecord {
    start: RunStart,
    start_value: Value,
    stop: Option<RunStop>,
}

/// Everything-in-memory implementation of [`DocumentStore`].
#[derive(Default)]
pub struct MemoryStore {
    inner: RwLock<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a run. Re-inserting the same uid replaces the previous
    /// start document (and clears any recorded stop).
    pub async fn insert_run_start(&self, start: RunStart) -> Result<()> {
        let start_value = serde_json::to_value(&start)?;
        let mut inner = self.inner.write().await;
        inner.runs.insert(
            start.uid.clone(),
            RunRecord {
                start,
                start_value,
                stop: None,
            },
        );
        Ok(())
    }

    /// Attach a stop document to its run.
    pub async fn insert_run_stop(&self, stop: RunStop) -> Result<()> {
        let mut inner = self.inner.write().await;
        let record = inner
            .runs
            .get_mut(&stop.run_start)
            .ok_or_else(|| StoreError::not_found("run", &stop.run_start))?;
        record.stop = Some(stop);
        Ok(())
    }

    pub async fn insert_descriptor(&self, descriptor: Descriptor) -> Result<()> {
        let mut inner = self.inner.write().await;
        if !inner.runs.contains_key(&descriptor.run_start) {
            return Err(StoreError::not_found("run", &descriptor.run_start));
        }
        inner
            .descriptors
            .insert(descriptor.uid.clone(), descriptor);
        Ok(())
    }

    /// Append a page to its descriptor's stream. The page's `first_index`
    /// is assigned here, continuing from the previous page.
    pub async fn append_event_page(&self, mut page: EventPage) -> Result<u64> {
        page.check()?;
        let mut inner = self.inner.write().await;
        let pages = inner.event_pages.entry(page.descriptor.clone()).or_default();
        let first_index = pages.last().map_or(0, |p| p.last_index() + 1);
        page.first_index = first_index;
        pages.push(page);
        Ok(first_index)
    }

    pub async fn insert_resource(&self, resource: Resource) -> Result<()> {
        let mut inner = self.inner.write().await;
        inner.resources.insert(resource.uid.clone(), resource);
        Ok(())
    }

    /// Append a page to its resource's datum stream, indexing each datum id
    /// for reverse lookup.
    pub async fn append_datum_page(&self, mut page: DatumPage) -> Result<u64> {
        page.check()?;
        let mut inner = self.inner.write().await;
        for datum_id in &page.datum_id {
            inner
                .datum_to_resource
                .insert(datum_id.clone(), page.resource.clone());
        }
        let pages = inner.datum_pages.entry(page.resource.clone()).or_default();
        let first_index = pages.last().map_or(0, |p| p.last_index() + 1);
        page.first_index = first_index;
        pages.push(page);
        Ok(first_index)
    }

    /// Register any document; single events and datums become 1-row pages.
    pub async fn insert_document(&self, document: Document) -> Result<()> {
        match document {
            Document::Start(d) => self.insert_run_start(d).await,
            Document::Stop(d) => self.insert_run_stop(d).await,
            Document::Descriptor(d) => self.insert_descriptor(d).await,
            Document::EventPage(d) => self.append_event_page(d).await.map(|_| ()),
            Document::Event(e) => {
                let page = EventPage::from_records(vec![e], 0)?;
                self.append_event_page(page).await.map(|_| ())
            }
            Document::Resource(d) => self.insert_resource(d).await,
            Document::DatumPage(d) => self.append_datum_page(d).await.map(|_| ()),
            Document::Datum(d) => {
                let page = DatumPage::from_records(vec![d], 0)?;
                self.append_datum_page(page).await.map(|_| ())
            }
        }
    }

    async fn matching_starts(&self, query: &Query) -> Vec<RunStart> {
        let inner = self.inner.read().await;
        let mut starts: Vec<RunStart> = inner
            .runs
            .values()
            .filter(|r| query.matches(&r.start_value))
            .map(|r| r.start.clone())
            .collect();
        starts.sort_by(|a, b| b.time.total_cmp(&a.time).then_with(|| a.uid.cmp(&b.uid)));
        starts
    }

    fn sliced_pages<P: RecordPage + Clone>(
        pages: Option<&Vec<P>>,
        skip: u64,
        limit: Option<u64>,
    ) -> Vec<P> {
        let end = limit.map(|l| skip.saturating_add(l));
        if end == Some(skip) {
            return Vec::new();
        }
        let mut selected: Vec<P> = pages
            .map(|pages| {
                pages
                    .iter()
                    .filter(|p| p.overlaps(skip, end))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        // Appends keep these sorted already; re-sorting keeps the contract
        // independent of how the store was populated.
        selected.sort_by_key(|p| p.first_index());
        selected
    }
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn list_runs(&self, query: &Query) -> Result<DocumentStream<RunStart>> {
        let starts = self.matching_starts(query).await;
        Ok(stream::iter(starts.into_iter().map(Ok)).boxed())
    }

    async fn count_runs(&self, query: &Query) -> Result<u64> {
        Ok(self.matching_starts(query).await.len() as u64)
    }

    async fn get_run_stop(&self, run_uid: &str) -> Result<Option<RunStop>> {
        let inner = self.inner.read().await;
        Ok(inner.runs.get(run_uid).and_then(|r| r.stop.clone()))
    }

    async fn get_descriptors(&self, run_uid: &str) -> Result<Vec<Descriptor>> {
        let inner = self.inner.read().await;
        let mut descriptors: Vec<Descriptor> = inner
            .descriptors
            .values()
            .filter(|d| d.run_start == run_uid)
            .cloned()
            .collect();
        descriptors.sort_by(|a, b| a.time.total_cmp(&b.time).then_with(|| a.uid.cmp(&b.uid)));
        Ok(descriptors)
    }

    async fn count_events(&self, descriptor_uid: &str) -> Result<u64> {
        let inner = self.inner.read().await;
        Ok(inner
            .event_pages
            .get(descriptor_uid)
            .map_or(0, |pages| pages.iter().map(|p| p.len() as u64).sum()))
    }

    async fn get_event_pages(
        &self,
        descriptor_uid: &str,
        skip: u64,
        limit: Option<u64>,
    ) -> Result<DocumentStream<EventPage>> {
        let inner = self.inner.read().await;
        let pages = Self::sliced_pages(inner.event_pages.get(descriptor_uid), skip, limit);
        Ok(stream::iter(pages.into_iter().map(Ok)).boxed())
    }

    async fn get_resources(&self, run_uid: &str) -> Result<Vec<Resource>> {
        let inner = self.inner.read().await;
        Ok(inner
            .resources
            .values()
            .filter(|r| r.run_start == run_uid)
            .cloned()
            .collect())
    }

    async fn get_resource(&self, resource_uid: &str) -> Result<Resource> {
        let inner = self.inner.read().await;
        inner
            .resources
            .get(resource_uid)
            .cloned()
            .ok_or_else(|| StoreError::not_found("resource", resource_uid))
    }

    async fn lookup_resource_for_datum(&self, datum_id: &str) -> Result<String> {
        let inner = self.inner.read().await;
        inner
            .datum_to_resource
            .get(datum_id)
            .cloned()
            .ok_or_else(|| StoreError::not_found("datum", datum_id))
    }

    async fn get_datum_pages(
        &self,
        resource_uid: &str,
        skip: u64,
        limit: Option<u64>,
    ) -> Result<DocumentStream<DatumPage>> {
        let inner = self.inner.read().await;
        let pages = Self::sliced_pages(inner.datum_pages.get(resource_uid), skip, limit);
        Ok(stream::iter(pages.into_iter().map(Ok)).boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::TryStreamExt;
    use runhouse_core::Event;
    use serde_json::json;

    fn start(uid: &str, time: f64, scan_id: i64) -> RunStart {
        RunStart {
            uid: uid.to_string(),
            time,
            scan_id: Some(scan_id),
            extra: serde_json::Map::from_iter([("plan_name".to_string(), json!("count"))]),
        }
    }

    fn event(descriptor: &str, seq_num: u64, time: f64) -> Event {
        Event {
            uid: format!("{descriptor}-ev{seq_num}"),
            descriptor: descriptor.to_string(),
            seq_num,
            time,
            data: BTreeMap::from([("x".to_string(), json!(seq_num))]),
            timestamps: BTreeMap::from([("x".to_string(), json!(time))]),
            filled: BTreeMap::new(),
        }
    }

    async fn store_with_runs() -> MemoryStore {
        let store = MemoryStore::new();
        store.insert_run_start(start("run-a", 1.0, 1)).await.unwrap();
        store.insert_run_start(start("run-b", 2.0, 2)).await.unwrap();
        store.insert_run_start(start("run-c", 3.0, 2)).await.unwrap();
        store
    }

    #[tokio::test]
    async fn runs_enumerate_most_recent_first() {
        let store = store_with_runs().await;
        let uids: Vec<String> = store
            .list_runs(&Query::All)
            .await
            .unwrap()
            .map_ok(|s| s.uid)
            .try_collect()
            .await
            .unwrap();
        assert_eq!(uids, vec!["run-c", "run-b", "run-a"]);
        assert_eq!(store.count_runs(&Query::All).await.unwrap(), 3);
    }

    #[tokio::test]
    async fn query_scopes_enumeration() {
        let store = store_with_runs().await;
        let query = Query::eq("scan_id", 2);
        let uids: Vec<String> = store
            .list_runs(&query)
            .await
            .unwrap()
            .map_ok(|s| s.uid)
            .try_collect()
            .await
            .unwrap();
        assert_eq!(uids, vec!["run-c", "run-b"]);
        assert_eq!(store.count_runs(&query).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn stop_requires_a_registered_run() {
        let store = store_with_runs().await;
        let stop = RunStop {
            uid: "stop-1".to_string(),
            run_start: "missing".to_string(),
            time: 9.0,
            exit_status: Some("success".to_string()),
            extra: Default::default(),
        };
        assert!(matches!(
            store.insert_run_stop(stop).await,
            Err(StoreError::NotFound { kind: "run", .. })
        ));
        assert_eq!(store.get_run_stop("run-a").await.unwrap(), None);
    }

    #[tokio::test]
    async fn event_pages_get_contiguous_indices_and_range_queries_clip() {
        let store = store_with_runs().await;
        store
            .insert_descriptor(Descriptor {
                uid: "d1".to_string(),
                run_start: "run-a".to_string(),
                time: 1.0,
                name: Some("primary".to_string()),
                data_keys: BTreeMap::new(),
                extra: Default::default(),
            })
            .await
            .unwrap();

        // Three pages of 3, 3, 2 events covering indices [0, 8).
        for chunk in [0u64..3, 3..6, 6..8] {
            let events: Vec<Event> = chunk.map(|i| event("d1", i + 1, i as f64)).collect();
            let page = EventPage::from_records(events, 0).unwrap();
            store.append_event_page(page).await.unwrap();
        }
        assert_eq!(store.count_events("d1").await.unwrap(), 8);

        let pages: Vec<EventPage> = store
            .get_event_pages("d1", 4, Some(3))
            .await
            .unwrap()
            .try_collect()
            .await
            .unwrap();
        // [4, 7) touches the second and third pages only.
        assert_eq!(
            pages.iter().map(|p| p.first_index()).collect::<Vec<_>>(),
            vec![3, 6]
        );

        let none: Vec<EventPage> = store
            .get_event_pages("d1", 100, None)
            .await
            .unwrap()
            .try_collect()
            .await
            .unwrap();
        assert!(none.is_empty());

        let zero: Vec<EventPage> = store
            .get_event_pages("d1", 0, Some(0))
            .await
            .unwrap()
            .try_collect()
            .await
            .unwrap();
        assert!(zero.is_empty());
    }

    #[tokio::test]
    async fn datum_ids_resolve_to_their_resource() {
        let store = store_with_runs().await;
        store
            .insert_resource(Resource {
                uid: "res-1".to_string(),
                run_start: "run-a".to_string(),
                spec: "AD_HDF5".to_string(),
                root: "/data".to_string(),
                resource_path: "2026/img.h5".to_string(),
                resource_kwargs: Default::default(),
                extra: Default::default(),
            })
            .await
            .unwrap();
        let page = DatumPage {
            resource: "res-1".to_string(),
            first_index: 0,
            datum_id: vec!["res-1/0".to_string(), "res-1/1".to_string()],
            datum_kwargs: BTreeMap::from([("frame".to_string(), vec![json!(0), json!(1)])]),
        };
        store.append_datum_page(page).await.unwrap();

        assert_eq!(
            store.lookup_resource_for_datum("res-1/1").await.unwrap(),
            "res-1"
        );
        assert!(matches!(
            store.lookup_resource_for_datum("res-9/0").await,
            Err(StoreError::NotFound { kind: "datum", .. })
        ));
        assert_eq!(store.get_resource("res-1").await.unwrap().spec, "AD_HDF5");
        assert_eq!(store.get_resources("run-a").await.unwrap().len(), 1);
    }
}
