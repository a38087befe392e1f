//! Run Handles
//!
//! A [`RunEntry`] is what a catalog lookup returns: the run's start and
//! stop documents plus a handle back into the store for everything the
//! run owns. Record streams are lazy; nothing is read until a stream is
//! consumed, and a request that spans several descriptors is served by
//! merging their per-descriptor cursors into one time-ordered stream.

use std::collections::BTreeSet;
use std::sync::Arc;

use futures::stream::{self, BoxStream, StreamExt, TryStreamExt};

use runhouse_core::{
    merge_by_time, repack, Datum, DatumPage, Descriptor, Document, Event, EventPage, Resource,
    RunStart, RunStop,
};
use runhouse_store::{DocumentStore, StoreError};

use crate::cursor::flatten_sliced;
use crate::error::Result;

/// A record stream whose errors surface where they occur.
pub type RecordStream<T> = BoxStream<'static, Result<T>>;

/// One run, resolved from a catalog.
#[derive(Clone)]
pub struct RunEntry {
    store: Arc<dyn DocumentStore>,
    start: RunStart,
    stop: Option<RunStop>,
}

impl std::fmt::Debug for RunEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunEntry")
            .field("start", &self.start)
            .field("stop", &self.stop)
            .finish_non_exhaustive()
    }
}

impl RunEntry {
    pub(crate) async fn load(store: Arc<dyn DocumentStore>, start: RunStart) -> Result<Self> {
        let stop = store.get_run_stop(&start.uid).await?;
        Ok(Self { store, start, stop })
    }

    pub fn uid(&self) -> &str {
        &self.start.uid
    }

    pub fn scan_id(&self) -> Option<i64> {
        self.start.scan_id
    }

    pub fn start(&self) -> &RunStart {
        &self.start
    }

    /// The stop document captured at lookup time; `None` while the run is
    /// in progress.
    pub fn stop(&self) -> Option<&RunStop> {
        self.stop.as_ref()
    }

    /// This run's descriptors, creation order.
    pub async fn descriptors(&self) -> Result<Vec<Descriptor>> {
        Ok(self.store.get_descriptors(&self.start.uid).await?)
    }

    async fn descriptor(&self, descriptor_uid: &str) -> Result<Descriptor> {
        self.descriptors()
            .await?
            .into_iter()
            .find(|d| d.uid == descriptor_uid)
            .ok_or_else(|| StoreError::NotFound {
                kind: "descriptor",
                id: descriptor_uid.to_string(),
            }.into())
    }

    pub async fn event_count(&self, descriptor_uid: &str) -> Result<u64> {
        Ok(self.store.count_events(descriptor_uid).await?)
    }

    /// Stored event pages for one descriptor, restricted to the pages
    /// intersecting `[skip, skip + limit)`.
    pub async fn event_pages(
        &self,
        descriptor_uid: &str,
        skip: u64,
        limit: Option<u64>,
    ) -> Result<RecordStream<EventPage>> {
        let pages = self.store.get_event_pages(descriptor_uid, skip, limit).await?;
        Ok(pages.err_into().boxed())
    }

    /// The `skip`-th through `skip + limit - 1`-th events of one
    /// descriptor's stream, 0-indexed globally across pages. External
    /// fields the log has not resolved are reported `filled: false`.
    pub async fn events(
        &self,
        descriptor_uid: &str,
        skip: u64,
        limit: Option<u64>,
    ) -> Result<RecordStream<Event>> {
        let descriptor = self.descriptor(descriptor_uid).await?;
        let external: BTreeSet<String> = descriptor.external_keys().into_iter().collect();
        let pages = self.store.get_event_pages(descriptor_uid, skip, limit).await?;
        let records = flatten_sliced(pages, skip, limit);
        Ok(records
            .map_ok(move |mut event| {
                for key in &external {
                    event.filled.entry(key.clone()).or_insert(false);
                }
                event
            })
            .err_into()
            .boxed())
    }

    /// Every event of the run, across all descriptors, in one ascending
    /// time order (ties break by descriptor order).
    pub async fn all_events(&self) -> Result<RecordStream<Event>> {
        let descriptors = self.descriptors().await?;
        let mut sources = Vec::with_capacity(descriptors.len());
        for descriptor in &descriptors {
            sources.push(self.events(&descriptor.uid, 0, None).await?);
        }
        Ok(merge_by_time(sources))
    }

    /// Every stored event page of the run, across all descriptors, ordered
    /// by each page's first timestamp. Pages stay single-descriptor; rows
    /// within a page are already time-sorted.
    pub async fn all_event_pages(&self) -> Result<RecordStream<EventPage>> {
        let descriptors = self.descriptors().await?;
        let mut sources = Vec::with_capacity(descriptors.len());
        for descriptor in &descriptors {
            sources.push(self.event_pages(&descriptor.uid, 0, None).await?);
        }
        Ok(merge_by_time(sources))
    }

    /// One descriptor's events, rebatched into pages of `page_size` for
    /// consumers that want pages at a size the store does not keep.
    pub async fn rebatched_event_pages(
        &self,
        descriptor_uid: &str,
        page_size: usize,
    ) -> Result<RecordStream<EventPage>> {
        let events = self.events(descriptor_uid, 0, None).await?;
        Ok(repack::<EventPage, crate::error::CatalogError>(
            events, page_size, 0,
        ))
    }

    /// This run's resources, registration order.
    pub async fn resources(&self) -> Result<Vec<Resource>> {
        Ok(self.store.get_resources(&self.start.uid).await?)
    }

    pub async fn resource(&self, resource_uid: &str) -> Result<Resource> {
        Ok(self.store.get_resource(resource_uid).await?)
    }

    /// Which resource a datum id belongs to.
    pub async fn lookup_resource_for_datum(&self, datum_id: &str) -> Result<String> {
        Ok(self.store.lookup_resource_for_datum(datum_id).await?)
    }

    pub async fn datum_pages(
        &self,
        resource_uid: &str,
        skip: u64,
        limit: Option<u64>,
    ) -> Result<RecordStream<DatumPage>> {
        let pages = self.store.get_datum_pages(resource_uid, skip, limit).await?;
        Ok(pages.err_into().boxed())
    }

    /// The `skip`-th through `skip + limit - 1`-th datums of one
    /// resource's stream.
    pub async fn datums(
        &self,
        resource_uid: &str,
        skip: u64,
        limit: Option<u64>,
    ) -> Result<RecordStream<Datum>> {
        let pages = self.store.get_datum_pages(resource_uid, skip, limit).await?;
        Ok(flatten_sliced(pages, skip, limit).err_into().boxed())
    }

    /// The run as one ordered document stream, mirroring the append-log
    /// line order: start, descriptors, resources, datum pages, event pages
    /// merged across descriptors by time, and the stop document last (when
    /// the run has one).
    pub async fn documents(&self) -> Result<RecordStream<Document>> {
        let mut head: Vec<Result<Document>> = vec![Ok(Document::Start(self.start.clone()))];
        for descriptor in self.descriptors().await? {
            head.push(Ok(Document::Descriptor(descriptor)));
        }
        let resources = self.resources().await?;
        let mut datum_sources: Vec<RecordStream<Document>> = Vec::with_capacity(resources.len());
        for resource in &resources {
            let pages = self.datum_pages(&resource.uid, 0, None).await?;
            datum_sources.push(pages.map_ok(Document::DatumPage).boxed());
            head.push(Ok(Document::Resource(resource.clone())));
        }
        let event_pages = self.all_event_pages().await?.map_ok(Document::EventPage);
        let tail: Vec<Result<Document>> = self
            .stop
            .iter()
            .map(|stop| Ok(Document::Stop(stop.clone())))
            .collect();

        Ok(stream::iter(head)
            .chain(stream::iter(datum_sources).flatten())
            .chain(event_pages)
            .chain(stream::iter(tail))
            .boxed())
    }
}
