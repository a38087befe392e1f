//! JSONL Append-log Document Store
//!
//! Backs a catalog with newline-delimited JSON files. Each line of a file
//! is a two-element array `[kind, body]`; lines appear in non-decreasing
//! time order, one run per file, and a completed file ends with its stop
//! document.
//!
//! ## Incremental Re-indexing
//!
//! Files are produced by live acquisition, so the store re-indexes on use
//! instead of once at startup. [`JsonlStore::scan`] expands the configured
//! path patterns and compares each file's modification time against the
//! one recorded at the previous scan:
//!
//! - **Unchanged file**: skipped entirely. The only I/O is the stat call.
//! - **Changed or new file**: re-registered from scratch. Registration
//!   reads the *first* line (the start document) and the *last* line (the
//!   stop document, if the run finished) - never the middle of the file.
//!   The new registration fully replaces the old one for that file.
//! - **Empty or truncated first line**: indistinguishable from a file that
//!   is being written right now; the file is skipped silently and picked
//!   up once its mtime advances again.
//!
//! The mtime table is owned by this store instance and written only by
//! `scan`. Run enumeration triggers a scan, so a catalog over this store
//! stays current at the cost of one stat per file.
//!
//! ## Lazy Reads
//!
//! Descriptor, event, and datum reads stream the owning file line by line
//! on demand. Raw `event` lines are rebatched into pages of
//! `page_size` rows (so the paging contract is uniform across backends);
//! `event_page` lines pass through row-by-row into the same rebatching, so
//! mixed files work. Dropping a stream closes its file handle.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use futures::stream::{self, BoxStream, StreamExt, TryStreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncSeekExt, BufReader};
use tokio::sync::RwLock;

use async_trait::async_trait;
use runhouse_core::{
    repack, DatumPage, Descriptor, Document, Event, EventPage, Query, RecordPage, Resource,
    RunStart, RunStop, DEFAULT_PAGE_SIZE,
};

use crate::error::{Result, StoreError};
use crate::{DocumentStore, DocumentStream};

/// How far back from the end of a file the stop-document probe reads. A
/// stop document larger than this is treated as "run still in progress"
/// rather than scanning the file's middle.
const TAIL_PROBE_BYTES: u64 = 64 * 1024;

/// Configuration for a [`JsonlStore`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonlConfig {
    /// Glob patterns naming the run log files (e.g. `"/data/*.jsonl"`).
    pub paths: Vec<String>,

    /// Rows per page when rebatching raw event/datum lines (default: 2500)
    #[serde(default = "default_page_size")]
    pub page_size: usize,
}

fn default_page_size() -> usize {
    DEFAULT_PAGE_SIZE
}

impl JsonlConfig {
    pub fn new(paths: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            paths: paths.into_iter().map(Into::into).collect(),
            page_size: default_page_size(),
        }
    }
}

/// One registered run log.
struct RunSource {
    path: PathBuf,
    start: RunStart,
    start_value: Value,
    stop: Option<RunStop>,
}

/// Lazily built reverse indexes over the registered files, invalidated
/// whenever a scan re-registers anything.
#[derive(Default, Clone)]
struct AssetIndex {
    descriptor_files: HashMap<String, PathBuf>,
    resource_files: HashMap<String, PathBuf>,
    datum_to_resource: HashMap<String, String>,
}

#[derive(Default)]
struct ScanState {
    mtimes: HashMap<PathBuf, SystemTime>,
    runs: HashMap<String, RunSource>,
    uid_by_path: HashMap<PathBuf, String>,
    assets: Option<AssetIndex>,
}

/// Append-log implementation of [`DocumentStore`].
pub struct JsonlStore {
    config: JsonlConfig,
    state: RwLock<ScanState>,
}

impl JsonlStore {
    /// Open a store over the configured path patterns and run the first
    /// scan.
    pub async fn open(config: JsonlConfig) -> Result<Self> {
        let store = Self {
            config,
            state: RwLock::new(ScanState::default()),
        };
        store.scan().await?;
        Ok(store)
    }

    /// Re-index: stat every matching file and re-register the changed ones.
    pub async fn scan(&self) -> Result<()> {
        let mut state = self.state.write().await;
        for pattern in &self.config.paths {
            let matches = glob::glob(pattern).map_err(|e| {
                StoreError::Misconfigured(format!("bad path pattern {pattern:?}: {e}"))
            })?;
            for entry in matches {
                let path = entry.map_err(|e| StoreError::Io(e.into_error()))?;
                let mtime = tokio::fs::metadata(&path).await?.modified()?;
                if state.mtimes.get(&path) == Some(&mtime) {
                    continue;
                }
                state.mtimes.insert(path.clone(), mtime);
                match register_file(&path).await? {
                    Some(source) => {
                        tracing::debug!(
                            path = %path.display(),
                            uid = %source.start.uid,
                            finished = source.stop.is_some(),
                            "registered run log"
                        );
                        if let Some(old_uid) = state.uid_by_path.remove(&path) {
                            state.runs.remove(&old_uid);
                        }
                        state.uid_by_path.insert(path.clone(), source.start.uid.clone());
                        state.runs.insert(source.start.uid.clone(), source);
                        state.assets = None;
                    }
                    None => {
                        tracing::debug!(
                            path = %path.display(),
                            "skipping empty run log (possibly mid-write)"
                        );
                    }
                }
            }
        }
        Ok(())
    }

    async fn run_path(&self, run_uid: &str) -> Result<PathBuf> {
        let state = self.state.read().await;
        state
            .runs
            .get(run_uid)
            .map(|source| source.path.clone())
            .ok_or_else(|| StoreError::not_found("run", run_uid))
    }

    /// The lazily built reverse indexes; a full read of every registered
    /// file the first time an asset lookup needs them, cached afterwards.
    async fn asset_index(&self) -> Result<AssetIndex> {
        {
            let state = self.state.read().await;
            if let Some(index) = &state.assets {
                return Ok(index.clone());
            }
        }
        let files: Vec<PathBuf> = {
            let state = self.state.read().await;
            state.runs.values().map(|source| source.path.clone()).collect()
        };
        tracing::debug!(files = files.len(), "building asset index");
        let mut index = AssetIndex::default();
        for path in files {
            let mut documents = file_documents(path.clone());
            while let Some(document) = documents.try_next().await? {
                match document {
                    Document::Descriptor(d) => {
                        index.descriptor_files.insert(d.uid, path.clone());
                    }
                    Document::Resource(r) => {
                        index.resource_files.insert(r.uid, path.clone());
                    }
                    Document::Datum(d) => {
                        index.datum_to_resource.insert(d.datum_id, d.resource);
                    }
                    Document::DatumPage(p) => {
                        for datum_id in &p.datum_id {
                            index
                                .datum_to_resource
                                .insert(datum_id.clone(), p.resource.clone());
                        }
                    }
                    _ => {}
                }
            }
        }
        let mut state = self.state.write().await;
        state.assets = Some(index.clone());
        Ok(index)
    }
}

/// Read the first and last lines of a run log; `None` means the file looks
/// like it is still being written and should be skipped for now.
async fn register_file(path: &Path) -> Result<Option<RunSource>> {
    let file = File::open(path).await?;
    let mut reader = BufReader::new(file);
    let mut first = String::new();
    reader.read_line(&mut first).await?;

    let document = match Document::from_line(first.trim()) {
        Ok(document) => document,
        Err(parse_error) => {
            if first.trim().is_empty() {
                return Ok(None);
            }
            // An unparseable first line with nothing after it is a write in
            // progress; with more lines behind it, the file is just bad.
            let mut second = String::new();
            reader.read_line(&mut second).await?;
            if second.is_empty() {
                return Ok(None);
            }
            return Err(parse_error.into());
        }
    };
    let start = match document {
        Document::Start(start) => start,
        other => {
            return Err(runhouse_core::Error::MalformedRecord(format!(
                "run log {} begins with a {:?} document, expected start",
                path.display(),
                other.kind()
            ))
            .into())
        }
    };

    let stop = match read_last_line(path).await? {
        Some(line) => match Document::from_line(&line) {
            Ok(Document::Stop(stop)) => Some(stop),
            Ok(_) => None,
            // A torn trailing line is an append in progress; the run simply
            // has no stop yet.
            Err(_) => None,
        },
        None => None,
    };

    let start_value = serde_json::to_value(&start)?;
    Ok(Some(RunSource {
        path: path.to_path_buf(),
        start,
        start_value,
        stop,
    }))
}

/// Last non-empty line of the file, read from a bounded tail probe.
async fn read_last_line(path: &Path) -> Result<Option<String>> {
    let mut file = File::open(path).await?;
    let len = file.metadata().await?.len();
    let offset = len.saturating_sub(TAIL_PROBE_BYTES);
    file.seek(std::io::SeekFrom::Start(offset)).await?;
    let mut tail = Vec::with_capacity((len - offset) as usize);
    file.read_to_end(&mut tail).await?;
    let text = String::from_utf8_lossy(&tail);
    Ok(text
        .lines()
        .rev()
        .find(|line| !line.trim().is_empty())
        .map(|line| line.to_string()))
}

/// Stream a file's documents line by line. The file is opened on first
/// poll and closed when the stream is dropped.
fn file_documents(path: PathBuf) -> DocumentStream<Document> {
    enum Lines {
        Pending(PathBuf),
        Open(tokio::io::Lines<BufReader<File>>),
    }
    stream::try_unfold(Lines::Pending(path), |source| async move {
        let mut lines = match source {
            Lines::Pending(path) => BufReader::new(File::open(&path).await?).lines(),
            Lines::Open(lines) => lines,
        };
        loop {
            match lines.next_line().await? {
                Some(line) => {
                    if line.trim().is_empty() {
                        continue;
                    }
                    let document = Document::from_line(&line).map_err(StoreError::from)?;
                    return Ok(Some((document, Lines::Open(lines))));
                }
                None => return Ok(None),
            }
        }
    })
    .boxed()
}

/// Events for one descriptor, in file order: raw `event` lines directly,
/// `event_page` lines unpacked row by row.
fn descriptor_events(path: PathBuf, descriptor_uid: String) -> DocumentStream<Event> {
    file_documents(path)
        .map(move |document| -> Result<BoxStream<'static, Result<Event>>> {
            match document? {
                Document::Event(event) if event.descriptor == descriptor_uid => {
                    Ok(stream::once(async move { Ok(event) }).boxed())
                }
                Document::EventPage(page) if page.descriptor == descriptor_uid => {
                    let rows = page.rows().map_err(StoreError::from)?;
                    Ok(stream::iter(rows.map(Ok)).boxed())
                }
                _ => Ok(stream::empty().boxed()),
            }
        })
        .try_flatten()
        .boxed()
}

/// Datums for one resource, in file order.
fn resource_datums(
    path: PathBuf,
    resource_uid: String,
) -> DocumentStream<runhouse_core::Datum> {
    file_documents(path)
        .map(move |document| -> Result<BoxStream<'static, Result<runhouse_core::Datum>>> {
            match document? {
                Document::Datum(datum) if datum.resource == resource_uid => {
                    Ok(stream::once(async move { Ok(datum) }).boxed())
                }
                Document::DatumPage(page) if page.resource == resource_uid => {
                    let rows = page.rows().map_err(StoreError::from)?;
                    Ok(stream::iter(rows.map(Ok)).boxed())
                }
                _ => Ok(stream::empty().boxed()),
            }
        })
        .try_flatten()
        .boxed()
}

/// Drop pages outside `[skip, skip + limit)` and stop reading once past
/// the end of the slice.
fn clip_pages<P: RecordPage>(
    pages: DocumentStream<P>,
    skip: u64,
    limit: Option<u64>,
) -> DocumentStream<P> {
    let end = limit.map(|l| skip.saturating_add(l));
    if end == Some(skip) {
        return stream::empty().boxed();
    }
    pages
        .try_take_while(move |page| {
            futures::future::ready(Ok(end.is_none_or(|e| page.first_index() < e)))
        })
        .try_filter(move |page| futures::future::ready(page.last_index() >= skip))
        .boxed()
}

#[async_trait]
impl DocumentStore for JsonlStore {
    async fn list_runs(&self, query: &Query) -> Result<DocumentStream<RunStart>> {
        self.scan().await?;
        let state = self.state.read().await;
        let mut starts: Vec<RunStart> = state
            .runs
            .values()
            .filter(|source| query.matches(&source.start_value))
            .map(|source| source.start.clone())
            .collect();
        starts.sort_by(|a, b| b.time.total_cmp(&a.time).then_with(|| a.uid.cmp(&b.uid)));
        Ok(stream::iter(starts.into_iter().map(Ok)).boxed())
    }

    async fn count_runs(&self, query: &Query) -> Result<u64> {
        self.scan().await?;
        let state = self.state.read().await;
        Ok(state
            .runs
            .values()
            .filter(|source| query.matches(&source.start_value))
            .count() as u64)
    }

    async fn get_run_stop(&self, run_uid: &str) -> Result<Option<RunStop>> {
        let state = self.state.read().await;
        Ok(state.runs.get(run_uid).and_then(|source| source.stop.clone()))
    }

    async fn get_descriptors(&self, run_uid: &str) -> Result<Vec<Descriptor>> {
        let path = self.run_path(run_uid).await?;
        let mut descriptors: Vec<Descriptor> = file_documents(path)
            .try_filter_map(|document| {
                futures::future::ready(Ok(match document {
                    Document::Descriptor(d) => Some(d),
                    _ => None,
                }))
            })
            .try_collect()
            .await?;
        descriptors.sort_by(|a, b| a.time.total_cmp(&b.time).then_with(|| a.uid.cmp(&b.uid)));
        Ok(descriptors)
    }

    async fn count_events(&self, descriptor_uid: &str) -> Result<u64> {
        let index = self.asset_index().await?;
        let path = index
            .descriptor_files
            .get(descriptor_uid)
            .ok_or_else(|| StoreError::not_found("descriptor", descriptor_uid))?;
        descriptor_events(path.clone(), descriptor_uid.to_string())
            .try_fold(0u64, |count, _| futures::future::ready(Ok(count + 1)))
            .await
    }

    async fn get_event_pages(
        &self,
        descriptor_uid: &str,
        skip: u64,
        limit: Option<u64>,
    ) -> Result<DocumentStream<EventPage>> {
        let index = self.asset_index().await?;
        let path = index
            .descriptor_files
            .get(descriptor_uid)
            .ok_or_else(|| StoreError::not_found("descriptor", descriptor_uid))?;
        let events = descriptor_events(path.clone(), descriptor_uid.to_string());
        let pages = repack::<EventPage, StoreError>(events, self.config.page_size, 0);
        Ok(clip_pages(pages, skip, limit))
    }

    async fn get_resources(&self, run_uid: &str) -> Result<Vec<Resource>> {
        let path = self.run_path(run_uid).await?;
        file_documents(path)
            .try_filter_map(|document| {
                futures::future::ready(Ok(match document {
                    Document::Resource(r) => Some(r),
                    _ => None,
                }))
            })
            .try_collect()
            .await
    }

    async fn get_resource(&self, resource_uid: &str) -> Result<Resource> {
        let index = self.asset_index().await?;
        let path = index
            .resource_files
            .get(resource_uid)
            .ok_or_else(|| StoreError::not_found("resource", resource_uid))?;
        let mut documents = file_documents(path.clone());
        while let Some(document) = documents.try_next().await? {
            if let Document::Resource(resource) = document {
                if resource.uid == resource_uid {
                    return Ok(resource);
                }
            }
        }
        Err(StoreError::not_found("resource", resource_uid))
    }

    async fn lookup_resource_for_datum(&self, datum_id: &str) -> Result<String> {
        let index = self.asset_index().await?;
        index
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
        let index = self.asset_index().await?;
        let path = index
            .resource_files
            .get(resource_uid)
            .ok_or_else(|| StoreError::not_found("resource", resource_uid))?;
        let datums = resource_datums(path.clone(), resource_uid.to_string());
        let pages = repack::<DatumPage, StoreError>(datums, self.config.page_size, 0);
        Ok(clip_pages(pages, skip, limit))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::io::Write;
    use std::time::Duration;

    fn write_run_log(path: &Path, uid: &str, with_stop: bool) {
        let mut file = std::fs::File::create(path).unwrap();
        let lines = [
            json!(["start", {"uid": uid, "time": 1.0, "scan_id": 5, "plan_name": "count"}]),
            json!(["descriptor", {
                "uid": format!("{uid}-d1"), "run_start": uid, "time": 1.5,
                "name": "primary",
                "data_keys": {"x": {"dtype": "number"}}
            }]),
            json!(["event", {
                "uid": format!("{uid}-e1"), "descriptor": format!("{uid}-d1"),
                "seq_num": 1, "time": 2.0,
                "data": {"x": 10}, "timestamps": {"x": 2.0}
            }]),
            json!(["event", {
                "uid": format!("{uid}-e2"), "descriptor": format!("{uid}-d1"),
                "seq_num": 2, "time": 3.0,
                "data": {"x": 20}, "timestamps": {"x": 3.0}
            }]),
        ];
        for line in &lines {
            writeln!(file, "{line}").unwrap();
        }
        if with_stop {
            writeln!(
                file,
                "{}",
                json!(["stop", {
                    "uid": format!("{uid}-stop"), "run_start": uid, "time": 4.0,
                    "exit_status": "success"
                }])
            )
            .unwrap();
        }
    }

    fn pattern_for(dir: &Path) -> String {
        dir.join("*.jsonl").display().to_string()
    }

    #[tokio::test]
    async fn registers_runs_and_serves_documents() {
        let dir = tempfile::tempdir().unwrap();
        write_run_log(&dir.path().join("a.jsonl"), "run-a", true);

        let store = JsonlStore::open(JsonlConfig::new([pattern_for(dir.path())]))
            .await
            .unwrap();
        assert_eq!(store.count_runs(&Query::All).await.unwrap(), 1);
        let stop = store.get_run_stop("run-a").await.unwrap().unwrap();
        assert_eq!(stop.exit_status.as_deref(), Some("success"));

        let descriptors = store.get_descriptors("run-a").await.unwrap();
        assert_eq!(descriptors.len(), 1);
        assert_eq!(descriptors[0].uid, "run-a-d1");

        assert_eq!(store.count_events("run-a-d1").await.unwrap(), 2);
        let pages: Vec<EventPage> = store
            .get_event_pages("run-a-d1", 0, None)
            .await
            .unwrap()
            .try_collect()
            .await
            .unwrap();
        assert_eq!(pages.len(), 1);
        assert_eq!(pages[0].len(), 2);
        assert_eq!(pages[0].time, vec![2.0, 3.0]);
    }

    #[tokio::test]
    async fn unfinished_runs_have_no_stop() {
        let dir = tempfile::tempdir().unwrap();
        write_run_log(&dir.path().join("a.jsonl"), "run-a", false);
        let store = JsonlStore::open(JsonlConfig::new([pattern_for(dir.path())]))
            .await
            .unwrap();
        assert_eq!(store.get_run_stop("run-a").await.unwrap(), None);
    }

    #[tokio::test]
    async fn empty_files_are_skipped_silently() {
        let dir = tempfile::tempdir().unwrap();
        write_run_log(&dir.path().join("a.jsonl"), "run-a", true);
        std::fs::File::create(dir.path().join("empty.jsonl")).unwrap();

        let store = JsonlStore::open(JsonlConfig::new([pattern_for(dir.path())]))
            .await
            .unwrap();
        assert_eq!(store.count_runs(&Query::All).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn unchanged_files_are_not_reread() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.jsonl");
        write_run_log(&path, "run-a", true);
        let store = JsonlStore::open(JsonlConfig::new([pattern_for(dir.path())]))
            .await
            .unwrap();
        let mtime = std::fs::metadata(&path).unwrap().modified().unwrap();

        // Rewrite the file under a different uid but pin the mtime back:
        // the scan must trust the mtime and keep the stale registration,
        // proving it never opened the file.
        write_run_log(&path, "run-b", true);
        let file = std::fs::File::options().write(true).open(&path).unwrap();
        file.set_modified(mtime).unwrap();
        store.scan().await.unwrap();
        assert!(store.get_run_stop("run-a").await.unwrap().is_some());
        assert_eq!(store.count_runs(&Query::All).await.unwrap(), 1);

        // Advance the mtime: the registration is fully replaced.
        file.set_modified(mtime + Duration::from_secs(30)).unwrap();
        store.scan().await.unwrap();
        let uids: Vec<String> = store
            .list_runs(&Query::All)
            .await
            .unwrap()
            .map_ok(|s| s.uid)
            .try_collect()
            .await
            .unwrap();
        assert_eq!(uids, vec!["run-b"]);
        assert!(store.get_run_stop("run-a").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn event_pages_clip_to_the_requested_slice() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.jsonl");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(
            file,
            "{}",
            json!(["start", {"uid": "run-a", "time": 0.0, "scan_id": 1}])
        )
        .unwrap();
        writeln!(
            file,
            "{}",
            json!(["descriptor", {
                "uid": "d1", "run_start": "run-a", "time": 0.1,
                "data_keys": {"x": {"dtype": "number"}}
            }])
        )
        .unwrap();
        for i in 0..10 {
            writeln!(
                file,
                "{}",
                json!(["event", {
                    "uid": format!("e{i}"), "descriptor": "d1",
                    "seq_num": i + 1, "time": i as f64,
                    "data": {"x": i}, "timestamps": {"x": i as f64}
                }])
            )
            .unwrap();
        }
        drop(file);

        let mut config = JsonlConfig::new([pattern_for(dir.path())]);
        config.page_size = 4; // pages cover [0,4), [4,8), [8,10)
        let store = JsonlStore::open(config).await.unwrap();

        let pages: Vec<EventPage> = store
            .get_event_pages("d1", 5, Some(3))
            .await
            .unwrap()
            .try_collect()
            .await
            .unwrap();
        assert_eq!(
            pages.iter().map(|p| p.first_index()).collect::<Vec<_>>(),
            vec![4]
        );

        let tail: Vec<EventPage> = store
            .get_event_pages("d1", 7, None)
            .await
            .unwrap()
            .try_collect()
            .await
            .unwrap();
        assert_eq!(
            tail.iter().map(|p| p.first_index()).collect::<Vec<_>>(),
            vec![4, 8]
        );
    }
}
