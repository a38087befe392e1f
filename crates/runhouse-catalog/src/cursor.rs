//! Page-backed Record Cursors
//!
//! Storage hands back pages; callers want the `skip`-th through
//! `skip + limit - 1`-th *records* of the logical stream, 0-indexed
//! globally across all pages. This module flattens an intersecting page
//! stream into exactly that slice.
//!
//! ## Index Accounting
//!
//! The backend only returns pages whose declared range intersects the
//! slice, so the first page we see generally starts *before* `skip`. The
//! cursor seeds a running global offset from that first page's declared
//! `first_index` and accumulates it across pages
//! (`global = sum of prior page lengths + local index`), filtering records
//! strictly on the accumulator. Deriving a record's global position from
//! page-local arithmetic alone does not survive page sizes other than 1;
//! the accumulator does, for every page partitioning of the stream.
//!
//! `skip` beyond the end of the stream and `limit = 0` both yield empty
//! streams, not errors. Page-fetch failures surface as `Err` items at the
//! point the affected part of the slice is consumed.

use futures::stream::{BoxStream, StreamExt};

use runhouse_core::RecordPage;
use runhouse_store::{DocumentStream, StoreError};

/// Flatten an intersecting page stream into the record slice
/// `[skip, skip + limit)`.
pub(crate) fn flatten_sliced<P>(
    pages: DocumentStream<P>,
    skip: u64,
    limit: Option<u64>,
) -> BoxStream<'static, Result<P::Record, StoreError>>
where
    P: RecordPage,
{
    let end = limit.map(|l| skip.saturating_add(l));
    // rows: the current page's row iterator plus the global index of its
    // next row; offset: the accumulated global offset for the next page.
    let state = (pages, None::<(P::Rows, u64)>, None::<u64>, false);
    futures::stream::unfold(state, move |(mut pages, mut rows, mut offset, done)| async move {
        if done {
            return None;
        }
        loop {
            let mut next_record = None;
            if let Some((iter, index)) = rows.as_mut() {
                for record in iter.by_ref() {
                    let global = *index;
                    *index += 1;
                    if global < skip {
                        continue;
                    }
                    if end.is_some_and(|e| global >= e) {
                        return None;
                    }
                    next_record = Some(record);
                    break;
                }
            }
            match next_record {
                Some(record) => return Some((Ok(record), (pages, rows, offset, false))),
                None => rows = None,
            }
            match pages.next().await {
                None => return None,
                Some(Err(e)) => return Some((Err(e), (pages, rows, offset, true))),
                Some(Ok(page)) => {
                    let base = *offset.get_or_insert(page.first_index());
                    let rows_in_page = page.len() as u64;
                    match page.rows() {
                        Ok(iter) => {
                            rows = Some((iter, base));
                            offset = Some(base + rows_in_page);
                        }
                        Err(e) => return Some((Err(e.into()), (pages, rows, offset, true))),
                    }
                }
            }
        }
    })
    .boxed()
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::stream::{self, TryStreamExt};
    use runhouse_core::{Event, EventPage};
    use std::collections::BTreeMap;

    fn event(seq_num: u64, time: f64) -> Event {
        Event {
            uid: format!("ev{seq_num}"),
            descriptor: "d1".to_string(),
            seq_num,
            time,
            data: BTreeMap::new(),
            timestamps: BTreeMap::new(),
            filled: BTreeMap::new(),
        }
    }

    /// Build pages over events with global indices [0, total), partitioned
    /// by the given page sizes.
    fn partition(total: u64, sizes: &[u64]) -> Vec<EventPage> {
        assert_eq!(sizes.iter().sum::<u64>(), total);
        let mut pages = Vec::new();
        let mut next = 0u64;
        for size in sizes {
            let events: Vec<Event> = (next..next + size)
                .map(|i| event(i + 1, i as f64))
                .collect();
            pages.push(EventPage::from_records(events, next).unwrap());
            next += size;
        }
        pages
    }

    async fn read_slice(
        pages: Vec<EventPage>,
        skip: u64,
        limit: Option<u64>,
    ) -> Vec<u64> {
        // Keep only intersecting pages, as a conforming backend would.
        let end = limit.map(|l| skip.saturating_add(l));
        let intersecting: Vec<EventPage> = pages
            .into_iter()
            .filter(|p| p.overlaps(skip, end))
            .collect();
        let stream = stream::iter(intersecting.into_iter().map(Ok)).boxed();
        let events: Vec<Event> = flatten_sliced(stream, skip, limit)
            .try_collect()
            .await
            .unwrap();
        events.iter().map(|e| e.seq_num - 1).collect()
    }

    #[tokio::test]
    async fn slices_match_the_index_range_for_every_partitioning() {
        let total = 10u64;
        let partitionings: &[&[u64]] = &[
            &[10],
            &[1, 1, 1, 1, 1, 1, 1, 1, 1, 1],
            &[3, 3, 3, 1],
            &[4, 4, 2],
            &[1, 9],
            &[5, 5],
        ];
        for sizes in partitionings {
            for skip in 0..=total + 1 {
                for limit in [None, Some(0), Some(1), Some(3), Some(10), Some(100)] {
                    let got = read_slice(partition(total, sizes), skip, limit).await;
                    let end = limit.map_or(total, |l| (skip + l).min(total));
                    let expected: Vec<u64> = (skip.min(total)..end.max(skip.min(total))).collect();
                    assert_eq!(got, expected, "sizes {sizes:?} skip {skip} limit {limit:?}");
                }
            }
        }
    }

    #[tokio::test]
    async fn page_errors_surface_in_sequence_position() {
        let good = partition(4, &[2, 2]);
        let items: Vec<Result<EventPage, StoreError>> = vec![
            Ok(good[0].clone()),
            Err(StoreError::Misconfigured("backend gone".to_string())),
            Ok(good[1].clone()),
        ];
        let results: Vec<Result<Event, StoreError>> =
            flatten_sliced(stream::iter(items).boxed(), 0, None)
                .collect()
                .await;
        assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 2);
        assert!(results[2].is_err());
        // The cursor stops at the error; the later page is never unpacked.
        assert_eq!(results.len(), 3);
    }
}
