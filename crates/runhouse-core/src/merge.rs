//! K-way Time-ordered Stream Merge
//!
//! A run's events are split across several independent streams (one per
//! descriptor), each already ascending in time. [`merge_by_time`] combines
//! any number of such streams into one globally ascending stream without
//! pre-loading any of them.
//!
//! ## Algorithm
//!
//! A binary heap keyed on `(time, source_index)` holds at most one pending
//! element per source. Pop the minimum, yield it, and pull the next element
//! from the same source before the following yield. O(log k) per emitted
//! element for k sources; memory is bounded by the source count.
//!
//! Ties on time break toward the lower source index, so output is
//! deterministic and stable. An exhausted source is simply never refilled;
//! the merge ends when every source is drained. The refill happens lazily
//! on the next pull, so abandoning the stream mid-merge never touches the
//! sources again.
//!
//! Works for any element with a time key: individual events, or whole
//! event pages (a page's key is its first row's time; rows within a page
//! are already time-sorted by construction).

use std::cmp::Ordering;
use std::collections::BinaryHeap;

use futures::stream::{BoxStream, StreamExt};

use crate::documents::{Event, EventPage};

/// An element carrying the timestamp the merge orders by.
pub trait Timed {
    /// Seconds since epoch.
    fn time(&self) -> f64;
}

impl Timed for Event {
    fn time(&self) -> f64 {
        self.time
    }
}

impl Timed for EventPage {
    fn time(&self) -> f64 {
        // Pages are non-empty by invariant; an empty one sorts first and is
        // harmless downstream.
        self.time.first().copied().unwrap_or(f64::NEG_INFINITY)
    }
}

struct Pending<T> {
    time: f64,
    source: usize,
    item: T,
}

impl<T> PartialEq for Pending<T> {
    fn eq(&self, other: &Self) -> bool {
        self.time.total_cmp(&other.time) == Ordering::Equal && self.source == other.source
    }
}

impl<T> Eq for Pending<T> {}

impl<T> PartialOrd for Pending<T> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<T> Ord for Pending<T> {
    // Reversed so BinaryHeap's max-heap pops the smallest (time, source).
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .time
            .total_cmp(&self.time)
            .then_with(|| other.source.cmp(&self.source))
    }
}

struct MergeState<T, E> {
    sources: Vec<BoxStream<'static, Result<T, E>>>,
    heap: BinaryHeap<Pending<T>>,
    refill: Option<usize>,
    started: bool,
    done: bool,
}

/// Lazily merge time-ascending streams into one time-ascending stream.
///
/// An `Err` from any source is yielded as-is and ends the merge: once a
/// source has failed, its ordering can no longer be trusted.
pub fn merge_by_time<T, E>(
    sources: Vec<BoxStream<'static, Result<T, E>>>,
) -> BoxStream<'static, Result<T, E>>
where
    T: Timed + Send + 'static,
    E: Send + 'static,
{
    let state = MergeState {
        sources,
        heap: BinaryHeap::new(),
        refill: None,
        started: false,
        done: false,
    };
    futures::stream::unfold(state, |mut state| async move {
        if state.done {
            return None;
        }
        if !state.started {
            state.started = true;
            for i in 0..state.sources.len() {
                match state.sources[i].next().await {
                    Some(Ok(item)) => state.heap.push(Pending {
                        time: item.time(),
                        source: i,
                        item,
                    }),
                    Some(Err(e)) => {
                        state.done = true;
                        return Some((Err(e), state));
                    }
                    None => {}
                }
            }
        }
        if let Some(i) = state.refill.take() {
            match state.sources[i].next().await {
                Some(Ok(item)) => state.heap.push(Pending {
                    time: item.time(),
                    source: i,
                    item,
                }),
                Some(Err(e)) => {
                    state.done = true;
                    return Some((Err(e), state));
                }
                None => {}
            }
        }
        match state.heap.pop() {
            Some(pending) => {
                state.refill = Some(pending.source);
                Some((Ok(pending.item), state))
            }
            None => None,
        }
    })
    .boxed()
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::stream::{self, TryStreamExt};
    use std::collections::BTreeMap;

    fn event(descriptor: &str, seq_num: u64, time: f64) -> Event {
        Event {
            uid: format!("{descriptor}-ev{seq_num}"),
            descriptor: descriptor.to_string(),
            seq_num,
            time,
            data: BTreeMap::new(),
            timestamps: BTreeMap::new(),
            filled: BTreeMap::new(),
        }
    }

    fn source(descriptor: &str, times: &[f64]) -> BoxStream<'static, Result<Event, String>> {
        let events: Vec<Result<Event, String>> = times
            .iter()
            .enumerate()
            .map(|(i, t)| Ok(event(descriptor, i as u64 + 1, *t)))
            .collect();
        stream::iter(events).boxed()
    }

    #[tokio::test]
    async fn interleaves_three_streams_in_time_order() {
        let merged: Vec<Event> = merge_by_time(vec![
            source("d1", &[1.0, 4.0]),
            source("d2", &[2.0, 5.0]),
            source("d3", &[3.0, 6.0]),
        ])
        .try_collect()
        .await
        .unwrap();
        let times: Vec<f64> = merged.iter().map(|e| e.time).collect();
        assert_eq!(times, vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
    }

    #[tokio::test]
    async fn output_length_is_sum_of_inputs() {
        let merged: Vec<Event> = merge_by_time(vec![
            source("d1", &[1.0, 1.5, 9.0]),
            source("d2", &[]),
            source("d3", &[2.0]),
        ])
        .try_collect()
        .await
        .unwrap();
        assert_eq!(merged.len(), 4);
        for pair in merged.windows(2) {
            assert!(pair[0].time <= pair[1].time);
        }
    }

    #[tokio::test]
    async fn ties_break_toward_the_lower_source() {
        let merged: Vec<Event> = merge_by_time(vec![
            source("right", &[1.0, 2.0]),
            source("left", &[1.0, 2.0]),
        ])
        .try_collect()
        .await
        .unwrap();
        let descriptors: Vec<&str> = merged.iter().map(|e| e.descriptor.as_str()).collect();
        assert_eq!(descriptors, vec!["right", "left", "right", "left"]);
    }

    #[tokio::test]
    async fn no_sources_yields_nothing() {
        let merged: Vec<Event> = merge_by_time::<Event, String>(vec![])
            .try_collect()
            .await
            .unwrap();
        assert!(merged.is_empty());
    }

    #[tokio::test]
    async fn source_error_is_surfaced_and_ends_the_merge() {
        let failing: BoxStream<'static, Result<Event, String>> = stream::iter(vec![
            Ok(event("d1", 1, 1.0)),
            Err("page fetch failed".to_string()),
        ])
        .boxed();
        let results: Vec<Result<Event, String>> =
            merge_by_time(vec![failing, source("d2", &[0.5])])
                .collect()
                .await;
        assert!(results.iter().any(|r| r.is_err()));
        let after_error: Vec<&Result<Event, String>> = results
            .iter()
            .skip_while(|r| r.is_ok())
            .skip(1)
            .collect();
        assert!(after_error.is_empty());
    }
}
