//! Bounded, order-preserving fan-out/fan-in over independent units of work.
//!
//! [`dispatch`] runs one worker per input item with at most `max_workers`
//! in flight, then hands back the results **in input order** no matter in
//! which order the workers finished. The ordering guarantee does not rely
//! on completion timing at all: every worker is tagged with its input index
//! and writes into that index of a [`ResultSlots`] arena, which is drained
//! front to back once every worker is done.
//!
//! ## Failure isolation
//!
//! Each unit runs as its own `tokio` task. An `Err` from a worker, or even
//! a panic, is captured into that unit's slot as a [`UnitFailure`]; sibling
//! workers are never cancelled and the dispatch always completes.
//!
//! ```text
//!  items ─┬─ 0 ──▶ task ──┐            ┌──────────────┐
//!         ├─ 1 ──▶ task ──┼─ any order ─▶ slots[index] ├─▶ ordered Vec
//!         └─ 2 ──▶ task ──┘            └──────────────┘
//!        (≤ max_workers in flight)
//! ```

use futures::stream::{self, StreamExt};
use std::future::Future;
use std::sync::Arc;
use thiserror::Error;
use tracing::error;

/// Why a single unit produced no value.
#[derive(Debug, Error)]
pub enum UnitFailure<E> {
    /// The worker returned an error.
    #[error("{0}")]
    Failed(E),
    /// The worker task panicked or was cancelled by the runtime.
    #[error("worker panicked: {0}")]
    Panicked(String),
    /// No result was recorded for this index.
    #[error("no result recorded for unit {0}")]
    Missing(usize),
}

/// Misuse of a [`ResultSlots`] arena.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SlotError {
    #[error("slot {index} is out of range (len {len})")]
    OutOfRange { index: usize, len: usize },
    #[error("slot {0} was already written")]
    AlreadyFilled(usize),
    #[error("slot {0} is still pending")]
    Pending(usize),
}

/// Fixed-size, write-once-per-index result arena.
///
/// Created with one pending slot per input, filled by completions in any
/// order, drained once in index order.
#[derive(Debug)]
pub struct ResultSlots<V> {
    slots: Vec<Option<V>>,
    filled: usize,
}

impl<V> ResultSlots<V> {
    pub fn new(len: usize) -> Self {
        let mut slots = Vec::with_capacity(len);
        slots.resize_with(len, || None);
        Self { slots, filled: 0 }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Number of slots written so far.
    pub fn filled(&self) -> usize {
        self.filled
    }

    pub fn is_complete(&self) -> bool {
        self.filled == self.slots.len()
    }

    /// Write the value for `index`. A second write to the same index is
    /// rejected and the first value is kept.
    pub fn fill(&mut self, index: usize, value: V) -> Result<(), SlotError> {
        let len = self.slots.len();
        let slot = self
            .slots
            .get_mut(index)
            .ok_or(SlotError::OutOfRange { index, len })?;
        if slot.is_some() {
            return Err(SlotError::AlreadyFilled(index));
        }
        *slot = Some(value);
        self.filled += 1;
        Ok(())
    }

    /// Drain in index order; fails on the first pending slot.
    pub fn into_ordered(self) -> Result<Vec<V>, SlotError> {
        self.slots
            .into_iter()
            .enumerate()
            .map(|(index, slot)| slot.ok_or(SlotError::Pending(index)))
            .collect()
    }

    /// Drain in index order, substituting `pending(index)` for any slot
    /// that was never written.
    pub fn into_ordered_with(self, mut pending: impl FnMut(usize) -> V) -> Vec<V> {
        self.slots
            .into_iter()
            .enumerate()
            .map(|(index, slot)| slot.unwrap_or_else(|| pending(index)))
            .collect()
    }
}

/// Outcome of one unit as stored in its slot.
pub type UnitOutcome<R, E> = Result<R, UnitFailure<E>>;

/// Run `worker(index, item)` for every item with bounded concurrency and
/// return the outcomes in input order.
///
/// `max_workers` is clamped to at least 1.
pub async fn dispatch<T, R, E, F, Fut>(
    items: Vec<T>,
    max_workers: usize,
    worker: F,
) -> Vec<UnitOutcome<R, E>>
where
    T: Send + 'static,
    R: Send + 'static,
    E: Send + 'static,
    F: Fn(usize, T) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<R, E>> + Send + 'static,
{
    dispatch_observed(items, max_workers, worker, |_, _| {}).await
}

/// Like [`dispatch`], but calls `observe(index, &outcome)` as each unit
/// completes, in completion order. Used for progress reporting and
/// per-unit warnings; it cannot influence the stored outcome.
pub async fn dispatch_observed<T, R, E, F, Fut, O>(
    items: Vec<T>,
    max_workers: usize,
    worker: F,
    mut observe: O,
) -> Vec<UnitOutcome<R, E>>
where
    T: Send + 'static,
    R: Send + 'static,
    E: Send + 'static,
    F: Fn(usize, T) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<R, E>> + Send + 'static,
    O: FnMut(usize, &UnitOutcome<R, E>),
{
    let mut slots = ResultSlots::new(items.len());
    let worker = Arc::new(worker);

    // `buffer_unordered` only polls (and therefore only spawns) up to
    // `max_workers` units at a time.
    let mut completions = stream::iter(items.into_iter().enumerate())
        .map(|(index, item)| {
            let worker = Arc::clone(&worker);
            async move {
                let handle = tokio::spawn(async move { (*worker)(index, item).await });
                let outcome = match handle.await {
                    Ok(Ok(value)) => Ok(value),
                    Ok(Err(e)) => Err(UnitFailure::Failed(e)),
                    Err(join_err) => Err(UnitFailure::Panicked(join_error_message(join_err))),
                };
                (index, outcome)
            }
        })
        .buffer_unordered(max_workers.max(1));

    while let Some((index, outcome)) = completions.next().await {
        observe(index, &outcome);
        if let Err(e) = slots.fill(index, outcome) {
            error!("dispatch: dropping result for unit {}: {}", index, e);
        }
    }

    slots.into_ordered_with(|index| {
        error!("dispatch: unit {} finished without a result", index);
        Err(UnitFailure::Missing(index))
    })
}

fn join_error_message(err: tokio::task::JoinError) -> String {
    if !err.is_panic() {
        return err.to_string();
    }
    let payload = err.into_panic();
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[test]
    fn slots_reject_double_write_and_keep_first() {
        let mut slots = ResultSlots::new(2);
        slots.fill(1, "b").unwrap();
        assert_eq!(slots.fill(1, "x"), Err(SlotError::AlreadyFilled(1)));
        slots.fill(0, "a").unwrap();
        assert!(slots.is_complete());
        assert_eq!(slots.into_ordered().unwrap(), vec!["a", "b"]);
    }

    #[test]
    fn slots_report_pending_and_out_of_range() {
        let mut slots: ResultSlots<u8> = ResultSlots::new(3);
        assert_eq!(
            slots.fill(3, 0),
            Err(SlotError::OutOfRange { index: 3, len: 3 })
        );
        slots.fill(0, 1).unwrap();
        assert_eq!(slots.filled(), 1);
        assert_eq!(slots.into_ordered(), Err(SlotError::Pending(1)));
    }

    #[test]
    fn slots_fallback_fills_gaps_in_place() {
        let mut slots = ResultSlots::new(3);
        slots.fill(2, 20).unwrap();
        assert_eq!(slots.into_ordered_with(|i| -(i as i32)), vec![0, -1, 20]);
    }

    #[tokio::test]
    async fn empty_input_yields_empty_output() {
        let out: Vec<UnitOutcome<u8, ()>> =
            dispatch(Vec::<u8>::new(), 4, |_, x| async move { Ok(x) }).await;
        assert!(out.is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn reversed_latency_keeps_input_order() {
        let items: Vec<u64> = (0..8).collect();
        let out = dispatch(items, 8, |index, item| async move {
            // Later items finish first.
            tokio::time::sleep(Duration::from_millis(10 * (8 - index as u64))).await;
            Ok::<_, ()>(item * 10)
        })
        .await;

        let values: Vec<u64> = out.into_iter().map(|r| r.unwrap()).collect();
        assert_eq!(values, vec![0, 10, 20, 30, 40, 50, 60, 70]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn never_exceeds_max_workers() {
        let in_flight = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let (f, p) = (Arc::clone(&in_flight), Arc::clone(&peak));
        let out = dispatch((0..12).collect::<Vec<_>>(), 3, move |_, item: u32| {
            let (f, p) = (Arc::clone(&f), Arc::clone(&p));
            async move {
                let now = f.fetch_add(1, Ordering::SeqCst) + 1;
                p.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(5)).await;
                f.fetch_sub(1, Ordering::SeqCst);
                Ok::<_, ()>(item)
            }
        })
        .await;

        assert_eq!(out.len(), 12);
        assert!(peak.load(Ordering::SeqCst) <= 3);
        assert!(peak.load(Ordering::SeqCst) >= 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn failures_and_panics_stay_in_their_slot() {
        let out = dispatch(vec![0u32, 1, 2, 3], 2, |index, item| async move {
            match index {
                1 => Err(format!("unit {item} failed")),
                2 => panic!("unit 2 exploded"),
                _ => Ok(item),
            }
        })
        .await;

        assert_eq!(out.len(), 4);
        assert_eq!(*out[0].as_ref().unwrap(), 0);
        assert!(matches!(&out[1], Err(UnitFailure::Failed(m)) if m == "unit 1 failed"));
        assert!(matches!(&out[2], Err(UnitFailure::Panicked(m)) if m.contains("exploded")));
        assert_eq!(*out[3].as_ref().unwrap(), 3);
    }

    #[tokio::test]
    async fn observer_sees_every_completion() {
        let mut seen = Vec::new();
        let out = dispatch_observed(
            vec!["a", "b", "c"],
            2,
            |_, s: &'static str| async move { Ok::<_, ()>(s.len()) },
            |index, outcome| seen.push((index, outcome.is_ok())),
        )
        .await;

        assert_eq!(out.len(), 3);
        seen.sort();
        assert_eq!(seen, vec![(0, true), (1, true), (2, true)]);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(24))]

        #[test]
        fn output_order_is_input_order_for_any_latency(
            delays in prop::collection::vec(0u64..20, 1..16),
            workers in 1usize..6,
        ) {
            let n = delays.len();
            let delays = Arc::new(delays);
            let out = tokio_test::block_on(dispatch((0..n).collect::<Vec<_>>(), workers, move |index, item| {
                let delay = delays[index];
                async move {
                    tokio::time::sleep(Duration::from_millis(delay)).await;
                    Ok::<_, ()>(item)
                }
            }));
            let values: Vec<usize> = out.into_iter().map(|r| r.unwrap()).collect();
            prop_assert_eq!(values, (0..n).collect::<Vec<_>>());
        }
    }
}
