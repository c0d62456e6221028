//! Concurrent per-item work with explicit per-item outcomes.
//!
//! Items run cooperatively on the current task; an optional semaphore caps
//! how many are in flight. A failing item never aborts the batch: its error
//! is recorded as [`ItemOutcome::Failed`] and the report keeps going.

use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};

use futures::future::join_all;
use tokio::sync::Semaphore;
use tracing::warn;

use bookgen_shared::Result;

use crate::progress::ProgressReporter;

/// Result of one item of a batch.
#[derive(Debug, Clone, PartialEq)]
pub enum ItemOutcome<T> {
    Done(T),
    Failed { item: String, reason: String },
}

/// Successes and failures of a batch, each in input order.
#[derive(Debug, Clone, PartialEq)]
pub struct FanOutReport<T> {
    pub done: Vec<T>,
    pub failed: Vec<(String, String)>,
}

impl<T> FanOutReport<T> {
    pub fn total(&self) -> usize {
        self.done.len() + self.failed.len()
    }

    pub fn all_failed(&self) -> bool {
        self.done.is_empty() && !self.failed.is_empty()
    }
}

impl<T> FromIterator<ItemOutcome<T>> for FanOutReport<T> {
    fn from_iter<I: IntoIterator<Item = ItemOutcome<T>>>(iter: I) -> Self {
        let mut report = Self {
            done: Vec::new(),
            failed: Vec::new(),
        };
        for outcome in iter {
            match outcome {
                ItemOutcome::Done(value) => report.done.push(value),
                ItemOutcome::Failed { item, reason } => report.failed.push((item, reason)),
            }
        }
        report
    }
}

/// Run `work` over every item and wait for all of them.
///
/// `label` names an item in logs and in the failure list.
pub async fn fan_out<X, T, Fut>(
    stage: &'static str,
    items: impl IntoIterator<Item = X>,
    limit: Option<&Semaphore>,
    progress: &dyn ProgressReporter,
    label: impl Fn(&X) -> String,
    work: impl Fn(X) -> Fut,
) -> FanOutReport<T>
where
    Fut: Future<Output = Result<T>>,
{
    let items: Vec<X> = items.into_iter().collect();
    let total = items.len();
    let finished = AtomicUsize::new(0);
    let work = &work;
    let finished = &finished;

    let tasks = items.into_iter().map(|item| {
        let name = label(&item);
        async move {
            let result = match limit {
                Some(semaphore) => match semaphore.acquire().await {
                    Ok(_permit) => work(item).await,
                    Err(e) => Err(bookgen_shared::BookGenError::stage(stage, e.to_string())),
                },
                None => work(item).await,
            };
            progress.item_finished(stage, finished.fetch_add(1, Ordering::Relaxed) + 1, total);
            match result {
                Ok(value) => ItemOutcome::Done(value),
                Err(e) => {
                    warn!(stage, item = %name, error = %e, "item failed");
                    ItemOutcome::Failed {
                        item: name,
                        reason: e.to_string(),
                    }
                }
            }
        }
    });

    join_all(tasks).await.into_iter().collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::progress::SilentProgress;
    use bookgen_shared::BookGenError;
    use std::time::Duration;

    #[tokio::test]
    async fn failures_do_not_abort_the_batch() {
        let report = fan_out(
            "test",
            vec![1, 2, 3, 4],
            None,
            &SilentProgress,
            |n| format!("item {n}"),
            |n| async move {
                if n % 2 == 0 {
                    Err(BookGenError::validation(format!("{n} is even")))
                } else {
                    Ok(n * 10)
                }
            },
        )
        .await;

        assert_eq!(report.done, vec![10, 30]);
        assert_eq!(report.failed.len(), 2);
        assert_eq!(report.failed[0].0, "item 2");
        assert!(report.failed[1].1.contains("4 is even"));
        assert_eq!(report.total(), 4);
        assert!(!report.all_failed());
    }

    #[tokio::test]
    async fn semaphore_caps_items_in_flight() {
        let semaphore = Semaphore::new(2);
        let in_flight = AtomicUsize::new(0);
        let peak = AtomicUsize::new(0);

        let report = fan_out(
            "test",
            0..10,
            Some(&semaphore),
            &SilentProgress,
            |n| n.to_string(),
            |n| {
                let in_flight = &in_flight;
                let peak = &peak;
                async move {
                    let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(5)).await;
                    in_flight.fetch_sub(1, Ordering::SeqCst);
                    Ok(n)
                }
            },
        )
        .await;

        assert_eq!(report.done.len(), 10);
        assert!(peak.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn mutable_items_are_updated_in_place() {
        let mut items = vec![String::from("a"), String::from("b")];
        let report = fan_out(
            "test",
            items.iter_mut(),
            None,
            &SilentProgress,
            |s| s.to_string(),
            |s| async move {
                s.push('!');
                Ok(())
            },
        )
        .await;
        assert_eq!(report.done.len(), 2);
        assert_eq!(items, vec!["a!", "b!"]);
    }
}
