//! Bounded fan-out over a list of items, results kept in submission order.

use std::future::Future;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::{error, warn};

/// Run `task` once per item with at most `max_workers` in flight.
///
/// Slot `i` of the result holds the outcome for `items[i]`. A task that
/// returns `None` or panics leaves `None` in its slot.
pub async fn run_ordered<I, T, F, Fut>(items: Vec<I>, max_workers: usize, task: F) -> Vec<Option<T>>
where
    I: Send + 'static,
    T: Send + 'static,
    F: Fn(I) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Option<T>> + Send + 'static,
{
    let sem = Arc::new(Semaphore::new(max_workers.max(1)));
    let task = Arc::new(task);
    let mut handles = Vec::with_capacity(items.len());

    for item in items {
        let sem = Arc::clone(&sem);
        let task = Arc::clone(&task);

        handles.push(tokio::spawn(async move {
            let _permit = match sem.acquire().await {
                Ok(p) => p,
                Err(e) => {
                    warn!("Worker pool closed: {}", e);
                    return None;
                }
            };
            task(item).await
        }));
    }

    let mut results = Vec::with_capacity(handles.len());
    for (i, handle) in handles.into_iter().enumerate() {
        match handle.await {
            Ok(out) => results.push(out),
            Err(e) => {
                error!("Task panic for item {}: {}", i, e);
                results.push(None);
            }
        }
    }
    results
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn test_results_follow_submission_order() {
        let items: Vec<u64> = (0..8).collect();
        let out = run_ordered(items, 3, |n| async move {
            // later items finish first
            tokio::time::sleep(Duration::from_millis(40 - n * 5)).await;
            Some(n * 10)
        })
        .await;
        assert_eq!(out, (0..8).map(|n| Some(n * 10)).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_failures_and_panics_become_none() {
        let out = run_ordered(vec![1, 2, 3, 4], 2, |n: i32| async move {
            match n {
                2 => None,
                3 => panic!("boom"),
                _ => Some(n),
            }
        })
        .await;
        assert_eq!(out, vec![Some(1), None, None, Some(4)]);
    }

    #[tokio::test]
    async fn test_concurrency_is_bounded() {
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let (a, p) = (Arc::clone(&active), Arc::clone(&peak));
        let out = run_ordered((0..12).collect::<Vec<_>>(), 4, move |n: usize| {
            let active = Arc::clone(&a);
            let peak = Arc::clone(&p);
            async move {
                let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(10)).await;
                active.fetch_sub(1, Ordering::SeqCst);
                Some(n)
            }
        })
        .await;

        assert_eq!(out.iter().flatten().count(), 12);
        assert!(peak.load(Ordering::SeqCst) <= 4);
    }

    #[test]
    fn test_empty_input() {
        let out: Vec<Option<u8>> =
            tokio_test::block_on(run_ordered(Vec::<u8>::new(), 4, |n| async move { Some(n) }));
        assert!(out.is_empty());
    }
}
