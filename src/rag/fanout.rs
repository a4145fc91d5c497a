//! Bounded fan-out / fan-in over independent remote calls.
//!
//! Every task is tagged with a key and its outcome is returned next to
//! that key, so callers correlate by key and never by completion order.
//! One task failing has no effect on the others. The call returns once
//! every task has finished.

use futures::stream::{self, StreamExt};
use std::future::Future;

/// Run `task` for each `(key, input)` with at most `max_workers` in flight.
///
/// Results come back in completion order.
pub async fn fan_out<K, I, T, E, F, Fut>(
    items: impl IntoIterator<Item = (K, I)>,
    max_workers: usize,
    task: F,
) -> Vec<(K, Result<T, E>)>
where
    F: Fn(I) -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    stream::iter(items)
        .map(|(key, input)| {
            let fut = task(input);
            async move { (key, fut.await) }
        })
        .buffer_unordered(max_workers.max(1))
        .collect()
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn test_every_key_gets_its_own_outcome() {
        let items = (0..6).map(|i| (format!("k{i}"), i));
        let mut results = fan_out(items, 3, |i: u32| async move {
            if i % 2 == 0 { Ok(i * 10) } else { Err(format!("odd {i}")) }
        })
        .await;
        results.sort_by(|a, b| a.0.cmp(&b.0));

        assert_eq!(results.len(), 6);
        assert_eq!(results[0], ("k0".to_string(), Ok(0)));
        assert_eq!(results[1], ("k1".to_string(), Err("odd 1".to_string())));
        assert_eq!(results[4], ("k4".to_string(), Ok(40)));
    }

    #[tokio::test]
    async fn test_concurrency_ceiling() {
        let in_flight = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let results = fan_out((0..12).map(|i| (i, ())), 4, |_| {
            let in_flight = in_flight.clone();
            let peak = peak.clone();
            async move {
                let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(20)).await;
                in_flight.fetch_sub(1, Ordering::SeqCst);
                Ok::<_, ()>(())
            }
        })
        .await;

        assert_eq!(results.len(), 12);
        assert!(peak.load(Ordering::SeqCst) <= 4);
        assert!(peak.load(Ordering::SeqCst) >= 2);
    }

    #[tokio::test]
    async fn test_zero_workers_still_makes_progress() {
        let results = fan_out(vec![("a", 1)], 0, |i| async move { Ok::<_, ()>(i) }).await;
        assert_eq!(results, vec![("a", Ok(1))]);
    }
}
