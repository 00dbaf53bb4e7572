//! Single-flight collapsing of concurrent refreshes.

use std::future::Future;
use std::sync::Arc;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use metrics::counter;
use tokio::sync::broadcast;

type Sender<T, E> = broadcast::Sender<Result<T, Arc<E>>>;

/// Deduplicates concurrent executions by key: the first caller runs the
/// supplied future, every concurrent caller for the same key waits and
/// receives a clone of the same result.
pub struct FlightGroup<T, E> {
    inflight: DashMap<String, Sender<T, E>>,
}

impl<T, E> FlightGroup<T, E>
where
    T: Clone + Send + 'static,
    E: Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self {
            inflight: DashMap::new(),
        }
    }

    pub async fn run<F, Fut>(&self, key: &str, make: F) -> Result<T, Arc<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        match self.inflight.entry(key.to_string()) {
            Entry::Occupied(entry) => {
                // Subscribe while the entry guard pins the shard: the leader
                // removes the entry before publishing, so a subscription
                // obtained here always precedes the send.
                let mut rx = entry.get().subscribe();
                drop(entry);
                counter!("ateneo_flight_joined_total").increment(1);
                match rx.recv().await {
                    Ok(result) => result,
                    Err(_) => {
                        // The leader went away without publishing (cancelled
                        // or panicked) and its entry is already gone. Refresh
                        // directly instead of racing for the slot again.
                        make().await.map_err(Arc::new)
                    }
                }
            }
            Entry::Vacant(entry) => {
                let (tx, _keepalive) = broadcast::channel(1);
                entry.insert(tx.clone());
                let unregister = Unregister {
                    inflight: &self.inflight,
                    key,
                };
                let result = make().await.map_err(Arc::new);
                // Close the flight before publishing; see the ordering note
                // in the join arm.
                drop(unregister);
                let _ = tx.send(result.clone());
                result
            }
        }
    }
}

impl<T, E> Default for FlightGroup<T, E>
where
    T: Clone + Send + 'static,
    E: Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

/// Removes the flight entry on drop, covering cancellation and panics inside
/// the leader's future.
struct Unregister<'a, T, E> {
    inflight: &'a DashMap<String, Sender<T, E>>,
    key: &'a str,
}

impl<T, E> Drop for Unregister<'_, T, E> {
    fn drop(&mut self) {
        self.inflight.remove(self.key);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use futures::future::join_all;

    use super::*;

    #[tokio::test]
    async fn concurrent_callers_share_one_execution() {
        let group = Arc::new(FlightGroup::<u64, String>::new());
        let executions = Arc::new(AtomicUsize::new(0));

        let tasks: Vec<_> = (0..16)
            .map(|_| {
                let group = group.clone();
                let executions = executions.clone();
                tokio::spawn(async move {
                    group
                        .run("records:1:seats", || async move {
                            executions.fetch_add(1, Ordering::SeqCst);
                            tokio::time::sleep(Duration::from_millis(50)).await;
                            Ok(42_u64)
                        })
                        .await
                })
            })
            .collect();

        let results = join_all(tasks).await;
        for joined in results {
            let result = joined.expect("task panicked");
            assert_eq!(result.expect("refresh failed"), 42);
        }
        assert_eq!(executions.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failures_are_shared_too() {
        let group = Arc::new(FlightGroup::<u64, String>::new());
        let executions = Arc::new(AtomicUsize::new(0));

        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let group = group.clone();
                let executions = executions.clone();
                tokio::spawn(async move {
                    group
                        .run("records:1:history", || async move {
                            executions.fetch_add(1, Ordering::SeqCst);
                            tokio::time::sleep(Duration::from_millis(30)).await;
                            Err::<u64, _>("portal down".to_string())
                        })
                        .await
                })
            })
            .collect();

        for joined in join_all(tasks).await {
            let result = joined.expect("task panicked");
            let error = result.expect_err("expected shared failure");
            assert_eq!(error.as_str(), "portal down");
        }
        assert_eq!(executions.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn sequential_runs_execute_separately() {
        let group = FlightGroup::<u64, String>::new();
        let executions = AtomicUsize::new(0);

        for expected in 1..=3 {
            let result = group
                .run("records:1:seats", || async {
                    executions.fetch_add(1, Ordering::SeqCst);
                    Ok(7_u64)
                })
                .await;
            assert_eq!(result.expect("run failed"), 7);
            assert_eq!(executions.load(Ordering::SeqCst), expected);
        }
    }

    #[tokio::test]
    async fn distinct_keys_do_not_share_flights() {
        let group = Arc::new(FlightGroup::<u64, String>::new());
        let executions = Arc::new(AtomicUsize::new(0));

        let a = {
            let group = group.clone();
            let executions = executions.clone();
            tokio::spawn(async move {
                group
                    .run("records:1:seats", || async move {
                        executions.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(30)).await;
                        Ok(1_u64)
                    })
                    .await
            })
        };
        let b = {
            let group = group.clone();
            let executions = executions.clone();
            tokio::spawn(async move {
                group
                    .run("records:2:seats", || async move {
                        executions.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(30)).await;
                        Ok(2_u64)
                    })
                    .await
            })
        };

        assert_eq!(a.await.expect("join").expect("run"), 1);
        assert_eq!(b.await.expect("join").expect("run"), 2);
        assert_eq!(executions.load(Ordering::SeqCst), 2);
    }
}
