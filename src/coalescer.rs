//! Request coalescing: one in-flight build per key

use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

type Flight<T> = Shared<BoxFuture<'static, T>>;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CoalescerStats {
    pub started: u64,
    pub joined: u64,
    pub in_flight: usize,
}

struct InFlight<T: Clone + Send + Sync + 'static> {
    id: u64,
    waiters: usize,
    flight: Flight<T>,
}

/// Deduplicates concurrent work for identical keys.
///
/// The first caller for a key starts the computation; callers arriving while
/// it runs await the same shared future and receive a clone of the same
/// output (for `Arc` outputs, the same allocation). A flight whose callers
/// are all dropped is removed and cancelled.
pub struct BuildCoalescer<T: Clone + Send + Sync + 'static> {
    in_flight: Mutex<HashMap<String, InFlight<T>>>,
    next_id: AtomicU64,
    started: AtomicU64,
    joined: AtomicU64,
}

impl<T: Clone + Send + Sync + 'static> Default for BuildCoalescer<T> {
    fn default() -> Self {
        Self {
            in_flight: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(0),
            started: AtomicU64::new(0),
            joined: AtomicU64::new(0),
        }
    }
}

impl<T: Clone + Send + Sync + 'static> BuildCoalescer<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `build` for `key` unless a flight for `key` is already running.
    /// Returns the output and whether this caller joined an existing flight.
    pub async fn run<F>(&self, key: &str, build: F) -> (T, bool)
    where
        F: FnOnce() -> BoxFuture<'static, T>,
    {
        let (id, flight, joined) = {
            let mut in_flight = self.in_flight.lock();
            match in_flight.get_mut(key) {
                Some(entry) => {
                    entry.waiters += 1;
                    self.joined.fetch_add(1, Ordering::Relaxed);
                    (entry.id, entry.flight.clone(), true)
                }
                None => {
                    let id = self.next_id.fetch_add(1, Ordering::Relaxed);
                    let flight = build().shared();
                    in_flight.insert(
                        key.to_string(),
                        InFlight {
                            id,
                            waiters: 1,
                            flight: flight.clone(),
                        },
                    );
                    self.started.fetch_add(1, Ordering::Relaxed);
                    (id, flight, false)
                }
            }
        };

        let mut waiter = Waiter {
            coalescer: self,
            key,
            id,
            done: false,
        };
        let output = flight.await;
        waiter.done = true;

        (output, joined)
    }

    pub fn stats(&self) -> CoalescerStats {
        CoalescerStats {
            started: self.started.load(Ordering::Relaxed),
            joined: self.joined.load(Ordering::Relaxed),
            in_flight: self.in_flight.lock().len(),
        }
    }
}

/// Deregisters one caller from a flight when it finishes or is dropped
struct Waiter<'a, T: Clone + Send + Sync + 'static> {
    coalescer: &'a BuildCoalescer<T>,
    key: &'a str,
    id: u64,
    done: bool,
}

impl<T: Clone + Send + Sync + 'static> Drop for Waiter<'_, T> {
    fn drop(&mut self) {
        let mut in_flight = self.coalescer.in_flight.lock();
        // Only touch our own flight; a newer one may already be registered
        let Some(entry) = in_flight.get_mut(self.key).filter(|e| e.id == self.id) else {
            return;
        };
        entry.waiters -= 1;
        if self.done || entry.waiters == 0 {
            in_flight.remove(self.key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn test_concurrent_callers_share_one_build() {
        let coalescer: Arc<BuildCoalescer<Arc<String>>> = Arc::new(BuildCoalescer::new());
        let runs = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let coalescer = Arc::clone(&coalescer);
            let runs = Arc::clone(&runs);
            handles.push(tokio::spawn(async move {
                coalescer
                    .run("k", move || {
                        async move {
                            runs.fetch_add(1, Ordering::SeqCst);
                            tokio::time::sleep(Duration::from_millis(50)).await;
                            Arc::new("built".to_string())
                        }
                        .boxed()
                    })
                    .await
            }));
        }

        let results: Vec<(Arc<String>, bool)> = futures::future::join_all(handles)
            .await
            .into_iter()
            .map(|r| r.unwrap())
            .collect();

        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert_eq!(results.iter().filter(|(_, joined)| !joined).count(), 1);
        assert!(results.iter().all(|(v, _)| Arc::ptr_eq(v, &results[0].0)));
        assert_eq!(coalescer.stats().in_flight, 0);
    }

    #[tokio::test]
    async fn test_sequential_calls_rebuild() {
        let coalescer: BuildCoalescer<u32> = BuildCoalescer::new();
        let (a, joined_a) = coalescer.run("k", || async { 1 }.boxed()).await;
        let (b, joined_b) = coalescer.run("k", || async { 2 }.boxed()).await;
        assert_eq!((a, b), (1, 2));
        assert!(!joined_a && !joined_b);
        assert_eq!(coalescer.stats().started, 2);
    }

    #[test]
    fn test_distinct_keys_do_not_block() {
        tokio_test::block_on(async {
            let coalescer: BuildCoalescer<&'static str> = BuildCoalescer::new();
            let (a, b) = futures::join!(
                coalescer.run("a", || async { "a" }.boxed()),
                coalescer.run("b", || async { "b" }.boxed()),
            );
            assert_eq!((a.0, b.0), ("a", "b"));
            assert_eq!(coalescer.stats().joined, 0);
        });
    }

    #[tokio::test]
    async fn test_cancelled_callers_release_their_flight() {
        let coalescer: BuildCoalescer<u32> = BuildCoalescer::new();

        for i in 0..5 {
            let key = format!("k{}", i);
            let run = coalescer.run(&key, || futures::future::pending::<u32>().boxed());
            assert!(tokio::time::timeout(Duration::from_millis(5), run).await.is_err());
        }
        assert_eq!(coalescer.stats().in_flight, 0);

        // The next caller starts fresh instead of joining the abandoned flight
        let (value, joined) = coalescer.run("k0", || async { 7 }.boxed()).await;
        assert_eq!(value, 7);
        assert!(!joined);
        assert_eq!(coalescer.stats().started, 6);
    }

    #[tokio::test]
    async fn test_flight_survives_while_one_caller_remains() {
        let coalescer: Arc<BuildCoalescer<u32>> = Arc::new(BuildCoalescer::new());
        let slow = || {
            async {
                tokio::time::sleep(Duration::from_millis(40)).await;
                3
            }
            .boxed()
        };

        let kept = tokio::spawn({
            let coalescer = Arc::clone(&coalescer);
            async move { coalescer.run("k", slow).await }
        });
        tokio::time::sleep(Duration::from_millis(5)).await;

        // A joiner gives up early; the first caller still gets the result
        let dropped = coalescer.run("k", slow);
        assert!(tokio::time::timeout(Duration::from_millis(5), dropped).await.is_err());
        assert_eq!(coalescer.stats().in_flight, 1);

        assert_eq!(kept.await.unwrap(), (3, false));
        assert_eq!(coalescer.stats().in_flight, 0);
        assert_eq!(coalescer.stats().started, 1);
    }
}
