#![forbid(unsafe_code)]

//! Duplicate suppression for in-flight work.
//!
//! Concurrent calls with the same key share one execution: the first caller
//! runs the future, everyone else subscribes to its result. The leader's map
//! entry is removed before the result is broadcast, so a caller arriving
//! after completion always starts a fresh flight — which is what the
//! stale-URL retry path relies on.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use anyhow::anyhow;
use parking_lot::Mutex;
use tokio::sync::broadcast;

/// Errors fan out to every waiter, so they are shared behind an `Arc`.
pub type SharedError = Arc<anyhow::Error>;
pub type SharedResult<T> = Result<T, SharedError>;

type FlightMap<T> = Mutex<HashMap<String, broadcast::Sender<SharedResult<T>>>>;

pub struct Singleflight<T> {
    inflight: FlightMap<T>,
}

enum Role<T> {
    Leader(broadcast::Sender<SharedResult<T>>),
    Follower(broadcast::Receiver<SharedResult<T>>),
}

impl<T: Clone> Singleflight<T> {
    pub fn new() -> Self {
        Self {
            inflight: Mutex::new(HashMap::new()),
        }
    }

    /// Runs `fut` under `key`, or waits on an identical call already in
    /// flight. The boolean reports whether the result came from another
    /// caller's execution.
    pub async fn run<F>(&self, key: &str, fut: F) -> (SharedResult<T>, bool)
    where
        F: Future<Output = anyhow::Result<T>>,
    {
        let role = {
            let mut inflight = self.inflight.lock();
            if let Some(tx) = inflight.get(key) {
                Role::Follower(tx.subscribe())
            } else {
                let (tx, _) = broadcast::channel(1);
                inflight.insert(key.to_string(), tx.clone());
                Role::Leader(tx)
            }
        };

        match role {
            Role::Follower(mut rx) => match rx.recv().await {
                Ok(result) => (result, true),
                // The leader was cancelled before it could broadcast.
                Err(_) => (Err(Arc::new(anyhow!("in-flight call was dropped"))), true),
            },
            Role::Leader(tx) => {
                // Removes the entry even if `fut` is cancelled mid-await, so
                // a dead flight can never strand later callers.
                let cleanup = Cleanup {
                    key,
                    map: &self.inflight,
                };
                let result = fut.await.map_err(Arc::new);
                drop(cleanup);
                let _ = tx.send(result.clone());
                (result, false)
            }
        }
    }
}

impl<T: Clone> Default for Singleflight<T> {
    fn default() -> Self {
        Self::new()
    }
}

struct Cleanup<'a, T> {
    key: &'a str,
    map: &'a FlightMap<T>,
}

impl<T> Drop for Cleanup<'_, T> {
    fn drop(&mut self) {
        self.map.lock().remove(self.key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn concurrent_calls_share_one_execution() {
        let flights = Singleflight::new();
        let calls = AtomicUsize::new(0);

        let work = |value: u32| {
            let calls = &calls;
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(50)).await;
                Ok(value)
            }
        };

        let ((first, first_shared), (second, second_shared)) =
            tokio::join!(flights.run("k", work(7)), flights.run("k", work(8)));

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(*first.as_ref().unwrap(), 7);
        assert_eq!(*second.as_ref().unwrap(), 7);
        // Exactly one of the two led the flight.
        assert_ne!(first_shared, second_shared);
    }

    #[tokio::test]
    async fn distinct_keys_run_independently() {
        let flights = Singleflight::new();
        let calls = AtomicUsize::new(0);

        let work = || {
            let calls = &calls;
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(20)).await;
                Ok(())
            }
        };

        let _ = tokio::join!(flights.run("a", work()), flights.run("a:retry", work()));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn sequential_calls_each_execute() {
        let flights = Singleflight::new();
        let calls = AtomicUsize::new(0);

        for _ in 0..3 {
            let (result, shared) = flights
                .run("k", async {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(1u32)
                })
                .await;
            assert_eq!(*result.as_ref().unwrap(), 1);
            assert!(!shared);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn errors_fan_out_to_waiters() {
        let flights: Singleflight<u32> = Singleflight::new();

        let failing = async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            Err(anyhow!("resolver exploded"))
        };
        let ((first, _), (second, second_shared)) = tokio::join!(
            flights.run("k", failing),
            flights.run("k", async { Ok(99) })
        );

        let followed = if second_shared { &second } else { &first };
        assert!(followed.as_ref().is_err());
        assert!(
            followed
                .as_ref()
                .unwrap_err()
                .to_string()
                .contains("resolver exploded")
        );
    }
}
