//! Collapse concurrent executions that share a key.
//!
//! While a flight for a key is running, later callers with the same key wait
//! for it and receive its output instead of starting their own.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};

use futures::FutureExt;
use futures::future::{BoxFuture, Shared};

type Flight<T> = Shared<BoxFuture<'static, T>>;

/// Keyed single-flight registry.
pub struct SingleFlight<T: Clone> {
    flights: Arc<Mutex<HashMap<String, Flight<T>>>>,
}

impl<T: Clone> Clone for SingleFlight<T> {
    fn clone(&self) -> Self {
        Self {
            flights: Arc::clone(&self.flights),
        }
    }
}

impl<T: Clone> Default for SingleFlight<T> {
    fn default() -> Self {
        Self {
            flights: Arc::new(Mutex::new(HashMap::new())),
        }
    }
}

impl<T> SingleFlight<T>
where
    T: Clone + Send + Sync + 'static,
{
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `fut` under `key`, or join the flight already running for it.
    ///
    /// The key is released when the flight completes, so a later call runs again.
    pub async fn run<F>(&self, key: &str, fut: F) -> T
    where
        F: Future<Output = T> + Send + 'static,
    {
        let flight = {
            let mut flights = self.flights.lock().unwrap_or_else(PoisonError::into_inner);
            match flights.get(key) {
                Some(existing) => {
                    tracing::trace!(target: "tideway::billing::webhook", key, "Joining in-flight execution");
                    existing.clone()
                }
                None => {
                    let registry = Arc::clone(&self.flights);
                    let owned_key = key.to_string();
                    let flight = async move {
                        let output = fut.await;
                        if let Ok(mut flights) = registry.lock() {
                            flights.remove(&owned_key);
                        }
                        output
                    }
                    .boxed()
                    .shared();
                    flights.insert(key.to_string(), flight.clone());
                    flight
                }
            }
        };
        flight.await
    }

    /// Number of keys with a running flight.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.flights.lock().map(|f| f.len()).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn test_concurrent_calls_share_one_execution() {
        let flights = SingleFlight::<u64>::new();
        let runs = Arc::new(AtomicU64::new(0));

        let make = |runs: Arc<AtomicU64>| async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            runs.fetch_add(1, Ordering::SeqCst) + 1
        };

        let (a, b) = tokio::join!(
            flights.run("sub-1", make(Arc::clone(&runs))),
            flights.run("sub-1", make(Arc::clone(&runs))),
        );
        assert_eq!(a, 1);
        assert_eq!(b, 1);
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert_eq!(flights.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_distinct_keys_run_independently() {
        let flights = SingleFlight::<&'static str>::new();
        let (a, b) = tokio::join!(
            flights.run("a", async { "a" }),
            flights.run("b", async { "b" }),
        );
        assert_eq!((a, b), ("a", "b"));
    }

    #[tokio::test]
    async fn test_key_released_after_completion() {
        let flights = SingleFlight::<u64>::new();
        let runs = Arc::new(AtomicU64::new(0));
        for _ in 0..2 {
            let runs = Arc::clone(&runs);
            flights
                .run("k", async move { runs.fetch_add(1, Ordering::SeqCst) })
                .await;
        }
        assert_eq!(runs.load(Ordering::SeqCst), 2);
    }
}
