//! Debounced background execution.
//!
//! Read paths (`list`) ask for a provider resync on every call. A
//! [`SyncDebouncer`] collapses such bursts into a single background run per
//! window. The run is spawned with [`spawn_detached`], so it survives the
//! request that triggered it.

use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::task::JoinHandle;

/// Spawn `fut` on the runtime, detached from the caller's lifetime.
///
/// Dropping the returned handle does not cancel the task.
pub fn spawn_detached<F>(task: &'static str, fut: F) -> JoinHandle<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    tracing::trace!(target: "tideway::billing::debounce", task, "Spawning detached task");
    tokio::spawn(fut)
}

#[derive(Default)]
struct DebounceState {
    /// A `call` run is scheduled or executing.
    pending: bool,
    /// Bumped by every `debounce`; only the latest timer fires.
    generation: u64,
}

/// Clears the pending flag when the scheduled run ends, including by panic.
struct PendingGuard(Arc<Mutex<DebounceState>>);

impl Drop for PendingGuard {
    fn drop(&mut self) {
        self.0.lock().unwrap_or_else(PoisonError::into_inner).pending = false;
    }
}

/// Collapses bursts of requests into one delayed execution.
///
/// Each engine owns its own debouncer with its own delay.
#[derive(Clone)]
pub struct SyncDebouncer {
    delay: Duration,
    state: Arc<Mutex<DebounceState>>,
}

impl SyncDebouncer {
    #[must_use]
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            state: Arc::new(Mutex::new(DebounceState::default())),
        }
    }

    #[must_use]
    pub fn delay(&self) -> Duration {
        self.delay
    }

    /// Whether a `call` run is scheduled or still executing.
    #[must_use]
    pub fn is_pending(&self) -> bool {
        self.state.lock().map(|s| s.pending).unwrap_or(false)
    }

    /// Run `f` once after the delay unless a run is already pending.
    ///
    /// Returns `false` when the request was collapsed into a pending run.
    /// The pending flag clears only after `f` finishes or unwinds, so at
    /// most one run is in flight per debouncer.
    pub fn call<F, Fut>(&self, f: F) -> bool
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            if state.pending {
                return false;
            }
            state.pending = true;
        }

        let delay = self.delay;
        let guard = PendingGuard(Arc::clone(&self.state));
        spawn_detached("debounce_call", async move {
            let _guard = guard;
            tokio::time::sleep(delay).await;
            f().await;
        });
        true
    }

    /// Classic trailing-edge debounce: every call restarts the timer and
    /// only the most recent `f` runs once the delay passes without a new call.
    pub fn debounce<F, Fut>(&self, f: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let generation = {
            let Ok(mut state) = self.state.lock() else {
                return;
            };
            state.generation += 1;
            state.generation
        };

        let delay = self.delay;
        let state = Arc::clone(&self.state);
        spawn_detached("debounce_fn", async move {
            tokio::time::sleep(delay).await;
            let latest = state.lock().map(|s| s.generation == generation).unwrap_or(false);
            if latest {
                f().await;
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};

    #[tokio::test]
    async fn test_call_collapses_burst() {
        let debouncer = SyncDebouncer::new(Duration::from_millis(30));
        let runs = Arc::new(AtomicU64::new(0));

        let mut scheduled = 0;
        for _ in 0..10 {
            let runs = Arc::clone(&runs);
            if debouncer.call(move || async move {
                runs.fetch_add(1, Ordering::SeqCst);
            }) {
                scheduled += 1;
            }
        }
        assert_eq!(scheduled, 1);
        assert!(debouncer.is_pending());

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert!(!debouncer.is_pending());

        let runs2 = Arc::clone(&runs);
        assert!(debouncer.call(move || async move {
            runs2.fetch_add(1, Ordering::SeqCst);
        }));
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_call_recovers_after_panicking_run() {
        let debouncer = SyncDebouncer::new(Duration::from_millis(10));
        let explode = true;
        assert!(debouncer.call(move || async move {
            if explode {
                panic!("sync exploded");
            }
        }));

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(!debouncer.is_pending());

        let runs = Arc::new(AtomicU64::new(0));
        let counter = Arc::clone(&runs);
        assert!(debouncer.call(move || async move {
            counter.fetch_add(1, Ordering::SeqCst);
        }));
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_debounce_runs_latest_only() {
        let debouncer = SyncDebouncer::new(Duration::from_millis(40));
        let last = Arc::new(AtomicU64::new(0));
        let runs = Arc::new(AtomicU64::new(0));

        for i in 1..=5u64 {
            let last = Arc::clone(&last);
            let runs = Arc::clone(&runs);
            debouncer.debounce(move || async move {
                last.store(i, Ordering::SeqCst);
                runs.fetch_add(1, Ordering::SeqCst);
            });
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert_eq!(last.load(Ordering::SeqCst), 5);
    }

    #[tokio::test]
    async fn test_detached_task_outlives_caller() {
        let done = Arc::new(AtomicU64::new(0));
        {
            let done = Arc::clone(&done);
            let handle = spawn_detached("test", async move {
                tokio::time::sleep(Duration::from_millis(10)).await;
                done.store(1, Ordering::SeqCst);
            });
            drop(handle);
        }
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(done.load(Ordering::SeqCst), 1);
    }
}
