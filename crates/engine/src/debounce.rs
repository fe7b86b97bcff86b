//! Keyed debounce scheduling and file-settling checks.
//!
//! Rapid repeated requests for the same asset collapse into one: scheduling a
//! key that already has pending work replaces it, and only the latest work runs
//! once the delay expires. Work that has already started is never aborted by a
//! later schedule.

use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::task::AbortHandle;
use tokio::time::sleep;

struct Pending {
    generation: u64,
    handle: AbortHandle,
}

struct Inner<K> {
    next_generation: u64,
    pending: HashMap<K, Pending>,
}

/// Delays work per key, keeping only the most recent schedule.
pub struct Scheduler<K> {
    inner: Arc<Mutex<Inner<K>>>,
}

fn lock<K>(inner: &Mutex<Inner<K>>) -> MutexGuard<'_, Inner<K>> {
    inner.lock().unwrap_or_else(|e| e.into_inner())
}

impl<K> Default for Scheduler<K> {
    fn default() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                next_generation: 0,
                pending: HashMap::new(),
            })),
        }
    }
}

impl<K> Scheduler<K>
where
    K: Eq + Hash + Clone + Send + 'static,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `work` after `delay` unless `key` is scheduled again first.
    pub fn schedule<F>(&self, key: K, delay: Duration, work: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        // Held across the spawn so the task cannot look for its entry before
        // it has been inserted.
        let mut inner = lock(&self.inner);
        inner.next_generation += 1;
        let generation = inner.next_generation;

        let shared = Arc::clone(&self.inner);
        let task_key = key.clone();
        let handle = tokio::spawn(async move {
            if !delay.is_zero() {
                sleep(delay).await;
            }
            {
                let mut inner = lock(&shared);
                match inner.pending.get(&task_key) {
                    Some(entry) if entry.generation == generation => {
                        inner.pending.remove(&task_key);
                    }
                    _ => return,
                }
            }
            work.await;
        });

        if let Some(previous) = inner.pending.insert(
            key,
            Pending {
                generation,
                handle: handle.abort_handle(),
            },
        ) {
            previous.handle.abort();
        }
    }

    /// Drop pending work for `key`. Returns whether anything was pending.
    pub fn cancel(&self, key: &K) -> bool {
        match lock(&self.inner).pending.remove(key) {
            Some(entry) => {
                entry.handle.abort();
                true
            }
            None => false,
        }
    }

    pub fn is_pending(&self, key: &K) -> bool {
        lock(&self.inner).pending.contains_key(key)
    }

    pub fn pending_count(&self) -> usize {
        lock(&self.inner).pending.len()
    }
}

impl<K> Drop for Scheduler<K> {
    fn drop(&mut self) {
        for (_, entry) in lock(&self.inner).pending.drain() {
            entry.handle.abort();
        }
    }
}

/// Result of comparing a file's size across a settle window.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StabilityResult {
    /// Size unchanged: the writer is done.
    Stable,
    /// Still being written.
    Unstable { initial_size: u64, current_size: u64 },
}

/// Compare a file's size now with the size recorded when it was scheduled.
#[inline]
pub fn compare_sizes(initial_size: u64, current_size: u64) -> StabilityResult {
    if initial_size == current_size {
        StabilityResult::Stable
    } else {
        StabilityResult::Unstable {
            initial_size,
            current_size,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::mpsc;

    #[tokio::test]
    async fn test_rapid_schedules_collapse_to_latest() {
        let scheduler = Scheduler::new();
        let (tx, mut rx) = mpsc::unbounded_channel();

        for value in 0..5 {
            let tx = tx.clone();
            scheduler.schedule("asset", Duration::from_millis(80), async move {
                let _ = tx.send(value);
            });
            sleep(Duration::from_millis(10)).await;
        }
        drop(tx);

        assert_eq!(rx.recv().await, Some(4));
        sleep(Duration::from_millis(150)).await;
        assert!(rx.try_recv().is_err(), "superseded work must not run");
        assert!(!scheduler.is_pending(&"asset"));
    }

    #[tokio::test]
    async fn test_keys_are_independent() {
        let scheduler = Scheduler::new();
        let runs = Arc::new(AtomicUsize::new(0));
        for key in ["a", "b", "c"] {
            let runs = runs.clone();
            scheduler.schedule(key, Duration::from_millis(20), async move {
                runs.fetch_add(1, Ordering::SeqCst);
            });
        }
        assert_eq!(scheduler.pending_count(), 3);
        sleep(Duration::from_millis(120)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 3);
        assert_eq!(scheduler.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_cancel_prevents_run() {
        let scheduler = Scheduler::new();
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = runs.clone();
        scheduler.schedule(1u32, Duration::from_millis(30), async move {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        assert!(scheduler.cancel(&1));
        assert!(!scheduler.cancel(&1));
        sleep(Duration::from_millis(100)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_started_work_is_not_aborted() {
        let scheduler = Scheduler::new();
        let finished = Arc::new(AtomicUsize::new(0));

        let counter = finished.clone();
        scheduler.schedule("asset", Duration::ZERO, async move {
            sleep(Duration::from_millis(80)).await;
            counter.fetch_add(1, Ordering::SeqCst);
        });
        sleep(Duration::from_millis(20)).await;

        let counter = finished.clone();
        scheduler.schedule("asset", Duration::ZERO, async move {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        sleep(Duration::from_millis(200)).await;
        assert_eq!(finished.load(Ordering::SeqCst), 2);
    }

    proptest! {
        #[test]
        fn prop_size_comparison(initial_size: u64, current_size: u64) {
            let result = compare_sizes(initial_size, current_size);
            if initial_size == current_size {
                prop_assert_eq!(result, StabilityResult::Stable);
            } else {
                prop_assert_eq!(result, StabilityResult::Unstable { initial_size, current_size });
            }
        }
    }
}
