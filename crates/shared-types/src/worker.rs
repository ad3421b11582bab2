//! Background worker primitives.
//!
//! Every long-running Kestrel subsystem follows the same pattern: producers
//! push work items into a condvar-guarded queue, a dedicated thread swaps the
//! whole batch out under the lock, processes it outside the lock, and goes
//! back to sleep. Shutdown raises a flag and wakes the thread; the owning
//! handle joins it on drop.

use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

/// A thread handle that is joined when dropped.
///
/// Workers must have been told to shut down before their `JoinOnDrop` is
/// dropped, otherwise the drop blocks forever.
pub struct JoinOnDrop {
    handle: Option<JoinHandle<()>>,
}

impl JoinOnDrop {
    pub fn spawn<F>(name: &str, f: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        let handle = thread::Builder::new()
            .name(name.to_string())
            .spawn(f)
            .unwrap_or_else(|e| panic!("failed to spawn thread {name}: {e}"));
        Self {
            handle: Some(handle),
        }
    }
}

impl Drop for JoinOnDrop {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

struct QueueState<T> {
    items: Vec<T>,
    shutdown: bool,
}

struct QueueShared<T> {
    state: Mutex<QueueState<T>>,
    work_ready: Condvar,
}

/// A multi-producer work queue drained in batches by a single worker thread.
///
/// Cloning yields another producer handle onto the same queue.
pub struct WorkQueue<T> {
    shared: Arc<QueueShared<T>>,
}

impl<T> Clone for WorkQueue<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T> Default for WorkQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> WorkQueue<T> {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(QueueShared {
                state: Mutex::new(QueueState {
                    items: Vec::new(),
                    shutdown: false,
                }),
                work_ready: Condvar::new(),
            }),
        }
    }

    /// Enqueue one item. Returns false if the queue has been shut down
    /// (the item is discarded).
    pub fn push(&self, item: T) -> bool {
        let mut state = self.shared.state.lock();
        if state.shutdown {
            return false;
        }
        state.items.push(item);
        self.shared.work_ready.notify_all();
        true
    }

    /// Enqueue a batch of items.
    pub fn push_all(&self, items: impl IntoIterator<Item = T>) -> bool {
        let mut state = self.shared.state.lock();
        if state.shutdown {
            return false;
        }
        state.items.extend(items);
        self.shared.work_ready.notify_all();
        true
    }

    /// Block until work arrives or the queue shuts down. Returns the entire
    /// pending batch, or `None` once shut down.
    ///
    /// The shutdown flag wins over pending work, so a worker observes
    /// shutdown promptly even under a full queue.
    pub fn next_batch(&self) -> Option<Vec<T>> {
        let mut state = self.shared.state.lock();
        while !state.shutdown && state.items.is_empty() {
            self.shared.work_ready.wait(&mut state);
        }
        if state.shutdown {
            return None;
        }
        Some(std::mem::take(&mut state.items))
    }

    /// Raise the shutdown flag and wake the worker.
    pub fn shutdown(&self) {
        let mut state = self.shared.state.lock();
        state.shutdown = true;
        self.shared.work_ready.notify_all();
    }

    pub fn is_shut_down(&self) -> bool {
        self.shared.state.lock().shutdown
    }
}

/// Spawn a worker thread that feeds each queued item to `on_item`, in
/// arrival order, until the queue is shut down.
pub fn spawn_queue_worker<T, F>(name: &str, queue: WorkQueue<T>, mut on_item: F) -> JoinOnDrop
where
    T: Send + 'static,
    F: FnMut(T) + Send + 'static,
{
    JoinOnDrop::spawn(name, move || {
        while let Some(batch) = queue.next_batch() {
            for item in batch {
                on_item(item);
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[test]
    fn test_worker_processes_items() {
        let queue: WorkQueue<usize> = WorkQueue::new();
        let seen = Arc::new(AtomicUsize::new(0));

        let seen_clone = Arc::clone(&seen);
        let worker = spawn_queue_worker("test-worker", queue.clone(), move |n| {
            seen_clone.fetch_add(n, Ordering::SeqCst);
        });

        queue.push(1);
        queue.push(2);
        queue.push_all([3, 4]);

        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while seen.load(Ordering::SeqCst) != 10 && std::time::Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(seen.load(Ordering::SeqCst), 10);

        queue.shutdown();
        drop(worker);
    }

    #[test]
    fn test_push_after_shutdown_is_rejected() {
        let queue: WorkQueue<u8> = WorkQueue::new();
        queue.shutdown();
        assert!(!queue.push(1));
        assert!(queue.next_batch().is_none());
    }

    #[test]
    fn test_shutdown_wakes_blocked_worker() {
        let queue: WorkQueue<u8> = WorkQueue::new();
        let worker = spawn_queue_worker("idle-worker", queue.clone(), |_| {});
        thread::sleep(Duration::from_millis(20));
        queue.shutdown();
        drop(worker); // joins; would hang if the wake-up were lost
    }
}
