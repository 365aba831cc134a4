//! O(1) schedule/cancel timer wheel (§4.3).
//!
//! Backed by a min-heap ordered by expiry instant, exactly like the
//! discrete-event priority queues used elsewhere in this corpus for
//! deterministic "earliest wins" scheduling. Cancellation is lazy: a
//! cancelled handle is recorded in a set and skipped when its turn comes up,
//! rather than removed from the heap in place (which would be O(n)).
//!
//! All expirations are delivered on a single channel so that a fired timer
//! re-enters the runtime through the same serializing point as an external
//! event (§5).

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::{Arc, Mutex as StdMutex};
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tokio::time::{Duration, Instant};

/// Opaque handle returned by `schedule`, passed back to `cancel`.
pub type TimerHandle = u64;

#[derive(Debug)]
struct Scheduled {
    expires_at: Instant,
    handle: TimerHandle,
}

impl PartialEq for Scheduled {
    fn eq(&self, other: &Self) -> bool {
        self.expires_at == other.expires_at && self.handle == other.handle
    }
}
impl Eq for Scheduled {}
impl PartialOrd for Scheduled {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for Scheduled {
    fn cmp(&self, other: &Self) -> Ordering {
        // BinaryHeap is a max-heap; reverse so the earliest expiry sorts first.
        other.expires_at.cmp(&self.expires_at)
    }
}

struct Shared {
    heap: StdMutex<BinaryHeap<Scheduled>>,
    cancelled: StdMutex<HashSet<TimerHandle>>,
    notify: Notify,
    next_handle: AtomicU64,
}

/// A handle to the background timer task. Clone to share across the
/// component registry; the background task is torn down when the last
/// clone is dropped.
#[derive(Clone)]
pub struct TimerWheel {
    shared: Arc<Shared>,
    worker: Arc<JoinHandle<()>>,
}

impl TimerWheel {
    /// Spawn the timer wheel's background task. Returns the wheel handle and
    /// the receiver side of the fired-timer channel, which the owning
    /// `FSMRuntime` drains into its event-serialization point.
    pub fn spawn() -> (Self, mpsc::UnboundedReceiver<TimerHandle>) {
        let (fired_tx, fired_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared {
            heap: StdMutex::new(BinaryHeap::new()),
            cancelled: StdMutex::new(HashSet::new()),
            notify: Notify::new(),
            next_handle: AtomicU64::new(1),
        });
        let worker_shared = shared.clone();
        let worker = tokio::spawn(Self::run(worker_shared, fired_tx));
        (
            Self {
                shared,
                worker: Arc::new(worker),
            },
            fired_rx,
        )
    }

    /// Schedule a fire `delay` from now. `delay = 0` fires on the next
    /// scheduler tick rather than synchronously (boundary behavior, §8).
    pub fn schedule(&self, delay: Duration) -> TimerHandle {
        let handle = self.shared.next_handle.fetch_add(1, AtomicOrdering::Relaxed);
        let expires_at = Instant::now() + delay;
        self.shared
            .heap
            .lock()
            .unwrap()
            .push(Scheduled { expires_at, handle });
        self.shared.notify.notify_one();
        handle
    }

    /// Cancel a previously scheduled timer. No-op if it already fired or was
    /// already cancelled.
    pub fn cancel(&self, handle: TimerHandle) {
        self.shared.cancelled.lock().unwrap().insert(handle);
    }

    async fn run(shared: Arc<Shared>, fired_tx: mpsc::UnboundedSender<TimerHandle>) {
        loop {
            let next = shared
                .heap
                .lock()
                .unwrap()
                .peek()
                .map(|s| (s.expires_at, s.handle));

            match next {
                None => shared.notify.notified().await,
                Some((expires_at, handle)) => {
                    tokio::select! {
                        _ = tokio::time::sleep_until(expires_at) => {
                            let fired = {
                                let mut heap = shared.heap.lock().unwrap();
                                match heap.peek() {
                                    Some(top) if top.handle == handle => {
                                        heap.pop();
                                        true
                                    }
                                    _ => false,
                                }
                            };
                            if fired {
                                let was_cancelled = shared.cancelled.lock().unwrap().remove(&handle);
                                if !was_cancelled {
                                    let _ = fired_tx.send(handle);
                                }
                            }
                        }
                        _ = shared.notify.notified() => {
                            // A new, possibly-earlier timer was scheduled; loop to re-peek.
                        }
                    }
                }
            }
        }
    }
}

impl Drop for TimerWheel {
    fn drop(&mut self) {
        if Arc::strong_count(&self.worker) == 1 {
            self.worker.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration as StdDuration;

    #[tokio::test]
    async fn fires_after_delay() {
        let (wheel, mut rx) = TimerWheel::spawn();
        let handle = wheel.schedule(Duration::from_millis(20));
        let fired = tokio::time::timeout(StdDuration::from_millis(200), rx.recv())
            .await
            .expect("should fire")
            .unwrap();
        assert_eq!(fired, handle);
    }

    #[tokio::test]
    async fn cancelled_timer_never_fires() {
        let (wheel, mut rx) = TimerWheel::spawn();
        let handle = wheel.schedule(Duration::from_millis(20));
        wheel.cancel(handle);
        let result = tokio::time::timeout(StdDuration::from_millis(100), rx.recv()).await;
        assert!(result.is_err(), "cancelled timer must not fire");
    }

    #[tokio::test]
    async fn earliest_fires_first() {
        let (wheel, mut rx) = TimerWheel::spawn();
        let late = wheel.schedule(Duration::from_millis(60));
        let early = wheel.schedule(Duration::from_millis(10));
        let first = rx.recv().await.unwrap();
        assert_eq!(first, early);
        let second = rx.recv().await.unwrap();
        assert_eq!(second, late);
    }

    #[tokio::test]
    async fn zero_delay_fires_on_next_tick() {
        let (wheel, mut rx) = TimerWheel::spawn();
        let handle = wheel.schedule(Duration::from_millis(0));
        let fired = tokio::time::timeout(StdDuration::from_millis(100), rx.recv())
            .await
            .expect("should fire")
            .unwrap();
        assert_eq!(fired, handle);
    }
}
