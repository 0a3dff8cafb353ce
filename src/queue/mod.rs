//! # Work Queue
//!
//! De-duplicating, rate-limited, deferrable work queue.
//!
//! Items are identified by [`QueueItem::key`]. The queue keeps three sets:
//!
//! - `queue`: ready items waiting for [`WorkQueue::get`]
//! - `dirty`: everything logically queued, including keys re-added while
//!   they are being processed
//! - `processing`: keys currently checked out by a `get` caller
//!
//! A key is handed to at most one caller at a time. Adding a key while it
//! is processing only marks it dirty; the matching [`WorkQueue::done`] puts
//! it back on the queue, so no change is lost.
//!
//! Shutdown is a one-way latch tied to the queue's cancellation token.

pub mod defer;
pub mod rate;

pub use defer::DeferQueue;
pub use rate::{ExponentialRateLimiter, RateLimiter};

use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// A unit of work. `key` is the sole de-duplication axis and must be stable
/// for identical logical work.
pub trait QueueItem: Clone + Send + Sync + 'static {
    fn key(&self) -> String;
}

struct State<T> {
    queue: VecDeque<T>,
    dirty: HashMap<String, T>,
    processing: HashSet<String>,
}

pub struct WorkQueue<T> {
    state: Mutex<State<T>>,
    notify: Notify,
    cancel: CancellationToken,
    defer: DeferQueue<T>,
    limiter: Arc<dyn RateLimiter>,
}

impl<T> fmt::Debug for WorkQueue<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        f.debug_struct("WorkQueue")
            .field("queued", &state.queue.len())
            .field("dirty", &state.dirty.len())
            .field("processing", &state.processing.len())
            .field("shutting_down", &self.cancel.is_cancelled())
            .finish_non_exhaustive()
    }
}

/// Create a work queue with an exponential rate limiter and start its
/// deferral loop. The queue shuts down when `cancel` fires.
pub fn run_work_queue<T: QueueItem>(
    cancel: &CancellationToken,
    base_backoff: Duration,
    max_backoff: Duration,
    heartbeat: Duration,
) -> Arc<WorkQueue<T>> {
    let limiter = Arc::new(ExponentialRateLimiter::new(base_backoff, max_backoff));
    let queue = Arc::new(WorkQueue::new(cancel.clone(), limiter, heartbeat));
    let worker = Arc::clone(&queue);
    tokio::spawn(async move { worker.run().await });
    queue
}

impl<T: QueueItem> WorkQueue<T> {
    /// Build a queue without starting its deferral loop; see [`WorkQueue::run`].
    pub fn new(cancel: CancellationToken, limiter: Arc<dyn RateLimiter>, heartbeat: Duration) -> Self {
        Self {
            state: Mutex::new(State {
                queue: VecDeque::new(),
                dirty: HashMap::new(),
                processing: HashSet::new(),
            }),
            notify: Notify::new(),
            cancel,
            defer: DeferQueue::new(heartbeat),
            limiter,
        }
    }

    /// Forward due deferred items into the queue until shutdown, then wake
    /// every blocked `get`.
    pub async fn run(&self) {
        self.defer.process(&self.cancel, |item| self.add(item)).await;
        self.notify.notify_waiters();
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State<T>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn is_shutting_down(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Number of items ready to be handed out.
    pub fn len(&self) -> usize {
        self.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Wait for the next item and mark it processing.
    ///
    /// Returns `None` once the queue is empty and shutting down.
    pub async fn get(&self) -> Option<T> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.lock();
                if let Some(item) = state.queue.pop_front() {
                    let key = item.key();
                    state.dirty.remove(&key);
                    state.processing.insert(key);
                    return Some(item);
                }
                if self.cancel.is_cancelled() {
                    return None;
                }
            }

            tokio::select! {
                () = self.cancel.cancelled() => {}
                () = &mut notified => {}
            }
        }
    }

    /// Queue `item` unless its key is already queued. The first payload
    /// added for a dirty key is the one delivered.
    pub fn add(&self, item: T) {
        if self.cancel.is_cancelled() {
            return;
        }
        let key = item.key();
        let mut state = self.lock();
        if state.dirty.contains_key(&key) {
            return;
        }
        let processing = state.processing.contains(&key);
        state.dirty.insert(key, item.clone());
        if !processing {
            state.queue.push_back(item);
            drop(state);
            self.notify.notify_one();
        }
    }

    /// Queue `item` after `delay`. A zero delay queues immediately.
    pub async fn add_after(&self, item: T, delay: Duration) {
        if self.cancel.is_cancelled() {
            return;
        }
        if delay.is_zero() {
            self.add(item);
            return;
        }
        self.defer
            .defer(&self.cancel, item, Instant::now() + delay)
            .await;
    }

    /// Queue `item` after the rate limiter's next backoff for its key.
    pub async fn add_rate_limited(&self, item: T) {
        let delay = self.limiter.next_retry(&item.key());
        self.add_after(item, delay).await;
    }

    /// Clear the rate limiter's memory of `item`. Queue membership is unchanged.
    pub fn forget(&self, item: &T) {
        self.limiter.forget(&item.key());
    }

    /// Finish processing `item`, re-queueing it if it was added meanwhile.
    pub fn done(&self, item: &T) {
        let key = item.key();
        let mut state = self.lock();
        state.processing.remove(&key);
        if let Some(dirty) = state.dirty.get(&key).cloned() {
            state.queue.push_back(dirty);
            drop(state);
            self.notify.notify_one();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, PartialEq, Eq)]
    struct Item {
        key: &'static str,
        payload: u32,
    }

    impl Item {
        fn new(key: &'static str) -> Self {
            Self { key, payload: 0 }
        }
    }

    impl QueueItem for Item {
        fn key(&self) -> String {
            self.key.to_string()
        }
    }

    fn queue(cancel: &CancellationToken) -> Arc<WorkQueue<Item>> {
        run_work_queue(
            cancel,
            Duration::from_millis(5),
            Duration::from_secs(1000),
            Duration::from_secs(10),
        )
    }

    #[tokio::test]
    async fn test_add_deduplicates_queued_keys() {
        let cancel = CancellationToken::new();
        let q = queue(&cancel);

        q.add(Item::new("a"));
        q.add(Item::new("a"));
        q.add(Item::new("b"));
        assert_eq!(q.len(), 2);

        assert_eq!(q.get().await, Some(Item::new("a")));
        assert_eq!(q.get().await, Some(Item::new("b")));
        assert!(q.is_empty());
        cancel.cancel();
    }

    #[tokio::test]
    async fn test_first_payload_wins_while_dirty() {
        let cancel = CancellationToken::new();
        let q = queue(&cancel);

        q.add(Item { key: "a", payload: 1 });
        q.add(Item { key: "a", payload: 2 });

        assert_eq!(q.get().await.map(|item| item.payload), Some(1));
        cancel.cancel();
    }

    #[tokio::test]
    async fn test_readd_while_processing_is_delivered_after_done() {
        let cancel = CancellationToken::new();
        let q = queue(&cancel);

        q.add(Item::new("a"));
        let item = q.get().await.unwrap();

        // Re-added while in flight: not handed out again yet.
        q.add(Item::new("a"));
        q.add(Item::new("a"));
        assert!(q.is_empty());

        q.done(&item);
        assert_eq!(q.len(), 1);
        let again = q.get().await.unwrap();
        assert_eq!(again, item);

        q.done(&again);
        assert!(q.is_empty());
        cancel.cancel();
    }

    #[tokio::test]
    async fn test_blocked_get_wakes_on_add() {
        let cancel = CancellationToken::new();
        let q = queue(&cancel);

        let getter = {
            let q = Arc::clone(&q);
            tokio::spawn(async move { q.get().await })
        };
        tokio::task::yield_now().await;
        q.add(Item::new("a"));

        assert_eq!(getter.await.unwrap(), Some(Item::new("a")));
        cancel.cancel();
    }

    #[tokio::test]
    async fn test_shutdown_releases_blocked_getters() {
        let cancel = CancellationToken::new();
        let q = queue(&cancel);

        let getters: Vec<_> = (0..3)
            .map(|_| {
                let q = Arc::clone(&q);
                tokio::spawn(async move { q.get().await })
            })
            .collect();
        tokio::task::yield_now().await;
        cancel.cancel();

        for getter in getters {
            assert_eq!(getter.await.unwrap(), None);
        }

        q.add(Item::new("a"));
        q.add_after(Item::new("b"), Duration::from_millis(1)).await;
        assert!(q.is_empty());
        assert_eq!(q.get().await, None);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_getters_process_each_key_once_at_a_time() {
        use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

        const KEYS: [&str; 5] = ["k0", "k1", "k2", "k3", "k4"];

        #[derive(Default)]
        struct Stats {
            in_flight: HashMap<String, usize>,
            last_get: HashMap<String, u64>,
        }

        let cancel = CancellationToken::new();
        let q = queue(&cancel);
        let seq = Arc::new(AtomicU64::new(0));
        let stats = Arc::new(Mutex::new(Stats::default()));
        let max_in_flight = Arc::new(AtomicUsize::new(0));

        let workers: Vec<_> = (0..4)
            .map(|_| {
                let (q, seq, stats, max_in_flight) = (
                    Arc::clone(&q),
                    Arc::clone(&seq),
                    Arc::clone(&stats),
                    Arc::clone(&max_in_flight),
                );
                tokio::spawn(async move {
                    while let Some(item) = q.get().await {
                        let got = seq.fetch_add(1, Ordering::SeqCst);
                        {
                            let mut stats = stats.lock().unwrap();
                            let in_flight = stats.in_flight.entry(item.key()).or_default();
                            *in_flight += 1;
                            max_in_flight.fetch_max(*in_flight, Ordering::SeqCst);
                            stats.last_get.insert(item.key(), got);
                        }
                        tokio::time::sleep(Duration::from_micros(200)).await;
                        *stats.lock().unwrap().in_flight.entry(item.key()).or_default() -= 1;
                        q.done(&item);
                    }
                })
            })
            .collect();

        let mut last_add = HashMap::new();
        for round in 0..50 {
            for key in KEYS {
                last_add.insert(key.to_string(), seq.fetch_add(1, Ordering::SeqCst));
                q.add(Item { key, payload: round });
            }
            tokio::task::yield_now().await;
        }

        // Keys added while in flight were marked dirty and must come back.
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let all_redelivered = {
                    let stats = stats.lock().unwrap();
                    last_add
                        .iter()
                        .all(|(key, added)| stats.last_get.get(key).is_some_and(|got| got > added))
                };
                if all_redelivered {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("every key is processed after its last add");

        cancel.cancel();
        for worker in workers {
            worker.await.unwrap();
        }
        assert_eq!(max_in_flight.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_add_after_delays_delivery() {
        let cancel = CancellationToken::new();
        let q = queue(&cancel);

        let start = Instant::now();
        q.add_after(Item::new("a"), Duration::from_millis(250)).await;
        assert!(q.is_empty());

        assert_eq!(q.get().await, Some(Item::new("a")));
        assert!(start.elapsed() >= Duration::from_millis(250));
        cancel.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn test_add_rate_limited_escalates_until_forget() {
        let cancel = CancellationToken::new();
        let q = run_work_queue(
            &cancel,
            Duration::from_millis(100),
            Duration::from_secs(10),
            Duration::from_secs(10),
        );
        let item = Item::new("a");

        for expected in [100, 200, 400] {
            let start = Instant::now();
            q.add_rate_limited(item.clone()).await;
            let got = q.get().await.unwrap();
            assert!(start.elapsed() >= Duration::from_millis(expected));
            q.done(&got);
        }

        q.forget(&item);
        let start = Instant::now();
        q.add_rate_limited(item.clone()).await;
        q.get().await.unwrap();
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(100));
        assert!(elapsed < Duration::from_millis(200));
        cancel.cancel();
    }
}
