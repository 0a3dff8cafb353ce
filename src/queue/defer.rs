//! # Defer Queue
//!
//! Delivers items at (or after) a requested instant. A single processing
//! task owns a binary min-heap ordered by delivery time plus a key to slot
//! map, so deferring a key that is already scheduled only ever moves it
//! earlier (decrease-key), never later.
//!
//! New deferrals arrive over a bounded channel; the processing loop wakes on
//! whichever comes first of shutdown, a heartbeat tick, the next due item or
//! a new deferral.

use super::QueueItem;
use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::warn;

const ADD_CHANNEL_CAPACITY: usize = 128;

struct Deferred<T> {
    item: T,
    at: Instant,
}

struct Entry<T> {
    key: String,
    at: Instant,
    item: T,
}

/// Arena-backed min-heap keyed by item key.
struct DeferHeap<T> {
    entries: Vec<Entry<T>>,
    slots: HashMap<String, usize>,
}

impl<T: QueueItem> DeferHeap<T> {
    fn new() -> Self {
        Self {
            entries: Vec::new(),
            slots: HashMap::new(),
        }
    }

    fn len(&self) -> usize {
        self.entries.len()
    }

    /// Schedule `item` at `at`, or move an already scheduled key earlier.
    fn schedule(&mut self, item: T, at: Instant) {
        let key = item.key();
        if let Some(&slot) = self.slots.get(&key) {
            if at < self.entries[slot].at {
                self.entries[slot].at = at;
                self.sift_up(slot);
            }
            return;
        }

        let slot = self.entries.len();
        self.slots.insert(key.clone(), slot);
        self.entries.push(Entry { key, at, item });
        self.sift_up(slot);
    }

    fn peek_at(&self) -> Option<Instant> {
        self.entries.first().map(|entry| entry.at)
    }

    fn pop(&mut self) -> Option<T> {
        if self.entries.is_empty() {
            return None;
        }
        let last = self.entries.len() - 1;
        self.swap(0, last);
        let entry = self.entries.pop()?;
        self.slots.remove(&entry.key);
        if !self.entries.is_empty() {
            self.sift_down(0);
        }
        Some(entry.item)
    }

    fn swap(&mut self, a: usize, b: usize) {
        if a == b {
            return;
        }
        self.entries.swap(a, b);
        self.slots.insert(self.entries[a].key.clone(), a);
        self.slots.insert(self.entries[b].key.clone(), b);
    }

    fn sift_up(&mut self, mut slot: usize) {
        while slot > 0 {
            let parent = (slot - 1) / 2;
            if self.entries[slot].at >= self.entries[parent].at {
                break;
            }
            self.swap(slot, parent);
            slot = parent;
        }
    }

    fn sift_down(&mut self, mut slot: usize) {
        let len = self.entries.len();
        loop {
            let left = 2 * slot + 1;
            let right = left + 1;
            let mut smallest = slot;
            if left < len && self.entries[left].at < self.entries[smallest].at {
                smallest = left;
            }
            if right < len && self.entries[right].at < self.entries[smallest].at {
                smallest = right;
            }
            if smallest == slot {
                break;
            }
            self.swap(slot, smallest);
            slot = smallest;
        }
    }
}

pub struct DeferQueue<T> {
    tx: mpsc::Sender<Deferred<T>>,
    rx: Mutex<Option<mpsc::Receiver<Deferred<T>>>>,
    heartbeat: Duration,
}

impl<T> std::fmt::Debug for DeferQueue<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeferQueue")
            .field("heartbeat", &self.heartbeat)
            .finish_non_exhaustive()
    }
}

impl<T: QueueItem> DeferQueue<T> {
    #[must_use]
    pub fn new(heartbeat: Duration) -> Self {
        let (tx, rx) = mpsc::channel(ADD_CHANNEL_CAPACITY);
        Self {
            tx,
            rx: Mutex::new(Some(rx)),
            heartbeat,
        }
    }

    /// Schedule `item` for delivery at `until`.
    ///
    /// Best effort: if `cancel` fires first the item is silently dropped.
    pub async fn defer(&self, cancel: &CancellationToken, item: T, until: Instant) {
        let deferred = Deferred { item, at: until };
        tokio::select! {
            biased;
            () = cancel.cancelled() => {}
            sent = self.tx.send(deferred) => {
                if sent.is_err() {
                    warn!("defer queue is no longer processing, dropping deferred item");
                }
            }
        }
    }

    /// Deliver due items to `deliver` until `cancel` fires.
    ///
    /// Only the first call processes; later calls log and return.
    pub async fn process<F>(&self, cancel: &CancellationToken, mut deliver: F)
    where
        F: FnMut(T),
    {
        let taken = self.rx.lock().unwrap_or_else(PoisonError::into_inner).take();
        let Some(mut rx) = taken else {
            warn!("defer queue is already being processed");
            return;
        };

        let mut heap = DeferHeap::new();
        let mut heartbeat = tokio::time::interval(self.heartbeat);
        heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            let now = Instant::now();
            while heap.peek_at().is_some_and(|at| at <= now) {
                if let Some(item) = heap.pop() {
                    deliver(item);
                }
            }

            let next = heap.peek_at();
            tokio::select! {
                biased;
                () = cancel.cancelled() => return,
                _ = heartbeat.tick() => {}
                () = wait_until(next) => {}
                received = rx.recv() => {
                    let Some(deferred) = received else { return };
                    heap.schedule(deferred.item, deferred.at);
                    while let Ok(deferred) = rx.try_recv() {
                        heap.schedule(deferred.item, deferred.at);
                    }
                    tracing::trace!(pending = heap.len(), "defer queue received items");
                }
            }
        }
    }
}

async fn wait_until(at: Option<Instant>) {
    match at {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[derive(Debug, Clone, PartialEq, Eq)]
    struct Item(&'static str);

    impl QueueItem for Item {
        fn key(&self) -> String {
            self.0.to_string()
        }
    }

    fn spawn_processor(
        queue: &Arc<DeferQueue<Item>>,
        cancel: &CancellationToken,
    ) -> mpsc::UnboundedReceiver<(Item, Instant)> {
        let (tx, rx) = mpsc::unbounded_channel();
        let queue = Arc::clone(queue);
        let cancel = cancel.clone();
        tokio::spawn(async move {
            queue
                .process(&cancel, |item| {
                    let _ = tx.send((item, Instant::now()));
                })
                .await;
        });
        rx
    }

    #[test]
    fn test_heap_pops_in_time_order() {
        let start = Instant::now();
        let mut heap = DeferHeap::new();
        heap.schedule(Item("c"), start + Duration::from_millis(30));
        heap.schedule(Item("a"), start + Duration::from_millis(10));
        heap.schedule(Item("d"), start + Duration::from_millis(40));
        heap.schedule(Item("b"), start + Duration::from_millis(20));

        let order: Vec<_> = std::iter::from_fn(|| heap.pop()).collect();
        assert_eq!(order, vec![Item("a"), Item("b"), Item("c"), Item("d")]);
        assert!(heap.slots.is_empty());
    }

    #[test]
    fn test_heap_only_moves_keys_earlier() {
        let start = Instant::now();
        let mut heap = DeferHeap::new();
        heap.schedule(Item("a"), start + Duration::from_millis(50));
        heap.schedule(Item("b"), start + Duration::from_millis(20));

        heap.schedule(Item("a"), start + Duration::from_millis(10));
        assert_eq!(heap.len(), 2);
        assert_eq!(heap.peek_at(), Some(start + Duration::from_millis(10)));

        heap.schedule(Item("a"), start + Duration::from_millis(90));
        assert_eq!(heap.peek_at(), Some(start + Duration::from_millis(10)));
        assert_eq!(heap.pop(), Some(Item("a")));
        assert_eq!(heap.pop(), Some(Item("b")));
        assert_eq!(heap.pop(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_process_delivers_in_time_order() {
        let cancel = CancellationToken::new();
        let queue = Arc::new(DeferQueue::new(Duration::from_secs(10)));
        let mut delivered = spawn_processor(&queue, &cancel);

        let start = Instant::now();
        queue
            .defer(&cancel, Item("three"), start + Duration::from_millis(300))
            .await;
        queue
            .defer(&cancel, Item("one"), start + Duration::from_millis(100))
            .await;
        queue
            .defer(&cancel, Item("two"), start + Duration::from_millis(200))
            .await;

        for expected in ["one", "two", "three"] {
            let (item, at) = delivered.recv().await.unwrap();
            assert_eq!(item, Item(expected));
            assert!(at >= start + Duration::from_millis(100));
        }
        cancel.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn test_order_holds_with_cancelled_defers_interleaved() {
        let cancel = CancellationToken::new();
        let queue = Arc::new(DeferQueue::new(Duration::from_secs(10)));
        let mut delivered = spawn_processor(&queue, &cancel);
        let dropped = cancel.child_token();
        dropped.cancel();

        let start = Instant::now();
        let at = |millis| start + Duration::from_millis(millis);
        queue.defer(&cancel, Item("c"), at(300)).await;
        queue.defer(&dropped, Item("x"), at(50)).await;
        queue.defer(&cancel, Item("a"), at(100)).await;
        queue.defer(&dropped, Item("y"), at(150)).await;
        queue.defer(&cancel, Item("b"), at(200)).await;
        queue.defer(&dropped, Item("z"), at(250)).await;

        for (expected, due) in [("a", 100), ("b", 200), ("c", 300)] {
            let (item, delivered_at) = delivered.recv().await.unwrap();
            assert_eq!(item, Item(expected));
            assert!(delivered_at >= at(due));
        }

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(delivered.try_recv().is_err());
        cancel.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn test_redeferring_earlier_delivers_once() {
        let cancel = CancellationToken::new();
        let queue = Arc::new(DeferQueue::new(Duration::from_secs(10)));
        let mut delivered = spawn_processor(&queue, &cancel);

        let start = Instant::now();
        queue
            .defer(&cancel, Item("a"), start + Duration::from_millis(500))
            .await;
        queue
            .defer(&cancel, Item("a"), start + Duration::from_millis(50))
            .await;

        let (item, at) = delivered.recv().await.unwrap();
        assert_eq!(item, Item("a"));
        assert!(at < start + Duration::from_millis(500));

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(delivered.try_recv().is_err());
        cancel.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn test_defer_after_cancel_is_dropped() {
        let cancel = CancellationToken::new();
        let queue: DeferQueue<Item> = DeferQueue::new(Duration::from_secs(10));
        cancel.cancel();

        // Returns immediately rather than waiting on the channel.
        queue.defer(&cancel, Item("a"), Instant::now()).await;
        queue.process(&cancel, |_| panic!("nothing to deliver")).await;
    }
}
