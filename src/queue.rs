// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Priority-aware, concurrency-bounded dispatch queue.
//!
//! Items enter one of two heaps: the *priority* heap (ascending numeric
//! priority) or the *bulk* heap (ordered by the configured
//! [`DispatchOrder`]). The queue emits items to its consumer over a channel
//! as concurrency slots allow, always draining the priority heap first.
//!
//! Items may carry a *priority slot*: a named bucket allowing at most one
//! heap-resident item on the priority path at a time. A newer item for an
//! occupied slot takes the slot over and the older item is demoted into the
//! bulk heap: de-prioritized, never dropped. Ties on timestamp keep the
//! existing holder.
//!
//! When every concurrency slot has been taken for longer than the configured
//! jam timeout without a single completion, a [`QueueEvent::Jammed`] is
//! emitted. A jam is a fatal signal to the consumer, not a retryable one.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::config::{DispatchOrder, QueueConfig};
use crate::heap::BinHeap;

/// Baseline priority for slot-tagged items without an explicit one.
const DEFAULT_SLOT_PRIORITY: i64 = 1;

/// The queue's view of an item. Mirrors the outbox file contract: a unique
/// name, a millisecond timestamp, and optional priority/priority-slot tags.
pub trait QueueEntry: Send + Sync + 'static {
    fn name(&self) -> &str;
    fn timestamp(&self) -> i64;
    fn priority(&self) -> Option<i64> {
        None
    }
    fn priority_slot(&self) -> Option<&str> {
        None
    }
}

/// Events emitted to the queue consumer.
#[derive(Debug)]
pub enum QueueEvent<T> {
    /// An item has been dispatched and now occupies a concurrency slot
    /// until [`DispatchQueue::complete`] is called for it. `was_priority`
    /// tells the consumer whether it arrived via the priority path.
    Item { item: Arc<T>, was_priority: bool },
    /// No concurrency slot has freed up within the jam timeout.
    Jammed,
}

struct Inner<T> {
    prio_heap: BinHeap<Arc<T>>,
    bulk_heap: BinHeap<Arc<T>>,
    active_slots: HashMap<String, Arc<T>>,
    pending: Vec<Arc<T>>,
    concurrency: usize,
    paused: bool,
    jam_timer: Option<JoinHandle<()>>,
}

/// Priority dispatch queue.
///
/// Cheap to clone; all clones share the same state. Dispatched items are
/// sent on the channel returned by [`DispatchQueue::new`].
pub struct DispatchQueue<T: QueueEntry> {
    inner: Arc<Mutex<Inner<T>>>,
    events: mpsc::UnboundedSender<QueueEvent<T>>,
    jam_timeout: Duration,
}

impl<T: QueueEntry> Clone for DispatchQueue<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            events: self.events.clone(),
            jam_timeout: self.jam_timeout,
        }
    }
}

fn effective_priority<T: QueueEntry>(e: &T) -> i64 {
    e.priority().unwrap_or(DEFAULT_SLOT_PRIORITY)
}

impl<T: QueueEntry> DispatchQueue<T> {
    /// Create a queue and the event channel its consumer reads from.
    pub fn new(config: &QueueConfig) -> (Self, mpsc::UnboundedReceiver<QueueEvent<T>>) {
        let bulk_cmp: Box<dyn Fn(&Arc<T>, &Arc<T>) -> std::cmp::Ordering + Send> =
            match config.order {
                DispatchOrder::Lexical => Box::new(|a, b| a.name().cmp(b.name())),
                DispatchOrder::ReverseLexical => Box::new(|a, b| b.name().cmp(a.name())),
                DispatchOrder::NewestFirst => Box::new(|a, b| b.timestamp().cmp(&a.timestamp())),
                DispatchOrder::OldestFirst => Box::new(|a, b| a.timestamp().cmp(&b.timestamp())),
            };
        let (tx, rx) = mpsc::unbounded_channel();
        let queue = Self {
            inner: Arc::new(Mutex::new(Inner {
                prio_heap: BinHeap::new(|a: &Arc<T>, b: &Arc<T>| {
                    effective_priority(a.as_ref()).cmp(&effective_priority(b.as_ref()))
                }),
                bulk_heap: BinHeap::new(move |a, b| bulk_cmp(a, b)),
                active_slots: HashMap::new(),
                pending: Vec::new(),
                concurrency: config.concurrency,
                paused: false,
                jam_timer: None,
            })),
            events: tx,
            jam_timeout: Duration::from_millis(config.jam_timeout_ms),
        };
        (queue, rx)
    }

    /// Add an item, dispatch as capacity allows, and (re)arm the jam timer
    /// if the queue is saturated.
    pub fn add(&self, item: Arc<T>) {
        let mut inner = self.inner.lock();
        if let Some(slot) = item.priority_slot() {
            match inner.active_slots.get(slot).cloned() {
                Some(cur) => {
                    if item.timestamp() > cur.timestamp() {
                        // Newer item takes the slot; demote the old holder
                        // into the bulk heap rather than dropping it.
                        debug!(slot, name = item.name(), "priority slot superseded");
                        inner.prio_heap.remove_by_identity(&cur);
                        inner.bulk_heap.insert(cur);
                        inner.active_slots.insert(slot.to_string(), item.clone());
                        inner.prio_heap.insert(item);
                    } else {
                        inner.bulk_heap.insert(item);
                    }
                }
                None => {
                    inner.active_slots.insert(slot.to_string(), item.clone());
                    inner.prio_heap.insert(item);
                }
            }
        } else if item.priority().is_some() {
            inner.prio_heap.insert(item);
        } else {
            inner.bulk_heap.insert(item);
        }
        self.dispatch_locked(&mut inner);
        self.maybe_arm_jam_timer(&mut inner);
    }

    /// Re-queue a previously dispatched item after a transient failure.
    ///
    /// Retries always re-enter the bulk heap, regardless of the item's
    /// original priority tags.
    pub fn requeue(&self, item: Arc<T>) {
        let mut inner = self.inner.lock();
        inner.bulk_heap.insert(item);
        self.dispatch_locked(&mut inner);
        self.maybe_arm_jam_timer(&mut inner);
    }

    /// Release the concurrency slot held by `item` and dispatch further
    /// items. Cancels any running jam timer.
    pub fn complete(&self, item: &Arc<T>) {
        let mut inner = self.inner.lock();
        if let Some(slot) = item.priority_slot() {
            // Dispatch already cleared this; defensive for items completed
            // without ever being dispatched.
            if inner
                .active_slots
                .get(slot)
                .is_some_and(|cur| Arc::ptr_eq(cur, item))
            {
                inner.active_slots.remove(slot);
            }
        }
        inner.pending.retain(|p| !Arc::ptr_eq(p, item));
        Self::cancel_jam_timer(&mut inner);
        self.dispatch_locked(&mut inner);
    }

    /// Stop emitting new dispatches. A paused queue cannot jam.
    pub fn pause(&self) {
        let mut inner = self.inner.lock();
        inner.paused = true;
        Self::cancel_jam_timer(&mut inner);
    }

    /// Resume emitting dispatches.
    pub fn resume(&self) {
        let mut inner = self.inner.lock();
        inner.paused = false;
        self.maybe_arm_jam_timer(&mut inner);
        self.dispatch_locked(&mut inner);
    }

    /// Number of items currently dispatched but not yet completed.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.inner.lock().pending.len()
    }

    /// Number of items waiting in either heap.
    #[must_use]
    pub fn queued_count(&self) -> usize {
        let inner = self.inner.lock();
        inner.prio_heap.size() + inner.bulk_heap.size()
    }

    fn dispatch_locked(&self, inner: &mut Inner<T>) {
        if inner.paused {
            return;
        }
        while inner.pending.len() < inner.concurrency {
            let was_priority = inner.prio_heap.size() > 0;
            let popped = if was_priority {
                inner.prio_heap.pop().ok()
            } else {
                inner.bulk_heap.pop().ok()
            };
            let Some(item) = popped else { break };

            if let Some(slot) = item.priority_slot() {
                // The slot map tracks heap-resident items only. Once the
                // holder is in flight a newer arrival starts a fresh slot
                // instead of demoting (and double-dispatching) this one.
                if inner
                    .active_slots
                    .get(slot)
                    .is_some_and(|cur| Arc::ptr_eq(cur, &item))
                {
                    inner.active_slots.remove(slot);
                }
            }

            inner.pending.push(item.clone());
            if self
                .events
                .send(QueueEvent::Item { item, was_priority })
                .is_err()
            {
                warn!("dispatch queue consumer is gone, dropping item");
            }
        }
    }

    fn maybe_arm_jam_timer(&self, inner: &mut Inner<T>) {
        if inner.paused || inner.jam_timer.is_some() || inner.pending.len() < inner.concurrency {
            return;
        }
        let events = self.events.clone();
        let timeout = self.jam_timeout;
        inner.jam_timer = Some(tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let _ = events.send(QueueEvent::Jammed);
        }));
    }

    fn cancel_jam_timer(inner: &mut Inner<T>) {
        if let Some(timer) = inner.jam_timer.take() {
            timer.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc::error::TryRecvError;

    #[derive(Debug)]
    struct TestItem {
        name: String,
        timestamp: i64,
        priority: Option<i64>,
        priority_slot: Option<String>,
    }

    impl QueueEntry for TestItem {
        fn name(&self) -> &str {
            &self.name
        }
        fn timestamp(&self) -> i64 {
            self.timestamp
        }
        fn priority(&self) -> Option<i64> {
            self.priority
        }
        fn priority_slot(&self) -> Option<&str> {
            self.priority_slot.as_deref()
        }
    }

    fn bulk(name: &str, timestamp: i64) -> Arc<TestItem> {
        Arc::new(TestItem {
            name: name.into(),
            timestamp,
            priority: None,
            priority_slot: None,
        })
    }

    fn slotted(name: &str, timestamp: i64, slot: &str) -> Arc<TestItem> {
        Arc::new(TestItem {
            name: name.into(),
            timestamp,
            priority: None,
            priority_slot: Some(slot.into()),
        })
    }

    fn config(concurrency: usize) -> QueueConfig {
        QueueConfig {
            concurrency,
            ..Default::default()
        }
    }

    fn expect_item(
        rx: &mut mpsc::UnboundedReceiver<QueueEvent<TestItem>>,
    ) -> (Arc<TestItem>, bool) {
        match rx.try_recv().expect("expected a dispatched item") {
            QueueEvent::Item { item, was_priority } => (item, was_priority),
            QueueEvent::Jammed => panic!("unexpected jam"),
        }
    }

    #[tokio::test]
    async fn test_lexical_order_with_concurrency_one() {
        let (q, mut rx) = DispatchQueue::new(&config(1));
        for name in ["b", "a", "e", "c", "d"] {
            q.add(bulk(name, 0));
        }
        let mut order = Vec::new();
        for _ in 0..5 {
            let (item, was_priority) = expect_item(&mut rx);
            assert!(!was_priority);
            order.push(item.name.clone());
            q.complete(&item);
        }
        assert_eq!(order, ["a", "b", "c", "d", "e"]);
    }

    #[tokio::test]
    async fn test_priority_items_leapfrog_bulk() {
        let (q, mut rx) = DispatchQueue::new(&config(1));
        q.add(bulk("a", 0));
        q.add(bulk("b", 0));
        // "a" is in flight; a late-arriving priority item still beats "b"
        let urgent = Arc::new(TestItem {
            name: "z".into(),
            timestamp: 0,
            priority: Some(0),
            priority_slot: None,
        });
        q.add(urgent);

        let (first, _) = expect_item(&mut rx);
        assert_eq!(first.name, "a");
        q.complete(&first);

        let (second, was_priority) = expect_item(&mut rx);
        assert_eq!(second.name, "z");
        assert!(was_priority);
        q.complete(&second);

        let (third, was_priority) = expect_item(&mut rx);
        assert_eq!(third.name, "b");
        assert!(!was_priority);
    }

    #[tokio::test]
    async fn test_slot_supersede_demotes_older() {
        let (q, mut rx) = DispatchQueue::new(&config(1));
        q.add(bulk("hold", 0)); // occupy the only slot

        let older = slotted("older", 100, "cfg");
        let newer = slotted("newer", 200, "cfg");
        q.add(older.clone());
        q.add(newer.clone());

        let (first, _) = expect_item(&mut rx);
        assert_eq!(first.name, "hold");
        q.complete(&first);

        // Only the newer one comes via the priority path
        let (second, was_priority) = expect_item(&mut rx);
        assert!(Arc::ptr_eq(&second, &newer));
        assert!(was_priority);
        q.complete(&second);

        // The older one resurfaces via the bulk path
        let (third, was_priority) = expect_item(&mut rx);
        assert!(Arc::ptr_eq(&third, &older));
        assert!(!was_priority);
    }

    #[tokio::test]
    async fn test_slot_timestamp_tie_keeps_existing_holder() {
        let (q, mut rx) = DispatchQueue::new(&config(1));
        q.add(bulk("hold", 0));

        let first = slotted("first", 100, "cfg");
        let second = slotted("second", 100, "cfg");
        q.add(first.clone());
        q.add(second.clone());

        let (h, _) = expect_item(&mut rx);
        q.complete(&h);

        let (winner, was_priority) = expect_item(&mut rx);
        assert!(Arc::ptr_eq(&winner, &first));
        assert!(was_priority);
    }

    #[tokio::test]
    async fn test_slot_item_without_priority_gets_baseline() {
        let (q, mut rx) = DispatchQueue::new(&config(1));
        q.add(bulk("hold", 0));

        let explicit = Arc::new(TestItem {
            name: "explicit".into(),
            timestamp: 0,
            priority: Some(0),
            priority_slot: None,
        });
        let slot_item = slotted("slot", 0, "cfg");
        q.add(slot_item);
        q.add(explicit.clone());

        let (h, _) = expect_item(&mut rx);
        q.complete(&h);

        // Priority 0 beats the baseline slot priority of 1
        let (first, _) = expect_item(&mut rx);
        assert!(Arc::ptr_eq(&first, &explicit));
    }

    #[tokio::test]
    async fn test_supersede_while_in_flight_does_not_redispatch() {
        let (q, mut rx) = DispatchQueue::new(&config(1));
        let older = slotted("older", 100, "cfg");
        q.add(older.clone());
        let (first, _) = expect_item(&mut rx);
        assert!(Arc::ptr_eq(&first, &older));

        // older is in flight, no longer heap-resident; the newer item must
        // start a fresh slot rather than demote the in-flight one
        let newer = slotted("newer", 200, "cfg");
        q.add(newer.clone());
        q.complete(&older);

        let (second, was_priority) = expect_item(&mut rx);
        assert!(Arc::ptr_eq(&second, &newer));
        assert!(was_priority);
        q.complete(&newer);
        assert!(matches!(rx.try_recv(), Err(TryRecvError::Empty)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_jam_signal_on_sustained_saturation() {
        let cfg = QueueConfig {
            concurrency: 1,
            jam_timeout_ms: 1_000,
            ..Default::default()
        };
        let (q, mut rx) = DispatchQueue::new(&cfg);
        q.add(bulk("a", 0));
        q.add(bulk("b", 0));
        let (_, _) = expect_item(&mut rx);

        // Nothing completes; the jam timer fires exactly once
        match tokio::time::timeout(Duration::from_secs(5), rx.recv()).await {
            Ok(Some(QueueEvent::Jammed)) => {}
            other => panic!("expected jam, got {other:?}"),
        }
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(matches!(rx.try_recv(), Err(TryRecvError::Empty)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_complete_cancels_jam_timer() {
        let cfg = QueueConfig {
            concurrency: 1,
            jam_timeout_ms: 1_000,
            ..Default::default()
        };
        let (q, mut rx) = DispatchQueue::new(&cfg);
        q.add(bulk("a", 0));
        let (item, _) = expect_item(&mut rx);
        tokio::time::sleep(Duration::from_millis(500)).await;
        q.complete(&item);
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(matches!(rx.try_recv(), Err(TryRecvError::Empty)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_paused_queue_cannot_jam() {
        let cfg = QueueConfig {
            concurrency: 1,
            jam_timeout_ms: 1_000,
            ..Default::default()
        };
        let (q, mut rx) = DispatchQueue::new(&cfg);
        q.add(bulk("a", 0));
        let (_, _) = expect_item(&mut rx);
        q.pause();
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(matches!(rx.try_recv(), Err(TryRecvError::Empty)));
    }

    #[tokio::test]
    async fn test_pause_buffers_until_resume() {
        let (q, mut rx) = DispatchQueue::new(&config(2));
        q.pause();
        q.add(bulk("a", 0));
        q.add(bulk("b", 0));
        assert!(matches!(rx.try_recv(), Err(TryRecvError::Empty)));
        assert_eq!(q.queued_count(), 2);

        q.resume();
        let (first, _) = expect_item(&mut rx);
        let (second, _) = expect_item(&mut rx);
        assert_eq!(first.name, "a");
        assert_eq!(second.name, "b");
        assert_eq!(q.pending_count(), 2);
    }
}
