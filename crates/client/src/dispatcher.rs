//! Bounded fan-out of decoded events.
//!
//! Every subscriber owns a fixed-size ring. Publishing never waits on a slow
//! consumer: a full ring drops its oldest entry and counts the drop. Locks
//! are `std::sync` and only held for a push or pop, never across `.await`.

use std::{
    collections::{HashMap, VecDeque},
    sync::{
        Arc, Mutex, RwLock, Weak,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
};

use {
    futures::{Stream, stream},
    tokio::sync::Notify,
    tracing::trace,
};

pub const DEFAULT_BUFFER_CAPACITY: usize = 200;

// ── Buffer ──────────────────────────────────────────────────────────────────

/// Ring buffer that keeps the most recent `capacity` items.
#[derive(Debug, Clone)]
pub struct EventBuffer<T> {
    items: VecDeque<T>,
    capacity: usize,
    dropped: u64,
}

impl<T> EventBuffer<T> {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            items: VecDeque::with_capacity(capacity),
            capacity,
            dropped: 0,
        }
    }

    /// Append, evicting the oldest item when full. Returns whether an item
    /// was evicted.
    pub fn push(&mut self, item: T) -> bool {
        let evicted = if self.items.len() == self.capacity {
            self.items.pop_front();
            self.dropped += 1;
            true
        } else {
            false
        };
        self.items.push_back(item);
        evicted
    }

    pub fn pop(&mut self) -> Option<T> {
        self.items.pop_front()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Items evicted since creation.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.items.iter()
    }
}

impl<T> Default for EventBuffer<T> {
    fn default() -> Self {
        Self::new(DEFAULT_BUFFER_CAPACITY)
    }
}

// ── Dispatcher ──────────────────────────────────────────────────────────────

struct Slot<T> {
    buffer: Mutex<EventBuffer<Arc<T>>>,
    notify: Notify,
    /// Set by the subscriber side; buffered items are discarded.
    cancelled: AtomicBool,
    /// Set by the dispatcher; buffered items still drain.
    closed: AtomicBool,
}

impl<T> Slot<T> {
    fn new(capacity: usize) -> Self {
        Self {
            buffer: Mutex::new(EventBuffer::new(capacity)),
            notify: Notify::new(),
            cancelled: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        }
    }

    fn pop(&self) -> Option<Arc<T>> {
        self.buffer.lock().unwrap_or_else(|e| e.into_inner()).pop()
    }
}

struct Inner<T> {
    slots: RwLock<HashMap<u64, Arc<Slot<T>>>>,
    next_id: AtomicU64,
    closed: AtomicBool,
}

impl<T> Inner<T> {
    fn remove(&self, id: u64) {
        self.slots
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&id);
    }
}

/// Publishes each event to every live subscription.
pub struct Dispatcher<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for Dispatcher<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> Default for Dispatcher<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Dispatcher<T> {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                slots: RwLock::new(HashMap::new()),
                next_id: AtomicU64::new(1),
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// Deliver to every subscriber. Returns the number of subscribers that
    /// received the event.
    pub fn publish(&self, event: T) -> usize {
        if self.inner.closed.load(Ordering::Acquire) {
            return 0;
        }
        let event = Arc::new(event);
        let slots = self.inner.slots.read().unwrap_or_else(|e| e.into_inner());
        for (id, slot) in slots.iter() {
            let evicted = slot
                .buffer
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .push(Arc::clone(&event));
            if evicted {
                trace!(subscriber = id, "dispatcher: buffer full, dropped oldest");
            }
            slot.notify.notify_one();
        }
        slots.len()
    }

    /// New subscription with its own ring of `capacity` events. Subscribing
    /// to a closed dispatcher yields an already-ended subscription.
    pub fn subscribe(&self, capacity: usize) -> Subscription<T> {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let slot = Arc::new(Slot::new(capacity));
        if self.inner.closed.load(Ordering::Acquire) {
            slot.closed.store(true, Ordering::Release);
        } else {
            self.inner
                .slots
                .write()
                .unwrap_or_else(|e| e.into_inner())
                .insert(id, Arc::clone(&slot));
        }
        Subscription {
            id,
            slot,
            dispatcher: Arc::downgrade(&self.inner),
        }
    }

    /// End every subscription. Later publishes are discarded.
    pub fn close(&self) {
        self.inner.closed.store(true, Ordering::Release);
        let slots = std::mem::take(
            &mut *self.inner.slots.write().unwrap_or_else(|e| e.into_inner()),
        );
        for slot in slots.values() {
            slot.closed.store(true, Ordering::Release);
            slot.notify.notify_one();
        }
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.slots.read().unwrap_or_else(|e| e.into_inner()).len()
    }
}

// ── Subscription ────────────────────────────────────────────────────────────

/// Receiving side of a [`Dispatcher`]. Dropping it unsubscribes.
pub struct Subscription<T> {
    id: u64,
    slot: Arc<Slot<T>>,
    dispatcher: Weak<Inner<T>>,
}

impl<T> Subscription<T> {
    /// Next event, or `None` once cancelled or once the dispatcher is closed
    /// and the ring has drained.
    pub async fn recv(&mut self) -> Option<Arc<T>> {
        loop {
            if self.slot.cancelled.load(Ordering::Acquire) {
                return None;
            }
            if let Some(event) = self.slot.pop() {
                return Some(event);
            }
            if self.slot.closed.load(Ordering::Acquire) {
                return None;
            }
            // `notify_one` stores a permit when nobody is waiting, so a publish
            // between the pop above and this await is not lost.
            self.slot.notify.notified().await;
        }
    }

    pub fn try_recv(&mut self) -> Option<Arc<T>> {
        if self.slot.cancelled.load(Ordering::Acquire) {
            return None;
        }
        self.slot.pop()
    }

    /// Events evicted from this subscription's ring so far.
    pub fn dropped(&self) -> u64 {
        self.slot
            .buffer
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .dropped()
    }

    pub fn len(&self) -> usize {
        self.slot.buffer.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Handle that cancels this subscription from elsewhere.
    pub fn canceller(&self) -> SubscriptionCanceller<T> {
        SubscriptionCanceller {
            id: self.id,
            slot: Arc::clone(&self.slot),
            dispatcher: Weak::clone(&self.dispatcher),
        }
    }

    pub fn cancel(&self) {
        cancel_slot(self.id, &self.slot, &self.dispatcher);
    }

    pub fn into_stream(self) -> impl Stream<Item = Arc<T>> + Send
    where
        T: Send + Sync + 'static,
    {
        stream::unfold(self, |mut sub| async move {
            let event = sub.recv().await?;
            Some((event, sub))
        })
    }
}

impl<T> Drop for Subscription<T> {
    fn drop(&mut self) {
        if let Some(inner) = self.dispatcher.upgrade() {
            inner.remove(self.id);
        }
    }
}

pub struct SubscriptionCanceller<T> {
    id: u64,
    slot: Arc<Slot<T>>,
    dispatcher: Weak<Inner<T>>,
}

impl<T> SubscriptionCanceller<T> {
    pub fn cancel(&self) {
        cancel_slot(self.id, &self.slot, &self.dispatcher);
    }
}

fn cancel_slot<T>(id: u64, slot: &Slot<T>, dispatcher: &Weak<Inner<T>>) {
    slot.cancelled.store(true, Ordering::Release);
    slot.notify.notify_one();
    if let Some(inner) = dispatcher.upgrade() {
        inner.remove(id);
    }
}
