//! Typed fan-out of events to any number of subscribers.
//!
//! Every subscriber owns an unbounded receiver; an event is delivered to all
//! live subscribers in subscription order, and each subscriber sees events in
//! emission order. Dropping a [`Subscription`] unsubscribes it.
//!
//! ```text
//!   emit(e) ──► [ tx₁ ] ──► Subscription₁
//!          ├──► [ tx₂ ] ──► Subscription₂
//!          └──► [ tx₃ ] ──► (dropped, pruned on next emit)
//! ```

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use tokio::sync::mpsc;

/// Counters for monitoring a bus.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EventStats {
    pub events_emitted: u64,
    pub deliveries: u64,
    pub active_subscribers: usize,
}

struct BusState<E> {
    subscribers: Vec<mpsc::UnboundedSender<E>>,
    closed: bool,
}

/// Multi-subscriber event emitter.
pub struct EventBus<E> {
    state: Mutex<BusState<E>>,
    emitted: AtomicU64,
    deliveries: AtomicU64,
}

impl<E: Clone + Send + 'static> EventBus<E> {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(BusState {
                subscribers: Vec::new(),
                closed: false,
            }),
            emitted: AtomicU64::new(0),
            deliveries: AtomicU64::new(0),
        }
    }

    /// Register a new subscriber. Subscribing to a closed bus yields a
    /// subscription that is already finished.
    pub fn subscribe(&self) -> Subscription<E> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut state = self.lock();
        if !state.closed {
            state.subscribers.push(tx);
        }
        Subscription { rx }
    }

    /// Deliver `event` to every live subscriber. Returns how many received it.
    pub fn emit(&self, event: E) -> usize {
        let mut state = self.lock();
        if state.closed {
            return 0;
        }
        state
            .subscribers
            .retain(|tx| tx.send(event.clone()).is_ok());
        let delivered = state.subscribers.len();
        self.emitted.fetch_add(1, Ordering::Relaxed);
        self.deliveries.fetch_add(delivered as u64, Ordering::Relaxed);
        delivered
    }

    /// Detach every subscriber. Pending events stay readable; afterwards each
    /// subscription ends. Later emits are dropped.
    pub fn close(&self) {
        let mut state = self.lock();
        state.closed = true;
        state.subscribers.clear();
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    pub fn subscriber_count(&self) -> usize {
        let mut state = self.lock();
        state.subscribers.retain(|tx| !tx.is_closed());
        state.subscribers.len()
    }

    pub fn stats(&self) -> EventStats {
        EventStats {
            events_emitted: self.emitted.load(Ordering::Relaxed),
            deliveries: self.deliveries.load(Ordering::Relaxed),
            active_subscribers: self.subscriber_count(),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BusState<E>> {
        // A poisoned bus still holds a valid subscriber list.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl<E: Clone + Send + 'static> Default for EventBus<E> {
    fn default() -> Self {
        Self::new()
    }
}

/// Receiving half of one subscriber. Drop it to unsubscribe.
#[derive(Debug)]
pub struct Subscription<E> {
    rx: mpsc::UnboundedReceiver<E>,
}

impl<E> Subscription<E> {
    /// Next event, or `None` once the bus has closed and everything
    /// delivered has been read.
    pub async fn recv(&mut self) -> Option<E> {
        self.rx.recv().await
    }

    /// Next already-delivered event, without waiting.
    pub fn try_recv(&mut self) -> Option<E> {
        self.rx.try_recv().ok()
    }

    /// Explicit form of dropping the handle.
    pub fn unsubscribe(self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_fan_out_in_emission_order() {
        let bus = EventBus::new();
        let mut a = bus.subscribe();
        let mut b = bus.subscribe();

        assert_eq!(bus.emit(1), 2);
        assert_eq!(bus.emit(2), 2);

        assert_eq!(a.recv().await, Some(1));
        assert_eq!(a.recv().await, Some(2));
        assert_eq!(b.recv().await, Some(1));
        assert_eq!(b.recv().await, Some(2));
    }

    #[tokio::test]
    async fn test_dropped_subscription_is_pruned() {
        let bus = EventBus::new();
        let keep = bus.subscribe();
        let gone = bus.subscribe();
        gone.unsubscribe();

        assert_eq!(bus.emit("x"), 1);
        assert_eq!(bus.subscriber_count(), 1);
        drop(keep);
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_close_ends_subscriptions_after_pending() {
        let bus = EventBus::new();
        let mut sub = bus.subscribe();
        bus.emit(7);
        bus.close();

        assert_eq!(bus.emit(8), 0);
        assert_eq!(sub.recv().await, Some(7));
        assert_eq!(sub.recv().await, None);

        let mut late = bus.subscribe();
        assert_eq!(late.recv().await, None);
    }

    #[tokio::test]
    async fn test_stats() {
        let bus = EventBus::new();
        let _a = bus.subscribe();
        let _b = bus.subscribe();
        bus.emit(());
        bus.emit(());

        let stats = bus.stats();
        assert_eq!(stats.events_emitted, 2);
        assert_eq!(stats.deliveries, 4);
        assert_eq!(stats.active_subscribers, 2);
    }

    #[test]
    fn test_try_recv() {
        let bus = EventBus::new();
        let mut sub = bus.subscribe();
        assert_eq!(sub.try_recv(), None);
        bus.emit('a');
        assert_eq!(sub.try_recv(), Some('a'));
    }
}
