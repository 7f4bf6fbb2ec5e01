//! Event bus
//!
//! Typed publish/subscribe channels, one per [`EventKind`]. Stream subscribers each get an
//! independent ordered cursor; handler subscribers run on the publishing thread and can remove
//! themselves by returning `true`. [`EventBus::expect`] builds request/response correlation
//! on top of handlers.
//!
//! Handlers run outside the channel lock. One thread at a time dispatches a channel's
//! handlers; events published meanwhile, including by a handler to its own kind, are queued
//! and delivered in order once the current event is done.

pub mod types;

pub use types::{Event, EventKind, UnloadReason};

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, ThreadId};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

/// Identifies a handler subscription
pub type SubscriptionId = Uuid;

type Handler = Box<dyn FnMut(&Event) -> bool + Send>;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum BusError {
    #[error("Timed out after {0:?} waiting for event")]
    Timeout(Duration),
    #[error("Event bus closed")]
    Closed,
}

#[derive(Default)]
struct Channel {
    subscribers: Vec<mpsc::UnboundedSender<Event>>,
    handlers: Vec<(SubscriptionId, Handler)>,
    /// Events waiting for the running dispatch
    queue: VecDeque<Event>,
    dispatcher: Option<ThreadId>,
    /// Handlers taken out by the running dispatch
    in_flight: HashSet<SubscriptionId>,
    /// In-flight handlers unsubscribed before the dispatch put them back
    removed: HashSet<SubscriptionId>,
}

#[derive(Default)]
struct ChannelSlot {
    state: Mutex<Channel>,
    /// Signalled whenever a dispatch round ends
    round_done: Condvar,
}

impl ChannelSlot {
    fn lock(&self) -> MutexGuard<'_, Channel> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Deliver queued events to handlers until the queue is empty
    fn dispatch(&self) {
        let mut guard = DispatchGuard { slot: self };
        loop {
            let (event, handlers) = {
                let mut channel = self.lock();
                let Some(event) = channel.queue.pop_front() else {
                    break;
                };
                let handlers = std::mem::take(&mut channel.handlers);
                channel.in_flight = handlers.iter().map(|(id, _)| *id).collect();
                (event, handlers)
            };

            let mut kept = Vec::with_capacity(handlers.len());
            for (id, mut handler) in handlers {
                if self.lock().removed.contains(&id) {
                    continue;
                }
                if !handler(&event) {
                    kept.push((id, handler));
                }
            }

            let mut channel = self.lock();
            let removed = std::mem::take(&mut channel.removed);
            let (dropped, mut kept): (Vec<_>, Vec<_>) =
                kept.into_iter().partition(|(id, _)| removed.contains(id));
            channel.in_flight.clear();
            // Handlers added during the round go after the existing ones
            kept.append(&mut channel.handlers);
            channel.handlers = kept;
            drop(channel);
            // Dropping may unsubscribe again, so only after unlocking
            drop(dropped);
            self.round_done.notify_all();
        }
        guard.finish();
    }
}

/// Releases the dispatcher role, also when a handler panics
struct DispatchGuard<'a> {
    slot: &'a ChannelSlot,
}

impl DispatchGuard<'_> {
    fn finish(&mut self) {
        let mut channel = self.slot.lock();
        channel.dispatcher = None;
        if thread::panicking() {
            channel.queue.clear();
            channel.in_flight.clear();
            channel.removed.clear();
        }
        drop(channel);
        self.slot.round_done.notify_all();
    }
}

impl Drop for DispatchGuard<'_> {
    fn drop(&mut self) {
        if thread::panicking() {
            self.finish();
        }
    }
}

struct BusInner {
    channels: HashMap<EventKind, ChannelSlot>,
}

/// Cloneable handle to the shared bus
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        let channels = EventKind::ALL
            .iter()
            .map(|kind| (*kind, ChannelSlot::default()))
            .collect();
        Self {
            inner: Arc::new(BusInner { channels }),
        }
    }

    fn slot(&self, kind: EventKind) -> Option<&ChannelSlot> {
        let slot = self.inner.channels.get(&kind);
        if slot.is_none() {
            tracing::error!("No channel registered for {:?}", kind);
        }
        slot
    }

    /// Deliver an event to every subscriber of its kind
    ///
    /// Never blocks on slow consumers; stream subscribers are unbounded. If another dispatch
    /// is running on this channel the event is queued for it and this returns at once.
    pub fn publish(&self, event: Event) {
        let kind = event.kind();
        let Some(slot) = self.slot(kind) else {
            return;
        };

        let mut channel = slot.lock();
        channel
            .subscribers
            .retain(|tx| tx.send(event.clone()).is_ok());
        tracing::debug!(
            "Published {:?} to {} stream(s) and {} handler(s)",
            kind,
            channel.subscribers.len(),
            channel.handlers.len() + channel.in_flight.len()
        );

        if channel.dispatcher.is_some() {
            channel.queue.push_back(event);
            return;
        }
        if channel.handlers.is_empty() {
            return;
        }
        channel.queue.push_back(event);
        channel.dispatcher = Some(thread::current().id());
        drop(channel);
        slot.dispatch();
    }

    /// Open an ordered stream of events of one kind
    pub fn subscribe(&self, kind: EventKind) -> Subscription {
        let (tx, rx) = mpsc::unbounded_channel();
        if let Some(slot) = self.slot(kind) {
            slot.lock().subscribers.push(tx);
        }
        Subscription { kind, rx }
    }

    /// Run `handler` for every event of `kind` until it returns `true` or is unsubscribed
    pub fn subscribe_with_handler<F>(&self, kind: EventKind, handler: F) -> SubscriptionId
    where
        F: FnMut(&Event) -> bool + Send + 'static,
    {
        let id = Uuid::new_v4();
        if let Some(slot) = self.slot(kind) {
            slot.lock().handlers.push((id, Box::new(handler)));
        }
        id
    }

    /// Remove a handler; it is never invoked again once this returns
    ///
    /// If the handler is running on another thread, waits for that call to finish.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.inner
            .channels
            .values()
            .any(|slot| unsubscribe_from(slot, id))
    }

    /// Register interest in the first event of `kind` matching `predicate`
    ///
    /// Register before publishing the request so the answer cannot be missed.
    pub fn expect<P>(&self, kind: EventKind, predicate: P) -> PendingEvent
    where
        P: Fn(&Event) -> bool + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let mut tx = Some(tx);
        let id = self.subscribe_with_handler(kind, move |event| {
            if !predicate(event) {
                return false;
            }
            if let Some(tx) = tx.take() {
                let _ = tx.send(event.clone());
            }
            true
        });
        PendingEvent {
            id,
            rx,
            bus: self.clone(),
        }
    }

    /// Number of live subscriptions (streams and handlers) on a kind
    pub fn subscriber_count(&self, kind: EventKind) -> usize {
        let Some(slot) = self.slot(kind) else {
            return 0;
        };
        let mut channel = slot.lock();
        channel.subscribers.retain(|tx| !tx.is_closed());
        let handlers = (channel.handlers.len() + channel.in_flight.len())
            .saturating_sub(channel.removed.len());
        channel.subscribers.len() + handlers
    }
}

fn unsubscribe_from(slot: &ChannelSlot, id: SubscriptionId) -> bool {
    let mut channel = slot.lock();
    if let Some(pos) = channel.handlers.iter().position(|(hid, _)| *hid == id) {
        let handler = channel.handlers.remove(pos);
        // The handler may own a PendingEvent whose drop unsubscribes again
        drop(channel);
        drop(handler);
        return true;
    }
    if !channel.in_flight.contains(&id) || !channel.removed.insert(id) {
        return false;
    }

    let me = thread::current().id();
    while channel.in_flight.contains(&id) && channel.dispatcher.is_some_and(|t| t != me) {
        channel = slot
            .round_done
            .wait(channel)
            .unwrap_or_else(PoisonError::into_inner);
    }
    true
}

/// Receiving end of [`EventBus::subscribe`]
pub struct Subscription {
    kind: EventKind,
    rx: mpsc::UnboundedReceiver<Event>,
}

impl Subscription {
    pub fn kind(&self) -> EventKind {
        self.kind
    }

    /// Next event in publish order; `None` once the bus is gone
    pub async fn recv(&mut self) -> Option<Event> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<Event> {
        self.rx.try_recv().ok()
    }
}

/// A correlation future created by [`EventBus::expect`]
///
/// Dropping it removes the underlying handler.
pub struct PendingEvent {
    id: SubscriptionId,
    rx: oneshot::Receiver<Event>,
    bus: EventBus,
}

impl PendingEvent {
    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    /// Wait for the matching event, giving up after `timeout`
    pub async fn wait(mut self, timeout: Duration) -> Result<Event, BusError> {
        match tokio::time::timeout(timeout, &mut self.rx).await {
            Ok(Ok(event)) => Ok(event),
            Ok(Err(_)) => Err(BusError::Closed),
            Err(_) => Err(BusError::Timeout(timeout)),
        }
    }
}

impl Drop for PendingEvent {
    fn drop(&mut self) {
        self.bus.unsubscribe(self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn cleared(session: &str) -> Event {
        Event::SessionCleared {
            session_id: session.to_string(),
        }
    }

    fn session_of(event: &Event) -> &str {
        match event {
            Event::SessionCleared { session_id } => session_id,
            _ => "",
        }
    }

    #[tokio::test]
    async fn test_fan_out_preserves_order() {
        let bus = EventBus::new();
        let mut a = bus.subscribe(EventKind::SessionCleared);
        let mut b = bus.subscribe(EventKind::SessionCleared);

        for i in 0..5 {
            bus.publish(cleared(&i.to_string()));
        }

        for sub in [&mut a, &mut b] {
            for i in 0..5 {
                let event = sub.recv().await.unwrap();
                assert_eq!(session_of(&event), i.to_string());
            }
        }
    }

    #[tokio::test]
    async fn test_kinds_are_isolated() {
        let bus = EventBus::new();
        let mut sub = bus.subscribe(EventKind::ModelUnloaded);
        bus.publish(cleared("x"));
        assert!(sub.try_recv().is_none());
    }

    #[test]
    fn test_handler_self_unsubscribes() {
        let bus = EventBus::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = calls.clone();
        bus.subscribe_with_handler(EventKind::SessionCleared, move |event| {
            seen.fetch_add(1, Ordering::SeqCst);
            session_of(event) == "stop"
        });

        bus.publish(cleared("a"));
        bus.publish(cleared("stop"));
        bus.publish(cleared("b"));

        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(bus.subscriber_count(EventKind::SessionCleared), 0);
    }

    #[test]
    fn test_unsubscribe_is_immediate() {
        let bus = EventBus::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = calls.clone();
        let id = bus.subscribe_with_handler(EventKind::SessionCleared, move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
            false
        });

        bus.publish(cleared("a"));
        assert!(bus.unsubscribe(id));
        assert!(!bus.unsubscribe(id));
        bus.publish(cleared("b"));

        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_handler_may_publish_to_its_own_kind() {
        let bus = EventBus::new();
        let mut stream = bus.subscribe(EventKind::SessionCleared);
        let seen = Arc::new(Mutex::new(Vec::new()));

        let (inner_bus, log) = (bus.clone(), seen.clone());
        bus.subscribe_with_handler(EventKind::SessionCleared, move |event| {
            let session = session_of(event).to_string();
            if session == "ping" {
                inner_bus.publish(cleared("pong"));
            }
            log.lock().unwrap().push(session);
            false
        });

        bus.publish(cleared("ping"));

        assert_eq!(*seen.lock().unwrap(), vec!["ping", "pong"]);
        assert_eq!(session_of(&stream.try_recv().unwrap()), "ping");
        assert_eq!(session_of(&stream.try_recv().unwrap()), "pong");
    }

    #[test]
    fn test_pending_event_dropped_inside_handler() {
        let bus = EventBus::new();
        let mut pending = Some(bus.expect(EventKind::SessionCleared, |_| false));
        bus.subscribe_with_handler(EventKind::SessionCleared, move |_| {
            pending.take();
            false
        });
        assert_eq!(bus.subscriber_count(EventKind::SessionCleared), 2);

        bus.publish(cleared("a"));
        bus.publish(cleared("b"));
        assert_eq!(bus.subscriber_count(EventKind::SessionCleared), 1);
    }

    #[test]
    fn test_unsubscribe_waits_for_running_handler() {
        let bus = EventBus::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let finished = Arc::new(AtomicUsize::new(0));
        let (started_tx, started_rx) = std::sync::mpsc::channel();

        let (c, f) = (calls.clone(), finished.clone());
        let id = bus.subscribe_with_handler(EventKind::SessionCleared, move |_| {
            c.fetch_add(1, Ordering::SeqCst);
            let _ = started_tx.send(());
            std::thread::sleep(Duration::from_millis(100));
            f.fetch_add(1, Ordering::SeqCst);
            false
        });

        let publisher = {
            let bus = bus.clone();
            std::thread::spawn(move || bus.publish(cleared("slow")))
        };
        started_rx.recv().unwrap();

        assert!(bus.unsubscribe(id));
        assert_eq!(finished.load(Ordering::SeqCst), 1);
        publisher.join().unwrap();

        bus.publish(cleared("after"));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(bus.subscriber_count(EventKind::SessionCleared), 0);
    }

    #[tokio::test]
    async fn test_expect_matches_predicate() {
        let bus = EventBus::new();
        let pending = bus.expect(EventKind::SessionCleared, |e| session_of(e) == "wanted");

        bus.publish(cleared("other"));
        bus.publish(cleared("wanted"));

        let event = pending.wait(Duration::from_secs(1)).await.unwrap();
        assert_eq!(session_of(&event), "wanted");
        assert_eq!(bus.subscriber_count(EventKind::SessionCleared), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_expect_times_out_and_cleans_up() {
        let bus = EventBus::new();
        let pending = bus.expect(EventKind::SessionCleared, |_| true);
        let result = pending.wait(Duration::from_secs(60)).await;
        assert_eq!(result.unwrap_err(), BusError::Timeout(Duration::from_secs(60)));
        assert_eq!(bus.subscriber_count(EventKind::SessionCleared), 0);
    }

    #[test]
    fn test_dropped_subscription_is_pruned() {
        let bus = EventBus::new();
        let sub = bus.subscribe(EventKind::ModelLoaded);
        assert_eq!(bus.subscriber_count(EventKind::ModelLoaded), 1);
        drop(sub);
        assert_eq!(bus.subscriber_count(EventKind::ModelLoaded), 0);
    }
}
