//! Typed in-process event bus
//!
//! Modeled as a fixed, closed set of event variants with one listener slice
//! per variant rather than a generic broadcast channel, so `emit` can await
//! each listener in registration order and preserve the in-order
//! synchronous-per-emit delivery the rest of the core depends on.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};

use crate::codec::{Command, Response};
use crate::value::Values;

/// A single published occurrence. Every variant is cheap to clone: listeners
/// each receive their own owned copy rather than a shared reference, so a
/// slow or failing listener cannot hold up dispatch to the others via
/// borrow contention.
#[derive(Debug, Clone)]
pub enum Event {
    ConnectionEstablished,
    ConnectionClosed(Option<String>),
    /// A single complete wire frame, as split off by Transport.
    DataReceived(Vec<u8>),
    /// A packed frame ready to write, emitted by Sender for Transport to
    /// push onto the socket.
    DataSent(Vec<u8>),
    /// A request to send a command, emitted by Heartbeat/StateKeeper/
    /// UpdateBuffer/DeviceSession and consumed by Sender.
    CommandSent(Command),
    /// A decoded response, keyed by the sequence number it correlates to.
    ResponseReceived(u32, Response),
    StateUpdated(Values),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    ConnectionEstablished,
    ConnectionClosed,
    DataReceived,
    DataSent,
    CommandSent,
    ResponseReceived,
    StateUpdated,
}

impl Event {
    pub fn kind(&self) -> EventKind {
        match self {
            Event::ConnectionEstablished => EventKind::ConnectionEstablished,
            Event::ConnectionClosed(_) => EventKind::ConnectionClosed,
            Event::DataReceived(_) => EventKind::DataReceived,
            Event::DataSent(_) => EventKind::DataSent,
            Event::CommandSent(_) => EventKind::CommandSent,
            Event::ResponseReceived(_, _) => EventKind::ResponseReceived,
            Event::StateUpdated(_) => EventKind::StateUpdated,
        }
    }
}

pub type ListenerError = Box<dyn std::error::Error + Send + Sync>;
type ListenerFuture = Pin<Box<dyn Future<Output = Result<(), ListenerError>> + Send>>;

/// A registered event handler, shared rather than owned so `emit` can clone
/// the listener list out from under its lock instead of holding the lock
/// across an `.await`.
pub type Listener = Arc<dyn Fn(Event) -> ListenerFuture + Send + Sync>;

#[derive(Default)]
struct Slots {
    connection_established: Mutex<Vec<Listener>>,
    connection_closed: Mutex<Vec<Listener>>,
    data_received: Mutex<Vec<Listener>>,
    data_sent: Mutex<Vec<Listener>>,
    command_sent: Mutex<Vec<Listener>>,
    response_received: Mutex<Vec<Listener>>,
    state_updated: Mutex<Vec<Listener>>,
}

#[derive(Default)]
pub struct EventBus {
    slots: Slots,
}

impl fmt::Debug for EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventBus").finish_non_exhaustive()
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self, kind: EventKind) -> &Mutex<Vec<Listener>> {
        match kind {
            EventKind::ConnectionEstablished => &self.slots.connection_established,
            EventKind::ConnectionClosed => &self.slots.connection_closed,
            EventKind::DataReceived => &self.slots.data_received,
            EventKind::DataSent => &self.slots.data_sent,
            EventKind::CommandSent => &self.slots.command_sent,
            EventKind::ResponseReceived => &self.slots.response_received,
            EventKind::StateUpdated => &self.slots.state_updated,
        }
    }

    /// Register a listener for one event kind. Takes `&self` (listeners live
    /// behind a `Mutex`) so components can register after the bus is already
    /// shared as an `Arc`, during their own construction.
    pub fn register(&self, kind: EventKind, listener: Listener) {
        self.slot(kind).lock().unwrap().push(listener);
    }

    /// Invoke every listener registered for `event`'s kind, in registration
    /// order, awaiting each in turn. A failing listener is logged and does
    /// not prevent the rest from running.
    pub async fn emit(&self, event: Event) {
        let listeners: Vec<Listener> = self.slot(event.kind()).lock().unwrap().clone();
        for listener in listeners {
            if let Err(err) = listener(event.clone()).await {
                tracing::warn!(kind = ?event.kind(), error = %err, "event listener failed");
            }
        }
    }
}

/// Shared handle passed to every component; cheap to clone.
pub type SharedBus = Arc<EventBus>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn ok_listener<F>(f: F) -> Listener
    where
        F: Fn(Event) + Send + Sync + 'static,
    {
        Arc::new(move |event| {
            f(event);
            Box::pin(async { Ok(()) })
        })
    }

    #[tokio::test]
    async fn listeners_run_in_registration_order() {
        let bus = EventBus::new();
        let order = Arc::new(std::sync::Mutex::new(Vec::new()));

        for tag in 0..3 {
            let order = order.clone();
            bus.register(
                EventKind::ConnectionEstablished,
                ok_listener(move |_| order.lock().unwrap().push(tag)),
            );
        }

        bus.emit(Event::ConnectionEstablished).await;
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn only_listeners_for_the_matching_kind_fire() {
        let bus = EventBus::new();
        let hits = Arc::new(AtomicUsize::new(0));

        let hits_clone = hits.clone();
        bus.register(
            EventKind::StateUpdated,
            ok_listener(move |_| {
                hits_clone.fetch_add(1, Ordering::SeqCst);
            }),
        );

        bus.emit(Event::ConnectionEstablished).await;
        assert_eq!(hits.load(Ordering::SeqCst), 0);

        bus.emit(Event::StateUpdated(Values::new())).await;
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn a_failing_listener_does_not_block_the_next_one() {
        let bus = EventBus::new();
        let ran = Arc::new(AtomicUsize::new(0));

        bus.register(
            EventKind::DataSent,
            Arc::new(|_| Box::pin(async { Err("boom".into()) })),
        );
        let ran_clone = ran.clone();
        bus.register(
            EventKind::DataSent,
            ok_listener(move |_| {
                ran_clone.fetch_add(1, Ordering::SeqCst);
            }),
        );

        bus.emit(Event::DataSent(vec![1, 2, 3])).await;
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }
}
