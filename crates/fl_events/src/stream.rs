//! Sequenced event stream with bounded replay and synchronous fan-out.
//!
//! One `EventStream` per service. `emit` assigns the next sequence
//! number, buffers the event for replay, and delivers it to every
//! matching subscriber before returning. Emissions are serialized, so
//! a single subscriber always observes strictly increasing sequence
//! numbers.
//!
//! Subscriber callbacks run on the emitter's thread. A panicking
//! callback is caught and logged at debug level; it never prevents
//! other subscribers from receiving the event. Callbacks may
//! subscribe, unsubscribe (including themselves), or read replay, but
//! must not emit into the same stream.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::Value;
use tracing::debug;

use fl_crypto::Aid;

use crate::error::EventError;
use crate::filter::{Event, EventFilter, EventKind};
use crate::ring::RingBuffer;

/// Subscriber callback. Runs synchronously on the emitting task.
pub type EventSink = Arc<dyn Fn(&Event) + Send + Sync>;

/// Handle returned by `subscribe`; pass back to `unsubscribe`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

struct ListenerEntry {
    id: SubscriptionId,
    filter: Option<EventFilter>,
    sink: EventSink,
}

struct StreamState {
    sequence: u64,
    buffer: RingBuffer<Event>,
    listeners: Vec<ListenerEntry>,
    next_listener: u64,
}

pub struct EventStream {
    state: Mutex<StreamState>,
    /// Serializes emissions so per-subscriber delivery order matches
    /// sequence order even under concurrent emitters.
    emit_lock: Mutex<()>,
}

impl EventStream {
    /// `capacity` bounds the replay buffer; must be at least 1.
    pub fn new(capacity: usize) -> Result<Self, EventError> {
        Ok(Self {
            state: Mutex::new(StreamState {
                sequence: 0,
                buffer: RingBuffer::new(capacity)?,
                listeners: Vec::new(),
                next_listener: 0,
            }),
            emit_lock: Mutex::new(()),
        })
    }

    /// Emit an event: assign id, timestamp and the next sequence
    /// number, buffer it, then deliver to matching subscribers in
    /// registration order. Returns the completed event.
    pub fn emit(&self, kind: EventKind, data: Value, source: Option<Aid>) -> Event {
        let _order = self.emit_lock.lock();

        let (event, sinks) = {
            let mut state = self.state.lock();
            let event = Event {
                id: uuid::Uuid::new_v4().to_string(),
                kind,
                data,
                timestamp: chrono::Utc::now().timestamp_millis() as u64,
                sequence: state.sequence,
                source,
            };
            state.sequence += 1;
            state.buffer.push(event.clone());
            let sinks: Vec<EventSink> = state
                .listeners
                .iter()
                .filter(|l| l.filter.as_ref().map_or(true, |f| f.matches(&event)))
                .map(|l| Arc::clone(&l.sink))
                .collect();
            (event, sinks)
        };

        // Deliver outside the state lock so callbacks can touch the
        // stream (unsubscribe, replay) without deadlocking.
        for sink in sinks {
            if let Err(panic) = catch_unwind(AssertUnwindSafe(|| sink(&event))) {
                debug!(
                    sequence = event.sequence,
                    "event subscriber panicked: {:?}", panic
                );
            }
        }
        event
    }

    /// Register a subscriber. O(1); the callback sees exactly the
    /// events its filter matches, in emission order, starting with the
    /// next emission.
    pub fn subscribe(&self, filter: Option<EventFilter>, sink: EventSink) -> SubscriptionId {
        let mut state = self.state.lock();
        let id = SubscriptionId(state.next_listener);
        state.next_listener += 1;
        state.listeners.push(ListenerEntry { id, filter, sink });
        id
    }

    /// Atomically deliver the matching buffer contents through `sink`
    /// and register it for live events: nothing emitted after the
    /// snapshot is lost or reordered. Returns the replay size and the
    /// subscription handle. Used for late joiners (remote fan-out).
    pub fn subscribe_with_replay(
        &self,
        filter: Option<EventFilter>,
        sink: EventSink,
    ) -> (usize, SubscriptionId) {
        let mut state = self.state.lock();
        let mut replayed = 0usize;
        for event in state.buffer.iter() {
            if filter.as_ref().map_or(true, |f| f.matches(event)) {
                sink(event);
                replayed += 1;
            }
        }
        let id = SubscriptionId(state.next_listener);
        state.next_listener += 1;
        state.listeners.push(ListenerEntry { id, filter, sink });
        (replayed, id)
    }

    /// Remove a subscriber. Safe to call from inside a callback; the
    /// removal affects future events only. Returns whether it existed.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut state = self.state.lock();
        let before = state.listeners.len();
        state.listeners.retain(|l| l.id != id);
        state.listeners.len() != before
    }

    /// Snapshot of the current buffer contents matching `filter`,
    /// oldest first. Not a live view.
    pub fn replay(&self, filter: Option<&EventFilter>) -> Vec<Event> {
        let state = self.state.lock();
        state
            .buffer
            .iter()
            .filter(|e| filter.map_or(true, |f| f.matches(e)))
            .cloned()
            .collect()
    }

    /// Sequence number the next emission will receive.
    pub fn next_sequence(&self) -> u64 {
        self.state.lock().sequence
    }

    pub fn buffered(&self) -> usize {
        self.state.lock().buffer.len()
    }

    pub fn subscriber_count(&self) -> usize {
        self.state.lock().listeners.len()
    }
}
