//! Fleetlock event core.
//!
//! A process-local, sequenced, filterable channel of typed records
//! with a bounded replay buffer. Remote fan-out to late-joining
//! subscribers lives in `fl_rpc`; this crate owns sequencing, storage
//! and in-process delivery.

pub mod error;
pub mod filter;
pub mod ring;
pub mod stream;

pub use error::EventError;
pub use filter::{Event, EventFilter, EventKind};
pub use ring::RingBuffer;
pub use stream::{EventSink, EventStream, SubscriptionId};
