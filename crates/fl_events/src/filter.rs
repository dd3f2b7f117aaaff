//! Event records and subscription filters.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use fl_crypto::Aid;

/// Closed set of event categories carried by a fleet stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Message,
    Status,
    Error,
    Telemetry,
    Command,
    Alert,
}

/// A sequenced, timestamped record. `source` is omitted on the wire
/// when absent, never nulled.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Globally unique (UUID v4).
    pub id: String,
    #[serde(rename = "type")]
    pub kind: EventKind,
    pub data: Value,
    /// Unix milliseconds.
    pub timestamp: u64,
    /// Strictly increasing per stream, starting at 0, never reused.
    pub sequence: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<Aid>,
}

/// Subscription filter. Empty or absent fields mean "no restriction".
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EventFilter {
    #[serde(rename = "types", skip_serializing_if = "Option::is_none")]
    pub kinds: Option<HashSet<EventKind>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sources: Option<HashSet<Aid>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub after_sequence: Option<u64>,
}

impl EventFilter {
    /// True iff every present, non-empty restriction matches.
    ///
    /// A non-empty `sources` set requires the event's source to be
    /// present AND a member; an event without a source only matches
    /// when no source restriction is in force.
    pub fn matches(&self, event: &Event) -> bool {
        if let Some(kinds) = &self.kinds {
            if !kinds.is_empty() && !kinds.contains(&event.kind) {
                return false;
            }
        }
        if let Some(sources) = &self.sources {
            if !sources.is_empty() {
                match &event.source {
                    Some(source) if sources.contains(source) => {}
                    _ => return false,
                }
            }
        }
        if let Some(after) = self.after_sequence {
            if event.sequence <= after {
                return false;
            }
        }
        true
    }

    pub fn kinds(kinds: impl IntoIterator<Item = EventKind>) -> Self {
        Self {
            kinds: Some(kinds.into_iter().collect()),
            ..Default::default()
        }
    }

    pub fn sources(sources: impl IntoIterator<Item = Aid>) -> Self {
        Self {
            sources: Some(sources.into_iter().collect()),
            ..Default::default()
        }
    }

    pub fn after_sequence(sequence: u64) -> Self {
        Self {
            after_sequence: Some(sequence),
            ..Default::default()
        }
    }
}
