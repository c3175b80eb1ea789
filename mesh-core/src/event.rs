//! The typed event model shared by every transport.
//!
//! Every event crossing the substrate is a [`BusEvent`]; events that have
//! been (or may be) forwarded additionally carry [`EventMetadata`], the
//! identity envelope that makes dedup and loop guarding possible.

use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::identity::Identity;

/// Maximum number of forwarding hops before an event is dropped.
///
/// An event whose metadata reports more hops than this never reaches a
/// handler, regardless of which forwarder delivered it.
pub const MAX_HOP_COUNT: u32 = 10;

/// Visibility tier of an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Scope {
    /// Visible to every participant.
    Global,
    /// Scoped to a single user across their devices.
    User,
    /// Scoped to one canvas surface.
    Canvas,
    /// Scoped to one widget instance.
    Widget,
}

/// Identity envelope attached to events that cross context boundaries.
///
/// `seen_by` and `hop_count` together implement the loop guard: a tab that
/// has processed an event appears in `seen_by`, and every forwarding hop
/// increments `hop_count` by exactly one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventMetadata {
    /// Unique id for this logical event, stable across forwarded copies.
    pub event_id: String,
    /// Tab that originally emitted the event.
    pub origin_tab_id: String,
    /// Device that originally emitted the event.
    pub origin_device_id: String,
    /// Session that originally emitted the event.
    pub origin_session_id: String,
    /// Ordered set of tab ids that have already processed the event.
    #[serde(default)]
    pub seen_by: Vec<String>,
    /// Number of forwarding hops this copy has taken.
    #[serde(default)]
    pub hop_count: u32,
    /// Timestamp (ms since epoch) at the origin.
    pub origin_timestamp: u64,
    /// Canvas id a bridge forwarded this copy from, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bridged_from: Option<String>,
    /// Canvas id a bridge forwarded this copy to, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bridged_to: Option<String>,
}

impl EventMetadata {
    /// Create fresh metadata for an event originating at `identity`.
    #[must_use]
    pub fn stamp(identity: &Identity) -> Self {
        Self {
            event_id: Uuid::new_v4().to_string(),
            origin_tab_id: identity.tab_id(),
            origin_device_id: identity.device_id(),
            origin_session_id: identity.session_id(),
            seen_by: Vec::new(),
            hop_count: 0,
            origin_timestamp: now_ms(),
            bridged_from: None,
            bridged_to: None,
        }
    }

    /// Record a forwarding hop into `tab_id`.
    ///
    /// Appends the tab to `seen_by` (if absent) and increments `hop_count`.
    pub fn mark_seen(&mut self, tab_id: &str) {
        if !self.has_seen(tab_id) {
            self.seen_by.push(tab_id.to_string());
        }
        self.hop_count += 1;
    }

    /// Whether the given tab already processed this event.
    #[must_use]
    pub fn has_seen(&self, tab_id: &str) -> bool {
        self.seen_by.iter().any(|t| t == tab_id)
    }
}

/// A typed event flowing through the substrate.
///
/// This is the only contract rendering and business layers must honor to
/// interoperate with buses, bridges and routers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BusEvent {
    /// Event type, e.g. `widget:output` or `entity:created`.
    #[serde(rename = "type")]
    pub event_type: String,
    /// Visibility tier.
    pub scope: Scope,
    /// Opaque payload; shape is a contract between emitter and subscriber.
    #[serde(default)]
    pub payload: serde_json::Value,
    /// Widget instance that emitted this event, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_widget_id: Option<String>,
    /// Emission timestamp (ms since epoch); stamped by the bus when zero.
    #[serde(default)]
    pub timestamp: u64,
    /// Forwarding envelope; absent on purely local, unmetered events.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<EventMetadata>,
}

impl BusEvent {
    /// Create a new event with the given type, scope and payload.
    #[must_use]
    pub fn new(event_type: impl Into<String>, scope: Scope, payload: serde_json::Value) -> Self {
        Self {
            event_type: event_type.into(),
            scope,
            payload,
            source_widget_id: None,
            timestamp: 0,
            metadata: None,
        }
    }

    /// Attach the emitting widget id.
    #[must_use]
    pub fn with_source(mut self, widget_id: impl Into<String>) -> Self {
        self.source_widget_id = Some(widget_id.into());
        self
    }

    /// Attach pre-built metadata (used by forwarders and tests).
    #[must_use]
    pub fn with_metadata(mut self, metadata: EventMetadata) -> Self {
        self.metadata = Some(metadata);
        self
    }
}

/// Current Unix timestamp in milliseconds.
#[must_use]
#[allow(clippy::cast_possible_truncation)] // Will not exceed u64 for millennia
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
