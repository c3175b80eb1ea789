//! Same-process forwarding between sibling event buses.
//!
//! A [`CanvasBridge`] wildcard-subscribes every registered bus and re-emits
//! eligible events on all the *other* buses. Forwarded copies are stamped
//! (`bridged_from` / `bridged_to`, hop count incremented) so they are never
//! bridged a second time; a re-entrancy flag keeps the bridge from feeding
//! on its own forwarded copies mid-pass.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock, Weak};

use crate::bus::{EventBus, SubscriptionId};
use crate::event::BusEvent;

/// Forwarding policy for a bridge.
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    /// Event-type prefixes that are never forwarded.
    pub blocked_prefixes: Vec<String>,
    /// When set, only types matching one of these prefixes are forwarded.
    pub allowed_prefixes: Option<Vec<String>>,
    /// Forward `widget:output` events.
    pub forward_widget_output: bool,
    /// Forward `widget:input` events.
    pub forward_widget_input: bool,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            blocked_prefixes: vec![
                "internal:".to_string(),
                "bridge:".to_string(),
                "router:".to_string(),
                "viewport:".to_string(),
                "selection:".to_string(),
            ],
            allowed_prefixes: None,
            forward_widget_output: true,
            forward_widget_input: true,
        }
    }
}

struct BridgeEntry {
    bus: Arc<EventBus>,
    subscription: SubscriptionId,
}

struct BridgeInner {
    config: BridgeConfig,
    canvases: RwLock<HashMap<String, BridgeEntry>>,
    /// Re-entrancy flag: set for the duration of one forwarding pass so the
    /// bridge never refeeds its own forwarded copies. It does not protect
    /// against independent bridges compounding.
    forwarding: AtomicBool,
}

/// Clears the forwarding flag even if a forwarding pass panics or errors.
struct ForwardingGuard<'a>(&'a AtomicBool);

impl Drop for ForwardingGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Forwards events between event buses living in one process.
pub struct CanvasBridge {
    inner: Arc<BridgeInner>,
}

impl std::fmt::Debug for CanvasBridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let canvases = self
            .inner
            .canvases
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        f.debug_struct("CanvasBridge")
            .field("canvases", &canvases.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

impl Default for CanvasBridge {
    fn default() -> Self {
        Self::new(BridgeConfig::default())
    }
}

impl CanvasBridge {
    /// Create a bridge with the given forwarding policy.
    #[must_use]
    pub fn new(config: BridgeConfig) -> Self {
        Self {
            inner: Arc::new(BridgeInner {
                config,
                canvases: RwLock::new(HashMap::new()),
                forwarding: AtomicBool::new(false),
            }),
        }
    }

    /// Connect a canvas bus to the bridge.
    ///
    /// Every event seen on `bus` becomes a candidate for forwarding to the
    /// other connected buses. Re-adding an id replaces the existing
    /// connection.
    pub fn add_canvas(&self, canvas_id: &str, bus: Arc<EventBus>) {
        self.remove_canvas(canvas_id);

        let weak: Weak<BridgeInner> = Arc::downgrade(&self.inner);
        let source_id = canvas_id.to_string();
        let subscription = bus.on("*", move |event| {
            if let Some(inner) = weak.upgrade() {
                inner.forward_from(&source_id, event);
            }
            Ok(())
        });

        self.inner
            .canvases
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .insert(canvas_id.to_string(), BridgeEntry { bus, subscription });
        tracing::debug!(canvas_id, "Canvas connected to bridge");
    }

    /// Disconnect a canvas bus. Unknown ids are a no-op.
    pub fn remove_canvas(&self, canvas_id: &str) {
        let entry = self
            .inner
            .canvases
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .remove(canvas_id);
        if let Some(entry) = entry {
            entry.bus.off(entry.subscription);
            tracing::debug!(canvas_id, "Canvas disconnected from bridge");
        }
    }

    /// Whether the bridge would forward this event.
    #[must_use]
    pub fn should_forward(&self, event: &BusEvent) -> bool {
        self.inner.should_forward(event)
    }

    /// Send an event directly to one connected canvas, bypassing filters.
    ///
    /// Returns false when the canvas is not connected.
    pub fn emit_to(&self, canvas_id: &str, event: BusEvent) -> bool {
        let bus = {
            let canvases = self
                .inner
                .canvases
                .read()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            canvases.get(canvas_id).map(|entry| Arc::clone(&entry.bus))
        };
        match bus {
            Some(bus) => {
                bus.emit(event);
                true
            }
            None => {
                tracing::warn!(canvas_id, "emit_to: canvas not connected");
                false
            }
        }
    }

    /// Send an event directly to every connected canvas, bypassing filters.
    pub fn broadcast(&self, event: &BusEvent) {
        let buses: Vec<Arc<EventBus>> = {
            let canvases = self
                .inner
                .canvases
                .read()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            canvases
                .values()
                .map(|entry| Arc::clone(&entry.bus))
                .collect()
        };
        for bus in buses {
            bus.emit(event.clone());
        }
    }

    /// Disconnect every canvas and drop all subscriptions.
    pub fn destroy(&self) {
        let entries: Vec<(String, BridgeEntry)> = self
            .inner
            .canvases
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .drain()
            .collect();
        for (_, entry) in entries {
            entry.bus.off(entry.subscription);
        }
    }
}

impl BridgeInner {
    fn should_forward(&self, event: &BusEvent) -> bool {
        let event_type = event.event_type.as_str();

        if self
            .config
            .blocked_prefixes
            .iter()
            .any(|prefix| event_type.starts_with(prefix.as_str()))
        {
            return false;
        }
        if let Some(allowed) = &self.config.allowed_prefixes {
            if !allowed
                .iter()
                .any(|prefix| event_type.starts_with(prefix.as_str()))
            {
                return false;
            }
        }
        if event_type == "widget:output" && !self.config.forward_widget_output {
            return false;
        }
        if event_type == "widget:input" && !self.config.forward_widget_input {
            return false;
        }
        // Already bridged once; never re-bridge.
        if event
            .metadata
            .as_ref()
            .is_some_and(|m| m.bridged_from.is_some())
        {
            return false;
        }
        true
    }

    fn forward_from(&self, source_id: &str, event: &BusEvent) {
        // Our own forwarded copy arriving on a sibling bus mid-pass.
        if self.forwarding.load(Ordering::SeqCst) {
            return;
        }
        if !self.should_forward(event) {
            return;
        }

        self.forwarding.store(true, Ordering::SeqCst);
        let _guard = ForwardingGuard(&self.forwarding);

        let targets: Vec<(String, Arc<EventBus>)> = {
            let canvases = self
                .canvases
                .read()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            canvases
                .iter()
                .filter(|(id, _)| id.as_str() != source_id)
                .map(|(id, entry)| (id.clone(), Arc::clone(&entry.bus)))
                .collect()
        };

        for (target_id, bus) in targets {
            let mut copy = event.clone();
            if let Some(metadata) = copy.metadata.as_mut() {
                metadata.bridged_from = Some(source_id.to_string());
                metadata.bridged_to = Some(target_id.clone());
                metadata.hop_count += 1;
            }
            tracing::debug!(
                event_type = %copy.event_type,
                from = source_id,
                to = %target_id,
                "Bridging event"
            );
            bus.emit_unguarded(copy);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{EventMetadata, Scope};
    use crate::identity::{Identity, MemoryIdentityStore};
    use std::sync::atomic::AtomicUsize;

    fn test_bus() -> Arc<EventBus> {
        Arc::new(EventBus::new(Arc::new(Identity::initialize(Arc::new(
            MemoryIdentityStore::new(),
        )))))
    }

    fn count_on(bus: &EventBus, event_type: &str) -> Arc<AtomicUsize> {
        let count = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&count);
        bus.on(event_type, move |_| {
            c.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        count
    }

    #[test]
    fn test_forwards_between_two_canvases() {
        let bridge = CanvasBridge::default();
        let bus_a = test_bus();
        let bus_b = test_bus();
        bridge.add_canvas("a", Arc::clone(&bus_a));
        bridge.add_canvas("b", Arc::clone(&bus_b));

        let on_b = count_on(&bus_b, "note:added");
        bus_a.emit(BusEvent::new(
            "note:added",
            Scope::Canvas,
            serde_json::json!({"text": "hi"}),
        ));
        assert_eq!(on_b.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_never_echoes_back_to_origin() {
        let bridge = CanvasBridge::default();
        let bus_a = test_bus();
        let bus_b = test_bus();
        bridge.add_canvas("a", Arc::clone(&bus_a));
        bridge.add_canvas("b", Arc::clone(&bus_b));

        let on_a = count_on(&bus_a, "note:added");
        bus_a.emit(BusEvent::new(
            "note:added",
            Scope::Canvas,
            serde_json::json!({}),
        ));
        // Only the original local delivery; no bridged copy returned.
        assert_eq!(on_a.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_forwarded_copy_is_stamped() {
        let bridge = CanvasBridge::default();
        let bus_a = test_bus();
        let bus_b = test_bus();
        bridge.add_canvas("a", Arc::clone(&bus_a));
        bridge.add_canvas("b", Arc::clone(&bus_b));

        let received = Arc::new(RwLock::new(None));
        let r = Arc::clone(&received);
        bus_b.on("note:added", move |event| {
            *r.write().unwrap() = Some(event.clone());
            Ok(())
        });

        bus_a.emit(BusEvent::new(
            "note:added",
            Scope::Canvas,
            serde_json::json!({}),
        ));

        let received = received.read().unwrap().clone().expect("forwarded");
        let original = bus_a.history().pop().expect("original");
        let received_meta = received.metadata.expect("metadata");
        let original_meta = original.metadata.expect("metadata");
        assert_eq!(received_meta.bridged_from.as_deref(), Some("a"));
        assert_eq!(received_meta.bridged_to.as_deref(), Some("b"));
        assert_eq!(received_meta.hop_count, original_meta.hop_count + 1);
    }

    #[test]
    fn test_never_rebridges_bridged_events() {
        let bridge = CanvasBridge::default();
        let bus_a = test_bus();
        bridge.add_canvas("a", Arc::clone(&bus_a));

        let mut metadata = EventMetadata::stamp(bus_a.identity());
        metadata.bridged_from = Some("elsewhere".to_string());
        let event = BusEvent::new("note:added", Scope::Canvas, serde_json::json!({}))
            .with_metadata(metadata);
        assert!(!bridge.should_forward(&event));
    }

    #[test]
    fn test_blocked_prefixes_not_forwarded() {
        let bridge = CanvasBridge::default();
        let bus_a = test_bus();
        let bus_b = test_bus();
        bridge.add_canvas("a", Arc::clone(&bus_a));
        bridge.add_canvas("b", Arc::clone(&bus_b));

        let on_b = count_on(&bus_b, "selection:changed");
        bus_a.emit(BusEvent::new(
            "selection:changed",
            Scope::Canvas,
            serde_json::json!({}),
        ));
        assert_eq!(on_b.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_allow_list_restricts_forwarding() {
        let bridge = CanvasBridge::new(BridgeConfig {
            allowed_prefixes: Some(vec!["note:".to_string()]),
            ..BridgeConfig::default()
        });
        let bus_a = test_bus();
        let bus_b = test_bus();
        bridge.add_canvas("a", Arc::clone(&bus_a));
        bridge.add_canvas("b", Arc::clone(&bus_b));

        let notes = count_on(&bus_b, "note:added");
        let shapes = count_on(&bus_b, "shape:added");
        bus_a.emit(BusEvent::new(
            "note:added",
            Scope::Canvas,
            serde_json::json!({}),
        ));
        bus_a.emit(BusEvent::new(
            "shape:added",
            Scope::Canvas,
            serde_json::json!({}),
        ));
        assert_eq!(notes.load(Ordering::SeqCst), 1);
        assert_eq!(shapes.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_widget_output_toggle() {
        let bridge = CanvasBridge::new(BridgeConfig {
            forward_widget_output: false,
            ..BridgeConfig::default()
        });
        let bus_a = test_bus();
        let bus_b = test_bus();
        bridge.add_canvas("a", Arc::clone(&bus_a));
        bridge.add_canvas("b", Arc::clone(&bus_b));

        let on_b = count_on(&bus_b, "widget:output");
        bus_a.emit(BusEvent::new(
            "widget:output",
            Scope::Canvas,
            serde_json::json!({}),
        ));
        assert_eq!(on_b.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_three_canvases_fan_out_once_each() {
        let bridge = CanvasBridge::default();
        let buses: Vec<Arc<EventBus>> = (0..3).map(|_| test_bus()).collect();
        for (i, bus) in buses.iter().enumerate() {
            bridge.add_canvas(&format!("c{i}"), Arc::clone(bus));
        }

        let on_1 = count_on(&buses[1], "note:added");
        let on_2 = count_on(&buses[2], "note:added");
        buses[0].emit(BusEvent::new(
            "note:added",
            Scope::Canvas,
            serde_json::json!({}),
        ));
        assert_eq!(on_1.load(Ordering::SeqCst), 1);
        assert_eq!(on_2.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_emit_to_and_broadcast_bypass_filters() {
        let bridge = CanvasBridge::default();
        let bus_a = test_bus();
        let bus_b = test_bus();
        bridge.add_canvas("a", Arc::clone(&bus_a));
        bridge.add_canvas("b", Arc::clone(&bus_b));

        // selection: is a blocked prefix for forwarding, but direct sends
        // are unfiltered.
        let on_b = count_on(&bus_b, "selection:changed");
        assert!(bridge.emit_to(
            "b",
            BusEvent::new("selection:changed", Scope::Canvas, serde_json::json!({})),
        ));
        assert_eq!(on_b.load(Ordering::SeqCst), 1);

        assert!(!bridge.emit_to(
            "missing",
            BusEvent::new("note:added", Scope::Canvas, serde_json::json!({})),
        ));
    }

    #[test]
    fn test_remove_canvas_stops_forwarding() {
        let bridge = CanvasBridge::default();
        let bus_a = test_bus();
        let bus_b = test_bus();
        bridge.add_canvas("a", Arc::clone(&bus_a));
        bridge.add_canvas("b", Arc::clone(&bus_b));
        bridge.remove_canvas("a");

        let on_b = count_on(&bus_b, "note:added");
        bus_a.emit(BusEvent::new(
            "note:added",
            Scope::Canvas,
            serde_json::json!({}),
        ));
        assert_eq!(on_b.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_destroy_unsubscribes_everything() {
        let bridge = CanvasBridge::default();
        let bus_a = test_bus();
        let bus_b = test_bus();
        bridge.add_canvas("a", Arc::clone(&bus_a));
        bridge.add_canvas("b", Arc::clone(&bus_b));
        bridge.destroy();

        let on_b = count_on(&bus_b, "note:added");
        bus_a.emit(BusEvent::new(
            "note:added",
            Scope::Canvas,
            serde_json::json!({}),
        ));
        assert_eq!(on_b.load(Ordering::SeqCst), 0);
    }
}
