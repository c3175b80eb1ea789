//! Single-process publish/subscribe hub.
//!
//! The bus stamps, logs and loop-guards every event it dispatches.
//! Delivery is synchronous and fire-and-forget: exact-type subscribers run
//! in registration order, then wildcard (`*`) subscribers, and a failing
//! handler never blocks the rest. Guard-suppressed events are dropped
//! silently (logged, never retried).

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use crate::error::HandlerError;
use crate::event::{now_ms, BusEvent, EventMetadata, MAX_HOP_COUNT};
use crate::identity::Identity;

/// Capacity of the debugging ring buffer.
const HISTORY_CAPACITY: usize = 500;

/// Event-type prefixes reserved for forwarding machinery.
///
/// Events with these prefixes are delivered to exact-type subscribers only;
/// wildcard subscribers (debugging and forwarding tools) never see them, so
/// monitoring a bus cannot re-trigger forwarding logic.
pub const INTERNAL_PREFIXES: &[&str] = &["router:", "bridge:"];

/// Handle identifying one subscription, used to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

type Handler = Arc<dyn Fn(&BusEvent) -> Result<(), HandlerError> + Send + Sync>;

/// Single-process pub/sub hub with loop guarding and bounded history.
pub struct EventBus {
    identity: Arc<Identity>,
    handlers: RwLock<HashMap<String, Vec<(SubscriptionId, Handler)>>>,
    history: RwLock<VecDeque<BusEvent>>,
    next_id: AtomicU64,
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("tab_id", &self.identity.tab_id())
            .finish_non_exhaustive()
    }
}

impl EventBus {
    /// Create a bus bound to the given runtime identity.
    #[must_use]
    pub fn new(identity: Arc<Identity>) -> Self {
        Self {
            identity,
            handlers: RwLock::new(HashMap::new()),
            history: RwLock::new(VecDeque::with_capacity(HISTORY_CAPACITY)),
            next_id: AtomicU64::new(1),
        }
    }

    /// The identity this bus stamps events with.
    #[must_use]
    pub fn identity(&self) -> &Arc<Identity> {
        &self.identity
    }

    /// Subscribe to an exact event type, or `*` for all non-internal events.
    ///
    /// Returns a handle for [`EventBus::off`]. Handlers may re-entrantly
    /// emit further events; dispatch snapshots the handler set at call time.
    pub fn on(
        &self,
        event_type: &str,
        handler: impl Fn(&BusEvent) -> Result<(), HandlerError> + Send + Sync + 'static,
    ) -> SubscriptionId {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.handlers
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .entry(event_type.to_string())
            .or_default()
            .push((id, Arc::new(handler)));
        id
    }

    /// Remove a subscription. Unknown ids are a silent no-op.
    pub fn off(&self, id: SubscriptionId) {
        let mut handlers = self
            .handlers
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        for entries in handlers.values_mut() {
            entries.retain(|(entry_id, _)| *entry_id != id);
        }
        handlers.retain(|_, entries| !entries.is_empty());
    }

    /// Emit an event through the loop guard.
    ///
    /// Events without metadata always pass (local, unmetered). Events with
    /// metadata are dropped when this tab already appears in `seen_by` or
    /// when `hop_count` exceeds [`MAX_HOP_COUNT`]; the drop is logged as a
    /// warning and never surfaced to the emitter.
    pub fn emit(&self, event: BusEvent) {
        if !self.passes_loop_guard(&event) {
            return;
        }
        self.dispatch(event);
    }

    /// Emit bypassing the loop guard.
    ///
    /// For forwarders that already made the guard decision for this copy.
    pub fn emit_unguarded(&self, event: BusEvent) {
        self.dispatch(event);
    }

    /// Inject an event that arrived from a bridge or router.
    ///
    /// Marks the event seen by this tab (append tab id, increment hop
    /// count) and then dispatches unguarded: the guard decision happens
    /// exactly once, here, where the metadata is validated.
    pub fn emit_from_remote(&self, mut event: BusEvent) {
        let tab_id = self.identity.tab_id();
        let Some(metadata) = event.metadata.as_mut() else {
            // Back-compatible unmetered event; treat as local.
            self.emit(event);
            return;
        };
        if metadata.has_seen(&tab_id) {
            tracing::warn!(
                event_type = %event.event_type,
                event_id = %metadata.event_id,
                "Dropping remote event already seen by this tab"
            );
            return;
        }
        metadata.mark_seen(&tab_id);
        if metadata.hop_count > MAX_HOP_COUNT {
            tracing::warn!(
                event_type = %event.event_type,
                event_id = %metadata.event_id,
                hop_count = metadata.hop_count,
                "Dropping remote event over hop limit"
            );
            return;
        }
        self.dispatch(event);
    }

    /// Recent events for debugging and inspection, oldest first.
    #[must_use]
    pub fn history(&self) -> Vec<BusEvent> {
        self.history
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .iter()
            .cloned()
            .collect()
    }

    fn passes_loop_guard(&self, event: &BusEvent) -> bool {
        let Some(metadata) = event.metadata.as_ref() else {
            return true;
        };
        let tab_id = self.identity.tab_id();
        if metadata.has_seen(&tab_id) {
            tracing::warn!(
                event_type = %event.event_type,
                event_id = %metadata.event_id,
                "Loop guard: event already seen by this tab"
            );
            return false;
        }
        if metadata.hop_count > MAX_HOP_COUNT {
            tracing::warn!(
                event_type = %event.event_type,
                event_id = %metadata.event_id,
                hop_count = metadata.hop_count,
                "Loop guard: event over hop limit"
            );
            return false;
        }
        true
    }

    /// Stamp, record and deliver an event that passed (or skipped) the guard.
    fn dispatch(&self, mut event: BusEvent) {
        let tab_id = self.identity.tab_id();
        if event.timestamp == 0 {
            event.timestamp = now_ms();
        }
        let metadata = event
            .metadata
            .get_or_insert_with(|| EventMetadata::stamp(&self.identity));
        // Processing marks this tab as seen without counting a hop; hops are
        // counted by forwarders only.
        if !metadata.has_seen(&tab_id) {
            metadata.seen_by.push(tab_id);
        }

        {
            let mut history = self
                .history
                .write()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            if history.len() >= HISTORY_CAPACITY {
                history.pop_front();
            }
            history.push_back(event.clone());
        }

        // Snapshot handlers so subscribers can re-entrantly emit/subscribe.
        let exact: Vec<Handler> = {
            let handlers = self
                .handlers
                .read()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            handlers
                .get(&event.event_type)
                .map(|entries| entries.iter().map(|(_, h)| Arc::clone(h)).collect())
                .unwrap_or_default()
        };
        for handler in exact {
            if let Err(e) = handler(&event) {
                tracing::warn!(
                    event_type = %event.event_type,
                    "Event handler failed: {e}"
                );
            }
        }

        if is_internal_type(&event.event_type) {
            return;
        }
        let wildcard: Vec<Handler> = {
            let handlers = self
                .handlers
                .read()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            handlers
                .get("*")
                .map(|entries| entries.iter().map(|(_, h)| Arc::clone(h)).collect())
                .unwrap_or_default()
        };
        for handler in wildcard {
            if let Err(e) = handler(&event) {
                tracing::warn!(
                    event_type = %event.event_type,
                    "Wildcard handler failed: {e}"
                );
            }
        }
    }
}

/// Whether an event type belongs to the forwarding machinery.
#[must_use]
pub fn is_internal_type(event_type: &str) -> bool {
    INTERNAL_PREFIXES
        .iter()
        .any(|prefix| event_type.starts_with(prefix))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::Scope;
    use crate::identity::MemoryIdentityStore;
    use std::sync::atomic::AtomicUsize;

    fn test_bus() -> EventBus {
        EventBus::new(Arc::new(Identity::initialize(Arc::new(
            MemoryIdentityStore::new(),
        ))))
    }

    fn counting_handler(counter: &Arc<AtomicUsize>) -> impl Fn(&BusEvent) -> Result<(), HandlerError> {
        let counter = Arc::clone(counter);
        move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[test]
    fn test_exact_then_wildcard_delivery() {
        let bus = test_bus();
        let order = Arc::new(RwLock::new(Vec::new()));

        let o = Arc::clone(&order);
        bus.on("note:added", move |_| {
            o.write().unwrap().push("exact");
            Ok(())
        });
        let o = Arc::clone(&order);
        bus.on("*", move |_| {
            o.write().unwrap().push("wildcard");
            Ok(())
        });

        bus.emit(BusEvent::new(
            "note:added",
            Scope::Canvas,
            serde_json::json!({}),
        ));
        assert_eq!(*order.read().unwrap(), vec!["exact", "wildcard"]);
    }

    #[test]
    fn test_no_metadata_event_invokes_handler_once() {
        let bus = test_bus();
        let count = Arc::new(AtomicUsize::new(0));
        bus.on("widget:output", counting_handler(&count));

        bus.emit(BusEvent::new(
            "widget:output",
            Scope::Canvas,
            serde_json::json!({"portName": "entity.created"}),
        ));
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_re_emitting_processed_event_is_suppressed() {
        let bus = test_bus();
        let count = Arc::new(AtomicUsize::new(0));
        bus.on("note:added", counting_handler(&count));

        bus.emit(BusEvent::new(
            "note:added",
            Scope::Canvas,
            serde_json::json!({}),
        ));
        assert_eq!(count.load(Ordering::SeqCst), 1);

        // The processed copy (from history) carries this tab in seen_by;
        // emitting the exact same object again must be suppressed.
        let processed = bus.history().pop().expect("history entry");
        assert!(processed
            .metadata
            .as_ref()
            .expect("stamped")
            .has_seen(&bus.identity().tab_id()));
        bus.emit(processed);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_hop_limit_never_reaches_handler() {
        let bus = test_bus();
        let count = Arc::new(AtomicUsize::new(0));
        bus.on("note:added", counting_handler(&count));

        let mut metadata = EventMetadata::stamp(bus.identity());
        metadata.hop_count = MAX_HOP_COUNT + 1;
        bus.emit(
            BusEvent::new("note:added", Scope::Canvas, serde_json::json!({}))
                .with_metadata(metadata),
        );
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_emit_from_remote_marks_seen_and_increments_hop() {
        let remote = test_bus();
        let bus = test_bus();
        let seen_hops = Arc::new(RwLock::new(None));

        let s = Arc::clone(&seen_hops);
        bus.on("note:added", move |event| {
            *s.write().unwrap() = event.metadata.as_ref().map(|m| m.hop_count);
            Ok(())
        });

        let metadata = EventMetadata::stamp(remote.identity());
        bus.emit_from_remote(
            BusEvent::new("note:added", Scope::Canvas, serde_json::json!({}))
                .with_metadata(metadata),
        );
        assert_eq!(*seen_hops.read().unwrap(), Some(1));
    }

    #[test]
    fn test_emit_from_remote_drops_already_seen() {
        let bus = test_bus();
        let count = Arc::new(AtomicUsize::new(0));
        bus.on("note:added", counting_handler(&count));

        let mut metadata = EventMetadata::stamp(bus.identity());
        metadata.seen_by.push(bus.identity().tab_id());
        bus.emit_from_remote(
            BusEvent::new("note:added", Scope::Canvas, serde_json::json!({}))
                .with_metadata(metadata),
        );
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_failing_handler_does_not_block_delivery() {
        let bus = test_bus();
        let count = Arc::new(AtomicUsize::new(0));

        bus.on("note:added", |_| Err(HandlerError::from("boom")));
        bus.on("note:added", counting_handler(&count));

        bus.emit(BusEvent::new(
            "note:added",
            Scope::Canvas,
            serde_json::json!({}),
        ));
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_internal_types_skip_wildcard() {
        let bus = test_bus();
        let exact = Arc::new(AtomicUsize::new(0));
        let wildcard = Arc::new(AtomicUsize::new(0));

        bus.on("router:connected", counting_handler(&exact));
        bus.on("*", counting_handler(&wildcard));

        bus.emit(BusEvent::new(
            "router:connected",
            Scope::Canvas,
            serde_json::json!({}),
        ));
        assert_eq!(exact.load(Ordering::SeqCst), 1);
        assert_eq!(wildcard.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_off_removes_subscription() {
        let bus = test_bus();
        let count = Arc::new(AtomicUsize::new(0));
        let id = bus.on("note:added", counting_handler(&count));

        bus.off(id);
        bus.emit(BusEvent::new(
            "note:added",
            Scope::Canvas,
            serde_json::json!({}),
        ));
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_history_is_bounded() {
        let bus = test_bus();
        for i in 0..(HISTORY_CAPACITY + 10) {
            bus.emit(BusEvent::new(
                "note:added",
                Scope::Canvas,
                serde_json::json!({ "i": i }),
            ));
        }
        let history = bus.history();
        assert_eq!(history.len(), HISTORY_CAPACITY);
        // Oldest entries were evicted
        assert_eq!(history[0].payload["i"], 10);
    }

    #[test]
    fn test_reentrant_emit_from_handler() {
        let bus = Arc::new(test_bus());
        let count = Arc::new(AtomicUsize::new(0));

        let inner_bus = Arc::clone(&bus);
        bus.on("outer", move |_| {
            inner_bus.emit(BusEvent::new("inner", Scope::Canvas, serde_json::json!({})));
            Ok(())
        });
        bus.on("inner", counting_handler(&count));

        bus.emit(BusEvent::new("outer", Scope::Canvas, serde_json::json!({})));
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_dispatch_stamps_missing_metadata_and_timestamp() {
        let bus = test_bus();
        bus.emit(BusEvent::new(
            "note:added",
            Scope::Canvas,
            serde_json::json!({}),
        ));
        let event = bus.history().pop().expect("entry");
        assert!(event.timestamp > 0);
        let metadata = event.metadata.expect("stamped");
        assert_eq!(metadata.origin_tab_id, bus.identity().tab_id());
        assert_eq!(metadata.hop_count, 0);
    }
}
