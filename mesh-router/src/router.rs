//! The canvas router: route table, remote subscriptions, discovery and
//! the receive loop.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::Duration;

use mesh_core::event::{now_ms, BusEvent, EventMetadata, Scope};
use mesh_core::{EventBus, SubscriptionId};

use crate::transport::{RouterMessage, Transport, TransportError};

/// Timing knobs for discovery.
#[derive(Debug, Clone)]
pub struct RouterConfig {
    /// How often to announce this canvas with a ping.
    pub heartbeat_interval: Duration,
    /// Discovery entries older than this are pruned.
    pub stale_after: Duration,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(5),
            stale_after: Duration::from_secs(15),
        }
    }
}

/// A forwarding rule: canvas-scoped events emitted on the source canvas
/// flow to the target (and back, when bidirectional).
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Route {
    /// Canvas events originate on.
    pub source_canvas_id: String,
    /// Canvas events are forwarded to.
    pub target_canvas_id: String,
    /// Forward in both directions.
    pub bidirectional: bool,
    /// Disabled routes are kept but never match.
    pub enabled: bool,
}

impl Route {
    /// An enabled one-way route from `source` to `target`.
    #[must_use]
    pub fn new(source: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            source_canvas_id: source.into(),
            target_canvas_id: target.into(),
            bidirectional: false,
            enabled: true,
        }
    }

    /// Make the route bidirectional.
    #[must_use]
    pub fn bidirectional(mut self) -> Self {
        self.bidirectional = true;
        self
    }

    fn is_pair(&self, source: &str, target: &str) -> bool {
        self.source_canvas_id == source && self.target_canvas_id == target
    }

    /// The peer this route forwards events from `local` to, if it
    /// applies to `local` and is enabled.
    fn forward_target(&self, local: &str) -> Option<&str> {
        if !self.enabled {
            return None;
        }
        if self.source_canvas_id == local {
            Some(&self.target_canvas_id)
        } else if self.bidirectional && self.target_canvas_id == local {
            Some(&self.source_canvas_id)
        } else {
            None
        }
    }
}

/// A request to receive a filtered set of event types broadcast by one
/// remote canvas. An empty filter accepts every type.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteSubscription {
    /// Remote canvas to listen to.
    pub canvas_id: String,
    /// Event types to accept; empty means all.
    #[serde(default)]
    pub event_types: Vec<String>,
}

impl RemoteSubscription {
    fn accepts(&self, event_type: &str) -> bool {
        self.event_types.is_empty() || self.event_types.iter().any(|t| t == event_type)
    }
}

struct RouterInner {
    canvas_id: String,
    bus: Arc<EventBus>,
    transport: Arc<dyn Transport>,
    config: RouterConfig,
    connected: AtomicBool,
    routes: RwLock<Vec<Route>>,
    subscriptions: RwLock<Vec<RemoteSubscription>>,
    /// canvas id -> last_seen, epoch milliseconds
    discovery: RwLock<HashMap<String, u64>>,
    forward_subscription: Mutex<Option<SubscriptionId>>,
    tasks: Mutex<Vec<tokio::task::JoinHandle<()>>>,
}

/// Connects one canvas's bus to peer tabs through a [`Transport`].
pub struct CanvasRouter {
    inner: Arc<RouterInner>,
}

impl std::fmt::Debug for CanvasRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CanvasRouter")
            .field("canvas_id", &self.inner.canvas_id)
            .field("connected", &self.inner.connected.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}

impl CanvasRouter {
    /// A disconnected router for `canvas_id` over the given transport.
    #[must_use]
    pub fn new(
        canvas_id: &str,
        bus: Arc<EventBus>,
        transport: Arc<dyn Transport>,
        config: RouterConfig,
    ) -> Self {
        Self {
            inner: Arc::new(RouterInner {
                canvas_id: canvas_id.to_string(),
                bus,
                transport,
                config,
                connected: AtomicBool::new(false),
                routes: RwLock::new(Vec::new()),
                subscriptions: RwLock::new(Vec::new()),
                discovery: RwLock::new(HashMap::new()),
                forward_subscription: Mutex::new(None),
                tasks: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Whether the router is currently connected.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::SeqCst)
    }

    /// Start forwarding, receiving and heartbeating. Idempotent.
    ///
    /// Must be called from within a tokio runtime.
    pub fn connect(&self) {
        let inner = &self.inner;
        if inner.connected.swap(true, Ordering::SeqCst) {
            return;
        }

        // Auto-forward: local canvas-scoped events matching an enabled
        // route go out without an explicit send call.
        let weak: Weak<RouterInner> = Arc::downgrade(inner);
        let subscription = inner.bus.on("*", move |event| {
            if let Some(inner) = weak.upgrade() {
                inner.auto_forward(event);
            }
            Ok(())
        });
        *inner
            .forward_subscription
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = Some(subscription);

        let weak: Weak<RouterInner> = Arc::downgrade(inner);
        let mut receiver = inner.transport.subscribe();
        let recv_loop = tokio::spawn(async move {
            loop {
                match receiver.recv().await {
                    Ok(message) => {
                        let Some(inner) = weak.upgrade() else { break };
                        inner.receive(message);
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "Transport receiver lagged, messages dropped");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        let weak: Weak<RouterInner> = Arc::downgrade(inner);
        let interval = inner.config.heartbeat_interval;
        let heartbeat = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                let Some(inner) = weak.upgrade() else { break };
                if !inner.connected.load(Ordering::SeqCst) {
                    break;
                }
                inner.heartbeat();
            }
        });

        {
            let mut tasks = inner
                .tasks
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            tasks.push(recv_loop);
            tasks.push(heartbeat);
        }

        inner.emit_router_event(
            "router:connected",
            serde_json::json!({ "canvasId": inner.canvas_id }),
        );
    }

    /// Stop forwarding and receiving. Idempotent.
    pub fn disconnect(&self) {
        let inner = &self.inner;
        if !inner.connected.swap(false, Ordering::SeqCst) {
            return;
        }

        let subscription = inner
            .forward_subscription
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .take();
        if let Some(id) = subscription {
            inner.bus.off(id);
        }

        let tasks: Vec<_> = inner
            .tasks
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .drain(..)
            .collect();
        for task in tasks {
            task.abort();
        }

        inner.emit_router_event(
            "router:disconnected",
            serde_json::json!({ "canvasId": inner.canvas_id }),
        );
    }

    /// Add a route; an existing route for the same pair is replaced.
    pub fn add_route(&self, route: Route) {
        let payload = serde_json::to_value(&route).unwrap_or_default();
        {
            let mut routes = self
                .inner
                .routes
                .write()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            routes.retain(|r| !r.is_pair(&route.source_canvas_id, &route.target_canvas_id));
            routes.push(route);
        }
        self.inner.emit_router_event("router:routeAdded", payload);
    }

    /// Remove the route for a pair. Unknown pairs are logged no-ops.
    pub fn remove_route(&self, source_canvas_id: &str, target_canvas_id: &str) -> bool {
        let removed = {
            let mut routes = self
                .inner
                .routes
                .write()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            let before = routes.len();
            routes.retain(|r| !r.is_pair(source_canvas_id, target_canvas_id));
            routes.len() != before
        };
        if removed {
            self.inner.emit_router_event(
                "router:routeRemoved",
                serde_json::json!({
                    "sourceCanvasId": source_canvas_id,
                    "targetCanvasId": target_canvas_id,
                }),
            );
        } else {
            tracing::warn!(
                "No route from {source_canvas_id} to {target_canvas_id} to remove"
            );
        }
        removed
    }

    /// Replace the route for `route`'s pair. Unknown pairs are logged
    /// no-ops.
    pub fn update_route(&self, route: Route) -> bool {
        let payload = serde_json::to_value(&route).unwrap_or_default();
        let (source, target) = (route.source_canvas_id.clone(), route.target_canvas_id.clone());
        let updated = {
            let mut routes = self
                .inner
                .routes
                .write()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            match routes.iter_mut().find(|r| r.is_pair(&source, &target)) {
                Some(existing) => {
                    *existing = route;
                    true
                }
                None => false,
            }
        };
        if updated {
            self.inner
                .emit_router_event("router:routeUpdated", payload);
        } else {
            tracing::warn!("No route from {source} to {target} to update");
        }
        updated
    }

    /// Current route table.
    #[must_use]
    pub fn routes(&self) -> Vec<Route> {
        self.inner
            .routes
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }

    /// Subscribe to a filtered set of event types broadcast by one
    /// remote canvas.
    pub fn subscribe_to_canvas(&self, subscription: RemoteSubscription) {
        let mut subscriptions = self
            .inner
            .subscriptions
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        subscriptions.retain(|s| s.canvas_id != subscription.canvas_id);
        subscriptions.push(subscription);
    }

    /// Drop the subscription for a remote canvas.
    pub fn unsubscribe_from_canvas(&self, canvas_id: &str) {
        self.inner
            .subscriptions
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .retain(|s| s.canvas_id != canvas_id);
    }

    /// Send one event to one remote canvas.
    ///
    /// # Errors
    ///
    /// Propagates [`TransportError`] from the wire.
    pub fn send_to_canvas(
        &self,
        target_canvas_id: &str,
        event: BusEvent,
    ) -> Result<(), TransportError> {
        let event = self.inner.prepare_outgoing(event);
        self.inner.transport.send(RouterMessage::Event {
            source_canvas_id: self.inner.canvas_id.clone(),
            target_canvas_id: Some(target_canvas_id.to_string()),
            broadcast: false,
            event,
        })
    }

    /// Send one event to every connected canvas.
    ///
    /// # Errors
    ///
    /// Propagates [`TransportError`] from the wire.
    pub fn broadcast_to_all(&self, event: BusEvent) -> Result<(), TransportError> {
        let event = self.inner.prepare_outgoing(event);
        self.inner.transport.send(RouterMessage::Event {
            source_canvas_id: self.inner.canvas_id.clone(),
            target_canvas_id: None,
            broadcast: true,
            event,
        })
    }

    /// Canvases seen alive within the staleness window, pruning the rest.
    #[must_use]
    pub fn active_canvases(&self) -> Vec<String> {
        let stale_ms = u64::try_from(self.inner.config.stale_after.as_millis()).unwrap_or(u64::MAX);
        let now = now_ms();
        let mut discovery = self
            .inner
            .discovery
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        discovery.retain(|_, last_seen| now.saturating_sub(*last_seen) < stale_ms);
        discovery.keys().cloned().collect()
    }
}

impl Drop for CanvasRouter {
    fn drop(&mut self) {
        // Tasks hold only Weak references; aborting here is belt and
        // braces for a router dropped while connected.
        let tasks: Vec<_> = self
            .inner
            .tasks
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .drain(..)
            .collect();
        for task in tasks {
            task.abort();
        }
    }
}

impl RouterInner {
    fn emit_router_event(&self, event_type: &str, payload: serde_json::Value) {
        self.bus.emit(BusEvent::new(event_type, Scope::Canvas, payload));
    }

    /// Stamp and mark an event before it leaves this tab. Processing
    /// here does not count a hop; the receiving bus does that.
    fn prepare_outgoing(&self, mut event: BusEvent) -> BusEvent {
        if event.timestamp == 0 {
            event.timestamp = now_ms();
        }
        let tab_id = self.bus.identity().tab_id();
        let metadata = event
            .metadata
            .get_or_insert_with(|| EventMetadata::stamp(self.bus.identity()));
        if !metadata.has_seen(&tab_id) {
            metadata.seen_by.push(tab_id);
        }
        event
    }

    /// Forward a locally-emitted canvas event along every matching route.
    fn auto_forward(&self, event: &BusEvent) {
        if event.scope != Scope::Canvas {
            return;
        }
        // Only locally-originated events leave this tab; remote-injected
        // copies are the receiving half of someone else's forward.
        let local_tab = self.bus.identity().tab_id();
        if event
            .metadata
            .as_ref()
            .is_some_and(|m| m.origin_tab_id != local_tab)
        {
            return;
        }

        let targets: Vec<String> = {
            let routes = self
                .routes
                .read()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            routes
                .iter()
                .filter_map(|r| r.forward_target(&self.canvas_id))
                .map(ToString::to_string)
                .collect()
        };
        for target in targets {
            let prepared = self.prepare_outgoing(event.clone());
            let result = self.transport.send(RouterMessage::Event {
                source_canvas_id: self.canvas_id.clone(),
                target_canvas_id: Some(target.clone()),
                broadcast: false,
                event: prepared,
            });
            if let Err(e) = result {
                tracing::warn!(
                    event_type = %event.event_type,
                    target_canvas = %target,
                    "Route forward failed: {e}"
                );
            }
        }
    }

    fn heartbeat(&self) {
        let result = self.transport.send(RouterMessage::Ping {
            canvas_id: self.canvas_id.clone(),
            tab_id: self.bus.identity().tab_id(),
        });
        if let Err(e) = result {
            tracing::warn!("Heartbeat failed: {e}");
        }
    }

    fn mark_alive(&self, canvas_id: &str) {
        self.discovery
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .insert(canvas_id.to_string(), now_ms());
    }

    /// Handle one message off the wire. Errors inside bus subscribers
    /// are already contained by the bus and never reach the transport.
    fn receive(&self, message: RouterMessage) {
        let local_tab = self.bus.identity().tab_id();
        match message {
            RouterMessage::Ping { canvas_id, tab_id } => {
                if tab_id == local_tab {
                    return;
                }
                self.mark_alive(&canvas_id);
                let result = self.transport.send(RouterMessage::Pong {
                    canvas_id: self.canvas_id.clone(),
                    tab_id: local_tab,
                });
                if let Err(e) = result {
                    tracing::warn!("Heartbeat reply failed: {e}");
                }
            }
            RouterMessage::Pong { canvas_id, tab_id } => {
                if tab_id != local_tab {
                    self.mark_alive(&canvas_id);
                }
            }
            RouterMessage::Event {
                source_canvas_id,
                target_canvas_id,
                broadcast,
                event,
            } => {
                // Never consume your own broadcast
                if event
                    .metadata
                    .as_ref()
                    .is_some_and(|m| m.origin_tab_id == local_tab)
                {
                    return;
                }
                self.mark_alive(&source_canvas_id);

                let accepted = match target_canvas_id {
                    Some(target) => target == self.canvas_id,
                    None => broadcast && self.accepts_broadcast(&source_canvas_id, &event),
                };
                if !accepted {
                    return;
                }
                self.bus.emit_from_remote(event);
            }
        }
    }

    /// Broadcasts pass unless a subscription for their source exists and
    /// filters out the event type.
    fn accepts_broadcast(&self, source_canvas_id: &str, event: &BusEvent) -> bool {
        let subscriptions = self
            .subscriptions
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        match subscriptions
            .iter()
            .find(|s| s.canvas_id == source_canvas_id)
        {
            Some(subscription) => subscription.accepts(&event.event_type),
            None => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::BroadcastTransport;
    use mesh_core::identity::{Identity, MemoryIdentityStore};
    use std::sync::atomic::AtomicUsize;

    fn test_bus() -> Arc<EventBus> {
        Arc::new(EventBus::new(Arc::new(Identity::initialize(Arc::new(
            MemoryIdentityStore::new(),
        )))))
    }

    fn test_router(canvas_id: &str, bus: &Arc<EventBus>) -> CanvasRouter {
        CanvasRouter::new(
            canvas_id,
            Arc::clone(bus),
            Arc::new(BroadcastTransport::default()),
            RouterConfig::default(),
        )
    }

    #[test]
    fn test_route_forward_target() {
        let one_way = Route::new("a", "b");
        assert_eq!(one_way.forward_target("a"), Some("b"));
        assert_eq!(one_way.forward_target("b"), None);

        let both = Route::new("a", "b").bidirectional();
        assert_eq!(both.forward_target("b"), Some("a"));

        let mut disabled = Route::new("a", "b");
        disabled.enabled = false;
        assert_eq!(disabled.forward_target("a"), None);
    }

    #[test]
    fn test_route_table_mutations_emit_events() {
        let bus = test_bus();
        let router = test_router("a", &bus);

        let seen = Arc::new(RwLock::new(Vec::new()));
        for event_type in ["router:routeAdded", "router:routeRemoved", "router:routeUpdated"] {
            let s = Arc::clone(&seen);
            bus.on(event_type, move |event| {
                s.write().unwrap().push(event.event_type.clone());
                Ok(())
            });
        }

        router.add_route(Route::new("a", "b"));
        let mut updated = Route::new("a", "b");
        updated.enabled = false;
        assert!(router.update_route(updated));
        assert!(router.remove_route("a", "b"));
        assert!(!router.remove_route("a", "missing"));
        assert!(!router.update_route(Route::new("a", "missing")));

        assert_eq!(
            *seen.read().unwrap(),
            vec![
                "router:routeAdded".to_string(),
                "router:routeUpdated".to_string(),
                "router:routeRemoved".to_string(),
            ]
        );
    }

    #[test]
    fn test_add_route_replaces_pair() {
        let bus = test_bus();
        let router = test_router("a", &bus);
        router.add_route(Route::new("a", "b"));
        router.add_route(Route::new("a", "b").bidirectional());
        let routes = router.routes();
        assert_eq!(routes.len(), 1);
        assert!(routes[0].bidirectional);
    }

    #[tokio::test]
    async fn test_connect_is_idempotent() {
        let bus = test_bus();
        let router = test_router("a", &bus);

        let connects = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&connects);
        bus.on("router:connected", move |_| {
            c.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        router.connect();
        router.connect();
        assert!(router.is_connected());
        assert_eq!(connects.load(Ordering::SeqCst), 1);

        router.disconnect();
        router.disconnect();
        assert!(!router.is_connected());
    }

    #[test]
    fn test_receive_discards_own_origin() {
        let bus = test_bus();
        let router = test_router("a", &bus);
        let count = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&count);
        bus.on("note:added", move |_| {
            c.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        let event = BusEvent::new("note:added", Scope::Canvas, serde_json::json!({}))
            .with_metadata(EventMetadata::stamp(bus.identity()));
        router.inner.receive(RouterMessage::Event {
            source_canvas_id: "a".to_string(),
            target_canvas_id: Some("a".to_string()),
            broadcast: false,
            event,
        });
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_receive_filters_by_target() {
        let remote_bus = test_bus();
        let bus = test_bus();
        let router = test_router("a", &bus);
        let count = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&count);
        bus.on("note:added", move |_| {
            c.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        let make_event = || {
            BusEvent::new("note:added", Scope::Canvas, serde_json::json!({}))
                .with_metadata(EventMetadata::stamp(remote_bus.identity()))
        };

        router.inner.receive(RouterMessage::Event {
            source_canvas_id: "b".to_string(),
            target_canvas_id: Some("other".to_string()),
            broadcast: false,
            event: make_event(),
        });
        assert_eq!(count.load(Ordering::SeqCst), 0);

        router.inner.receive(RouterMessage::Event {
            source_canvas_id: "b".to_string(),
            target_canvas_id: Some("a".to_string()),
            broadcast: false,
            event: make_event(),
        });
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_broadcast_respects_subscription_filter() {
        let remote_bus = test_bus();
        let bus = test_bus();
        let router = test_router("a", &bus);
        router.subscribe_to_canvas(RemoteSubscription {
            canvas_id: "b".to_string(),
            event_types: vec!["chat:message".to_string()],
        });

        let count = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&count);
        bus.on("*", move |_| {
            c.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        let broadcast = |event_type: &str| RouterMessage::Event {
            source_canvas_id: "b".to_string(),
            target_canvas_id: None,
            broadcast: true,
            event: BusEvent::new(event_type, Scope::Canvas, serde_json::json!({}))
                .with_metadata(EventMetadata::stamp(remote_bus.identity())),
        };

        router.inner.receive(broadcast("chat:typing"));
        assert_eq!(count.load(Ordering::SeqCst), 0);
        router.inner.receive(broadcast("chat:message"));
        assert_eq!(count.load(Ordering::SeqCst), 1);

        // Unsubscribed sources are unfiltered
        router.unsubscribe_from_canvas("b");
        router.inner.receive(broadcast("chat:typing"));
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_discovery_prunes_stale_entries() {
        let bus = test_bus();
        let router = CanvasRouter::new(
            "a",
            Arc::clone(&bus),
            Arc::new(BroadcastTransport::default()),
            RouterConfig {
                heartbeat_interval: Duration::from_secs(5),
                stale_after: Duration::from_millis(50),
            },
        );

        router.inner.mark_alive("b");
        assert_eq!(router.active_canvases(), vec!["b".to_string()]);

        router
            .inner
            .discovery
            .write()
            .unwrap()
            .insert("b".to_string(), now_ms() - 1000);
        assert!(router.active_canvases().is_empty());
    }

    #[test]
    fn test_prepare_outgoing_stamps_and_marks_seen() {
        let bus = test_bus();
        let router = test_router("a", &bus);
        let prepared = router
            .inner
            .prepare_outgoing(BusEvent::new("note:added", Scope::Canvas, serde_json::json!({})));
        let metadata = prepared.metadata.expect("stamped");
        assert!(metadata.has_seen(&bus.identity().tab_id()));
        // Marking the sending tab is not a hop; the receiver counts it
        assert_eq!(metadata.hop_count, 0);
        assert!(prepared.timestamp > 0);
    }
}
