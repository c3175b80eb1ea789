//! Canvas-as-widget port adapter.
//!
//! Gives a canvas surface a widget identity with a declared set of named
//! input/output ports. Generic `widget:input` events addressed to this
//! canvas become store mutations; each accepted input produces exactly one
//! correlated `widget:output`. Independently, external store changes
//! (selection, viewport, mode) produce the matching output through the
//! same primitive, so consumers cannot distinguish "caused by my input"
//! from "caused by something else" without correlating ids themselves.

use std::sync::{Arc, RwLock, Weak};

use serde::Deserialize;
use thiserror::Error;

use crate::bus::{EventBus, SubscriptionId};
use crate::event::{BusEvent, Scope};
use crate::store::{
    CanvasMode, CanvasStore, Entity, EntityId, EntityKind, EntityStore, StoreChange, StoreError,
    Viewport, WidgetInstance, WidgetManifest,
};

/// Definition id shared by every canvas port adapter.
pub const CANVAS_WIDGET_DEFINITION: &str = "canvas-widget";

/// Errors raised while handling a port input.
///
/// These never surface to the sender; the protocol has no NACK. They are
/// logged and the input is dropped.
#[derive(Debug, Error)]
pub enum PortError {
    /// The port name is not part of the canvas manifest.
    #[error("Unknown port: {0}")]
    UnknownPort(String),
    /// The payload does not match the declared shape for the port.
    #[error("Invalid payload for port {port}: {message}")]
    InvalidPayload {
        /// Port that rejected the payload.
        port: String,
        /// What was wrong with it.
        message: String,
    },
    /// The underlying store rejected the mutation.
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// The `widget:input` wire payload.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WidgetInputEnvelope {
    /// Widget instance the input is addressed to.
    pub target_widget_id: String,
    /// Named input port.
    pub port_name: String,
    /// Port value, validated per port.
    #[serde(default)]
    pub value: serde_json::Value,
    /// Widget that produced the value, if any.
    #[serde(default)]
    pub source_widget_id: Option<String>,
    /// Output port the value came from, if any.
    #[serde(default)]
    pub source_port_name: Option<String>,
    /// Pipeline connection that carried the value, if any.
    #[serde(default)]
    pub connection_id: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StickerSpec {
    src: String,
    #[serde(default)]
    x: Option<f32>,
    #[serde(default)]
    y: Option<f32>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ShapeSpec {
    shape: String,
    #[serde(default)]
    color: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TextSpec {
    content: String,
    #[serde(default)]
    font_size: Option<f32>,
    #[serde(default)]
    color: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct EntitySpec {
    kind: EntityKind,
    #[serde(default)]
    props: serde_json::Value,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WidgetSpec {
    #[serde(default)]
    id: Option<String>,
    definition_id: String,
    #[serde(default)]
    props: serde_json::Value,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UpdateSpec {
    id: String,
    #[serde(default)]
    changes: serde_json::Value,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RemoveSpec {
    id: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SelectionSpec {
    ids: Vec<String>,
}

/// A validated port input: the tagged union keyed by port name.
///
/// Payloads are checked against the declared shape at the boundary;
/// unrecognized shapes are rejected instead of defaulting.
#[derive(Debug, Clone)]
#[allow(missing_docs)] // Variants mirror the port names they parse from
pub enum PortInput {
    EntityAdd { kind: EntityKind, props: serde_json::Value },
    EntityUpdate { id: String, changes: serde_json::Value },
    EntityRemove { id: String },
    EntityBatch(Vec<(EntityKind, serde_json::Value)>),
    StickerAdd { props: serde_json::Value },
    ShapeAdd { props: serde_json::Value },
    TextAdd { props: serde_json::Value },
    WidgetAdd { id: Option<String>, definition_id: String, props: serde_json::Value },
    WidgetUpdate { id: String, changes: serde_json::Value },
    WidgetRemove { id: String },
    CanvasClear,
    ViewportSet(Viewport),
    ModeSet(CanvasMode),
    SelectionSet(Vec<String>),
    SelectionClear,
}

fn invalid(port: &str, e: impl std::fmt::Display) -> PortError {
    PortError::InvalidPayload {
        port: port.to_string(),
        message: e.to_string(),
    }
}

impl PortInput {
    /// Validate `value` against the declared shape for `port_name`.
    ///
    /// # Errors
    ///
    /// [`PortError::UnknownPort`] for names outside the manifest,
    /// [`PortError::InvalidPayload`] for shape mismatches.
    #[allow(clippy::too_many_lines)]
    pub fn parse(port_name: &str, value: serde_json::Value) -> Result<Self, PortError> {
        match port_name {
            "entity.add" => {
                let spec: EntitySpec =
                    serde_json::from_value(value).map_err(|e| invalid(port_name, e))?;
                Ok(Self::EntityAdd {
                    kind: spec.kind,
                    props: spec.props,
                })
            }
            "entity.update" => {
                let spec: UpdateSpec =
                    serde_json::from_value(value).map_err(|e| invalid(port_name, e))?;
                Ok(Self::EntityUpdate {
                    id: spec.id,
                    changes: spec.changes,
                })
            }
            "entity.remove" => {
                let spec: RemoveSpec =
                    serde_json::from_value(value).map_err(|e| invalid(port_name, e))?;
                Ok(Self::EntityRemove { id: spec.id })
            }
            "entity.batch" => {
                let specs: Vec<EntitySpec> =
                    serde_json::from_value(value).map_err(|e| invalid(port_name, e))?;
                Ok(Self::EntityBatch(
                    specs.into_iter().map(|s| (s.kind, s.props)).collect(),
                ))
            }
            "sticker.add" => {
                let spec: StickerSpec =
                    serde_json::from_value(value).map_err(|e| invalid(port_name, e))?;
                Ok(Self::StickerAdd {
                    props: serde_json::json!({
                        "src": spec.src,
                        "x": spec.x.unwrap_or(0.0),
                        "y": spec.y.unwrap_or(0.0),
                    }),
                })
            }
            "shape.add" => {
                let spec: ShapeSpec =
                    serde_json::from_value(value).map_err(|e| invalid(port_name, e))?;
                Ok(Self::ShapeAdd {
                    props: serde_json::json!({
                        "shape": spec.shape,
                        "color": spec.color.unwrap_or_else(|| "#000000".to_string()),
                    }),
                })
            }
            "text.add" => {
                let spec: TextSpec =
                    serde_json::from_value(value).map_err(|e| invalid(port_name, e))?;
                Ok(Self::TextAdd {
                    props: serde_json::json!({
                        "content": spec.content,
                        "fontSize": spec.font_size.unwrap_or(16.0),
                        "color": spec.color.unwrap_or_else(|| "#000000".to_string()),
                    }),
                })
            }
            "widget.add" => {
                let spec: WidgetSpec =
                    serde_json::from_value(value).map_err(|e| invalid(port_name, e))?;
                Ok(Self::WidgetAdd {
                    id: spec.id,
                    definition_id: spec.definition_id,
                    props: spec.props,
                })
            }
            "widget.update" => {
                let spec: UpdateSpec =
                    serde_json::from_value(value).map_err(|e| invalid(port_name, e))?;
                Ok(Self::WidgetUpdate {
                    id: spec.id,
                    changes: spec.changes,
                })
            }
            "widget.remove" => {
                let spec: RemoveSpec =
                    serde_json::from_value(value).map_err(|e| invalid(port_name, e))?;
                Ok(Self::WidgetRemove { id: spec.id })
            }
            "canvas.clear" => Ok(Self::CanvasClear),
            "viewport.set" => {
                let viewport: Viewport =
                    serde_json::from_value(value).map_err(|e| invalid(port_name, e))?;
                Ok(Self::ViewportSet(viewport))
            }
            "mode.set" => {
                let mode: CanvasMode =
                    serde_json::from_value(value).map_err(|e| invalid(port_name, e))?;
                Ok(Self::ModeSet(mode))
            }
            "selection.set" => {
                let spec: SelectionSpec =
                    serde_json::from_value(value).map_err(|e| invalid(port_name, e))?;
                Ok(Self::SelectionSet(spec.ids))
            }
            "selection.clear" => Ok(Self::SelectionClear),
            other => Err(PortError::UnknownPort(other.to_string())),
        }
    }
}

/// The canvas adapter's declared io surface.
#[must_use]
pub fn canvas_port_manifest() -> WidgetManifest {
    WidgetManifest {
        definition_id: CANVAS_WIDGET_DEFINITION.to_string(),
        inputs: [
            "entity.add",
            "entity.update",
            "entity.remove",
            "entity.batch",
            "sticker.add",
            "shape.add",
            "text.add",
            "widget.add",
            "widget.update",
            "widget.remove",
            "canvas.clear",
            "viewport.set",
            "mode.set",
            "selection.set",
            "selection.clear",
        ]
        .iter()
        .map(ToString::to_string)
        .collect(),
        outputs: [
            "entity.created",
            "entity.updated",
            "entity.deleted",
            "widget.created",
            "widget.updated",
            "widget.deleted",
            "selection.changed",
            "viewport.changed",
            "mode.changed",
        ]
        .iter()
        .map(ToString::to_string)
        .collect(),
    }
}

struct AdapterInner {
    canvas_id: String,
    instance_id: String,
    canonical_id: String,
    bus: Arc<EventBus>,
    entities: Arc<dyn EntityStore>,
    canvas: Arc<dyn CanvasStore>,
    subscription: RwLock<Option<SubscriptionId>>,
}

/// Exposes a canvas surface as a widget with named ports.
pub struct CanvasPortAdapter {
    inner: Arc<AdapterInner>,
}

impl std::fmt::Debug for CanvasPortAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CanvasPortAdapter")
            .field("canvas_id", &self.inner.canvas_id)
            .field("instance_id", &self.inner.instance_id)
            .finish_non_exhaustive()
    }
}

impl CanvasPortAdapter {
    /// Attach a port adapter for `canvas_id` to the given bus and stores.
    ///
    /// Subscribes to `widget:input` on the bus and registers a watcher on
    /// the canvas store so external selection/viewport/mode changes are
    /// reported as outputs too.
    #[must_use]
    pub fn new(
        canvas_id: &str,
        bus: Arc<EventBus>,
        entities: Arc<dyn EntityStore>,
        canvas: Arc<dyn CanvasStore>,
    ) -> Self {
        let inner = Arc::new(AdapterInner {
            canvas_id: canvas_id.to_string(),
            instance_id: format!("canvas-widget-{canvas_id}"),
            canonical_id: format!("canvas:{canvas_id}"),
            bus,
            entities,
            canvas,
            subscription: RwLock::new(None),
        });

        let weak: Weak<AdapterInner> = Arc::downgrade(&inner);
        let subscription = inner.bus.on("widget:input", move |event| {
            if let Some(inner) = weak.upgrade() {
                inner.handle_input_event(event);
            }
            Ok(())
        });
        *inner
            .subscription
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = Some(subscription);

        let weak: Weak<AdapterInner> = Arc::downgrade(&inner);
        inner.canvas.watch(Box::new(move |change| {
            if let Some(inner) = weak.upgrade() {
                inner.handle_store_change(change);
            }
        }));

        Self { inner }
    }

    /// The synthetic widget instance id for this canvas.
    #[must_use]
    pub fn instance_id(&self) -> &str {
        &self.inner.instance_id
    }

    /// Detach from the bus. Store watchers become inert once the adapter
    /// is dropped.
    pub fn destroy(&self) {
        let subscription = self
            .inner
            .subscription
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .take();
        if let Some(id) = subscription {
            self.inner.bus.off(id);
        }
    }
}

impl AdapterInner {
    /// Whether a `widget:input` target resolves to this adapter.
    fn is_addressed(&self, target: &str) -> bool {
        target == self.instance_id
            || target == self.canonical_id
            || target == CANVAS_WIDGET_DEFINITION
    }

    fn handle_input_event(&self, event: &BusEvent) {
        let envelope: WidgetInputEnvelope = match serde_json::from_value(event.payload.clone()) {
            Ok(envelope) => envelope,
            Err(e) => {
                tracing::warn!(canvas_id = %self.canvas_id, "Malformed widget:input payload: {e}");
                return;
            }
        };
        if !self.is_addressed(&envelope.target_widget_id) {
            return;
        }
        let input = match PortInput::parse(&envelope.port_name, envelope.value) {
            Ok(input) => input,
            Err(e) => {
                // No NACK on the wire; the input is logged and dropped.
                tracing::warn!(
                    canvas_id = %self.canvas_id,
                    port = %envelope.port_name,
                    "Rejected widget:input: {e}"
                );
                return;
            }
        };
        if let Err(e) = self.dispatch(input) {
            tracing::warn!(
                canvas_id = %self.canvas_id,
                port = %envelope.port_name,
                "Port input failed: {e}"
            );
        }
    }

    /// Apply one store mutation and emit the one correlated output.
    ///
    /// Selection/viewport/mode setters emit through the store watcher:
    /// the mutation fires [`StoreChange`], which converges on the same
    /// [`AdapterInner::emit_output`] as every other path.
    fn dispatch(&self, input: PortInput) -> Result<(), PortError> {
        match input {
            PortInput::EntityAdd { kind, props } => self.add_entity(kind, props),
            PortInput::StickerAdd { props } => self.add_entity(EntityKind::Sticker, props),
            PortInput::ShapeAdd { props } => self.add_entity(EntityKind::Shape, props),
            PortInput::TextAdd { props } => self.add_entity(EntityKind::Text, props),
            PortInput::EntityUpdate { id, changes } => {
                let id = EntityId::parse(&id)?;
                let entity = self.entities.update_entity(id, &changes)?;
                self.emit_output("entity.updated", serde_json::to_value(entity).unwrap_or_default());
                Ok(())
            }
            PortInput::EntityRemove { id } => {
                let entity_id = EntityId::parse(&id)?;
                self.entities.remove_entity(entity_id)?;
                self.emit_output("entity.deleted", serde_json::json!({ "id": id }));
                Ok(())
            }
            PortInput::EntityBatch(specs) => {
                let mut created = Vec::with_capacity(specs.len());
                for (kind, props) in specs {
                    let entity = Entity::new(kind, props);
                    self.entities.add_entity(entity.clone())?;
                    created.push(entity);
                }
                // One output for the whole batch.
                self.emit_output(
                    "entity.created",
                    serde_json::to_value(created).unwrap_or_default(),
                );
                Ok(())
            }
            PortInput::WidgetAdd {
                id,
                definition_id,
                props,
            } => {
                let widget = WidgetInstance {
                    id: id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
                    definition_id,
                    props,
                };
                self.canvas.add_widget(widget.clone())?;
                self.emit_output("widget.created", serde_json::to_value(widget).unwrap_or_default());
                Ok(())
            }
            PortInput::WidgetUpdate { id, changes } => {
                let widget = self.canvas.update_widget(&id, &changes)?;
                self.emit_output("widget.updated", serde_json::to_value(widget).unwrap_or_default());
                Ok(())
            }
            PortInput::WidgetRemove { id } => {
                self.canvas.remove_widget(&id)?;
                self.emit_output("widget.deleted", serde_json::json!({ "id": id }));
                Ok(())
            }
            PortInput::CanvasClear => {
                self.entities.clear();
                self.emit_output("entity.deleted", serde_json::json!({ "all": true }));
                Ok(())
            }
            PortInput::ViewportSet(viewport) => {
                self.canvas.set_viewport(viewport);
                Ok(())
            }
            PortInput::ModeSet(mode) => {
                self.canvas.set_mode(mode);
                Ok(())
            }
            PortInput::SelectionSet(ids) => {
                self.canvas.select(ids);
                Ok(())
            }
            PortInput::SelectionClear => {
                self.canvas.deselect_all();
                Ok(())
            }
        }
    }

    fn add_entity(&self, kind: EntityKind, props: serde_json::Value) -> Result<(), PortError> {
        let entity = Entity::new(kind, props);
        self.entities.add_entity(entity.clone())?;
        self.emit_output(
            "entity.created",
            serde_json::to_value(entity).unwrap_or_default(),
        );
        Ok(())
    }

    fn handle_store_change(&self, change: &StoreChange) {
        match change {
            StoreChange::SelectionChanged(ids) => {
                self.emit_output("selection.changed", serde_json::json!({ "ids": ids }));
            }
            StoreChange::ViewportChanged(viewport) => {
                self.emit_output(
                    "viewport.changed",
                    serde_json::to_value(viewport).unwrap_or_default(),
                );
            }
            StoreChange::ModeChanged(mode) => {
                self.emit_output(
                    "mode.changed",
                    serde_json::to_value(mode).unwrap_or_default(),
                );
            }
        }
    }

    /// The single primitive every output converges on.
    fn emit_output(&self, port_name: &str, value: serde_json::Value) {
        let event = BusEvent::new(
            "widget:output",
            Scope::Canvas,
            serde_json::json!({
                "widgetInstanceId": self.instance_id,
                "portName": port_name,
                "value": value,
            }),
        )
        .with_source(self.instance_id.clone());
        self.bus.emit(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::{Identity, MemoryIdentityStore};
    use crate::store::{MemoryCanvasStore, MemoryEntityStore};
    use std::sync::Mutex;

    struct Fixture {
        bus: Arc<EventBus>,
        entities: Arc<MemoryEntityStore>,
        canvas: Arc<MemoryCanvasStore>,
        adapter: CanvasPortAdapter,
        outputs: Arc<Mutex<Vec<serde_json::Value>>>,
    }

    fn fixture(canvas_id: &str) -> Fixture {
        let bus = Arc::new(EventBus::new(Arc::new(Identity::initialize(Arc::new(
            MemoryIdentityStore::new(),
        )))));
        let entities = Arc::new(MemoryEntityStore::new());
        let canvas = Arc::new(MemoryCanvasStore::new());
        let adapter = CanvasPortAdapter::new(
            canvas_id,
            Arc::clone(&bus),
            Arc::clone(&entities) as Arc<dyn EntityStore>,
            Arc::clone(&canvas) as Arc<dyn CanvasStore>,
        );

        let outputs = Arc::new(Mutex::new(Vec::new()));
        let o = Arc::clone(&outputs);
        bus.on("widget:output", move |event| {
            o.lock().unwrap().push(event.payload.clone());
            Ok(())
        });

        Fixture {
            bus,
            entities,
            canvas,
            adapter,
            outputs,
        }
    }

    fn input(target: &str, port: &str, value: serde_json::Value) -> BusEvent {
        BusEvent::new(
            "widget:input",
            Scope::Canvas,
            serde_json::json!({
                "targetWidgetId": target,
                "portName": port,
                "value": value,
            }),
        )
    }

    #[test]
    fn test_sticker_add_emits_exactly_one_entity_created() {
        let f = fixture("main");
        f.bus.emit(input(
            "canvas-widget-main",
            "sticker.add",
            serde_json::json!({"src": "x.png"}),
        ));

        let outputs = f.outputs.lock().unwrap();
        assert_eq!(outputs.len(), 1);
        assert_eq!(outputs[0]["portName"], "entity.created");
        assert_eq!(outputs[0]["widgetInstanceId"], "canvas-widget-main");
        assert_eq!(outputs[0]["value"]["props"]["src"], "x.png");

        // The created id is fresh and the entity landed in the store
        let id = outputs[0]["value"]["id"].as_str().expect("id");
        let entity_id = EntityId::parse(id).expect("valid id");
        assert!(f.entities.get_entity(entity_id).is_some());
    }

    #[test]
    fn test_addressing_by_canonical_and_definition_id() {
        let f = fixture("main");
        f.bus.emit(input(
            "canvas:main",
            "text.add",
            serde_json::json!({"content": "hello"}),
        ));
        f.bus.emit(input(
            CANVAS_WIDGET_DEFINITION,
            "shape.add",
            serde_json::json!({"shape": "circle"}),
        ));
        assert_eq!(f.outputs.lock().unwrap().len(), 2);
    }

    #[test]
    fn test_not_addressed_input_is_ignored() {
        let f = fixture("main");
        f.bus.emit(input(
            "canvas-widget-other",
            "sticker.add",
            serde_json::json!({"src": "x.png"}),
        ));
        assert!(f.outputs.lock().unwrap().is_empty());
        assert!(f.entities.is_empty());
    }

    #[test]
    fn test_unknown_port_is_dropped_without_output() {
        let f = fixture("main");
        f.bus.emit(input(
            "canvas-widget-main",
            "teleport.activate",
            serde_json::json!({}),
        ));
        assert!(f.outputs.lock().unwrap().is_empty());
    }

    #[test]
    fn test_invalid_payload_is_rejected() {
        let f = fixture("main");
        // sticker.add requires `src`
        f.bus.emit(input(
            "canvas-widget-main",
            "sticker.add",
            serde_json::json!({"url": "x.png"}),
        ));
        assert!(f.outputs.lock().unwrap().is_empty());
        assert!(f.entities.is_empty());
    }

    #[test]
    fn test_update_and_remove_round_trip() {
        let f = fixture("main");
        f.bus.emit(input(
            "canvas-widget-main",
            "sticker.add",
            serde_json::json!({"src": "x.png"}),
        ));
        let id = f.outputs.lock().unwrap()[0]["value"]["id"]
            .as_str()
            .expect("id")
            .to_string();

        f.bus.emit(input(
            "canvas-widget-main",
            "entity.update",
            serde_json::json!({"id": id, "changes": {"src": "y.png"}}),
        ));
        f.bus.emit(input(
            "canvas-widget-main",
            "entity.remove",
            serde_json::json!({"id": id}),
        ));

        let outputs = f.outputs.lock().unwrap();
        assert_eq!(outputs.len(), 3);
        assert_eq!(outputs[1]["portName"], "entity.updated");
        assert_eq!(outputs[1]["value"]["props"]["src"], "y.png");
        assert_eq!(outputs[2]["portName"], "entity.deleted");
        assert_eq!(outputs[2]["value"]["id"], id);
        assert!(f.entities.is_empty());
    }

    #[test]
    fn test_update_unknown_entity_is_noop() {
        let f = fixture("main");
        f.bus.emit(input(
            "canvas-widget-main",
            "entity.update",
            serde_json::json!({"id": EntityId::new().to_string(), "changes": {}}),
        ));
        assert!(f.outputs.lock().unwrap().is_empty());
    }

    #[test]
    fn test_batch_emits_single_output() {
        let f = fixture("main");
        f.bus.emit(input(
            "canvas-widget-main",
            "entity.batch",
            serde_json::json!([
                {"kind": "sticker", "props": {"src": "a.png"}},
                {"kind": "text", "props": {"content": "b"}},
            ]),
        ));
        let outputs = f.outputs.lock().unwrap();
        assert_eq!(outputs.len(), 1);
        assert_eq!(outputs[0]["portName"], "entity.created");
        assert_eq!(outputs[0]["value"].as_array().map(Vec::len), Some(2));
        assert_eq!(f.entities.len(), 2);
    }

    #[test]
    fn test_viewport_input_emits_one_output_via_watcher() {
        let f = fixture("main");
        f.bus.emit(input(
            "canvas-widget-main",
            "viewport.set",
            serde_json::json!({"x": 10.0, "y": 20.0, "zoom": 2.0}),
        ));
        let outputs = f.outputs.lock().unwrap();
        assert_eq!(outputs.len(), 1);
        assert_eq!(outputs[0]["portName"], "viewport.changed");
        assert_eq!(outputs[0]["value"]["zoom"], 2.0);
        drop(outputs);
        assert!((f.canvas.viewport().zoom - 2.0).abs() < f32::EPSILON);
    }

    #[test]
    fn test_external_store_change_emits_output() {
        let f = fixture("main");
        // Not an input: something else mutated the store.
        f.canvas.select(vec!["e1".to_string(), "e2".to_string()]);

        let outputs = f.outputs.lock().unwrap();
        assert_eq!(outputs.len(), 1);
        assert_eq!(outputs[0]["portName"], "selection.changed");
        assert_eq!(
            outputs[0]["value"]["ids"],
            serde_json::json!(["e1", "e2"])
        );
    }

    #[test]
    fn test_widget_crud_outputs() {
        let f = fixture("main");
        f.bus.emit(input(
            "canvas-widget-main",
            "widget.add",
            serde_json::json!({"definitionId": "timer", "props": {"seconds": 30}}),
        ));
        let widget_id = f.outputs.lock().unwrap()[0]["value"]["id"]
            .as_str()
            .expect("id")
            .to_string();
        f.bus.emit(input(
            "canvas-widget-main",
            "widget.remove",
            serde_json::json!({"id": widget_id}),
        ));

        let outputs = f.outputs.lock().unwrap();
        assert_eq!(outputs.len(), 2);
        assert_eq!(outputs[0]["portName"], "widget.created");
        assert_eq!(outputs[1]["portName"], "widget.deleted");
    }

    #[test]
    fn test_destroy_stops_handling_inputs() {
        let f = fixture("main");
        f.adapter.destroy();
        f.bus.emit(input(
            "canvas-widget-main",
            "sticker.add",
            serde_json::json!({"src": "x.png"}),
        ));
        assert!(f.outputs.lock().unwrap().is_empty());
    }

    #[test]
    fn test_manifest_declares_all_ports() {
        let manifest = canvas_port_manifest();
        assert_eq!(manifest.definition_id, CANVAS_WIDGET_DEFINITION);
        assert!(manifest.has_input("sticker.add"));
        assert!(manifest.has_input("selection.clear"));
        assert!(manifest.has_output("entity.created"));
        assert!(manifest.has_output("mode.changed"));
    }
}
