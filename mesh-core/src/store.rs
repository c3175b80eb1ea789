//! Collaborator store seams consumed by the port adapter.
//!
//! The substrate does not own entities or canvas chrome; it mutates them
//! through the [`EntityStore`] and [`CanvasStore`] traits and observes
//! selection/viewport/mode changes through registered watchers. The
//! in-memory implementations here back tests and embedded hosts.

use std::collections::HashMap;
use std::sync::RwLock;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Errors from collaborator store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The referenced entity does not exist.
    #[error("Entity not found: {0}")]
    EntityNotFound(String),
    /// The referenced widget instance does not exist.
    #[error("Widget not found: {0}")]
    WidgetNotFound(String),
}

/// Unique identifier for an entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EntityId(Uuid);

impl EntityId {
    /// Create a new unique entity ID.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Parse an entity ID from its string form.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::EntityNotFound`] when the string is not a
    /// valid id.
    pub fn parse(s: &str) -> Result<Self, StoreError> {
        Uuid::parse_str(s)
            .map(Self)
            .map_err(|_| StoreError::EntityNotFound(s.to_string()))
    }
}

impl Default for EntityId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for EntityId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The kind of content an entity carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityKind {
    /// An image sticker.
    Sticker,
    /// A vector shape.
    Shape,
    /// A text block.
    Text,
}

/// A canvas entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Entity {
    /// Unique identifier.
    pub id: EntityId,
    /// Content kind.
    pub kind: EntityKind,
    /// Kind-specific properties (src, content, geometry, style).
    #[serde(default)]
    pub props: serde_json::Value,
}

impl Entity {
    /// Create an entity of the given kind with a fresh id.
    #[must_use]
    pub fn new(kind: EntityKind, props: serde_json::Value) -> Self {
        Self {
            id: EntityId::new(),
            kind,
            props,
        }
    }
}

/// A widget instance hosted on a canvas.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WidgetInstance {
    /// Unique instance identifier.
    pub id: String,
    /// The widget definition this instance was created from.
    pub definition_id: String,
    /// Instance properties.
    #[serde(default)]
    pub props: serde_json::Value,
}

/// Canvas viewport (pan and zoom).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Viewport {
    /// Pan offset X.
    pub x: f32,
    /// Pan offset Y.
    pub y: f32,
    /// Zoom factor (1.0 = 100%).
    pub zoom: f32,
}

impl Default for Viewport {
    fn default() -> Self {
        Self {
            x: 0.0,
            y: 0.0,
            zoom: 1.0,
        }
    }
}

/// Canvas interaction mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CanvasMode {
    /// Select and manipulate entities.
    #[default]
    Select,
    /// Pan/zoom the canvas.
    Pan,
    /// Freehand drawing.
    Draw,
    /// Wire widget ports together.
    Connect,
}

/// A change observed on the canvas store, for *any* cause.
#[derive(Debug, Clone, PartialEq)]
pub enum StoreChange {
    /// The selection set changed.
    SelectionChanged(Vec<String>),
    /// The viewport changed.
    ViewportChanged(Viewport),
    /// The interaction mode changed.
    ModeChanged(CanvasMode),
}

/// Watcher invoked on every [`StoreChange`].
pub type StoreWatcher = Box<dyn Fn(&StoreChange) + Send + Sync>;

/// External store owning canvas entities.
pub trait EntityStore: Send + Sync {
    /// Add an entity.
    ///
    /// # Errors
    ///
    /// Implementations may reject invalid entities.
    fn add_entity(&self, entity: Entity) -> Result<(), StoreError>;

    /// Merge `changes` into an entity's props and return the result.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::EntityNotFound`] for unknown ids.
    fn update_entity(&self, id: EntityId, changes: &serde_json::Value)
        -> Result<Entity, StoreError>;

    /// Remove an entity.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::EntityNotFound`] for unknown ids.
    fn remove_entity(&self, id: EntityId) -> Result<(), StoreError>;

    /// Remove every entity.
    fn clear(&self);

    /// Look up an entity by id.
    fn get_entity(&self, id: EntityId) -> Option<Entity>;
}

/// External store owning widget instances, selection, viewport and mode.
pub trait CanvasStore: Send + Sync {
    /// Add a widget instance.
    ///
    /// # Errors
    ///
    /// Implementations may reject invalid instances.
    fn add_widget(&self, widget: WidgetInstance) -> Result<(), StoreError>;

    /// Merge `changes` into a widget's props and return the result.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::WidgetNotFound`] for unknown ids.
    fn update_widget(
        &self,
        id: &str,
        changes: &serde_json::Value,
    ) -> Result<WidgetInstance, StoreError>;

    /// Remove a widget instance.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::WidgetNotFound`] for unknown ids.
    fn remove_widget(&self, id: &str) -> Result<(), StoreError>;

    /// Set the viewport.
    fn set_viewport(&self, viewport: Viewport);

    /// Set the interaction mode.
    fn set_mode(&self, mode: CanvasMode);

    /// Replace the selection set.
    fn select(&self, ids: Vec<String>);

    /// Clear the selection set.
    fn deselect_all(&self);

    /// Current selection.
    fn selection(&self) -> Vec<String>;

    /// Current viewport.
    fn viewport(&self) -> Viewport;

    /// Current mode.
    fn mode(&self) -> CanvasMode;

    /// Register a watcher invoked on every selection/viewport/mode change,
    /// regardless of what caused it.
    fn watch(&self, watcher: StoreWatcher);
}

/// In-memory entity store.
#[derive(Default)]
pub struct MemoryEntityStore {
    entities: RwLock<HashMap<EntityId, Entity>>,
}

impl MemoryEntityStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored entities.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entities
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .len()
    }

    /// Whether the store is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl EntityStore for MemoryEntityStore {
    fn add_entity(&self, entity: Entity) -> Result<(), StoreError> {
        self.entities
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .insert(entity.id, entity);
        Ok(())
    }

    fn update_entity(
        &self,
        id: EntityId,
        changes: &serde_json::Value,
    ) -> Result<Entity, StoreError> {
        let mut entities = self
            .entities
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let entity = entities
            .get_mut(&id)
            .ok_or_else(|| StoreError::EntityNotFound(id.to_string()))?;
        merge_props(&mut entity.props, changes);
        Ok(entity.clone())
    }

    fn remove_entity(&self, id: EntityId) -> Result<(), StoreError> {
        self.entities
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .remove(&id)
            .map(|_| ())
            .ok_or_else(|| StoreError::EntityNotFound(id.to_string()))
    }

    fn clear(&self) {
        self.entities
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clear();
    }

    fn get_entity(&self, id: EntityId) -> Option<Entity> {
        self.entities
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .get(&id)
            .cloned()
    }
}

struct CanvasState {
    widgets: HashMap<String, WidgetInstance>,
    selection: Vec<String>,
    viewport: Viewport,
    mode: CanvasMode,
}

impl Default for CanvasState {
    fn default() -> Self {
        Self {
            widgets: HashMap::new(),
            selection: Vec::new(),
            viewport: Viewport::default(),
            mode: CanvasMode::default(),
        }
    }
}

/// In-memory canvas store firing registered watchers on every change.
#[derive(Default)]
pub struct MemoryCanvasStore {
    state: RwLock<CanvasState>,
    watchers: RwLock<Vec<StoreWatcher>>,
}

impl MemoryCanvasStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn notify(&self, change: &StoreChange) {
        let watchers = self
            .watchers
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        for watcher in watchers.iter() {
            watcher(change);
        }
    }
}

impl CanvasStore for MemoryCanvasStore {
    fn add_widget(&self, widget: WidgetInstance) -> Result<(), StoreError> {
        self.state
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .widgets
            .insert(widget.id.clone(), widget);
        Ok(())
    }

    fn update_widget(
        &self,
        id: &str,
        changes: &serde_json::Value,
    ) -> Result<WidgetInstance, StoreError> {
        let mut state = self
            .state
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let widget = state
            .widgets
            .get_mut(id)
            .ok_or_else(|| StoreError::WidgetNotFound(id.to_string()))?;
        merge_props(&mut widget.props, changes);
        Ok(widget.clone())
    }

    fn remove_widget(&self, id: &str) -> Result<(), StoreError> {
        self.state
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .widgets
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| StoreError::WidgetNotFound(id.to_string()))
    }

    fn set_viewport(&self, viewport: Viewport) {
        self.state
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .viewport = viewport;
        self.notify(&StoreChange::ViewportChanged(viewport));
    }

    fn set_mode(&self, mode: CanvasMode) {
        self.state
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .mode = mode;
        self.notify(&StoreChange::ModeChanged(mode));
    }

    fn select(&self, ids: Vec<String>) {
        self.state
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .selection = ids.clone();
        self.notify(&StoreChange::SelectionChanged(ids));
    }

    fn deselect_all(&self) {
        self.state
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .selection
            .clear();
        self.notify(&StoreChange::SelectionChanged(Vec::new()));
    }

    fn selection(&self) -> Vec<String> {
        self.state
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .selection
            .clone()
    }

    fn viewport(&self) -> Viewport {
        self.state
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .viewport
    }

    fn mode(&self) -> CanvasMode {
        self.state
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .mode
    }

    fn watch(&self, watcher: StoreWatcher) {
        self.watchers
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .push(watcher);
    }
}

/// Merge a JSON object patch into props, replacing non-object props.
fn merge_props(props: &mut serde_json::Value, changes: &serde_json::Value) {
    match (props.as_object_mut(), changes.as_object()) {
        (Some(target), Some(patch)) => {
            for (key, value) in patch {
                target.insert(key.clone(), value.clone());
            }
        }
        _ => *props = changes.clone(),
    }
}

/// Declared io surface of one widget kind, used to validate pipeline
/// wiring (the validation itself lives outside this crate).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WidgetManifest {
    /// Widget definition identifier.
    pub definition_id: String,
    /// Named input ports this widget accepts.
    pub inputs: Vec<String>,
    /// Named output ports this widget emits.
    pub outputs: Vec<String>,
}

impl WidgetManifest {
    /// Whether the manifest declares the named input port.
    #[must_use]
    pub fn has_input(&self, port: &str) -> bool {
        self.inputs.iter().any(|p| p == port)
    }

    /// Whether the manifest declares the named output port.
    #[must_use]
    pub fn has_output(&self, port: &str) -> bool {
        self.outputs.iter().any(|p| p == port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_entity_add_update_remove() {
        let store = MemoryEntityStore::new();
        let entity = Entity::new(EntityKind::Sticker, serde_json::json!({"src": "x.png"}));
        let id = entity.id;
        store.add_entity(entity).expect("add");

        let updated = store
            .update_entity(id, &serde_json::json!({"src": "y.png", "w": 64}))
            .expect("update");
        assert_eq!(updated.props["src"], "y.png");
        assert_eq!(updated.props["w"], 64);

        store.remove_entity(id).expect("remove");
        assert!(store.get_entity(id).is_none());
        assert!(matches!(
            store.remove_entity(id),
            Err(StoreError::EntityNotFound(_))
        ));
    }

    #[test]
    fn test_entity_clear() {
        let store = MemoryEntityStore::new();
        store
            .add_entity(Entity::new(EntityKind::Text, serde_json::json!({})))
            .expect("add");
        store
            .add_entity(Entity::new(EntityKind::Shape, serde_json::json!({})))
            .expect("add");
        assert_eq!(store.len(), 2);
        store.clear();
        assert!(store.is_empty());
    }

    #[test]
    fn test_widget_crud() {
        let store = MemoryCanvasStore::new();
        store
            .add_widget(WidgetInstance {
                id: "w1".to_string(),
                definition_id: "timer".to_string(),
                props: serde_json::json!({"seconds": 30}),
            })
            .expect("add");

        let updated = store
            .update_widget("w1", &serde_json::json!({"seconds": 60}))
            .expect("update");
        assert_eq!(updated.props["seconds"], 60);

        store.remove_widget("w1").expect("remove");
        assert!(matches!(
            store.remove_widget("w1"),
            Err(StoreError::WidgetNotFound(_))
        ));
    }

    #[test]
    fn test_watchers_fire_on_every_change() {
        let store = MemoryCanvasStore::new();
        let count = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&count);
        store.watch(Box::new(move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        }));

        store.select(vec!["e1".to_string()]);
        store.set_viewport(Viewport {
            x: 10.0,
            y: 0.0,
            zoom: 2.0,
        });
        store.set_mode(CanvasMode::Draw);
        store.deselect_all();
        assert_eq!(count.load(Ordering::SeqCst), 4);
        assert!(store.selection().is_empty());
        assert_eq!(store.mode(), CanvasMode::Draw);
    }

    #[test]
    fn test_entity_id_parse() {
        let id = EntityId::new();
        let parsed = EntityId::parse(&id.to_string()).expect("round trip");
        assert_eq!(parsed, id);
        assert!(EntityId::parse("not-a-uuid").is_err());
    }

    #[test]
    fn test_manifest_lookup() {
        let manifest = WidgetManifest {
            definition_id: "canvas-widget".to_string(),
            inputs: vec!["sticker.add".to_string()],
            outputs: vec!["entity.created".to_string()],
        };
        assert!(manifest.has_input("sticker.add"));
        assert!(!manifest.has_input("entity.created"));
        assert!(manifest.has_output("entity.created"));
    }
}
