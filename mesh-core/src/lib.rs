//! # Widget Mesh Core
//!
//! Messaging and permission substrate for sandboxed canvas widgets.
//! This crate holds the local pieces: the typed event model, the
//! three-lifetime identity scheme, the single-process event bus with its
//! loop guard, the same-process canvas bridge, and the canvas-as-widget
//! port adapter.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────┐
//! │                  mesh-core                    │
//! ├───────────────────────────────────────────────┤
//! │  Event Model     │  Identity                  │
//! │  - BusEvent      │  - device / tab / session  │
//! │  - Metadata      │  - user / canvas context   │
//! ├───────────────────────────────────────────────┤
//! │  EventBus        │  CanvasBridge              │
//! │  - loop guard    │  - prefix filters          │
//! │  - wildcard      │  - single-hop forwarding   │
//! ├───────────────────────────────────────────────┤
//! │  PortAdapter     │  Collaborator stores       │
//! │  - typed ports   │  - EntityStore             │
//! │  - io manifest   │  - CanvasStore             │
//! └───────────────────────────────────────────────┘
//! ```

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(clippy::all)]
#![deny(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]

pub mod bridge;
pub mod bus;
pub mod error;
pub mod event;
pub mod identity;
pub mod port;
pub mod store;

pub use bridge::{BridgeConfig, CanvasBridge};
pub use bus::{EventBus, SubscriptionId};
pub use error::HandlerError;
pub use event::{now_ms, BusEvent, EventMetadata, Scope, MAX_HOP_COUNT};
pub use identity::{
    FsIdentityStore, Identity, IdentitySnapshot, IdentityStore, MemoryIdentityStore,
};
pub use port::{canvas_port_manifest, CanvasPortAdapter, PortError, PortInput, WidgetInputEnvelope};
pub use store::{
    CanvasMode, CanvasStore, Entity, EntityId, EntityKind, EntityStore, MemoryCanvasStore,
    MemoryEntityStore, StoreChange, StoreError, Viewport, WidgetInstance, WidgetManifest,
};

/// Mesh core version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
