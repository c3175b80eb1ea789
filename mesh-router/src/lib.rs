//! Cross-tab event routing over a pluggable transport.
//!
//! A [`CanvasRouter`] connects one canvas's local [`mesh_core::EventBus`]
//! to its peers in other tabs. Canvas-scoped events matching an enabled
//! route are forwarded automatically; receiving sides re-inject them via
//! `emit_from_remote`, so the usual loop guard applies at every hop. A
//! heartbeat keeps a discovery table of live peer canvases.
//!
//! The default [`BroadcastTransport`] is an in-process fan-out channel;
//! shared-worker or socket transports slot in behind the same
//! [`Transport`] trait with an identical external contract.

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(clippy::all)]
#![deny(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]

pub mod router;
pub mod transport;

pub use router::{CanvasRouter, RemoteSubscription, Route, RouterConfig};
pub use transport::{BroadcastTransport, RouterMessage, Transport, TransportError};
