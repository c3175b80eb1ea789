//! Consent-based permission engine for cross-user widget messaging.
//!
//! Answers one question: may an event of scope `S` from user `F` reach
//! user `T`? The answer is always a structured [`PermissionDecision`]
//! with an explicit reason, never an error. Grants, requests and rules
//! are owned and persisted by the [`PermissionEngine`], keyed by the
//! local user id.
//!
//! Decision ladder (first match wins): self, same device, blocked,
//! trusted, rules by priority, grant lookup, default deny.

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(clippy::all)]
#![deny(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]

pub mod engine;
pub mod error;
pub mod types;

pub use engine::{
    ApprovalOptions, PermissionEngine, PermissionEvent, PermissionObserver, RequestParams,
};
pub use error::PermissionError;
pub use types::{
    DecisionReason, EventTypeFilter, PermissionCheck, PermissionDecision, PermissionGrant,
    PermissionPreferences, PermissionRequest, PermissionRule, PermissionScope, PermissionState,
    RequestStatus, RequestTargetType, RuleAction, RuleConditions,
};
