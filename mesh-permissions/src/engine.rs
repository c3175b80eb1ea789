//! The permission engine: decision ladder, request lifecycle, user
//! lists, rules and background maintenance.
//!
//! One engine exists per local user. It owns the [`PermissionState`]
//! blob, persists it on every mutation, and surfaces lifecycle changes
//! through an injected observer interface plus `permission:*` bus
//! events. Persistence failures are logged and tolerated; in-memory
//! state stays authoritative for the rest of the session.

use std::path::PathBuf;
use std::sync::{Arc, RwLock, Weak};
use std::time::Duration;

use mesh_core::event::{now_ms, BusEvent, Scope};
use mesh_core::identity::Identity;
use mesh_core::EventBus;
use uuid::Uuid;

use crate::error::PermissionError;
use crate::types::{
    DecisionReason, EventTypeFilter, PermissionCheck, PermissionDecision, PermissionGrant,
    PermissionRequest, PermissionRule, PermissionScope, PermissionState, RequestStatus,
    RequestTargetType, RuleAction,
};

/// Default background sweep interval.
pub const MAINTENANCE_INTERVAL: Duration = Duration::from_secs(60);

/// How long decided/abandoned outgoing requests are retained.
const OUTGOING_RETENTION_MS: u64 = 24 * 60 * 60 * 1000;

/// Parameters for a new outgoing permission request.
#[derive(Debug, Clone)]
pub struct RequestParams {
    /// Principal being asked for consent.
    pub target_id: String,
    /// Kind of principal being asked.
    pub target_type: RequestTargetType,
    /// Scope being requested.
    pub scope: PermissionScope,
    /// Event types being requested; `None` means unrestricted.
    pub event_types: Option<EventTypeFilter>,
    /// Restrict to one canvas.
    pub canvas_id: Option<String>,
    /// Restrict to one widget.
    pub widget_id: Option<String>,
    /// Request TTL override, milliseconds. `None` uses the preference
    /// default; zero disables the TTL.
    pub ttl_ms: Option<u64>,
}

impl RequestParams {
    /// A request for `scope` consent from `target_id`, defaults elsewhere.
    #[must_use]
    pub fn new(target_id: impl Into<String>, scope: PermissionScope) -> Self {
        Self {
            target_id: target_id.into(),
            target_type: RequestTargetType::User,
            scope,
            event_types: None,
            canvas_id: None,
            widget_id: None,
            ttl_ms: None,
        }
    }
}

/// Options applied when approving a request.
#[derive(Debug, Clone, Default)]
pub struct ApprovalOptions {
    /// Grant lifetime, milliseconds. `None` uses the preference default
    /// (which may itself be "no expiry").
    pub duration_ms: Option<u64>,
    /// Usage ceiling for the grant.
    pub max_uses: Option<u32>,
    /// Also create a mirrored reverse grant.
    pub bidirectional: bool,
}

/// A permission lifecycle change, delivered to observers.
#[derive(Debug, Clone)]
pub enum PermissionEvent {
    /// The local user created an outgoing request.
    RequestCreated(PermissionRequest),
    /// An incoming request was enqueued as pending.
    RequestReceived(PermissionRequest),
    /// A request was approved and produced a grant.
    RequestApproved {
        /// The decided request.
        request: PermissionRequest,
        /// The grant it produced.
        grant: PermissionGrant,
    },
    /// A request was denied.
    RequestDenied(PermissionRequest),
    /// A grant was revoked.
    GrantRevoked(PermissionGrant),
}

/// Typed observer for permission lifecycle events.
///
/// Cross-context relays (notification UI, remote dispatch) implement
/// this and are injected; the engine never broadcasts through a hidden
/// global channel.
pub trait PermissionObserver: Send + Sync {
    /// Called synchronously after each lifecycle change is persisted.
    fn on_permission_event(&self, event: &PermissionEvent);
}

/// Per-user store of grants, requests and rules; answers permission
/// checks with a structured decision.
pub struct PermissionEngine {
    user_id: String,
    identity: Arc<Identity>,
    data_dir: Option<PathBuf>,
    state: RwLock<PermissionState>,
    bus: RwLock<Option<Arc<EventBus>>>,
    observers: RwLock<Vec<Arc<dyn PermissionObserver>>>,
}

impl std::fmt::Debug for PermissionEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PermissionEngine")
            .field("user_id", &self.user_id)
            .field("data_dir", &self.data_dir)
            .finish_non_exhaustive()
    }
}

/// Outcome of triaging an incoming request under the state lock.
enum Disposition {
    Enqueued(bool),
    AutoApprove,
    AutoDeny(PermissionRequest),
    Dropped,
}

fn new_id(prefix: &str) -> String {
    format!("{prefix}-{}", Uuid::new_v4())
}

fn sanitize(user_id: &str) -> String {
    user_id
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
        .collect()
}

impl PermissionEngine {
    /// An in-memory engine for `user_id` with no persistence.
    #[must_use]
    pub fn new(user_id: impl Into<String>, identity: Arc<Identity>) -> Self {
        Self {
            user_id: user_id.into(),
            identity,
            data_dir: None,
            state: RwLock::new(PermissionState::default()),
            bus: RwLock::new(None),
            observers: RwLock::new(Vec::new()),
        }
    }

    /// An engine persisting its state blob under `data_dir`, loading any
    /// existing blob for `user_id` first.
    #[must_use]
    pub fn with_data_dir(
        user_id: impl Into<String>,
        identity: Arc<Identity>,
        data_dir: impl Into<PathBuf>,
    ) -> Self {
        let user_id = user_id.into();
        let data_dir = data_dir.into();
        let state = Self::load_state(&data_dir, &user_id);
        Self {
            user_id,
            identity,
            data_dir: Some(data_dir),
            state: RwLock::new(state),
            bus: RwLock::new(None),
            observers: RwLock::new(Vec::new()),
        }
    }

    /// The local user this engine is keyed by.
    #[must_use]
    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    /// Attach a bus for `permission:*` lifecycle events.
    pub fn set_bus(&self, bus: Arc<EventBus>) {
        *self
            .bus
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = Some(bus);
    }

    /// Register a lifecycle observer.
    pub fn add_observer(&self, observer: Arc<dyn PermissionObserver>) {
        self.observers
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .push(observer);
    }

    fn load_state(data_dir: &std::path::Path, user_id: &str) -> PermissionState {
        let path = data_dir.join(format!("permissions-{}.json", sanitize(user_id)));
        match std::fs::read_to_string(&path) {
            Ok(contents) => match serde_json::from_str(&contents) {
                // Missing preference fields are filled from defaults by serde
                Ok(state) => state,
                Err(e) => {
                    tracing::warn!("Discarding corrupt permission state at {path:?}: {e}");
                    PermissionState::default()
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => PermissionState::default(),
            Err(e) => {
                tracing::warn!("Failed to read permission state at {path:?}: {e}");
                PermissionState::default()
            }
        }
    }

    /// Write the blob out; on failure, warn and stay in-memory.
    fn persist(&self, state: &PermissionState) {
        let Some(data_dir) = &self.data_dir else {
            return;
        };
        let path = data_dir.join(format!("permissions-{}.json", sanitize(&self.user_id)));
        let result = std::fs::create_dir_all(data_dir).and_then(|()| {
            let json = serde_json::to_string_pretty(state)
                .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
            std::fs::write(&path, json)
        });
        if let Err(e) = result {
            tracing::warn!("Failed to persist permission state to {path:?}: {e}");
        }
    }

    fn publish(&self, event: &PermissionEvent) {
        let observers: Vec<_> = self
            .observers
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone();
        for observer in observers {
            observer.on_permission_event(event);
        }

        let bus = self
            .bus
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone();
        if let Some(bus) = bus {
            let (event_type, payload) = match event {
                PermissionEvent::RequestCreated(request)
                | PermissionEvent::RequestReceived(request) => (
                    "permission:request",
                    serde_json::to_value(request).unwrap_or_default(),
                ),
                PermissionEvent::RequestApproved { request, grant } => (
                    "permission:approved",
                    serde_json::json!({
                        "request": request,
                        "grant": grant,
                    }),
                ),
                PermissionEvent::RequestDenied(request) => (
                    "permission:denied",
                    serde_json::to_value(request).unwrap_or_default(),
                ),
                PermissionEvent::GrantRevoked(grant) => (
                    "permission:revoked",
                    serde_json::to_value(grant).unwrap_or_default(),
                ),
            };
            bus.emit(BusEvent::new(event_type, Scope::User, payload));
        }
    }

    /// Answer "may an event of this scope from this user reach that
    /// user?". Never fails; denial is a structured result.
    ///
    /// Decision order, first match wins: self, same device, blocked
    /// list, trusted list, rules by descending priority, grant lookup,
    /// default deny.
    #[allow(clippy::too_many_lines)]
    pub fn check_permission(&self, check: &PermissionCheck) -> PermissionDecision {
        let now = now_ms();

        if check.from_user_id == check.to_user_id {
            return PermissionDecision::allow(DecisionReason::SelfPermission);
        }

        if check.from_user_id == self.user_id {
            if let Some(origin) = &check.origin {
                if self.identity.is_current_device(origin) {
                    return PermissionDecision::allow(DecisionReason::SameDevice);
                }
            }
        }

        let mut state = self
            .state
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner);

        if state.blocked_users.contains(&check.from_user_id) {
            return PermissionDecision::deny(DecisionReason::RuleDeny)
                .with_message(format!("User {} is blocked", check.from_user_id));
        }
        if state.trusted_users.contains(&check.from_user_id) {
            return PermissionDecision::allow(DecisionReason::RuleAllow)
                .with_message(format!("User {} is trusted", check.from_user_id));
        }

        let mut live_rules: Vec<&PermissionRule> =
            state.rules.iter().filter(|r| r.is_live(now)).collect();
        live_rules.sort_by(|a, b| b.priority.cmp(&a.priority));
        for rule in live_rules {
            if !rule.conditions.matches(check) {
                continue;
            }
            match rule.action {
                RuleAction::Allow => {
                    return PermissionDecision::allow(DecisionReason::RuleAllow)
                        .with_rule(rule.clone());
                }
                RuleAction::Deny => {
                    return PermissionDecision::deny(DecisionReason::RuleDeny)
                        .with_rule(rule.clone());
                }
                // The highest-priority matching rule defers to grants
                RuleAction::Prompt => break,
            }
        }

        let matches_check = |grant: &PermissionGrant| {
            grant.granter_id == check.to_user_id
                && grant.grantee_id == check.from_user_id
                && grant.scope.covers(check.scope)
                && match &grant.event_types {
                    None | Some(EventTypeFilter::Any) => true,
                    Some(filter) => check
                        .event_type
                        .as_deref()
                        .is_some_and(|t| filter.allows(t)),
                }
                && grant
                    .canvas_id
                    .as_deref()
                    .is_none_or(|c| check.canvas_id.as_deref() == Some(c))
                && grant
                    .widget_id
                    .as_deref()
                    .is_none_or(|w| check.widget_id.as_deref() == Some(w))
        };

        // Prefer a usable grant over a dead one so a fresh grant after a
        // revocation wins.
        let usable = |grant: &PermissionGrant| {
            grant.is_active && !grant.is_expired(now) && !grant.is_exhausted()
        };

        let grants_given_len = state.grants_given.len();
        let position = {
            let all = state
                .grants_given
                .iter()
                .chain(state.grants_received.iter());
            let mut first_match = None;
            let mut first_usable = None;
            for (index, grant) in all.enumerate() {
                if !matches_check(grant) {
                    continue;
                }
                if first_match.is_none() {
                    first_match = Some(index);
                }
                if usable(grant) {
                    first_usable = Some(index);
                    break;
                }
            }
            first_usable.or(first_match)
        };

        let Some(index) = position else {
            return PermissionDecision::deny(DecisionReason::NoPermission);
        };
        let grant = if index < grants_given_len {
            &mut state.grants_given[index]
        } else {
            &mut state.grants_received[index - grants_given_len]
        };

        if !grant.is_active {
            return PermissionDecision::deny(DecisionReason::Revoked).with_grant(grant.clone());
        }
        if grant.is_expired(now) {
            grant.is_active = false;
            let decision =
                PermissionDecision::deny(DecisionReason::Expired).with_grant(grant.clone());
            self.persist(&state);
            return decision;
        }
        if grant.is_exhausted() {
            return PermissionDecision::deny(DecisionReason::MaxUsesReached)
                .with_grant(grant.clone());
        }

        grant.usage_count += 1;
        grant.last_used_at = Some(now);
        let decision =
            PermissionDecision::allow(DecisionReason::GrantExists).with_grant(grant.clone());
        self.persist(&state);
        decision
    }

    /// Create and record an outgoing permission request.
    ///
    /// # Errors
    ///
    /// [`PermissionError::Validation`] when the target is empty or the
    /// request asks the local user for consent from themselves.
    pub fn request_permission(
        &self,
        params: RequestParams,
    ) -> Result<PermissionRequest, PermissionError> {
        if params.target_id.trim().is_empty() {
            return Err(PermissionError::Validation(
                "Request target must not be empty".to_string(),
            ));
        }
        if params.target_type == RequestTargetType::User && params.target_id == self.user_id {
            return Err(PermissionError::Validation(
                "Cannot request permission from yourself".to_string(),
            ));
        }

        let now = now_ms();
        let request = {
            let mut state = self
                .state
                .write()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            let ttl = params.ttl_ms.unwrap_or(state.preferences.request_ttl_ms);
            let request = PermissionRequest {
                id: new_id("req"),
                requester_id: self.user_id.clone(),
                target_id: params.target_id,
                target_type: params.target_type,
                scope: params.scope,
                event_types: params.event_types,
                canvas_id: params.canvas_id,
                widget_id: params.widget_id,
                created_at: now,
                expires_at: (ttl > 0).then(|| now + ttl),
                status: RequestStatus::Pending,
                message: None,
            };
            state.outgoing_requests.push(request.clone());
            self.persist(&state);
            request
        };

        self.publish(&PermissionEvent::RequestCreated(request.clone()));
        Ok(request)
    }

    /// Accept a request arriving from another context.
    ///
    /// De-duplicates by id, drops already-expired requests, auto-decides
    /// for trusted/blocked requesters and otherwise enqueues as pending.
    ///
    /// # Errors
    ///
    /// [`PermissionError::Validation`] when the request is malformed or
    /// not addressed to this engine's user or device.
    pub fn handle_incoming_request(
        &self,
        request: PermissionRequest,
    ) -> Result<(), PermissionError> {
        if request.id.trim().is_empty() || request.requester_id.trim().is_empty() {
            return Err(PermissionError::Validation(
                "Request id and requester must not be empty".to_string(),
            ));
        }
        let addressed = match request.target_type {
            RequestTargetType::User => request.target_id == self.user_id,
            RequestTargetType::Device => request.target_id == self.identity.device_id(),
        };
        if !addressed {
            return Err(PermissionError::Validation(format!(
                "Request {} is not addressed to this user",
                request.id
            )));
        }
        if request.status != RequestStatus::Pending {
            return Err(PermissionError::Validation(format!(
                "Incoming request {} is not pending",
                request.id
            )));
        }

        let now = now_ms();
        let disposition = {
            let mut state = self
                .state
                .write()
                .unwrap_or_else(std::sync::PoisonError::into_inner);

            let duplicate = state
                .pending_requests
                .iter()
                .chain(state.outgoing_requests.iter())
                .any(|r| r.id == request.id);
            if duplicate {
                tracing::warn!("Ignoring duplicate permission request {}", request.id);
                Disposition::Dropped
            } else if request.is_expired(now) {
                tracing::warn!("Ignoring expired permission request {}", request.id);
                Disposition::Dropped
            } else if state.preferences.auto_deny_blocked
                && state.blocked_users.contains(&request.requester_id)
            {
                let mut denied = request.clone();
                denied.status = RequestStatus::Denied;
                denied.message = Some("Requester is blocked".to_string());
                Disposition::AutoDeny(denied)
            } else if state.preferences.auto_approve_trusted
                && state.trusted_users.contains(&request.requester_id)
            {
                state.pending_requests.push(request.clone());
                self.persist(&state);
                Disposition::AutoApprove
            } else {
                let notify = state.preferences.notify_on_request;
                state.pending_requests.push(request.clone());
                self.persist(&state);
                Disposition::Enqueued(notify)
            }
        };

        match disposition {
            Disposition::Enqueued(notify) => {
                if notify {
                    self.publish(&PermissionEvent::RequestReceived(request));
                }
            }
            Disposition::AutoApprove => {
                self.approve_request(&request.id, ApprovalOptions::default());
            }
            Disposition::AutoDeny(denied) => {
                self.publish(&PermissionEvent::RequestDenied(denied));
            }
            Disposition::Dropped => {}
        }
        Ok(())
    }

    /// Approve a pending request, producing its grant (and a mirrored
    /// reverse grant iff `bidirectional`).
    ///
    /// Unknown or non-pending requests are logged and left untouched.
    pub fn approve_request(
        &self,
        request_id: &str,
        options: ApprovalOptions,
    ) -> Option<PermissionGrant> {
        let ApprovalOptions {
            duration_ms,
            max_uses,
            bidirectional,
        } = options;
        let now = now_ms();
        let (request, grant) = {
            let mut state = self
                .state
                .write()
                .unwrap_or_else(std::sync::PoisonError::into_inner);

            let incoming = state
                .pending_requests
                .iter()
                .position(|r| r.id == request_id);
            let mut request = match incoming {
                Some(index) => {
                    if state.pending_requests[index].status != RequestStatus::Pending {
                        tracing::warn!("Cannot approve non-pending request {request_id}");
                        return None;
                    }
                    state.pending_requests.remove(index)
                }
                None => {
                    let Some(index) = state
                        .outgoing_requests
                        .iter()
                        .position(|r| r.id == request_id)
                    else {
                        tracing::warn!("Cannot approve unknown request {request_id}");
                        return None;
                    };
                    if state.outgoing_requests[index].status != RequestStatus::Pending {
                        tracing::warn!("Cannot approve non-pending request {request_id}");
                        return None;
                    }
                    state.outgoing_requests[index].status = RequestStatus::Approved;
                    state.outgoing_requests[index].clone()
                }
            };
            if request.status != RequestStatus::Pending
                && request.status != RequestStatus::Approved
            {
                tracing::warn!("Cannot approve non-pending request {request_id}");
                return None;
            }
            request.status = RequestStatus::Approved;

            // Incoming requests name us as target; the granter is always
            // the side that was asked.
            let granter_id = if incoming.is_some() {
                self.user_id.clone()
            } else {
                request.target_id.clone()
            };
            let duration = duration_ms.or(state.preferences.default_grant_duration_ms);
            let grant = PermissionGrant {
                id: new_id("grant"),
                granter_id,
                grantee_id: request.requester_id.clone(),
                scope: request.scope,
                event_types: request.event_types.clone(),
                canvas_id: request.canvas_id.clone(),
                widget_id: request.widget_id.clone(),
                created_at: now,
                expires_at: duration.map(|d| now + d),
                is_active: true,
                usage_count: 0,
                max_uses,
                bidirectional,
                last_used_at: None,
            };

            let file = |state: &mut PermissionState, grant: PermissionGrant| {
                if grant.granter_id == self.user_id {
                    state.grants_given.push(grant);
                } else {
                    state.grants_received.push(grant);
                }
            };
            file(&mut state, grant.clone());
            if bidirectional {
                let mut mirror = grant.clone();
                mirror.id = new_id("grant");
                std::mem::swap(&mut mirror.granter_id, &mut mirror.grantee_id);
                file(&mut state, mirror);
            }

            self.persist(&state);
            (request, grant)
        };

        self.publish(&PermissionEvent::RequestApproved {
            request,
            grant: grant.clone(),
        });
        Some(grant)
    }

    /// Deny a pending request. Unknown or non-pending requests are
    /// logged and left untouched; returns whether anything changed.
    pub fn deny_request(&self, request_id: &str, message: Option<String>) -> bool {
        let denied = {
            let mut state = self
                .state
                .write()
                .unwrap_or_else(std::sync::PoisonError::into_inner);

            let request = match state
                .pending_requests
                .iter()
                .position(|r| r.id == request_id && r.status == RequestStatus::Pending)
            {
                Some(index) => Some(state.pending_requests.remove(index)),
                None => state
                    .outgoing_requests
                    .iter_mut()
                    .find(|r| r.id == request_id && r.status == RequestStatus::Pending)
                    .map(|r| {
                        r.status = RequestStatus::Denied;
                        r.clone()
                    }),
            };
            let Some(mut request) = request else {
                tracing::warn!("Cannot deny unknown or non-pending request {request_id}");
                return false;
            };
            request.status = RequestStatus::Denied;
            request.message = message;
            self.persist(&state);
            request
        };

        self.publish(&PermissionEvent::RequestDenied(denied));
        true
    }

    /// Deactivate a grant, and its mirror when bidirectional. Unknown
    /// ids are logged no-ops; returns whether anything changed.
    pub fn revoke_grant(&self, grant_id: &str) -> bool {
        let revoked = {
            let mut state = self
                .state
                .write()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            // Reborrow so the two grant lists can be borrowed disjointly.
            let state = &mut *state;

            let found = state
                .grants_given
                .iter_mut()
                .chain(state.grants_received.iter_mut())
                .find(|g| g.id == grant_id)
                .map(|grant| {
                    grant.is_active = false;
                    grant.clone()
                });
            let Some(revoked) = found else {
                tracing::warn!("Cannot revoke unknown grant {grant_id}");
                return false;
            };

            if revoked.bidirectional {
                let mirror = state
                    .grants_given
                    .iter_mut()
                    .chain(state.grants_received.iter_mut())
                    .find(|g| g.id != revoked.id && g.bidirectional && g.is_mirror_of(&revoked));
                if let Some(mirror) = mirror {
                    mirror.is_active = false;
                }
            }

            self.persist(state);
            revoked
        };

        self.publish(&PermissionEvent::GrantRevoked(revoked));
        true
    }

    /// Add `user_id` to the block list, removing any trust and revoking
    /// every active grant that user holds as grantee.
    pub fn block_user(&self, user_id: &str) {
        let mut state = self
            .state
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        // Reborrow so the two grant lists can be borrowed disjointly.
        let state = &mut *state;
        state.trusted_users.retain(|u| u != user_id);
        if !state.blocked_users.iter().any(|u| u == user_id) {
            state.blocked_users.push(user_id.to_string());
        }
        for grant in state
            .grants_given
            .iter_mut()
            .chain(state.grants_received.iter_mut())
        {
            if grant.grantee_id == user_id && grant.is_active {
                grant.is_active = false;
            }
        }
        self.persist(state);
    }

    /// Remove `user_id` from the block list.
    pub fn unblock_user(&self, user_id: &str) {
        let mut state = self
            .state
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        state.blocked_users.retain(|u| u != user_id);
        self.persist(&state);
    }

    /// Add `user_id` to the trust list, removing any block.
    pub fn trust_user(&self, user_id: &str) {
        let mut state = self
            .state
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        state.blocked_users.retain(|u| u != user_id);
        if !state.trusted_users.iter().any(|u| u == user_id) {
            state.trusted_users.push(user_id.to_string());
        }
        self.persist(&state);
    }

    /// Remove `user_id` from the trust list.
    pub fn untrust_user(&self, user_id: &str) {
        let mut state = self
            .state
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        state.trusted_users.retain(|u| u != user_id);
        self.persist(&state);
    }

    /// Add a standing rule.
    ///
    /// # Errors
    ///
    /// [`PermissionError::Validation`] for an empty or duplicate rule id.
    pub fn add_rule(&self, rule: PermissionRule) -> Result<(), PermissionError> {
        if rule.id.trim().is_empty() {
            return Err(PermissionError::Validation(
                "Rule id must not be empty".to_string(),
            ));
        }
        let mut state = self
            .state
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if state.rules.iter().any(|r| r.id == rule.id) {
            return Err(PermissionError::Validation(format!(
                "Rule {} already exists",
                rule.id
            )));
        }
        state.rules.push(rule);
        self.persist(&state);
        Ok(())
    }

    /// Remove a rule. Unknown ids are logged no-ops.
    pub fn remove_rule(&self, rule_id: &str) -> bool {
        let mut state = self
            .state
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let before = state.rules.len();
        state.rules.retain(|r| r.id != rule_id);
        if state.rules.len() == before {
            tracing::warn!("Cannot remove unknown rule {rule_id}");
            return false;
        }
        self.persist(&state);
        true
    }

    /// One maintenance pass: deactivate expired grants, expire pending
    /// requests past their TTL and prune stale outgoing requests.
    /// Returns whether anything changed.
    pub fn sweep(&self) -> bool {
        let now = now_ms();
        let mut state = self
            .state
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        // Reborrow so the two grant lists can be borrowed disjointly.
        let state = &mut *state;
        let mut changed = false;

        for grant in state
            .grants_given
            .iter_mut()
            .chain(state.grants_received.iter_mut())
        {
            if grant.is_active && grant.is_expired(now) {
                grant.is_active = false;
                changed = true;
            }
        }

        // Pending requests reach the terminal status in place; keeping the
        // record means a replayed request id still dedupes after its TTL.
        for request in &mut state.pending_requests {
            if request.status == RequestStatus::Pending && request.is_expired(now) {
                request.status = RequestStatus::Expired;
                changed = true;
            }
        }

        let before = state.outgoing_requests.len();
        state
            .outgoing_requests
            .retain(|r| now.saturating_sub(r.created_at) < OUTGOING_RETENTION_MS);
        for request in &mut state.outgoing_requests {
            if request.status == RequestStatus::Pending && request.is_expired(now) {
                request.status = RequestStatus::Expired;
                changed = true;
            }
        }
        if state.outgoing_requests.len() != before {
            changed = true;
        }

        if changed {
            self.persist(state);
        }
        changed
    }

    /// Run [`PermissionEngine::sweep`] on a fixed interval until the
    /// engine is dropped.
    pub fn spawn_maintenance(self: &Arc<Self>, interval: Duration) -> tokio::task::JoinHandle<()> {
        let weak: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(engine) = weak.upgrade() else {
                    break;
                };
                if engine.sweep() {
                    tracing::debug!("Permission maintenance sweep changed state");
                }
            }
        })
    }

    /// Grants where the local user is the granter.
    #[must_use]
    pub fn grants_given(&self) -> Vec<PermissionGrant> {
        self.state
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .grants_given
            .clone()
    }

    /// Grants where the local user is the grantee.
    #[must_use]
    pub fn grants_received(&self) -> Vec<PermissionGrant> {
        self.state
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .grants_received
            .clone()
    }

    /// Incoming requests awaiting a decision.
    #[must_use]
    pub fn pending_requests(&self) -> Vec<PermissionRequest> {
        self.state
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .pending_requests
            .clone()
    }

    /// Requests the local user has sent.
    #[must_use]
    pub fn outgoing_requests(&self) -> Vec<PermissionRequest> {
        self.state
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .outgoing_requests
            .clone()
    }

    /// Users whose events are always denied.
    #[must_use]
    pub fn blocked_users(&self) -> Vec<String> {
        self.state
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .blocked_users
            .clone()
    }

    /// Users whose events are always allowed.
    #[must_use]
    pub fn trusted_users(&self) -> Vec<String> {
        self.state
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .trusted_users
            .clone()
    }
}
