//! Permission data model: grants, requests, rules, checks and decisions.
//!
//! Everything here serializes `camelCase` to match the event wire shape,
//! and the whole [`PermissionState`] round-trips as one JSON blob per
//! local user.

use mesh_core::event::Scope;
use mesh_core::identity::IdentitySnapshot;
use serde::{Deserialize, Serialize};

/// Scope a permission applies to. `All` matches every event scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PermissionScope {
    /// Every scope.
    All,
    /// Application-wide events.
    Global,
    /// User-level events.
    User,
    /// Canvas-level events.
    Canvas,
    /// Widget-level events.
    Widget,
}

impl PermissionScope {
    /// Whether a grant or rule at this scope covers a check at `requested`.
    #[must_use]
    pub fn covers(self, requested: PermissionScope) -> bool {
        self == PermissionScope::All || self == requested
    }
}

impl From<Scope> for PermissionScope {
    fn from(scope: Scope) -> Self {
        match scope {
            Scope::Global => Self::Global,
            Scope::User => Self::User,
            Scope::Canvas => Self::Canvas,
            Scope::Widget => Self::Widget,
        }
    }
}

/// Which event types a grant covers: everything (`"*"` on the wire) or
/// an explicit list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventTypeFilter {
    /// Any event type.
    Any,
    /// Only the listed event types.
    Only(Vec<String>),
}

impl EventTypeFilter {
    /// Whether `event_type` passes the filter.
    #[must_use]
    pub fn allows(&self, event_type: &str) -> bool {
        match self {
            Self::Any => true,
            Self::Only(types) => types.iter().any(|t| t == event_type),
        }
    }
}

impl Serialize for EventTypeFilter {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Self::Any => serializer.serialize_str("*"),
            Self::Only(types) => types.serialize(serializer),
        }
    }
}

impl<'de> Deserialize<'de> for EventTypeFilter {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Repr {
            One(String),
            Many(Vec<String>),
        }
        Ok(match Repr::deserialize(deserializer)? {
            Repr::One(s) if s == "*" => Self::Any,
            Repr::One(s) => Self::Only(vec![s]),
            Repr::Many(types) => Self::Only(types),
        })
    }
}

/// A consent record authorizing events from `grantee_id` to reach
/// `granter_id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PermissionGrant {
    /// Unique grant identifier.
    pub id: String,
    /// User who gave consent.
    pub granter_id: String,
    /// User the consent was given to.
    pub grantee_id: String,
    /// Scope the grant covers.
    pub scope: PermissionScope,
    /// Event types the grant covers; `None` means unrestricted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_types: Option<EventTypeFilter>,
    /// Restrict to one canvas, if set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub canvas_id: Option<String>,
    /// Restrict to one widget, if set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub widget_id: Option<String>,
    /// Creation time, epoch milliseconds.
    pub created_at: u64,
    /// Expiry time, epoch milliseconds. `None` means no expiry.
    #[serde(default)]
    pub expires_at: Option<u64>,
    /// Whether the grant may still authorize delivery.
    pub is_active: bool,
    /// Number of times the grant has authorized a delivery.
    pub usage_count: u32,
    /// Usage ceiling. `None` means unlimited.
    #[serde(default)]
    pub max_uses: Option<u32>,
    /// Whether a mirrored reverse grant exists.
    pub bidirectional: bool,
    /// Last time the grant authorized a delivery.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_used_at: Option<u64>,
}

impl PermissionGrant {
    /// Whether the grant's expiry has passed at `now`.
    #[must_use]
    pub fn is_expired(&self, now: u64) -> bool {
        self.expires_at.is_some_and(|at| now >= at)
    }

    /// Whether the usage ceiling has been reached.
    #[must_use]
    pub fn is_exhausted(&self) -> bool {
        self.max_uses.is_some_and(|max| self.usage_count >= max)
    }

    /// Whether this grant is the mirror of `other` (swapped parties,
    /// equal scope).
    #[must_use]
    pub fn is_mirror_of(&self, other: &PermissionGrant) -> bool {
        self.granter_id == other.grantee_id
            && self.grantee_id == other.granter_id
            && self.scope == other.scope
    }
}

/// What kind of principal a request targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RequestTargetType {
    /// A user id.
    #[default]
    User,
    /// A device id.
    Device,
}

/// Lifecycle state of a permission request. Transitions are one-way:
/// pending is the only non-terminal status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RequestStatus {
    /// Awaiting a decision.
    Pending,
    /// Approved; exactly one grant was produced.
    Approved,
    /// Denied; no grant was produced.
    Denied,
    /// TTL elapsed before a decision; no grant was produced.
    Expired,
}

/// A pending ask for consent, created by the requester and decided by
/// the target.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PermissionRequest {
    /// Unique request identifier.
    pub id: String,
    /// User asking for consent.
    pub requester_id: String,
    /// Principal being asked.
    pub target_id: String,
    /// Kind of principal being asked.
    #[serde(default)]
    pub target_type: RequestTargetType,
    /// Scope being requested.
    pub scope: PermissionScope,
    /// Event types being requested; `None` means unrestricted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_types: Option<EventTypeFilter>,
    /// Restrict to one canvas, if set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub canvas_id: Option<String>,
    /// Restrict to one widget, if set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub widget_id: Option<String>,
    /// Creation time, epoch milliseconds.
    pub created_at: u64,
    /// Expiry of the *request* itself, epoch milliseconds.
    #[serde(default)]
    pub expires_at: Option<u64>,
    /// Current lifecycle status.
    pub status: RequestStatus,
    /// Free-form note attached on denial.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl PermissionRequest {
    /// Whether the request's TTL has passed at `now`.
    #[must_use]
    pub fn is_expired(&self, now: u64) -> bool {
        self.expires_at.is_some_and(|at| now >= at)
    }
}

/// What a matching rule does.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleAction {
    /// Short-circuit allow.
    Allow,
    /// Short-circuit deny.
    Deny,
    /// Fall through to the grant lookup.
    Prompt,
}

/// Conditions a rule matches against. A rule matches only when *every*
/// populated condition matches; an empty condition set matches anything.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuleConditions {
    /// Requester ids the rule applies to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requester_ids: Option<Vec<String>>,
    /// Scopes the rule applies to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scopes: Option<Vec<PermissionScope>>,
    /// Event types the rule applies to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_types: Option<Vec<String>>,
    /// Canvas ids the rule applies to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub canvas_ids: Option<Vec<String>>,
}

impl RuleConditions {
    /// Whether every populated condition matches the check.
    #[must_use]
    pub fn matches(&self, check: &PermissionCheck) -> bool {
        if let Some(ids) = &self.requester_ids {
            if !ids.iter().any(|id| *id == check.from_user_id) {
                return false;
            }
        }
        if let Some(scopes) = &self.scopes {
            if !scopes.iter().any(|s| s.covers(check.scope)) {
                return false;
            }
        }
        if let Some(types) = &self.event_types {
            match &check.event_type {
                Some(event_type) => {
                    if !types.iter().any(|t| t == event_type) {
                        return false;
                    }
                }
                None => return false,
            }
        }
        if let Some(canvases) = &self.canvas_ids {
            match &check.canvas_id {
                Some(canvas_id) => {
                    if !canvases.iter().any(|c| c == canvas_id) {
                        return false;
                    }
                }
                None => return false,
            }
        }
        true
    }
}

/// A standing policy evaluated before the grant lookup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PermissionRule {
    /// Unique rule identifier.
    pub id: String,
    /// Human-readable description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Evaluation priority; highest matching rule wins.
    pub priority: i32,
    /// Verdict when the rule matches.
    pub action: RuleAction,
    /// Match conditions.
    #[serde(default)]
    pub conditions: RuleConditions,
    /// Disabled rules are skipped.
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Expiry time, epoch milliseconds. Expired rules are skipped.
    #[serde(default)]
    pub expires_at: Option<u64>,
}

impl PermissionRule {
    /// Whether the rule participates in evaluation at `now`.
    #[must_use]
    pub fn is_live(&self, now: u64) -> bool {
        self.enabled && !self.expires_at.is_some_and(|at| now >= at)
    }
}

/// One permission question: may an event of `scope` from `from_user_id`
/// reach `to_user_id`?
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PermissionCheck {
    /// Sending user.
    pub from_user_id: String,
    /// Receiving user.
    pub to_user_id: String,
    /// Scope of the event.
    pub scope: PermissionScope,
    /// Concrete event type, when known.
    pub event_type: Option<String>,
    /// Canvas context, when known.
    pub canvas_id: Option<String>,
    /// Widget context, when known.
    pub widget_id: Option<String>,
    /// Sender's identity snapshot, for the same-device fast path.
    pub origin: Option<IdentitySnapshot>,
}

impl PermissionCheck {
    /// Build a check with only the required fields populated.
    #[must_use]
    pub fn new(
        from_user_id: impl Into<String>,
        to_user_id: impl Into<String>,
        scope: PermissionScope,
    ) -> Self {
        Self {
            from_user_id: from_user_id.into(),
            to_user_id: to_user_id.into(),
            scope,
            event_type: None,
            canvas_id: None,
            widget_id: None,
            origin: None,
        }
    }

    /// Attach a concrete event type.
    #[must_use]
    pub fn with_event_type(mut self, event_type: impl Into<String>) -> Self {
        self.event_type = Some(event_type.into());
        self
    }

    /// Attach a canvas context.
    #[must_use]
    pub fn with_canvas_id(mut self, canvas_id: impl Into<String>) -> Self {
        self.canvas_id = Some(canvas_id.into());
        self
    }

    /// Attach a widget context.
    #[must_use]
    pub fn with_widget_id(mut self, widget_id: impl Into<String>) -> Self {
        self.widget_id = Some(widget_id.into());
        self
    }

    /// Attach the sender's identity snapshot.
    #[must_use]
    pub fn with_origin(mut self, origin: IdentitySnapshot) -> Self {
        self.origin = Some(origin);
        self
    }
}

/// Why a check was allowed or denied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DecisionReason {
    /// Sender and receiver are the same user.
    SelfPermission,
    /// Sender is the local user on the same device.
    SameDevice,
    /// A rule (or the trusted list) allowed it.
    RuleAllow,
    /// A rule (or the blocked list) denied it.
    RuleDeny,
    /// An active grant authorized it.
    GrantExists,
    /// The matching grant was revoked.
    Revoked,
    /// The matching grant has expired.
    Expired,
    /// The matching grant's usage ceiling was reached.
    MaxUsesReached,
    /// Nothing authorized it.
    NoPermission,
}

impl std::fmt::Display for DecisionReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::SelfPermission => "self-permission",
            Self::SameDevice => "same-device",
            Self::RuleAllow => "rule-allow",
            Self::RuleDeny => "rule-deny",
            Self::GrantExists => "grant-exists",
            Self::Revoked => "revoked",
            Self::Expired => "expired",
            Self::MaxUsesReached => "max-uses-reached",
            Self::NoPermission => "no-permission",
        };
        write!(f, "{s}")
    }
}

/// The structured answer to a [`PermissionCheck`]. Denial is a value,
/// never an error.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PermissionDecision {
    /// Whether delivery is authorized.
    pub allowed: bool,
    /// Why.
    pub reason: DecisionReason,
    /// The grant that decided it, if one did.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub grant: Option<PermissionGrant>,
    /// The rule that decided it, if one did.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rule: Option<PermissionRule>,
    /// Human-readable explanation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl PermissionDecision {
    /// An allow with the given reason.
    #[must_use]
    pub fn allow(reason: DecisionReason) -> Self {
        Self {
            allowed: true,
            reason,
            grant: None,
            rule: None,
            message: None,
        }
    }

    /// A deny with the given reason.
    #[must_use]
    pub fn deny(reason: DecisionReason) -> Self {
        Self {
            allowed: false,
            reason,
            grant: None,
            rule: None,
            message: None,
        }
    }

    /// Attach the deciding grant.
    #[must_use]
    pub fn with_grant(mut self, grant: PermissionGrant) -> Self {
        self.grant = Some(grant);
        self
    }

    /// Attach the deciding rule.
    #[must_use]
    pub fn with_rule(mut self, rule: PermissionRule) -> Self {
        self.rule = Some(rule);
        self
    }

    /// Attach an explanation.
    #[must_use]
    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }
}

fn default_true() -> bool {
    true
}

const fn default_request_ttl_ms() -> u64 {
    5 * 60 * 1000
}

/// Per-user preferences merged over defaults at load time, so new
/// fields get sane values without migration code.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PermissionPreferences {
    /// Auto-approve incoming requests from trusted users.
    #[serde(default = "default_true")]
    pub auto_approve_trusted: bool,
    /// Auto-deny incoming requests from blocked users.
    #[serde(default = "default_true")]
    pub auto_deny_blocked: bool,
    /// Surface incoming pending requests as notification events.
    #[serde(default = "default_true")]
    pub notify_on_request: bool,
    /// TTL applied to new requests, milliseconds.
    #[serde(default = "default_request_ttl_ms")]
    pub request_ttl_ms: u64,
    /// Duration applied to grants approved without an explicit one.
    #[serde(default)]
    pub default_grant_duration_ms: Option<u64>,
}

impl Default for PermissionPreferences {
    fn default() -> Self {
        Self {
            auto_approve_trusted: true,
            auto_deny_blocked: true,
            notify_on_request: true,
            request_ttl_ms: default_request_ttl_ms(),
            default_grant_duration_ms: None,
        }
    }
}

/// The full persisted permission state for one local user.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PermissionState {
    /// Standing rules.
    #[serde(default)]
    pub rules: Vec<PermissionRule>,
    /// Grants where the local user is the granter.
    #[serde(default)]
    pub grants_given: Vec<PermissionGrant>,
    /// Grants where the local user is the grantee.
    #[serde(default)]
    pub grants_received: Vec<PermissionGrant>,
    /// Incoming requests awaiting a decision.
    #[serde(default)]
    pub pending_requests: Vec<PermissionRequest>,
    /// Requests the local user has sent.
    #[serde(default)]
    pub outgoing_requests: Vec<PermissionRequest>,
    /// Users whose events are always denied.
    #[serde(default)]
    pub blocked_users: Vec<String>,
    /// Users whose events are always allowed.
    #[serde(default)]
    pub trusted_users: Vec<String>,
    /// Per-user preferences.
    #[serde(default)]
    pub preferences: PermissionPreferences,
}
