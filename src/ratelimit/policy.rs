//! Policy records, limit configuration, and their structural validation.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Result, TurnstileError};

/// Kind of caller a policy applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SubjectType {
    User,
    ApiKey,
    Ip,
    Tenant,
}

impl SubjectType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubjectType::User => "USER",
            SubjectType::ApiKey => "API_KEY",
            SubjectType::Ip => "IP",
            SubjectType::Tenant => "TENANT",
        }
    }
}

impl std::str::FromStr for SubjectType {
    type Err = TurnstileError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "USER" => Ok(SubjectType::User),
            "API_KEY" => Ok(SubjectType::ApiKey),
            "IP" => Ok(SubjectType::Ip),
            "TENANT" => Ok(SubjectType::Tenant),
            other => Err(TurnstileError::validation(format!(
                "invalid subject.type: {}",
                other
            ))),
        }
    }
}

/// Kind of thing being accessed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ResourceType {
    Endpoint,
    Action,
}

impl ResourceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceType::Endpoint => "ENDPOINT",
            ResourceType::Action => "ACTION",
        }
    }
}

impl std::str::FromStr for ResourceType {
    type Err = TurnstileError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "ENDPOINT" => Ok(ResourceType::Endpoint),
            "ACTION" => Ok(ResourceType::Action),
            other => Err(TurnstileError::validation(format!(
                "invalid resource.type: {}",
                other
            ))),
        }
    }
}

/// Whether a policy takes part in selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PolicyStatus {
    Active,
    Inactive,
}

/// What happens when a limit is exceeded. Only denial is supported.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeniedBehavior {
    #[default]
    Deny,
}

/// Which subject and resource types a policy covers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicyScope {
    pub subject_type: SubjectType,
    pub resource_type: ResourceType,
}

/// Resource name pattern and optional subject attribute filter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicyMatch {
    /// Anchored glob; `*` matches any substring, everything else is literal
    pub resource_pattern: String,

    /// Every key must equal the value found in the subject context
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject_filter: Option<BTreeMap<String, serde_json::Value>>,
}

/// Continuous-refill quota counter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenBucketLimit {
    pub capacity: f64,
    pub refill_tokens_per_sec: f64,
    /// Tokens in a freshly created bucket; defaults to `capacity`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub initial_tokens: Option<f64>,
    /// Requests costing more than this are rejected as malformed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_cost: Option<f64>,
    #[serde(default)]
    pub behavior_on_denied: DeniedBehavior,
}

impl TokenBucketLimit {
    pub fn new(capacity: f64, refill_tokens_per_sec: f64) -> Self {
        Self {
            capacity,
            refill_tokens_per_sec,
            initial_tokens: None,
            max_cost: None,
            behavior_on_denied: DeniedBehavior::Deny,
        }
    }

    pub fn initial_tokens(&self) -> f64 {
        self.initial_tokens.unwrap_or(self.capacity)
    }
}

/// Epoch-aligned discrete window counter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FixedWindowLimit {
    pub window_seconds: u64,
    pub limit: f64,
    #[serde(default)]
    pub behavior_on_denied: DeniedBehavior,
}

impl FixedWindowLimit {
    pub fn new(window_seconds: u64, limit: f64) -> Self {
        Self {
            window_seconds,
            limit,
            behavior_on_denied: DeniedBehavior::Deny,
        }
    }
}

/// Largest window whose length in milliseconds fits an `i64`.
pub const MAX_WINDOW_SECONDS: u64 = (i64::MAX / 1000) as u64;

/// One limit algorithm attached to a policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Limit {
    TokenBucket(TokenBucketLimit),
    FixedWindow(FixedWindowLimit),
}

impl Limit {
    pub fn kind(&self) -> LimitKind {
        match self {
            Limit::TokenBucket(_) => LimitKind::TokenBucket,
            Limit::FixedWindow(_) => LimitKind::FixedWindow,
        }
    }

    fn validate(&self) -> Result<()> {
        match self {
            Limit::TokenBucket(tb) => {
                if !(tb.capacity.is_finite() && tb.capacity > 0.0) {
                    return Err(TurnstileError::validation(
                        "TOKEN_BUCKET.capacity must be greater than 0",
                    ));
                }
                if !(tb.refill_tokens_per_sec.is_finite() && tb.refill_tokens_per_sec > 0.0) {
                    return Err(TurnstileError::validation(
                        "TOKEN_BUCKET.refill_tokens_per_sec must be greater than 0",
                    ));
                }
                if let Some(initial) = tb.initial_tokens {
                    if !(0.0..=tb.capacity).contains(&initial) {
                        return Err(TurnstileError::validation(
                            "TOKEN_BUCKET.initial_tokens must be in [0, capacity]",
                        ));
                    }
                }
                if let Some(max_cost) = tb.max_cost {
                    if !(max_cost.is_finite() && max_cost > 0.0) {
                        return Err(TurnstileError::validation(
                            "TOKEN_BUCKET.max_cost must be greater than 0",
                        ));
                    }
                }
            }
            Limit::FixedWindow(fw) => {
                if fw.window_seconds == 0 {
                    return Err(TurnstileError::validation(
                        "FIXED_WINDOW.window_seconds must be greater than 0",
                    ));
                }
                if fw.window_seconds > MAX_WINDOW_SECONDS {
                    return Err(TurnstileError::validation(format!(
                        "FIXED_WINDOW.window_seconds must be at most {}",
                        MAX_WINDOW_SECONDS
                    )));
                }
                if !(fw.limit.is_finite() && fw.limit > 0.0) {
                    return Err(TurnstileError::validation(
                        "FIXED_WINDOW.limit must be greater than 0",
                    ));
                }
            }
        }
        Ok(())
    }
}

/// Discriminant of [`Limit`], also used in state keys and results.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LimitKind {
    TokenBucket,
    FixedWindow,
}

impl LimitKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            LimitKind::TokenBucket => "TOKEN_BUCKET",
            LimitKind::FixedWindow => "FIXED_WINDOW",
        }
    }
}

/// Caller-supplied policy definition, without timestamps.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicyInput {
    pub policy_id: String,
    pub tenant_id: String,
    pub name: String,
    pub status: PolicyStatus,
    pub priority: i64,
    pub scope: PolicyScope,
    #[serde(rename = "match")]
    pub match_rule: PolicyMatch,
    pub limits: Vec<Limit>,
}

/// Partial update applied by `patch_policy`. Identity fields cannot be patched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PolicyPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<PolicyStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<PolicyScope>,
    #[serde(default, rename = "match", skip_serializing_if = "Option::is_none")]
    pub match_rule: Option<PolicyMatch>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limits: Option<Vec<Limit>>,
}

impl PolicyPatch {
    /// Names of the fields this patch sets, for audit payloads.
    pub fn field_names(&self) -> Vec<&'static str> {
        let mut fields = Vec::new();
        if self.name.is_some() {
            fields.push("name");
        }
        if self.status.is_some() {
            fields.push("status");
        }
        if self.priority.is_some() {
            fields.push("priority");
        }
        if self.scope.is_some() {
            fields.push("scope");
        }
        if self.match_rule.is_some() {
            fields.push("match");
        }
        if self.limits.is_some() {
            fields.push("limits");
        }
        fields
    }
}

/// A stored policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Policy {
    pub policy_id: String,
    pub tenant_id: String,
    pub name: String,
    pub status: PolicyStatus,
    pub priority: i64,
    pub scope: PolicyScope,
    #[serde(rename = "match")]
    pub match_rule: PolicyMatch,
    pub limits: Vec<Limit>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Policy {
    /// Build a stored record from input and timestamps.
    pub fn from_input(input: PolicyInput, created_at: DateTime<Utc>, updated_at: DateTime<Utc>) -> Self {
        Self {
            policy_id: input.policy_id,
            tenant_id: input.tenant_id,
            name: input.name,
            status: input.status,
            priority: input.priority,
            scope: input.scope,
            match_rule: input.match_rule,
            limits: input.limits,
            created_at,
            updated_at,
        }
    }

    /// Produce a new record with the patch merged over this one.
    pub fn merged(&self, patch: PolicyPatch, updated_at: DateTime<Utc>) -> Self {
        Self {
            policy_id: self.policy_id.clone(),
            tenant_id: self.tenant_id.clone(),
            name: patch.name.unwrap_or_else(|| self.name.clone()),
            status: patch.status.unwrap_or(self.status),
            priority: patch.priority.unwrap_or(self.priority),
            scope: patch.scope.unwrap_or_else(|| self.scope.clone()),
            match_rule: patch.match_rule.unwrap_or_else(|| self.match_rule.clone()),
            limits: patch.limits.unwrap_or_else(|| self.limits.clone()),
            created_at: self.created_at,
            updated_at,
        }
    }

    pub fn is_active(&self) -> bool {
        self.status == PolicyStatus::Active
    }

    /// Check every structural invariant of a policy.
    pub fn validate(&self) -> Result<()> {
        validate_parts(
            &self.policy_id,
            &self.tenant_id,
            &self.match_rule,
            &self.limits,
        )
    }
}

impl PolicyInput {
    pub fn validate(&self) -> Result<()> {
        validate_parts(
            &self.policy_id,
            &self.tenant_id,
            &self.match_rule,
            &self.limits,
        )
    }
}

fn validate_parts(
    policy_id: &str,
    tenant_id: &str,
    match_rule: &PolicyMatch,
    limits: &[Limit],
) -> Result<()> {
    if policy_id.trim().is_empty() {
        return Err(TurnstileError::validation("policy_id is required"));
    }
    if tenant_id.trim().is_empty() {
        return Err(TurnstileError::validation("tenant_id is required"));
    }
    if match_rule.resource_pattern.trim().is_empty() {
        return Err(TurnstileError::validation(
            "match.resource_pattern is required",
        ));
    }
    if limits.is_empty() {
        return Err(TurnstileError::validation(
            "policy.limits must contain at least one limit",
        ));
    }
    limits.iter().try_for_each(Limit::validate)
}
