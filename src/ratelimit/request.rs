//! Evaluation requests and the decisions returned for them.

use std::collections::BTreeMap;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

use super::policy::{LimitKind, ResourceType, SubjectType};
use crate::error::{Result, TurnstileError};

/// The caller being limited.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Subject {
    #[serde(rename = "type")]
    pub subject_type: SubjectType,
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attributes: Option<BTreeMap<String, serde_json::Value>>,
}

impl Subject {
    pub fn new(subject_type: SubjectType, id: impl Into<String>) -> Self {
        Self {
            subject_type,
            id: id.into(),
            attributes: None,
        }
    }

    pub fn with_attribute(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.attributes
            .get_or_insert_with(BTreeMap::new)
            .insert(key.into(), value);
        self
    }
}

/// The thing being accessed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Resource {
    #[serde(rename = "type")]
    pub resource_type: ResourceType,
    pub name: String,
}

impl Resource {
    pub fn new(resource_type: ResourceType, name: impl Into<String>) -> Self {
        Self {
            resource_type,
            name: name.into(),
        }
    }
}

/// Input to `consume` and `check`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsumeRequest {
    pub tenant_id: String,
    /// Client-supplied idempotency key
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    pub subject: Subject,
    pub resource: Resource,
    /// Defaults to 1
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cost: Option<f64>,
    #[serde(default)]
    pub dry_run: bool,
    /// RFC 3339 instant overriding the engine clock
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub now: Option<String>,
}

impl ConsumeRequest {
    pub fn new(tenant_id: impl Into<String>, subject: Subject, resource: Resource) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            request_id: None,
            subject,
            resource,
            cost: None,
            dry_run: false,
            now: None,
        }
    }

    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = Some(request_id.into());
        self
    }

    pub fn with_cost(mut self, cost: f64) -> Self {
        self.cost = Some(cost);
        self
    }

    pub fn at(mut self, now: DateTime<Utc>) -> Self {
        self.now = Some(now.to_rfc3339_opts(SecondsFormat::Millis, true));
        self
    }

    pub fn dry_run(mut self) -> Self {
        self.dry_run = true;
        self
    }

    pub fn cost(&self) -> f64 {
        self.cost.unwrap_or(1.0)
    }

    /// Parse the explicit `now`, if any.
    pub fn parse_now(&self) -> Result<Option<DateTime<Utc>>> {
        match &self.now {
            None => Ok(None),
            Some(raw) => DateTime::parse_from_rfc3339(raw)
                .map(|t| Some(t.with_timezone(&Utc)))
                .map_err(|_| TurnstileError::validation("invalid now parameter")),
        }
    }

    /// Check the request shape. Runs before any state is touched.
    pub fn validate(&self) -> Result<()> {
        if self.tenant_id.trim().is_empty() {
            return Err(TurnstileError::validation("tenant_id is required"));
        }
        if self.subject.id.trim().is_empty() {
            return Err(TurnstileError::validation("subject.id is required"));
        }
        if self.resource.name.trim().is_empty() {
            return Err(TurnstileError::validation("resource.name is required"));
        }
        if let Some(request_id) = &self.request_id {
            if request_id.trim().is_empty() {
                return Err(TurnstileError::validation(
                    "request_id must not be blank when provided",
                ));
            }
        }
        let cost = self.cost();
        if !cost.is_finite() || cost <= 0.0 {
            return Err(TurnstileError::validation("cost must be greater than 0"));
        }
        Ok(())
    }
}

/// Outcome of one limit within a decision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LimitResult {
    pub kind: LimitKind,
    pub allowed: bool,
    pub remaining: Option<f64>,
    pub retry_after_ms: Option<u64>,
    pub reset_at: Option<DateTime<Utc>>,
}

/// Composite allow/deny answer for a request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Decision {
    pub allowed: bool,
    pub policy_id: Option<String>,
    pub results: Vec<LimitResult>,
    pub retry_after_ms: Option<u64>,
    pub remaining: Option<f64>,
    pub reset_at: Option<DateTime<Utc>>,
}

impl Decision {
    /// Decision for a request no policy matched.
    pub fn unlimited() -> Self {
        Self {
            allowed: true,
            policy_id: None,
            results: Vec::new(),
            retry_after_ms: None,
            remaining: None,
            reset_at: None,
        }
    }

    /// Combine per-limit results into one decision.
    ///
    /// `allowed` is the AND of all results; `retry_after_ms` is the minimum over
    /// denied limits; `remaining` is the minimum over all limits and only
    /// reported when allowed; `reset_at` is the earliest reset present.
    pub fn aggregate(policy_id: &str, results: Vec<LimitResult>) -> Self {
        let allowed = results.iter().all(|r| r.allowed);

        let retry_after_ms = if allowed {
            None
        } else {
            results
                .iter()
                .filter(|r| !r.allowed)
                .filter_map(|r| r.retry_after_ms)
                .min()
        };

        let remaining = if allowed {
            results
                .iter()
                .filter_map(|r| r.remaining)
                .filter(|v| v.is_finite())
                .reduce(f64::min)
        } else {
            None
        };

        let reset_at = results.iter().filter_map(|r| r.reset_at).min();

        Self {
            allowed,
            policy_id: Some(policy_id.to_string()),
            results,
            retry_after_ms,
            remaining,
            reset_at,
        }
    }
}

/// Round a reported quantity to six decimal places.
pub(crate) fn round6(value: f64) -> f64 {
    (value * 1_000_000.0).round() / 1_000_000.0
}
