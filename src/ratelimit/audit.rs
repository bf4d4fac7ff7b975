//! Audit events.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// What happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuditEventType {
    PolicyUpsert,
    PolicyPatch,
    RequestDenied,
    IdempotencyConflict,
}

/// One entry in the append-only audit log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEvent {
    pub event_id: Uuid,
    #[serde(rename = "type")]
    pub event_type: AuditEventType,
    pub tenant_id: String,
    pub timestamp: DateTime<Utc>,
    pub payload: serde_json::Value,
}

impl AuditEvent {
    pub fn new(
        event_type: AuditEventType,
        tenant_id: impl Into<String>,
        timestamp: DateTime<Utc>,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            event_type,
            tenant_id: tenant_id.into(),
            timestamp,
            payload,
        }
    }
}

/// Append an event, dropping the oldest entries beyond `max_events`.
pub(crate) fn append(log: &mut Vec<AuditEvent>, event: AuditEvent, max_events: usize) {
    log.push(event);
    if log.len() > max_events {
        let excess = log.len() - max_events;
        log.drain(..excess);
    }
}

/// Events for `tenant_id` (or all tenants), most recent first, capped at `limit`.
pub(crate) fn query(
    log: &[AuditEvent],
    tenant_id: Option<&str>,
    limit: Option<usize>,
) -> Vec<AuditEvent> {
    log.iter()
        .rev()
        .filter(|e| tenant_id.map_or(true, |t| e.tenant_id == t))
        .take(limit.unwrap_or(usize::MAX))
        .cloned()
        .collect()
}
