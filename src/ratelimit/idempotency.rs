//! Idempotency fingerprints and cache entries.

use serde::{Deserialize, Serialize};

use super::request::{Decision, Resource, Subject};
use crate::error::Result;

/// A cached decision for one `(tenant, request_id)` pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IdempotencyEntry {
    /// Fingerprint of the request that produced `decision`; never rewritten
    pub payload_fingerprint: String,
    pub decision: Decision,
    pub expires_at_ms: i64,
}

impl IdempotencyEntry {
    pub fn is_live(&self, now_ms: i64) -> bool {
        self.expires_at_ms > now_ms
    }
}

#[derive(Serialize)]
struct FingerprintPayload<'a> {
    tenant_id: &'a str,
    subject: &'a Subject,
    resource: &'a Resource,
    cost: f64,
    dry_run: bool,
}

/// Compute a structurally stable fingerprint of a request's semantics.
///
/// The payload goes through `serde_json::Value`, whose maps are sorted, so
/// the fingerprint does not depend on field or attribute order.
pub fn fingerprint(
    tenant_id: &str,
    subject: &Subject,
    resource: &Resource,
    cost: f64,
    dry_run: bool,
) -> Result<String> {
    let value = serde_json::to_value(FingerprintPayload {
        tenant_id,
        subject,
        resource,
        cost,
        dry_run,
    })?;
    Ok(serde_json::to_string(&value)?)
}
