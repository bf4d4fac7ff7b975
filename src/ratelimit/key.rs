//! Composite keys for per-limit state records.

use std::borrow::Cow;

use super::policy::{LimitKind, Policy};
use super::request::ConsumeRequest;

/// A key that uniquely identifies the state of one limit for one caller.
///
/// The key is composed of the owning policy, the subject, the resource, and
/// the limit's kind and position inside the policy, so reordering or editing
/// a policy's limits never aliases two different limits onto one record.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StateKey {
    pub tenant_id: String,
    pub policy_id: String,
    pub subject_type: &'static str,
    pub subject_id: String,
    pub resource_type: &'static str,
    pub resource_name: String,
    pub kind: LimitKind,
    pub limit_index: usize,
}

impl StateKey {
    /// Create a state key for the limit at `limit_index` of `policy`.
    pub fn new(
        policy: &Policy,
        request: &ConsumeRequest,
        kind: LimitKind,
        limit_index: usize,
    ) -> Self {
        Self {
            tenant_id: policy.tenant_id.clone(),
            policy_id: policy.policy_id.clone(),
            subject_type: request.subject.subject_type.as_str(),
            subject_id: request.subject.id.clone(),
            resource_type: request.resource.resource_type.as_str(),
            resource_name: request.resource.name.clone(),
            kind,
            limit_index,
        }
    }

    /// Convert the key to the string form used by the stores.
    ///
    /// Caller-supplied parts are escaped, so two distinct keys never share a
    /// string form.
    pub fn to_string_key(&self) -> String {
        format!(
            "{}:{}:{}:{}:{}:{}:{}:{}",
            escape_part(&self.tenant_id),
            escape_part(&self.policy_id),
            self.subject_type,
            escape_part(&self.subject_id),
            self.resource_type,
            escape_part(&self.resource_name),
            self.kind.as_str(),
            self.limit_index
        )
    }
}

impl std::fmt::Display for StateKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_string_key())
    }
}

/// Key of an idempotency cache entry.
pub fn idempotency_key(tenant_id: &str, request_id: &str) -> String {
    format!("{}:{}", escape_part(tenant_id), escape_part(request_id))
}

/// Percent-escape the separator (and the escape character itself) so a
/// part never contains a bare `:`.
fn escape_part(part: &str) -> Cow<'_, str> {
    if part.contains(['%', ':']) {
        Cow::Owned(part.replace('%', "%25").replace(':', "%3A"))
    } else {
        Cow::Borrowed(part)
    }
}
