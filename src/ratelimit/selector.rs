//! Policy selection and policy bundle loading.
//!
//! Selection picks the single highest-priority active policy whose scope,
//! resource pattern, and subject filter all match a request. Bundles are YAML
//! files holding policy definitions to apply in bulk.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::info;

use super::policy::{Policy, PolicyInput};
use super::request::{Resource, Subject};
use crate::error::{Result, TurnstileError};

/// A set of policy definitions loaded from a file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PolicyBundle {
    #[serde(default)]
    pub policies: Vec<PolicyInput>,
}

impl PolicyBundle {
    /// Load a bundle from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading policy bundle");

        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Load a bundle from a YAML string.
    ///
    /// Accepts either `policies: [...]` or a bare list of policies.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        if let Ok(policies) = serde_yaml::from_str::<Vec<PolicyInput>>(yaml) {
            return Ok(Self { policies });
        }

        serde_yaml::from_str(yaml)
            .map_err(|e| TurnstileError::Config(format!("Failed to parse policy bundle: {}", e)))
    }
}

/// Order policies by descending priority, then ascending id.
pub fn priority_order(a: &Policy, b: &Policy) -> std::cmp::Ordering {
    b.priority
        .cmp(&a.priority)
        .then_with(|| a.policy_id.cmp(&b.policy_id))
}

/// Find the policy that governs a request, if any.
pub fn select_policy<'a, I>(
    policies: I,
    tenant_id: &str,
    subject: &Subject,
    resource: &Resource,
) -> Option<Arc<Policy>>
where
    I: IntoIterator<Item = &'a Arc<Policy>>,
{
    policies
        .into_iter()
        .filter(|p| p.tenant_id == tenant_id)
        .filter(|p| p.is_active())
        .filter(|p| p.scope.subject_type == subject.subject_type)
        .filter(|p| p.scope.resource_type == resource.resource_type)
        .filter(|p| glob_match(&p.match_rule.resource_pattern, &resource.name))
        .filter(|p| subject_filter_matches(p.match_rule.subject_filter.as_ref(), subject))
        .min_by(|a, b| priority_order(a, b))
        .cloned()
}

/// Anchored glob match where `*` matches any (possibly empty) substring and
/// every other character is literal.
pub fn glob_match(pattern: &str, value: &str) -> bool {
    let pattern: Vec<char> = pattern.chars().collect();
    let value: Vec<char> = value.chars().collect();

    let (mut p, mut v) = (0, 0);
    // position of the last `*` seen and the value index it was tried at
    let mut backtrack: Option<(usize, usize)> = None;

    while v < value.len() {
        if p < pattern.len() && pattern[p] == '*' {
            backtrack = Some((p, v));
            p += 1;
        } else if p < pattern.len() && pattern[p] == value[v] {
            p += 1;
            v += 1;
        } else if let Some((star, matched)) = backtrack {
            p = star + 1;
            v = matched + 1;
            backtrack = Some((star, matched + 1));
        } else {
            return false;
        }
    }

    pattern[p..].iter().all(|c| *c == '*')
}

/// Check a subject filter against the subject's context.
///
/// The context holds `id` and `type` plus every subject attribute, with
/// attributes taking precedence. A missing filter matches everything.
pub fn subject_filter_matches(
    filter: Option<&BTreeMap<String, serde_json::Value>>,
    subject: &Subject,
) -> bool {
    let Some(filter) = filter else {
        return true;
    };

    let mut context: BTreeMap<&str, serde_json::Value> = BTreeMap::new();
    context.insert("id", serde_json::Value::String(subject.id.clone()));
    context.insert(
        "type",
        serde_json::Value::String(subject.subject_type.as_str().to_string()),
    );
    if let Some(attributes) = &subject.attributes {
        for (key, value) in attributes {
            context.insert(key.as_str(), value.clone());
        }
    }

    filter
        .iter()
        .all(|(key, expected)| context.get(key.as_str()) == Some(expected))
}
