//! Versioned on-disk representation of the whole engine state.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::Stores;
use crate::ratelimit::audit::AuditEvent;
use crate::ratelimit::bucket::BucketState;
use crate::ratelimit::idempotency::IdempotencyEntry;
use crate::ratelimit::policy::Policy;
use crate::ratelimit::window::WindowCounterState;

/// Snapshots with any other version are discarded, not migrated.
pub const SCHEMA_VERSION: &str = "v1";

/// All four stores as ordered key/value pair lists, plus the audit log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub schema_version: String,
    pub policies: Vec<(String, Policy)>,
    pub bucket_states: Vec<(String, BucketState)>,
    pub window_states: Vec<(String, WindowCounterState)>,
    pub idempotency_store: Vec<(String, IdempotencyEntry)>,
    #[serde(default)]
    pub audit_events: Vec<AuditEvent>,
}

fn sorted_pairs<V: Clone>(map: &dashmap::DashMap<String, V>) -> Vec<(String, V)> {
    let mut pairs: Vec<(String, V)> = map
        .iter()
        .map(|entry| (entry.key().clone(), entry.value().clone()))
        .collect();
    pairs.sort_by(|a, b| a.0.cmp(&b.0));
    pairs
}

impl Snapshot {
    /// Copy the current contents of `stores`.
    pub fn capture(stores: &Stores) -> Self {
        let mut policies: Vec<(String, Policy)> = stores
            .policies
            .read()
            .iter()
            .map(|(id, policy)| (id.clone(), (**policy).clone()))
            .collect();
        policies.sort_by(|a, b| a.0.cmp(&b.0));

        Self {
            schema_version: SCHEMA_VERSION.to_string(),
            policies,
            bucket_states: sorted_pairs(&stores.buckets),
            window_states: sorted_pairs(&stores.windows),
            idempotency_store: sorted_pairs(&stores.idempotency),
            audit_events: stores.audit.read().clone(),
        }
    }

    pub fn is_current_version(&self) -> bool {
        self.schema_version == SCHEMA_VERSION
    }

    /// Build live stores from this snapshot.
    pub fn into_stores(self) -> Stores {
        let policies: HashMap<String, Arc<Policy>> = self
            .policies
            .into_iter()
            .map(|(id, policy)| (id, Arc::new(policy)))
            .collect();

        let stores = Stores::new();
        *stores.policies.write() = policies;
        for (key, state) in self.bucket_states {
            stores.buckets.insert(key, state);
        }
        for (key, state) in self.window_states {
            stores.windows.insert(key, state);
        }
        for (key, entry) in self.idempotency_store {
            stores.idempotency.insert(key, entry);
        }
        *stores.audit.write() = self.audit_events;
        stores
    }
}
