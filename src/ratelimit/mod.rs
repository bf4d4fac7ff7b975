//! Rate limiting logic and state management.

pub mod audit;
pub mod bucket;
pub mod clock;
pub mod idempotency;
pub mod key;
mod limiter;
pub mod policy;
pub mod request;
pub mod selector;
pub mod window;

pub use audit::{AuditEvent, AuditEventType};
pub use clock::{Clock, FixedClock, SystemClock};
pub use limiter::RateLimiter;
pub use policy::{
    FixedWindowLimit, Limit, LimitKind, Policy, PolicyInput, PolicyMatch, PolicyPatch,
    PolicyScope, PolicyStatus, ResourceType, SubjectType, TokenBucketLimit,
};
pub use request::{ConsumeRequest, Decision, LimitResult, Resource, Subject};
pub use selector::PolicyBundle;

use bucket::BucketState;
use window::WindowCounterState;

use crate::storage::Stores;

/// A state write produced by a limit evaluation and applied only when the
/// composite decision allows the request and it is not a dry run.
#[derive(Debug, Clone, PartialEq)]
pub enum StateCommit {
    Bucket { key: String, state: BucketState },
    Window { key: String, state: WindowCounterState },
}

impl StateCommit {
    /// Write this state into the stores.
    pub fn apply(self, stores: &Stores) {
        match self {
            StateCommit::Bucket { key, state } => {
                stores.buckets.insert(key, state);
            }
            StateCommit::Window { key, state } => {
                stores.windows.insert(key, state);
            }
        }
    }
}
