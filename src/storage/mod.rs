//! Engine state storage.
//!
//! A provider owns the four keyed stores plus the audit log and decides what
//! `persist` means. The engine mutates the stores in place and calls
//! `persist` after every mutation.

mod file;
mod memory;
mod snapshot;

pub use file::FileStorage;
pub use memory::MemoryStorage;
pub use snapshot::{Snapshot, SCHEMA_VERSION};

use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::RwLock;

use crate::error::Result;
use crate::ratelimit::audit::AuditEvent;
use crate::ratelimit::bucket::BucketState;
use crate::ratelimit::idempotency::IdempotencyEntry;
use crate::ratelimit::policy::Policy;
use crate::ratelimit::window::WindowCounterState;

/// The canonical mutable state of an engine.
///
/// Policies are held behind `Arc` and only ever replaced whole, so a reader
/// always sees either the complete old or the complete new version.
#[derive(Debug, Default)]
pub struct Stores {
    pub policies: RwLock<HashMap<String, Arc<Policy>>>,
    pub buckets: DashMap<String, BucketState>,
    pub windows: DashMap<String, WindowCounterState>,
    pub idempotency: DashMap<String, IdempotencyEntry>,
    pub audit: RwLock<Vec<AuditEvent>>,
}

impl Stores {
    pub fn new() -> Self {
        Self::default()
    }

    /// Remove idempotency entries that expired at or before `now_ms`.
    ///
    /// Returns the number of entries removed.
    pub fn evict_expired_idempotency(&self, now_ms: i64) -> usize {
        let before = self.idempotency.len();
        self.idempotency.retain(|_, entry| entry.is_live(now_ms));
        before.saturating_sub(self.idempotency.len())
    }
}

/// Trait for storage providers.
///
/// This abstracts over volatile and durable backends so the engine's
/// decision semantics do not depend on where state lives.
pub trait StorageProvider: Send + Sync + Debug {
    /// The stores the engine reads and mutates.
    fn stores(&self) -> &Stores;

    /// Make the current state durable. Called after every mutation.
    fn persist(&self) -> Result<()>;

    /// Short human readable description for logs.
    fn describe(&self) -> String;
}
