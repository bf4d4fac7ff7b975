//! Turnstile - Multi-tenant Quota and Rate Limiting Engine
//!
//! This crate decides whether a tenant's subject may consume some amount of a
//! resource. Tenants register prioritized policies combining token bucket and
//! fixed window limits; requests are evaluated against the best matching
//! policy with all-or-nothing consumption, idempotent replay of decisions, and
//! an append-only audit log. State lives behind a pluggable storage provider.

pub mod config;
pub mod error;
pub mod ratelimit;
pub mod storage;
pub mod sync;

pub use config::TurnstileConfig;
pub use error::{ErrorKind, Result, TurnstileError};
pub use ratelimit::{ConsumeRequest, Decision, RateLimiter};
pub use storage::{FileStorage, MemoryStorage, StorageProvider};
