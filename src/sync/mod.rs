//! Per-key mutual exclusion.
//!
//! All state-touching work for one tenant runs inside an exclusive section
//! obtained from a [`KeyedMutex`], which is what makes a multi-limit decision
//! atomic. Sections for different keys never wait on each other.

mod keyed_mutex;

pub use keyed_mutex::{KeyedMutex, KeyedMutexGuard};
