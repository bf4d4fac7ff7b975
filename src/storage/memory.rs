//! Volatile storage.

use super::{StorageProvider, Stores};
use crate::error::Result;

/// In-memory provider. Nothing survives a restart.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    stores: Stores,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

impl StorageProvider for MemoryStorage {
    fn stores(&self) -> &Stores {
        &self.stores
    }

    fn persist(&self) -> Result<()> {
        Ok(())
    }

    fn describe(&self) -> String {
        "memory".to_string()
    }
}
