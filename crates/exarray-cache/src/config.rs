//! Configuration for the block cache

use serde::{Deserialize, Serialize};

/// Configuration for a [`BlockCache`](crate::BlockCache)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Soft bound on resident entries. Clean, unpinned and unlatched
    /// entries beyond it are evicted after insert and unprotect.
    /// Dirty entries stay resident until the next flush.
    pub max_entries: usize,

    /// Call `sync` on the backing store at the end of every flush
    pub sync_on_flush: bool,

    /// Largest payload, in bytes, of a single entry image. Creating a
    /// larger entry fails with out of space; loading one is corruption.
    #[serde(default = "default_max_image_len")]
    pub max_image_len: usize,
}

const fn default_max_image_len() -> usize {
    1 << 30
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_entries: 4096,
            sync_on_flush: true,
            max_image_len: default_max_image_len(),
        }
    }
}

impl CacheConfig {
    /// Create a configuration with default settings
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the resident entry bound
    #[must_use]
    pub const fn with_max_entries(mut self, max_entries: usize) -> Self {
        self.max_entries = max_entries;
        self
    }

    /// Enable or disable store sync after flush
    #[must_use]
    pub const fn with_sync_on_flush(mut self, sync: bool) -> Self {
        self.sync_on_flush = sync;
        self
    }

    /// Set the largest entry payload
    #[must_use]
    pub const fn with_max_image_len(mut self, max_image_len: usize) -> Self {
        self.max_image_len = max_image_len;
        self
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), String> {
        if self.max_entries == 0 {
            return Err("max_entries must be greater than 0".to_string());
        }
        if self.max_image_len == 0 {
            return Err("max_image_len must be greater than 0".to_string());
        }
        Ok(())
    }
}
