use std::time::Duration;

use crate::firestore::error::{invalid_argument, FirestoreResult};
use crate::util::BackoffConfig;

/// Disables size-based LRU collection.
pub const CACHE_SIZE_UNLIMITED: i64 = -1;
pub const DEFAULT_CACHE_SIZE_BYTES: i64 = 40 * 1024 * 1024;
pub const MINIMUM_CACHE_SIZE_BYTES: i64 = 1024 * 1024;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GarbageCollectorMode {
    /// Sequence-number driven collection once the cache outgrows its budget.
    Lru,
    /// Documents are dropped as soon as nothing references them.
    Eager,
}

#[derive(Clone, Debug, PartialEq)]
pub struct IndexAutoCreationSettings {
    pub enabled: bool,
    /// Collections smaller than this never get an automatic index.
    pub min_collection_size: usize,
    /// Cost of reading a document through an index relative to a full scan
    /// read. The heuristic creates an index when
    /// `documents_scanned > relative_index_read_cost * results`.
    pub relative_index_read_cost: f64,
}

impl Default for IndexAutoCreationSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            min_collection_size: 100,
            relative_index_read_cost: 2.0,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct StreamSettings {
    pub idle_timeout: Duration,
    pub health_check_delay: Duration,
    pub backoff: BackoffConfig,
}

impl Default for StreamSettings {
    fn default() -> Self {
        Self {
            idle_timeout: Duration::from_secs(60),
            health_check_delay: Duration::from_secs(10),
            backoff: BackoffConfig::default(),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct LeaseSettings {
    pub refresh_interval: Duration,
    pub lease_timeout: Duration,
    pub max_client_age: Duration,
}

impl Default for LeaseSettings {
    fn default() -> Self {
        Self {
            refresh_interval: Duration::from_secs(4),
            lease_timeout: Duration::from_secs(5),
            max_client_age: Duration::from_secs(30 * 60),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct LruSettings {
    pub initial_delay: Duration,
    pub regular_interval: Duration,
    pub percentile_to_collect: u32,
    pub maximum_sequence_numbers_to_collect: usize,
}

impl Default for LruSettings {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(60),
            regular_interval: Duration::from_secs(5 * 60),
            percentile_to_collect: 10,
            maximum_sequence_numbers_to_collect: 1_000,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct BackfillSettings {
    pub initial_delay: Duration,
    pub regular_interval: Duration,
    pub max_documents_to_process: usize,
}

impl Default for BackfillSettings {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(15),
            regular_interval: Duration::from_secs(60),
            max_documents_to_process: 50,
        }
    }
}

/// Client configuration. Every knob has the production default.
#[derive(Clone, Debug, PartialEq)]
pub struct FirestoreSettings {
    pub cache_size_bytes: i64,
    pub garbage_collector: GarbageCollectorMode,
    pub synchronize_tabs: bool,
    pub force_ownership: bool,
    pub max_concurrent_limbo_resolutions: usize,
    pub max_pending_writes: usize,
    pub index_auto_creation: IndexAutoCreationSettings,
    pub stream: StreamSettings,
    pub online_state_timeout: Duration,
    pub lease: LeaseSettings,
    pub lru: LruSettings,
    pub backfill: BackfillSettings,
}

impl Default for FirestoreSettings {
    fn default() -> Self {
        Self {
            cache_size_bytes: DEFAULT_CACHE_SIZE_BYTES,
            garbage_collector: GarbageCollectorMode::Lru,
            synchronize_tabs: false,
            force_ownership: false,
            max_concurrent_limbo_resolutions: 100,
            max_pending_writes: 10,
            index_auto_creation: IndexAutoCreationSettings::default(),
            stream: StreamSettings::default(),
            online_state_timeout: Duration::from_secs(10),
            lease: LeaseSettings::default(),
            lru: LruSettings::default(),
            backfill: BackfillSettings::default(),
        }
    }
}

impl FirestoreSettings {
    pub fn validate(&self) -> FirestoreResult<()> {
        if self.cache_size_bytes != CACHE_SIZE_UNLIMITED
            && self.cache_size_bytes < MINIMUM_CACHE_SIZE_BYTES
        {
            return Err(invalid_argument(format!(
                "cache_size_bytes must be at least {MINIMUM_CACHE_SIZE_BYTES}"
            )));
        }
        if self.synchronize_tabs && self.force_ownership {
            return Err(invalid_argument(
                "synchronize_tabs and force_ownership cannot be enabled together",
            ));
        }
        if self.max_concurrent_limbo_resolutions == 0 {
            return Err(invalid_argument(
                "max_concurrent_limbo_resolutions must be positive",
            ));
        }
        if self.max_pending_writes == 0 {
            return Err(invalid_argument("max_pending_writes must be positive"));
        }
        if self.lease.lease_timeout <= self.lease.refresh_interval {
            return Err(invalid_argument(
                "lease timeout must exceed the lease refresh interval",
            ));
        }
        if !(1..=100).contains(&self.lru.percentile_to_collect) {
            return Err(invalid_argument("LRU percentile must be within 1..=100"));
        }
        if self.stream.backoff.backoff_factor < 1.0 {
            return Err(invalid_argument("backoff factor must be >= 1.0"));
        }
        Ok(())
    }

    /// Whether size-triggered LRU collection should be scheduled.
    pub fn lru_enabled(&self) -> bool {
        self.garbage_collector == GarbageCollectorMode::Lru
            && self.cache_size_bytes != CACHE_SIZE_UNLIMITED
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let settings = FirestoreSettings::default();
        settings.validate().unwrap();
        assert!(settings.lru_enabled());
        assert_eq!(settings.max_concurrent_limbo_resolutions, 100);
    }

    #[test]
    fn unlimited_cache_disables_lru() {
        let settings = FirestoreSettings {
            cache_size_bytes: CACHE_SIZE_UNLIMITED,
            ..Default::default()
        };
        settings.validate().unwrap();
        assert!(!settings.lru_enabled());
    }

    #[test]
    fn rejects_tiny_cache() {
        let settings = FirestoreSettings {
            cache_size_bytes: 1024,
            ..Default::default()
        };
        let err = settings.validate().unwrap_err();
        assert_eq!(err.code_str(), "firestore/invalid-argument");
    }
}
