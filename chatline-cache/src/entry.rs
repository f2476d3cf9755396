//! Stored cache entries.

use serde::{Deserialize, Serialize};

use chatline_core::Timestamp;

use crate::freshness::{Freshness, FreshnessPolicy};
use crate::key::CacheKey;

/// A cached value with its freshness windows.
///
/// Invariant: `created_at <= fresh_until <= stale_until`. Entries read back
/// from persistence are checked with [`CacheEntry::is_well_formed`] before
/// they are admitted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheEntry<T> {
    pub value: T,
    pub created_at: Timestamp,
    pub fresh_until: Timestamp,
    pub stale_until: Timestamp,
    pub key: CacheKey,
}

impl<T> CacheEntry<T> {
    pub fn new(key: CacheKey, value: T, created_at: Timestamp, policy: &FreshnessPolicy) -> Self {
        let (fresh_until, stale_until) = policy.windows(created_at);
        Self {
            value,
            created_at,
            fresh_until,
            stale_until,
            key,
        }
    }

    pub fn freshness(&self, now: Timestamp) -> Freshness {
        Freshness::classify(self.fresh_until, self.stale_until, now)
    }

    pub fn is_expired(&self, now: Timestamp) -> bool {
        self.freshness(now).is_expired()
    }

    pub fn is_well_formed(&self) -> bool {
        self.created_at <= self.fresh_until && self.fresh_until <= self.stale_until
    }
}
