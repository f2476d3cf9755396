//! Freshness classification for cache entries.
//!
//! An entry moves through three windows as time passes:
//!
//! ```text
//! created_at        fresh_until          stale_until
//!     |---- fresh -----|------ stale --------|---- expired ---->
//! ```
//!
//! The boundaries are inclusive of the later state: at exactly
//! `fresh_until` an entry is stale, at exactly `stale_until` it is expired.

use std::time::Duration;

use chatline_core::{timestamp_after, Timestamp};

/// Classification of a cache entry at a point in time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Freshness {
    /// Authoritative; serve without network activity.
    Fresh,
    /// Servable, but a background revalidation should run.
    Stale,
    /// Unusable; the caller must wait for a fetch.
    Expired,
}

impl Freshness {
    /// Classify a point in time against an entry's windows.
    pub fn classify(fresh_until: Timestamp, stale_until: Timestamp, now: Timestamp) -> Self {
        if now < fresh_until {
            Self::Fresh
        } else if now < stale_until {
            Self::Stale
        } else {
            Self::Expired
        }
    }

    pub fn is_fresh(&self) -> bool {
        matches!(self, Self::Fresh)
    }

    pub fn is_stale(&self) -> bool {
        matches!(self, Self::Stale)
    }

    pub fn is_expired(&self) -> bool {
        matches!(self, Self::Expired)
    }

    /// Whether a value in this state may be returned to a caller.
    pub fn is_servable(&self) -> bool {
        !self.is_expired()
    }
}

/// Windows applied to newly stored entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FreshnessPolicy {
    max_age: Duration,
    stale_window: Duration,
}

impl FreshnessPolicy {
    pub fn new(max_age: Duration, stale_window: Duration) -> Self {
        Self {
            max_age,
            stale_window,
        }
    }

    pub fn max_age(&self) -> Duration {
        self.max_age
    }

    pub fn stale_window(&self) -> Duration {
        self.stale_window
    }

    /// Compute `(fresh_until, stale_until)` for an entry created at `created_at`.
    pub fn windows(&self, created_at: Timestamp) -> (Timestamp, Timestamp) {
        let fresh_until = timestamp_after(created_at, self.max_age);
        let stale_until = timestamp_after(fresh_until, self.stale_window);
        (fresh_until, stale_until)
    }
}

/// Result of a cache read, carrying freshness metadata.
///
/// A value that came back from a blocking fetch is reported as a miss and
/// is always `Fresh`.
#[derive(Debug, Clone)]
pub struct CacheRead<T> {
    value: T,
    cached_at: Timestamp,
    freshness: Freshness,
    was_cache_hit: bool,
}

impl<T> CacheRead<T> {
    /// A read served from an existing entry.
    pub fn from_cache(value: T, cached_at: Timestamp, freshness: Freshness) -> Self {
        Self {
            value,
            cached_at,
            freshness,
            was_cache_hit: true,
        }
    }

    /// A read that had to wait for the remote call.
    pub fn from_fetch(value: T, fetched_at: Timestamp) -> Self {
        Self {
            value,
            cached_at: fetched_at,
            freshness: Freshness::Fresh,
            was_cache_hit: false,
        }
    }

    pub fn into_value(self) -> T {
        self.value
    }

    pub fn value(&self) -> &T {
        &self.value
    }

    pub fn cached_at(&self) -> Timestamp {
        self.cached_at
    }

    pub fn freshness(&self) -> Freshness {
        self.freshness
    }

    pub fn was_cache_hit(&self) -> bool {
        self.was_cache_hit
    }

    pub fn was_cache_miss(&self) -> bool {
        !self.was_cache_hit
    }

    /// Map the inner value to a new type.
    pub fn map<U, F>(self, f: F) -> CacheRead<U>
    where
        F: FnOnce(T) -> U,
    {
        CacheRead {
            value: f(self.value),
            cached_at: self.cached_at,
            freshness: self.freshness,
            was_cache_hit: self.was_cache_hit,
        }
    }
}

impl<T> AsRef<T> for CacheRead<T> {
    fn as_ref(&self) -> &T {
        &self.value
    }
}
