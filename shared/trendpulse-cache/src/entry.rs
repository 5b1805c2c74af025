//! Cached value envelope

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// A value together with when it was captured and how long it is valid
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheEntry<T> {
    pub value: T,
    pub cached_at: DateTime<Utc>,
    pub ttl_secs: u64,
}

impl<T> CacheEntry<T> {
    pub fn new(value: T, ttl: Duration) -> Self {
        Self {
            value,
            cached_at: Utc::now(),
            ttl_secs: ttl.as_secs(),
        }
    }

    /// `None` when the TTL runs past the representable calendar
    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        let ttl = i64::try_from(self.ttl_secs).ok()?;
        self.cached_at
            .checked_add_signed(ChronoDuration::try_seconds(ttl)?)
    }

    /// Still within its declared TTL at `now`
    pub fn is_fresh_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at().map_or(true, |at| now < at)
    }

    pub fn is_fresh(&self) -> bool {
        self.is_fresh_at(Utc::now())
    }

    pub fn into_value(self) -> T {
        self.value
    }
}
