//! Short-TTL memoization of evaluation results, keyed by a quantized input
//! fingerprint. Damps sensor noise so near-identical temperature readings
//! don't each dispatch a fresh `AUTO_EVALUATE`. See spec §4.5.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};

use crate::config::SystemMode;
use crate::evaluation::EvaluationResult;

/// `(floor(indoor*10), floor(outdoor*10), hour, isWeekday, systemMode, lastDefrostBucketSeconds)`
pub type Fingerprint = (i64, i64, u8, bool, SystemMode, i64);

struct Entry {
    result: EvaluationResult,
    inserted_at: Instant,
}

/// Bounded TTL map with lazy eviction. `ttl` of zero disables caching entirely.
pub struct EvaluationCache {
    ttl: Duration,
    entries: HashMap<Fingerprint, Entry>,
}

impl EvaluationCache {
    pub fn new(ttl_ms: u64) -> Self {
        Self {
            ttl: Duration::from_millis(ttl_ms),
            entries: HashMap::new(),
        }
    }

    /// Build the fingerprint for a set of evaluation inputs. `last_defrost` is
    /// bucketed to whole seconds so near-simultaneous defrost timestamps
    /// collapse to the same bucket.
    pub fn fingerprint(
        indoor: f64,
        outdoor: f64,
        hour: u8,
        is_weekday: bool,
        mode: SystemMode,
        last_defrost: Option<DateTime<Utc>>,
    ) -> Fingerprint {
        (
            (indoor * 10.0).floor() as i64,
            (outdoor * 10.0).floor() as i64,
            hour,
            is_weekday,
            mode,
            last_defrost.map(|d| d.timestamp()).unwrap_or(0),
        )
    }

    /// Returns a cached, unexpired result for `key`, evicting it if expired.
    pub fn get(&mut self, key: &Fingerprint) -> Option<EvaluationResult> {
        if self.ttl.is_zero() {
            return None;
        }
        match self.entries.get(key) {
            Some(entry) if entry.inserted_at.elapsed() < self.ttl => Some(entry.result),
            Some(_) => {
                self.entries.remove(key);
                None
            }
            None => None,
        }
    }

    pub fn insert(&mut self, key: Fingerprint, result: EvaluationResult) {
        if self.ttl.is_zero() {
            return;
        }
        self.entries.insert(
            key,
            Entry {
                result,
                inserted_at: Instant::now(),
            },
        );
    }

    /// Evict every expired entry. Not required for correctness (lookups
    /// evict lazily) but keeps long-idle maps from retaining stale entries
    /// indefinitely.
    pub fn evict_expired(&mut self) {
        let ttl = self.ttl;
        self.entries.retain(|_, entry| entry.inserted_at.elapsed() < ttl);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
