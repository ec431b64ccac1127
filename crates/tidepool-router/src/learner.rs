//! Pattern learner: a bounded LRU of fingerprint → classification.
//!
//! The cache only saves classification work. A miss always falls back to
//! full classification, and a hit returns exactly what a miss would.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, PoisonError};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use tracing::debug;

use tidepool_core::{ParamShape, QueryCategory, WarmupHint};

use crate::classifier::{Classification, classify};
use crate::fingerprint::Fingerprinter;

/// Exported statistics for one fingerprint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FingerprintStats {
    pub fingerprint: String,
    pub classification: Classification,
    pub hit_count: u64,
    /// Unix epoch milliseconds.
    pub last_seen_ms: u64,
}

/// Outcome of classifying one statement through the learner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Learned {
    pub fingerprint: String,
    pub classification: Classification,
    pub cache_hit: bool,
}

struct Entry {
    classification: Classification,
    hit_count: u64,
    last_seen_ms: u64,
    /// Logical clock value of the last access, for LRU eviction.
    last_access: u64,
}

struct LearnerState {
    entries: HashMap<String, Entry>,
    clock: u64,
    evictions: u64,
}

/// Bounded fingerprint cache.
///
/// Internally synchronized; lookups take a short `std::sync::Mutex`.
pub struct PatternLearner {
    fingerprinter: Fingerprinter,
    capacity: usize,
    state: Mutex<LearnerState>,
}

impl PatternLearner {
    pub fn new(capacity: usize) -> Result<Self, regex::Error> {
        Ok(Self {
            fingerprinter: Fingerprinter::new()?,
            capacity: capacity.max(1),
            state: Mutex::new(LearnerState {
                entries: HashMap::new(),
                clock: 0,
                evictions: 0,
            }),
        })
    }

    pub fn fingerprint(&self, sql: &str) -> String {
        self.fingerprinter.fingerprint(sql)
    }

    /// Classify through the cache.
    pub fn classify(&self, sql: &str, params: &serde_json::Value) -> Learned {
        let fingerprint = self.fingerprinter.fingerprint(sql);
        // A batch changes the category, so it is part of the key.
        let key = cache_key(&fingerprint, ParamShape::of(params));
        let now_ms = epoch_millis();

        let mut state = self.lock();
        state.clock += 1;
        let clock = state.clock;

        if let Some(entry) = state.entries.get_mut(&key) {
            entry.hit_count += 1;
            entry.last_seen_ms = now_ms;
            entry.last_access = clock;
            return Learned {
                fingerprint,
                classification: entry.classification,
                cache_hit: true,
            };
        }

        let classification = classify(sql, params);
        if state.entries.len() >= self.capacity {
            evict_lru(&mut state);
        }
        state.entries.insert(
            key,
            Entry {
                classification,
                hit_count: 1,
                last_seen_ms: now_ms,
                last_access: clock,
            },
        );
        Learned {
            fingerprint,
            classification,
            cache_hit: false,
        }
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn evictions(&self) -> u64 {
        self.lock().evictions
    }

    /// Snapshot every cached fingerprint, most used first.
    pub fn export(&self) -> Vec<FingerprintStats> {
        let state = self.lock();
        let mut stats: Vec<FingerprintStats> = state
            .entries
            .iter()
            .map(|(key, e)| FingerprintStats {
                fingerprint: key.clone(),
                classification: e.classification,
                hit_count: e.hit_count,
                last_seen_ms: e.last_seen_ms,
            })
            .collect();
        stats.sort_by(|a, b| {
            b.hit_count
                .cmp(&a.hit_count)
                .then_with(|| a.fingerprint.cmp(&b.fingerprint))
        });
        stats
    }

    /// Seed the cache from a previous [`export`](Self::export).
    ///
    /// Entries beyond capacity are dropped, keeping the most used.
    /// Returns how many were loaded.
    pub fn import(&self, stats: Vec<FingerprintStats>) -> usize {
        let mut stats = stats;
        stats.sort_by(|a, b| b.hit_count.cmp(&a.hit_count));

        let mut state = self.lock();
        let mut loaded = 0;
        // Oldest clock values go to the least used entries.
        for s in stats.into_iter().take(self.capacity).rev() {
            if state.entries.len() >= self.capacity && !state.entries.contains_key(&s.fingerprint) {
                evict_lru(&mut state);
            }
            state.clock += 1;
            let clock = state.clock;
            state.entries.insert(
                s.fingerprint,
                Entry {
                    classification: s.classification,
                    hit_count: s.hit_count,
                    last_seen_ms: s.last_seen_ms,
                    last_access: clock,
                },
            );
            loaded += 1;
        }
        debug!(loaded, "imported query fingerprints");
        loaded
    }

    /// The `n` categories with the most cache traffic, for pre-warming.
    ///
    /// Transaction statements are excluded; they never need a connection
    /// of their own.
    pub fn top_categories(&self, n: usize) -> Vec<WarmupHint> {
        let state = self.lock();
        let mut totals: BTreeMap<QueryCategory, u64> = BTreeMap::new();
        for e in state.entries.values() {
            if e.classification.category != QueryCategory::TransactionStatement {
                *totals.entry(e.classification.category).or_default() += e.hit_count;
            }
        }
        let mut hints: Vec<WarmupHint> = totals
            .into_iter()
            .map(|(category, hit_count)| WarmupHint { category, hit_count })
            .collect();
        hints.sort_by(|a, b| b.hit_count.cmp(&a.hit_count).then(a.category.cmp(&b.category)));
        hints.truncate(n);
        hints
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, LearnerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl std::fmt::Debug for PatternLearner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PatternLearner")
            .field("capacity", &self.capacity)
            .field("len", &self.len())
            .finish_non_exhaustive()
    }
}

fn cache_key(fingerprint: &str, shape: ParamShape) -> String {
    match shape {
        ParamShape::Batch(n) if n > 1 => format!("{fingerprint} /* batch */"),
        _ => fingerprint.to_string(),
    }
}

/// Evict the least recently used entry.
fn evict_lru(state: &mut LearnerState) {
    let oldest = state
        .entries
        .iter()
        .min_by_key(|(_, e)| e.last_access)
        .map(|(k, _)| k.clone());
    if let Some(key) = oldest {
        state.entries.remove(&key);
        state.evictions += 1;
        debug!(fingerprint = %key, evictions = state.evictions, "evicted fingerprint");
    }
}

fn epoch_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
