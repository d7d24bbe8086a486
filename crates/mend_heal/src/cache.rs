//! Cache of fixes that worked before.
//!
//! Keyed by normalized error hash. Entries expire after a TTL, are evicted
//! least-recently-used per shard at capacity, and are dropped once their
//! success rate (an exponential moving average of reported outcomes) decays
//! below the threshold after enough uses.

use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, info};

use mend_core::{CacheConfig, ShardedMap};

use crate::plan::FixPlan;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CachedFix {
    pub key: String,
    pub plan: FixPlan,
    pub created_at: DateTime<Utc>,
    /// Number of lookups that returned this entry
    pub hit_count: u64,
    /// Number of reported outcomes
    pub uses: u32,
    pub success_rate: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheStats {
    pub entries: usize,
    pub capacity: usize,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub expirations: u64,
    pub decayed: u64,
}

struct Entry {
    fix: CachedFix,
    inserted: Instant,
    last_used: u64,
}

pub struct FixCache {
    config: CacheConfig,
    entries: ShardedMap<String, Entry>,
    per_shard: usize,
    clock: AtomicU64,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    expirations: AtomicU64,
    decayed: AtomicU64,
}

impl Default for FixCache {
    fn default() -> Self {
        Self::new(CacheConfig::default())
    }
}

impl FixCache {
    pub fn new(config: CacheConfig) -> Self {
        let entries = ShardedMap::new(config.shards);
        let per_shard = config.capacity.div_ceil(entries.shard_count()).max(1);
        Self {
            config,
            entries,
            per_shard,
            clock: AtomicU64::new(0),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
            expirations: AtomicU64::new(0),
            decayed: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Cache key for an error hash, optionally scoped to a file.
    pub fn key(&self, error_hash: &str, file: Option<&str>) -> String {
        match file {
            Some(file) if self.config.key_includes_file => format!("{}@{}", error_hash, file),
            _ => error_hash.to_string(),
        }
    }

    fn tick(&self) -> u64 {
        self.clock.fetch_add(1, Ordering::Relaxed) + 1
    }

    fn is_decayed(&self, fix: &CachedFix) -> bool {
        fix.uses >= self.config.min_uses && fix.success_rate < self.config.eviction_threshold
    }

    pub fn get(&self, key: &str) -> Option<CachedFix> {
        let key = key.to_string();
        let ttl = self.config.ttl();
        let tick = self.tick();

        let found = self.entries.with_shard(&key, |shard| {
            let entry = shard.get_mut(&key)?;
            if entry.inserted.elapsed() >= ttl {
                shard.remove(&key);
                self.expirations.fetch_add(1, Ordering::Relaxed);
                debug!(key = %key, "Cached fix expired");
                return None;
            }
            if self.is_decayed(&entry.fix) {
                shard.remove(&key);
                self.decayed.fetch_add(1, Ordering::Relaxed);
                return None;
            }
            entry.last_used = tick;
            entry.fix.hit_count += 1;
            Some(entry.fix.clone())
        });

        match &found {
            Some(_) => self.hits.fetch_add(1, Ordering::Relaxed),
            None => self.misses.fetch_add(1, Ordering::Relaxed),
        };
        found
    }

    /// Store a fix. New entries start with a perfect success rate.
    pub fn set(&self, key: &str, plan: FixPlan) {
        let key = key.to_string();
        let tick = self.tick();
        let per_shard = self.per_shard;

        self.entries.with_shard(&key, |shard| {
            if !shard.contains_key(&key) && shard.len() >= per_shard {
                let oldest = shard
                    .iter()
                    .min_by_key(|(_, e)| e.last_used)
                    .map(|(k, _)| k.clone());
                if let Some(oldest) = oldest {
                    shard.remove(&oldest);
                    self.evictions.fetch_add(1, Ordering::Relaxed);
                    debug!(key = %oldest, "Evicted least recently used fix");
                }
            }
            shard.insert(
                key.clone(),
                Entry {
                    fix: CachedFix {
                        key: key.clone(),
                        plan,
                        created_at: Utc::now(),
                        hit_count: 0,
                        uses: 0,
                        success_rate: 1.0,
                    },
                    inserted: Instant::now(),
                    last_used: tick,
                },
            );
        });
    }

    /// Fold an outcome into the entry's success rate.
    ///
    /// Returns the new rate, or `None` if the entry is absent or was dropped
    /// because it decayed.
    pub fn report_outcome(&self, key: &str, success: bool) -> Option<f64> {
        let key = key.to_string();
        let alpha = self.config.alpha;
        let outcome = if success { 1.0 } else { 0.0 };

        self.entries.with_shard(&key, |shard| {
            let entry = shard.get_mut(&key)?;
            entry.fix.uses += 1;
            entry.fix.success_rate = alpha * outcome + (1.0 - alpha) * entry.fix.success_rate;
            let rate = entry.fix.success_rate;
            if self.is_decayed(&entry.fix) {
                shard.remove(&key);
                self.decayed.fetch_add(1, Ordering::Relaxed);
                info!(key = %key, rate, "Dropped cached fix with decayed success rate");
                return None;
            }
            Some(rate)
        })
    }

    pub fn remove(&self, key: &str) -> bool {
        self.entries.remove(&key.to_string()).is_some()
    }

    pub fn clear(&self) {
        self.entries.clear();
        info!("Fix cache cleared");
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            entries: self.len(),
            capacity: self.config.capacity,
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            expirations: self.expirations.load(Ordering::Relaxed),
            decayed: self.decayed.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::plan::{FileChangeRequest, FixSource};

    fn plan(name: &str) -> FixPlan {
        FixPlan::new(name, FixSource::Proposer).with_change(FileChangeRequest::replace("a.ts", name))
    }

    fn single_shard(capacity: usize) -> FixCache {
        FixCache::new(CacheConfig {
            capacity,
            shards: 1,
            ..CacheConfig::default()
        })
    }

    #[test]
    fn test_set_get_counts_hits() {
        let cache = FixCache::default();
        assert!(cache.get("h1").is_none());
        cache.set("h1", plan("one"));

        let fix = cache.get("h1").unwrap();
        assert_eq!(fix.plan.description, "one");
        assert_eq!(fix.hit_count, 1);
        assert_eq!(fix.success_rate, 1.0);

        let stats = cache.stats();
        assert_eq!((stats.hits, stats.misses, stats.entries), (1, 1, 1));
    }

    #[test]
    fn test_decay_after_min_uses() {
        let cache = FixCache::default();
        cache.set("h1", plan("flaky"));

        let rates: Vec<Option<f64>> = (0..4).map(|_| cache.report_outcome("h1", false)).collect();
        assert!((rates[0].unwrap() - 0.7).abs() < 1e-9);
        assert!((rates[1].unwrap() - 0.49).abs() < 1e-9);
        assert!((rates[2].unwrap() - 0.343).abs() < 1e-9);
        // 0.2401 < 0.3 after four uses
        assert_eq!(rates[3], None);
        assert!(cache.get("h1").is_none());
        assert_eq!(cache.stats().decayed, 1);
    }

    #[test]
    fn test_success_keeps_rate_high() {
        let cache = FixCache::default();
        cache.set("h1", plan("solid"));
        cache.report_outcome("h1", false);
        let rate = cache.report_outcome("h1", true).unwrap();
        assert!((rate - 0.79).abs() < 1e-9);
    }

    #[test]
    fn test_lru_eviction() {
        let cache = single_shard(2);
        cache.set("a", plan("a"));
        cache.set("b", plan("b"));
        // touch a so b is least recently used
        cache.get("a");
        cache.set("c", plan("c"));

        assert!(cache.get("a").is_some());
        assert!(cache.get("b").is_none());
        assert!(cache.get("c").is_some());
        assert_eq!(cache.stats().evictions, 1);
    }

    #[test]
    fn test_overwrite_does_not_evict() {
        let cache = single_shard(1);
        cache.set("a", plan("a1"));
        cache.set("a", plan("a2"));
        assert_eq!(cache.get("a").unwrap().plan.description, "a2");
        assert_eq!(cache.stats().evictions, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ttl_expiry() {
        let cache = FixCache::new(CacheConfig {
            ttl_secs: 60,
            ..CacheConfig::default()
        });
        cache.set("h1", plan("one"));

        tokio::time::advance(Duration::from_secs(59)).await;
        assert!(cache.get("h1").is_some());
        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(cache.get("h1").is_none());
        assert_eq!(cache.stats().expirations, 1);
    }

    #[test]
    fn test_key_with_file() {
        let plain = FixCache::default();
        assert_eq!(plain.key("abc", Some("src/a.ts")), "abc");

        let scoped = FixCache::new(CacheConfig {
            key_includes_file: true,
            ..CacheConfig::default()
        });
        assert_eq!(scoped.key("abc", Some("src/a.ts")), "abc@src/a.ts");
        assert_eq!(scoped.key("abc", None), "abc");
    }

    #[test]
    fn test_clear() {
        let cache = FixCache::default();
        cache.set("a", plan("a"));
        cache.clear();
        assert!(cache.is_empty());
    }
}
