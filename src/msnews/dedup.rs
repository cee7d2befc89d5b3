//! 文章去重缓存
//!
//! 每个采集器独占一个缓存（单写者，无锁），按hash判重。
//! 条目1小时过期，容量约5000条，满时先清过期再逐出最旧。

use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::mscommon::config::constants::{DEDUP_CACHE_MAX_ENTRIES, DEDUP_CACHE_TTL_SECS};

/// URL-hash去重缓存
#[derive(Debug)]
pub struct DedupCache {
    entries: HashMap<String, Instant>,
    ttl: Duration,
    max_entries: usize,
}

impl DedupCache {
    pub fn new() -> Self {
        Self::with_limits(
            Duration::from_secs(DEDUP_CACHE_TTL_SECS),
            DEDUP_CACHE_MAX_ENTRIES,
        )
    }

    pub fn with_limits(ttl: Duration, max_entries: usize) -> Self {
        Self {
            entries: HashMap::new(),
            ttl,
            max_entries,
        }
    }

    /// 判重并登记：已存在（未过期）返回true，否则登记并返回false
    pub fn check_and_insert(&mut self, hash: &str) -> bool {
        let now = Instant::now();

        if let Some(&inserted_at) = self.entries.get(hash) {
            if now.duration_since(inserted_at) < self.ttl {
                return true;
            }
        }

        if self.entries.len() >= self.max_entries {
            self.prune(now);
        }

        self.entries.insert(hash.to_string(), now);
        false
    }

    /// 移除指定hash（评分失败的文章退回，等待下次发现时重新入队）
    pub fn remove(&mut self, hash: &str) {
        self.entries.remove(hash);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// 先清过期条目；仍然满则逐出最旧的一批
    fn prune(&mut self, now: Instant) {
        let ttl = self.ttl;
        self.entries
            .retain(|_, &mut inserted_at| now.duration_since(inserted_at) < ttl);

        if self.entries.len() >= self.max_entries {
            let evict_count = self.entries.len() / 10 + 1;
            let mut by_age: Vec<(String, Instant)> = self
                .entries
                .iter()
                .map(|(k, &v)| (k.clone(), v))
                .collect();
            by_age.sort_by_key(|&(_, at)| at);
            for (key, _) in by_age.into_iter().take(evict_count) {
                self.entries.remove(&key);
            }
        }
    }
}

impl Default for DedupCache {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_insert_not_duplicate() {
        let mut cache = DedupCache::new();
        assert!(!cache.check_and_insert("abc"));
        assert!(cache.check_and_insert("abc"));
        assert!(!cache.check_and_insert("def"));
    }

    #[test]
    fn test_remove_allows_reinsert() {
        let mut cache = DedupCache::new();
        assert!(!cache.check_and_insert("abc"));
        cache.remove("abc");
        assert!(!cache.check_and_insert("abc"), "移除后应可重新登记");
    }

    #[test]
    fn test_ttl_expiry() {
        let mut cache = DedupCache::with_limits(Duration::from_millis(10), 100);
        assert!(!cache.check_and_insert("abc"));
        std::thread::sleep(Duration::from_millis(20));
        assert!(!cache.check_and_insert("abc"), "过期条目不算重复");
    }

    #[test]
    fn test_capacity_eviction() {
        let mut cache = DedupCache::with_limits(Duration::from_secs(3600), 10);
        for i in 0..15 {
            cache.check_and_insert(&format!("hash{}", i));
        }
        assert!(cache.len() <= 11, "容量受限，实际为 {}", cache.len());
    }
}
