//! Shared response cache keyed by (lowercased QNAME, QTYPE).

use std::sync::Arc;
use std::time::{Duration, Instant};

use moka::sync::Cache;

use crate::message::DnsMessage;
use crate::metrics::{CACHE_ENTRIES, CACHE_HITS_TOTAL, CACHE_MISSES_TOTAL};

#[derive(Clone)]
struct CachedEntry {
    message: Arc<DnsMessage>,
    expires_at: Instant,
}

/// 所有 Agent 共享一个实例。过期采用惰性策略：读到过期条目按未命中处理并
/// 顺手 invalidate，另有一个低频 sweep 兜底（让 entry_count 指标保持诚实）。
pub struct ResponseCache {
    entries: Cache<(String, u16), CachedEntry>,
}

impl ResponseCache {
    pub fn new() -> Self {
        // Moka 自带 W-TinyLFU 容量淘汰，这里只需要给个上限
        Self { entries: Cache::builder().max_capacity(50_000).build() }
    }

    /// Returns a private copy of the stored message, so the caller may patch
    /// the transaction id and TSIG without corrupting the entry.
    pub fn lookup(&self, qname_key: &str, qtype: u16) -> Option<DnsMessage> {
        let key = (qname_key.to_string(), qtype);
        if let Some(entry) = self.entries.get(&key) {
            if Instant::now() <= entry.expires_at {
                CACHE_HITS_TOTAL.inc();
                return Some((*entry.message).clone());
            }
            self.entries.invalidate(&key);
        }
        CACHE_MISSES_TOTAL.inc();
        None
    }

    /// Unconditional insert, last write wins. `cache_age` of 0 keeps the
    /// record TTL verbatim, otherwise it caps the effective TTL.
    pub fn insert(&self, qname_key: &str, qtype: u16, message: DnsMessage, cache_age: u32) {
        let min_ttl = message.min_answer_ttl();
        let effective_ttl = if cache_age > 0 { cache_age.min(min_ttl) } else { min_ttl };
        let entry = CachedEntry {
            message: Arc::new(message),
            expires_at: Instant::now() + Duration::from_secs(effective_ttl as u64),
        };
        self.entries.insert((qname_key.to_string(), qtype), entry);
        CACHE_ENTRIES.set(self.entries.entry_count() as f64);
    }

    pub fn clear(&self) {
        self.entries.invalidate_all();
        CACHE_ENTRIES.set(0.0);
        tracing::info!("[cache] Flushed all entries");
    }

    /// Opportunistic sweep of expired entries, driven by a slow timer.
    pub fn sweep(&self) {
        let now = Instant::now();
        let stale: Vec<(String, u16)> = self
            .entries
            .iter()
            .filter(|(_, entry)| entry.expires_at < now)
            .map(|(key, _)| (*key).clone())
            .collect();
        for key in &stale {
            self.entries.invalidate(key);
        }
        if !stale.is_empty() {
            tracing::debug!("[cache] Swept {} expired entries", stale.len());
        }
        CACHE_ENTRIES.set(self.entries.entry_count() as f64);
    }
}
