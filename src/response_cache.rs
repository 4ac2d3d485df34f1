//! `ResponseCache`: a bounded-by-bytes, LRU-evicted map from URL to
//! captured response, shared across all discovery jobs and safe under
//! concurrent `get`/`put`.

use crate::model::{ResponseCacheEntry, MAX_RESOURCE_BYTES};
use lru::LruCache;
use std::num::NonZeroUsize;
use tokio::sync::Mutex;

const DEFAULT_MAX_BYTES: usize = 128 * 1024 * 1024;

struct Inner {
    entries: LruCache<String, ResponseCacheEntry>,
    total_bytes: usize,
}

pub struct ResponseCache {
    inner: Mutex<Inner>,
    max_bytes: usize,
    disabled: bool,
}

impl ResponseCache {
    pub fn new(max_bytes: Option<usize>, disabled: bool) -> Self {
        Self {
            inner: Mutex::new(Inner {
                // Capacity is nominal; eviction is driven by total_bytes, not
                // entry count, so we pick a generous upper bound on entries.
                entries: LruCache::new(NonZeroUsize::new(65536).unwrap()),
                total_bytes: 0,
            }),
            max_bytes: max_bytes.unwrap_or(DEFAULT_MAX_BYTES),
            disabled,
        }
    }

    pub async fn get(&self, url: &str) -> Option<ResponseCacheEntry> {
        if self.disabled {
            return None;
        }
        let mut inner = self.inner.lock().await;
        inner.entries.get(url).cloned()
    }

    pub async fn put(&self, url: String, entry: ResponseCacheEntry) {
        if self.disabled {
            return;
        }
        if entry.byte_len() > MAX_RESOURCE_BYTES {
            return;
        }
        let mut inner = self.inner.lock().await;
        if let Some(old) = inner.entries.put(url, entry.clone()) {
            inner.total_bytes = inner.total_bytes.saturating_sub(old.byte_len());
        }
        inner.total_bytes += entry.byte_len();

        while inner.total_bytes > self.max_bytes {
            match inner.entries.pop_lru() {
                Some((_, evicted)) => {
                    inner.total_bytes = inner.total_bytes.saturating_sub(evicted.byte_len());
                }
                None => break,
            }
        }
    }

    pub async fn clear(&self) {
        let mut inner = self.inner.lock().await;
        inner.entries.clear();
        inner.total_bytes = 0;
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.entries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn entry(bytes: usize) -> ResponseCacheEntry {
        ResponseCacheEntry {
            sha: "deadbeef".to_string(),
            mimetype: "text/css".to_string(),
            content: vec![0u8; bytes],
            headers: HashMap::new(),
        }
    }

    #[tokio::test]
    async fn put_then_get_hits() {
        let cache = ResponseCache::new(None, false);
        cache.put("https://example.com/a.css".into(), entry(10)).await;
        assert!(cache.get("https://example.com/a.css").await.is_some());
        assert!(cache.get("https://example.com/missing.css").await.is_none());
    }

    #[tokio::test]
    async fn disabled_cache_is_always_a_miss() {
        let cache = ResponseCache::new(None, true);
        cache.put("https://example.com/a.css".into(), entry(10)).await;
        assert!(cache.get("https://example.com/a.css").await.is_none());
    }

    #[tokio::test]
    async fn eviction_respects_byte_budget() {
        let cache = ResponseCache::new(Some(15), false);
        cache.put("https://example.com/a".into(), entry(10)).await;
        cache.put("https://example.com/b".into(), entry(10)).await;
        // "a" should have been evicted to keep total_bytes <= 15.
        assert!(cache.get("https://example.com/a").await.is_none());
        assert!(cache.get("https://example.com/b").await.is_some());
    }

    #[tokio::test]
    async fn oversize_entry_is_never_stored() {
        let cache = ResponseCache::new(None, false);
        cache
            .put("https://example.com/huge".into(), entry(MAX_RESOURCE_BYTES + 1))
            .await;
        assert!(cache.get("https://example.com/huge").await.is_none());
    }
}
