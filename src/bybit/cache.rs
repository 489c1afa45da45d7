//! TTL cache for idempotent venue queries (wallet balance, position list,
//! open orders). When the rate limiter predicts a long wait, callers may
//! take stale data instead of blocking; such reads are marked degraded and
//! the caller publishes `RATE_LIMIT(degraded=true)`.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use tokio::sync::RwLock;

#[derive(Debug, Clone)]
pub struct CacheRead<T> {
    pub value: T,
    pub age: Duration,
    /// True when the entry is past its TTL but was served anyway because a
    /// fresh fetch would have blocked on the rate limiter.
    pub degraded: bool,
}

struct Entry<T> {
    value: T,
    stored_at: Instant,
}

pub struct TtlCache<T: Clone> {
    inner: RwLock<HashMap<String, Entry<T>>>,
    ttl: Duration,
}

impl<T: Clone> TtlCache<T> {
    pub fn new(ttl: Duration) -> Self {
        Self {
            inner: RwLock::new(HashMap::new()),
            ttl,
        }
    }

    pub async fn put(&self, key: &str, value: T) {
        let mut map = self.inner.write().await;
        map.insert(
            key.to_string(),
            Entry { value, stored_at: Instant::now() },
        );
    }

    /// Entry younger than the TTL, or None.
    pub async fn fresh(&self, key: &str) -> Option<CacheRead<T>> {
        let map = self.inner.read().await;
        let e = map.get(key)?;
        let age = e.stored_at.elapsed();
        if age <= self.ttl {
            Some(CacheRead { value: e.value.clone(), age, degraded: false })
        } else {
            None
        }
    }

    /// Any entry regardless of age, marked degraded when expired.
    pub async fn any(&self, key: &str) -> Option<CacheRead<T>> {
        let map = self.inner.read().await;
        let e = map.get(key)?;
        let age = e.stored_at.elapsed();
        Some(CacheRead {
            value: e.value.clone(),
            degraded: age > self.ttl,
            age,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_fresh_within_ttl() {
        let c: TtlCache<i32> = TtlCache::new(Duration::from_secs(60));
        c.put("k", 7).await;
        let read = c.fresh("k").await.unwrap();
        assert_eq!(read.value, 7);
        assert!(!read.degraded);
    }

    #[tokio::test]
    async fn test_expired_entry_only_via_any() {
        let c: TtlCache<i32> = TtlCache::new(Duration::ZERO);
        c.put("k", 7).await;
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert!(c.fresh("k").await.is_none());
        let stale = c.any("k").await.unwrap();
        assert_eq!(stale.value, 7);
        assert!(stale.degraded);
    }

    #[tokio::test]
    async fn test_missing_key() {
        let c: TtlCache<i32> = TtlCache::new(Duration::from_secs(1));
        assert!(c.fresh("nope").await.is_none());
        assert!(c.any("nope").await.is_none());
    }
}
