//! Plan-level distributed lock and per-position advisory locks.
//!
//! The plan lock (`plan:{idempotency_key}`, SET NX PX) serializes duplicate
//! trade_plan deliveries across consumer instances. It is intentionally
//! never released: the TTL outlives plan processing, so a redelivered
//! envelope inside the window is recognized as a duplicate and acked
//! silently.
//!
//! Position locks are in-process only. Paper matcher, reconciliation and
//! position-sync serialize on them before touching the same position row.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use redis::aio::ConnectionManager;
use tokio::sync::Mutex;

// ─────────────────────────────────────────────────────────
// Distributed plan lock
// ─────────────────────────────────────────────────────────

#[derive(Clone)]
pub struct PlanLocks {
    conn: ConnectionManager,
    ttl_ms: u64,
}

impl PlanLocks {
    pub async fn connect(redis_url: &str, ttl_ms: u64) -> Result<Self> {
        let client = redis::Client::open(redis_url).context("bad REDIS_URL")?;
        let conn = ConnectionManager::new(client).await.context("redis connect failed")?;
        Ok(Self { conn, ttl_ms })
    }

    /// Try to take the plan lock. `false` means another delivery of the
    /// same plan already holds it.
    pub async fn acquire(&self, idempotency_key: &str) -> Result<bool> {
        let key = format!("plan:{idempotency_key}");
        let mut conn = self.conn.clone();
        let res: Option<String> = redis::cmd("SET")
            .arg(&key)
            .arg("1")
            .arg("NX")
            .arg("PX")
            .arg(self.ttl_ms)
            .query_async(&mut conn)
            .await
            .with_context(|| format!("SET NX {key}"))?;
        Ok(res.is_some())
    }
}

// ─────────────────────────────────────────────────────────
// In-process position locks
// ─────────────────────────────────────────────────────────

#[derive(Default)]
pub struct PositionLocks {
    map: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl PositionLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Handle to the advisory lock for one position id. Hold the returned
    /// guard across the read-modify-write of that position.
    pub async fn for_position(&self, position_id: &str) -> Arc<Mutex<()>> {
        let mut map = self.map.lock().await;
        map.entry(position_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Drop the entry for a closed position so the map doesn't grow forever.
    pub async fn release(&self, position_id: &str) {
        let mut map = self.map.lock().await;
        map.remove(position_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_same_position_shares_one_lock() {
        let locks = PositionLocks::new();
        let a = locks.for_position("pos-1").await;
        let b = locks.for_position("pos-1").await;
        assert!(Arc::ptr_eq(&a, &b));

        let other = locks.for_position("pos-2").await;
        assert!(!Arc::ptr_eq(&a, &other));
    }

    #[tokio::test]
    async fn test_release_forgets_entry() {
        let locks = PositionLocks::new();
        let a = locks.for_position("pos-1").await;
        locks.release("pos-1").await;
        let b = locks.for_position("pos-1").await;
        assert!(!Arc::ptr_eq(&a, &b));
    }
}
