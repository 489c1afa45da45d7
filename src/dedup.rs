//! Windowed suppression for noisy risk events.
//!
//! Per-(type, key) TTL set: the first event in a window passes, repeats
//! inside the window are dropped. Local to the process — a restart may
//! emit one duplicate per key, which operators accept.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;

use crate::events::RiskEventType;

struct Window {
    seen_at: HashMap<(RiskEventType, String), Instant>,
    ttl: Duration,
    max_entries: usize,
}

impl Window {
    fn remember(&mut self, kind: RiskEventType, key: String) -> bool {
        let now = Instant::now();
        self.evict_expired(now);

        let k = (kind, key);
        if let Some(last) = self.seen_at.get(&k) {
            if now.duration_since(*last) < self.ttl {
                return false;
            }
        }
        self.seen_at.insert(k, now);
        self.evict_oldest_if_needed();
        true
    }

    fn evict_expired(&mut self, now: Instant) {
        let ttl = self.ttl;
        self.seen_at.retain(|_, ts| now.duration_since(*ts) < ttl);
    }

    fn evict_oldest_if_needed(&mut self) {
        while self.seen_at.len() > self.max_entries {
            let oldest = self
                .seen_at
                .iter()
                .min_by_key(|(_, ts)| *ts)
                .map(|(k, _)| k.clone());
            match oldest {
                Some(k) => {
                    self.seen_at.remove(&k);
                }
                None => break,
            }
        }
    }
}

pub struct RiskEventDedup {
    inner: Mutex<Window>,
}

impl RiskEventDedup {
    pub fn new(window: Duration) -> Self {
        Self {
            inner: Mutex::new(Window {
                seen_at: HashMap::new(),
                ttl: window,
                max_entries: 10_000,
            }),
        }
    }

    /// True if the event should be published; false if a same-(type, key)
    /// event already went out inside the window. Non-windowed types always
    /// pass.
    pub async fn should_emit(&self, kind: RiskEventType, key: &str) -> bool {
        if !kind.is_windowed() {
            return true;
        }
        self.inner.lock().await.remember(kind, key.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_windowed_type_suppresses_repeat() {
        let d = RiskEventDedup::new(Duration::from_secs(300));
        assert!(d.should_emit(RiskEventType::ConsistencyDrift, "BTCUSDT").await);
        assert!(!d.should_emit(RiskEventType::ConsistencyDrift, "BTCUSDT").await);
        // Different key is an independent window.
        assert!(d.should_emit(RiskEventType::ConsistencyDrift, "ETHUSDT").await);
    }

    #[test]
    fn test_window_expiry_reopens() {
        let mut w = Window {
            seen_at: HashMap::new(),
            ttl: Duration::from_millis(0),
            max_entries: 16,
        };
        assert!(w.remember(RiskEventType::RateLimit, "BTCUSDT".into()));
        // Zero TTL: the previous entry is already expired.
        assert!(w.remember(RiskEventType::RateLimit, "BTCUSDT".into()));
    }

    #[tokio::test]
    async fn test_non_windowed_type_always_passes() {
        let d = RiskEventDedup::new(Duration::from_secs(300));
        assert!(d.should_emit(RiskEventType::OrderRetry, "BTCUSDT").await);
        assert!(d.should_emit(RiskEventType::OrderRetry, "BTCUSDT").await);
    }
}
