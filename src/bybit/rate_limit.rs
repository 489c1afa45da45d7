//! Venue rate limiter: global + per-symbol + per-endpoint-class token
//! buckets, with adaptive cooldowns parsed from venue headers.
//!
//! PRIVATE_CRITICAL (order placement/cancel, trading-stop) holds a
//! priority reservation on the global bucket: query classes must leave
//! `critical_reserve` tokens behind, so polling can never starve an exit.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EndpointClass {
    PrivateCritical,
    PrivateOrderQuery,
    PrivateAccountQuery,
    Public,
}

impl EndpointClass {
    pub fn as_str(self) -> &'static str {
        match self {
            EndpointClass::PrivateCritical => "PRIVATE_CRITICAL",
            EndpointClass::PrivateOrderQuery => "PRIVATE_ORDER_QUERY",
            EndpointClass::PrivateAccountQuery => "PRIVATE_ACCOUNT_QUERY",
            EndpointClass::Public => "PUBLIC",
        }
    }
}

// ─────────────────────────────────────────────────────────
// Token bucket
// ─────────────────────────────────────────────────────────

#[derive(Debug)]
struct TokenBucket {
    capacity: f64,
    tokens: f64,
    refill_per_sec: f64,
    last_refill: Instant,
    /// Adaptive penalty: no tokens are handed out before this instant.
    cooldown_until: Option<Instant>,
}

impl TokenBucket {
    fn new(rate_per_sec: f64) -> Self {
        let capacity = (rate_per_sec * 2.0).max(1.0);
        Self {
            capacity,
            tokens: capacity,
            refill_per_sec: rate_per_sec,
            last_refill: Instant::now(),
            cooldown_until: None,
        }
    }

    fn refill(&mut self, now: Instant) {
        let dt = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + dt * self.refill_per_sec).min(self.capacity);
        self.last_refill = now;
    }

    /// Take one token, leaving at least `floor` behind.
    fn try_take(&mut self, now: Instant, floor: f64) -> bool {
        if let Some(until) = self.cooldown_until {
            if now < until {
                return false;
            }
            self.cooldown_until = None;
        }
        self.refill(now);
        if self.tokens - 1.0 >= floor {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    fn wait_hint(&self, now: Instant, floor: f64) -> Duration {
        let mut wait = Duration::ZERO;
        if let Some(until) = self.cooldown_until {
            if now < until {
                wait = until - now;
            }
        }
        let tokens_now = (self.tokens
            + now.duration_since(self.last_refill).as_secs_f64() * self.refill_per_sec)
            .min(self.capacity);
        let deficit = (floor + 1.0) - tokens_now;
        if deficit > 0.0 && self.refill_per_sec > 0.0 {
            wait = wait.max(Duration::from_secs_f64(deficit / self.refill_per_sec));
        }
        wait
    }
}

// ─────────────────────────────────────────────────────────
// Limiter
// ─────────────────────────────────────────────────────────

struct Buckets {
    global: TokenBucket,
    class: HashMap<EndpointClass, TokenBucket>,
    symbol: HashMap<String, TokenBucket>,
    symbol_rate: f64,
}

pub struct RateLimiter {
    inner: Mutex<Buckets>,
    critical_reserve: f64,
}

impl RateLimiter {
    pub fn new(global_per_sec: f64, symbol_per_sec: f64, critical_reserve: f64) -> Self {
        let mut class = HashMap::new();
        class.insert(EndpointClass::PrivateCritical, TokenBucket::new(global_per_sec));
        class.insert(EndpointClass::PrivateOrderQuery, TokenBucket::new(global_per_sec / 2.0));
        class.insert(EndpointClass::PrivateAccountQuery, TokenBucket::new(global_per_sec / 2.0));
        class.insert(EndpointClass::Public, TokenBucket::new(global_per_sec));

        Self {
            inner: Mutex::new(Buckets {
                global: TokenBucket::new(global_per_sec),
                class,
                symbol: HashMap::new(),
                symbol_rate: symbol_per_sec,
            }),
            critical_reserve,
        }
    }

    fn global_floor(&self, class: EndpointClass) -> f64 {
        if class == EndpointClass::PrivateCritical {
            0.0
        } else {
            self.critical_reserve
        }
    }

    async fn try_take(&self, class: EndpointClass, symbol: Option<&str>) -> Result<(), Duration> {
        let floor = self.global_floor(class);
        let now = Instant::now();
        let mut b = self.inner.lock().await;

        let hint_g = b.global.wait_hint(now, floor);
        let hint_c = b.class.get(&class).map(|c| c.wait_hint(now, 0.0)).unwrap_or_default();
        let mut hint = hint_g.max(hint_c);
        if let Some(sym) = symbol {
            let rate = b.symbol_rate;
            let sb = b.symbol.entry(sym.to_string()).or_insert_with(|| TokenBucket::new(rate));
            hint = hint.max(sb.wait_hint(now, 0.0));
        }
        if hint > Duration::ZERO {
            return Err(hint);
        }

        // All buckets look free: take from each. Reservation is enforced
        // by the floor on the global bucket.
        if !b.global.try_take(now, floor) {
            return Err(Duration::from_millis(50));
        }
        if let Some(c) = b.class.get_mut(&class) {
            if !c.try_take(now, 0.0) {
                return Err(Duration::from_millis(50));
            }
        }
        if let Some(sym) = symbol {
            if let Some(sb) = b.symbol.get_mut(sym) {
                if !sb.try_take(now, 0.0) {
                    return Err(Duration::from_millis(50));
                }
            }
        }
        Ok(())
    }

    /// Block until a token is available or `deadline` passes. Returns the
    /// predicted wait on timeout so callers can degrade to cached data.
    pub async fn acquire(
        &self,
        class: EndpointClass,
        symbol: Option<&str>,
        deadline: Duration,
    ) -> Result<(), Duration> {
        let started = Instant::now();
        loop {
            match self.try_take(class, symbol).await {
                Ok(()) => return Ok(()),
                Err(hint) => {
                    if started.elapsed() + hint > deadline {
                        return Err(hint);
                    }
                    tokio::time::sleep(hint.min(Duration::from_millis(250))).await;
                }
            }
        }
    }

    /// Expected wait before the next token for this (class, symbol).
    pub async fn predicted_wait(&self, class: EndpointClass, symbol: Option<&str>) -> Duration {
        let now = Instant::now();
        let floor = self.global_floor(class);
        let b = self.inner.lock().await;
        let mut hint = b.global.wait_hint(now, floor);
        if let Some(c) = b.class.get(&class) {
            hint = hint.max(c.wait_hint(now, 0.0));
        }
        if let Some(sb) = symbol.and_then(|s| b.symbol.get(s)) {
            hint = hint.max(sb.wait_hint(now, 0.0));
        }
        hint
    }

    /// Adaptive cooldown from venue headers / retCode 10006: freeze the
    /// class bucket until the venue's reset point.
    pub async fn penalize(&self, class: EndpointClass, wait: Duration) {
        let until = Instant::now() + wait;
        let mut b = self.inner.lock().await;
        if let Some(c) = b.class.get_mut(&class) {
            c.cooldown_until = Some(c.cooldown_until.map_or(until, |u| u.max(until)));
        }
        debug!("⏳ rate-limit cooldown on {} for {:?}", class.as_str(), wait);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_burst_drains_then_blocks() {
        let rl = RateLimiter::new(2.0, 100.0, 0.0);
        // Capacity = 2 × rate = 4 tokens.
        for _ in 0..4 {
            assert!(rl.try_take(EndpointClass::Public, None).await.is_ok());
        }
        assert!(rl.try_take(EndpointClass::Public, None).await.is_err());
    }

    #[tokio::test]
    async fn test_critical_reserve_blocks_queries_first() {
        let rl = RateLimiter::new(2.0, 100.0, 3.0);
        // Queries must leave 3 tokens in the global bucket (cap 4): only
        // one take is allowed before the floor bites.
        assert!(rl.try_take(EndpointClass::PrivateAccountQuery, None).await.is_ok());
        assert!(rl.try_take(EndpointClass::PrivateAccountQuery, None).await.is_err());
        // Critical ignores the floor and can still proceed.
        assert!(rl.try_take(EndpointClass::PrivateCritical, None).await.is_ok());
    }

    #[tokio::test]
    async fn test_penalize_freezes_class() {
        let rl = RateLimiter::new(100.0, 100.0, 0.0);
        assert!(rl.try_take(EndpointClass::PrivateOrderQuery, None).await.is_ok());
        rl.penalize(EndpointClass::PrivateOrderQuery, Duration::from_secs(60)).await;
        assert!(rl.try_take(EndpointClass::PrivateOrderQuery, None).await.is_err());
        // Other classes are unaffected.
        assert!(rl.try_take(EndpointClass::Public, None).await.is_ok());
        let wait = rl.predicted_wait(EndpointClass::PrivateOrderQuery, None).await;
        assert!(wait > Duration::from_secs(30));
    }

    #[tokio::test]
    async fn test_per_symbol_buckets_are_independent() {
        let rl = RateLimiter::new(1000.0, 1.0, 0.0);
        // Symbol cap = 2 tokens.
        assert!(rl.try_take(EndpointClass::Public, Some("BTCUSDT")).await.is_ok());
        assert!(rl.try_take(EndpointClass::Public, Some("BTCUSDT")).await.is_ok());
        assert!(rl.try_take(EndpointClass::Public, Some("BTCUSDT")).await.is_err());
        assert!(rl.try_take(EndpointClass::Public, Some("ETHUSDT")).await.is_ok());
    }
}
