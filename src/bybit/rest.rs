//! Signed Bybit v5 REST client.
//!
//! Every call goes through the rate limiter first. Transient failures
//! (429 / 5xx / system-busy / timeouts) are retried with exponential
//! backoff, honoring the venue's Retry-After when present. Idempotent
//! queries are served through TTL caches with a stale-but-usable fallback
//! when the limiter predicts a long wait.

use std::sync::Arc;
use std::time::Duration;

use hmac::{Hmac, Mac};
use reqwest::header::HeaderMap;
use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;
use secrecy::{ExposeSecret, SecretString};
use serde::de::DeserializeOwned;
use sha2::Sha256;
use tracing::{debug, warn};

use super::cache::{CacheRead, TtlCache};
use super::rate_limit::{EndpointClass, RateLimiter};
use super::types::*;
use crate::config::Settings;

type HmacSha256 = Hmac<Sha256>;

const MAX_ATTEMPTS: u32 = 3;
const CATEGORY: &str = "linear";

/// Render a price/qty for the wire without float noise.
pub fn fmt_decimal(v: f64, dp: u32) -> String {
    Decimal::from_f64(v)
        .map(|d| d.round_dp(dp).normalize().to_string())
        .unwrap_or_else(|| format!("{v}"))
}

pub struct BybitRest {
    http: reqwest::Client,
    base: String,
    api_key: String,
    api_secret: SecretString,
    recv_window_ms: i64,
    limiter: Arc<RateLimiter>,
    stale_wait: Duration,

    wallet_cache: TtlCache<WalletAccount>,
    orders_cache: TtlCache<Vec<VenueOrder>>,
    positions_cache: TtlCache<Vec<VenuePosition>>,
    instruments_cache: TtlCache<Instrument>,
}

impl BybitRest {
    pub fn new(cfg: &Settings, limiter: Arc<RateLimiter>) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self {
            http,
            base: cfg.bybit_rest_url.trim_end_matches('/').to_string(),
            api_key: cfg.bybit_api_key.clone(),
            api_secret: cfg.bybit_api_secret.clone(),
            recv_window_ms: cfg.bybit_recv_window_ms,
            limiter,
            stale_wait: Duration::from_millis(cfg.rl_stale_wait_ms),
            wallet_cache: TtlCache::new(Duration::from_secs(10)),
            orders_cache: TtlCache::new(Duration::from_secs(3)),
            positions_cache: TtlCache::new(Duration::from_secs(5)),
            instruments_cache: TtlCache::new(Duration::from_secs(3600)),
        })
    }

    fn sign(&self, timestamp_ms: i64, payload: &str) -> String {
        let msg = format!(
            "{}{}{}{}",
            timestamp_ms, self.api_key, self.recv_window_ms, payload
        );
        let mut mac = HmacSha256::new_from_slice(self.api_secret.expose_secret().as_bytes())
            .expect("hmac accepts any key length");
        mac.update(msg.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    /// Parse the venue's limit headers and feed the adaptive cooldown.
    async fn adapt_from_headers(&self, headers: &HeaderMap, class: EndpointClass) -> Option<i64> {
        let get_i64 = |name: &str| {
            headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .and_then(|s| s.trim().parse::<i64>().ok())
        };

        if let Some(retry_after_s) = get_i64("retry-after") {
            let ms = retry_after_s * 1000;
            self.limiter.penalize(class, Duration::from_millis(ms as u64)).await;
            return Some(ms);
        }

        let remaining = get_i64("x-bapi-limit-status");
        let reset_ts = get_i64("x-bapi-limit-reset-timestamp");
        if let (Some(remaining), Some(reset_ts)) = (remaining, reset_ts) {
            if remaining <= 1 {
                let wait_ms = (reset_ts - crate::now_ms()).max(100);
                self.limiter
                    .penalize(class, Duration::from_millis(wait_ms as u64))
                    .await;
                return Some(wait_ms);
            }
        }
        None
    }

    async fn request<T: DeserializeOwned>(
        &self,
        method: reqwest::Method,
        path: &str,
        query: &str,
        body: Option<&str>,
        class: EndpointClass,
        symbol: Option<&str>,
    ) -> Result<T, VenueError> {
        self.limiter
            .acquire(class, symbol, Duration::from_secs(15))
            .await
            .map_err(|hint| VenueError::RateLimited {
                retry_after_ms: Some(hint.as_millis() as i64),
            })?;

        let ts = crate::now_ms();
        let payload = body.unwrap_or(query);
        let sig = self.sign(ts, payload);

        let url = if query.is_empty() {
            format!("{}{}", self.base, path)
        } else {
            format!("{}{}?{}", self.base, path, query)
        };

        let mut req = self
            .http
            .request(method, &url)
            .header("X-BAPI-API-KEY", &self.api_key)
            .header("X-BAPI-TIMESTAMP", ts.to_string())
            .header("X-BAPI-RECV-WINDOW", self.recv_window_ms.to_string())
            .header("X-BAPI-SIGN", sig);
        if let Some(b) = body {
            req = req
                .header("Content-Type", "application/json")
                .body(b.to_string());
        }

        let resp = req
            .send()
            .await
            .map_err(|e| VenueError::Transient(format!("http send: {e}")))?;

        let status = resp.status();
        let retry_after = self.adapt_from_headers(resp.headers(), class).await;

        if status.as_u16() == 429 {
            return Err(VenueError::RateLimited { retry_after_ms: retry_after });
        }
        if status.is_server_error() {
            return Err(VenueError::Transient(format!("http {status}")));
        }

        let api: ApiResponse<T> = resp
            .json()
            .await
            .map_err(|e| VenueError::Transient(format!("body: {e}")))?;

        if let Some(mut err) = classify_ret_code(api.ret_code, &api.ret_msg) {
            if let VenueError::RateLimited { retry_after_ms } = &mut err {
                *retry_after_ms = retry_after.or(*retry_after_ms);
            }
            return Err(err);
        }
        api.result
            .ok_or_else(|| VenueError::Transient("missing result".into()))
    }

    /// Retry wrapper for transient failures. Rejections pass straight
    /// through so callers can roll back.
    async fn with_retry<T, F, Fut>(&self, mut call: F) -> Result<T, VenueError>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T, VenueError>>,
    {
        let mut attempt = 0;
        loop {
            match call().await {
                Ok(v) => return Ok(v),
                Err(e) if e.is_retryable() && attempt + 1 < MAX_ATTEMPTS => {
                    let backoff = match &e {
                        VenueError::RateLimited { retry_after_ms: Some(ms) } => {
                            Duration::from_millis((*ms).max(100) as u64)
                        }
                        _ => Duration::from_millis(500 * 2u64.pow(attempt)),
                    };
                    warn!("🔁 venue retry {}/{}: {e} (backoff {:?})", attempt + 1, MAX_ATTEMPTS, backoff);
                    tokio::time::sleep(backoff).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    // ─────────────────────────────────────────────────
    // Cached idempotent queries
    // ─────────────────────────────────────────────────

    async fn cached<T, F, Fut>(
        &self,
        cache: &TtlCache<T>,
        key: &str,
        class: EndpointClass,
        fetch: F,
    ) -> Result<CacheRead<T>, VenueError>
    where
        T: Clone,
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<T, VenueError>>,
    {
        if let Some(fresh) = cache.fresh(key).await {
            return Ok(fresh);
        }

        // Bucket exhausted: hand out stale data instead of queueing.
        let predicted = self.limiter.predicted_wait(class, None).await;
        if predicted > self.stale_wait {
            if let Some(stale) = cache.any(key).await {
                debug!("🥫 serving degraded cache for {} (wait {:?})", key, predicted);
                return Ok(CacheRead { degraded: true, ..stale });
            }
        }

        match fetch().await {
            Ok(v) => {
                cache.put(key, v.clone()).await;
                Ok(CacheRead { value: v, age: Duration::ZERO, degraded: false })
            }
            Err(e) if e.is_retryable() => match cache.any(key).await {
                Some(stale) => Ok(CacheRead { degraded: true, ..stale }),
                None => Err(e),
            },
            Err(e) => Err(e),
        }
    }

    pub async fn wallet_balance(&self) -> Result<CacheRead<WalletAccount>, VenueError> {
        self.cached(
            &self.wallet_cache,
            "UNIFIED",
            EndpointClass::PrivateAccountQuery,
            || async {
                let res: WalletBalanceResult = self
                    .with_retry(|| {
                        self.request(
                            reqwest::Method::GET,
                            "/v5/account/wallet-balance",
                            "accountType=UNIFIED",
                            None,
                            EndpointClass::PrivateAccountQuery,
                            None,
                        )
                    })
                    .await?;
                res.list
                    .into_iter()
                    .next()
                    .ok_or_else(|| VenueError::Transient("empty wallet list".into()))
            },
        )
        .await
    }

    pub async fn instruments_info(&self, symbol: &str) -> Result<Instrument, VenueError> {
        let read = self
            .cached(
                &self.instruments_cache,
                symbol,
                EndpointClass::Public,
                || async {
                    let query = format!("category={CATEGORY}&symbol={symbol}");
                    let res: InstrumentsResult = self
                        .with_retry(|| {
                            self.request(
                                reqwest::Method::GET,
                                "/v5/market/instruments-info",
                                &query,
                                None,
                                EndpointClass::Public,
                                None,
                            )
                        })
                        .await?;
                    res.list
                        .into_iter()
                        .next()
                        .ok_or_else(|| VenueError::Rejected {
                            code: -1,
                            msg: format!("unknown instrument {symbol}"),
                        })
                },
            )
            .await?;
        Ok(read.value)
    }

    pub async fn open_orders(&self, symbol: &str) -> Result<CacheRead<Vec<VenueOrder>>, VenueError> {
        self.cached(
            &self.orders_cache,
            symbol,
            EndpointClass::PrivateOrderQuery,
            || async {
                let query = format!("category={CATEGORY}&symbol={symbol}");
                let res: OpenOrdersResult = self
                    .with_retry(|| {
                        self.request(
                            reqwest::Method::GET,
                            "/v5/order/realtime",
                            &query,
                            None,
                            EndpointClass::PrivateOrderQuery,
                            Some(symbol),
                        )
                    })
                    .await?;
                Ok(res.list)
            },
        )
        .await
    }

    pub async fn position_list(
        &self,
        symbol: &str,
    ) -> Result<CacheRead<Vec<VenuePosition>>, VenueError> {
        self.cached(
            &self.positions_cache,
            symbol,
            EndpointClass::PrivateAccountQuery,
            || async {
                let query = format!("category={CATEGORY}&symbol={symbol}");
                let res: PositionListResult = self
                    .with_retry(|| {
                        self.request(
                            reqwest::Method::GET,
                            "/v5/position/list",
                            &query,
                            None,
                            EndpointClass::PrivateAccountQuery,
                            Some(symbol),
                        )
                    })
                    .await?;
                Ok(res.list)
            },
        )
        .await
    }

    // ─────────────────────────────────────────────────
    // Order placement (PRIVATE_CRITICAL, never cached)
    // ─────────────────────────────────────────────────

    pub async fn create_order(
        &self,
        req: &OrderCreateRequest,
    ) -> Result<OrderCreateResult, VenueError> {
        let body = serde_json::to_string(req)?;
        self.with_retry(|| {
            self.request(
                reqwest::Method::POST,
                "/v5/order/create",
                "",
                Some(&body),
                EndpointClass::PrivateCritical,
                Some(&req.symbol),
            )
        })
        .await
    }

    pub async fn cancel_order(
        &self,
        symbol: &str,
        venue_order_id: &str,
    ) -> Result<(), VenueError> {
        let body = serde_json::json!({
            "category": CATEGORY,
            "symbol": symbol,
            "orderId": venue_order_id,
        })
        .to_string();
        let _: serde_json::Value = self
            .with_retry(|| {
                self.request(
                    reqwest::Method::POST,
                    "/v5/order/cancel",
                    "",
                    Some(&body),
                    EndpointClass::PrivateCritical,
                    Some(symbol),
                )
            })
            .await?;
        Ok(())
    }

    /// Set (or move) the position's stop loss via trading-stop.
    pub async fn set_trading_stop(&self, symbol: &str, stop_price: f64) -> Result<(), VenueError> {
        let body = serde_json::json!({
            "category": CATEGORY,
            "symbol": symbol,
            "stopLoss": fmt_decimal(stop_price, 4),
            "positionIdx": 0,
        })
        .to_string();
        let _: serde_json::Value = self
            .with_retry(|| {
                self.request(
                    reqwest::Method::POST,
                    "/v5/position/trading-stop",
                    "",
                    Some(&body),
                    EndpointClass::PrivateCritical,
                    Some(symbol),
                )
            })
            .await?;
        Ok(())
    }

    pub async fn execution_list(
        &self,
        symbol: &str,
        start_time_ms: i64,
    ) -> Result<Vec<VenueExecution>, VenueError> {
        let query = format!("category={CATEGORY}&symbol={symbol}&startTime={start_time_ms}");
        let res: ExecutionListResult = self
            .with_retry(|| {
                self.request(
                    reqwest::Method::GET,
                    "/v5/execution/list",
                    &query,
                    None,
                    EndpointClass::PrivateOrderQuery,
                    Some(symbol),
                )
            })
            .await?;
        Ok(res.list)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fmt_decimal_strips_noise() {
        assert_eq!(fmt_decimal(30000.0, 4), "30000");
        assert_eq!(fmt_decimal(0.020000000000000004, 3), "0.02");
        assert_eq!(fmt_decimal(30015.000000001, 4), "30015");
        assert_eq!(fmt_decimal(0.1234567, 3), "0.123");
    }
}
