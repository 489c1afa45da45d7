//! Bybit v5 wire types. The venue serializes every number as a string;
//! fields stay `String` here and are parsed at the call site via
//! [`parse_f64`].

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

// ─────────────────────────────────────────────────────────
// Error taxonomy
// ─────────────────────────────────────────────────────────

/// Classified venue failures. The REST client retries `Transient` and
/// `RateLimited` internally; `Rejected` is surfaced to the caller for
/// rollback.
#[derive(Debug, Error)]
pub enum VenueError {
    #[error("rate limited (retry after {retry_after_ms:?} ms)")]
    RateLimited { retry_after_ms: Option<i64> },
    #[error("transient venue error: {0}")]
    Transient(String),
    #[error("venue rejected request: code={code} msg={msg}")]
    Rejected { code: i64, msg: String },
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("decode error: {0}")]
    Decode(#[from] serde_json::Error),
}

impl VenueError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, VenueError::RateLimited { .. } | VenueError::Transient(_))
    }
}

/// Bybit retCode → classification. 0 is success; 10006 is the venue's
/// rate-limit code; 10002/10016 are clock/system-busy transients.
pub fn classify_ret_code(code: i64, msg: &str) -> Option<VenueError> {
    match code {
        0 => None,
        10006 => Some(VenueError::RateLimited { retry_after_ms: None }),
        10002 | 10016 => Some(VenueError::Transient(format!("retCode {code}: {msg}"))),
        _ => Some(VenueError::Rejected { code, msg: msg.to_string() }),
    }
}

// ─────────────────────────────────────────────────────────
// Envelope
// ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
pub struct ApiResponse<T> {
    #[serde(rename = "retCode")]
    pub ret_code: i64,
    #[serde(rename = "retMsg", default)]
    pub ret_msg: String,
    pub result: Option<T>,
    #[serde(default)]
    pub time: i64,
}

// ─────────────────────────────────────────────────────────
// Wallet / instruments
// ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WalletAccount {
    #[serde(default)]
    pub total_equity: String,
    #[serde(default)]
    pub total_available_balance: String,
    #[serde(default)]
    pub coin: Vec<Value>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WalletBalanceResult {
    #[serde(default)]
    pub list: Vec<WalletAccount>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LotSizeFilter {
    #[serde(default)]
    pub qty_step: String,
    #[serde(default)]
    pub min_order_qty: String,
    #[serde(default)]
    pub max_order_qty: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PriceFilter {
    #[serde(default)]
    pub tick_size: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Instrument {
    pub symbol: String,
    pub lot_size_filter: LotSizeFilter,
    pub price_filter: PriceFilter,
}

#[derive(Debug, Clone, Deserialize)]
pub struct InstrumentsResult {
    #[serde(default)]
    pub list: Vec<Instrument>,
}

// ─────────────────────────────────────────────────────────
// Orders
// ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderCreateRequest {
    pub category: String,
    pub symbol: String,
    pub side: String,
    pub order_type: String,
    pub qty: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub price: Option<String>,
    pub time_in_force: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reduce_only: Option<bool>,
    pub order_link_id: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderCreateResult {
    pub order_id: String,
    #[serde(default)]
    pub order_link_id: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VenueOrder {
    pub order_id: String,
    #[serde(default)]
    pub order_link_id: String,
    pub symbol: String,
    pub side: String,
    #[serde(default)]
    pub order_type: String,
    #[serde(default)]
    pub price: String,
    #[serde(default)]
    pub qty: String,
    pub order_status: String,
    #[serde(default)]
    pub cum_exec_qty: String,
    #[serde(default)]
    pub avg_price: String,
    #[serde(default)]
    pub reduce_only: bool,
    #[serde(default)]
    pub updated_time: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OpenOrdersResult {
    #[serde(default)]
    pub list: Vec<VenueOrder>,
}

// ─────────────────────────────────────────────────────────
// Positions / executions
// ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VenuePosition {
    pub symbol: String,
    pub side: String,
    #[serde(default)]
    pub size: String,
    #[serde(default)]
    pub avg_price: String,
    #[serde(default)]
    pub stop_loss: String,
    #[serde(default)]
    pub unrealised_pnl: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PositionListResult {
    #[serde(default)]
    pub list: Vec<VenuePosition>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VenueExecution {
    pub symbol: String,
    pub side: String,
    pub order_id: String,
    #[serde(default)]
    pub order_link_id: String,
    pub exec_id: String,
    #[serde(default)]
    pub exec_qty: String,
    #[serde(default)]
    pub exec_price: String,
    #[serde(default)]
    pub exec_fee: String,
    #[serde(default)]
    pub exec_time: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExecutionListResult {
    #[serde(default)]
    pub list: Vec<VenueExecution>,
}

/// Parse a venue string-number, handling both "0.5" and bare numbers.
pub fn parse_f64(s: &str) -> f64 {
    s.trim().parse::<f64>().unwrap_or(0.0)
}

/// Bybit order status → local status name, or None for states we treat as
/// still-working (Created, New, Untriggered, ...).
pub fn map_order_status(venue_status: &str) -> Option<crate::exec::types::OrderStatus> {
    use crate::exec::types::OrderStatus;
    match venue_status {
        "PartiallyFilled" => Some(OrderStatus::PartiallyFilled),
        "Filled" => Some(OrderStatus::Filled),
        "Cancelled" | "PartiallyFilledCanceled" => Some(OrderStatus::Canceled),
        "Rejected" => Some(OrderStatus::Failed),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_ret_code() {
        assert!(classify_ret_code(0, "OK").is_none());
        assert!(matches!(
            classify_ret_code(10006, "too many"),
            Some(VenueError::RateLimited { .. })
        ));
        assert!(matches!(
            classify_ret_code(10016, "busy"),
            Some(VenueError::Transient(_))
        ));
        assert!(matches!(
            classify_ret_code(110007, "insufficient margin"),
            Some(VenueError::Rejected { code: 110007, .. })
        ));
    }

    #[test]
    fn test_order_decode_camel_case() {
        let raw = serde_json::json!({
            "orderId": "v-1",
            "orderLinkId": "local-1",
            "symbol": "BTCUSDT",
            "side": "Buy",
            "orderStatus": "PartiallyFilled",
            "cumExecQty": "0.02",
            "avgPrice": "30010.5"
        });
        let o: VenueOrder = serde_json::from_value(raw).unwrap();
        assert_eq!(o.order_link_id, "local-1");
        assert_eq!(parse_f64(&o.cum_exec_qty), 0.02);
        assert_eq!(
            map_order_status(&o.order_status),
            Some(crate::exec::types::OrderStatus::PartiallyFilled)
        );
        assert_eq!(map_order_status("New"), None);
    }
}
