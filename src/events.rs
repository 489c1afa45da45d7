//! Stream envelope and typed payloads.
//!
//! Every bus record is one JSON envelope. Payloads are validated against
//! the closed schemas below; anything that fails to decode is pushed to
//! the DLQ by the consumer (and acked, so the group never wedges).
//! Unknown future fields ride along in `ext` and are never interpreted.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const SCHEMA_VERSION: u32 = 1;

// ─────────────────────────────────────────────────────────
// Topics
// ─────────────────────────────────────────────────────────

pub mod topic {
    pub const BAR_CLOSE: &str = "bar_close";
    pub const TRADE_PLAN: &str = "trade_plan";
    pub const EXECUTION_REPORT: &str = "execution_report";
    pub const RISK_EVENT: &str = "risk_event";
    pub const DLQ: &str = "dlq";
}

// ─────────────────────────────────────────────────────────
// Envelope
// ─────────────────────────────────────────────────────────

/// Common wrapper for every event on the bus. `event_id` is the unit of
/// idempotency: sinks insert by it and drop duplicates.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub event_id: String,
    pub ts_ms: i64,
    pub env: String,
    pub service: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<String>,
    pub schema_version: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<Value>,
    pub payload: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ext: Option<Value>,
}

impl Envelope {
    pub fn new(service: &str, env: &str, payload: Value) -> Self {
        Self {
            event_id: uuid::Uuid::new_v4().to_string(),
            ts_ms: crate::now_ms(),
            env: env.to_string(),
            service: service.to_string(),
            trace_id: None,
            schema_version: SCHEMA_VERSION,
            meta: None,
            payload,
            ext: None,
        }
    }

    /// Envelope whose id is derived from business state instead of drawn
    /// fresh. Re-emitting the same state change yields the same id, so the
    /// sink's insert-by-event_id suppresses the duplicate.
    pub fn with_id(event_id: String, service: &str, env: &str, payload: Value) -> Self {
        let mut e = Self::new(service, env, payload);
        e.event_id = event_id;
        e
    }
}

// ─────────────────────────────────────────────────────────
// Shared enums
// ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Timeframe {
    #[serde(rename = "15m")]
    M15,
    #[serde(rename = "30m")]
    M30,
    #[serde(rename = "1h")]
    H1,
    #[serde(rename = "4h")]
    H4,
    #[serde(rename = "8h")]
    H8,
    #[serde(rename = "1d")]
    D1,
}

impl Timeframe {
    pub fn as_str(self) -> &'static str {
        match self {
            Timeframe::M15 => "15m",
            Timeframe::M30 => "30m",
            Timeframe::H1 => "1h",
            Timeframe::H4 => "4h",
            Timeframe::H8 => "8h",
            Timeframe::D1 => "1d",
        }
    }

    pub fn duration_ms(self) -> i64 {
        match self {
            Timeframe::M15 => 15 * 60_000,
            Timeframe::M30 => 30 * 60_000,
            Timeframe::H1 => 3_600_000,
            Timeframe::H4 => 4 * 3_600_000,
            Timeframe::H8 => 8 * 3_600_000,
            Timeframe::D1 => 24 * 3_600_000,
        }
    }

    /// Mutex priority: 1d > 4h > 1h > everything else.
    pub fn priority(self) -> u8 {
        match self {
            Timeframe::D1 => 3,
            Timeframe::H4 => 2,
            Timeframe::H1 => 1,
            _ => 0,
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "15m" => Some(Timeframe::M15),
            "30m" => Some(Timeframe::M30),
            "1h" => Some(Timeframe::H1),
            "4h" => Some(Timeframe::H4),
            "8h" => Some(Timeframe::H8),
            "1d" => Some(Timeframe::D1),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PlanSide {
    Buy,
    Sell,
}

impl PlanSide {
    pub fn as_str(self) -> &'static str {
        match self {
            PlanSide::Buy => "BUY",
            PlanSide::Sell => "SELL",
        }
    }

    /// LONG for BUY, SHORT for SELL.
    pub fn bias(self) -> &'static str {
        match self {
            PlanSide::Buy => "LONG",
            PlanSide::Sell => "SHORT",
        }
    }
}

// ─────────────────────────────────────────────────────────
// bar_close
// ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Ohlcv {
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BarClose {
    pub symbol: String,
    pub timeframe: Timeframe,
    pub close_time_ms: i64,
    pub is_final: bool,
    pub source: String,
    pub ohlcv: Ohlcv,
    #[serde(default)]
    pub ext: HashMap<String, Value>,
}

// ─────────────────────────────────────────────────────────
// trade_plan
// ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TpRule {
    /// Target expressed as a multiple of R.
    pub r_multiple: f64,
    /// Share of total quantity closed at this target.
    pub qty_pct: f64,
    pub reduce_only: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunnerRule {
    pub qty_pct: f64,
    pub trail_mode: String,
    pub reduce_only: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradePlan {
    pub plan_id: String,
    pub idempotency_key: String,
    pub symbol: String,
    pub timeframe: Timeframe,
    pub side: PlanSide,
    pub entry_price: f64,
    pub primary_sl_price: f64,
    pub tp1: TpRule,
    pub tp2: TpRule,
    pub runner: RunnerRule,
    #[serde(default)]
    pub setup_id: Option<String>,
    #[serde(default)]
    pub trigger_id: Option<String>,
    pub status: String,
    pub valid_from_ms: i64,
    pub expires_at_ms: i64,
    /// MACD histogram at the entry bar, carried for the secondary-rule check.
    #[serde(default)]
    pub hist_entry: Option<f64>,
    #[serde(default)]
    pub ext: HashMap<String, Value>,
}

impl TradePlan {
    /// Per-unit risk. Zero distance is rejected upstream by sizing.
    pub fn unit_risk(&self) -> f64 {
        (self.entry_price - self.primary_sl_price).abs()
    }

    pub fn run_id(&self) -> Option<String> {
        self.ext.get("run_id").and_then(|v| v.as_str()).map(|s| s.to_string())
    }
}

// ─────────────────────────────────────────────────────────
// execution_report
// ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReportStatus {
    OrderSubmitted,
    OrderRejected,
    PartialFilled,
    Filled,
    TpHit,
    PrimarySlHit,
    SecondarySlExit,
    PositionClosed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionReport {
    pub plan_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub order_id: Option<String>,
    pub status: ReportStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filled_qty: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avg_price: Option<f64>,
    pub symbol: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeframe: Option<Timeframe>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latency_ms: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub slippage_bps: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_count: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fill_ratio: Option<f64>,
    #[serde(default)]
    pub ext: HashMap<String, Value>,
}

impl ExecutionReport {
    pub fn new(plan_id: &str, symbol: &str, status: ReportStatus) -> Self {
        Self {
            plan_id: plan_id.to_string(),
            order_id: None,
            status,
            reason: None,
            filled_qty: None,
            avg_price: None,
            symbol: symbol.to_string(),
            timeframe: None,
            latency_ms: None,
            slippage_bps: None,
            retry_count: None,
            fill_ratio: None,
            ext: HashMap::new(),
        }
    }

    pub fn with_ext(mut self, key: &str, value: Value) -> Self {
        self.ext.insert(key.to_string(), value);
        self
    }
}

// ─────────────────────────────────────────────────────────
// risk_event
// ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RiskEventType {
    RiskRejected,
    KillSwitchOn,
    DataGap,
    DataLag,
    WsReconnect,
    RateLimit,
    SignalConflict,
    IdempotencyConflict,
    PositionMutexBlocked,
    CooldownBlocked,
    MaxPositionsBlocked,
    SignalExpired,
    OrderTimeout,
    OrderPartialFill,
    OrderRetry,
    OrderFallbackMarket,
    OrderCancelled,
    ConsistencyDrift,
    BarDuplicate,
    PriceJump,
    VolumeAnomaly,
    ProcessingLag,
}

impl RiskEventType {
    /// Types that spam under a persistent condition get a per-(type, key)
    /// suppression window.
    pub fn is_windowed(self) -> bool {
        matches!(
            self,
            RiskEventType::ConsistencyDrift
                | RiskEventType::RateLimit
                | RiskEventType::DataLag
                | RiskEventType::KillSwitchOn
                | RiskEventType::BarDuplicate
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Severity {
    Info,
    Important,
    Critical,
    Emergency,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskEvent {
    #[serde(rename = "type")]
    pub kind: RiskEventType,
    pub severity: Severity,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub symbol: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_after_ms: Option<i64>,
    pub detail: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ext: Option<Value>,
}

impl RiskEvent {
    pub fn new(kind: RiskEventType, severity: Severity, detail: impl Into<String>) -> Self {
        Self {
            kind,
            severity,
            symbol: None,
            retry_after_ms: None,
            detail: detail.into(),
            ext: None,
        }
    }

    pub fn for_symbol(mut self, symbol: &str) -> Self {
        self.symbol = Some(symbol.to_string());
        self
    }
}

// ─────────────────────────────────────────────────────────
// DLQ
// ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DlqRecord {
    pub topic: String,
    pub stream_id: String,
    pub error: String,
    /// Original record body, verbatim.
    pub raw: String,
    pub ts_ms: i64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_timeframe_priority_ladder() {
        assert!(Timeframe::D1.priority() > Timeframe::H4.priority());
        assert!(Timeframe::H4.priority() > Timeframe::H1.priority());
        assert_eq!(Timeframe::M15.priority(), 0);
        assert_eq!(Timeframe::M30.priority(), 0);
        assert_eq!(Timeframe::H8.priority(), 0);
    }

    #[test]
    fn test_envelope_round_trip_preserves_ext() {
        let env = Envelope::new(
            "perp-executor",
            "dev",
            json!({"symbol": "BTCUSDT", "future_field": 42}),
        );
        let text = serde_json::to_string(&env).unwrap();
        let back: Envelope = serde_json::from_str(&text).unwrap();
        assert_eq!(back.event_id, env.event_id);
        assert_eq!(back.payload["future_field"], 42);
    }

    #[test]
    fn test_trade_plan_decodes_spec_shape() {
        let raw = json!({
            "plan_id": "pl-1",
            "idempotency_key": "ik-1",
            "symbol": "BTCUSDT",
            "timeframe": "1h",
            "side": "BUY",
            "entry_price": 30000.0,
            "primary_sl_price": 29000.0,
            "tp1": {"r_multiple": 1.0, "qty_pct": 0.4, "reduce_only": true},
            "tp2": {"r_multiple": 2.0, "qty_pct": 0.4, "reduce_only": true},
            "runner": {"qty_pct": 0.2, "trail_mode": "ATR", "reduce_only": true},
            "status": "ACTIVE",
            "valid_from_ms": 1,
            "expires_at_ms": 2,
            "ext": {"run_id": "r-9"}
        });
        let plan: TradePlan = serde_json::from_value(raw).unwrap();
        assert_eq!(plan.timeframe, Timeframe::H1);
        assert_eq!(plan.unit_risk(), 1000.0);
        assert_eq!(plan.run_id().as_deref(), Some("r-9"));
    }

    #[test]
    fn test_unknown_timeframe_is_rejected() {
        let raw = json!({
            "symbol": "BTCUSDT",
            "timeframe": "2h",
            "close_time_ms": 0,
            "is_final": true,
            "source": "ws",
            "ohlcv": {"open": 1.0, "high": 1.0, "low": 1.0, "close": 1.0, "volume": 0.0}
        });
        assert!(serde_json::from_value::<BarClose>(raw).is_err());
    }

    #[test]
    fn test_risk_event_type_serializes_screaming() {
        let ev = RiskEvent::new(RiskEventType::KillSwitchOn, Severity::Critical, "on");
        let v = serde_json::to_value(&ev).unwrap();
        assert_eq!(v["type"], "KILL_SWITCH_ON");
        assert_eq!(v["severity"], "CRITICAL");
    }
}
