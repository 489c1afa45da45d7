//! Core rows owned by the executor: positions, orders, fills, cooldowns,
//! daily risk state. These mirror the persisted tables one-to-one.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::events::{PlanSide, RiskEventType, Severity, Timeframe, TradePlan};

// ─────────────────────────────────────────────────────────
// Enums
// ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Bias {
    Long,
    Short,
}

impl Bias {
    pub fn from_side(side: PlanSide) -> Self {
        match side {
            PlanSide::Buy => Bias::Long,
            PlanSide::Sell => Bias::Short,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Bias::Long => "LONG",
            Bias::Short => "SHORT",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PositionStatus {
    Open,
    Closing,
    Closed,
    Failed,
}

impl PositionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            PositionStatus::Open => "OPEN",
            PositionStatus::Closing => "CLOSING",
            PositionStatus::Closed => "CLOSED",
            PositionStatus::Failed => "FAILED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "OPEN" => Some(PositionStatus::Open),
            "CLOSING" => Some(PositionStatus::Closing),
            "CLOSED" => Some(PositionStatus::Closed),
            "FAILED" => Some(PositionStatus::Failed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderPurpose {
    Entry,
    Tp1,
    Tp2,
    Exit,
    SlAdjust,
}

impl OrderPurpose {
    pub fn as_str(self) -> &'static str {
        match self {
            OrderPurpose::Entry => "ENTRY",
            OrderPurpose::Tp1 => "TP1",
            OrderPurpose::Tp2 => "TP2",
            OrderPurpose::Exit => "EXIT",
            OrderPurpose::SlAdjust => "SL_ADJUST",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "ENTRY" => Some(OrderPurpose::Entry),
            "TP1" => Some(OrderPurpose::Tp1),
            "TP2" => Some(OrderPurpose::Tp2),
            "EXIT" => Some(OrderPurpose::Exit),
            "SL_ADJUST" => Some(OrderPurpose::SlAdjust),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderStatus {
    New,
    Submitted,
    Filled,
    PartiallyFilled,
    Canceled,
    Failed,
}

impl OrderStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            OrderStatus::New => "NEW",
            OrderStatus::Submitted => "SUBMITTED",
            OrderStatus::Filled => "FILLED",
            OrderStatus::PartiallyFilled => "PARTIALLY_FILLED",
            OrderStatus::Canceled => "CANCELED",
            OrderStatus::Failed => "FAILED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "NEW" => Some(OrderStatus::New),
            "SUBMITTED" => Some(OrderStatus::Submitted),
            "FILLED" => Some(OrderStatus::Filled),
            "PARTIALLY_FILLED" => Some(OrderStatus::PartiallyFilled),
            "CANCELED" => Some(OrderStatus::Canceled),
            "FAILED" => Some(OrderStatus::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            OrderStatus::Filled | OrderStatus::Canceled | OrderStatus::Failed
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExitReason {
    PrimarySlHit,
    SecondarySlExit,
    StopLoss,
    ExchangeClosed,
    MutexUpgrade,
    EntryFailed,
    HardHaltExit,
}

impl ExitReason {
    pub fn as_str(self) -> &'static str {
        match self {
            ExitReason::PrimarySlHit => "PRIMARY_SL_HIT",
            ExitReason::SecondarySlExit => "SECONDARY_SL_EXIT",
            ExitReason::StopLoss => "STOP_LOSS",
            ExitReason::ExchangeClosed => "EXCHANGE_CLOSED",
            ExitReason::MutexUpgrade => "MUTEX_UPGRADE",
            ExitReason::EntryFailed => "ENTRY_FAILED",
            ExitReason::HardHaltExit => "HARD_HALT_EXIT",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "PRIMARY_SL_HIT" => Some(ExitReason::PrimarySlHit),
            "SECONDARY_SL_EXIT" => Some(ExitReason::SecondarySlExit),
            "STOP_LOSS" => Some(ExitReason::StopLoss),
            "EXCHANGE_CLOSED" => Some(ExitReason::ExchangeClosed),
            "MUTEX_UPGRADE" => Some(ExitReason::MutexUpgrade),
            "ENTRY_FAILED" => Some(ExitReason::EntryFailed),
            "HARD_HALT_EXIT" => Some(ExitReason::HardHaltExit),
            _ => None,
        }
    }

    /// Primary-stop exits write a cooldown row for the (symbol, side,
    /// timeframe); everything else does not.
    pub fn triggers_cooldown(self) -> bool {
        matches!(self, ExitReason::PrimarySlHit | ExitReason::StopLoss)
    }
}

// ─────────────────────────────────────────────────────────
// Rejection reasons (closed set, one per gate)
// ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RejectReason {
    KillSwitchOn,
    SignalExpired,
    RiskCircuitHalt,
    CooldownBlocked,
    MaxPositionsBlocked,
    PositionMutexBlocked,
    RateLimit,
    OrderValueTooSmall,
}

impl RejectReason {
    pub fn as_str(self) -> &'static str {
        match self {
            RejectReason::KillSwitchOn => "KILL_SWITCH_ON",
            RejectReason::SignalExpired => "SIGNAL_EXPIRED",
            RejectReason::RiskCircuitHalt => "RISK_CIRCUIT_HALT",
            RejectReason::CooldownBlocked => "COOLDOWN_BLOCKED",
            RejectReason::MaxPositionsBlocked => "MAX_POSITIONS_BLOCKED",
            RejectReason::PositionMutexBlocked => "POSITION_MUTEX_BLOCKED",
            RejectReason::RateLimit => "RATE_LIMIT",
            RejectReason::OrderValueTooSmall => "ORDER_VALUE_TOO_SMALL",
        }
    }

    pub fn risk_event_type(self) -> RiskEventType {
        match self {
            RejectReason::KillSwitchOn => RiskEventType::KillSwitchOn,
            RejectReason::SignalExpired => RiskEventType::SignalExpired,
            RejectReason::CooldownBlocked => RiskEventType::CooldownBlocked,
            RejectReason::MaxPositionsBlocked => RiskEventType::MaxPositionsBlocked,
            RejectReason::PositionMutexBlocked => RiskEventType::PositionMutexBlocked,
            RejectReason::RateLimit => RiskEventType::RateLimit,
            RejectReason::RiskCircuitHalt | RejectReason::OrderValueTooSmall => {
                RiskEventType::RiskRejected
            }
        }
    }

    pub fn severity(self) -> Severity {
        match self {
            RejectReason::KillSwitchOn | RejectReason::RiskCircuitHalt => Severity::Critical,
            RejectReason::RateLimit => Severity::Info,
            _ => Severity::Important,
        }
    }
}

// ─────────────────────────────────────────────────────────
// Position
// ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PositionMeta {
    #[serde(default)]
    pub tp1_filled: bool,
    #[serde(default)]
    pub tp2_filled: bool,
    /// Quantity at open, before TP reductions. TP shares are computed
    /// against this, not the shrinking remainder.
    #[serde(default)]
    pub original_qty: f64,
    #[serde(default)]
    pub tp1_price: f64,
    #[serde(default)]
    pub tp2_price: f64,
    #[serde(default)]
    pub tp1_qty: f64,
    #[serde(default)]
    pub tp2_qty: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plan_id: Option<String>,
    /// Latest position snapshot from the private WS, verbatim.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ws_position: Option<Value>,
}

#[derive(Debug, Clone)]
pub struct Position {
    pub position_id: String,
    pub idempotency_key: String,
    pub symbol: String,
    pub timeframe: Timeframe,
    pub side: PlanSide,
    pub bias: Bias,
    pub qty_total: f64,
    pub qty_runner: f64,
    pub entry_price: f64,
    pub primary_sl_price: f64,
    /// Effective stop right now: primary → break-even → runner trail.
    pub current_stop_price: f64,
    pub runner_stop_price: Option<f64>,
    pub status: PositionStatus,
    pub entry_close_time_ms: i64,
    pub opened_at_ms: i64,
    pub closed_at_ms: Option<i64>,
    pub exit_reason: Option<ExitReason>,
    pub hist_entry: Option<f64>,
    pub meta: PositionMeta,
}

impl Position {
    /// Build the row opened for an admitted plan. TP prices are fixed at
    /// entry ± R-multiples of the plan's unit risk.
    pub fn open_from_plan(plan: &TradePlan, qty_total: f64, opened_at_ms: i64) -> Self {
        let r = plan.unit_risk();
        let dir = match plan.side {
            PlanSide::Buy => 1.0,
            PlanSide::Sell => -1.0,
        };
        let tp1_price = plan.entry_price + dir * plan.tp1.r_multiple * r;
        let tp2_price = plan.entry_price + dir * plan.tp2.r_multiple * r;
        let qty_runner = round_qty(qty_total * plan.runner.qty_pct);

        Self {
            position_id: uuid::Uuid::new_v4().to_string(),
            idempotency_key: plan.idempotency_key.clone(),
            symbol: plan.symbol.clone(),
            timeframe: plan.timeframe,
            side: plan.side,
            bias: Bias::from_side(plan.side),
            qty_total,
            qty_runner,
            entry_price: plan.entry_price,
            primary_sl_price: plan.primary_sl_price,
            current_stop_price: plan.primary_sl_price,
            runner_stop_price: None,
            status: PositionStatus::Open,
            entry_close_time_ms: plan.valid_from_ms,
            opened_at_ms,
            closed_at_ms: None,
            exit_reason: None,
            hist_entry: plan.hist_entry,
            meta: PositionMeta {
                original_qty: qty_total,
                tp1_price,
                tp2_price,
                tp1_qty: round_qty(qty_total * plan.tp1.qty_pct),
                tp2_qty: round_qty(qty_total * plan.tp2.qty_pct),
                run_id: plan.run_id(),
                plan_id: Some(plan.plan_id.clone()),
                ..Default::default()
            },
        }
    }

    pub fn is_long(&self) -> bool {
        self.bias == Bias::Long
    }

    /// Signed PnL in quote currency for closing `qty` at `price`.
    pub fn pnl(&self, qty: f64, price: f64) -> f64 {
        let dir = if self.is_long() { 1.0 } else { -1.0 };
        qty * (price - self.entry_price) * dir
    }

    /// Runner trailing is armed once TP2 has filled.
    pub fn runner_active(&self) -> bool {
        self.meta.tp2_filled
    }

    /// Plan id for reports; falls back to the idempotency key for rows
    /// persisted before the plan id was carried in meta.
    pub fn plan_id(&self) -> &str {
        self.meta.plan_id.as_deref().unwrap_or(&self.idempotency_key)
    }
}

/// Venue lot rounding. Quantities go to the wire with 3 decimals (linear
/// USDT perps), so everything internal rounds the same way.
pub fn round_qty(qty: f64) -> f64 {
    (qty * 1_000.0).round() / 1_000.0
}

// ─────────────────────────────────────────────────────────
// Order / Fill
// ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderType {
    Market,
    Limit,
}

impl OrderType {
    pub fn as_str(self) -> &'static str {
        match self {
            OrderType::Market => "Market",
            OrderType::Limit => "Limit",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "Market" => Some(OrderType::Market),
            "Limit" => Some(OrderType::Limit),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Order {
    pub order_id: String,
    pub idempotency_key: String,
    pub purpose: OrderPurpose,
    pub side: PlanSide,
    pub order_type: OrderType,
    pub qty: f64,
    pub price: Option<f64>,
    pub reduce_only: bool,
    pub status: OrderStatus,
    pub venue_order_id: Option<String>,
    pub filled_qty: f64,
    pub avg_price: Option<f64>,
    pub submitted_at_ms: i64,
    pub retry_count: u32,
    pub last_fill_at_ms: Option<i64>,
    pub payload: Value,
}

impl Order {
    pub fn new(
        idempotency_key: &str,
        purpose: OrderPurpose,
        side: PlanSide,
        order_type: OrderType,
        qty: f64,
        price: Option<f64>,
        reduce_only: bool,
        now_ms: i64,
    ) -> Self {
        Self {
            order_id: uuid::Uuid::new_v4().to_string(),
            idempotency_key: idempotency_key.to_string(),
            purpose,
            side,
            order_type,
            qty,
            price,
            reduce_only,
            status: OrderStatus::New,
            venue_order_id: None,
            filled_qty: 0.0,
            avg_price: None,
            submitted_at_ms: now_ms,
            retry_count: 0,
            last_fill_at_ms: None,
            payload: Value::Null,
        }
    }

    pub fn remaining_qty(&self) -> f64 {
        (self.qty - self.filled_qty).max(0.0)
    }
}

#[derive(Debug, Clone)]
pub struct Fill {
    pub fill_id: String,
    pub order_id: String,
    pub symbol: String,
    pub purpose: OrderPurpose,
    pub side: PlanSide,
    pub exec_qty: f64,
    pub exec_price: f64,
    pub fee: f64,
    pub exec_time_ms: i64,
    pub venue_exec_id: String,
}

// ─────────────────────────────────────────────────────────
// Cooldown / RiskState / snapshots
// ─────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct Cooldown {
    pub symbol: String,
    pub side: PlanSide,
    pub timeframe: Timeframe,
    pub reason: String,
    pub until_ts_ms: i64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RiskStateMeta {
    #[serde(default)]
    pub consecutive_loss_count: u32,
}

#[derive(Debug, Clone)]
pub struct RiskState {
    pub trade_date: chrono::NaiveDate,
    pub starting_equity: f64,
    pub current_equity: f64,
    pub min_equity: f64,
    pub max_equity: f64,
    pub drawdown_pct: f64,
    pub soft_halt: bool,
    pub hard_halt: bool,
    pub kill_switch: bool,
    pub meta: RiskStateMeta,
}

impl RiskState {
    pub fn fresh(trade_date: chrono::NaiveDate, equity: f64) -> Self {
        Self {
            trade_date,
            starting_equity: equity,
            current_equity: equity,
            min_equity: equity,
            max_equity: equity,
            drawdown_pct: 0.0,
            soft_halt: false,
            hard_halt: false,
            kill_switch: false,
            meta: RiskStateMeta::default(),
        }
    }

    pub fn halted(&self) -> bool {
        self.soft_halt || self.hard_halt || self.kill_switch
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapshotSource {
    Ws,
    Rest,
}

impl SnapshotSource {
    pub fn as_str(self) -> &'static str {
        match self {
            SnapshotSource::Ws => "WS",
            SnapshotSource::Rest => "REST",
        }
    }
}

#[derive(Debug, Clone)]
pub struct WalletSnapshot {
    pub source: SnapshotSource,
    pub equity: f64,
    pub available: f64,
    pub ts_ms: i64,
    pub raw: Value,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{RunnerRule, TpRule};
    use std::collections::HashMap;

    fn plan() -> TradePlan {
        TradePlan {
            plan_id: "pl-1".into(),
            idempotency_key: "ik-1".into(),
            symbol: "BTCUSDT".into(),
            timeframe: Timeframe::H1,
            side: PlanSide::Buy,
            entry_price: 30_000.0,
            primary_sl_price: 29_000.0,
            tp1: TpRule { r_multiple: 1.0, qty_pct: 0.4, reduce_only: true },
            tp2: TpRule { r_multiple: 2.0, qty_pct: 0.4, reduce_only: true },
            runner: RunnerRule { qty_pct: 0.2, trail_mode: "ATR".into(), reduce_only: true },
            setup_id: None,
            trigger_id: None,
            status: "ACTIVE".into(),
            valid_from_ms: 1,
            expires_at_ms: i64::MAX,
            hist_entry: None,
            ext: HashMap::new(),
        }
    }

    #[test]
    fn test_open_from_plan_targets_and_runner_share() {
        let p = Position::open_from_plan(&plan(), 0.05, 123);
        assert_eq!(p.meta.tp1_price, 31_000.0);
        assert_eq!(p.meta.tp2_price, 32_000.0);
        assert_eq!(p.meta.tp1_qty, 0.02);
        assert_eq!(p.meta.tp2_qty, 0.02);
        assert_eq!(p.qty_runner, 0.01);
        assert_eq!(p.current_stop_price, 29_000.0);
        assert_eq!(p.status, PositionStatus::Open);
        assert!(p.qty_runner <= p.qty_total);
    }

    #[test]
    fn test_short_targets_mirror() {
        let mut pl = plan();
        pl.side = PlanSide::Sell;
        pl.primary_sl_price = 31_000.0;
        let p = Position::open_from_plan(&pl, 0.05, 123);
        assert_eq!(p.bias, Bias::Short);
        assert_eq!(p.meta.tp1_price, 29_000.0);
        assert_eq!(p.meta.tp2_price, 28_000.0);
    }

    #[test]
    fn test_pnl_sign() {
        let p = Position::open_from_plan(&plan(), 0.05, 123);
        assert_eq!(p.pnl(0.05, 29_000.0), -50.0);
        assert_eq!(p.pnl(0.02, 31_000.0), 20.0);
    }

    #[test]
    fn test_exit_reason_cooldown_rule() {
        assert!(ExitReason::PrimarySlHit.triggers_cooldown());
        assert!(ExitReason::StopLoss.triggers_cooldown());
        assert!(!ExitReason::SecondarySlExit.triggers_cooldown());
        assert!(!ExitReason::ExchangeClosed.triggers_cooldown());
    }
}
