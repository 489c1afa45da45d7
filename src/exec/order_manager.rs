//! Entry-order manager: timeout / partial-stall handling for Limit entry
//! orders with a cancel → reprice → resubmit ladder and a final
//! market-IOC fallback. Market entries bypass this loop entirely.
//!
//! The decision is a pure function of the order row and the clock; the
//! loop applies decisions against the venue and converges through the
//! same DB rows the WS ingest and reconciliation update.

use std::time::Duration;

use anyhow::Result;
use serde_json::json;
use tracing::{info, warn};

use crate::config::Settings;
use crate::events::{
    ExecutionReport, ReportStatus, RiskEvent, RiskEventType, Severity,
};
use crate::exec::types::{
    ExitReason, Order, OrderPurpose, OrderStatus, OrderType, Position, PositionStatus,
};
use crate::exec::{emit_report, emit_risk, report_id};
use crate::Ctx;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum EntryDecision {
    Wait,
    Reprice { new_price: f64 },
    FallbackMarket,
    Fail,
}

/// Nudge a limit price toward the market by `bps`: BUY bids up, SELL
/// offers down.
pub fn reprice_toward_market(price: f64, is_buy: bool, bps: f64) -> f64 {
    let factor = bps / 10_000.0;
    if is_buy {
        price * (1.0 + factor)
    } else {
        price * (1.0 - factor)
    }
}

pub fn decide_entry(order: &Order, now_ms: i64, cfg: &Settings) -> EntryDecision {
    if order.purpose != OrderPurpose::Entry
        || order.order_type != OrderType::Limit
        || order.status.is_terminal()
        || order.status == OrderStatus::New
    {
        return EntryDecision::Wait;
    }

    let unfilled_timeout =
        order.filled_qty == 0.0 && now_ms - order.submitted_at_ms > cfg.entry_timeout_ms;
    let partial_stall = order.filled_qty > 0.0
        && now_ms - order.last_fill_at_ms.unwrap_or(order.submitted_at_ms)
            > cfg.entry_partial_fill_timeout_ms;

    if !unfilled_timeout && !partial_stall {
        return EntryDecision::Wait;
    }

    if order.retry_count < cfg.entry_max_retries {
        let base = order.price.unwrap_or(0.0);
        return EntryDecision::Reprice {
            new_price: reprice_toward_market(
                base,
                order.side == crate::events::PlanSide::Buy,
                cfg.entry_reprice_bps,
            ),
        };
    }
    if cfg.entry_fallback_market {
        return EntryDecision::FallbackMarket;
    }
    EntryDecision::Fail
}

// ─────────────────────────────────────────────────────────
// Loop
// ─────────────────────────────────────────────────────────

pub struct OrderManager {
    ctx: Ctx,
}

impl OrderManager {
    pub fn new(ctx: Ctx) -> Self {
        Self { ctx }
    }

    pub async fn run(self) {
        info!("⏱️ order manager started");
        let mut shutdown = self.ctx.shutdown.clone();
        let mut tick = tokio::time::interval(Duration::from_secs(2));
        loop {
            tokio::select! {
                _ = tick.tick() => {
                    if let Err(e) = self.sweep().await {
                        warn!("⏱️ order manager sweep failed: {e:#}");
                    }
                }
                _ = shutdown.changed() => break,
            }
        }
        info!("⏱️ order manager shutting down");
    }

    async fn sweep(&self) -> Result<()> {
        let entries = self.ctx.store.live_entry_orders().await?;
        for order in entries {
            let Some(position) = self
                .ctx
                .store
                .position_by_key(&order.idempotency_key)
                .await?
            else {
                continue;
            };
            let lock = self.ctx.pos_locks.for_position(&position.position_id).await;
            let _guard = lock.lock().await;

            // Re-read under the lock: WS ingest may have converged it.
            let Some(order) = self
                .ctx
                .store
                .order_for(&order.idempotency_key, OrderPurpose::Entry)
                .await?
            else {
                continue;
            };
            self.handle_entry(&position, order).await?;
        }
        Ok(())
    }

    /// Shared with reconciliation: drive one entry order through the
    /// timeout ladder.
    pub async fn handle_entry(&self, position: &Position, mut order: Order) -> Result<()> {
        let decision = decide_entry(&order, crate::now_ms(), &self.ctx.cfg);
        if decision == EntryDecision::Wait {
            return Ok(());
        }

        if order.filled_qty > 0.0 {
            emit_risk(
                &self.ctx,
                &RiskEvent::new(
                    RiskEventType::OrderPartialFill,
                    Severity::Important,
                    format!(
                        "entry stalled at {}/{} on {}",
                        order.filled_qty, order.qty, position.symbol
                    ),
                )
                .for_symbol(&position.symbol),
                &position.symbol,
            )
            .await?;
        }

        // Step 1: cancel the working order. "Already filled" races are
        // converged from venue state instead of treated as failures.
        if let Some(venue) = &self.ctx.venue {
            if let Some(venue_id) = order.venue_order_id.clone() {
                if let Err(e) = venue.cancel_order(&position.symbol, &venue_id).await {
                    warn!("⏱️ cancel {} failed: {e}", venue_id);
                    if self.converge_from_venue(position, &mut order).await? {
                        return Ok(()); // turned out filled
                    }
                }
            }
        }

        match decision {
            EntryDecision::Wait => {}
            EntryDecision::Reprice { new_price } => {
                self.apply_reprice(position, order, new_price).await?;
            }
            EntryDecision::FallbackMarket => {
                self.apply_fallback(position, order).await?;
            }
            EntryDecision::Fail => {
                self.apply_fail(position, order).await?;
            }
        }
        Ok(())
    }

    /// Cancel raced a fill: re-query executions and converge the order
    /// row. Returns true when the order is actually complete.
    async fn converge_from_venue(&self, position: &Position, order: &mut Order) -> Result<bool> {
        let Some(venue) = &self.ctx.venue else { return Ok(false) };
        let execs = match venue
            .execution_list(&position.symbol, order.submitted_at_ms)
            .await
        {
            Ok(execs) => execs,
            Err(e) => {
                warn!("⏱️ execution re-query failed: {e}");
                return Ok(false);
            }
        };

        let venue_id = order.venue_order_id.clone().unwrap_or_default();
        for ex in execs.iter().filter(|ex| ex.order_id == venue_id) {
            let fill = crate::exec::types::Fill {
                fill_id: uuid::Uuid::new_v4().to_string(),
                order_id: order.order_id.clone(),
                symbol: position.symbol.clone(),
                purpose: OrderPurpose::Entry,
                side: order.side,
                exec_qty: crate::bybit::types::parse_f64(&ex.exec_qty),
                exec_price: crate::bybit::types::parse_f64(&ex.exec_price),
                fee: crate::bybit::types::parse_f64(&ex.exec_fee),
                exec_time_ms: ex.exec_time.parse().unwrap_or_else(|_| crate::now_ms()),
                venue_exec_id: ex.exec_id.clone(),
            };
            self.ctx.store.insert_fill(&fill).await?;
        }

        let (qty, vwap) = self.ctx.store.fill_aggregate(&order.order_id).await?;
        order.filled_qty = qty;
        order.avg_price = vwap;
        if qty + 1e-12 >= order.qty {
            order.status = OrderStatus::Filled;
            self.ctx.store.upsert_order(&order).await?;
            emit_report(
                &self.ctx,
                &report_id(&order.idempotency_key, "ENTRY_FILLED"),
                &ExecutionReport {
                    order_id: Some(order.order_id.clone()),
                    filled_qty: Some(qty),
                    avg_price: vwap,
                    ..ExecutionReport::new(
                        &order.idempotency_key,
                        &position.symbol,
                        ReportStatus::Filled,
                    )
                },
            )
            .await?;
            return Ok(true);
        }
        self.ctx.store.upsert_order(&order).await?;
        Ok(false)
    }

    async fn apply_reprice(
        &self,
        position: &Position,
        mut order: Order,
        new_price: f64,
    ) -> Result<()> {
        let remaining = order.remaining_qty();
        let now = crate::now_ms();
        order.retry_count += 1;
        order.price = Some(new_price);
        order.qty = order.filled_qty + remaining;
        order.status = OrderStatus::Submitted;
        order.submitted_at_ms = now;

        if let Some(venue) = &self.ctx.venue {
            let req = crate::bybit::types::OrderCreateRequest {
                category: "linear".into(),
                symbol: position.symbol.clone(),
                side: match order.side {
                    crate::events::PlanSide::Buy => "Buy".into(),
                    crate::events::PlanSide::Sell => "Sell".into(),
                },
                order_type: "Limit".into(),
                qty: crate::bybit::rest::fmt_decimal(remaining, 3),
                price: Some(crate::bybit::rest::fmt_decimal(new_price, 4)),
                time_in_force: "GTC".into(),
                reduce_only: None,
                order_link_id: format!("{}-r{}", order.order_id, order.retry_count),
            };
            match venue.create_order(&req).await {
                Ok(res) => order.venue_order_id = Some(res.order_id),
                Err(e) => {
                    warn!("⏱️ reprice submit failed: {e}");
                    return self.apply_fail(position, order).await;
                }
            }
        }
        self.ctx.store.upsert_order(&order).await?;

        info!(
            "🔁 entry repriced {} → {:.4} (retry {})",
            position.symbol, new_price, order.retry_count
        );
        emit_risk(
            &self.ctx,
            &RiskEvent::new(
                RiskEventType::OrderRetry,
                Severity::Important,
                format!("entry repriced to {new_price} (retry {})", order.retry_count),
            )
            .for_symbol(&position.symbol),
            &position.symbol,
        )
        .await?;
        emit_report(
            &self.ctx,
            &report_id(
                &order.idempotency_key,
                &format!("ENTRY_RETRY_{}", order.retry_count),
            ),
            &ExecutionReport {
                order_id: Some(order.order_id.clone()),
                reason: Some("ORDER_RETRY".into()),
                retry_count: Some(order.retry_count),
                avg_price: order.avg_price,
                filled_qty: Some(order.filled_qty),
                ..ExecutionReport::new(
                    &order.idempotency_key,
                    &position.symbol,
                    ReportStatus::OrderSubmitted,
                )
            },
        )
        .await
    }

    async fn apply_fallback(&self, position: &Position, mut order: Order) -> Result<()> {
        let remaining = order.remaining_qty();
        let now = crate::now_ms();
        order.order_type = OrderType::Market;
        order.price = None;
        order.status = OrderStatus::Submitted;
        order.submitted_at_ms = now;

        if let Some(venue) = &self.ctx.venue {
            let req = crate::bybit::types::OrderCreateRequest {
                category: "linear".into(),
                symbol: position.symbol.clone(),
                side: match order.side {
                    crate::events::PlanSide::Buy => "Buy".into(),
                    crate::events::PlanSide::Sell => "Sell".into(),
                },
                order_type: "Market".into(),
                qty: crate::bybit::rest::fmt_decimal(remaining, 3),
                price: None,
                time_in_force: "IOC".into(),
                reduce_only: None,
                order_link_id: format!("{}-mkt", order.order_id),
            };
            match venue.create_order(&req).await {
                Ok(res) => order.venue_order_id = Some(res.order_id),
                Err(e) => {
                    warn!("⏱️ market fallback submit failed: {e}");
                    return self.apply_fail(position, order).await;
                }
            }
        }
        self.ctx.store.upsert_order(&order).await?;

        info!("🚨 entry fallback to market on {}", position.symbol);
        emit_risk(
            &self.ctx,
            &RiskEvent::new(
                RiskEventType::OrderFallbackMarket,
                Severity::Important,
                format!("entry fell back to market IOC for {remaining}"),
            )
            .for_symbol(&position.symbol),
            &position.symbol,
        )
        .await?;
        emit_report(
            &self.ctx,
            &report_id(&order.idempotency_key, "ENTRY_FALLBACK_MARKET"),
            &ExecutionReport {
                order_id: Some(order.order_id.clone()),
                reason: Some("ORDER_FALLBACK_MARKET".into()),
                retry_count: Some(order.retry_count),
                ..ExecutionReport::new(
                    &order.idempotency_key,
                    &position.symbol,
                    ReportStatus::OrderSubmitted,
                )
            },
        )
        .await
    }

    /// Terminal: entry could not be established. Cancel sibling TPs and
    /// close the position as failed.
    async fn apply_fail(&self, position: &Position, mut order: Order) -> Result<()> {
        order.status = OrderStatus::Failed;
        self.ctx.store.upsert_order(&order).await?;

        if let Some(venue) = &self.ctx.venue {
            for purpose in [OrderPurpose::Tp1, OrderPurpose::Tp2] {
                if let Some(tp) = self.ctx.store.order_for(&order.idempotency_key, purpose).await? {
                    if let Some(venue_id) = &tp.venue_order_id {
                        if !tp.status.is_terminal() {
                            let _ = venue.cancel_order(&position.symbol, venue_id).await;
                        }
                    }
                }
            }
        }

        let mut position = position.clone();
        position.status = PositionStatus::Failed;
        position.closed_at_ms = Some(crate::now_ms());
        position.exit_reason = Some(ExitReason::EntryFailed);
        self.ctx.store.update_position(&position).await?;

        warn!("❌ entry failed terminally on {}", position.symbol);
        emit_risk(
            &self.ctx,
            &RiskEvent::new(
                RiskEventType::OrderTimeout,
                Severity::Important,
                "entry timed out with retries exhausted and no fallback",
            )
            .for_symbol(&position.symbol),
            &position.symbol,
        )
        .await?;
        emit_report(
            &self.ctx,
            &report_id(&order.idempotency_key, "ENTRY_FAILED"),
            &ExecutionReport {
                order_id: Some(order.order_id.clone()),
                reason: Some("ENTRY_FAILED".into()),
                retry_count: Some(order.retry_count),
                ext: [(
                    "exit_reason".to_string(),
                    json!(ExitReason::EntryFailed.as_str()),
                )]
                .into_iter()
                .collect(),
                ..ExecutionReport::new(
                    &order.idempotency_key,
                    &position.symbol,
                    ReportStatus::PositionClosed,
                )
            },
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::PlanSide;

    fn cfg() -> Settings {
        Settings::from_env().unwrap()
    }

    fn limit_entry(submitted_at_ms: i64) -> Order {
        let mut o = Order::new(
            "ik",
            OrderPurpose::Entry,
            PlanSide::Buy,
            OrderType::Limit,
            0.05,
            Some(30_000.0),
            false,
            submitted_at_ms,
        );
        o.status = OrderStatus::Submitted;
        o
    }

    #[test]
    fn test_fresh_order_waits() {
        let o = limit_entry(1_000_000);
        assert_eq!(decide_entry(&o, 1_010_000, &cfg()), EntryDecision::Wait);
    }

    #[test]
    fn test_timeout_reprices_buy_upward() {
        let o = limit_entry(1_000_000);
        // 16 s later, 0 filled → reprice +5 bps toward the market.
        match decide_entry(&o, 1_016_000, &cfg()) {
            EntryDecision::Reprice { new_price } => {
                assert!((new_price - 30_015.0).abs() < 1e-9, "got {new_price}")
            }
            other => panic!("expected reprice, got {other:?}"),
        }
    }

    #[test]
    fn test_sell_reprices_downward() {
        let mut o = limit_entry(1_000_000);
        o.side = PlanSide::Sell;
        match decide_entry(&o, 1_016_000, &cfg()) {
            EntryDecision::Reprice { new_price } => assert!(new_price < 30_000.0),
            other => panic!("expected reprice, got {other:?}"),
        }
    }

    #[test]
    fn test_retries_exhausted_falls_back_to_market() {
        let mut o = limit_entry(1_000_000);
        o.retry_count = cfg().entry_max_retries;
        assert_eq!(decide_entry(&o, 1_016_000, &cfg()), EntryDecision::FallbackMarket);
    }

    #[test]
    fn test_no_fallback_means_fail() {
        let mut c = cfg();
        c.entry_fallback_market = false;
        let mut o = limit_entry(1_000_000);
        o.retry_count = c.entry_max_retries;
        assert_eq!(decide_entry(&o, 1_016_000, &c), EntryDecision::Fail);
    }

    #[test]
    fn test_partial_fill_uses_stall_timeout() {
        let mut o = limit_entry(1_000_000);
        o.filled_qty = 0.02;
        o.last_fill_at_ms = Some(1_010_000);
        // 15 s after submit but only 9 s after the last fill: still fine.
        assert_eq!(decide_entry(&o, 1_019_000, &cfg()), EntryDecision::Wait);
        // 21 s after the last fill: stalled.
        assert!(matches!(
            decide_entry(&o, 1_031_000, &cfg()),
            EntryDecision::Reprice { .. }
        ));
    }

    #[test]
    fn test_market_orders_bypass() {
        let mut o = limit_entry(1_000_000);
        o.order_type = OrderType::Market;
        assert_eq!(decide_entry(&o, 2_000_000, &cfg()), EntryDecision::Wait);
    }

    #[test]
    fn test_terminal_orders_ignored() {
        let mut o = limit_entry(1_000_000);
        o.status = OrderStatus::Filled;
        assert_eq!(decide_entry(&o, 2_000_000, &cfg()), EntryDecision::Wait);
    }

    #[test]
    fn test_s5_ladder() {
        // max_retries=1, fallback on: timeout → reprice once → timeout →
        // market fallback.
        let mut c = cfg();
        c.entry_max_retries = 1;
        c.entry_fallback_market = true;

        let o = limit_entry(0);
        let d1 = decide_entry(&o, 16_000, &c);
        let new_price = match d1 {
            EntryDecision::Reprice { new_price } => new_price,
            other => panic!("expected reprice, got {other:?}"),
        };

        let mut o2 = o.clone();
        o2.retry_count = 1;
        o2.price = Some(new_price);
        o2.submitted_at_ms = 16_000;
        assert_eq!(decide_entry(&o2, 32_100, &c), EntryDecision::FallbackMarket);
    }
}
