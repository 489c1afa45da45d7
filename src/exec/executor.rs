//! Trade-plan consumer: idempotency lock → gate pipeline → sizing →
//! position open → entry + stop + TP placement.
//!
//! Every failure mode acks the message: rejections produce a typed risk
//! event plus an ORDER_REJECTED report, poison messages go to the DLQ,
//! and duplicates are dropped silently under the plan lock.

use std::time::Duration;

use anyhow::{Context, Result};
use serde_json::json;
use tracing::{debug, info, warn};

use crate::bybit::types::{OrderCreateRequest, VenueError};
use crate::config::EntryOrderType;
use crate::events::{
    topic, ExecutionReport, PlanSide, ReportStatus, RiskEvent, RiskEventType, TradePlan,
};
use crate::exec::gates::{self, Admission, GateContext, MutexPeer};
use crate::exec::sizing::{self, LotFilter};
use crate::exec::types::{
    ExitReason, Fill, Order, OrderPurpose, OrderStatus, OrderType, Position, PositionStatus,
    RejectReason,
};
use crate::exec::{emit_report, emit_risk, kill_switch_on, report_id, risk_state};
use crate::store::risk::FLAG_KILL_SWITCH;
use crate::Ctx;

pub struct PlanExecutor {
    ctx: Ctx,
}

impl PlanExecutor {
    pub fn new(ctx: Ctx) -> Self {
        Self { ctx }
    }

    pub async fn run(self) {
        info!("🧭 plan executor started (mode={:?})", self.ctx.cfg.mode);
        let cfg = &self.ctx.cfg;
        if let Err(e) = self.ctx.bus.ensure_group(topic::TRADE_PLAN, &cfg.bus_group).await {
            warn!("🧭 ensure_group failed: {e:#}");
        }

        let mut shutdown = self.ctx.shutdown.clone();
        loop {
            if *shutdown.borrow() {
                break;
            }
            let batch = tokio::select! {
                res = self.ctx.bus.consume(
                    topic::TRADE_PLAN,
                    &cfg.bus_group,
                    &cfg.bus_consumer,
                    cfg.bus_batch,
                    cfg.bus_block_ms,
                ) => match res {
                    Ok(batch) => batch,
                    Err(e) => {
                        warn!("🧭 consume failed: {e:#}");
                        tokio::time::sleep(Duration::from_secs(2)).await;
                        continue;
                    }
                },
                _ = shutdown.changed() => break,
            };

            for record in batch {
                let envelope = match record.envelope {
                    Ok(env) => env,
                    Err(e) => {
                        let _ = self
                            .ctx
                            .bus
                            .dead_letter(
                                topic::TRADE_PLAN,
                                &cfg.bus_group,
                                &record.stream_id,
                                &record.raw,
                                &format!("envelope decode: {e}"),
                            )
                            .await;
                        continue;
                    }
                };

                let plan = match serde_json::from_value::<TradePlan>(envelope.payload.clone()) {
                    Ok(plan) => plan,
                    Err(e) => {
                        let _ = self
                            .ctx
                            .bus
                            .dead_letter(
                                topic::TRADE_PLAN,
                                &cfg.bus_group,
                                &record.stream_id,
                                &record.raw,
                                &format!("trade_plan schema: {e}"),
                            )
                            .await;
                        continue;
                    }
                };

                match self.process_plan(&plan).await {
                    Ok(()) => {
                        let _ = self
                            .ctx
                            .bus
                            .ack(topic::TRADE_PLAN, &cfg.bus_group, &record.stream_id)
                            .await;
                    }
                    Err(e) => {
                        // Unexpected processing error: the loop must not
                        // wedge on this message.
                        warn!("🧭 plan {} failed: {e:#}", plan.plan_id);
                        let _ = self
                            .ctx
                            .bus
                            .dead_letter(
                                topic::TRADE_PLAN,
                                &cfg.bus_group,
                                &record.stream_id,
                                &record.raw,
                                &format!("{e:#}"),
                            )
                            .await;
                    }
                }
            }
        }
        info!("🧭 plan executor shutting down");
    }

    async fn process_plan(&self, plan: &TradePlan) -> Result<()> {
        // Gate 1: distributed idempotency lock. Holding means another
        // delivery of this plan is (or was) being processed.
        if !self.ctx.locks.acquire(&plan.idempotency_key).await? {
            debug!("🧭 duplicate plan {} — lock held, ack", plan.idempotency_key);
            return Ok(());
        }
        if self.ctx.store.position_by_key(&plan.idempotency_key).await?.is_some() {
            debug!("🧭 duplicate plan {} — position exists, ack", plan.idempotency_key);
            return Ok(());
        }

        let gate_ctx = self.gather_context(plan).await?;
        match gates::admit(plan, &gate_ctx) {
            Admission::Reject { reason, detail } => {
                return self.reject(plan, reason, detail).await;
            }
            Admission::UpgradeThenAdmit { displace } => {
                for position_id in displace {
                    let Some(existing) = self.ctx.store.position_by_id(&position_id).await? else {
                        continue;
                    };
                    let completed = self
                        .force_exit(existing, ExitReason::MutexUpgrade)
                        .await
                        .context("mutex upgrade exit")?;
                    if !completed {
                        // Exit did not complete within the tick: do not
                        // overlap, reject the incoming plan instead.
                        return self
                            .reject(
                                plan,
                                RejectReason::PositionMutexBlocked,
                                json!({ "pending_exit": position_id }),
                            )
                            .await;
                    }
                }
            }
            Admission::Admit => {}
        }

        let equity = self.current_equity().await?;
        let lot = self.lot_filter(&plan.symbol).await;
        let qty = match sizing::size_position(plan, equity, &self.ctx.cfg, lot) {
            Ok(qty) => qty,
            Err((reason, detail)) => {
                return self.reject(plan, reason, json!({ "detail": detail })).await;
            }
        };

        self.open_position(plan, qty).await
    }

    // ─────────────────────────────────────────────────
    // Context gathering
    // ─────────────────────────────────────────────────

    async fn gather_context(&self, plan: &TradePlan) -> Result<GateContext> {
        let now = crate::now_ms();
        let cfg = &self.ctx.cfg;

        let persisted_kill = matches!(
            self.ctx.store.get_flag(FLAG_KILL_SWITCH).await?.as_deref(),
            Some("1") | Some("true") | Some("on")
        );
        let kill_switch = kill_switch_on(&self.ctx) || (cfg.kill_switch_enabled && persisted_kill);

        let rs = self
            .ctx
            .store
            .risk_state(risk_state::trade_date(now))
            .await?;
        let (soft, hard, risk_kill) = rs
            .map(|r| (r.soft_halt, r.hard_halt, r.kill_switch))
            .unwrap_or((false, false, false));

        let cooldown_until_ms = if cfg.cooldown_enabled {
            self.ctx
                .store
                .active_cooldown(&plan.symbol, plan.side, plan.timeframe, now)
                .await?
        } else {
            None
        };

        let open_count = self.ctx.store.count_open_positions().await? as usize;

        let same_side_peers = self
            .ctx
            .store
            .open_positions_same_symbol_side(&plan.symbol, plan.side)
            .await?
            .into_iter()
            .map(|p| MutexPeer {
                priority: p.timeframe.priority(),
                closing: p.status == PositionStatus::Closing,
                position_id: p.position_id,
            })
            .collect();

        Ok(GateContext {
            now_ms: now,
            kill_switch,
            risk_circuit_enabled: cfg.risk_circuit_enabled,
            soft_halt: soft,
            hard_halt: hard,
            risk_kill_switch: risk_kill,
            cooldown_until_ms,
            open_count,
            max_open: cfg.max_open_positions,
            same_side_peers,
            upgrade_action: cfg.mutex_upgrade_action,
        })
    }

    async fn current_equity(&self) -> Result<f64> {
        if self.ctx.cfg.mode.is_live() {
            let venue = self.ctx.venue.as_ref().context("live mode without venue")?;
            let read = venue
                .wallet_balance()
                .await
                .map_err(|e| anyhow::anyhow!("wallet balance: {e}"))?;
            if read.degraded {
                emit_risk(
                    &self.ctx,
                    &RiskEvent {
                        retry_after_ms: None,
                        ext: Some(json!({ "degraded": true })),
                        ..RiskEvent::new(
                            RiskEventType::RateLimit,
                            crate::events::Severity::Info,
                            "sizing used degraded wallet snapshot",
                        )
                    }
                    .for_symbol("wallet"),
                    "wallet",
                )
                .await?;
            }
            return Ok(crate::bybit::types::parse_f64(&read.value.total_equity));
        }

        // Paper/backtest: track equity through the daily risk ledger.
        let rs = self
            .ctx
            .store
            .risk_state(risk_state::trade_date(crate::now_ms()))
            .await?;
        Ok(rs
            .map(|r| r.current_equity)
            .unwrap_or(self.ctx.cfg.paper_equity))
    }

    async fn lot_filter(&self, symbol: &str) -> LotFilter {
        if let Some(venue) = &self.ctx.venue {
            if let Ok(inst) = venue.instruments_info(symbol).await {
                return LotFilter {
                    qty_step: crate::bybit::types::parse_f64(&inst.lot_size_filter.qty_step)
                        .max(1e-9),
                    min_qty: crate::bybit::types::parse_f64(&inst.lot_size_filter.min_order_qty),
                };
            }
        }
        LotFilter::default()
    }

    // ─────────────────────────────────────────────────
    // Rejection path
    // ─────────────────────────────────────────────────

    async fn reject(
        &self,
        plan: &TradePlan,
        reason: RejectReason,
        detail: serde_json::Value,
    ) -> Result<()> {
        info!(
            "🚫 plan {} rejected: {} {}",
            plan.plan_id,
            reason.as_str(),
            detail
        );
        emit_risk(
            &self.ctx,
            &RiskEvent {
                ext: Some(detail.clone()),
                ..RiskEvent::new(
                    reason.risk_event_type(),
                    reason.severity(),
                    format!("plan {} rejected: {}", plan.plan_id, reason.as_str()),
                )
            }
            .for_symbol(&plan.symbol),
            &plan.symbol,
        )
        .await?;

        emit_report(
            &self.ctx,
            &report_id(&plan.idempotency_key, "REJECTED"),
            &ExecutionReport {
                reason: Some(reason.as_str().to_string()),
                timeframe: Some(plan.timeframe),
                ext: [("detail".to_string(), detail)].into_iter().collect(),
                ..ExecutionReport::new(&plan.plan_id, &plan.symbol, ReportStatus::OrderRejected)
            },
        )
        .await
    }

    // ─────────────────────────────────────────────────
    // Opening
    // ─────────────────────────────────────────────────

    async fn open_position(&self, plan: &TradePlan, qty: f64) -> Result<()> {
        let now = crate::now_ms();
        let position = Position::open_from_plan(plan, qty, now);
        if !self.ctx.store.insert_position(&position).await? {
            debug!("🧭 duplicate open for {} — row exists", plan.idempotency_key);
            return Ok(());
        }

        info!(
            "📈 opening {} {} qty={} entry={} sl={} ({})",
            position.bias.as_str(),
            position.symbol,
            qty,
            position.entry_price,
            position.primary_sl_price,
            plan.timeframe.as_str(),
        );

        // ENTRY
        let (entry_type, tif) = match self.ctx.cfg.entry_order_type {
            EntryOrderType::Market => (OrderType::Market, "IOC"),
            EntryOrderType::Limit => (OrderType::Limit, "GTC"),
        };
        let mut entry = Order::new(
            &plan.idempotency_key,
            OrderPurpose::Entry,
            plan.side,
            entry_type,
            qty,
            (entry_type == OrderType::Limit).then_some(plan.entry_price),
            false,
            now,
        );

        if self.ctx.cfg.mode.is_live() {
            let venue = self.ctx.venue.as_ref().context("live mode without venue")?;
            let req = OrderCreateRequest {
                category: "linear".into(),
                symbol: plan.symbol.clone(),
                side: side_str(plan.side).into(),
                order_type: entry_type.as_str().into(),
                qty: crate::bybit::rest::fmt_decimal(qty, 3),
                price: entry.price.map(|p| crate::bybit::rest::fmt_decimal(p, 4)),
                time_in_force: tif.into(),
                reduce_only: None,
                order_link_id: entry.order_id.clone(),
            };
            match venue.create_order(&req).await {
                Ok(res) => {
                    entry.status = OrderStatus::Submitted;
                    entry.venue_order_id = Some(res.order_id);
                    entry.payload = serde_json::to_value(&req)?;
                }
                Err(e) => return self.rollback_open(plan, position, e).await,
            }

            // Venue-side stop loss on the position.
            if let Err(e) = venue
                .set_trading_stop(&plan.symbol, plan.primary_sl_price)
                .await
            {
                if !e.is_retryable() {
                    // Cannot run the position unprotected: undo the entry.
                    if let Some(venue_id) = &entry.venue_order_id {
                        let _ = venue.cancel_order(&plan.symbol, venue_id).await;
                    }
                    return self.rollback_open(plan, position, e).await;
                }
                warn!("📈 trading-stop set deferred: {e} (reconcile will converge)");
            }
        } else {
            // Paper: entry fills at plan price immediately.
            entry.status = OrderStatus::Filled;
            entry.filled_qty = qty;
            entry.avg_price = Some(plan.entry_price);
            entry.last_fill_at_ms = Some(now);
        }
        self.ctx.store.upsert_order(&entry).await?;

        if !self.ctx.cfg.mode.is_live() {
            let fill = Fill {
                fill_id: uuid::Uuid::new_v4().to_string(),
                order_id: entry.order_id.clone(),
                symbol: plan.symbol.clone(),
                purpose: OrderPurpose::Entry,
                side: plan.side,
                exec_qty: qty,
                exec_price: plan.entry_price,
                fee: 0.0,
                exec_time_ms: now,
                venue_exec_id: format!("paper:{}:ENTRY", plan.idempotency_key),
            };
            self.ctx.store.insert_fill(&fill).await?;
        }

        // TP1 / TP2: reduce-only limits at entry ± R multiples.
        for (purpose, price, tp_qty, tag) in [
            (OrderPurpose::Tp1, position.meta.tp1_price, position.meta.tp1_qty, "TP1"),
            (OrderPurpose::Tp2, position.meta.tp2_price, position.meta.tp2_qty, "TP2"),
        ] {
            let close_side = opposite(plan.side);
            let mut tp = Order::new(
                &plan.idempotency_key,
                purpose,
                close_side,
                OrderType::Limit,
                tp_qty,
                Some(price),
                true,
                now,
            );
            if self.ctx.cfg.mode.is_live() {
                let venue = self.ctx.venue.as_ref().context("live mode without venue")?;
                let req = OrderCreateRequest {
                    category: "linear".into(),
                    symbol: plan.symbol.clone(),
                    side: side_str(close_side).into(),
                    order_type: "Limit".into(),
                    qty: crate::bybit::rest::fmt_decimal(tp_qty, 3),
                    price: Some(crate::bybit::rest::fmt_decimal(price, 4)),
                    time_in_force: "GTC".into(),
                    reduce_only: Some(true),
                    order_link_id: tp.order_id.clone(),
                };
                match venue.create_order(&req).await {
                    Ok(res) => {
                        tp.status = OrderStatus::Submitted;
                        tp.venue_order_id = Some(res.order_id);
                        tp.payload = serde_json::to_value(&req)?;
                    }
                    Err(e) if !e.is_retryable() => {
                        warn!("📈 {tag} placement rejected: {e}");
                        tp.status = OrderStatus::Failed;
                    }
                    Err(e) => {
                        warn!("📈 {tag} placement deferred: {e}");
                    }
                }
            } else {
                tp.status = OrderStatus::Submitted;
            }
            self.ctx.store.upsert_order(&tp).await?;
        }

        // Reports: submitted, then (paper) filled.
        let run_ext = position
            .meta
            .run_id
            .as_ref()
            .map(|r| ("run_id".to_string(), json!(r)));
        emit_report(
            &self.ctx,
            &report_id(&plan.idempotency_key, "ENTRY_SUBMITTED"),
            &ExecutionReport {
                order_id: Some(entry.order_id.clone()),
                timeframe: Some(plan.timeframe),
                ext: run_ext.clone().into_iter().collect(),
                ..ExecutionReport::new(&plan.plan_id, &plan.symbol, ReportStatus::OrderSubmitted)
            },
        )
        .await?;

        if !self.ctx.cfg.mode.is_live() {
            emit_report(
                &self.ctx,
                &report_id(&plan.idempotency_key, "ENTRY_FILLED"),
                &ExecutionReport {
                    order_id: Some(entry.order_id.clone()),
                    filled_qty: Some(qty),
                    avg_price: Some(plan.entry_price),
                    fill_ratio: Some(1.0),
                    timeframe: Some(plan.timeframe),
                    ext: run_ext.into_iter().collect(),
                    ..ExecutionReport::new(&plan.plan_id, &plan.symbol, ReportStatus::Filled)
                },
            )
            .await?;
        }
        Ok(())
    }

    /// Venue rejected the open: mark the position failed and report it.
    async fn rollback_open(
        &self,
        plan: &TradePlan,
        mut position: Position,
        err: VenueError,
    ) -> Result<()> {
        warn!("📉 open rolled back for {}: {err}", plan.plan_id);
        position.status = PositionStatus::Failed;
        position.closed_at_ms = Some(crate::now_ms());
        position.exit_reason = Some(ExitReason::EntryFailed);
        self.ctx.store.update_position(&position).await?;

        emit_report(
            &self.ctx,
            &report_id(&plan.idempotency_key, "REJECTED"),
            &ExecutionReport {
                reason: Some(format!("{err}")),
                timeframe: Some(plan.timeframe),
                ..ExecutionReport::new(&plan.plan_id, &plan.symbol, ReportStatus::OrderRejected)
            },
        )
        .await
    }

    // ─────────────────────────────────────────────────
    // Forced exit (mutex upgrade / hard halt)
    // ─────────────────────────────────────────────────

    /// Close a position at market, best effort. Returns true when the
    /// position is confirmed flat.
    pub async fn force_exit(&self, position: Position, reason: ExitReason) -> Result<bool> {
        let lock = self.ctx.pos_locks.for_position(&position.position_id).await;
        let _guard = lock.lock().await;

        let Some(mut position) = self.ctx.store.position_by_id(&position.position_id).await?
        else {
            return Ok(true);
        };
        if position.status == PositionStatus::Closed {
            return Ok(true);
        }

        info!(
            "⛔ force exit {} {} ({})",
            position.symbol,
            position.bias.as_str(),
            reason.as_str()
        );

        // Cancel working TPs first so the market exit can't race them.
        if let Some(venue) = &self.ctx.venue {
            for purpose in [OrderPurpose::Tp1, OrderPurpose::Tp2] {
                if let Some(tp) = self
                    .ctx
                    .store
                    .order_for(&position.idempotency_key, purpose)
                    .await?
                {
                    if !tp.status.is_terminal() {
                        if let Some(venue_id) = &tp.venue_order_id {
                            let _ = venue.cancel_order(&position.symbol, venue_id).await;
                        }
                        let mut tp = tp;
                        tp.status = OrderStatus::Canceled;
                        self.ctx.store.upsert_order(&tp).await?;
                    }
                }
            }
        }

        let close_side = opposite(position.side);
        let mut exit = Order::new(
            &position.idempotency_key,
            OrderPurpose::Exit,
            close_side,
            OrderType::Market,
            position.qty_total,
            None,
            true,
            crate::now_ms(),
        );

        if self.ctx.cfg.mode.is_live() {
            let venue = self.ctx.venue.as_ref().context("live mode without venue")?;
            let req = OrderCreateRequest {
                category: "linear".into(),
                symbol: position.symbol.clone(),
                side: side_str(close_side).into(),
                order_type: "Market".into(),
                qty: crate::bybit::rest::fmt_decimal(position.qty_total, 3),
                price: None,
                time_in_force: "IOC".into(),
                reduce_only: Some(true),
                order_link_id: exit.order_id.clone(),
            };
            match venue.create_order(&req).await {
                Ok(res) => {
                    exit.status = OrderStatus::Submitted;
                    exit.venue_order_id = Some(res.order_id);
                }
                Err(e) => {
                    warn!("⛔ force exit submit failed: {e}");
                    return Ok(false);
                }
            }
            self.ctx.store.upsert_order(&exit).await?;
            position.status = PositionStatus::Closing;
            self.ctx.store.update_position(&position).await?;

            // Wait one tick for the IOC to land, then confirm flat.
            tokio::time::sleep(Duration::from_millis(750)).await;
            let flat = match venue.position_list(&position.symbol).await {
                Ok(read) => read
                    .value
                    .iter()
                    .filter(|p| venue_side_matches(&p.side, position.side))
                    .all(|p| crate::bybit::types::parse_f64(&p.size) == 0.0),
                Err(e) => {
                    warn!("⛔ flat check failed: {e}");
                    false
                }
            };
            if !flat {
                return Ok(false);
            }
            let px = self.exit_price_guess(&position).await;
            self.finalize_forced_close(position, exit, px, reason).await?;
            return Ok(true);
        }

        // Paper: fill at the last seen price.
        exit.status = OrderStatus::Filled;
        exit.filled_qty = position.qty_total;
        let px = self.exit_price_guess(&position).await;
        exit.avg_price = Some(px);
        self.ctx.store.upsert_order(&exit).await?;
        self.finalize_forced_close(position, exit, px, reason).await?;
        Ok(true)
    }

    async fn exit_price_guess(&self, position: &Position) -> f64 {
        self.ctx
            .last_price
            .read()
            .await
            .get(&position.symbol)
            .copied()
            .unwrap_or(position.entry_price)
    }

    async fn finalize_forced_close(
        &self,
        mut position: Position,
        exit: Order,
        px: f64,
        reason: ExitReason,
    ) -> Result<()> {
        let now = crate::now_ms();
        let pnl = position.pnl(position.qty_total, px);

        let fill = Fill {
            fill_id: uuid::Uuid::new_v4().to_string(),
            order_id: exit.order_id.clone(),
            symbol: position.symbol.clone(),
            purpose: OrderPurpose::Exit,
            side: exit.side,
            exec_qty: position.qty_total,
            exec_price: px,
            fee: 0.0,
            exec_time_ms: now,
            venue_exec_id: format!("exit:{}:{}", position.idempotency_key, reason.as_str()),
        };
        self.ctx.store.insert_fill(&fill).await?;

        position.qty_total = 0.0;
        position.qty_runner = 0.0;
        position.status = PositionStatus::Closed;
        position.closed_at_ms = Some(now);
        position.exit_reason = Some(reason);
        self.ctx.store.update_position(&position).await?;
        self.ctx.pos_locks.release(&position.position_id).await;

        let losses = risk_state::record_close_pnl(&self.ctx, pnl).await?;

        emit_report(
            &self.ctx,
            &report_id(&position.idempotency_key, "FORCED_EXIT"),
            &ExecutionReport {
                order_id: Some(exit.order_id.clone()),
                reason: Some(reason.as_str().to_string()),
                filled_qty: Some(fill.exec_qty),
                avg_price: Some(px),
                timeframe: Some(position.timeframe),
                ext: [
                    ("pnl_usdt".to_string(), json!(pnl)),
                    ("exit_avg_price".to_string(), json!(px)),
                    ("consecutive_loss_count".to_string(), json!(losses)),
                ]
                .into_iter()
                .collect(),
                ..ExecutionReport::new(
                    position.plan_id(),
                    &position.symbol,
                    ReportStatus::SecondarySlExit,
                )
            },
        )
        .await
    }
}

pub fn side_str(side: PlanSide) -> &'static str {
    match side {
        PlanSide::Buy => "Buy",
        PlanSide::Sell => "Sell",
    }
}

pub fn opposite(side: PlanSide) -> PlanSide {
    match side {
        PlanSide::Buy => PlanSide::Sell,
        PlanSide::Sell => PlanSide::Buy,
    }
}

/// Bybit reports position side as "Buy"/"Sell" matching the opening side.
pub fn venue_side_matches(venue_side: &str, side: PlanSide) -> bool {
    venue_side.eq_ignore_ascii_case(side_str(side))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_opposite() {
        assert_eq!(opposite(PlanSide::Buy), PlanSide::Sell);
        assert_eq!(opposite(PlanSide::Sell), PlanSide::Buy);
    }

    #[test]
    fn test_venue_side_matches() {
        assert!(venue_side_matches("Buy", PlanSide::Buy));
        assert!(venue_side_matches("buy", PlanSide::Buy));
        assert!(!venue_side_matches("Sell", PlanSide::Buy));
    }
}
