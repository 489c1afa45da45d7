//! Bar-close consumer.
//!
//! Paper/backtest: drives the OHLC matcher over open positions and books
//! the simulated fills. Live: maintains runner trailing stops (ATR/PIVOT)
//! once TP2 has filled. Either way the bar guard table drops gap-refill
//! duplicates before they can double-fill anything.

use std::collections::HashMap;
use std::time::Duration;

use anyhow::Result;
use serde_json::json;
use tracing::{debug, info, warn};

use crate::events::{
    topic, BarClose, ExecutionReport, ReportStatus, RiskEvent, RiskEventType, Severity,
};
use crate::exec::paper::{self, SimEventKind};
use crate::exec::trailing::{tighten, TrailState};
use crate::exec::types::{
    Cooldown, ExitReason, Fill, OrderPurpose, OrderStatus, Position, PositionStatus,
};
use crate::exec::{emit_report, emit_risk, report_id, risk_state};
use crate::Ctx;

pub struct BarConsumer {
    ctx: Ctx,
    /// Per-position trailing state, rebuilt from the stream after restart.
    trails: HashMap<String, TrailState>,
}

impl BarConsumer {
    pub fn new(ctx: Ctx) -> Self {
        Self { ctx, trails: HashMap::new() }
    }

    pub async fn run(mut self) {
        info!("🕯️ bar consumer started");
        let cfg = self.ctx.cfg.clone();
        if let Err(e) = self.ctx.bus.ensure_group(topic::BAR_CLOSE, &cfg.bus_group).await {
            warn!("🕯️ ensure_group failed: {e:#}");
        }

        let mut shutdown = self.ctx.shutdown.clone();
        loop {
            if *shutdown.borrow() {
                break;
            }
            let batch = tokio::select! {
                res = self.ctx.bus.consume(
                    topic::BAR_CLOSE,
                    &cfg.bus_group,
                    &cfg.bus_consumer,
                    cfg.bus_batch,
                    cfg.bus_block_ms,
                ) => match res {
                    Ok(batch) => batch,
                    Err(e) => {
                        warn!("🕯️ consume failed: {e:#}");
                        tokio::time::sleep(Duration::from_secs(2)).await;
                        continue;
                    }
                },
                _ = shutdown.changed() => break,
            };

            for record in batch {
                let bar = record
                    .envelope
                    .as_ref()
                    .ok()
                    .and_then(|env| serde_json::from_value::<BarClose>(env.payload.clone()).ok());
                let Some(bar) = bar else {
                    let _ = self
                        .ctx
                        .bus
                        .dead_letter(
                            topic::BAR_CLOSE,
                            &cfg.bus_group,
                            &record.stream_id,
                            &record.raw,
                            "bar_close schema",
                        )
                        .await;
                    continue;
                };

                if let Err(e) = self.process_bar(&bar).await {
                    warn!("🕯️ bar {}@{} failed: {e:#}", bar.symbol, bar.close_time_ms);
                    let _ = self
                        .ctx
                        .bus
                        .dead_letter(
                            topic::BAR_CLOSE,
                            &cfg.bus_group,
                            &record.stream_id,
                            &record.raw,
                            &format!("{e:#}"),
                        )
                        .await;
                    continue;
                }
                let _ = self
                    .ctx
                    .bus
                    .ack(topic::BAR_CLOSE, &cfg.bus_group, &record.stream_id)
                    .await;
            }
        }
        info!("🕯️ bar consumer shutting down");
    }

    async fn process_bar(&mut self, bar: &BarClose) -> Result<()> {
        if !bar.is_final {
            return Ok(());
        }
        let now = crate::now_ms();

        // Duplicate guard (gap refill re-emits).
        if !self
            .ctx
            .store
            .record_bar_emit(&bar.symbol, bar.timeframe, bar.close_time_ms, now)
            .await?
        {
            emit_risk(
                &self.ctx,
                &RiskEvent::new(
                    RiskEventType::BarDuplicate,
                    Severity::Info,
                    format!(
                        "duplicate bar {} {} @ {}",
                        bar.symbol,
                        bar.timeframe.as_str(),
                        bar.close_time_ms
                    ),
                )
                .for_symbol(&bar.symbol),
                &bar.symbol,
            )
            .await?;
            return Ok(());
        }

        self.ctx
            .last_price
            .write()
            .await
            .insert(bar.symbol.clone(), bar.ohlcv.close);

        if now - bar.close_time_ms > self.ctx.cfg.data_lag_threshold_ms {
            emit_risk(
                &self.ctx,
                &RiskEvent::new(
                    RiskEventType::DataLag,
                    Severity::Info,
                    format!("bar arrived {} ms after close", now - bar.close_time_ms),
                )
                .for_symbol(&bar.symbol),
                &bar.symbol,
            )
            .await?;
        }

        let positions = self
            .ctx
            .store
            .open_positions_for_bar(&bar.symbol, bar.timeframe)
            .await?;
        for position in positions {
            let pending_exit = {
                let lock = self.ctx.pos_locks.for_position(&position.position_id).await;
                let _guard = lock.lock().await;
                // Re-read under the lock: another loop may have closed it.
                let Some(position) =
                    self.ctx.store.position_by_id(&position.position_id).await?
                else {
                    continue;
                };
                if position.status != PositionStatus::Open {
                    continue;
                }
                self.drive_position(position, bar).await?
            };
            // Live secondary-rule exits go through the market-exit path,
            // which takes the position lock itself.
            if let Some(position) = pending_exit {
                let executor = crate::exec::executor::PlanExecutor::new(self.ctx.clone());
                executor
                    .force_exit(position, ExitReason::SecondarySlExit)
                    .await?;
            }
        }
        Ok(())
    }

    /// Returns the position when a live secondary-rule exit must run
    /// after the caller releases the advisory lock.
    async fn drive_position(
        &mut self,
        mut pos: Position,
        bar: &BarClose,
    ) -> Result<Option<Position>> {
        let is_paper = !self.ctx.cfg.mode.is_live();
        let mut closed = false;

        if is_paper {
            let events = paper::match_bar(&pos, &bar.ohlcv);
            let mut tp1_now = false;
            for ev in events {
                match ev.kind {
                    SimEventKind::Tp1 => {
                        self.book_tp(&mut pos, bar, OrderPurpose::Tp1, ev.price, ev.qty).await?;
                        pos.meta.tp1_filled = true;
                        tp1_now = true;
                    }
                    SimEventKind::Tp2 => {
                        self.book_tp(&mut pos, bar, OrderPurpose::Tp2, ev.price, ev.qty).await?;
                        pos.meta.tp2_filled = true;
                    }
                    SimEventKind::StopOut(reason) => {
                        self.book_stop_out(&mut pos, bar, reason, ev.price, ev.qty).await?;
                        closed = true;
                    }
                }
            }
            // Stop adjustments arm for the NEXT bar.
            if !closed && tp1_now {
                pos.current_stop_price = pos.entry_price;
            }
        }

        if !closed && self.secondary_rule_fires(&pos, bar) {
            if is_paper {
                let qty = pos.qty_total;
                self.book_stop_out(&mut pos, bar, ExitReason::SecondarySlExit, bar.ohlcv.close, qty)
                    .await?;
                return Ok(None);
            }
            return Ok(Some(pos));
        }

        if !closed {
            self.update_trailing(&mut pos, bar).await?;
            self.ctx.store.update_position(&pos).await?;
        }
        Ok(None)
    }

    /// Secondary rule: exit when the MACD histogram flips against the
    /// sign it carried at entry. The histogram rides in on the bar's ext
    /// map; bars without it never trigger.
    fn secondary_rule_fires(&self, pos: &Position, bar: &BarClose) -> bool {
        if !self.ctx.cfg.secondary_rule_enabled {
            return false;
        }
        let Some(hist_entry) = pos.hist_entry else { return false };
        let Some(hist) = bar.ext.get("hist").and_then(|v| v.as_f64()) else {
            return false;
        };
        hist_entry != 0.0 && hist != 0.0 && hist.signum() != hist_entry.signum()
    }

    async fn update_trailing(&mut self, pos: &mut Position, bar: &BarClose) -> Result<()> {
        let trail = self
            .trails
            .entry(pos.position_id.clone())
            .or_insert_with(|| TrailState::new(self.ctx.cfg.runner_pivot_bars));
        trail.observe(&bar.ohlcv);

        if !pos.runner_active() {
            return Ok(());
        }
        let Some(candidate) = trail.candidate(
            self.ctx.cfg.runner_trail_mode,
            pos.is_long(),
            bar.ohlcv.close,
            self.ctx.cfg.runner_atr_mult,
        ) else {
            return Ok(());
        };

        // Baseline is the stop the runner already holds (break-even at
        // minimum); the candidate may only tighten it.
        let base = pos.runner_stop_price.unwrap_or(pos.current_stop_price);
        if let Some(new_stop) = tighten(Some(base), candidate, pos.is_long()) {
            debug!(
                "🎯 runner stop {} {:.4} → {:.4}",
                pos.symbol, base, new_stop
            );
            pos.runner_stop_price = Some(new_stop);
            pos.current_stop_price = new_stop;
            if self.ctx.cfg.mode.is_live() {
                if let Some(venue) = &self.ctx.venue {
                    if let Err(e) = venue.set_trading_stop(&pos.symbol, new_stop).await {
                        warn!("🎯 trailing stop update failed: {e}");
                    }
                }
            }
        }
        Ok(())
    }

    // ─────────────────────────────────────────────────
    // Booking
    // ─────────────────────────────────────────────────

    async fn book_tp(
        &self,
        pos: &mut Position,
        bar: &BarClose,
        purpose: OrderPurpose,
        price: f64,
        qty: f64,
    ) -> Result<()> {
        pos.qty_total = crate::exec::types::round_qty(pos.qty_total - qty);
        let pnl = pos.pnl(qty, price);
        let tag = purpose.as_str();

        if let Some(mut order) = self.ctx.store.order_for(&pos.idempotency_key, purpose).await? {
            order.status = OrderStatus::Filled;
            order.filled_qty = qty;
            order.avg_price = Some(price);
            order.last_fill_at_ms = Some(bar.close_time_ms);
            self.ctx.store.upsert_order(&order).await?;

            let fill = Fill {
                fill_id: uuid::Uuid::new_v4().to_string(),
                order_id: order.order_id.clone(),
                symbol: pos.symbol.clone(),
                purpose,
                side: order.side,
                exec_qty: qty,
                exec_price: price,
                fee: 0.0,
                exec_time_ms: bar.close_time_ms,
                venue_exec_id: format!(
                    "paper:{}:{}:{}",
                    pos.idempotency_key, bar.close_time_ms, tag
                ),
            };
            self.ctx.store.insert_fill(&fill).await?;
        }

        info!(
            "🎯 {} filled {} {}@{} (pnl {:+.2})",
            tag, pos.symbol, qty, price, pnl
        );
        emit_report(
            &self.ctx,
            &report_id(&pos.idempotency_key, &format!("{}_{}", tag, bar.close_time_ms)),
            &ExecutionReport {
                filled_qty: Some(qty),
                avg_price: Some(price),
                reason: Some(tag.to_string()),
                timeframe: Some(pos.timeframe),
                ext: [
                    ("pnl_usdt".to_string(), json!(pnl)),
                    ("run_id".to_string(), json!(pos.meta.run_id)),
                ]
                .into_iter()
                .collect(),
                ..ExecutionReport::new(pos.plan_id(), &pos.symbol, ReportStatus::TpHit)
            },
        )
        .await
    }

    async fn book_stop_out(
        &self,
        pos: &mut Position,
        bar: &BarClose,
        reason: ExitReason,
        price: f64,
        qty: f64,
    ) -> Result<()> {
        let pnl = pos.pnl(qty, price);
        let now = bar.close_time_ms;

        let exit_order_id = {
            // The stop fill has no resting order row; synthesize one under
            // the EXIT purpose for traceability.
            let mut exit = crate::exec::types::Order::new(
                &pos.idempotency_key,
                OrderPurpose::Exit,
                crate::exec::executor::opposite(pos.side),
                crate::exec::types::OrderType::Market,
                qty,
                None,
                true,
                now,
            );
            exit.status = OrderStatus::Filled;
            exit.filled_qty = qty;
            exit.avg_price = Some(price);
            exit.last_fill_at_ms = Some(now);
            self.ctx.store.upsert_order(&exit).await?;
            exit.order_id
        };

        let fill = Fill {
            fill_id: uuid::Uuid::new_v4().to_string(),
            order_id: exit_order_id.clone(),
            symbol: pos.symbol.clone(),
            purpose: OrderPurpose::Exit,
            side: crate::exec::executor::opposite(pos.side),
            exec_qty: qty,
            exec_price: price,
            fee: 0.0,
            exec_time_ms: now,
            venue_exec_id: format!("paper:{}:{}:STOP", pos.idempotency_key, now),
        };
        self.ctx.store.insert_fill(&fill).await?;

        // Cancel the remaining TP rows.
        for purpose in [OrderPurpose::Tp1, OrderPurpose::Tp2] {
            if let Some(mut tp) = self.ctx.store.order_for(&pos.idempotency_key, purpose).await? {
                if !tp.status.is_terminal() {
                    tp.status = OrderStatus::Canceled;
                    self.ctx.store.upsert_order(&tp).await?;
                }
            }
        }

        pos.qty_total = 0.0;
        pos.qty_runner = 0.0;
        pos.status = PositionStatus::Closed;
        pos.closed_at_ms = Some(now);
        pos.exit_reason = Some(reason);
        self.ctx.store.update_position(&pos).await?;
        self.ctx.pos_locks.release(&pos.position_id).await;

        if reason.triggers_cooldown() && self.ctx.cfg.cooldown_enabled {
            let bars = self.ctx.cfg.cooldown_bars(pos.timeframe.as_str()) as i64;
            let cooldown = Cooldown {
                symbol: pos.symbol.clone(),
                side: pos.side,
                timeframe: pos.timeframe,
                reason: reason.as_str().to_string(),
                until_ts_ms: now + bars * pos.timeframe.duration_ms(),
            };
            self.ctx.store.insert_cooldown(&cooldown).await?;
            info!(
                "🧊 cooldown {} {} {} until {}",
                pos.symbol,
                pos.side.as_str(),
                pos.timeframe.as_str(),
                cooldown.until_ts_ms
            );
        }

        let losses = risk_state::record_close_pnl(&self.ctx, pnl).await?;

        info!(
            "🛑 stop out {} {}@{} ({}, pnl {:+.2}, losses {})",
            pos.symbol,
            qty,
            price,
            reason.as_str(),
            pnl,
            losses
        );

        let status = match reason {
            ExitReason::PrimarySlHit => ReportStatus::PrimarySlHit,
            _ => ReportStatus::SecondarySlExit,
        };
        emit_report(
            &self.ctx,
            &report_id(&pos.idempotency_key, &format!("STOP_{}", now)),
            &ExecutionReport {
                order_id: Some(exit_order_id.clone()),
                filled_qty: Some(qty),
                avg_price: Some(price),
                reason: Some(reason.as_str().to_string()),
                timeframe: Some(pos.timeframe),
                ext: [("pnl_usdt".to_string(), json!(pnl))].into_iter().collect(),
                ..ExecutionReport::new(pos.plan_id(), &pos.symbol, status)
            },
        )
        .await?;

        emit_report(
            &self.ctx,
            &report_id(&pos.idempotency_key, "CLOSED"),
            &ExecutionReport {
                order_id: Some(exit_order_id),
                reason: Some(reason.as_str().to_string()),
                timeframe: Some(pos.timeframe),
                ext: [
                    ("pnl_usdt".to_string(), json!(pnl)),
                    ("exit_avg_price".to_string(), json!(price)),
                    ("consecutive_loss_count".to_string(), json!(losses)),
                    ("run_id".to_string(), json!(pos.meta.run_id)),
                ]
                .into_iter()
                .collect(),
                ..ExecutionReport::new(
                    pos.plan_id(),
                    &pos.symbol,
                    ReportStatus::PositionClosed,
                )
            },
        )
        .await
    }
}
