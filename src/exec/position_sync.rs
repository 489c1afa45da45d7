//! Position-sync loop (LIVE): compares every DB-OPEN position with the
//! exchange's position size and closes stale rows. Covers manual
//! exchange-side closes, missed SL fills, and WS gaps.
//!
//! Exit-reason rule: exchange flat before TP1 was ever seen filled means
//! the primary stop (or equivalent) took the position out — reason
//! STOP_LOSS, cooldown written. After TP1, the venue closing the rest is
//! recorded conservatively as EXCHANGE_CLOSED, no cooldown.

use std::time::Duration;

use anyhow::Result;
use serde_json::json;
use tracing::{info, warn};

use crate::bybit::types::parse_f64;
use crate::events::{ExecutionReport, ReportStatus};
use crate::exec::executor::venue_side_matches;
use crate::exec::types::{Cooldown, ExitReason, OrderPurpose, OrderStatus, Position, PositionStatus};
use crate::exec::{emit_report, report_id, risk_state};
use crate::Ctx;

pub struct PositionSync {
    ctx: Ctx,
}

impl PositionSync {
    pub fn new(ctx: Ctx) -> Self {
        Self { ctx }
    }

    pub async fn run(self) {
        info!("🧮 position sync started");
        let mut shutdown = self.ctx.shutdown.clone();
        let mut tick =
            tokio::time::interval(Duration::from_millis(self.ctx.cfg.position_sync_interval_ms));
        loop {
            tokio::select! {
                _ = tick.tick() => {
                    if let Err(e) = self.pass().await {
                        warn!("🧮 position sync pass failed: {e:#}");
                    }
                }
                _ = shutdown.changed() => break,
            }
        }
        info!("🧮 position sync shutting down");
    }

    /// One pass over all DB-open positions; also the startup recovery
    /// sweep.
    pub async fn pass(&self) -> Result<()> {
        let Some(venue) = &self.ctx.venue else { return Ok(()) };
        let positions = self.ctx.store.open_positions().await?;
        let mut venue_view: Vec<serde_json::Value> = Vec::new();

        for position in positions {
            let lock = self.ctx.pos_locks.for_position(&position.position_id).await;
            let _guard = lock.lock().await;
            let Some(position) = self.ctx.store.position_by_id(&position.position_id).await?
            else {
                continue;
            };
            if position.status == PositionStatus::Closed
                || position.status == PositionStatus::Failed
            {
                continue;
            }

            let venue_size = match venue.position_list(&position.symbol).await {
                Ok(read) => {
                    for p in &read.value {
                        venue_view.push(serde_json::json!({
                            "symbol": p.symbol,
                            "side": p.side,
                            "size": p.size,
                            "avgPrice": p.avg_price,
                            "stopLoss": p.stop_loss,
                        }));
                    }
                    read.value
                        .iter()
                        .filter(|p| venue_side_matches(&p.side, position.side))
                        .map(|p| parse_f64(&p.size))
                        .sum::<f64>()
                }
                Err(e) => {
                    warn!("🧮 position list fetch failed: {e}");
                    continue;
                }
            };

            if venue_size == 0.0 {
                self.close_stale(position).await?;
            }
        }

        if !venue_view.is_empty() {
            self.ctx
                .store
                .insert_account_snapshot(
                    crate::exec::types::SnapshotSource::Rest,
                    crate::now_ms(),
                    &serde_json::Value::Array(venue_view),
                )
                .await?;
        }
        Ok(())
    }

    async fn close_stale(&self, mut position: Position) -> Result<()> {
        let reason = if position.meta.tp1_filled {
            ExitReason::ExchangeClosed
        } else {
            ExitReason::StopLoss
        };
        let now = crate::now_ms();

        // Best price attribution we have without the venue's close fill:
        // the stop level for stop-outs, last trade price otherwise.
        let px = match reason {
            ExitReason::StopLoss => position.current_stop_price,
            _ => self
                .ctx
                .last_price
                .read()
                .await
                .get(&position.symbol)
                .copied()
                .unwrap_or(position.entry_price),
        };
        let pnl = position.pnl(position.qty_total, px);

        info!(
            "🧮 exchange flat but DB open: closing {} ({}, pnl~{:+.2})",
            position.symbol,
            reason.as_str(),
            pnl
        );

        // Drop leftover TP rows.
        for purpose in [OrderPurpose::Tp1, OrderPurpose::Tp2] {
            if let Some(mut tp) = self
                .ctx
                .store
                .order_for(&position.idempotency_key, purpose)
                .await?
            {
                if !tp.status.is_terminal() {
                    if let (Some(venue), Some(venue_id)) =
                        (self.ctx.venue.as_ref(), tp.venue_order_id.clone())
                    {
                        let _ = venue.cancel_order(&position.symbol, &venue_id).await;
                    }
                    tp.status = OrderStatus::Canceled;
                    self.ctx.store.upsert_order(&tp).await?;
                }
            }
        }

        position.qty_total = 0.0;
        position.qty_runner = 0.0;
        position.status = PositionStatus::Closed;
        position.closed_at_ms = Some(now);
        position.exit_reason = Some(reason);
        self.ctx.store.update_position(&position).await?;
        self.ctx.pos_locks.release(&position.position_id).await;

        if reason.triggers_cooldown() && self.ctx.cfg.cooldown_enabled {
            let bars = self.ctx.cfg.cooldown_bars(position.timeframe.as_str()) as i64;
            self.ctx
                .store
                .insert_cooldown(&Cooldown {
                    symbol: position.symbol.clone(),
                    side: position.side,
                    timeframe: position.timeframe,
                    reason: reason.as_str().to_string(),
                    until_ts_ms: now + bars * position.timeframe.duration_ms(),
                })
                .await?;
        }

        let losses = risk_state::record_close_pnl(&self.ctx, pnl).await?;

        emit_report(
            &self.ctx,
            &report_id(&position.idempotency_key, "CLOSED"),
            &ExecutionReport {
                reason: Some(reason.as_str().to_string()),
                timeframe: Some(position.timeframe),
                ext: [
                    ("pnl_usdt".to_string(), json!(pnl)),
                    ("exit_avg_price".to_string(), json!(px)),
                    ("consecutive_loss_count".to_string(), json!(losses)),
                    ("run_id".to_string(), json!(position.meta.run_id)),
                ]
                .into_iter()
                .collect(),
                ..ExecutionReport::new(
                    position.plan_id(),
                    &position.symbol,
                    ReportStatus::PositionClosed,
                )
            },
        )
        .await
    }
}
