//! Reconciliation loop (LIVE): polls cached open orders per position,
//! detects TP fills the WS may have missed, moves the stop to break-even
//! on TP1 and into runner-trail mode on TP2, and feeds stuck entry orders
//! to the order manager.
//!
//! Every effect is computed from current venue + DB state, never from a
//! remembered delta, so running it twice is harmless.

use std::time::Duration;

use anyhow::Result;
use serde_json::json;
use tracing::{info, warn};

use crate::bybit::types::parse_f64;
use crate::events::{
    ExecutionReport, ReportStatus, RiskEvent, RiskEventType, Severity,
};
use crate::exec::order_manager::OrderManager;
use crate::exec::types::{Order, OrderPurpose, OrderStatus, Position, PositionStatus};
use crate::exec::{emit_report, emit_risk, report_id};
use crate::Ctx;

/// An order with a venue id that is absent from open orders and shows no
/// fills for this long is assumed canceled venue-side.
const ORPHAN_GRACE_MS: i64 = 60_000;

pub struct Reconciler {
    ctx: Ctx,
    order_manager: OrderManager,
}

impl Reconciler {
    pub fn new(ctx: Ctx) -> Self {
        let order_manager = OrderManager::new(ctx.clone());
        Self { ctx, order_manager }
    }

    pub async fn run(self) {
        info!("🔄 reconciler started (poll {} ms)", self.ctx.cfg.reconcile_poll_ms());
        let mut shutdown = self.ctx.shutdown.clone();
        let mut tick =
            tokio::time::interval(Duration::from_millis(self.ctx.cfg.reconcile_poll_ms()));
        loop {
            tokio::select! {
                _ = tick.tick() => {
                    if let Err(e) = self.pass().await {
                        warn!("🔄 reconcile pass failed: {e:#}");
                    }
                }
                _ = shutdown.changed() => break,
            }
        }
        info!("🔄 reconciler shutting down");
    }

    /// One full pass over all open positions. Also used as the startup
    /// crash-recovery sweep.
    pub async fn pass(&self) -> Result<()> {
        let positions = self.ctx.store.open_positions().await?;
        for position in positions {
            let lock = self.ctx.pos_locks.for_position(&position.position_id).await;
            let _guard = lock.lock().await;
            let Some(position) = self.ctx.store.position_by_id(&position.position_id).await?
            else {
                continue;
            };
            if position.status != PositionStatus::Open {
                continue;
            }
            if let Err(e) = self.reconcile_position(position).await {
                warn!("🔄 reconcile position failed: {e:#}");
            }
        }
        Ok(())
    }

    async fn reconcile_position(&self, mut position: Position) -> Result<()> {
        let Some(venue) = &self.ctx.venue else { return Ok(()) };

        let open_orders = match venue.open_orders(&position.symbol).await {
            Ok(read) => {
                if read.degraded {
                    emit_risk(
                        &self.ctx,
                        &RiskEvent {
                            ext: Some(json!({ "degraded": true })),
                            ..RiskEvent::new(
                                RiskEventType::RateLimit,
                                Severity::Info,
                                "reconcile used degraded open-orders cache",
                            )
                        }
                        .for_symbol(&position.symbol),
                        &position.symbol,
                    )
                    .await?;
                }
                read.value
            }
            Err(e) => {
                warn!("🔄 open orders fetch failed: {e}");
                return Ok(());
            }
        };

        let mut dirty = false;
        for (purpose, already) in [
            (OrderPurpose::Tp1, position.meta.tp1_filled),
            (OrderPurpose::Tp2, position.meta.tp2_filled),
        ] {
            if already {
                continue;
            }
            let Some(order) = self
                .ctx
                .store
                .order_for(&position.idempotency_key, purpose)
                .await?
            else {
                continue;
            };
            match self.tp_outcome(&order, &open_orders).await? {
                TpOutcome::Working => {}
                TpOutcome::Filled { qty, avg_price } => {
                    apply_tp_fill(&self.ctx, &mut position, order, purpose, qty, avg_price)
                        .await?;
                    dirty = true;
                }
                TpOutcome::Canceled => {
                    let mut order = order;
                    order.status = OrderStatus::Canceled;
                    self.ctx.store.upsert_order(&order).await?;
                    emit_risk(
                        &self.ctx,
                        &RiskEvent::new(
                            RiskEventType::OrderCancelled,
                            Severity::Important,
                            format!("{} order vanished venue-side", purpose.as_str()),
                        )
                        .for_symbol(&position.symbol),
                        &position.symbol,
                    )
                    .await?;
                }
            }
        }
        if dirty {
            self.ctx.store.update_position(&position).await?;
        }

        // Stuck entry orders share the order manager's ladder.
        if let Some(entry) = self
            .ctx
            .store
            .order_for(&position.idempotency_key, OrderPurpose::Entry)
            .await?
        {
            if !entry.status.is_terminal() {
                self.order_manager.handle_entry(&position, entry).await?;
            }
        }
        Ok(())
    }

    async fn tp_outcome(
        &self,
        order: &Order,
        open_orders: &[crate::bybit::types::VenueOrder],
    ) -> Result<TpOutcome> {
        if order.status == OrderStatus::Filled {
            return Ok(TpOutcome::Filled {
                qty: order.filled_qty.max(order.qty),
                avg_price: order.avg_price.unwrap_or(order.price.unwrap_or(0.0)),
            });
        }
        let Some(venue_id) = &order.venue_order_id else {
            return Ok(TpOutcome::Working); // never made it to the venue yet
        };
        let still_open = open_orders.iter().any(|o| &o.order_id == venue_id);
        if still_open {
            // Keep local fill aggregation warm for partial fills.
            if let Some(vo) = open_orders.iter().find(|o| &o.order_id == venue_id) {
                let cum = parse_f64(&vo.cum_exec_qty);
                if cum > order.filled_qty {
                    let mut updated = order.clone();
                    updated.filled_qty = cum;
                    updated.avg_price = Some(parse_f64(&vo.avg_price));
                    updated.status = OrderStatus::PartiallyFilled;
                    updated.last_fill_at_ms = Some(crate::now_ms());
                    self.ctx.store.upsert_order(&updated).await?;
                }
            }
            return Ok(TpOutcome::Working);
        }

        // Not on the book: either filled or canceled. Recorded fills win.
        let (qty, vwap) = self.ctx.store.fill_aggregate(&order.order_id).await?;
        if qty + 1e-12 >= order.qty {
            return Ok(TpOutcome::Filled {
                qty,
                avg_price: vwap.unwrap_or(order.price.unwrap_or(0.0)),
            });
        }
        if crate::now_ms() - order.submitted_at_ms > ORPHAN_GRACE_MS {
            return Ok(TpOutcome::Canceled);
        }
        Ok(TpOutcome::Working)
    }

}

enum TpOutcome {
    Working,
    Filled { qty: f64, avg_price: f64 },
    Canceled,
}

/// Book a confirmed TP fill against the position: TP1 moves the venue
/// stop to break-even, TP2 arms runner trailing. Shared by the reconcile
/// loop and the private WS ingest; the caller holds the position lock and
/// persists the position afterwards.
pub async fn apply_tp_fill(
    ctx: &Ctx,
    position: &mut Position,
    mut order: Order,
    purpose: OrderPurpose,
    qty: f64,
    avg_price: f64,
) -> Result<()> {
    order.status = OrderStatus::Filled;
    order.filled_qty = qty;
    order.avg_price = Some(avg_price);
    ctx.store.upsert_order(&order).await?;

    position.qty_total = crate::exec::types::round_qty(position.qty_total - qty);
    let pnl = position.pnl(qty, avg_price);

    match purpose {
        OrderPurpose::Tp1 => {
            position.meta.tp1_filled = true;
            // Break-even: venue stop to entry.
            position.current_stop_price = position.entry_price;
            if let Some(venue) = &ctx.venue {
                if let Err(e) = venue
                    .set_trading_stop(&position.symbol, position.entry_price)
                    .await
                {
                    warn!("🔄 break-even stop move failed: {e} (next pass retries)");
                }
            }
            info!(
                "🎯 TP1 confirmed on {} — stop moved to entry {:.4}",
                position.symbol, position.entry_price
            );
        }
        OrderPurpose::Tp2 => {
            position.meta.tp2_filled = true;
            info!("🎯 TP2 confirmed on {} — runner trailing armed", position.symbol);
        }
        _ => {}
    }

    emit_report(
        ctx,
        &report_id(&position.idempotency_key, &format!("{}_FILLED", purpose.as_str())),
        &ExecutionReport {
            order_id: Some(order.order_id.clone()),
            filled_qty: Some(qty),
            avg_price: Some(avg_price),
            reason: Some(purpose.as_str().to_string()),
            timeframe: Some(position.timeframe),
            ext: [("pnl_usdt".to_string(), json!(pnl))].into_iter().collect(),
            ..ExecutionReport::new(
                position.plan_id(),
                &position.symbol,
                ReportStatus::TpHit,
            )
        },
    )
    .await
}
