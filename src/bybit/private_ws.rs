//! Private WebSocket ingest — authenticated channel for order, execution,
//! position and wallet updates.
//!
//! Architecture:
//!   private WS ──typed topic──→ handler ──→ orders/fills/positions/
//!   wallet_snapshots, execution reports, drift events
//!
//! Per-topic ordering is preserved by handling messages inline on the
//! read loop. Fills are deduped by venue execution id (append-only fills
//! table), so replays after reconnect are harmless. Unknown message
//! types are logged and dropped, never fatal.

use std::time::Duration;

use anyhow::Result;
use futures::{SinkExt, StreamExt};
use hmac::{Hmac, Mac};
use secrecy::ExposeSecret;
use serde_json::{json, Value};
use sha2::Sha256;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};

use super::types::{map_order_status, parse_f64};
use crate::events::{
    ExecutionReport, ReportStatus, RiskEvent, RiskEventType, Severity,
};
use crate::exec::reconcile::apply_tp_fill;
use crate::exec::types::{
    Fill, Order, OrderPurpose, OrderStatus, PositionStatus, SnapshotSource, WalletSnapshot,
};
use crate::exec::{emit_report, emit_risk, report_id};
use crate::Ctx;

type HmacSha256 = Hmac<Sha256>;

pub struct PrivateWsListener {
    ctx: Ctx,
}

impl PrivateWsListener {
    pub fn new(ctx: Ctx) -> Self {
        Self { ctx }
    }

    /// Actor main loop: connect, auth, subscribe, dispatch. Reconnects on
    /// disconnect and announces each reconnect on the risk stream.
    pub async fn run(self) {
        info!(
            "👤 private WS listener started | topics={:?}",
            self.ctx.cfg.private_ws_topics
        );
        let mut first = true;
        let mut shutdown = self.ctx.shutdown.clone();
        loop {
            if *shutdown.borrow() {
                break;
            }
            if !first {
                let _ = emit_risk(
                    &self.ctx,
                    &RiskEvent::new(
                        RiskEventType::WsReconnect,
                        Severity::Info,
                        "private WS reconnecting",
                    ),
                    "private_ws",
                )
                .await;
            }
            first = false;

            match self.connect_and_listen(&mut shutdown).await {
                Ok(()) => info!("👤 private WS closed"),
                Err(e) => warn!("👤 private WS error: {e:#}"),
            }
            if *shutdown.borrow() {
                break;
            }
            tokio::time::sleep(Duration::from_secs(3)).await;
        }
        info!("👤 private WS listener shutting down");
    }

    async fn connect_and_listen(
        &self,
        shutdown: &mut tokio::sync::watch::Receiver<bool>,
    ) -> Result<()> {
        let url = url::Url::parse(&self.ctx.cfg.bybit_ws_private_url)
            .map_err(|e| anyhow::anyhow!("bad BYBIT_WS_PRIVATE_URL: {e}"))?;
        info!(%url, "👤 connecting private WS");

        let (ws, _) = tokio::time::timeout(Duration::from_secs(10), connect_async(url.as_str()))
            .await
            .map_err(|_| anyhow::anyhow!("WS connect timeout"))??;
        let (mut write, mut read) = ws.split();

        // Auth: HMAC of "GET/realtime{expires}".
        let expires = crate::now_ms() + 10_000;
        let mut mac = HmacSha256::new_from_slice(
            self.ctx.cfg.bybit_api_secret.expose_secret().as_bytes(),
        )
        .expect("hmac accepts any key length");
        mac.update(format!("GET/realtime{expires}").as_bytes());
        let signature = hex::encode(mac.finalize().into_bytes());

        write
            .send(Message::Text(
                json!({
                    "op": "auth",
                    "args": [self.ctx.cfg.bybit_api_key, expires, signature],
                })
                .to_string(),
            ))
            .await?;
        write
            .send(Message::Text(
                json!({
                    "op": "subscribe",
                    "args": self.ctx.cfg.private_ws_topics,
                })
                .to_string(),
            ))
            .await?;

        // Keepalive.
        let ping = tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(20));
            loop {
                interval.tick().await;
                if write
                    .send(Message::Text(json!({ "op": "ping" }).to_string()))
                    .await
                    .is_err()
                {
                    break;
                }
            }
        });

        loop {
            tokio::select! {
                msg = read.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => {
                            if let Ok(value) = serde_json::from_str::<Value>(&text) {
                                if let Err(e) = self.dispatch(&value).await {
                                    warn!("👤 handler failed: {e:#}");
                                }
                            }
                        }
                        Some(Ok(Message::Close(_))) | None => break,
                        Some(Err(e)) => {
                            warn!("👤 read error: {e}");
                            break;
                        }
                        _ => {}
                    }
                }
                _ = shutdown.changed() => break,
            }
        }

        ping.abort();
        Ok(())
    }

    async fn dispatch(&self, value: &Value) -> Result<()> {
        let Some(topic) = value.get("topic").and_then(|v| v.as_str()) else {
            // op acks (auth/subscribe/pong) land here.
            debug!("👤 non-topic message: {}", value);
            return Ok(());
        };
        let data = value
            .get("data")
            .and_then(|v| v.as_array())
            .cloned()
            .unwrap_or_default();

        match topic {
            t if t.starts_with("order") => {
                for item in &data {
                    self.handle_order(item).await?;
                }
            }
            t if t.starts_with("execution") => {
                for item in &data {
                    self.handle_execution(item).await?;
                }
            }
            t if t.starts_with("position") => {
                for item in &data {
                    self.handle_position(item).await?;
                }
            }
            t if t.starts_with("wallet") => {
                for item in &data {
                    self.handle_wallet(item).await?;
                }
            }
            other => {
                debug!("👤 ignoring unknown topic: {}", other);
            }
        }
        Ok(())
    }

    /// Resolve the local order row for a WS item: venue order id first,
    /// then the order-link id we stamped at submit time.
    async fn resolve_order(&self, item: &Value) -> Result<Option<Order>> {
        if let Some(venue_id) = item.get("orderId").and_then(|v| v.as_str()) {
            if let Some(order) = self.ctx.store.order_by_venue_id(venue_id).await? {
                return Ok(Some(order));
            }
        }
        if let Some(link) = item.get("orderLinkId").and_then(|v| v.as_str()) {
            // Retry/fallback submissions suffix the original id.
            let base = link
                .split_once("-r")
                .map(|(b, _)| b)
                .or_else(|| link.split_once("-mkt").map(|(b, _)| b))
                .unwrap_or(link);
            if let Some(order) = self.ctx.store.order_by_id(base).await? {
                return Ok(Some(order));
            }
        }
        Ok(None)
    }

    // ─────────────────────────────────────────────────
    // order topic
    // ─────────────────────────────────────────────────

    async fn handle_order(&self, item: &Value) -> Result<()> {
        let Some(mut order) = self.resolve_order(item).await? else {
            debug!("👤 order update for untracked order");
            return Ok(());
        };
        if order.status.is_terminal() {
            return Ok(());
        }

        let venue_status = item
            .get("orderStatus")
            .and_then(|v| v.as_str())
            .unwrap_or_default();
        let cum = item
            .get("cumExecQty")
            .and_then(|v| v.as_str())
            .map(parse_f64)
            .unwrap_or(order.filled_qty);
        let avg = item
            .get("avgPrice")
            .and_then(|v| v.as_str())
            .map(parse_f64)
            .filter(|p| *p > 0.0);

        if cum > order.filled_qty {
            order.filled_qty = cum;
            order.last_fill_at_ms = Some(crate::now_ms());
        }
        if avg.is_some() {
            order.avg_price = avg;
        }
        let Some(new_status) = map_order_status(venue_status) else {
            self.ctx.store.upsert_order(&order).await?;
            return Ok(());
        };
        order.status = new_status;
        self.ctx.store.upsert_order(&order).await?;

        match new_status {
            OrderStatus::Filled => self.on_order_finished(&order).await?,
            OrderStatus::Canceled | OrderStatus::Failed => {
                emit_report(
                    &self.ctx,
                    &report_id(
                        &order.idempotency_key,
                        &format!("{}_{}", order.purpose.as_str(), new_status.as_str()),
                    ),
                    &ExecutionReport {
                        order_id: Some(order.order_id.clone()),
                        reason: Some(venue_status.to_string()),
                        filled_qty: Some(order.filled_qty),
                        ..ExecutionReport::new(
                            &order.idempotency_key,
                            item.get("symbol").and_then(|v| v.as_str()).unwrap_or("?"),
                            ReportStatus::OrderRejected,
                        )
                    },
                )
                .await?;
            }
            _ => {}
        }
        Ok(())
    }

    /// A tracked order finished filling: propagate to the position.
    async fn on_order_finished(&self, order: &Order) -> Result<()> {
        let Some(position) = self
            .ctx
            .store
            .position_by_key(&order.idempotency_key)
            .await?
        else {
            return Ok(());
        };
        let lock = self.ctx.pos_locks.for_position(&position.position_id).await;
        let _guard = lock.lock().await;
        let Some(mut position) = self.ctx.store.position_by_id(&position.position_id).await?
        else {
            return Ok(());
        };

        match order.purpose {
            OrderPurpose::Entry => {
                emit_report(
                    &self.ctx,
                    &report_id(&order.idempotency_key, "ENTRY_FILLED"),
                    &ExecutionReport {
                        order_id: Some(order.order_id.clone()),
                        filled_qty: Some(order.filled_qty),
                        avg_price: order.avg_price,
                        fill_ratio: Some((order.filled_qty / order.qty).min(1.0)),
                        timeframe: Some(position.timeframe),
                        ..ExecutionReport::new(
                            &order.idempotency_key,
                            &position.symbol,
                            ReportStatus::Filled,
                        )
                    },
                )
                .await?;
            }
            OrderPurpose::Tp1 if !position.meta.tp1_filled => {
                apply_tp_fill(
                    &self.ctx,
                    &mut position,
                    order.clone(),
                    OrderPurpose::Tp1,
                    order.filled_qty,
                    order.avg_price.unwrap_or_default(),
                )
                .await?;
                self.ctx.store.update_position(&position).await?;
            }
            OrderPurpose::Tp2 if !position.meta.tp2_filled => {
                apply_tp_fill(
                    &self.ctx,
                    &mut position,
                    order.clone(),
                    OrderPurpose::Tp2,
                    order.filled_qty,
                    order.avg_price.unwrap_or_default(),
                )
                .await?;
                self.ctx.store.update_position(&position).await?;
            }
            _ => {}
        }
        Ok(())
    }

    // ─────────────────────────────────────────────────
    // execution topic
    // ─────────────────────────────────────────────────

    async fn handle_execution(&self, item: &Value) -> Result<()> {
        let Some(mut order) = self.resolve_order(item).await? else {
            debug!("👤 execution for untracked order");
            return Ok(());
        };

        let exec_id = item
            .get("execId")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();
        if exec_id.is_empty() {
            return Ok(());
        }
        let fill = Fill {
            fill_id: uuid::Uuid::new_v4().to_string(),
            order_id: order.order_id.clone(),
            symbol: item
                .get("symbol")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string(),
            purpose: order.purpose,
            side: order.side,
            exec_qty: item.get("execQty").and_then(|v| v.as_str()).map(parse_f64).unwrap_or(0.0),
            exec_price: item
                .get("execPrice")
                .and_then(|v| v.as_str())
                .map(parse_f64)
                .unwrap_or(0.0),
            fee: item.get("execFee").and_then(|v| v.as_str()).map(parse_f64).unwrap_or(0.0),
            exec_time_ms: item
                .get("execTime")
                .and_then(|v| v.as_str())
                .and_then(|s| s.parse().ok())
                .unwrap_or_else(crate::now_ms),
            venue_exec_id: exec_id,
        };
        // Idempotent by venue exec id; redelivery inserts nothing.
        if !self.ctx.store.insert_fill(&fill).await? {
            return Ok(());
        }

        // Converge the order from its fills proactively; don't wait for
        // the order topic to catch up.
        let (qty, vwap) = self.ctx.store.fill_aggregate(&order.order_id).await?;
        order.filled_qty = qty;
        order.avg_price = vwap;
        order.last_fill_at_ms = Some(fill.exec_time_ms);
        if qty + 1e-12 >= order.qty && !order.status.is_terminal() {
            order.status = OrderStatus::Filled;
            self.ctx.store.upsert_order(&order).await?;
            self.on_order_finished(&order).await?;
        } else {
            if !order.status.is_terminal() {
                order.status = OrderStatus::PartiallyFilled;
            }
            self.ctx.store.upsert_order(&order).await?;
        }
        Ok(())
    }

    // ─────────────────────────────────────────────────
    // position topic
    // ─────────────────────────────────────────────────

    async fn handle_position(&self, item: &Value) -> Result<()> {
        let symbol = item.get("symbol").and_then(|v| v.as_str()).unwrap_or_default();
        let ws_side = item.get("side").and_then(|v| v.as_str()).unwrap_or_default();
        let ws_size = item
            .get("size")
            .and_then(|v| v.as_str())
            .map(parse_f64)
            .unwrap_or(0.0);
        if symbol.is_empty() {
            return Ok(());
        }

        let positions = self.ctx.store.open_positions().await?;
        for position in positions
            .into_iter()
            .filter(|p| p.symbol == symbol && p.status == PositionStatus::Open)
            .filter(|p| crate::exec::executor::venue_side_matches(ws_side, p.side))
        {
            let lock = self.ctx.pos_locks.for_position(&position.position_id).await;
            let _guard = lock.lock().await;
            let Some(mut position) =
                self.ctx.store.position_by_id(&position.position_id).await?
            else {
                continue;
            };

            position.meta.ws_position = Some(item.clone());
            self.ctx.store.update_position(&position).await?;

            if self.ctx.cfg.drift_enabled && position.qty_total > 0.0 {
                let drift = size_drift(ws_size, position.qty_total);
                if drift_exceeds(drift, self.ctx.cfg.drift_threshold_pct) {
                    emit_risk(
                        &self.ctx,
                        &RiskEvent {
                            ext: Some(json!({
                                "ws_size": ws_size,
                                "local_size": position.qty_total,
                                "drift_pct": drift,
                            })),
                            ..RiskEvent::new(
                                RiskEventType::ConsistencyDrift,
                                Severity::Important,
                                format!(
                                    "position size drift {:.2}% on {}",
                                    drift * 100.0,
                                    symbol
                                ),
                            )
                        }
                        .for_symbol(symbol),
                        symbol,
                    )
                    .await?;
                }
            }
        }
        Ok(())
    }

    // ─────────────────────────────────────────────────
    // wallet topic
    // ─────────────────────────────────────────────────

    async fn handle_wallet(&self, item: &Value) -> Result<()> {
        let equity = item
            .get("totalEquity")
            .and_then(|v| v.as_str())
            .map(parse_f64)
            .unwrap_or(0.0);
        let available = item
            .get("totalAvailableBalance")
            .and_then(|v| v.as_str())
            .map(parse_f64)
            .unwrap_or(0.0);
        if equity <= 0.0 {
            return Ok(());
        }

        self.ctx
            .store
            .insert_wallet_snapshot(&WalletSnapshot {
                source: SnapshotSource::Ws,
                equity,
                available,
                ts_ms: crate::now_ms(),
                raw: item.clone(),
            })
            .await?;

        if let Some(rest) = self
            .ctx
            .store
            .latest_wallet_snapshot(SnapshotSource::Rest)
            .await?
        {
            if rest.equity > 0.0 {
                let drift = size_drift(equity, rest.equity);
                if drift_exceeds(drift, self.ctx.cfg.wallet_drift_threshold_pct) {
                    emit_risk(
                        &self.ctx,
                        &RiskEvent {
                            ext: Some(json!({
                                "ws_equity": equity,
                                "rest_equity": rest.equity,
                                "drift_pct": drift,
                            })),
                            ..RiskEvent::new(
                                RiskEventType::ConsistencyDrift,
                                Severity::Important,
                                format!("wallet drift {:.2}% WS vs REST", drift * 100.0),
                            )
                        },
                        "wallet",
                    )
                    .await?;
                }
            }
        }
        Ok(())
    }
}

/// Relative divergence of an observed size against the local book value.
fn size_drift(observed: f64, local: f64) -> f64 {
    if local == 0.0 {
        return 0.0;
    }
    (observed - local).abs() / local
}

/// Threshold check with FP tolerance: 0.11 vs 0.10 computes to
/// 0.09999999999999995, which must still count as a 10% drift.
fn drift_exceeds(drift: f64, threshold: f64) -> bool {
    drift >= threshold - 1e-9
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ten_percent_size_drift_trips_default_threshold() {
        // ws 0.11 vs local 0.10 with the 0.10 default threshold.
        let drift = size_drift(0.11, 0.1);
        assert!(drift_exceeds(drift, 0.10));
    }

    #[test]
    fn test_sub_threshold_drift_stays_quiet() {
        assert!(!drift_exceeds(size_drift(0.105, 0.1), 0.10));
        assert!(!drift_exceeds(size_drift(0.109, 0.1), 0.10));
        // The other direction trips too.
        assert!(drift_exceeds(size_drift(0.09, 0.1), 0.10));
    }

    #[test]
    fn test_size_drift_symmetric_and_zero_safe() {
        assert!(size_drift(0.09, 0.1) > 0.09);
        assert_eq!(size_drift(5.0, 0.0), 0.0);
        assert_eq!(size_drift(0.1, 0.1), 0.0);
    }
}
