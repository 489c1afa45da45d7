//! Append-only ledgers: fills, execution reports, risk events, bar-close
//! emit guard. All keyed inserts return whether a row actually landed, so
//! callers can skip the publish leg on redelivery.

use anyhow::Result;
use sqlx::Row;

use super::Store;
use crate::events::{ExecutionReport, RiskEvent, Timeframe};
use crate::exec::types::Fill;

impl Store {
    /// Append a fill. False = this venue execution id was already
    /// recorded (WS redelivery), nothing changed.
    pub async fn insert_fill(&self, f: &Fill) -> Result<bool> {
        let res = sqlx::query(
            "INSERT INTO fills (fill_id, order_id, symbol, purpose, side, exec_qty, \
                 exec_price, fee, exec_time_ms, venue_exec_id) \
             VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10) \
             ON CONFLICT (venue_exec_id) DO NOTHING",
        )
        .bind(&f.fill_id)
        .bind(&f.order_id)
        .bind(&f.symbol)
        .bind(f.purpose.as_str())
        .bind(f.side.as_str())
        .bind(f.exec_qty)
        .bind(f.exec_price)
        .bind(f.fee)
        .bind(f.exec_time_ms)
        .bind(&f.venue_exec_id)
        .execute(self.pool())
        .await?;
        Ok(res.rows_affected() > 0)
    }

    /// Aggregate recorded fills for an order: (total qty, vwap).
    pub async fn fill_aggregate(&self, order_id: &str) -> Result<(f64, Option<f64>)> {
        let row = sqlx::query(
            "SELECT COALESCE(SUM(exec_qty), 0) AS qty, \
                    CASE WHEN COALESCE(SUM(exec_qty), 0) > 0 \
                         THEN SUM(exec_qty * exec_price) / SUM(exec_qty) END AS vwap \
             FROM fills WHERE order_id = $1",
        )
        .bind(order_id)
        .fetch_one(self.pool())
        .await?;
        Ok((row.try_get("qty")?, row.try_get("vwap")?))
    }

    /// Persist an execution report by event id. False = duplicate.
    pub async fn insert_execution_report(
        &self,
        event_id: &str,
        report: &ExecutionReport,
        ts_ms: i64,
    ) -> Result<bool> {
        let res = sqlx::query(
            "INSERT INTO execution_reports (event_id, plan_id, symbol, status, payload, ts_ms) \
             VALUES ($1,$2,$3,$4,$5,$6) ON CONFLICT (event_id) DO NOTHING",
        )
        .bind(event_id)
        .bind(&report.plan_id)
        .bind(&report.symbol)
        .bind(serde_json::to_value(report.status)?.as_str().unwrap_or("?").to_string())
        .bind(serde_json::to_value(report)?)
        .bind(ts_ms)
        .execute(self.pool())
        .await?;
        Ok(res.rows_affected() > 0)
    }

    /// Persist a risk event by event id. False = duplicate.
    pub async fn insert_risk_event(
        &self,
        event_id: &str,
        event: &RiskEvent,
        ts_ms: i64,
    ) -> Result<bool> {
        let res = sqlx::query(
            "INSERT INTO risk_events (event_id, type, severity, symbol, payload, ts_ms) \
             VALUES ($1,$2,$3,$4,$5,$6) ON CONFLICT (event_id) DO NOTHING",
        )
        .bind(event_id)
        .bind(serde_json::to_value(event.kind)?.as_str().unwrap_or("?").to_string())
        .bind(serde_json::to_value(event.severity)?.as_str().unwrap_or("?").to_string())
        .bind(&event.symbol)
        .bind(serde_json::to_value(event)?)
        .bind(ts_ms)
        .execute(self.pool())
        .await?;
        Ok(res.rows_affected() > 0)
    }

    /// Bar idempotency guard. False = this (symbol, timeframe, close_time)
    /// was already processed; gap-refill must not double-drive the matcher.
    pub async fn record_bar_emit(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        close_time_ms: i64,
        now_ms: i64,
    ) -> Result<bool> {
        let res = sqlx::query(
            "INSERT INTO bar_close_emits (symbol, timeframe, close_time_ms, seen_at_ms) \
             VALUES ($1,$2,$3,$4) ON CONFLICT DO NOTHING",
        )
        .bind(symbol)
        .bind(timeframe.as_str())
        .bind(close_time_ms)
        .bind(now_ms)
        .execute(self.pool())
        .await?;
        Ok(res.rows_affected() > 0)
    }
}
