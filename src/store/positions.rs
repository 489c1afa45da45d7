//! Position repository. The `idempotency_key` unique constraint is the
//! exactly-once admission guarantee: a redelivered plan inserts zero rows.

use anyhow::{Context, Result};
use sqlx::postgres::PgRow;
use sqlx::Row;

use super::Store;
use crate::events::{PlanSide, Timeframe};
use crate::exec::types::{Bias, ExitReason, Position, PositionMeta, PositionStatus};

fn row_to_position(row: &PgRow) -> Result<Position> {
    let timeframe: String = row.try_get("timeframe")?;
    let side: String = row.try_get("side")?;
    let bias: String = row.try_get("bias")?;
    let status: String = row.try_get("status")?;
    let exit_reason: Option<String> = row.try_get("exit_reason")?;
    let meta: serde_json::Value = row.try_get("meta")?;

    Ok(Position {
        position_id: row.try_get("position_id")?,
        idempotency_key: row.try_get("idempotency_key")?,
        symbol: row.try_get("symbol")?,
        timeframe: Timeframe::parse(&timeframe)
            .with_context(|| format!("bad timeframe in db: {timeframe}"))?,
        side: if side == "SELL" { PlanSide::Sell } else { PlanSide::Buy },
        bias: if bias == "SHORT" { Bias::Short } else { Bias::Long },
        qty_total: row.try_get("qty_total")?,
        qty_runner: row.try_get("qty_runner")?,
        entry_price: row.try_get("entry_price")?,
        primary_sl_price: row.try_get("primary_sl_price")?,
        current_stop_price: row.try_get("current_stop_price")?,
        runner_stop_price: row.try_get("runner_stop_price")?,
        status: PositionStatus::parse(&status)
            .with_context(|| format!("bad status in db: {status}"))?,
        entry_close_time_ms: row.try_get("entry_close_time_ms")?,
        opened_at_ms: row.try_get("opened_at_ms")?,
        closed_at_ms: row.try_get("closed_at_ms")?,
        exit_reason: exit_reason.as_deref().and_then(ExitReason::parse),
        hist_entry: row.try_get("hist_entry")?,
        meta: serde_json::from_value::<PositionMeta>(meta).unwrap_or_default(),
    })
}

const SELECT_COLS: &str = "position_id, idempotency_key, symbol, timeframe, side, bias, \
     qty_total, qty_runner, entry_price, primary_sl_price, current_stop_price, \
     runner_stop_price, status, entry_close_time_ms, opened_at_ms, closed_at_ms, \
     exit_reason, hist_entry, meta";

impl Store {
    /// Insert a freshly opened position. Returns false when the
    /// idempotency key already has a row (duplicate admission).
    pub async fn insert_position(&self, p: &Position) -> Result<bool> {
        let res = sqlx::query(
            "INSERT INTO positions (position_id, idempotency_key, symbol, timeframe, side, bias, \
                 qty_total, qty_runner, entry_price, primary_sl_price, current_stop_price, \
                 runner_stop_price, status, entry_close_time_ms, opened_at_ms, closed_at_ms, \
                 exit_reason, hist_entry, meta) \
             VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10,$11,$12,$13,$14,$15,$16,$17,$18,$19) \
             ON CONFLICT (idempotency_key) DO NOTHING",
        )
        .bind(&p.position_id)
        .bind(&p.idempotency_key)
        .bind(&p.symbol)
        .bind(p.timeframe.as_str())
        .bind(p.side.as_str())
        .bind(p.bias.as_str())
        .bind(p.qty_total)
        .bind(p.qty_runner)
        .bind(p.entry_price)
        .bind(p.primary_sl_price)
        .bind(p.current_stop_price)
        .bind(p.runner_stop_price)
        .bind(p.status.as_str())
        .bind(p.entry_close_time_ms)
        .bind(p.opened_at_ms)
        .bind(p.closed_at_ms)
        .bind(p.exit_reason.map(|r| r.as_str()))
        .bind(p.hist_entry)
        .bind(serde_json::to_value(&p.meta)?)
        .execute(self.pool())
        .await?;
        Ok(res.rows_affected() > 0)
    }

    /// Full-row update by position id. Callers hold the position's
    /// advisory lock across read-modify-write.
    pub async fn update_position(&self, p: &Position) -> Result<()> {
        sqlx::query(
            "UPDATE positions SET qty_total=$2, qty_runner=$3, current_stop_price=$4, \
                 runner_stop_price=$5, status=$6, closed_at_ms=$7, exit_reason=$8, meta=$9 \
             WHERE position_id=$1",
        )
        .bind(&p.position_id)
        .bind(p.qty_total)
        .bind(p.qty_runner)
        .bind(p.current_stop_price)
        .bind(p.runner_stop_price)
        .bind(p.status.as_str())
        .bind(p.closed_at_ms)
        .bind(p.exit_reason.map(|r| r.as_str()))
        .bind(serde_json::to_value(&p.meta)?)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    pub async fn position_by_key(&self, idempotency_key: &str) -> Result<Option<Position>> {
        let row = sqlx::query(&format!(
            "SELECT {SELECT_COLS} FROM positions WHERE idempotency_key = $1"
        ))
        .bind(idempotency_key)
        .fetch_optional(self.pool())
        .await?;
        row.as_ref().map(row_to_position).transpose()
    }

    pub async fn position_by_id(&self, position_id: &str) -> Result<Option<Position>> {
        let row = sqlx::query(&format!(
            "SELECT {SELECT_COLS} FROM positions WHERE position_id = $1"
        ))
        .bind(position_id)
        .fetch_optional(self.pool())
        .await?;
        row.as_ref().map(row_to_position).transpose()
    }

    pub async fn open_positions(&self) -> Result<Vec<Position>> {
        let rows = sqlx::query(&format!(
            "SELECT {SELECT_COLS} FROM positions WHERE status IN ('OPEN','CLOSING') \
             ORDER BY opened_at_ms"
        ))
        .fetch_all(self.pool())
        .await?;
        rows.iter().map(row_to_position).collect()
    }

    pub async fn open_positions_for_bar(
        &self,
        symbol: &str,
        timeframe: Timeframe,
    ) -> Result<Vec<Position>> {
        let rows = sqlx::query(&format!(
            "SELECT {SELECT_COLS} FROM positions \
             WHERE status = 'OPEN' AND symbol = $1 AND timeframe = $2"
        ))
        .bind(symbol)
        .bind(timeframe.as_str())
        .fetch_all(self.pool())
        .await?;
        rows.iter().map(row_to_position).collect()
    }

    pub async fn open_positions_same_symbol_side(
        &self,
        symbol: &str,
        side: PlanSide,
    ) -> Result<Vec<Position>> {
        let rows = sqlx::query(&format!(
            "SELECT {SELECT_COLS} FROM positions \
             WHERE status IN ('OPEN','CLOSING') AND symbol = $1 AND side = $2"
        ))
        .bind(symbol)
        .bind(side.as_str())
        .fetch_all(self.pool())
        .await?;
        rows.iter().map(row_to_position).collect()
    }

    pub async fn count_open_positions(&self) -> Result<i64> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM positions WHERE status = 'OPEN'")
            .fetch_one(self.pool())
            .await?;
        Ok(row.try_get::<i64, _>("n")?)
    }
}
