//! Risk-state rows, cooldowns, runtime flags, wallet/account snapshots.

use anyhow::Result;
use sqlx::postgres::PgRow;
use sqlx::Row;

use super::Store;
use crate::events::{PlanSide, Timeframe};
use crate::exec::types::{Cooldown, RiskState, RiskStateMeta, SnapshotSource, WalletSnapshot};

pub const FLAG_KILL_SWITCH: &str = "kill_switch";

fn row_to_risk_state(row: &PgRow) -> Result<RiskState> {
    let meta: serde_json::Value = row.try_get("meta")?;
    Ok(RiskState {
        trade_date: row.try_get("trade_date")?,
        starting_equity: row.try_get("starting_equity")?,
        current_equity: row.try_get("current_equity")?,
        min_equity: row.try_get("min_equity")?,
        max_equity: row.try_get("max_equity")?,
        drawdown_pct: row.try_get("drawdown_pct")?,
        soft_halt: row.try_get("soft_halt")?,
        hard_halt: row.try_get("hard_halt")?,
        kill_switch: row.try_get("kill_switch")?,
        meta: serde_json::from_value::<RiskStateMeta>(meta).unwrap_or_default(),
    })
}

impl Store {
    // ── risk_state ──

    pub async fn risk_state(&self, trade_date: chrono::NaiveDate) -> Result<Option<RiskState>> {
        let row = sqlx::query(
            "SELECT trade_date, starting_equity, current_equity, min_equity, max_equity, \
                    drawdown_pct, soft_halt, hard_halt, kill_switch, meta \
             FROM risk_state WHERE trade_date = $1",
        )
        .bind(trade_date)
        .fetch_optional(self.pool())
        .await?;
        row.as_ref().map(row_to_risk_state).transpose()
    }

    pub async fn upsert_risk_state(&self, rs: &RiskState) -> Result<()> {
        sqlx::query(
            "INSERT INTO risk_state (trade_date, starting_equity, current_equity, min_equity, \
                 max_equity, drawdown_pct, soft_halt, hard_halt, kill_switch, meta) \
             VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10) \
             ON CONFLICT (trade_date) DO UPDATE SET \
                 current_equity = EXCLUDED.current_equity, \
                 min_equity = EXCLUDED.min_equity, \
                 max_equity = EXCLUDED.max_equity, \
                 drawdown_pct = EXCLUDED.drawdown_pct, \
                 soft_halt = EXCLUDED.soft_halt, \
                 hard_halt = EXCLUDED.hard_halt, \
                 kill_switch = EXCLUDED.kill_switch, \
                 meta = EXCLUDED.meta",
        )
        .bind(rs.trade_date)
        .bind(rs.starting_equity)
        .bind(rs.current_equity)
        .bind(rs.min_equity)
        .bind(rs.max_equity)
        .bind(rs.drawdown_pct)
        .bind(rs.soft_halt)
        .bind(rs.hard_halt)
        .bind(rs.kill_switch)
        .bind(serde_json::to_value(&rs.meta)?)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    // ── cooldowns ──

    pub async fn insert_cooldown(&self, c: &Cooldown) -> Result<()> {
        sqlx::query(
            "INSERT INTO cooldowns (symbol, side, timeframe, reason, until_ts_ms) \
             VALUES ($1,$2,$3,$4,$5)",
        )
        .bind(&c.symbol)
        .bind(c.side.as_str())
        .bind(c.timeframe.as_str())
        .bind(&c.reason)
        .bind(c.until_ts_ms)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    /// Any row with until_ts in the future blocks the key.
    pub async fn active_cooldown(
        &self,
        symbol: &str,
        side: PlanSide,
        timeframe: Timeframe,
        now_ms: i64,
    ) -> Result<Option<i64>> {
        let row = sqlx::query(
            "SELECT MAX(until_ts_ms) AS until_ts FROM cooldowns \
             WHERE symbol = $1 AND side = $2 AND timeframe = $3 AND until_ts_ms > $4",
        )
        .bind(symbol)
        .bind(side.as_str())
        .bind(timeframe.as_str())
        .bind(now_ms)
        .fetch_one(self.pool())
        .await?;
        Ok(row.try_get::<Option<i64>, _>("until_ts")?)
    }

    // ── runtime flags ──

    pub async fn set_flag(&self, key: &str, value: &str, now_ms: i64) -> Result<()> {
        sqlx::query(
            "INSERT INTO runtime_flags (key, value, updated_at_ms) VALUES ($1,$2,$3) \
             ON CONFLICT (key) DO UPDATE SET value = EXCLUDED.value, \
                 updated_at_ms = EXCLUDED.updated_at_ms",
        )
        .bind(key)
        .bind(value)
        .bind(now_ms)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    pub async fn get_flag(&self, key: &str) -> Result<Option<String>> {
        let row = sqlx::query("SELECT value FROM runtime_flags WHERE key = $1")
            .bind(key)
            .fetch_optional(self.pool())
            .await?;
        Ok(row.map(|r| r.try_get("value")).transpose()?)
    }

    // ── snapshots ──

    pub async fn insert_wallet_snapshot(&self, s: &WalletSnapshot) -> Result<()> {
        sqlx::query(
            "INSERT INTO wallet_snapshots (source, equity, available, ts_ms, raw) \
             VALUES ($1,$2,$3,$4,$5)",
        )
        .bind(s.source.as_str())
        .bind(s.equity)
        .bind(s.available)
        .bind(s.ts_ms)
        .bind(&s.raw)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    pub async fn latest_wallet_snapshot(
        &self,
        source: SnapshotSource,
    ) -> Result<Option<WalletSnapshot>> {
        let row = sqlx::query(
            "SELECT source, equity, available, ts_ms, raw FROM wallet_snapshots \
             WHERE source = $1 ORDER BY ts_ms DESC LIMIT 1",
        )
        .bind(source.as_str())
        .fetch_optional(self.pool())
        .await?;
        Ok(row
            .map(|r| -> Result<WalletSnapshot> {
                Ok(WalletSnapshot {
                    source,
                    equity: r.try_get("equity")?,
                    available: r.try_get("available")?,
                    ts_ms: r.try_get("ts_ms")?,
                    raw: r.try_get("raw")?,
                })
            })
            .transpose()?)
    }

    pub async fn insert_account_snapshot(
        &self,
        source: SnapshotSource,
        ts_ms: i64,
        raw: &serde_json::Value,
    ) -> Result<()> {
        sqlx::query("INSERT INTO account_snapshots (source, ts_ms, raw) VALUES ($1,$2,$3)")
            .bind(source.as_str())
            .bind(ts_ms)
            .bind(raw)
            .execute(self.pool())
            .await?;
        Ok(())
    }
}
