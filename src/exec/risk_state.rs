//! Daily risk ledger: equity tracking, drawdown halts, consecutive-loss
//! counter, and the monitor loop that enforces the hard-halt flatten.

use std::time::Duration;

use anyhow::Result;
use chrono::NaiveDate;
use serde_json::json;
use tracing::{info, warn};

use crate::events::{RiskEvent, RiskEventType, Severity};
use crate::exec::types::{ExitReason, RiskState, SnapshotSource, WalletSnapshot};
use crate::exec::{emit_risk, kill_switch_on};
use crate::store::risk::FLAG_KILL_SWITCH;
use crate::Ctx;

/// Trade date for an epoch-ms timestamp (UTC calendar day).
pub fn trade_date(ts_ms: i64) -> NaiveDate {
    chrono::DateTime::from_timestamp_millis(ts_ms)
        .map(|dt| dt.date_naive())
        .unwrap_or_else(|| chrono::Utc::now().date_naive())
}

/// Load today's row, seeding a fresh one from `equity_hint` when absent.
async fn load_or_seed(ctx: &Ctx, equity_hint: f64) -> Result<RiskState> {
    let date = trade_date(crate::now_ms());
    match ctx.store.risk_state(date).await? {
        Some(rs) => Ok(rs),
        None => {
            let rs = RiskState::fresh(date, equity_hint);
            ctx.store.upsert_risk_state(&rs).await?;
            Ok(rs)
        }
    }
}

/// Apply a fresh equity reading: update min/max, drawdown, halts, the
/// kill-switch OR, then persist.
pub async fn update_equity(ctx: &Ctx, equity: f64) -> Result<RiskState> {
    let cfg = &ctx.cfg;
    let mut rs = load_or_seed(ctx, equity).await?;

    rs.current_equity = equity;
    rs.min_equity = rs.min_equity.min(equity);
    rs.max_equity = rs.max_equity.max(equity);
    rs.drawdown_pct = if rs.max_equity > 0.0 {
        (rs.max_equity - rs.current_equity) / rs.max_equity
    } else {
        0.0
    };

    if cfg.risk_circuit_enabled {
        let was_soft = rs.soft_halt;
        let was_hard = rs.hard_halt;
        rs.soft_halt = rs.drawdown_pct >= cfg.daily_drawdown_soft_pct;
        rs.hard_halt = rs.drawdown_pct >= cfg.daily_drawdown_hard_pct;
        if rs.soft_halt && !was_soft {
            warn!("🛑 soft halt: drawdown {:.2}%", rs.drawdown_pct * 100.0);
        }
        if rs.hard_halt && !was_hard {
            warn!("🛑 HARD halt: drawdown {:.2}%", rs.drawdown_pct * 100.0);
        }
    }

    let daily_loss_breach = rs.starting_equity > 0.0
        && (rs.starting_equity - rs.current_equity) / rs.starting_equity
            >= cfg.daily_loss_limit_pct;
    rs.kill_switch = kill_switch_on(ctx) || daily_loss_breach || rs.kill_switch;
    if daily_loss_breach {
        ctx.store
            .set_flag(FLAG_KILL_SWITCH, "1", crate::now_ms())
            .await?;
        ctx.kill_switch.send_replace(true);
        emit_risk(
            ctx,
            &RiskEvent::new(
                RiskEventType::KillSwitchOn,
                Severity::Critical,
                format!(
                    "daily loss limit breached: {:.2}% ≥ {:.2}%",
                    (rs.starting_equity - rs.current_equity) / rs.starting_equity * 100.0,
                    cfg.daily_loss_limit_pct * 100.0
                ),
            ),
            "daily_loss",
        )
        .await?;
    }

    ctx.store.upsert_risk_state(&rs).await?;
    Ok(rs)
}

/// Book a realized close PnL into the ledger: shifts paper equity and
/// maintains the consecutive-loss counter (reset on profit/break-even).
/// Returns the updated counter.
pub async fn record_close_pnl(ctx: &Ctx, pnl: f64) -> Result<u32> {
    let mut rs = load_or_seed(ctx, ctx.cfg.paper_equity).await?;

    if !ctx.cfg.mode.is_live() {
        rs.current_equity += pnl;
        rs.min_equity = rs.min_equity.min(rs.current_equity);
        rs.max_equity = rs.max_equity.max(rs.current_equity);
    }
    if pnl < 0.0 {
        rs.meta.consecutive_loss_count += 1;
    } else {
        rs.meta.consecutive_loss_count = 0;
    }
    let count = rs.meta.consecutive_loss_count;
    ctx.store.upsert_risk_state(&rs).await?;

    if !ctx.cfg.mode.is_live() {
        // Re-run the circuit against the shifted equity.
        update_equity(ctx, rs.current_equity).await?;
    }
    Ok(count)
}

// ─────────────────────────────────────────────────────────
// Monitor loop
// ─────────────────────────────────────────────────────────

/// Periodically folds the latest wallet snapshot into the ledger and, on
/// hard halt, force-flattens every open position with reduce-only exits.
pub struct RiskMonitor {
    ctx: Ctx,
}

impl RiskMonitor {
    pub fn new(ctx: Ctx) -> Self {
        Self { ctx }
    }

    pub async fn run(self) {
        info!("🛡️ risk monitor started");
        let mut shutdown = self.ctx.shutdown.clone();
        let mut tick =
            tokio::time::interval(Duration::from_millis(self.ctx.cfg.risk_monitor_interval_ms));
        loop {
            tokio::select! {
                _ = tick.tick() => {
                    if let Err(e) = self.step().await {
                        warn!("🛡️ risk monitor step failed: {e:#}");
                    }
                }
                _ = shutdown.changed() => break,
            }
        }
        info!("🛡️ risk monitor shutting down");
    }

    async fn step(&self) -> Result<()> {
        // Mirror the persisted kill-switch flag into the watch channel so
        // admission sees admin toggles from other instances.
        if self.ctx.cfg.kill_switch_enabled {
            let persisted = matches!(
                self.ctx.store.get_flag(FLAG_KILL_SWITCH).await?.as_deref(),
                Some("1") | Some("true") | Some("on")
            );
            if persisted != *self.ctx.kill_switch.borrow() {
                self.ctx.kill_switch.send_replace(persisted);
            }
        }

        let equity = if self.ctx.cfg.mode.is_live() {
            let ws = self
                .ctx
                .store
                .latest_wallet_snapshot(SnapshotSource::Ws)
                .await?;
            let rest = self
                .ctx
                .store
                .latest_wallet_snapshot(SnapshotSource::Rest)
                .await?;
            match (ws, rest) {
                (Some(a), Some(b)) => Some(if a.ts_ms >= b.ts_ms { a.equity } else { b.equity }),
                (Some(a), None) => Some(a.equity),
                (None, Some(b)) => Some(b.equity),
                (None, None) => None,
            }
        } else {
            let rs = self
                .ctx
                .store
                .risk_state(trade_date(crate::now_ms()))
                .await?;
            rs.map(|r| r.current_equity)
        };

        let Some(equity) = equity else { return Ok(()) };
        let rs = update_equity(&self.ctx, equity).await?;

        if rs.hard_halt {
            self.flatten_all().await?;
        }
        Ok(())
    }

    async fn flatten_all(&self) -> Result<()> {
        let open = self.ctx.store.open_positions().await?;
        if open.is_empty() {
            return Ok(());
        }
        warn!("🛑 hard halt: flattening {} open position(s)", open.len());
        let executor = crate::exec::executor::PlanExecutor::new(self.ctx.clone());
        for position in open {
            if let Err(e) = executor
                .force_exit(position, ExitReason::HardHaltExit)
                .await
            {
                warn!("🛑 flatten failed: {e:#}");
            }
        }
        Ok(())
    }
}

// ─────────────────────────────────────────────────────────
// REST wallet snapshotter
// ─────────────────────────────────────────────────────────

/// LIVE only: periodic wallet-balance capture feeding the ledger and the
/// WS-vs-REST drift comparison.
pub struct Snapshotter {
    ctx: Ctx,
}

impl Snapshotter {
    pub fn new(ctx: Ctx) -> Self {
        Self { ctx }
    }

    pub async fn run(self) {
        info!("📸 snapshotter started");
        let mut shutdown = self.ctx.shutdown.clone();
        let mut tick =
            tokio::time::interval(Duration::from_millis(self.ctx.cfg.snapshot_interval_ms));
        loop {
            tokio::select! {
                _ = tick.tick() => {
                    if let Err(e) = self.step().await {
                        warn!("📸 snapshot failed: {e:#}");
                    }
                }
                _ = shutdown.changed() => break,
            }
        }
        info!("📸 snapshotter shutting down");
    }

    async fn step(&self) -> Result<()> {
        let Some(venue) = &self.ctx.venue else { return Ok(()) };
        let read = venue
            .wallet_balance()
            .await
            .map_err(|e| anyhow::anyhow!("wallet balance: {e}"))?;
        if read.degraded {
            return Ok(()); // don't persist stale data as a fresh snapshot
        }
        let equity = crate::bybit::types::parse_f64(&read.value.total_equity);
        let available = crate::bybit::types::parse_f64(&read.value.total_available_balance);
        self.ctx
            .store
            .insert_wallet_snapshot(&WalletSnapshot {
                source: SnapshotSource::Rest,
                equity,
                available,
                ts_ms: crate::now_ms(),
                raw: json!({
                    "totalEquity": read.value.total_equity,
                    "totalAvailableBalance": read.value.total_available_balance,
                }),
            })
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_trade_date_utc() {
        // 2024-03-01T00:00:00Z
        let d = trade_date(1_709_251_200_000);
        assert_eq!(d, NaiveDate::from_ymd_opt(2024, 3, 1).unwrap());
        // One ms before midnight is still the previous day.
        let d = trade_date(1_709_251_199_999);
        assert_eq!(d, NaiveDate::from_ymd_opt(2024, 2, 29).unwrap());
    }
}
