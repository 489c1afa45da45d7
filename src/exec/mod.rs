//! Execution core: plan admission, order placement, exit management,
//! paper matching, reconciliation, position sync, daily risk ledger.

pub mod bars;
pub mod executor;
pub mod gates;
pub mod order_manager;
pub mod paper;
pub mod position_sync;
pub mod reconcile;
pub mod risk_state;
pub mod sizing;
pub mod trailing;
pub mod types;

use anyhow::Result;

use crate::events::{topic, Envelope, ExecutionReport, RiskEvent};
use crate::Ctx;

/// Deterministic execution-report id: re-emitting the same state change
/// composes the same id, which the persist step then dedups.
pub fn report_id(idempotency_key: &str, tag: &str) -> String {
    format!("exr:{idempotency_key}:{tag}")
}

/// Persist-then-publish an execution report. Publishing is skipped when
/// the event id already exists, so redelivery causes no duplicate output.
pub async fn emit_report(ctx: &Ctx, event_id: &str, report: &ExecutionReport) -> Result<()> {
    let ts = crate::now_ms();
    if ctx.store.insert_execution_report(event_id, report, ts).await? {
        let envelope = Envelope::with_id(
            event_id.to_string(),
            &ctx.cfg.service_name,
            &ctx.cfg.env_name,
            serde_json::to_value(report)?,
        );
        ctx.bus.publish(topic::EXECUTION_REPORT, &envelope).await?;
    }
    Ok(())
}

/// Persist-then-publish a risk event. Windowed types are suppressed per
/// (type, key) inside the configured window.
pub async fn emit_risk(ctx: &Ctx, event: &RiskEvent, window_key: &str) -> Result<()> {
    if !ctx.dedup.should_emit(event.kind, window_key).await {
        return Ok(());
    }
    let event_id = uuid::Uuid::new_v4().to_string();
    let ts = crate::now_ms();
    if ctx.store.insert_risk_event(&event_id, event, ts).await? {
        let envelope = Envelope::with_id(
            event_id,
            &ctx.cfg.service_name,
            &ctx.cfg.env_name,
            serde_json::to_value(event)?,
        );
        ctx.bus.publish(topic::RISK_EVENT, &envelope).await?;
    }
    Ok(())
}

/// Current kill-switch view: forced-on env, persisted flag, in-process
/// watch. Any of them set means no new entries.
pub fn kill_switch_on(ctx: &Ctx) -> bool {
    ctx.cfg.kill_switch_enabled && (ctx.cfg.kill_switch_force_on || *ctx.kill_switch.borrow())
}
