//! Ops endpoint: health probe and the persistent kill switch.

use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{info, warn};

use crate::events::{topic, RiskEvent, RiskEventType, Severity};
use crate::exec::emit_risk;
use crate::store::risk::FLAG_KILL_SWITCH;
use crate::Ctx;

#[derive(Serialize)]
struct Health {
    mode: String,
    db_ok: bool,
    trade_plan_lag: i64,
    trade_plan_pending: i64,
    bar_close_lag: i64,
    bar_close_pending: i64,
    kill_switch: bool,
}

#[derive(Serialize, Deserialize)]
struct KillSwitchBody {
    on: bool,
}

pub async fn serve(ctx: Ctx) {
    let addr = ctx.cfg.admin_addr.clone();
    let mut shutdown = ctx.shutdown.clone();
    let app = Router::new()
        .route("/health", get(health))
        .route("/killswitch", get(get_kill_switch).post(set_kill_switch))
        .with_state(ctx);

    let listener = match tokio::net::TcpListener::bind(&addr).await {
        Ok(l) => l,
        Err(e) => {
            warn!("🔌 admin bind {addr} failed: {e}");
            return;
        }
    };
    info!("🔌 admin endpoint on {addr}");
    if let Err(e) = axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = shutdown.changed().await;
        })
        .await
    {
        warn!("🔌 admin server stopped: {e}");
    }
}

async fn health(State(ctx): State<Ctx>) -> Json<Health> {
    let db_ok = ctx.store.health_check().await.is_ok();
    let group = &ctx.cfg.bus_group;
    let trade_plan_lag = ctx.bus.group_lag(topic::TRADE_PLAN, group).await.unwrap_or(-1);
    let trade_plan_pending = ctx.bus.pending_count(topic::TRADE_PLAN, group).await.unwrap_or(-1);
    let bar_close_lag = ctx.bus.group_lag(topic::BAR_CLOSE, group).await.unwrap_or(-1);
    let bar_close_pending = ctx.bus.pending_count(topic::BAR_CLOSE, group).await.unwrap_or(-1);
    Json(Health {
        mode: format!("{:?}", ctx.cfg.mode),
        db_ok,
        trade_plan_lag,
        trade_plan_pending,
        bar_close_lag,
        bar_close_pending,
        kill_switch: *ctx.kill_switch.borrow(),
    })
}

async fn get_kill_switch(State(ctx): State<Ctx>) -> Json<serde_json::Value> {
    Json(json!({ "on": *ctx.kill_switch.borrow() }))
}

async fn set_kill_switch(
    State(ctx): State<Ctx>,
    Json(body): Json<KillSwitchBody>,
) -> Json<serde_json::Value> {
    let value = if body.on { "1" } else { "0" };
    if let Err(e) = ctx.store.set_flag(FLAG_KILL_SWITCH, value, crate::now_ms()).await {
        warn!("🔌 kill switch persist failed: {e:#}");
        return Json(json!({ "ok": false }));
    }
    ctx.kill_switch.send_replace(body.on);
    info!("🔌 kill switch set to {}", body.on);

    if body.on {
        let _ = emit_risk(
            &ctx,
            &RiskEvent::new(
                RiskEventType::KillSwitchOn,
                Severity::Critical,
                "kill switch engaged via admin endpoint",
            ),
            "admin",
        )
        .await;
    }
    Json(json!({ "ok": true, "on": body.on }))
}
