//! Service entry: build the container, run one crash-recovery pass, then
//! spawn every loop and wait for ctrl-c.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use perp_executor::bybit::rate_limit::RateLimiter;
use perp_executor::bybit::rest::BybitRest;
use perp_executor::config::Settings;
use perp_executor::events::topic;
use perp_executor::exec::bars::BarConsumer;
use perp_executor::exec::executor::PlanExecutor;
use perp_executor::exec::order_manager::OrderManager;
use perp_executor::exec::position_sync::PositionSync;
use perp_executor::exec::reconcile::Reconciler;
use perp_executor::exec::risk_state::{RiskMonitor, Snapshotter};
use perp_executor::store::risk::FLAG_KILL_SWITCH;
use perp_executor::{admin, bus, dedup, locks, store, Services};

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();

    // Console logging always; daily-rolling file logging when LOG_DIR is
    // set. The appender guard must outlive main.
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _appender_guard = match std::env::var("LOG_DIR") {
        Ok(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "perp-executor.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(writer)
                .with_ansi(false)
                .init();
            Some(guard)
        }
        Err(_) => {
            tracing_subscriber::fmt().with_env_filter(filter).init();
            None
        }
    };

    let cfg = Settings::from_env()?;
    info!("🚀 perp-executor starting (mode={:?}, env={})", cfg.mode, cfg.env_name);

    let store = store::Store::connect(&cfg.database_url).await?;
    store.migrate().await?;

    let bus = bus::EventBus::connect(&cfg.redis_url, &cfg.service_name, &cfg.env_name).await?;
    for t in [topic::TRADE_PLAN, topic::BAR_CLOSE] {
        bus.ensure_group(t, &cfg.bus_group).await?;
    }

    let locks = locks::PlanLocks::connect(&cfg.redis_url, cfg.plan_lock_ttl_ms).await?;

    let limiter = Arc::new(RateLimiter::new(
        cfg.rl_global_per_sec,
        cfg.rl_symbol_per_sec,
        cfg.rl_critical_reserve,
    ));
    let venue = if cfg.mode.is_live() {
        Some(Arc::new(BybitRest::new(&cfg, limiter.clone())?))
    } else {
        None
    };

    // Kill switch: forced-on env OR the persisted runtime flag.
    let persisted_kill = matches!(
        store.get_flag(FLAG_KILL_SWITCH).await?.as_deref(),
        Some("1") | Some("true") | Some("on")
    );
    let (kill_tx, _kill_rx) = watch::channel(cfg.kill_switch_force_on || persisted_kill);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let drift_window = Duration::from_millis(cfg.drift_window_ms.max(0) as u64);
    let ctx = Arc::new(Services {
        dedup: dedup::RiskEventDedup::new(drift_window),
        pos_locks: locks::PositionLocks::new(),
        last_price: tokio::sync::RwLock::new(HashMap::new()),
        kill_switch: kill_tx,
        shutdown: shutdown_rx,
        cfg: cfg.clone(),
        store,
        bus,
        locks,
        venue,
        limiter,
    });

    // Crash recovery: converge whatever was open before the restart.
    if cfg.mode.is_live() {
        info!("🔧 startup recovery pass");
        if let Err(e) = Reconciler::new(ctx.clone()).pass().await {
            warn!("🔧 startup reconcile failed: {e:#}");
        }
        if let Err(e) = PositionSync::new(ctx.clone()).pass().await {
            warn!("🔧 startup position sync failed: {e:#}");
        }
    }

    let mut tasks = Vec::new();
    tasks.push(tokio::spawn(PlanExecutor::new(ctx.clone()).run()));
    tasks.push(tokio::spawn(BarConsumer::new(ctx.clone()).run()));
    tasks.push(tokio::spawn(RiskMonitor::new(ctx.clone()).run()));
    tasks.push(tokio::spawn(admin::serve(ctx.clone())));

    if cfg.mode.is_live() {
        tasks.push(tokio::spawn(OrderManager::new(ctx.clone()).run()));
        tasks.push(tokio::spawn(Reconciler::new(ctx.clone()).run()));
        tasks.push(tokio::spawn(PositionSync::new(ctx.clone()).run()));
        tasks.push(tokio::spawn(Snapshotter::new(ctx.clone()).run()));
        if cfg.private_ws_enabled {
            tasks.push(tokio::spawn(
                perp_executor::bybit::private_ws::PrivateWsListener::new(ctx.clone()).run(),
            ));
        }
    }

    tokio::signal::ctrl_c().await?;
    info!("🛬 shutdown signal received");
    let _ = shutdown_tx.send(true);

    // Grace window: loops finish their current message and ack it.
    let drain = async {
        for task in tasks {
            let _ = task.await;
        }
    };
    if tokio::time::timeout(Duration::from_secs(10), drain).await.is_err() {
        warn!("🛬 grace window elapsed, exiting with tasks still running");
    }
    info!("🛬 bye");
    Ok(())
}
