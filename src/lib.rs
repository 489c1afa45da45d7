pub mod admin;
pub mod bus;
pub mod bybit;
pub mod config;
pub mod dedup;
pub mod events;
pub mod exec;
pub mod locks;
pub mod store;

use std::sync::Arc;

use tokio::sync::watch;

/// Service container assembled once at startup and shared by every loop.
///
/// Loops never call each other directly — they communicate through the
/// database and the event bus. The container only carries the shared
/// infrastructure handles.
pub struct Services {
    pub cfg: config::Settings,
    pub store: store::Store,
    pub bus: bus::EventBus,
    pub locks: locks::PlanLocks,
    pub pos_locks: locks::PositionLocks,
    pub venue: Option<Arc<bybit::rest::BybitRest>>,
    pub limiter: Arc<bybit::rate_limit::RateLimiter>,
    pub dedup: dedup::RiskEventDedup,
    pub kill_switch: watch::Sender<bool>,
    /// Last close price seen per symbol (fed by the bar_close consumer).
    pub last_price: tokio::sync::RwLock<std::collections::HashMap<String, f64>>,
    pub shutdown: watch::Receiver<bool>,
}

pub type Ctx = Arc<Services>;

/// Epoch milliseconds, UTC.
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
