//! Runtime settings, read once at startup from the environment.
//!
//! Every knob has a default that matches paper trading against testnet,
//! so a bare `.env` with DATABASE_URL/REDIS_URL is enough to boot.

use std::env;

use secrecy::SecretString;

// ─────────────────────────────────────────────────────────
// Mode enums
// ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionMode {
    Live,
    Paper,
    Backtest,
}

impl ExecutionMode {
    pub fn is_live(self) -> bool {
        matches!(self, ExecutionMode::Live)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarginMode {
    Isolated,
    Cross,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryOrderType {
    Market,
    Limit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutexUpgradeAction {
    Block,
    CloseLowerAndOpen,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrailMode {
    Atr,
    Pivot,
}

// ─────────────────────────────────────────────────────────
// Settings
// ─────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct Settings {
    pub mode: ExecutionMode,

    // Infrastructure
    pub database_url: String,
    pub redis_url: String,
    pub admin_addr: String,
    pub service_name: String,
    pub env_name: String,
    pub run_id: Option<String>,

    // Venue
    pub bybit_rest_url: String,
    pub bybit_ws_private_url: String,
    pub bybit_api_key: String,
    pub bybit_api_secret: SecretString,
    pub bybit_recv_window_ms: i64,

    // Sizing
    pub paper_equity: f64,
    pub risk_pct: f64,
    pub leverage: f64,
    pub margin_mode: MarginMode,
    pub min_order_value_usdt: f64,
    pub max_order_value_usdt: f64,

    // Gates
    pub max_open_positions: usize,
    pub mutex_upgrade_action: MutexUpgradeAction,
    pub cooldown_enabled: bool,
    pub cooldown_bars_1h: u32,
    pub cooldown_bars_4h: u32,
    pub cooldown_bars_1d: u32,

    // Entry order manager
    pub entry_order_type: EntryOrderType,
    pub entry_timeout_ms: i64,
    pub entry_partial_fill_timeout_ms: i64,
    pub entry_max_retries: u32,
    pub entry_reprice_bps: f64,
    pub entry_fallback_market: bool,

    // Exits
    pub runner_trail_mode: TrailMode,
    pub runner_atr_mult: f64,
    pub runner_pivot_bars: usize,
    pub secondary_rule_enabled: bool,

    // Risk circuit
    pub kill_switch_enabled: bool,
    pub kill_switch_force_on: bool,
    pub daily_loss_limit_pct: f64,
    pub risk_circuit_enabled: bool,
    pub daily_drawdown_soft_pct: f64,
    pub daily_drawdown_hard_pct: f64,

    // Consistency
    pub drift_enabled: bool,
    pub drift_threshold_pct: f64,
    pub drift_window_ms: i64,
    pub wallet_drift_threshold_pct: f64,

    // Private WS
    pub private_ws_enabled: bool,
    pub private_ws_topics: Vec<String>,

    // Loops
    pub reconcile_interval_ms: u64,
    pub reconcile_interval_ws_ms: u64,
    pub position_sync_interval_ms: u64,
    pub snapshot_interval_ms: u64,
    pub risk_monitor_interval_ms: u64,
    pub data_lag_threshold_ms: i64,

    // Bus
    pub bus_group: String,
    pub bus_consumer: String,
    pub bus_block_ms: u64,
    pub bus_batch: usize,

    // Rate limiter
    pub rl_global_per_sec: f64,
    pub rl_symbol_per_sec: f64,
    pub rl_critical_reserve: f64,
    pub rl_stale_wait_ms: u64,

    // Plan idempotency lock
    pub plan_lock_ttl_ms: u64,
}

fn var_f64(key: &str, default: f64) -> f64 {
    env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn var_i64(key: &str, default: i64) -> i64 {
    env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn var_u64(key: &str, default: u64) -> u64 {
    env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn var_u32(key: &str, default: u32) -> u32 {
    env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn var_usize(key: &str, default: usize) -> usize {
    env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn var_bool(key: &str, default: bool) -> bool {
    match env::var(key) {
        Ok(v) => v != "0" && v.to_lowercase() != "false",
        Err(_) => default,
    }
}

fn var_str(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

impl Settings {
    pub fn from_env() -> anyhow::Result<Self> {
        let mode = match var_str("EXECUTION_MODE", "PAPER").to_uppercase().as_str() {
            "LIVE" => ExecutionMode::Live,
            "BACKTEST" => ExecutionMode::Backtest,
            _ => ExecutionMode::Paper,
        };

        let margin_mode = match var_str("MARGIN_MODE", "isolated").to_lowercase().as_str() {
            "cross" => MarginMode::Cross,
            _ => MarginMode::Isolated,
        };

        let entry_order_type = match var_str("EXECUTION_ENTRY_ORDER_TYPE", "Market").as_str() {
            "Limit" | "limit" | "LIMIT" => EntryOrderType::Limit,
            _ => EntryOrderType::Market,
        };

        let mutex_upgrade_action =
            match var_str("POSITION_MUTEX_UPGRADE_ACTION", "BLOCK").to_uppercase().as_str() {
                "CLOSE_LOWER_AND_OPEN" => MutexUpgradeAction::CloseLowerAndOpen,
                _ => MutexUpgradeAction::Block,
            };

        let runner_trail_mode = match var_str("RUNNER_TRAIL_MODE", "ATR").to_uppercase().as_str() {
            "PIVOT" => TrailMode::Pivot,
            _ => TrailMode::Atr,
        };

        let private_ws_topics = var_str("BYBIT_WS_PRIVATE_TOPICS", "order,execution,position,wallet")
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();

        Ok(Self {
            mode,

            database_url: var_str("DATABASE_URL", "postgres://localhost/perp_executor"),
            redis_url: var_str("REDIS_URL", "redis://127.0.0.1:6379"),
            admin_addr: var_str("ADMIN_ADDR", "127.0.0.1:8787"),
            service_name: var_str("SERVICE_NAME", "perp-executor"),
            env_name: var_str("ENV_NAME", "dev"),
            run_id: env::var("RUN_ID").ok(),

            bybit_rest_url: var_str("BYBIT_REST_URL", "https://api-testnet.bybit.com"),
            bybit_ws_private_url: var_str(
                "BYBIT_WS_PRIVATE_URL",
                "wss://stream-testnet.bybit.com/v5/private",
            ),
            bybit_api_key: var_str("BYBIT_API_KEY", ""),
            bybit_api_secret: SecretString::from(var_str("BYBIT_API_SECRET", "")),
            bybit_recv_window_ms: var_i64("BYBIT_RECV_WINDOW_MS", 5_000),

            paper_equity: var_f64("PAPER_EQUITY", 10_000.0),
            risk_pct: var_f64("RISK_PCT", 0.005),
            leverage: var_f64("LEVERAGE", 3.0),
            margin_mode,
            min_order_value_usdt: var_f64("MIN_ORDER_VALUE_USDT", 10.0),
            max_order_value_usdt: var_f64("MAX_ORDER_VALUE_USDT", 5_000.0),

            max_open_positions: var_usize("MAX_OPEN_POSITIONS", 5),
            mutex_upgrade_action,
            cooldown_enabled: var_bool("COOLDOWN_ENABLED", true),
            cooldown_bars_1h: var_u32("COOLDOWN_BARS_1H", 4),
            cooldown_bars_4h: var_u32("COOLDOWN_BARS_4H", 2),
            cooldown_bars_1d: var_u32("COOLDOWN_BARS_1D", 1),

            entry_order_type,
            entry_timeout_ms: var_i64("EXECUTION_ENTRY_TIMEOUT_MS", 15_000),
            entry_partial_fill_timeout_ms: var_i64("EXECUTION_ENTRY_PARTIAL_FILL_TIMEOUT_MS", 20_000),
            entry_max_retries: var_u32("EXECUTION_ENTRY_MAX_RETRIES", 2),
            entry_reprice_bps: var_f64("EXECUTION_ENTRY_REPRICE_BPS", 5.0),
            entry_fallback_market: var_bool("EXECUTION_ENTRY_FALLBACK_MARKET", true),

            runner_trail_mode,
            runner_atr_mult: var_f64("RUNNER_ATR_MULT", 2.0),
            runner_pivot_bars: var_usize("RUNNER_PIVOT_BARS", 5),
            secondary_rule_enabled: var_bool("SECONDARY_RULE_ENABLED", true),

            kill_switch_enabled: var_bool("ACCOUNT_KILL_SWITCH_ENABLED", true),
            kill_switch_force_on: var_bool("ACCOUNT_KILL_SWITCH_FORCE_ON", false),
            daily_loss_limit_pct: var_f64("DAILY_LOSS_LIMIT_PCT", 0.05),
            risk_circuit_enabled: var_bool("RISK_CIRCUIT_ENABLED", true),
            daily_drawdown_soft_pct: var_f64("DAILY_DRAWDOWN_SOFT_PCT", 0.03),
            daily_drawdown_hard_pct: var_f64("DAILY_DRAWDOWN_HARD_PCT", 0.05),

            drift_enabled: var_bool("CONSISTENCY_DRIFT_ENABLED", true),
            drift_threshold_pct: var_f64("CONSISTENCY_DRIFT_THRESHOLD_PCT", 0.10),
            drift_window_ms: var_i64("CONSISTENCY_DRIFT_WINDOW_MS", 300_000),
            wallet_drift_threshold_pct: var_f64("WALLET_DRIFT_THRESHOLD_PCT", 0.02),

            private_ws_enabled: var_bool("BYBIT_WS_PRIVATE_ENABLED", true),
            private_ws_topics,

            reconcile_interval_ms: var_u64("RECONCILE_INTERVAL_MS", 5_000),
            reconcile_interval_ws_ms: var_u64("RECONCILE_INTERVAL_WS_MS", 15_000),
            position_sync_interval_ms: var_u64("POSITION_SYNC_INTERVAL_MS", 10_000),
            snapshot_interval_ms: var_u64("SNAPSHOT_INTERVAL_MS", 60_000),
            risk_monitor_interval_ms: var_u64("RISK_MONITOR_INTERVAL_MS", 5_000),
            data_lag_threshold_ms: var_i64("DATA_LAG_THRESHOLD_MS", 120_000),

            bus_group: var_str("BUS_GROUP", "executor"),
            bus_consumer: var_str("BUS_CONSUMER", "executor-1"),
            bus_block_ms: var_u64("BUS_BLOCK_MS", 2_000),
            bus_batch: var_usize("BUS_BATCH", 50),

            rl_global_per_sec: var_f64("RL_GLOBAL_PER_SEC", 8.0),
            rl_symbol_per_sec: var_f64("RL_SYMBOL_PER_SEC", 4.0),
            rl_critical_reserve: var_f64("RL_CRITICAL_RESERVE", 2.0),
            rl_stale_wait_ms: var_u64("RL_STALE_WAIT_MS", 1_500),

            plan_lock_ttl_ms: var_u64("PLAN_LOCK_TTL_MS", 120_000),
        })
    }

    /// Cooldown length in bars for a timeframe. Timeframes without an
    /// explicit knob inherit the 1h value.
    pub fn cooldown_bars(&self, timeframe: &str) -> u32 {
        match timeframe {
            "4h" => self.cooldown_bars_4h,
            "1d" => self.cooldown_bars_1d,
            _ => self.cooldown_bars_1h,
        }
    }

    /// Effective reconcile poll interval: backed off when the private WS
    /// is carrying order/fill updates.
    pub fn reconcile_poll_ms(&self) -> u64 {
        if self.private_ws_enabled {
            self.reconcile_interval_ws_ms
        } else {
            self.reconcile_interval_ms
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_paper_testnet() {
        let s = Settings::from_env().unwrap();
        assert_eq!(s.mode, ExecutionMode::Paper);
        assert!(s.bybit_rest_url.contains("testnet"));
        assert_eq!(s.entry_timeout_ms, 15_000);
        assert_eq!(s.entry_max_retries, 2);
    }

    #[test]
    fn test_cooldown_bars_fallback() {
        let s = Settings::from_env().unwrap();
        assert_eq!(s.cooldown_bars("4h"), s.cooldown_bars_4h);
        assert_eq!(s.cooldown_bars("15m"), s.cooldown_bars_1h);
    }
}
