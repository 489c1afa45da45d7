//! Ordered, forward-only schema migrations. Applied names are recorded in
//! `schema_migrations`; every statement is also written to be idempotent
//! so a partially-applied run converges on retry.

use anyhow::{Context, Result};
use sqlx::postgres::PgPool;

const MIGRATIONS: &[(&str, &str)] = &[
    (
        "0001_positions",
        r#"
        CREATE TABLE IF NOT EXISTS positions (
            position_id        TEXT PRIMARY KEY,
            idempotency_key    TEXT NOT NULL UNIQUE,
            symbol             TEXT NOT NULL,
            timeframe          TEXT NOT NULL,
            side               TEXT NOT NULL,
            bias               TEXT NOT NULL,
            qty_total          DOUBLE PRECISION NOT NULL,
            qty_runner         DOUBLE PRECISION NOT NULL,
            entry_price        DOUBLE PRECISION NOT NULL,
            primary_sl_price   DOUBLE PRECISION NOT NULL,
            current_stop_price DOUBLE PRECISION NOT NULL,
            runner_stop_price  DOUBLE PRECISION,
            status             TEXT NOT NULL,
            entry_close_time_ms BIGINT NOT NULL,
            opened_at_ms       BIGINT NOT NULL,
            closed_at_ms       BIGINT,
            exit_reason        TEXT,
            hist_entry         DOUBLE PRECISION,
            meta               JSONB NOT NULL DEFAULT '{}'
        );
        CREATE INDEX IF NOT EXISTS idx_positions_status ON positions (status);
        CREATE INDEX IF NOT EXISTS idx_positions_symbol ON positions (symbol, status);
        "#,
    ),
    (
        "0002_orders",
        r#"
        CREATE TABLE IF NOT EXISTS orders (
            order_id        TEXT PRIMARY KEY,
            idempotency_key TEXT NOT NULL,
            purpose         TEXT NOT NULL,
            side            TEXT NOT NULL,
            order_type      TEXT NOT NULL,
            qty             DOUBLE PRECISION NOT NULL,
            price           DOUBLE PRECISION,
            reduce_only     BOOLEAN NOT NULL DEFAULT FALSE,
            status          TEXT NOT NULL,
            venue_order_id  TEXT,
            filled_qty      DOUBLE PRECISION NOT NULL DEFAULT 0,
            avg_price       DOUBLE PRECISION,
            submitted_at_ms BIGINT NOT NULL,
            retry_count     INTEGER NOT NULL DEFAULT 0,
            last_fill_at_ms BIGINT,
            payload         JSONB NOT NULL DEFAULT 'null',
            UNIQUE (idempotency_key, purpose)
        );
        CREATE INDEX IF NOT EXISTS idx_orders_venue ON orders (venue_order_id);
        CREATE INDEX IF NOT EXISTS idx_orders_status ON orders (status);
        "#,
    ),
    (
        "0003_fills",
        r#"
        CREATE TABLE IF NOT EXISTS fills (
            fill_id       TEXT PRIMARY KEY,
            order_id      TEXT NOT NULL,
            symbol        TEXT NOT NULL,
            purpose       TEXT NOT NULL,
            side          TEXT NOT NULL,
            exec_qty      DOUBLE PRECISION NOT NULL,
            exec_price    DOUBLE PRECISION NOT NULL,
            fee           DOUBLE PRECISION NOT NULL DEFAULT 0,
            exec_time_ms  BIGINT NOT NULL,
            venue_exec_id TEXT NOT NULL UNIQUE
        );
        CREATE INDEX IF NOT EXISTS idx_fills_order ON fills (order_id);
        "#,
    ),
    (
        "0004_ledgers",
        r#"
        CREATE TABLE IF NOT EXISTS execution_reports (
            event_id TEXT PRIMARY KEY,
            plan_id  TEXT NOT NULL,
            symbol   TEXT NOT NULL,
            status   TEXT NOT NULL,
            payload  JSONB NOT NULL,
            ts_ms    BIGINT NOT NULL
        );
        CREATE TABLE IF NOT EXISTS risk_events (
            event_id TEXT PRIMARY KEY,
            type     TEXT NOT NULL,
            severity TEXT NOT NULL,
            symbol   TEXT,
            payload  JSONB NOT NULL,
            ts_ms    BIGINT NOT NULL
        );
        "#,
    ),
    (
        "0005_risk_state",
        r#"
        CREATE TABLE IF NOT EXISTS risk_state (
            trade_date      DATE PRIMARY KEY,
            starting_equity DOUBLE PRECISION NOT NULL,
            current_equity  DOUBLE PRECISION NOT NULL,
            min_equity      DOUBLE PRECISION NOT NULL,
            max_equity      DOUBLE PRECISION NOT NULL,
            drawdown_pct    DOUBLE PRECISION NOT NULL DEFAULT 0,
            soft_halt       BOOLEAN NOT NULL DEFAULT FALSE,
            hard_halt       BOOLEAN NOT NULL DEFAULT FALSE,
            kill_switch     BOOLEAN NOT NULL DEFAULT FALSE,
            meta            JSONB NOT NULL DEFAULT '{}'
        );
        CREATE TABLE IF NOT EXISTS cooldowns (
            id          BIGSERIAL PRIMARY KEY,
            symbol      TEXT NOT NULL,
            side        TEXT NOT NULL,
            timeframe   TEXT NOT NULL,
            reason      TEXT NOT NULL,
            until_ts_ms BIGINT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_cooldowns_key
            ON cooldowns (symbol, side, timeframe, until_ts_ms);
        CREATE TABLE IF NOT EXISTS runtime_flags (
            key           TEXT PRIMARY KEY,
            value         TEXT NOT NULL,
            updated_at_ms BIGINT NOT NULL
        );
        "#,
    ),
    (
        "0006_snapshots",
        r#"
        CREATE TABLE IF NOT EXISTS wallet_snapshots (
            id        BIGSERIAL PRIMARY KEY,
            source    TEXT NOT NULL,
            equity    DOUBLE PRECISION NOT NULL,
            available DOUBLE PRECISION NOT NULL,
            ts_ms     BIGINT NOT NULL,
            raw       JSONB NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_wallet_snapshots_source
            ON wallet_snapshots (source, ts_ms DESC);
        CREATE TABLE IF NOT EXISTS account_snapshots (
            id     BIGSERIAL PRIMARY KEY,
            source TEXT NOT NULL,
            ts_ms  BIGINT NOT NULL,
            raw    JSONB NOT NULL
        );
        "#,
    ),
    (
        "0007_bar_close_emits",
        r#"
        CREATE TABLE IF NOT EXISTS bar_close_emits (
            symbol        TEXT NOT NULL,
            timeframe     TEXT NOT NULL,
            close_time_ms BIGINT NOT NULL,
            seen_at_ms    BIGINT NOT NULL,
            PRIMARY KEY (symbol, timeframe, close_time_ms)
        );
        "#,
    ),
];

pub async fn apply(pool: &PgPool) -> Result<()> {
    sqlx::query(
        "CREATE TABLE IF NOT EXISTS schema_migrations (
            name       TEXT PRIMARY KEY,
            applied_at TIMESTAMPTZ NOT NULL DEFAULT now()
        )",
    )
    .execute(pool)
    .await?;

    for (name, sql) in MIGRATIONS {
        let done: Option<(String,)> =
            sqlx::query_as("SELECT name FROM schema_migrations WHERE name = $1")
                .bind(name)
                .fetch_optional(pool)
                .await?;
        if done.is_some() {
            continue;
        }

        for stmt in sql.split(';').map(str::trim).filter(|s| !s.is_empty()) {
            sqlx::query(stmt)
                .execute(pool)
                .await
                .with_context(|| format!("migration {name}"))?;
        }
        sqlx::query("INSERT INTO schema_migrations (name) VALUES ($1) ON CONFLICT DO NOTHING")
            .bind(name)
            .execute(pool)
            .await?;
        tracing::info!("🗄️ migration applied: {}", name);
    }
    Ok(())
}
