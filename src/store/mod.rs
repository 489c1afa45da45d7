//! Postgres persistence. One `Store` facade over a pool; repository
//! methods are grouped per file (positions, orders, ledger, risk).
//!
//! Every write is idempotent: inserts land on a primary key or unique
//! constraint with ON CONFLICT, so redelivered events cannot create
//! duplicate rows.

pub mod ledger;
pub mod orders;
pub mod positions;
pub mod risk;
pub mod schema;

use std::time::Duration;

use anyhow::{Context, Result};
use sqlx::postgres::{PgPool, PgPoolOptions};

#[derive(Clone)]
pub struct Store {
    pool: PgPool,
}

impl Store {
    pub async fn connect(database_url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .acquire_timeout(Duration::from_secs(5))
            .connect(database_url)
            .await
            .context("postgres connect failed")?;
        tracing::info!("🗄️ Postgres pool established");
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn health_check(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    /// Apply forward-only migrations. Each statement is idempotent, so
    /// re-running on restart is safe.
    pub async fn migrate(&self) -> Result<()> {
        schema::apply(&self.pool).await
    }
}
