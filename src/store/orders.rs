//! Order repository. One row per (idempotency_key, purpose): an entry
//! retry reprices the existing ENTRY row instead of growing the table.

use anyhow::{Context, Result};
use sqlx::postgres::PgRow;
use sqlx::Row;

use super::Store;
use crate::events::PlanSide;
use crate::exec::types::{Order, OrderPurpose, OrderStatus, OrderType};

fn row_to_order(row: &PgRow) -> Result<Order> {
    let purpose: String = row.try_get("purpose")?;
    let side: String = row.try_get("side")?;
    let order_type: String = row.try_get("order_type")?;
    let status: String = row.try_get("status")?;
    let retry_count: i32 = row.try_get("retry_count")?;

    Ok(Order {
        order_id: row.try_get("order_id")?,
        idempotency_key: row.try_get("idempotency_key")?,
        purpose: OrderPurpose::parse(&purpose)
            .with_context(|| format!("bad purpose in db: {purpose}"))?,
        side: if side == "SELL" { PlanSide::Sell } else { PlanSide::Buy },
        order_type: OrderType::parse(&order_type)
            .with_context(|| format!("bad order_type in db: {order_type}"))?,
        qty: row.try_get("qty")?,
        price: row.try_get("price")?,
        reduce_only: row.try_get("reduce_only")?,
        status: OrderStatus::parse(&status)
            .with_context(|| format!("bad order status in db: {status}"))?,
        venue_order_id: row.try_get("venue_order_id")?,
        filled_qty: row.try_get("filled_qty")?,
        avg_price: row.try_get("avg_price")?,
        submitted_at_ms: row.try_get("submitted_at_ms")?,
        retry_count: retry_count as u32,
        last_fill_at_ms: row.try_get("last_fill_at_ms")?,
        payload: row.try_get("payload")?,
    })
}

const SELECT_COLS: &str = "order_id, idempotency_key, purpose, side, order_type, qty, price, \
     reduce_only, status, venue_order_id, filled_qty, avg_price, submitted_at_ms, \
     retry_count, last_fill_at_ms, payload";

impl Store {
    pub async fn upsert_order(&self, o: &Order) -> Result<()> {
        sqlx::query(
            "INSERT INTO orders (order_id, idempotency_key, purpose, side, order_type, qty, \
                 price, reduce_only, status, venue_order_id, filled_qty, avg_price, \
                 submitted_at_ms, retry_count, last_fill_at_ms, payload) \
             VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10,$11,$12,$13,$14,$15,$16) \
             ON CONFLICT (idempotency_key, purpose) DO UPDATE SET \
                 order_type = EXCLUDED.order_type, \
                 qty = EXCLUDED.qty, \
                 price = EXCLUDED.price, \
                 status = EXCLUDED.status, \
                 venue_order_id = EXCLUDED.venue_order_id, \
                 filled_qty = EXCLUDED.filled_qty, \
                 avg_price = EXCLUDED.avg_price, \
                 submitted_at_ms = EXCLUDED.submitted_at_ms, \
                 retry_count = EXCLUDED.retry_count, \
                 last_fill_at_ms = EXCLUDED.last_fill_at_ms, \
                 payload = EXCLUDED.payload",
        )
        .bind(&o.order_id)
        .bind(&o.idempotency_key)
        .bind(o.purpose.as_str())
        .bind(o.side.as_str())
        .bind(o.order_type.as_str())
        .bind(o.qty)
        .bind(o.price)
        .bind(o.reduce_only)
        .bind(o.status.as_str())
        .bind(&o.venue_order_id)
        .bind(o.filled_qty)
        .bind(o.avg_price)
        .bind(o.submitted_at_ms)
        .bind(o.retry_count as i32)
        .bind(o.last_fill_at_ms)
        .bind(&o.payload)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    pub async fn order_for(
        &self,
        idempotency_key: &str,
        purpose: OrderPurpose,
    ) -> Result<Option<Order>> {
        let row = sqlx::query(&format!(
            "SELECT {SELECT_COLS} FROM orders WHERE idempotency_key = $1 AND purpose = $2"
        ))
        .bind(idempotency_key)
        .bind(purpose.as_str())
        .fetch_optional(self.pool())
        .await?;
        row.as_ref().map(row_to_order).transpose()
    }

    pub async fn orders_for_key(&self, idempotency_key: &str) -> Result<Vec<Order>> {
        let rows = sqlx::query(&format!(
            "SELECT {SELECT_COLS} FROM orders WHERE idempotency_key = $1"
        ))
        .bind(idempotency_key)
        .fetch_all(self.pool())
        .await?;
        rows.iter().map(row_to_order).collect()
    }

    pub async fn order_by_id(&self, order_id: &str) -> Result<Option<Order>> {
        let row = sqlx::query(&format!(
            "SELECT {SELECT_COLS} FROM orders WHERE order_id = $1"
        ))
        .bind(order_id)
        .fetch_optional(self.pool())
        .await?;
        row.as_ref().map(row_to_order).transpose()
    }

    pub async fn order_by_venue_id(&self, venue_order_id: &str) -> Result<Option<Order>> {
        let row = sqlx::query(&format!(
            "SELECT {SELECT_COLS} FROM orders WHERE venue_order_id = $1"
        ))
        .bind(venue_order_id)
        .fetch_optional(self.pool())
        .await?;
        row.as_ref().map(row_to_order).transpose()
    }

    /// Non-terminal ENTRY orders, used to re-arm the order manager after a
    /// restart.
    pub async fn live_entry_orders(&self) -> Result<Vec<Order>> {
        let rows = sqlx::query(&format!(
            "SELECT {SELECT_COLS} FROM orders \
             WHERE purpose = 'ENTRY' AND status IN ('SUBMITTED','PARTIALLY_FILLED')"
        ))
        .fetch_all(self.pool())
        .await?;
        rows.iter().map(row_to_order).collect()
    }
}
