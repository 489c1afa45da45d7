//! Event bus over Redis Streams.
//!
//! One stream per topic, consumer groups with explicit acks. Delivery is
//! at-least-once: the group bookmark only advances on XACK, so a crashed
//! consumer re-reads its pending entries on restart. Receivers rely on
//! business idempotency (event_id / idempotency_key), not on the bus.
//!
//! Records that fail schema validation are copied verbatim to the `dlq`
//! stream and acked so the group never wedges on a poison message.

use anyhow::{Context, Result};
use redis::aio::ConnectionManager;
use redis::streams::{StreamReadOptions, StreamReadReply};
use redis::AsyncCommands;
use tracing::{debug, warn};

use crate::events::{DlqRecord, Envelope};

/// One consumed record: stream id plus the decode attempt. The raw body is
/// kept so undecodable records can be dead-lettered verbatim.
pub struct BusRecord {
    pub stream_id: String,
    pub raw: String,
    pub envelope: Result<Envelope, serde_json::Error>,
}

#[derive(Clone)]
pub struct EventBus {
    conn: ConnectionManager,
    service: String,
    env: String,
}

impl EventBus {
    pub async fn connect(redis_url: &str, service: &str, env: &str) -> Result<Self> {
        let client = redis::Client::open(redis_url).context("bad REDIS_URL")?;
        let conn = ConnectionManager::new(client)
            .await
            .context("redis connect failed")?;
        Ok(Self {
            conn,
            service: service.to_string(),
            env: env.to_string(),
        })
    }

    /// Append one envelope to a topic stream. Safe to retry: the receiver
    /// side dedups by event_id.
    pub async fn publish(&self, topic: &str, envelope: &Envelope) -> Result<String> {
        let body = serde_json::to_string(envelope)?;
        let mut conn = self.conn.clone();
        let id: String = conn
            .xadd(topic, "*", &[("event", body.as_str())])
            .await
            .with_context(|| format!("XADD {topic}"))?;
        debug!("📮 publish {}/{} id={}", topic, envelope.event_id, id);
        Ok(id)
    }

    /// Idempotent group creation from the start of the stream.
    pub async fn ensure_group(&self, topic: &str, group: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        let res: redis::RedisResult<()> = conn.xgroup_create_mkstream(topic, group, "0").await;
        match res {
            Ok(()) => Ok(()),
            // BUSYGROUP = group already exists, which is what we want.
            Err(e) if e.to_string().contains("BUSYGROUP") => Ok(()),
            Err(e) => Err(e).with_context(|| format!("XGROUP CREATE {topic}/{group}")),
        }
    }

    /// Blocking batch read for one (group, consumer). Returns an empty
    /// batch on block timeout so callers can honor shutdown promptly.
    pub async fn consume(
        &self,
        topic: &str,
        group: &str,
        consumer: &str,
        count: usize,
        block_ms: u64,
    ) -> Result<Vec<BusRecord>> {
        let opts = StreamReadOptions::default()
            .group(group, consumer)
            .count(count)
            .block(block_ms as usize);

        let mut conn = self.conn.clone();
        let reply: StreamReadReply = conn
            .xread_options(&[topic], &[">"], &opts)
            .await
            .with_context(|| format!("XREADGROUP {topic}/{group}"))?;

        let mut out = Vec::new();
        for key in reply.keys {
            for entry in key.ids {
                let raw = entry
                    .map
                    .get("event")
                    .and_then(|v| redis::from_redis_value::<String>(v).ok())
                    .unwrap_or_default();
                let envelope = serde_json::from_str::<Envelope>(&raw);
                out.push(BusRecord {
                    stream_id: entry.id.clone(),
                    raw,
                    envelope,
                });
            }
        }
        Ok(out)
    }

    pub async fn ack(&self, topic: &str, group: &str, stream_id: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: i64 = conn
            .xack(topic, group, &[stream_id])
            .await
            .with_context(|| format!("XACK {topic}/{group}/{stream_id}"))?;
        Ok(())
    }

    /// Entries delivered to the group but not yet acked.
    pub async fn pending_count(&self, topic: &str, group: &str) -> Result<i64> {
        let mut conn = self.conn.clone();
        let raw: redis::Value = redis::cmd("XPENDING")
            .arg(topic)
            .arg(group)
            .query_async(&mut conn)
            .await
            .with_context(|| format!("XPENDING {topic}/{group}"))?;
        // Summary form: [count, min-id, max-id, consumers].
        if let redis::Value::Bulk(items) = &raw {
            if let Some(first) = items.first() {
                return Ok(redis::from_redis_value::<i64>(first).unwrap_or(0));
            }
        }
        Ok(0)
    }

    /// Entries appended after the group bookmark (Redis 7 `lag` field;
    /// falls back to 0 on older servers that omit it).
    pub async fn group_lag(&self, topic: &str, group: &str) -> Result<i64> {
        let mut conn = self.conn.clone();
        let raw: redis::Value = redis::cmd("XINFO")
            .arg("GROUPS")
            .arg(topic)
            .query_async(&mut conn)
            .await
            .with_context(|| format!("XINFO GROUPS {topic}"))?;

        let groups: Vec<std::collections::HashMap<String, redis::Value>> =
            redis::from_redis_value(&raw).unwrap_or_default();
        for g in groups {
            let name = g
                .get("name")
                .and_then(|v| redis::from_redis_value::<String>(v).ok())
                .unwrap_or_default();
            if name == group {
                return Ok(g
                    .get("lag")
                    .and_then(|v| redis::from_redis_value::<i64>(v).ok())
                    .unwrap_or(0));
            }
        }
        Ok(0)
    }

    /// Push a failed record to the DLQ and ack the original so the group
    /// moves on. The original body is stored verbatim.
    pub async fn dead_letter(
        &self,
        topic: &str,
        group: &str,
        stream_id: &str,
        raw: &str,
        error: &str,
    ) -> Result<()> {
        warn!("☠️ DLQ {}/{}: {}", topic, stream_id, error);
        let record = DlqRecord {
            topic: topic.to_string(),
            stream_id: stream_id.to_string(),
            error: error.to_string(),
            raw: raw.to_string(),
            ts_ms: crate::now_ms(),
        };
        let envelope = Envelope::new(
            &self.service,
            &self.env,
            serde_json::to_value(&record)?,
        );
        self.publish(crate::events::topic::DLQ, &envelope).await?;
        self.ack(topic, group, stream_id).await
    }
}
