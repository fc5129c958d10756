//! Stream Store Adapter (C1): a thin async port over a log-structured
//! stream with consumer groups, plus the Redis Streams implementation this
//! rewrite binds it to, command-by-command (XADD/XREADGROUP/XACK/
//! XGROUP CREATE .../XPENDING/XLEN/XTRIM/XAUTOCLAIM/SCAN), generalized to
//! an arbitrary field map since `FrameRef` is carried as a flat field map
//! rather than one JSON blob.

use crate::error::{OrchestratorError, OrchestratorResult};
use async_trait::async_trait;
use redis::AsyncCommands;
use redis::aio::ConnectionManager;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

pub type Fields = HashMap<String, String>;

#[derive(Debug, Clone)]
pub struct PendingSummaryDetail {
    pub count: u64,
    pub oldest_id: Option<String>,
}

#[derive(Debug, Clone)]
pub struct PendingEntry {
    pub id: String,
    pub consumer: String,
    pub idle_ms: i64,
    pub delivery_count: u64,
}

#[derive(Debug, Clone, Copy)]
pub enum TrimSpec {
    MaxLen(u64),
}

/// Port over the stream store. Not tied to Redis; a future implementation
/// (Kafka, NATS JetStream, ...) only needs to satisfy this trait.
#[async_trait]
pub trait StreamStore: Send + Sync {
    async fn append(&self, stream: &str, fields: &[(String, String)]) -> OrchestratorResult<String>;

    async fn read_group(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
        block_ms: Option<u64>,
    ) -> OrchestratorResult<Vec<(String, Fields)>>;

    /// Re-reads this consumer's own pending (undelivered-to-anyone-else)
    /// backlog, used on startup before joining the live tail.
    async fn read_pending(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
    ) -> OrchestratorResult<Vec<(String, Fields)>>;

    async fn ack(&self, stream: &str, group: &str, ids: &[String]) -> OrchestratorResult<u64>;

    async fn create_group(&self, stream: &str, group: &str, start_id: &str) -> OrchestratorResult<()>;

    async fn pending(&self, stream: &str, group: &str) -> OrchestratorResult<PendingSummaryDetail>;

    async fn pending_details(
        &self,
        stream: &str,
        group: &str,
        count: usize,
    ) -> OrchestratorResult<Vec<PendingEntry>>;

    async fn length(&self, stream: &str) -> OrchestratorResult<u64>;

    async fn trim(&self, stream: &str, spec: TrimSpec) -> OrchestratorResult<()>;

    async fn scan_keys(&self, pattern: &str) -> OrchestratorResult<Vec<String>>;

    /// Reassigns messages idle for longer than `min_idle_ms` to `consumer`,
    /// used both by the router (redelivery after a crash) and the
    /// processor client (claim-count-based DLQ routing).
    async fn claim_abandoned(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle_ms: u64,
        count: usize,
    ) -> OrchestratorResult<Vec<(String, Fields)>>;
}

/// Redis Streams binding, built on `redis::aio::ConnectionManager` (the same
/// auto-reconnecting, cheap-to-clone connection type used elsewhere in this
/// workspace's stream-backed services).
#[derive(Clone)]
pub struct RedisStreamStore {
    redis: Arc<ConnectionManager>,
}

impl RedisStreamStore {
    pub fn new(redis: Arc<ConnectionManager>) -> Self {
        Self { redis }
    }

    fn parse_entries(raw: redis::streams::StreamReadReply) -> Vec<(String, Fields)> {
        let mut out = Vec::new();
        for key in raw.keys {
            for id in key.ids {
                let mut fields = Fields::new();
                for (field, value) in id.map {
                    if let redis::Value::BulkString(bytes) = value {
                        if let Ok(s) = String::from_utf8(bytes) {
                            fields.insert(field, s);
                        }
                    } else if let redis::Value::SimpleString(s) = value {
                        fields.insert(field, s);
                    }
                }
                out.push((id.id, fields));
            }
        }
        out
    }
}

#[async_trait]
impl StreamStore for RedisStreamStore {
    async fn append(&self, stream: &str, fields: &[(String, String)]) -> OrchestratorResult<String> {
        let mut conn = (*self.redis).clone();
        let mut cmd = redis::cmd("XADD");
        cmd.arg(stream).arg("*");
        for (k, v) in fields {
            cmd.arg(k).arg(v);
        }
        let id: String = cmd.query_async(&mut conn).await?;
        Ok(id)
    }

    async fn read_group(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
        block_ms: Option<u64>,
    ) -> OrchestratorResult<Vec<(String, Fields)>> {
        let mut conn = (*self.redis).clone();
        let mut opts = redis::streams::StreamReadOptions::default()
            .group(group, consumer)
            .count(count);
        if let Some(ms) = block_ms {
            opts = opts.block(ms as usize);
        }
        let result: redis::RedisResult<redis::streams::StreamReadReply> = conn
            .xread_options(&[stream], &[">"], &opts)
            .await;

        match result {
            Ok(reply) => Ok(Self::parse_entries(reply)),
            Err(e) => {
                let msg = e.to_string().to_lowercase();
                if (msg.contains("timed out") || msg.contains("timeout")) && !msg.contains("connection") {
                    debug!(stream, "read_group block timeout");
                    Ok(Vec::new())
                } else {
                    Err(OrchestratorError::Redis(e))
                }
            }
        }
    }

    async fn read_pending(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
    ) -> OrchestratorResult<Vec<(String, Fields)>> {
        let mut conn = (*self.redis).clone();
        let opts = redis::streams::StreamReadOptions::default()
            .group(group, consumer)
            .count(count);
        let reply: redis::streams::StreamReadReply =
            conn.xread_options(&[stream], &["0"], &opts).await?;
        Ok(Self::parse_entries(reply))
    }

    async fn ack(&self, stream: &str, group: &str, ids: &[String]) -> OrchestratorResult<u64> {
        if ids.is_empty() {
            return Ok(0);
        }
        let mut conn = (*self.redis).clone();
        let n: u64 = conn.xack(stream, group, ids).await?;
        Ok(n)
    }

    async fn create_group(&self, stream: &str, group: &str, start_id: &str) -> OrchestratorResult<()> {
        let mut conn = (*self.redis).clone();
        let result: redis::RedisResult<()> = redis::cmd("XGROUP")
            .arg("CREATE")
            .arg(stream)
            .arg(group)
            .arg(start_id)
            .arg("MKSTREAM")
            .query_async(&mut conn)
            .await;

        match result {
            Ok(()) => Ok(()),
            Err(e) if e.to_string().contains("BUSYGROUP") => {
                debug!(stream, group, "consumer group already exists");
                Ok(())
            }
            Err(e) => Err(OrchestratorError::Redis(e)),
        }
    }

    async fn pending(&self, stream: &str, group: &str) -> OrchestratorResult<PendingSummaryDetail> {
        let mut conn = (*self.redis).clone();
        let summary: redis::RedisResult<
            (i64, Option<String>, Option<String>, Option<Vec<(String, i64)>>),
        > = redis::cmd("XPENDING")
            .arg(stream)
            .arg(group)
            .query_async(&mut conn)
            .await;

        match summary {
            Ok((count, oldest, _newest, _consumers)) => Ok(PendingSummaryDetail {
                count: count.max(0) as u64,
                oldest_id: oldest,
            }),
            Err(e) if e.to_string().contains("NOGROUP") => Ok(PendingSummaryDetail {
                count: 0,
                oldest_id: None,
            }),
            Err(e) => Err(OrchestratorError::Redis(e)),
        }
    }

    async fn pending_details(
        &self,
        stream: &str,
        group: &str,
        count: usize,
    ) -> OrchestratorResult<Vec<PendingEntry>> {
        let mut conn = (*self.redis).clone();
        let rows: redis::RedisResult<Vec<(String, String, i64, u64)>> = redis::cmd("XPENDING")
            .arg(stream)
            .arg(group)
            .arg("-")
            .arg("+")
            .arg(count)
            .query_async(&mut conn)
            .await;

        match rows {
            Ok(rows) => Ok(rows
                .into_iter()
                .map(|(id, consumer, idle_ms, delivery_count)| PendingEntry {
                    id,
                    consumer,
                    idle_ms,
                    delivery_count,
                })
                .collect()),
            Err(e) if e.to_string().contains("NOGROUP") => Ok(Vec::new()),
            Err(e) => Err(OrchestratorError::Redis(e)),
        }
    }

    async fn length(&self, stream: &str) -> OrchestratorResult<u64> {
        let mut conn = (*self.redis).clone();
        let len: u64 = conn.xlen(stream).await?;
        Ok(len)
    }

    async fn trim(&self, stream: &str, spec: TrimSpec) -> OrchestratorResult<()> {
        let mut conn = (*self.redis).clone();
        match spec {
            TrimSpec::MaxLen(n) => {
                let _: () = redis::cmd("XTRIM")
                    .arg(stream)
                    .arg("MAXLEN")
                    .arg("~")
                    .arg(n)
                    .query_async(&mut conn)
                    .await?;
            }
        }
        Ok(())
    }

    async fn scan_keys(&self, pattern: &str) -> OrchestratorResult<Vec<String>> {
        let mut conn = (*self.redis).clone();
        let mut cursor: u64 = 0;
        let mut keys = Vec::new();
        loop {
            let (next, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(pattern)
                .arg("COUNT")
                .arg(200)
                .query_async(&mut conn)
                .await?;
            keys.extend(batch);
            if next == 0 {
                break;
            }
            cursor = next;
        }
        Ok(keys)
    }

    async fn claim_abandoned(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle_ms: u64,
        count: usize,
    ) -> OrchestratorResult<Vec<(String, Fields)>> {
        let mut conn = (*self.redis).clone();
        // XAUTOCLAIM replies [next-start-id, [[id, [field,value,...]], ...], [deleted-ids]],
        // not the nested-by-stream-name shape StreamReadReply expects, so this is parsed by
        // hand rather than via a typed query.
        let result: redis::RedisResult<redis::Value> = redis::cmd("XAUTOCLAIM")
            .arg(stream)
            .arg(group)
            .arg(consumer)
            .arg(min_idle_ms)
            .arg("0-0")
            .arg("COUNT")
            .arg(count)
            .query_async(&mut conn)
            .await;

        let value = match result {
            Ok(v) => v,
            Err(e) if e.to_string().contains("NOGROUP") => return Ok(Vec::new()),
            Err(e) => return Err(OrchestratorError::Redis(e)),
        };

        let mut out = Vec::new();
        let redis::Value::Array(top) = value else {
            return Ok(out);
        };
        let Some(redis::Value::Array(entries)) = top.into_iter().nth(1) else {
            return Ok(out);
        };
        for entry in entries {
            let redis::Value::Array(parts) = entry else {
                continue;
            };
            if parts.len() != 2 {
                continue;
            }
            let mut iter = parts.into_iter();
            let Some(id_value) = iter.next() else { continue };
            let Some(redis::Value::Array(flat)) = iter.next() else {
                continue;
            };
            let id = match id_value {
                redis::Value::BulkString(b) => String::from_utf8_lossy(&b).to_string(),
                redis::Value::SimpleString(s) => s,
                _ => continue,
            };
            let mut fields = Fields::new();
            let mut chunks = flat.into_iter();
            while let (Some(k), Some(v)) = (chunks.next(), chunks.next()) {
                let key = match k {
                    redis::Value::BulkString(b) => String::from_utf8_lossy(&b).to_string(),
                    redis::Value::SimpleString(s) => s,
                    _ => continue,
                };
                let val = match v {
                    redis::Value::BulkString(b) => String::from_utf8_lossy(&b).to_string(),
                    redis::Value::SimpleString(s) => s,
                    _ => continue,
                };
                fields.insert(key, val);
            }
            out.push((id, fields));
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trim_spec_is_copy() {
        let spec = TrimSpec::MaxLen(100_000);
        let _copy = spec;
        assert!(matches!(spec, TrimSpec::MaxLen(100_000)));
    }

    #[test]
    fn pending_summary_detail_defaults_empty() {
        let detail = PendingSummaryDetail {
            count: 0,
            oldest_id: None,
        };
        assert_eq!(detail.count, 0);
        assert!(detail.oldest_id.is_none());
    }
}
