//! Redis Streams durable log
//!
//! Each topic is a stream at `<prefix>:log:<topic>`. Offsets come from an
//! `INCR` counter at `<prefix>:log:<topic>:offset`; the record with offset
//! `n` is stored under stream id `<n + 1>-0`, so range reads map directly
//! onto offsets.

use async_trait::async_trait;
use redis::streams::{StreamId, StreamRangeReply};
use redis::AsyncCommands;
use std::sync::Arc;
use tracing::{debug, info};

use super::{DurableLog, LogRecord};
use crate::error::StorageError;
use crate::Result;
use config::RedisConfig;

const PAYLOAD_FIELD: &str = "payload";

pub struct RedisStreamLog {
    /// Held across INCR + XADD so stream order follows offset order
    redis: Arc<tokio::sync::Mutex<redis::aio::ConnectionManager>>,
    key_prefix: String,
}

impl RedisStreamLog {
    pub async fn connect(config: &RedisConfig) -> Result<Self> {
        info!(host = %config.host, port = config.port, db = config.db_index, "Connecting to Redis");

        let client = redis::Client::open(config.connection_url().as_str())
            .map_err(|e| StorageError::Config(e.to_string()))?;

        let connection_manager = client.get_connection_manager().await?;

        Ok(Self {
            redis: Arc::new(tokio::sync::Mutex::new(connection_manager)),
            key_prefix: config.key_prefix.clone(),
        })
    }

    fn stream_key(&self, topic: &str) -> String {
        format!("{}:log:{}", self.key_prefix, topic)
    }

    fn offset_key(&self, topic: &str) -> String {
        format!("{}:log:{}:offset", self.key_prefix, topic)
    }

    fn to_record(entry: &StreamId) -> Result<LogRecord> {
        let offset = entry
            .id
            .split('-')
            .next()
            .and_then(|ms| ms.parse::<u64>().ok())
            .and_then(|n| n.checked_sub(1))
            .ok_or_else(|| StorageError::Corrupt(format!("stream id '{}'", entry.id)))?;

        let payload: Vec<u8> = entry
            .get(PAYLOAD_FIELD)
            .ok_or_else(|| StorageError::Corrupt(format!("entry {} has no payload", entry.id)))?;

        Ok(LogRecord { offset, payload })
    }

    fn to_records(reply: StreamRangeReply) -> Result<Vec<LogRecord>> {
        reply.ids.iter().map(Self::to_record).collect()
    }
}

#[async_trait]
impl DurableLog for RedisStreamLog {
    async fn append(&self, topic: &str, payload: Vec<u8>) -> Result<u64> {
        let stream = self.stream_key(topic);
        let counter = self.offset_key(topic);

        let mut redis = self.redis.lock().await;
        let n: u64 = redis.incr(&counter, 1u64).await?;
        let id = format!("{}-0", n);
        let _: String = redis
            .xadd(&stream, &id, &[(PAYLOAD_FIELD, payload.as_slice())])
            .await?;

        debug!(topic, offset = n - 1, "Appended record");
        Ok(n - 1)
    }

    async fn read(&self, topic: &str, from: u64, max: usize) -> Result<Vec<LogRecord>> {
        if max == 0 {
            return Ok(Vec::new());
        }
        let start = format!("{}-0", from.saturating_add(1));

        let mut redis = self.redis.lock().await;
        let reply: StreamRangeReply = redis
            .xrange_count(self.stream_key(topic), start, "+", max)
            .await?;

        Self::to_records(reply)
    }

    async fn read_tail(&self, topic: &str, max: usize) -> Result<Vec<LogRecord>> {
        if max == 0 {
            return Ok(Vec::new());
        }

        let mut redis = self.redis.lock().await;
        let reply: StreamRangeReply = redis
            .xrevrange_count(self.stream_key(topic), "+", "-", max)
            .await?;

        Self::to_records(reply)
    }

    async fn latest_offset(&self, topic: &str) -> Result<Option<u64>> {
        Ok(self
            .read_tail(topic, 1)
            .await?
            .first()
            .map(|record| record.offset))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use redis::Value;
    use std::collections::HashMap;

    fn entry(id: &str, payload: Option<&[u8]>) -> StreamId {
        let mut map = HashMap::new();
        if let Some(p) = payload {
            map.insert(PAYLOAD_FIELD.to_string(), Value::Data(p.to_vec()));
        }
        StreamId {
            id: id.to_string(),
            map,
        }
    }

    #[test]
    fn test_stream_id_maps_to_offset() {
        let record = RedisStreamLog::to_record(&entry("5-0", Some(b"x"))).unwrap();
        assert_eq!(record.offset, 4);
        assert_eq!(record.payload, b"x".to_vec());
    }

    #[test]
    fn test_corrupt_entries_are_rejected() {
        assert!(RedisStreamLog::to_record(&entry("0-0", Some(b"x"))).is_err());
        assert!(RedisStreamLog::to_record(&entry("abc-0", Some(b"x"))).is_err());
        assert!(RedisStreamLog::to_record(&entry("3-0", None)).is_err());
    }
}
