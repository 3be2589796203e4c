//! In-memory durable log, used in tests and single-process deployments

use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;

use super::{DurableLog, LogRecord};
use crate::Result;

#[derive(Default)]
pub struct InMemoryLog {
    topics: RwLock<HashMap<String, Vec<Vec<u8>>>>,
}

impl InMemoryLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of records in `topic`.
    pub fn len(&self, topic: &str) -> usize {
        self.topics.read().get(topic).map(Vec::len).unwrap_or(0)
    }

    pub fn is_empty(&self, topic: &str) -> bool {
        self.len(topic) == 0
    }
}

#[async_trait]
impl DurableLog for InMemoryLog {
    async fn append(&self, topic: &str, payload: Vec<u8>) -> Result<u64> {
        let mut topics = self.topics.write();
        let records = topics.entry(topic.to_string()).or_default();
        records.push(payload);
        Ok(records.len() as u64 - 1)
    }

    async fn read(&self, topic: &str, from: u64, max: usize) -> Result<Vec<LogRecord>> {
        let topics = self.topics.read();
        let Some(records) = topics.get(topic) else {
            return Ok(Vec::new());
        };

        Ok(records
            .iter()
            .enumerate()
            .skip(from as usize)
            .take(max)
            .map(|(offset, payload)| LogRecord {
                offset: offset as u64,
                payload: payload.clone(),
            })
            .collect())
    }

    async fn read_tail(&self, topic: &str, max: usize) -> Result<Vec<LogRecord>> {
        let topics = self.topics.read();
        let Some(records) = topics.get(topic) else {
            return Ok(Vec::new());
        };

        Ok(records
            .iter()
            .enumerate()
            .rev()
            .take(max)
            .map(|(offset, payload)| LogRecord {
                offset: offset as u64,
                payload: payload.clone(),
            })
            .collect())
    }

    async fn latest_offset(&self, topic: &str) -> Result<Option<u64>> {
        Ok(self
            .topics
            .read()
            .get(topic)
            .and_then(|records| records.len().checked_sub(1))
            .map(|o| o as u64))
    }
}
