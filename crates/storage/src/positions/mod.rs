//! Consumer queue positions
//!
//! A consumer (`component`) persists, per topic, the next offset it needs
//! to read. Positions are saved only after the consumed record has been
//! fully applied, so a restart re-reads at most one record.

use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;

use crate::Result;

#[async_trait]
pub trait PositionStore: Send + Sync {
    /// Next offsets per topic for `component`.
    async fn load(&self, component: &str) -> Result<HashMap<String, u64>>;

    /// Record that `component` should resume `topic` at `next_offset`.
    async fn save(&self, component: &str, topic: &str, next_offset: u64) -> Result<()>;
}

#[derive(Default)]
pub struct InMemoryPositionStore {
    positions: RwLock<HashMap<(String, String), u64>>,
}

impl InMemoryPositionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PositionStore for InMemoryPositionStore {
    async fn load(&self, component: &str) -> Result<HashMap<String, u64>> {
        Ok(self
            .positions
            .read()
            .iter()
            .filter(|((c, _), _)| c == component)
            .map(|((_, topic), offset)| (topic.clone(), *offset))
            .collect())
    }

    async fn save(&self, component: &str, topic: &str, next_offset: u64) -> Result<()> {
        self.positions
            .write()
            .insert((component.to_string(), topic.to_string()), next_offset);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_positions_are_scoped_by_component() {
        let store = InMemoryPositionStore::new();
        store.save("wallet_bridge", "wallet_events", 7).await.unwrap();
        store.save("analytics", "wallet_events", 2).await.unwrap();
        store.save("wallet_bridge", "wallet_events", 9).await.unwrap();

        let positions = store.load("wallet_bridge").await.unwrap();
        assert_eq!(positions.len(), 1);
        assert_eq!(positions["wallet_events"], 9);
        assert!(store.load("unknown").await.unwrap().is_empty());
    }
}
