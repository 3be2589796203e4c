//! In-memory liability store for testing and development

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashSet};

use super::LiabilityStore;
use crate::ledger::{DedupKey, LiabilityRow};
use crate::Result;

#[derive(Default)]
struct Ledger {
    rows: Vec<LiabilityRow>,
    keys: HashSet<DedupKey>,
}

#[derive(Default)]
pub struct InMemoryLiabilityStore {
    ledger: Mutex<Ledger>,
}

impl InMemoryLiabilityStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.ledger.lock().rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Net credit minus debit per coin across every account
    pub fn net_by_coin(&self) -> BTreeMap<String, i128> {
        let ledger = self.ledger.lock();
        let mut totals = BTreeMap::new();
        for row in &ledger.rows {
            *totals.entry(row.coin.clone()).or_insert(0) += row.net();
        }
        totals
    }
}

#[async_trait]
impl LiabilityStore for InMemoryLiabilityStore {
    async fn append(&self, rows: &[LiabilityRow]) -> Result<usize> {
        let mut ledger = self.ledger.lock();
        let mut inserted = 0;
        for row in rows {
            if ledger.keys.insert(row.key()) {
                ledger.rows.push(row.clone());
                inserted += 1;
            }
        }
        Ok(inserted)
    }

    async fn load_all(&self) -> Result<Vec<LiabilityRow>> {
        Ok(self.ledger.lock().rows.clone())
    }
}
