//! Global order and trade id allocation
//!
//! One counter pair for the whole process, shared by every market. Seeding
//! only ever moves a counter forward, so ids handed out before recovery
//! finished are never reissued.

use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct Sequencer {
    order_id: AtomicU64,
    trade_id: AtomicU64,
}

impl Sequencer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_order_id(&self) -> u64 {
        self.order_id.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn next_trade_id(&self) -> u64 {
        self.trade_id.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Raise the counters to at least the given last-issued ids
    pub fn seed(&self, last_order_id: u64, last_trade_id: u64) {
        self.order_id.fetch_max(last_order_id, Ordering::SeqCst);
        self.trade_id.fetch_max(last_trade_id, Ordering::SeqCst);
    }

    pub fn last_order_id(&self) -> u64 {
        self.order_id.load(Ordering::SeqCst)
    }

    pub fn last_trade_id(&self) -> u64 {
        self.trade_id.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_seed_never_moves_backwards() {
        let sequencer = Sequencer::new();
        assert_eq!(sequencer.next_order_id(), 1);

        sequencer.seed(500, 40);
        assert_eq!(sequencer.next_order_id(), 501);
        assert_eq!(sequencer.next_trade_id(), 41);

        sequencer.seed(10, 10);
        assert_eq!(sequencer.next_order_id(), 502);
        assert_eq!(sequencer.last_trade_id(), 41);
    }

    #[test]
    fn test_ids_are_unique_across_threads() {
        let sequencer = Arc::new(Sequencer::new());
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let sequencer = sequencer.clone();
                std::thread::spawn(move || {
                    (0..250).map(|_| sequencer.next_order_id()).collect::<Vec<_>>()
                })
            })
            .collect();

        let mut ids: Vec<u64> = handles
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect();
        ids.sort_unstable();
        ids.dedup();
        assert_eq!(ids.len(), 1_000);
        assert_eq!(sequencer.last_order_id(), 1_000);
    }
}
