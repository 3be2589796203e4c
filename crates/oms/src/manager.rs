//! Order Manager - authoritative in-memory index of live orders
//!
//! Orders are grouped per market, each group behind its own mutex, so
//! mutations on one market never contend with another. A global id index
//! resolves an order id to its market without scanning.
//!
//! Only the projector and the intake path write here; everything else
//! reads through these methods.

use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;

use common::OrderStatus;

use crate::error::OmsError;
use crate::types::Order;
use crate::Result;

type MarketOrders = Arc<Mutex<HashMap<u64, Order>>>;

#[derive(Default)]
pub struct OrderManager {
    markets: RwLock<HashMap<String, MarketOrders>>,
    index: RwLock<HashMap<u64, String>>,
}

impl OrderManager {
    pub fn new() -> Self {
        Self::default()
    }

    fn market(&self, market_id: &str) -> MarketOrders {
        if let Some(orders) = self.markets.read().get(market_id) {
            return orders.clone();
        }
        self.markets
            .write()
            .entry(market_id.to_string())
            .or_default()
            .clone()
    }

    /// Insert or overwrite an order
    pub fn put(&self, order: Order) {
        let market = self.market(&order.market_id);
        self.index.write().insert(order.id, order.market_id.clone());
        market.lock().insert(order.id, order);
    }

    pub fn get(&self, market_id: &str, order_id: u64) -> Option<Order> {
        self.market(market_id).lock().get(&order_id).cloned()
    }

    /// Find a live order by id alone
    pub fn locate(&self, order_id: u64) -> Option<Order> {
        let market_id = self.index.read().get(&order_id).cloned()?;
        self.get(&market_id, order_id)
    }

    pub fn update_status(
        &self,
        market_id: &str,
        order_id: u64,
        status: OrderStatus,
        ts: i64,
    ) -> Result<Order> {
        let market = self.market(market_id);
        let mut orders = market.lock();
        let order = orders
            .get_mut(&order_id)
            .ok_or(OmsError::NotFound(order_id))?;

        if order.is_terminal() && order.status != status {
            return Err(OmsError::invalid(format!(
                "order {} is already {}",
                order_id, order.status
            )));
        }
        order.status = status;
        order.updated_at = ts;
        Ok(order.clone())
    }

    /// Replace an existing order wholesale
    pub fn update_custom_order(&self, order: Order) -> Result<()> {
        let market = self.market(&order.market_id);
        let mut orders = market.lock();
        match orders.get_mut(&order.id) {
            Some(slot) => {
                *slot = order;
                Ok(())
            }
            None => Err(OmsError::NotFound(order.id)),
        }
    }

    /// Live orders of a market, oldest first
    pub fn get_orders_by_market(&self, market_id: &str) -> Vec<Order> {
        let mut orders: Vec<Order> = self.market(market_id).lock().values().cloned().collect();
        orders.sort_by_key(|o| o.id);
        orders
    }

    /// Live orders of one user's sub-account across markets, oldest first
    pub fn get_orders_by_user(&self, user_id: u64, sub_account: u64) -> Vec<Order> {
        let markets: Vec<MarketOrders> = self.markets.read().values().cloned().collect();
        let mut orders: Vec<Order> = markets
            .iter()
            .flat_map(|m| {
                m.lock()
                    .values()
                    .filter(|o| o.owner_id == user_id && o.sub_account == sub_account)
                    .cloned()
                    .collect::<Vec<_>>()
            })
            .collect();
        orders.sort_by_key(|o| o.id);
        orders
    }

    /// Live descendants of a root order
    pub fn get_tree(&self, market_id: &str, root_id: u64) -> Vec<Order> {
        let mut orders: Vec<Order> = self
            .market(market_id)
            .lock()
            .values()
            .filter(|o| o.root_order_id == Some(root_id))
            .cloned()
            .collect();
        orders.sort_by_key(|o| o.id);
        orders
    }

    /// Drop an order from memory; the persisted row remains
    pub fn remove(&self, market_id: &str, order_id: u64) -> Option<Order> {
        let removed = self.market(market_id).lock().remove(&order_id);
        if removed.is_some() {
            self.index.write().remove(&order_id);
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.index.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use common::{AccountKey, OrderType, Side};

    fn order(id: u64, market: &str, user: u64) -> Order {
        Order::new(id, AccountKey::new(user, 0), market, Side::Buy, OrderType::Limit, 0)
    }

    #[test]
    fn test_put_get_and_locate() {
        let manager = OrderManager::new();
        manager.put(order(1, "btcusdt", 10));
        manager.put(order(2, "ethusdt", 10));

        assert!(manager.get("btcusdt", 1).is_some());
        assert!(manager.get("btcusdt", 2).is_none());
        assert_eq!(manager.locate(2).map(|o| o.market_id), Some("ethusdt".to_string()));
        assert_eq!(manager.len(), 2);
    }

    #[test]
    fn test_update_status_refuses_leaving_terminal() {
        let manager = OrderManager::new();
        manager.put(order(1, "btcusdt", 10));

        let updated = manager
            .update_status("btcusdt", 1, OrderStatus::Cancelled, 5)
            .unwrap();
        assert_eq!(updated.updated_at, 5);

        assert_matches!(
            manager.update_status("btcusdt", 1, OrderStatus::Filled, 6),
            Err(OmsError::InvalidOrder(_))
        );
        assert_matches!(
            manager.update_status("btcusdt", 9, OrderStatus::Filled, 6),
            Err(OmsError::NotFound(9))
        );
    }

    #[test]
    fn test_orders_by_user_span_markets() {
        let manager = OrderManager::new();
        manager.put(order(3, "btcusdt", 10));
        manager.put(order(1, "ethusdt", 10));
        manager.put(order(2, "btcusdt", 11));

        let ids: Vec<u64> = manager.get_orders_by_user(10, 0).iter().map(|o| o.id).collect();
        assert_eq!(ids, vec![1, 3]);
        assert_eq!(manager.get_orders_by_market("btcusdt").len(), 2);
    }

    #[test]
    fn test_update_custom_order_and_remove() {
        let manager = OrderManager::new();
        let mut o = order(1, "btcusdt", 10);
        assert_matches!(manager.update_custom_order(o.clone()), Err(OmsError::NotFound(1)));

        manager.put(o.clone());
        o.filled_amount = 7;
        manager.update_custom_order(o).unwrap();
        assert_eq!(manager.get("btcusdt", 1).unwrap().filled_amount, 7);

        assert!(manager.remove("btcusdt", 1).is_some());
        assert!(manager.locate(1).is_none());
        assert!(manager.is_empty());
    }
}
