//! Advanced order orchestration
//!
//! Watches projections and couples the orders of one tree:
//!
//! - OCO: a fill on one leg cancels the other
//! - Straddle / strangle: the first leg to activate or fill cancels the
//!   other; a filled leg spawns an OCO child when the root carries
//!   `tp_rel` / `sl_rel`
//! - OTO: a parent that ends with a fill spawns an opposite-side OCO child
//!   sized to what it received
//!
//! Work runs on its own task so the dispatcher keeps projecting the cancel
//! confirmations this module waits for.

use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info, warn};

use common::{decimal, Market, OrderType, OtoType, Side};
use oms::{Order, OrderChange, Projection, Projector};

use crate::cancel::{CancelPolicy, CancelService};
use crate::intake::{find_order, OrderIntake};
use crate::Result;

/// Opposite-side OCO placed after a fill
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FollowUp {
    pub side: Side,
    pub amount: u64,
    pub tp_price: u64,
    pub sl_price: u64,
}

/// Exit prices for a filled order
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Exits {
    Absolute { tp_price: u64, sl_price: u64 },
    /// In 1/10 000 of the average fill price
    Relative { tp_rel: u64, sl_rel: u64 },
}

impl FollowUp {
    /// Size and price the OCO that closes `filled`
    ///
    /// A buy is followed by a sell of the base received; a sell by a buy
    /// whose quote value at either exit fits what was received.
    pub fn for_fill(filled: &Order, market: &Market, exits: Exits) -> Result<Option<Self>> {
        let received = filled.received();
        if received == 0 {
            return Ok(None);
        }
        let side = filled.side.opposite();

        let (tp_price, sl_price) = match exits {
            Exits::Absolute { tp_price, sl_price } => (tp_price, sl_price),
            Exits::Relative { tp_rel, sl_rel } => {
                let Some(average) = filled.average_price(market.base_precision)? else {
                    return Ok(None);
                };
                match side {
                    Side::Sell => (
                        decimal::add_bps(average, tp_rel)?,
                        decimal::sub_bps(average, sl_rel)?,
                    ),
                    Side::Buy => (
                        decimal::sub_bps(average, tp_rel)?,
                        decimal::add_bps(average, sl_rel)?,
                    ),
                }
            }
        };
        if tp_price == 0 || sl_price == 0 {
            return Ok(None);
        }

        let amount = match side {
            Side::Sell => received,
            Side::Buy => {
                let at_tp = decimal::base_for_quote(received, tp_price, market.base_precision)?;
                let at_sl = decimal::base_for_quote(received, sl_price, market.base_precision)?;
                at_tp.min(at_sl)
            }
        };
        if amount == 0 {
            return Ok(None);
        }

        Ok(Some(Self {
            side,
            amount,
            tp_price,
            sl_price,
        }))
    }
}

pub struct Orchestrator {
    projector: Arc<Projector>,
    intake: Arc<OrderIntake>,
    cancels: Arc<CancelService>,
    policy: CancelPolicy,
    /// Orders whose follow-up has already been placed
    spawned: Mutex<HashSet<u64>>,
}

impl Orchestrator {
    pub fn new(
        projector: Arc<Projector>,
        intake: Arc<OrderIntake>,
        cancels: Arc<CancelService>,
        policy: CancelPolicy,
    ) -> Self {
        Self {
            projector,
            intake,
            cancels,
            policy,
            spawned: Mutex::new(HashSet::new()),
        }
    }

    /// Handle a projection on a separate task
    pub fn observe(self: &Arc<Self>, projection: Projection) {
        if projection.duplicate || projection.changes.is_empty() {
            return;
        }
        let this = Arc::clone(self);
        tokio::spawn(async move { this.handle(&projection).await });
    }

    /// Apply every coupling rule triggered by `projection`
    pub async fn handle(&self, projection: &Projection) {
        for change in &projection.changes {
            if let Err(e) = self.handle_change(projection, change).await {
                warn!(
                    market = %projection.market_id,
                    order_id = change.after.id,
                    error = %e,
                    "Orchestration step failed"
                );
            }
        }
    }

    async fn handle_change(&self, projection: &Projection, change: &OrderChange) -> Result<()> {
        let order = &change.after;

        if order.order_type == OrderType::Oto && change.became_terminal() {
            return self.complete_oto(order).await;
        }

        let Some(parent_id) = order.parent_order_id else {
            return Ok(());
        };
        let Some(container) = self.container(projection, parent_id).await? else {
            return Ok(());
        };

        match container.order_type {
            OrderType::Oco if change.new_fill() > 0 => {
                self.cancel_siblings(&container, order.id).await;
            }
            OrderType::Straddle | OrderType::Strangle => {
                if change.became_triggered() || change.new_fill() > 0 {
                    self.cancel_siblings(&container, order.id).await;
                }
                if change.became_terminal() && container.tp_rel > 0 && container.sl_rel > 0 {
                    let exits = Exits::Relative {
                        tp_rel: container.tp_rel,
                        sl_rel: container.sl_rel,
                    };
                    self.follow_up(order, container.tree_root(), exits).await?;
                }
            }
            _ => {}
        }
        Ok(())
    }

    async fn container(&self, projection: &Projection, parent_id: u64) -> Result<Option<Order>> {
        let parent = match projection.change(parent_id) {
            Some(change) => Some(change.after.clone()),
            None => find_order(&self.projector, parent_id).await?,
        };
        Ok(parent.filter(Order::is_container))
    }

    /// Cancel every live leg of `container` other than `leg_id`
    async fn cancel_siblings(&self, container: &Order, leg_id: u64) {
        let orders = self.projector.orders();
        let siblings: Vec<Order> = container
            .legs()
            .filter(|id| *id != leg_id)
            .filter_map(|id| orders.get(&container.market_id, id))
            .filter(|o| !o.is_terminal())
            .collect();

        for sibling in siblings {
            let outcome = self.cancels.cancel(&sibling, self.policy).await;
            info!(
                market = %container.market_id,
                container_id = container.id,
                leg_id,
                sibling_id = sibling.id,
                outcome = outcome.as_str(),
                "Sibling cancelled"
            );
        }
    }

    async fn complete_oto(&self, order: &Order) -> Result<()> {
        let root = order.tree_root();
        let user_cancelled = self.cancels.is_user_cancelled(root);
        if root == order.id {
            self.cancels.clear_user_cancelled(root);
        }
        if user_cancelled {
            debug!(market = %order.market_id, order_id = order.id, "OTO cancelled by owner, no follow-up");
            return Ok(());
        }
        if order.filled_amount == 0 {
            return Ok(());
        }

        let exits = match order.oto_type {
            OtoType::Limit => Exits::Absolute {
                tp_price: order.tp_price,
                sl_price: order.sl_price,
            },
            OtoType::Market => Exits::Relative {
                tp_rel: order.tp_rel,
                sl_rel: order.sl_rel,
            },
        };
        self.follow_up(order, root, exits).await
    }

    /// Place the OCO that closes a filled `order`, at most once
    async fn follow_up(&self, order: &Order, root: u64, exits: Exits) -> Result<()> {
        if order.filled_amount == 0 || !self.spawned.lock().insert(order.id) {
            return Ok(());
        }
        let exists = self
            .projector
            .orders()
            .get_tree(&order.market_id, root)
            .iter()
            .any(|o| o.parent_order_id == Some(order.id));
        if exists {
            return Ok(());
        }

        let market = self.projector.market(&order.market_id)?.clone();
        let Some(plan) = FollowUp::for_fill(order, &market, exits)? else {
            debug!(market = %market.id, order_id = order.id, "Nothing to follow up");
            return Ok(());
        };

        let child = self
            .intake
            .create_child_oco(order, plan.side, plan.amount, plan.tp_price, plan.sl_price)
            .await
            .map_err(|e| {
                self.spawned.lock().remove(&order.id);
                e
            })?;
        info!(
            market = %market.id,
            order_id = order.id,
            child_id = child.id,
            side = %plan.side,
            amount = plan.amount,
            tp_price = plan.tp_price,
            sl_price = plan.sl_price,
            "Follow-up OCO placed"
        );
        Ok(())
    }
}
