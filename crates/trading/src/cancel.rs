//! Cancel confirmation routing
//!
//! The engine answers a cancel asynchronously. A waiter is registered under
//! the order id before the command goes out; the dispatcher completes it
//! once the matching `OrderStatusChange{cancelled}` or `OrderCancelFailed`
//! has been projected, so a caller that sees `Cancelled` also sees the
//! released funds.
//!
//! CRITICAL PROPERTIES:
//! - No caller waits longer than `attempts * timeout`
//! - An unconfirmed cancel ends in a compensating local cancellation: a
//!   synthetic cancel is projected and the cancel command is sent again

use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};

use common::{now_nanos, AccountKey, OrderStatus};
use config::{CancelConfig, OrchestratorConfig};
use matching_engine::{CancelCommand, CancelFailReason, Command, EngineEvent, EventKind};
use observability::TradingMetrics;
use oms::{Order, Projector};

use crate::error::TradingError;
use crate::intake::find_order;
use crate::registry::{MarketHandle, MarketRegistry};
use crate::Result;

/// Result of a cancel request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelOutcome {
    Cancelled,
    AlreadyCancelled,
    AlreadyFilled,
    /// The engine refused; retried, then compensated
    CancelFailedFromMe,
    /// The cancel command could not be published
    SendingFailed,
}

impl CancelOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            CancelOutcome::Cancelled => "cancelled",
            CancelOutcome::AlreadyCancelled => "already_cancelled",
            CancelOutcome::AlreadyFilled => "already_filled",
            CancelOutcome::CancelFailedFromMe => "cancel_failed_from_me",
            CancelOutcome::SendingFailed => "sending_failed",
        }
    }

    /// Final answers that need no retry
    pub fn is_settled(&self) -> bool {
        matches!(
            self,
            CancelOutcome::Cancelled | CancelOutcome::AlreadyCancelled | CancelOutcome::AlreadyFilled
        )
    }

    /// Outcome implied by an order that is already terminal
    pub fn for_terminal(status: OrderStatus) -> Option<Self> {
        match status {
            OrderStatus::Filled => Some(CancelOutcome::AlreadyFilled),
            OrderStatus::Cancelled => Some(CancelOutcome::AlreadyCancelled),
            _ => None,
        }
    }
}

impl From<CancelFailReason> for CancelOutcome {
    fn from(reason: CancelFailReason) -> Self {
        match reason {
            CancelFailReason::AlreadyFilled => CancelOutcome::AlreadyFilled,
            CancelFailReason::AlreadyCancelled => CancelOutcome::AlreadyCancelled,
            CancelFailReason::NotFound => CancelOutcome::CancelFailedFromMe,
        }
    }
}

// ============================================================================
// Router
// ============================================================================

/// One registered wait for a cancel answer
pub struct Waiter {
    order_id: u64,
    token: u64,
    receiver: oneshot::Receiver<CancelOutcome>,
}

type Pending = Vec<(u64, oneshot::Sender<CancelOutcome>)>;

#[derive(Default)]
pub struct CancelRouter {
    waiters: Mutex<HashMap<u64, Pending>>,
    next_token: AtomicU64,
}

impl CancelRouter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, order_id: u64) -> Waiter {
        let token = self.next_token.fetch_add(1, Ordering::Relaxed);
        let (sender, receiver) = oneshot::channel();
        self.waiters
            .lock()
            .entry(order_id)
            .or_default()
            .push((token, sender));
        Waiter {
            order_id,
            token,
            receiver,
        }
    }

    /// Drop a waiter that timed out or whose command was never sent
    pub fn forget(&self, waiter: &Waiter) {
        let mut waiters = self.waiters.lock();
        if let Some(pending) = waiters.get_mut(&waiter.order_id) {
            pending.retain(|(token, _)| *token != waiter.token);
            if pending.is_empty() {
                waiters.remove(&waiter.order_id);
            }
        }
    }

    /// Complete every waiter of `order_id`; returns how many there were
    pub fn complete(&self, order_id: u64, outcome: CancelOutcome) -> usize {
        let Some(pending) = self.waiters.lock().remove(&order_id) else {
            return 0;
        };
        let count = pending.len();
        for (_, sender) in pending {
            let _ = sender.send(outcome);
        }
        debug!(order_id, outcome = outcome.as_str(), waiters = count, "Cancel waiters completed");
        count
    }

    /// Complete waiters answered by a projected engine event
    pub fn on_event(&self, event: &EngineEvent) -> usize {
        match &event.kind {
            EventKind::OrderStatusChange {
                order_id,
                status: OrderStatus::Cancelled,
                ..
            } => self.complete(*order_id, CancelOutcome::Cancelled),
            EventKind::OrderCancelFailed {
                order_id, reason, ..
            } => self.complete(*order_id, (*reason).into()),
            _ => 0,
        }
    }

    pub fn pending(&self) -> usize {
        self.waiters.lock().values().map(Vec::len).sum()
    }
}

// ============================================================================
// Cancel service
// ============================================================================

/// Attempts and per-attempt deadline of one cancel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CancelPolicy {
    pub attempts: u32,
    pub timeout: Duration,
}

impl CancelPolicy {
    /// Synchronous API cancel: `1 + retries` attempts of `timeout_ms`
    pub fn api(config: &CancelConfig) -> Self {
        Self {
            attempts: config.retries.saturating_add(1),
            timeout: Duration::from_millis(config.timeout_ms),
        }
    }

    /// Sibling cancel: `cancel_attempts` sharing `cancel_budget_ms`
    pub fn orchestrator(config: &OrchestratorConfig) -> Self {
        let attempts = config.cancel_attempts.max(1);
        Self {
            attempts,
            timeout: Duration::from_millis(config.cancel_budget_ms / u64::from(attempts)),
        }
    }
}

pub struct CancelService {
    router: Arc<CancelRouter>,
    registry: Arc<MarketRegistry>,
    projector: Arc<Projector>,
    api_policy: CancelPolicy,
    /// Roots whose owner asked for cancellation; no follow-up orders
    user_cancelled: Mutex<HashSet<u64>>,
}

impl CancelService {
    pub fn new(
        router: Arc<CancelRouter>,
        registry: Arc<MarketRegistry>,
        projector: Arc<Projector>,
        api_policy: CancelPolicy,
    ) -> Self {
        Self {
            router,
            registry,
            projector,
            api_policy,
            user_cancelled: Mutex::new(HashSet::new()),
        }
    }

    pub fn router(&self) -> &Arc<CancelRouter> {
        &self.router
    }

    pub fn is_user_cancelled(&self, root_id: u64) -> bool {
        self.user_cancelled.lock().contains(&root_id)
    }

    pub fn clear_user_cancelled(&self, root_id: u64) {
        self.user_cancelled.lock().remove(&root_id);
    }

    /// Cancel on behalf of the owner and wait for the outcome
    ///
    /// Cancelling a root cancels every live order of its tree; cancelling
    /// a container cancels its legs.
    pub async fn cancel_order(&self, owner: AccountKey, order_id: u64) -> Result<CancelOutcome> {
        let order = find_order(&self.projector, order_id)
            .await?
            .filter(|o| o.owner() == owner)
            .ok_or(TradingError::NotFound(order_id))?;

        if let Some(outcome) = CancelOutcome::for_terminal(order.status) {
            return Ok(outcome);
        }
        self.user_cancelled.lock().insert(order.tree_root());

        let targets = self.targets(&order);
        info!(
            market = %order.market_id,
            order_id,
            owner = %owner,
            targets = targets.len(),
            "Cancel requested"
        );
        if targets.len() == 1 && targets[0].id == order.id {
            return Ok(self.cancel(&order, self.api_policy).await);
        }

        let outcomes = futures::future::join_all(
            targets
                .iter()
                .map(|target| self.cancel(target, self.api_policy)),
        )
        .await;
        Ok(Self::combine(&outcomes))
    }

    /// Live primitive orders a cancel of `order` has to reach
    fn targets(&self, order: &Order) -> Vec<Order> {
        let orders = self.projector.orders();
        let mut targets: Vec<Order> = if order.id == order.tree_root() {
            let mut tree = orders.get_tree(&order.market_id, order.id);
            tree.push(order.clone());
            tree
        } else if order.is_container() {
            order
                .legs()
                .filter_map(|id| orders.get(&order.market_id, id))
                .collect()
        } else {
            vec![order.clone()]
        };
        targets.retain(|o| !o.is_container() && !o.is_terminal());
        targets.sort_by_key(|o| o.id);
        targets
    }

    fn combine(outcomes: &[CancelOutcome]) -> CancelOutcome {
        if let Some(failed) = outcomes.iter().find(|o| !o.is_settled()) {
            return *failed;
        }
        if outcomes.contains(&CancelOutcome::Cancelled) {
            return CancelOutcome::Cancelled;
        }
        outcomes
            .first()
            .copied()
            .unwrap_or(CancelOutcome::AlreadyCancelled)
    }

    /// Cancel one primitive order under `policy`
    pub async fn cancel(&self, order: &Order, policy: CancelPolicy) -> CancelOutcome {
        let metrics = TradingMetrics::new(&order.market_id);
        let outcome = self.attempt_all(order, policy).await;
        metrics.record_cancel_outcome(outcome.as_str());
        outcome
    }

    async fn attempt_all(&self, order: &Order, policy: CancelPolicy) -> CancelOutcome {
        if let Some(outcome) = CancelOutcome::for_terminal(order.status) {
            return outcome;
        }
        let Some(handle) = self.registry.get(&order.market_id) else {
            warn!(market = %order.market_id, order_id = order.id, "No running engine for cancel");
            return CancelOutcome::SendingFailed;
        };

        for attempt in 1..=policy.attempts {
            let mut waiter = self.router.register(order.id);
            if let Err(e) = handle.submit(Self::command(order)).await {
                self.router.forget(&waiter);
                warn!(market = %order.market_id, order_id = order.id, error = %e, "Cancel not sent");
                return CancelOutcome::SendingFailed;
            }

            match tokio::time::timeout(policy.timeout, &mut waiter.receiver).await {
                Ok(Ok(outcome)) if outcome.is_settled() => return outcome,
                Ok(Ok(outcome)) => {
                    warn!(
                        market = %order.market_id,
                        order_id = order.id,
                        attempt,
                        outcome = outcome.as_str(),
                        "Engine refused cancel"
                    );
                }
                Ok(Err(_)) => {
                    warn!(market = %order.market_id, order_id = order.id, attempt, "Cancel waiter dropped");
                }
                Err(_) => {
                    self.router.forget(&waiter);
                    warn!(
                        market = %order.market_id,
                        order_id = order.id,
                        attempt,
                        timeout_ms = policy.timeout.as_millis() as u64,
                        "Cancel confirmation timed out"
                    );
                }
            }
        }

        self.compensate(order, &handle).await
    }

    /// Cancel locally, then tell the engine again
    async fn compensate(&self, order: &Order, handle: &MarketHandle) -> CancelOutcome {
        TradingMetrics::new(&order.market_id).record_compensation();
        warn!(market = %order.market_id, order_id = order.id, "Compensating unconfirmed cancel");

        let projection = match self
            .projector
            .apply_synthetic_cancel(&order.market_id, order.id, now_nanos())
            .await
        {
            Ok(projection) => projection,
            Err(e) => {
                error!(market = %order.market_id, order_id = order.id, error = %e, "Compensating cancel failed");
                return CancelOutcome::CancelFailedFromMe;
            }
        };

        if let Err(e) = handle.submit(Self::command(order)).await {
            warn!(market = %order.market_id, order_id = order.id, error = %e, "Cancel resend failed");
        }

        if projection.duplicate {
            // Became terminal while we were waiting
            let current = find_order(&self.projector, order.id).await.ok().flatten();
            return current
                .and_then(|o| CancelOutcome::for_terminal(o.status))
                .unwrap_or(CancelOutcome::AlreadyCancelled);
        }
        CancelOutcome::Cancelled
    }

    fn command(order: &Order) -> Command {
        Command::CancelOrder(CancelCommand {
            id: order.id,
            market_id: order.market_id.clone(),
            owner_id: order.owner_id,
            sub_account: order.sub_account,
        })
    }
}
