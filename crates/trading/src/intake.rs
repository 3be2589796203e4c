//! Order intake
//!
//! Validates a request against its market, locks the funds it needs,
//! persists the order (and the legs of a container) and publishes the
//! engine commands. The caller gets the order back in `pending`; the
//! engine's answer arrives through projection.
//!
//! CRITICAL PROPERTIES:
//! - Nothing is locked for a request that fails validation
//! - Any failure after the lock releases it before returning
//! - Containers never reach the engine, their legs do
//! - Legs carry a claim on the container's lock, never an FMS lock

use std::sync::Arc;
use tracing::{info, warn};

use common::{
    decimal, now_nanos, AccountKey, Market, OrderStatus, OrderType, OtoType, Side, StopKind,
    TrailingPriceType,
};
use config::IntakeConfig;
use fms::{FundsManager, LedgerRef};
use matching_engine::Command;
use oms::{claim_for, Order, Projector, Sequencer};

use crate::error::TradingError;
use crate::price_feed::PriceFeed;
use crate::registry::{MarketHandle, MarketRegistry, SubmitFailure};
use crate::Result;

/// Denominator of relative values (`tp_rel`, `sl_rel`, percentages)
const BPS: u64 = 10_000;

/// A new order as submitted by a caller
///
/// Monetary fields are scaled integers of the target market; zero means
/// "not set".
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderRequest {
    pub owner: AccountKey,
    pub market_id: String,
    pub side: Side,
    pub order_type: OrderType,
    pub stop: StopKind,
    pub price: u64,
    pub amount: u64,
    pub stop_price: u64,
    pub opposite_stop_price: u64,
    /// Spendable quote for market-style buys; estimated when zero
    pub funds: u64,
    pub tp_price: u64,
    pub sl_price: u64,
    pub tp_rel: u64,
    pub sl_rel: u64,
    pub oto_type: OtoType,
    pub trailing_stop_activation_price: u64,
    pub trailing_stop_price: u64,
    pub trailing_stop_price_type: TrailingPriceType,
    pub client_order_id: Option<String>,
    pub ui: Option<String>,
}

impl OrderRequest {
    pub fn new(
        owner: AccountKey,
        market_id: impl Into<String>,
        side: Side,
        order_type: OrderType,
    ) -> Self {
        Self {
            owner,
            market_id: market_id.into(),
            side,
            order_type,
            stop: StopKind::None,
            price: 0,
            amount: 0,
            stop_price: 0,
            opposite_stop_price: 0,
            funds: 0,
            tp_price: 0,
            sl_price: 0,
            tp_rel: 0,
            sl_rel: 0,
            oto_type: OtoType::Limit,
            trailing_stop_activation_price: 0,
            trailing_stop_price: 0,
            trailing_stop_price_type: TrailingPriceType::Absolute,
            client_order_id: None,
            ui: None,
        }
    }

    pub fn limit(
        owner: AccountKey,
        market_id: impl Into<String>,
        side: Side,
        price: u64,
        amount: u64,
    ) -> Self {
        let mut request = Self::new(owner, market_id, side, OrderType::Limit);
        request.price = price;
        request.amount = amount;
        request
    }

    pub fn market(owner: AccountKey, market_id: impl Into<String>, side: Side, amount: u64) -> Self {
        let mut request = Self::new(owner, market_id, side, OrderType::Market);
        request.amount = amount;
        request
    }

    pub fn oco(
        owner: AccountKey,
        market_id: impl Into<String>,
        side: Side,
        amount: u64,
        tp_price: u64,
        sl_price: u64,
    ) -> Self {
        let mut request = Self::new(owner, market_id, side, OrderType::Oco);
        request.amount = amount;
        request.tp_price = tp_price;
        request.sl_price = sl_price;
        request
    }
}

/// Funds one request needs
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct Reservation {
    /// Locked in the coin of the order's side
    funds: u64,
    /// Base locked for the sell leg of a straddle/strangle
    opposite: u64,
    /// Quote value checked against the market's volume limits, if known
    quote_value: Option<u64>,
}

/// Position of an order created under an existing tree
#[derive(Debug, Clone, Copy)]
struct Lineage {
    parent_id: u64,
    root_id: u64,
}

fn invalid<T>(msg: impl Into<String>) -> Result<T> {
    Err(TradingError::validation(msg))
}

/// Upper and lower trigger of a straddle or strangle
fn straddle_triggers(request: &OrderRequest) -> Result<(u64, u64)> {
    let upper = request.stop_price;
    match request.order_type {
        OrderType::Straddle => {
            if request.price == 0 || upper <= request.price {
                return invalid("straddle requires 0 < price < stop_price");
            }
            match request.price.checked_mul(2).and_then(|p| p.checked_sub(upper)) {
                Some(lower) if lower > 0 => Ok((upper, lower)),
                _ => invalid("straddle lower trigger must be positive"),
            }
        }
        OrderType::Strangle => {
            let lower = request.opposite_stop_price;
            if lower == 0 || upper <= lower {
                return invalid("strangle requires 0 < opposite_stop_price < stop_price");
            }
            Ok((upper, lower))
        }
        other => invalid(format!("{} has no straddle triggers", other)),
    }
}

/// Find an order among live orders, then in the store
pub(crate) async fn find_order(projector: &Projector, order_id: u64) -> Result<Option<Order>> {
    if let Some(order) = projector.orders().locate(order_id) {
        return Ok(Some(order));
    }
    Ok(projector.store().get_order(order_id).await?)
}

pub struct OrderIntake {
    projector: Arc<Projector>,
    funds: Arc<FundsManager>,
    sequencer: Arc<Sequencer>,
    registry: Arc<MarketRegistry>,
    prices: Arc<dyn PriceFeed>,
    config: IntakeConfig,
}

impl OrderIntake {
    pub fn new(
        projector: Arc<Projector>,
        funds: Arc<FundsManager>,
        sequencer: Arc<Sequencer>,
        registry: Arc<MarketRegistry>,
        prices: Arc<dyn PriceFeed>,
        config: IntakeConfig,
    ) -> Self {
        Self {
            projector,
            funds,
            sequencer,
            registry,
            prices,
            config,
        }
    }

    /// Validate, lock, persist and publish a new order
    ///
    /// # Returns
    /// The order in `pending`; for containers, the container itself
    pub async fn create_order(&self, request: OrderRequest) -> Result<Order> {
        self.create(request, None).await
    }

    /// Opposite-side OCO placed under an existing tree
    pub async fn create_child_oco(
        &self,
        parent: &Order,
        side: Side,
        amount: u64,
        tp_price: u64,
        sl_price: u64,
    ) -> Result<Order> {
        let mut request = OrderRequest::oco(
            parent.owner(),
            parent.market_id.clone(),
            side,
            amount,
            tp_price,
            sl_price,
        );
        request.ui = parent.ui.clone();
        let lineage = Lineage {
            parent_id: parent.id,
            root_id: parent.tree_root(),
        };
        self.create(request, Some(lineage)).await
    }

    /// Replace a live plain order with a new one in a single engine step
    ///
    /// The new order locks its own funds; the old one releases its residual
    /// through projection once the engine cancelled it. When the engine
    /// cannot cancel the old order, it cancels the new one instead.
    pub async fn replace_order(&self, old_id: u64, request: OrderRequest) -> Result<Order> {
        let old = find_order(&self.projector, old_id)
            .await?
            .filter(|o| o.owner() == request.owner)
            .ok_or(TradingError::NotFound(old_id))?;

        if old.is_terminal() {
            return invalid(format!("order {} is already {}", old_id, old.status));
        }
        if old.parent_order_id.is_some() || !old.order_type.is_engine_primitive() {
            return invalid("only plain limit, market and trailing-stop orders can be replaced");
        }
        if !request.order_type.is_engine_primitive() {
            return invalid(format!(
                "cannot replace with a {} order",
                request.order_type
            ));
        }
        if old.market_id != request.market_id {
            return invalid(format!(
                "replacement must stay on market {}",
                old.market_id
            ));
        }

        let (market, handle) = self.open_market(&request.market_id)?;
        let reservation = self.reserve(&market, &request)?;
        let mut order = self.build_root(
            &market,
            &request,
            self.sequencer.next_order_id(),
            &reservation,
            now_nanos(),
        )?;
        order.is_replace = true;
        order.previous_locked_funds = old.residual_funds();

        self.lock(&market, &order, &reservation).await?;
        let command = Command::ReplaceOrder {
            old_id,
            order: order.to_command(),
        };
        let orders = vec![order.clone()];
        if let Err(failure) = self.persist_and_submit(&handle, &orders, vec![command]).await {
            self.abandon(&market, &orders, &reservation, &failure).await;
            return Err(failure.error);
        }

        info!(
            market = %market.id,
            order_id = order.id,
            old_id,
            owner = %order.owner(),
            locked = order.locked_funds,
            "Replace submitted"
        );
        Ok(order)
    }

    async fn create(&self, request: OrderRequest, lineage: Option<Lineage>) -> Result<Order> {
        let (market, handle) = self.open_market(&request.market_id)?;
        let reservation = self.reserve(&market, &request)?;

        let now = now_nanos();
        let mut root = self.build_root(
            &market,
            &request,
            self.sequencer.next_order_id(),
            &reservation,
            now,
        )?;
        if let Some(lineage) = lineage {
            root.parent_order_id = Some(lineage.parent_id);
            root.root_order_id = Some(lineage.root_id);
        }
        let legs = self.build_legs(&market, &mut root, now)?;
        let commands: Vec<Command> = if legs.is_empty() {
            vec![Command::NewOrder(root.to_command())]
        } else {
            legs.iter().map(|leg| Command::NewOrder(leg.to_command())).collect()
        };

        self.lock(&market, &root, &reservation).await?;

        let mut orders = Vec::with_capacity(1 + legs.len());
        orders.push(root.clone());
        orders.extend(legs);
        if let Err(failure) = self.persist_and_submit(&handle, &orders, commands).await {
            self.abandon(&market, &orders, &reservation, &failure).await;
            return Err(failure.error);
        }

        info!(
            market = %market.id,
            order_id = root.id,
            owner = %root.owner(),
            side = %root.side,
            order_type = %root.order_type,
            price = root.price,
            amount = root.amount,
            locked = root.locked_funds,
            legs = orders.len() - 1,
            "Order accepted"
        );
        Ok(root)
    }

    // ========================================================================
    // Validation
    // ========================================================================

    fn open_market(&self, market_id: &str) -> Result<(Market, Arc<MarketHandle>)> {
        let market = self
            .projector
            .market(market_id)
            .map_err(|_| TradingError::UnknownMarket(market_id.to_string()))?;
        if !market.is_active() {
            return Err(TradingError::MarketDisabled(market_id.to_string()));
        }
        let handle = self
            .registry
            .get(market_id)
            .ok_or_else(|| TradingError::EngineUnavailable(market_id.to_string()))?;
        if handle.is_halted() {
            return Err(TradingError::MarketHalted(market_id.to_string()));
        }
        Ok((market.clone(), handle))
    }

    fn reserve(&self, market: &Market, request: &OrderRequest) -> Result<Reservation> {
        if request.amount == 0 {
            return invalid("amount must be positive");
        }
        if market.min_base_volume > 0 && request.amount < market.min_base_volume {
            return invalid(format!(
                "amount {} below minimum {}",
                market.format_amount(request.amount),
                market.format_amount(market.min_base_volume)
            ));
        }
        if market.max_base_price > 0 && request.amount > market.max_base_price {
            return invalid(format!(
                "amount {} above maximum {}",
                market.format_amount(request.amount),
                market.format_amount(market.max_base_price)
            ));
        }
        for (field, price) in [
            ("price", request.price),
            ("stop_price", request.stop_price),
            ("opposite_stop_price", request.opposite_stop_price),
            ("tp_price", request.tp_price),
            ("sl_price", request.sl_price),
            (
                "trailing_stop_activation_price",
                request.trailing_stop_activation_price,
            ),
        ] {
            if market.max_quote_price > 0 && price > market.max_quote_price {
                return invalid(format!(
                    "{} {} above maximum {}",
                    field,
                    market.format_price(price),
                    market.format_price(market.max_quote_price)
                ));
            }
        }
        if request.stop != StopKind::None {
            if !matches!(request.order_type, OrderType::Limit | OrderType::Market) {
                return invalid("stop conditions apply to limit and market orders only");
            }
            if request.stop_price == 0 {
                return invalid("stop order requires stop_price");
            }
        }

        let side = request.side;
        let reservation = match request.order_type {
            OrderType::Limit => self.reserve_limit(market, side, request.price, request.amount)?,
            OrderType::Market => {
                let reference = if request.stop != StopKind::None {
                    Some(request.stop_price)
                } else {
                    self.prices.last_price(&market.id)
                };
                self.reserve_market(market, side, request.amount, request.funds, reference)?
            }
            OrderType::TrailingStop => {
                if request.trailing_stop_price == 0 {
                    return invalid("trailing stop requires trailing_stop_price");
                }
                if request.trailing_stop_price_type == TrailingPriceType::Percentage
                    && request.trailing_stop_price >= BPS
                {
                    return invalid("trailing percentage must be below 10000");
                }
                let reference = self.trailing_reference(market, request)?;
                self.reserve_market(market, side, request.amount, request.funds, reference)?
            }
            OrderType::Oto => {
                self.check_oto(request)?;
                match request.oto_type {
                    OtoType::Limit => {
                        self.reserve_limit(market, side, request.price, request.amount)?
                    }
                    OtoType::Market => self.reserve_market(
                        market,
                        side,
                        request.amount,
                        request.funds,
                        self.prices.last_price(&market.id),
                    )?,
                }
            }
            OrderType::Oco => {
                if request.tp_price == 0 || request.sl_price == 0 {
                    return invalid("OCO requires tp_price and sl_price");
                }
                let ordered = match side {
                    Side::Sell => request.tp_price > request.sl_price,
                    Side::Buy => request.tp_price < request.sl_price,
                };
                if !ordered {
                    return invalid(format!(
                        "{} OCO requires tp_price {} sl_price",
                        side,
                        if side.is_sell() { "above" } else { "below" }
                    ));
                }
                let tp = market.quote_value(request.tp_price, request.amount)?;
                let sl = market.quote_value(request.sl_price, request.amount)?;
                Reservation {
                    funds: match side {
                        Side::Buy => tp.max(sl),
                        Side::Sell => request.amount,
                    },
                    opposite: 0,
                    quote_value: Some(tp.max(sl)),
                }
            }
            OrderType::Straddle | OrderType::Strangle => {
                let (upper, _) = straddle_triggers(request)?;
                if (request.tp_rel == 0) != (request.sl_rel == 0) {
                    return invalid("tp_rel and sl_rel must be given together");
                }
                if request.tp_rel >= BPS || request.sl_rel >= BPS {
                    return invalid("tp_rel and sl_rel must be below 10000");
                }
                let quote = market.quote_value(upper, request.amount)?;
                let funds = if request.funds > 0 {
                    request.funds
                } else {
                    decimal::add_bps(quote, self.config.market_buy_buffer_bps)?
                };
                if funds == 0 {
                    return invalid("straddle amount too small to fund");
                }
                Reservation {
                    funds,
                    opposite: request.amount,
                    quote_value: Some(quote),
                }
            }
        };

        self.check_quote_limits(market, request.owner, reservation.quote_value)?;
        Ok(reservation)
    }

    fn reserve_limit(&self, market: &Market, side: Side, price: u64, amount: u64) -> Result<Reservation> {
        if price == 0 {
            return invalid("limit order requires price");
        }
        let quote = market.quote_value(price, amount)?;
        if side.is_buy() && quote == 0 {
            return invalid("order value rounds to zero");
        }
        Ok(Reservation {
            funds: match side {
                Side::Buy => quote,
                Side::Sell => amount,
            },
            opposite: 0,
            quote_value: Some(quote),
        })
    }

    /// Market-style order expected to execute around `reference`
    fn reserve_market(
        &self,
        market: &Market,
        side: Side,
        amount: u64,
        explicit_funds: u64,
        reference: Option<u64>,
    ) -> Result<Reservation> {
        let estimate = reference
            .map(|price| market.quote_value(price, amount))
            .transpose()?;

        match side {
            Side::Sell => Ok(Reservation {
                funds: amount,
                opposite: 0,
                quote_value: estimate,
            }),
            Side::Buy => {
                let funds = if explicit_funds > 0 {
                    explicit_funds
                } else {
                    let estimate = estimate.ok_or_else(|| {
                        TradingError::validation(format!(
                            "no reference price on {}, funds required",
                            market.id
                        ))
                    })?;
                    decimal::add_bps(estimate, self.config.market_buy_buffer_bps)?
                };
                if funds == 0 {
                    return invalid("market buy needs positive funds");
                }
                Ok(Reservation {
                    funds,
                    opposite: 0,
                    quote_value: Some(estimate.unwrap_or(funds)),
                })
            }
        }
    }

    /// Worst expected execution price of a trailing stop
    fn trailing_reference(&self, market: &Market, request: &OrderRequest) -> Result<Option<u64>> {
        let base = match request.trailing_stop_activation_price {
            0 => self.prices.last_price(&market.id),
            activation => Some(activation),
        };
        let Some(base) = base else {
            return Ok(None);
        };
        if request.side.is_sell() {
            return Ok(Some(base));
        }
        let offset = request
            .trailing_stop_price_type
            .offset(base, request.trailing_stop_price);
        Ok(Some(base.checked_add(offset).ok_or_else(|| {
            TradingError::validation("trailing offset overflows")
        })?))
    }

    fn check_oto(&self, request: &OrderRequest) -> Result<()> {
        match request.oto_type {
            OtoType::Limit => {
                if request.tp_price == 0 || request.sl_price == 0 {
                    return invalid("limit OTO requires tp_price and sl_price");
                }
                // The child trades the opposite side of the parent
                let ordered = match request.side {
                    Side::Buy => request.tp_price > request.sl_price,
                    Side::Sell => request.tp_price < request.sl_price,
                };
                if !ordered {
                    return invalid("OTO tp_price and sl_price are on the wrong sides");
                }
            }
            OtoType::Market => {
                if request.tp_rel == 0 || request.sl_rel == 0 {
                    return invalid("market OTO requires tp_rel and sl_rel");
                }
                if request.tp_rel >= BPS || request.sl_rel >= BPS {
                    return invalid("tp_rel and sl_rel must be below 10000");
                }
            }
        }
        Ok(())
    }

    fn check_quote_limits(
        &self,
        market: &Market,
        owner: AccountKey,
        quote_value: Option<u64>,
    ) -> Result<()> {
        let Some(quote) = quote_value else {
            return Ok(());
        };
        if market.min_quote_volume > 0 && quote < market.min_quote_volume {
            return invalid(format!(
                "order value {} below minimum {}",
                market.format_price(quote),
                market.format_price(market.min_quote_volume)
            ));
        }
        let exempt = self
            .config
            .market_maker_accounts
            .contains(&owner.user_id);
        if market.max_quote_spend > 0 && quote > market.max_quote_spend && !exempt {
            return invalid(format!(
                "order value {} above maximum {}",
                market.format_price(quote),
                market.format_price(market.max_quote_spend)
            ));
        }
        Ok(())
    }

    // ========================================================================
    // Order construction
    // ========================================================================

    fn build_root(
        &self,
        market: &Market,
        request: &OrderRequest,
        id: u64,
        reservation: &Reservation,
        now: i64,
    ) -> Result<Order> {
        let straddle = matches!(
            request.order_type,
            OrderType::Straddle | OrderType::Strangle
        );
        let side = if straddle { Side::Buy } else { request.side };

        let mut order = Order::new(id, request.owner, &market.id, side, request.order_type, now);
        order.client_order_id = request.client_order_id.clone();
        order.ui = request.ui.clone();
        order.stop = request.stop;
        order.price = request.price;
        order.amount = request.amount;
        order.stop_price = request.stop_price;
        order.opposite_stop_price = request.opposite_stop_price;
        order.tp_price = request.tp_price;
        order.sl_price = request.sl_price;
        order.tp_rel = request.tp_rel;
        order.sl_rel = request.sl_rel;
        order.oto_type = request.oto_type;
        order.trailing_stop_activation_price = request.trailing_stop_activation_price;
        order.trailing_stop_price = request.trailing_stop_price;
        order.trailing_stop_price_type = request.trailing_stop_price_type;
        order.locked_funds = reservation.funds;
        order.previous_opposite_locked_funds = reservation.opposite;

        if straddle {
            let (upper, lower) = straddle_triggers(request)?;
            order.stop_price = upper;
            order.opposite_stop_price = lower;
        }
        Ok(order)
    }

    fn leg(&self, root: &Order, side: Side, order_type: OrderType, now: i64) -> Order {
        let mut leg = Order::new(
            self.sequencer.next_order_id(),
            root.owner(),
            &root.market_id,
            side,
            order_type,
            now,
        );
        leg.amount = root.amount;
        leg.parent_order_id = Some(root.id);
        leg.root_order_id = Some(root.tree_root());
        leg.ui = root.ui.clone();
        leg
    }

    /// Legs of a container; links them into `root`
    fn build_legs(&self, market: &Market, root: &mut Order, now: i64) -> Result<Vec<Order>> {
        let (first, second) = match root.order_type {
            OrderType::Oco => {
                let mut tp = self.leg(root, root.side, OrderType::Limit, now);
                tp.price = root.tp_price;
                tp.locked_funds = claim_for(market, root.side, root.tp_price, root.amount)?;

                let mut sl = self.leg(root, root.side, OrderType::Limit, now);
                sl.stop = StopKind::Loss;
                sl.stop_price = root.sl_price;
                sl.price = root.sl_price;
                sl.locked_funds = claim_for(market, root.side, root.sl_price, root.amount)?;
                (tp, sl)
            }
            OrderType::Straddle | OrderType::Strangle => {
                let mut upper = self.leg(root, Side::Buy, OrderType::Market, now);
                upper.stop = StopKind::Loss;
                upper.stop_price = root.stop_price;
                upper.locked_funds = root.locked_funds;

                let mut lower = self.leg(root, Side::Sell, OrderType::Market, now);
                lower.stop = StopKind::Loss;
                lower.stop_price = root.opposite_stop_price;
                lower.locked_funds = root.previous_opposite_locked_funds;
                (upper, lower)
            }
            _ => return Ok(Vec::new()),
        };

        root.tp_order_id = Some(first.id);
        root.sl_order_id = Some(second.id);
        root.tp_status = Some(OrderStatus::Pending);
        root.sl_status = Some(OrderStatus::Pending);
        Ok(vec![first, second])
    }

    // ========================================================================
    // Funds and publication
    // ========================================================================

    async fn lock(&self, market: &Market, root: &Order, reservation: &Reservation) -> Result<()> {
        let owner = root.owner();
        let reference = LedgerRef::order(root.id);

        self.funds
            .lock(owner, market.funds_coin(root.side), reservation.funds, &reference)
            .await?;
        if reservation.opposite > 0 {
            let opposite_coin = market.funds_coin(root.side.opposite());
            if let Err(e) = self
                .funds
                .lock(owner, opposite_coin, reservation.opposite, &reference)
                .await
            {
                let first = Reservation {
                    opposite: 0,
                    ..*reservation
                };
                self.release(market, root, &first).await;
                return Err(e.into());
            }
        }
        Ok(())
    }

    async fn release(&self, market: &Market, root: &Order, reservation: &Reservation) {
        let owner = root.owner();
        let reference = LedgerRef::order(root.id);
        for (coin, amount) in [
            (market.funds_coin(root.side), reservation.funds),
            (market.funds_coin(root.side.opposite()), reservation.opposite),
        ] {
            if let Err(e) = self.funds.unlock(owner, coin, amount, &reference).await {
                warn!(order_id = root.id, coin, amount, error = %e, "Failed to release intake lock");
            }
        }
    }

    async fn persist_and_submit(
        &self,
        handle: &MarketHandle,
        orders: &[Order],
        commands: Vec<Command>,
    ) -> std::result::Result<(), SubmitFailure> {
        for order in orders {
            self.projector
                .store()
                .insert_order(order)
                .await
                .map_err(TradingError::from)?;
        }
        for order in orders {
            self.projector.orders().put(order.clone());
        }
        handle.submit_all(commands).await
    }

    /// Undo the part of an order that never reached the engine
    ///
    /// With nothing delivered the whole order is dropped and its lock
    /// released. When some legs of a container made it, only the others
    /// are cancelled; the container keeps its lock for the live legs and
    /// closes through projection.
    async fn abandon(
        &self,
        market: &Market,
        orders: &[Order],
        reservation: &Reservation,
        failure: &SubmitFailure,
    ) {
        let Some(root) = orders.first() else {
            return;
        };
        if failure.sent > 0 && orders.len() > 1 {
            let unsent = &orders[(1 + failure.sent).min(orders.len())..];
            warn!(
                market = %market.id,
                order_id = root.id,
                sent = failure.sent,
                unsent = unsent.len(),
                error = %failure.error,
                "Container partly submitted"
            );
            for leg in unsent {
                if let Err(e) = self
                    .projector
                    .apply_synthetic_cancel(&market.id, leg.id, now_nanos())
                    .await
                {
                    warn!(order_id = leg.id, error = %e, "Failed to cancel unsent leg");
                }
            }
            return;
        }

        warn!(market = %market.id, order_id = root.id, error = %failure.error, "Order abandoned before reaching the engine");
        self.release(market, root, reservation).await;

        let now = now_nanos();
        for order in orders {
            self.projector.orders().remove(&market.id, order.id);
            let mut cancelled = order.clone();
            cancelled.status = OrderStatus::Cancelled;
            cancelled.updated_at = now;
            if let Err(e) = self.projector.store().insert_order(&cancelled).await {
                warn!(order_id = order.id, error = %e, "Failed to mark abandoned order cancelled");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::price_feed::LastPriceCache;
    use common::MarketStatus;
    use fms::{FundsError, InMemoryLiabilityStore};
    use matching_engine::OrderBookSnapshot;
    use oms::{FeeRates, FeeSchedule, InMemoryOrderStore, OrderManager, OrderStore};
    use std::sync::atomic::AtomicBool;
    use storage::InMemoryLog;
    use tokio::sync::{mpsc, watch};

    const USER: AccountKey = AccountKey {
        user_id: 10,
        sub_account: 0,
    };

    fn market(id: &str) -> Market {
        Market {
            id: id.to_string(),
            base: "BTC".to_string(),
            quote: "USDT".to_string(),
            base_precision: 4,
            quote_precision: 2,
            min_base_volume: 1,
            min_quote_volume: 0,
            max_base_price: 0,
            max_quote_price: 0,
            max_quote_spend: 10_000_000,
            status: MarketStatus::Active,
        }
    }

    struct Harness {
        intake: OrderIntake,
        funds: Arc<FundsManager>,
        store: Arc<InMemoryOrderStore>,
        prices: Arc<LastPriceCache>,
        commands: mpsc::Receiver<Command>,
    }

    fn harness(config: IntakeConfig) -> Harness {
        harness_with_capacity(config, 16)
    }

    fn harness_with_capacity(config: IntakeConfig, capacity: usize) -> Harness {
        let mut disabled = market("ethusdt");
        disabled.status = MarketStatus::Disabled;
        let markets = vec![market("btcusdt"), disabled];

        let log = Arc::new(InMemoryLog::new());
        let store = Arc::new(InMemoryOrderStore::new());
        let funds = Arc::new(FundsManager::new(
            Arc::new(InMemoryLiabilityStore::new()),
            AccountKey::new(1, 0),
        ));
        let sequencer = Arc::new(Sequencer::new());
        let projector = Arc::new(Projector::new(
            Arc::new(OrderManager::new()),
            store.clone(),
            funds.clone(),
            sequencer.clone(),
            FeeSchedule::new(FeeRates::default()),
            markets.clone(),
            log.clone(),
        ));

        let registry = Arc::new(MarketRegistry::new());
        let (tx, rx) = mpsc::channel(capacity);
        let (_depth_tx, depth_rx) = watch::channel(OrderBookSnapshot::empty("btcusdt"));
        registry.insert(MarketHandle::new(
            markets[0].clone(),
            tx,
            depth_rx,
            Arc::new(AtomicBool::new(false)),
            log,
        ));

        let prices = Arc::new(LastPriceCache::new());
        Harness {
            intake: OrderIntake::new(
                projector,
                funds.clone(),
                sequencer,
                registry,
                prices.clone(),
                config,
            ),
            funds,
            store,
            prices,
            commands: rx,
        }
    }

    #[tokio::test]
    async fn test_limit_buy_locks_quote_and_publishes() {
        let mut h = harness(IntakeConfig::default());
        h.funds.deposit(USER, "USDT", 5_000_000, "d1").await.unwrap();

        // 0.5000 BTC at 30000.00
        let order = h
            .intake
            .create_order(OrderRequest::limit(USER, "btcusdt", Side::Buy, 3_000_000, 5_000))
            .await
            .unwrap();

        assert_eq!(order.id, 1);
        assert_eq!(order.status, OrderStatus::Pending);
        assert_eq!(order.locked_funds, 1_500_000);
        let cell = h.funds.balance(USER, "USDT").await;
        assert_eq!((cell.available, cell.locked), (3_500_000, 1_500_000));

        assert_eq!(h.store.get_order(1).await.unwrap().unwrap().status, OrderStatus::Pending);
        match h.commands.recv().await.unwrap() {
            Command::NewOrder(cmd) => {
                assert_eq!(cmd.id, 1);
                assert_eq!(cmd.funds, 1_500_000);
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_partly_submitted_container_cancels_only_unsent_legs() {
        let Harness {
            intake,
            funds,
            store,
            commands,
            ..
        } = harness_with_capacity(IntakeConfig::default(), 1);
        funds.deposit(USER, "BTC", 10_000, "d1").await.unwrap();

        // The TP leg fills the channel, the engine goes away before the SL leg
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
            drop(commands);
        });

        let err = intake
            .create_order(OrderRequest::oco(USER, "btcusdt", Side::Sell, 10_000, 11_000, 9_000))
            .await
            .unwrap_err();
        assert!(matches!(err, TradingError::EngineUnavailable(_)));

        let container = store.get_order(1).await.unwrap().unwrap();
        assert_eq!((container.tp_order_id, container.sl_order_id), (Some(2), Some(3)));
        assert!(!container.is_terminal());
        assert_eq!(container.sl_status, Some(OrderStatus::Cancelled));
        assert_eq!(store.get_order(2).await.unwrap().unwrap().status, OrderStatus::Pending);
        assert_eq!(store.get_order(3).await.unwrap().unwrap().status, OrderStatus::Cancelled);

        // The live TP leg still spends the container's lock
        let cell = funds.balance(USER, "BTC").await;
        assert_eq!((cell.available, cell.locked), (0, 10_000));
    }

    #[tokio::test]
    async fn test_insufficient_funds_leaves_no_trace() {
        let h = harness(IntakeConfig::default());
        h.funds.deposit(USER, "BTC", 100, "d1").await.unwrap();

        let err = h
            .intake
            .create_order(OrderRequest::limit(USER, "btcusdt", Side::Sell, 3_000_000, 5_000))
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            TradingError::Funds(FundsError::InsufficientFunds { .. })
        ));
        assert_eq!(h.store.order_count(), 0);
        assert_eq!(h.funds.get_available(USER, "BTC").await, 100);
    }

    #[tokio::test]
    async fn test_validation_rules() {
        let h = harness(IntakeConfig {
            market_buy_buffer_bps: 500,
            market_maker_accounts: vec![99],
        });
        let maker = AccountKey::new(99, 0);
        h.funds.deposit(USER, "USDT", 1_000_000_000, "d1").await.unwrap();
        h.funds.deposit(maker, "USDT", 1_000_000_000, "d2").await.unwrap();

        // Above max_quote_spend (100000.00)
        let big = OrderRequest::limit(USER, "btcusdt", Side::Buy, 3_000_000, 40_000);
        assert!(matches!(
            h.intake.create_order(big.clone()).await,
            Err(TradingError::Validation(_))
        ));
        let mut as_maker = big;
        as_maker.owner = maker;
        assert!(h.intake.create_order(as_maker).await.is_ok());

        assert!(matches!(
            h.intake
                .create_order(OrderRequest::limit(USER, "ethusdt", Side::Buy, 100, 1))
                .await,
            Err(TradingError::MarketDisabled(_))
        ));
        assert!(matches!(
            h.intake
                .create_order(OrderRequest::limit(USER, "dogeusdt", Side::Buy, 100, 1))
                .await,
            Err(TradingError::UnknownMarket(_))
        ));
        assert!(matches!(
            h.intake
                .create_order(OrderRequest::limit(USER, "btcusdt", Side::Buy, 0, 1))
                .await,
            Err(TradingError::Validation(_))
        ));

        // Sell OCO needs tp above sl
        assert!(matches!(
            h.intake
                .create_order(OrderRequest::oco(USER, "btcusdt", Side::Sell, 10_000, 9_000, 11_000))
                .await,
            Err(TradingError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn test_market_buy_funds_from_reference_price() {
        let h = harness(IntakeConfig {
            market_buy_buffer_bps: 500,
            market_maker_accounts: vec![],
        });
        h.funds.deposit(USER, "USDT", 10_000_000, "d1").await.unwrap();

        let request = OrderRequest::market(USER, "btcusdt", Side::Buy, 1_000);
        assert!(matches!(
            h.intake.create_order(request.clone()).await,
            Err(TradingError::Validation(_))
        ));

        h.prices.update("btcusdt", 10_000);
        let order = h.intake.create_order(request).await.unwrap();
        // 100.00 * 0.1000 = 10.00, plus 5 %
        assert_eq!(order.locked_funds, 1_050);
    }

    #[tokio::test]
    async fn test_oco_container_and_legs() {
        let mut h = harness(IntakeConfig::default());
        h.funds.deposit(USER, "BTC", 10_000, "d1").await.unwrap();

        let root = h
            .intake
            .create_order(OrderRequest::oco(USER, "btcusdt", Side::Sell, 10_000, 11_000, 9_000))
            .await
            .unwrap();

        assert_eq!(root.locked_funds, 10_000);
        assert_eq!((root.tp_order_id, root.sl_order_id), (Some(2), Some(3)));

        let tp = h.store.get_order(2).await.unwrap().unwrap();
        assert_eq!((tp.order_type, tp.price, tp.stop), (OrderType::Limit, 11_000, StopKind::None));
        assert_eq!(tp.parent_order_id, Some(1));
        let sl = h.store.get_order(3).await.unwrap().unwrap();
        assert_eq!((sl.stop, sl.stop_price, sl.price), (StopKind::Loss, 9_000, 9_000));
        assert_eq!(sl.locked_funds, 10_000);

        // Only the legs reach the engine
        let ids: Vec<u64> = vec![
            h.commands.recv().await.unwrap().order_id(),
            h.commands.recv().await.unwrap().order_id(),
        ];
        assert_eq!(ids, vec![2, 3]);
        assert!(h.commands.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_straddle_locks_both_coins() {
        let h = harness(IntakeConfig {
            market_buy_buffer_bps: 0,
            market_maker_accounts: vec![],
        });
        h.funds.deposit(USER, "USDT", 1_000_000, "d1").await.unwrap();
        h.funds.deposit(USER, "BTC", 10_000, "d2").await.unwrap();

        let mut request = OrderRequest::new(USER, "btcusdt", Side::Sell, OrderType::Straddle);
        request.price = 10_000;
        request.stop_price = 11_000;
        request.amount = 10_000;
        let root = h.intake.create_order(request).await.unwrap();

        assert_eq!(root.side, Side::Buy);
        assert_eq!((root.stop_price, root.opposite_stop_price), (11_000, 9_000));
        assert_eq!(root.locked_funds, 11_000);
        assert_eq!(root.previous_opposite_locked_funds, 10_000);
        assert_eq!(h.funds.balance(USER, "USDT").await.locked, 11_000);
        assert_eq!(h.funds.balance(USER, "BTC").await.locked, 10_000);

        let lower = h.store.get_order(3).await.unwrap().unwrap();
        assert_eq!((lower.side, lower.order_type), (Side::Sell, OrderType::Market));
        assert_eq!(lower.stop_price, 9_000);
    }

    #[tokio::test]
    async fn test_straddle_second_lock_failure_releases_first() {
        let h = harness(IntakeConfig::default());
        h.funds.deposit(USER, "USDT", 1_000_000, "d1").await.unwrap();

        let mut request = OrderRequest::new(USER, "btcusdt", Side::Buy, OrderType::Strangle);
        request.stop_price = 11_000;
        request.opposite_stop_price = 9_500;
        request.amount = 10_000;
        assert!(h.intake.create_order(request).await.is_err());

        let cell = h.funds.balance(USER, "USDT").await;
        assert_eq!((cell.available, cell.locked), (1_000_000, 0));
    }

    #[tokio::test]
    async fn test_publish_failure_releases_lock() {
        let h = harness(IntakeConfig::default());
        let Harness {
            intake,
            funds,
            store,
            commands,
            ..
        } = h;
        drop(commands);
        funds.deposit(USER, "USDT", 5_000_000, "d1").await.unwrap();

        let err = intake
            .create_order(OrderRequest::limit(USER, "btcusdt", Side::Buy, 3_000_000, 5_000))
            .await
            .unwrap_err();

        assert!(matches!(err, TradingError::EngineUnavailable(_)));
        assert_eq!(funds.get_available(USER, "USDT").await, 5_000_000);
        assert_eq!(
            store.get_order(1).await.unwrap().unwrap().status,
            OrderStatus::Cancelled
        );
    }

    #[tokio::test]
    async fn test_replace_links_previous_funds() {
        let mut h = harness(IntakeConfig::default());
        h.funds.deposit(USER, "USDT", 5_000_000, "d1").await.unwrap();

        let old = h
            .intake
            .create_order(OrderRequest::limit(USER, "btcusdt", Side::Buy, 1_000_000, 10_000))
            .await
            .unwrap();
        let _ = h.commands.recv().await;

        let replacement = OrderRequest::limit(USER, "btcusdt", Side::Buy, 1_100_000, 10_000);
        let order = h.intake.replace_order(old.id, replacement.clone()).await.unwrap();
        assert!(order.is_replace);
        assert_eq!(order.previous_locked_funds, 1_000_000);
        assert!(matches!(
            h.commands.recv().await.unwrap(),
            Command::ReplaceOrder { old_id: 1, .. }
        ));

        let mut stranger = replacement;
        stranger.owner = AccountKey::new(11, 0);
        assert!(matches!(
            h.intake.replace_order(old.id, stranger).await,
            Err(TradingError::NotFound(1))
        ));
    }
}
