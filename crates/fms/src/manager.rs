//! Funds manager: the only component that mutates balances
//!
//! Every primitive is turned into a batch of ledger rows and applied
//! atomically:
//!
//! 1. Lock the affected accounts in canonical (sorted) order
//! 2. Drop rows that were already applied (replays)
//! 3. Validate that no balance goes negative
//! 4. Write the rows to the liability store (one retry on transient failure)
//! 5. Update the in-memory cells
//!
//! Memory is only touched after the store accepted the rows, so a failed
//! write leaves no trace.

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::{debug, info, warn};

use common::{AccountKey, Market};

use crate::error::FundsError;
use crate::ledger::{Account, DedupKey, LedgerOp, LedgerRef, LiabilityRow};
use crate::store::LiabilityStore;
use crate::Result;

/// Balance of one coin for one account
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BalanceCell {
    pub available: u64,
    pub locked: u64,
    /// Part of `locked` held by open orders
    pub in_orders: u64,
}

impl BalanceCell {
    pub fn total(&self) -> u64 {
        self.available.saturating_add(self.locked)
    }

    fn apply(&self, row: &LiabilityRow) -> Option<Self> {
        let shift = |value: u64| -> Option<u64> {
            let next = value as i128 + row.net();
            u64::try_from(next).ok()
        };
        let mut next = *self;
        match row.account {
            Account::Main => next.available = shift(self.available)?,
            Account::Locked => next.locked = shift(self.locked)?,
        }
        if row.counts_in_orders() {
            // Order locks released through other refs never go below zero
            next.in_orders = shift(self.in_orders).unwrap_or(0);
        }
        Some(next)
    }
}

type AccountCells = HashMap<String, BalanceCell>;

/// One trade's settlement between buyer and seller
#[derive(Debug, Clone)]
pub struct TradeSettlement<'a> {
    pub market: &'a Market,
    pub trade_seq: u64,
    pub buyer: AccountKey,
    pub seller: AccountKey,
    /// Base delivered by the seller
    pub volume: u64,
    /// Quote paid by the buyer
    pub quote_volume: u64,
    /// Charged on the base the buyer receives
    pub buyer_fee: u64,
    /// Charged on the quote the seller receives
    pub seller_fee: u64,
}

pub struct FundsManager {
    store: Arc<dyn LiabilityStore>,
    accounts: RwLock<HashMap<AccountKey, Arc<AsyncMutex<AccountCells>>>>,
    applied: Mutex<HashSet<DedupKey>>,
    fee_account: AccountKey,
}

impl FundsManager {
    pub fn new(store: Arc<dyn LiabilityStore>, fee_account: AccountKey) -> Self {
        Self {
            store,
            accounts: RwLock::new(HashMap::new()),
            applied: Mutex::new(HashSet::new()),
            fee_account,
        }
    }

    pub fn fee_account(&self) -> AccountKey {
        self.fee_account
    }

    /// Rebuild every cell from the ledger
    pub async fn bootstrap(&self) -> Result<usize> {
        let rows = self.store.load_all().await?;

        let mut cells: HashMap<AccountKey, AccountCells> = HashMap::new();
        let mut applied = HashSet::with_capacity(rows.len());
        for row in &rows {
            if !applied.insert(row.key()) {
                continue;
            }
            let account = cells.entry(row.owner()).or_default();
            let cell = account.entry(row.coin.clone()).or_default();
            *cell = cell.apply(row).ok_or_else(|| {
                FundsError::Corrupt(format!(
                    "{} {} {} goes negative at {}:{}",
                    row.owner(),
                    row.coin,
                    row.account.as_str(),
                    row.ref_type.as_str(),
                    row.ref_id
                ))
            })?;
        }

        let accounts = cells.len();
        *self.accounts.write() = cells
            .into_iter()
            .map(|(key, coins)| (key, Arc::new(AsyncMutex::new(coins))))
            .collect();
        *self.applied.lock() = applied;

        info!(rows = rows.len(), accounts, "Funds ledger bootstrapped");
        Ok(rows.len())
    }

    // ========================================================================
    // Primitives
    // ========================================================================

    /// Credit `amount` to the available balance
    pub async fn deposit(
        &self,
        owner: AccountKey,
        coin: &str,
        amount: u64,
        deposit_id: &str,
    ) -> Result<()> {
        Self::require_positive(amount)?;
        let reference = LedgerRef::deposit(deposit_id);
        self.apply(vec![LiabilityRow::credit(
            owner,
            coin,
            Account::Main,
            &reference,
            LedgerOp::Deposit,
            amount,
        )])
        .await
    }

    /// Move `amount` from available to locked
    pub async fn lock(
        &self,
        owner: AccountKey,
        coin: &str,
        amount: u64,
        reference: &LedgerRef,
    ) -> Result<()> {
        Self::require_positive(amount)?;
        self.apply(vec![
            LiabilityRow::debit(owner, coin, Account::Main, reference, LedgerOp::Lock, amount),
            LiabilityRow::credit(owner, coin, Account::Locked, reference, LedgerOp::Lock, amount),
        ])
        .await
    }

    /// Return `amount` from locked to available; zero is a no-op
    pub async fn unlock(
        &self,
        owner: AccountKey,
        coin: &str,
        amount: u64,
        reference: &LedgerRef,
    ) -> Result<()> {
        if amount == 0 {
            return Ok(());
        }
        self.apply(vec![
            LiabilityRow::debit(owner, coin, Account::Locked, reference, LedgerOp::Unlock, amount),
            LiabilityRow::credit(owner, coin, Account::Main, reference, LedgerOp::Unlock, amount),
        ])
        .await
    }

    /// Spend `amount` of the payer's locked funds: `amount - fee` to the
    /// payee, `fee` to the fee account
    pub async fn settle(
        &self,
        payer: AccountKey,
        coin: &str,
        amount: u64,
        payee: AccountKey,
        fee: u64,
        reference: &LedgerRef,
    ) -> Result<()> {
        let rows = self.settle_rows(payer, coin, amount, payee, fee, reference)?;
        self.apply(rows).await
    }

    /// Both legs of a trade in one atomic step
    pub async fn settle_trade(&self, trade: &TradeSettlement<'_>) -> Result<()> {
        let reference = LedgerRef::trade(&trade.market.id, trade.trade_seq);
        let mut rows = self.settle_rows(
            trade.buyer,
            &trade.market.quote,
            trade.quote_volume,
            trade.seller,
            trade.seller_fee,
            &reference,
        )?;
        rows.extend(self.settle_rows(
            trade.seller,
            &trade.market.base,
            trade.volume,
            trade.buyer,
            trade.buyer_fee,
            &reference,
        )?);
        self.apply(rows).await
    }

    /// Move available funds between two accounts
    pub async fn transfer(
        &self,
        from: AccountKey,
        to: AccountKey,
        coin: &str,
        amount: u64,
        transfer_id: &str,
    ) -> Result<()> {
        Self::require_positive(amount)?;
        if from == to {
            return Err(FundsError::invalid("transfer to the same account"));
        }
        let reference = LedgerRef::transfer(transfer_id);
        self.apply(vec![
            LiabilityRow::debit(from, coin, Account::Main, &reference, LedgerOp::Transfer, amount),
            LiabilityRow::credit(to, coin, Account::Main, &reference, LedgerOp::Transfer, amount),
        ])
        .await
    }

    /// Remove previously locked funds that left through the wallet
    pub async fn withdraw(
        &self,
        owner: AccountKey,
        coin: &str,
        amount: u64,
        withdrawal_id: &str,
    ) -> Result<()> {
        Self::require_positive(amount)?;
        let reference = LedgerRef::withdraw(withdrawal_id);
        self.apply(vec![LiabilityRow::debit(
            owner,
            coin,
            Account::Locked,
            &reference,
            LedgerOp::Withdraw,
            amount,
        )])
        .await
    }

    // ========================================================================
    // Queries
    // ========================================================================

    pub async fn balance(&self, owner: AccountKey, coin: &str) -> BalanceCell {
        match self.account(owner) {
            Some(cells) => cells.lock().await.get(coin).copied().unwrap_or_default(),
            None => BalanceCell::default(),
        }
    }

    pub async fn get_available(&self, owner: AccountKey, coin: &str) -> u64 {
        self.balance(owner, coin).await.available
    }

    pub async fn get_total(&self, owner: AccountKey, coin: &str) -> u64 {
        self.balance(owner, coin).await.total()
    }

    /// Every coin the account has touched
    pub async fn balances(&self, owner: AccountKey) -> BTreeMap<String, BalanceCell> {
        match self.account(owner) {
            Some(cells) => cells
                .lock()
                .await
                .iter()
                .map(|(coin, cell)| (coin.clone(), *cell))
                .collect(),
            None => BTreeMap::new(),
        }
    }

    /// `available + locked` summed over all accounts, per coin
    pub async fn totals_by_coin(&self) -> BTreeMap<String, u128> {
        let accounts: Vec<_> = self.accounts.read().values().cloned().collect();
        let mut totals = BTreeMap::new();
        for cells in accounts {
            for (coin, cell) in cells.lock().await.iter() {
                *totals.entry(coin.clone()).or_insert(0u128) += cell.total() as u128;
            }
        }
        totals
    }

    // ========================================================================
    // Internals
    // ========================================================================

    fn require_positive(amount: u64) -> Result<()> {
        if amount == 0 {
            return Err(FundsError::invalid("amount must be positive"));
        }
        Ok(())
    }

    fn settle_rows(
        &self,
        payer: AccountKey,
        coin: &str,
        amount: u64,
        payee: AccountKey,
        fee: u64,
        reference: &LedgerRef,
    ) -> Result<Vec<LiabilityRow>> {
        if fee > amount {
            return Err(FundsError::invalid(format!(
                "fee {} exceeds settled amount {}",
                fee, amount
            )));
        }
        let mut rows = Vec::with_capacity(3);
        if amount > 0 {
            rows.push(LiabilityRow::debit(
                payer,
                coin,
                Account::Locked,
                reference,
                LedgerOp::Settle,
                amount,
            ));
        }
        if amount > fee {
            rows.push(LiabilityRow::credit(
                payee,
                coin,
                Account::Main,
                reference,
                LedgerOp::Settle,
                amount - fee,
            ));
        }
        if fee > 0 {
            rows.push(LiabilityRow::credit(
                self.fee_account,
                coin,
                Account::Main,
                reference,
                LedgerOp::Fee,
                fee,
            ));
        }
        Ok(rows)
    }

    fn account(&self, owner: AccountKey) -> Option<Arc<AsyncMutex<AccountCells>>> {
        self.accounts.read().get(&owner).cloned()
    }

    fn account_or_create(&self, owner: AccountKey) -> Arc<AsyncMutex<AccountCells>> {
        if let Some(cells) = self.account(owner) {
            return cells;
        }
        self.accounts.write().entry(owner).or_default().clone()
    }

    async fn apply(&self, rows: Vec<LiabilityRow>) -> Result<()> {
        if rows.is_empty() {
            return Ok(());
        }

        // Canonical order prevents deadlock between cross-account operations
        let owners: BTreeSet<AccountKey> = rows.iter().map(LiabilityRow::owner).collect();
        let mut guards: BTreeMap<AccountKey, OwnedMutexGuard<AccountCells>> = BTreeMap::new();
        for owner in owners {
            let guard = self.account_or_create(owner).lock_owned().await;
            guards.insert(owner, guard);
        }

        let fresh: Vec<LiabilityRow> = {
            let applied = self.applied.lock();
            rows.into_iter()
                .filter(|row| !applied.contains(&row.key()))
                .collect()
        };
        if fresh.is_empty() {
            debug!("Ledger operation already applied");
            return Ok(());
        }

        // Validate against copies; nothing changes until the write succeeds
        let mut staged: HashMap<(AccountKey, String), BalanceCell> = HashMap::new();
        for row in &fresh {
            let key = (row.owner(), row.coin.clone());
            let current = match staged.get(&key) {
                Some(cell) => *cell,
                None => guards
                    .get(&row.owner())
                    .and_then(|cells| cells.get(&row.coin).copied())
                    .unwrap_or_default(),
            };
            let next = current.apply(row).ok_or_else(|| FundsError::InsufficientFunds {
                account: row.owner(),
                coin: row.coin.clone(),
                required: row.debit,
                available: match row.account {
                    Account::Main => current.available,
                    Account::Locked => current.locked,
                },
            })?;
            staged.insert(key, next);
        }

        if let Err(e) = self.store.append(&fresh).await {
            if !e.is_transient() {
                return Err(e);
            }
            warn!(error = %e, "Liability write failed, retrying once");
            self.store.append(&fresh).await?;
        }

        for ((owner, coin), cell) in staged {
            if let Some(cells) = guards.get_mut(&owner) {
                cells.insert(coin, cell);
            }
        }
        let mut applied = self.applied.lock();
        for row in &fresh {
            applied.insert(row.key());
        }
        Ok(())
    }
}
