//! Wallet bridge
//!
//! The wallet collaborator reports deposits and withdrawal outcomes on
//! `wallet_events`; withdrawals are requested on `wallet_commands`.
//! Amounts are scaled integers in the coin's precision.
//!
//! CRITICAL PROPERTIES:
//! - The consumer position advances only after FMS applied the event
//! - Re-reading an event is harmless: FMS dedups by the wallet's id

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use common::AccountKey;
use fms::{FundsManager, LedgerRef};
use storage::{topics, PositionStore, SharedLog};

use crate::error::TradingError;
use crate::Result;

/// Position key of the bridge in `queue_positions`
pub const COMPONENT: &str = "wallet_bridge";

const BATCH: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WalletEvent {
    Deposit {
        id: String,
        user_id: u64,
        #[serde(default)]
        sub_account: u64,
        coin: String,
        amount: u64,
    },
    WithdrawalSettled {
        id: String,
        user_id: u64,
        #[serde(default)]
        sub_account: u64,
        coin: String,
        amount: u64,
    },
    WithdrawalFailed {
        id: String,
        user_id: u64,
        #[serde(default)]
        sub_account: u64,
        coin: String,
        amount: u64,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WalletCommand {
    Withdraw {
        id: String,
        user_id: u64,
        sub_account: u64,
        coin: String,
        amount: u64,
        address: String,
    },
}

pub struct WalletBridge {
    funds: Arc<FundsManager>,
    log: SharedLog,
    positions: Arc<dyn PositionStore>,
    poll: Duration,
}

impl WalletBridge {
    pub fn new(
        funds: Arc<FundsManager>,
        log: SharedLog,
        positions: Arc<dyn PositionStore>,
        poll: Duration,
    ) -> Self {
        Self {
            funds,
            log,
            positions,
            poll,
        }
    }

    /// Consume `wallet_events` until shutdown
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        info!(poll_ms = self.poll.as_millis() as u64, "Wallet bridge started");
        loop {
            match self.poll_once().await {
                Ok(0) => {}
                Ok(applied) => debug!(applied, "Wallet events applied"),
                Err(e) => warn!(error = %e, "Wallet bridge poll failed"),
            }
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(self.poll) => {}
            }
        }
        info!("Wallet bridge stopped");
    }

    /// Apply every unread wallet event; returns how many were consumed
    pub async fn poll_once(&self) -> Result<usize> {
        let mut next = self
            .positions
            .load(COMPONENT)
            .await?
            .get(topics::WALLET_EVENTS)
            .copied()
            .unwrap_or(0);

        let mut consumed = 0;
        loop {
            let records = self.log.read(topics::WALLET_EVENTS, next, BATCH).await?;
            if records.is_empty() {
                return Ok(consumed);
            }
            for record in records {
                match serde_json::from_slice::<WalletEvent>(&record.payload) {
                    Ok(event) => self.apply(&event).await?,
                    Err(e) => {
                        error!(offset = record.offset, error = %e, "Dropping unreadable wallet event")
                    }
                }
                next = record.offset + 1;
                self.positions
                    .save(COMPONENT, topics::WALLET_EVENTS, next)
                    .await?;
                consumed += 1;
            }
        }
    }

    async fn apply(&self, event: &WalletEvent) -> Result<()> {
        let outcome = match event {
            WalletEvent::Deposit {
                id,
                user_id,
                sub_account,
                coin,
                amount,
            } => {
                let owner = AccountKey::new(*user_id, *sub_account);
                self.funds.deposit(owner, coin, *amount, id).await
            }
            WalletEvent::WithdrawalSettled {
                id,
                user_id,
                sub_account,
                coin,
                amount,
            } => {
                let owner = AccountKey::new(*user_id, *sub_account);
                self.funds.withdraw(owner, coin, *amount, id).await
            }
            WalletEvent::WithdrawalFailed {
                id,
                user_id,
                sub_account,
                coin,
                amount,
            } => {
                let owner = AccountKey::new(*user_id, *sub_account);
                self.funds
                    .unlock(owner, coin, *amount, &LedgerRef::withdraw(id.as_str()))
                    .await
            }
        };

        match outcome {
            Ok(()) => {
                info!(event = ?event, "Wallet event applied");
                Ok(())
            }
            Err(e) if e.is_transient() => Err(e.into()),
            // Permanent rejections are logged and skipped
            Err(e) => {
                error!(event = ?event, error = %e, "Wallet event rejected");
                Ok(())
            }
        }
    }

    /// Lock `amount` and ask the wallet to send it
    ///
    /// # Returns
    /// The withdrawal id the wallet will report back with
    pub async fn request_withdrawal(
        &self,
        owner: AccountKey,
        coin: &str,
        amount: u64,
        address: &str,
    ) -> Result<String> {
        if address.trim().is_empty() {
            return Err(TradingError::validation("withdrawal address is required"));
        }
        let id = uuid::Uuid::new_v4().to_string();
        let reference = LedgerRef::withdraw(id.as_str());
        self.funds.lock(owner, coin, amount, &reference).await?;

        let command = WalletCommand::Withdraw {
            id: id.clone(),
            user_id: owner.user_id,
            sub_account: owner.sub_account,
            coin: coin.to_string(),
            amount,
            address: address.to_string(),
        };
        let published = match serde_json::to_vec(&command) {
            Ok(payload) => self
                .log
                .append(topics::WALLET_COMMANDS, payload)
                .await
                .map_err(TradingError::from),
            Err(e) => Err(TradingError::Internal(e.to_string())),
        };

        if let Err(e) = published {
            if let Err(unlock) = self.funds.unlock(owner, coin, amount, &reference).await {
                error!(withdrawal_id = %id, error = %unlock, "Failed to release withdrawal lock");
            }
            return Err(e);
        }

        info!(withdrawal_id = %id, owner = %owner, coin, amount, "Withdrawal requested");
        Ok(id)
    }
}
