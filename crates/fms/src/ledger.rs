//! Liability ledger rows
//!
//! The ledger is append-only. Every balance mutation is a set of rows, each
//! debiting or crediting one `(user, sub_account, coin, account)` bucket.
//! Rows are unique by `(ref_type, ref_id, user, sub_account, coin, account,
//! op)`, which is what makes re-applying an operation a no-op.

use serde::{Deserialize, Serialize};

use common::AccountKey;

use crate::error::FundsError;

/// Balance bucket a row moves
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Account {
    /// Spendable balance
    Main,
    /// Held for open orders or pending withdrawals
    Locked,
}

/// What a row is about
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RefType {
    Order,
    Trade,
    Deposit,
    Withdraw,
    Transfer,
}

/// Ledger operation that produced a row
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LedgerOp {
    Deposit,
    Lock,
    Unlock,
    Settle,
    Fee,
    Transfer,
    Withdraw,
}

macro_rules! text_enum {
    ($ty:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $ty {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $($ty::$variant => $text),+
                }
            }
        }

        impl std::str::FromStr for $ty {
            type Err = FundsError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok($ty::$variant),)+
                    other => Err(FundsError::Corrupt(format!(
                        "unknown {} '{}'",
                        stringify!($ty),
                        other
                    ))),
                }
            }
        }
    };
}

text_enum!(Account { Main => "main", Locked => "locked" });
text_enum!(RefType {
    Order => "order",
    Trade => "trade",
    Deposit => "deposit",
    Withdraw => "withdraw",
    Transfer => "transfer",
});
text_enum!(LedgerOp {
    Deposit => "deposit",
    Lock => "lock",
    Unlock => "unlock",
    Settle => "settle",
    Fee => "fee",
    Transfer => "transfer",
    Withdraw => "withdraw",
});

/// Reference a group of rows is recorded under
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LedgerRef {
    pub ref_type: RefType,
    pub ref_id: String,
}

impl LedgerRef {
    pub fn order(order_id: u64) -> Self {
        Self {
            ref_type: RefType::Order,
            ref_id: order_id.to_string(),
        }
    }

    /// Trades are unique per market sequence
    pub fn trade(market_id: &str, trade_seq: u64) -> Self {
        Self {
            ref_type: RefType::Trade,
            ref_id: format!("{}:{}", market_id, trade_seq),
        }
    }

    pub fn deposit(id: impl Into<String>) -> Self {
        Self {
            ref_type: RefType::Deposit,
            ref_id: id.into(),
        }
    }

    pub fn withdraw(id: impl Into<String>) -> Self {
        Self {
            ref_type: RefType::Withdraw,
            ref_id: id.into(),
        }
    }

    pub fn transfer(id: impl Into<String>) -> Self {
        Self {
            ref_type: RefType::Transfer,
            ref_id: id.into(),
        }
    }
}

/// Uniqueness key of a ledger row
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DedupKey {
    pub ref_type: RefType,
    pub ref_id: String,
    pub account_key: AccountKey,
    pub coin: String,
    pub account: Account,
    pub op: LedgerOp,
}

/// One append-only ledger entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LiabilityRow {
    pub user_id: u64,
    pub sub_account: u64,
    pub coin: String,
    pub account: Account,
    pub ref_type: RefType,
    pub ref_id: String,
    pub op: LedgerOp,
    pub debit: u64,
    pub credit: u64,
}

impl LiabilityRow {
    pub fn credit(
        owner: AccountKey,
        coin: &str,
        account: Account,
        reference: &LedgerRef,
        op: LedgerOp,
        amount: u64,
    ) -> Self {
        Self::new(owner, coin, account, reference, op, 0, amount)
    }

    pub fn debit(
        owner: AccountKey,
        coin: &str,
        account: Account,
        reference: &LedgerRef,
        op: LedgerOp,
        amount: u64,
    ) -> Self {
        Self::new(owner, coin, account, reference, op, amount, 0)
    }

    fn new(
        owner: AccountKey,
        coin: &str,
        account: Account,
        reference: &LedgerRef,
        op: LedgerOp,
        debit: u64,
        credit: u64,
    ) -> Self {
        Self {
            user_id: owner.user_id,
            sub_account: owner.sub_account,
            coin: coin.to_string(),
            account,
            ref_type: reference.ref_type,
            ref_id: reference.ref_id.clone(),
            op,
            debit,
            credit,
        }
    }

    pub fn owner(&self) -> AccountKey {
        AccountKey::new(self.user_id, self.sub_account)
    }

    pub fn key(&self) -> DedupKey {
        DedupKey {
            ref_type: self.ref_type,
            ref_id: self.ref_id.clone(),
            account_key: self.owner(),
            coin: self.coin.clone(),
            account: self.account,
            op: self.op,
        }
    }

    /// Credit minus debit
    pub fn net(&self) -> i128 {
        self.credit as i128 - self.debit as i128
    }

    /// Locked rows held on behalf of orders
    pub fn counts_in_orders(&self) -> bool {
        self.account == Account::Locked
            && matches!(self.ref_type, RefType::Order | RefType::Trade)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn test_text_round_trip() {
        for op in [LedgerOp::Lock, LedgerOp::Fee, LedgerOp::Withdraw] {
            assert_eq!(LedgerOp::from_str(op.as_str()).unwrap(), op);
        }
        assert_eq!(RefType::from_str("trade").unwrap(), RefType::Trade);
        assert_eq!(Account::from_str("locked").unwrap(), Account::Locked);
        assert!(Account::from_str("margin").is_err());
    }

    #[test]
    fn test_dedup_key_separates_ops_and_accounts() {
        let owner = AccountKey::new(1, 0);
        let reference = LedgerRef::order(7);
        let lock_main = LiabilityRow::debit(owner, "USDT", Account::Main, &reference, LedgerOp::Lock, 5);
        let lock_locked =
            LiabilityRow::credit(owner, "USDT", Account::Locked, &reference, LedgerOp::Lock, 5);
        let unlock = LiabilityRow::debit(owner, "USDT", Account::Locked, &reference, LedgerOp::Unlock, 5);

        assert_ne!(lock_main.key(), lock_locked.key());
        assert_ne!(lock_locked.key(), unlock.key());
        assert_eq!(lock_main.net(), -5);
        assert!(lock_locked.counts_in_orders());
        assert!(!lock_main.counts_in_orders());
        assert_eq!(LedgerRef::trade("btcusdt", 42).ref_id, "btcusdt:42");
    }
}
