//! PostgreSQL liability store
//!
//! Rows go to `liabilities`; duplicates are dropped by the
//! `liabilities_dedup` constraint. The materialised `balances` table is
//! updated in the same transaction, only for rows that were inserted.

use async_trait::async_trait;
use sqlx::{PgPool, Row};
use std::str::FromStr;

use super::LiabilityStore;
use crate::error::FundsError;
use crate::ledger::{Account, LedgerOp, LiabilityRow, RefType};
use crate::Result;
use storage::postgres::{from_db, to_db};
use storage::StorageError;

pub struct PostgresLiabilityStore {
    pool: PgPool,
}

impl PostgresLiabilityStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl LiabilityStore for PostgresLiabilityStore {
    async fn append(&self, rows: &[LiabilityRow]) -> Result<usize> {
        let mut tx = self.pool.begin().await.map_err(StorageError::from)?;
        let mut inserted = 0;

        for row in rows {
            let result = sqlx::query(
                r#"
                INSERT INTO liabilities (user_id, sub_account, coin, account, ref_type, ref_id, op, debit, credit)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
                ON CONFLICT ON CONSTRAINT liabilities_dedup DO NOTHING
                "#,
            )
            .bind(to_db(row.user_id)?)
            .bind(to_db(row.sub_account)?)
            .bind(&row.coin)
            .bind(row.account.as_str())
            .bind(row.ref_type.as_str())
            .bind(&row.ref_id)
            .bind(row.op.as_str())
            .bind(to_db(row.debit)?)
            .bind(to_db(row.credit)?)
            .execute(&mut *tx)
            .await
            .map_err(StorageError::from)?;

            if result.rows_affected() == 0 {
                continue;
            }
            inserted += 1;

            let net = i64::try_from(row.net())
                .map_err(|_| FundsError::Corrupt(format!("row net {} overflows", row.net())))?;
            let (available, locked) = match row.account {
                Account::Main => (net, 0),
                Account::Locked => (0, net),
            };
            let in_orders = if row.counts_in_orders() { net } else { 0 };

            sqlx::query(
                r#"
                INSERT INTO balances (user_id, sub_account, coin, available, locked, in_orders, updated_at)
                VALUES ($1, $2, $3, $4, $5, $6, NOW())
                ON CONFLICT (user_id, sub_account, coin) DO UPDATE SET
                    available = balances.available + EXCLUDED.available,
                    locked = balances.locked + EXCLUDED.locked,
                    in_orders = balances.in_orders + EXCLUDED.in_orders,
                    updated_at = NOW()
                "#,
            )
            .bind(to_db(row.user_id)?)
            .bind(to_db(row.sub_account)?)
            .bind(&row.coin)
            .bind(available)
            .bind(locked)
            .bind(in_orders)
            .execute(&mut *tx)
            .await
            .map_err(StorageError::from)?;
        }

        tx.commit().await.map_err(StorageError::from)?;
        Ok(inserted)
    }

    async fn load_all(&self) -> Result<Vec<LiabilityRow>> {
        let rows = sqlx::query(
            r#"
            SELECT user_id, sub_account, coin, account, ref_type, ref_id, op, debit, credit
            FROM liabilities
            ORDER BY id
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(StorageError::from)?;

        rows.iter().map(row_to_liability).collect()
    }
}

fn row_to_liability(row: &sqlx::postgres::PgRow) -> Result<LiabilityRow> {
    let get_i64 = |name: &str| -> Result<u64> {
        let value: i64 = row.try_get(name).map_err(StorageError::from)?;
        Ok(from_db(value)?)
    };
    let get_text = |name: &str| -> Result<String> {
        Ok(row.try_get::<String, _>(name).map_err(StorageError::from)?)
    };

    Ok(LiabilityRow {
        user_id: get_i64("user_id")?,
        sub_account: get_i64("sub_account")?,
        coin: get_text("coin")?,
        account: Account::from_str(&get_text("account")?)?,
        ref_type: RefType::from_str(&get_text("ref_type")?)?,
        ref_id: get_text("ref_id")?,
        op: LedgerOp::from_str(&get_text("op")?)?,
        debit: get_i64("debit")?,
        credit: get_i64("credit")?,
    })
}
