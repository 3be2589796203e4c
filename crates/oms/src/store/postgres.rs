//! PostgreSQL order store implementation
//!
//! Orders are upserted by id, trades are deduplicated by the
//! `trades_market_seq` constraint, and each projection batch commits
//! together with its `projection_watermarks` row.

use async_trait::async_trait;
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use sqlx::postgres::{PgArguments, PgRow};
use sqlx::query::Query;
use sqlx::{PgPool, Postgres, Row};

use crate::error::OmsError;
use crate::store::traits::{OrderStore, ProjectionBatch};
use crate::types::{Order, OrderFilter, StatusFilter, TradeRecord};
use crate::Result;
use storage::postgres::{from_db, to_db};
use storage::StorageError;

const ORDER_COLUMNS: [&str; 43] = [
    "id",
    "market_id",
    "client_order_id",
    "owner_id",
    "sub_account",
    "side",
    "order_type",
    "stop",
    "price",
    "amount",
    "stop_price",
    "opposite_stop_price",
    "locked_funds",
    "used_funds",
    "opposite_used_funds",
    "filled_amount",
    "filled_quote",
    "fee_amount",
    "status",
    "created_at",
    "updated_at",
    "tp_price",
    "sl_price",
    "tp_rel",
    "sl_rel",
    "oto_type",
    "trailing_stop_activation_price",
    "trailing_stop_price",
    "trailing_stop_price_type",
    "trailing_watermark",
    "triggered",
    "parent_order_id",
    "root_order_id",
    "tp_order_id",
    "sl_order_id",
    "tp_status",
    "sl_status",
    "tp_filled_amount",
    "sl_filled_amount",
    "ui",
    "is_replace",
    "previous_locked_funds",
    "previous_opposite_locked_funds",
];

const TRADE_COLUMNS: &str = "id, market_id, seqid, price, volume, quote_volume, taker_side, \
    maker_order_id, taker_order_id, maker_id, maker_sub_account, taker_id, taker_sub_account, \
    maker_fee, taker_fee, created_at";

/// PostgreSQL order store
pub struct PostgresOrderStore {
    pool: PgPool,
    upsert_sql: String,
    select_sql: String,
}

impl PostgresOrderStore {
    pub fn new(pool: PgPool) -> Self {
        let placeholders: Vec<String> = (1..=ORDER_COLUMNS.len()).map(|i| format!("${}", i)).collect();
        let updates: Vec<String> = ORDER_COLUMNS[1..]
            .iter()
            .map(|c| format!("{c} = EXCLUDED.{c}"))
            .collect();

        Self {
            pool,
            upsert_sql: format!(
                "INSERT INTO orders ({}) VALUES ({}) ON CONFLICT (id) DO UPDATE SET {}",
                ORDER_COLUMNS.join(", "),
                placeholders.join(", "),
                updates.join(", ")
            ),
            select_sql: format!("SELECT {} FROM orders", ORDER_COLUMNS.join(", ")),
        }
    }
}

fn enum_text<T: Serialize + std::fmt::Debug>(value: &T) -> Result<String> {
    match serde_json::to_value(value) {
        Ok(Value::String(text)) => Ok(text),
        _ => Err(OmsError::Internal(format!("{:?} has no text form", value))),
    }
}

fn parse_enum<T: DeserializeOwned>(column: &str, text: String) -> Result<T> {
    serde_json::from_value(Value::String(text.clone()))
        .map_err(|_| StorageError::Corrupt(format!("{} = '{}'", column, text)).into())
}

fn opt_to_db(value: Option<u64>) -> Result<Option<i64>> {
    Ok(value.map(to_db).transpose()?)
}

fn bind_order<'q>(
    query: Query<'q, Postgres, PgArguments>,
    o: &'q Order,
) -> Result<Query<'q, Postgres, PgArguments>> {
    let tp_status = o.tp_status.as_ref().map(enum_text).transpose()?;
    let sl_status = o.sl_status.as_ref().map(enum_text).transpose()?;

    Ok(query
        .bind(to_db(o.id)?)
        .bind(&o.market_id)
        .bind(&o.client_order_id)
        .bind(to_db(o.owner_id)?)
        .bind(to_db(o.sub_account)?)
        .bind(enum_text(&o.side)?)
        .bind(enum_text(&o.order_type)?)
        .bind(enum_text(&o.stop)?)
        .bind(to_db(o.price)?)
        .bind(to_db(o.amount)?)
        .bind(to_db(o.stop_price)?)
        .bind(to_db(o.opposite_stop_price)?)
        .bind(to_db(o.locked_funds)?)
        .bind(to_db(o.used_funds)?)
        .bind(to_db(o.opposite_used_funds)?)
        .bind(to_db(o.filled_amount)?)
        .bind(to_db(o.filled_quote)?)
        .bind(to_db(o.fee_amount)?)
        .bind(enum_text(&o.status)?)
        .bind(o.created_at)
        .bind(o.updated_at)
        .bind(to_db(o.tp_price)?)
        .bind(to_db(o.sl_price)?)
        .bind(to_db(o.tp_rel)?)
        .bind(to_db(o.sl_rel)?)
        .bind(enum_text(&o.oto_type)?)
        .bind(to_db(o.trailing_stop_activation_price)?)
        .bind(to_db(o.trailing_stop_price)?)
        .bind(enum_text(&o.trailing_stop_price_type)?)
        .bind(to_db(o.trailing_watermark)?)
        .bind(o.triggered)
        .bind(opt_to_db(o.parent_order_id)?)
        .bind(opt_to_db(o.root_order_id)?)
        .bind(opt_to_db(o.tp_order_id)?)
        .bind(opt_to_db(o.sl_order_id)?)
        .bind(tp_status)
        .bind(sl_status)
        .bind(to_db(o.tp_filled_amount)?)
        .bind(to_db(o.sl_filled_amount)?)
        .bind(&o.ui)
        .bind(o.is_replace)
        .bind(to_db(o.previous_locked_funds)?)
        .bind(to_db(o.previous_opposite_locked_funds)?))
}

fn row_to_order(row: &PgRow) -> Result<Order> {
    let u = |name: &str| -> Result<u64> {
        let value: i64 = row.try_get(name).map_err(StorageError::from)?;
        Ok(from_db(value)?)
    };
    let opt_u = |name: &str| -> Result<Option<u64>> {
        let value: Option<i64> = row.try_get(name).map_err(StorageError::from)?;
        Ok(value.map(from_db).transpose()?)
    };
    let text = |name: &str| -> Result<String> {
        Ok(row.try_get::<String, _>(name).map_err(StorageError::from)?)
    };
    let opt_text = |name: &str| -> Result<Option<String>> {
        Ok(row
            .try_get::<Option<String>, _>(name)
            .map_err(StorageError::from)?)
    };
    let int = |name: &str| -> Result<i64> { Ok(row.try_get(name).map_err(StorageError::from)?) };
    let flag = |name: &str| -> Result<bool> { Ok(row.try_get(name).map_err(StorageError::from)?) };

    Ok(Order {
        id: u("id")?,
        client_order_id: opt_text("client_order_id")?,
        owner_id: u("owner_id")?,
        sub_account: u("sub_account")?,
        market_id: text("market_id")?,
        side: parse_enum("side", text("side")?)?,
        order_type: parse_enum("order_type", text("order_type")?)?,
        stop: parse_enum("stop", text("stop")?)?,
        price: u("price")?,
        amount: u("amount")?,
        stop_price: u("stop_price")?,
        opposite_stop_price: u("opposite_stop_price")?,
        locked_funds: u("locked_funds")?,
        used_funds: u("used_funds")?,
        opposite_used_funds: u("opposite_used_funds")?,
        filled_amount: u("filled_amount")?,
        filled_quote: u("filled_quote")?,
        fee_amount: u("fee_amount")?,
        status: parse_enum("status", text("status")?)?,
        created_at: int("created_at")?,
        updated_at: int("updated_at")?,
        tp_price: u("tp_price")?,
        sl_price: u("sl_price")?,
        tp_rel: u("tp_rel")?,
        sl_rel: u("sl_rel")?,
        oto_type: parse_enum("oto_type", text("oto_type")?)?,
        trailing_stop_activation_price: u("trailing_stop_activation_price")?,
        trailing_stop_price: u("trailing_stop_price")?,
        trailing_stop_price_type: parse_enum(
            "trailing_stop_price_type",
            text("trailing_stop_price_type")?,
        )?,
        trailing_watermark: u("trailing_watermark")?,
        triggered: flag("triggered")?,
        parent_order_id: opt_u("parent_order_id")?,
        root_order_id: opt_u("root_order_id")?,
        tp_order_id: opt_u("tp_order_id")?,
        sl_order_id: opt_u("sl_order_id")?,
        tp_status: opt_text("tp_status")?
            .map(|s| parse_enum("tp_status", s))
            .transpose()?,
        sl_status: opt_text("sl_status")?
            .map(|s| parse_enum("sl_status", s))
            .transpose()?,
        tp_filled_amount: u("tp_filled_amount")?,
        sl_filled_amount: u("sl_filled_amount")?,
        ui: opt_text("ui")?,
        is_replace: flag("is_replace")?,
        previous_locked_funds: u("previous_locked_funds")?,
        previous_opposite_locked_funds: u("previous_opposite_locked_funds")?,
    })
}

fn row_to_trade(row: &PgRow) -> Result<TradeRecord> {
    let u = |name: &str| -> Result<u64> {
        let value: i64 = row.try_get(name).map_err(StorageError::from)?;
        Ok(from_db(value)?)
    };
    let text = |name: &str| -> Result<String> {
        Ok(row.try_get::<String, _>(name).map_err(StorageError::from)?)
    };

    Ok(TradeRecord {
        id: u("id")?,
        market_id: text("market_id")?,
        seqid: u("seqid")?,
        price: u("price")?,
        volume: u("volume")?,
        quote_volume: u("quote_volume")?,
        taker_side: parse_enum("taker_side", text("taker_side")?)?,
        maker_order_id: u("maker_order_id")?,
        taker_order_id: u("taker_order_id")?,
        maker_id: u("maker_id")?,
        maker_sub_account: u("maker_sub_account")?,
        taker_id: u("taker_id")?,
        taker_sub_account: u("taker_sub_account")?,
        maker_fee: u("maker_fee")?,
        taker_fee: u("taker_fee")?,
        created_at: row.try_get("created_at").map_err(StorageError::from)?,
    })
}

#[async_trait]
impl OrderStore for PostgresOrderStore {
    async fn insert_order(&self, order: &Order) -> Result<()> {
        bind_order(sqlx::query(&self.upsert_sql), order)?
            .execute(&self.pool)
            .await
            .map_err(StorageError::from)?;
        Ok(())
    }

    async fn get_order(&self, order_id: u64) -> Result<Option<Order>> {
        let sql = format!("{} WHERE id = $1", self.select_sql);
        let row = sqlx::query(&sql)
            .bind(to_db(order_id)?)
            .fetch_optional(&self.pool)
            .await
            .map_err(StorageError::from)?;
        row.as_ref().map(row_to_order).transpose()
    }

    async fn apply_projection(&self, batch: &ProjectionBatch) -> Result<()> {
        let mut tx = self.pool.begin().await.map_err(StorageError::from)?;

        for order in &batch.orders {
            bind_order(sqlx::query(&self.upsert_sql), order)?
                .execute(&mut *tx)
                .await
                .map_err(StorageError::from)?;
        }

        for trade in &batch.trades {
            sqlx::query(&format!(
                "INSERT INTO trades ({}) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16) \
                 ON CONFLICT ON CONSTRAINT trades_market_seq DO NOTHING",
                TRADE_COLUMNS
            ))
            .bind(to_db(trade.id)?)
            .bind(&trade.market_id)
            .bind(to_db(trade.seqid)?)
            .bind(to_db(trade.price)?)
            .bind(to_db(trade.volume)?)
            .bind(to_db(trade.quote_volume)?)
            .bind(enum_text(&trade.taker_side)?)
            .bind(to_db(trade.maker_order_id)?)
            .bind(to_db(trade.taker_order_id)?)
            .bind(to_db(trade.maker_id)?)
            .bind(to_db(trade.maker_sub_account)?)
            .bind(to_db(trade.taker_id)?)
            .bind(to_db(trade.taker_sub_account)?)
            .bind(to_db(trade.maker_fee)?)
            .bind(to_db(trade.taker_fee)?)
            .bind(trade.created_at)
            .execute(&mut *tx)
            .await
            .map_err(StorageError::from)?;
        }

        if let Some(seq) = batch.seq_id {
            sqlx::query(
                r#"
                INSERT INTO projection_watermarks (market_id, applied_seq)
                VALUES ($1, $2)
                ON CONFLICT (market_id) DO UPDATE SET
                    applied_seq = GREATEST(projection_watermarks.applied_seq, EXCLUDED.applied_seq)
                "#,
            )
            .bind(&batch.market_id)
            .bind(to_db(seq)?)
            .execute(&mut *tx)
            .await
            .map_err(StorageError::from)?;
        }

        tx.commit().await.map_err(StorageError::from)?;
        Ok(())
    }

    async fn applied_seq(&self, market_id: &str) -> Result<u64> {
        let seq: Option<i64> = sqlx::query_scalar(
            "SELECT applied_seq FROM projection_watermarks WHERE market_id = $1",
        )
        .bind(market_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(StorageError::from)?;
        Ok(seq.map(from_db).transpose()?.unwrap_or(0))
    }

    async fn open_orders(&self, market_id: &str) -> Result<Vec<Order>> {
        let sql = format!(
            "{} WHERE market_id = $1 AND status NOT IN ('filled', 'cancelled') ORDER BY id",
            self.select_sql
        );
        let rows = sqlx::query(&sql)
            .bind(market_id)
            .fetch_all(&self.pool)
            .await
            .map_err(StorageError::from)?;
        rows.iter().map(row_to_order).collect()
    }

    async fn list_orders(&self, filter: &OrderFilter) -> Result<Vec<Order>> {
        let status_clause = match filter.status {
            Some(StatusFilter::Open) => "AND status NOT IN ('filled', 'cancelled')",
            Some(StatusFilter::Closed) => "AND status IN ('filled', 'cancelled')",
            None => "",
        };
        let sql = format!(
            "{} WHERE ($1::BIGINT IS NULL OR owner_id = $1) \
             AND ($2::BIGINT IS NULL OR sub_account = $2) \
             AND ($3::TEXT IS NULL OR market_id = $3) \
             AND ($4::TEXT IS NULL OR side = $4) \
             AND ($5::BIGINT IS NULL OR created_at >= $5) \
             AND ($6::BIGINT IS NULL OR created_at < $6) \
             {} ORDER BY id DESC LIMIT $7 OFFSET $8",
            self.select_sql, status_clause
        );

        let (skip, take) = filter.window();
        let limit = i64::try_from(take).unwrap_or(i64::MAX);
        let offset = i64::try_from(skip).unwrap_or(i64::MAX);
        let side = filter.side.as_ref().map(enum_text).transpose()?;

        let rows = sqlx::query(&sql)
            .bind(opt_to_db(filter.owner_id)?)
            .bind(opt_to_db(filter.sub_account)?)
            .bind(&filter.market_id)
            .bind(side)
            .bind(filter.from)
            .bind(filter.to)
            .bind(limit)
            .bind(offset)
            .fetch_all(&self.pool)
            .await
            .map_err(StorageError::from)?;
        rows.iter().map(row_to_order).collect()
    }

    async fn recent_trades(&self, market_id: &str, limit: usize) -> Result<Vec<TradeRecord>> {
        let sql = format!(
            "SELECT {} FROM trades WHERE market_id = $1 ORDER BY id DESC LIMIT $2",
            TRADE_COLUMNS
        );
        let rows = sqlx::query(&sql)
            .bind(market_id)
            .bind(i64::try_from(limit).unwrap_or(i64::MAX))
            .fetch_all(&self.pool)
            .await
            .map_err(StorageError::from)?;
        rows.iter().map(row_to_trade).collect()
    }

    async fn max_ids(&self) -> Result<(u64, u64)> {
        let row = sqlx::query(
            r#"
            SELECT
                (SELECT COALESCE(MAX(id), 0) FROM orders) AS order_id,
                (SELECT COALESCE(MAX(id), 0) FROM trades) AS trade_id
            "#,
        )
        .fetch_one(&self.pool)
        .await
        .map_err(StorageError::from)?;

        let order_id: i64 = row.try_get("order_id").map_err(StorageError::from)?;
        let trade_id: i64 = row.try_get("trade_id").map_err(StorageError::from)?;
        Ok((from_db(order_id)?, from_db(trade_id)?))
    }

    async fn max_trade_seq(&self, market_id: &str) -> Result<u64> {
        let seq: i64 =
            sqlx::query_scalar("SELECT COALESCE(MAX(seqid), 0) FROM trades WHERE market_id = $1")
                .bind(market_id)
                .fetch_one(&self.pool)
                .await
                .map_err(StorageError::from)?;
        Ok(from_db(seq)?)
    }

    async fn last_trade_price(&self, market_id: &str) -> Result<Option<u64>> {
        let price: Option<i64> = sqlx::query_scalar(
            "SELECT price FROM trades WHERE market_id = $1 ORDER BY seqid DESC LIMIT 1",
        )
        .bind(market_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(StorageError::from)?;
        Ok(price.map(from_db).transpose()?)
    }
}
