//! PostgreSQL plumbing shared by the relational stores
//!
//! Pool creation, schema migration, market/coin catalog sync and the
//! Postgres-backed [`PositionStore`].

use async_trait::async_trait;
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};
use std::collections::HashMap;
use std::time::Duration;
use tracing::info;

use crate::error::StorageError;
use crate::positions::PositionStore;
use crate::Result;
use common::Market;
use config::{CoinConfig, PostgresConfig};

/// Open a connection pool.
pub async fn connect(config: &PostgresConfig) -> Result<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(config.max_connections)
        .acquire_timeout(Duration::from_secs(config.connection_timeout_seconds))
        .idle_timeout(Duration::from_secs(config.idle_timeout_seconds))
        .connect(&config.connection_url())
        .await
        .map_err(|e| StorageError::Connection(format!("Failed to connect to database: {}", e)))?;

    info!(host = %config.host, database = %config.database, "Connected to PostgreSQL");
    Ok(pool)
}

/// Run the migration SQL to create tables.
pub async fn run_migrations(pool: &PgPool) -> Result<()> {
    let migration_sql = include_str!("../../../migrations/001_spot_core.sql");
    sqlx::raw_sql(migration_sql)
        .execute(pool)
        .await
        .map_err(|e| StorageError::Backend(format!("Migration failed: {}", e)))?;
    info!("Database migrations completed successfully");
    Ok(())
}

/// Upsert configured coins and markets into the catalog tables.
pub async fn sync_catalog(pool: &PgPool, coins: &[CoinConfig], markets: &[Market]) -> Result<()> {
    let mut tx = pool.begin().await?;

    for coin in coins {
        sqlx::query(
            r#"
            INSERT INTO coins (symbol, name, precision, updated_at)
            VALUES ($1, $2, $3, NOW())
            ON CONFLICT (symbol) DO UPDATE
            SET name = EXCLUDED.name, precision = EXCLUDED.precision, updated_at = NOW()
            "#,
        )
        .bind(&coin.symbol)
        .bind(&coin.name)
        .bind(coin.precision as i32)
        .execute(&mut *tx)
        .await?;
    }

    for market in markets {
        let status = match market.status {
            common::MarketStatus::Active => "active",
            common::MarketStatus::Disabled => "disabled",
        };
        sqlx::query(
            r#"
            INSERT INTO markets (id, base, quote, base_precision, quote_precision,
                min_base_volume, min_quote_volume, max_base_price, max_quote_price,
                max_quote_spend, status, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, NOW())
            ON CONFLICT (id) DO UPDATE SET
                base = EXCLUDED.base,
                quote = EXCLUDED.quote,
                base_precision = EXCLUDED.base_precision,
                quote_precision = EXCLUDED.quote_precision,
                min_base_volume = EXCLUDED.min_base_volume,
                min_quote_volume = EXCLUDED.min_quote_volume,
                max_base_price = EXCLUDED.max_base_price,
                max_quote_price = EXCLUDED.max_quote_price,
                max_quote_spend = EXCLUDED.max_quote_spend,
                status = EXCLUDED.status,
                updated_at = NOW()
            "#,
        )
        .bind(&market.id)
        .bind(&market.base)
        .bind(&market.quote)
        .bind(market.base_precision as i32)
        .bind(market.quote_precision as i32)
        .bind(to_db(market.min_base_volume)?)
        .bind(to_db(market.min_quote_volume)?)
        .bind(to_db(market.max_base_price)?)
        .bind(to_db(market.max_quote_price)?)
        .bind(to_db(market.max_quote_spend)?)
        .bind(status)
        .execute(&mut *tx)
        .await?;
    }

    tx.commit().await?;
    info!(coins = coins.len(), markets = markets.len(), "Catalog synchronised");
    Ok(())
}

/// Scaled integers are stored as BIGINT.
pub fn to_db(value: u64) -> Result<i64> {
    i64::try_from(value).map_err(|_| StorageError::Backend(format!("{} exceeds BIGINT", value)))
}

pub fn from_db(value: i64) -> Result<u64> {
    u64::try_from(value).map_err(|_| StorageError::Corrupt(format!("negative value {}", value)))
}

/// Queue positions in the `queue_positions` table
#[derive(Debug, Clone)]
pub struct PostgresPositionStore {
    pool: PgPool,
}

impl PostgresPositionStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl PositionStore for PostgresPositionStore {
    async fn load(&self, component: &str) -> Result<HashMap<String, u64>> {
        let rows = sqlx::query("SELECT topic, next_offset FROM queue_positions WHERE component = $1")
            .bind(component)
            .fetch_all(&self.pool)
            .await?;

        rows.iter()
            .map(|row| -> Result<(String, u64)> {
                let topic: String = row.try_get("topic")?;
                let offset: i64 = row.try_get("next_offset")?;
                Ok((topic, from_db(offset)?))
            })
            .collect()
    }

    async fn save(&self, component: &str, topic: &str, next_offset: u64) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO queue_positions (component, topic, next_offset)
            VALUES ($1, $2, $3)
            ON CONFLICT (component, topic) DO UPDATE SET next_offset = EXCLUDED.next_offset
            "#,
        )
        .bind(component)
        .bind(topic)
        .bind(to_db(next_offset)?)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bigint_conversion() {
        assert_eq!(to_db(42).unwrap(), 42);
        assert!(to_db(u64::MAX).is_err());
        assert_eq!(from_db(7).unwrap(), 7);
        assert!(from_db(-1).is_err());
    }
}
