//! PostgreSQL position store.
//!
//! One row per trade in `live_orders` and `live_tiers`; append-only audit
//! tables for trade operations and tier modifications. All writes are keyed
//! by trade id so concurrent controller tasks never collide across trades.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use helmsman_core::{
    OperationKind, Position, PositionStatus, PositionStore, PositionWithTiers, Side,
    TierModification, TierRecord, TradeOperation,
};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;

pub struct PgPositionStore {
    pool: PgPool,
}

#[derive(sqlx::FromRow)]
struct OrderRow {
    trade_id: i64,
    symbol: String,
    side: String,
    entry_price: f64,
    initial_amount: f64,
    current_amount: f64,
    closed_amount: f64,
    stake: f64,
    leverage: f64,
    status: String,
    opened_at: DateTime<Utc>,
}

#[derive(sqlx::FromRow)]
struct TierRow {
    stop_loss: f64,
    take_profit: f64,
    tier1_price: f64,
    tier1_ratio: f64,
    tier1_done: bool,
    tier2_price: f64,
    tier2_ratio: f64,
    tier2_done: bool,
    tier3_price: f64,
    tier3_ratio: f64,
    tier3_done: bool,
    remaining_ratio: f64,
    is_placeholder: bool,
}

#[derive(sqlx::FromRow)]
struct OperationRow {
    trade_id: i64,
    symbol: String,
    kind: String,
    detail: serde_json::Value,
    created_at: DateTime<Utc>,
}

impl OrderRow {
    fn into_position(self) -> Result<Position> {
        Ok(Position {
            trade_id: self.trade_id,
            symbol: self.symbol,
            side: Side::parse(&self.side)
                .with_context(|| format!("unknown side {:?}", self.side))?,
            entry_price: self.entry_price,
            initial_amount: self.initial_amount,
            current_amount: self.current_amount,
            closed_amount: self.closed_amount,
            stake: self.stake,
            leverage: self.leverage,
            status: PositionStatus::parse(&self.status)
                .with_context(|| format!("unknown status {:?}", self.status))?,
            opened_at: self.opened_at,
        })
    }
}

impl From<TierRow> for TierRecord {
    fn from(row: TierRow) -> Self {
        Self {
            stop_loss: row.stop_loss,
            take_profit: row.take_profit,
            tier1_price: row.tier1_price,
            tier1_ratio: row.tier1_ratio,
            tier1_done: row.tier1_done,
            tier2_price: row.tier2_price,
            tier2_ratio: row.tier2_ratio,
            tier2_done: row.tier2_done,
            tier3_price: row.tier3_price,
            tier3_ratio: row.tier3_ratio,
            tier3_done: row.tier3_done,
            remaining_ratio: row.remaining_ratio,
            is_placeholder: row.is_placeholder,
        }
    }
}

fn operation_kind(label: &str) -> OperationKind {
    match label {
        "entry" => OperationKind::Entry,
        "stop_loss" => OperationKind::StopLoss,
        "take_profit" => OperationKind::TakeProfit,
        "tier1" => OperationKind::Tier1,
        "tier2" => OperationKind::Tier2,
        "tier3" => OperationKind::Tier3,
        _ => OperationKind::Failed,
    }
}

impl PgPositionStore {
    /// Connects and ensures the schema exists.
    ///
    /// # Errors
    /// Returns an error if the pool cannot connect or DDL fails.
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await
            .context("failed to connect to postgres")?;
        let store = Self { pool };
        store.init_schema().await?;
        Ok(store)
    }

    #[must_use]
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn init_schema(&self) -> Result<()> {
        sqlx::query(
            r"
            CREATE TABLE IF NOT EXISTS live_orders (
                trade_id        BIGINT PRIMARY KEY,
                symbol          TEXT NOT NULL,
                side            TEXT NOT NULL,
                entry_price     DOUBLE PRECISION NOT NULL DEFAULT 0,
                initial_amount  DOUBLE PRECISION NOT NULL DEFAULT 0,
                current_amount  DOUBLE PRECISION NOT NULL DEFAULT 0,
                closed_amount   DOUBLE PRECISION NOT NULL DEFAULT 0,
                stake           DOUBLE PRECISION NOT NULL DEFAULT 0,
                leverage        DOUBLE PRECISION NOT NULL DEFAULT 0,
                status          TEXT NOT NULL,
                opened_at       TIMESTAMPTZ NOT NULL,
                updated_at      TIMESTAMPTZ NOT NULL DEFAULT now()
            )
            ",
        )
        .execute(&self.pool)
        .await?;
        sqlx::query(
            r"
            CREATE TABLE IF NOT EXISTS live_tiers (
                trade_id        BIGINT PRIMARY KEY,
                symbol          TEXT NOT NULL,
                stop_loss       DOUBLE PRECISION NOT NULL DEFAULT 0,
                take_profit     DOUBLE PRECISION NOT NULL DEFAULT 0,
                tier1_price     DOUBLE PRECISION NOT NULL DEFAULT 0,
                tier1_ratio     DOUBLE PRECISION NOT NULL DEFAULT 0,
                tier1_done      BOOLEAN NOT NULL DEFAULT FALSE,
                tier2_price     DOUBLE PRECISION NOT NULL DEFAULT 0,
                tier2_ratio     DOUBLE PRECISION NOT NULL DEFAULT 0,
                tier2_done      BOOLEAN NOT NULL DEFAULT FALSE,
                tier3_price     DOUBLE PRECISION NOT NULL DEFAULT 0,
                tier3_ratio     DOUBLE PRECISION NOT NULL DEFAULT 0,
                tier3_done      BOOLEAN NOT NULL DEFAULT FALSE,
                remaining_ratio DOUBLE PRECISION NOT NULL DEFAULT 1,
                is_placeholder  BOOLEAN NOT NULL DEFAULT FALSE,
                updated_at      TIMESTAMPTZ NOT NULL DEFAULT now()
            )
            ",
        )
        .execute(&self.pool)
        .await?;
        sqlx::query(
            r"
            CREATE TABLE IF NOT EXISTS trade_operations (
                id         BIGSERIAL PRIMARY KEY,
                trade_id   BIGINT NOT NULL,
                symbol     TEXT NOT NULL,
                kind       TEXT NOT NULL,
                detail     JSONB NOT NULL DEFAULT '{}'::jsonb,
                created_at TIMESTAMPTZ NOT NULL DEFAULT now()
            )
            ",
        )
        .execute(&self.pool)
        .await?;
        sqlx::query(
            r"
            CREATE TABLE IF NOT EXISTS tier_modifications (
                id         BIGSERIAL PRIMARY KEY,
                trade_id   BIGINT NOT NULL,
                symbol     TEXT NOT NULL,
                field      TEXT NOT NULL,
                old_value  DOUBLE PRECISION NOT NULL DEFAULT 0,
                new_value  DOUBLE PRECISION NOT NULL DEFAULT 0,
                reason     TEXT NOT NULL DEFAULT '',
                created_at TIMESTAMPTZ NOT NULL DEFAULT now()
            )
            ",
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl PositionStore for PgPositionStore {
    async fn upsert_order(&self, position: &Position) -> Result<()> {
        sqlx::query(
            r"
            INSERT INTO live_orders
                (trade_id, symbol, side, entry_price, initial_amount, current_amount,
                 closed_amount, stake, leverage, status, opened_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, now())
            ON CONFLICT (trade_id) DO UPDATE SET
                symbol = EXCLUDED.symbol,
                side = EXCLUDED.side,
                entry_price = EXCLUDED.entry_price,
                initial_amount = EXCLUDED.initial_amount,
                current_amount = EXCLUDED.current_amount,
                closed_amount = EXCLUDED.closed_amount,
                stake = EXCLUDED.stake,
                leverage = EXCLUDED.leverage,
                status = EXCLUDED.status,
                updated_at = now()
            ",
        )
        .bind(position.trade_id)
        .bind(&position.symbol)
        .bind(position.side.as_str())
        .bind(position.entry_price)
        .bind(position.initial_amount)
        .bind(position.current_amount)
        .bind(position.closed_amount)
        .bind(position.stake)
        .bind(position.leverage)
        .bind(position.status.as_str())
        .bind(position.opened_at)
        .execute(&self.pool)
        .await
        .context("upsert live order")?;
        Ok(())
    }

    async fn update_order_status(&self, trade_id: i64, status: PositionStatus) -> Result<()> {
        let result = sqlx::query(
            "UPDATE live_orders SET status = $2, updated_at = now() WHERE trade_id = $1",
        )
        .bind(trade_id)
        .bind(status.as_str())
        .execute(&self.pool)
        .await
        .context("update order status")?;
        if result.rows_affected() == 0 {
            anyhow::bail!("no order for trade {trade_id}");
        }
        Ok(())
    }

    async fn upsert_tiers(&self, trade_id: i64, symbol: &str, tiers: &TierRecord) -> Result<()> {
        sqlx::query(
            r"
            INSERT INTO live_tiers
                (trade_id, symbol, stop_loss, take_profit,
                 tier1_price, tier1_ratio, tier1_done,
                 tier2_price, tier2_ratio, tier2_done,
                 tier3_price, tier3_ratio, tier3_done,
                 remaining_ratio, is_placeholder, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, now())
            ON CONFLICT (trade_id) DO UPDATE SET
                symbol = EXCLUDED.symbol,
                stop_loss = EXCLUDED.stop_loss,
                take_profit = EXCLUDED.take_profit,
                tier1_price = EXCLUDED.tier1_price,
                tier1_ratio = EXCLUDED.tier1_ratio,
                tier1_done = EXCLUDED.tier1_done,
                tier2_price = EXCLUDED.tier2_price,
                tier2_ratio = EXCLUDED.tier2_ratio,
                tier2_done = EXCLUDED.tier2_done,
                tier3_price = EXCLUDED.tier3_price,
                tier3_ratio = EXCLUDED.tier3_ratio,
                tier3_done = EXCLUDED.tier3_done,
                remaining_ratio = EXCLUDED.remaining_ratio,
                is_placeholder = EXCLUDED.is_placeholder,
                updated_at = now()
            ",
        )
        .bind(trade_id)
        .bind(symbol)
        .bind(tiers.stop_loss)
        .bind(tiers.take_profit)
        .bind(tiers.tier1_price)
        .bind(tiers.tier1_ratio)
        .bind(tiers.tier1_done)
        .bind(tiers.tier2_price)
        .bind(tiers.tier2_ratio)
        .bind(tiers.tier2_done)
        .bind(tiers.tier3_price)
        .bind(tiers.tier3_ratio)
        .bind(tiers.tier3_done)
        .bind(tiers.remaining_ratio)
        .bind(tiers.is_placeholder)
        .execute(&self.pool)
        .await
        .context("upsert live tiers")?;
        Ok(())
    }

    async fn save_position(&self, position: &Position, tiers: &TierRecord) -> Result<()> {
        let mut tx = self.pool.begin().await.context("begin save_position")?;
        sqlx::query(
            r"
            INSERT INTO live_orders
                (trade_id, symbol, side, entry_price, initial_amount, current_amount,
                 closed_amount, stake, leverage, status, opened_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, now())
            ON CONFLICT (trade_id) DO UPDATE SET
                current_amount = EXCLUDED.current_amount,
                closed_amount = EXCLUDED.closed_amount,
                status = EXCLUDED.status,
                updated_at = now()
            ",
        )
        .bind(position.trade_id)
        .bind(&position.symbol)
        .bind(position.side.as_str())
        .bind(position.entry_price)
        .bind(position.initial_amount)
        .bind(position.current_amount)
        .bind(position.closed_amount)
        .bind(position.stake)
        .bind(position.leverage)
        .bind(position.status.as_str())
        .bind(position.opened_at)
        .execute(&mut *tx)
        .await?;
        sqlx::query(
            r"
            INSERT INTO live_tiers
                (trade_id, symbol, stop_loss, take_profit,
                 tier1_price, tier1_ratio, tier1_done,
                 tier2_price, tier2_ratio, tier2_done,
                 tier3_price, tier3_ratio, tier3_done,
                 remaining_ratio, is_placeholder, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, now())
            ON CONFLICT (trade_id) DO UPDATE SET
                stop_loss = EXCLUDED.stop_loss,
                take_profit = EXCLUDED.take_profit,
                tier1_price = EXCLUDED.tier1_price,
                tier1_ratio = EXCLUDED.tier1_ratio,
                tier1_done = EXCLUDED.tier1_done,
                tier2_price = EXCLUDED.tier2_price,
                tier2_ratio = EXCLUDED.tier2_ratio,
                tier2_done = EXCLUDED.tier2_done,
                tier3_price = EXCLUDED.tier3_price,
                tier3_ratio = EXCLUDED.tier3_ratio,
                tier3_done = EXCLUDED.tier3_done,
                remaining_ratio = EXCLUDED.remaining_ratio,
                is_placeholder = EXCLUDED.is_placeholder,
                updated_at = now()
            ",
        )
        .bind(position.trade_id)
        .bind(&position.symbol)
        .bind(tiers.stop_loss)
        .bind(tiers.take_profit)
        .bind(tiers.tier1_price)
        .bind(tiers.tier1_ratio)
        .bind(tiers.tier1_done)
        .bind(tiers.tier2_price)
        .bind(tiers.tier2_ratio)
        .bind(tiers.tier2_done)
        .bind(tiers.tier3_price)
        .bind(tiers.tier3_ratio)
        .bind(tiers.tier3_done)
        .bind(tiers.remaining_ratio)
        .bind(tiers.is_placeholder)
        .execute(&mut *tx)
        .await?;
        tx.commit().await.context("commit save_position")?;
        Ok(())
    }

    async fn get_live_position(&self, trade_id: i64) -> Result<Option<PositionWithTiers>> {
        let order = sqlx::query_as::<_, OrderRow>(
            r"
            SELECT trade_id, symbol, side, entry_price, initial_amount, current_amount,
                   closed_amount, stake, leverage, status, opened_at
            FROM live_orders WHERE trade_id = $1
            ",
        )
        .bind(trade_id)
        .fetch_optional(&self.pool)
        .await
        .context("fetch live order")?;
        let Some(order) = order else {
            return Ok(None);
        };
        let tiers = sqlx::query_as::<_, TierRow>(
            r"
            SELECT stop_loss, take_profit,
                   tier1_price, tier1_ratio, tier1_done,
                   tier2_price, tier2_ratio, tier2_done,
                   tier3_price, tier3_ratio, tier3_done,
                   remaining_ratio, is_placeholder
            FROM live_tiers WHERE trade_id = $1
            ",
        )
        .bind(trade_id)
        .fetch_optional(&self.pool)
        .await
        .context("fetch live tiers")?;
        Ok(Some(PositionWithTiers {
            position: order.into_position()?,
            tiers: tiers.map(TierRecord::from).unwrap_or_default(),
        }))
    }

    async fn list_active_positions(&self) -> Result<Vec<PositionWithTiers>> {
        let orders = sqlx::query_as::<_, OrderRow>(
            r"
            SELECT trade_id, symbol, side, entry_price, initial_amount, current_amount,
                   closed_amount, stake, leverage, status, opened_at
            FROM live_orders WHERE status <> 'closed'
            ORDER BY trade_id
            ",
        )
        .fetch_all(&self.pool)
        .await
        .context("list active orders")?;
        let mut out = Vec::with_capacity(orders.len());
        for order in orders {
            let trade_id = order.trade_id;
            let tiers = sqlx::query_as::<_, TierRow>(
                r"
                SELECT stop_loss, take_profit,
                       tier1_price, tier1_ratio, tier1_done,
                       tier2_price, tier2_ratio, tier2_done,
                       tier3_price, tier3_ratio, tier3_done,
                       remaining_ratio, is_placeholder
                FROM live_tiers WHERE trade_id = $1
                ",
            )
            .bind(trade_id)
            .fetch_optional(&self.pool)
            .await?;
            out.push(PositionWithTiers {
                position: order.into_position()?,
                tiers: tiers.map(TierRecord::from).unwrap_or_default(),
            });
        }
        Ok(out)
    }

    async fn append_trade_operation(&self, op: &TradeOperation) -> Result<()> {
        sqlx::query(
            r"
            INSERT INTO trade_operations (trade_id, symbol, kind, detail, created_at)
            VALUES ($1, $2, $3, $4, $5)
            ",
        )
        .bind(op.trade_id)
        .bind(&op.symbol)
        .bind(op.kind.as_str())
        .bind(&op.detail)
        .bind(op.created_at)
        .execute(&self.pool)
        .await
        .context("append trade operation")?;
        Ok(())
    }

    async fn insert_tier_modification(&self, log: &TierModification) -> Result<()> {
        sqlx::query(
            r"
            INSERT INTO tier_modifications
                (trade_id, symbol, field, old_value, new_value, reason, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ",
        )
        .bind(log.trade_id)
        .bind(&log.symbol)
        .bind(&log.field)
        .bind(log.old_value)
        .bind(log.new_value)
        .bind(&log.reason)
        .bind(log.created_at)
        .execute(&self.pool)
        .await
        .context("insert tier modification")?;
        Ok(())
    }

    async fn list_trade_operations(
        &self,
        trade_id: i64,
        limit: usize,
    ) -> Result<Vec<TradeOperation>> {
        let limit = if limit == 0 { 100 } else { limit };
        let rows = sqlx::query_as::<_, OperationRow>(
            r"
            SELECT trade_id, symbol, kind, detail, created_at
            FROM trade_operations
            WHERE trade_id = $1
            ORDER BY id DESC
            LIMIT $2
            ",
        )
        .bind(trade_id)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .context("list trade operations")?;
        Ok(rows
            .into_iter()
            .rev()
            .map(|row| TradeOperation {
                trade_id: row.trade_id,
                symbol: row.symbol,
                kind: operation_kind(&row.kind),
                detail: row.detail,
                created_at: row.created_at,
            })
            .collect())
    }
}
