use crate::payments::{ProviderKind, UsdAmount};
use crate::prelude::*;
use crate::Result;
use chrono::prelude::*;
use sqlx::SqliteConnection;
use sqlx_bat::prelude::*;
use sqlx_bat::{DbRepresentable, TryFromDb};
use teloxide::types::UserId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, sqlx::Type, strum::Display)]
#[sqlx(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub(crate) enum OrderStatus {
    Pending,
    Paid,
    Failed,
}

#[derive(Debug, Clone)]
pub(crate) struct Order {
    pub(crate) order_id: String,
    pub(crate) user_id: UserId,
    pub(crate) amount: UsdAmount,
    pub(crate) provider: ProviderKind,
    pub(crate) status: OrderStatus,
    pub(crate) pay_url: Option<String>,

    /// Id of the invoice on the side of the payment provider
    pub(crate) external_id: Option<String>,
    pub(crate) created_at: DateTime<Utc>,
    pub(crate) paid_at: Option<DateTime<Utc>>,
}

#[derive(Debug, sqlx::FromRow)]
pub(crate) struct OrderRecord {
    order_id: String,
    user_id: i64,
    amount_usd: String,
    provider: ProviderKind,
    status: OrderStatus,
    pay_url: Option<String>,
    external_id: Option<String>,
    created_at: i64,
    paid_at: Option<i64>,
}

impl DbRepresentable for Order {
    type DbRepr = OrderRecord;
}

impl TryFromDb for Order {
    fn try_from_db(record: OrderRecord) -> sqlx_bat::Result<Self> {
        let amount = record
            .amount_usd
            .parse()
            .map_err(|err| sqlx_bat::Error::deserialize::<UsdAmount, _>(&record.amount_usd, err))?;

        Ok(Self {
            order_id: record.order_id,
            user_id: record.user_id.try_into_app()?,
            amount,
            provider: record.provider,
            status: record.status,
            pay_url: record.pay_url,
            external_id: record.external_id,
            created_at: record.created_at.try_into_app()?,
            paid_at: record.paid_at.try_into_app()?,
        })
    }
}

pub(crate) struct NewOrder {
    pub(crate) user_id: UserId,
    pub(crate) amount: UsdAmount,
    pub(crate) provider: ProviderKind,
}

const ORDER_COLUMNS: &str = "\
    order_id, user_id, amount_usd, provider, status, \
    pay_url, external_id, created_at, paid_at";

pub(crate) struct OrdersRepo {
    pool: sqlx::SqlitePool,
}

impl OrdersRepo {
    pub(crate) fn new(pool: sqlx::SqlitePool) -> Self {
        Self { pool }
    }

    /// Creates a `pending` order with a freshly generated id
    #[instrument(skip_all, fields(user_id = %order.user_id, amount = %order.amount))]
    pub(crate) async fn create(&self, order: NewOrder, now: DateTime<Utc>) -> Result<Order> {
        let query = format!(
            "INSERT INTO orders (order_id, user_id, amount_usd, provider, created_at)
            VALUES ($1, $2, $3, $4, $5)
            RETURNING {ORDER_COLUMNS}"
        );

        let record: OrderRecord = sqlx::query_as(&query)
            .bind(nanoid::nanoid!())
            .bind(order.user_id.try_into_db()?)
            .bind(order.amount.to_string())
            .bind(order.provider)
            .bind(now.into_db())
            .fetch_one(&self.pool)
            .await?;

        Ok(record.try_into_app()?)
    }

    #[instrument(skip(self))]
    pub(crate) async fn get(&self, order_id: &str) -> Result<Option<Order>> {
        let query = format!("SELECT {ORDER_COLUMNS} FROM orders WHERE order_id = $1");

        let record: Option<OrderRecord> = sqlx::query_as(&query)
            .bind(order_id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(record.try_into_app()?)
    }

    #[instrument(skip(self))]
    pub(crate) async fn find_by_external_id(&self, external_id: &str) -> Result<Option<Order>> {
        let query = format!("SELECT {ORDER_COLUMNS} FROM orders WHERE external_id = $1");

        let record: Option<OrderRecord> = sqlx::query_as(&query)
            .bind(external_id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(record.try_into_app()?)
    }

    #[instrument(skip(self))]
    pub(crate) async fn attach_invoice(
        &self,
        order_id: &str,
        pay_url: &str,
        external_id: &str,
    ) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE orders SET pay_url = $2, external_id = $3
            WHERE order_id = $1",
        )
        .bind(order_id)
        .bind(pay_url)
        .bind(external_id)
        .execute(&self.pool)
        .await?;

        Ok(super::single_row_affected(result))
    }

    #[instrument(skip(self))]
    pub(crate) async fn mark_failed(&self, order_id: &str) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE orders SET status = 'failed'
            WHERE order_id = $1 AND status = 'pending'",
        )
        .bind(order_id)
        .execute(&self.pool)
        .await?;

        Ok(super::single_row_affected(result))
    }
}

/// Returns `true` only for the first transition into `paid`, so that
/// redelivered webhooks have no effect. An order that was marked as
/// failed may still be paid later, the received money wins.
#[instrument(skip(conn))]
pub(crate) async fn mark_paid_in(
    conn: &mut SqliteConnection,
    order_id: &str,
    now: DateTime<Utc>,
) -> Result<bool> {
    let result = sqlx::query(
        "UPDATE orders SET status = 'paid', paid_at = $2
        WHERE order_id = $1 AND status != 'paid'",
    )
    .bind(order_id)
    .bind(now.into_db())
    .execute(&mut *conn)
    .await?;

    Ok(super::single_row_affected(result))
}
