use crate::prelude::*;
use crate::Result;
use chrono::prelude::*;
use sqlx::SqliteConnection;
use sqlx_bat::prelude::*;
use sqlx_bat::{DbRepresentable, TryFromDb};
use teloxide::types::UserId;

const SECONDS_IN_DAY: i64 = 24 * 60 * 60;

#[derive(Debug, Clone)]
pub(crate) struct PremiumUser {
    pub(crate) user_id: UserId,
    pub(crate) expires_at: DateTime<Utc>,

    /// Start of the current uninterrupted premium period
    pub(crate) started_at: DateTime<Utc>,
}

impl PremiumUser {
    pub(crate) fn is_active(&self, now: DateTime<Utc>) -> bool {
        self.expires_at > now
    }
}

#[derive(Debug, sqlx::FromRow)]
pub(crate) struct PremiumUserRecord {
    user_id: i64,
    expires_at: i64,
    started_at: i64,
}

impl DbRepresentable for PremiumUser {
    type DbRepr = PremiumUserRecord;
}

impl TryFromDb for PremiumUser {
    fn try_from_db(record: PremiumUserRecord) -> sqlx_bat::Result<Self> {
        Ok(Self {
            user_id: record.user_id.try_into_app()?,
            expires_at: record.expires_at.try_into_app()?,
            started_at: record.started_at.try_into_app()?,
        })
    }
}

pub(crate) struct PremiumRepo {
    pool: sqlx::SqlitePool,
}

impl PremiumRepo {
    pub(crate) fn new(pool: sqlx::SqlitePool) -> Self {
        Self { pool }
    }

    #[instrument(skip(self))]
    pub(crate) async fn get(&self, user_id: UserId) -> Result<Option<PremiumUser>> {
        let record: Option<PremiumUserRecord> = sqlx::query_as(
            "SELECT user_id, expires_at, started_at FROM premium_users WHERE user_id = $1",
        )
        .bind(user_id.try_into_db()?)
        .fetch_optional(&self.pool)
        .await?;

        Ok(record.try_into_app()?)
    }

    #[instrument(skip(self))]
    pub(crate) async fn is_active(&self, user_id: UserId, now: DateTime<Utc>) -> Result<bool> {
        let active = sqlx::query_scalar(
            "SELECT EXISTS (
                SELECT 1 FROM premium_users WHERE user_id = $1 AND expires_at > $2
            )",
        )
        .bind(user_id.try_into_db()?)
        .bind(now.into_db())
        .fetch_one(&self.pool)
        .await?;

        Ok(active)
    }

    /// See [`extend_in`]
    #[instrument(skip(self))]
    pub(crate) async fn extend(
        &self,
        user_id: UserId,
        days: u32,
        now: DateTime<Utc>,
    ) -> Result<DateTime<Utc>> {
        let mut conn = self.pool.acquire().await?;
        extend_in(&mut conn, user_id, days, now).await
    }

    #[instrument(skip(self))]
    pub(crate) async fn list_active(&self, now: DateTime<Utc>) -> Result<Vec<PremiumUser>> {
        let records: Vec<PremiumUserRecord> = sqlx::query_as(
            "SELECT user_id, expires_at, started_at FROM premium_users
            WHERE expires_at > $1
            ORDER BY expires_at",
        )
        .bind(now.into_db())
        .fetch_all(&self.pool)
        .await?;

        Ok(records.try_into_app()?)
    }
}

/// Prolongs the premium by the given number of days. The days are added
/// on top of the remaining active period, or counted from `now` if the
/// premium has already expired. Returns the new expiration time.
#[instrument(skip(conn))]
pub(crate) async fn extend_in(
    conn: &mut SqliteConnection,
    user_id: UserId,
    days: u32,
    now: DateTime<Utc>,
) -> Result<DateTime<Utc>> {
    let now = now.into_db();
    let added = i64::from(days) * SECONDS_IN_DAY;

    // Every SET expression sees the old row, so `started_at` compares
    // against the previous `expires_at`
    let expires_at: i64 = sqlx::query_scalar(
        "INSERT INTO premium_users (user_id, expires_at, started_at)
        VALUES ($1, $2 + $3, $2)
        ON CONFLICT (user_id) DO UPDATE SET
            started_at = CASE
                WHEN premium_users.expires_at > $2 THEN premium_users.started_at
                ELSE $2
            END,
            expires_at = MAX(premium_users.expires_at, $2) + $3
        RETURNING expires_at",
    )
    .bind(user_id.try_into_db()?)
    .bind(now)
    .bind(added)
    .fetch_one(&mut *conn)
    .await?;

    Ok(expires_at.try_into_app()?)
}
