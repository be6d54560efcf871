use crate::prelude::*;
use crate::Result;
use chrono::prelude::*;
use sqlx_bat::prelude::*;
use sqlx_bat::{DbRepresentable, TryFromDb};
use teloxide::types::UserId;

/// Username recorded for the admins that come from the config
pub(crate) const CONFIG_ADMIN_USERNAME: &str = "config";

#[derive(Debug, Clone)]
pub(crate) struct Admin {
    pub(crate) user_id: UserId,
    pub(crate) username: Option<String>,
    pub(crate) added_at: DateTime<Utc>,
}

#[derive(Debug, sqlx::FromRow)]
pub(crate) struct AdminRecord {
    user_id: i64,
    username: Option<String>,
    added_at: i64,
}

impl DbRepresentable for Admin {
    type DbRepr = AdminRecord;
}

impl TryFromDb for Admin {
    fn try_from_db(record: AdminRecord) -> sqlx_bat::Result<Self> {
        Ok(Self {
            user_id: record.user_id.try_into_app()?,
            username: record.username,
            added_at: record.added_at.try_into_app()?,
        })
    }
}

pub(crate) struct AdminsRepo {
    pool: sqlx::SqlitePool,
}

impl AdminsRepo {
    pub(crate) fn new(pool: sqlx::SqlitePool) -> Self {
        Self { pool }
    }

    /// Returns `false` if the user already was an admin
    #[instrument(skip(self))]
    pub(crate) async fn add(&self, user_id: UserId, username: Option<&str>) -> Result<bool> {
        let result = sqlx::query(
            "INSERT INTO admins (user_id, username, added_at)
            VALUES ($1, $2, $3)
            ON CONFLICT (user_id) DO NOTHING",
        )
        .bind(user_id.try_into_db()?)
        .bind(username)
        .bind(Utc::now().into_db())
        .execute(&self.pool)
        .await?;

        Ok(super::single_row_affected(result))
    }

    #[instrument(skip(self))]
    pub(crate) async fn list(&self) -> Result<Vec<Admin>> {
        let records: Vec<AdminRecord> =
            sqlx::query_as("SELECT user_id, username, added_at FROM admins ORDER BY added_at")
                .fetch_all(&self.pool)
                .await?;

        Ok(records.try_into_app()?)
    }

    #[instrument(skip(self))]
    pub(crate) async fn contains(&self, user_id: UserId) -> Result<bool> {
        let exists = sqlx::query_scalar("SELECT EXISTS (SELECT 1 FROM admins WHERE user_id = $1)")
            .bind(user_id.try_into_db()?)
            .fetch_one(&self.pool)
            .await?;

        Ok(exists)
    }

    #[instrument(skip(self))]
    pub(crate) async fn remove(&self, user_id: UserId) -> Result<bool> {
        let result = sqlx::query("DELETE FROM admins WHERE user_id = $1")
            .bind(user_id.try_into_db()?)
            .execute(&self.pool)
            .await?;

        Ok(super::single_row_affected(result))
    }

    /// Makes sure the admins listed in the config are present in the table.
    /// Safe to call on every startup.
    #[instrument(skip(self))]
    pub(crate) async fn seed(&self, user_ids: &[UserId]) -> Result {
        for &user_id in user_ids {
            if self.add(user_id, Some(CONFIG_ADMIN_USERNAME)).await? {
                info!(%user_id, "Seeded an admin from the config");
            }
        }
        Ok(())
    }
}
