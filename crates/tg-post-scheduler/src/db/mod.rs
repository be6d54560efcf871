mod admins;
mod channels;
mod config;
mod error;
mod orders;
mod posts;
mod premium;

use crate::prelude::*;
use crate::{err_ctx, Result};
use chrono::prelude::*;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::SqlitePool;
use std::str::FromStr;
use std::time::Duration;
use teloxide::types::UserId;

pub(crate) use admins::*;
pub(crate) use channels::*;
pub(crate) use config::*;
pub(crate) use error::*;
pub(crate) use orders::*;
pub(crate) use posts::*;
pub(crate) use premium::*;

pub(crate) struct Repo {
    pub(crate) channels: ChannelsRepo,
    pub(crate) posts: PostsRepo,
    pub(crate) admins: AdminsRepo,
    pub(crate) premium: PremiumRepo,
    pub(crate) orders: OrdersRepo,
    pool: SqlitePool,
}

impl Repo {
    fn new(pool: SqlitePool) -> Self {
        Self {
            channels: ChannelsRepo::new(pool.clone()),
            posts: PostsRepo::new(pool.clone()),
            admins: AdminsRepo::new(pool.clone()),
            premium: PremiumRepo::new(pool.clone()),
            orders: OrdersRepo::new(pool.clone()),
            pool,
        }
    }

    /// Marks the order as paid and prolongs the premium of `user_id` in a
    /// single transaction. Returns the new premium expiration time, or `None`
    /// if the order doesn't exist or was already paid.
    #[instrument(skip(self))]
    pub(crate) async fn confirm_payment(
        &self,
        order_id: &str,
        user_id: UserId,
        premium_days: u32,
        now: DateTime<Utc>,
    ) -> Result<Option<DateTime<Utc>>> {
        let mut tx = self.pool.begin().await?;

        if !mark_paid_in(&mut *tx, order_id, now).await? {
            return Ok(None);
        }

        let expires_at = extend_in(&mut *tx, user_id, premium_days, now).await?;

        tx.commit().await?;

        Ok(Some(expires_at))
    }
}

pub(crate) async fn init(cfg: Config) -> Result<Repo> {
    let opts = SqliteConnectOptions::from_str(&cfg.url)
        .map_err(err_ctx!(DbError::Connect))?
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .foreign_keys(true)
        .busy_timeout(Duration::from_secs(10));

    let pool = SqlitePoolOptions::new()
        .max_connections(cfg.pool_size)
        // Verify that the connection is working early.
        // The connection created here is then reused by the migrations.
        .connect_with(opts)
        .await
        .map_err(err_ctx!(DbError::Connect))?;

    migrate(&pool).await?;

    info!(url = %cfg.url, "Database is ready");

    Ok(Repo::new(pool))
}

async fn migrate(pool: &SqlitePool) -> Result {
    sqlx::migrate!()
        .run(pool)
        .await
        .map_err(err_ctx!(DbError::Migrate))
}

/// Fresh in-memory database with all migrations applied
#[cfg(test)]
pub(crate) async fn init_test() -> Repo {
    let opts = SqliteConnectOptions::from_str("sqlite::memory:")
        .unwrap()
        .foreign_keys(true);

    // Every connection to `:memory:` opens a separate database, so the pool
    // must hold exactly one connection for its whole lifetime.
    let pool = SqlitePoolOptions::new()
        .min_connections(1)
        .max_connections(1)
        .idle_timeout(None)
        .max_lifetime(None)
        .connect_with(opts)
        .await
        .unwrap();

    migrate(&pool).await.unwrap();

    Repo::new(pool)
}

/// Warns if the query touched more rows than it should have.
/// Returns `true` if exactly one row was affected.
fn single_row_affected(result: sqlx::sqlite::SqliteQueryResult) -> bool {
    let affected = result.rows_affected();

    if affected > 1 {
        warn!(affected, "The query affected more than one row");
    }

    affected == 1
}

#[cfg(test)]
pub(crate) async fn add_test_channel(repo: &Repo, tg_chat_id: i64) -> Channel {
    let channel = NewChannel {
        tg_chat_id: teloxide::types::ChatId(tg_chat_id),
        title: "Test channel",
        username: None,
        added_by: teloxide::types::UserId(1),
    };
    repo.channels
        .upsert(channel, chrono::Utc::now())
        .await
        .unwrap()
}
