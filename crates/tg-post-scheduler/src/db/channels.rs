use crate::prelude::*;
use crate::Result;
use chrono::prelude::*;
use sqlx_bat::prelude::*;
use sqlx_bat::{DbRepresentable, TryFromDb};
use teloxide::types::{ChatId, UserId};

#[derive(Debug, Clone)]
pub(crate) struct Channel {
    pub(crate) id: i64,
    pub(crate) tg_chat_id: ChatId,
    pub(crate) title: String,
    pub(crate) username: Option<String>,
    pub(crate) added_by: Option<UserId>,
    pub(crate) added_at: DateTime<Utc>,
}

#[derive(Debug, sqlx::FromRow)]
pub(crate) struct ChannelRecord {
    id: i64,
    tg_chat_id: i64,
    title: String,
    username: Option<String>,
    added_by: Option<i64>,
    added_at: i64,
}

impl Channel {
    /// Channels are managed by the user who added them and by the admins.
    /// Channels with an unknown owner are left to the admins only.
    pub(crate) fn is_manageable_by(&self, user_id: UserId, is_admin: bool) -> bool {
        is_admin || self.added_by == Some(user_id)
    }
}

impl DbRepresentable for Channel {
    type DbRepr = ChannelRecord;
}

impl TryFromDb for Channel {
    fn try_from_db(record: ChannelRecord) -> sqlx_bat::Result<Self> {
        Ok(Self {
            id: record.id,
            tg_chat_id: record.tg_chat_id.try_into_app()?,
            title: record.title,
            username: record.username,
            added_by: record.added_by.try_into_app()?,
            added_at: record.added_at.try_into_app()?,
        })
    }
}

pub(crate) struct NewChannel<'a> {
    pub(crate) tg_chat_id: ChatId,
    pub(crate) title: &'a str,
    pub(crate) username: Option<&'a str>,
    pub(crate) added_by: UserId,
}

#[derive(Debug, PartialEq, Eq)]
pub(crate) enum DeleteChannelOutcome {
    Deleted,
    NotFound,

    /// Deleting the channel would silently drop the posts that wait
    /// for publication in it
    HasPendingPosts { count: i64 },
}

const CHANNEL_COLUMNS: &str = "id, tg_chat_id, title, username, added_by, added_at";

pub(crate) struct ChannelsRepo {
    pool: sqlx::SqlitePool,
}

impl ChannelsRepo {
    pub(crate) fn new(pool: sqlx::SqlitePool) -> Self {
        Self { pool }
    }

    /// Adds a new channel, or refreshes the title and username of the
    /// channel that was already added before.
    #[instrument(skip_all, fields(tg_chat_id = %channel.tg_chat_id, title = channel.title))]
    pub(crate) async fn upsert(
        &self,
        channel: NewChannel<'_>,
        now: DateTime<Utc>,
    ) -> Result<Channel> {
        let query = format!(
            "INSERT INTO channels (tg_chat_id, title, username, added_by, added_at)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (tg_chat_id) DO UPDATE
            SET title = excluded.title, username = excluded.username
            RETURNING {CHANNEL_COLUMNS}"
        );

        let record: ChannelRecord = sqlx::query_as(&query)
            .bind(channel.tg_chat_id.into_db())
            .bind(channel.title)
            .bind(channel.username)
            .bind(channel.added_by.try_into_db()?)
            .bind(now.into_db())
            .fetch_one(&self.pool)
            .await?;

        Ok(record.try_into_app()?)
    }

    /// Lists the channels manageable by the user, see [`Channel::is_manageable_by`]
    #[instrument(skip(self))]
    pub(crate) async fn list_for(&self, user_id: UserId, is_admin: bool) -> Result<Vec<Channel>> {
        let query = format!(
            "SELECT {CHANNEL_COLUMNS} FROM channels
            WHERE $2 OR added_by = $1
            ORDER BY id"
        );

        let records: Vec<ChannelRecord> = sqlx::query_as(&query)
            .bind(user_id.try_into_db()?)
            .bind(is_admin)
            .fetch_all(&self.pool)
            .await?;

        Ok(records.try_into_app()?)
    }

    #[instrument(skip(self))]
    pub(crate) async fn get(&self, id: i64) -> Result<Option<Channel>> {
        let query = format!("SELECT {CHANNEL_COLUMNS} FROM channels WHERE id = $1");

        let record: Option<ChannelRecord> = sqlx::query_as(&query)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(record.try_into_app()?)
    }

    /// Deletes the channel together with the history of its posts.
    /// Refuses to do so if there are posts still waiting for publication.
    #[instrument(skip(self))]
    pub(crate) async fn delete(&self, id: i64) -> Result<DeleteChannelOutcome> {
        let mut tx = self.pool.begin().await?;

        let pending: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM posts
            WHERE channel_id = $1 AND status IN ('scheduled', 'publishing')",
        )
        .bind(id)
        .fetch_one(&mut *tx)
        .await?;

        if pending > 0 {
            return Ok(DeleteChannelOutcome::HasPendingPosts { count: pending });
        }

        let result = sqlx::query("DELETE FROM channels WHERE id = $1")
            .bind(id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;

        if super::single_row_affected(result) {
            Ok(DeleteChannelOutcome::Deleted)
        } else {
            Ok(DeleteChannelOutcome::NotFound)
        }
    }

    #[instrument(skip(self))]
    pub(crate) async fn count(&self) -> Result<i64> {
        let count = sqlx::query_scalar("SELECT COUNT(*) FROM channels")
            .fetch_one(&self.pool)
            .await?;

        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;

    fn new_channel(tg_chat_id: i64, title: &str) -> NewChannel<'_> {
        NewChannel {
            tg_chat_id: ChatId(tg_chat_id),
            title,
            username: Some("news"),
            added_by: UserId(1),
        }
    }

    #[test_log::test(tokio::test)]
    async fn upsert_refreshes_existing_channel() {
        let db = db::init_test().await;
        let now = Utc.with_ymd_and_hms(2024, 12, 25, 12, 0, 0).unwrap();

        let first = db
            .channels
            .upsert(new_channel(-100_123, "Old title"), now)
            .await
            .unwrap();

        let later = now + chrono::Duration::hours(1);
        let second = db
            .channels
            .upsert(
                NewChannel {
                    username: None,
                    ..new_channel(-100_123, "New title")
                },
                later,
            )
            .await
            .unwrap();

        assert_eq!(first.id, second.id);
        assert_eq!(second.title, "New title");
        assert_eq!(second.username, None);
        assert_eq!(second.added_at, now);
        assert_eq!(second.added_by, Some(UserId(1)));

        assert_eq!(db.channels.count().await.unwrap(), 1);
        assert!(db.channels.get(first.id).await.unwrap().is_some());
        assert!(db.channels.get(first.id + 1).await.unwrap().is_none());
    }

    #[test_log::test(tokio::test)]
    async fn list_is_ordered_by_id() {
        let db = db::init_test().await;
        let now = Utc::now();

        for (chat_id, title) in [(-3, "c"), (-1, "a"), (-2, "b")] {
            db.channels
                .upsert(new_channel(chat_id, title), now)
                .await
                .unwrap();
        }

        let titles: Vec<_> = db
            .channels
            .list_for(UserId(1), true)
            .await
            .unwrap()
            .into_iter()
            .map(|channel| channel.title)
            .collect();

        assert_eq!(titles, ["c", "a", "b"]);
    }

    #[test_log::test(tokio::test)]
    async fn channels_are_listed_for_their_owners() {
        let db = db::init_test().await;
        let now = Utc::now();

        for (chat_id, owner) in [(-1, 1), (-2, 2), (-3, 1)] {
            let channel = NewChannel {
                added_by: UserId(owner),
                ..new_channel(chat_id, "News")
            };
            db.channels.upsert(channel, now).await.unwrap();
        }

        // Channels added before their owners were tracked
        sqlx::query(
            "INSERT INTO channels (tg_chat_id, title, added_at) VALUES (-4, 'Legacy', 0)",
        )
        .execute(&db.pool)
        .await
        .unwrap();

        let chat_ids = |channels: Vec<Channel>| -> Vec<i64> {
            channels.into_iter().map(|channel| channel.tg_chat_id.0).collect()
        };

        let owned = db.channels.list_for(UserId(1), false).await.unwrap();
        assert_eq!(chat_ids(owned), [-1, -3]);

        let owned = db.channels.list_for(UserId(2), false).await.unwrap();
        assert_eq!(chat_ids(owned), [-2]);

        let owned = db.channels.list_for(UserId(3), false).await.unwrap();
        assert!(owned.is_empty());

        let all = db.channels.list_for(UserId(3), true).await.unwrap();
        assert_eq!(chat_ids(all.clone()), [-1, -2, -3, -4]);

        let legacy = &all[3];
        assert!(legacy.is_manageable_by(UserId(3), true));
        assert!(!legacy.is_manageable_by(UserId(1), false));

        let first = &all[0];
        assert!(first.is_manageable_by(UserId(1), false));
        assert!(!first.is_manageable_by(UserId(2), false));
        assert!(first.is_manageable_by(UserId(2), true));
    }

    #[test_log::test(tokio::test)]
    async fn delete_missing_channel() {
        let db = db::init_test().await;

        let outcome = db.channels.delete(42).await.unwrap();
        assert_eq!(outcome, DeleteChannelOutcome::NotFound);
    }
}
