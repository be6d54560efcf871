use super::DbError;
use crate::prelude::*;
use crate::{err, Result};
use chrono::prelude::*;
use sqlx_bat::prelude::*;
use sqlx_bat::{DbRepresentable, TryFromDb};
use teloxide::types::{ChatId, MessageId, UserId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, sqlx::Type, strum::Display)]
#[sqlx(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub(crate) enum MediaKind {
    Photo,
    Video,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Media {
    pub(crate) kind: MediaKind,
    pub(crate) file_id: String,
}

/// `scheduled` → `publishing` → `published` | `error`.
/// A transient failure moves the post from `publishing` back to `scheduled`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, sqlx::Type, strum::Display)]
#[sqlx(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub(crate) enum PostStatus {
    Scheduled,
    Publishing,
    Published,
    Error,
}

#[derive(Debug, Clone)]
pub(crate) struct Post {
    pub(crate) id: i64,
    pub(crate) channel_id: i64,
    pub(crate) text: Option<String>,
    pub(crate) media: Option<Media>,
    pub(crate) scheduled_at: DateTime<Utc>,
    pub(crate) status: PostStatus,
    pub(crate) created_by: UserId,
    pub(crate) created_at: DateTime<Utc>,
    pub(crate) published_at: Option<DateTime<Utc>>,
    pub(crate) tg_message_id: Option<MessageId>,
    pub(crate) error: Option<String>,
    pub(crate) attempts: i64,
}

#[derive(Debug, sqlx::FromRow)]
pub(crate) struct PostRecord {
    id: i64,
    channel_id: i64,
    text: Option<String>,
    media_kind: Option<MediaKind>,
    media_file_id: Option<String>,
    scheduled_at: i64,
    status: PostStatus,
    created_by: i64,
    created_at: i64,
    published_at: Option<i64>,
    tg_message_id: Option<i64>,
    error: Option<String>,
    attempts: i64,
}

impl DbRepresentable for Post {
    type DbRepr = PostRecord;
}

impl TryFromDb for Post {
    fn try_from_db(record: PostRecord) -> sqlx_bat::Result<Self> {
        // The table constraints guarantee both of these are set or unset together
        let media = record
            .media_kind
            .zip(record.media_file_id)
            .map(|(kind, file_id)| Media { kind, file_id });

        Ok(Self {
            id: record.id,
            channel_id: record.channel_id,
            text: record.text,
            media,
            scheduled_at: record.scheduled_at.try_into_app()?,
            status: record.status,
            created_by: record.created_by.try_into_app()?,
            created_at: record.created_at.try_into_app()?,
            published_at: record.published_at.try_into_app()?,
            tg_message_id: record.tg_message_id.try_into_app()?,
            error: record.error,
            attempts: record.attempts,
        })
    }
}

/// The post along with the info about the channel it targets
#[derive(Debug, Clone)]
pub(crate) struct PostWithChannel {
    pub(crate) post: Post,
    pub(crate) channel_tg_chat_id: ChatId,
    pub(crate) channel_title: String,
}

#[derive(Debug, sqlx::FromRow)]
pub(crate) struct PostWithChannelRecord {
    #[sqlx(flatten)]
    post: PostRecord,
    channel_tg_chat_id: i64,
    channel_title: String,
}

impl DbRepresentable for PostWithChannel {
    type DbRepr = PostWithChannelRecord;
}

impl TryFromDb for PostWithChannel {
    fn try_from_db(record: PostWithChannelRecord) -> sqlx_bat::Result<Self> {
        Ok(Self {
            post: record.post.try_into_app()?,
            channel_tg_chat_id: record.channel_tg_chat_id.try_into_app()?,
            channel_title: record.channel_title,
        })
    }
}

#[derive(Debug, Clone)]
pub(crate) struct NewPost {
    pub(crate) channel_id: i64,
    pub(crate) text: Option<String>,
    pub(crate) media: Option<Media>,
    pub(crate) scheduled_at: DateTime<Utc>,
    pub(crate) created_by: UserId,
}

const POST_COLUMNS: &str = "\
    id, channel_id, text, media_kind, media_file_id, scheduled_at, \
    status, created_by, created_at, published_at, tg_message_id, \
    error, attempts";

const POST_WITH_CHANNEL_SELECT: &str = "\
    SELECT \
        p.id, p.channel_id, p.text, p.media_kind, p.media_file_id, p.scheduled_at, \
        p.status, p.created_by, p.created_at, p.published_at, p.tg_message_id, \
        p.error, p.attempts, \
        c.tg_chat_id AS channel_tg_chat_id, c.title AS channel_title \
    FROM posts p \
    JOIN channels c ON c.id = p.channel_id";

pub(crate) struct PostsRepo {
    pool: sqlx::SqlitePool,
}

impl PostsRepo {
    pub(crate) fn new(pool: sqlx::SqlitePool) -> Self {
        Self { pool }
    }

    #[instrument(skip_all, fields(channel_id = post.channel_id, scheduled_at = %post.scheduled_at))]
    pub(crate) async fn create(&self, post: NewPost, now: DateTime<Utc>) -> Result<Post> {
        let channel_id = post.channel_id;

        let (media_kind, media_file_id) = post
            .media
            .map(|media| (media.kind, media.file_id))
            .unzip();

        let query = format!(
            "INSERT INTO posts
                (channel_id, text, media_kind, media_file_id, scheduled_at, created_by, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            RETURNING {POST_COLUMNS}"
        );

        let record: PostRecord = sqlx::query_as(&query)
            .bind(channel_id)
            .bind(post.text)
            .bind(media_kind)
            .bind(media_file_id)
            .bind(post.scheduled_at.into_db())
            .bind(post.created_by.try_into_db()?)
            .bind(now.into_db())
            .fetch_one(&self.pool)
            .await
            .map_err(|source| {
                if source.is_foreign_key_violation() {
                    err!(DbError::MissingChannel { channel_id })
                } else {
                    source.into()
                }
            })?;

        Ok(record.try_into_app()?)
    }

    #[instrument(skip(self))]
    pub(crate) async fn get(&self, id: i64) -> Result<Option<PostWithChannel>> {
        let query = format!("{POST_WITH_CHANNEL_SELECT} WHERE p.id = $1");

        let record: Option<PostWithChannelRecord> = sqlx::query_as(&query)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(record.try_into_app()?)
    }

    /// Posts waiting for publication, the soonest first
    #[instrument(skip(self))]
    pub(crate) async fn list_scheduled(
        &self,
        channel_id: Option<i64>,
    ) -> Result<Vec<PostWithChannel>> {
        let query = format!(
            "{POST_WITH_CHANNEL_SELECT}
            WHERE p.status = 'scheduled' AND ($1 IS NULL OR p.channel_id = $1)
            ORDER BY p.scheduled_at, p.id"
        );

        let records: Vec<PostWithChannelRecord> = sqlx::query_as(&query)
            .bind(channel_id)
            .fetch_all(&self.pool)
            .await?;

        Ok(records.try_into_app()?)
    }

    /// Scheduled posts whose time has come, the oldest first
    #[instrument(skip(self))]
    pub(crate) async fn list_due(
        &self,
        now: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<PostWithChannel>> {
        let query = format!(
            "{POST_WITH_CHANNEL_SELECT}
            WHERE p.status = 'scheduled' AND p.scheduled_at <= $1
            ORDER BY p.scheduled_at, p.id
            LIMIT $2"
        );

        let records: Vec<PostWithChannelRecord> = sqlx::query_as(&query)
            .bind(now.into_db())
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;

        Ok(records.try_into_app()?)
    }

    /// Atomically moves the post from `scheduled` to `publishing`.
    /// Only the caller that got `true` may send the post.
    #[instrument(skip(self))]
    pub(crate) async fn claim(&self, id: i64) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE posts SET status = 'publishing'
            WHERE id = $1 AND status = 'scheduled'",
        )
        .bind(id)
        .execute(&self.pool)
        .await?;

        Ok(super::single_row_affected(result))
    }

    #[instrument(skip(self))]
    pub(crate) async fn mark_published(
        &self,
        id: i64,
        tg_message_id: MessageId,
        at: DateTime<Utc>,
    ) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE posts
            SET status = 'published', tg_message_id = $2, published_at = $3,
                attempts = attempts + 1, error = NULL
            WHERE id = $1 AND status = 'publishing'",
        )
        .bind(id)
        .bind(tg_message_id.into_db())
        .bind(at.into_db())
        .execute(&self.pool)
        .await?;

        Ok(super::single_row_affected(result))
    }

    #[instrument(skip(self))]
    pub(crate) async fn mark_failed(&self, id: i64, error: &str) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE posts
            SET status = 'error', error = $2, attempts = attempts + 1
            WHERE id = $1 AND status = 'publishing'",
        )
        .bind(id)
        .bind(error)
        .execute(&self.pool)
        .await?;

        Ok(super::single_row_affected(result))
    }

    /// Puts the post back into the queue after a transient failure
    #[instrument(skip(self))]
    pub(crate) async fn release(&self, id: i64, error: &str) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE posts
            SET status = 'scheduled', error = $2, attempts = attempts + 1
            WHERE id = $1 AND status = 'publishing'",
        )
        .bind(id)
        .bind(error)
        .execute(&self.pool)
        .await?;

        Ok(super::single_row_affected(result))
    }

    /// Posts left in `publishing` were being sent when the process died.
    /// We can't know whether Telegram received them, so they are never
    /// resent automatically.
    #[instrument(skip(self))]
    pub(crate) async fn fail_interrupted(&self) -> Result<u64> {
        let result = sqlx::query(
            "UPDATE posts SET status = 'error', error = 'interrupted'
            WHERE status = 'publishing'",
        )
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    /// Deletes a post that wasn't published yet. Non-admins may delete
    /// only their own posts.
    #[instrument(skip(self))]
    pub(crate) async fn cancel(&self, id: i64, requested_by: UserId, is_admin: bool) -> Result<bool> {
        let result = sqlx::query(
            "DELETE FROM posts
            WHERE id = $1 AND status = 'scheduled' AND ($3 OR created_by = $2)",
        )
        .bind(id)
        .bind(requested_by.try_into_db()?)
        .bind(is_admin)
        .execute(&self.pool)
        .await?;

        Ok(super::single_row_affected(result))
    }

    #[instrument(skip(self))]
    pub(crate) async fn next_scheduled(&self) -> Result<Option<DateTime<Utc>>> {
        let next: Option<i64> =
            sqlx::query_scalar("SELECT MIN(scheduled_at) FROM posts WHERE status = 'scheduled'")
                .fetch_one(&self.pool)
                .await?;

        Ok(next.try_into_app()?)
    }

    #[instrument(skip(self))]
    pub(crate) async fn count_scheduled(&self) -> Result<i64> {
        let count = sqlx::query_scalar("SELECT COUNT(*) FROM posts WHERE status = 'scheduled'")
            .fetch_one(&self.pool)
            .await?;

        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{self, DeleteChannelOutcome};

    fn at(hour: u32, min: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 12, 25, hour, min, 0).unwrap()
    }

    fn text_post(channel_id: i64, scheduled_at: DateTime<Utc>) -> NewPost {
        NewPost {
            channel_id,
            text: Some("Hello".to_owned()),
            media: None,
            scheduled_at,
            created_by: UserId(7),
        }
    }

    #[test_log::test(tokio::test)]
    async fn create_in_missing_channel() {
        let db = db::init_test().await;

        let err = db.posts.create(text_post(42, at(12, 0)), at(11, 0)).await.unwrap_err();

        expect_test::expect!["Channel with id 42 doesn't exist anymore"]
            .assert_eq(&err.kind().to_string());
    }

    #[test_log::test(tokio::test)]
    async fn create_and_read_back() {
        let db = db::init_test().await;
        let channel = db::add_test_channel(&db, -100_1).await;

        let post = db
            .posts
            .create(
                NewPost {
                    media: Some(Media {
                        kind: MediaKind::Photo,
                        file_id: "file-1".to_owned(),
                    }),
                    ..text_post(channel.id, at(15, 0))
                },
                at(12, 0),
            )
            .await
            .unwrap();

        assert_eq!(post.status, PostStatus::Scheduled);
        assert_eq!(post.attempts, 0);
        assert_eq!(post.created_by, UserId(7));

        let loaded = db.posts.get(post.id).await.unwrap().unwrap();
        assert_eq!(loaded.channel_tg_chat_id, ChatId(-100_1));
        assert_eq!(loaded.channel_title, "Test channel");
        assert_eq!(
            loaded.post.media,
            Some(Media {
                kind: MediaKind::Photo,
                file_id: "file-1".to_owned()
            })
        );
        assert_eq!(loaded.post.scheduled_at, at(15, 0));
    }

    #[test_log::test(tokio::test)]
    async fn post_without_content_is_rejected() {
        let db = db::init_test().await;
        let channel = db::add_test_channel(&db, -100_1).await;

        let result = db
            .posts
            .create(
                NewPost {
                    text: None,
                    ..text_post(channel.id, at(15, 0))
                },
                at(12, 0),
            )
            .await;

        assert!(result.is_err());
    }

    #[test_log::test(tokio::test)]
    async fn due_posts_are_claimed_once() {
        let db = db::init_test().await;
        let channel = db::add_test_channel(&db, -100_1).await;

        let late = db.posts.create(text_post(channel.id, at(14, 0)), at(12, 0)).await.unwrap();
        let early = db.posts.create(text_post(channel.id, at(13, 0)), at(12, 0)).await.unwrap();
        let future = db.posts.create(text_post(channel.id, at(18, 0)), at(12, 0)).await.unwrap();

        let due: Vec<_> = db
            .posts
            .list_due(at(14, 0), 10)
            .await
            .unwrap()
            .into_iter()
            .map(|post| post.post.id)
            .collect();

        assert_eq!(due, [early.id, late.id]);

        assert!(db.posts.claim(early.id).await.unwrap());
        assert!(!db.posts.claim(early.id).await.unwrap());

        let due = db.posts.list_due(at(14, 0), 10).await.unwrap();
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].post.id, late.id);

        assert!(!db.posts.claim(future.id + 100).await.unwrap());
    }

    #[test_log::test(tokio::test)]
    async fn publishing_lifecycle() {
        let db = db::init_test().await;
        let channel = db::add_test_channel(&db, -100_1).await;

        let post = db.posts.create(text_post(channel.id, at(13, 0)), at(12, 0)).await.unwrap();

        // Can't finish a post that wasn't claimed
        assert!(!db.posts.mark_published(post.id, MessageId(5), at(13, 0)).await.unwrap());

        assert!(db.posts.claim(post.id).await.unwrap());
        assert!(db.posts.release(post.id, "network").await.unwrap());

        let released = db.posts.get(post.id).await.unwrap().unwrap().post;
        assert_eq!(released.status, PostStatus::Scheduled);
        assert_eq!(released.attempts, 1);
        assert_eq!(released.error.as_deref(), Some("network"));

        assert!(db.posts.claim(post.id).await.unwrap());
        assert!(db.posts.mark_published(post.id, MessageId(5), at(13, 1)).await.unwrap());

        let published = db.posts.get(post.id).await.unwrap().unwrap().post;
        assert_eq!(published.status, PostStatus::Published);
        assert_eq!(published.tg_message_id, Some(MessageId(5)));
        assert_eq!(published.published_at, Some(at(13, 1)));
        assert_eq!(published.error, None);

        assert_eq!(db.posts.count_scheduled().await.unwrap(), 0);
        assert_eq!(db.posts.next_scheduled().await.unwrap(), None);
    }

    #[test_log::test(tokio::test)]
    async fn interrupted_posts_are_never_resent() {
        let db = db::init_test().await;
        let channel = db::add_test_channel(&db, -100_1).await;

        let post = db.posts.create(text_post(channel.id, at(13, 0)), at(12, 0)).await.unwrap();
        let other = db.posts.create(text_post(channel.id, at(13, 0)), at(12, 0)).await.unwrap();

        assert!(db.posts.claim(post.id).await.unwrap());

        assert_eq!(db.posts.fail_interrupted().await.unwrap(), 1);

        let failed = db.posts.get(post.id).await.unwrap().unwrap().post;
        assert_eq!(failed.status, PostStatus::Error);
        assert_eq!(failed.error.as_deref(), Some("interrupted"));

        let due: Vec<_> = db
            .posts
            .list_due(at(14, 0), 10)
            .await
            .unwrap()
            .into_iter()
            .map(|post| post.post.id)
            .collect();

        assert_eq!(due, [other.id]);
    }

    #[test_log::test(tokio::test)]
    async fn cancel_respects_ownership() {
        let db = db::init_test().await;
        let channel = db::add_test_channel(&db, -100_1).await;

        let post = db.posts.create(text_post(channel.id, at(13, 0)), at(12, 0)).await.unwrap();

        assert!(!db.posts.cancel(post.id, UserId(8), false).await.unwrap());
        assert!(db.posts.cancel(post.id, UserId(7), false).await.unwrap());

        let post = db.posts.create(text_post(channel.id, at(13, 0)), at(12, 0)).await.unwrap();
        assert!(db.posts.cancel(post.id, UserId(8), true).await.unwrap());

        assert!(db.posts.get(post.id).await.unwrap().is_none());
    }

    #[test_log::test(tokio::test)]
    async fn scheduled_listing_and_stats() {
        let db = db::init_test().await;
        let first = db::add_test_channel(&db, -100_1).await;
        let second = db::add_test_channel(&db, -100_2).await;

        db.posts.create(text_post(second.id, at(16, 0)), at(12, 0)).await.unwrap();
        db.posts.create(text_post(first.id, at(15, 0)), at(12, 0)).await.unwrap();

        let all = db.posts.list_scheduled(None).await.unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].post.channel_id, first.id);

        let filtered = db.posts.list_scheduled(Some(second.id)).await.unwrap();
        assert_eq!(filtered.len(), 1);
        assert_eq!(filtered[0].post.channel_id, second.id);

        assert_eq!(db.posts.count_scheduled().await.unwrap(), 2);
        assert_eq!(db.posts.next_scheduled().await.unwrap(), Some(at(15, 0)));
    }

    #[test_log::test(tokio::test)]
    async fn channel_with_pending_posts_is_not_deleted() {
        let db = db::init_test().await;
        let channel = db::add_test_channel(&db, -100_1).await;

        let post = db.posts.create(text_post(channel.id, at(13, 0)), at(12, 0)).await.unwrap();

        let outcome = db.channels.delete(channel.id).await.unwrap();
        assert_eq!(outcome, DeleteChannelOutcome::HasPendingPosts { count: 1 });

        assert!(db.posts.claim(post.id).await.unwrap());
        assert!(db.posts.mark_published(post.id, MessageId(1), at(13, 0)).await.unwrap());

        let outcome = db.channels.delete(channel.id).await.unwrap();
        assert_eq!(outcome, DeleteChannelOutcome::Deleted);

        // The history of the channel goes away with it
        assert!(db.posts.get(post.id).await.unwrap().is_none());
    }
}
