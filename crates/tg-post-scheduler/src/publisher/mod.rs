//! Background loop that delivers the due posts to their channels

mod config;

use crate::db::{self, MediaKind, PostWithChannel};
use crate::prelude::*;
use crate::util::retry::{self, Retry};
use crate::{tg, Result};
use async_trait::async_trait;
use chrono::prelude::*;
use retry_policies::policies::ExponentialBackoff;
use std::sync::Arc;
use std::time::Duration;
use teloxide::prelude::*;
use teloxide::types::{ChatId, InputFile, MessageId};
use teloxide::utils::markdown;
use teloxide::RequestError;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

pub(crate) use config::*;

/// Upper bound on the number of posts sent during a single tick.
/// The rest of them wait for the next tick.
const DUE_BATCH_SIZE: u32 = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FailureAction {
    /// Put the post back into the queue for the next tick
    Release,

    /// Give up on the post
    Fail,
}

/// `attempts` is the number of ticks that already tried to send the post
/// before the current one
fn failure_action(retry: Retry, attempts: i64, max_attempts: u32) -> FailureAction {
    if retry != Retry::Never && attempts + 1 < i64::from(max_attempts) {
        FailureAction::Release
    } else {
        FailureAction::Fail
    }
}

/// The post text is taken as is from the user, so it's escaped for
/// MarkdownV2 that the bot uses by default
fn escaped_text(post: &PostWithChannel) -> Option<String> {
    post.post.text.as_deref().map(markdown::escape)
}

fn send_retry_policy() -> ExponentialBackoff {
    ExponentialBackoff::builder()
        .retry_bounds(Duration::from_secs(1), Duration::from_secs(10))
        .build_with_max_retries(3)
}

/// The Telegram side of the publishing
#[async_trait]
trait Delivery: Send + Sync {
    async fn send(&self, post: &PostWithChannel) -> Result<MessageId, RequestError>;

    /// Sends a plain text message to the author of the post
    async fn notify_author(&self, post: &PostWithChannel, text: &str) -> Result<(), RequestError>;
}

#[async_trait]
impl Delivery for tg::Bot {
    async fn send(&self, post: &PostWithChannel) -> Result<MessageId, RequestError> {
        let chat_id = post.channel_tg_chat_id;
        let text = escaped_text(post);

        let Some(media) = &post.post.media else {
            let msg = self.send_message(chat_id, text.unwrap_or_default()).await?;
            return Ok(msg.id);
        };

        let file = InputFile::file_id(media.file_id.clone());

        let msg = match media.kind {
            MediaKind::Photo => {
                let request = self.send_photo(chat_id, file);
                match text {
                    Some(caption) => request.caption(caption).await?,
                    None => request.await?,
                }
            }
            MediaKind::Video => {
                let request = self.send_video(chat_id, file);
                match text {
                    Some(caption) => request.caption(caption).await?,
                    None => request.await?,
                }
            }
        };

        Ok(msg.id)
    }

    async fn notify_author(&self, post: &PostWithChannel, text: &str) -> Result<(), RequestError> {
        self.send_message(ChatId::from(post.post.created_by), markdown::escape(text))
            .await?;
        Ok(())
    }
}

pub(crate) struct Publisher {
    cfg: Config,
    delivery: Box<dyn Delivery>,
    db: Arc<db::Repo>,
    send_retry_policy: ExponentialBackoff,
}

impl Publisher {
    pub(crate) fn new(cfg: Config, bot: tg::Bot, db: Arc<db::Repo>) -> Self {
        Self {
            cfg,
            delivery: Box::new(bot),
            db,
            send_retry_policy: send_retry_policy(),
        }
    }

    /// Polls the database for the due posts until the shutdown is requested.
    /// The tick that is in progress when that happens is finished first,
    /// so no post is left in the middle of sending.
    pub(crate) async fn run(self, shutdown: CancellationToken) -> Result {
        let poll_interval = self.cfg.poll_interval();

        let mut interval = tokio::time::interval(poll_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(
            poll_interval = tracing_duration(poll_interval),
            max_send_attempts = self.cfg.max_send_attempts,
            "Starting publisher..."
        );

        loop {
            tokio::select! {
                () = shutdown.cancelled() => break,
                _ = interval.tick() => {}
            }

            let (result, duration) = self
                .tick()
                .instrument(debug_span!("publisher_tick"))
                .with_duration()
                .await;

            metrics::histogram!("publisher_tick_duration_seconds").record(duration);

            if let Err(err) = result {
                error!(err = tracing_err(&err), "Publisher tick failed");
            }
        }

        info!("Publisher stopped");

        Ok(())
    }

    async fn tick(&self) -> Result {
        let due = self.db.posts.list_due(Utc::now(), DUE_BATCH_SIZE).await?;

        if due.is_empty() {
            return Ok(());
        }

        debug!(count = due.len(), "Found due posts");

        for post in due {
            let span = info_span!(
                "publish",
                post_id = post.post.id,
                channel = %post.channel_tg_chat_id,
            );
            self.publish(post).instrument(span).await?;
        }

        Ok(())
    }

    async fn publish(&self, post: PostWithChannel) -> Result {
        let id = post.post.id;

        if !self.db.posts.claim(id).await? {
            debug!("The post was claimed by someone else or cancelled");
            return Ok(());
        }

        let result = retry::retry(
            &self.send_retry_policy,
            || self.delivery.send(&post),
            retry::classify_tg_error,
        )
        .await;

        let err = match result {
            Ok(message_id) => {
                self.db
                    .posts
                    .mark_published(id, message_id, Utc::now())
                    .await?;
                metrics::counter!("posts_published_total").increment(1);
                info!(message_id = message_id.0, "Published the post");
                return Ok(());
            }
            Err(err) => err,
        };

        let error = err.to_string();

        let action = failure_action(
            retry::classify_tg_error(&err),
            post.post.attempts,
            self.cfg.max_send_attempts,
        );

        match action {
            FailureAction::Release => {
                self.db.posts.release(id, &error).await?;
                metrics::counter!("posts_released_total").increment(1);
                warn!(
                    err = tracing_err(&err),
                    attempts = post.post.attempts + 1,
                    "Failed to send the post, will try again on the next tick"
                );
            }
            FailureAction::Fail => {
                self.db.posts.mark_failed(id, &error).await?;
                metrics::counter!("posts_failed_total").increment(1);
                error!(err = tracing_err(&err), "Gave up on sending the post");
                self.notify_author(&post, &error).await;
            }
        }

        Ok(())
    }

    async fn notify_author(&self, post: &PostWithChannel, error: &str) {
        let text = format!(
            "❌ Не удалось опубликовать пост #{} в канал «{}»: {error}",
            post.post.id, post.channel_title,
        );

        if let Err(err) = self.delivery.notify_author(post, &text).await {
            warn!(
                user_id = %post.post.created_by,
                err = tracing_err(&err),
                "Failed to notify the author about the failed post"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{Media, NewPost, PostStatus};
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;
    use teloxide::types::UserId;
    use teloxide::ApiError;

    #[derive(Clone, Copy)]
    enum SendOutcome {
        Sent,
        Transient,
        Permanent,
    }

    #[derive(Default)]
    struct Calls {
        sends: AtomicU32,
        notifications: Mutex<Vec<String>>,
    }

    struct FakeDelivery {
        outcome: SendOutcome,
        calls: Arc<Calls>,
    }

    #[async_trait]
    impl Delivery for FakeDelivery {
        async fn send(&self, _post: &PostWithChannel) -> Result<MessageId, RequestError> {
            let attempt = self.calls.sends.fetch_add(1, Ordering::SeqCst);
            match self.outcome {
                SendOutcome::Sent => Ok(MessageId(100 + attempt as i32)),
                SendOutcome::Transient => {
                    Err(RequestError::Io(std::io::Error::other("connection reset")))
                }
                SendOutcome::Permanent => Err(RequestError::Api(ApiError::BotKicked)),
            }
        }

        async fn notify_author(
            &self,
            post: &PostWithChannel,
            text: &str,
        ) -> Result<(), RequestError> {
            let notification = format!("{}: {text}", post.post.created_by);
            self.calls.notifications.lock().unwrap().push(notification);
            Ok(())
        }
    }

    fn publisher(
        db: &Arc<db::Repo>,
        outcome: SendOutcome,
        max_send_attempts: u32,
    ) -> (Publisher, Arc<Calls>) {
        let calls = Arc::new(Calls::default());

        let publisher = Publisher {
            cfg: Config {
                poll_interval_secs: 30,
                max_send_attempts,
            },
            delivery: Box::new(FakeDelivery {
                outcome,
                calls: calls.clone(),
            }),
            db: db.clone(),
            send_retry_policy: ExponentialBackoff::builder()
                .retry_bounds(Duration::from_millis(1), Duration::from_millis(2))
                .build_with_max_retries(2),
        };

        (publisher, calls)
    }

    /// Creates a text post that is already due
    async fn due_post(db: &db::Repo) -> i64 {
        let channel = db::add_test_channel(db, -100_1).await;
        let now = Utc::now();

        let post = NewPost {
            channel_id: channel.id,
            text: Some("Hello".to_owned()),
            media: None,
            scheduled_at: now - chrono::Duration::minutes(1),
            created_by: UserId(7),
        };

        db.posts.create(post, now).await.unwrap().id
    }

    async fn post_status(db: &db::Repo, id: i64) -> db::Post {
        db.posts.get(id).await.unwrap().unwrap().post
    }

    #[test_log::test(tokio::test)]
    async fn due_post_is_published_once() {
        let db = Arc::new(db::init_test().await);
        let id = due_post(&db).await;
        let (publisher, calls) = publisher(&db, SendOutcome::Sent, 3);

        publisher.tick().await.unwrap();

        let post = post_status(&db, id).await;
        assert_eq!(post.status, PostStatus::Published);
        assert_eq!(post.tg_message_id, Some(MessageId(100)));
        assert_eq!(post.attempts, 1);
        assert!(post.published_at.is_some());

        publisher.tick().await.unwrap();

        assert_eq!(calls.sends.load(Ordering::SeqCst), 1);
        assert!(calls.notifications.lock().unwrap().is_empty());
    }

    #[test_log::test(tokio::test)]
    async fn transient_failure_is_released_then_failed() {
        let db = Arc::new(db::init_test().await);
        let id = due_post(&db).await;
        let (publisher, calls) = publisher(&db, SendOutcome::Transient, 2);

        publisher.tick().await.unwrap();

        // One attempt and two in-tick retries
        assert_eq!(calls.sends.load(Ordering::SeqCst), 3);

        let post = post_status(&db, id).await;
        assert_eq!(post.status, PostStatus::Scheduled);
        assert_eq!(post.attempts, 1);
        assert!(post.error.is_some());
        assert!(calls.notifications.lock().unwrap().is_empty());

        publisher.tick().await.unwrap();

        let post = post_status(&db, id).await;
        assert_eq!(post.status, PostStatus::Error);
        assert_eq!(post.attempts, 2);

        let notifications = calls.notifications.lock().unwrap();
        assert_eq!(notifications.len(), 1);
        assert!(
            notifications[0].starts_with(&format!(
                "7: ❌ Не удалось опубликовать пост #{id} в канал «Test channel»"
            )),
            "{notifications:?}"
        );
    }

    #[test_log::test(tokio::test)]
    async fn permanent_failure_fails_at_once() {
        let db = Arc::new(db::init_test().await);
        let id = due_post(&db).await;
        let (publisher, calls) = publisher(&db, SendOutcome::Permanent, 3);

        publisher.tick().await.unwrap();

        assert_eq!(calls.sends.load(Ordering::SeqCst), 1);

        let post = post_status(&db, id).await;
        assert_eq!(post.status, PostStatus::Error);
        assert_eq!(post.attempts, 1);
        assert_eq!(post.tg_message_id, None);

        assert_eq!(calls.notifications.lock().unwrap().len(), 1);

        // Failed posts are never picked up again
        publisher.tick().await.unwrap();
        assert_eq!(calls.sends.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn transient_failures_are_released_until_the_limit() {
        assert_eq!(failure_action(Retry::Backoff, 0, 3), FailureAction::Release);
        assert_eq!(failure_action(Retry::Backoff, 1, 3), FailureAction::Release);
        assert_eq!(failure_action(Retry::Backoff, 2, 3), FailureAction::Fail);
        assert_eq!(
            failure_action(Retry::After(Duration::from_secs(5)), 0, 3),
            FailureAction::Release
        );
    }

    #[test]
    fn permanent_failures_fail_at_once() {
        assert_eq!(failure_action(Retry::Never, 0, 3), FailureAction::Fail);
    }

    #[test]
    fn single_attempt_is_never_released() {
        assert_eq!(failure_action(Retry::Backoff, 0, 1), FailureAction::Fail);
    }

    #[test_log::test(tokio::test)]
    async fn due_post_text_is_escaped() {
        let db = db::init_test().await;
        let channel = db::add_test_channel(&db, -100_1).await;
        let now = Utc::now();

        let post = NewPost {
            channel_id: channel.id,
            text: Some("Sale -50%! (today)".to_owned()),
            media: Some(Media {
                kind: MediaKind::Photo,
                file_id: "file".to_owned(),
            }),
            scheduled_at: now - chrono::Duration::minutes(1),
            created_by: UserId(1),
        };
        db.posts.create(post, now).await.unwrap();

        let due = db.posts.list_due(now, DUE_BATCH_SIZE).await.unwrap();
        assert_eq!(due.len(), 1);

        expect_test::expect![[r#"Sale \-50%\! \(today\)"#]]
            .assert_eq(&escaped_text(&due[0]).unwrap());
    }
}
