//! Who is allowed to run which commands

use crate::prelude::*;
use crate::tg::CommandError;
use crate::util::DynResult;
use crate::{db, err, tg, Result};
use chrono::prelude::*;
use std::sync::Arc;
use teloxide::prelude::*;
use teloxide::types::{User, UserId};

pub(crate) async fn is_admin(db: &db::Repo, user_id: UserId) -> Result<bool> {
    db.admins.contains(user_id).await
}

/// Schedulers are the users allowed to manage channels and posts:
/// the admins and everyone with an active premium.
pub(crate) async fn is_scheduler(db: &db::Repo, user_id: UserId, now: DateTime<Utc>) -> Result<bool> {
    Ok(is_admin(db, user_id).await? || db.premium.is_active(user_id, now).await?)
}

/// Like [`is_scheduler`], but for the flows that span several messages,
/// during which the premium may expire
pub(crate) async fn ensure_scheduler(db: &db::Repo, user_id: UserId, now: DateTime<Utc>) -> Result {
    if !is_scheduler(db, user_id, now).await? {
        return Err(err!(CommandError::SchedulerAccessExpired));
    }
    Ok(())
}

/// Loads the channel if the user may manage it. Channels of other users
/// are reported as missing, so their ids don't leak.
pub(crate) async fn manageable_channel(
    db: &db::Repo,
    channel_id: i64,
    user_id: UserId,
) -> Result<db::Channel> {
    let is_admin = is_admin(db, user_id).await?;

    db.channels
        .get(channel_id)
        .await?
        .filter(|channel| channel.is_manageable_by(user_id, is_admin))
        .ok_or_else(|| err!(CommandError::ChannelNotFound { id: channel_id }))
}

pub(crate) async fn filter_admin(ctx: Arc<tg::Ctx>, msg: Message) -> bool {
    filter(&msg, |user_id| is_admin(&ctx.db, user_id)).await
}

pub(crate) async fn filter_scheduler(ctx: Arc<tg::Ctx>, msg: Message) -> bool {
    filter(&msg, |user_id| is_scheduler(&ctx.db, user_id, Utc::now())).await
}

#[instrument(skip_all, fields(user = msg.from().map(User::debug_id).as_deref()))]
async fn filter<Fut>(msg: &Message, check: impl FnOnce(UserId) -> Fut) -> bool
where
    Fut: std::future::Future<Output = Result<bool>>,
{
    let Some(user) = msg.from() else {
        return false;
    };

    check(user.id).await.unwrap_or_else(|err| {
        error!(
            err = tracing_err(&err),
            "Couldn't check the user's access, conservatively denying it"
        );
        false
    })
}

/// Reply to a gated command sent by a user without access
pub(crate) async fn deny(ctx: Arc<tg::Ctx>, msg: Message) -> DynResult {
    info!(
        user = msg.from().map(User::debug_id).as_deref(),
        "Denied access to a command"
    );

    ctx.bot
        .reply_plain(
            &msg,
            "❌ У вас нет доступа к этой команде. Используйте /buy, чтобы получить Premium-доступ.",
        )
        .await?;

    Ok(())
}
