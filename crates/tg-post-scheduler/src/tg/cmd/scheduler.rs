use super::{parse_id, CommandError};
use crate::db::{DeleteChannelOutcome, Media, MediaKind};
use crate::prelude::*;
use crate::tg::wizard::{self, DialogueState};
use crate::util::display::human_duration;
use crate::{access, err, tg, time, Result};
use async_trait::async_trait;
use chrono::prelude::*;
use itertools::Itertools;
use teloxide::prelude::*;
use teloxide::types::{InlineKeyboardButton, ReplyMarkup};
use teloxide::utils::command::BotCommands;
use teloxide::utils::markdown;

/// How much of the post text to show in the list of posts
const TEXT_PREVIEW_CHARS: usize = 50;

#[derive(BotCommands, Clone, Debug)]
#[command(rename_rule = "snake_case", description = "Управление постами:")]
pub(crate) enum Cmd {
    #[command(description = "состояние бота и очереди публикаций")]
    Status,

    #[command(description = "добавить канал для публикаций")]
    AddChannel,

    #[command(description = "список каналов")]
    Channels,

    #[command(description = "удалить канал: /remove_channel <ID>")]
    RemoveChannel(String),

    #[command(description = "запланировать пост")]
    AddPost,

    #[command(description = "список запланированных постов")]
    Posts,

    #[command(description = "удалить запланированный пост: /delete_post <ID>")]
    DeletePost(String),
}

#[async_trait]
impl tg::cmd::Command for Cmd {
    async fn handle(self, ctx: &tg::Ctx, msg: &Message, dialogue: &tg::WizardDialogue) -> Result {
        match self {
            Cmd::Status => status(ctx, msg).await?,
            Cmd::AddChannel => {
                dialogue.update(DialogueState::AwaitingChannel).await?;
                ctx.bot
                    .reply_plain(
                        msg,
                        "Перешлите сюда любое сообщение из канала или отправьте его \
                        @username или числовой ID.\n\n\
                        Бот должен быть администратором канала с правом публикации сообщений.\n\
                        Отмена: /cancel",
                    )
                    .await?;
            }
            Cmd::Channels => channels(ctx, msg).await?,
            Cmd::RemoveChannel(id) => remove_channel(ctx, msg, &id).await?,
            Cmd::AddPost => add_post(ctx, msg, dialogue).await?,
            Cmd::Posts => posts(ctx, msg).await?,
            Cmd::DeletePost(id) => delete_post(ctx, msg, &id).await?,
        }
        Ok(())
    }
}

async fn status(ctx: &tg::Ctx, msg: &Message) -> Result {
    let now = Utc::now();

    let (channels, scheduled, next, premium) = futures::try_join!(
        ctx.db.channels.count(),
        ctx.db.posts.count_scheduled(),
        ctx.db.posts.next_scheduled(),
        ctx.db.premium.list_active(now),
    )?;

    let uptime = (now - ctx.started_at).to_std().unwrap_or_default();

    let next = next
        .map(|next| format!("{} (МСК)", time::format_local(next)))
        .unwrap_or_else(|| "нет".to_owned());

    let text = format!(
        "📊 Статус\n\n\
        Время: {} (МСК)\n\
        Аптайм: {}\n\
        Каналов: {channels}\n\
        Запланировано постов: {scheduled}\n\
        Следующая публикация: {next}\n\
        Пользователей с Premium: {}",
        time::format_local_seconds(now),
        human_duration(uptime),
        premium.len(),
    );

    ctx.bot.reply_plain(msg, &text).await?;

    Ok(())
}

async fn channels(ctx: &tg::Ctx, msg: &Message) -> Result {
    let Some(user) = msg.from() else {
        return Ok(());
    };

    let is_admin = access::is_admin(&ctx.db, user.id).await?;
    let channels = ctx.db.channels.list_for(user.id, is_admin).await?;

    if channels.is_empty() {
        ctx.bot
            .reply_plain(msg, "Каналов пока нет. Добавить: /add_channel")
            .await?;
        return Ok(());
    }

    let list = channels
        .iter()
        .map(|channel| {
            let username = channel
                .username
                .as_ref()
                .map(|username| format!(" @{username}"))
                .unwrap_or_default();

            format!(
                "{} {}{}",
                markdown::code_inline(&channel.id.to_string()),
                markdown::bold(&markdown::escape(&channel.title)),
                markdown::escape(&username),
            )
        })
        .join("\n");

    ctx.bot
        .reply_md(msg, format!("📢 Каналы:\n\n{list}"))
        .await?;

    Ok(())
}

async fn remove_channel(ctx: &tg::Ctx, msg: &Message, id: &str) -> Result {
    let Some(user) = msg.from() else {
        return Ok(());
    };

    if id.trim().is_empty() {
        return Err(err!(CommandError::MissingArguments {
            usage: "/remove_channel <ID>"
        }));
    }

    let id = parse_id(id)?;

    access::manageable_channel(&ctx.db, id, user.id).await?;

    match ctx.db.channels.delete(id).await? {
        DeleteChannelOutcome::Deleted => {
            info!(channel_id = id, "Removed a channel");
            ctx.bot.reply_plain(msg, "✅ Канал удалён").await?;
        }
        DeleteChannelOutcome::NotFound => {
            return Err(err!(CommandError::ChannelNotFound { id }));
        }
        DeleteChannelOutcome::HasPendingPosts { count } => {
            return Err(err!(CommandError::ChannelHasPendingPosts { count }));
        }
    }

    Ok(())
}

async fn add_post(ctx: &tg::Ctx, msg: &Message, dialogue: &tg::WizardDialogue) -> Result {
    let Some(user) = msg.from() else {
        return Ok(());
    };

    let is_admin = access::is_admin(&ctx.db, user.id).await?;
    let channels = ctx.db.channels.list_for(user.id, is_admin).await?;

    if channels.is_empty() {
        ctx.bot
            .reply_plain(msg, "Сначала добавьте канал: /add_channel")
            .await?;
        return Ok(());
    }

    let buttons = channels.iter().map(|channel| {
        [InlineKeyboardButton::callback(
            channel.title.clone(),
            wizard::channel_callback_data(channel.id),
        )]
    });

    dialogue.update(DialogueState::ChoosingChannel).await?;

    ctx.bot
        .reply_plain(msg, "Выберите канал для публикации:")
        .reply_markup(ReplyMarkup::inline_kb(buttons))
        .await?;

    Ok(())
}

async fn posts(ctx: &tg::Ctx, msg: &Message) -> Result {
    let Some(user) = msg.from() else {
        return Ok(());
    };

    let is_admin = access::is_admin(&ctx.db, user.id).await?;

    let posts: Vec<_> = ctx
        .db
        .posts
        .list_scheduled(None)
        .await?
        .into_iter()
        .filter(|entry| is_admin || entry.post.created_by == user.id)
        .collect();

    if posts.is_empty() {
        ctx.bot
            .reply_plain(msg, "Запланированных постов нет. Добавить: /add_post")
            .await?;
        return Ok(());
    }

    let list = posts
        .iter()
        .map(|entry| {
            let post = &entry.post;

            let media = match &post.media {
                Some(Media {
                    kind: MediaKind::Photo,
                    ..
                }) => "🖼 ",
                Some(Media {
                    kind: MediaKind::Video,
                    ..
                }) => "🎬 ",
                None => "",
            };

            let preview = post
                .text
                .as_deref()
                .map(text_preview)
                .unwrap_or_default();

            format!(
                "{} {} → {}\n{}",
                markdown::code_inline(&post.id.to_string()),
                markdown::escape(&time::format_local(post.scheduled_at)),
                markdown::bold(&markdown::escape(&entry.channel_title)),
                markdown::escape(&format!("{media}{preview}")),
            )
        })
        .join("\n\n");

    ctx.bot
        .reply_md(msg, format!("🗓 Запланированные посты \\(МСК\\):\n\n{list}"))
        .await?;

    Ok(())
}

fn text_preview(text: &str) -> String {
    let mut chars = text.chars();
    let preview: String = chars.by_ref().take(TEXT_PREVIEW_CHARS).collect();
    if chars.next().is_some() {
        format!("{preview}…")
    } else {
        preview
    }
}

async fn delete_post(ctx: &tg::Ctx, msg: &Message, id: &str) -> Result {
    let Some(user) = msg.from() else {
        return Ok(());
    };

    if id.trim().is_empty() {
        return Err(err!(CommandError::MissingArguments {
            usage: "/delete_post <ID>"
        }));
    }

    let id = parse_id(id)?;

    let is_admin = access::is_admin(&ctx.db, user.id).await?;

    if !ctx.db.posts.cancel(id, user.id, is_admin).await? {
        return Err(err!(CommandError::PostNotFound { id }));
    }

    info!(post_id = id, "Deleted a scheduled post");

    ctx.bot.reply_plain(msg, "✅ Пост удалён").await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn previews_are_truncated_by_chars() {
        assert_eq!(text_preview("short"), "short");

        let long = "я".repeat(TEXT_PREVIEW_CHARS + 1);
        let preview = text_preview(&long);

        assert_eq!(preview.chars().count(), TEXT_PREVIEW_CHARS + 1);
        assert!(preview.ends_with('…'));
    }
}
