//! Multi-message flows for adding channels and posts. The current stage
//! of every chat lives in memory and is lost on restart.

use crate::db::{Media, MediaKind, NewChannel, NewPost};
use crate::prelude::*;
use crate::tg::cmd::{report_error, CommandError};
use crate::util::DynResult;
use crate::{access, err, tg, time, Result};
use chrono::prelude::*;
use std::sync::Arc;
use teloxide::prelude::*;
use teloxide::types::{
    CallbackQuery, Chat, ChatId, ChatMemberKind, Message, Recipient, User, UserId,
};
use teloxide::utils::markdown;

const CHANNEL_CALLBACK_PREFIX: &str = "channel:";

/// Words that mean "publish the text without media"
const SKIP_MEDIA_WORDS: &[&str] = &["skip", "нет", "-"];

/// Telegram limit for the caption of a photo or a video
const MAX_CAPTION_CHARS: usize = 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ChannelChoice {
    pub(crate) id: i64,
    pub(crate) title: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Draft {
    pub(crate) text: Option<String>,
    pub(crate) media: Option<Media>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) enum DialogueState {
    #[default]
    Idle,
    AwaitingChannel,
    ChoosingChannel,
    AwaitingContent {
        channel: ChannelChoice,
    },
    AwaitingMedia {
        channel: ChannelChoice,
        text: String,
    },
    AwaitingTime {
        channel: ChannelChoice,
        draft: Draft,
    },
}

/// Content extracted from a user's message
#[derive(Debug, Clone, PartialEq, Eq)]
enum Content {
    Text(String),
    Media {
        media: Media,
        caption: Option<String>,
    },
    Unsupported,
}

impl Content {
    fn of(msg: &Message) -> Self {
        let caption = msg.caption().map(ToOwned::to_owned);

        // Telegram sends several sizes of the same photo, the last is the largest
        if let Some(photo) = msg.photo().and_then(|sizes| sizes.last()) {
            let media = Media {
                kind: MediaKind::Photo,
                file_id: photo.file.id.clone(),
            };
            return Self::Media { media, caption };
        }

        if let Some(video) = msg.video() {
            let media = Media {
                kind: MediaKind::Video,
                file_id: video.file.id.clone(),
            };
            return Self::Media { media, caption };
        }

        match msg.text() {
            Some(text) => Self::Text(text.to_owned()),
            None => Self::Unsupported,
        }
    }
}

pub(crate) fn channel_callback_data(channel_id: i64) -> String {
    format!("{CHANNEL_CALLBACK_PREFIX}{channel_id}")
}

fn parse_channel_callback_data(data: &str) -> Option<i64> {
    data.strip_prefix(CHANNEL_CALLBACK_PREFIX)?.parse().ok()
}

fn is_skip_word(text: &str) -> bool {
    let text = text.trim().to_lowercase();
    SKIP_MEDIA_WORDS.contains(&text.as_str())
}

/// Where the wizard goes after the user has sent the post content
fn after_content(channel: ChannelChoice, content: Content) -> Result<DialogueState> {
    match content {
        Content::Text(text) => Ok(DialogueState::AwaitingMedia { channel, text }),
        Content::Media { media, caption } => Ok(DialogueState::AwaitingTime {
            channel,
            draft: Draft {
                text: caption,
                media: Some(media),
            },
        }),
        Content::Unsupported => Err(err!(CommandError::UnsupportedContent)),
    }
}

/// Where the wizard goes after the user has sent the media for a text post.
/// The caption of the media is ignored in favour of the text sent before.
/// The text becomes the caption, so it must fit into the caption limit.
fn after_media(channel: ChannelChoice, text: String, content: Content) -> Result<DialogueState> {
    let media = match content {
        Content::Media { media, .. } => Some(media),
        Content::Text(reply) if is_skip_word(&reply) => None,
        Content::Text(_) | Content::Unsupported => {
            return Err(err!(CommandError::UnsupportedMedia))
        }
    };

    let len = text.chars().count();
    if media.is_some() && len > MAX_CAPTION_CHARS {
        return Err(err!(CommandError::CaptionTooLong {
            len,
            max: MAX_CAPTION_CHARS,
        }));
    }

    Ok(DialogueState::AwaitingTime {
        channel,
        draft: Draft {
            text: Some(text),
            media,
        },
    })
}

fn time_prompt() -> String {
    format!(
        "Когда опубликовать? Отправьте время по Москве в формате \
        ГГГГ-ММ-ДД ЧЧ:ММ или ДД.ММ.ГГГГ ЧЧ:ММ.\nСейчас: {} (МСК)",
        time::format_local(Utc::now()),
    )
}

pub(crate) async fn handle_message(
    ctx: Arc<tg::Ctx>,
    msg: Message,
    dialogue: tg::WizardDialogue,
    state: DialogueState,
) -> DynResult {
    let span = info_span!(
        "handle_wizard_message",
        sender = msg.from().map(User::debug_id).as_deref(),
        chat = %msg.chat.debug_id(),
        ?state,
    );

    async {
        let result = handle_stage(&ctx, &msg, &dialogue, state).await;
        if let Err(err) = &result {
            report_error(&ctx, &msg, err).await;
        }
        result.map_err(Into::into)
    }
    .instrument(span)
    .await
}

async fn handle_stage(
    ctx: &tg::Ctx,
    msg: &Message,
    dialogue: &tg::WizardDialogue,
    state: DialogueState,
) -> Result {
    match state {
        DialogueState::Idle => {}
        DialogueState::AwaitingChannel => add_channel(ctx, msg, dialogue).await?,
        DialogueState::ChoosingChannel => {
            ctx.bot
                .reply_plain(msg, "Выберите канал кнопкой выше или отмените: /cancel")
                .await?;
        }
        DialogueState::AwaitingContent { channel } => {
            let next = after_content(channel, Content::of(msg))?;

            let prompt = match &next {
                DialogueState::AwaitingMedia { .. } => {
                    "Теперь отправьте фото или видео для поста, \
                    либо слово skip, чтобы опубликовать только текст"
                        .to_owned()
                }
                _ => time_prompt(),
            };

            dialogue.update(next).await?;
            ctx.bot.reply_plain(msg, &prompt).await?;
        }
        DialogueState::AwaitingMedia { channel, text } => {
            let next = after_media(channel, text, Content::of(msg))?;
            dialogue.update(next).await?;
            ctx.bot.reply_plain(msg, &time_prompt()).await?;
        }
        DialogueState::AwaitingTime { channel, draft } => {
            schedule_post(ctx, msg, dialogue, channel, draft).await?;
        }
    }
    Ok(())
}

async fn add_channel(ctx: &tg::Ctx, msg: &Message, dialogue: &tg::WizardDialogue) -> Result {
    let Some(user) = msg.from() else {
        return Ok(());
    };

    let chat = resolve_channel(ctx, msg).await?;

    let title = chat.title().unwrap_or("{untitled}");

    let is_channel_admin = member_kind(ctx, &chat, user.id)
        .await
        .is_some_and(|kind| is_chat_admin(&kind));

    if !is_channel_admin {
        return Err(err!(CommandError::NotAChannelAdmin {
            title: title.to_owned()
        }));
    }

    ensure_bot_can_post(ctx, &chat).await?;

    let channel = NewChannel {
        tg_chat_id: chat.id,
        title,
        username: chat.username(),
        added_by: user.id,
    };

    let channel = ctx.db.channels.upsert(channel, Utc::now()).await?;

    let is_admin = access::is_admin(&ctx.db, user.id).await?;
    if !channel.is_manageable_by(user.id, is_admin) {
        return Err(err!(CommandError::ChannelOwnedByOther {
            title: channel.title
        }));
    }

    info!(channel = %chat.debug_id(), channel_id = channel.id, "Added a channel");

    dialogue.exit().await?;

    ctx.bot
        .reply_plain(
            msg,
            &format!(
                "✅ Канал «{}» добавлен (ID {}). Запланировать пост: /add_post",
                channel.title, channel.id
            ),
        )
        .await?;

    Ok(())
}

/// Finds the channel the user pointed to with a forwarded message,
/// a numeric chat id or a `@username`
async fn resolve_channel(ctx: &tg::Ctx, msg: &Message) -> Result<Chat> {
    if let Some(chat) = msg.forward_from_chat() {
        if !chat.is_channel() {
            return Err(err!(CommandError::NotAChannel {
                title: chat.title().unwrap_or_default().to_owned()
            }));
        }
        // The forwarded copy of the chat lacks some info, so it's refetched
        return fetch_chat(ctx, Recipient::Id(chat.id), &chat.id.to_string()).await;
    }

    let input = msg.text().unwrap_or_default().trim();

    let recipient = if let Ok(id) = input.parse::<i64>() {
        Recipient::Id(ChatId(id))
    } else if input.starts_with('@') && input.len() > 1 {
        Recipient::ChannelUsername(input.to_owned())
    } else {
        return Err(err!(CommandError::ChatNotFound {
            chat: input.to_owned()
        }));
    };

    let chat = fetch_chat(ctx, recipient, input).await?;

    if !chat.is_channel() {
        return Err(err!(CommandError::NotAChannel {
            title: chat.title().unwrap_or(input).to_owned()
        }));
    }

    Ok(chat)
}

async fn fetch_chat(ctx: &tg::Ctx, recipient: Recipient, input: &str) -> Result<Chat> {
    ctx.bot.get_chat(recipient).await.map_err(|source| {
        info!(err = tracing_err(&source), "Couldn't get the chat");
        err!(CommandError::ChatNotFound {
            chat: input.to_owned()
        })
    })
}

/// Only the channel owner and administrators may add the channel to the bot
fn is_chat_admin(kind: &ChatMemberKind) -> bool {
    matches!(
        kind,
        ChatMemberKind::Owner(_) | ChatMemberKind::Administrator(_)
    )
}

fn can_post_messages(kind: &ChatMemberKind) -> bool {
    match kind {
        ChatMemberKind::Owner(_) => true,
        ChatMemberKind::Administrator(admin) => admin.can_post_messages,
        _ => false,
    }
}

/// `None` if the membership couldn't be fetched
async fn member_kind(ctx: &tg::Ctx, chat: &Chat, user_id: UserId) -> Option<ChatMemberKind> {
    match ctx.bot.get_chat_member(chat.id, user_id).await {
        Ok(member) => Some(member.kind),
        Err(err) => {
            info!(
                %user_id,
                err = tracing_err(&err),
                "Couldn't get the chat membership"
            );
            None
        }
    }
}

async fn ensure_bot_can_post(ctx: &tg::Ctx, chat: &Chat) -> Result {
    let me = ctx.bot.get_me().await?;

    let can_post = member_kind(ctx, chat, me.id)
        .await
        .is_some_and(|kind| can_post_messages(&kind));

    if !can_post {
        return Err(err!(CommandError::BotCannotPost {
            title: chat.title().unwrap_or_default().to_owned()
        }));
    }

    Ok(())
}

async fn schedule_post(
    ctx: &tg::Ctx,
    msg: &Message,
    dialogue: &tg::WizardDialogue,
    channel: ChannelChoice,
    draft: Draft,
) -> Result {
    let Some(user) = msg.from() else {
        return Ok(());
    };

    let scheduled_at = time::parse_local_datetime(msg.text().unwrap_or_default(), Utc::now())?;

    // The premium may have expired or the channel may have been removed
    // while the user was composing the post
    let still_allowed = async {
        access::ensure_scheduler(&ctx.db, user.id, Utc::now()).await?;
        access::manageable_channel(&ctx.db, channel.id, user.id).await
    };

    if let Err(err) = still_allowed.await {
        dialogue.exit().await?;
        return Err(err);
    }

    let post = NewPost {
        channel_id: channel.id,
        text: draft.text,
        media: draft.media,
        scheduled_at,
        created_by: user.id,
    };

    let post = ctx.db.posts.create(post, Utc::now()).await?;

    info!(post_id = post.id, %scheduled_at, "Scheduled a post");

    dialogue.exit().await?;

    let text = format!(
        "✅ Пост #{} запланирован в канал «{}» на {} (МСК)",
        post.id,
        channel.title,
        time::format_local(scheduled_at),
    );

    ctx.bot.reply_plain(msg, &text).await?;

    Ok(())
}

pub(crate) async fn handle_callback_query(
    ctx: Arc<tg::Ctx>,
    query: CallbackQuery,
    dialogue: tg::WizardDialogue,
    state: DialogueState,
) -> DynResult {
    let span = info_span!(
        "handle_callback_query",
        sender = %query.from.debug_id(),
        data = query.data.as_deref(),
        ?state,
    );

    async {
        // Stop the loading animation on the button in any case
        if let Err(err) = ctx.bot.answer_callback_query(query.id.clone()).await {
            warn!(err = tracing_err(&err), "Failed to answer the callback query");
        }

        let Some(msg) = &query.message else {
            warn!("Received a callback query without a message");
            return Ok(());
        };

        let result = choose_channel(
            &ctx,
            msg,
            &dialogue,
            &query.from,
            state,
            query.data.as_deref(),
        )
        .await;

        if let Err(err) = &result {
            report_error(&ctx, msg, err).await;
        }

        result.map_err(Into::into)
    }
    .instrument(span)
    .await
}

async fn choose_channel(
    ctx: &tg::Ctx,
    msg: &Message,
    dialogue: &tg::WizardDialogue,
    user: &User,
    state: DialogueState,
    data: Option<&str>,
) -> Result {
    if state != DialogueState::ChoosingChannel {
        debug!("Ignoring a stale channel button");
        return Ok(());
    }

    let Some(id) = data.and_then(parse_channel_callback_data) else {
        warn!("Received unexpected callback data");
        return Ok(());
    };

    let channel = access::manageable_channel(&ctx.db, id, user.id).await?;

    let channel = ChannelChoice {
        id: channel.id,
        title: channel.title,
    };

    let text = format!(
        "Канал: {}\n\n{}",
        markdown::bold(&markdown::escape(&channel.title)),
        markdown::escape(
            "Отправьте текст поста, либо фото или видео с подписью. Отмена: /cancel"
        ),
    );

    dialogue
        .update(DialogueState::AwaitingContent { channel })
        .await?;

    ctx.bot.send_message(msg.chat.id, text).await?;

    Ok(())
}
