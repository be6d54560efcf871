pub(crate) mod admin;
pub(crate) mod regular;
pub(crate) mod scheduler;

use crate::prelude::*;
use crate::util::DynResult;
use crate::{err, tg, Error, Result};
use async_trait::async_trait;
use futures::future::BoxFuture;
use std::fmt;
use std::sync::Arc;
use teloxide::prelude::*;
use teloxide::types::{Message, User, UserId};
use teloxide::utils::markdown;

#[async_trait]
pub(crate) trait Command: fmt::Debug + Send + Sync + 'static {
    async fn handle(self, ctx: &tg::Ctx, msg: &Message, dialogue: &tg::WizardDialogue) -> Result;
}

pub(crate) fn handle<'a, C: Command>(
) -> impl Fn(Arc<tg::Ctx>, Message, tg::WizardDialogue, C) -> BoxFuture<'a, DynResult> {
    move |ctx, msg, dialogue, cmd| {
        let span = info_span!(
            "handle_command",
            sender = msg.from().map(User::debug_id).as_deref(),
            chat = %msg.chat.debug_id(),
            cmd = format_args!("{cmd:?}")
        );

        let fut = async move {
            debug!("Processing command");

            let result = cmd.handle(&ctx, &msg, &dialogue).await;
            if let Err(err) = &result {
                report_error(&ctx, &msg, err).await;
            }
            result.map_err(Into::into)
        };

        Box::pin(fut.instrument(span))
    }
}

/// Logs the error and shows it to the user in the chat where it happened.
/// The error id in the message allows finding the logs for it.
pub(crate) async fn report_error(ctx: &tg::Ctx, msg: &Message, err: &Error) {
    let span = warn_span!("err", err = tracing_err(err), id = err.id());
    async {
        if !err.is_user_error() {
            warn!("Handler returned an error");
        }

        let reply_msg = markdown::code_block(&err.display_chain().to_string());

        if let Err(err) = ctx.bot.reply_md(msg, reply_msg).await {
            warn!(
                err = tracing_err(&err),
                "Failed to reply with the error message to the user"
            );
        }
    }
    .instrument(span)
    .await;
}

/// Errors caused by the wrong input of the user
#[derive(Debug, thiserror::Error)]
pub(crate) enum CommandError {
    #[error("Не хватает аргументов. Использование: {usage}")]
    MissingArguments { usage: &'static str },

    #[error("`{input}` не является числовым идентификатором")]
    InvalidId { input: String },

    #[error("`{input}` не является количеством дней (ожидается число от 1 до 3650)")]
    InvalidDays { input: String },

    #[error("Канал с ID {id} не найден")]
    ChannelNotFound { id: i64 },

    #[error(
        "В канале ещё {count} запланированных постов. \
        Удалите их перед удалением канала"
    )]
    ChannelHasPendingPosts { count: i64 },

    #[error("Пост с ID {id} не найден среди запланированных ваших постов")]
    PostNotFound { id: i64 },

    #[error("Администратора {user_id} из конфигурации нельзя удалить через бота")]
    ConfigAdminRemoval { user_id: UserId },

    #[error("Чат `{chat}` не найден или бот не имеет к нему доступа")]
    ChatNotFound { chat: String },

    #[error("Чат `{title}` не является каналом")]
    NotAChannel { title: String },

    #[error(
        "Бот не является администратором канала `{title}` с правом \
        публикации сообщений"
    )]
    BotCannotPost { title: String },

    #[error("Вы не являетесь администратором канала `{title}`")]
    NotAChannelAdmin { title: String },

    #[error("Канал `{title}` уже добавлен другим пользователем")]
    ChannelOwnedByOther { title: String },

    #[error("Доступ к планированию постов истёк. Продлить Premium: /buy")]
    SchedulerAccessExpired,

    #[error("Ожидался текст, фото или видео")]
    UnsupportedContent,

    #[error("Ожидалось фото, видео или слово `skip`")]
    UnsupportedMedia,

    #[error(
        "Подпись к фото или видео не может быть длиннее {max} символов, \
        а в тексте поста их {len}. Сократите текст и начните заново, \
        либо отправьте `skip`, чтобы опубликовать пост без медиа"
    )]
    CaptionTooLong { len: usize, max: usize },
}

/// Parses a numeric id from the command argument
pub(crate) fn parse_id<T: std::str::FromStr>(input: &str) -> Result<T> {
    let input = input.trim();
    input.parse().map_err(|_| {
        err!(CommandError::InvalidId {
            input: input.to_owned()
        })
    })
}
