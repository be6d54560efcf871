use super::{parse_id, CommandError};
use crate::prelude::*;
use crate::{err, tg, time, Result};
use async_trait::async_trait;
use chrono::prelude::*;
use itertools::Itertools;
use teloxide::prelude::*;
use teloxide::types::{ChatId, UserId};
use teloxide::utils::command::BotCommands;
use teloxide::utils::markdown;

/// Upper bound for the manual premium grants, ~10 years
const MAX_GRANT_DAYS: u32 = 3650;

#[derive(BotCommands, Clone, Debug)]
#[command(rename_rule = "snake_case", description = "Команды администратора:")]
pub(crate) enum Cmd {
    #[command(description = "добавить администратора: /add_admin <user_id> [username]")]
    AddAdmin(String),

    #[command(description = "удалить администратора: /remove_admin <user_id>")]
    RemoveAdmin(String),

    #[command(description = "список администраторов")]
    Admins,

    #[command(description = "выдать Premium-доступ: /grant_premium <user_id> [дней]")]
    GrantPremium(String),

    #[command(description = "информация о версии бота")]
    Version,
}

#[async_trait]
impl tg::cmd::Command for Cmd {
    async fn handle(self, ctx: &tg::Ctx, msg: &Message, _dialogue: &tg::WizardDialogue) -> Result {
        match self {
            Cmd::AddAdmin(args) => add_admin(ctx, msg, &args).await?,
            Cmd::RemoveAdmin(args) => remove_admin(ctx, msg, &args).await?,
            Cmd::Admins => admins(ctx, msg).await?,
            Cmd::GrantPremium(args) => grant_premium(ctx, msg, &args).await?,
            Cmd::Version => version(ctx, msg).await?,
        }
        Ok(())
    }
}

fn parse_add_admin_args(args: &str) -> Result<(UserId, Option<String>)> {
    let mut args = args.split_whitespace();

    let user_id = args.next().ok_or_else(|| {
        err!(CommandError::MissingArguments {
            usage: "/add_admin <user_id> [username]"
        })
    })?;

    let username = args
        .next()
        .map(|username| username.trim_start_matches('@').to_owned());

    Ok((UserId(parse_id(user_id)?), username))
}

fn parse_grant_premium_args(args: &str, default_days: u32) -> Result<(UserId, u32)> {
    let mut args = args.split_whitespace();

    let user_id = args.next().ok_or_else(|| {
        err!(CommandError::MissingArguments {
            usage: "/grant_premium <user_id> [дней]"
        })
    })?;

    let days = match args.next() {
        None => default_days,
        Some(days) => days
            .parse()
            .ok()
            .filter(|days| (1..=MAX_GRANT_DAYS).contains(days))
            .ok_or_else(|| {
                err!(CommandError::InvalidDays {
                    input: days.to_owned()
                })
            })?,
    };

    Ok((UserId(parse_id(user_id)?), days))
}

async fn add_admin(ctx: &tg::Ctx, msg: &Message, args: &str) -> Result {
    let (user_id, username) = parse_add_admin_args(args)?;

    let username = username.or_else(|| {
        msg.reply_to_message()
            .and_then(|reply| reply.from())
            .filter(|user| user.id == user_id)
            .and_then(|user| user.username.clone())
    });

    if !ctx.db.admins.add(user_id, username.as_deref()).await? {
        ctx.bot
            .reply_plain(msg, &format!("Пользователь {user_id} уже администратор"))
            .await?;
        return Ok(());
    }

    info!(%user_id, ?username, "Added an admin");

    let who = match &username {
        Some(username) => format!("{user_id} (@{username})"),
        None => user_id.to_string(),
    };

    ctx.bot
        .reply_plain(msg, &format!("✅ Пользователь {who} добавлен в администраторы"))
        .await?;

    let notification = ctx
        .bot
        .send_message(
            ChatId::from(user_id),
            markdown::escape("🎉 Вы были назначены администратором бота! Команды: /help"),
        )
        .await;

    if let Err(err) = notification {
        warn!(
            %user_id,
            err = tracing_err(&err),
            "Failed to notify the new admin, they probably haven't started the bot yet"
        );
    }

    Ok(())
}

async fn remove_admin(ctx: &tg::Ctx, msg: &Message, args: &str) -> Result {
    let args = args.trim();

    if args.is_empty() {
        return Err(err!(CommandError::MissingArguments {
            usage: "/remove_admin <user_id>"
        }));
    }

    let user_id = UserId(parse_id(args)?);

    if ctx.cfg.is_config_admin(user_id) {
        return Err(err!(CommandError::ConfigAdminRemoval { user_id }));
    }

    let text = if ctx.db.admins.remove(user_id).await? {
        info!(%user_id, "Removed an admin");
        format!("✅ Пользователь {user_id} больше не администратор")
    } else {
        format!("Пользователь {user_id} не является администратором")
    };

    ctx.bot.reply_plain(msg, &text).await?;

    Ok(())
}

async fn admins(ctx: &tg::Ctx, msg: &Message) -> Result {
    let admins = ctx.db.admins.list().await?;

    let list = admins
        .iter()
        .map(|admin| {
            let username = admin
                .username
                .as_ref()
                .map(|username| format!(" @{username}"))
                .unwrap_or_default();

            format!(
                "{}{} с {}",
                markdown::code_inline(&admin.user_id.to_string()),
                markdown::escape(&username),
                markdown::escape(&time::format_local_date(admin.added_at)),
            )
        })
        .join("\n");

    ctx.bot
        .reply_md(msg, format!("👮 Администраторы:\n\n{list}"))
        .await?;

    Ok(())
}

async fn grant_premium(ctx: &tg::Ctx, msg: &Message, args: &str) -> Result {
    let (user_id, days) = parse_grant_premium_args(args, ctx.payments.premium_days())?;

    let expires_at = ctx.db.premium.extend(user_id, days, Utc::now()).await?;

    info!(%user_id, days, %expires_at, "Granted premium manually");

    metrics::counter!("premium_activations_total", "source" => "admin").increment(1);

    ctx.bot
        .reply_plain(
            msg,
            &format!(
                "✅ Premium-доступ пользователя {user_id} продлён на {days} дн. до {} (МСК)",
                time::format_local(expires_at),
            ),
        )
        .await?;

    ctx.payments.notify_activated(user_id, expires_at).await;

    Ok(())
}

async fn version(ctx: &tg::Ctx, msg: &Message) -> Result {
    /// Generate the key-value pairs with vergen metadata
    macro_rules! vergen_meta {
        ( $($meta_name:literal),* $(,)? ) => {
            [$( ($meta_name, env!(concat!("VERGEN_", $meta_name))) ),*]
        }
    }

    let meta = vergen_meta![
        "BUILD_TIMESTAMP",
        "RUSTC_CHANNEL",
        "RUSTC_COMMIT_DATE",
        "RUSTC_COMMIT_HASH",
        "RUSTC_HOST_TRIPLE",
        "RUSTC_LLVM_VERSION",
        "RUSTC_SEMVER",
        "CARGO_TARGET_TRIPLE",
        "CARGO_DEBUG",
        "CARGO_OPT_LEVEL",
    ];

    let meta = [("VERSION", env!("CARGO_PKG_VERSION"))]
        .into_iter()
        .chain(meta);

    let max_name_len = meta
        .clone()
        .map(|(name, _)| name.len())
        .max()
        .unwrap_or_default();

    let metadata = meta.format_with("\n", |(name, val), f| {
        let name = name.to_lowercase();
        f(&format_args!("{name:<max_name_len$} = {val}"))
    });

    ctx.bot
        .reply_md(msg, markdown::code_block(&metadata.to_string()))
        .await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use expect_test::{expect, Expect};

    #[track_caller]
    fn assert_grant_args(args: &str, expected: Expect) {
        let actual = match parse_grant_premium_args(args, 30) {
            Ok((user_id, days)) => format!("{user_id}: {days}"),
            Err(err) => format!("Err: {}", err.kind()),
        };
        expected.assert_eq(&actual);
    }

    #[test]
    fn grant_premium_args() {
        assert_grant_args("42", expect!["42: 30"]);
        assert_grant_args(" 42   7 ", expect!["42: 7"]);
        assert_grant_args(
            "",
            expect!["Err: Не хватает аргументов. Использование: /grant_premium <user_id> [дней]"],
        );
        assert_grant_args(
            "42 0",
            expect!["Err: `0` не является количеством дней (ожидается число от 1 до 3650)"],
        );
        assert_grant_args(
            "42 many",
            expect!["Err: `many` не является количеством дней (ожидается число от 1 до 3650)"],
        );
        assert_grant_args(
            "@user",
            expect!["Err: `@user` не является числовым идентификатором"],
        );
    }

    #[test]
    fn add_admin_args() {
        let (user_id, username) = parse_add_admin_args("42 @alice").unwrap();
        assert_eq!(user_id, UserId(42));
        assert_eq!(username.as_deref(), Some("alice"));

        let (user_id, username) = parse_add_admin_args("42").unwrap();
        assert_eq!(user_id, UserId(42));
        assert_eq!(username, None);

        assert!(parse_add_admin_args("  ").unwrap_err().is_user_error());
    }
}
