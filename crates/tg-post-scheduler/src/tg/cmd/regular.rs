use crate::payments::Checkout;
use crate::prelude::*;
use crate::{access, tg, time, Result};
use async_trait::async_trait;
use chrono::prelude::*;
use teloxide::prelude::*;
use teloxide::types::{BotCommand, InlineKeyboardButton, ReplyMarkup};
use teloxide::utils::command::BotCommands;
use teloxide::utils::markdown;

#[derive(BotCommands, Clone, Debug)]
#[command(rename_rule = "snake_case", description = "Общие команды:")]
pub(crate) enum Cmd {
    #[command(description = "начать работу с ботом")]
    Start,

    #[command(description = "показать список команд")]
    Help,

    #[command(description = "купить Premium-доступ")]
    Buy,

    #[command(description = "показать срок действия Premium-доступа")]
    Premium,

    #[command(description = "отменить текущее действие")]
    Cancel,
}

#[async_trait]
impl tg::cmd::Command for Cmd {
    async fn handle(self, ctx: &tg::Ctx, msg: &Message, dialogue: &tg::WizardDialogue) -> Result {
        match self {
            Cmd::Start => start(ctx, msg).await?,
            Cmd::Help => help(ctx, msg).await?,
            Cmd::Buy => buy(ctx, msg).await?,
            Cmd::Premium => premium(ctx, msg).await?,
            Cmd::Cancel => {
                dialogue.exit().await?;
                ctx.bot.reply_plain(msg, "Действие отменено").await?;
            }
        }
        Ok(())
    }
}

/// Commands shown in the menu of the Telegram client
fn menu_commands() -> Vec<BotCommand> {
    Cmd::bot_commands()
        .into_iter()
        .chain(tg::cmd::scheduler::Cmd::bot_commands())
        .collect()
}

async fn start(ctx: &tg::Ctx, msg: &Message) -> Result {
    ctx.bot.set_my_commands(menu_commands()).await?;

    let name = msg
        .from()
        .map(|user| user.first_name.as_str())
        .unwrap_or("друг");

    let text = format!(
        "👋 Привет, {name}!\n\n\
        Я публикую посты в ваших Telegram-каналах по расписанию.\n\
        Текущее время: {} (МСК)\n\n\
        Список команд: /help",
        time::format_local(Utc::now()),
    );

    ctx.bot.reply_plain(msg, &text).await?;

    Ok(())
}

async fn help(ctx: &tg::Ctx, msg: &Message) -> Result {
    let mut sections = vec![Cmd::descriptions().to_string()];

    if let Some(user) = msg.from() {
        let now = Utc::now();
        if access::is_scheduler(&ctx.db, user.id, now).await? {
            sections.push(tg::cmd::scheduler::Cmd::descriptions().to_string());
        }
        if access::is_admin(&ctx.db, user.id).await? {
            sections.push(tg::cmd::admin::Cmd::descriptions().to_string());
        }
    }

    ctx.bot.reply_plain(msg, &sections.join("\n\n")).await?;

    Ok(())
}

async fn buy(ctx: &tg::Ctx, msg: &Message) -> Result {
    let Some(user) = msg.from() else {
        return Ok(());
    };

    let price = ctx.payments.price_usd();
    let days = ctx.payments.premium_days();

    let (order, pay_url) = match ctx.payments.create_checkout(user.id).await? {
        Checkout::Manual => {
            let text = format!(
                "💳 Premium-доступ на {days} дн. стоит ${price}.\n\
                Онлайн-оплата сейчас недоступна, для активации свяжитесь с администратором \
                и сообщите ему ваш ID: {}",
                user.id,
            );
            ctx.bot.reply_plain(msg, &text).await?;
            return Ok(());
        }
        Checkout::Invoice { order, pay_url } => (order, pay_url),
    };

    let pay_url = pay_url
        .parse()
        .fatal_ctx(|| format!("Payment provider returned an invalid url: {pay_url}"))?;

    let button = InlineKeyboardButton::url(format!("Оплатить ${price} ({days} дн.)"), pay_url);

    let text = format!(
        "💰 Создан счёт №{}.\nPremium-доступ на {days} дн. \
        Нажмите «Оплатить», доступ активируется автоматически после оплаты.",
        order.order_id,
    );

    ctx.bot
        .reply_md(msg, markdown::escape(&text))
        .reply_markup(ReplyMarkup::inline_kb([[button]]))
        .await?;

    Ok(())
}

async fn premium(ctx: &tg::Ctx, msg: &Message) -> Result {
    let Some(user) = msg.from() else {
        return Ok(());
    };

    let now = Utc::now();

    let text = match ctx.db.premium.get(user.id).await? {
        Some(premium) if premium.is_active(now) => format!(
            "⭐ Premium-доступ активен до {} (МСК)",
            time::format_local(premium.expires_at)
        ),
        Some(premium) => format!(
            "Premium-доступ истёк {} (МСК). Продлить: /buy",
            time::format_local(premium.expires_at)
        ),
        None => "У вас нет Premium-доступа. Купить: /buy".to_owned(),
    };

    ctx.bot.reply_plain(msg, &text).await?;

    Ok(())
}
