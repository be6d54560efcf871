//! Telegram commands root module

mod cmd;
mod config;
mod wizard;

use crate::prelude::*;
use crate::{access, db, payments, Result};
use chrono::prelude::*;
use dptree::di::DependencyMap;
use std::sync::Arc;
use teloxide::adaptors::{CacheMe, DefaultParseMode, Throttle, Trace};
use teloxide::dispatching::dialogue::{Dialogue, InMemStorage};
use teloxide::dispatching::{HandlerExt, UpdateFilterExt};
use teloxide::prelude::*;
use teloxide::types::ParseMode;

pub(crate) use cmd::CommandError;
pub(crate) use config::*;
pub(crate) use wizard::DialogueState;

pub(crate) type Bot = Trace<CacheMe<DefaultParseMode<Throttle<teloxide::Bot>>>>;

pub(crate) type WizardDialogue = Dialogue<DialogueState, InMemStorage<DialogueState>>;

pub(crate) struct Ctx {
    pub(crate) bot: Bot,
    pub(crate) db: Arc<db::Repo>,
    pub(crate) cfg: Arc<Config>,
    pub(crate) payments: Arc<payments::PaymentService>,
    pub(crate) started_at: DateTime<Utc>,
}

pub(crate) fn create_bot(cfg: &Config) -> Bot {
    adapt_bot(teloxide::Bot::new(&cfg.bot_token))
}

/// Bot that fails every request right away without reaching Telegram
#[cfg(test)]
pub(crate) fn create_offline_bot() -> Bot {
    let api_url = "http://127.0.0.1:1/".parse().unwrap();
    adapt_bot(teloxide::Bot::new("0:offline").set_api_url(api_url))
}

fn adapt_bot(bot: teloxide::Bot) -> Bot {
    bot.throttle(Default::default())
        .parse_mode(ParseMode::MarkdownV2)
        .cache_me()
        .trace(teloxide::adaptors::trace::Settings::all())
}

/// Runs the long polling loop until Ctrl+C
pub(crate) async fn run_bot(ctx: Arc<Ctx>) -> Result {
    let bot = ctx.bot.clone();

    let mut di = DependencyMap::new();
    di.insert(ctx);
    di.insert(InMemStorage::<DialogueState>::new());

    info!("Starting bot...");

    let handler = dptree::entry()
        .inspect(|update: Update| {
            metrics::counter!("tg_updates_total", "kind" => update.kind.discriminator())
                .increment(1);
        })
        .branch(
            Update::filter_message()
                .enter_dialogue::<Message, InMemStorage<DialogueState>, DialogueState>()
                .branch(
                    dptree::entry()
                        .filter_command::<cmd::regular::Cmd>()
                        .endpoint(cmd::handle::<cmd::regular::Cmd>()),
                )
                .branch(
                    dptree::entry()
                        .filter_command::<cmd::scheduler::Cmd>()
                        .branch(
                            dptree::filter_async(access::filter_scheduler)
                                .endpoint(cmd::handle::<cmd::scheduler::Cmd>()),
                        )
                        .endpoint(access::deny),
                )
                .branch(
                    dptree::entry()
                        .filter_command::<cmd::admin::Cmd>()
                        .branch(
                            dptree::filter_async(access::filter_admin)
                                .endpoint(cmd::handle::<cmd::admin::Cmd>()),
                        )
                        .endpoint(access::deny),
                )
                .branch(
                    dptree::filter(|state: DialogueState| state != DialogueState::Idle)
                        .endpoint(wizard::handle_message),
                ),
        )
        .branch(
            Update::filter_callback_query()
                .enter_dialogue::<CallbackQuery, InMemStorage<DialogueState>, DialogueState>()
                .endpoint(wizard::handle_callback_query),
        )
        .inspect(|update: Update| {
            metrics::counter!("tg_updates_skipped_total", "kind" => update.kind.discriminator())
                .increment(1);
        });

    Dispatcher::builder(bot, handler)
        .dependencies(di)
        // Messages outside of the wizard and unknown commands are ignored,
        // this noop handler suppresses the warning about unhandled updates
        .default_handler(|_| std::future::ready(()))
        .enable_ctrlc_handler()
        .build()
        .dispatch()
        .await;

    info!("Bot stopped");

    Ok(())
}
