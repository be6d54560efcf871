mod access;
mod config;
mod db;
mod error;
mod http;
mod observability;
mod payments;
mod publisher;
mod server;
mod tg;
mod time;

pub mod util;

pub use crate::error::*;
pub use config::*;
pub use observability::*;

#[allow(unused_imports)]
mod prelude {
    pub(crate) use crate::error::prelude::*;
    pub(crate) use crate::http::prelude::*;
    pub(crate) use crate::observability::logging::prelude::*;
    pub(crate) use crate::util::prelude::*;
}

use chrono::prelude::*;
use crate::prelude::*;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Runs the bot, the publisher and the payment webhooks server until Ctrl+C
pub async fn run(config: Config) -> Result<()> {
    let db = db::init(config.db)
        .with_duration_log("Initialized the database")
        .await?;

    let db = Arc::new(db);

    db.admins.seed(&config.tg.admin_ids).await?;

    let interrupted = db.posts.fail_interrupted().await?;
    if interrupted > 0 {
        warn!(
            interrupted,
            "Some posts were being sent when the bot stopped last time. \
            They were marked as failed and won't be resent automatically"
        );
    }

    let bot = tg::create_bot(&config.tg);
    let http = http::create_client()?;

    let payments = Arc::new(payments::PaymentService::new(
        config.payments,
        db.clone(),
        bot.clone(),
        http,
    ));

    let ctx = Arc::new(tg::Ctx {
        bot: bot.clone(),
        db: db.clone(),
        cfg: Arc::new(config.tg),
        payments: payments.clone(),
        started_at: Utc::now(),
    });

    let shutdown = CancellationToken::new();

    let publisher = publisher::Publisher::new(config.publisher, bot, db);

    // The dispatcher handles Ctrl+C on its own, the rest of the
    // services are stopped once it exits
    let bot_task = async {
        let result = tg::run_bot(ctx).await;
        shutdown.cancel();
        result
    };

    futures::try_join!(
        bot_task,
        publisher.run(shutdown.clone()),
        server::run(config.http, payments, shutdown.clone()),
    )?;

    Ok(())
}
