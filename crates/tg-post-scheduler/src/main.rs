use futures::prelude::*;
use std::panic::AssertUnwindSafe;
use std::process::ExitCode;
use tg_post_scheduler::tracing_err;
use tracing::error;

#[tokio::main]
async fn main() -> ExitCode {
    if dotenvy::dotenv().is_err() {
        eprintln!("Dotenv config was not found, ignoring this...")
    }

    let logging_task = tg_post_scheduler::init_logging();

    tg_post_scheduler::init_metrics();

    // Ctrl+C is handled inside of `run()`. It cancels the publisher and the
    // webhook server and lets the dispatcher finish the updates in flight.
    let exit_code = AssertUnwindSafe(async {
        let config = tg_post_scheduler::Config::load_or_panic();

        match tg_post_scheduler::run(config).await {
            Ok(()) => ExitCode::SUCCESS,
            Err(err) => {
                error!(err = tracing_err(&err), "Exitting with an error...");
                ExitCode::FAILURE
            }
        }
    })
    .catch_unwind()
    .await
    .unwrap_or_else(|_| {
        error!("Exitting due to a panic...");
        ExitCode::FAILURE
    });

    logging_task.shutdown().await;

    exit_code
}
