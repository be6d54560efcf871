//! HTTP server that receives the payment notifications

use crate::error::ErrorKind;
use crate::payments::{PaymentError, PaymentService, ProviderKind};
use crate::prelude::*;
use crate::{Error, Result};
use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Deserialize)]
pub(crate) struct Config {
    #[serde(default = "default_listen_addr")]
    pub(crate) listen_addr: SocketAddr,
}

fn default_listen_addr() -> SocketAddr {
    ([0, 0, 0, 0], 8080).into()
}

type Reply = (StatusCode, Json<serde_json::Value>);

fn router(payments: Arc<PaymentService>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/webhooks/cryptocloud", post(crypto_cloud_webhook))
        .route("/webhooks/cryptobot", post(crypto_bot_webhook))
        .with_state(payments)
}

/// Serves the webhooks until the shutdown is requested
pub(crate) async fn run(
    cfg: Config,
    payments: Arc<PaymentService>,
    shutdown: CancellationToken,
) -> Result {
    let listener = tokio::net::TcpListener::bind(cfg.listen_addr)
        .await
        .fatal_ctx(|| format!("Failed to bind the HTTP server to {}", cfg.listen_addr))?;

    info!(listen_addr = %cfg.listen_addr, "HTTP server is listening");

    axum::serve(listener, router(payments))
        .with_graceful_shutdown(shutdown.cancelled_owned())
        .await
        .fatal_ctx(|| "HTTP server failed")?;

    info!("HTTP server stopped");

    Ok(())
}

async fn health() -> &'static str {
    "ok"
}

#[instrument(name = "webhook", skip_all, fields(provider = "crypto_cloud"))]
async fn crypto_cloud_webhook(
    State(payments): State<Arc<PaymentService>>,
    headers: HeaderMap,
    body: Bytes,
) -> Reply {
    handle_webhook(&payments, ProviderKind::CryptoCloud, &headers, &body).await
}

#[instrument(name = "webhook", skip_all, fields(provider = "crypto_bot"))]
async fn crypto_bot_webhook(
    State(payments): State<Arc<PaymentService>>,
    headers: HeaderMap,
    body: Bytes,
) -> Reply {
    handle_webhook(&payments, ProviderKind::CryptoBot, &headers, &body).await
}

async fn handle_webhook(
    payments: &PaymentService,
    kind: ProviderKind,
    headers: &HeaderMap,
    body: &[u8],
) -> Reply {
    match payments.handle_webhook(kind, headers, body).await {
        Ok(outcome) => {
            debug!(?outcome, "Processed the webhook");
            (StatusCode::OK, Json(json!({ "status": "ok" })))
        }
        Err(err) => {
            let status = status_code(&err);
            if status.is_server_error() {
                error!(err = tracing_err(&err), "Failed to process the webhook");
            } else {
                warn!(err = tracing_err(&err), %status, "Rejected the webhook");
            }

            let body = json!({
                "status": "error",
                "error": err.kind().to_string(),
                "id": err.id(),
            });

            (status, Json(body))
        }
    }
}

fn status_code(err: &Error) -> StatusCode {
    let ErrorKind::Payment { source } = err.kind() else {
        return StatusCode::INTERNAL_SERVER_ERROR;
    };

    match source {
        PaymentError::UnknownOrder { .. } | PaymentError::ProviderNotConfigured { .. } => {
            StatusCode::NOT_FOUND
        }
        PaymentError::MissingSignature { .. }
        | PaymentError::InvalidSignature
        | PaymentError::InvalidSecret => StatusCode::FORBIDDEN,
        PaymentError::MalformedWebhook { .. } | PaymentError::MissingOrderReference => {
            StatusCode::BAD_REQUEST
        }
        PaymentError::InvoiceRejected { .. } => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{NewOrder, OrderStatus};
    use crate::payments::{testing, OrderRef, UsdAmount};
    use crate::{db, err, tg};
    use axum::body::Body;
    use axum::http::Request;
    use chrono::prelude::*;
    use teloxide::types::UserId;
    use tower::ServiceExt as _;

    async fn app() -> (Arc<db::Repo>, Router) {
        let db = Arc::new(db::init_test().await);
        let payments = testing::crypto_bot_service(db.clone(), tg::create_offline_bot());
        (db, router(Arc::new(payments)))
    }

    async fn post_webhook(
        router: Router,
        path: &str,
        body: &str,
        signed: bool,
    ) -> (StatusCode, serde_json::Value) {
        let mut request = Request::builder().method("POST").uri(path);

        if signed {
            let (header, signature) = testing::crypto_bot_signature(body.as_bytes());
            request = request.header(header, signature);
        }

        let request = request.body(Body::from(body.to_owned())).unwrap();
        let response = router.oneshot(request).await.unwrap();

        let status = response.status();
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();

        (status, serde_json::from_slice(&body).unwrap())
    }

    fn paid_update(order_id: &str) -> String {
        json!({
            "update_id": 1,
            "update_type": "invoice_paid",
            "payload": { "invoice_id": 7, "status": "paid", "payload": order_id },
        })
        .to_string()
    }

    #[test_log::test(tokio::test)]
    async fn health_check() {
        let (_, router) = app().await;

        let request = Request::builder().uri("/health").body(Body::empty()).unwrap();
        let response = router.oneshot(request).await.unwrap();

        assert_eq!(response.status(), StatusCode::OK);

        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        assert_eq!(&body[..], b"ok");
    }

    #[test_log::test(tokio::test)]
    async fn signed_payment_activates_premium() {
        let (db, router) = app().await;

        let new_order = NewOrder {
            user_id: UserId(42),
            amount: UsdAmount::from_cents(500),
            provider: ProviderKind::CryptoBot,
        };
        let order = db.orders.create(new_order, Utc::now()).await.unwrap();

        let (status, body) = post_webhook(
            router,
            "/webhooks/cryptobot",
            &paid_update(&order.order_id),
            true,
        )
        .await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!({ "status": "ok" }));

        let order = db.orders.get(&order.order_id).await.unwrap().unwrap();
        assert_eq!(order.status, OrderStatus::Paid);
        assert!(db.premium.is_active(UserId(42), Utc::now()).await.unwrap());
    }

    #[test_log::test(tokio::test)]
    async fn rejected_webhooks() {
        let (_, router) = app().await;

        let (status, body) =
            post_webhook(router.clone(), "/webhooks/cryptobot", "{not json", true).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["status"], "error");

        let (status, _) = post_webhook(
            router.clone(),
            "/webhooks/cryptobot",
            &paid_update("o1"),
            false,
        )
        .await;
        assert_eq!(status, StatusCode::FORBIDDEN);

        let (status, body) =
            post_webhook(router.clone(), "/webhooks/cryptobot", &paid_update("o1"), true).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["status"], "error");

        // Only Crypto Pay is configured
        let (status, body) =
            post_webhook(router, "/webhooks/cryptocloud", &paid_update("o1"), true).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        expect_test::expect!["Payment provider `crypto_cloud` is not configured"]
            .assert_eq(body["error"].as_str().unwrap());
    }

    #[test]
    fn payment_errors_map_to_status_codes() {
        let cases = [
            (
                err!(PaymentError::UnknownOrder {
                    order: OrderRef::OrderId("x".to_owned())
                }),
                StatusCode::NOT_FOUND,
            ),
            (
                err!(PaymentError::ProviderNotConfigured {
                    kind: ProviderKind::CryptoBot
                }),
                StatusCode::NOT_FOUND,
            ),
            (err!(PaymentError::InvalidSignature), StatusCode::FORBIDDEN),
            (err!(PaymentError::InvalidSecret), StatusCode::FORBIDDEN),
            (
                err!(PaymentError::MissingSignature { header: "sig" }),
                StatusCode::FORBIDDEN,
            ),
            (
                err!(PaymentError::MalformedWebhook {
                    source: serde_json::from_str::<serde_json::Value>("{").unwrap_err()
                }),
                StatusCode::BAD_REQUEST,
            ),
            (
                err!(PaymentError::MissingOrderReference),
                StatusCode::BAD_REQUEST,
            ),
            (
                crate::fatal!("database is gone"),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
        ];

        for (err, expected) in cases {
            assert_eq!(status_code(&err), expected, "{err}");
        }
    }
}
