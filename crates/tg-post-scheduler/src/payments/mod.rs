//! Selling premium access via crypto payment providers

mod amount;
mod crypto_bot;
mod crypto_cloud;
mod service;

use crate::config::from_env_or_panic;
use crate::db::Order;
use crate::Result;
use ::http::HeaderMap;
use async_trait::async_trait;
use serde::Deserialize;
use serde_with::{serde_as, DisplayFromStr};

pub(crate) use amount::*;
pub(crate) use service::*;

#[derive(
    Debug, Default, Clone, Copy, PartialEq, Eq, Deserialize, sqlx::Type, strum::Display,
)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub(crate) enum ProviderKind {
    /// Premium is granted by the admins by hand
    #[default]
    None,
    CryptoCloud,
    CryptoBot,
}

#[serde_as]
#[derive(Deserialize)]
pub(crate) struct Config {
    #[serde(default)]
    pub(crate) provider: ProviderKind,

    #[serde_as(as = "DisplayFromStr")]
    #[serde(default = "default_price_usd")]
    pub(crate) price_usd: UsdAmount,

    #[serde(default = "default_premium_days")]
    pub(crate) premium_days: u32,

    #[serde(skip)]
    pub(crate) provider_cfg: ProviderConfig,
}

fn default_price_usd() -> UsdAmount {
    UsdAmount::from_cents(500)
}

fn default_premium_days() -> u32 {
    30
}

/// Credentials of the selected provider. Only the selected provider's
/// environment variables are required to be present.
#[derive(Default)]
pub(crate) enum ProviderConfig {
    #[default]
    None,
    CryptoCloud(crypto_cloud::Config),
    CryptoBot(crypto_bot::Config),
}

impl Config {
    pub(crate) fn load_or_panic() -> Self {
        let mut config: Self = from_env_or_panic("PAYMENTS_");

        config.provider_cfg = match config.provider {
            ProviderKind::None => ProviderConfig::None,
            ProviderKind::CryptoCloud => {
                ProviderConfig::CryptoCloud(from_env_or_panic("CRYPTO_CLOUD_"))
            }
            ProviderKind::CryptoBot => ProviderConfig::CryptoBot(from_env_or_panic("CRYPTO_BOT_")),
        };

        config
    }
}

/// Invoice issued by the provider for an order
#[derive(Debug, Clone)]
pub(crate) struct Invoice {
    pub(crate) pay_url: String,
    pub(crate) external_id: String,
}

/// The way the provider refers to the order in its webhook
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum OrderRef {
    /// Our own order id that we passed to the provider
    OrderId(String),

    /// Id of the invoice on the provider side
    ExternalId(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum InvoiceStatus {
    Paid,
    Failed,

    /// Any intermediate status that we don't act upon
    Other(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct WebhookEvent {
    pub(crate) order: OrderRef,
    pub(crate) status: InvoiceStatus,
}

#[async_trait]
pub(crate) trait PaymentProvider: Send + Sync {
    fn kind(&self) -> ProviderKind;

    async fn create_invoice(&self, order: &Order) -> Result<Invoice>;

    /// Authenticates the webhook and extracts the invoice status update from it
    fn parse_webhook(&self, headers: &HeaderMap, body: &[u8]) -> Result<WebhookEvent>;
}

#[derive(Debug, thiserror::Error)]
pub(crate) enum PaymentError {
    #[error("Payment provider `{kind}` is not configured")]
    ProviderNotConfigured { kind: ProviderKind },

    #[error("Payment provider `{kind}` rejected the invoice: {message}")]
    InvoiceRejected { kind: ProviderKind, message: String },

    #[error("Order referenced by the webhook was not found: {order:?}")]
    UnknownOrder { order: OrderRef },

    #[error("Webhook signature header `{header}` is missing")]
    MissingSignature { header: &'static str },

    #[error("Webhook signature doesn't match the body")]
    InvalidSignature,

    #[error("Webhook security key doesn't match the configured secret")]
    InvalidSecret,

    #[error("Webhook body is not a valid JSON of the expected shape")]
    MalformedWebhook { source: serde_json::Error },

    #[error("Webhook doesn't reference any order")]
    MissingOrderReference,
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use crate::{db, tg};
    use std::sync::Arc;

    pub(crate) use super::crypto_bot::test_signature as crypto_bot_signature;

    /// Service that accepts the Crypto Pay webhooks signed with
    /// [`crypto_bot_signature`]
    pub(crate) fn crypto_bot_service(db: Arc<db::Repo>, bot: tg::Bot) -> PaymentService {
        let cfg = Config {
            provider: ProviderKind::CryptoBot,
            price_usd: default_price_usd(),
            premium_days: default_premium_days(),
            provider_cfg: ProviderConfig::CryptoBot(crypto_bot::test_config()),
        };
        let http = reqwest_middleware::ClientBuilder::new(reqwest::Client::new()).build();

        PaymentService::new(cfg, db, bot, http)
    }
}
