//! [Crypto Pay](https://help.crypt.bot/crypto-pay-api) invoices and webhooks

use super::{
    Invoice, InvoiceStatus, OrderRef, PaymentError, PaymentProvider, ProviderKind, WebhookEvent,
};
use crate::db::Order;
use crate::prelude::*;
use crate::{err, err_ctx, http, Result};
use ::http::HeaderMap;
use async_trait::async_trait;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use url::Url;

type HmacSha256 = Hmac<Sha256>;

const SIGNATURE_HEADER: &str = "crypto-pay-api-signature";

#[derive(Deserialize)]
pub(crate) struct Config {
    token: String,

    /// Crypto assets the user may pay with, comma-separated
    #[serde(default = "default_asset")]
    asset: String,

    #[serde(default = "default_api_url")]
    api_url: Url,
}

fn default_asset() -> String {
    "USDT".to_owned()
}

fn default_api_url() -> Url {
    "https://pay.crypt.bot/api/"
        .parse()
        .unwrap_or_else(|err| panic!("BUG: invalid default Crypto Pay url: {err}"))
}

pub(crate) struct CryptoBot {
    cfg: Config,
    http: http::Client,

    /// Shown to the user on the invoice page
    description: String,
}

#[derive(Serialize)]
struct CreateInvoiceRequest<'a> {
    currency_type: &'a str,
    fiat: &'a str,
    accepted_assets: &'a str,
    amount: String,
    description: &'a str,
    payload: &'a str,
}

#[derive(Deserialize)]
struct ApiResponse<T> {
    ok: bool,
    result: Option<T>,

    #[serde(default)]
    error: serde_json::Value,
}

#[derive(Deserialize)]
struct CreatedInvoice {
    invoice_id: i64,
    bot_invoice_url: String,
}

#[derive(Deserialize)]
struct WebhookUpdate {
    update_type: String,
    payload: WebhookInvoice,
}

#[derive(Deserialize)]
struct WebhookInvoice {
    invoice_id: Option<i64>,
    status: String,

    /// Arbitrary data attached to the invoice, we put the order id there
    payload: Option<String>,
}

impl CryptoBot {
    pub(crate) fn new(cfg: Config, http: http::Client, description: String) -> Self {
        Self {
            cfg,
            http,
            description,
        }
    }
}

#[async_trait]
impl PaymentProvider for CryptoBot {
    fn kind(&self) -> ProviderKind {
        ProviderKind::CryptoBot
    }

    #[instrument(skip_all, fields(order_id = %order.order_id))]
    async fn create_invoice(&self, order: &Order) -> Result<Invoice> {
        let url = self
            .cfg
            .api_url
            .join("createInvoice")
            .fatal_ctx(|| "Failed to build Crypto Pay invoice url")?;

        let request = CreateInvoiceRequest {
            currency_type: "fiat",
            fiat: "USD",
            accepted_assets: &self.cfg.asset,
            amount: order.amount.to_string(),
            description: &self.description,
            payload: &order.order_id,
        };

        let response: ApiResponse<CreatedInvoice> = self
            .http
            .post(url)
            .header("Crypto-Pay-API-Token", &self.cfg.token)
            .send_and_read_json(request)
            .await?;

        let invoice = match response.result {
            Some(invoice) if response.ok => invoice,
            _ => {
                return Err(err!(PaymentError::InvoiceRejected {
                    kind: ProviderKind::CryptoBot,
                    message: response.error.to_string(),
                }))
            }
        };

        Ok(Invoice {
            pay_url: invoice.bot_invoice_url,
            external_id: invoice.invoice_id.to_string(),
        })
    }

    fn parse_webhook(&self, headers: &HeaderMap, body: &[u8]) -> Result<WebhookEvent> {
        let signature = headers
            .get(SIGNATURE_HEADER)
            .and_then(|value| value.to_str().ok())
            .ok_or_else(|| {
                err!(PaymentError::MissingSignature {
                    header: SIGNATURE_HEADER
                })
            })?;

        if !verify_signature(&self.cfg.token, body, signature) {
            return Err(err!(PaymentError::InvalidSignature));
        }

        let update: WebhookUpdate =
            serde_json::from_slice(body).map_err(err_ctx!(PaymentError::MalformedWebhook))?;

        parse_update(update)
    }
}

fn parse_update(update: WebhookUpdate) -> Result<WebhookEvent> {
    let invoice = update.payload;

    let order = match (invoice.payload, invoice.invoice_id) {
        (Some(order_id), _) => OrderRef::OrderId(order_id),
        (None, Some(invoice_id)) => OrderRef::ExternalId(invoice_id.to_string()),
        (None, None) => return Err(err!(PaymentError::MissingOrderReference)),
    };

    let status = match (update.update_type.as_str(), invoice.status.as_str()) {
        ("invoice_paid", "paid") => InvoiceStatus::Paid,
        (_, "expired") => InvoiceStatus::Failed,
        (update_type, status) => InvoiceStatus::Other(format!("{update_type}/{status}")),
    };

    Ok(WebhookEvent { order, status })
}

/// The signature is a hex HMAC-SHA256 of the raw body, where the key
/// is the SHA256 of the API token.
fn verify_signature(token: &str, body: &[u8], signature: &str) -> bool {
    let Ok(expected) = hex::decode(signature) else {
        return false;
    };

    let secret = Sha256::digest(token.as_bytes());

    let Ok(mut mac) = HmacSha256::new_from_slice(&secret) else {
        return false;
    };

    mac.update(body);
    mac.verify_slice(&expected).is_ok()
}

#[cfg(test)]
pub(crate) const TEST_TOKEN: &str = "1234:AAA";

#[cfg(test)]
pub(crate) fn test_config() -> Config {
    Config {
        token: TEST_TOKEN.to_owned(),
        asset: default_asset(),
        api_url: default_api_url(),
    }
}

/// Header with the signature of the body made with [`TEST_TOKEN`]
#[cfg(test)]
pub(crate) fn test_signature(body: &[u8]) -> (&'static str, String) {
    (SIGNATURE_HEADER, sign(TEST_TOKEN, body))
}

#[cfg(test)]
fn sign(token: &str, body: &[u8]) -> String {
    let secret = Sha256::digest(token.as_bytes());
    let mut mac = HmacSha256::new_from_slice(&secret).unwrap();
    mac.update(body);
    hex::encode(mac.finalize().into_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;
    use expect_test::{expect, Expect};

    const TOKEN: &str = TEST_TOKEN;

    fn provider() -> CryptoBot {
        let http = reqwest_middleware::ClientBuilder::new(reqwest::Client::new()).build();
        CryptoBot::new(test_config(), http, "Premium".to_owned())
    }

    #[track_caller]
    fn assert_webhook(body: &str, signature: Option<&str>, expected: Expect) {
        let mut headers = HeaderMap::new();
        if let Some(signature) = signature {
            headers.insert(SIGNATURE_HEADER, signature.parse().unwrap());
        }

        let actual = match provider().parse_webhook(&headers, body.as_bytes()) {
            Ok(event) => format!("{event:?}"),
            Err(err) => format!("Err: {}", err.kind()),
        };
        expected.assert_eq(&actual);
    }

    #[track_caller]
    fn assert_signed_webhook(body: &str, expected: Expect) {
        assert_webhook(body, Some(&sign(TOKEN, body.as_bytes())), expected);
    }

    #[test]
    fn signature_verification() {
        let signature = sign(TOKEN, b"body");

        assert!(verify_signature(TOKEN, b"body", &signature));
        assert!(!verify_signature(TOKEN, b"tampered", &signature));
        assert!(!verify_signature("other:token", b"body", &signature));
        assert!(!verify_signature(TOKEN, b"body", "not hex"));
    }

    #[test]
    fn webhooks() {
        assert_signed_webhook(
            r#"{"update_id": 1, "update_type": "invoice_paid", "payload": {"invoice_id": 42, "status": "paid", "payload": "o1"}}"#,
            expect![[r#"WebhookEvent { order: OrderId("o1"), status: Paid }"#]],
        );
        assert_signed_webhook(
            r#"{"update_type": "invoice_paid", "payload": {"invoice_id": 42, "status": "paid"}}"#,
            expect![[r#"WebhookEvent { order: ExternalId("42"), status: Paid }"#]],
        );
        assert_signed_webhook(
            r#"{"update_type": "invoice_paid", "payload": {"invoice_id": 42, "status": "active", "payload": "o1"}}"#,
            expect![[r#"WebhookEvent { order: OrderId("o1"), status: Other("invoice_paid/active") }"#]],
        );
        assert_signed_webhook(
            r#"{"update_type": "invoice_paid", "payload": {"status": "paid"}}"#,
            expect!["Err: Webhook doesn't reference any order"],
        );
        assert_signed_webhook(
            r#"{"update_type": "invoice_paid"}"#,
            expect!["Err: Webhook body is not a valid JSON of the expected shape"],
        );
    }

    #[test]
    fn unsigned_webhooks() {
        let body = r#"{"update_type": "invoice_paid", "payload": {"invoice_id": 42, "status": "paid", "payload": "o1"}}"#;

        assert_webhook(
            body,
            None,
            expect!["Err: Webhook signature header `crypto-pay-api-signature` is missing"],
        );
        assert_webhook(
            body,
            Some(&sign("other:token", body.as_bytes())),
            expect!["Err: Webhook signature doesn't match the body"],
        );
    }
}
