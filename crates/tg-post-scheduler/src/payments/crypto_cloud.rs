//! [CryptoCloud](https://cryptocloud.plus) invoices and postbacks

use super::{
    Invoice, InvoiceStatus, OrderRef, PaymentError, PaymentProvider, ProviderKind, WebhookEvent,
};
use crate::db::Order;
use crate::prelude::*;
use crate::{err, err_ctx, http, Result};
use ::http::HeaderMap;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use url::Url;

#[derive(Deserialize)]
pub(crate) struct Config {
    api_key: String,
    shop_id: String,
    webhook_secret: String,

    #[serde(default = "default_api_url")]
    api_url: Url,
}

fn default_api_url() -> Url {
    "https://api.cryptocloud.plus/v2/"
        .parse()
        .unwrap_or_else(|err| panic!("BUG: invalid default CryptoCloud url: {err}"))
}

pub(crate) struct CryptoCloud {
    cfg: Config,
    http: http::Client,
}

#[derive(Serialize)]
struct CreateInvoiceRequest<'a> {
    amount: f64,
    shop_id: &'a str,
    currency: &'a str,
    order_id: &'a str,
}

#[derive(Deserialize)]
struct CreateInvoiceResponse {
    status: String,

    /// The shape of this object differs between success and error responses
    #[serde(default)]
    result: serde_json::Value,
}

#[derive(Deserialize)]
struct CreatedInvoice {
    uuid: String,
    link: String,
}

#[derive(Debug, Deserialize)]
struct Postback {
    status: String,
    invoice_id: Option<String>,
    order_id: Option<String>,
    security: Option<String>,
}

impl CryptoCloud {
    pub(crate) fn new(cfg: Config, http: http::Client) -> Self {
        Self { cfg, http }
    }
}

#[async_trait]
impl PaymentProvider for CryptoCloud {
    fn kind(&self) -> ProviderKind {
        ProviderKind::CryptoCloud
    }

    #[instrument(skip_all, fields(order_id = %order.order_id))]
    async fn create_invoice(&self, order: &Order) -> Result<Invoice> {
        let url = self
            .cfg
            .api_url
            .join("invoice/create")
            .fatal_ctx(|| "Failed to build CryptoCloud invoice url")?;

        let request = CreateInvoiceRequest {
            amount: order.amount.as_f64(),
            shop_id: &self.cfg.shop_id,
            currency: "USD",
            order_id: &order.order_id,
        };

        let response: CreateInvoiceResponse = self
            .http
            .post(url)
            .header("Authorization", format!("Token {}", self.cfg.api_key))
            .send_and_read_json(request)
            .await?;

        if response.status != "success" {
            return Err(err!(PaymentError::InvoiceRejected {
                kind: ProviderKind::CryptoCloud,
                message: response.result.to_string(),
            }));
        }

        let invoice: CreatedInvoice = serde_json::from_value(response.result)
            .map_err(err_ctx!(http::HttpClientError::UnexpectedResponseJsonShape))?;

        Ok(Invoice {
            pay_url: invoice.link,
            external_id: invoice.uuid,
        })
    }

    fn parse_webhook(&self, _headers: &HeaderMap, body: &[u8]) -> Result<WebhookEvent> {
        let postback: Postback =
            serde_json::from_slice(body).map_err(err_ctx!(PaymentError::MalformedWebhook))?;

        if postback.security.as_deref() != Some(self.cfg.webhook_secret.as_str()) {
            return Err(err!(PaymentError::InvalidSecret));
        }

        parse_postback(postback)
    }
}

fn parse_postback(postback: Postback) -> Result<WebhookEvent> {
    let order = match (postback.order_id, postback.invoice_id) {
        (Some(order_id), _) => OrderRef::OrderId(order_id),
        (None, Some(invoice_id)) => OrderRef::ExternalId(external_invoice_id(&invoice_id)),
        (None, None) => return Err(err!(PaymentError::MissingOrderReference)),
    };

    let status = match postback.status.as_str() {
        "success" | "paid" => InvoiceStatus::Paid,
        "fail" | "failed" | "error" | "canceled" | "cancelled" => InvoiceStatus::Failed,
        _ => InvoiceStatus::Other(postback.status),
    };

    Ok(WebhookEvent { order, status })
}

/// Invoices are created with an `INV-` prefixed uuid, but the postback
/// mentions the invoice id without the prefix.
fn external_invoice_id(invoice_id: &str) -> String {
    if invoice_id.starts_with("INV-") {
        invoice_id.to_owned()
    } else {
        format!("INV-{invoice_id}")
    }
}
