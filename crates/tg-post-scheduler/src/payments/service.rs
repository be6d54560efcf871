use super::{
    crypto_bot, crypto_cloud, Config, InvoiceStatus, OrderRef, PaymentError, PaymentProvider,
    ProviderConfig, ProviderKind, UsdAmount, WebhookEvent,
};
use crate::db::{NewOrder, Order, OrderStatus};
use crate::prelude::*;
use crate::{db, err, http, tg, time, Result};
use ::http::HeaderMap;
use chrono::prelude::*;
use std::sync::Arc;
use teloxide::prelude::*;
use teloxide::types::{ChatId, UserId};
use teloxide::utils::markdown;

/// What the user should do to get premium
#[derive(Debug)]
pub(crate) enum Checkout {
    /// No payment provider is configured, premium is granted by the admins
    Manual,

    Invoice { order: Order, pay_url: String },
}

/// Result of processing a single webhook
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum WebhookOutcome {
    Activated {
        user_id: UserId,
        expires_at: DateTime<Utc>,
    },

    /// The order was already paid, most likely the webhook was redelivered
    AlreadyPaid,

    MarkedFailed,

    Ignored,
}

impl WebhookOutcome {
    fn label(&self) -> &'static str {
        match self {
            Self::Activated { .. } => "activated",
            Self::AlreadyPaid => "already_paid",
            Self::MarkedFailed => "marked_failed",
            Self::Ignored => "ignored",
        }
    }
}

pub(crate) struct PaymentService {
    db: Arc<db::Repo>,
    bot: tg::Bot,
    provider: Option<Box<dyn PaymentProvider>>,
    price_usd: UsdAmount,
    premium_days: u32,
}

impl PaymentService {
    pub(crate) fn new(cfg: Config, db: Arc<db::Repo>, bot: tg::Bot, http: http::Client) -> Self {
        let provider: Option<Box<dyn PaymentProvider>> = match cfg.provider_cfg {
            ProviderConfig::None => None,
            ProviderConfig::CryptoCloud(provider_cfg) => Some(Box::new(
                crypto_cloud::CryptoCloud::new(provider_cfg, http),
            )),
            ProviderConfig::CryptoBot(provider_cfg) => {
                let description = format!("Premium-доступ на {} дн.", cfg.premium_days);
                Some(Box::new(crypto_bot::CryptoBot::new(
                    provider_cfg,
                    http,
                    description,
                )))
            }
        };

        info!(
            provider = %provider.as_ref().map(|provider| provider.kind()).unwrap_or_default(),
            price_usd = %cfg.price_usd,
            premium_days = cfg.premium_days,
            "Initialized payments"
        );

        Self {
            db,
            bot,
            provider,
            price_usd: cfg.price_usd,
            premium_days: cfg.premium_days,
        }
    }

    pub(crate) fn price_usd(&self) -> UsdAmount {
        self.price_usd
    }

    pub(crate) fn premium_days(&self) -> u32 {
        self.premium_days
    }

    /// Creates an order and an invoice for it on the provider side
    #[instrument(skip(self))]
    pub(crate) async fn create_checkout(&self, user_id: UserId) -> Result<Checkout> {
        let Some(provider) = &self.provider else {
            return Ok(Checkout::Manual);
        };

        let new_order = NewOrder {
            user_id,
            amount: self.price_usd,
            provider: provider.kind(),
        };

        let order = self.db.orders.create(new_order, Utc::now()).await?;

        let invoice = match provider.create_invoice(&order).await {
            Ok(invoice) => invoice,
            Err(err) => {
                self.db.orders.mark_failed(&order.order_id).await?;
                return Err(err);
            }
        };

        self.db
            .orders
            .attach_invoice(&order.order_id, &invoice.pay_url, &invoice.external_id)
            .await?;

        info!(
            order_id = %order.order_id,
            external_id = %invoice.external_id,
            "Created an invoice"
        );

        Ok(Checkout::Invoice {
            order,
            pay_url: invoice.pay_url,
        })
    }

    /// Authenticates and applies the webhook sent by the provider of the given kind
    #[instrument(skip(self, headers, body))]
    pub(crate) async fn handle_webhook(
        &self,
        kind: ProviderKind,
        headers: &HeaderMap,
        body: &[u8],
    ) -> Result<WebhookOutcome> {
        let provider = self
            .provider
            .as_ref()
            .filter(|provider| provider.kind() == kind)
            .ok_or_else(|| err!(PaymentError::ProviderNotConfigured { kind }))?;

        let event = provider.parse_webhook(headers, body)?;

        info!(?event, "Received a payment webhook");

        let outcome = apply_webhook(&self.db, self.premium_days, kind, event, Utc::now()).await?;

        metrics::counter!(
            "payment_webhooks_total",
            "provider" => kind.to_string(),
            "outcome" => outcome.label(),
        )
        .increment(1);

        if let WebhookOutcome::Activated {
            user_id,
            expires_at,
        } = &outcome
        {
            metrics::counter!("premium_activations_total", "source" => "payment").increment(1);
            self.notify_activated(*user_id, *expires_at).await;
        }

        Ok(outcome)
    }

    /// Tells the user that premium is active. The activation already happened,
    /// so a failure to deliver the message is only logged.
    pub(crate) async fn notify_activated(&self, user_id: UserId, expires_at: DateTime<Utc>) {
        let text = format!(
            "🎉 Ваш Premium\\-доступ активирован до *{}* \\(МСК\\)\\. Спасибо\\!",
            markdown::escape(&time::format_local(expires_at)),
        );

        if let Err(err) = self.bot.send_message(ChatId::from(user_id), text).await {
            warn!(
                %user_id,
                err = tracing_err(&err),
                "Failed to notify the user about the premium activation"
            );
        }
    }
}

/// Orders created with a different provider are unknown to the provider
/// of the given `kind`
async fn apply_webhook(
    db: &db::Repo,
    premium_days: u32,
    kind: ProviderKind,
    event: WebhookEvent,
    now: DateTime<Utc>,
) -> Result<WebhookOutcome> {
    let order = match &event.order {
        OrderRef::OrderId(order_id) => db.orders.get(order_id).await?,
        OrderRef::ExternalId(external_id) => db.orders.find_by_external_id(external_id).await?,
    };

    let Some(order) = order.filter(|order| order.provider == kind) else {
        return Err(err!(PaymentError::UnknownOrder { order: event.order }));
    };

    match event.status {
        InvoiceStatus::Paid => confirm_paid(db, premium_days, &order, now).await,
        InvoiceStatus::Failed => {
            if db.orders.mark_failed(&order.order_id).await? {
                warn!(order_id = %order.order_id, "Payment failed");
                return Ok(WebhookOutcome::MarkedFailed);
            }
            Ok(WebhookOutcome::Ignored)
        }
        InvoiceStatus::Other(status) => {
            info!(order_id = %order.order_id, %status, "Ignoring the invoice status");
            Ok(WebhookOutcome::Ignored)
        }
    }
}

/// Marks the order as paid and prolongs the premium atomically. Only the
/// first confirmation of the order has an effect.
#[instrument(skip_all, fields(order_id = %order.order_id, user_id = %order.user_id))]
async fn confirm_paid(
    db: &db::Repo,
    premium_days: u32,
    order: &Order,
    now: DateTime<Utc>,
) -> Result<WebhookOutcome> {
    let confirmed = if order.status == OrderStatus::Paid {
        None
    } else {
        db.confirm_payment(&order.order_id, order.user_id, premium_days, now)
            .await?
    };

    let Some(expires_at) = confirmed else {
        info!("The order was already paid, nothing to do");
        return Ok(WebhookOutcome::AlreadyPaid);
    };

    info!(%expires_at, "Payment succeeded, activated premium");

    Ok(WebhookOutcome::Activated {
        user_id: order.user_id,
        expires_at,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    async fn setup() -> (db::Repo, Order, DateTime<Utc>) {
        let db = db::init_test().await;
        let now = Utc.with_ymd_and_hms(2024, 12, 25, 12, 0, 0).unwrap();

        let new_order = NewOrder {
            user_id: UserId(42),
            amount: UsdAmount::from_cents(500),
            provider: ProviderKind::CryptoCloud,
        };
        let order = db.orders.create(new_order, now).await.unwrap();

        db.orders
            .attach_invoice(&order.order_id, "https://pay", "INV-1")
            .await
            .unwrap();

        (db, order, now)
    }

    fn event(order: OrderRef, status: InvoiceStatus) -> WebhookEvent {
        WebhookEvent { order, status }
    }

    /// Applies the webhook as if it came from the provider of the `setup()` order
    async fn apply(
        db: &db::Repo,
        premium_days: u32,
        event: WebhookEvent,
        now: DateTime<Utc>,
    ) -> Result<WebhookOutcome> {
        apply_webhook(db, premium_days, ProviderKind::CryptoCloud, event, now).await
    }

    #[test_log::test(tokio::test)]
    async fn paid_webhook_activates_premium_once() {
        let (db, order, now) = setup().await;

        let paid = event(OrderRef::OrderId(order.order_id.clone()), InvoiceStatus::Paid);

        let outcome = apply(&db, 30, paid.clone(), now).await.unwrap();
        assert_eq!(
            outcome,
            WebhookOutcome::Activated {
                user_id: UserId(42),
                expires_at: now + Duration::days(30),
            }
        );

        // Redelivery of the same webhook
        let outcome = apply(&db, 30, paid, now).await.unwrap();
        assert_eq!(outcome, WebhookOutcome::AlreadyPaid);

        let premium = db.premium.get(UserId(42)).await.unwrap().unwrap();
        assert_eq!(premium.expires_at, now + Duration::days(30));
    }

    #[test_log::test(tokio::test)]
    async fn order_is_found_by_external_id() {
        let (db, order, now) = setup().await;

        let paid = event(OrderRef::ExternalId("INV-1".to_owned()), InvoiceStatus::Paid);

        let outcome = apply(&db, 7, paid, now).await.unwrap();
        assert!(matches!(outcome, WebhookOutcome::Activated { .. }));

        let order = db.orders.get(&order.order_id).await.unwrap().unwrap();
        assert_eq!(order.status, OrderStatus::Paid);
    }

    #[test_log::test(tokio::test)]
    async fn unknown_order() {
        let (db, _, now) = setup().await;

        let paid = event(OrderRef::OrderId("missing".to_owned()), InvoiceStatus::Paid);

        let err = apply(&db, 30, paid, now).await.unwrap_err();
        assert!(matches!(
            err.kind(),
            crate::ErrorKind::Payment {
                source: PaymentError::UnknownOrder { .. }
            }
        ));
    }

    #[test_log::test(tokio::test)]
    async fn order_of_another_provider_is_unknown() {
        let (db, order, now) = setup().await;

        let paid = event(OrderRef::OrderId(order.order_id.clone()), InvoiceStatus::Paid);

        let err = apply_webhook(&db, 30, ProviderKind::CryptoBot, paid, now)
            .await
            .unwrap_err();

        assert!(matches!(
            err.kind(),
            crate::ErrorKind::Payment {
                source: PaymentError::UnknownOrder { .. }
            }
        ));

        let order = db.orders.get(&order.order_id).await.unwrap().unwrap();
        assert_eq!(order.status, OrderStatus::Pending);
        assert!(db.premium.get(UserId(42)).await.unwrap().is_none());
    }

    #[test_log::test(tokio::test)]
    async fn failed_and_intermediate_statuses() {
        let (db, order, now) = setup().await;
        let order_ref = || OrderRef::OrderId(order.order_id.clone());

        let pending = event(order_ref(), InvoiceStatus::Other("created".to_owned()));
        let outcome = apply(&db, 30, pending, now).await.unwrap();
        assert_eq!(outcome, WebhookOutcome::Ignored);

        let failed = event(order_ref(), InvoiceStatus::Failed);
        let outcome = apply(&db, 30, failed.clone(), now).await.unwrap();
        assert_eq!(outcome, WebhookOutcome::MarkedFailed);

        let outcome = apply(&db, 30, failed, now).await.unwrap();
        assert_eq!(outcome, WebhookOutcome::Ignored);

        assert!(db.premium.get(UserId(42)).await.unwrap().is_none());
    }
}
