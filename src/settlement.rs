use std::sync::Arc;

use chrono::Utc;
use serde_json::{json, Value};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::error::{AppError, AppResult};
use crate::events::{CanonicalEvent, EmitOutcome, EventDispatcher, EventHandler};
use crate::providers::{PaymentStatus, PaymentResult, WebhookEvent};
use crate::repos::{
    InvoiceRepository, InvoiceStatus, SubscriptionRepository, SubscriptionStatus,
};

#[derive(Debug)]
pub enum SettleOutcome {
    Settled(EmitOutcome),
    AlreadySettled,
}

/// At-most-one settlement per invoice across webhook push, client-initiated
/// capture, and status polling.
///
/// The routes never mutate invoice or subscription records; they hand verified
/// provider notifications to this engine, which correlates them and emits
/// canonical events. The check-then-act window needs no lock: a second check
/// against an already-settled invoice is a safe no-op.
pub struct Reconciler {
    invoices: Arc<dyn InvoiceRepository>,
    subscriptions: Arc<dyn SubscriptionRepository>,
    dispatcher: Arc<EventDispatcher>,
}

impl Reconciler {
    pub fn new(
        invoices: Arc<dyn InvoiceRepository>,
        subscriptions: Arc<dyn SubscriptionRepository>,
        dispatcher: Arc<EventDispatcher>,
    ) -> Self {
        Self {
            invoices,
            subscriptions,
            dispatcher,
        }
    }

    /// Correlation: metadata invoice id first, then the session id stored at
    /// intent creation. Both failing is an unreconciled notification.
    fn resolve_invoice_id(&self, invoice_id: Option<Uuid>, session_id: &str) -> Option<Uuid> {
        if let Some(id) = invoice_id {
            if self.invoices.find_by_id(id).is_some() {
                return Some(id);
            }
        }
        if !session_id.is_empty() {
            if invoice_id.is_none() {
                warn!(session_id, "correlation id missing, using session id fallback");
            }
            return self
                .invoices
                .find_by_provider_session_id(session_id)
                .map(|invoice| invoice.id);
        }
        None
    }

    pub fn settle_capture(
        &self,
        provider: &str,
        invoice_id: Option<Uuid>,
        session_id: &str,
        payment_reference: &str,
        transaction_id: &str,
        amount_minor: Option<i64>,
        currency: Option<&str>,
    ) -> AppResult<SettleOutcome> {
        let Some(resolved) = self.resolve_invoice_id(invoice_id, session_id) else {
            error!(
                provider,
                session_id,
                payment_reference,
                attempted_invoice_id = ?invoice_id,
                "cannot reconcile capture: no invoice match, dropping"
            );
            return Err(AppError::Unreconciled(format!(
                "no invoice for {provider} reference {payment_reference}"
            )));
        };

        // Re-read immediately before emitting: if another notification path
        // already settled this invoice, the duplicate is a no-op.
        let invoice = self.invoices.find_by_id(resolved).ok_or(AppError::NotFound)?;
        if invoice.status != InvoiceStatus::Pending {
            debug!(invoice_id = %resolved, provider, "invoice already settled, skipping emission");
            return Ok(SettleOutcome::AlreadySettled);
        }

        info!(invoice_id = %resolved, provider, payment_reference, "settling payment capture");
        let outcome = self.dispatcher.emit(&CanonicalEvent::PaymentCaptured {
            invoice_id: resolved,
            payment_reference: payment_reference.to_string(),
            amount_minor: amount_minor.unwrap_or(invoice.amount_minor),
            currency: currency.unwrap_or(&invoice.currency).to_string(),
            provider: provider.to_string(),
            transaction_id: transaction_id.to_string(),
        });
        Ok(SettleOutcome::Settled(outcome))
    }

    pub fn settle_refund(
        &self,
        provider: &str,
        invoice_id: Option<Uuid>,
        session_id: &str,
        refund_reference: &str,
        amount_minor: Option<i64>,
        currency: Option<&str>,
    ) -> AppResult<EmitOutcome> {
        // Refund objects on some gateways carry the original payment reference
        // (Stripe puts the payment intent on the charge, never the checkout
        // session), so after the session lookup fails, try the reference
        // recorded at settlement.
        let resolved = self
            .resolve_invoice_id(invoice_id, session_id)
            .or_else(|| {
                self.invoices
                    .find_by_payment_ref(session_id)
                    .map(|invoice| invoice.id)
            });
        let Some(resolved) = resolved else {
            error!(
                provider,
                session_id,
                refund_reference,
                attempted_invoice_id = ?invoice_id,
                "cannot reconcile refund: no invoice match, dropping"
            );
            return Err(AppError::Unreconciled(format!(
                "no invoice for {provider} refund {refund_reference}"
            )));
        };
        let invoice = self.invoices.find_by_id(resolved).ok_or(AppError::NotFound)?;
        Ok(self.dispatcher.emit(&CanonicalEvent::PaymentRefunded {
            invoice_id: resolved,
            refund_reference: refund_reference.to_string(),
            amount_minor: amount_minor.unwrap_or(invoice.amount_minor),
            currency: currency.unwrap_or(&invoice.currency).to_string(),
            provider: provider.to_string(),
        }))
    }

    /// Applies one verified webhook notification. Unreconciled notifications
    /// are logged and swallowed — the provider gets a 200 either way, because
    /// retrying cannot fix a data-correlation problem.
    pub fn apply_webhook_event(&self, provider: &str, event: WebhookEvent) {
        let result = match event {
            WebhookEvent::CaptureCompleted {
                invoice_id,
                session_id,
                transaction_id,
                amount_minor,
                currency,
            } => self
                .settle_capture(
                    provider,
                    invoice_id,
                    &session_id,
                    &transaction_id,
                    &transaction_id,
                    Some(amount_minor),
                    Some(&currency),
                )
                .map(|_| ()),
            WebhookEvent::RefundCompleted {
                invoice_id,
                session_id,
                refund_reference,
                amount_minor,
                currency,
            } => self
                .settle_refund(
                    provider,
                    invoice_id,
                    &session_id,
                    &refund_reference,
                    Some(amount_minor),
                    Some(&currency),
                )
                .map(|_| ()),
            WebhookEvent::SubscriptionCancelled {
                provider_subscription_id,
            } => {
                match self
                    .subscriptions
                    .find_by_provider_subscription_id(&provider_subscription_id)
                {
                    Some(subscription) => {
                        self.dispatcher.emit(&CanonicalEvent::SubscriptionCancelled {
                            subscription_id: subscription.id,
                            reason: format!("{provider}_subscription_deleted"),
                            provider: provider.to_string(),
                        });
                        Ok(())
                    }
                    None => {
                        warn!(provider, provider_subscription_id, "cancellation for unknown subscription");
                        Ok(())
                    }
                }
            }
            WebhookEvent::PaymentFailed {
                provider_subscription_id,
                invoice_id,
                message,
            } => {
                let subscription_id = provider_subscription_id
                    .as_deref()
                    .and_then(|id| self.subscriptions.find_by_provider_subscription_id(id))
                    .map(|subscription| subscription.id);
                self.dispatcher.emit(&CanonicalEvent::PaymentFailed {
                    subscription_id,
                    invoice_id,
                    code: "payment_failed".into(),
                    message,
                    provider: provider.to_string(),
                });
                Ok(())
            }
        };
        if let Err(err) = result {
            warn!(provider, %err, "webhook notification left unreconciled");
        }
    }

    /// Poll-path fallback: if the provider reports a session paid while our
    /// invoice is still Pending, settle it here.
    pub fn reconcile_poll(&self, provider: &str, session_id: &str, result: &PaymentResult) {
        if result.status != PaymentStatus::Completed {
            return;
        }
        let invoice_id = result
            .correlation_id
            .as_deref()
            .and_then(|raw| Uuid::parse_str(raw).ok());
        if let Err(err) = self.settle_capture(
            provider,
            invoice_id,
            session_id,
            &result.transaction_id,
            &result.transaction_id,
            result.amount_minor,
            result.currency.as_deref(),
        ) {
            warn!(provider, session_id, %err, "poll reconciliation left unreconciled");
        }
    }
}

/// Marks the invoice Paid and activates the pending subscription behind it.
/// Idempotent: an already-Paid invoice only gets its activation re-checked.
pub struct PaymentCapturedHandler {
    invoices: Arc<dyn InvoiceRepository>,
    subscriptions: Arc<dyn SubscriptionRepository>,
}

impl EventHandler for PaymentCapturedHandler {
    fn name(&self) -> &'static str {
        "payment-captured"
    }

    fn handle(&self, event: &CanonicalEvent) -> Result<Value, String> {
        let CanonicalEvent::PaymentCaptured {
            invoice_id,
            payment_reference,
            provider,
            ..
        } = event
        else {
            return Err("unexpected event type".into());
        };

        let mut invoice = self
            .invoices
            .find_by_id(*invoice_id)
            .ok_or_else(|| format!("invoice {invoice_id} not found"))?;
        if invoice.status != InvoiceStatus::Paid {
            invoice.status = InvoiceStatus::Paid;
            invoice.payment_ref = Some(payment_reference.clone());
            invoice.provider = Some(provider.clone());
            invoice.paid_at = Some(Utc::now());
            self.invoices.save(invoice);
        }

        let mut activated = None;
        if let Some(mut subscription) = self.subscriptions.find_by_invoice(*invoice_id) {
            if subscription.status == SubscriptionStatus::Pending {
                subscription.status = SubscriptionStatus::Active;
                subscription.started_at = Some(Utc::now());
                activated = Some(subscription.id);
                self.subscriptions.save(subscription);
            }
        }

        Ok(json!({
            "invoice_id": invoice_id,
            "status": "paid",
            "payment_reference": payment_reference,
            "subscription_activated": activated,
        }))
    }
}

pub struct PaymentRefundedHandler {
    invoices: Arc<dyn InvoiceRepository>,
}

impl EventHandler for PaymentRefundedHandler {
    fn name(&self) -> &'static str {
        "payment-refunded"
    }

    fn handle(&self, event: &CanonicalEvent) -> Result<Value, String> {
        let CanonicalEvent::PaymentRefunded {
            invoice_id,
            refund_reference,
            ..
        } = event
        else {
            return Err("unexpected event type".into());
        };
        let mut invoice = self
            .invoices
            .find_by_id(*invoice_id)
            .ok_or_else(|| format!("invoice {invoice_id} not found"))?;
        if invoice.status != InvoiceStatus::Refunded {
            invoice.status = InvoiceStatus::Refunded;
            invoice.payment_ref = Some(refund_reference.clone());
            self.invoices.save(invoice);
        }
        Ok(json!({"invoice_id": invoice_id, "status": "refunded"}))
    }
}

pub struct SubscriptionCancelledHandler {
    subscriptions: Arc<dyn SubscriptionRepository>,
}

impl EventHandler for SubscriptionCancelledHandler {
    fn name(&self) -> &'static str {
        "subscription-cancelled"
    }

    fn handle(&self, event: &CanonicalEvent) -> Result<Value, String> {
        let CanonicalEvent::SubscriptionCancelled {
            subscription_id, ..
        } = event
        else {
            return Err("unexpected event type".into());
        };
        let mut subscription = self
            .subscriptions
            .find_by_id(*subscription_id)
            .ok_or_else(|| format!("subscription {subscription_id} not found"))?;
        if subscription.status != SubscriptionStatus::Cancelled {
            subscription.status = SubscriptionStatus::Cancelled;
            subscription.cancelled_at = Some(Utc::now());
            self.subscriptions.save(subscription);
        }
        Ok(json!({"subscription_id": subscription_id, "status": "cancelled"}))
    }
}

pub struct PaymentFailedHandler {
    invoices: Arc<dyn InvoiceRepository>,
    subscriptions: Arc<dyn SubscriptionRepository>,
}

impl EventHandler for PaymentFailedHandler {
    fn name(&self) -> &'static str {
        "payment-failed"
    }

    fn handle(&self, event: &CanonicalEvent) -> Result<Value, String> {
        let CanonicalEvent::PaymentFailed {
            subscription_id,
            invoice_id,
            message,
            provider,
            ..
        } = event
        else {
            return Err("unexpected event type".into());
        };
        warn!(?subscription_id, ?invoice_id, provider, message, "provider reported payment failure");

        if let Some(subscription_id) = subscription_id {
            if let Some(mut subscription) = self.subscriptions.find_by_id(*subscription_id) {
                if subscription.status == SubscriptionStatus::Active {
                    subscription.status = SubscriptionStatus::PastDue;
                    self.subscriptions.save(subscription);
                }
            }
        }
        if let Some(invoice_id) = invoice_id {
            if let Some(mut invoice) = self.invoices.find_by_id(*invoice_id) {
                if invoice.status == InvoiceStatus::Pending {
                    invoice.status = InvoiceStatus::Failed;
                    self.invoices.save(invoice);
                }
            }
        }
        Ok(Value::Null)
    }
}

/// Wires every settlement handler into the dispatcher in the order the
/// composition root expects.
pub fn register_settlement_handlers(
    dispatcher: &EventDispatcher,
    invoices: Arc<dyn InvoiceRepository>,
    subscriptions: Arc<dyn SubscriptionRepository>,
) {
    dispatcher.register(
        "payment.captured",
        Arc::new(PaymentCapturedHandler {
            invoices: invoices.clone(),
            subscriptions: subscriptions.clone(),
        }),
    );
    dispatcher.register(
        "payment.refunded",
        Arc::new(PaymentRefundedHandler {
            invoices: invoices.clone(),
        }),
    );
    dispatcher.register(
        "subscription.cancelled",
        Arc::new(SubscriptionCancelledHandler {
            subscriptions: subscriptions.clone(),
        }),
    );
    dispatcher.register(
        "payment.failed",
        Arc::new(PaymentFailedHandler {
            invoices,
            subscriptions,
        }),
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repos::{InMemoryInvoices, InMemorySubscriptions, Invoice, Subscription};

    struct Fixture {
        invoices: Arc<InMemoryInvoices>,
        subscriptions: Arc<InMemorySubscriptions>,
        reconciler: Reconciler,
    }

    fn fixture() -> Fixture {
        let invoices: Arc<InMemoryInvoices> = Arc::new(InMemoryInvoices::new());
        let subscriptions: Arc<InMemorySubscriptions> = Arc::new(InMemorySubscriptions::new());
        let dispatcher = Arc::new(EventDispatcher::new());
        register_settlement_handlers(
            &dispatcher,
            invoices.clone(),
            subscriptions.clone(),
        );
        let reconciler = Reconciler::new(invoices.clone(), subscriptions.clone(), dispatcher);
        Fixture {
            invoices,
            subscriptions,
            reconciler,
        }
    }

    #[test]
    fn capture_settles_pending_invoice_exactly_once() {
        let fx = fixture();
        let user = Uuid::new_v4();
        let mut invoice = Invoice::pending(user, 2999, "USD");
        invoice.provider_session_id = Some("cs_1".into());
        let invoice_id = invoice.id;
        fx.invoices.save(invoice);

        let first = fx
            .reconciler
            .settle_capture("stripe", Some(invoice_id), "cs_1", "cs_1", "pi_1", Some(2999), Some("USD"))
            .unwrap();
        assert!(matches!(first, SettleOutcome::Settled(ref o) if o.success()));
        assert_eq!(
            fx.invoices.find_by_id(invoice_id).unwrap().status,
            InvoiceStatus::Paid
        );

        // Duplicate delivery of the identical notification is a no-op.
        let second = fx
            .reconciler
            .settle_capture("stripe", Some(invoice_id), "cs_1", "cs_1", "pi_1", Some(2999), Some("USD"))
            .unwrap();
        assert!(matches!(second, SettleOutcome::AlreadySettled));
        assert_eq!(
            fx.invoices.find_by_id(invoice_id).unwrap().status,
            InvoiceStatus::Paid
        );
    }

    #[test]
    fn capture_activates_pending_subscription() {
        let fx = fixture();
        let user = Uuid::new_v4();
        let invoice = Invoice::pending(user, 999, "EUR");
        let invoice_id = invoice.id;
        fx.invoices.save(invoice);
        let subscription = Subscription::pending(user, invoice_id);
        let subscription_id = subscription.id;
        fx.subscriptions.save(subscription);

        fx.reconciler
            .settle_capture("paypal", Some(invoice_id), "", "ord_1", "cap_1", None, None)
            .unwrap();

        let subscription = fx.subscriptions.find_by_id(subscription_id).unwrap();
        assert_eq!(subscription.status, SubscriptionStatus::Active);
        assert!(subscription.started_at.is_some());
    }

    #[test]
    fn missing_correlation_falls_back_to_session_id() {
        let fx = fixture();
        let mut invoice = Invoice::pending(Uuid::new_v4(), 5000, "USD");
        invoice.provider_session_id = Some("ord_77".into());
        let invoice_id = invoice.id;
        fx.invoices.save(invoice);

        fx.reconciler
            .settle_capture("paypal", None, "ord_77", "cap_9", "cap_9", None, None)
            .unwrap();
        assert_eq!(
            fx.invoices.find_by_id(invoice_id).unwrap().status,
            InvoiceStatus::Paid
        );
    }

    #[test]
    fn unresolvable_notification_is_unreconciled() {
        let fx = fixture();
        let err = fx
            .reconciler
            .settle_capture("stripe", None, "cs_ghost", "cs_ghost", "", None, None)
            .unwrap_err();
        assert!(matches!(err, AppError::Unreconciled(_)));
    }

    #[test]
    fn webhook_path_tolerates_unreconciled_and_unknown_subscriptions() {
        let fx = fixture();
        // Neither of these may panic or error the request path.
        fx.reconciler.apply_webhook_event(
            "stripe",
            WebhookEvent::CaptureCompleted {
                invoice_id: None,
                session_id: "cs_ghost".into(),
                transaction_id: "pi_1".into(),
                amount_minor: 100,
                currency: "USD".into(),
            },
        );
        fx.reconciler.apply_webhook_event(
            "stripe",
            WebhookEvent::SubscriptionCancelled {
                provider_subscription_id: "sub_ghost".into(),
            },
        );
    }

    #[test]
    fn poll_reconciliation_only_acts_on_completed() {
        let fx = fixture();
        let mut invoice = Invoice::pending(Uuid::new_v4(), 2999, "USD");
        invoice.provider_session_id = Some("cs_2".into());
        let invoice_id = invoice.id;
        fx.invoices.save(invoice);

        let pending = PaymentResult {
            success: true,
            transaction_id: "pi_2".into(),
            status: PaymentStatus::Pending,
            amount_minor: Some(2999),
            currency: Some("USD".into()),
            correlation_id: Some(invoice_id.to_string()),
            error: None,
        };
        fx.reconciler.reconcile_poll("stripe", "cs_2", &pending);
        assert_eq!(
            fx.invoices.find_by_id(invoice_id).unwrap().status,
            InvoiceStatus::Pending
        );

        let paid = PaymentResult {
            status: PaymentStatus::Completed,
            ..pending
        };
        fx.reconciler.reconcile_poll("stripe", "cs_2", &paid);
        let invoice = fx.invoices.find_by_id(invoice_id).unwrap();
        assert_eq!(invoice.status, InvoiceStatus::Paid);
        // The poll path records the same reference the webhook path would.
        assert_eq!(invoice.payment_ref.as_deref(), Some("pi_2"));
    }

    #[test]
    fn refund_without_session_match_falls_back_to_payment_reference() {
        let fx = fixture();
        let mut invoice = Invoice::pending(Uuid::new_v4(), 2999, "USD");
        invoice.status = InvoiceStatus::Paid;
        invoice.provider_session_id = Some("cs_1".into());
        invoice.payment_ref = Some("pi_1".into());
        let invoice_id = invoice.id;
        fx.invoices.save(invoice);

        // Refund notifications carry the payment reference, not the session.
        fx.reconciler
            .settle_refund("stripe", None, "pi_1", "re_1", Some(2999), Some("USD"))
            .unwrap();
        assert_eq!(
            fx.invoices.find_by_id(invoice_id).unwrap().status,
            InvoiceStatus::Refunded
        );
    }

    #[test]
    fn refund_marks_paid_invoice_refunded() {
        let fx = fixture();
        let mut invoice = Invoice::pending(Uuid::new_v4(), 2999, "USD");
        invoice.status = InvoiceStatus::Paid;
        invoice.provider_session_id = Some("cs_3".into());
        let invoice_id = invoice.id;
        fx.invoices.save(invoice);

        fx.reconciler
            .settle_refund("stripe", None, "cs_3", "re_1", Some(2999), Some("USD"))
            .unwrap();
        let invoice = fx.invoices.find_by_id(invoice_id).unwrap();
        assert_eq!(invoice.status, InvoiceStatus::Refunded);
        assert_eq!(invoice.payment_ref.as_deref(), Some("re_1"));
    }

    #[test]
    fn cancellation_is_idempotent() {
        let fx = fixture();
        let user = Uuid::new_v4();
        let mut subscription = Subscription::pending(user, Uuid::new_v4());
        subscription.status = SubscriptionStatus::Active;
        subscription.provider_subscription_id = Some("sub_1".into());
        let subscription_id = subscription.id;
        fx.subscriptions.save(subscription);

        for _ in 0..2 {
            fx.reconciler.apply_webhook_event(
                "stripe",
                WebhookEvent::SubscriptionCancelled {
                    provider_subscription_id: "sub_1".into(),
                },
            );
        }
        let subscription = fx.subscriptions.find_by_id(subscription_id).unwrap();
        assert_eq!(subscription.status, SubscriptionStatus::Cancelled);
    }
}
