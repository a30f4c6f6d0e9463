use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use uuid::Uuid;

/// Durable invoice state. Pending -> Paid happens at most once per invoice id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum InvoiceStatus {
    Pending,
    Paid,
    Canceled,
    Refunded,
    Failed,
}

#[derive(Debug, Clone, Serialize)]
pub struct Invoice {
    pub id: Uuid,
    pub user_id: Uuid,
    pub amount_minor: i64,
    pub currency: String,
    pub status: InvoiceStatus,
    pub provider: Option<String>,
    /// Session id stored at intent creation, used as the correlation fallback.
    pub provider_session_id: Option<String>,
    pub payment_ref: Option<String>,
    pub paid_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl Invoice {
    pub fn pending(user_id: Uuid, amount_minor: i64, currency: &str) -> Self {
        Self {
            id: Uuid::new_v4(),
            user_id,
            amount_minor,
            currency: currency.to_string(),
            status: InvoiceStatus::Pending,
            provider: None,
            provider_session_id: None,
            payment_ref: None,
            paid_at: None,
            created_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    Pending,
    Active,
    PastDue,
    Cancelled,
}

#[derive(Debug, Clone, Serialize)]
pub struct Subscription {
    pub id: Uuid,
    pub user_id: Uuid,
    pub invoice_id: Option<Uuid>,
    pub status: SubscriptionStatus,
    pub provider_subscription_id: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub cancelled_at: Option<DateTime<Utc>>,
}

impl Subscription {
    pub fn pending(user_id: Uuid, invoice_id: Uuid) -> Self {
        Self {
            id: Uuid::new_v4(),
            user_id,
            invoice_id: Some(invoice_id),
            status: SubscriptionStatus::Pending,
            provider_subscription_id: None,
            started_at: None,
            cancelled_at: None,
        }
    }
}

/// Consumed collaborator: the settlement core reads and writes invoices only
/// through this seam.
pub trait InvoiceRepository: Send + Sync {
    fn find_by_id(&self, id: Uuid) -> Option<Invoice>;
    fn find_by_provider_session_id(&self, session_id: &str) -> Option<Invoice>;
    /// Lookup by the reference stored at settlement. Refund notifications for
    /// gateways whose refund objects carry no session handle correlate here.
    fn find_by_payment_ref(&self, payment_ref: &str) -> Option<Invoice>;
    fn save(&self, invoice: Invoice);
}

pub trait SubscriptionRepository: Send + Sync {
    fn find_by_id(&self, id: Uuid) -> Option<Subscription>;
    fn find_by_provider_subscription_id(&self, provider_subscription_id: &str)
        -> Option<Subscription>;
    fn find_by_invoice(&self, invoice_id: Uuid) -> Option<Subscription>;
    fn save(&self, subscription: Subscription);
}

#[derive(Default)]
pub struct InMemoryInvoices {
    rows: DashMap<Uuid, Invoice>,
}

impl InMemoryInvoices {
    pub fn new() -> Self {
        Self::default()
    }
}

impl InvoiceRepository for InMemoryInvoices {
    fn find_by_id(&self, id: Uuid) -> Option<Invoice> {
        self.rows.get(&id).map(|row| row.clone())
    }

    fn find_by_provider_session_id(&self, session_id: &str) -> Option<Invoice> {
        self.rows
            .iter()
            .find(|row| row.provider_session_id.as_deref() == Some(session_id))
            .map(|row| row.clone())
    }

    fn find_by_payment_ref(&self, payment_ref: &str) -> Option<Invoice> {
        self.rows
            .iter()
            .find(|row| row.payment_ref.as_deref() == Some(payment_ref))
            .map(|row| row.clone())
    }

    fn save(&self, invoice: Invoice) {
        self.rows.insert(invoice.id, invoice);
    }
}

#[derive(Default)]
pub struct InMemorySubscriptions {
    rows: DashMap<Uuid, Subscription>,
}

impl InMemorySubscriptions {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SubscriptionRepository for InMemorySubscriptions {
    fn find_by_id(&self, id: Uuid) -> Option<Subscription> {
        self.rows.get(&id).map(|row| row.clone())
    }

    fn find_by_provider_subscription_id(
        &self,
        provider_subscription_id: &str,
    ) -> Option<Subscription> {
        self.rows
            .iter()
            .find(|row| {
                row.provider_subscription_id.as_deref() == Some(provider_subscription_id)
            })
            .map(|row| row.clone())
    }

    fn find_by_invoice(&self, invoice_id: Uuid) -> Option<Subscription> {
        self.rows
            .iter()
            .find(|row| row.invoice_id == Some(invoice_id))
            .map(|row| row.clone())
    }

    fn save(&self, subscription: Subscription) {
        self.rows.insert(subscription.id, subscription);
    }
}
