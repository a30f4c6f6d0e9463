use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use serde::Serialize;
use serde_json::Value;
use tracing::warn;
use uuid::Uuid;

/// Canonical domain events. Created only from verified provider input or
/// registry lifecycle transitions — never from raw webhook payloads.
#[derive(Debug, Clone, Serialize)]
pub enum CanonicalEvent {
    PaymentCaptured {
        invoice_id: Uuid,
        payment_reference: String,
        amount_minor: i64,
        currency: String,
        provider: String,
        transaction_id: String,
    },
    PaymentRefunded {
        invoice_id: Uuid,
        refund_reference: String,
        amount_minor: i64,
        currency: String,
        provider: String,
    },
    SubscriptionCancelled {
        subscription_id: Uuid,
        reason: String,
        provider: String,
    },
    PaymentFailed {
        subscription_id: Option<Uuid>,
        invoice_id: Option<Uuid>,
        code: String,
        message: String,
        provider: String,
    },
    PluginEnabled {
        plugin_name: String,
    },
    PluginDisabled {
        plugin_name: String,
    },
}

impl CanonicalEvent {
    pub fn name(&self) -> &'static str {
        match self {
            CanonicalEvent::PaymentCaptured { .. } => "payment.captured",
            CanonicalEvent::PaymentRefunded { .. } => "payment.refunded",
            CanonicalEvent::SubscriptionCancelled { .. } => "subscription.cancelled",
            CanonicalEvent::PaymentFailed { .. } => "payment.failed",
            CanonicalEvent::PluginEnabled { .. } => "plugin.enabled",
            CanonicalEvent::PluginDisabled { .. } => "plugin.disabled",
        }
    }
}

/// One entry per handler that ran, in registration order.
#[derive(Debug, Clone, Serialize)]
pub struct HandlerResult {
    pub handler: String,
    pub outcome: Result<Value, String>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct EmitOutcome {
    pub results: Vec<HandlerResult>,
}

impl EmitOutcome {
    pub fn success(&self) -> bool {
        self.results.iter().all(|r| r.outcome.is_ok())
    }

    pub fn handled(&self) -> usize {
        self.results.len()
    }
}

/// Handlers must be independently idempotent: one handler's failure is
/// reported in the combined outcome without rolling back handlers that
/// already ran.
pub trait EventHandler: Send + Sync {
    fn name(&self) -> &'static str;
    fn handle(&self, event: &CanonicalEvent) -> Result<Value, String>;
}

/// Maps event name to an ordered handler list. Emission is synchronous, in
/// registration order.
#[derive(Default)]
pub struct EventDispatcher {
    handlers: RwLock<HashMap<String, Vec<Arc<dyn EventHandler>>>>,
}

impl EventDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, event_name: &str, handler: Arc<dyn EventHandler>) {
        self.handlers
            .write()
            .expect("dispatcher lock poisoned")
            .entry(event_name.to_string())
            .or_default()
            .push(handler);
    }

    pub fn emit(&self, event: &CanonicalEvent) -> EmitOutcome {
        let handlers = {
            let map = self.handlers.read().expect("dispatcher lock poisoned");
            map.get(event.name()).cloned().unwrap_or_default()
        };
        let mut outcome = EmitOutcome::default();
        for handler in handlers {
            let result = handler.handle(event);
            if let Err(err) = &result {
                warn!(event = event.name(), handler = handler.name(), %err, "event handler failed");
            }
            outcome.results.push(HandlerResult {
                handler: handler.name().to_string(),
                outcome: result,
            });
        }
        outcome
    }
}
