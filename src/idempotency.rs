use std::future::Future;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tracing::debug;

use crate::providers::{CreatedSession, PaymentError, PaymentResult};

#[derive(Clone)]
enum CachedOutcome {
    Payment(PaymentResult),
    Session(CreatedSession),
}

struct IdempotencyRecord {
    outcome: CachedOutcome,
    created_at: Instant,
}

/// Process-local effect-once cache for mutating adapter calls.
///
/// The first invocation with a key executes the call and caches a successful
/// result; a repeat inside the TTL returns the cached result without touching
/// the provider. Errors are never cached so a retry stays possible. The
/// provider-side idempotency key is the final backstop against duplication,
/// which is why a process-local cache is sufficient.
pub struct IdempotencyGuard {
    records: DashMap<String, IdempotencyRecord>,
    ttl: Duration,
}

impl IdempotencyGuard {
    pub fn new(ttl: Duration) -> Self {
        Self {
            records: DashMap::new(),
            ttl,
        }
    }

    pub async fn execute_payment<F, Fut>(
        &self,
        key: &str,
        op: F,
    ) -> Result<PaymentResult, PaymentError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<PaymentResult, PaymentError>>,
    {
        if let Some(CachedOutcome::Payment(cached)) = self.lookup(key) {
            debug!(key, "idempotency cache hit");
            return Ok(cached);
        }
        let result = op().await?;
        self.insert(key, CachedOutcome::Payment(result.clone()));
        Ok(result)
    }

    pub async fn execute_session<F, Fut>(
        &self,
        key: &str,
        op: F,
    ) -> Result<CreatedSession, PaymentError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<CreatedSession, PaymentError>>,
    {
        if let Some(CachedOutcome::Session(cached)) = self.lookup(key) {
            debug!(key, "idempotency cache hit");
            return Ok(cached);
        }
        let result = op().await?;
        self.insert(key, CachedOutcome::Session(result.clone()));
        Ok(result)
    }

    fn lookup(&self, key: &str) -> Option<CachedOutcome> {
        let record = self.records.get(key)?;
        if record.created_at.elapsed() > self.ttl {
            drop(record);
            self.records.remove(key);
            return None;
        }
        Some(record.outcome.clone())
    }

    fn insert(&self, key: &str, outcome: CachedOutcome) {
        self.sweep_expired();
        self.records.insert(
            key.to_string(),
            IdempotencyRecord {
                outcome,
                created_at: Instant::now(),
            },
        );
    }

    fn sweep_expired(&self) {
        self.records
            .retain(|_, record| record.created_at.elapsed() <= self.ttl);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::PaymentStatus;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn completed(txn: &str) -> PaymentResult {
        PaymentResult {
            success: true,
            transaction_id: txn.into(),
            status: PaymentStatus::Completed,
            amount_minor: Some(2999),
            currency: Some("USD".into()),
            correlation_id: None,
            error: None,
        }
    }

    #[tokio::test]
    async fn repeat_call_returns_cached_result_without_reinvoking() {
        let guard = IdempotencyGuard::new(Duration::from_secs(60));
        let calls = Arc::new(AtomicUsize::new(0));

        for _ in 0..2 {
            let calls = calls.clone();
            let result = guard
                .execute_payment("cap-1", move || async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(completed("txn-1"))
                })
                .await
                .unwrap();
            assert_eq!(result.transaction_id, "txn-1");
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn distinct_keys_execute_independently() {
        let guard = IdempotencyGuard::new(Duration::from_secs(60));
        let calls = Arc::new(AtomicUsize::new(0));

        for key in ["cap-1", "cap-2"] {
            let calls = calls.clone();
            guard
                .execute_payment(key, move || async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(completed(key))
                })
                .await
                .unwrap();
        }
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn errors_are_not_cached() {
        let guard = IdempotencyGuard::new(Duration::from_secs(60));
        let calls = Arc::new(AtomicUsize::new(0));

        let first: Result<PaymentResult, PaymentError> = guard
            .execute_payment("cap-1", {
                let calls = calls.clone();
                move || async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(PaymentError::Transient("timeout".into()))
                }
            })
            .await;
        assert!(first.is_err());

        let second = guard
            .execute_payment("cap-1", {
                let calls = calls.clone();
                move || async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(completed("txn-1"))
                }
            })
            .await
            .unwrap();
        assert_eq!(second.transaction_id, "txn-1");
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn expired_records_are_reexecuted() {
        let guard = IdempotencyGuard::new(Duration::from_millis(10));
        let calls = Arc::new(AtomicUsize::new(0));

        for _ in 0..2 {
            let calls = calls.clone();
            guard
                .execute_payment("cap-1", move || async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(completed("txn-1"))
                })
                .await
                .unwrap();
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
