//! Retry policy and the invoker every backend call goes through.
//!
//! The invoker is the only place where backend errors are translated into
//! [`StoreError`]s. It runs operations either once or under an exponential
//! backoff policy, distinguishing throttling (always retried within budget)
//! from other faults (retried only for idempotent operations) and permanent
//! errors (never retried). Backoff sleeps are interruptible through the
//! store's shutdown signal.

use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use treemeta_kv::{TableError, TableResult};

use crate::config::StoreConfig;
use crate::error::{StoreError, StoreResult};

// ---------------------------------------------------------------------------
// Policy
// ---------------------------------------------------------------------------

/// Exponential backoff bounded by a retry count.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &StoreConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            base_delay: config.min_retry_sleep,
            max_delay: config.max_retry_sleep,
        }
    }

    /// Delay before retry number `retry_count` (zero-based), or `None` once
    /// the budget is spent.
    pub fn delay_for(&self, retry_count: u32) -> Option<Duration> {
        if retry_count >= self.max_retries {
            return None;
        }
        let factor = 1u32.checked_shl(retry_count).unwrap_or(u32::MAX);
        Some(self.base_delay.saturating_mul(factor).min(self.max_delay))
    }

    pub fn backoff(&self) -> ExponentialBackoff {
        ExponentialBackoff::new(*self)
    }
}

impl fmt::Display for RetryPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "ExponentialBackoff(maxRetries={}, sleepTime={:?}, maxSleepTime={:?})",
            self.max_retries, self.base_delay, self.max_delay
        )
    }
}

/// Tracks exponential back-off state for a sequence of retries.
///
/// Each call to `next_wait` doubles the wait time (capped at the policy's
/// `max_delay`) and returns `None` once `max_retries` waits were handed out.
pub struct ExponentialBackoff {
    policy: RetryPolicy,
    attempts: u32,
}

impl ExponentialBackoff {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            attempts: 0,
        }
    }

    /// Return the next wait duration, or `None` if the budget is exhausted.
    pub fn next_wait(&mut self) -> Option<Duration> {
        let wait = self.policy.delay_for(self.attempts)?;
        self.attempts += 1;
        Some(wait)
    }

    /// Number of waits handed out so far.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn is_exhausted(&self) -> bool {
        self.attempts >= self.policy.max_retries
    }
}

// ---------------------------------------------------------------------------
// Retry notification
// ---------------------------------------------------------------------------

/// Details of one retry, handed to the [`RetryListener`].
#[derive(Debug)]
pub struct RetryEvent<'a> {
    pub operation: &'a str,
    pub target: &'a str,
    pub error: &'a TableError,
    /// Failed attempts so far, starting at 1.
    pub attempts: u32,
    pub idempotent: bool,
}

/// Hook invoked on every retry, for external instrumentation.
pub trait RetryListener: Send + Sync {
    fn on_retry(&self, event: &RetryEvent<'_>);
}

/// Listener that ignores every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopRetryListener;

impl RetryListener for NoopRetryListener {
    fn on_retry(&self, _event: &RetryEvent<'_>) {}
}

// ---------------------------------------------------------------------------
// Invoker
// ---------------------------------------------------------------------------

/// Executes backend calls in try-once or retry-with-policy mode.
pub struct RetryInvoker {
    policy: RetryPolicy,
    table: String,
    region: String,
    listener: Arc<dyn RetryListener>,
    throttle_events: AtomicU64,
    throttle_log_limit: u64,
    shutdown: watch::Receiver<bool>,
}

impl RetryInvoker {
    pub fn new(
        policy: RetryPolicy,
        table: impl Into<String>,
        region: impl Into<String>,
        listener: Arc<dyn RetryListener>,
        throttle_log_limit: u64,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            policy,
            table: table.into(),
            region: region.into(),
            listener,
            throttle_events: AtomicU64::new(0),
            throttle_log_limit,
            shutdown,
        }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn region(&self) -> &str {
        &self.region
    }

    /// Throttle events observed by this invoker, including partially
    /// processed batches.
    pub fn throttle_events(&self) -> u64 {
        self.throttle_events.load(Ordering::Relaxed)
    }

    /// Run `op` once, translating any failure.
    pub async fn once<T, F, Fut>(&self, operation: &str, target: &str, op: F) -> StoreResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = TableResult<T>>,
    {
        op().await.map_err(|e| self.translate(operation, target, e))
    }

    /// Run `op` under the retry policy.
    ///
    /// Throttling is retried until the budget runs out; other transient
    /// faults only when `idempotent`; permanent errors never.
    pub async fn retry<T, F, Fut>(
        &self,
        operation: &str,
        target: &str,
        idempotent: bool,
        mut op: F,
    ) -> StoreResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = TableResult<T>>,
    {
        let mut backoff = self.policy.backoff();
        loop {
            let err = match op().await {
                Ok(value) => return Ok(value),
                Err(e) => e,
            };
            let attempts = backoff.attempts() + 1;

            if !Self::should_retry(&err, idempotent) {
                return Err(self.translate(operation, target, err));
            }
            let Some(wait) = backoff.next_wait() else {
                return Err(self.exhausted(
                    operation,
                    target,
                    attempts,
                    err.is_throttle(),
                    err.to_string(),
                ));
            };

            self.retry_event(operation, target, &err, attempts, idempotent);
            self.pause(operation, target, wait).await?;
        }
    }

    /// Back off before resubmitting `unprocessed` batch items for the
    /// `retry_count`-th time; fails once the policy is exhausted.
    pub async fn backoff_unprocessed(
        &self,
        operation: &str,
        target: &str,
        retry_count: u32,
        unprocessed: usize,
    ) -> StoreResult<()> {
        self.throttle_events.fetch_add(1, Ordering::Relaxed);
        match self.policy.delay_for(retry_count) {
            Some(wait) => {
                tracing::debug!(
                    "Sleeping {:?} before resubmitting {} unprocessed items of {}",
                    wait,
                    unprocessed,
                    operation
                );
                self.pause(operation, target, wait).await
            }
            None => Err(self.exhausted(
                operation,
                target,
                retry_count,
                true,
                format!("{} items still unprocessed", unprocessed),
            )),
        }
    }

    /// Suspend the calling task for `wait`, or fail with `Interrupted` if
    /// the store shuts down first.
    pub async fn pause(&self, operation: &str, target: &str, wait: Duration) -> StoreResult<()> {
        let mut shutdown = self.shutdown.clone();
        tokio::select! {
            _ = tokio::time::sleep(wait) => Ok(()),
            _ = shutdown.wait_for(|stop| *stop) => {
                tracing::warn!("Interrupted while waiting in {} on {}", operation, target);
                Err(self.interrupted(operation, target))
            }
        }
    }

    fn should_retry(err: &TableError, idempotent: bool) -> bool {
        if err.is_permanent() {
            false
        } else if err.is_throttle() {
            true
        } else {
            idempotent
        }
    }

    fn retry_event(
        &self,
        operation: &str,
        target: &str,
        err: &TableError,
        attempts: u32,
        idempotent: bool,
    ) {
        if err.is_throttle() {
            let count = self.throttle_events.fetch_add(1, Ordering::Relaxed) + 1;
            if attempts == 1 && count < self.throttle_log_limit {
                tracing::warn!(
                    "Table IO limits reached in {} on table {}; consider increasing capacity: {}",
                    operation,
                    self.table,
                    err
                );
            } else {
                tracing::debug!(
                    "Table IO limits reached in {} on table {}; consider increasing capacity: {}",
                    operation,
                    self.table,
                    err
                );
            }
        } else if attempts == 1 {
            tracing::info!("Retrying {} on {}: {}", operation, target, err);
        }

        self.listener.on_retry(&RetryEvent {
            operation,
            target,
            error: err,
            attempts,
            idempotent,
        });
    }

    pub(crate) fn translate(&self, operation: &str, target: &str, source: TableError) -> StoreError {
        StoreError::Backend {
            operation: operation.to_string(),
            target: target.to_string(),
            table: self.table.clone(),
            region: self.region.clone(),
            source,
        }
    }

    pub(crate) fn interrupted(&self, operation: &str, target: &str) -> StoreError {
        StoreError::Interrupted {
            operation: operation.to_string(),
            target: target.to_string(),
            table: self.table.clone(),
            region: self.region.clone(),
        }
    }

    fn exhausted(
        &self,
        operation: &str,
        target: &str,
        attempts: u32,
        throttled: bool,
        message: String,
    ) -> StoreError {
        StoreError::RetryExhausted {
            operation: operation.to_string(),
            target: target.to_string(),
            table: self.table.clone(),
            region: self.region.clone(),
            attempts,
            throttled,
            message,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicU32;

    use parking_lot::Mutex;

    use super::*;
    use crate::error::ErrorKind;

    fn policy(max_retries: u32) -> RetryPolicy {
        RetryPolicy {
            max_retries,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(4),
        }
    }

    #[derive(Default)]
    struct RecordingListener {
        events: Mutex<Vec<(String, u32, bool)>>,
    }

    impl RetryListener for RecordingListener {
        fn on_retry(&self, event: &RetryEvent<'_>) {
            self.events
                .lock()
                .push((event.operation.to_string(), event.attempts, event.idempotent));
        }
    }

    fn invoker(
        max_retries: u32,
        listener: Arc<dyn RetryListener>,
    ) -> (RetryInvoker, watch::Sender<bool>) {
        let (tx, rx) = watch::channel(false);
        let invoker = RetryInvoker::new(policy(max_retries), "meta", "local", listener, 100, rx);
        (invoker, tx)
    }

    fn throttled() -> TableError {
        TableError::Throttled("slow down".into())
    }

    fn fault() -> TableError {
        TableError::Service {
            status: 500,
            message: "boom".into(),
        }
    }

    #[test]
    fn test_exponential_backoff_basic() {
        let mut bo = RetryPolicy {
            max_retries: 6,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(2),
        }
        .backoff();
        assert_eq!(bo.attempts(), 0);
        assert_eq!(bo.next_wait(), Some(Duration::from_millis(100)));
        assert_eq!(bo.attempts(), 1);
        assert_eq!(bo.next_wait(), Some(Duration::from_millis(200)));
        assert_eq!(bo.next_wait(), Some(Duration::from_millis(400)));
        assert_eq!(bo.next_wait(), Some(Duration::from_millis(800)));
        assert_eq!(bo.next_wait(), Some(Duration::from_millis(1600)));
        // Should cap at max_delay = 2s.
        assert_eq!(bo.next_wait(), Some(Duration::from_secs(2)));
        assert!(bo.is_exhausted());
        assert_eq!(bo.next_wait(), None);
    }

    #[test]
    fn test_delay_for_large_counts_saturates() {
        let p = RetryPolicy {
            max_retries: 100,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(60),
        };
        assert_eq!(p.delay_for(40), Some(Duration::from_secs(60)));
        assert_eq!(p.delay_for(100), None);
        assert!(p.to_string().starts_with("ExponentialBackoff(maxRetries=100"));
    }

    #[tokio::test]
    async fn test_once_translates() {
        let (inv, _tx) = invoker(3, Arc::new(NoopRetryListener));
        let calls = AtomicU32::new(0);
        let err = inv
            .once("get", "s3a://b/x", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(throttled())
            })
            .await
            .unwrap_err();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(err.kind(), ErrorKind::Throttled);
        let msg = err.to_string();
        assert!(msg.contains("get on s3a://b/x"));
        assert!(msg.contains("table 'meta', region local"));
    }

    #[tokio::test]
    async fn test_retry_recovers_from_throttling() {
        let listener = Arc::new(RecordingListener::default());
        let (inv, _tx) = invoker(5, listener.clone());
        let calls = AtomicU32::new(0);
        let value = inv
            .retry("put", "s3a://b/x", false, || async {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(throttled())
                } else {
                    Ok(7)
                }
            })
            .await
            .unwrap();
        assert_eq!(value, 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(inv.throttle_events(), 2);
        let events = listener.events.lock().clone();
        assert_eq!(
            events,
            vec![("put".to_string(), 1, false), ("put".to_string(), 2, false)]
        );
    }

    #[tokio::test]
    async fn test_non_idempotent_fault_not_retried() {
        let (inv, _tx) = invoker(5, Arc::new(NoopRetryListener));
        let calls = AtomicU32::new(0);
        let err = inv
            .retry("put", "s3a://b/x", false, || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(fault())
            })
            .await
            .unwrap_err();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(err.kind(), ErrorKind::BackendFault);
    }

    #[tokio::test]
    async fn test_idempotent_fault_retried_until_exhausted() {
        let (inv, _tx) = invoker(3, Arc::new(NoopRetryListener));
        let calls = AtomicU32::new(0);
        let err = inv
            .retry("delete", "s3a://b/x", true, || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(fault())
            })
            .await
            .unwrap_err();
        assert_eq!(calls.load(Ordering::SeqCst), 4);
        assert!(matches!(err, StoreError::RetryExhausted { attempts: 4, .. }));
        assert_eq!(err.kind(), ErrorKind::BackendFault);
        assert_eq!(inv.throttle_events(), 0);
    }

    #[tokio::test]
    async fn test_permanent_errors_never_retried() {
        let (inv, _tx) = invoker(3, Arc::new(NoopRetryListener));
        let calls = AtomicU32::new(0);
        let err = inv
            .retry("get", "meta", true, || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(TableError::ResourceNotFound("meta".into()))
            })
            .await
            .unwrap_err();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn test_throttle_exhaustion_is_throttled_kind() {
        let (inv, _tx) = invoker(2, Arc::new(NoopRetryListener));
        let err = inv
            .retry("put", "s3a://b/x", true, || async { Err::<(), _>(throttled()) })
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Throttled);
        assert_eq!(inv.throttle_events(), 2);
    }

    #[tokio::test]
    async fn test_backoff_unprocessed_budget() {
        let (inv, _tx) = invoker(2, Arc::new(NoopRetryListener));
        inv.backoff_unprocessed("batch", "meta", 0, 5).await.unwrap();
        inv.backoff_unprocessed("batch", "meta", 1, 5).await.unwrap();
        let err = inv
            .backoff_unprocessed("batch", "meta", 2, 5)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Throttled);
        assert_eq!(inv.throttle_events(), 3);
    }

    #[tokio::test]
    async fn test_pause_interrupted_by_shutdown() {
        let (tx, rx) = watch::channel(false);
        let inv = RetryInvoker::new(
            RetryPolicy {
                max_retries: 3,
                base_delay: Duration::from_secs(30),
                max_delay: Duration::from_secs(30),
            },
            "meta",
            "local",
            Arc::new(NoopRetryListener),
            100,
            rx,
        );
        let waiter = async { inv.pause("prune", "meta", Duration::from_secs(30)).await };
        let closer = async {
            tokio::time::sleep(Duration::from_millis(10)).await;
            tx.send(true).unwrap();
        };
        let (result, ()) = tokio::join!(waiter, closer);
        assert_eq!(result.unwrap_err().kind(), ErrorKind::Interrupted);

        // Once shut down, later pauses fail immediately.
        let err = inv
            .pause("prune", "meta", Duration::from_secs(30))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Interrupted);
    }
}
