//! Idempotent message processing
//!
//! A message counts as handled once a `processed` marker exists for its
//! id. The marker is written only after the processor succeeds, so a
//! message that exhausts its attempts can be redelivered and retried.

use chrono::{DateTime, Utc};
use futures_util::future::join_all;
use serde::{Deserialize, Serialize};
use std::fmt::Display;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Notify;
use tracing::{debug, error, info, warn};

use trendpulse_cache::{CacheLayer, CacheService};
use trendpulse_core::SentimentEvent;
use trendpulse_telemetry::{Counter, Gauge, Histogram, HistogramSnapshot};

#[derive(Debug, Clone)]
pub struct IdempotencyConfig {
    /// Processor invocations per message, including the first
    pub max_attempts: u32,
    /// Backoff unit; attempt `n` is followed by `n * retry_delay`
    pub retry_delay: Duration,
    /// Lifetime of a processed marker
    pub window: Duration,
}

impl Default for IdempotencyConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            retry_delay: Duration::from_secs(1),
            window: Duration::from_secs(24 * 60 * 60),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ProcessingContext {
    pub source: Option<String>,
    pub batch_id: Option<String>,
}

impl ProcessingContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_source(mut self, source: &str) -> Self {
        self.source = Some(source.to_string());
        self
    }

    pub fn with_batch(mut self, batch_id: &str) -> Self {
        self.batch_id = Some(batch_id.to_string());
        self
    }
}

/// Marker payload stored under the processed key
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageRecord {
    pub message_id: String,
    pub processed_at: DateTime<Utc>,
    pub processing_time_ms: Option<u64>,
    pub source: Option<String>,
    pub batch_id: Option<String>,
}

#[derive(Debug)]
pub struct IdempotencyOutcome<T> {
    pub result: Option<T>,
    /// True only when the processor ran to success in this call
    pub was_processed: bool,
    pub error: Option<String>,
    pub attempts: u32,
}

impl<T> IdempotencyOutcome<T> {
    pub fn is_duplicate(&self) -> bool {
        !self.was_processed && self.error.is_none()
    }
}

#[derive(Debug)]
pub struct MessageOutcome<T> {
    pub message_id: String,
    pub outcome: IdempotencyOutcome<T>,
}

#[derive(Debug)]
pub struct BatchOutcome<T> {
    pub batch_id: String,
    pub processed: usize,
    pub duplicates: usize,
    pub errors: usize,
    pub outcomes: Vec<MessageOutcome<T>>,
}

/// Anything carrying a broker message id
pub trait Identified {
    fn message_id(&self) -> &str;
}

impl Identified for SentimentEvent {
    fn message_id(&self) -> &str {
        &self.id
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct GuardStatistics {
    pub processed: u64,
    pub duplicates: u64,
    pub failed: u64,
    pub retries: u64,
    pub rejected: u64,
    pub marker_write_failures: u64,
    pub in_flight: i64,
    pub accepting: bool,
    pub processing_time_ms: HistogramSnapshot,
}

struct GuardState {
    accepting: AtomicBool,
    in_flight: Gauge,
    drained: Notify,
    processed: Counter,
    duplicates: Counter,
    failed: Counter,
    retries: Counter,
    rejected: Counter,
    marker_failures: Counter,
    durations: Histogram,
}

/// Keeps the in-flight gauge accurate on every exit path
struct InFlight<'a> {
    state: &'a GuardState,
}

impl<'a> InFlight<'a> {
    fn enter(state: &'a GuardState) -> Self {
        state.in_flight.inc();
        Self { state }
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.state.in_flight.dec();
        if self.state.in_flight.get() <= 0 {
            self.state.drained.notify_waiters();
        }
    }
}

#[derive(Clone)]
pub struct IdempotencyGuard {
    cache: CacheService,
    config: IdempotencyConfig,
    state: Arc<GuardState>,
}

impl IdempotencyGuard {
    pub fn new(cache: CacheService, config: IdempotencyConfig) -> Self {
        Self {
            cache,
            config,
            state: Arc::new(GuardState {
                accepting: AtomicBool::new(true),
                in_flight: Gauge::new("idempotency_in_flight"),
                drained: Notify::new(),
                processed: Counter::new("idempotency_processed"),
                duplicates: Counter::new("idempotency_duplicates"),
                failed: Counter::new("idempotency_failed"),
                retries: Counter::new("idempotency_retries"),
                rejected: Counter::new("idempotency_rejected"),
                marker_failures: Counter::new("idempotency_marker_failures"),
                durations: Histogram::with_capacity("idempotency_processing_ms", 1000),
            }),
        }
    }

    fn marker_key(&self, message_id: &str) -> String {
        self.cache.keys().processed_key(message_id)
    }

    /// Run `processor` unless `message_id` was already handled. A failing
    /// processor is retried up to `max_attempts` times in total.
    pub async fn process_with_idempotency<T, E, F, Fut>(
        &self,
        message_id: &str,
        processor: F,
        ctx: &ProcessingContext,
    ) -> IdempotencyOutcome<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Display,
    {
        let _in_flight = InFlight::enter(&self.state);
        if !self.state.accepting.load(Ordering::SeqCst) {
            self.state.rejected.inc();
            return IdempotencyOutcome {
                result: None,
                was_processed: false,
                error: Some("idempotency guard is shutting down".to_string()),
                attempts: 0,
            };
        }

        let key = self.marker_key(message_id);
        if self.cache.exists(&key).await {
            self.state.duplicates.inc();
            debug!(message_id, "Duplicate message skipped");
            return IdempotencyOutcome {
                result: None,
                was_processed: false,
                error: None,
                attempts: 0,
            };
        }

        let max_attempts = self.config.max_attempts.max(1);
        let started = Instant::now();
        let mut last_error = String::new();

        for attempt in 1..=max_attempts {
            match processor().await {
                Ok(result) => {
                    let elapsed = started.elapsed();
                    self.state.durations.record(elapsed.as_secs_f64() * 1000.0);
                    self.write_marker(&key, message_id, elapsed, ctx).await;
                    self.state.processed.inc();
                    return IdempotencyOutcome {
                        result: Some(result),
                        was_processed: true,
                        error: None,
                        attempts: attempt,
                    };
                }
                Err(e) => {
                    last_error = e.to_string();
                    warn!(message_id, attempt, max_attempts, error = %e, "Message processing failed");
                    if attempt < max_attempts {
                        self.state.retries.inc();
                        tokio::time::sleep(self.config.retry_delay * attempt).await;
                    }
                }
            }
        }

        self.state.failed.inc();
        error!(message_id, attempts = max_attempts, error = %last_error, "Message failed permanently");
        IdempotencyOutcome {
            result: None,
            was_processed: false,
            error: Some(last_error),
            attempts: max_attempts,
        }
    }

    async fn write_marker(
        &self,
        key: &str,
        message_id: &str,
        elapsed: Duration,
        ctx: &ProcessingContext,
    ) {
        let record = MessageRecord {
            message_id: message_id.to_string(),
            processed_at: Utc::now(),
            processing_time_ms: Some(elapsed.as_millis() as u64),
            source: ctx.source.clone(),
            batch_id: ctx.batch_id.clone(),
        };
        let stored = self
            .cache
            .set(key, &record, CacheLayer::Daily, Some(self.config.window))
            .await;
        if !stored {
            self.state.marker_failures.inc();
            warn!(message_id, "Processed marker not written; redelivery will reprocess");
        }
    }

    /// Process every message concurrently; no ordering across ids
    pub async fn process_batch<M, T, E, F, Fut>(
        &self,
        messages: &[M],
        processor: F,
        batch_id: &str,
    ) -> BatchOutcome<T>
    where
        M: Identified,
        F: Fn(&M) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Display,
    {
        let ctx = ProcessingContext::new().with_batch(batch_id);
        self.process_batch_with(messages, processor, ctx).await
    }

    pub async fn process_batch_with<M, T, E, F, Fut>(
        &self,
        messages: &[M],
        processor: F,
        ctx: ProcessingContext,
    ) -> BatchOutcome<T>
    where
        M: Identified,
        F: Fn(&M) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Display,
    {
        let processor = &processor;
        let ctx = &ctx;
        let outcomes: Vec<MessageOutcome<T>> = join_all(messages.iter().map(|message| async move {
            let outcome = self
                .process_with_idempotency(message.message_id(), || processor(message), ctx)
                .await;
            MessageOutcome {
                message_id: message.message_id().to_string(),
                outcome,
            }
        }))
        .await;

        let processed = outcomes.iter().filter(|o| o.outcome.was_processed).count();
        let duplicates = outcomes.iter().filter(|o| o.outcome.is_duplicate()).count();
        let errors = outcomes.iter().filter(|o| o.outcome.error.is_some()).count();
        let batch_id = ctx.batch_id.clone().unwrap_or_default();
        info!(batch_id = %batch_id, processed, duplicates, errors, "Batch processed");

        BatchOutcome {
            batch_id,
            processed,
            duplicates,
            errors,
            outcomes,
        }
    }

    pub async fn is_processed(&self, message_id: &str) -> bool {
        self.cache.exists(&self.marker_key(message_id)).await
    }

    pub async fn get_record(&self, message_id: &str) -> Option<MessageRecord> {
        self.cache.get(&self.marker_key(message_id)).await
    }

    /// Forget a message so its next delivery is processed again
    pub async fn clear(&self, message_id: &str) -> bool {
        self.cache.invalidate_key(&self.marker_key(message_id)).await
    }

    /// Stop accepting messages and wait for in-flight ones to finish
    pub async fn shutdown(&self) {
        self.state.accepting.store(false, Ordering::SeqCst);
        loop {
            let drained = self.state.drained.notified();
            if self.state.in_flight.get() <= 0 {
                break;
            }
            drained.await;
        }
        info!("Idempotency guard drained");
    }

    pub fn is_accepting(&self) -> bool {
        self.state.accepting.load(Ordering::SeqCst)
    }

    pub fn get_statistics(&self) -> GuardStatistics {
        let state = &self.state;
        GuardStatistics {
            processed: state.processed.get(),
            duplicates: state.duplicates.get(),
            failed: state.failed.get(),
            retries: state.retries.get(),
            rejected: state.rejected.get(),
            marker_write_failures: state.marker_failures.get(),
            in_flight: state.in_flight.get(),
            accepting: self.is_accepting(),
            processing_time_ms: state.durations.snapshot(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;
    use trendpulse_cache::{KeyBuilder, MemoryCacheStore};

    fn guard() -> (IdempotencyGuard, MemoryCacheStore) {
        let store = MemoryCacheStore::new();
        let cache = CacheService::new(Arc::new(store.clone()), KeyBuilder::new("tp"));
        let config = IdempotencyConfig {
            retry_delay: Duration::from_millis(1),
            ..IdempotencyConfig::default()
        };
        (IdempotencyGuard::new(cache, config), store)
    }

    #[tokio::test]
    async fn test_marker_records_context() {
        let (guard, _) = guard();
        let ctx = ProcessingContext::new().with_source("crawler").with_batch("b-1");

        let outcome = guard
            .process_with_idempotency("m-1", || async { Ok::<_, String>(7) }, &ctx)
            .await;
        assert!(outcome.was_processed);
        assert_eq!(outcome.result, Some(7));

        let record = guard.get_record("m-1").await.unwrap();
        assert_eq!(record.message_id, "m-1");
        assert_eq!(record.source.as_deref(), Some("crawler"));
        assert_eq!(record.batch_id.as_deref(), Some("b-1"));
        assert!(record.processing_time_ms.is_some());
    }

    #[tokio::test]
    async fn test_cache_outage_processes_and_still_reports_success() {
        let (guard, store) = guard();
        store.set_failing(true);

        let outcome = guard
            .process_with_idempotency("m-2", || async { Ok::<_, String>(()) }, &ProcessingContext::new())
            .await;
        assert!(outcome.was_processed);
        assert_eq!(guard.get_statistics().marker_write_failures, 1);
    }

    #[tokio::test]
    async fn test_clear_allows_reprocessing() {
        let (guard, _) = guard();
        let calls = &AtomicU32::new(0);
        let run = || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok::<_, String>(())
        };

        guard.process_with_idempotency("m-3", run, &ProcessingContext::new()).await;
        assert!(guard.is_processed("m-3").await);
        assert!(guard.clear("m-3").await);
        assert!(!guard.is_processed("m-3").await);
        guard.process_with_idempotency("m-3", run, &ProcessingContext::new()).await;
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_shutdown_rejects_new_work() {
        let (guard, _) = guard();
        guard.shutdown().await;
        assert!(!guard.is_accepting());

        let outcome = guard
            .process_with_idempotency("m-4", || async { Ok::<_, String>(()) }, &ProcessingContext::new())
            .await;
        assert!(!outcome.was_processed);
        assert!(outcome.error.is_some());
        assert!(!guard.is_processed("m-4").await);
        assert_eq!(guard.get_statistics().rejected, 1);
    }

    #[tokio::test]
    async fn test_shutdown_waits_for_in_flight() {
        let (guard, _) = guard();
        let started = Arc::new(Notify::new());
        let finished = Arc::new(AtomicBool::new(false));

        let worker = {
            let guard = guard.clone();
            let started = started.clone();
            let finished = finished.clone();
            tokio::spawn(async move {
                guard
                    .process_with_idempotency(
                        "m-5",
                        || {
                            let started = started.clone();
                            let finished = finished.clone();
                            async move {
                                started.notify_one();
                                tokio::time::sleep(Duration::from_millis(50)).await;
                                finished.store(true, Ordering::SeqCst);
                                Ok::<_, String>(())
                            }
                        },
                        &ProcessingContext::new(),
                    )
                    .await
            })
        };

        started.notified().await;
        guard.shutdown().await;
        assert!(finished.load(Ordering::SeqCst));
        assert_eq!(guard.get_statistics().in_flight, 0);
        assert!(worker.await.unwrap().was_processed);
    }
}
