//! Transaction engine
//!
//! Runs a unit of work inside one store transaction, retrying on deadlock
//! or serialization failure with exponential backoff. Each attempt gets
//! its own transaction id; the consistency hook hears about every commit
//! and every rolled-back attempt under that id.

use async_trait::async_trait;
use chrono::Utc;
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, instrument, warn};
use uuid::Uuid;

use trendpulse_store::{StatsStore, StoreTransaction};
use trendpulse_telemetry::{Counter, MetricsSink, NoopSink, ThresholdBreach};

use super::backoff::backoff_delay;
use super::metrics::{MetricsLog, TransactionHealth, TransactionMetric, TransactionStatistics};
use super::options::TransactionOptions;
use crate::error::TransactionError;

/// Success rate below which the engine reports itself unhealthy
const HEALTHY_SUCCESS_RATE: f64 = 0.95;

/// Receives transaction outcomes so deferred side effects can follow them
#[async_trait]
pub trait TransactionHook: Send + Sync {
    /// Buffer an invalidation under `rule_key` until the outcome is known
    fn schedule_invalidation(&self, transaction_id: &str, rule_key: &str, data: &Value) -> bool;

    async fn on_commit(&self, transaction_id: &str);

    async fn on_rollback(&self, transaction_id: &str);
}

/// Handle given to a unit of work for the current attempt
pub struct TransactionContext {
    transaction_id: String,
    operation: String,
    attempt: u32,
    hook: Option<Arc<dyn TransactionHook>>,
}

impl TransactionContext {
    pub fn transaction_id(&self) -> &str {
        &self.transaction_id
    }

    pub fn operation(&self) -> &str {
        &self.operation
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Defer a cache invalidation until this attempt commits. Without a
    /// hook the request is dropped.
    pub fn schedule_invalidation(&self, rule_key: &str, data: &Value) -> bool {
        match &self.hook {
            Some(hook) => hook.schedule_invalidation(&self.transaction_id, rule_key, data),
            None => false,
        }
    }
}

/// Work executed inside a transaction; may run several times
#[async_trait]
pub trait UnitOfWork: Send + Sync {
    type Output: Send;

    async fn run(
        &self,
        tx: &mut dyn StoreTransaction,
        ctx: &TransactionContext,
    ) -> Result<Self::Output, TransactionError>;
}

/// Per-item step of a batch; every item of a chunk shares one transaction
#[async_trait]
pub trait ItemWork<I: Sync>: Send + Sync {
    async fn apply(
        &self,
        tx: &mut dyn StoreTransaction,
        ctx: &TransactionContext,
        item: &I,
    ) -> Result<(), TransactionError>;
}

#[derive(Debug)]
pub struct TransactionResult<T> {
    pub outcome: Result<T, TransactionError>,
    pub attempts: u32,
    pub duration: Duration,
    /// Id of the final attempt
    pub transaction_id: String,
}

impl<T> TransactionResult<T> {
    pub fn is_success(&self) -> bool {
        self.outcome.is_ok()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BatchItemError {
    /// Position of the item in the input slice
    pub index: usize,
    pub error: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct BatchExecution {
    pub processed: usize,
    pub failed_batches: usize,
    pub errors: Vec<BatchItemError>,
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub metrics_capacity: usize,
    /// Attempts slower than this raise a threshold breach
    pub slow_threshold: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            metrics_capacity: 1000,
            slow_threshold: Duration::from_secs(1),
        }
    }
}

pub struct TransactionEngine {
    store: Arc<dyn StatsStore>,
    hook: Option<Arc<dyn TransactionHook>>,
    sink: Arc<dyn MetricsSink>,
    config: EngineConfig,
    log: MetricsLog,
    contention_retries: Counter,
    slow_transactions: Counter,
}

impl TransactionEngine {
    pub fn new(store: Arc<dyn StatsStore>, config: EngineConfig) -> Self {
        Self {
            store,
            hook: None,
            sink: Arc::new(NoopSink),
            log: MetricsLog::new(config.metrics_capacity),
            config,
            contention_retries: Counter::new("transaction_contention_retries"),
            slow_transactions: Counter::new("transaction_slow"),
        }
    }

    pub fn with_hook(mut self, hook: Arc<dyn TransactionHook>) -> Self {
        self.hook = Some(hook);
        self
    }

    pub fn with_sink(mut self, sink: Arc<dyn MetricsSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn store(&self) -> &Arc<dyn StatsStore> {
        &self.store
    }

    /// Run `work` in a transaction, retrying contention failures
    #[instrument(skip(self, options, work), fields(isolation = %options.isolation))]
    pub async fn execute_in_transaction<W>(
        &self,
        operation: &str,
        options: &TransactionOptions,
        work: &W,
    ) -> TransactionResult<W::Output>
    where
        W: UnitOfWork,
    {
        let started = Instant::now();
        if let Err(e) = options.check() {
            return TransactionResult {
                outcome: Err(e),
                attempts: 0,
                duration: started.elapsed(),
                transaction_id: String::new(),
            };
        }

        let mut attempt = 0u32;
        loop {
            attempt += 1;
            let ctx = TransactionContext {
                transaction_id: Uuid::new_v4().to_string(),
                operation: operation.to_string(),
                attempt,
                hook: self.hook.clone(),
            };

            let attempt_started = Instant::now();
            let outcome = self.run_attempt(options, work, &ctx).await;
            let elapsed = attempt_started.elapsed();

            match outcome {
                Ok(value) => {
                    if let Some(hook) = &self.hook {
                        hook.on_commit(&ctx.transaction_id).await;
                    }
                    self.record(&ctx, options, elapsed, None);
                    debug!(operation, attempt, "Transaction committed");
                    return TransactionResult {
                        outcome: Ok(value),
                        attempts: attempt,
                        duration: started.elapsed(),
                        transaction_id: ctx.transaction_id,
                    };
                }
                Err(err) => {
                    if let Some(hook) = &self.hook {
                        hook.on_rollback(&ctx.transaction_id).await;
                    }
                    self.record(&ctx, options, elapsed, Some(err.to_string()));

                    let retryable = options.retry_on_deadlock && err.is_contention();
                    if !retryable || attempt > options.max_retries {
                        if retryable {
                            error!(operation, attempts = attempt, error = %err, "Transaction retries exhausted");
                        } else {
                            warn!(operation, attempt, error = %err, "Transaction failed");
                        }
                        return TransactionResult {
                            outcome: Err(err),
                            attempts: attempt,
                            duration: started.elapsed(),
                            transaction_id: ctx.transaction_id,
                        };
                    }

                    let delay = backoff_delay(attempt, options.retry_delay_base());
                    self.contention_retries.inc();
                    self.sink.increment("transaction_contention_retries", 1);
                    warn!(
                        operation,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "Transaction contention, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    async fn run_attempt<W>(
        &self,
        options: &TransactionOptions,
        work: &W,
        ctx: &TransactionContext,
    ) -> Result<W::Output, TransactionError>
    where
        W: UnitOfWork,
    {
        let mut tx = self.store.begin(options.isolation).await?;
        match work.run(tx.as_mut(), ctx).await {
            Ok(value) => {
                tx.commit().await?;
                Ok(value)
            }
            Err(err) => {
                if let Err(rollback_err) = tx.rollback().await {
                    error!(
                        transaction_id = %ctx.transaction_id,
                        error = %rollback_err,
                        "Rollback failed"
                    );
                }
                Err(err)
            }
        }
    }

    /// Chunk `items` into transactions of `batch_size`. A failed chunk
    /// reports all of its items and does not stop later chunks.
    pub async fn execute_batch<I, W>(
        &self,
        operation: &str,
        items: &[I],
        work: &W,
        batch_size: usize,
        options: &TransactionOptions,
    ) -> BatchExecution
    where
        I: Sync,
        W: ItemWork<I>,
    {
        let batch_size = batch_size.max(1);
        let mut execution = BatchExecution::default();

        for (batch_index, chunk) in items.chunks(batch_size).enumerate() {
            let unit = BatchUnit { items: chunk, work };
            let result = self.execute_in_transaction(operation, options, &unit).await;
            match result.outcome {
                Ok(count) => execution.processed += count,
                Err(err) => {
                    execution.failed_batches += 1;
                    warn!(operation, batch_index, error = %err, "Batch failed");
                    let offset = batch_index * batch_size;
                    let message = err.to_string();
                    execution
                        .errors
                        .extend((0..chunk.len()).map(|i| BatchItemError {
                            index: offset + i,
                            error: message.clone(),
                        }));
                }
            }
        }
        execution
    }

    fn record(
        &self,
        ctx: &TransactionContext,
        options: &TransactionOptions,
        elapsed: Duration,
        error: Option<String>,
    ) {
        let duration_ms = elapsed.as_secs_f64() * 1000.0;
        let success = error.is_none();

        self.sink.observe("transaction_duration_ms", duration_ms);
        self.sink.increment(
            if success { "transactions_committed" } else { "transactions_rolled_back" },
            1,
        );
        if elapsed > self.config.slow_threshold {
            self.slow_transactions.inc();
            warn!(
                operation = %ctx.operation,
                duration_ms,
                threshold_ms = self.config.slow_threshold.as_millis() as u64,
                "Slow transaction"
            );
            self.sink.threshold_breached(ThresholdBreach {
                metric: "transaction_duration_ms".to_string(),
                value: duration_ms,
                threshold: self.config.slow_threshold.as_secs_f64() * 1000.0,
                context: ctx.operation.clone(),
            });
        }

        self.log.push(TransactionMetric {
            operation: ctx.operation.clone(),
            transaction_id: ctx.transaction_id.clone(),
            duration_ms,
            attempts: ctx.attempt,
            success,
            isolation: options.isolation,
            error,
            recorded_at: Utc::now(),
        });
    }

    pub fn get_statistics(&self) -> TransactionStatistics {
        self.log
            .statistics(self.contention_retries.get(), self.slow_transactions.get())
    }

    pub fn get_health(&self) -> TransactionHealth {
        self.log.health(HEALTHY_SUCCESS_RATE, self.config.slow_threshold)
    }

    pub fn recent_metrics(&self, limit: usize) -> Vec<TransactionMetric> {
        self.log.recent(limit)
    }
}

struct BatchUnit<'a, I, W> {
    items: &'a [I],
    work: &'a W,
}

#[async_trait]
impl<'a, I, W> UnitOfWork for BatchUnit<'a, I, W>
where
    I: Sync,
    W: ItemWork<I>,
{
    type Output = usize;

    async fn run(
        &self,
        tx: &mut dyn StoreTransaction,
        ctx: &TransactionContext,
    ) -> Result<usize, TransactionError> {
        for item in self.items {
            self.work.apply(&mut *tx, ctx, item).await?;
        }
        Ok(self.items.len())
    }
}
