//! Broker-facing event consumer
//!
//! Pulls decoded sentiment events from an [`EventSource`], runs each one
//! through the idempotency guard into the hourly aggregator and acks
//! everything that does not need redelivery.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, Lines};
use tokio::sync::watch;
use tracing::{debug, info, warn};
use uuid::Uuid;

use trendpulse_core::SentimentEvent;

use crate::aggregation::{HourlyAggregator, HourlyUpdate};
use crate::idempotency::{IdempotencyGuard, ProcessingContext};

/// At-least-once event delivery. Unacked events come back later.
#[async_trait]
pub trait EventSource: Send + Sync {
    /// Up to `max` events; an empty batch means nothing is available yet.
    /// Must be cancel-safe: dropping the future loses no events.
    async fn next_batch(&self, max: usize) -> anyhow::Result<Vec<SentimentEvent>>;

    async fn ack(&self, ids: &[String]) -> anyhow::Result<()>;

    fn name(&self) -> &str;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PollReport {
    pub received: usize,
    pub processed: usize,
    pub duplicates: usize,
    pub errors: usize,
    pub acked: usize,
}

pub struct EventConsumer {
    source: Arc<dyn EventSource>,
    guard: IdempotencyGuard,
    hourly: HourlyAggregator,
    batch_size: usize,
    idle_backoff: Duration,
}

impl EventConsumer {
    pub fn new(
        source: Arc<dyn EventSource>,
        guard: IdempotencyGuard,
        hourly: HourlyAggregator,
        batch_size: usize,
    ) -> Self {
        Self {
            source,
            guard,
            hourly,
            batch_size: batch_size.max(1),
            idle_backoff: Duration::from_millis(500),
        }
    }

    pub fn with_idle_backoff(mut self, idle_backoff: Duration) -> Self {
        self.idle_backoff = idle_backoff;
        self
    }

    /// Fetch and handle a single batch
    pub async fn poll_once(&self) -> anyhow::Result<PollReport> {
        let events = self.source.next_batch(self.batch_size).await?;
        self.handle_batch(events).await
    }

    async fn handle_batch(&self, events: Vec<SentimentEvent>) -> anyhow::Result<PollReport> {
        if events.is_empty() {
            return Ok(PollReport::default());
        }

        let batch_id = Uuid::new_v4().to_string();
        let ctx = ProcessingContext::new()
            .with_source(self.source.name())
            .with_batch(&batch_id);
        let hourly = &self.hourly;
        let outcome = self
            .guard
            .process_batch_with(
                &events,
                |event| hourly.update_hourly_stats(HourlyUpdate::from(event)),
                ctx,
            )
            .await;

        // Failed events stay unacked so the broker redelivers them
        let ack_ids: Vec<String> = outcome
            .outcomes
            .iter()
            .filter(|o| o.outcome.error.is_none())
            .map(|o| o.message_id.clone())
            .collect();
        if !ack_ids.is_empty() {
            self.source.ack(&ack_ids).await?;
        }

        Ok(PollReport {
            received: events.len(),
            processed: outcome.processed,
            duplicates: outcome.duplicates,
            errors: outcome.errors,
            acked: ack_ids.len(),
        })
    }

    /// Consume until `shutdown` turns true. A batch already fetched is
    /// always finished before the guard is drained.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(source = self.source.name(), batch_size = self.batch_size, "Event consumer started");

        loop {
            if *shutdown.borrow() {
                break;
            }

            let fetched = tokio::select! {
                _ = shutdown.changed() => break,
                fetched = self.source.next_batch(self.batch_size) => fetched,
            };

            let idle = match fetched {
                Ok(events) => match self.handle_batch(events).await {
                    Ok(report) => {
                        if report.received > 0 {
                            debug!(?report, "Batch consumed");
                        }
                        report.received == 0
                    }
                    Err(e) => {
                        warn!(error = %e, "Acknowledging batch failed");
                        true
                    }
                },
                Err(e) => {
                    warn!(error = %e, "Fetching events failed");
                    true
                }
            };

            if idle {
                tokio::select! {
                    _ = shutdown.changed() => {}
                    _ = tokio::time::sleep(self.idle_backoff) => {}
                }
            }
        }

        self.guard.shutdown().await;
        info!("Event consumer stopped");
    }
}

/// In-process source with broker-like redelivery of unacked events
#[derive(Default)]
pub struct MemoryEventSource {
    queue: Mutex<VecDeque<SentimentEvent>>,
    unacked: Mutex<HashMap<String, SentimentEvent>>,
    acked: Mutex<Vec<String>>,
}

impl MemoryEventSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, event: SentimentEvent) {
        self.queue.lock().push_back(event);
    }

    /// Put every delivered but unacked event back on the queue
    pub fn redeliver(&self) -> usize {
        let pending: Vec<SentimentEvent> = self.unacked.lock().drain().map(|(_, e)| e).collect();
        let count = pending.len();
        self.queue.lock().extend(pending);
        count
    }

    pub fn acked(&self) -> Vec<String> {
        self.acked.lock().clone()
    }

    pub fn queued(&self) -> usize {
        self.queue.lock().len()
    }

    pub fn unacked(&self) -> usize {
        self.unacked.lock().len()
    }
}

#[async_trait]
impl EventSource for MemoryEventSource {
    async fn next_batch(&self, max: usize) -> anyhow::Result<Vec<SentimentEvent>> {
        let batch: Vec<SentimentEvent> = {
            let mut queue = self.queue.lock();
            let take = max.min(queue.len());
            queue.drain(..take).collect()
        };
        let mut unacked = self.unacked.lock();
        for event in &batch {
            unacked.insert(event.id.clone(), event.clone());
        }
        Ok(batch)
    }

    async fn ack(&self, ids: &[String]) -> anyhow::Result<()> {
        let mut unacked = self.unacked.lock();
        let mut acked = self.acked.lock();
        for id in ids {
            if unacked.remove(id).is_some() {
                acked.push(id.clone());
            }
        }
        Ok(())
    }

    fn name(&self) -> &str {
        "memory"
    }
}

/// Newline-delimited JSON events, e.g. piped on stdin. Acks are no-ops.
pub struct JsonLinesSource<R> {
    lines: tokio::sync::Mutex<Lines<R>>,
    linger: Duration,
}

impl<R: AsyncBufRead + Unpin + Send> JsonLinesSource<R> {
    pub fn new(reader: R) -> Self {
        Self {
            lines: tokio::sync::Mutex::new(reader.lines()),
            linger: Duration::from_millis(20),
        }
    }

    fn decode(line: &str) -> Option<SentimentEvent> {
        let line = line.trim();
        if line.is_empty() {
            return None;
        }
        match serde_json::from_str(line) {
            Ok(event) => Some(event),
            Err(e) => {
                warn!(error = %e, "Skipping malformed event line");
                None
            }
        }
    }
}

#[async_trait]
impl<R: AsyncBufRead + Unpin + Send> EventSource for JsonLinesSource<R> {
    async fn next_batch(&self, max: usize) -> anyhow::Result<Vec<SentimentEvent>> {
        let mut lines = self.lines.lock().await;
        let mut batch = Vec::new();

        // Block for the first line, then take whatever arrives promptly
        let Some(first) = lines.next_line().await? else {
            return Ok(batch);
        };
        batch.extend(Self::decode(&first));

        while batch.len() < max {
            match tokio::time::timeout(self.linger, lines.next_line()).await {
                Ok(Ok(Some(line))) => batch.extend(Self::decode(&line)),
                Ok(Ok(None)) | Err(_) => break,
                Ok(Err(e)) => return Err(e.into()),
            }
        }
        Ok(batch)
    }

    async fn ack(&self, _ids: &[String]) -> anyhow::Result<()> {
        Ok(())
    }

    fn name(&self) -> &str {
        "jsonl"
    }
}
