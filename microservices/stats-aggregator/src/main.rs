//! Stats Aggregator - TrendPulse sentiment statistics worker
//!
//! Reads analysed posts as JSON lines on stdin, folds them into hourly
//! aggregates and periodically rolls finished days into daily rows.

use anyhow::Context;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Instant;
use tokio::io::BufReader;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use stats_aggregator::consistency::CacheConsistencyManager;
use stats_aggregator::{
    AggregatorConfig, DailyAggregator, EventConsumer, HourlyAggregator, IdempotencyGuard,
    JsonLinesSource, TransactionEngine,
};
use trendpulse_cache::{CacheService, CacheStore, KeyBuilder, MemoryCacheStore, RedisCacheStore};
use trendpulse_core::{
    DependencyStatus, HealthStatus, ReadinessStatus, ServiceConfig, ServiceRuntime,
    TrendPulseService,
};
use trendpulse_store::{PgStatsStore, PoolConfig, StatsStore};
use trendpulse_telemetry::TracingSink;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let service_config = ServiceConfig::from_env()?;
    let _telemetry = trendpulse_telemetry::init(&service_config.service_name)?;
    let config = AggregatorConfig::from_env()?;

    info!(
        service = %service_config.service_name,
        batch_size = config.batch_size,
        max_retries = config.transaction.max_retries,
        "Starting stats aggregator"
    );

    let service = Arc::new(AggregatorService::new(service_config, config).await?);
    ServiceRuntime::run(service).await?;
    Ok(())
}

struct AggregatorService {
    config: AggregatorConfig,
    store: Arc<PgStatsStore>,
    redis: Option<RedisCacheStore>,
    /// Set when running without Redis; expired slots are purged on sweeps
    memory_cache: Option<MemoryCacheStore>,
    cache: CacheService,
    consistency: CacheConsistencyManager,
    engine: Arc<TransactionEngine>,
    daily: DailyAggregator,
    guard: IdempotencyGuard,
    consumer: EventConsumer,
    start_time: Instant,
}

impl AggregatorService {
    async fn new(service_config: ServiceConfig, config: AggregatorConfig) -> anyhow::Result<Self> {
        let pool_config = PoolConfig {
            url: service_config.database_url.clone(),
            ..PoolConfig::from_env()
        };
        let store = Arc::new(PgStatsStore::connect(&pool_config).context("Creating database pool")?);
        store.ensure_schema().await.context("Bootstrapping schema")?;

        let redis = match &service_config.redis_url {
            Some(url) => Some(RedisCacheStore::connect(url).await.context("Connecting to Redis")?),
            None => {
                warn!("REDIS_URL not set, using in-process cache");
                None
            }
        };
        let (backend, memory_cache): (Arc<dyn CacheStore>, _) = match &redis {
            Some(redis) => (Arc::new(redis.clone()), None),
            None => {
                let memory = MemoryCacheStore::new();
                (Arc::new(memory.clone()), Some(memory))
            }
        };
        let cache = CacheService::new(backend, KeyBuilder::new(&service_config.cache_prefix));

        let consistency = CacheConsistencyManager::new(cache.clone());
        let stats_store: Arc<dyn StatsStore> = store.clone();
        let engine = Arc::new(
            TransactionEngine::new(stats_store.clone(), config.engine.clone())
                .with_hook(consistency.create_transaction_hook())
                .with_sink(Arc::new(TracingSink)),
        );

        let hourly = HourlyAggregator::new(engine.clone(), cache.clone())
            .with_options(config.transaction);
        let daily = DailyAggregator::new(stats_store, cache.clone(), consistency.clone());
        let guard = IdempotencyGuard::new(cache.clone(), config.idempotency.clone());
        let source = Arc::new(JsonLinesSource::new(BufReader::new(tokio::io::stdin())));
        let consumer = EventConsumer::new(source, guard.clone(), hourly, config.batch_size);

        Ok(Self {
            config,
            store,
            redis,
            memory_cache,
            cache,
            consistency,
            engine,
            daily,
            guard,
            consumer,
            start_time: Instant::now(),
        })
    }

    /// Daily rollup, stale-plan cleanup and cache slot expiry until shutdown
    async fn maintenance(&self, mut shutdown: watch::Receiver<bool>) {
        let mut rollups = tokio::time::interval(self.config.rollup_interval);
        let mut sweeps = tokio::time::interval(self.config.stale_plan_age);

        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = rollups.tick() => {
                    if let Err(e) = self.daily.rollup_yesterday().await {
                        error!(error = %e, "Daily rollup failed");
                    }
                }
                _ = sweeps.tick() => {
                    let purged = self.consistency.purge_stale(self.config.stale_plan_age);
                    if purged > 0 {
                        warn!(purged, "Dropped stale invalidation plans");
                    }
                    if let Some(memory) = &self.memory_cache {
                        let expired = memory.purge_expired();
                        debug!(expired, remaining = memory.capacity_used(), "Purged expired cache slots");
                    }
                }
            }
        }
    }
}

#[async_trait]
impl TrendPulseService for AggregatorService {
    fn service_id(&self) -> &'static str {
        "stats-aggregator"
    }

    async fn health(&self) -> HealthStatus {
        HealthStatus {
            healthy: self.engine.get_health().healthy,
            service_id: self.service_id().to_string(),
            version: self.version().to_string(),
            uptime_seconds: self.start_time.elapsed().as_secs(),
        }
    }

    async fn ready(&self) -> ReadinessStatus {
        let mut dependencies = vec![DependencyStatus {
            name: "postgres".to_string(),
            available: self.store.is_healthy().await,
        }];
        if let Some(redis) = &self.redis {
            dependencies.push(DependencyStatus {
                name: "redis".to_string(),
                available: redis.is_healthy().await,
            });
        }
        ReadinessStatus::from_dependencies(dependencies)
    }

    async fn start(&self, shutdown: watch::Receiver<bool>) -> trendpulse_core::Result<()> {
        tokio::join!(
            self.consumer.run(shutdown.clone()),
            self.maintenance(shutdown),
        );
        Ok(())
    }

    async fn shutdown(&self) -> trendpulse_core::Result<()> {
        self.guard.shutdown().await;

        let tx = self.engine.get_statistics();
        let cache = self.cache.get_stats();
        let guard = self.guard.get_statistics();
        info!(
            transactions = tx.total,
            success_rate = tx.success_rate,
            contention_retries = tx.contention_retries,
            cache_hit_rate = cache.hit_rate,
            messages_processed = guard.processed,
            duplicates = guard.duplicates,
            pending_invalidations = self.consistency.pending_count(),
            "Stats aggregator stopped"
        );
        Ok(())
    }
}
