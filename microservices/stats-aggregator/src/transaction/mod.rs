//! Transactional write engine

mod backoff;
mod engine;
mod metrics;
mod options;

pub use backoff::{backoff_delay, backoff_delay_with_jitter, MAX_JITTER};
pub use engine::{
    BatchExecution, BatchItemError, EngineConfig, ItemWork, TransactionContext, TransactionEngine,
    TransactionHook, TransactionResult, UnitOfWork,
};
pub use metrics::{
    MetricsLog, OperationStats, TransactionHealth, TransactionMetric, TransactionStatistics,
};
pub use options::TransactionOptions;
