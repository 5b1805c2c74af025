//! Service lifecycle shared by all TrendPulse workers

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;
use tokio::signal;
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::error::Result;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthStatus {
    pub healthy: bool,
    pub service_id: String,
    pub version: String,
    pub uptime_seconds: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DependencyStatus {
    pub name: String,
    pub available: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadinessStatus {
    pub ready: bool,
    pub dependencies: Vec<DependencyStatus>,
}

impl ReadinessStatus {
    pub fn from_dependencies(dependencies: Vec<DependencyStatus>) -> Self {
        Self {
            ready: dependencies.iter().all(|d| d.available),
            dependencies,
        }
    }
}

/// A long-running worker. `start` runs until the shutdown receiver flips
/// to `true`; `shutdown` then drains whatever is still in flight.
#[async_trait]
pub trait TrendPulseService: Send + Sync + 'static {
    fn service_id(&self) -> &'static str;

    fn version(&self) -> &'static str {
        env!("CARGO_PKG_VERSION")
    }

    async fn health(&self) -> HealthStatus;

    async fn ready(&self) -> ReadinessStatus;

    async fn start(&self, shutdown: watch::Receiver<bool>) -> Result<()>;

    async fn shutdown(&self) -> Result<()>;
}

pub struct ServiceRuntime;

impl ServiceRuntime {
    pub async fn run<S: TrendPulseService>(service: Arc<S>) -> Result<()> {
        let started = Instant::now();
        info!(
            service_id = service.service_id(),
            version = service.version(),
            "Starting service"
        );

        let (tx, rx) = watch::channel(false);
        let worker = service.clone();
        let handle = tokio::spawn(async move {
            if let Err(e) = worker.start(rx).await {
                error!(error = %e, "Service stopped with error");
            }
        });

        wait_for_signal().await;
        info!("Shutdown signal received, draining");

        // Workers observe the flag and leave their loops on their own
        let _ = tx.send(true);
        if let Err(e) = handle.await {
            warn!(error = %e, "Service task ended abnormally");
        }
        if let Err(e) = service.shutdown().await {
            warn!(error = %e, "Error during shutdown");
        }

        info!(
            uptime_seconds = started.elapsed().as_secs(),
            "Service stopped"
        );
        Ok(())
    }
}

async fn wait_for_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Ctrl+C listener failed");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "SIGTERM listener failed");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
