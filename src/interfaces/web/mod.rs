mod router;

use anyhow::Result;
use async_trait::async_trait;
use serde::Serialize;
use std::time::Instant;
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::core::lifecycle::LifecycleComponent;
use crate::core::supervisor::{ConnectionSupervisor, TransportStatus};

use router::build_status_router;

#[derive(Clone)]
pub(crate) struct AppState {
    pub(crate) bot_name: String,
    pub(crate) booted: Instant,
    pub(crate) supervisors: Vec<ConnectionSupervisor>,
}

/// Body of `GET /health`.
#[derive(Debug, Serialize)]
pub struct StatusSnapshot {
    pub status: &'static str,
    /// Seconds since boot.
    pub uptime: u64,
    pub timestamp: String,
    pub transports: Vec<TransportStatus>,
}

impl AppState {
    pub(crate) fn snapshot(&self) -> StatusSnapshot {
        StatusSnapshot {
            status: "running",
            uptime: self.booted.elapsed().as_secs(),
            timestamp: chrono::Utc::now().to_rfc3339(),
            transports: self
                .supervisors
                .iter()
                .map(ConnectionSupervisor::health_snapshot)
                .collect(),
        }
    }
}

/// Plain HTTP status surface for container health checks.
pub struct HealthServer {
    state: AppState,
    port: u16,
    task: Option<JoinHandle<()>>,
}

impl HealthServer {
    pub fn new(
        bot_name: String,
        port: u16,
        booted: Instant,
        supervisors: Vec<ConnectionSupervisor>,
    ) -> Self {
        Self {
            state: AppState {
                bot_name,
                booted,
                supervisors,
            },
            port,
            task: None,
        }
    }
}

#[async_trait]
impl LifecycleComponent for HealthServer {
    async fn on_start(&mut self) -> Result<()> {
        let addr = format!("0.0.0.0:{}", self.port);
        let listener = tokio::net::TcpListener::bind(&addr).await?;
        let app = build_status_router(self.state.clone());
        info!("[HTTP] Health server listening on http://{}", addr);
        self.task = Some(tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app).await {
                error!("[HTTP] Health server crashed: {}", e);
            }
        }));
        Ok(())
    }

    async fn on_shutdown(&mut self) -> Result<()> {
        if let Some(task) = self.task.take() {
            task.abort();
        }
        info!("[HTTP] Health server stopped");
        Ok(())
    }
}
