mod config;
mod core;
mod interfaces;
mod logging;

use anyhow::Result;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, mpsc};
use tracing::{info, warn};

use crate::config::Config;
use crate::core::commands::CommandProcessor;
use crate::core::lifecycle::LifecycleManager;
use crate::core::llm::gateway::GatewayClient;
use crate::core::memory::{ConversationMemory, MemoryFlusher};
use crate::core::router::{INTAKE_CAPACITY, Router};
use crate::core::supervisor::health::{spawn_monitor, spawn_watchdog};
use crate::core::supervisor::{ConnectionSupervisor, ReconnectPolicy};
use crate::interfaces::signal::SignalRpc;
use crate::interfaces::web::HealthServer;
use crate::interfaces::whatsapp::WhatsAppBridge;

#[tokio::main]
async fn main() -> Result<()> {
    let booted = Instant::now();
    let args: Vec<String> = std::env::args().collect();
    let config_path = Config::resolve_path(&args);
    let config = Config::load(&config_path).await?;

    logging::init(&config.log_level);
    logging::install_panic_hook();
    info!(
        "Starting {} v{} (config: {})",
        config.bot_name,
        env!("CARGO_PKG_VERSION"),
        config_path.display()
    );

    let memory = Arc::new(Mutex::new(
        ConversationMemory::from_config(&config.memory).load().await,
    ));
    let llm = Arc::new(GatewayClient::new(&config.llm));
    let processor = CommandProcessor::new(&config, llm, memory.clone());

    let (intake_tx, intake_rx) = mpsc::channel(INTAKE_CAPACITY);
    let mut router = Router::new(processor, memory.clone(), intake_rx);
    let mut supervisors = Vec::new();
    let mut watched = Vec::new();

    if config.whatsapp.enabled {
        let transport = Arc::new(WhatsAppBridge::new(&config.whatsapp, intake_tx.clone()));
        router.register(transport.clone());
        let supervisor = ConnectionSupervisor::new(transport, ReconnectPolicy::exponential());
        if config.whatsapp.watchdog {
            watched.push(supervisor.clone());
        }
        supervisors.push(supervisor);
    }

    if config.signal.enabled {
        if config.signal.account.is_empty() {
            warn!("[Signal] No account configured, Signal transport disabled");
        } else {
            let transport = Arc::new(SignalRpc::new(&config.signal, intake_tx.clone()));
            router.register(transport.clone());
            let policy =
                ReconnectPolicy::Fixed(Duration::from_secs(config.signal.reconnect_delay_secs));
            let supervisor = ConnectionSupervisor::new(transport, policy);
            if config.signal.watchdog {
                watched.push(supervisor.clone());
            }
            supervisors.push(supervisor);
        }
    }
    drop(intake_tx);

    if supervisors.is_empty() {
        warn!("No transport enabled, only the health endpoint will be served");
    }

    let mut lifecycle = LifecycleManager::new();
    lifecycle.attach(Arc::new(Mutex::new(MemoryFlusher::new(
        memory.clone(),
        config.memory.flush_interval(),
    ))));
    for supervisor in &supervisors {
        lifecycle.attach(Arc::new(Mutex::new(supervisor.clone())));
    }
    lifecycle.attach(Arc::new(Mutex::new(HealthServer::new(
        config.bot_name.clone(),
        config.http_port,
        booted,
        supervisors.clone(),
    ))));

    let router_task = tokio::spawn(router.run());
    lifecycle.start().await?;

    let mut timers = Vec::new();
    for supervisor in watched {
        timers.push(spawn_monitor(supervisor.clone()));
        timers.push(spawn_watchdog(supervisor, booted));
    }

    info!("{} is running. Press Ctrl+C to stop.", config.bot_name);
    tokio::signal::ctrl_c().await?;
    info!("Shutting down {}...", config.bot_name);

    for timer in timers {
        timer.abort();
    }
    router_task.abort();
    lifecycle.shutdown().await?;
    Ok(())
}
