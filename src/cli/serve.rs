use anyhow::{Context, Result};
use std::sync::Arc;
use tokio::sync::{Mutex, broadcast};
use tracing::info;

use super::runtime::Runtime;
use crate::core::config::Config;
use crate::core::dispatcher::NotificationDispatcher;
use crate::core::jobs::maintenance;
use crate::core::lifecycle::LifecycleManager;
use crate::core::terminal;
use crate::interfaces::web::{ApiServer, AppState};
use crate::logging;

pub async fn run_server(config: Config) -> Result<()> {
    let (log_tx, _) = broadcast::channel::<String>(500);
    logging::init(config.logging.max_level(), log_tx.clone(), false);
    info!("Starting tenantd {}", env!("CARGO_PKG_VERSION"));

    let runtime = Runtime::build(&config, config.jobs.enabled).await?;
    if let Some(scheduler) = &runtime.scheduler {
        maintenance::register(
            scheduler,
            &config.maintenance,
            runtime.store.clone(),
            runtime.cache.clone(),
        )
        .await
        .context("Failed to register maintenance tasks")?;
    }

    let state = AppState {
        authenticator: runtime.authenticator.clone(),
        operator: runtime.operator.clone(),
        store: runtime.store.clone(),
        scheduler: runtime.scheduler.clone(),
        log_tx,
        trust_forwarded: config.server.trust_forwarded,
    };
    let dispatcher = NotificationDispatcher::new(runtime.store.clone(), config.dispatcher.clone())
        .context("Failed to build the notification dispatcher")?;

    let mut lifecycle = LifecycleManager::new(runtime.scheduler.clone());
    lifecycle.attach(Arc::new(Mutex::new(ApiServer::new(state, &config.server))));
    lifecycle.attach(Arc::new(Mutex::new(dispatcher)));
    lifecycle.start().await?;

    terminal::print_link("API", &format!("http://{}:{}", config.server.host, config.server.port));
    terminal::print_status("Data", &config.storage.data_dir.display().to_string());
    terminal::print_info("Press Ctrl+C to stop.");

    tokio::signal::ctrl_c().await?;
    lifecycle.shutdown().await
}
