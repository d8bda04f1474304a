pub(crate) mod auth;
mod error;
mod handlers;
mod router;

use anyhow::{Context, Result};
use async_trait::async_trait;
use axum::{
    Extension,
    extract::State,
    response::sse::{Event, Sse},
};
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_stream::Stream;
use tokio_stream::StreamExt;
use tokio_stream::wrappers::BroadcastStream;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::core::auth::{Authenticator, Identity};
use crate::core::config::ServerConfig;
use crate::core::error::CoreError;
use crate::core::jobs::JobScheduler;
use crate::core::lifecycle::LifecycleComponent;
use crate::core::operator::DataOperator;
use crate::core::store::{ADMIN_TENANT, SystemStore};
use error::ApiError;

#[derive(Clone)]
pub(crate) struct AppState {
    pub(crate) authenticator: Authenticator,
    pub(crate) operator: Arc<DataOperator>,
    pub(crate) store: SystemStore,
    /// Only set on the node that runs jobs.
    pub(crate) scheduler: Option<Arc<JobScheduler>>,
    pub(crate) log_tx: broadcast::Sender<String>,
    pub(crate) trust_forwarded: bool,
}

pub struct ApiServer {
    state: AppState,
    host: String,
    port: u16,
    cors_origins: Vec<String>,
    bound: Option<SocketAddr>,
    cancel: CancellationToken,
    worker: Option<JoinHandle<()>>,
}

impl ApiServer {
    pub(crate) fn new(state: AppState, config: &ServerConfig) -> Self {
        Self {
            state,
            host: config.host.clone(),
            port: config.port,
            cors_origins: config.cors_origins.clone(),
            bound: None,
            cancel: CancellationToken::new(),
            worker: None,
        }
    }

    /// Address the listener is bound to, once started.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.bound
    }
}

// --- SSE Logs (used by router) ---

async fn sse_logs_endpoint(
    State(state): State<AppState>,
    Extension(identity): Extension<Identity>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    if identity.tenant_id != ADMIN_TENANT {
        return Err(ApiError(CoreError::access_denied()));
    }
    let receiver = state.log_tx.subscribe();
    let stream = BroadcastStream::new(receiver).map(|msg| match msg {
        Ok(line) => Ok(Event::default().data(line)),
        Err(_) => Ok(Event::default().data("Log stream lagged")),
    });
    Ok(Sse::new(stream))
}

#[async_trait]
impl LifecycleComponent for ApiServer {
    async fn on_init(&mut self) -> Result<()> {
        info!("API server initializing...");
        Ok(())
    }

    async fn on_start(&mut self) -> Result<()> {
        let addr = format!("{}:{}", self.host, self.port);
        let listener = tokio::net::TcpListener::bind(&addr)
            .await
            .with_context(|| format!("Failed to bind API server to {}", addr))?;
        let bound = listener.local_addr()?;
        self.bound = Some(bound);

        let cors = router::build_cors(bound.port(), &self.cors_origins);
        let app = router::build_api_router(self.state.clone(), cors);
        let cancel = self.cancel.clone();
        info!("API server running at http://{}", bound);

        self.worker = Some(tokio::spawn(async move {
            let served = axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
                .with_graceful_shutdown(async move { cancel.cancelled().await })
                .await;
            if let Err(e) = served {
                error!("API server crashed: {}", e);
            }
        }));
        Ok(())
    }

    async fn on_shutdown(&mut self) -> Result<()> {
        info!("API server shutting down...");
        self.cancel.cancel();
        if let Some(worker) = self.worker.take() {
            worker.await?;
        }
        Ok(())
    }
}
