use anyhow::Result;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::core::jobs::JobScheduler;

#[derive(Debug, PartialEq)]
pub enum LifecycleState {
    Init,
    LoadJobs,
    Ready,
    Shutdown,
}

#[async_trait::async_trait]
pub trait LifecycleComponent {
    async fn on_init(&mut self) -> Result<()> {
        Ok(())
    }
    async fn on_start(&mut self) -> Result<()> {
        Ok(())
    }
    async fn on_shutdown(&mut self) -> Result<()> {
        Ok(())
    }
}

pub struct LifecycleManager {
    state: LifecycleState,
    components: Vec<Arc<Mutex<dyn LifecycleComponent + Send + Sync>>>,
    scheduler: Option<Arc<JobScheduler>>,
}

impl LifecycleManager {
    /// `scheduler` is only set on the node that runs jobs.
    pub fn new(scheduler: Option<Arc<JobScheduler>>) -> Self {
        Self {
            state: LifecycleState::Init,
            components: Vec::new(),
            scheduler,
        }
    }

    pub fn attach(&mut self, component: Arc<Mutex<dyn LifecycleComponent + Send + Sync>>) {
        self.components.push(component);
    }

    pub fn state(&self) -> &LifecycleState {
        &self.state
    }

    pub async fn start(&mut self) -> Result<()> {
        info!("Lifecycle Phase: Init");
        self.state = LifecycleState::Init;
        for comp in &self.components {
            comp.lock().await.on_init().await?;
        }

        info!("Lifecycle Phase: Load Jobs");
        self.state = LifecycleState::LoadJobs;
        if let Some(scheduler) = &self.scheduler {
            scheduler.load_persisted().await?;
        }

        for comp in &self.components {
            comp.lock().await.on_start().await?;
        }

        if let Some(scheduler) = &self.scheduler {
            info!("Lifecycle Phase: Ready (Starting Scheduler)");
            scheduler.start().await?;
        } else {
            info!("Lifecycle Phase: Ready");
        }
        self.state = LifecycleState::Ready;

        Ok(())
    }

    pub async fn shutdown(&mut self) -> Result<()> {
        info!("Lifecycle Phase: Shutdown");
        self.state = LifecycleState::Shutdown;

        for comp in &self.components {
            if let Err(e) = comp.lock().await.on_shutdown().await {
                warn!("Component shutdown error: {}", e);
            }
        }
        if let Some(scheduler) = &self.scheduler {
            if let Err(e) = scheduler.shutdown().await {
                warn!("Scheduler shutdown error: {}", e);
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Recorder {
        calls: Vec<&'static str>,
    }

    #[async_trait::async_trait]
    impl LifecycleComponent for Recorder {
        async fn on_init(&mut self) -> Result<()> {
            self.calls.push("init");
            Ok(())
        }
        async fn on_start(&mut self) -> Result<()> {
            self.calls.push("start");
            Ok(())
        }
        async fn on_shutdown(&mut self) -> Result<()> {
            self.calls.push("shutdown");
            Ok(())
        }
    }

    #[tokio::test]
    async fn components_see_every_phase_in_order() {
        let recorder = Arc::new(Mutex::new(Recorder::default()));
        let mut lifecycle = LifecycleManager::new(None);
        lifecycle.attach(recorder.clone());

        lifecycle.start().await.unwrap();
        assert_eq!(lifecycle.state(), &LifecycleState::Ready);
        lifecycle.shutdown().await.unwrap();
        assert_eq!(lifecycle.state(), &LifecycleState::Shutdown);
        assert_eq!(recorder.lock().await.calls, vec!["init", "start", "shutdown"]);
    }
}
