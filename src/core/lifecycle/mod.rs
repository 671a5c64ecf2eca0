use anyhow::Result;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Init,
    ConnectTransports,
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

pub type SharedComponent = Arc<Mutex<dyn LifecycleComponent + Send + Sync>>;

pub struct LifecycleManager {
    state: LifecycleState,
    components: Vec<SharedComponent>,
}

impl Default for LifecycleManager {
    fn default() -> Self {
        Self::new()
    }
}

impl LifecycleManager {
    pub fn new() -> Self {
        Self {
            state: LifecycleState::Init,
            components: Vec::new(),
        }
    }

    pub fn attach(&mut self, component: SharedComponent) {
        self.components.push(component);
    }

    pub fn state(&self) -> LifecycleState {
        self.state
    }

    pub async fn start(&mut self) -> Result<()> {
        info!("Lifecycle Phase: Init");
        self.state = LifecycleState::Init;
        for comp in &self.components {
            comp.lock().await.on_init().await?;
        }

        info!("Lifecycle Phase: Connect Transports");
        self.state = LifecycleState::ConnectTransports;
        for comp in &self.components {
            comp.lock().await.on_start().await?;
        }

        info!("Lifecycle Phase: Ready");
        self.state = LifecycleState::Ready;
        Ok(())
    }

    /// Shut components down in reverse attach order. Errors are logged, not
    /// propagated, so every component gets its turn.
    pub async fn shutdown(&mut self) -> Result<()> {
        info!("Lifecycle Phase: Shutdown");
        self.state = LifecycleState::Shutdown;

        for comp in self.components.iter().rev() {
            if let Err(e) = comp.lock().await.on_shutdown().await {
                warn!("Component shutdown error: {}", e);
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    struct Recorder {
        name: &'static str,
        log: Arc<StdMutex<Vec<String>>>,
        fail_shutdown: bool,
    }

    #[async_trait::async_trait]
    impl LifecycleComponent for Recorder {
        async fn on_init(&mut self) -> Result<()> {
            self.log.lock().unwrap().push(format!("init:{}", self.name));
            Ok(())
        }
        async fn on_start(&mut self) -> Result<()> {
            self.log.lock().unwrap().push(format!("start:{}", self.name));
            Ok(())
        }
        async fn on_shutdown(&mut self) -> Result<()> {
            self.log.lock().unwrap().push(format!("stop:{}", self.name));
            if self.fail_shutdown {
                anyhow::bail!("boom");
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn phases_run_in_order_and_shutdown_reverses() {
        let log = Arc::new(StdMutex::new(Vec::new()));
        let mut manager = LifecycleManager::new();
        for (name, fail_shutdown) in [("a", true), ("b", false)] {
            manager.attach(Arc::new(Mutex::new(Recorder {
                name,
                log: log.clone(),
                fail_shutdown,
            })));
        }

        manager.start().await.unwrap();
        assert_eq!(manager.state(), LifecycleState::Ready);
        manager.shutdown().await.unwrap();
        assert_eq!(manager.state(), LifecycleState::Shutdown);

        assert_eq!(
            *log.lock().unwrap(),
            vec!["init:a", "init:b", "start:a", "start:b", "stop:b", "stop:a"]
        );
    }
}
