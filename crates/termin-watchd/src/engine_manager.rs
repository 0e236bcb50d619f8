use std::sync::Arc;

use tokio::task::JoinHandle;
use tracing::info;

use appointment_scan::CheckExecutor;

/// Owns the background check task and guarantees it is torn down on
/// shutdown, whether via `stop` or by being dropped.
pub struct EngineManager {
    handle: Option<JoinHandle<()>>,
}

impl EngineManager {
    /// Create a manager with nothing running.
    pub fn new() -> Self {
        Self { handle: None }
    }

    /// Spawn the check loop in a background task.
    pub fn start(&mut self, executor: Arc<CheckExecutor>) {
        info!("starting check execution system");

        let handle = tokio::spawn(async move {
            executor.run().await;
        });
        self.handle = Some(handle);
    }

    /// Abort the check loop and wait for it to wind down.
    pub async fn stop(&mut self) {
        info!("stopping check execution system");

        if let Some(handle) = self.handle.take() {
            handle.abort();
            let _ = handle.await;
        }
    }
}

impl Drop for EngineManager {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}
