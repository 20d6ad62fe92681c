//! Join request lifecycle: the controller state machine and its timeouts.

pub mod controller;
pub mod scheduler;

pub use controller::{Controller, LifecycleSettings};
pub use scheduler::{TimeoutJob, TokioScheduler};

use std::sync::Arc;

use tokio::sync::{broadcast, mpsc};

/// Feed fired timeouts into the controller until shutdown
pub async fn run_timeouts(
    controller: Arc<Controller>,
    mut fired: mpsc::UnboundedReceiver<TimeoutJob>,
    mut shutdown: broadcast::Receiver<()>,
) {
    loop {
        tokio::select! {
            job = fired.recv() => {
                let Some(job) = job else { break };
                let controller = controller.clone();
                tokio::spawn(async move {
                    controller.handle_timeout(&job, chrono::Utc::now()).await;
                });
            }
            _ = shutdown.recv() => {
                tracing::info!("Timeout dispatcher shutting down");
                break;
            }
        }
    }
}
