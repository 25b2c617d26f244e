//! Worker that runs executions from the queue.

use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info};

use crate::engine::Registry;
use crate::queue::QueueReceiver;

/// A worker that claims and runs executions, one at a time.
pub struct Worker {
    id: String,
    queue: QueueReceiver,
    registry: Arc<Registry>,
    work_root: Option<PathBuf>,
}

impl Worker {
    pub(crate) fn new(
        id: impl Into<String>,
        queue: QueueReceiver,
        registry: Arc<Registry>,
        work_root: Option<PathBuf>,
    ) -> Self {
        Self {
            id: id.into(),
            queue,
            registry,
            work_root,
        }
    }

    /// Run the worker loop until the queue closes.
    pub async fn run(self) {
        debug!(worker_id = %self.id, "Starting worker");

        while let Some(execution) = self.queue.claim().await {
            info!(worker_id = %self.id, job_id = %execution.job_id(), "Claimed execution");
            execution.run(self.work_root.as_deref()).await;
            self.registry.release(&execution);
        }

        debug!(worker_id = %self.id, "Queue closed, worker exiting");
    }
}
