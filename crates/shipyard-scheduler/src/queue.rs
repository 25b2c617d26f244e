//! In-memory queue feeding executions to workers.

use std::sync::Arc;
use tokio::sync::{Mutex, mpsc};

use crate::execution::JobExecution;

/// Producer side, owned by the engine. Dropping it lets workers drain and stop.
#[derive(Clone)]
pub struct QueueSender {
    tx: mpsc::UnboundedSender<JobExecution>,
}

/// Consumer side, shared by all workers.
#[derive(Clone)]
pub struct QueueReceiver {
    rx: Arc<Mutex<mpsc::UnboundedReceiver<JobExecution>>>,
}

pub fn execution_queue() -> (QueueSender, QueueReceiver) {
    let (tx, rx) = mpsc::unbounded_channel();
    (
        QueueSender { tx },
        QueueReceiver {
            rx: Arc::new(Mutex::new(rx)),
        },
    )
}

impl QueueSender {
    /// Enqueue an execution. Returns false when no worker is left to run it.
    pub fn enqueue(&self, execution: JobExecution) -> bool {
        self.tx.send(execution).is_ok()
    }
}

impl QueueReceiver {
    /// Claim the next execution, waiting until one arrives. `None` once the
    /// queue is closed and drained.
    pub async fn claim(&self) -> Option<JobExecution> {
        self.rx.lock().await.recv().await
    }
}
