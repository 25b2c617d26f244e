//! A single running (or queued) job and everything attached to it.

use async_trait::async_trait;
use futures::FutureExt;
use futures::future::BoxFuture;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::watch;
use tracing::{Instrument, debug, error, info, info_span, warn};

use shipyard_core::output::OutputSink;
use shipyard_core::{Job, JobId, JobStatus, Reference, Result, Store};

use crate::output::OutputBuffer;

/// The work an execution performs inside its scratch directory.
///
/// `Ok(true)` means success, `Ok(false)` an anticipated failure. Errors and
/// panics mark the job errored.
#[async_trait]
pub trait WorkUnit: Send + Sync {
    async fn run(&self, execution: &JobExecution, dir: &Path) -> Result<bool>;
}

/// Adapts an async closure into a [`WorkUnit`].
pub struct WorkFn<F>(F);

pub fn work_fn<F, Fut>(f: F) -> WorkFn<F>
where
    F: Fn(JobExecution, PathBuf) -> Fut + Send + Sync,
    Fut: Future<Output = Result<bool>> + Send,
{
    WorkFn(f)
}

#[async_trait]
impl<F, Fut> WorkUnit for WorkFn<F>
where
    F: Fn(JobExecution, PathBuf) -> Fut + Send + Sync,
    Fut: Future<Output = Result<bool>> + Send,
{
    async fn run(&self, execution: &JobExecution, dir: &Path) -> Result<bool> {
        (self.0)(execution.clone(), dir.to_path_buf()).await
    }
}

/// Receives output and the finish event of an execution.
pub trait ExecutionObserver: Send + Sync {
    fn on_output(&self, text: &str);
    fn on_finished(&self, job: &Job);
}

type CompletionCallback = Box<dyn FnOnce(Job) -> BoxFuture<'static, ()> + Send>;

struct State {
    job: Job,
    finished: bool,
    observers: Vec<Arc<dyn ExecutionObserver>>,
    callbacks: Vec<CompletionCallback>,
}

struct Inner {
    reference: Reference,
    store: Arc<dyn Store>,
    output: OutputBuffer,
    state: Mutex<State>,
    work: Mutex<Option<Box<dyn WorkUnit>>>,
    cancel: watch::Sender<bool>,
    done: watch::Sender<Option<Job>>,
}

/// Handle to a job execution. Cheap to clone; all clones share state.
#[derive(Clone)]
pub struct JobExecution {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for JobExecution {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobExecution")
            .field("job_id", &self.job_id())
            .field("reference", &self.inner.reference)
            .field("status", &self.status())
            .finish()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl JobExecution {
    pub(crate) fn new(
        reference: Reference,
        job: Job,
        work: Box<dyn WorkUnit>,
        store: Arc<dyn Store>,
    ) -> Self {
        let (cancel, _) = watch::channel(false);
        let (done, _) = watch::channel(None);
        Self {
            inner: Arc::new(Inner {
                reference,
                store,
                output: OutputBuffer::new(),
                state: Mutex::new(State {
                    job,
                    finished: false,
                    observers: Vec::new(),
                    callbacks: Vec::new(),
                }),
                work: Mutex::new(Some(work)),
                cancel,
                done,
            }),
        }
    }

    pub fn job_id(&self) -> JobId {
        lock(&self.inner.state).job.id
    }

    pub fn reference(&self) -> &Reference {
        &self.inner.reference
    }

    /// Snapshot of the job as this execution sees it.
    pub fn job(&self) -> Job {
        lock(&self.inner.state).job.clone()
    }

    pub fn status(&self) -> JobStatus {
        lock(&self.inner.state).job.status
    }

    pub fn is_finished(&self) -> bool {
        lock(&self.inner.state).finished
    }

    pub fn output(&self) -> &OutputBuffer {
        &self.inner.output
    }

    /// Whether two handles refer to the same execution.
    pub fn same_as(&self, other: &JobExecution) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Attach an observer. Output written so far is replayed to it first.
    /// Returns false, without attaching, once the execution has finished.
    pub fn subscribe(&self, observer: Arc<dyn ExecutionObserver>) -> bool {
        let mut state = lock(&self.inner.state);
        if state.finished {
            return false;
        }
        let existing = self.inner.output.contents();
        if !existing.is_empty() {
            observer.on_output(&existing);
        }
        state.observers.push(observer);
        true
    }

    /// Register a callback for the finished job. Callbacks run in registration
    /// order, exactly once. Registering after the finish runs the callback
    /// right away.
    ///
    /// A callback must not wait on this same execution.
    pub async fn on_complete<F, Fut>(&self, callback: F)
    where
        F: FnOnce(Job) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let finished_job = {
            let mut state = lock(&self.inner.state);
            if state.finished {
                Some(state.job.clone())
            } else {
                state
                    .callbacks
                    .push(Box::new(move |job| callback(job).boxed()));
                return;
            }
        };
        if let Some(job) = finished_job {
            run_callback(callback(job).boxed()).await;
        }
    }

    /// Request cancellation. A queued execution finishes as cancelled without
    /// running; a running one has its work dropped.
    pub fn cancel(&self) {
        if !self.is_finished() {
            info!(job_id = %self.job_id(), "Cancellation requested");
        }
        self.inner.cancel.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.inner.cancel.borrow()
    }

    /// Wait until the job is terminal and its completion callbacks have run.
    pub async fn wait(&self) -> Job {
        let mut rx = self.inner.done.subscribe();
        loop {
            let current = rx.borrow_and_update().clone();
            if let Some(job) = current {
                return job;
            }
            if rx.changed().await.is_err() {
                return self.job();
            }
        }
    }

    pub(crate) async fn run(&self, work_root: Option<&Path>) {
        let span = info_span!(
            "job_execution",
            job_id = %self.job_id(),
            reference = %self.inner.reference
        );
        self.execute(work_root).instrument(span).await
    }

    async fn execute(&self, work_root: Option<&Path>) {
        let work = lock(&self.inner.work).take();
        let Some(work) = work else {
            warn!("Execution already ran");
            return;
        };

        let mut cancel_rx = self.inner.cancel.subscribe();
        let cancelled_early = *cancel_rx.borrow_and_update();
        if cancelled_early {
            self.write("Cancelled before start\n");
            self.finish(JobStatus::Cancelled).await;
            return;
        }

        let dir = match scratch_dir(work_root) {
            Ok(dir) => dir,
            Err(e) => {
                error!(error = %e, "Failed to create working directory");
                self.write(&format!("Failed to create working directory: {}\n", e));
                self.finish(JobStatus::Errored).await;
                return;
            }
        };
        debug!(dir = %dir.path().display(), "Created working directory");

        if !self.transition(JobStatus::Running).await {
            self.write("Job is no longer pending, not running it\n");
            if let Ok(stored) = self.inner.store.get_job(self.job_id()).await {
                lock(&self.inner.state).job = stored;
            }
            self.complete().await;
            if let Err(e) = dir.close() {
                warn!(error = %e, "Failed to remove working directory");
            }
            return;
        }

        let status = tokio::select! {
            outcome = AssertUnwindSafe(work.run(self, dir.path())).catch_unwind() => match outcome {
                Ok(Ok(true)) => JobStatus::Succeeded,
                Ok(Ok(false)) => JobStatus::Failed,
                Ok(Err(e)) => {
                    error!(error = %e, "Work unit failed");
                    self.write(&format!("Error: {}\n", e));
                    JobStatus::Errored
                }
                Err(panic) => {
                    let message = panic_message(&*panic);
                    error!(panic = %message, "Work unit panicked");
                    self.write(&format!("Error: {}\n", message));
                    JobStatus::Errored
                }
            },
            _ = cancel_rx.wait_for(|cancelled| *cancelled) => {
                self.write("Cancelled\n");
                JobStatus::Cancelled
            }
        };

        self.finish(status).await;

        if let Err(e) = dir.close() {
            warn!(error = %e, "Failed to remove working directory");
        }
    }

    /// Move the job to `next` and persist it. Returns false when the move is
    /// rejected locally or the stored job was no longer where this one was.
    async fn transition(&self, next: JobStatus) -> bool {
        let (job, expected) = {
            let mut state = lock(&self.inner.state);
            let expected = state.job.status;
            if let Err(e) = state.job.transition(next) {
                warn!(error = %e, "Rejected job transition");
                return false;
            }
            (state.job.clone(), expected)
        };
        if let Err(e) = self.inner.store.update_job(&job, expected).await {
            error!(error = %e, status = %next, "Failed to persist job status");
            return false;
        }
        true
    }

    async fn finish(&self, status: JobStatus) {
        self.transition(status).await;
        self.complete().await;
    }

    /// Mark the execution finished and notify observers and callbacks.
    async fn complete(&self) {
        let (job, observers, callbacks) = {
            let mut state = lock(&self.inner.state);
            state.finished = true;
            (
                state.job.clone(),
                std::mem::take(&mut state.observers),
                std::mem::take(&mut state.callbacks),
            )
        };
        info!(status = %job.status, "Job finished");

        for observer in observers {
            observer.on_finished(&job);
        }
        for callback in callbacks {
            run_callback(callback(job.clone())).await;
        }
        self.inner.done.send_replace(Some(job));
    }
}

impl OutputSink for JobExecution {
    fn write(&self, text: &str) {
        if text.is_empty() {
            return;
        }
        let state = lock(&self.inner.state);
        self.inner.output.append(text);
        for observer in &state.observers {
            observer.on_output(text);
        }
    }
}

async fn run_callback(callback: BoxFuture<'static, ()>) {
    if let Err(panic) = AssertUnwindSafe(callback).catch_unwind().await {
        error!(panic = %panic_message(&*panic), "Completion callback panicked");
    }
}

fn scratch_dir(work_root: Option<&Path>) -> std::io::Result<tempfile::TempDir> {
    let mut builder = tempfile::Builder::new();
    builder.prefix("shipyard-job-");
    match work_root {
        Some(root) => {
            std::fs::create_dir_all(root)?;
            builder.tempdir_in(root)
        }
        None => builder.tempdir(),
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "work unit panicked".to_string()
    }
}
