//! The job executor: starts executions and keeps at most one active per key.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, info};

use shipyard_config::ExecutorConfig;
use shipyard_core::{Error, Job, JobId, JobStatus, Reference, Result, Store};

use crate::execution::{JobExecution, WorkUnit};
use crate::queue::{QueueSender, execution_queue};
use crate::worker::Worker;

type ExecutionKey = (Reference, JobId);

/// Executions currently queued or running.
#[derive(Default)]
pub(crate) struct Registry {
    active: Mutex<HashMap<ExecutionKey, JobExecution>>,
}

impl Registry {
    fn entries(&self) -> std::sync::MutexGuard<'_, HashMap<ExecutionKey, JobExecution>> {
        self.active.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Drop the entry for `execution`, unless a newer execution took its key.
    pub(crate) fn release(&self, execution: &JobExecution) {
        let key = (execution.reference().clone(), execution.job_id());
        let mut active = self.entries();
        if active.get(&key).is_some_and(|e| e.same_as(execution)) {
            active.remove(&key);
        }
    }
}

/// Runs jobs on a fixed pool of workers.
///
/// Must be created inside a Tokio runtime. Dropping the executor lets the
/// workers finish what is queued and then stop.
pub struct JobExecutor {
    store: Arc<dyn Store>,
    registry: Arc<Registry>,
    queue: QueueSender,
}

impl JobExecutor {
    pub fn new(config: &ExecutorConfig, store: Arc<dyn Store>) -> Self {
        let (queue, receiver) = execution_queue();
        let registry = Arc::new(Registry::default());
        let workers = config.workers.max(1);

        for n in 0..workers {
            let worker = Worker::new(
                format!("worker-{}", n),
                receiver.clone(),
                registry.clone(),
                config.work_root.clone(),
            );
            tokio::spawn(worker.run());
        }
        info!(workers, "Job executor started");

        Self {
            store,
            registry,
            queue,
        }
    }

    /// Start `job` for `reference`, returning once it is queued.
    ///
    /// If an execution for the same reference and job is still active, that
    /// execution is returned and `work` is discarded. The stored job decides
    /// whether it may run: a job that already left `Pending` cannot be
    /// started again, whatever the caller's copy says.
    pub async fn start(
        &self,
        reference: Reference,
        job: Job,
        work: impl WorkUnit + 'static,
    ) -> Result<JobExecution> {
        let stored = self.store.get_job(job.id).await?;
        let key = (reference.clone(), job.id);
        let mut active = self.registry.entries();

        if let Some(existing) = active.get(&key) {
            if !existing.is_finished() {
                debug!(job_id = %job.id, reference = %reference, "Returning active execution");
                return Ok(existing.clone());
            }
        }

        if stored.status != JobStatus::Pending {
            return Err(Error::State(format!(
                "job {} is {} and cannot be started",
                stored.id, stored.status
            )));
        }

        let job_id = stored.id;
        let execution = JobExecution::new(reference, stored, Box::new(work), self.store.clone());
        if !self.queue.enqueue(execution.clone()) {
            return Err(Error::Internal("job executor has no workers".to_string()));
        }
        active.insert(key, execution.clone());
        info!(job_id = %job_id, reference = %execution.reference(), "Job queued");

        Ok(execution)
    }

    /// The active execution for a job, if any.
    pub fn active(&self, job_id: JobId) -> Option<JobExecution> {
        self.registry
            .entries()
            .values()
            .find(|e| e.job_id() == job_id)
            .cloned()
    }

    pub fn active_count(&self) -> usize {
        self.registry.entries().len()
    }

    /// Cancel the active execution for a job. Returns false if none is active.
    pub fn cancel(&self, job_id: JobId) -> bool {
        match self.active(job_id) {
            Some(execution) => {
                execution.cancel();
                true
            }
            None => {
                debug!(job_id = %job_id, "No active execution to cancel");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::{ExecutionObserver, work_fn};
    use shipyard_core::MemoryStore;
    use shipyard_core::output::OutputSink;
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::sync::Notify;

    fn config(workers: usize) -> ExecutorConfig {
        ExecutorConfig {
            workers,
            ..Default::default()
        }
    }

    async fn pending_job(store: &MemoryStore) -> Job {
        let job = Job::new("true", Reference::parse("main").unwrap(), None);
        store.create_job(&job).await.unwrap();
        job
    }

    fn setup(workers: usize) -> (Arc<MemoryStore>, JobExecutor) {
        let store = Arc::new(MemoryStore::new());
        let executor = JobExecutor::new(&config(workers), store.clone());
        (store, executor)
    }

    #[derive(Default)]
    struct Recorder {
        output: Mutex<String>,
        finished: AtomicUsize,
    }

    impl ExecutionObserver for Recorder {
        fn on_output(&self, text: &str) {
            self.output.lock().unwrap().push_str(text);
        }

        fn on_finished(&self, _job: &Job) {
            self.finished.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn test_successful_run_persists_status() {
        let (store, executor) = setup(2);
        let job = pending_job(&store).await;

        let execution = executor
            .start(
                job.reference.clone(),
                job.clone(),
                work_fn(|exec: JobExecution, _dir: PathBuf| async move {
                    exec.write("hello\n");
                    Ok(true)
                }),
            )
            .await
            .unwrap();

        let finished = execution.wait().await;
        assert_eq!(finished.status, JobStatus::Succeeded);
        assert!(finished.started_at.is_some());
        assert!(finished.finished_at.is_some());
        assert_eq!(execution.output().contents(), "hello\n");

        let stored = store.get_job(job.id).await.unwrap();
        assert_eq!(stored.status, JobStatus::Succeeded);
    }

    #[tokio::test]
    async fn test_outcomes_map_to_statuses() {
        let (store, executor) = setup(2);

        let failed = pending_job(&store).await;
        let failed = executor
            .start(
                failed.reference.clone(),
                failed,
                work_fn(|_: JobExecution, _: PathBuf| async { Ok(false) }),
            )
            .await
            .unwrap();

        let errored = pending_job(&store).await;
        let errored = executor
            .start(
                errored.reference.clone(),
                errored,
                work_fn(|_: JobExecution, _: PathBuf| async {
                    Err(Error::Execution("boom".to_string()))
                }),
            )
            .await
            .unwrap();

        assert_eq!(failed.wait().await.status, JobStatus::Failed);
        assert_eq!(errored.wait().await.status, JobStatus::Errored);
        assert!(errored.output().contents().contains("boom"));
    }

    #[tokio::test]
    async fn test_panicking_work_is_errored() {
        let (store, executor) = setup(1);
        let job = pending_job(&store).await;

        let execution = executor
            .start(
                job.reference.clone(),
                job,
                work_fn(|_: JobExecution, _: PathBuf| async {
                    if true {
                        panic!("kaboom");
                    }
                    Ok(true)
                }),
            )
            .await
            .unwrap();

        assert_eq!(execution.wait().await.status, JobStatus::Errored);
        assert!(execution.output().contents().contains("kaboom"));

        // The worker survives and keeps running jobs.
        let next = pending_job(&store).await;
        let next = executor
            .start(
                next.reference.clone(),
                next,
                work_fn(|_: JobExecution, _: PathBuf| async { Ok(true) }),
            )
            .await
            .unwrap();
        assert_eq!(next.wait().await.status, JobStatus::Succeeded);
    }

    #[tokio::test]
    async fn test_concurrent_start_runs_once() {
        let (store, executor) = setup(4);
        let job = pending_job(&store).await;
        let runs = Arc::new(AtomicUsize::new(0));
        let gate = Arc::new(Notify::new());

        let make_work = || {
            let runs = runs.clone();
            let gate = gate.clone();
            work_fn(move |_: JobExecution, _: PathBuf| {
                let runs = runs.clone();
                let gate = gate.clone();
                async move {
                    runs.fetch_add(1, Ordering::SeqCst);
                    gate.notified().await;
                    Ok(true)
                }
            })
        };

        let first = executor
            .start(job.reference.clone(), job.clone(), make_work())
            .await
            .unwrap();
        let second = executor
            .start(job.reference.clone(), job.clone(), make_work())
            .await
            .unwrap();
        assert!(first.same_as(&second));

        tokio::time::sleep(Duration::from_millis(20)).await;
        gate.notify_waiters();
        gate.notify_one();

        assert_eq!(first.wait().await.status, JobStatus::Succeeded);
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_finished_job_cannot_restart() {
        let (store, executor) = setup(1);
        let job = pending_job(&store).await;
        let execution = executor
            .start(
                job.reference.clone(),
                job.clone(),
                work_fn(|_: JobExecution, _: PathBuf| async { Ok(true) }),
            )
            .await
            .unwrap();
        let finished = execution.wait().await;

        let restart = executor.start(
            finished.reference.clone(),
            finished,
            work_fn(|_: JobExecution, _: PathBuf| async { Ok(true) }),
        )
        .await;
        assert!(matches!(restart, Err(Error::State(_))));
    }

    fn counting_work(runs: &Arc<AtomicUsize>) -> impl WorkUnit + 'static {
        let runs = runs.clone();
        work_fn(move |_: JobExecution, _: PathBuf| {
            let runs = runs.clone();
            async move {
                runs.fetch_add(1, Ordering::SeqCst);
                Ok(true)
            }
        })
    }

    #[tokio::test]
    async fn test_restart_with_pending_copy_runs_once() {
        let (store, executor) = setup(1);
        let job = pending_job(&store).await;
        let runs = Arc::new(AtomicUsize::new(0));

        let first = executor
            .start(job.reference.clone(), job.clone(), counting_work(&runs))
            .await
            .unwrap();
        assert_eq!(first.wait().await.status, JobStatus::Succeeded);

        // The caller still holds the Pending copy it started with.
        assert_eq!(job.status, JobStatus::Pending);
        let again = executor
            .start(job.reference.clone(), job.clone(), counting_work(&runs))
            .await;
        assert!(matches!(again, Err(Error::State(_))));

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert_eq!(
            store.get_job(job.id).await.unwrap().status,
            JobStatus::Succeeded
        );
    }

    #[tokio::test]
    async fn test_job_moved_on_while_queued_is_not_run() {
        let (store, executor) = setup(1);
        let gate = Arc::new(Notify::new());
        let runs = Arc::new(AtomicUsize::new(0));

        let blocker = pending_job(&store).await;
        let release = gate.clone();
        let blocking = executor
            .start(
                blocker.reference.clone(),
                blocker,
                work_fn(move |_: JobExecution, _: PathBuf| {
                    let release = release.clone();
                    async move {
                        release.notified().await;
                        Ok(true)
                    }
                }),
            )
            .await
            .unwrap();

        let job = pending_job(&store).await;
        let queued = executor
            .start(job.reference.clone(), job.clone(), counting_work(&runs))
            .await
            .unwrap();

        let mut elsewhere = store.get_job(job.id).await.unwrap();
        elsewhere.transition(JobStatus::Cancelled).unwrap();
        store
            .update_job(&elsewhere, JobStatus::Pending)
            .await
            .unwrap();
        gate.notify_one();

        assert_eq!(blocking.wait().await.status, JobStatus::Succeeded);
        let finished = queued.wait().await;
        assert_eq!(finished.status, JobStatus::Cancelled);
        assert_eq!(runs.load(Ordering::SeqCst), 0);
        assert!(queued.output().contents().contains("no longer pending"));
    }

    #[tokio::test]
    async fn test_late_on_complete_fires_exactly_once() {
        let (store, executor) = setup(1);
        let job = pending_job(&store).await;
        let calls = Arc::new(AtomicUsize::new(0));

        let execution = executor
            .start(
                job.reference.clone(),
                job,
                work_fn(|_: JobExecution, _: PathBuf| async { Ok(true) }),
            )
            .await
            .unwrap();

        let early = calls.clone();
        execution
            .on_complete(move |job| async move {
                assert!(job.status.is_terminal());
                early.fetch_add(1, Ordering::SeqCst);
            })
            .await;
        execution.wait().await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        let late = calls.clone();
        execution
            .on_complete(move |job| async move {
                assert_eq!(job.status, JobStatus::Succeeded);
                late.fetch_add(1, Ordering::SeqCst);
            })
            .await;
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_callbacks_run_in_registration_order() {
        let (store, executor) = setup(1);
        let job = pending_job(&store).await;
        let gate = Arc::new(Notify::new());
        let order = Arc::new(Mutex::new(Vec::new()));

        let release = gate.clone();
        let execution = executor
            .start(
                job.reference.clone(),
                job,
                work_fn(move |_: JobExecution, _: PathBuf| {
                    let release = release.clone();
                    async move {
                        release.notified().await;
                        Ok(true)
                    }
                }),
            )
            .await
            .unwrap();

        for n in 0..3 {
            let order = order.clone();
            execution
                .on_complete(move |_| async move { order.lock().unwrap().push(n) })
                .await;
        }
        gate.notify_one();

        execution.wait().await;
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn test_cancel_running_execution() {
        let (store, executor) = setup(1);
        let job = pending_job(&store).await;

        let execution = executor
            .start(
                job.reference.clone(),
                job.clone(),
                work_fn(|exec: JobExecution, _: PathBuf| async move {
                    exec.write("started\n");
                    tokio::time::sleep(Duration::from_secs(60)).await;
                    Ok(true)
                }),
            )
            .await
            .unwrap();

        while execution.status() != JobStatus::Running {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(executor.cancel(job.id));

        let finished = execution.wait().await;
        assert_eq!(finished.status, JobStatus::Cancelled);
        assert_eq!(
            store.get_job(job.id).await.unwrap().status,
            JobStatus::Cancelled
        );
    }

    #[tokio::test]
    async fn test_cancel_queued_execution_never_runs() {
        let (store, executor) = setup(1);
        let gate = Arc::new(Notify::new());
        let ran = Arc::new(AtomicUsize::new(0));

        let blocker = pending_job(&store).await;
        let release = gate.clone();
        let blocking = executor
            .start(
                blocker.reference.clone(),
                blocker,
                work_fn(move |_: JobExecution, _: PathBuf| {
                    let release = release.clone();
                    async move {
                        release.notified().await;
                        Ok(true)
                    }
                }),
            )
            .await
            .unwrap();

        let queued = pending_job(&store).await;
        let counter = ran.clone();
        let queued = executor
            .start(
                queued.reference.clone(),
                queued,
                work_fn(move |_: JobExecution, _: PathBuf| {
                    let counter = counter.clone();
                    async move {
                        counter.fetch_add(1, Ordering::SeqCst);
                        Ok(true)
                    }
                }),
            )
            .await
            .unwrap();

        queued.cancel();
        gate.notify_one();

        assert_eq!(blocking.wait().await.status, JobStatus::Succeeded);
        let cancelled = queued.wait().await;
        assert_eq!(cancelled.status, JobStatus::Cancelled);
        assert!(cancelled.started_at.is_none());
        assert_eq!(ran.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_working_directory_is_removed() {
        let root = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryStore::new());
        let executor = JobExecutor::new(
            &ExecutorConfig {
                workers: 1,
                work_root: Some(root.path().to_path_buf()),
            },
            store.clone(),
        );
        let job = pending_job(&store).await;
        let seen = Arc::new(Mutex::new(None));

        let record = seen.clone();
        let execution = executor
            .start(
                job.reference.clone(),
                job,
                work_fn(move |_: JobExecution, dir: PathBuf| {
                    let record = record.clone();
                    async move {
                        std::fs::write(dir.join("scratch"), b"data")?;
                        *record.lock().unwrap() = Some(dir);
                        Ok(true)
                    }
                }),
            )
            .await
            .unwrap();
        execution.wait().await;

        // Removal happens right after callbacks; give the worker a moment.
        tokio::time::sleep(Duration::from_millis(50)).await;
        let dir = seen.lock().unwrap().clone().unwrap();
        assert!(dir.starts_with(root.path()));
        assert!(!dir.exists());
    }

    #[tokio::test]
    async fn test_subscribe_replays_output_and_rejects_after_finish() {
        let (store, executor) = setup(1);
        let job = pending_job(&store).await;
        let gate = Arc::new(Notify::new());

        let release = gate.clone();
        let execution = executor
            .start(
                job.reference.clone(),
                job,
                work_fn(move |exec: JobExecution, _: PathBuf| {
                    let release = release.clone();
                    async move {
                        exec.write("before\n");
                        release.notified().await;
                        exec.write("after\n");
                        Ok(true)
                    }
                }),
            )
            .await
            .unwrap();

        while execution.output().is_empty() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        let recorder = Arc::new(Recorder::default());
        assert!(execution.subscribe(recorder.clone()));
        gate.notify_one();
        execution.wait().await;

        assert_eq!(*recorder.output.lock().unwrap(), "before\nafter\n");
        assert_eq!(recorder.finished.load(Ordering::SeqCst), 1);
        assert!(!execution.subscribe(Arc::new(Recorder::default())));
    }

    #[tokio::test]
    async fn test_registry_releases_finished_executions() {
        let (store, executor) = setup(1);
        let job = pending_job(&store).await;
        let execution = executor
            .start(
                job.reference.clone(),
                job.clone(),
                work_fn(|_: JobExecution, _: PathBuf| async { Ok(true) }),
            )
            .await
            .unwrap();
        assert!(executor.active(job.id).is_some());
        execution.wait().await;

        for _ in 0..100 {
            if executor.active_count() == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(executor.active(job.id).is_none());
        assert!(!executor.cancel(job.id));
    }
}
