//! Admission scheduler
//!
//! Bounds the number of jobs holding an execution slot and queues the rest in
//! strict arrival order. The active set, the queue and the job table sit behind
//! one mutex, which is never held across an await.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use chrono::Utc;
use serde::Serialize;
use tracing::{debug, error, info};

use crate::core::languages::LanguageProfile;
use crate::core::outcome::{ExecutionResult, FailureKind};
use crate::engine::runner::Runner;
use crate::jobs::job::ExecutionJob;
use crate::jobs::{JobId, SubmissionRequest};

/// Default number of jobs allowed to run at once
pub const DEFAULT_MAX_CONCURRENT: usize = 5;
/// How long finished jobs stay queryable (1 hour)
pub const DEFAULT_RETENTION: Duration = Duration::from_secs(3600);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueStatus {
    pub active: usize,
    pub queued: usize,
    pub max_concurrent: usize,
}

struct QueueEntry {
    job: Arc<ExecutionJob>,
    enqueued_at: Instant,
}

#[derive(Default)]
struct SchedulerState {
    /// Jobs whose driver task holds a slot
    active: HashSet<JobId>,
    queue: VecDeque<QueueEntry>,
    /// Every job still retained, live or finished
    jobs: HashMap<JobId, Arc<ExecutionJob>>,
}

pub struct AdmissionScheduler {
    runner: Arc<dyn Runner>,
    max_concurrent: usize,
    retention: Duration,
    state: Mutex<SchedulerState>,
}

impl AdmissionScheduler {
    pub fn new(runner: Arc<dyn Runner>, max_concurrent: usize, retention: Duration) -> Arc<Self> {
        Arc::new(Self {
            runner,
            max_concurrent: max_concurrent.max(1),
            retention,
            state: Mutex::new(SchedulerState::default()),
        })
    }

    pub fn max_concurrent(&self) -> usize {
        self.max_concurrent
    }

    /// Create a job and start it now, or queue it behind earlier arrivals
    pub fn submit(
        self: &Arc<Self>,
        request: SubmissionRequest,
        profile: Arc<LanguageProfile>,
    ) -> Arc<ExecutionJob> {
        let job = ExecutionJob::new(request, profile);
        let id = job.id().clone();

        let position = {
            let mut state = self.lock();
            self.evict_expired(&mut state);
            state.jobs.insert(id.clone(), Arc::clone(&job));

            if state.active.len() < self.max_concurrent {
                state.active.insert(id.clone());
                job.mark_starting();
                None
            } else {
                state.queue.push_back(QueueEntry {
                    job: Arc::clone(&job),
                    enqueued_at: Instant::now(),
                });
                Some(state.queue.len())
            }
        };

        match position {
            None => self.spawn_driver(Arc::clone(&job)),
            Some(position) => info!(
                "Job {} ({}) queued at position {}",
                id,
                job.profile().id,
                position
            ),
        }

        job
    }

    /// Cancel a queued or running job
    ///
    /// Returns false when the job is unknown or already finished.
    pub fn cancel(&self, id: &JobId) -> bool {
        let mut state = self.lock();

        if let Some(index) = state.queue.iter().position(|entry| entry.job.id() == id) {
            let cancelled = state
                .queue
                .remove(index)
                .map(|entry| entry.job.request_cancel())
                .unwrap_or(false);
            if cancelled {
                info!("Job {} cancelled while queued", id);
            }
            return cancelled;
        }

        match state.jobs.get(id) {
            Some(job) => {
                let cancelled = job.request_cancel();
                if cancelled {
                    info!("Job {} cancelled while running", id);
                }
                cancelled
            }
            None => false,
        }
    }

    pub fn queue_status(&self) -> QueueStatus {
        let state = self.lock();
        QueueStatus {
            active: state.active.len(),
            queued: state.queue.len(),
            max_concurrent: self.max_concurrent,
        }
    }

    pub fn job(&self, id: &JobId) -> Option<Arc<ExecutionJob>> {
        self.lock().jobs.get(id).cloned()
    }

    /// 1-based position in the queue, if the job is waiting
    pub fn queue_position(&self, id: &JobId) -> Option<usize> {
        self.lock()
            .queue
            .iter()
            .position(|entry| entry.job.id() == id)
            .map(|index| index + 1)
    }

    fn spawn_driver(self: &Arc<Self>, job: Arc<ExecutionJob>) {
        let scheduler = Arc::clone(self);
        tokio::spawn(async move { scheduler.drive(job).await });
    }

    /// Run one job in its slot, record the result, then hand the slot on
    async fn drive(self: Arc<Self>, job: Arc<ExecutionJob>) {
        let id = job.id().clone();
        info!(
            "Starting job {} ({}, requester: {})",
            id,
            job.profile().id,
            job.request().requester_id.as_deref().unwrap_or("anonymous")
        );

        // A separate task so a panicking runner cannot take the slot with it
        let runner = Arc::clone(&self.runner);
        let task_job = Arc::clone(&job);
        let handle = tokio::spawn(async move {
            let request = task_job.run_request();
            runner
                .run(&request, &*task_job, task_job.cancellation_token())
                .await
        });

        let result = match handle.await {
            Ok(result) => result,
            Err(e) => {
                error!("Runner for job {} aborted: {}", id, e);
                ExecutionResult::failed(
                    FailureKind::EnvironmentError,
                    "Execution aborted by an internal error",
                )
            }
        };

        match result.failure {
            Some(kind) if kind.is_infrastructure() => {
                error!("Job {} hit an environment error: {}", id, result.message)
            }
            _ => {}
        }

        job.finish(result);
        info!("Job {} finished as {}", id, job.status());

        self.release(&id);
    }

    /// Free a slot and promote the oldest queued jobs into free capacity
    fn release(self: &Arc<Self>, id: &JobId) {
        let promoted = {
            let mut state = self.lock();
            state.active.remove(id);

            let mut promoted = Vec::new();
            while state.active.len() < self.max_concurrent {
                let Some(entry) = state.queue.pop_front() else {
                    break;
                };
                if entry.job.is_terminal() {
                    continue;
                }
                debug!(
                    "Promoting job {} after {} ms in queue",
                    entry.job.id(),
                    entry.enqueued_at.elapsed().as_millis()
                );
                state.active.insert(entry.job.id().clone());
                entry.job.mark_starting();
                promoted.push(entry.job);
            }
            promoted
        };

        for job in promoted {
            self.spawn_driver(job);
        }
    }

    /// Drop finished jobs older than the retention window
    fn evict_expired(&self, state: &mut SchedulerState) {
        let now = Utc::now();
        let retention = self.retention;
        let SchedulerState { active, jobs, .. } = state;

        let before = jobs.len();
        jobs.retain(|id, job| {
            if active.contains(id) {
                return true;
            }
            match job.ended_at() {
                Some(ended) => (now - ended)
                    .to_std()
                    .map(|age| age <= retention)
                    .unwrap_or(true),
                None => true,
            }
        });
        let evicted = before - jobs.len();
        if evicted > 0 {
            debug!("Evicted {} finished jobs", evicted);
        }
    }

    fn lock(&self) -> MutexGuard<'_, SchedulerState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::languages::LanguageRegistry;
    use crate::core::outcome::OutputChunk;
    use crate::engine::runner::{RunPhase, RunRequest, RunSink};
    use crate::jobs::JobStatus;
    use async_trait::async_trait;
    use tokio::sync::Notify;
    use tokio_util::sync::CancellationToken;

    /// Runs until its source label is released or the job is cancelled
    #[derive(Default)]
    struct GatedRunner {
        gates: Mutex<HashMap<String, Arc<Notify>>>,
        started: Mutex<Vec<String>>,
    }

    impl GatedRunner {
        fn gate(&self, label: &str) -> Arc<Notify> {
            Arc::clone(
                self.gates
                    .lock()
                    .unwrap()
                    .entry(label.to_string())
                    .or_default(),
            )
        }

        fn open(&self, label: &str) {
            self.gate(label).notify_one();
        }

        fn started(&self) -> Vec<String> {
            self.started.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Runner for GatedRunner {
        async fn run(
            &self,
            request: &RunRequest,
            sink: &dyn RunSink,
            cancel: &CancellationToken,
        ) -> ExecutionResult {
            let label = request.source_code.clone();
            self.started.lock().unwrap().push(label.clone());
            sink.phase(RunPhase::Running);
            sink.output(OutputChunk::stdout(format!("{}\n", label)));

            let gate = self.gate(&label);
            tokio::select! {
                _ = gate.notified() => ExecutionResult {
                    success: true,
                    stdout: format!("{}\n", label),
                    exit_code: Some(0),
                    failure: None,
                    message: "Execution completed".into(),
                    ..ExecutionResult::failed(FailureKind::RuntimeError, "")
                },
                _ = cancel.cancelled() => ExecutionResult::cancelled(String::new(), String::new(), 0),
            }
        }
    }

    struct PanickingRunner;

    #[async_trait]
    impl Runner for PanickingRunner {
        async fn run(
            &self,
            _request: &RunRequest,
            _sink: &dyn RunSink,
            _cancel: &CancellationToken,
        ) -> ExecutionResult {
            panic!("runner bug");
        }
    }

    fn profile() -> Arc<LanguageProfile> {
        LanguageRegistry::builtin().unwrap().get("python").unwrap()
    }

    async fn wait_until(mut condition: impl FnMut() -> bool) {
        for _ in 0..500 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached in time");
    }

    #[tokio::test]
    async fn test_capacity_and_fifo_promotion() {
        let runner = Arc::new(GatedRunner::default());
        let scheduler = AdmissionScheduler::new(runner.clone(), 2, DEFAULT_RETENTION);

        let jobs: Vec<_> = ["a", "b", "c", "d"]
            .iter()
            .map(|label| scheduler.submit(SubmissionRequest::new("python", *label), profile()))
            .collect();

        wait_until(|| runner.started().len() == 2).await;
        assert_eq!(runner.started(), vec!["a", "b"]);
        assert_eq!(
            scheduler.queue_status(),
            QueueStatus {
                active: 2,
                queued: 2,
                max_concurrent: 2
            }
        );
        wait_until(|| jobs[1].status() == JobStatus::Running).await;
        assert_eq!(jobs[0].status(), JobStatus::Running);
        assert_eq!(jobs[2].status(), JobStatus::Pending);
        assert_eq!(scheduler.queue_position(jobs[2].id()), Some(1));
        assert_eq!(scheduler.queue_position(jobs[3].id()), Some(2));
        assert_eq!(scheduler.queue_position(jobs[0].id()), None);

        runner.open("a");
        wait_until(|| runner.started().len() == 3).await;
        assert_eq!(runner.started()[2], "c");
        assert_eq!(jobs[0].status(), JobStatus::Completed);
        assert_eq!(jobs[3].status(), JobStatus::Pending);
        assert_eq!(scheduler.queue_status().queued, 1);
        assert_eq!(scheduler.queue_position(jobs[3].id()), Some(1));

        for label in ["b", "c", "d"] {
            runner.open(label);
        }
        wait_until(|| jobs.iter().all(|job| job.is_terminal())).await;
        wait_until(|| scheduler.queue_status().active == 0).await;
        assert_eq!(runner.started(), vec!["a", "b", "c", "d"]);
    }

    #[tokio::test]
    async fn test_cancel_queued_job_never_starts() {
        let runner = Arc::new(GatedRunner::default());
        let scheduler = AdmissionScheduler::new(runner.clone(), 1, DEFAULT_RETENTION);

        let first = scheduler.submit(SubmissionRequest::new("python", "first"), profile());
        let queued = scheduler.submit(SubmissionRequest::new("python", "queued"), profile());

        assert!(scheduler.cancel(queued.id()));
        assert!(!scheduler.cancel(queued.id()));
        assert_eq!(queued.status(), JobStatus::Cancelled);
        assert_eq!(scheduler.queue_status().queued, 0);

        runner.open("first");
        wait_until(|| first.is_terminal()).await;
        wait_until(|| scheduler.queue_status().active == 0).await;
        assert_eq!(runner.started(), vec!["first"]);
    }

    #[tokio::test]
    async fn test_cancel_running_job_frees_slot() {
        let runner = Arc::new(GatedRunner::default());
        let scheduler = AdmissionScheduler::new(runner.clone(), 1, DEFAULT_RETENTION);

        let running = scheduler.submit(SubmissionRequest::new("python", "slow"), profile());
        let next = scheduler.submit(SubmissionRequest::new("python", "next"), profile());
        wait_until(|| running.snapshot(None).output_so_far == "slow\n").await;

        assert!(scheduler.cancel(running.id()));
        assert!(!scheduler.cancel(running.id()));

        let result = running.result().unwrap();
        assert_eq!(running.status(), JobStatus::Cancelled);
        assert_eq!(result.stdout, "slow\n");

        wait_until(|| runner.started().len() == 2).await;
        assert_eq!(runner.started()[1], "next");
        runner.open("next");
        wait_until(|| next.status() == JobStatus::Completed).await;
    }

    #[tokio::test]
    async fn test_cancel_unknown_job() {
        let scheduler =
            AdmissionScheduler::new(Arc::new(GatedRunner::default()), 1, DEFAULT_RETENTION);
        assert!(!scheduler.cancel(&JobId::from("missing")));
    }

    #[tokio::test]
    async fn test_runner_panic_fails_job_and_frees_slot() {
        let scheduler = AdmissionScheduler::new(Arc::new(PanickingRunner), 1, DEFAULT_RETENTION);
        let job = scheduler.submit(SubmissionRequest::new("python", "boom"), profile());

        wait_until(|| job.is_terminal()).await;
        assert_eq!(job.status(), JobStatus::Failed);
        assert_eq!(
            job.result().unwrap().failure,
            Some(FailureKind::EnvironmentError)
        );
        wait_until(|| scheduler.queue_status().active == 0).await;
    }

    #[tokio::test]
    async fn test_finished_jobs_are_evicted_after_retention() {
        let runner = Arc::new(GatedRunner::default());
        let scheduler = AdmissionScheduler::new(runner.clone(), 1, Duration::ZERO);

        let old = scheduler.submit(SubmissionRequest::new("python", "old"), profile());
        runner.open("old");
        wait_until(|| old.is_terminal()).await;
        wait_until(|| scheduler.queue_status().active == 0).await;
        tokio::time::sleep(Duration::from_millis(10)).await;

        let fresh = scheduler.submit(SubmissionRequest::new("python", "fresh"), profile());
        assert!(scheduler.job(old.id()).is_none());
        assert!(scheduler.job(fresh.id()).is_some());
        runner.open("fresh");
    }
}
