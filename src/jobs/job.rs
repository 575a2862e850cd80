//! Execution job state machine
//!
//! A job is created `pending`, moves through `starting`, optional `compiling`
//! and `running`, and ends in exactly one of `completed`, `failed` or
//! `cancelled`. Every transition and every output chunk is appended to an
//! event log that streamers replay and then follow.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;

use chrono::{DateTime, Utc};
use futures_util::Stream;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use crate::core::languages::LanguageProfile;
use crate::core::outcome::{ExecutionResult, OutputChunk, OutputStream};
use crate::engine::runner::{RunPhase, RunRequest, RunSink};
use crate::jobs::{JobId, SubmissionRequest};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Starting,
    Compiling,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }

    /// Progress percentage; never decreases along a legal path
    pub fn progress(self) -> u8 {
        match self {
            JobStatus::Pending => 10,
            JobStatus::Starting => 25,
            JobStatus::Compiling => 50,
            JobStatus::Running => 75,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled => 100,
        }
    }

    pub fn can_transition_to(self, next: JobStatus) -> bool {
        use JobStatus::*;
        match (self, next) {
            (Pending, Starting) => true,
            (Starting, Compiling) => true,
            (Starting | Compiling, Running) => true,
            (Running, Completed) => true,
            (Starting | Compiling | Running, Failed) => true,
            (from, Cancelled) => !from.is_terminal(),
            _ => false,
        }
    }

    fn default_message(self) -> &'static str {
        match self {
            JobStatus::Pending => "Waiting for a free execution slot",
            JobStatus::Starting => "Preparing execution environment",
            JobStatus::Compiling => "Compiling source code",
            JobStatus::Running => "Running program",
            JobStatus::Completed => "Execution completed",
            JobStatus::Failed => "Execution failed",
            JobStatus::Cancelled => "Execution cancelled",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            JobStatus::Pending => "pending",
            JobStatus::Starting => "starting",
            JobStatus::Compiling => "compiling",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        };
        write!(f, "{}", s)
    }
}

/// One entry of a job's event log
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum JobEvent {
    Status {
        status: JobStatus,
        progress: u8,
        message: String,
    },
    Output {
        chunk: OutputChunk,
    },
    Finished {
        status: JobStatus,
        progress: u8,
        message: String,
        result: ExecutionResult,
    },
}

impl JobEvent {
    /// Event name used on the wire (SSE `event:` field)
    pub fn name(&self) -> &'static str {
        match self {
            JobEvent::Status { .. } => "status",
            JobEvent::Output { .. } => "output",
            JobEvent::Finished { .. } => "finished",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobEvent::Finished { .. })
    }
}

/// Read-only view of a job for polling callers
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobSnapshot {
    pub id: JobId,
    pub language: String,
    pub status: JobStatus,
    pub progress: u8,
    pub message: String,
    pub output_so_far: String,
    pub stderr_so_far: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub queue_position: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<ExecutionResult>,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
}

struct JobState {
    status: JobStatus,
    message: String,
    started_at: Option<DateTime<Utc>>,
    ended_at: Option<DateTime<Utc>>,
    run_started: Option<Instant>,
    stdout: String,
    stderr: String,
    events: Vec<JobEvent>,
    cancel_requested: bool,
    result: Option<ExecutionResult>,
}

/// The unit of work, shared between the scheduler, its driver task and streamers
pub struct ExecutionJob {
    id: JobId,
    request: SubmissionRequest,
    profile: Arc<LanguageProfile>,
    created_at: DateTime<Utc>,
    cancel: CancellationToken,
    state: Mutex<JobState>,
    /// Length of the event log, bumped on every append
    log_len: watch::Sender<usize>,
}

impl ExecutionJob {
    pub fn new(request: SubmissionRequest, profile: Arc<LanguageProfile>) -> Arc<Self> {
        let status = JobStatus::Pending;
        let message = status.default_message().to_string();
        let first = JobEvent::Status {
            status,
            progress: status.progress(),
            message: message.clone(),
        };
        let (log_len, _) = watch::channel(1);

        Arc::new(Self {
            id: JobId::new(),
            request,
            profile,
            created_at: Utc::now(),
            cancel: CancellationToken::new(),
            state: Mutex::new(JobState {
                status,
                message,
                started_at: None,
                ended_at: None,
                run_started: None,
                stdout: String::new(),
                stderr: String::new(),
                events: vec![first],
                cancel_requested: false,
                result: None,
            }),
            log_len,
        })
    }

    pub fn id(&self) -> &JobId {
        &self.id
    }

    pub fn request(&self) -> &SubmissionRequest {
        &self.request
    }

    pub fn profile(&self) -> &Arc<LanguageProfile> {
        &self.profile
    }

    /// Fired when the job is cancelled; the runner watches it
    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn status(&self) -> JobStatus {
        self.lock().status
    }

    pub fn is_terminal(&self) -> bool {
        self.status().is_terminal()
    }

    pub fn ended_at(&self) -> Option<DateTime<Utc>> {
        self.lock().ended_at
    }

    pub fn result(&self) -> Option<ExecutionResult> {
        self.lock().result.clone()
    }

    pub fn run_request(&self) -> RunRequest {
        RunRequest {
            profile: Arc::clone(&self.profile),
            source_code: self.request.source_code.clone(),
            stdin: self.request.stdin.clone(),
        }
    }

    /// A concurrency slot was granted
    pub fn mark_starting(&self) -> bool {
        let mut state = self.lock();
        if !self.transition(&mut state, JobStatus::Starting) {
            return false;
        }
        state.started_at = Some(Utc::now());
        true
    }

    /// Record the runner's result; no-op once the job is terminal
    pub fn finish(&self, result: ExecutionResult) -> bool {
        let mut state = self.lock();
        if state.status.is_terminal() {
            debug!(
                "Job {} already {}, dropping late result",
                self.id, state.status
            );
            return false;
        }

        let next = if result.success {
            JobStatus::Completed
        } else {
            JobStatus::Failed
        };
        if !state.status.can_transition_to(next) {
            // Still terminate: a job must never be left without a result
            error!(
                "Job {} finished from {} as {}, which skips required states",
                self.id, state.status, next
            );
        }

        state.status = next;
        state.message = result.message.clone();
        state.ended_at = Some(Utc::now());
        let event = JobEvent::Finished {
            status: next,
            progress: next.progress(),
            message: result.message.clone(),
            result: result.clone(),
        };
        state.result = Some(result);
        self.append(&mut state, event);
        true
    }

    /// Cancel the job. Only the first call on a live job has any effect.
    pub fn request_cancel(&self) -> bool {
        {
            let mut state = self.lock();
            if state.status.is_terminal() || state.cancel_requested {
                return false;
            }
            state.cancel_requested = true;

            let elapsed_ms = state
                .run_started
                .map(|t| t.elapsed().as_millis() as u64)
                .unwrap_or(0);
            let result =
                ExecutionResult::cancelled(state.stdout.clone(), state.stderr.clone(), elapsed_ms);

            let status = JobStatus::Cancelled;
            state.status = status;
            state.message = result.message.clone();
            state.ended_at = Some(Utc::now());
            let event = JobEvent::Finished {
                status,
                progress: status.progress(),
                message: result.message.clone(),
                result: result.clone(),
            };
            state.result = Some(result);
            self.append(&mut state, event);
        }

        self.cancel.cancel();
        true
    }

    pub fn snapshot(&self, queue_position: Option<usize>) -> JobSnapshot {
        let state = self.lock();
        JobSnapshot {
            id: self.id.clone(),
            language: self.profile.id.clone(),
            status: state.status,
            progress: state.status.progress(),
            message: state.message.clone(),
            output_so_far: state.stdout.clone(),
            stderr_so_far: state.stderr.clone(),
            queue_position,
            result: state.result.clone(),
            created_at: self.created_at,
            started_at: state.started_at,
            ended_at: state.ended_at,
        }
    }

    /// Replay the event log from the start, then follow it until the job ends
    pub fn events(self: &Arc<Self>) -> impl Stream<Item = JobEvent> + Send + 'static {
        let job = Arc::clone(self);
        let mut log_len = self.log_len.subscribe();

        async_stream::stream! {
            let mut cursor = 0;
            loop {
                let _ = log_len.borrow_and_update();
                let (batch, done) = job.events_since(cursor);
                cursor += batch.len();
                for event in batch {
                    yield event;
                }
                if done || log_len.changed().await.is_err() {
                    break;
                }
            }
        }
    }

    fn events_since(&self, cursor: usize) -> (Vec<JobEvent>, bool) {
        let state = self.lock();
        let batch = state.events.get(cursor..).unwrap_or_default().to_vec();
        (batch, state.status.is_terminal())
    }

    fn lock(&self) -> MutexGuard<'_, JobState> {
        // A panic while holding the lock cannot leave the state half-written
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn transition(&self, state: &mut JobState, next: JobStatus) -> bool {
        if !state.status.can_transition_to(next) {
            error!(
                "Job {} refused transition {} -> {}",
                self.id, state.status, next
            );
            return false;
        }
        debug!("Job {} {} -> {}", self.id, state.status, next);

        state.status = next;
        state.message = next.default_message().to_string();
        let event = JobEvent::Status {
            status: next,
            progress: next.progress(),
            message: state.message.clone(),
        };
        self.append(state, event);
        true
    }

    fn append(&self, state: &mut JobState, event: JobEvent) {
        state.events.push(event);
        self.log_len.send_replace(state.events.len());
    }
}

impl RunSink for ExecutionJob {
    fn phase(&self, phase: RunPhase) {
        let mut state = self.lock();
        if state.status.is_terminal() {
            return;
        }
        let next = match phase {
            RunPhase::Compiling => JobStatus::Compiling,
            RunPhase::Running => JobStatus::Running,
        };
        if self.transition(&mut state, next) && next == JobStatus::Running {
            state.run_started = Some(Instant::now());
        }
    }

    fn output(&self, chunk: OutputChunk) {
        let mut state = self.lock();
        // Output racing a cancellation is dropped; the result is already fixed
        if state.status.is_terminal() {
            return;
        }
        match chunk.stream {
            OutputStream::Stdout => state.stdout.push_str(&chunk.data),
            OutputStream::Stderr => state.stderr.push_str(&chunk.data),
        }
        self.append(&mut state, JobEvent::Output { chunk });
    }
}

impl fmt::Debug for ExecutionJob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutionJob")
            .field("id", &self.id)
            .field("language", &self.profile.id)
            .field("status", &self.status())
            .finish()
    }
}
