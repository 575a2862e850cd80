//! Execution service façade
//!
//! The surface callers use: submit, stream, poll, cancel, and queue and
//! language introspection. Validation happens here, synchronously, so a
//! rejected submission never becomes a job.

use std::sync::Arc;

use futures_util::Stream;
use tracing::{debug, info};

use crate::config::ServiceConfig;
use crate::core::languages::{LanguageRegistry, LanguageSummary};
use crate::core::validator::StaticValidator;
use crate::engine::runner::{Runner, SandboxedRunner};
use crate::error::{RejectReason, ServiceError, ServiceResult};
use crate::jobs::{AdmissionScheduler, JobEvent, JobId, JobSnapshot, QueueStatus, SubmissionRequest};

pub struct ExecutionService {
    registry: Arc<LanguageRegistry>,
    validator: StaticValidator,
    scheduler: Arc<AdmissionScheduler>,
    max_stdin_bytes: usize,
}

impl ExecutionService {
    /// Service backed by the sandboxed process runner
    pub fn new(config: &ServiceConfig, registry: Arc<LanguageRegistry>) -> Self {
        let runner = Arc::new(SandboxedRunner::new(config.sandbox.clone()));
        Self::with_runner(config, registry, runner)
    }

    pub fn with_runner(
        config: &ServiceConfig,
        registry: Arc<LanguageRegistry>,
        runner: Arc<dyn Runner>,
    ) -> Self {
        Self {
            validator: StaticValidator::new(Arc::clone(&registry), config.max_source_bytes),
            scheduler: AdmissionScheduler::new(
                runner,
                config.max_concurrent,
                config.job_retention,
            ),
            registry,
            max_stdin_bytes: config.max_stdin_bytes,
        }
    }

    /// Validate and admit a submission; must be called inside a Tokio runtime
    pub fn submit(&self, request: SubmissionRequest) -> ServiceResult<JobId> {
        let profile = self.registry.get(&request.language).ok_or_else(|| {
            RejectReason::UnsupportedLanguage {
                language: request.language.clone(),
            }
        });

        let admitted = profile.and_then(|profile| {
            self.validator
                .validate_for(&request.source_code, &profile)?;
            if let Some(stdin) = &request.stdin {
                if stdin.len() > self.max_stdin_bytes {
                    return Err(RejectReason::PayloadTooLarge {
                        what: "stdin",
                        size: stdin.len(),
                        limit: self.max_stdin_bytes,
                    });
                }
            }
            Ok(profile)
        });

        let profile = match admitted {
            Ok(profile) => profile,
            Err(reason) => {
                debug!("Rejected {} submission: {}", request.language, reason);
                return Err(reason.into());
            }
        };

        let job = self.scheduler.submit(request, profile);
        info!("Accepted job {} ({})", job.id(), job.profile().id);
        Ok(job.id().clone())
    }

    /// Events of a job from its creation until it ends
    pub fn stream(
        &self,
        id: &JobId,
    ) -> ServiceResult<impl Stream<Item = JobEvent> + Send + 'static> {
        let job = self
            .scheduler
            .job(id)
            .ok_or_else(|| ServiceError::NotFound(id.clone()))?;
        Ok(job.events())
    }

    pub fn cancel(&self, id: &JobId) -> bool {
        self.scheduler.cancel(id)
    }

    pub fn status(&self, id: &JobId) -> ServiceResult<JobSnapshot> {
        let job = self
            .scheduler
            .job(id)
            .ok_or_else(|| ServiceError::NotFound(id.clone()))?;
        Ok(job.snapshot(self.scheduler.queue_position(id)))
    }

    pub fn queue_status(&self) -> QueueStatus {
        self.scheduler.queue_status()
    }

    pub fn languages(&self) -> Vec<LanguageSummary> {
        self.registry.supported()
    }
}
