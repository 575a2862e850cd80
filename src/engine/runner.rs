//! Runner - the seam between jobs and process execution
//!
//! A `Runner` turns one submission into one `ExecutionResult`:
//! - `SandboxedRunner`: scratch dir, optional compile, confined run
//!
//! The runner does NOT:
//! - Validate source code (admission already did)
//! - Track job state or queue position
//! - Persist anything past the end of the run

use std::sync::Arc;

use async_trait::async_trait;
use nix::sys::signal::Signal;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::core::languages::{LanguageProfile, SecurityTier};
use crate::core::outcome::{ExecutionResult, FailureKind, OutputChunk};
use crate::engine::compiler::compile_in_sandbox;
use crate::engine::executer::{
    execute_sandboxed, ExecutionLimits, ExecutionOutcome, ExecutionSpec, ExecutionStatus,
};
use crate::engine::sandbox::{SandboxConfig, ScratchBox};

/// Open files allowed to high-tier programs
const HIGH_TIER_OPEN_FILES: u64 = 64;
const DEFAULT_OPEN_FILES: u64 = 256;
/// Largest file a run step may write (256MB); high tier may write none
const DEFAULT_FSIZE_BYTES: u64 = 256 * 1024 * 1024;

/// Which step of a run is underway
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunPhase {
    Compiling,
    Running,
}

/// Receives progress from a runner while it works
pub trait RunSink: Send + Sync {
    fn phase(&self, phase: RunPhase);
    fn output(&self, chunk: OutputChunk);
}

/// Everything a runner needs for one execution
#[derive(Debug, Clone)]
pub struct RunRequest {
    pub profile: Arc<LanguageProfile>,
    pub source_code: String,
    pub stdin: Option<String>,
}

/// Runner trait for executing submissions
#[async_trait]
pub trait Runner: Send + Sync {
    /// Run to completion, timeout, kill or cancellation. Never fails: every
    /// problem is described by the returned result.
    async fn run(
        &self,
        request: &RunRequest,
        sink: &dyn RunSink,
        cancel: &CancellationToken,
    ) -> ExecutionResult;
}

/// Runner for untrusted code
pub struct SandboxedRunner {
    config: SandboxConfig,
}

impl SandboxedRunner {
    pub fn new(config: SandboxConfig) -> Self {
        Self { config }
    }

    fn run_limits(profile: &LanguageProfile) -> ExecutionLimits {
        let high = profile.security_tier == SecurityTier::High;
        ExecutionLimits {
            time_ms: profile.timeout_ms,
            memory_bytes: profile.memory_limit_bytes,
            limit_address_space: profile.limit_address_space,
            open_files: if high {
                HIGH_TIER_OPEN_FILES
            } else {
                DEFAULT_OPEN_FILES
            },
            fsize_bytes: if high { 0 } else { DEFAULT_FSIZE_BYTES },
        }
    }

    async fn run_in(
        &self,
        scratch: &ScratchBox,
        request: &RunRequest,
        sink: &dyn RunSink,
        cancel: &CancellationToken,
    ) -> ExecutionResult {
        let profile = &request.profile;

        if let Err(e) = scratch
            .write_file(&profile.source_file, &request.source_code)
            .await
        {
            error!("Failed to write source for {}: {:#}", profile.id, e);
            return ExecutionResult::failed(
                FailureKind::EnvironmentError,
                "Sandbox could not be prepared",
            );
        }

        let mut compile_log = None;
        let mut compile_time_ms = None;

        if let Some(compile_cmd) = &profile.compile_command {
            sink.phase(RunPhase::Compiling);
            let compiled =
                match compile_in_sandbox(scratch.path(), compile_cmd, &self.config, cancel).await {
                    Ok(compiled) => compiled,
                    Err(e) => {
                        error!("Failed to start {} compiler: {:#}", profile.id, e);
                        return ExecutionResult::failed(
                            FailureKind::EnvironmentError,
                            format!("Compiler for {} is unavailable", profile.display_name),
                        );
                    }
                };
            compile_time_ms = Some(compiled.time_ms);

            if compiled.cancelled {
                return ExecutionResult::cancelled(String::new(), String::new(), 0);
            }
            if !compiled.success {
                debug!("Compilation failed for {}", profile.id);
                return ExecutionResult {
                    compile_log: compiled.message,
                    compile_time_ms,
                    ..ExecutionResult::failed(FailureKind::CompileError, "Compilation failed")
                };
            }
            compile_log = compiled.message;
        }

        if cancel.is_cancelled() {
            return ExecutionResult::cancelled(String::new(), String::new(), 0);
        }

        sink.phase(RunPhase::Running);

        let mut spec = ExecutionSpec::new(scratch.path())
            .with_command(&profile.run_command)
            .with_limits(Self::run_limits(profile));
        if let Some(stdin) = &request.stdin {
            spec = spec.with_stdin(stdin.as_str());
        }

        let on_output = |chunk: OutputChunk| sink.output(chunk);
        let outcome = match execute_sandboxed(&spec, &self.config, &on_output, cancel).await {
            Ok(outcome) => outcome,
            Err(e) => {
                error!("Failed to start {} program: {:#}", profile.id, e);
                return ExecutionResult {
                    compile_log,
                    compile_time_ms,
                    ..ExecutionResult::failed(
                        FailureKind::EnvironmentError,
                        format!("Runtime for {} is unavailable", profile.display_name),
                    )
                };
            }
        };

        ExecutionResult {
            compile_log,
            compile_time_ms,
            ..into_result(outcome, profile)
        }
    }
}

#[async_trait]
impl Runner for SandboxedRunner {
    async fn run(
        &self,
        request: &RunRequest,
        sink: &dyn RunSink,
        cancel: &CancellationToken,
    ) -> ExecutionResult {
        let scratch = match ScratchBox::create(&self.config.scratch_root).await {
            Ok(scratch) => scratch,
            Err(e) => {
                error!("Failed to provision sandbox: {:#}", e);
                return ExecutionResult::failed(
                    FailureKind::EnvironmentError,
                    "Sandbox could not be prepared",
                );
            }
        };

        let result = self.run_in(&scratch, request, sink, cancel).await;

        if let Err(e) = scratch.cleanup() {
            warn!("{:#}", e);
        }
        result
    }
}

/// Interpret a finished run step
fn into_result(outcome: ExecutionOutcome, profile: &LanguageProfile) -> ExecutionResult {
    let ExecutionOutcome {
        status,
        time_ms,
        peak_memory_bytes,
        stdout,
        mut stderr,
        truncated,
    } = outcome;

    let (success, failure, message) = match status {
        ExecutionStatus::Exited(0) => (true, None, "Execution completed".to_string()),
        ExecutionStatus::Exited(code) => (
            false,
            Some(FailureKind::RuntimeError),
            format!("Process exited with code {}", code),
        ),
        ExecutionStatus::TimeLimitExceeded => {
            let message = format!("Execution timed out after {} ms", profile.timeout_ms);
            append_line(&mut stderr, &message);
            (false, Some(FailureKind::Timeout), message)
        }
        ExecutionStatus::MemoryLimitExceeded => {
            let message = format!(
                "Memory limit of {} MB exceeded",
                profile.memory_limit_bytes / (1024 * 1024)
            );
            append_line(&mut stderr, &message);
            (false, Some(FailureKind::MemoryExceeded), message)
        }
        ExecutionStatus::Signaled(sig) => {
            let name = Signal::try_from(sig)
                .map(|s| s.as_str().to_string())
                .unwrap_or_else(|_| format!("signal {}", sig));
            (
                false,
                Some(FailureKind::RuntimeError),
                format!("Process terminated by {}", name),
            )
        }
        ExecutionStatus::Cancelled => {
            return ExecutionResult {
                memory_used_bytes: peak_memory_bytes,
                output_truncated: truncated,
                ..ExecutionResult::cancelled(stdout, stderr, time_ms)
            };
        }
    };

    ExecutionResult {
        success,
        exit_code: match status {
            ExecutionStatus::Exited(code) => Some(code),
            _ => None,
        },
        stdout,
        stderr,
        execution_time_ms: time_ms,
        memory_used_bytes: peak_memory_bytes,
        compile_log: None,
        compile_time_ms: None,
        failure,
        message,
        output_truncated: truncated,
    }
}

fn append_line(buffer: &mut String, line: &str) {
    if !buffer.is_empty() && !buffer.ends_with('\n') {
        buffer.push('\n');
    }
    buffer.push_str(line);
    buffer.push('\n');
}
