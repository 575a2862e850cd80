//! Compile step
//!
//! Runs a language's compile command in the job's scratch directory under the
//! host-wide compile limits. Compiler output is collected, not streamed.

use std::path::Path;

use anyhow::Result;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::core::outcome::OutputChunk;
use crate::engine::executer::{execute_sandboxed, ExecutionLimits, ExecutionSpec, ExecutionStatus};
use crate::engine::sandbox::SandboxConfig;

/// Result of a compilation attempt
#[derive(Debug)]
pub struct CompileResult {
    pub success: bool,
    /// Compiler diagnostics, or a fallback description of the failure
    pub message: Option<String>,
    pub time_ms: u64,
    /// The compile was stopped by cancellation, not by the compiler
    pub cancelled: bool,
}

/// Compile source code inside the sandbox
pub async fn compile_in_sandbox(
    source_dir: &Path,
    compile_cmd: &[String],
    config: &SandboxConfig,
    cancel: &CancellationToken,
) -> Result<CompileResult> {
    if compile_cmd.is_empty() {
        return Ok(CompileResult {
            success: true,
            message: None,
            time_ms: 0,
            cancelled: false,
        });
    }

    debug!("Compiling with {:?}", compile_cmd);

    let spec = ExecutionSpec::new(source_dir)
        .with_command(compile_cmd)
        .with_limits(ExecutionLimits {
            time_ms: config.compile_time_limit_ms,
            memory_bytes: config.compile_memory_limit_bytes,
            ..ExecutionLimits::default()
        });

    let result = execute_sandboxed(&spec, config, &|_: OutputChunk| {}, cancel).await?;

    let success = result.is_success();
    let diagnostics = match (result.stderr.trim().is_empty(), result.stdout.trim().is_empty()) {
        (false, false) => Some(format!("{}{}", result.stdout, result.stderr)),
        (false, true) => Some(result.stderr.clone()),
        (true, false) => Some(result.stdout.clone()),
        (true, true) => None,
    };

    if success {
        return Ok(CompileResult {
            success: true,
            message: diagnostics,
            time_ms: result.time_ms,
            cancelled: false,
        });
    }

    let fallback = match result.status {
        ExecutionStatus::TimeLimitExceeded => "Compilation timed out".to_string(),
        ExecutionStatus::MemoryLimitExceeded => "Compiler exceeded memory limit".to_string(),
        ExecutionStatus::Signaled(_) => "Compiler crashed".to_string(),
        ExecutionStatus::Cancelled => "Compilation cancelled".to_string(),
        ExecutionStatus::Exited(code) => format!("Compilation failed with exit code {}", code),
    };
    // Limits hit mid-compile would otherwise be hidden behind partial diagnostics
    let message = match (diagnostics, &result.status) {
        (Some(text), ExecutionStatus::Exited(_)) => text,
        (Some(text), _) => format!("{}\n{}", text.trim_end(), fallback),
        (None, _) => fallback,
    };

    Ok(CompileResult {
        success: false,
        message: Some(message),
        time_ms: result.time_ms,
        cancelled: result.status == ExecutionStatus::Cancelled,
    })
}
