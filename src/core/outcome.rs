use serde::{Deserialize, Serialize};
use std::fmt;

/// Why a job did not complete successfully
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    CompileError,
    RuntimeError,
    Timeout,
    MemoryExceeded,
    /// Sandbox provisioning or process plumbing failed; not the user's fault
    EnvironmentError,
}

impl FailureKind {
    /// Infrastructure faults worth an operator's attention
    pub fn is_infrastructure(self) -> bool {
        matches!(self, FailureKind::EnvironmentError)
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FailureKind::CompileError => "compile_error",
            FailureKind::RuntimeError => "runtime_error",
            FailureKind::Timeout => "timeout",
            FailureKind::MemoryExceeded => "memory_exceeded",
            FailureKind::EnvironmentError => "environment_error",
        };
        write!(f, "{}", s)
    }
}

/// Which pipe a chunk of output came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputStream {
    Stdout,
    Stderr,
}

/// A piece of program output, in the order the process produced it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputChunk {
    pub stream: OutputStream,
    pub data: String,
}

impl OutputChunk {
    pub fn stdout(data: impl Into<String>) -> Self {
        Self {
            stream: OutputStream::Stdout,
            data: data.into(),
        }
    }

    pub fn stderr(data: impl Into<String>) -> Self {
        Self {
            stream: OutputStream::Stderr,
            data: data.into(),
        }
    }
}

/// Final outcome of one job, taken once at termination
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionResult {
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
    pub exit_code: Option<i32>,
    /// Wall clock of the run step, spawn to exit or kill
    pub execution_time_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memory_used_bytes: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub compile_log: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub compile_time_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<FailureKind>,
    /// Human readable explanation of the outcome
    pub message: String,
    #[serde(default)]
    pub output_truncated: bool,
}

impl ExecutionResult {
    /// A failed result carrying no program output
    pub fn failed(failure: FailureKind, message: impl Into<String>) -> Self {
        Self {
            success: false,
            stdout: String::new(),
            stderr: String::new(),
            exit_code: None,
            execution_time_ms: 0,
            memory_used_bytes: None,
            compile_log: None,
            compile_time_ms: None,
            failure: Some(failure),
            message: message.into(),
            output_truncated: false,
        }
    }

    /// Result for a job stopped on request, keeping whatever it printed
    pub fn cancelled(stdout: String, stderr: String, execution_time_ms: u64) -> Self {
        Self {
            success: false,
            stdout,
            stderr,
            exit_code: None,
            execution_time_ms,
            memory_used_bytes: None,
            compile_log: None,
            compile_time_ms: None,
            failure: None,
            message: "Execution cancelled".to_string(),
            output_truncated: false,
        }
    }
}
