//! Sandbox configuration
//!
//! Host-level settings shared by every sandboxed process. Per-language limits
//! live on the language profile instead.

use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Default ceiling on captured stdout + stderr per run (1 MB)
pub const DEFAULT_MAX_OUTPUT_BYTES: usize = 1024 * 1024;

/// What to do when a private network namespace cannot be created
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NetworkPolicy {
    /// Refuse to run the process without network isolation
    Enforce,
    /// Try to isolate, run anyway if the host does not allow it
    #[default]
    BestEffort,
    /// Leave the host network visible
    Off,
}

impl FromStr for NetworkPolicy {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "enforce" | "strict" => Ok(NetworkPolicy::Enforce),
            "best_effort" | "best-effort" | "auto" => Ok(NetworkPolicy::BestEffort),
            "off" | "none" | "disabled" => Ok(NetworkPolicy::Off),
            other => anyhow::bail!("Unknown network policy: {}", other),
        }
    }
}

/// Sandbox configuration
#[derive(Debug, Clone)]
pub struct SandboxConfig {
    /// Parent directory for per-job scratch directories
    pub scratch_root: PathBuf,
    /// `PATH` handed to sandboxed processes
    pub path: String,
    pub network: NetworkPolicy,
    /// Total stdout + stderr kept per run
    pub max_output_bytes: usize,
    /// Compile time limit in milliseconds (default: 30000ms = 30s)
    pub compile_time_limit_ms: u64,
    /// Compile memory limit in bytes (default: 2048MB)
    pub compile_memory_limit_bytes: u64,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            scratch_root: std::env::temp_dir(),
            path: "/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin".to_string(),
            network: NetworkPolicy::default(),
            max_output_bytes: DEFAULT_MAX_OUTPUT_BYTES,
            compile_time_limit_ms: 30_000,
            compile_memory_limit_bytes: 2048 * 1024 * 1024,
        }
    }
}
