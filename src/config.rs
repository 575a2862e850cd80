//! Service configuration
//!
//! Read from the environment (after `.env`, see `main.rs`). Every setting has
//! a default, so an empty environment yields a working service.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};

use crate::core::validator::DEFAULT_MAX_SOURCE_BYTES;
use crate::engine::sandbox::SandboxConfig;
use crate::jobs::scheduler::{DEFAULT_MAX_CONCURRENT, DEFAULT_RETENTION};

/// Default ceiling on submitted stdin (1 MB)
pub const DEFAULT_MAX_STDIN_BYTES: usize = 1024 * 1024;

#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub bind_addr: String,
    pub max_concurrent: usize,
    pub max_source_bytes: usize,
    pub max_stdin_bytes: usize,
    /// How long finished jobs stay queryable
    pub job_retention: Duration,
    /// Override for the bundled language table
    pub languages_config: Option<PathBuf>,
    pub sandbox: SandboxConfig,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:8080".to_string(),
            max_concurrent: DEFAULT_MAX_CONCURRENT,
            max_source_bytes: DEFAULT_MAX_SOURCE_BYTES,
            max_stdin_bytes: DEFAULT_MAX_STDIN_BYTES,
            job_retention: DEFAULT_RETENTION,
            languages_config: None,
            sandbox: SandboxConfig::default(),
        }
    }
}

impl ServiceConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key/value source; unset keys keep their defaults
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Self::default();
        let sandbox = &mut config.sandbox;

        if let Some(addr) = lookup("BIND_ADDR") {
            config.bind_addr = addr;
        }
        parse_into(&lookup, "MAX_CONCURRENT", &mut config.max_concurrent)?;
        parse_into(&lookup, "MAX_SOURCE_BYTES", &mut config.max_source_bytes)?;
        parse_into(&lookup, "MAX_STDIN_BYTES", &mut config.max_stdin_bytes)?;
        parse_into(&lookup, "MAX_OUTPUT_BYTES", &mut sandbox.max_output_bytes)?;
        parse_into(
            &lookup,
            "COMPILE_TIME_LIMIT_MS",
            &mut sandbox.compile_time_limit_ms,
        )?;

        let mut compile_memory_mb = sandbox.compile_memory_limit_bytes / (1024 * 1024);
        parse_into(&lookup, "COMPILE_MEMORY_LIMIT_MB", &mut compile_memory_mb)?;
        sandbox.compile_memory_limit_bytes = compile_memory_mb * 1024 * 1024;

        if let Some(root) = lookup("SCRATCH_ROOT") {
            sandbox.scratch_root = PathBuf::from(root);
        }
        if let Some(path) = lookup("SANDBOX_PATH") {
            sandbox.path = path;
        }
        parse_into(&lookup, "SANDBOX_NETWORK", &mut sandbox.network)?;

        let mut retention_secs = config.job_retention.as_secs();
        parse_into(&lookup, "JOB_RETENTION_SECS", &mut retention_secs)?;
        config.job_retention = Duration::from_secs(retention_secs);

        config.languages_config = lookup("LANGUAGES_CONFIG").map(PathBuf::from);

        if config.max_concurrent == 0 {
            anyhow::bail!("MAX_CONCURRENT must be at least 1");
        }
        Ok(config)
    }
}

fn parse_into<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str, target: &mut T) -> Result<()>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    if let Some(raw) = lookup(key) {
        *target = raw
            .trim()
            .parse()
            .map_err(|e| anyhow::anyhow!("{}", e))
            .with_context(|| format!("Invalid value for {}: {:?}", key, raw))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::sandbox::NetworkPolicy;
    use std::collections::HashMap;
    use tokio_test::{assert_err, assert_ok};

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = assert_ok!(ServiceConfig::from_lookup(lookup(&[])));
        assert_eq!(config.max_concurrent, 5);
        assert_eq!(config.max_source_bytes, 100_000);
        assert_eq!(config.job_retention, Duration::from_secs(3600));
        assert_eq!(config.sandbox.compile_memory_limit_bytes, 2048 * 1024 * 1024);
        assert!(config.languages_config.is_none());
    }

    #[test]
    fn test_overrides() {
        let config = ServiceConfig::from_lookup(lookup(&[
            ("BIND_ADDR", "127.0.0.1:9000"),
            ("MAX_CONCURRENT", "2"),
            ("MAX_OUTPUT_BYTES", "4096"),
            ("COMPILE_MEMORY_LIMIT_MB", "512"),
            ("SANDBOX_NETWORK", "enforce"),
            ("SCRATCH_ROOT", "/var/tmp/runbox"),
            ("JOB_RETENTION_SECS", "60"),
            ("LANGUAGES_CONFIG", "/etc/runbox/languages.toml"),
        ]))
        .unwrap();

        assert_eq!(config.bind_addr, "127.0.0.1:9000");
        assert_eq!(config.max_concurrent, 2);
        assert_eq!(config.sandbox.max_output_bytes, 4096);
        assert_eq!(config.sandbox.compile_memory_limit_bytes, 512 * 1024 * 1024);
        assert_eq!(config.sandbox.network, NetworkPolicy::Enforce);
        assert_eq!(config.sandbox.scratch_root, PathBuf::from("/var/tmp/runbox"));
        assert_eq!(config.job_retention, Duration::from_secs(60));
        assert_eq!(
            config.languages_config,
            Some(PathBuf::from("/etc/runbox/languages.toml"))
        );
    }

    #[test]
    fn test_invalid_values_are_errors() {
        let err = assert_err!(ServiceConfig::from_lookup(lookup(&[("MAX_CONCURRENT", "many")])));
        assert!(format!("{:#}", err).contains("MAX_CONCURRENT"));
        assert_err!(ServiceConfig::from_lookup(lookup(&[("MAX_CONCURRENT", "0")])));
        assert_err!(ServiceConfig::from_lookup(lookup(&[("SANDBOX_NETWORK", "maybe")])));
    }
}
