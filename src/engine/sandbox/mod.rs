//! Sandbox module - Process isolation primitives
//!
//! This module provides the pieces a sandboxed process is built from:
//! - Private scratch directories
//! - Child setup run between fork and exec (session, rlimits, network namespace)
//! - Resident memory sampling of a process group from procfs
//!
//! The sandbox module does NOT:
//! - Interpret outcomes (that's the runner's job)
//! - Know about languages or compilation

pub mod config;
pub mod limits;
pub mod memory;
pub mod scratch;

pub use config::{NetworkPolicy, SandboxConfig, DEFAULT_MAX_OUTPUT_BYTES};
pub use limits::{is_network_isolation_available, Limits};
pub use memory::{group_members, parse_current_rss, parse_peak_rss, parse_stat_pgrp, sample_group_rss, sample_peak_rss};
pub use scratch::ScratchBox;
