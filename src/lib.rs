//! Runbox: sandboxed multi-language code execution
//!
//! Submissions are validated, queued behind a concurrency limit, compiled and
//! run in a per-job scratch directory under resource limits, and report their
//! progress and output as a stream of events.

pub mod config;
pub mod core;
pub mod engine;
pub mod error;
pub mod http;
pub mod jobs;
pub mod service;

pub use crate::config::ServiceConfig;
pub use crate::error::{RejectReason, ServiceError, ServiceResult};
pub use crate::service::ExecutionService;
