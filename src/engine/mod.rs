//! Compile and run one program inside a throwaway sandbox

pub mod compiler;
pub mod executer;
pub mod runner;
pub mod sandbox;

pub use runner::{RunPhase, RunRequest, RunSink, Runner, SandboxedRunner};
