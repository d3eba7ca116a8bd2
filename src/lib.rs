//! Sandboxed job execution service.
//!
//! Jobs are external commands run under rlimits (and optionally chroot and a
//! privilege drop) with a wall-clock deadline. Callers submit over HTTP, get a
//! task id back immediately and poll for status, output and metrics.

#[cfg(not(target_os = "linux"))]
compile_error!("jobsandbox only works on Linux.");

pub mod config;
pub mod dispatcher;
pub mod error;
pub mod http_server;
pub mod job;
pub mod metrics;
pub mod registry;
pub mod sandbox;
pub mod scheduler;
pub mod shutdown;
pub mod state;
pub mod sweeper;
pub mod validation;
