//! Error types shared across the service.

use thiserror::Error;

use crate::job::JobStatus;
use crate::sandbox::Phase;

/// The child process never started.
#[derive(Error, Debug)]
pub enum SpawnError {
    #[error("empty command")]
    EmptyCommand,

    #[error("argument contains an interior NUL byte: {0:?}")]
    InvalidArgument(String),

    #[error("binary not found: {0}")]
    NotFound(String),

    #[error("binary is not executable: {0}")]
    NotExecutable(String),

    #[error("pipe: {0}")]
    Pipe(nix::Error),

    #[error("fork: {0}")]
    Fork(nix::Error),

    #[error("{stage}: {errno}")]
    Child {
        stage: &'static str,
        errno: nix::Error,
    },

    #[error("wait4: {0}")]
    Wait(nix::Error),
}

impl SpawnError {
    /// Short machine-readable reason recorded in the job timeline.
    pub fn reason(&self) -> &'static str {
        match self {
            SpawnError::EmptyCommand | SpawnError::InvalidArgument(_) => "invalid_command",
            SpawnError::NotFound(_) => "not_found",
            SpawnError::NotExecutable(_) => "not_executable",
            SpawnError::Pipe(_) => "pipe_failed",
            SpawnError::Fork(_) => "fork_failed",
            SpawnError::Child { .. } => "exec_failed",
            SpawnError::Wait(_) => "wait_failed",
        }
    }
}

/// A `compile_and_run` step that never started.
#[derive(Error, Debug)]
#[error("{phase:?} step failed to start: {source}")]
pub struct PhasedSpawnError {
    pub phase: Phase,
    #[source]
    pub source: SpawnError,
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum JobError {
    #[error("illegal transition {from} -> {to}")]
    IllegalTransition { from: JobStatus, to: JobStatus },
}

#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("task already exists: {0}")]
    Duplicate(String),
}

/// Rejected submissions. No job is created for any of these.
#[derive(Error, Debug)]
pub enum SubmitError {
    #[error("Missing command or advanced params (filter/input/output)")]
    EmptyCommand,

    #[error("binary not found: {0}")]
    BinaryNotFound(String),

    #[error("binary is not executable: {0}")]
    NotExecutable(String),

    #[error(transparent)]
    Registry(#[from] RegistryError),
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum CancelError {
    #[error("task not found: {0}")]
    NotFound(String),

    #[error("task {id} already {status}")]
    AlreadyFinished { id: String, status: JobStatus },
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Refusing to start: CODEIA_LAUNCH_MODE must be 'orchestrator' (got {0:?})")]
    LaunchMode(String),

    #[error("chroot directory does not exist: {0}")]
    MissingChroot(String),

    #[error("chroot and privilege drop require root")]
    NotRoot,
}
