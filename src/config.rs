//! Service configuration: CLI flags with environment fallbacks.

use clap::Args;
use std::path::PathBuf;
use std::time::Duration;

use crate::dispatcher::DispatcherConfig;
use crate::error::ConfigError;
use crate::sandbox::SandboxProfile;

/// The only launch mode `serve` accepts.
pub const ORCHESTRATOR_MODE: &str = "orchestrator";

/// Sandbox limits shared by `serve` and `run`.
#[derive(Args, Debug, Clone, Default)]
pub struct SandboxArgs {
    /// CPU time limit per job in seconds (0 = unlimited)
    #[arg(long, env = "SANDBOX_CPU_LIMIT", default_value_t = 0)]
    pub cpu_limit: u64,

    /// Address-space limit per job in bytes (0 = unlimited)
    #[arg(long, env = "SANDBOX_MEMORY_LIMIT", default_value_t = 0)]
    pub memory_limit: u64,

    /// Directory to chroot jobs into (requires root)
    #[arg(long, env = "SANDBOX_CHROOT")]
    pub chroot: Option<PathBuf>,

    /// Run jobs as nobody:nogroup (requires root)
    #[arg(long, env = "SANDBOX_DROP_PRIVILEGES", default_value_t = false)]
    pub drop_privileges: bool,
}

impl SandboxArgs {
    pub fn profile(&self) -> SandboxProfile {
        SandboxProfile {
            cpu_limit_seconds: self.cpu_limit,
            memory_limit_bytes: self.memory_limit,
            chroot_dir: self.chroot.clone(),
            drop_privileges: self.drop_privileges,
        }
    }
}

#[derive(Args, Debug, Clone)]
pub struct ServeArgs {
    /// Address to bind
    #[arg(long, env = "CPP_ENGINE_HOST", default_value = "127.0.0.1")]
    pub host: String,

    /// Port to listen on
    #[arg(long, env = "CPP_ENGINE_PORT", default_value_t = 3004)]
    pub port: u16,

    /// Must be "orchestrator" for the server to start
    #[arg(long, env = "CODEIA_LAUNCH_MODE", default_value = "")]
    pub launch_mode: String,

    /// Shared secret expected from callers
    #[arg(long, env = "CODEIA_ORCHESTRATOR_TOKEN", hide_env_values = true)]
    pub token: Option<String>,

    /// Binary run for filter-style submissions
    #[arg(
        long,
        env = "CPP_ENGINE_BIN",
        default_value = "./build/bin/image_video_generator"
    )]
    pub engine_bin: PathBuf,

    /// Default job timeout in seconds
    #[arg(long, env = "TASK_TIMEOUT", default_value_t = 60)]
    pub timeout: u64,

    /// Upper bound on requested timeouts in seconds
    #[arg(long, env = "TASK_MAX_TIMEOUT", default_value_t = 3600)]
    pub max_timeout: u64,

    /// How long finished jobs are kept, in seconds
    #[arg(long, env = "TASK_RETENTION_SECONDS", default_value_t = 3600)]
    pub retention: u64,

    /// Seconds between retention sweeps
    #[arg(long, env = "TASK_SWEEP_INTERVAL", default_value_t = 300)]
    pub sweep_interval: u64,

    /// Jobs allowed to run at once; the rest wait queued
    #[arg(long, env = "TASK_MAX_CONCURRENT", default_value_t = 16)]
    pub max_concurrent: usize,

    /// Directory for per-job JSON logs (empty disables them)
    #[arg(long, env = "TASK_LOGS_DIR", default_value = "logs")]
    pub logs_dir: String,

    #[command(flatten)]
    pub sandbox: SandboxArgs,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub launch_mode: String,
    pub orchestrator_token: Option<String>,
    pub engine_bin: PathBuf,
    pub default_timeout_seconds: u64,
    pub max_timeout_seconds: u64,
    pub retention: Duration,
    pub sweep_interval: Duration,
    pub max_concurrent_jobs: usize,
    pub logs_dir: Option<PathBuf>,
    pub sandbox: SandboxProfile,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 3004,
            launch_mode: ORCHESTRATOR_MODE.to_string(),
            orchestrator_token: None,
            engine_bin: PathBuf::from("./build/bin/image_video_generator"),
            default_timeout_seconds: 60,
            max_timeout_seconds: 3600,
            retention: Duration::from_secs(3600),
            sweep_interval: Duration::from_secs(300),
            max_concurrent_jobs: 16,
            logs_dir: None,
            sandbox: SandboxProfile::default(),
        }
    }
}

impl From<ServeArgs> for ServerConfig {
    fn from(args: ServeArgs) -> Self {
        let logs_dir = (!args.logs_dir.is_empty()).then(|| PathBuf::from(&args.logs_dir));
        Self {
            host: args.host,
            port: args.port,
            launch_mode: args.launch_mode,
            orchestrator_token: args.token.filter(|t| !t.is_empty()),
            engine_bin: args.engine_bin,
            default_timeout_seconds: args.timeout.max(1),
            max_timeout_seconds: args.max_timeout.max(args.timeout).max(1),
            retention: Duration::from_secs(args.retention),
            sweep_interval: Duration::from_secs(args.sweep_interval.max(1)),
            max_concurrent_jobs: args.max_concurrent.max(1),
            logs_dir,
            sandbox: args.sandbox.profile(),
        }
    }
}

impl ServerConfig {
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn check_launch_mode(&self) -> Result<(), ConfigError> {
        if self.launch_mode == ORCHESTRATOR_MODE {
            Ok(())
        } else {
            Err(ConfigError::LaunchMode(self.launch_mode.clone()))
        }
    }

    /// Reject profiles the process cannot apply.
    pub fn check_sandbox(&self, is_root: bool) -> Result<(), ConfigError> {
        check_profile(&self.sandbox, is_root)
    }

    pub fn dispatcher_config(&self) -> DispatcherConfig {
        DispatcherConfig {
            default_timeout_seconds: self.default_timeout_seconds,
            max_timeout_seconds: self.max_timeout_seconds,
            max_concurrent_jobs: self.max_concurrent_jobs,
            profile: self.sandbox.clone(),
        }
    }
}

pub fn check_profile(profile: &SandboxProfile, is_root: bool) -> Result<(), ConfigError> {
    if let Some(dir) = &profile.chroot_dir {
        if !dir.is_dir() {
            return Err(ConfigError::MissingChroot(dir.display().to_string()));
        }
    }
    if (profile.chroot_dir.is_some() || profile.drop_privileges) && !is_root {
        return Err(ConfigError::NotRoot);
    }
    Ok(())
}
