//! Core sandbox execution logic.
//!
//! One call spawns one child: rlimits, optional chroot and privilege drop are
//! applied between `fork` and `exec`, stdout/stderr go through pipes, and a
//! wall-clock deadline is enforced by killing the child's process group.

use nix::errno::Errno;
use nix::fcntl::OFlag;
use nix::sys::resource::{setrlimit, Resource};
use nix::sys::signal::{killpg, Signal};
use nix::unistd::{fork, pipe2, setpgid, ForkResult, Pid};
use serde::{Deserialize, Serialize};
use std::ffi::CString;
use std::fs::{self, File};
use std::io::Read;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{PhasedSpawnError, SpawnError};

pub const NOBODY_UID: u32 = 65534;
pub const NOBODY_GID: u32 = 65534;

/// Legacy return codes of the executor contract.
pub const CODE_SPAWN_FAILED: i32 = -1;
pub const CODE_SIGNALED: i32 = -2;
pub const CODE_TIMED_OUT: i32 = -3;

/// `PATH` seen by every child and searched by `resolve_program`.
pub const SEARCH_PATH: &str = "/usr/local/bin:/usr/bin:/bin";
const CHILD_HOME: &str = "HOME=/tmp";

const POLL_MIN: Duration = Duration::from_millis(5);
const POLL_MAX: Duration = Duration::from_millis(50);

/// Limits and isolation applied to every child. Zero limits are left unset.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SandboxProfile {
    pub cpu_limit_seconds: u64,
    pub memory_limit_bytes: u64,
    pub chroot_dir: Option<PathBuf>,
    pub drop_privileges: bool,
}

/// Subset of `struct rusage` reported by `wait4`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceUsage {
    pub user_time_us: i64,
    pub system_time_us: i64,
    /// Kilobytes on Linux.
    pub max_rss_kb: i64,
}

impl ResourceUsage {
    fn from_rusage(ru: &libc::rusage) -> Self {
        Self {
            user_time_us: ru.ru_utime.tv_sec * 1_000_000 + ru.ru_utime.tv_usec,
            system_time_us: ru.ru_stime.tv_sec * 1_000_000 + ru.ru_stime.tv_usec,
            max_rss_kb: ru.ru_maxrss,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum ExitOutcome {
    Exited(i32),
    /// Terminated by a signal we did not send (rlimit, OOM, external kill).
    Signaled(i32),
    TimedOut,
    Cancelled,
}

impl ExitOutcome {
    /// Collapse to the integer contract: `>= 0` exit status, `-2` signal,
    /// `-3` timeout. Cancellation reports as a signal death.
    pub fn legacy_code(self) -> i32 {
        match self {
            ExitOutcome::Exited(code) => code,
            ExitOutcome::Signaled(_) | ExitOutcome::Cancelled => CODE_SIGNALED,
            ExitOutcome::TimedOut => CODE_TIMED_OUT,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Execution {
    pub pid: i32,
    pub outcome: ExitOutcome,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub usage: ResourceUsage,
    pub wall: Duration,
}

impl Execution {
    pub fn stdout_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    pub fn stderr_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stderr).into_owned()
    }

    pub fn io_bytes(&self) -> usize {
        self.stdout.len() + self.stderr.len()
    }
}

/// Integer form of a whole `run` result.
pub fn legacy_code(result: &Result<Execution, SpawnError>) -> i32 {
    match result {
        Ok(execution) => execution.outcome.legacy_code(),
        Err(_) => CODE_SPAWN_FAILED,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Compile,
    Run,
}

#[derive(Debug, Clone)]
pub struct PhasedExecution {
    pub phase: Phase,
    pub execution: Execution,
}

/// Locate `command` the way the child will exec it. A name containing a
/// slash is taken as given; a bare name is looked up in `SEARCH_PATH`. With a
/// chroot the check happens under that root and the returned path is the one
/// valid after `chroot(2)`.
pub fn resolve_program(command: &str, chroot: Option<&Path>) -> Result<PathBuf, SpawnError> {
    if command.is_empty() {
        return Err(SpawnError::EmptyCommand);
    }
    let on_host = |path: &Path| match chroot {
        Some(root) => root.join(path.strip_prefix("/").unwrap_or(path)),
        None => path.to_path_buf(),
    };
    let candidates: Vec<PathBuf> = if command.contains('/') {
        vec![PathBuf::from(command)]
    } else {
        SEARCH_PATH
            .split(':')
            .map(|dir| Path::new(dir).join(command))
            .collect()
    };

    let mut unexecutable = false;
    for candidate in candidates {
        match fs::metadata(on_host(&candidate)) {
            Ok(meta) if meta.is_file() && meta.permissions().mode() & 0o111 != 0 => {
                return Ok(candidate)
            }
            Ok(_) => unexecutable = true,
            Err(_) => {}
        }
    }
    if unexecutable {
        Err(SpawnError::NotExecutable(command.to_string()))
    } else {
        Err(SpawnError::NotFound(command.to_string()))
    }
}

/// Run `command args...` under `profile`.
///
/// `timeout_seconds == 0` disables the deadline. `on_spawn` is called with the
/// child pid once `exec` has succeeded.
pub fn run(
    command: &str,
    args: &[String],
    timeout_seconds: u64,
    profile: &SandboxProfile,
    cancel: &CancellationToken,
    on_spawn: impl FnOnce(i32),
) -> Result<Execution, SpawnError> {
    let program = resolve_program(command, profile.chroot_dir.as_deref())?;
    run_program(&program, command, args, timeout_seconds, profile, cancel, on_spawn)
}

/// Like `run`, but execs `program` (as returned by `resolve_program`) with
/// `command` as `argv[0]`.
pub fn run_program(
    program: &Path,
    command: &str,
    args: &[String],
    timeout_seconds: u64,
    profile: &SandboxProfile,
    cancel: &CancellationToken,
    on_spawn: impl FnOnce(i32),
) -> Result<Execution, SpawnError> {
    info!(command, program = ?program, ?args, timeout_seconds, "Running command");
    debug!(
        cpu_limit_seconds = profile.cpu_limit_seconds,
        memory_limit_bytes = profile.memory_limit_bytes,
        chroot = ?profile.chroot_dir,
        drop_privileges = profile.drop_privileges,
        "Sandbox profile"
    );

    let plan = ChildPlan::new(program, command, args, profile)?;

    // Close-on-exec everywhere so concurrent spawns never inherit each
    // other's pipe ends; dup2 clears the flag on fds 1 and 2.
    let (stdout_read, stdout_write) = pipe2(OFlag::O_CLOEXEC).map_err(SpawnError::Pipe)?;
    let (stderr_read, stderr_write) = pipe2(OFlag::O_CLOEXEC).map_err(SpawnError::Pipe)?;
    let (status_read, status_write) = pipe2(OFlag::O_CLOEXEC).map_err(SpawnError::Pipe)?;

    let started = Instant::now();
    let child = match unsafe { fork() }.map_err(SpawnError::Fork)? {
        ForkResult::Child => {
            let fds = ChildFds {
                stdout: stdout_write.as_raw_fd(),
                stderr: stderr_write.as_raw_fd(),
                status: status_write.as_raw_fd(),
            };
            // Never returns.
            unsafe { exec_child(&plan, &fds) }
        }
        ForkResult::Parent { child } => child,
    };

    // Both sides set the group; whichever runs first wins the race.
    let _ = setpgid(child, child);

    drop(stdout_write);
    drop(stderr_write);
    drop(status_write);

    if let Some(err) = read_child_failure(status_read) {
        let _ = reap(child, 0);
        warn!(command, error = %err, "Child failed before exec");
        return Err(err);
    }

    info!(pid = child.as_raw(), "Child spawned");
    on_spawn(child.as_raw());

    let stdout_handle = drain(stdout_read);
    let stderr_handle = drain(stderr_read);

    // The leader stays a zombie until `reap`, so its group id cannot be
    // recycled before `kill_group` runs. Killing the group also releases any
    // straggler still holding a pipe write end.
    let ended = wait_for_exit(child, timeout_seconds, cancel);
    kill_group(child);
    let reaped = reap(child, 0);

    let stdout = stdout_handle.join().unwrap_or_default();
    let stderr = stderr_handle.join().unwrap_or_default();

    let ended = ended.map_err(SpawnError::Wait)?;
    let (status, usage) = reaped
        .map_err(SpawnError::Wait)?
        .ok_or(SpawnError::Wait(Errno::ECHILD))?;
    let outcome = match ended {
        Ending::Exited => decode_status(status),
        Ending::TimedOut => ExitOutcome::TimedOut,
        Ending::Cancelled => ExitOutcome::Cancelled,
    };
    let wall = started.elapsed();

    info!(
        pid = child.as_raw(),
        ?outcome,
        stdout_len = stdout.len(),
        stderr_len = stderr.len(),
        wall_ms = wall.as_millis() as u64,
        "Child finished"
    );

    Ok(Execution {
        pid: child.as_raw(),
        outcome,
        stdout,
        stderr,
        usage,
        wall,
    })
}

/// Run `compile`, then `run` only if compilation exited 0. Whichever step
/// ran last is returned, tagged with its phase.
pub fn compile_and_run(
    compile: &[String],
    run_cmd: &[String],
    timeout_seconds: u64,
    profile: &SandboxProfile,
    cancel: &CancellationToken,
) -> Result<PhasedExecution, PhasedSpawnError> {
    let compiled = run_argv(compile, timeout_seconds, profile, cancel).map_err(|source| {
        PhasedSpawnError {
            phase: Phase::Compile,
            source,
        }
    })?;
    if compiled.outcome != ExitOutcome::Exited(0) {
        info!(outcome = ?compiled.outcome, "Compile step failed, skipping run");
        return Ok(PhasedExecution {
            phase: Phase::Compile,
            execution: compiled,
        });
    }

    let execution = run_argv(run_cmd, timeout_seconds, profile, cancel).map_err(|source| {
        PhasedSpawnError {
            phase: Phase::Run,
            source,
        }
    })?;
    Ok(PhasedExecution {
        phase: Phase::Run,
        execution,
    })
}

/// `run` with the binary as the first argv element.
pub fn run_argv(
    argv: &[String],
    timeout_seconds: u64,
    profile: &SandboxProfile,
    cancel: &CancellationToken,
) -> Result<Execution, SpawnError> {
    let (command, args) = argv.split_first().ok_or(SpawnError::EmptyCommand)?;
    run(command, args, timeout_seconds, profile, cancel, |_| {})
}

/// Everything the child needs, allocated before `fork`.
struct ChildPlan {
    program: CString,
    argv: Vec<CString>,
    envp: Vec<CString>,
    argv_ptrs: Vec<*const libc::c_char>,
    envp_ptrs: Vec<*const libc::c_char>,
    chroot: Option<CString>,
    cpu_limit_seconds: u64,
    memory_limit_bytes: u64,
    drop_privileges: bool,
}

impl ChildPlan {
    fn new(
        program: &Path,
        command: &str,
        args: &[String],
        profile: &SandboxProfile,
    ) -> Result<Self, SpawnError> {
        if command.is_empty() {
            return Err(SpawnError::EmptyCommand);
        }
        let cstring =
            |s: &str| CString::new(s).map_err(|_| SpawnError::InvalidArgument(s.to_string()));
        let program = CString::new(program.as_os_str().as_bytes())
            .map_err(|_| SpawnError::InvalidArgument(program.display().to_string()))?;

        let mut argv = Vec::with_capacity(args.len() + 1);
        argv.push(cstring(command)?);
        for arg in args {
            argv.push(cstring(arg)?);
        }
        let envp = vec![cstring(&format!("PATH={SEARCH_PATH}"))?, cstring(CHILD_HOME)?];

        let chroot = match &profile.chroot_dir {
            Some(dir) => Some(
                CString::new(dir.as_os_str().as_bytes())
                    .map_err(|_| SpawnError::InvalidArgument(dir.display().to_string()))?,
            ),
            None => None,
        };

        // CString buffers live on the heap, so these pointers stay valid when
        // the plan is moved.
        let argv_ptrs = null_terminated(&argv);
        let envp_ptrs = null_terminated(&envp);

        Ok(Self {
            program,
            argv,
            envp,
            argv_ptrs,
            envp_ptrs,
            chroot,
            cpu_limit_seconds: profile.cpu_limit_seconds,
            memory_limit_bytes: profile.memory_limit_bytes,
            drop_privileges: profile.drop_privileges,
        })
    }
}

fn null_terminated(strings: &[CString]) -> Vec<*const libc::c_char> {
    strings
        .iter()
        .map(|s| s.as_ptr())
        .chain(std::iter::once(std::ptr::null()))
        .collect()
}

struct ChildFds {
    stdout: RawFd,
    stderr: RawFd,
    status: RawFd,
}

const CHILD_STAGES: [&str; 11] = [
    "setpgid",
    "dup2",
    "rlimit cpu",
    "rlimit as",
    "rlimit core",
    "chroot",
    "chdir",
    "setgroups",
    "setgid",
    "setuid",
    "exec",
];

/// Child side of `fork`. Only async-signal-safe calls from here on: no
/// allocation, no locks, no logging.
unsafe fn exec_child(plan: &ChildPlan, fds: &ChildFds) -> ! {
    let check = |stage: u32, rc: libc::c_int| {
        if rc != 0 {
            report_and_exit(fds.status, stage, Errno::last_raw());
        }
    };

    check(0, libc::setpgid(0, 0));
    if libc::dup2(fds.stdout, libc::STDOUT_FILENO) < 0
        || libc::dup2(fds.stderr, libc::STDERR_FILENO) < 0
    {
        report_and_exit(fds.status, 1, Errno::last_raw());
    }

    if plan.cpu_limit_seconds > 0 {
        let cpu = plan.cpu_limit_seconds;
        if let Err(e) = setrlimit(Resource::RLIMIT_CPU, cpu, cpu) {
            report_and_exit(fds.status, 2, e as i32);
        }
    }
    if plan.memory_limit_bytes > 0 {
        let mem = plan.memory_limit_bytes;
        if let Err(e) = setrlimit(Resource::RLIMIT_AS, mem, mem) {
            report_and_exit(fds.status, 3, e as i32);
        }
    }
    if let Err(e) = setrlimit(Resource::RLIMIT_CORE, 0, 0) {
        report_and_exit(fds.status, 4, e as i32);
    }

    if let Some(root) = &plan.chroot {
        check(5, libc::chroot(root.as_ptr()));
        check(6, libc::chdir(b"/\0".as_ptr().cast()));
    }

    if plan.drop_privileges {
        check(7, libc::setgroups(0, std::ptr::null()));
        check(8, libc::setgid(NOBODY_GID));
        check(9, libc::setuid(NOBODY_UID));
    }

    libc::execve(
        plan.program.as_ptr(),
        plan.argv_ptrs.as_ptr(),
        plan.envp_ptrs.as_ptr(),
    );
    report_and_exit(fds.status, 10, Errno::last_raw())
}

unsafe fn report_and_exit(status_fd: RawFd, stage: u32, errno: i32) -> ! {
    let mut report = [0u8; 8];
    report[..4].copy_from_slice(&stage.to_ne_bytes());
    report[4..].copy_from_slice(&errno.to_ne_bytes());
    libc::write(status_fd, report.as_ptr().cast(), report.len());
    libc::_exit(127)
}

/// Blocks until the child either execs or reports a setup failure.
fn read_child_failure(status_read: OwnedFd) -> Option<SpawnError> {
    let mut report = Vec::with_capacity(8);
    if let Err(e) = File::from(status_read).read_to_end(&mut report) {
        warn!(error = %e, "Reading child status pipe failed");
        return None;
    }
    if report.len() < 8 {
        return None;
    }
    let stage = u32::from_ne_bytes([report[0], report[1], report[2], report[3]]) as usize;
    let errno = i32::from_ne_bytes([report[4], report[5], report[6], report[7]]);
    Some(SpawnError::Child {
        stage: CHILD_STAGES.get(stage).copied().unwrap_or("setup"),
        errno: Errno::from_raw(errno),
    })
}

fn drain(fd: OwnedFd) -> JoinHandle<Vec<u8>> {
    thread::spawn(move || {
        let mut output = Vec::new();
        let _ = File::from(fd).read_to_end(&mut output);
        output
    })
}

enum Ending {
    Exited,
    TimedOut,
    Cancelled,
}

/// Poll until the child exits, the deadline passes or `cancel` fires. The
/// child is left unreaped.
fn wait_for_exit(
    child: Pid,
    timeout_seconds: u64,
    cancel: &CancellationToken,
) -> Result<Ending, Errno> {
    let deadline =
        (timeout_seconds > 0).then(|| Instant::now() + Duration::from_secs(timeout_seconds));
    let mut pause = POLL_MIN;

    loop {
        if has_exited(child)? {
            return Ok(Ending::Exited);
        }
        if cancel.is_cancelled() {
            info!(pid = child.as_raw(), "Cancellation requested, killing process group");
            return Ok(Ending::Cancelled);
        }

        let now = Instant::now();
        let nap = match deadline {
            Some(deadline) if now >= deadline => {
                warn!(pid = child.as_raw(), timeout_seconds, "Deadline passed, killing process group");
                return Ok(Ending::TimedOut);
            }
            Some(deadline) => pause.min(deadline - now),
            None => pause,
        };
        thread::sleep(nap);
        pause = (pause * 2).min(POLL_MAX);
    }
}

fn has_exited(child: Pid) -> Result<bool, Errno> {
    loop {
        let mut info: libc::siginfo_t = unsafe { std::mem::zeroed() };
        let rc = unsafe {
            libc::waitid(
                libc::P_PID,
                child.as_raw() as libc::id_t,
                &mut info,
                libc::WEXITED | libc::WNOHANG | libc::WNOWAIT,
            )
        };
        if rc == 0 {
            return Ok(unsafe { info.si_pid() } != 0);
        }
        match Errno::last() {
            Errno::EINTR => continue,
            e => return Err(e),
        }
    }
}

/// `wait4` with EINTR retry. `None` only with `WNOHANG` and a live child.
fn reap(child: Pid, flags: libc::c_int) -> Result<Option<(libc::c_int, ResourceUsage)>, Errno> {
    loop {
        let mut status: libc::c_int = 0;
        let mut ru: libc::rusage = unsafe { std::mem::zeroed() };
        let rc = unsafe { libc::wait4(child.as_raw(), &mut status, flags, &mut ru) };
        match rc {
            0 => return Ok(None),
            rc if rc > 0 => return Ok(Some((status, ResourceUsage::from_rusage(&ru)))),
            _ => match Errno::last() {
                Errno::EINTR => continue,
                e => return Err(e),
            },
        }
    }
}

fn kill_group(child: Pid) {
    match killpg(child, Signal::SIGKILL) {
        Ok(()) | Err(Errno::ESRCH) => {}
        Err(e) => {
            warn!(pid = child.as_raw(), error = %e, "killpg failed, killing leader only");
            let _ = nix::sys::signal::kill(child, Signal::SIGKILL);
        }
    }
}

fn decode_status(status: libc::c_int) -> ExitOutcome {
    if libc::WIFEXITED(status) {
        ExitOutcome::Exited(libc::WEXITSTATUS(status))
    } else if libc::WIFSIGNALED(status) {
        ExitOutcome::Signaled(libc::WTERMSIG(status))
    } else {
        ExitOutcome::Signaled(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sh(script: &str) -> Vec<String> {
        vec!["/bin/sh".to_string(), "-c".to_string(), script.to_string()]
    }

    fn run_sh(script: &str, timeout_seconds: u64) -> Result<Execution, SpawnError> {
        run_argv(
            &sh(script),
            timeout_seconds,
            &SandboxProfile::default(),
            &CancellationToken::new(),
        )
    }

    fn process_exists(pid: i32) -> bool {
        nix::sys::signal::kill(Pid::from_raw(pid), None).is_ok()
    }

    #[test]
    fn captures_stdout_and_stderr_separately() {
        let execution = run_sh("echo out; echo err >&2", 5).unwrap();
        assert_eq!(execution.outcome, ExitOutcome::Exited(0));
        assert_eq!(execution.stdout_lossy(), "out\n");
        assert_eq!(execution.stderr_lossy(), "err\n");
        assert_eq!(execution.io_bytes(), 8);
    }

    #[test]
    fn preserves_exit_status() {
        let execution = run_sh("exit 42", 5).unwrap();
        assert_eq!(execution.outcome, ExitOutcome::Exited(42));
        assert_eq!(execution.outcome.legacy_code(), 42);
    }

    #[test]
    fn passes_arguments_through() {
        let args = ["%s|", "a b", "c"].map(String::from);
        let execution = run(
            "printf",
            &args,
            5,
            &SandboxProfile::default(),
            &CancellationToken::new(),
            |_| {},
        )
        .unwrap();
        assert_eq!(execution.stdout_lossy(), "a b|c|");
    }

    #[test]
    fn kills_on_deadline() {
        let started = Instant::now();
        let execution = run_sh("sleep 10", 1).unwrap();
        assert_eq!(execution.outcome, ExitOutcome::TimedOut);
        assert_eq!(execution.outcome.legacy_code(), CODE_TIMED_OUT);
        assert!(started.elapsed() < Duration::from_secs(3));
        assert!(!process_exists(execution.pid));
    }

    #[test]
    fn reports_signal_death() {
        let execution = run_sh("kill -9 $$", 5).unwrap();
        assert_eq!(execution.outcome, ExitOutcome::Signaled(9));
        assert_eq!(execution.outcome.legacy_code(), CODE_SIGNALED);
    }

    #[test]
    fn missing_binary_is_a_spawn_error() {
        let result = run_argv(
            &["/definitely/not/here".to_string()],
            5,
            &SandboxProfile::default(),
            &CancellationToken::new(),
        );
        assert_eq!(legacy_code(&result), CODE_SPAWN_FAILED);
        assert!(matches!(result, Err(SpawnError::NotFound(cmd)) if cmd == "/definitely/not/here"));
    }

    #[test]
    fn exec_failure_reports_its_stage() {
        let result = run_program(
            Path::new("/definitely/not/here"),
            "here",
            &[],
            5,
            &SandboxProfile::default(),
            &CancellationToken::new(),
            |_| {},
        );
        match result {
            Err(SpawnError::Child { stage, errno }) => {
                assert_eq!(stage, "exec");
                assert_eq!(errno, Errno::ENOENT);
            }
            other => panic!("expected exec failure, got {other:?}"),
        }
    }

    #[test]
    fn bare_names_resolve_through_the_child_path() {
        let program = resolve_program("sh", None).unwrap();
        assert!(program.is_absolute());
        assert!(SEARCH_PATH
            .split(':')
            .any(|dir| program.parent() == Some(Path::new(dir))));
        assert_eq!(resolve_program("/bin/sh", None).unwrap(), Path::new("/bin/sh"));
        assert!(matches!(
            resolve_program("definitely-not-a-binary-xyz", None),
            Err(SpawnError::NotFound(_))
        ));
        assert!(matches!(resolve_program("", None), Err(SpawnError::EmptyCommand)));
    }

    #[test]
    fn chrooted_lookup_returns_the_in_root_path() {
        let root = tempfile::tempdir().unwrap();
        let bin = root.path().join("bin");
        fs::create_dir(&bin).unwrap();
        fs::write(bin.join("tool"), "#!/bin/sh\n").unwrap();
        fs::set_permissions(bin.join("tool"), fs::Permissions::from_mode(0o755)).unwrap();
        fs::write(bin.join("data"), "plain").unwrap();

        assert_eq!(
            resolve_program("tool", Some(root.path())).unwrap(),
            Path::new("/bin/tool")
        );
        assert_eq!(
            resolve_program("/bin/tool", Some(root.path())).unwrap(),
            Path::new("/bin/tool")
        );
        assert!(matches!(
            resolve_program("data", Some(root.path())),
            Err(SpawnError::NotExecutable(_))
        ));
    }

    #[test]
    fn execs_the_resolved_path_not_argv0() {
        let args = ["-c", "echo $0"].map(String::from);
        let execution = run_program(
            Path::new("/bin/sh"),
            "renamed",
            &args,
            5,
            &SandboxProfile::default(),
            &CancellationToken::new(),
            |_| {},
        )
        .unwrap();
        assert_eq!(execution.outcome, ExitOutcome::Exited(0));
        assert_eq!(execution.stdout_lossy(), "renamed\n");
    }

    #[test]
    fn rejects_empty_and_nul_arguments() {
        let token = CancellationToken::new();
        let profile = SandboxProfile::default();
        assert!(matches!(
            run_argv(&[], 1, &profile, &token),
            Err(SpawnError::EmptyCommand)
        ));
        assert!(matches!(
            run_argv(&["bad\0arg".to_string()], 1, &profile, &token),
            Err(SpawnError::InvalidArgument(_))
        ));
    }

    #[test]
    fn large_output_does_not_stall() {
        let execution = run_sh("head -c 300000 /dev/zero", 10).unwrap();
        assert_eq!(execution.outcome, ExitOutcome::Exited(0));
        assert_eq!(execution.stdout.len(), 300_000);
    }

    #[test]
    fn background_children_do_not_hold_the_job_open() {
        let started = Instant::now();
        let execution = run_sh("sleep 30 & echo done", 10).unwrap();
        assert_eq!(execution.outcome, ExitOutcome::Exited(0));
        assert_eq!(execution.stdout_lossy(), "done\n");
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn cancellation_kills_the_child() {
        let token = CancellationToken::new();
        let trigger = token.clone();
        let canceller = thread::spawn(move || {
            thread::sleep(Duration::from_millis(200));
            trigger.cancel();
        });
        let started = Instant::now();
        let execution = run_argv(&sh("sleep 10"), 0, &SandboxProfile::default(), &token).unwrap();
        canceller.join().unwrap();
        assert_eq!(execution.outcome, ExitOutcome::Cancelled);
        assert!(started.elapsed() < Duration::from_secs(3));
        assert!(!process_exists(execution.pid));
    }

    #[test]
    fn cpu_limit_terminates_busy_loop() {
        let profile = SandboxProfile {
            cpu_limit_seconds: 1,
            ..Default::default()
        };
        let execution = run_argv(
            &sh("while :; do :; done"),
            10,
            &profile,
            &CancellationToken::new(),
        )
        .unwrap();
        match execution.outcome {
            ExitOutcome::Signaled(sig) => {
                assert!(sig == libc::SIGXCPU || sig == libc::SIGKILL, "signal {sig}")
            }
            other => panic!("expected rlimit signal, got {other:?}"),
        }
        assert!(execution.usage.user_time_us + execution.usage.system_time_us >= 900_000);
    }

    #[test]
    fn memory_limit_stops_large_allocations() {
        let script = "dd if=/dev/zero of=/dev/null bs=128M count=1";
        let unlimited = run_sh(script, 10).unwrap();
        assert_eq!(unlimited.outcome, ExitOutcome::Exited(0));

        let profile = SandboxProfile {
            memory_limit_bytes: 64 * 1024 * 1024,
            ..Default::default()
        };
        let limited = run_argv(&sh(script), 10, &profile, &CancellationToken::new()).unwrap();
        assert_ne!(limited.outcome, ExitOutcome::Exited(0));
    }

    #[test]
    fn on_spawn_sees_the_child_pid() {
        let mut seen = None;
        let execution = run(
            "true",
            &[],
            5,
            &SandboxProfile::default(),
            &CancellationToken::new(),
            |pid| seen = Some(pid),
        )
        .unwrap();
        assert_eq!(seen, Some(execution.pid));
    }

    #[test]
    fn compile_failure_skips_run() {
        let phased = compile_and_run(
            &sh("echo compiling; exit 3"),
            &sh("echo should-not-run"),
            5,
            &SandboxProfile::default(),
            &CancellationToken::new(),
        )
        .unwrap();
        assert_eq!(phased.phase, Phase::Compile);
        assert_eq!(phased.execution.outcome, ExitOutcome::Exited(3));
        assert_eq!(phased.execution.stdout_lossy(), "compiling\n");
    }

    #[test]
    fn compile_success_runs_second_step() {
        let phased = compile_and_run(
            &sh("true"),
            &sh("echo ran; exit 7"),
            5,
            &SandboxProfile::default(),
            &CancellationToken::new(),
        )
        .unwrap();
        assert_eq!(phased.phase, Phase::Run);
        assert_eq!(phased.execution.outcome, ExitOutcome::Exited(7));
        assert_eq!(phased.execution.stdout_lossy(), "ran\n");
    }

    #[test]
    fn run_spawn_failure_carries_phase() {
        let err = compile_and_run(
            &sh("true"),
            &["/no/such/binary".to_string()],
            5,
            &SandboxProfile::default(),
            &CancellationToken::new(),
        )
        .unwrap_err();
        assert_eq!(err.phase, Phase::Run);
    }
}
