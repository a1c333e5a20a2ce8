//! Process Launcher
//!
//! Starts one process per task and serves the group through a
//! [`HubServer`]. Each task gets its own pipe pair on fd 3/4.

use crate::server::HubServer;
use spmd_core::host_name;
use spmd_ipc::{GroupInfo, IPC_FD_ENV};
use std::os::unix::io::{FromRawFd, RawFd};
use std::os::unix::process::{CommandExt, ExitStatusExt};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Hidden flag that puts the executable in task mode
pub const TASK_FLAG: &str = "--spmd-task";

/// Exit status of a launch that ran out of time
pub const TIMEOUT_EXIT_CODE: u8 = 124;

/// Grace period between SIGTERM and SIGKILL
const KILL_GRACE: Duration = Duration::from_millis(500);

/// Pipe fds are moved at least this high before any child is spawned, so
/// the dup2 onto 3 and 4 in the child cannot clobber one another.
const MIN_PIPE_FD: RawFd = 10;

/// Failures that stop the launcher itself
#[derive(Debug, Error)]
pub enum LaunchError {
    #[error("a group needs at least one task")]
    EmptyGroup,

    #[error("could not locate the task executable: {0}")]
    CurrentExe(std::io::Error),

    #[error("failed to create IPC pipes: {0}")]
    Pipe(std::io::Error),

    #[error("failed to spawn task {rank}: {source}")]
    Spawn {
        rank: usize,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to start reader thread for task {rank}: {source}")]
    Reader {
        rank: usize,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to wait for task {rank}: {source}")]
    Wait {
        rank: usize,
        #[source]
        source: std::io::Error,
    },
}

/// What to start
#[derive(Debug, Clone)]
pub struct LaunchPlan {
    /// Executable run by every task
    pub binary: PathBuf,
    /// Arguments for every task, after [`TASK_FLAG`]
    pub task_args: Vec<String>,
    /// Number of tasks
    pub tasks: usize,
    /// Wall-clock limit for the whole group
    pub timeout: Option<Duration>,
}

impl LaunchPlan {
    /// Plan that re-runs the current executable in task mode
    pub fn current_exe(tasks: usize, task_args: Vec<String>) -> Result<Self, LaunchError> {
        let binary = std::env::current_exe().map_err(LaunchError::CurrentExe)?;
        Ok(Self {
            binary,
            task_args,
            tasks,
            timeout: None,
        })
    }

    /// Set the wall-clock limit
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }
}

/// How each task ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchReport {
    /// Exit code per rank; a signal-terminated task reports `128 + signo`
    pub exit_codes: Vec<u8>,
    /// Whether the launcher gave up waiting
    pub timed_out: bool,
    /// Collective rounds the hub completed
    pub rounds: u64,
}

impl LaunchReport {
    /// The launcher's own exit code.
    ///
    /// A timeout wins; otherwise the manager's code if it failed, else the
    /// first failing rank's code, else 0.
    pub fn exit_code(&self, manager_rank: usize) -> u8 {
        if self.timed_out {
            return TIMEOUT_EXIT_CODE;
        }
        aggregate_exit_codes(&self.exit_codes, manager_rank)
    }
}

/// Combine per-rank exit codes into the group's code
pub fn aggregate_exit_codes(codes: &[u8], manager_rank: usize) -> u8 {
    match codes.get(manager_rank) {
        Some(&code) if code != 0 => code,
        _ => codes.iter().copied().find(|&c| c != 0).unwrap_or(0),
    }
}

/// Map a process exit status onto a `u8`
pub fn exit_code_of(status: ExitStatus) -> u8 {
    match (status.code(), status.signal()) {
        (Some(code), _) => code.clamp(0, 255) as u8,
        (None, Some(signo)) => (128 + signo).clamp(0, 255) as u8,
        (None, None) => 255,
    }
}

/// Create a pipe pair, returning (read_fd, write_fd), both close-on-exec
/// and numbered at or above [`MIN_PIPE_FD`].
fn create_pipe() -> Result<(RawFd, RawFd), std::io::Error> {
    let mut fds = [0 as RawFd; 2];
    let ret = unsafe { libc::pipe(fds.as_mut_ptr()) };
    if ret != 0 {
        return Err(std::io::Error::last_os_error());
    }
    let mut raised = [0 as RawFd; 2];
    for (slot, &fd) in raised.iter_mut().zip(&fds) {
        let high = unsafe { libc::fcntl(fd, libc::F_DUPFD_CLOEXEC, MIN_PIPE_FD) };
        let err = std::io::Error::last_os_error();
        close_fd(fd);
        if high < 0 {
            for &done in raised.iter().filter(|&&r| r > 0) {
                close_fd(done);
            }
            return Err(err);
        }
        *slot = high;
    }
    Ok((raised[0], raised[1]))
}

/// Close a raw file descriptor.
fn close_fd(fd: RawFd) {
    unsafe {
        libc::close(fd);
    }
}

/// Send SIGTERM to a process. Returns `Err` if the signal could not be delivered.
fn send_sigterm(pid: u32) -> Result<(), std::io::Error> {
    let ret = unsafe { libc::kill(pid as libc::pid_t, libc::SIGTERM) };
    if ret == -1 {
        Err(std::io::Error::last_os_error())
    } else {
        Ok(())
    }
}

/// A spawned task and the hub-side ends of its pipes
struct SpawnedTask {
    child: Child,
    reader: std::fs::File,
    writer: std::fs::File,
}

fn spawn_task(
    rank: usize,
    binary: &Path,
    task_args: &[String],
) -> Result<SpawnedTask, LaunchError> {
    // cmd_pipe: hub writes replies → task reads from fd 3
    let (cmd_read, cmd_write) = create_pipe().map_err(LaunchError::Pipe)?;
    // msg_pipe: task writes requests to fd 4 → hub reads
    let (msg_read, msg_write) = match create_pipe() {
        Ok(fds) => fds,
        Err(e) => {
            close_fd(cmd_read);
            close_fd(cmd_write);
            return Err(LaunchError::Pipe(e));
        }
    };

    let mut command = Command::new(binary);
    command
        .arg(TASK_FLAG)
        .args(task_args)
        .env(IPC_FD_ENV, "3,4")
        .stdin(Stdio::null())
        .stdout(Stdio::inherit())
        .stderr(Stdio::inherit());

    // In the child: dup cmd_read→3, msg_write→4. dup2 leaves the new fds
    // without close-on-exec; every other pipe end is closed by exec.
    unsafe {
        command.pre_exec(move || {
            if libc::dup2(cmd_read, 3) == -1 || libc::dup2(msg_write, 4) == -1 {
                return Err(std::io::Error::last_os_error());
            }
            for fd in [3, 4] {
                let flags = libc::fcntl(fd, libc::F_GETFD);
                libc::fcntl(fd, libc::F_SETFD, flags & !libc::FD_CLOEXEC);
            }
            Ok(())
        });
    }

    let child = match command.spawn() {
        Ok(c) => c,
        Err(source) => {
            for fd in [cmd_read, cmd_write, msg_read, msg_write] {
                close_fd(fd);
            }
            return Err(LaunchError::Spawn { rank, source });
        }
    };

    // Close the child-side ends in the parent
    close_fd(cmd_read);
    close_fd(msg_write);
    debug!(rank, pid = child.id(), "spawned task");

    Ok(SpawnedTask {
        child,
        reader: unsafe { std::fs::File::from_raw_fd(msg_read) },
        writer: unsafe { std::fs::File::from_raw_fd(cmd_write) },
    })
}

/// Start every task, serve the group until all pipes close, and collect
/// exit codes.
pub fn launch(plan: &LaunchPlan) -> Result<LaunchReport, LaunchError> {
    if plan.tasks == 0 {
        return Err(LaunchError::EmptyGroup);
    }

    let processor = host_name().unwrap_or_else(|| "localhost".to_string());
    let mut server = HubServer::new(GroupInfo::current("world", processor), plan.tasks);

    let mut children: Vec<Child> = Vec::with_capacity(plan.tasks);
    for rank in 0..plan.tasks {
        let attached = spawn_task(rank, &plan.binary, &plan.task_args).and_then(|task| {
            children.push(task.child);
            server
                .attach(rank, Box::new(task.reader), Box::new(task.writer))
                .map_err(|source| LaunchError::Reader { rank, source })
        });
        if let Err(e) = attached {
            server.disconnect();
            terminate(&mut children);
            for child in &mut children {
                let _ = child.wait();
            }
            return Err(e);
        }
    }
    info!(tasks = plan.tasks, binary = %plan.binary.display(), "group launched");

    let deadline = plan.timeout.map(|t| Instant::now() + t);
    let timed_out = server.serve(deadline);
    // Hub-side pipe ends go first so a task blocked on a reply sees EOF.
    server.disconnect();
    if timed_out {
        warn!(timeout = ?plan.timeout, "group timed out; terminating tasks");
        terminate(&mut children);
    }

    let mut exit_codes = Vec::with_capacity(children.len());
    for (rank, child) in children.iter_mut().enumerate() {
        let status = child
            .wait()
            .map_err(|source| LaunchError::Wait { rank, source })?;
        let code = exit_code_of(status);
        if code == 0 {
            debug!(rank, "task exited cleanly");
        } else {
            info!(rank, code, "task exited with failure");
        }
        exit_codes.push(code);
    }

    Ok(LaunchReport {
        exit_codes,
        timed_out,
        rounds: server.completed_rounds(),
    })
}

/// SIGTERM every running task, wait out the grace period, then SIGKILL.
fn terminate(children: &mut [Child]) {
    for child in children.iter_mut() {
        if matches!(child.try_wait(), Ok(None)) {
            let _ = send_sigterm(child.id());
        }
    }

    let grace_deadline = Instant::now() + KILL_GRACE;
    while Instant::now() < grace_deadline {
        if children
            .iter_mut()
            .all(|c| !matches!(c.try_wait(), Ok(None)))
        {
            return;
        }
        thread::sleep(Duration::from_millis(20));
    }

    for (rank, child) in children.iter_mut().enumerate() {
        if matches!(child.try_wait(), Ok(None)) {
            warn!(rank, "task ignored SIGTERM; killing");
            let _ = child.kill();
        }
    }
}
