//! Emulator process lifecycle.
//!
//! The [`Supervisor`] owns at most one `qemu-system-*` child at a time. All of
//! its operations are synchronous and return immediately, so they can be
//! called straight from the console's event loop: spawning is
//! fire-and-forget, liveness is a `try_wait` poll, and termination is a kill
//! signal.
//!
//! ## States
//!
//! ```text
//!            start() ok
//!   Idle ──────────────────► Running
//!    ▲                         │  terminate(true) / shutdown_hook()
//!    │                         ▼
//!    └──────────────────── Terminating
//!    ▲       kill sent         │ kill refused → Running
//!    └─────────────────────────┘
//!      child exited on its own (observed by poll)
//! ```

use std::io;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};

use chrono::{DateTime, Utc};
use tokio::process::{Child, ChildStderr, ChildStdout, Command};
use tracing::{debug, error, info, warn};

use crate::vm::VmConfig;
use crate::vm::command::build_args;

/// Observed lifecycle state of the supervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorState {
    /// No emulator process is owned.
    Idle,
    /// An emulator process was spawned and has not been seen to exit.
    Running,
    /// A kill has been requested and the handle is being released.
    Terminating,
}

#[derive(Debug, thiserror::Error)]
pub enum StartError {
    #[error("QEMU binary not found at {}; is QEMU installed?", .0.display())]
    BinaryNotFound(PathBuf),
    #[error("the specified CD-ROM image does not exist: {}", .0.display())]
    CdromNotFound(PathBuf),
    #[error("the specified disk image does not exist: {}", .0.display())]
    DiskNotFound(PathBuf),
    #[error("a VM is already running (pid {pid})")]
    AlreadyRunning { pid: u32 },
    #[error("failed to launch {}: {source}", .binary.display())]
    LaunchFailed {
        binary: PathBuf,
        #[source]
        source: io::Error,
    },
}

#[derive(Debug, thiserror::Error)]
pub enum TerminateError {
    #[error("the VM is not running")]
    NotRunning,
    #[error("failed to kill the VM process (pid {pid}): {source}")]
    KillFailed {
        pid: u32,
        #[source]
        source: io::Error,
    },
}

/// The live emulator process and the configuration it was started with.
///
/// Only the supervisor holds one; callers get it by reference.
pub struct ProcessHandle {
    child: Child,
    pid: u32,
    binary: PathBuf,
    config: VmConfig,
    started_at: DateTime<Utc>,
}

impl ProcessHandle {
    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn binary(&self) -> &Path {
        &self.binary
    }

    pub fn config(&self) -> &VmConfig {
        &self.config
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn uptime(&self) -> chrono::Duration {
        Utc::now() - self.started_at
    }
}

impl std::fmt::Debug for ProcessHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessHandle")
            .field("pid", &self.pid)
            .field("binary", &self.binary)
            .field("started_at", &self.started_at)
            .finish_non_exhaustive()
    }
}

/// Owner of the single emulator child process.
#[derive(Debug)]
pub struct Supervisor {
    emulator_dir: PathBuf,
    state: SupervisorState,
    handle: Option<ProcessHandle>,
    shut_down: bool,
}

impl Supervisor {
    /// `emulator_dir` is the directory holding the `qemu-system-*` binaries.
    pub fn new(emulator_dir: impl Into<PathBuf>) -> Self {
        Self {
            emulator_dir: emulator_dir.into(),
            state: SupervisorState::Idle,
            handle: None,
            shut_down: false,
        }
    }

    pub fn emulator_dir(&self) -> &Path {
        &self.emulator_dir
    }

    /// Full path of the emulator binary for `arch`, including the platform
    /// executable suffix.
    pub fn emulator_binary(&self, arch: crate::vm::Architecture) -> PathBuf {
        self.emulator_dir
            .join(format!("{}{}", arch.binary_name(), std::env::consts::EXE_SUFFIX))
    }

    pub fn state(&self) -> SupervisorState {
        self.state
    }

    /// The live process, if any. Does not poll.
    pub fn handle(&self) -> Option<&ProcessHandle> {
        self.handle.as_ref()
    }

    /// Validate preconditions and spawn the emulator.
    ///
    /// Checks, first failure wins: no live process, emulator binary present,
    /// CD-ROM present (unless skipped), disk image present. The child gets
    /// stdin from `/dev/null` and piped stdout/stderr; see [`Self::take_output`].
    ///
    /// Must be called from within a Tokio runtime.
    pub fn start(&mut self, config: VmConfig) -> Result<&ProcessHandle, StartError> {
        if self.is_running() {
            let pid = self.handle.as_ref().map(|h| h.pid).unwrap_or_default();
            warn!(pid, "start requested while a VM is running");
            return Err(StartError::AlreadyRunning { pid });
        }

        let binary = self.emulator_binary(config.architecture);
        if !binary.is_file() {
            return Err(StartError::BinaryNotFound(binary));
        }

        if !config.skip_cdrom {
            let cdrom = config.cdrom_image_path.clone().unwrap_or_default();
            if cdrom.as_os_str().is_empty() || !cdrom.exists() {
                return Err(StartError::CdromNotFound(cdrom));
            }
        }

        if !config.disk_image_path.exists() {
            return Err(StartError::DiskNotFound(config.disk_image_path.clone()));
        }

        let args = build_args(&config);
        debug!(binary = %binary.display(), ?args, "launching emulator");

        let mut cmd = Command::new(&binary);
        cmd.args(&args);
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());

        let child = cmd.spawn().map_err(|source| {
            error!(binary = %binary.display(), error = %source, "emulator spawn failed");
            StartError::LaunchFailed {
                binary: binary.clone(),
                source,
            }
        })?;
        let pid = child.id().unwrap_or_default();

        info!(
            pid,
            arch = %config.architecture,
            cpus = config.cpu_count,
            memory_mb = config.memory_mb,
            disk = %config.disk_image_path.display(),
            "VM spawned"
        );

        self.state = SupervisorState::Running;
        let handle = self.handle.insert(ProcessHandle {
            child,
            pid,
            binary,
            config,
            started_at: Utc::now(),
        });
        Ok(&*handle)
    }

    /// Returns `true` while the emulator is alive. Never blocks.
    ///
    /// A child that exited on its own is reaped here and the supervisor
    /// falls back to `Idle`.
    pub fn is_running(&mut self) -> bool {
        self.poll_exit();
        matches!(
            self.state,
            SupervisorState::Running | SupervisorState::Terminating
        )
    }

    /// Poll the child once. Returns its exit status if it has exited since
    /// the last poll, clearing the handle.
    pub fn poll_exit(&mut self) -> Option<ExitStatus> {
        let handle = self.handle.as_mut()?;
        match handle.child.try_wait() {
            Ok(Some(status)) => {
                info!(pid = handle.pid, exit_status = %status, "VM process exited");
                self.handle = None;
                self.state = SupervisorState::Idle;
                Some(status)
            }
            Ok(None) => None,
            Err(e) => {
                // Keep trusting the handle; the next poll may succeed.
                error!(pid = handle.pid, error = %e, "try_wait error while polling VM");
                None
            }
        }
    }

    /// Forcibly stop the emulator.
    ///
    /// `confirmed == false` means the user declined; nothing happens. The
    /// caller owns the confirmation dialog.
    pub fn terminate(&mut self, confirmed: bool) -> Result<(), TerminateError> {
        if !self.is_running() {
            return Err(TerminateError::NotRunning);
        }
        if !confirmed {
            debug!("terminate declined");
            return Ok(());
        }
        self.kill()
    }

    /// Exit-time cleanup. Kills the emulator without confirmation if it was
    /// started with `kill_on_exit`. Runs at most once.
    pub fn shutdown_hook(&mut self) {
        if self.shut_down {
            return;
        }
        self.shut_down = true;

        if !self.is_running() {
            return;
        }
        let Some(handle) = self.handle.as_ref() else {
            return;
        };
        if !handle.config.kill_on_exit {
            info!(pid = handle.pid, "leaving VM running on exit");
            return;
        }
        if let Err(e) = self.kill() {
            warn!(error = %e, "failed to kill VM on exit");
        }
    }

    /// Hand the captured stdout/stderr pipes to the caller. Returns `None`
    /// for a stream that was already taken or when no process is running.
    pub fn take_output(&mut self) -> Option<(Option<ChildStdout>, Option<ChildStderr>)> {
        let handle = self.handle.as_mut()?;
        Some((handle.child.stdout.take(), handle.child.stderr.take()))
    }

    fn kill(&mut self) -> Result<(), TerminateError> {
        self.state = SupervisorState::Terminating;

        let Some(handle) = self.handle.as_mut() else {
            self.state = SupervisorState::Idle;
            return Err(TerminateError::NotRunning);
        };
        let pid = handle.pid;

        match handle.child.start_kill() {
            Ok(()) => {
                info!(pid, "VM process killed");
                // Dropping the child leaves reaping to the runtime.
                self.handle = None;
                self.state = SupervisorState::Idle;
                Ok(())
            }
            Err(source) => {
                error!(pid, error = %source, "kill failed");
                self.state = SupervisorState::Running;
                Err(TerminateError::KillFailed { pid, source })
            }
        }
    }
}

impl Drop for Supervisor {
    fn drop(&mut self) {
        self.shutdown_hook();
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
