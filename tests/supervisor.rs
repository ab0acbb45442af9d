//! Process supervisor tests against fake emulators.
//!
//! Each test gets a scratch directory holding a shell script named like the
//! QEMU binary (`qemu-system-x86_64`) plus whatever disk/CD-ROM files the
//! scenario needs. The scripts ignore QEMU's arguments unless the test says
//! otherwise, so no real emulator is required.

#![cfg(unix)]

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tempfile::TempDir;
use tokio::io::{AsyncBufReadExt, BufReader};

use qemu_manager::vm::{
    Architecture, ProcessHandle, StartError, Supervisor, SupervisorState, TerminateError, VmConfig,
};

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

const LONG_RUNNING: &str = "exec sleep 30";

/// ETXTBSY: a freshly written script can be briefly "busy" if another test
/// thread forked while its file descriptor was open.
const ETXTBSY: i32 = 26;

struct Fixture {
    dir: TempDir,
}

impl Fixture {
    fn new() -> Self {
        Self {
            dir: tempfile::tempdir().expect("create temp dir"),
        }
    }

    fn path(&self) -> &Path {
        self.dir.path()
    }

    /// Write an executable `qemu-system-<arch>` script with the given body.
    fn emulator(&self, arch: Architecture, body: &str) -> PathBuf {
        let path = self.path().join(arch.binary_name());
        std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).expect("write fake emulator");
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755))
            .expect("chmod fake emulator");
        path
    }

    fn file(&self, name: &str) -> PathBuf {
        let path = self.path().join(name);
        std::fs::write(&path, b"").expect("write image");
        path
    }

    fn supervisor(&self) -> Supervisor {
        Supervisor::new(self.path())
    }

    /// The scenario config: x86_64, 4 CPUs, 4096 MB, installed system.
    fn config(&self) -> VmConfig {
        let mut config = VmConfig::new(self.file("disk.qcow2"));
        config.architecture = Architecture::X86_64;
        config.cpu_count = 4;
        config.memory_mb = 4096;
        config.skip_cdrom = true;
        config
    }
}

fn start(sup: &mut Supervisor, config: VmConfig) -> Result<u32, StartError> {
    for _ in 0..5 {
        match sup.start(config.clone()) {
            Err(StartError::LaunchFailed { source, .. })
                if source.raw_os_error() == Some(ETXTBSY) =>
            {
                std::thread::sleep(Duration::from_millis(50));
            }
            other => return other.map(ProcessHandle::pid),
        }
    }
    sup.start(config).map(ProcessHandle::pid)
}

async fn wait_for_exit(sup: &mut Supervisor) -> Option<std::process::ExitStatus> {
    for _ in 0..100 {
        if let Some(status) = sup.poll_exit() {
            return Some(status);
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    None
}

// ---------------------------------------------------------------------------
// Start
// ---------------------------------------------------------------------------

#[tokio::test]
async fn start_with_installed_system_runs() {
    let fx = Fixture::new();
    fx.emulator(Architecture::X86_64, LONG_RUNNING);
    let mut sup = fx.supervisor();

    let pid = start(&mut sup, fx.config()).expect("start should succeed");

    assert!(pid > 0);
    assert_eq!(sup.state(), SupervisorState::Running);
    assert!(sup.is_running());
    let handle = sup.handle().expect("handle stored");
    assert_eq!(handle.pid(), pid);
    assert_eq!(handle.config().cpu_count, 4);
    assert_eq!(handle.binary(), fx.path().join("qemu-system-x86_64"));

    sup.terminate(true).unwrap();
}

#[tokio::test]
async fn missing_binary_keeps_idle() {
    let fx = Fixture::new();
    let mut sup = fx.supervisor();

    let err = sup.start(fx.config()).unwrap_err();

    assert!(matches!(err, StartError::BinaryNotFound(ref p) if p.ends_with("qemu-system-x86_64")));
    assert_eq!(sup.state(), SupervisorState::Idle);
    assert!(!sup.is_running());
}

#[tokio::test]
async fn binary_is_looked_up_per_architecture() {
    let fx = Fixture::new();
    fx.emulator(Architecture::X86_64, LONG_RUNNING);
    let mut sup = fx.supervisor();

    let mut config = fx.config();
    config.architecture = Architecture::I386;

    assert!(matches!(
        sup.start(config).unwrap_err(),
        StartError::BinaryNotFound(_)
    ));
}

#[tokio::test]
async fn missing_cdrom_is_rejected() {
    let fx = Fixture::new();
    fx.emulator(Architecture::X86_64, LONG_RUNNING);
    let mut sup = fx.supervisor();

    let mut config = fx.config();
    config.skip_cdrom = false;
    config.cdrom_image_path = Some(fx.path().join("missing.iso"));

    let err = sup.start(config).unwrap_err();
    assert!(matches!(err, StartError::CdromNotFound(ref p) if p.ends_with("missing.iso")));
    assert_eq!(sup.state(), SupervisorState::Idle);
}

#[tokio::test]
async fn unset_cdrom_is_rejected_when_not_installed() {
    let fx = Fixture::new();
    fx.emulator(Architecture::X86_64, LONG_RUNNING);
    let mut sup = fx.supervisor();

    let mut config = fx.config();
    config.skip_cdrom = false;
    config.cdrom_image_path = None;

    assert!(matches!(
        sup.start(config).unwrap_err(),
        StartError::CdromNotFound(_)
    ));
}

#[tokio::test]
async fn missing_cdrom_is_ignored_when_installed() {
    let fx = Fixture::new();
    fx.emulator(Architecture::X86_64, LONG_RUNNING);
    let mut sup = fx.supervisor();

    let mut config = fx.config();
    config.cdrom_image_path = Some(fx.path().join("missing.iso"));

    start(&mut sup, config).expect("cdrom is not needed for an installed system");
    sup.terminate(true).unwrap();
}

#[tokio::test]
async fn binary_check_wins_over_cdrom_check() {
    let fx = Fixture::new();
    let mut sup = fx.supervisor();

    let mut config = fx.config();
    config.skip_cdrom = false;
    config.cdrom_image_path = Some(fx.path().join("missing.iso"));

    assert!(matches!(
        sup.start(config).unwrap_err(),
        StartError::BinaryNotFound(_)
    ));
}

#[tokio::test]
async fn missing_disk_is_rejected() {
    let fx = Fixture::new();
    fx.emulator(Architecture::X86_64, LONG_RUNNING);
    let mut sup = fx.supervisor();

    let mut config = fx.config();
    config.disk_image_path = fx.path().join("nope.qcow2");

    assert!(matches!(
        sup.start(config).unwrap_err(),
        StartError::DiskNotFound(_)
    ));
    assert_eq!(sup.state(), SupervisorState::Idle);
}

#[tokio::test]
async fn second_start_is_rejected_and_first_process_survives() {
    let fx = Fixture::new();
    fx.emulator(Architecture::X86_64, LONG_RUNNING);
    let mut sup = fx.supervisor();

    let pid = start(&mut sup, fx.config()).unwrap();

    let err = sup.start(fx.config()).unwrap_err();
    assert!(matches!(err, StartError::AlreadyRunning { pid: p } if p == pid));

    assert!(sup.is_running());
    assert_eq!(sup.handle().map(ProcessHandle::pid), Some(pid));

    sup.terminate(true).unwrap();
}

#[tokio::test]
async fn non_executable_binary_reports_os_error() {
    let fx = Fixture::new();
    let binary = fx.emulator(Architecture::X86_64, LONG_RUNNING);
    std::fs::set_permissions(&binary, std::fs::Permissions::from_mode(0o644)).unwrap();
    let mut sup = fx.supervisor();

    let err = sup.start(fx.config()).unwrap_err();

    match err {
        StartError::LaunchFailed { ref source, .. } => {
            assert_eq!(source.kind(), std::io::ErrorKind::PermissionDenied);
            assert!(err.to_string().contains("failed to launch"));
        }
        other => panic!("expected LaunchFailed, got {other:?}"),
    }
    assert_eq!(sup.state(), SupervisorState::Idle);
}

#[tokio::test]
async fn emulator_receives_built_arguments() {
    let fx = Fixture::new();
    let args_file = fx.path().join("args.txt");
    fx.emulator(
        Architecture::X86_64,
        &format!("printf '%s\\n' \"$@\" > '{}'", args_file.display()),
    );
    let mut sup = fx.supervisor();
    let config = fx.config();
    let expected = qemu_manager::vm::build_args(&config);

    start(&mut sup, config).unwrap();
    let status = wait_for_exit(&mut sup).await.expect("script should exit");
    assert!(status.success());

    let recorded = std::fs::read_to_string(&args_file).unwrap();
    let recorded: Vec<&str> = recorded.lines().collect();
    assert_eq!(recorded, expected);
}

// ---------------------------------------------------------------------------
// Liveness
// ---------------------------------------------------------------------------

#[tokio::test]
async fn exit_on_its_own_returns_to_idle() {
    let fx = Fixture::new();
    fx.emulator(Architecture::X86_64, "exit 3");
    let mut sup = fx.supervisor();

    start(&mut sup, fx.config()).unwrap();
    let status = wait_for_exit(&mut sup).await.expect("script should exit");

    assert_eq!(status.code(), Some(3));
    assert_eq!(sup.state(), SupervisorState::Idle);
    assert!(!sup.is_running());
    assert!(sup.handle().is_none());
    assert!(matches!(sup.terminate(true), Err(TerminateError::NotRunning)));
}

#[tokio::test]
async fn can_start_again_after_exit() {
    let fx = Fixture::new();
    fx.emulator(Architecture::X86_64, "exit 0");
    let mut sup = fx.supervisor();

    start(&mut sup, fx.config()).unwrap();
    wait_for_exit(&mut sup).await.expect("script should exit");

    start(&mut sup, fx.config()).expect("restart after exit");
}

#[tokio::test]
async fn captured_stdout_can_be_read() {
    let fx = Fixture::new();
    fx.emulator(Architecture::X86_64, "echo booting; exec sleep 30");
    let mut sup = fx.supervisor();

    start(&mut sup, fx.config()).unwrap();
    let (stdout, stderr) = sup.take_output().expect("running process");
    assert!(stderr.is_some());

    let mut lines = BufReader::new(stdout.expect("stdout is piped")).lines();
    let first = tokio::time::timeout(Duration::from_secs(5), lines.next_line())
        .await
        .expect("output within timeout")
        .unwrap();
    assert_eq!(first.as_deref(), Some("booting"));

    // Streams are handed out once.
    let (stdout, stderr) = sup.take_output().unwrap();
    assert!(stdout.is_none() && stderr.is_none());

    sup.terminate(true).unwrap();
}

// ---------------------------------------------------------------------------
// Terminate
// ---------------------------------------------------------------------------

#[tokio::test]
async fn declined_terminate_changes_nothing() {
    let fx = Fixture::new();
    fx.emulator(Architecture::X86_64, LONG_RUNNING);
    let mut sup = fx.supervisor();
    let pid = start(&mut sup, fx.config()).unwrap();

    sup.terminate(false).unwrap();

    assert_eq!(sup.state(), SupervisorState::Running);
    assert!(sup.is_running());
    assert_eq!(sup.handle().map(ProcessHandle::pid), Some(pid));

    sup.terminate(true).unwrap();
}

#[tokio::test]
async fn confirmed_terminate_twice() {
    let fx = Fixture::new();
    fx.emulator(Architecture::X86_64, LONG_RUNNING);
    let mut sup = fx.supervisor();
    start(&mut sup, fx.config()).unwrap();

    sup.terminate(true).unwrap();
    assert_eq!(sup.state(), SupervisorState::Idle);
    assert!(!sup.is_running());

    assert!(matches!(sup.terminate(true), Err(TerminateError::NotRunning)));
}

// ---------------------------------------------------------------------------
// Shutdown hook
// ---------------------------------------------------------------------------

/// Whether `pid` is a live process. Zombies count as dead: the supervisor
/// drops the child after killing it and reaping is left to the runtime.
fn process_alive(pid: u32) -> bool {
    if Path::new("/proc/self/stat").exists() {
        let Ok(stat) = std::fs::read_to_string(format!("/proc/{pid}/stat")) else {
            return false;
        };
        // The state letter follows the parenthesised command name.
        let state = stat
            .rsplit_once(')')
            .and_then(|(_, rest)| rest.trim_start().chars().next());
        return !matches!(state, Some('Z' | 'X') | None);
    }
    std::process::Command::new("ps")
        .args(["-o", "stat=", "-p", &pid.to_string()])
        .output()
        .map(|out| {
            let stat = String::from_utf8_lossy(&out.stdout);
            out.status.success() && !stat.trim().is_empty() && !stat.trim_start().starts_with('Z')
        })
        .unwrap_or(false)
}

async fn wait_until_dead(pid: u32) -> bool {
    for _ in 0..100 {
        if !process_alive(pid) {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    false
}

#[tokio::test]
async fn shutdown_hook_kills_when_configured() {
    let fx = Fixture::new();
    fx.emulator(Architecture::X86_64, LONG_RUNNING);
    let mut sup = fx.supervisor();
    let pid = start(&mut sup, fx.config()).unwrap();
    assert!(process_alive(pid));

    sup.shutdown_hook();

    assert_eq!(sup.state(), SupervisorState::Idle);
    assert!(!sup.is_running());
    assert!(wait_until_dead(pid).await, "pid {pid} still alive after shutdown hook");
}

#[tokio::test]
async fn dropping_supervisor_kills_when_configured() {
    let fx = Fixture::new();
    fx.emulator(Architecture::X86_64, LONG_RUNNING);
    let mut sup = fx.supervisor();
    let pid = start(&mut sup, fx.config()).unwrap();
    assert!(process_alive(pid));

    drop(sup);

    assert!(wait_until_dead(pid).await, "pid {pid} still alive after drop");
}

#[tokio::test]
async fn shutdown_hook_leaves_vm_when_not_configured() {
    let fx = Fixture::new();
    fx.emulator(Architecture::X86_64, LONG_RUNNING);
    let mut sup = fx.supervisor();
    let mut config = fx.config();
    config.kill_on_exit = false;
    let pid = start(&mut sup, config).unwrap();

    sup.shutdown_hook();

    assert!(sup.is_running());
    assert!(process_alive(pid));

    sup.terminate(true).unwrap();
    assert!(wait_until_dead(pid).await);
}

#[tokio::test]
async fn shutdown_hook_runs_once() {
    let fx = Fixture::new();
    fx.emulator(Architecture::X86_64, LONG_RUNNING);
    let mut sup = fx.supervisor();
    let mut config = fx.config();
    config.kill_on_exit = false;
    start(&mut sup, config).unwrap();
    sup.shutdown_hook();

    // A later hook (here via drop) must not kill a VM left running on exit.
    let pid = sup.handle().map(ProcessHandle::pid).unwrap();
    drop(sup);
    assert!(process_alive(pid));

    // Clean up the orphan by hand.
    let _ = std::process::Command::new("kill")
        .args(["-9", &pid.to_string()])
        .status();
}
