//! VM management module for qemu-manager.
//!
//! Provides the QEMU command builder, the process supervisor that owns the
//! single emulator child process, and the filesystem helpers used around it
//! (image discovery and qcow2 disk creation).

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

pub mod command;
pub mod filesystem;
pub mod lifecycle;

// ---------------------------------------------------------------------------
// Shared types used across submodules
// ---------------------------------------------------------------------------

/// Guest architecture. Selects which `qemu-system-*` binary is launched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Deserialize, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Architecture {
    I386,
    #[default]
    X86_64,
}

impl Architecture {
    /// Emulator binary name without the platform executable suffix.
    pub fn binary_name(self) -> &'static str {
        match self {
            Architecture::I386 => "qemu-system-i386",
            Architecture::X86_64 => "qemu-system-x86_64",
        }
    }
}

impl fmt::Display for Architecture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Architecture::I386 => f.write_str("i386"),
            Architecture::X86_64 => f.write_str("x86_64"),
        }
    }
}

impl FromStr for Architecture {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "i386" | "qemu-system-i386" => Ok(Architecture::I386),
            "x86_64" | "x86-64" | "qemu-system-x86_64" => Ok(Architecture::X86_64),
            other => Err(format!("unknown architecture `{other}` (expected i386 or x86_64)")),
        }
    }
}

pub const DEFAULT_VM_NAME: &str = "VirtualMachine";
pub const DEFAULT_QMP_PORT: u16 = 4444;
pub const DEFAULT_MAC_ADDRESS: &str = "EA:04:6D:F8:B2:BD";

/// Everything needed to launch one emulator instance.
///
/// Handed to [`lifecycle::Supervisor::start`] by value; the supervisor keeps
/// it inside the [`lifecycle::ProcessHandle`] for the lifetime of the child.
/// Build a fresh one for every start attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VmConfig {
    pub architecture: Architecture,

    /// Number of virtual CPUs (all on one socket, one thread per core).
    pub cpu_count: u32,

    /// Guest memory in megabytes.
    pub memory_mb: u32,

    /// Primary hard disk image (qcow2). Must exist.
    pub disk_image_path: PathBuf,

    /// Installation medium. Only consulted when `skip_cdrom` is false.
    pub cdrom_image_path: Option<PathBuf>,

    /// The guest OS is already installed; no CD-ROM device is attached.
    pub skip_cdrom: bool,

    pub use_sdl_display: bool,

    /// Ask for HAXM with a TCG fallback instead of TCG alone.
    pub use_hardware_accel: bool,

    /// Supervisor policy: kill the emulator when the manager exits.
    pub kill_on_exit: bool,

    /// Value of `-name`.
    pub name: String,

    /// Local TCP port for the QMP listener.
    pub qmp_port: u16,

    /// MAC address of the emulated e1000 NIC.
    pub mac_address: String,
}

impl VmConfig {
    /// Config with the manager's defaults for everything but the disk.
    pub fn new(disk_image_path: impl Into<PathBuf>) -> Self {
        Self {
            architecture: Architecture::X86_64,
            cpu_count: 4,
            memory_mb: 4096,
            disk_image_path: disk_image_path.into(),
            cdrom_image_path: None,
            skip_cdrom: true,
            use_sdl_display: false,
            use_hardware_accel: true,
            kill_on_exit: true,
            name: DEFAULT_VM_NAME.to_string(),
            qmp_port: DEFAULT_QMP_PORT,
            mac_address: DEFAULT_MAC_ADDRESS.to_string(),
        }
    }
}

// ---------------------------------------------------------------------------
// Re-exports
// ---------------------------------------------------------------------------

pub use command::build_args;
pub use lifecycle::{ProcessHandle, StartError, Supervisor, SupervisorState, TerminateError};
