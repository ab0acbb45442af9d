//! qemu-manager: a console front-end for QEMU.
//!
//! Builds a `qemu-system-*` invocation from a settings file, command-line
//! overrides and interactive `set` commands, and supervises the single
//! emulator process it launches.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Args as ClapArgs, Parser, Subcommand};
use tracing::{debug, warn};

use qemu_manager::config::{Settings, VmSettings};
use qemu_manager::logging;
use qemu_manager::paths::{ManagerPaths, SETTINGS_FILE};
use qemu_manager::state_machine::Session;
use qemu_manager::vm::command::{build_args, render};
use qemu_manager::vm::filesystem::{DEFAULT_DISK_FILE, create_disk_image, image_tool_path};
use qemu_manager::vm::{Architecture, Supervisor};

/// QEMU Manager
#[derive(Parser, Debug)]
#[command(name = "qemu-manager", version, about = "Console front-end for QEMU")]
struct Args {
    /// Settings file (default: ~/.config/qemu-manager/manager.toml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Directory containing qemu-system-* and qemu-img
    #[arg(long, global = true)]
    emulator_dir: Option<PathBuf>,

    #[command(flatten)]
    form: FormArgs,

    #[command(subcommand)]
    command: Option<Cmd>,
}

#[derive(Subcommand, Debug)]
enum Cmd {
    /// Interactive console (default)
    Console,
    /// Print the QEMU command line that `start` would run
    PrintCommand,
    /// Create a qcow2 disk image
    CreateDisk {
        /// Size in gigabytes
        size_gb: u32,
        /// Output file
        #[arg(short, long, default_value = DEFAULT_DISK_FILE)]
        output: PathBuf,
    },
}

/// Overrides for the `[vm]` section of the settings file.
#[derive(ClapArgs, Debug)]
struct FormArgs {
    /// Guest architecture (i386 or x86_64)
    #[arg(long, global = true)]
    arch: Option<Architecture>,

    /// Number of CPUs
    #[arg(long, global = true, value_parser = clap::value_parser!(u32).range(1..))]
    cpus: Option<u32>,

    /// Memory in MB
    #[arg(long, global = true, value_parser = clap::value_parser!(u32).range(1..))]
    memory: Option<u32>,

    /// Hard disk image (qcow2)
    #[arg(long, global = true)]
    disk: Option<PathBuf>,

    /// Installation CD-ROM image (ISO); implies the system is not installed yet
    #[arg(long, global = true)]
    cdrom: Option<PathBuf>,

    /// The guest system is already installed (no CD-ROM)
    #[arg(long, global = true, conflicts_with = "cdrom")]
    installed: bool,

    /// Use SDL as the display backend
    #[arg(long, global = true)]
    sdl: bool,

    /// Disable HAXM hardware acceleration (TCG only)
    #[arg(long, global = true)]
    no_accel: bool,

    /// Leave the VM running when the manager exits
    #[arg(long, global = true)]
    keep_running: bool,
}

impl FormArgs {
    fn apply(&self, vm: &mut VmSettings) {
        if let Some(arch) = self.arch {
            vm.architecture = arch;
        }
        if let Some(cpus) = self.cpus {
            vm.cpus = cpus;
        }
        if let Some(memory) = self.memory {
            vm.memory_mb = memory;
        }
        if let Some(disk) = &self.disk {
            vm.disk = Some(disk.clone());
        }
        if let Some(cdrom) = &self.cdrom {
            vm.cdrom = Some(cdrom.clone());
            vm.installed = false;
        }
        if self.installed {
            vm.installed = true;
        }
        if self.sdl {
            vm.sdl = true;
        }
        if self.no_accel {
            vm.hardware_accel = false;
        }
        if self.keep_running {
            vm.kill_on_exit = false;
        }
    }
}

fn main() -> Result<()> {
    let args = Args::parse();

    let paths = ManagerPaths::resolve();
    if let Some(paths) = &paths {
        if let Err(e) = paths.ensure() {
            eprintln!("warning: could not create application directories: {e}");
        }
    }
    let _log_guard = logging::init(paths.as_ref().map(|p| p.logs.as_path()));

    let settings_path = args
        .config
        .clone()
        .or_else(|| paths.as_ref().map(ManagerPaths::settings_file))
        .unwrap_or_else(|| PathBuf::from(SETTINGS_FILE));

    let mut settings = Settings::load(&settings_path)?;
    if let Some(dir) = &args.emulator_dir {
        settings.emulator_dir = dir.clone();
    }
    args.form.apply(&mut settings.vm);

    match std::env::current_dir() {
        Ok(cwd) => settings.vm.prefill_images(&cwd),
        Err(e) => warn!(error = %e, "cannot read working directory; no image prefill"),
    }
    debug!(?settings, "effective settings");

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("Failed to create Tokio runtime")?;

    match args.command.unwrap_or(Cmd::Console) {
        Cmd::Console => {
            let session = Session::new(settings, settings_path);
            runtime.block_on(qemu_manager::console::run(session))?;
        }
        Cmd::PrintCommand => {
            let config = settings.vm.to_config()?;
            let supervisor = Supervisor::new(settings.emulator_dir.clone());
            let binary = supervisor.emulator_binary(config.architecture);
            println!("{}", render(&binary.display().to_string(), &build_args(&config)));
        }
        Cmd::CreateDisk { size_gb, output } => {
            let tool = image_tool_path(&settings.emulator_dir);
            runtime
                .block_on(create_disk_image(&tool, &output, size_gb))
                .with_context(|| format!("create disk image {}", output.display()))?;
            println!("Created {size_gb} GB disk image {}", output.display());
        }
    }

    // Let the runtime reap anything it still tracks.
    runtime.shutdown_timeout(std::time::Duration::from_secs(1));

    Ok(())
}
