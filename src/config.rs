//! Manager settings.
//!
//! Settings live in `manager.toml` (see [`crate::paths::ManagerPaths`]) and
//! can be overridden on the command line. Every field has a default, so a
//! partial or missing file is fine.
//!
//! [`VmSettings`] is the editable form state. It is loosely typed on purpose
//! (paths may be unset, numbers may be zero) and [`VmSettings::to_config`]
//! turns it into a checked [`VmConfig`] for one start attempt.
//!
//! ```toml
//! emulator_dir = "qemu"
//!
//! [vm]
//! architecture = "x86_64"
//! cpus = 4
//! memory_mb = 4096
//! disk = "system.qcow2"
//! installed = true
//! ```

use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::vm::filesystem::find_first_with_extension;
use crate::vm::{Architecture, DEFAULT_MAC_ADDRESS, DEFAULT_QMP_PORT, DEFAULT_VM_NAME, VmConfig};

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum SettingsError {
    #[error("unknown setting `{0}`")]
    UnknownField(String),
    #[error("invalid value `{value}` for {field}: expected {expected}")]
    InvalidValue {
        field: &'static str,
        value: String,
        expected: &'static str,
    },
    #[error("a hard disk image path is required")]
    MissingDisk,
}

// ---------------------------------------------------------------------------
// Settings
// ---------------------------------------------------------------------------

/// Root of `manager.toml`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct Settings {
    /// Directory holding `qemu-system-*` and `qemu-img`.
    pub emulator_dir: PathBuf,
    pub vm: VmSettings,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            emulator_dir: PathBuf::from("qemu"),
            vm: VmSettings::default(),
        }
    }
}

impl Settings {
    /// Serialize to a TOML string.
    pub fn to_toml(&self) -> Result<String, toml::ser::Error> {
        toml::to_string_pretty(self)
    }

    /// Deserialize from a TOML string.
    pub fn from_toml(s: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(s)
    }

    /// Load settings from `path`, falling back to defaults if the file does
    /// not exist.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        if !path.exists() {
            debug!(path = %path.display(), "no settings file, using defaults");
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("read settings file {}", path.display()))?;
        let settings = Self::from_toml(&content)
            .with_context(|| format!("parse settings file {}", path.display()))?;
        info!(path = %path.display(), "settings loaded");
        Ok(settings)
    }

    /// Write settings to `path`, creating parent directories as needed.
    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("create config directory {}", parent.display()))?;
        }
        let content = self.to_toml().context("serialize settings")?;
        std::fs::write(path, content)
            .with_context(|| format!("write settings file {}", path.display()))?;
        info!(path = %path.display(), "settings saved");
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// VmSettings
// ---------------------------------------------------------------------------

/// Form state for the next VM start.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct VmSettings {
    pub architecture: Architecture,
    pub cpus: u32,
    pub memory_mb: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub disk: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cdrom: Option<PathBuf>,
    /// Guest OS already installed: boot from disk, no CD-ROM.
    pub installed: bool,
    pub sdl: bool,
    pub hardware_accel: bool,
    pub kill_on_exit: bool,
    pub name: String,
    pub qmp_port: u16,
    pub mac_address: String,
}

impl Default for VmSettings {
    fn default() -> Self {
        Self {
            architecture: Architecture::X86_64,
            cpus: 4,
            memory_mb: 4096,
            disk: None,
            cdrom: None,
            installed: true,
            sdl: false,
            hardware_accel: true,
            kill_on_exit: true,
            name: DEFAULT_VM_NAME.to_string(),
            qmp_port: DEFAULT_QMP_PORT,
            mac_address: DEFAULT_MAC_ADDRESS.to_string(),
        }
    }
}

/// Names accepted by [`VmSettings::set`], in display order.
pub const FIELDS: &[&str] = &[
    "arch",
    "cpus",
    "memory",
    "disk",
    "cdrom",
    "installed",
    "sdl",
    "accel",
    "kill-on-exit",
    "name",
    "qmp-port",
    "mac",
];

impl VmSettings {
    /// Fill unset disk / CD-ROM paths with the first `*.qcow2` / `*.iso`
    /// found under `dir`.
    pub fn prefill_images(&mut self, dir: &Path) {
        if self.disk.is_none() {
            self.disk = find_first_with_extension(dir, "qcow2");
            if let Some(disk) = &self.disk {
                debug!(path = %disk.display(), "prefilled disk image");
            }
        }
        if self.cdrom.is_none() {
            self.cdrom = find_first_with_extension(dir, "iso");
            if let Some(cdrom) = &self.cdrom {
                debug!(path = %cdrom.display(), "prefilled CD-ROM image");
            }
        }
    }

    /// Update one field from user input. An empty value clears a path.
    pub fn set(&mut self, field: &str, value: &str) -> Result<(), SettingsError> {
        let value = value.trim();
        match field {
            "arch" | "architecture" => {
                self.architecture = value.parse().map_err(|_| SettingsError::InvalidValue {
                    field: "arch",
                    value: value.to_string(),
                    expected: "i386 or x86_64",
                })?;
            }
            "cpus" => self.cpus = parse_positive("cpus", value)?,
            "memory" | "memory_mb" => self.memory_mb = parse_positive("memory", value)?,
            "disk" => self.disk = optional_path(value),
            "cdrom" => self.cdrom = optional_path(value),
            "installed" => self.installed = parse_bool("installed", value)?,
            "sdl" => self.sdl = parse_bool("sdl", value)?,
            "accel" | "hardware_accel" => self.hardware_accel = parse_bool("accel", value)?,
            "kill-on-exit" | "kill_on_exit" => self.kill_on_exit = parse_bool("kill-on-exit", value)?,
            "name" => {
                check_name(value)?;
                self.name = value.to_string();
            }
            "qmp-port" | "qmp_port" => {
                self.qmp_port = value
                    .parse()
                    .ok()
                    .filter(|p| *p != 0)
                    .ok_or_else(|| SettingsError::InvalidValue {
                        field: "qmp-port",
                        value: value.to_string(),
                        expected: "a TCP port between 1 and 65535",
                    })?;
            }
            "mac" | "mac_address" => {
                check_mac(value)?;
                self.mac_address = value.to_ascii_uppercase();
            }
            other => return Err(SettingsError::UnknownField(other.to_string())),
        }
        Ok(())
    }

    /// `(field, value)` pairs for display, in [`FIELDS`] order.
    pub fn describe(&self) -> Vec<(&'static str, String)> {
        let path = |p: &Option<PathBuf>| {
            p.as_ref()
                .map(|p| p.display().to_string())
                .unwrap_or_else(|| "<unset>".to_string())
        };
        vec![
            ("arch", self.architecture.to_string()),
            ("cpus", self.cpus.to_string()),
            ("memory", format!("{} MB", self.memory_mb)),
            ("disk", path(&self.disk)),
            ("cdrom", path(&self.cdrom)),
            ("installed", self.installed.to_string()),
            ("sdl", self.sdl.to_string()),
            ("accel", self.hardware_accel.to_string()),
            ("kill-on-exit", self.kill_on_exit.to_string()),
            ("name", self.name.clone()),
            ("qmp-port", self.qmp_port.to_string()),
            ("mac", self.mac_address.clone()),
        ]
    }

    /// Build the configuration for one start attempt.
    ///
    /// Checks only what the form itself can know: required disk path,
    /// positive counts, name and MAC address. Values read from the settings
    /// file never went through [`Self::set`], so they are checked again here.
    /// File existence is checked by the supervisor.
    pub fn to_config(&self) -> Result<VmConfig, SettingsError> {
        let disk = self.disk.clone().ok_or(SettingsError::MissingDisk)?;
        if self.cpus == 0 {
            return Err(SettingsError::InvalidValue {
                field: "cpus",
                value: "0".to_string(),
                expected: "a positive integer",
            });
        }
        if self.memory_mb == 0 {
            return Err(SettingsError::InvalidValue {
                field: "memory",
                value: "0".to_string(),
                expected: "a positive integer",
            });
        }
        check_name(&self.name)?;
        check_mac(&self.mac_address)?;

        Ok(VmConfig {
            architecture: self.architecture,
            cpu_count: self.cpus,
            memory_mb: self.memory_mb,
            disk_image_path: disk,
            cdrom_image_path: self.cdrom.clone(),
            skip_cdrom: self.installed,
            use_sdl_display: self.sdl,
            use_hardware_accel: self.hardware_accel,
            kill_on_exit: self.kill_on_exit,
            name: self.name.clone(),
            qmp_port: self.qmp_port,
            mac_address: self.mac_address.clone(),
        })
    }
}

fn parse_positive(field: &'static str, value: &str) -> Result<u32, SettingsError> {
    value
        .parse::<u32>()
        .ok()
        .filter(|n| *n > 0)
        .ok_or_else(|| SettingsError::InvalidValue {
            field,
            value: value.to_string(),
            expected: "a positive integer",
        })
}

pub(crate) fn parse_bool(field: &'static str, value: &str) -> Result<bool, SettingsError> {
    match value.to_ascii_lowercase().as_str() {
        "true" | "yes" | "y" | "on" | "1" => Ok(true),
        "false" | "no" | "n" | "off" | "0" => Ok(false),
        _ => Err(SettingsError::InvalidValue {
            field,
            value: value.to_string(),
            expected: "yes or no",
        }),
    }
}

fn optional_path(value: &str) -> Option<PathBuf> {
    (!value.is_empty()).then(|| PathBuf::from(value))
}

fn check_name(value: &str) -> Result<(), SettingsError> {
    if value.is_empty() || value.contains(',') {
        return Err(SettingsError::InvalidValue {
            field: "name",
            value: value.to_string(),
            expected: "a non-empty name without commas",
        });
    }
    Ok(())
}

fn check_mac(value: &str) -> Result<(), SettingsError> {
    if !is_mac_address(value) {
        return Err(SettingsError::InvalidValue {
            field: "mac",
            value: value.to_string(),
            expected: "six colon-separated hex octets",
        });
    }
    Ok(())
}

fn is_mac_address(value: &str) -> bool {
    let octets: Vec<&str> = value.split(':').collect();
    octets.len() == 6
        && octets
            .iter()
            .all(|o| o.len() == 2 && o.chars().all(|c| c.is_ascii_hexdigit()))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
