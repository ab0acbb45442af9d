//! Application directory structure for qemu-manager.
//!
//! - Config: `~/.config/qemu-manager/` (human-editable, XDG-style)
//! - Logs:   `~/Library/Logs/qemu-manager/` on macOS,
//!           `$XDG_DATA_HOME/qemu-manager/logs/` elsewhere

use std::path::{Path, PathBuf};
use tracing::info;

const APP_NAME: &str = "qemu-manager";

/// Name of the settings file inside the config directory.
pub const SETTINGS_FILE: &str = "manager.toml";

/// All resolved application directory paths.
#[derive(Debug, Clone)]
pub struct ManagerPaths {
    /// Human-editable config: `~/.config/qemu-manager/`
    pub config: PathBuf,
    /// Application logs
    pub logs: PathBuf,
}

impl ManagerPaths {
    /// Resolve all paths from the user's home directory.
    /// Does not create any directories; call `ensure()` for that.
    pub fn resolve() -> Option<Self> {
        let home = std::env::var("HOME").ok().map(PathBuf::from)?;

        Some(Self {
            config: resolve_config_dir(&home),
            logs: resolve_log_dir(&home),
        })
    }

    /// Default location of the settings file.
    pub fn settings_file(&self) -> PathBuf {
        self.config.join(SETTINGS_FILE)
    }

    /// Create all directories that don't already exist.
    pub fn ensure(&self) -> std::io::Result<()> {
        for dir in [&self.config, &self.logs] {
            std::fs::create_dir_all(dir)?;
            info!("ensured directory: {}", dir.display());
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Platform-specific path resolution
// ---------------------------------------------------------------------------

fn resolve_config_dir(home: &Path) -> PathBuf {
    if let Ok(xdg) = std::env::var("XDG_CONFIG_HOME") {
        PathBuf::from(xdg).join(APP_NAME)
    } else {
        home.join(".config").join(APP_NAME)
    }
}

#[cfg(target_os = "macos")]
fn resolve_log_dir(home: &Path) -> PathBuf {
    home.join("Library").join("Logs").join(APP_NAME)
}

#[cfg(not(target_os = "macos"))]
fn resolve_log_dir(home: &Path) -> PathBuf {
    let data = match std::env::var("XDG_DATA_HOME") {
        Ok(xdg) => PathBuf::from(xdg),
        Err(_) => home.join(".local").join("share"),
    };
    data.join(APP_NAME).join("logs")
}
