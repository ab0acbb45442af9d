//! Disk and installation-media helpers.
//!
//! Nothing here touches the supervisor. Image discovery prefills the console
//! form; disk creation runs `qemu-img` as a one-off process with its own
//! success or failure.
//!
//! ## External Requirements
//!
//! - `qemu-img`: expected next to the `qemu-system-*` binaries in the
//!   emulator directory.

use std::path::{Path, PathBuf};
use std::process::ExitStatus;

use tracing::{debug, info};
use walkdir::WalkDir;

/// Default file name used by `create-disk` when none is given.
pub const DEFAULT_DISK_FILE: &str = "system.qcow2";

#[derive(Debug, thiserror::Error)]
pub enum DiskImageError {
    #[error("disk size must be at least 1 GB")]
    InvalidSize,
    #[error("failed to run {}: {source}", .tool.display())]
    Spawn {
        tool: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("qemu-img failed ({status}): {stderr}")]
    Failed { status: ExitStatus, stderr: String },
}

// ---------------------------------------------------------------------------
// Image discovery
// ---------------------------------------------------------------------------

/// Walk `dir` recursively and return the first regular file whose extension
/// is `ext` (given without the leading dot, compared case-insensitively).
///
/// Entries are visited in file-name order so the result is stable.
pub fn find_first_with_extension(dir: &Path, ext: &str) -> Option<PathBuf> {
    let ext = ext.trim_start_matches('.');
    WalkDir::new(dir)
        .sort_by_file_name()
        .into_iter()
        .filter_map(|res| res.ok())
        .filter(|entry| entry.file_type().is_file())
        .map(|entry| entry.into_path())
        .find(|path| {
            path.extension()
                .is_some_and(|e| e.to_string_lossy().eq_ignore_ascii_case(ext))
        })
}

// ---------------------------------------------------------------------------
// Virtual disk creation
// ---------------------------------------------------------------------------

/// Path of the `qemu-img` tool inside `emulator_dir`.
pub fn image_tool_path(emulator_dir: &Path) -> PathBuf {
    emulator_dir.join(format!("qemu-img{}", std::env::consts::EXE_SUFFIX))
}

/// Arguments for `qemu-img` to create a `size_gb` gigabyte qcow2 at `target`.
pub fn create_image_args(target: &Path, size_gb: u32) -> Vec<String> {
    vec![
        "create".to_string(),
        "-f".to_string(),
        "qcow2".to_string(),
        target.display().to_string(),
        format!("{size_gb}G"),
    ]
}

/// Create a sparse qcow2 disk image of `size_gb` gigabytes at `target`.
///
/// Waits for `qemu-img` to finish; the image is usable once this returns
/// `Ok`. Parent directories are created as needed.
pub async fn create_disk_image(
    tool: &Path,
    target: &Path,
    size_gb: u32,
) -> Result<(), DiskImageError> {
    if size_gb == 0 {
        return Err(DiskImageError::InvalidSize);
    }

    if let Some(parent) = target.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|source| DiskImageError::Spawn {
                tool: tool.to_path_buf(),
                source,
            })?;
    }

    let args = create_image_args(target, size_gb);
    debug!(tool = %tool.display(), ?args, "running qemu-img");

    let output = tokio::process::Command::new(tool)
        .args(&args)
        .stdin(std::process::Stdio::null())
        .output()
        .await
        .map_err(|source| DiskImageError::Spawn {
            tool: tool.to_path_buf(),
            source,
        })?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(DiskImageError::Failed {
            status: output.status,
            stderr: stderr.trim().to_string(),
        });
    }

    info!(path = %target.display(), size_gb, "disk image created");
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_image_args_format() {
        let args = create_image_args(Path::new("vm/system.qcow2"), 20);
        assert_eq!(args, ["create", "-f", "qcow2", "vm/system.qcow2", "20G"]);
    }

    #[test]
    fn finds_first_matching_file_recursively() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::create_dir(tmp.path().join("isos")).unwrap();
        std::fs::write(tmp.path().join("notes.txt"), b"").unwrap();
        std::fs::write(tmp.path().join("isos/b.iso"), b"").unwrap();
        std::fs::write(tmp.path().join("isos/a.ISO"), b"").unwrap();

        let found = find_first_with_extension(tmp.path(), ".iso").unwrap();
        assert_eq!(found, tmp.path().join("isos/a.ISO"));
    }

    #[test]
    fn no_match_returns_none() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join("disk.img"), b"").unwrap();
        assert!(find_first_with_extension(tmp.path(), "qcow2").is_none());
    }

    #[test]
    fn directories_named_like_images_are_skipped() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::create_dir(tmp.path().join("fake.qcow2")).unwrap();
        assert!(find_first_with_extension(tmp.path(), "qcow2").is_none());
    }

    #[tokio::test]
    async fn zero_size_is_rejected_before_spawning() {
        let err = create_disk_image(Path::new("/nonexistent/qemu-img"), Path::new("x.qcow2"), 0)
            .await
            .unwrap_err();
        assert!(matches!(err, DiskImageError::InvalidSize));
    }

    #[tokio::test]
    async fn missing_tool_reports_spawn_error() {
        let tmp = tempfile::tempdir().unwrap();
        let err = create_disk_image(
            &tmp.path().join("qemu-img"),
            &tmp.path().join("system.qcow2"),
            4,
        )
        .await
        .unwrap_err();
        assert!(matches!(err, DiskImageError::Spawn { .. }));
    }
}
