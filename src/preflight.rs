//! Checks run against the mount path before anything is downloaded.

use std::fs;
use std::path::Path;

use tracing::info;

use crate::error::{UnpackError, UnpackResult};

/// Directory `mkfs.ext4` creates on every fresh filesystem.
pub const RECOVERY_DIR: &str = "lost+found";

/// Outcome of a passing preflight.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Preflight {
    /// Entries other than the recovery directory, in listing order.
    pub existing: Vec<String>,
}

/// Verify that `mount_path` is a freshly formatted, empty volume.
///
/// The recovery directory must always be present. Any other entry fails the
/// check unless `ignore_existing_files` is set.
pub fn check_volume(mount_path: &Path, ignore_existing_files: bool) -> UnpackResult<Preflight> {
    let entries = fs::read_dir(mount_path).map_err(|source| UnpackError::FilesystemUnreadable {
        path: mount_path.to_path_buf(),
        source,
    })?;

    let mut recovery_dir_found = false;
    let mut existing = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|source| UnpackError::FilesystemUnreadable {
            path: mount_path.to_path_buf(),
            source,
        })?;
        let name = entry.file_name().to_string_lossy().into_owned();
        let is_dir = entry.file_type().is_ok_and(|t| t.is_dir());
        if name == RECOVERY_DIR && is_dir {
            recovery_dir_found = true;
            continue;
        }
        info!(name = %name, "found existing file in volume");
        existing.push(name);
    }

    if !recovery_dir_found {
        return Err(UnpackError::InvalidFilesystem {
            path: mount_path.to_path_buf(),
        });
    }

    if !existing.is_empty() {
        if !ignore_existing_files {
            return Err(UnpackError::NonEmptyVolume {
                path: mount_path.to_path_buf(),
                count: existing.len(),
            });
        }
        info!(
            count = existing.len(),
            "unpacking over existing files (IGNORE_EXISTING_FILES=yes)"
        );
    }

    Ok(Preflight { existing })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn fresh_volume() -> TempDir {
        let dir = TempDir::new().unwrap();
        fs::create_dir(dir.path().join(RECOVERY_DIR)).unwrap();
        dir
    }

    #[test]
    fn test_recovery_dir_only_passes() {
        let vol = fresh_volume();
        let result = check_volume(vol.path(), false).unwrap();
        assert!(result.existing.is_empty());
    }

    #[test]
    fn test_missing_recovery_dir_fails_even_with_override() {
        let vol = TempDir::new().unwrap();
        for ignore in [false, true] {
            let err = check_volume(vol.path(), ignore).unwrap_err();
            assert!(matches!(err, UnpackError::InvalidFilesystem { .. }));
            assert_eq!(err.exit_code(), 3);
        }
    }

    #[test]
    fn test_recovery_dir_as_file_is_invalid() {
        let vol = TempDir::new().unwrap();
        fs::write(vol.path().join(RECOVERY_DIR), "").unwrap();
        let err = check_volume(vol.path(), true).unwrap_err();
        assert!(matches!(err, UnpackError::InvalidFilesystem { .. }));
    }

    #[test]
    fn test_missing_recovery_dir_wins_over_non_empty() {
        let vol = TempDir::new().unwrap();
        fs::write(vol.path().join("data.db"), "x").unwrap();
        let err = check_volume(vol.path(), false).unwrap_err();
        assert!(matches!(err, UnpackError::InvalidFilesystem { .. }));
    }

    #[test]
    fn test_existing_files_fail_without_override() {
        let vol = fresh_volume();
        fs::write(vol.path().join("data.db"), "x").unwrap();
        fs::create_dir(vol.path().join(".hidden")).unwrap();
        let err = check_volume(vol.path(), false).unwrap_err();
        match err {
            UnpackError::NonEmptyVolume { count, .. } => assert_eq!(count, 2),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_existing_files_pass_with_override() {
        let vol = fresh_volume();
        fs::write(vol.path().join("data.db"), "x").unwrap();
        let result = check_volume(vol.path(), true).unwrap();
        assert_eq!(result.existing, vec!["data.db".to_string()]);
    }

    #[test]
    fn test_unreadable_mount_path() {
        let vol = TempDir::new().unwrap();
        let err = check_volume(&vol.path().join("missing"), false).unwrap_err();
        assert!(matches!(err, UnpackError::FilesystemUnreadable { .. }));
        assert_eq!(err.exit_code(), 2);
    }
}
