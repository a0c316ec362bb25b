//! Tar extraction and staging directory handling.

use std::fs;
use std::io::{self, Read};
use std::path::{Component, Path, PathBuf};

use filetime::FileTime;
use tracing::{debug, warn};

use crate::is_privileged;

/// Unpack a tar stream into `dest`, entry by entry.
///
/// Permissions and xattrs are always restored; ownership only when running as
/// root, since `chown` fails for anyone else. Entries whose paths would land
/// outside `dest` are skipped. Returns the number of entries written.
///
/// Directory entries are applied after everything else, deepest first, so a
/// read-only directory does not block its own children and its mtime is not
/// bumped by them afterwards.
pub fn unpack_tar<R: Read>(reader: R, dest: &Path) -> io::Result<u64> {
    let mut archive = tar::Archive::new(reader);
    archive.set_preserve_permissions(true);
    archive.set_preserve_ownerships(is_privileged());
    archive.set_unpack_xattrs(true);
    archive.set_overwrite(true);

    let mut unpacked = 0;
    let mut directories = Vec::new();
    for entry in archive.entries()? {
        let mut entry = entry?;
        if entry.header().entry_type() == tar::EntryType::Directory {
            directories.push(entry);
            continue;
        }
        let path = entry.path()?.into_owned();
        if entry.unpack_in(dest)? {
            debug!(path = %path.display(), "unpacked");
            unpacked += 1;
        } else {
            warn!(path = %path.display(), "skipped archive entry outside the target directory");
        }
    }

    directories.sort_by(|a, b| b.path_bytes().cmp(&a.path_bytes()));
    for mut dir in directories {
        let path = dir.path()?.into_owned();
        if !dir.unpack_in(dest)? {
            warn!(path = %path.display(), "skipped archive entry outside the target directory");
            continue;
        }
        // tar leaves directory mtimes at creation time.
        if let Ok(mtime) = dir.header().mtime() {
            let target = within(dest, &path);
            let mtime = FileTime::from_unix_time(mtime as i64, 0);
            filetime::set_file_mtime(&target, mtime).map_err(|err| {
                io::Error::new(
                    err.kind(),
                    format!("failed to set mtime for {}: {err}", target.display()),
                )
            })?;
        }
        debug!(path = %path.display(), "unpacked");
        unpacked += 1;
    }
    Ok(unpacked)
}

/// Where `unpack_in` puts an archive path: root and `.` components dropped.
fn within(dest: &Path, path: &Path) -> PathBuf {
    let mut target = dest.to_path_buf();
    for component in path.components() {
        if let Component::Normal(part) = component {
            target.push(part);
        }
    }
    target
}

/// Create `staging_dir` and clear any `{deploy_id}` tree a previous failed run
/// left behind.
pub fn prepare_staging(staging_dir: &Path, deploy_id: &str) -> io::Result<()> {
    fs::create_dir_all(staging_dir)?;
    let leftover = staging_dir.join(deploy_id);
    if fs::symlink_metadata(&leftover).is_ok() {
        warn!(path = %leftover.display(), "removing leftover staging directory");
        remove_tree(&leftover)?;
    }
    Ok(())
}

/// Remove a file or directory tree, fixing directory permissions first.
pub fn remove_tree(path: &Path) -> io::Result<()> {
    let meta = fs::symlink_metadata(path)?;
    if meta.is_dir() {
        let _ = make_removable(path);
        fs::remove_dir_all(path)
    } else {
        fs::remove_file(path)
    }
}

/// Recursively restore directory permissions so `remove_dir_all` can succeed.
fn make_removable(path: &Path) -> io::Result<()> {
    let meta = fs::symlink_metadata(path)?;
    if meta.is_dir() {
        use std::os::unix::fs::PermissionsExt;
        let mode = meta.permissions().mode();
        if mode & 0o700 != 0o700 {
            fs::set_permissions(path, fs::Permissions::from_mode(mode | 0o700))?;
        }
        if let Ok(entries) = fs::read_dir(path) {
            for entry in entries.flatten() {
                let _ = make_removable(&entry.path());
            }
        }
    }
    Ok(())
}
