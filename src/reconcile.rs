//! Moving the payload out of the archive's `{deployInstanceId}/{externalId}/`
//! wrapping and onto the volume root.
//!
//! Staging usually lives on a different filesystem than the volume, so a
//! plain rename fails with `EXDEV`; those entries are copied with their
//! ownership, mode, timestamps and xattrs and then removed from staging.

use std::ffi::CString;
use std::fs;
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs as unix_fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::{debug, info, warn};

use crate::error::{UnpackError, UnpackResult};
use crate::extract::remove_tree;

/// Suffix stripped from the archive file name to get the deploy instance id.
pub const ARCHIVE_SUFFIX: &str = ".tgz";

/// Prefix of the directory holding the payload inside the deploy directory.
pub const PAYLOAD_PREFIX: &str = "vol_";

/// Derive the deploy instance id from the archive URL: the last path segment
/// with [`ARCHIVE_SUFFIX`] removed.
pub fn deploy_instance_id(tarball_url: &str) -> UnpackResult<String> {
    let invalid = |reason: String| UnpackError::InvalidArchiveUrl {
        url: tarball_url.to_string(),
        reason,
    };

    let parsed = url::Url::parse(tarball_url).map_err(|err| invalid(err.to_string()))?;
    let file_name = parsed
        .path_segments()
        .and_then(|segments| segments.filter(|s| !s.is_empty()).last())
        .ok_or_else(|| invalid("URL has no file name".into()))?;

    let id = file_name.strip_suffix(ARCHIVE_SUFFIX).unwrap_or(file_name);
    if id.is_empty() {
        return Err(invalid("empty file name".into()));
    }
    Ok(id.to_string())
}

/// Find the single `vol_*` directory directly under `deploy_dir`.
pub fn locate_payload(deploy_dir: &Path) -> UnpackResult<PathBuf> {
    let unreadable = |source: io::Error| UnpackError::StagingUnreadable {
        path: deploy_dir.to_path_buf(),
        source,
    };

    let mut contents = Vec::new();
    let mut candidates = Vec::new();
    for entry in fs::read_dir(deploy_dir).map_err(unreadable)? {
        let entry = entry.map_err(unreadable)?;
        let name = entry.file_name().to_string_lossy().into_owned();
        let is_dir = entry.file_type().is_ok_and(|t| t.is_dir());
        if is_dir && name.starts_with(PAYLOAD_PREFIX) {
            candidates.push(entry.path());
        }
        contents.push(name);
    }

    if candidates.len() != 1 {
        contents.sort();
        return Err(UnpackError::PayloadNotFound {
            path: deploy_dir.to_path_buf(),
            contents,
        });
    }
    Ok(candidates.remove(0))
}

/// Locate the payload of `deploy_id` under `staging_dir`, move it onto
/// `mount_path` and drop the emptied staging tree.
///
/// Returns the number of top-level entries moved.
pub fn reconcile(staging_dir: &Path, deploy_id: &str, mount_path: &Path) -> UnpackResult<usize> {
    let deploy_dir = staging_dir.join(deploy_id);
    let payload = locate_payload(&deploy_dir)?;
    info!(
        payload = %payload.display(),
        destination = %mount_path.display(),
        "moving payload to volume root"
    );

    let moved = move_contents(&payload, mount_path).map_err(|err| UnpackError::MoveFailed {
        source_dir: payload.clone(),
        destination: mount_path.to_path_buf(),
        source: err.into(),
    })?;

    if let Err(err) = remove_tree(&deploy_dir) {
        warn!(path = %deploy_dir.display(), error = %err, "failed to remove staging directory");
    }
    Ok(moved)
}

/// Move every entry of `src_dir`, hidden ones included, into `dst_dir`.
pub fn move_contents(src_dir: &Path, dst_dir: &Path) -> Result<usize> {
    let entries = fs::read_dir(src_dir)
        .with_context(|| format!("failed to read directory {}", src_dir.display()))?;

    let mut moved = 0;
    for entry in entries {
        let entry =
            entry.with_context(|| format!("failed to read entry in {}", src_dir.display()))?;
        let src_path = entry.path();
        let dst_path = dst_dir.join(entry.file_name());
        move_entry(&src_path, &dst_path)
            .with_context(|| format!("failed to move {}", src_path.display()))?;
        moved += 1;
    }
    Ok(moved)
}

/// Move one entry. Existing directories at the destination are merged into,
/// anything else already there is replaced.
fn move_entry(src: &Path, dst: &Path) -> Result<()> {
    if let Ok(dst_meta) = fs::symlink_metadata(dst) {
        let src_meta = fs::symlink_metadata(src)
            .with_context(|| format!("failed to stat {}", src.display()))?;
        if dst_meta.is_dir() && src_meta.is_dir() {
            debug!(path = %dst.display(), "merging into existing directory");
            move_contents(src, dst)?;
            fs::remove_dir(src)
                .with_context(|| format!("failed to remove {}", src.display()))?;
            return Ok(());
        }
        debug!(path = %dst.display(), "replacing existing entry");
        remove_tree(dst).with_context(|| format!("failed to remove {}", dst.display()))?;
    }

    match fs::rename(src, dst) {
        Ok(()) => Ok(()),
        Err(err) if err.raw_os_error() == Some(libc::EXDEV) => copy_then_remove(src, dst),
        Err(err) => Err(err).with_context(|| {
            format!("failed to rename {} to {}", src.display(), dst.display())
        }),
    }
}

/// Cross-device move: copy `src` with its metadata, then drop it from staging.
fn copy_then_remove(src: &Path, dst: &Path) -> Result<()> {
    debug!(path = %src.display(), "copying across filesystems");
    copy_entry(src, dst)?;
    remove_tree(src).with_context(|| format!("failed to remove {}", src.display()))
}

fn copy_tree(src_dir: &Path, dst_dir: &Path) -> Result<()> {
    let entries = fs::read_dir(src_dir)
        .with_context(|| format!("failed to read directory {}", src_dir.display()))?;

    for entry in entries {
        let entry =
            entry.with_context(|| format!("failed to read entry in {}", src_dir.display()))?;
        let src_path = entry.path();
        let dst_path = dst_dir.join(entry.file_name());

        copy_entry(&src_path, &dst_path)
            .with_context(|| format!("failed to copy {}", src_path.display()))?;
    }

    Ok(())
}

fn copy_entry(src: &Path, dst: &Path) -> Result<()> {
    let stat = lstat_entry(src)?;
    let mode = stat.st_mode & libc::S_IFMT;

    match mode {
        libc::S_IFDIR => {
            fs::create_dir(dst)
                .with_context(|| format!("failed to create directory {}", dst.display()))?;
            copy_tree(src, dst)?;
            // Mode and times last, so a read-only directory can still be filled.
            copy_xattrs(src, dst)?;
            copy_metadata_from_stat(dst, &stat)?;
        }
        libc::S_IFREG => {
            fs::copy(src, dst)
                .with_context(|| format!("failed to copy file {}", src.display()))?;
            copy_metadata_from_stat(dst, &stat)?;
            copy_xattrs(src, dst)?;
        }
        libc::S_IFLNK => {
            let target = fs::read_link(src)
                .with_context(|| format!("failed to read symlink {}", src.display()))?;
            unix_fs::symlink(&target, dst)
                .with_context(|| format!("failed to create symlink {}", dst.display()))?;
            copy_metadata_from_stat(dst, &stat)?;
        }
        libc::S_IFIFO => {
            let c_path = path_to_cstring(dst)?;
            let ret = unsafe { libc::mkfifo(c_path.as_ptr(), stat.st_mode & 0o7777) };
            if ret != 0 {
                return Err(io::Error::last_os_error())
                    .with_context(|| format!("mkfifo failed for {}", dst.display()));
            }
            copy_metadata_from_stat(dst, &stat)?;
        }
        _ => {
            warn!(
                path = %src.display(),
                mode = %format!("{mode:o}"),
                "skipping unsupported file type"
            );
        }
    }

    Ok(())
}

fn copy_metadata_from_stat(dst: &Path, stat: &libc::stat) -> Result<()> {
    let c_path = path_to_cstring(dst)?;

    let ret = unsafe { libc::lchown(c_path.as_ptr(), stat.st_uid, stat.st_gid) };
    if ret != 0 {
        let err = io::Error::last_os_error();
        // Unprivileged runs cannot hand files to other owners; keep ours.
        if err.raw_os_error() != Some(libc::EPERM) {
            return Err(err).with_context(|| format!("lchown failed for {}", dst.display()));
        }
    }

    // chmod doesn't apply to symlinks.
    let file_type = stat.st_mode & libc::S_IFMT;
    if file_type != libc::S_IFLNK {
        let ret = unsafe { libc::chmod(c_path.as_ptr(), stat.st_mode & 0o7777) };
        if ret != 0 {
            return Err(io::Error::last_os_error())
                .with_context(|| format!("chmod failed for {}", dst.display()));
        }
    }

    let times = [
        libc::timespec {
            tv_sec: stat.st_atime,
            tv_nsec: stat.st_atime_nsec,
        },
        libc::timespec {
            tv_sec: stat.st_mtime,
            tv_nsec: stat.st_mtime_nsec,
        },
    ];
    let ret = unsafe {
        libc::utimensat(
            libc::AT_FDCWD,
            c_path.as_ptr(),
            times.as_ptr(),
            libc::AT_SYMLINK_NOFOLLOW,
        )
    };
    if ret != 0 {
        let err = io::Error::last_os_error();
        if err.raw_os_error() != Some(libc::ENOTSUP) {
            return Err(err).with_context(|| format!("utimensat failed for {}", dst.display()));
        }
    }

    Ok(())
}

fn copy_xattrs(src: &Path, dst: &Path) -> Result<()> {
    let c_src = path_to_cstring(src)?;
    let c_dst = path_to_cstring(dst)?;

    let size = unsafe { libc::llistxattr(c_src.as_ptr(), std::ptr::null_mut(), 0) };
    if size < 0 {
        let err = io::Error::last_os_error();
        if err.raw_os_error() == Some(libc::ENOTSUP) || err.raw_os_error() == Some(libc::ENODATA)
        {
            return Ok(());
        }
        return Err(err).with_context(|| format!("llistxattr failed for {}", src.display()));
    }
    if size == 0 {
        return Ok(());
    }

    let mut names_buf = vec![0u8; size as usize];
    let size = unsafe {
        libc::llistxattr(
            c_src.as_ptr(),
            names_buf.as_mut_ptr() as *mut libc::c_char,
            names_buf.len(),
        )
    };
    if size < 0 {
        return Err(io::Error::last_os_error())
            .with_context(|| format!("llistxattr failed for {}", src.display()));
    }

    for name_bytes in names_buf[..size as usize].split(|&b| b == 0) {
        if name_bytes.is_empty() || name_bytes.starts_with(b"security.selinux") {
            continue;
        }
        let c_name =
            CString::new(name_bytes).context("xattr name contains interior null byte")?;

        let val_size =
            unsafe { libc::lgetxattr(c_src.as_ptr(), c_name.as_ptr(), std::ptr::null_mut(), 0) };
        if val_size < 0 {
            let err = io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::ENODATA) {
                continue;
            }
            return Err(err).with_context(|| {
                format!(
                    "lgetxattr failed for {} attr {}",
                    src.display(),
                    c_name.to_string_lossy()
                )
            });
        }

        let mut val_buf = vec![0u8; val_size as usize];
        let val_size = unsafe {
            libc::lgetxattr(
                c_src.as_ptr(),
                c_name.as_ptr(),
                val_buf.as_mut_ptr() as *mut libc::c_void,
                val_buf.len(),
            )
        };
        if val_size < 0 {
            return Err(io::Error::last_os_error()).with_context(|| {
                format!(
                    "lgetxattr failed for {} attr {}",
                    src.display(),
                    c_name.to_string_lossy()
                )
            });
        }

        let ret = unsafe {
            libc::lsetxattr(
                c_dst.as_ptr(),
                c_name.as_ptr(),
                val_buf.as_ptr() as *const libc::c_void,
                val_size as usize,
                0,
            )
        };
        if ret != 0 {
            let err = io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::ENOTSUP) {
                return Ok(());
            }
            return Err(err).with_context(|| {
                format!(
                    "lsetxattr failed for {} attr {}",
                    dst.display(),
                    c_name.to_string_lossy()
                )
            });
        }
    }

    Ok(())
}

fn lstat_entry(path: &Path) -> Result<libc::stat> {
    let c_path = path_to_cstring(path)?;
    let mut stat: libc::stat = unsafe { std::mem::zeroed() };
    let ret = unsafe { libc::lstat(c_path.as_ptr(), &mut stat) };
    if ret != 0 {
        return Err(io::Error::last_os_error())
            .with_context(|| format!("lstat failed for {}", path.display()));
    }
    Ok(stat)
}

fn path_to_cstring(path: &Path) -> Result<CString> {
    CString::new(path.as_os_str().as_bytes())
        .with_context(|| format!("path contains null byte: {}", path.display()))
}
