//! The unpack run: preflight, download, decompress, extract, reconcile.
//!
//! Stages run strictly in order on the calling thread; each one either hands
//! its stream to the next or ends the run with an [`UnpackError`]. The
//! preflight check is the only safety net, so it runs before any network or
//! filesystem change. Partial extractions are not rolled back.

use std::path::{Path, PathBuf};

use tracing::info;

use crate::compression;
use crate::config::{Config, Layout};
use crate::download;
use crate::error::{UnpackError, UnpackResult};
use crate::extract::{prepare_staging, unpack_tar};
use crate::preflight::check_volume;
use crate::progress::{MeteredReader, ProgressCounter, ProgressReporter};
use crate::reconcile::{deploy_instance_id, reconcile};

/// What a successful run did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnpackSummary {
    /// Decompressed bytes fed to the tar extractor.
    pub bytes_processed: u64,
    /// Archive entries written to disk.
    pub entries_unpacked: u64,
    /// Top-level payload entries moved to the volume root (nested layout only).
    pub entries_moved: usize,
}

pub fn run(config: &Config) -> UnpackResult<UnpackSummary> {
    let volume = &config.volume;
    check_volume(&volume.mount_path, config.ignore_existing_files)?;

    info!(
        volume_id = %volume.id,
        volume_name = %volume.name,
        volume_mount_path = %volume.mount_path.display(),
        layout = ?config.layout,
        "ready to unpack data to volume"
    );

    let (target, deploy_id) = match config.layout {
        Layout::Nested => {
            let deploy_id = deploy_instance_id(&config.tarball_url)?;
            prepare_staging(&config.staging_dir, &deploy_id).map_err(|source| {
                UnpackError::ExtractionFailed {
                    target: config.staging_dir.clone(),
                    source,
                }
            })?;
            (config.staging_dir.clone(), Some(deploy_id))
        }
        Layout::Flat => (volume.mount_path.clone(), None),
    };

    let (bytes_processed, entries_unpacked) = fetch_and_extract(config, &target)?;

    let entries_moved = match deploy_id {
        Some(deploy_id) => reconcile(&config.staging_dir, &deploy_id, &volume.mount_path)?,
        None => 0,
    };

    Ok(UnpackSummary {
        bytes_processed,
        entries_unpacked,
        entries_moved,
    })
}

/// Stream the archive from the network straight into `target`.
fn fetch_and_extract(config: &Config, target: &Path) -> UnpackResult<(u64, u64)> {
    let url = config.tarball_url.as_str();
    let body = download::open(url)?;

    let (compression, decoded) = compression::decompress(body).map_err(|source| {
        UnpackError::DecompressionFailed {
            url: url.to_string(),
            source,
        }
    })?;
    info!(%compression, target = %target.display(), "extracting archive");

    let counter = ProgressCounter::new();
    let metered = MeteredReader::new(decoded, counter.clone());
    let reporter = ProgressReporter::spawn(counter.clone(), config.progress_interval);

    let unpacked = unpack_tar(metered, target);
    reporter.stop();

    let entries = unpacked.map_err(|source| UnpackError::ExtractionFailed {
        target: PathBuf::from(target),
        source,
    })?;
    info!(bytes = counter.get(), entries, "archive extracted");
    Ok((counter.get(), entries))
}
