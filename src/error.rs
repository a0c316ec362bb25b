//! Failure classes of an unpack run.
//!
//! Every variant is terminal: the binary logs it and exits with the code
//! returned by [`UnpackError::exit_code`]. Variants carry the path or URL
//! involved so the log line is enough to diagnose the failure.

use std::error::Error as StdError;
use std::io;
use std::path::PathBuf;

use thiserror::Error;

pub type UnpackResult<T> = Result<T, UnpackError>;

/// Boxed cause for failures assembled from `anyhow` chains or client errors.
pub type BoxError = Box<dyn StdError + Send + Sync + 'static>;

#[derive(Debug, Error)]
pub enum UnpackError {
    /// A required setting was absent or empty.
    #[error("{variable} not set, do you have a volume attached?")]
    ConfigurationMissing { variable: &'static str },

    /// The mount path could not be listed.
    #[error("failed to list volume directory {}", .path.display())]
    FilesystemUnreadable {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// `lost+found` is missing, so this is not a freshly formatted volume.
    #[error("lost+found directory not found in {}, is this a valid ext4 filesystem?", .path.display())]
    InvalidFilesystem { path: PathBuf },

    /// The volume already holds data and the override is not set.
    #[error("found {count} existing entries in {}, will only unpack into an empty volume", .path.display())]
    NonEmptyVolume { path: PathBuf, count: usize },

    #[error("failed to download {url}")]
    DownloadFailed {
        url: String,
        #[source]
        source: BoxError,
    },

    #[error("failed to decompress {url}")]
    DecompressionFailed {
        url: String,
        #[source]
        source: io::Error,
    },

    #[error("failed to extract archive to {}", .target.display())]
    ExtractionFailed {
        target: PathBuf,
        #[source]
        source: io::Error,
    },

    /// No deploy instance identifier could be derived from the archive URL.
    #[error("failed to derive deploy instance id from {url}: {reason}")]
    InvalidArchiveUrl { url: String, reason: String },

    #[error("failed to read staging directory {}", .path.display())]
    StagingUnreadable {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// The staged deploy directory does not hold exactly one `vol_` directory.
    #[error("unexpected directory contents in {}: [{}]", .path.display(), .contents.join(", "))]
    PayloadNotFound { path: PathBuf, contents: Vec<String> },

    #[error("failed to move {} to {}", .source_dir.display(), .destination.display())]
    MoveFailed {
        source_dir: PathBuf,
        destination: PathBuf,
        #[source]
        source: BoxError,
    },
}

impl UnpackError {
    /// Process exit status for this failure class.
    pub fn exit_code(&self) -> u8 {
        match self {
            Self::ConfigurationMissing { .. } => 1,
            Self::FilesystemUnreadable { .. } => 2,
            Self::InvalidFilesystem { .. } => 3,
            Self::NonEmptyVolume { .. } => 4,
            Self::DownloadFailed { .. } => 5,
            Self::DecompressionFailed { .. } => 6,
            Self::ExtractionFailed { .. } => 7,
            Self::InvalidArchiveUrl { .. } => 8,
            Self::StagingUnreadable { .. } => 9,
            Self::PayloadNotFound { .. } => 10,
            Self::MoveFailed { .. } => 11,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_codes_are_distinct() {
        let errors = [
            UnpackError::ConfigurationMissing { variable: "X" },
            UnpackError::FilesystemUnreadable {
                path: PathBuf::new(),
                source: io::Error::other("x"),
            },
            UnpackError::InvalidFilesystem { path: PathBuf::new() },
            UnpackError::NonEmptyVolume { path: PathBuf::new(), count: 1 },
            UnpackError::DownloadFailed {
                url: String::new(),
                source: "x".into(),
            },
            UnpackError::DecompressionFailed {
                url: String::new(),
                source: io::Error::other("x"),
            },
            UnpackError::ExtractionFailed {
                target: PathBuf::new(),
                source: io::Error::other("x"),
            },
            UnpackError::InvalidArchiveUrl {
                url: String::new(),
                reason: String::new(),
            },
            UnpackError::StagingUnreadable {
                path: PathBuf::new(),
                source: io::Error::other("x"),
            },
            UnpackError::PayloadNotFound {
                path: PathBuf::new(),
                contents: Vec::new(),
            },
            UnpackError::MoveFailed {
                source_dir: PathBuf::new(),
                destination: PathBuf::new(),
                source: "x".into(),
            },
        ];
        let mut codes: Vec<u8> = errors.iter().map(UnpackError::exit_code).collect();
        assert!(codes.iter().all(|&c| c != 0));
        codes.sort_unstable();
        codes.dedup();
        assert_eq!(codes.len(), errors.len());
    }

    #[test]
    fn test_alternate_format_includes_sources() {
        let err = anyhow::Error::new(UnpackError::MoveFailed {
            source_dir: PathBuf::from("/tmp/untar/id/vol_1"),
            destination: PathBuf::from("/mnt/vol"),
            source: anyhow::anyhow!("disk full")
                .context("failed to copy /tmp/untar/id/vol_1/db")
                .into(),
        });
        assert_eq!(
            format!("{err:#}"),
            "failed to move /tmp/untar/id/vol_1 to /mnt/vol: \
             failed to copy /tmp/untar/id/vol_1/db: disk full"
        );
    }
}
