//! Run configuration.
//!
//! Every setting can be given as a flag or through the environment the
//! platform injects into the container (`RAILWAY_VOLUME_*`, `TARBALL_URL`).
//! [`Cli`] holds the raw values as parsed by clap; [`Config::from_cli`]
//! validates them once into the [`Config`] that is handed to the pipeline.

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

use crate::error::{UnpackError, UnpackResult};

/// Default staging directory for the nested layout.
pub const DEFAULT_STAGING_DIR: &str = "/tmp/untar";

/// Default interval between progress log lines.
pub const DEFAULT_PROGRESS_INTERVAL: Duration = Duration::from_secs(5);

/// How the archive lays out its payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum Layout {
    /// Payload sits under `{deployInstanceId}/{externalId}/`; extract into the
    /// staging directory and move the payload to the volume root.
    #[default]
    Nested,
    /// Payload sits at the archive root; extract straight onto the volume.
    Flat,
}

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum LogFormat {
    #[default]
    Json,
    Pretty,
}

#[derive(Parser, Debug)]
#[command(
    name = "volume-unpack",
    about = "Download a tar archive and unpack it onto a freshly attached volume"
)]
pub struct Cli {
    /// Identifier of the attached volume
    #[arg(long, env = "RAILWAY_VOLUME_ID")]
    pub volume_id: Option<String>,

    /// Name of the attached volume
    #[arg(long, env = "RAILWAY_VOLUME_NAME")]
    pub volume_name: Option<String>,

    /// Directory the volume is mounted on
    #[arg(long, env = "RAILWAY_VOLUME_MOUNT_PATH")]
    pub mount_path: Option<PathBuf>,

    /// HTTP(S) URL of the tar archive
    #[arg(long, env = "TARBALL_URL")]
    pub tarball_url: Option<String>,

    /// Set to "yes" to unpack into a volume that already holds files
    #[arg(long, env = "IGNORE_EXISTING_FILES")]
    pub ignore_existing_files: Option<String>,

    /// Archive layout
    #[arg(long, env = "TARBALL_LAYOUT", value_enum, default_value_t = Layout::Nested)]
    pub layout: Layout,

    /// Staging directory used by the nested layout
    #[arg(long, env = "UNPACK_STAGING_DIR", default_value = DEFAULT_STAGING_DIR)]
    pub staging_dir: PathBuf,

    /// Log output format
    #[arg(long, env = "LOG_FORMAT", value_enum, default_value_t = LogFormat::Json)]
    pub log_format: LogFormat,
}

/// The volume being provisioned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeDescriptor {
    pub id: String,
    pub name: String,
    pub mount_path: PathBuf,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub volume: VolumeDescriptor,
    pub tarball_url: String,
    pub ignore_existing_files: bool,
    pub layout: Layout,
    pub staging_dir: PathBuf,
    pub progress_interval: Duration,
}

impl Config {
    /// Validate raw command-line/environment values.
    ///
    /// Empty strings count as unset, so an exported-but-blank variable fails
    /// the same way as a missing one.
    pub fn from_cli(cli: Cli) -> UnpackResult<Self> {
        let tarball_url = required(cli.tarball_url, "TARBALL_URL")?;
        let id = required(cli.volume_id, "RAILWAY_VOLUME_ID")?;
        let name = required(cli.volume_name, "RAILWAY_VOLUME_NAME")?;
        let mount_path = cli
            .mount_path
            .filter(|p| !p.as_os_str().is_empty())
            .ok_or(UnpackError::ConfigurationMissing {
                variable: "RAILWAY_VOLUME_MOUNT_PATH",
            })?;

        Ok(Self {
            volume: VolumeDescriptor {
                id,
                name,
                mount_path,
            },
            tarball_url,
            ignore_existing_files: is_yes(cli.ignore_existing_files.as_deref()),
            layout: cli.layout,
            staging_dir: cli.staging_dir,
            progress_interval: DEFAULT_PROGRESS_INTERVAL,
        })
    }
}

fn required(value: Option<String>, variable: &'static str) -> UnpackResult<String> {
    value
        .filter(|v| !v.is_empty())
        .ok_or(UnpackError::ConfigurationMissing { variable })
}

/// Case-insensitive match against "yes".
pub fn is_yes(value: Option<&str>) -> bool {
    value.is_some_and(|v| v.eq_ignore_ascii_case("yes"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn full_args() -> Vec<&'static str> {
        vec![
            "volume-unpack",
            "--volume-id",
            "vol-1",
            "--volume-name",
            "data",
            "--mount-path",
            "/mnt/data",
            "--tarball-url",
            "https://example.com/a.tgz",
        ]
    }

    #[test]
    fn test_from_cli_defaults() {
        let cli = Cli::try_parse_from(full_args()).unwrap();
        let config = Config::from_cli(cli).unwrap();
        assert_eq!(config.volume.id, "vol-1");
        assert_eq!(config.volume.name, "data");
        assert_eq!(config.volume.mount_path, PathBuf::from("/mnt/data"));
        assert_eq!(config.layout, Layout::Nested);
        assert_eq!(config.staging_dir, PathBuf::from(DEFAULT_STAGING_DIR));
        assert_eq!(config.progress_interval, DEFAULT_PROGRESS_INTERVAL);
        assert!(!config.ignore_existing_files);
    }

    #[test]
    fn test_from_cli_flat_layout_and_override() {
        let mut args = full_args();
        args.extend(["--layout", "flat", "--ignore-existing-files", "YeS"]);
        let config = Config::from_cli(Cli::try_parse_from(args).unwrap()).unwrap();
        assert_eq!(config.layout, Layout::Flat);
        assert!(config.ignore_existing_files);
    }

    #[test]
    fn test_from_cli_missing_url() {
        let cli = Cli {
            volume_id: Some("vol-1".into()),
            volume_name: Some("data".into()),
            mount_path: Some(PathBuf::from("/mnt/data")),
            tarball_url: None,
            ignore_existing_files: None,
            layout: Layout::Nested,
            staging_dir: PathBuf::from(DEFAULT_STAGING_DIR),
            log_format: LogFormat::Json,
        };
        let err = Config::from_cli(cli).unwrap_err();
        assert!(matches!(
            err,
            UnpackError::ConfigurationMissing {
                variable: "TARBALL_URL"
            }
        ));
        assert_eq!(err.exit_code(), 1);
    }

    #[test]
    fn test_from_cli_empty_value_is_missing() {
        let cli = Cli {
            volume_id: Some(String::new()),
            volume_name: Some("data".into()),
            mount_path: Some(PathBuf::from("/mnt/data")),
            tarball_url: Some("https://example.com/a.tgz".into()),
            ignore_existing_files: None,
            layout: Layout::Nested,
            staging_dir: PathBuf::from(DEFAULT_STAGING_DIR),
            log_format: LogFormat::Json,
        };
        assert!(matches!(
            Config::from_cli(cli),
            Err(UnpackError::ConfigurationMissing {
                variable: "RAILWAY_VOLUME_ID"
            })
        ));
    }

    #[test]
    fn test_is_yes() {
        assert!(is_yes(Some("yes")));
        assert!(is_yes(Some("YES")));
        assert!(is_yes(Some("Yes")));
        assert!(!is_yes(Some("y")));
        assert!(!is_yes(Some("true")));
        assert!(!is_yes(Some("")));
        assert!(!is_yes(None));
    }
}
