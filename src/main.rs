use std::process::ExitCode;

use clap::Parser;
use tracing::{error, info};

use volume_unpack::config::{Cli, Config};
use volume_unpack::error::UnpackError;
use volume_unpack::{logging, pipeline};

fn main() -> ExitCode {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) => {
            let _ = err.print();
            return if err.use_stderr() {
                ExitCode::from(1)
            } else {
                ExitCode::SUCCESS
            };
        }
    };

    if let Err(err) = logging::init(cli.log_format) {
        eprintln!("{err:#}");
        return ExitCode::from(1);
    }

    let config = match Config::from_cli(cli) {
        Ok(config) => config,
        Err(err) => return fail(err),
    };

    match pipeline::run(&config) {
        Ok(summary) => {
            info!(
                volume_id = %config.volume.id,
                volume_name = %config.volume.name,
                volume_mount_path = %config.volume.mount_path.display(),
                bytes_processed = summary.bytes_processed,
                entries_unpacked = summary.entries_unpacked,
                entries_moved = summary.entries_moved,
                "successfully unpacked volume data"
            );
            ExitCode::SUCCESS
        }
        Err(err) => fail(err),
    }
}

fn fail(err: UnpackError) -> ExitCode {
    let code = err.exit_code();
    let non_empty = matches!(err, UnpackError::NonEmptyVolume { .. });
    let err = anyhow::Error::new(err);
    error!(error = %format!("{err:#}"), exit_code = code, "{err}");
    if non_empty {
        error!("to force unpack, set IGNORE_EXISTING_FILES=yes as an environment variable");
    }
    ExitCode::from(code)
}
