//! Seed a freshly attached volume from a remote tar archive.
//!
//! The run refuses to touch anything unless the volume is a fresh,
//! empty filesystem; it then streams the archive over HTTP through a
//! decompressor into `tar`, and for nested exports moves the payload out of
//! its `{deployInstanceId}/{externalId}/` wrapping onto the volume root.

pub mod compression;
pub mod config;
pub mod download;
pub mod error;
pub mod extract;
pub mod logging;
pub mod pipeline;
pub mod preflight;
pub mod progress;
pub mod reconcile;

pub use config::{Config, Layout, VolumeDescriptor};
pub use error::{UnpackError, UnpackResult};
pub use pipeline::{run, UnpackSummary};

pub fn is_privileged() -> bool {
    unsafe { libc::geteuid() == 0 }
}
