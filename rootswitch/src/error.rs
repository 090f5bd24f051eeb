// ABOUTME: Error taxonomy for the root transition engine.
// ABOUTME: Distinguishes fatal boot failures from the recoverable ones callers log and skip.

use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// The `containers` directory of a store could not be listed.
    #[error("cannot list containers in {path}: {source}")]
    Scan {
        path: PathBuf,
        source: std::io::Error,
    },

    /// A container's metadata file is missing or malformed.
    #[error("cannot decode container metadata {path}: {reason}")]
    Decode { path: PathBuf, reason: String },

    /// Host application lookup did not produce exactly one container.
    #[error("expected exactly one host application for {target}, found {found}")]
    AmbiguousHostApp { target: String, found: usize },

    /// The layer store could not produce a writable mount for a container.
    #[error("cannot mount container {id}: {reason}")]
    MountProvider { id: String, reason: String },

    #[error("host extension {name} uses unsupported storage driver {driver}")]
    UnsupportedDriver { name: String, driver: String },

    #[error("cannot mount host extension overlay on {target}: {source}")]
    Overlay {
        target: PathBuf,
        source: rustix::io::Errno,
    },

    #[error("cannot move mount {mount_point} into new root: {source}")]
    MountMigration {
        mount_point: PathBuf,
        source: rustix::io::Errno,
    },

    #[error("cannot remount {target}: {source}")]
    Remount {
        target: PathBuf,
        source: rustix::io::Errno,
    },

    #[error("cannot prepare scratch mount {target}: {reason}")]
    Scratch { target: PathBuf, reason: String },

    #[error("cannot create pivot target {path}: {source}")]
    PivotTarget {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("data partition unavailable: {reason}")]
    DataPartition { reason: String },

    #[error("pivot_root into {new_root} failed: {source}")]
    Pivot {
        new_root: PathBuf,
        source: rustix::io::Errno,
    },

    #[error("cannot hand off to {program}: {reason}")]
    Handoff { program: PathBuf, reason: String },

    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
}

pub type Result<T> = std::result::Result<T, Error>;
