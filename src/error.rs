//! Crate-wide error type.
//!
//! One variant per error kind named in the archiver's error handling design:
//! configuration/validation failures are always `Layout`, transient and
//! fatal I/O flow through `Io`, and syscall failures that aren't plain I/O
//! (fcntl locking, mmap, scheduling) flow through `Nix`.

use thiserror::Error as ThisError;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, ThisError)]
pub enum Error {
    #[error("{0}")]
    Layout(String),

    #[error("{0}")]
    Mask(String),

    #[error("unable to lock archive for writing: already running?")]
    AlreadyRunning,

    #[error("sniffer capability unsupported: {0}")]
    SnifferUnsupported(&'static str),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Nix(#[from] nix::Error),
}
