//! Error kinds surfaced at the crate boundary.
//!
//! Mirrors the error conditions enumerated for the ioctl-facing operation
//! set: most are surfaced to the caller unchanged (the caller decides
//! whether to retry), a few are handled internally (`OutOfSpace` triggers
//! eviction and is retried before it would ever escape `Manager::bind`).

use std::io;

/// Errors produced by the public operation set in [`crate::manager::Manager`].
#[derive(Debug, thiserror::Error)]
pub enum GemError {
    #[error("no such handle")]
    NoSuchHandle,

    #[error("invalid argument")]
    Invalid,

    #[error("object too big for the aperture")]
    TooBig,

    #[error("out of memory")]
    NoMemory,

    #[error("device busy, retry later")]
    Busy,

    #[error("interrupted by signal")]
    Interrupted,

    #[error("gpu wedged, retry once recovered")]
    Again,

    #[error("i/o error")]
    IoError(#[from] io::Error),

    #[error("no free, non-pinned fence register")]
    DeadLock,
}

/// Internal-only error from [`crate::range::GtRange`]. Never escapes
/// `Manager`: `bind` always converts a persistent `OutOfSpace` into
/// [`GemError::NoMemory`] after eviction has been retried, per the error
/// handling design.
#[derive(Debug, thiserror::Error, Clone, Copy, PartialEq, Eq)]
#[error("out of space in range allocator")]
pub struct OutOfSpace;
