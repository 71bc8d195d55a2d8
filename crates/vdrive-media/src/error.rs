use thiserror::Error;
use vdrive_storage::DiskError;

use crate::config::ConfigError;

pub type Result<T> = std::result::Result<T, MediaError>;

/// Status reported to the storage controller by the media driver.
///
/// Caller-contract violations (`IdConflict`, `InvalidState`, `InvalidHandle`,
/// `BufferSizeMismatch`) are reported synchronously and never retried. Storage failures
/// arrive as [`MediaError::Storage`] carrying the backend's error untouched, so the layer
/// above can decide on a policy (pause on a full disk, report an unreachable target).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MediaError {
    #[error("request id {0:#x} is already registered")]
    IdConflict(u64),

    #[error("request id {0:#x} not found")]
    IdNotFound(u64),

    #[error("request id {0:#x} already completed")]
    AlreadyCompleted(u64),

    #[error("invalid request state: {0}")]
    InvalidState(&'static str),

    #[error("stale or unknown request handle")]
    InvalidHandle,

    #[error("request canceled")]
    Canceled,

    #[error("out of memory allocating {0} bytes")]
    OutOfMemory(usize),

    #[error("buffer of {allocated} bytes released with size {freed}")]
    BufferSizeMismatch { allocated: usize, freed: usize },

    #[error("medium not mounted")]
    NotMounted,

    #[error("medium is locked")]
    MediaLocked,

    #[error("medium is read-only")]
    ReadOnly,

    #[error("data encryption key is missing")]
    DekMissing,

    #[error("encryption key {0:?} not found")]
    KeyNotFound(String),

    #[error("encryption key {0:?} is still retained")]
    KeyBusy(String),

    /// The controller failed to copy data into or out of its own buffers.
    #[error("controller buffer copy failed: {0}")]
    Port(String),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Storage(#[from] DiskError),
}

impl MediaError {
    pub fn is_canceled(&self) -> bool {
        matches!(self, MediaError::Canceled)
    }
}
