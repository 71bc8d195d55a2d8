use thiserror::Error;

pub type Result<T> = std::result::Result<T, DiskError>;

/// Error type for vdrive storage backends and virtual disks.
///
/// The media driver passes these through to the storage controller untouched, so variants
/// are kept coarse enough for a controller to decide on a policy (pause the VM on a full
/// disk, report an unreachable network target, fail the request).
///
/// [`DiskError::Io`] stores a rendered message instead of `std::io::Error` so the error stays
/// `Clone` and can be delivered to more than one waiter.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DiskError {
    #[error("out of bounds: offset={offset} len={len} capacity={capacity}")]
    OutOfBounds {
        offset: u64,
        len: usize,
        capacity: u64,
    },

    #[error("integer overflow while computing byte offsets")]
    OffsetOverflow,

    #[error("invalid configuration: {0}")]
    InvalidConfig(&'static str),

    #[error("backend not supported: {0}")]
    NotSupported(String),

    /// The host ran out of space for the backing store.
    #[error("storage quota exceeded")]
    QuotaExceeded,

    /// The host file system refused to grow the backing file any further.
    #[error("backing file exceeds the host file size limit")]
    FileTooBig,

    /// A network-backed target could not be reached.
    #[error("backend unavailable")]
    BackendUnavailable,

    #[error("invalid backend state: {0}")]
    InvalidState(String),

    /// Generic I/O failure.
    ///
    /// This is a catch-all for errors that do not map to a more structured variant.
    #[error("io error: {0}")]
    Io(String),
}

impl DiskError {
    /// Whether a retry after operator intervention may succeed (disk full, file size limit,
    /// unreachable target).
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            DiskError::QuotaExceeded | DiskError::FileTooBig | DiskError::BackendUnavailable
        )
    }
}

impl From<std::io::Error> for DiskError {
    fn from(err: std::io::Error) -> Self {
        use std::io::ErrorKind;

        #[cfg(unix)]
        match err.raw_os_error() {
            Some(libc::ENOSPC) | Some(libc::EDQUOT) => return DiskError::QuotaExceeded,
            Some(libc::EFBIG) => return DiskError::FileTooBig,
            _ => {}
        }

        match err.kind() {
            ErrorKind::ConnectionRefused
            | ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted
            | ErrorKind::NotConnected
            | ErrorKind::TimedOut => DiskError::BackendUnavailable,
            ErrorKind::PermissionDenied => DiskError::NotSupported(err.to_string()),
            _ => DiskError::Io(err.to_string()),
        }
    }
}
