use std::path::PathBuf;

use thiserror::Error;

/// Failure classes of the fuzzing core. Host-side I/O problems are
/// recoverable (the controller skips to the next iteration); guest-side
/// problems escalate to crash handling or snapshot restore.
#[derive(Debug, Error)]
pub enum FuzzError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A record read ran past end-of-file.
    #[error("malformed image {path:?}: short read at offset {offset}")]
    MalformedImage { path: PathBuf, offset: u64 },

    /// The metadata engine found no superblock to mutate.
    #[error("no superblock found in {0:?}")]
    NoSuperblock(PathBuf),

    #[error("image {path:?} too small for a {wanted} byte mutation")]
    ImageTooSmall { path: PathBuf, wanted: usize },

    /// Guest command or file copy timed out or the connection dropped.
    #[error("guest transport failure: {0}")]
    TransportTimeout(String),

    /// The liveness probe on the guest failed.
    #[error("guest unresponsive")]
    GuestUnresponsive,

    /// The guest refused the mount but stayed alive.
    #[error("mount of {0} failed")]
    MountFailed(String),

    #[error("cannot classify filesystem in {0:?}")]
    UnknownFilesystem(PathBuf),

    #[error("reproduction mismatch: expected {expected}, got {got}")]
    ReproductionMismatch { expected: String, got: String },
}

pub type Result<T> = std::result::Result<T, FuzzError>;
