//! Defines error types.
use std::io;
use thiserror::Error;

/// Crate result type (re-exported).
pub type Result<T> = std::result::Result<T, Error>;

/// Error types.
#[derive(Error, Debug)]
pub enum Error {
    /// Block size handed to segment creation is zero or not 64-byte aligned.
    #[error("block size {0} is not a non-zero multiple of 64")]
    NotMultipleOf64(u32),
    /// Ring needs at least two blocks so the writer and reader spans can coexist.
    #[error("block count {0} is too small, at least 2 blocks are required")]
    BlockCountTooSmall(u32),
    /// Requested ring dimensions overflow the addressable segment size.
    #[error("ring dimensions overflow the addressable segment size")]
    SegmentTooLarge,
    /// Segment name violates POSIX shared memory naming rules.
    #[error("invalid segment name: {0}")]
    InvalidName(String),
    /// Mapped region does not start with the expected magic tag.
    #[error("segment magic mismatch, not a pipe segment")]
    BadMagic,
    /// Peer was built against a different shared layout.
    #[error("segment layout version mismatch, expected {expected}, found {found}")]
    VersionMismatch { expected: u32, found: u32 },
    /// Mapping is smaller than the ring the header declares.
    #[error("segment holds {found} bytes but the declared ring needs {expected}")]
    SegmentTruncated { expected: usize, found: usize },
    /// A block link points outside the ring; the segment never initialized properly.
    #[error("block link {0} points outside the ring")]
    InvalidBlockIndex(u32),
    /// A ring pointer read from shared memory is out of range; the peer is corrupt
    /// and the endpoint is poisoned.
    #[error("shared memory corrupted, ring pointer {0} is out of range")]
    InvalidSharedMemory(u32),
    /// A lease was handed to the release call of the opposite direction.
    #[error("buffer was leased for the opposite direction")]
    InvalidBuffer,
    /// The endpoint has been closed.
    #[error("pipe endpoint is closed")]
    ClosedPipe,
    /// Error from the operating system (shm namespace, mapping or semaphore).
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl From<Error> for io::Error {
    fn from(err: Error) -> io::Error {
        match err {
            Error::Io(err) => err,
            Error::ClosedPipe => io::Error::new(io::ErrorKind::BrokenPipe, err),
            Error::InvalidBuffer => io::Error::new(io::ErrorKind::InvalidInput, err),
            Error::InvalidSharedMemory(_) | Error::InvalidBlockIndex(_) | Error::BadMagic => {
                io::Error::new(io::ErrorKind::InvalidData, err)
            }
            err => io::Error::new(io::ErrorKind::Other, err),
        }
    }
}

#[cold]
#[inline(never)]
pub(crate) fn invalid_shared_memory(index: u32) -> Error {
    Error::InvalidSharedMemory(index)
}

#[cold]
#[inline(never)]
pub(crate) fn closed_pipe() -> Error {
    Error::ClosedPipe
}
