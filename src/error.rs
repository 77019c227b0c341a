use std::io;

/// Errors surfaced by the store's public operations.
///
/// Mirrors the three failure classes from the error handling design: I/O-fatal
/// and corruption both latch the store into a poisoned state (see
/// [`crate::level::LevelManager`]); capacity is rejected before any mutation.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// A file in the data directory could not be opened, read, or written.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// An SST's on-disk contents disagree with their own header.
    #[error("corrupt SST at {path}: {reason}")]
    Corrupt { path: String, reason: String },

    /// A single value is too large to ever fit in a freshly flushed SST.
    #[error("value of {size} bytes exceeds the maximum of {max} bytes")]
    ValueTooLarge { size: usize, max: usize },

    /// A prior I/O-fatal or corruption error put the store into a
    /// refuse-further-writes state.
    #[error("store is poisoned by a prior I/O error and refuses further writes")]
    Poisoned,

    /// `put` was called with the reserved tombstone sentinel as its value.
    #[error("value equals the reserved tombstone sentinel")]
    ReservedValue,
}

pub type Result<T> = std::result::Result<T, StoreError>;
