//! Error taxonomy for volcast
//!
//! Recoverable conditions (a single exhausted acquire, a single malformed
//! frame, a single dropped connection) surface as values of [`Error`] so the
//! caller can drop the frame or tear down the connection and carry on.

use std::time::Duration;
use thiserror::Error;

use crate::volume::Shape;

/// Result type alias for volcast operations
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    /// No buffer became free before the acquire timeout elapsed.
    #[error("buffer pool exhausted: no free buffer within {timeout:?}")]
    PoolExhausted { timeout: Duration },

    /// A buffer was handed back that the pool does not consider checked out.
    #[error("buffer {id} is not checked out of this pool")]
    NotCheckedOut { id: u64 },

    /// A volume without a lease (or whose pool is gone) was released to a pool.
    #[error("volume was not lent by this pool")]
    ForeignVolume,

    /// Frame header and payload disagree, or the dimensions are not positive.
    #[error("malformed frame: {0}")]
    MalformedFrame(String),

    /// Shape whose byte size does not fit in addressable memory.
    #[error("volume {0} is too large to allocate")]
    Oversized(Shape),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Lifecycle call made in the wrong order (e.g. `start()` before `open()`).
    #[error("invalid state: {0}")]
    InvalidState(&'static str),

    #[error("configuration error: {0}")]
    Config(String),
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Config(err.to_string())
    }
}
