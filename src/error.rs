//! Error type for merging and flattening deep images.

use std::collections::TryReserveError;
use std::fmt;

use crate::math::Vec2;

/// A result that may contain a compositing error.
pub type Result<T> = std::result::Result<T, Error>;

/// A result with no value, which may contain a compositing error.
pub type UnitResult = Result<()>;

pub use std::io::Error as IoError;
pub use std::io::Result as IoResult;


/// Any error that may happen while merging or flattening deep images.
/// The pipeline publishes the first error that occurs in any thread;
/// later errors are discarded while the remaining threads wind down.
#[derive(Debug)]
pub enum Error {

    /// Two input sources disagree on image resolution.
    /// Detected before the pipeline starts.
    MismatchedDimensions {
        /// The resolution of the first source.
        expected: Vec2<usize>,

        /// The resolution of the offending source.
        found: Vec2<usize>,
    },

    /// A deep source failed to provide a row of samples.
    SourceIo(String),

    /// Allocating a row buffer or image buffer failed.
    OutOfMemory,

    /// A pipeline invariant was violated. This is a bug in either
    /// this library or a `DeepSource` implementation.
    Internal(String),
}


impl Error {
    pub fn source_io(message: impl Into<String>) -> Self {
        Error::SourceIo(message.into())
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Error::Internal(message.into())
    }
}


/// Enable using the `?` operator on io::Result
impl From<IoError> for Error {
    fn from(error: IoError) -> Self {
        Error::SourceIo(error.to_string())
    }
}

/// Enable using the `?` operator on fallible `Vec` reservations
impl From<TryReserveError> for Error {
    fn from(_: TryReserveError) -> Self {
        Error::OutOfMemory
    }
}

impl std::error::Error for Error {}

impl fmt::Display for Error {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::MismatchedDimensions { expected, found } => write!(
                formatter, "input image dimensions mismatch: expected {}x{}, found {}x{}",
                expected.x(), expected.y(), found.x(), found.y()
            ),

            Error::SourceIo(message) => write!(formatter, "deep source error: {}", message),
            Error::OutOfMemory => write!(formatter, "not enough memory for a row buffer"),
            Error::Internal(message) => write!(formatter, "internal error: {}", message),
        }
    }
}
