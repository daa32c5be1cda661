//! Error type for everything that can go wrong while streaming a run.

use std::borrow::Cow;
use std::convert::From;
use std::error;
use std::fmt;
use std::io::ErrorKind;

pub use std::io::Error as IoError;
pub use std::io::Result as IoResult;

/// A result that may contain an error from this crate.
pub type Result<T> = std::result::Result<T, Error>;

/// A result that, if ok, contains nothing, and otherwise contains an error from this crate.
pub type UnitResult = Result<()>;


/// An error that may happen while configuring, decoding or writing a run.
#[derive(Debug)]
pub enum Error {

    /// Reading or writing the byte transport or an output file failed.
    Io(IoError),

    /// The configuration or the incoming byte stream contradicts itself.
    Invalid(Cow<'static, str>),

    /// The requested feature is not available in this build.
    NotSupported(Cow<'static, str>),
}

impl Error {

    /// Create an error about an invalid configuration value or byte stream.
    pub(crate) fn invalid(message: impl Into<Cow<'static, str>>) -> Self {
        Error::Invalid(message.into())
    }

    /// Create an error about a feature this crate does not offer.
    pub(crate) fn unsupported(message: impl Into<Cow<'static, str>>) -> Self {
        Error::NotSupported(message.into())
    }

    /// True if this error was caused by the byte source ending early.
    /// The pipeline treats this as regular termination, not a failure.
    pub fn is_end_of_stream(&self) -> bool {
        match self {
            Error::Io(error) => error.kind() == ErrorKind::UnexpectedEof,
            _ => false,
        }
    }
}

/// Enable using the `?` operator on `io::Result`.
impl From<IoError> for Error {
    fn from(error: IoError) -> Self {
        Error::Io(error)
    }
}

impl error::Error for Error {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match self {
            Error::Io(error) => Some(error),
            _ => None,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Io(error) => write!(formatter, "io error: {}", error),
            Error::Invalid(message) => write!(formatter, "invalid: {}", message),
            Error::NotSupported(message) => write!(formatter, "unsupported: {}", message),
        }
    }
}

/// Convert an index to `u64`, for file offsets and counters.
pub(crate) fn usize_to_u64(value: usize) -> u64 {
    value as u64
}

/// Convert a file offset to an index, failing on 32-bit machines
/// where the value would not fit.
pub(crate) fn u64_to_usize(value: u64, name: &'static str) -> Result<usize> {
    use std::convert::TryFrom;
    usize::try_from(value).map_err(|_| Error::invalid(name))
}
