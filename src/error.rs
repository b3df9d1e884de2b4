use std::fmt::Display;

/// Emberstore errors.
#[derive(Clone, Debug, PartialEq)]
pub enum Error {
    /// A store file whose name does not match the `<id>[.<parent>]` grammar.
    /// Fatal at load time; a silent skip would hide corruption.
    BadName(String),
    /// Invalid or corrupt on-disk data: bad checksums, truncated entries,
    /// undecodable sidecars.
    Corrupt(String),
    /// Invalid caller input.
    InvalidInput(String),
    /// An IO error.
    Io(String),
    /// `clear_snapshot` was passed a snapshot that is not the current one.
    /// Programmer error in the flush protocol.
    UnexpectedSnapshot(String),
}

impl std::error::Error for Error {}

impl Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Error::BadName(msg) => write!(f, "bad store file name: {msg}"),
            Error::Corrupt(msg) => write!(f, "corrupt data: {msg}"),
            Error::InvalidInput(msg) => write!(f, "invalid input: {msg}"),
            Error::Io(msg) => write!(f, "io error: {msg}"),
            Error::UnexpectedSnapshot(msg) => write!(f, "unexpected snapshot: {msg}"),
        }
    }
}

/// Constructs an Error::Corrupt for the given format string.
#[macro_export]
macro_rules! errcorrupt {
    ($($args:tt)*) => { $crate::error::Error::Corrupt(format!($($args)*)).into() };
}

/// Constructs an Error::InvalidInput for the given format string.
#[macro_export]
macro_rules! errinput {
    ($($args:tt)*) => { $crate::error::Error::InvalidInput(format!($($args)*)).into() };
}

/// An emberstore Result returning Error.
pub type Result<T> = std::result::Result<T, Error>;

impl<T> From<Error> for Result<T> {
    fn from(error: Error) -> Self {
        Err(error)
    }
}

impl From<Box<bincode::ErrorKind>> for Error {
    fn from(err: Box<bincode::ErrorKind>) -> Self {
        Error::Corrupt(err.to_string())
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io(err.to_string())
    }
}

impl<T> From<std::sync::PoisonError<T>> for Error {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        Error::Io(err.to_string())
    }
}
