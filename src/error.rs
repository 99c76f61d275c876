use std::fmt::Display;

/// CinderDB errors.
#[derive(Clone, Debug, PartialEq)]
pub enum Error {
    /// An underlying file system, memory-map, or lock-poisoning failure.
    Io(String),
    /// On-disk data that cannot be decoded: a record whose length prefix or
    /// body runs past end-of-file, or a segment whose keys are not strictly
    /// ascending.
    Corrupt(String),
    /// The database directory is already locked by another process.
    Locked(String),
}

impl std::error::Error for Error {}

impl Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Error::Io(msg) => write!(f, "io error: {msg}"),
            Error::Corrupt(msg) => write!(f, "corrupt data: {msg}"),
            Error::Locked(msg) => write!(f, "database locked: {msg}"),
        }
    }
}

/// Constructs an Error::Corrupt for the given format string.
#[macro_export]
macro_rules! errcorrupt {
    ($($args:tt)*) => { $crate::error::Error::Corrupt(format!($($args)*)) };
}

/// A CinderDB Result returning Error.
pub type Result<T> = std::result::Result<T, Error>;

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
