use std::fmt::Display;

/// BirchDB errors.
#[derive(Clone, Debug, PartialEq)]
pub enum Error {
    /// The tree was shut down after a failed compaction finalize and can no
    /// longer serve operations. Reopen the path to continue.
    Closed,
    /// Compression failed inside the codec.
    Compress(String),
    /// A compaction scratch file already exists next to the database.
    CompactExists(String),
    /// Decompression failed inside the codec.
    Decompress(String),
    /// Opening, closing, or renaming the backing file failed.
    File(String),
    /// Invalid persisted data: a corrupt head record or page image.
    InvalidData(String),
    /// Invalid caller input, typically bad open options.
    InvalidInput(String),
    /// A read or write returned fewer bytes than requested, or a system
    /// I/O error occurred.
    Io(String),
    /// The key exceeds the per-key size cap.
    KeyTooLarge(usize),
    /// Another instance holds the exclusive lock on the backing file.
    Locked(String),
    /// The key is absent.
    NotFound,
    /// A read was attempted past the end of the file. Usually a sign of
    /// corruption in the record being followed.
    OutOfBounds(String),
}

impl std::error::Error for Error {}

impl Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Error::Closed => write!(f, "tree is closed"),
            Error::Compress(msg) => write!(f, "compression failed: {msg}"),
            Error::CompactExists(path) => {
                write!(f, "compaction scratch file already exists: {path}")
            }
            Error::Decompress(msg) => write!(f, "decompression failed: {msg}"),
            Error::File(msg) => write!(f, "file error: {msg}"),
            Error::InvalidData(msg) => write!(f, "invalid data: {msg}"),
            Error::InvalidInput(msg) => write!(f, "invalid input: {msg}"),
            Error::Io(msg) => write!(f, "io error: {msg}"),
            Error::KeyTooLarge(len) => write!(f, "key of {len} bytes exceeds the key size cap"),
            Error::Locked(path) => write!(f, "file is locked by another instance: {path}"),
            Error::NotFound => write!(f, "key not found"),
            Error::OutOfBounds(msg) => write!(f, "read past end of file: {msg}"),
        }
    }
}

/// A BirchDB Result returning Error.
pub type Result<T> = std::result::Result<T, Error>;

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io(err.to_string())
    }
}
