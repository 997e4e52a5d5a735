//! The crate-wide error and result types.

use std::fmt;

/// The result type used throughout the crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// The various ways in which the engine can fail.
#[derive(Debug)]
pub enum Error {
    /// The metainfo could not be parsed or failed one of its structural
    /// invariants (piece count, file length sum, UTF-8 fallback fields).
    InvalidMetainfo(String),
    /// A tracker announce failed, either at the transport level or because
    /// the tracker returned a `failure reason`.
    TrackerFailure(String),
    /// A peer's handshake did not match our expectations (wrong protocol
    /// string or info hash).
    HandshakeMismatch,
    /// A peer violated the wire protocol (malformed message, message with an
    /// invalid length prefix, message sent in a state that doesn't allow it).
    ProtocolViolation(String),
    /// A piece failed its SHA-1 check, or a write/read was attempted against
    /// an index that doesn't exist in torrent.
    IntegrityFailure(String),
    /// A disk IO operation failed.
    StorageFailure(String),
    /// A task or connection was cancelled before completing.
    Cancelled,
    /// An unmapped IO error.
    Io(std::io::Error),
    /// A channel on the other end was dropped.
    ChannelClosed,
    /// Invalid torrent id provided to an engine-facing API.
    InvalidTorrentId,
    /// Invalid piece index provided to a storage-facing API.
    InvalidPieceIndex,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::InvalidMetainfo(msg) => {
                write!(f, "invalid metainfo: {}", msg)
            }
            Error::TrackerFailure(msg) => write!(f, "tracker failure: {}", msg),
            Error::HandshakeMismatch => {
                write!(f, "peer handshake mismatch")
            }
            Error::ProtocolViolation(msg) => {
                write!(f, "protocol violation: {}", msg)
            }
            Error::IntegrityFailure(msg) => {
                write!(f, "integrity failure: {}", msg)
            }
            Error::StorageFailure(msg) => write!(f, "storage failure: {}", msg),
            Error::Cancelled => write!(f, "operation cancelled"),
            Error::Io(e) => write!(f, "io error: {}", e),
            Error::ChannelClosed => write!(f, "internal channel closed"),
            Error::InvalidTorrentId => write!(f, "invalid torrent id"),
            Error::InvalidPieceIndex => write!(f, "invalid piece index"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Io(e)
    }
}

impl From<serde_bencode::Error> for Error {
    fn from(e: serde_bencode::Error) -> Self {
        Error::InvalidMetainfo(e.to_string())
    }
}

impl From<tokio::time::error::Elapsed> for Error {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        Error::Cancelled
    }
}

impl From<url::ParseError> for Error {
    fn from(e: url::ParseError) -> Self {
        Error::TrackerFailure(format!("invalid tracker url: {}", e))
    }
}

impl<T> From<tokio::sync::mpsc::error::SendError<T>> for Error {
    fn from(_: tokio::sync::mpsc::error::SendError<T>) -> Self {
        Error::ChannelClosed
    }
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        Error::TrackerFailure(e.to_string())
    }
}

/// Errors specific to allocating a new torrent's storage on disk.
#[derive(Debug)]
pub enum NewTorrentError {
    AlreadyExists,
    Io(std::io::Error),
}

impl fmt::Display for NewTorrentError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NewTorrentError::AlreadyExists => {
                write!(f, "torrent already allocated")
            }
            NewTorrentError::Io(e) => write!(f, "io error: {}", e),
        }
    }
}

impl std::error::Error for NewTorrentError {}

/// Errors specific to writing a piece's blocks to disk.
#[derive(Debug)]
pub enum WriteError {
    InvalidPieceIndex,
    Io(std::io::Error),
}

impl fmt::Display for WriteError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WriteError::InvalidPieceIndex => write!(f, "invalid piece index"),
            WriteError::Io(e) => write!(f, "io error: {}", e),
        }
    }
}

impl std::error::Error for WriteError {}

/// Errors specific to reading a piece's bytes back from disk.
#[derive(Debug)]
pub enum ReadError {
    InvalidPieceIndex,
    Io(std::io::Error),
}

impl fmt::Display for ReadError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReadError::InvalidPieceIndex => write!(f, "invalid piece index"),
            ReadError::Io(e) => write!(f, "io error: {}", e),
        }
    }
}

impl std::error::Error for ReadError {}
