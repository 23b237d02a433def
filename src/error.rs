//! Error types shared by the transport binding, the probe and the server.
//!
//! Errors split in two layers:
//!
//! - [`StreamError`]: something went wrong on a single stream. The server
//!   records these per connection and keeps listening; the client surfaces
//!   them to its caller.
//! - [`DoctorError`]: failures at the boundary of an operation (bootstrap,
//!   listen, probe). The binary turns these into a non-zero exit status.

use std::io;

use thiserror::Error;

/// Failure on one stream.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StreamError {
    /// The outbound stream could not be established.
    #[error("connect to {peer} failed: {reason}")]
    Connect { peer: String, reason: String },

    /// Reading or writing the underlying byte channel failed.
    #[error("stream I/O error: {0}")]
    Io(String),

    /// The peer announced a frame longer than the framing layer accepts.
    #[error("frame of {len} bytes exceeds the {max} byte limit")]
    FrameTooLarge { len: usize, max: usize },

    /// The stream task went away before the operation completed.
    #[error("stream is closed")]
    Closed,
}

impl From<io::Error> for StreamError {
    fn from(err: io::Error) -> Self {
        StreamError::Io(err.to_string())
    }
}

/// Failure of a top-level doctor operation.
#[derive(Debug, Error)]
pub enum DoctorError {
    /// The node could not join the network.
    #[error("bootstrap failed: {0}")]
    Bootstrap(String),

    /// A listener could not be registered under its public key.
    #[error("listen failed: {0}")]
    Listen(String),

    /// A hex key or seed given on the command line is malformed.
    #[error("invalid {what}: {reason}")]
    InvalidKey { what: &'static str, reason: String },

    /// The probe stream failed.
    #[error(transparent)]
    Stream(#[from] StreamError),

    /// The server sent back bytes that were never sent.
    #[error("echo mismatch in {size} byte round: {reason}")]
    EchoMismatch { size: usize, reason: String },
}

pub type Result<T, E = DoctorError> = std::result::Result<T, E>;
