use std::io;

use quinn_proto::crypto::rustls::NoInitialCipherSuite;
use quinn_proto::{ConnectError, ConnectionError, ReadError, ReadableError, WriteError};

/// Errors returned by quicweb-quic operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("connection closed")]
    ConnectionClosed,

    #[error("invalid connection")]
    InvalidConnection,

    #[error("no client configuration")]
    NoClientConfig,

    #[error("stream closed")]
    ClosedStream,

    #[error("tls: {0}")]
    Tls(#[from] NoInitialCipherSuite),

    #[error("connect: {0}")]
    Connect(#[from] ConnectError),

    #[error("connection: {0}")]
    Connection(#[from] ConnectionError),

    #[error("write: {0}")]
    Write(#[from] WriteError),

    #[error("read: {0}")]
    Read(#[from] ReadError),

    #[error("readable: {0}")]
    Readable(#[from] ReadableError),

    #[error("io: {0}")]
    Io(#[from] io::Error),
}

impl Error {
    /// The peer's application error code if this error is a stream reset.
    pub fn reset_code(&self) -> Option<u64> {
        match self {
            Self::Read(ReadError::Reset(code)) => Some(code.into_inner()),
            Self::Write(WriteError::Stopped(code)) => Some(code.into_inner()),
            _ => None,
        }
    }

    /// True when a write was refused only because of flow control.
    pub fn is_blocked(&self) -> bool {
        matches!(self, Self::Write(WriteError::Blocked))
    }
}
