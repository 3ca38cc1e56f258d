use std::path::PathBuf;
use std::time::Duration;

use quicweb_h3::H3Error;
use quicweb_quic::StreamId;

/// Failures loading certificates or building a TLS configuration.
#[derive(Debug, thiserror::Error)]
pub enum TlsError {
    #[error("reading {path}: {source}")]
    Pem {
        path: PathBuf,
        #[source]
        source: rustls::pki_types::pem::Error,
    },

    #[error("no certificates found in {0}")]
    NoCertificates(PathBuf),

    #[error("tls: {0}")]
    Rustls(#[from] rustls::Error),

    #[error("quic: {0}")]
    Quic(#[from] quicweb_quic::Error),
}

/// Errors returned by the HTTP/3 client.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("invalid url: {0}")]
    Url(#[from] url::ParseError),

    #[error("unsupported url {0}: only https:// with a host is supported")]
    UnsupportedUrl(String),

    #[error("could not resolve {0}")]
    Resolve(String),

    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Tls(#[from] TlsError),

    #[error("quic: {0}")]
    Quic(#[from] quicweb_quic::Error),

    #[error("http/3: {0}")]
    H3(#[from] H3Error),

    /// The response on this stream already ended.
    #[error("end of stream received twice on {0}")]
    DuplicateEnd(StreamId),

    /// The connection (or the stream, before any response arrived) went away.
    #[error("connection closed: {0}")]
    TransportClosed(String),

    #[error("no response within {0:?}")]
    Timeout(Duration),

    /// The stream failed after the response headers arrived.
    #[error("{stream} failed: {error}")]
    Stream {
        stream: StreamId,
        #[source]
        error: H3Error,
    },
}

/// Errors that stop the server.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    #[error("content root {path}: {source}")]
    Root {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Tls(#[from] TlsError),
}
