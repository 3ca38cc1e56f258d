/// HTTP/3 application error codes (RFC 9114 Section 8.1).
pub mod code {
    pub const H3_NO_ERROR: u64 = 0x100;
    pub const H3_GENERAL_PROTOCOL_ERROR: u64 = 0x101;
    pub const H3_INTERNAL_ERROR: u64 = 0x102;
    pub const H3_STREAM_CREATION_ERROR: u64 = 0x103;
    pub const H3_CLOSED_CRITICAL_STREAM: u64 = 0x104;
    pub const H3_FRAME_UNEXPECTED: u64 = 0x105;
    pub const H3_FRAME_ERROR: u64 = 0x106;
    pub const H3_EXCESSIVE_LOAD: u64 = 0x107;
    pub const H3_SETTINGS_ERROR: u64 = 0x109;
    pub const H3_MISSING_SETTINGS: u64 = 0x10a;
    pub const H3_REQUEST_REJECTED: u64 = 0x10b;
    pub const H3_REQUEST_INCOMPLETE: u64 = 0x10d;
    pub const H3_MESSAGE_ERROR: u64 = 0x10e;
    pub const QPACK_DECOMPRESSION_FAILED: u64 = 0x200;
}

/// Errors produced by the HTTP/3 framing layer.
#[derive(Debug, thiserror::Error)]
pub enum H3Error {
    /// QUIC transport error.
    #[error("quic: {0}")]
    Quic(#[from] quicweb_quic::Error),
    /// Frame not permitted on this stream, or a reserved HTTP/2 frame type.
    #[error("unexpected frame type")]
    FrameUnexpected,
    /// Control stream did not start with a SETTINGS frame.
    #[error("missing SETTINGS on control stream")]
    MissingSettings,
    /// SETTINGS frame repeated an identifier or used a reserved HTTP/2 one.
    #[error("invalid SETTINGS")]
    SettingsError,
    /// Peer opened a stream it is not allowed to open (e.g. a server push
    /// style bidirectional stream toward a client).
    #[error("stream creation error")]
    StreamCreation,
    /// Frame decoding error (truncated varint, invalid payload, etc.).
    #[error("frame error")]
    FrameError,
    /// A control frame too large to be worth buffering.
    #[error("excessive load")]
    ExcessiveLoad,
    /// QPACK header block decoding failed.
    #[error("QPACK decoding failed")]
    QpackDecodingFailed,
    /// A critical stream (control) was closed prematurely.
    #[error("critical stream closed")]
    ClosedCriticalStream,
    /// Header block is well-formed QPACK but not a valid HTTP message.
    #[error("malformed message: {0}")]
    MessageError(&'static str),
    /// The peer finished a request stream before a complete header block.
    #[error("stream ended before a complete message")]
    RequestIncomplete,
    /// The server will not process this request (it is beyond GOAWAY).
    #[error("request rejected")]
    RequestRejected,
    /// The peer reset the stream with the given application error code.
    #[error("stream reset by peer (code {0:#x})")]
    StreamReset(u64),
    /// Write attempted after the local side of the stream was finished.
    #[error("stream already closed for sending")]
    StreamClosed,
    /// A second header block on the same stream and direction.
    #[error("header block already sent on this stream")]
    HeadersAlreadySent,
    /// No QUIC connection is bound to this session yet.
    #[error("no connection")]
    NoConnection,
    /// GOAWAY was sent or received; no new requests may start.
    #[error("connection is going away")]
    GoingAway,
    /// Peer's stream concurrency limit prevents opening a stream.
    #[error("stream limit reached")]
    StreamLimit,
    /// Internal error with a description.
    #[error("internal: {0}")]
    Internal(String),
}

impl H3Error {
    /// Application error code used when this error resets a stream or closes
    /// the connection.
    pub fn code(&self) -> u64 {
        match self {
            Self::FrameUnexpected => code::H3_FRAME_UNEXPECTED,
            Self::FrameError => code::H3_FRAME_ERROR,
            Self::ExcessiveLoad => code::H3_EXCESSIVE_LOAD,
            Self::MissingSettings => code::H3_MISSING_SETTINGS,
            Self::SettingsError => code::H3_SETTINGS_ERROR,
            Self::StreamCreation => code::H3_STREAM_CREATION_ERROR,
            Self::MessageError(_) => code::H3_MESSAGE_ERROR,
            Self::QpackDecodingFailed => code::QPACK_DECOMPRESSION_FAILED,
            Self::ClosedCriticalStream => code::H3_CLOSED_CRITICAL_STREAM,
            Self::RequestIncomplete => code::H3_REQUEST_INCOMPLETE,
            Self::RequestRejected => code::H3_REQUEST_REJECTED,
            Self::HeadersAlreadySent => code::H3_MESSAGE_ERROR,
            Self::StreamReset(code) => *code,
            Self::Quic(_)
            | Self::StreamClosed
            | Self::NoConnection
            | Self::StreamLimit
            | Self::GoingAway => code::H3_GENERAL_PROTOCOL_ERROR,
            Self::Internal(_) => code::H3_INTERNAL_ERROR,
        }
    }
}
