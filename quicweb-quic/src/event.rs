use quinn_proto::{ConnectionError, StreamId};

/// Opaque identifier for a QUIC connection within a [`QuicEndpoint`](crate::QuicEndpoint).
///
/// Wraps a slab index. Use [`index()`](QuicConnId::index) for per-connection
/// state arrays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct QuicConnId(pub(crate) u32);

impl QuicConnId {
    /// Build an id from a raw index. Only meaningful for the endpoint (or test
    /// transport) that handed the index out.
    pub const fn new(index: u32) -> Self {
        Self(index)
    }

    /// Returns the underlying index, suitable for indexing per-connection arrays.
    pub fn index(&self) -> usize {
        self.0 as usize
    }
}

impl std::fmt::Display for QuicConnId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "conn#{}", self.0)
    }
}

/// Application-facing events produced by [`QuicEndpoint`](crate::QuicEndpoint).
///
/// Poll these via [`QuicEndpoint::poll_event()`](crate::QuicEndpoint::poll_event).
#[derive(Debug)]
pub enum QuicEvent {
    /// An inbound QUIC connection completed its handshake.
    NewConnection(QuicConnId),

    /// An outbound QUIC connection completed its handshake.
    Connected(QuicConnId),

    /// The peer opened a new stream.
    StreamOpened {
        conn: QuicConnId,
        stream: StreamId,
        bidi: bool,
    },

    /// Data (or a FIN, or a reset) is available to read on a stream.
    StreamReadable { conn: QuicConnId, stream: StreamId },

    /// Flow control window opened: the stream is writable again.
    StreamWritable { conn: QuicConnId, stream: StreamId },

    /// A send stream has been fully acknowledged by the peer.
    StreamFinished { conn: QuicConnId, stream: StreamId },

    /// The peer asked us to stop sending on a stream.
    StreamStopped {
        conn: QuicConnId,
        stream: StreamId,
        code: u64,
    },

    /// A QUIC connection was closed or lost.
    ConnectionClosed {
        conn: QuicConnId,
        reason: ConnectionError,
    },
}

impl QuicEvent {
    /// The connection this event belongs to.
    pub fn conn(&self) -> QuicConnId {
        match self {
            Self::NewConnection(conn) | Self::Connected(conn) => *conn,
            Self::StreamOpened { conn, .. }
            | Self::StreamReadable { conn, .. }
            | Self::StreamWritable { conn, .. }
            | Self::StreamFinished { conn, .. }
            | Self::StreamStopped { conn, .. }
            | Self::ConnectionClosed { conn, .. } => *conn,
        }
    }
}
