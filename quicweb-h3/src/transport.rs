//! The narrow interface the HTTP/3 layer drives its transport through.

use quicweb_quic::{Error, QuicConnId, QuicEndpoint, StreamId};

/// Stream operations an [`H3Connection`](crate::H3Connection) needs from QUIC.
///
/// Implemented by [`QuicEndpoint`]. The session never owns the transport;
/// every call borrows it for the duration of one operation.
pub trait Transport {
    fn open_bi(&mut self, conn: QuicConnId) -> Result<Option<StreamId>, Error>;

    fn open_uni(&mut self, conn: QuicConnId) -> Result<Option<StreamId>, Error>;

    /// Write as much of `data` as flow control allows; returns bytes accepted.
    fn stream_send(&mut self, conn: QuicConnId, stream: StreamId, data: &[u8])
    -> Result<usize, Error>;

    /// Read into `buf`; returns `(bytes_read, fin_reached)`.
    fn stream_recv(
        &mut self,
        conn: QuicConnId,
        stream: StreamId,
        buf: &mut [u8],
    ) -> Result<(usize, bool), Error>;

    fn stream_finish(&mut self, conn: QuicConnId, stream: StreamId) -> Result<(), Error>;

    fn stream_reset(&mut self, conn: QuicConnId, stream: StreamId, code: u64)
    -> Result<(), Error>;

    fn stream_stop(&mut self, conn: QuicConnId, stream: StreamId, code: u64) -> Result<(), Error>;

    fn close_connection(&mut self, conn: QuicConnId, code: u32, reason: &[u8]);
}

impl Transport for QuicEndpoint {
    fn open_bi(&mut self, conn: QuicConnId) -> Result<Option<StreamId>, Error> {
        QuicEndpoint::open_bi(self, conn)
    }

    fn open_uni(&mut self, conn: QuicConnId) -> Result<Option<StreamId>, Error> {
        QuicEndpoint::open_uni(self, conn)
    }

    fn stream_send(
        &mut self,
        conn: QuicConnId,
        stream: StreamId,
        data: &[u8],
    ) -> Result<usize, Error> {
        QuicEndpoint::stream_send(self, conn, stream, data)
    }

    fn stream_recv(
        &mut self,
        conn: QuicConnId,
        stream: StreamId,
        buf: &mut [u8],
    ) -> Result<(usize, bool), Error> {
        QuicEndpoint::stream_recv(self, conn, stream, buf)
    }

    fn stream_finish(&mut self, conn: QuicConnId, stream: StreamId) -> Result<(), Error> {
        QuicEndpoint::stream_finish(self, conn, stream)
    }

    fn stream_reset(
        &mut self,
        conn: QuicConnId,
        stream: StreamId,
        code: u64,
    ) -> Result<(), Error> {
        QuicEndpoint::stream_reset(self, conn, stream, code)
    }

    fn stream_stop(&mut self, conn: QuicConnId, stream: StreamId, code: u64) -> Result<(), Error> {
        QuicEndpoint::stream_stop(self, conn, stream, code)
    }

    fn close_connection(&mut self, conn: QuicConnId, code: u32, reason: &[u8]) {
        QuicEndpoint::close_connection(self, conn, code, reason)
    }
}
