//! Per-stream state tracking for HTTP/3 request streams.

use quicweb_quic::{QuicConnId, StreamId};

use crate::error::H3Error;
use crate::transport::Transport;

/// Receive side of a request stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RecvState {
    /// Waiting for the initial HEADERS frame.
    AwaitingHeaders,
    /// Headers delivered; DATA frames may follow.
    Body,
    /// End of stream delivered, or the stream failed. Nothing more is read.
    Done,
}

/// Send side of a request stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SendState {
    /// Nothing written yet.
    Idle,
    /// Header block written; DATA may follow.
    Headers,
    /// FIN queued, or the stream was reset/stopped.
    Done,
}

/// Bytes accepted by the session but not yet by the transport.
#[derive(Debug, Default)]
pub(crate) struct Outbound {
    buf: Vec<u8>,
    written: usize,
    fin: bool,
    fin_sent: bool,
}

impl Outbound {
    pub fn queue(&mut self, bytes: &[u8]) {
        if self.written == self.buf.len() {
            self.buf.clear();
            self.written = 0;
        }
        self.buf.extend_from_slice(bytes);
    }

    pub fn finish(&mut self) {
        self.fin = true;
    }

    /// Everything queued, FIN included, has been handed to the transport.
    pub fn is_drained(&self) -> bool {
        self.written == self.buf.len() && self.fin == self.fin_sent
    }

    pub fn discard(&mut self) {
        self.buf = Vec::new();
        self.written = 0;
        self.fin_sent = self.fin;
    }

    /// Push queued bytes into the transport until it stops accepting them.
    ///
    /// Returns the peer's error code if it stopped the stream.
    pub fn flush<T: Transport>(
        &mut self,
        transport: &mut T,
        conn: QuicConnId,
        stream: StreamId,
    ) -> Result<Option<u64>, H3Error> {
        while self.written < self.buf.len() {
            match transport.stream_send(conn, stream, &self.buf[self.written..]) {
                Ok(0) => return Ok(None),
                Ok(n) => self.written += n,
                Err(e) if e.is_blocked() => return Ok(None),
                Err(e) => match e.reset_code() {
                    Some(code) => {
                        self.discard();
                        return Ok(Some(code));
                    }
                    None => return Err(e.into()),
                },
            }
        }
        self.buf.clear();
        self.written = 0;
        if self.fin && !self.fin_sent {
            transport.stream_finish(conn, stream)?;
            self.fin_sent = true;
        }
        Ok(None)
    }
}

/// Tracks the state and partial data for a single HTTP/3 request stream.
#[derive(Debug)]
pub(crate) struct RequestStream {
    pub recv: RecvState,
    pub send: SendState,
    /// Unparsed frame bytes.
    pub recv_buf: Vec<u8>,
    /// Payload bytes still to come for the DATA frame being delivered.
    pub data_remaining: u64,
    /// Payload bytes still to discard for an unknown frame.
    pub skip_remaining: u64,
    pub outbound: Outbound,
}

impl RequestStream {
    pub fn new() -> Self {
        Self {
            recv: RecvState::AwaitingHeaders,
            send: SendState::Idle,
            recv_buf: Vec::new(),
            data_remaining: 0,
            skip_remaining: 0,
            outbound: Outbound::default(),
        }
    }

    /// Both directions finished and nothing left to write.
    pub fn is_closed(&self) -> bool {
        self.recv == RecvState::Done && self.send == SendState::Done && self.outbound.is_drained()
    }
}
