//! HTTP/3 connection state machine.
//!
//! `H3Connection` sits on top of one QUIC connection, turning its stream
//! events into HTTP-level events and framing outgoing header blocks and
//! bodies. The same type drives both ends; [`Role`] decides who opens
//! request streams and which header blocks are valid.
//!
//! The session never owns its transport. Every call that needs to touch QUIC
//! borrows a [`Transport`] for the duration of that call, so one endpoint can
//! carry many sessions.

use std::collections::{HashMap, VecDeque};

use quicweb_quic::{Dir, QuicConnId, QuicEvent, Side, StreamId};

use crate::error::{H3Error, code};
use crate::frame::{self, Frame};
use crate::qpack::{self, HeaderField};
use crate::settings::Settings;
use crate::stream::{Outbound, RecvState, RequestStream, SendState};
use crate::transport::Transport;

/// HTTP/3 uni-stream type identifiers (RFC 9114 Section 6.2).
const STREAM_TYPE_CONTROL: u64 = 0x00;
const STREAM_TYPE_QPACK_ENCODER: u64 = 0x02;
const STREAM_TYPE_QPACK_DECODER: u64 = 0x03;

const READ_CHUNK: usize = 64 * 1024;

/// Largest SETTINGS, GOAWAY, CANCEL_PUSH or MAX_PUSH_ID payload accepted on
/// the control stream.
const MAX_CONTROL_PAYLOAD: u64 = 16 * 1024;

/// Which end of the connection this session is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Client,
    Server,
}

impl Role {
    fn side(self) -> Side {
        match self {
            Role::Client => Side::Client,
            Role::Server => Side::Server,
        }
    }
}

/// Events produced by the HTTP/3 connection for the application.
#[derive(Debug)]
pub enum H3Event {
    /// A complete, validated header block arrived on a request stream.
    HeadersReceived {
        stream_id: StreamId,
        headers: Vec<HeaderField>,
    },
    /// Body bytes, in order. `end_stream` marks the last event for the stream.
    DataReceived {
        stream_id: StreamId,
        data: Vec<u8>,
        end_stream: bool,
    },
    /// The stream failed and has been reset. Nothing more arrives for it.
    StreamError { stream_id: StreamId, error: H3Error },
    /// Peer sent GOAWAY; requests at or above `stream_id` will not be served.
    GoAway { stream_id: u64 },
    /// The connection failed with a protocol error and has been closed.
    ConnectionError(H3Error),
    /// The underlying QUIC connection is gone.
    Closed,
}

/// Internal connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum H3State {
    /// Waiting for peer's control stream + SETTINGS.
    Initializing,
    /// SETTINGS exchanged.
    Ready,
    /// GOAWAY sent or received.
    Closing,
    Closed,
}

/// What a peer-initiated unidirectional stream turned out to be.
#[derive(Debug)]
enum UniStream {
    /// Type varint not complete yet; holds the bytes seen so far.
    Pending(Vec<u8>),
    Control,
    /// QPACK or unknown stream: read and thrown away.
    Discard,
}

/// One HTTP/3 session over one QUIC connection.
///
/// Feed every QUIC event for the connection to
/// [`handle_transport_event`](Self::handle_transport_event) and act on the
/// returned events.
pub struct H3Connection {
    role: Role,
    state: H3State,
    local_settings: Settings,
    remote_settings: Option<Settings>,

    request_streams: HashMap<StreamId, RequestStream>,
    /// Highest peer-initiated bidirectional stream seen. Anything at or below
    /// it that is no longer tracked has already closed.
    max_peer_bidi: Option<u64>,
    /// GOAWAY identifier we sent, if any.
    goaway_sent: Option<u64>,

    uni_streams: HashMap<u64, UniStream>,
    /// Peer's control stream (unidirectional).
    control_stream_id: Option<StreamId>,
    /// Accumulates partial frame data on the peer's control stream.
    control_recv_buf: Vec<u8>,
    /// Payload bytes still to discard for an unknown control frame.
    control_skip: u64,
    /// Our control stream, opened when the connection is bound.
    our_control_stream: Option<StreamId>,
    control_out: Outbound,

    events: VecDeque<H3Event>,
    conn_id: Option<QuicConnId>,
    /// Read buffer for stream_recv calls (avoids repeated allocation).
    read_buf: Vec<u8>,
}

impl H3Connection {
    pub fn new(role: Role, settings: Settings) -> Self {
        Self {
            role,
            state: H3State::Initializing,
            local_settings: settings,
            remote_settings: None,
            request_streams: HashMap::new(),
            max_peer_bidi: None,
            goaway_sent: None,
            uni_streams: HashMap::new(),
            control_stream_id: None,
            control_recv_buf: Vec::new(),
            control_skip: 0,
            our_control_stream: None,
            control_out: Outbound::default(),
            events: VecDeque::new(),
            conn_id: None,
            read_buf: vec![0u8; READ_CHUNK],
        }
    }

    /// The QUIC connection this session is bound to, once established.
    pub fn conn_id(&self) -> Option<QuicConnId> {
        self.conn_id
    }

    /// Peer's SETTINGS, once its control stream has delivered them.
    pub fn remote_settings(&self) -> Option<&Settings> {
        self.remote_settings.as_ref()
    }

    /// GOAWAY was sent or received.
    pub fn is_going_away(&self) -> bool {
        self.state == H3State::Closing
    }

    pub fn is_closed(&self) -> bool {
        self.state == H3State::Closed
    }

    /// Bind the session to `conn`, open our control stream and send SETTINGS.
    ///
    /// Called automatically on `NewConnection` (server) or `Connected`
    /// (client). Binding twice is a no-op.
    pub fn bind<T: Transport>(&mut self, transport: &mut T, conn: QuicConnId) -> Result<(), H3Error> {
        if self.conn_id.is_some() {
            return Ok(());
        }
        self.conn_id = Some(conn);

        let stream = transport.open_uni(conn)?.ok_or(H3Error::StreamLimit)?;
        self.our_control_stream = Some(stream);

        let mut buf = Vec::new();
        frame::encode_varint(&mut buf, STREAM_TYPE_CONTROL);
        Frame::Settings(self.local_settings.clone()).encode(&mut buf);
        // The control stream is never finished: closing it is a connection
        // error (RFC 9114 Section 6.2.1).
        self.control_out.queue(&buf);
        self.control_out.flush(transport, conn, stream)?;
        Ok(())
    }

    /// Process one QUIC event and return the HTTP/3 events it produced.
    ///
    /// Events for other connections are ignored. An `Err` means the transport
    /// rejected an operation outright; protocol violations by the peer are
    /// reported as [`H3Event::ConnectionError`] or [`H3Event::StreamError`].
    pub fn handle_transport_event<T: Transport>(
        &mut self,
        transport: &mut T,
        event: &QuicEvent,
    ) -> Result<Vec<H3Event>, H3Error> {
        if let Some(conn) = self.conn_id
            && event.conn() != conn
        {
            return Ok(Vec::new());
        }
        if self.state != H3State::Closed {
            self.dispatch(transport, event)?;
        }
        Ok(self.events.drain(..).collect())
    }

    /// Open a new request stream (client only).
    pub fn open_request<T: Transport>(&mut self, transport: &mut T) -> Result<StreamId, H3Error> {
        if self.role != Role::Client {
            return Err(H3Error::Internal("servers do not open request streams".into()));
        }
        let conn = self.live_conn()?;
        if self.state == H3State::Closing {
            return Err(H3Error::GoingAway);
        }
        let stream = transport.open_bi(conn)?.ok_or(H3Error::StreamLimit)?;
        self.request_streams.insert(stream, RequestStream::new());
        Ok(stream)
    }

    /// Send a header block on a request stream.
    ///
    /// Each direction carries exactly one header block; `end_stream` finishes
    /// the send side immediately after it.
    pub fn send_headers<T: Transport>(
        &mut self,
        transport: &mut T,
        stream_id: StreamId,
        headers: &[HeaderField],
        end_stream: bool,
    ) -> Result<(), H3Error> {
        let conn = self.live_conn()?;
        if let Some(remote) = &self.remote_settings
            && qpack::field_section_size(headers) > remote.max_field_section_size
        {
            return Err(H3Error::MessageError("header block exceeds peer limit"));
        }
        let rs = self
            .request_streams
            .get_mut(&stream_id)
            .ok_or(H3Error::StreamClosed)?;
        match rs.send {
            SendState::Idle => {}
            SendState::Headers => return Err(H3Error::HeadersAlreadySent),
            SendState::Done => return Err(H3Error::StreamClosed),
        }

        let mut encoded = Vec::new();
        qpack::encode(headers, &mut encoded);
        let mut buf = Vec::new();
        Frame::Headers { encoded }.encode(&mut buf);
        rs.outbound.queue(&buf);
        rs.send = if end_stream {
            rs.outbound.finish();
            SendState::Done
        } else {
            SendState::Headers
        };
        self.flush_stream(transport, conn, stream_id)
    }

    /// Send body bytes on a request stream after its header block.
    ///
    /// Bytes the transport cannot take yet are buffered and written as the
    /// stream becomes writable.
    pub fn send_data<T: Transport>(
        &mut self,
        transport: &mut T,
        stream_id: StreamId,
        data: &[u8],
        end_stream: bool,
    ) -> Result<(), H3Error> {
        let conn = self.live_conn()?;
        let rs = self
            .request_streams
            .get_mut(&stream_id)
            .ok_or(H3Error::StreamClosed)?;
        match rs.send {
            SendState::Headers => {}
            SendState::Idle => return Err(H3Error::MessageError("DATA before HEADERS")),
            SendState::Done => return Err(H3Error::StreamClosed),
        }

        if !data.is_empty() {
            let mut header = Vec::with_capacity(16);
            frame::encode_data_header(&mut header, data.len());
            rs.outbound.queue(&header);
            rs.outbound.queue(data);
        }
        if end_stream {
            rs.outbound.finish();
            rs.send = SendState::Done;
        }
        self.flush_stream(transport, conn, stream_id)
    }

    /// Send GOAWAY on the control stream and stop accepting new requests.
    ///
    /// A server advertises the first request stream it will not serve;
    /// requests that arrive at or above it are rejected.
    pub fn send_goaway<T: Transport>(&mut self, transport: &mut T) -> Result<(), H3Error> {
        let conn = self.live_conn()?;
        let control = self.our_control_stream.ok_or(H3Error::NoConnection)?;

        let stream_id = match self.role {
            Role::Server => self.max_peer_bidi.map_or(0, |max| max + 4),
            // Clients carry a push ID here; no pushes are ever allowed.
            Role::Client => 0,
        };
        let mut buf = Vec::new();
        Frame::GoAway { stream_id }.encode(&mut buf);
        self.control_out.queue(&buf);
        self.control_out.flush(transport, conn, control)?;

        self.goaway_sent = Some(stream_id);
        self.state = H3State::Closing;
        Ok(())
    }

    // ── Event dispatch ──────────────────────────────────────────────

    fn dispatch<T: Transport>(&mut self, transport: &mut T, event: &QuicEvent) -> Result<(), H3Error> {
        match *event {
            QuicEvent::NewConnection(conn) if self.role == Role::Server => self.bind(transport, conn),
            QuicEvent::Connected(conn) if self.role == Role::Client => self.bind(transport, conn),
            QuicEvent::NewConnection(_) | QuicEvent::Connected(_) => Ok(()),
            QuicEvent::StreamOpened { conn, stream, bidi } => {
                // Data may have arrived in the same packet that opened the
                // stream; quinn-proto will not report it separately.
                if bidi {
                    self.on_peer_bidi(transport, conn, stream)
                } else {
                    self.read_uni_stream(transport, conn, stream)
                }
            }
            QuicEvent::StreamReadable { conn, stream } => self.on_readable(transport, conn, stream),
            QuicEvent::StreamWritable { conn, stream } => self.on_writable(transport, conn, stream),
            QuicEvent::StreamStopped { conn, stream, code } => {
                self.on_stopped(transport, conn, stream, code)
            }
            QuicEvent::StreamFinished { .. } => Ok(()),
            QuicEvent::ConnectionClosed { .. } => {
                self.state = H3State::Closed;
                self.events.push_back(H3Event::Closed);
                Ok(())
            }
        }
    }

    fn on_peer_bidi<T: Transport>(
        &mut self,
        transport: &mut T,
        conn: QuicConnId,
        stream: StreamId,
    ) -> Result<(), H3Error> {
        if self.role == Role::Client {
            // Servers never open bidirectional streams.
            self.connection_error(transport, conn, H3Error::StreamCreation);
            return Ok(());
        }
        let id = u64::from(stream);
        if self.max_peer_bidi.is_some_and(|max| id <= max) {
            // Seen before; either still tracked or already closed.
            if self.request_streams.contains_key(&stream) {
                return self.read_request_stream(transport, conn, stream);
            }
            return Ok(());
        }
        self.max_peer_bidi = Some(id);

        if let Some(limit) = self.goaway_sent
            && id >= limit
        {
            let _ = transport.stream_stop(conn, stream, code::H3_REQUEST_REJECTED);
            let _ = transport.stream_reset(conn, stream, code::H3_REQUEST_REJECTED);
            return Ok(());
        }

        self.request_streams.insert(stream, RequestStream::new());
        self.read_request_stream(transport, conn, stream)
    }

    fn on_readable<T: Transport>(
        &mut self,
        transport: &mut T,
        conn: QuicConnId,
        stream: StreamId,
    ) -> Result<(), H3Error> {
        if self.request_streams.contains_key(&stream) {
            return self.read_request_stream(transport, conn, stream);
        }
        if stream.initiator() == self.role.side() {
            // Ours and no longer tracked.
            return Ok(());
        }
        match stream.dir() {
            Dir::Uni => self.read_uni_stream(transport, conn, stream),
            Dir::Bi => self.on_peer_bidi(transport, conn, stream),
        }
    }

    fn on_writable<T: Transport>(
        &mut self,
        transport: &mut T,
        conn: QuicConnId,
        stream: StreamId,
    ) -> Result<(), H3Error> {
        if self.our_control_stream == Some(stream) {
            self.control_out.flush(transport, conn, stream)?;
            return Ok(());
        }
        self.flush_stream(transport, conn, stream)
    }

    fn on_stopped<T: Transport>(
        &mut self,
        transport: &mut T,
        conn: QuicConnId,
        stream: StreamId,
        error_code: u64,
    ) -> Result<(), H3Error> {
        if self.our_control_stream == Some(stream) {
            self.connection_error(transport, conn, H3Error::ClosedCriticalStream);
            return Ok(());
        }
        if let Some(rs) = self.request_streams.get_mut(&stream) {
            rs.outbound.discard();
            if rs.send != SendState::Done {
                let _ = transport.stream_reset(conn, stream, error_code);
                rs.send = SendState::Done;
            }
            self.reap(stream);
        }
        Ok(())
    }

    // ── Unidirectional streams ──────────────────────────────────────

    fn read_uni_stream<T: Transport>(
        &mut self,
        transport: &mut T,
        conn: QuicConnId,
        stream: StreamId,
    ) -> Result<(), H3Error> {
        let id = u64::from(stream);
        match self.uni_streams.get(&id) {
            Some(UniStream::Control) => return self.read_control_stream(transport, conn, stream),
            Some(UniStream::Discard) => {
                self.drain_stream(transport, conn, stream);
                return Ok(());
            }
            Some(UniStream::Pending(_)) | None => {}
        }

        // The type varint may straddle reads; keep what we have until it is
        // complete.
        let (n, fin) = match transport.stream_recv(conn, stream, &mut self.read_buf) {
            Ok(r) => r,
            Err(_) => {
                self.uni_streams.remove(&id);
                return Ok(());
            }
        };
        let entry = self
            .uni_streams
            .entry(id)
            .or_insert_with(|| UniStream::Pending(Vec::new()));
        let UniStream::Pending(pending) = entry else {
            return Ok(());
        };
        pending.extend_from_slice(&self.read_buf[..n]);
        let Some((stream_type, consumed)) = frame::decode_varint(pending) else {
            if fin {
                self.uni_streams.remove(&id);
            }
            return Ok(());
        };
        let rest = pending.split_off(consumed);

        match stream_type {
            STREAM_TYPE_CONTROL => {
                if self.control_stream_id.is_some() {
                    self.connection_error(transport, conn, H3Error::StreamCreation);
                    return Ok(());
                }
                self.control_stream_id = Some(stream);
                self.uni_streams.insert(id, UniStream::Control);
                self.control_recv_buf.extend_from_slice(&rest);
                if fin {
                    self.connection_error(transport, conn, H3Error::ClosedCriticalStream);
                    return Ok(());
                }
                self.read_control_stream(transport, conn, stream)
            }
            STREAM_TYPE_QPACK_ENCODER | STREAM_TYPE_QPACK_DECODER => {
                // No dynamic table is ever advertised, so these carry nothing
                // we need.
                self.uni_streams.insert(id, UniStream::Discard);
                self.drain_stream(transport, conn, stream);
                Ok(())
            }
            _ => {
                // Push streams are never permitted (no MAX_PUSH_ID is sent) and
                // unknown types must be ignored (RFC 9114 Section 6.2).
                self.uni_streams.insert(id, UniStream::Discard);
                let _ = transport.stream_stop(conn, stream, code::H3_STREAM_CREATION_ERROR);
                Ok(())
            }
        }
    }

    /// Read and throw away whatever is available on `stream`.
    fn drain_stream<T: Transport>(&mut self, transport: &mut T, conn: QuicConnId, stream: StreamId) {
        loop {
            match transport.stream_recv(conn, stream, &mut self.read_buf) {
                Ok((_, true)) | Err(_) => {
                    self.uni_streams.remove(&u64::from(stream));
                    return;
                }
                Ok((0, false)) => return,
                Ok(_) => {}
            }
        }
    }

    fn read_control_stream<T: Transport>(
        &mut self,
        transport: &mut T,
        conn: QuicConnId,
        stream: StreamId,
    ) -> Result<(), H3Error> {
        // Frames that arrived ahead of the buffered bytes still count.
        self.process_control_frames(transport, conn)?;
        while self.state != H3State::Closed {
            let closed = match transport.stream_recv(conn, stream, &mut self.read_buf) {
                Ok((n, fin)) => {
                    self.control_recv_buf.extend_from_slice(&self.read_buf[..n]);
                    self.process_control_frames(transport, conn)?;
                    if !fin && n == 0 {
                        break;
                    }
                    fin
                }
                Err(_) => true,
            };
            if closed && self.state != H3State::Closed {
                self.connection_error(transport, conn, H3Error::ClosedCriticalStream);
            }
        }
        Ok(())
    }

    fn process_control_frames<T: Transport>(
        &mut self,
        transport: &mut T,
        conn: QuicConnId,
    ) -> Result<(), H3Error> {
        while !self.control_recv_buf.is_empty() && self.state != H3State::Closed {
            if self.control_skip > 0 {
                let take = usize::try_from(self.control_skip)
                    .unwrap_or(usize::MAX)
                    .min(self.control_recv_buf.len());
                self.control_recv_buf.drain(..take);
                self.control_skip -= take as u64;
                continue;
            }

            let header = match frame::decode_frame_header(&self.control_recv_buf) {
                Ok(Some(header)) => header,
                Ok(None) => break,
                Err(e) => {
                    self.connection_error(transport, conn, e);
                    break;
                }
            };
            let first = self.remote_settings.is_none();
            if first && header.frame_type != frame::FRAME_SETTINGS {
                self.connection_error(transport, conn, H3Error::MissingSettings);
                break;
            }
            match header.frame_type {
                frame::FRAME_DATA | frame::FRAME_HEADERS | frame::FRAME_PUSH_PROMISE => {
                    self.connection_error(transport, conn, H3Error::FrameUnexpected);
                    break;
                }
                frame::FRAME_SETTINGS
                | frame::FRAME_GOAWAY
                | frame::FRAME_CANCEL_PUSH
                | frame::FRAME_MAX_PUSH_ID => {
                    if header.payload_len > MAX_CONTROL_PAYLOAD {
                        self.connection_error(transport, conn, H3Error::ExcessiveLoad);
                        break;
                    }
                    if !header.is_complete_in(&self.control_recv_buf) {
                        break;
                    }
                }
                _ => {
                    // Extension frames carry nothing for us; drop the payload
                    // as it arrives.
                    self.control_recv_buf.drain(..header.header_len);
                    self.control_skip = header.payload_len;
                    continue;
                }
            }

            let (frame, consumed) = match frame::decode_frame(&self.control_recv_buf) {
                Ok(Some(decoded)) => decoded,
                Ok(None) => break,
                Err(e) => {
                    self.connection_error(transport, conn, e);
                    break;
                }
            };
            self.control_recv_buf.drain(..consumed);

            match frame {
                Frame::Settings(settings) if first => {
                    self.remote_settings = Some(settings);
                    if self.state == H3State::Initializing {
                        self.state = H3State::Ready;
                    }
                }
                Frame::Settings(_) => self.connection_error(transport, conn, H3Error::FrameUnexpected),
                Frame::GoAway { stream_id } => self.on_goaway(transport, conn, stream_id),
                // CANCEL_PUSH and MAX_PUSH_ID mean nothing to a session that
                // never pushes.
                Frame::Unknown { .. } | Frame::Data { .. } | Frame::Headers { .. } => {}
            }
        }
        Ok(())
    }

    fn on_goaway<T: Transport>(&mut self, transport: &mut T, conn: QuicConnId, stream_id: u64) {
        if self.state != H3State::Closed {
            self.state = H3State::Closing;
        }
        self.events.push_back(H3Event::GoAway { stream_id });
        if self.role != Role::Client {
            return;
        }
        // Requests at or above the identifier will never be answered.
        let mut rejected: Vec<StreamId> = self
            .request_streams
            .iter()
            .filter(|(id, rs)| u64::from(**id) >= stream_id && rs.recv != RecvState::Done)
            .map(|(id, _)| *id)
            .collect();
        rejected.sort_unstable();
        for stream in rejected {
            self.stream_error(transport, conn, stream, H3Error::RequestRejected);
        }
    }

    // ── Request streams ─────────────────────────────────────────────

    fn read_request_stream<T: Transport>(
        &mut self,
        transport: &mut T,
        conn: QuicConnId,
        stream: StreamId,
    ) -> Result<(), H3Error> {
        // Frames are parsed after every read so skipped and DATA payloads
        // never pile up in the stream buffer.
        while self
            .request_streams
            .get(&stream)
            .is_some_and(|rs| rs.recv != RecvState::Done)
        {
            let (n, fin) = match transport.stream_recv(conn, stream, &mut self.read_buf) {
                Ok(read) => read,
                Err(e) => {
                    let error = match e.reset_code() {
                        Some(code) => H3Error::StreamReset(code),
                        None => H3Error::Quic(e),
                    };
                    self.stream_error(transport, conn, stream, error);
                    break;
                }
            };
            if let Some(rs) = self.request_streams.get_mut(&stream) {
                rs.recv_buf.extend_from_slice(&self.read_buf[..n]);
            }
            self.process_request_frames(transport, conn, stream, fin);
            if fin || n == 0 {
                break;
            }
        }
        Ok(())
    }

    /// Parse buffered frames on a request stream into events.
    fn process_request_frames<T: Transport>(
        &mut self,
        transport: &mut T,
        conn: QuicConnId,
        stream: StreamId,
        fin: bool,
    ) {
        let Some(rs) = self.request_streams.get_mut(&stream) else {
            return;
        };
        if rs.recv == RecvState::Done {
            return;
        }
        let mut buf = std::mem::take(&mut rs.recv_buf);
        let mut recv = rs.recv;
        let mut data_remaining = rs.data_remaining;
        let mut skip_remaining = rs.skip_remaining;
        let first_event = self.events.len();

        let mut offset = 0;
        let mut failure = None;
        while offset < buf.len() {
            let rest = &buf[offset..];
            if skip_remaining > 0 {
                let take = usize::try_from(skip_remaining)
                    .unwrap_or(usize::MAX)
                    .min(rest.len());
                offset += take;
                skip_remaining -= take as u64;
                continue;
            }
            if data_remaining > 0 {
                let take = usize::try_from(data_remaining)
                    .unwrap_or(usize::MAX)
                    .min(rest.len());
                self.events.push_back(H3Event::DataReceived {
                    stream_id: stream,
                    data: rest[..take].to_vec(),
                    end_stream: false,
                });
                offset += take;
                data_remaining -= take as u64;
                continue;
            }

            let header = match frame::decode_frame_header(rest) {
                Ok(Some(header)) => header,
                Ok(None) => break,
                Err(e) => {
                    failure = Some(e);
                    break;
                }
            };
            match header.frame_type {
                frame::FRAME_DATA => {
                    if recv != RecvState::Body {
                        failure = Some(H3Error::FrameUnexpected);
                        break;
                    }
                    offset += header.header_len;
                    data_remaining = header.payload_len;
                }
                frame::FRAME_HEADERS => {
                    if recv != RecvState::AwaitingHeaders {
                        // Trailers are not supported; a second block is an error.
                        failure = Some(H3Error::FrameUnexpected);
                        break;
                    }
                    if header.payload_len > self.local_settings.max_field_section_size {
                        failure = Some(H3Error::MessageError("header block too large"));
                        break;
                    }
                    if !header.is_complete_in(rest) {
                        break;
                    }
                    let block = &rest[header.header_len..header.frame_len()];
                    offset += header.frame_len();
                    match self.validate_header_block(block) {
                        Ok(headers) => {
                            recv = RecvState::Body;
                            self.events.push_back(H3Event::HeadersReceived {
                                stream_id: stream,
                                headers,
                            });
                        }
                        Err(e) => {
                            failure = Some(e);
                            break;
                        }
                    }
                }
                frame::FRAME_SETTINGS
                | frame::FRAME_GOAWAY
                | frame::FRAME_CANCEL_PUSH
                | frame::FRAME_MAX_PUSH_ID
                | frame::FRAME_PUSH_PROMISE => {
                    failure = Some(H3Error::FrameUnexpected);
                    break;
                }
                _ => {
                    // Unknown frame types are skipped (RFC 9114 Section 9);
                    // the payload is dropped as it arrives.
                    offset += header.header_len;
                    skip_remaining = header.payload_len;
                }
            }
        }

        if failure.is_none() && fin {
            if offset < buf.len() || data_remaining > 0 || skip_remaining > 0 {
                failure = Some(H3Error::FrameError);
            } else if recv == RecvState::AwaitingHeaders {
                failure = Some(H3Error::RequestIncomplete);
            }
        }
        if let Some(error) = failure {
            self.stream_error(transport, conn, stream, error);
            return;
        }

        if fin {
            recv = RecvState::Done;
            let pushed = self.events.len() > first_event;
            match self.events.back_mut() {
                Some(H3Event::DataReceived { end_stream, .. }) if pushed => *end_stream = true,
                _ => self.events.push_back(H3Event::DataReceived {
                    stream_id: stream,
                    data: Vec::new(),
                    end_stream: true,
                }),
            }
        }

        if let Some(rs) = self.request_streams.get_mut(&stream) {
            if fin {
                buf = Vec::new();
            } else {
                buf.drain(..offset);
            }
            rs.recv_buf = buf;
            rs.recv = recv;
            rs.data_remaining = data_remaining;
            rs.skip_remaining = skip_remaining;
        }
        self.reap(stream);
    }

    /// Decode a header block and check it forms a valid message for our role.
    fn validate_header_block(&self, block: &[u8]) -> Result<Vec<HeaderField>, H3Error> {
        let headers = qpack::decode(block)?;
        if qpack::field_section_size(&headers) > self.local_settings.max_field_section_size {
            return Err(H3Error::MessageError("header block too large"));
        }
        let mut regular_seen = false;
        for field in &headers {
            if !field.is_pseudo() {
                regular_seen = true;
            } else if regular_seen {
                return Err(H3Error::MessageError("pseudo-header after regular field"));
            }
        }
        match self.role {
            Role::Client if qpack::find(&headers, b":status").is_none() => {
                Err(H3Error::MessageError("response without :status"))
            }
            Role::Server if qpack::find(&headers, b":method").is_none() => {
                Err(H3Error::MessageError("request without :method"))
            }
            _ => Ok(headers),
        }
    }

    // ── Internal helpers ────────────────────────────────────────────

    fn live_conn(&self) -> Result<QuicConnId, H3Error> {
        match self.conn_id {
            Some(conn) if self.state != H3State::Closed => Ok(conn),
            _ => Err(H3Error::NoConnection),
        }
    }

    fn flush_stream<T: Transport>(
        &mut self,
        transport: &mut T,
        conn: QuicConnId,
        stream: StreamId,
    ) -> Result<(), H3Error> {
        let Some(rs) = self.request_streams.get_mut(&stream) else {
            return Ok(());
        };
        if rs.outbound.flush(transport, conn, stream)?.is_some() {
            rs.send = SendState::Done;
        }
        self.reap(stream);
        Ok(())
    }

    /// Fail one request stream: reset what we still send, stop what we
    /// still read, and report it once.
    fn stream_error<T: Transport>(
        &mut self,
        transport: &mut T,
        conn: QuicConnId,
        stream: StreamId,
        error: H3Error,
    ) {
        let code = error.code();
        if let Some(rs) = self.request_streams.get_mut(&stream) {
            if rs.recv != RecvState::Done && !matches!(error, H3Error::StreamReset(_)) {
                let _ = transport.stream_stop(conn, stream, code);
            }
            if rs.send != SendState::Done || !rs.outbound.is_drained() {
                let _ = transport.stream_reset(conn, stream, code);
            }
            rs.recv = RecvState::Done;
            rs.send = SendState::Done;
            rs.recv_buf = Vec::new();
            rs.data_remaining = 0;
            rs.skip_remaining = 0;
            rs.outbound.discard();
        }
        self.events.push_back(H3Event::StreamError {
            stream_id: stream,
            error,
        });
        self.reap(stream);
    }

    /// Close the whole connection with the error's code and report it.
    fn connection_error<T: Transport>(&mut self, transport: &mut T, conn: QuicConnId, error: H3Error) {
        let code = u32::try_from(error.code()).unwrap_or(u32::MAX);
        transport.close_connection(conn, code, error.to_string().as_bytes());
        self.state = H3State::Closed;
        self.request_streams.clear();
        self.events.push_back(H3Event::ConnectionError(error));
    }

    /// Forget a request stream once both directions are finished.
    fn reap(&mut self, stream: StreamId) {
        if self
            .request_streams
            .get(&stream)
            .is_some_and(RequestStream::is_closed)
        {
            self.request_streams.remove(&stream);
        }
    }
}

#[cfg(test)]
mod tests {
    use quicweb_quic::Error;

    use super::*;

    const CONN: QuicConnId = QuicConnId::new(0);
    const EXTENSION_FRAME: u64 = 0x21;
    const GIB: u64 = 1 << 30;

    /// Hands out queued reads per stream and swallows everything written.
    #[derive(Default)]
    struct Scripted {
        reads: HashMap<StreamId, VecDeque<(Vec<u8>, bool)>>,
        next_uni: u64,
        closed_with: Option<u32>,
    }

    impl Scripted {
        fn push(&mut self, stream: StreamId, bytes: Vec<u8>, fin: bool) {
            self.reads.entry(stream).or_default().push_back((bytes, fin));
        }
    }

    impl Transport for Scripted {
        fn open_bi(&mut self, _: QuicConnId) -> Result<Option<StreamId>, Error> {
            Ok(None)
        }

        fn open_uni(&mut self, _: QuicConnId) -> Result<Option<StreamId>, Error> {
            let stream = StreamId::new(Side::Server, Dir::Uni, self.next_uni);
            self.next_uni += 1;
            Ok(Some(stream))
        }

        fn stream_send(&mut self, _: QuicConnId, _: StreamId, data: &[u8]) -> Result<usize, Error> {
            Ok(data.len())
        }

        fn stream_recv(
            &mut self,
            _: QuicConnId,
            stream: StreamId,
            buf: &mut [u8],
        ) -> Result<(usize, bool), Error> {
            let Some((bytes, fin)) = self.reads.get_mut(&stream).and_then(VecDeque::pop_front)
            else {
                return Ok((0, false));
            };
            buf[..bytes.len()].copy_from_slice(&bytes);
            Ok((bytes.len(), fin))
        }

        fn stream_finish(&mut self, _: QuicConnId, _: StreamId) -> Result<(), Error> {
            Ok(())
        }

        fn stream_reset(&mut self, _: QuicConnId, _: StreamId, _: u64) -> Result<(), Error> {
            Ok(())
        }

        fn stream_stop(&mut self, _: QuicConnId, _: StreamId, _: u64) -> Result<(), Error> {
            Ok(())
        }

        fn close_connection(&mut self, _: QuicConnId, code: u32, _: &[u8]) {
            self.closed_with = Some(code);
        }
    }

    fn server() -> (H3Connection, Scripted) {
        let mut transport = Scripted::default();
        let mut h3 = H3Connection::new(Role::Server, Settings::default());
        h3.handle_transport_event(&mut transport, &QuicEvent::NewConnection(CONN))
            .unwrap();
        (h3, transport)
    }

    fn request_headers() -> Vec<u8> {
        let mut encoded = Vec::new();
        qpack::encode(
            &[
                HeaderField::new(":method", "GET"),
                HeaderField::new(":scheme", "https"),
                HeaderField::new(":authority", "localhost"),
                HeaderField::new(":path", "/"),
            ],
            &mut encoded,
        );
        let mut buf = Vec::new();
        Frame::Headers { encoded }.encode(&mut buf);
        buf
    }

    fn control_preamble() -> Vec<u8> {
        let mut buf = Vec::new();
        frame::encode_varint(&mut buf, STREAM_TYPE_CONTROL);
        Frame::Settings(Settings::default()).encode(&mut buf);
        buf
    }

    fn readable(stream: StreamId) -> QuicEvent {
        QuicEvent::StreamReadable { conn: CONN, stream }
    }

    #[test]
    fn large_unknown_frame_on_request_stream_is_not_buffered() {
        let (mut h3, mut transport) = server();
        let stream = StreamId::new(Side::Client, Dir::Bi, 0);

        let mut first = request_headers();
        frame::encode_frame_header(&mut first, EXTENSION_FRAME, GIB);
        transport.push(stream, first, false);
        let opened = QuicEvent::StreamOpened {
            conn: CONN,
            stream,
            bidi: true,
        };
        let events = h3.handle_transport_event(&mut transport, &opened).unwrap();
        assert!(matches!(events[..], [H3Event::HeadersReceived { .. }]));

        let chunk = vec![0xaa; READ_CHUNK];
        for _ in 0..256 {
            transport.push(stream, chunk.clone(), false);
            let events = h3
                .handle_transport_event(&mut transport, &readable(stream))
                .unwrap();
            assert!(events.is_empty());
            let rs = &h3.request_streams[&stream];
            assert!(rs.recv_buf.len() < READ_CHUNK, "buffered {}", rs.recv_buf.len());
        }
        assert_eq!(
            h3.request_streams[&stream].skip_remaining,
            GIB - 256 * READ_CHUNK as u64
        );
    }

    #[test]
    fn data_after_split_unknown_frame_is_delivered() {
        let (mut h3, mut transport) = server();
        let stream = StreamId::new(Side::Client, Dir::Bi, 0);

        let mut first = request_headers();
        frame::encode_frame_header(&mut first, EXTENSION_FRAME, 10);
        first.extend_from_slice(b"0123");
        transport.push(stream, first, false);
        let mut rest = b"456789".to_vec();
        frame::encode_data_header(&mut rest, 2);
        rest.extend_from_slice(b"hi");
        transport.push(stream, rest, true);

        let events = h3
            .handle_transport_event(&mut transport, &readable(stream))
            .unwrap();
        match &events[..] {
            [
                H3Event::HeadersReceived { .. },
                H3Event::DataReceived {
                    data, end_stream, ..
                },
            ] => {
                assert_eq!(data, b"hi");
                assert!(end_stream);
            }
            other => panic!("unexpected events {other:?}"),
        }
    }

    #[test]
    fn fin_inside_unknown_frame_is_frame_error() {
        let (mut h3, mut transport) = server();
        let stream = StreamId::new(Side::Client, Dir::Bi, 0);

        let mut bytes = request_headers();
        frame::encode_frame_header(&mut bytes, EXTENSION_FRAME, 10);
        bytes.extend_from_slice(b"012");
        transport.push(stream, bytes, true);

        let events = h3
            .handle_transport_event(&mut transport, &readable(stream))
            .unwrap();
        assert!(matches!(
            events.last(),
            Some(H3Event::StreamError {
                error: H3Error::FrameError,
                ..
            })
        ));
    }

    #[test]
    fn large_unknown_frame_on_control_stream_is_not_buffered() {
        let (mut h3, mut transport) = server();
        let control = StreamId::new(Side::Client, Dir::Uni, 0);

        let mut first = control_preamble();
        frame::encode_frame_header(&mut first, EXTENSION_FRAME, GIB);
        transport.push(control, first, false);
        h3.handle_transport_event(&mut transport, &readable(control))
            .unwrap();
        assert!(h3.remote_settings().is_some());

        let chunk = vec![0x55; READ_CHUNK];
        for _ in 0..64 {
            transport.push(control, chunk.clone(), false);
        }
        let events = h3
            .handle_transport_event(&mut transport, &readable(control))
            .unwrap();
        assert!(events.is_empty());
        assert!(h3.control_recv_buf.len() < READ_CHUNK);
        assert!(!h3.is_closed());
        assert_eq!(h3.control_skip, GIB - 64 * READ_CHUNK as u64);
    }

    #[test]
    fn goaway_after_unknown_control_frame_is_seen() {
        let (mut h3, mut transport) = server();
        let control = StreamId::new(Side::Client, Dir::Uni, 0);

        let mut first = control_preamble();
        frame::encode_frame_header(&mut first, EXTENSION_FRAME, 6);
        first.extend_from_slice(b"abc");
        transport.push(control, first, false);
        let mut rest = b"def".to_vec();
        Frame::GoAway { stream_id: 4 }.encode(&mut rest);
        transport.push(control, rest, false);

        let events = h3
            .handle_transport_event(&mut transport, &readable(control))
            .unwrap();
        assert!(matches!(events[..], [H3Event::GoAway { stream_id: 4 }]));
        assert!(h3.control_recv_buf.is_empty());
    }

    #[test]
    fn oversized_settings_frame_is_excessive_load() {
        let (mut h3, mut transport) = server();
        let control = StreamId::new(Side::Client, Dir::Uni, 0);

        let mut bytes = Vec::new();
        frame::encode_varint(&mut bytes, STREAM_TYPE_CONTROL);
        frame::encode_frame_header(&mut bytes, frame::FRAME_SETTINGS, GIB);
        transport.push(control, bytes, false);

        let events = h3
            .handle_transport_event(&mut transport, &readable(control))
            .unwrap();
        assert!(matches!(
            events[..],
            [H3Event::ConnectionError(H3Error::ExcessiveLoad)]
        ));
        assert_eq!(
            transport.closed_with,
            Some(code::H3_EXCESSIVE_LOAD as u32)
        );
    }
}
