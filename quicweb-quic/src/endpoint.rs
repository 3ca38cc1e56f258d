use std::collections::VecDeque;
use std::net::SocketAddr;
use std::time::Instant;

use bytes::{Bytes, BytesMut};
use quinn_proto::crypto::rustls::HandshakeData;
use quinn_proto::{
    ClientConfig, ConnectionHandle, DatagramEvent, Dir, Event, ReadError, StreamEvent, StreamId,
    VarInt,
};
use slab::Slab;

use crate::config::QuicConfig;
use crate::error::Error;
use crate::event::{QuicConnId, QuicEvent};

/// A sans-IO QUIC endpoint.
///
/// Wraps [`quinn_proto::Endpoint`] and every connection it owns. No sockets
/// and no clock: the caller feeds datagrams and the current time in, and
/// takes events and datagrams out.
///
/// A driver loop looks like:
///
/// 1. [`handle_datagram`](Self::handle_datagram) for each received datagram.
/// 2. [`drive_timers`](Self::drive_timers) when [`next_timeout`](Self::next_timeout) passes.
/// 3. [`poll_event`](Self::poll_event) until empty, reacting with stream calls.
/// 4. [`flush`](Self::flush), then [`poll_send`](Self::poll_send) until empty.
pub struct QuicEndpoint {
    endpoint: quinn_proto::Endpoint,
    slots: Slab<Slot>,
    /// Indexed by `ConnectionHandle.0`; holds the slab key.
    by_handle: Vec<Option<usize>>,
    events: VecDeque<QuicEvent>,
    outgoing: VecDeque<(SocketAddr, Vec<u8>)>,
    outgoing_limit: usize,
    scratch: Vec<u8>,
    local_addr: SocketAddr,
    client_config: Option<ClientConfig>,
}

struct Slot {
    handle: ConnectionHandle,
    conn: quinn_proto::Connection,
    /// We dialed this connection.
    dialed: bool,
    established: bool,
}

impl QuicEndpoint {
    /// `local_addr` is the address of the socket the caller reads from.
    pub fn new(config: QuicConfig, local_addr: SocketAddr) -> Self {
        Self {
            endpoint: quinn_proto::Endpoint::new(
                config.endpoint_config,
                config.server_config,
                config.allow_mtud,
                config.rng_seed,
            ),
            slots: Slab::new(),
            by_handle: Vec::new(),
            events: VecDeque::new(),
            outgoing: VecDeque::new(),
            outgoing_limit: config.send_queue_capacity,
            scratch: Vec::with_capacity(1500),
            local_addr,
            client_config: config.client_config,
        }
    }

    /// Feed one received UDP datagram.
    pub fn handle_datagram(&mut self, now: Instant, data: &[u8], peer: SocketAddr) {
        self.scratch.clear();
        let event = self.endpoint.handle(
            now,
            peer,
            Some(self.local_addr.ip()),
            None,
            BytesMut::from(data),
            &mut self.scratch,
        );
        let Some(event) = event else {
            return;
        };

        match event {
            DatagramEvent::ConnectionEvent(handle, event) => {
                if let Some(key) = self.key_for(handle) {
                    self.slots[key].conn.handle_event(event);
                    self.service(key, now);
                }
            }
            DatagramEvent::NewConnection(incoming) => {
                match self.endpoint.accept(incoming, now, &mut self.scratch, None) {
                    Ok((handle, conn)) => {
                        let key = self.insert(handle, conn, false);
                        self.service(key, now);
                    }
                    // Refused; quinn may still want to tell the peer.
                    Err(refused) => {
                        if let Some(transmit) = refused.response {
                            let packet = self.scratch[..transmit.size].to_vec();
                            self.enqueue(transmit.destination, packet);
                        }
                    }
                }
            }
            // Version negotiation, retry and stateless resets.
            DatagramEvent::Response(transmit) => {
                let packet = self.scratch[..transmit.size].to_vec();
                self.enqueue(transmit.destination, packet);
            }
        }
    }

    /// Run every connection timer that is due at `now`.
    pub fn drive_timers(&mut self, now: Instant) {
        for key in self.keys() {
            let Some(slot) = self.slots.get_mut(key) else {
                continue;
            };
            if slot.conn.poll_timeout().is_some_and(|at| at <= now) {
                slot.conn.handle_timeout(now);
                self.service(key, now);
            }
        }
    }

    /// Earliest timer deadline across all connections.
    pub fn next_timeout(&mut self) -> Option<Instant> {
        self.slots
            .iter_mut()
            .filter_map(|(_, slot)| slot.conn.poll_timeout())
            .min()
    }

    /// Packetize buffered stream writes on every connection.
    ///
    /// Writes only queue data inside quinn-proto; call this after a batch of
    /// them and before draining [`poll_send`](Self::poll_send).
    pub fn flush(&mut self, now: Instant) {
        for key in self.keys() {
            if self.slots.contains(key) {
                self.service(key, now);
            }
        }
    }

    pub fn poll_event(&mut self) -> Option<QuicEvent> {
        self.events.pop_front()
    }

    /// Next datagram to put on the wire, with its destination.
    pub fn poll_send(&mut self) -> Option<(SocketAddr, Vec<u8>)> {
        self.outgoing.pop_front()
    }

    /// Start a handshake with `peer`.
    ///
    /// The returned id shows up again in [`QuicEvent::Connected`] once the
    /// handshake completes.
    pub fn connect(
        &mut self,
        now: Instant,
        peer: SocketAddr,
        server_name: &str,
    ) -> Result<QuicConnId, Error> {
        let config = self.client_config.clone().ok_or(Error::NoClientConfig)?;
        let (handle, conn) = self.endpoint.connect(now, config, peer, server_name)?;
        let key = self.insert(handle, conn, true);
        self.transmit(key, now);
        Ok(QuicConnId(key as u32))
    }

    /// Write as much of `data` as flow control allows.
    pub fn stream_send(
        &mut self,
        conn: QuicConnId,
        stream: StreamId,
        data: &[u8],
    ) -> Result<usize, Error> {
        let slot = self.slot(conn)?;
        Ok(slot.conn.send_stream(stream).write(data)?)
    }

    /// Copy readable bytes into `buf`.
    ///
    /// Returns `(bytes_read, fin)`; `fin` is set once the peer's FIN has been
    /// reached and everything before it read.
    pub fn stream_recv(
        &mut self,
        conn: QuicConnId,
        stream: StreamId,
        buf: &mut [u8],
    ) -> Result<(usize, bool), Error> {
        let slot = self.slot(conn)?;
        let mut recv = slot.conn.recv_stream(stream);
        let mut chunks = recv.read(true)?;

        let mut filled = 0;
        let result = loop {
            if filled == buf.len() {
                break Ok(false);
            }
            match chunks.next(buf.len() - filled) {
                Ok(Some(chunk)) => {
                    let end = filled + chunk.bytes.len();
                    buf[filled..end].copy_from_slice(&chunk.bytes);
                    filled = end;
                }
                Ok(None) => break Ok(true),
                Err(ReadError::Blocked) => break Ok(false),
                Err(e) => break Err(Error::Read(e)),
            }
        };
        // Returns flow-control credit to the peer; whether the connection
        // needs to transmit is picked up by the next flush.
        let _ = chunks.finalize();
        result.map(|fin| (filled, fin))
    }

    /// Queue FIN on the send side.
    pub fn stream_finish(&mut self, conn: QuicConnId, stream: StreamId) -> Result<(), Error> {
        let slot = self.slot(conn)?;
        slot.conn
            .send_stream(stream)
            .finish()
            .map_err(|_| Error::ClosedStream)
    }

    /// Abandon the send side with an application error code.
    pub fn stream_reset(
        &mut self,
        conn: QuicConnId,
        stream: StreamId,
        code: u64,
    ) -> Result<(), Error> {
        let slot = self.slot(conn)?;
        slot.conn
            .send_stream(stream)
            .reset(varint(code))
            .map_err(|_| Error::ClosedStream)
    }

    /// Ask the peer to stop sending; unread data is discarded.
    pub fn stream_stop(
        &mut self,
        conn: QuicConnId,
        stream: StreamId,
        code: u64,
    ) -> Result<(), Error> {
        let slot = self.slot(conn)?;
        slot.conn
            .recv_stream(stream)
            .stop(varint(code))
            .map_err(|_| Error::ClosedStream)
    }

    /// `None` when the peer's concurrency limit is reached.
    pub fn open_bi(&mut self, conn: QuicConnId) -> Result<Option<StreamId>, Error> {
        Ok(self.slot(conn)?.conn.streams().open(Dir::Bi))
    }

    /// `None` when the peer's concurrency limit is reached.
    pub fn open_uni(&mut self, conn: QuicConnId) -> Result<Option<StreamId>, Error> {
        Ok(self.slot(conn)?.conn.streams().open(Dir::Uni))
    }

    /// Close one connection with an application error code and reason.
    pub fn close_connection(&mut self, conn: QuicConnId, code: u32, reason: &[u8]) {
        if let Ok(slot) = self.slot(conn) {
            slot.conn
                .close(Instant::now(), VarInt::from_u32(code), Bytes::copy_from_slice(reason));
        }
    }

    /// Close every connection and queue the CONNECTION_CLOSE packets.
    pub fn close_all(&mut self, code: u32, reason: &[u8]) {
        let now = Instant::now();
        let reason = Bytes::copy_from_slice(reason);
        for key in self.keys() {
            self.slots[key]
                .conn
                .close(now, VarInt::from_u32(code), reason.clone());
            self.transmit(key, now);
        }
    }

    pub fn is_established(&self, conn: QuicConnId) -> bool {
        self.slots
            .get(conn.index())
            .is_some_and(|slot| slot.established)
    }

    /// ALPN protocol agreed during the handshake.
    pub fn negotiated_protocol(&self, conn: QuicConnId) -> Option<Vec<u8>> {
        let slot = self.slots.get(conn.index())?;
        let data = slot.conn.crypto_session().handshake_data()?;
        data.downcast::<HandshakeData>().ok()?.protocol
    }

    pub fn connection_count(&self) -> usize {
        self.slots.len()
    }

    pub fn remote_addr(&self, conn: QuicConnId) -> Option<SocketAddr> {
        self.slots
            .get(conn.index())
            .map(|slot| slot.conn.remote_address())
    }

    // ── Internals ───────────────────────────────────────────────────

    fn keys(&self) -> Vec<usize> {
        self.slots.iter().map(|(key, _)| key).collect()
    }

    fn key_for(&self, handle: ConnectionHandle) -> Option<usize> {
        self.by_handle.get(handle.0).copied().flatten()
    }

    fn slot(&mut self, conn: QuicConnId) -> Result<&mut Slot, Error> {
        self.slots
            .get_mut(conn.index())
            .ok_or(Error::InvalidConnection)
    }

    fn insert(&mut self, handle: ConnectionHandle, conn: quinn_proto::Connection, dialed: bool) -> usize {
        let key = self.slots.insert(Slot {
            handle,
            conn,
            dialed,
            established: false,
        });
        if handle.0 >= self.by_handle.len() {
            self.by_handle.resize(handle.0 + 1, None);
        }
        self.by_handle[handle.0] = Some(key);
        key
    }

    fn remove(&mut self, key: usize) {
        let slot = self.slots.remove(key);
        if let Some(entry) = self.by_handle.get_mut(slot.handle.0) {
            *entry = None;
        }
    }

    /// Move everything a connection wants to send into the outgoing queue.
    fn transmit(&mut self, key: usize, now: Instant) {
        loop {
            self.scratch.clear();
            let Some(transmit) = self.slots[key].conn.poll_transmit(now, 1, &mut self.scratch)
            else {
                return;
            };
            let packet = self.scratch[..transmit.size].to_vec();
            self.enqueue(transmit.destination, packet);
        }
    }

    /// Bring one connection up to date: endpoint bookkeeping, transmits and
    /// application events. Drops the connection once it has fully drained.
    fn service(&mut self, key: usize, now: Instant) {
        let handle = self.slots[key].handle;
        while let Some(update) = self.slots[key].conn.poll_endpoint_events() {
            if let Some(reply) = self.endpoint.handle_event(handle, update) {
                self.slots[key].conn.handle_event(reply);
            }
        }
        self.transmit(key, now);

        let id = QuicConnId(key as u32);
        while let Some(event) = self.slots[key].conn.poll() {
            match event {
                Event::Connected => {
                    let slot = &mut self.slots[key];
                    slot.established = true;
                    self.events.push_back(if slot.dialed {
                        QuicEvent::Connected(id)
                    } else {
                        QuicEvent::NewConnection(id)
                    });
                }
                Event::ConnectionLost { reason } => {
                    self.events
                        .push_back(QuicEvent::ConnectionClosed { conn: id, reason });
                    self.remove(key);
                    return;
                }
                Event::Stream(StreamEvent::Opened { dir }) => {
                    while let Some(stream) = self.slots[key].conn.streams().accept(dir) {
                        self.events.push_back(QuicEvent::StreamOpened {
                            conn: id,
                            stream,
                            bidi: dir == Dir::Bi,
                        });
                    }
                }
                Event::Stream(event) => {
                    if let Some(event) = stream_event(id, event) {
                        self.events.push_back(event);
                    }
                }
                Event::HandshakeDataReady | Event::DatagramReceived | Event::DatagramsUnblocked => {}
            }
        }
        self.transmit(key, now);

        if self.slots[key].conn.is_drained() {
            self.remove(key);
        }
    }

    fn enqueue(&mut self, destination: SocketAddr, packet: Vec<u8>) {
        // Past the limit packets are dropped and recovered as loss.
        if self.outgoing.len() < self.outgoing_limit {
            self.outgoing.push_back((destination, packet));
        }
    }
}

fn stream_event(conn: QuicConnId, event: StreamEvent) -> Option<QuicEvent> {
    Some(match event {
        StreamEvent::Readable { id } => QuicEvent::StreamReadable { conn, stream: id },
        StreamEvent::Writable { id } => QuicEvent::StreamWritable { conn, stream: id },
        StreamEvent::Finished { id } => QuicEvent::StreamFinished { conn, stream: id },
        StreamEvent::Stopped { id, error_code } => QuicEvent::StreamStopped {
            conn,
            stream: id,
            code: error_code.into_inner(),
        },
        StreamEvent::Opened { .. } | StreamEvent::Available { .. } => return None,
    })
}

fn varint(code: u64) -> VarInt {
    VarInt::from_u64(code).unwrap_or(VarInt::MAX)
}
