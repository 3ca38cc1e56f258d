//! Integration tests: two `QuicEndpoint`s exchanging datagrams in memory.
//!
//! No sockets are involved: packets drained from one endpoint's `poll_send()`
//! are fed straight into the other's `handle_datagram()`.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use quicweb_quic::{QuicConfig, QuicConnId, QuicEndpoint, QuicEvent, TransportSettings};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};

// ── TLS cert generation ──────────────────────────────────────────────

fn generate_self_signed() -> (Vec<CertificateDer<'static>>, PrivateKeyDer<'static>) {
    let cert = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
    let key = PrivatePkcs8KeyDer::from(cert.key_pair.serialize_der());
    let cert_der = CertificateDer::from(cert.cert);
    (vec![cert_der], key.into())
}

fn provider() -> Arc<rustls::crypto::CryptoProvider> {
    Arc::new(rustls::crypto::ring::default_provider())
}

fn server_tls(
    certs: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
) -> rustls::ServerConfig {
    rustls::ServerConfig::builder_with_provider(provider())
        .with_protocol_versions(&[&rustls::version::TLS13])
        .unwrap()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .unwrap()
}

fn client_tls(certs: &[CertificateDer<'static>]) -> rustls::ClientConfig {
    let mut roots = rustls::RootCertStore::empty();
    for cert in certs {
        roots.add(cert.clone()).unwrap();
    }
    rustls::ClientConfig::builder_with_provider(provider())
        .with_protocol_versions(&[&rustls::version::TLS13])
        .unwrap()
        .with_root_certificates(roots)
        .with_no_client_auth()
}

// ── In-memory pair ───────────────────────────────────────────────────

const CLIENT_ADDR: &str = "127.0.0.1:50000";
const SERVER_ADDR: &str = "127.0.0.1:4433";

struct Pair {
    client: QuicEndpoint,
    server: QuicEndpoint,
    client_addr: SocketAddr,
    server_addr: SocketAddr,
}

impl Pair {
    fn new(server_alpn: &[&[u8]], client_alpn: &[&[u8]]) -> Self {
        let (certs, key) = generate_self_signed();
        let settings = TransportSettings::default();
        let client_addr: SocketAddr = CLIENT_ADDR.parse().unwrap();
        let server_addr: SocketAddr = SERVER_ADDR.parse().unwrap();

        let server_cfg =
            QuicConfig::server(server_tls(certs.clone(), key), server_alpn, &settings)
                .expect("server config");
        let client_cfg =
            QuicConfig::client(client_tls(&certs), client_alpn, &settings).expect("client config");

        Pair {
            client: QuicEndpoint::new(client_cfg, client_addr),
            server: QuicEndpoint::new(server_cfg, server_addr),
            client_addr,
            server_addr,
        }
    }

    /// Move every queued datagram to its peer. Returns whether anything moved.
    fn pump(&mut self) -> bool {
        let now = Instant::now();
        self.client.flush(now);
        self.server.flush(now);
        self.client.drive_timers(now);
        self.server.drive_timers(now);

        let mut moved = false;
        while let Some((dest, data)) = self.client.poll_send() {
            assert_eq!(dest, self.server_addr);
            self.server.handle_datagram(now, &data, self.client_addr);
            moved = true;
        }
        while let Some((dest, data)) = self.server.poll_send() {
            assert_eq!(dest, self.client_addr);
            self.client.handle_datagram(now, &data, self.server_addr);
            moved = true;
        }
        moved
    }

    fn pump_until_idle(&mut self) {
        for _ in 0..100 {
            if !self.pump() {
                return;
            }
        }
    }

    fn connect(&mut self) -> (QuicConnId, QuicConnId) {
        let client_conn = self
            .client
            .connect(Instant::now(), self.server_addr, "localhost")
            .expect("connect");
        self.pump_until_idle();

        let mut connected = false;
        while let Some(event) = self.client.poll_event() {
            if let QuicEvent::Connected(conn) = event {
                assert_eq!(conn, client_conn);
                connected = true;
            }
        }
        assert!(connected, "client never saw Connected");

        let mut server_conn = None;
        while let Some(event) = self.server.poll_event() {
            if let QuicEvent::NewConnection(conn) = event {
                server_conn = Some(conn);
            }
        }
        (client_conn, server_conn.expect("server never saw NewConnection"))
    }
}

// ── Tests ────────────────────────────────────────────────────────────

#[test]
fn handshake_negotiates_h3() {
    let mut pair = Pair::new(&[b"h3"], &[b"h3"]);
    let (client_conn, server_conn) = pair.connect();

    assert!(pair.client.is_established(client_conn));
    assert!(pair.server.is_established(server_conn));
    assert_eq!(pair.client.negotiated_protocol(client_conn).as_deref(), Some(&b"h3"[..]));
    assert_eq!(pair.server.negotiated_protocol(server_conn).as_deref(), Some(&b"h3"[..]));
    assert_eq!(pair.server.connection_count(), 1);
}

#[test]
fn alpn_mismatch_fails_handshake() {
    let mut pair = Pair::new(&[b"h3"], &[b"hq-interop"]);
    let conn = pair
        .client
        .connect(Instant::now(), pair.server_addr, "localhost")
        .unwrap();
    pair.pump_until_idle();

    let mut closed = false;
    while let Some(event) = pair.client.poll_event() {
        match event {
            QuicEvent::Connected(_) => panic!("handshake should not complete"),
            QuicEvent::ConnectionClosed { conn: c, .. } => {
                assert_eq!(c, conn);
                closed = true;
            }
            _ => {}
        }
    }
    assert!(closed, "client should observe the refused handshake");
}

#[test]
fn bidi_stream_echo_with_fin() {
    let mut pair = Pair::new(&[b"h3"], &[b"h3"]);
    let (client_conn, server_conn) = pair.connect();

    let stream = pair.client.open_bi(client_conn).unwrap().expect("stream limit");
    assert_eq!(pair.client.stream_send(client_conn, stream, b"ping").unwrap(), 4);
    pair.client.stream_finish(client_conn, stream).unwrap();
    pair.pump_until_idle();

    let mut opened = false;
    while let Some(event) = pair.server.poll_event() {
        if let QuicEvent::StreamOpened { conn, stream: s, bidi } = event {
            assert_eq!(conn, server_conn);
            assert!(bidi);
            assert_eq!(s, stream);
            opened = true;
        }
    }
    assert!(opened);

    let mut buf = [0u8; 64];
    let (n, finished) = pair.server.stream_recv(server_conn, stream, &mut buf).unwrap();
    assert_eq!(&buf[..n], b"ping");
    assert!(finished);

    pair.server.stream_send(server_conn, stream, b"pong").unwrap();
    pair.server.stream_finish(server_conn, stream).unwrap();
    pair.pump_until_idle();

    let (n, finished) = pair.client.stream_recv(client_conn, stream, &mut buf).unwrap();
    assert_eq!(&buf[..n], b"pong");
    assert!(finished);
}

#[test]
fn reset_code_reaches_reader() {
    let mut pair = Pair::new(&[b"h3"], &[b"h3"]);
    let (client_conn, server_conn) = pair.connect();

    let stream = pair.client.open_bi(client_conn).unwrap().unwrap();
    pair.client.stream_send(client_conn, stream, b"partial").unwrap();
    pair.pump_until_idle();
    pair.client.stream_reset(client_conn, stream, 0x10c).unwrap();
    pair.pump_until_idle();

    let mut buf = [0u8; 64];
    // Data sent before the reset may or may not still be readable; keep
    // reading until the reset surfaces.
    let mut code = None;
    for _ in 0..4 {
        match pair.server.stream_recv(server_conn, stream, &mut buf) {
            Ok(_) => continue,
            Err(e) => {
                code = e.reset_code();
                break;
            }
        }
    }
    assert_eq!(code, Some(0x10c));
}

#[test]
fn close_connection_notifies_peer() {
    let mut pair = Pair::new(&[b"h3"], &[b"h3"]);
    let (client_conn, _server_conn) = pair.connect();

    pair.client.close_connection(client_conn, 0x100, b"bye");
    pair.pump_until_idle();

    let mut closed = false;
    while let Some(event) = pair.server.poll_event() {
        if matches!(event, QuicEvent::ConnectionClosed { .. }) {
            closed = true;
        }
    }
    assert!(closed);
}
