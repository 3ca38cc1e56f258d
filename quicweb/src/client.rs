//! HTTP/3 GET client.
//!
//! [`Client`] owns a UDP socket, a client-side [`QuicEndpoint`] and one
//! [`H3Connection`]. Each request is tracked by an [`Exchange`], a small
//! state machine that collects the response for one stream:
//!
//! ```text
//!   Idle ──send_headers──▶ Sent ──HEADERS──▶ HeadersReceived ──DATA(end)──▶ Complete
//! ```
//!
//! Several requests may be outstanding on the same connection; responses are
//! collected independently per stream.

use std::borrow::Cow;
use std::collections::HashMap;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::{Duration, Instant};

use quicweb_h3::qpack::{self, HeaderField};
use quicweb_h3::{H3Connection, H3Error, H3Event, Role, Settings};
use quicweb_quic::{QuicConnId, QuicEndpoint, QuicEvent, StreamId};
use tokio::net::UdpSocket;
use tracing::{debug, info, trace};
use url::{Host, Url};

use crate::config::ClientConfig;
use crate::error::ClientError;
use crate::tls;

const USER_AGENT: &str = concat!("quicweb/", env!("CARGO_PKG_VERSION"));
const MAX_DATAGRAM: usize = 65536;

/// A request to send: the pseudo-header values that identify it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub method: String,
    pub authority: String,
    /// Path plus query, always starting with `/`.
    pub path: String,
}

impl Request {
    /// A GET request for an `https://` URL. An empty path becomes `/`.
    pub fn get(url: &str) -> Result<Self, ClientError> {
        let url = Url::parse(url)?;
        let target = Target::from_url(&url)?;
        let mut path = url.path().to_string();
        if path.is_empty() {
            path.push('/');
        }
        if let Some(query) = url.query() {
            path.push('?');
            path.push_str(query);
        }
        Ok(Self {
            method: "GET".into(),
            authority: target.authority,
            path,
        })
    }

    /// The header block sent for this request.
    pub fn headers(&self) -> Vec<HeaderField> {
        vec![
            HeaderField::new(":method", self.method.as_str()),
            HeaderField::new(":scheme", "https"),
            HeaderField::new(":authority", self.authority.as_str()),
            HeaderField::new(":path", self.path.as_str()),
            HeaderField::new("user-agent", USER_AGENT),
        ]
    }
}

/// Where a URL points: the TLS server name, `:authority`, and port.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    pub server_name: String,
    pub authority: String,
    pub port: u16,
}

impl Target {
    pub fn from_url(url: &Url) -> Result<Self, ClientError> {
        if url.scheme() != "https" {
            return Err(ClientError::UnsupportedUrl(url.to_string()));
        }
        let (server_name, host_str) = match url.host() {
            Some(Host::Domain(domain)) => (domain.to_string(), domain.to_string()),
            Some(Host::Ipv4(addr)) => (addr.to_string(), addr.to_string()),
            Some(Host::Ipv6(addr)) => (addr.to_string(), format!("[{addr}]")),
            None => return Err(ClientError::UnsupportedUrl(url.to_string())),
        };
        // `port()` is `None` for the scheme default, which the authority omits.
        let authority = match url.port() {
            Some(port) => format!("{host_str}:{port}"),
            None => host_str,
        };
        Ok(Self {
            server_name,
            authority,
            port: url.port_or_known_default().unwrap_or(443),
        })
    }
}

/// A complete response.
#[derive(Debug, Clone)]
pub struct Response {
    pub status: u16,
    /// Every field of the header block, pseudo-headers included.
    pub headers: Vec<HeaderField>,
    pub body: Vec<u8>,
    elapsed: Duration,
}

impl Response {
    /// Time from sending the request to receiving the end of the body.
    pub fn elapsed(&self) -> Duration {
        self.elapsed
    }

    pub fn header(&self, name: &str) -> Option<&[u8]> {
        qpack::find(&self.headers, name.as_bytes())
    }

    /// The body as text; invalid UTF-8 is replaced, never an error.
    pub fn body_lossy(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.body)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangeState {
    Idle,
    Sent,
    HeadersReceived,
    Complete,
}

/// Response collection for one request stream.
#[derive(Debug)]
pub struct Exchange {
    stream: StreamId,
    state: ExchangeState,
    headers: Vec<HeaderField>,
    body: Vec<u8>,
    started: Option<Instant>,
    finished: Option<Instant>,
    failure: Option<ClientError>,
}

impl Exchange {
    pub fn new(stream: StreamId) -> Self {
        Self {
            stream,
            state: ExchangeState::Idle,
            headers: Vec::new(),
            body: Vec::new(),
            started: None,
            finished: None,
            failure: None,
        }
    }

    pub fn state(&self) -> ExchangeState {
        self.state
    }

    /// The request header block was handed to the session at `now`.
    pub fn mark_sent(&mut self, now: Instant) {
        if self.state == ExchangeState::Idle {
            self.state = ExchangeState::Sent;
            self.started = Some(now);
        }
    }

    pub fn on_headers(&mut self, headers: Vec<HeaderField>) -> Result<(), ClientError> {
        if self.state == ExchangeState::Complete {
            return Err(ClientError::DuplicateEnd(self.stream));
        }
        self.headers = headers;
        self.state = ExchangeState::HeadersReceived;
        Ok(())
    }

    /// Append body bytes; `end_stream` completes the exchange at `now`.
    pub fn on_data(&mut self, data: &[u8], end_stream: bool, now: Instant) -> Result<(), ClientError> {
        if self.state == ExchangeState::Complete {
            return Err(ClientError::DuplicateEnd(self.stream));
        }
        self.body.extend_from_slice(data);
        if end_stream {
            self.finished = Some(now);
            self.state = ExchangeState::Complete;
        }
        Ok(())
    }

    /// The stream failed. Before any response it counts as a lost transport.
    pub fn on_stream_error(&mut self, error: H3Error) {
        let failure = match self.state {
            ExchangeState::Idle | ExchangeState::Sent => ClientError::TransportClosed(error.to_string()),
            ExchangeState::HeadersReceived => ClientError::Stream {
                stream: self.stream,
                error,
            },
            ExchangeState::Complete => return,
        };
        self.fail(failure);
    }

    /// Record the first failure; later ones are dropped.
    pub fn fail(&mut self, error: ClientError) {
        if self.failure.is_none() {
            self.failure = Some(error);
        }
    }

    /// Completed or failed; the waiter can stop.
    pub fn is_settled(&self) -> bool {
        self.state == ExchangeState::Complete || self.failure.is_some()
    }

    /// The response, available once the exchange is complete.
    pub fn into_response(self) -> Result<Response, ClientError> {
        if let Some(failure) = self.failure {
            return Err(failure);
        }
        let (Some(started), Some(finished)) = (self.started, self.finished) else {
            return Err(ClientError::TransportClosed("response incomplete".into()));
        };
        let status = qpack::find(&self.headers, b":status")
            .and_then(|value| std::str::from_utf8(value).ok())
            .and_then(|value| value.parse::<u16>().ok())
            .ok_or(ClientError::Stream {
                stream: self.stream,
                error: H3Error::MessageError("invalid :status"),
            })?;
        Ok(Response {
            status,
            headers: self.headers,
            body: self.body,
            elapsed: finished.saturating_duration_since(started),
        })
    }
}

/// One HTTP/3 connection to one server.
pub struct Client {
    socket: UdpSocket,
    quic: QuicEndpoint,
    h3: H3Connection,
    conn: QuicConnId,
    timeout: Duration,
    exchanges: HashMap<StreamId, Exchange>,
    /// Why the connection ended, once it has.
    closed: Option<String>,
    recv_buf: Vec<u8>,
}

impl Client {
    /// Connect to `peer` and complete the QUIC handshake with ALPN `h3`.
    pub async fn connect(
        peer: SocketAddr,
        server_name: &str,
        config: &ClientConfig,
    ) -> Result<Self, ClientError> {
        let bind: SocketAddr = if peer.is_ipv4() {
            (Ipv4Addr::UNSPECIFIED, 0).into()
        } else {
            (Ipv6Addr::UNSPECIFIED, 0).into()
        };
        let socket = UdpSocket::bind(bind).await?;
        let local_addr = socket.local_addr()?;

        let mut quic = QuicEndpoint::new(tls::client_quic_config(config)?, local_addr);
        let conn = quic.connect(Instant::now(), peer, server_name)?;
        debug!(%peer, server_name, "connecting");

        let mut client = Self {
            socket,
            quic,
            h3: H3Connection::new(Role::Client, Settings::default()),
            conn,
            timeout: config.timeout,
            exchanges: HashMap::new(),
            closed: None,
            recv_buf: vec![0u8; MAX_DATAGRAM],
        };
        let deadline = Instant::now() + config.timeout;
        client
            .drive_until(deadline, |c| c.h3.conn_id().is_some())
            .await?;
        info!(%peer, server_name, "connected");
        Ok(client)
    }

    /// Send `request` on a new stream. The response is collected while any
    /// wait on this client is in progress.
    pub fn send(&mut self, request: &Request) -> Result<StreamId, ClientError> {
        if let Some(reason) = &self.closed {
            return Err(ClientError::TransportClosed(reason.clone()));
        }
        let stream = self.h3.open_request(&mut self.quic)?;
        let mut exchange = Exchange::new(stream);
        // GET carries no body, so the header block ends the stream.
        self.h3
            .send_headers(&mut self.quic, stream, &request.headers(), true)?;
        exchange.mark_sent(Instant::now());
        self.exchanges.insert(stream, exchange);
        debug!(%stream, method = %request.method, path = %request.path, "request sent");
        Ok(stream)
    }

    /// Wait for the response on `stream`, bounded by the configured timeout.
    pub async fn wait(&mut self, stream: StreamId) -> Result<Response, ClientError> {
        let deadline = Instant::now() + self.timeout;
        let driven = self
            .drive_until(deadline, move |c| {
                c.exchanges.get(&stream).is_none_or(Exchange::is_settled)
            })
            .await;
        let exchange = self
            .exchanges
            .remove(&stream)
            .ok_or(ClientError::Stream {
                stream,
                error: H3Error::StreamClosed,
            })?;
        if !exchange.is_settled() {
            driven?;
        }
        exchange.into_response()
    }

    pub async fn get(&mut self, url: &str) -> Result<Response, ClientError> {
        let stream = self.send(&Request::get(url)?)?;
        self.wait(stream).await
    }

    /// Issue every request before waiting on any, so they run concurrently
    /// on separate streams. Responses come back in `urls` order.
    pub async fn get_all(&mut self, urls: &[&str]) -> Result<Vec<Response>, ClientError> {
        let mut streams = Vec::with_capacity(urls.len());
        for url in urls {
            streams.push(self.send(&Request::get(url)?)?);
        }
        let mut responses = Vec::with_capacity(streams.len());
        for stream in streams {
            responses.push(self.wait(stream).await?);
        }
        Ok(responses)
    }

    /// Close the connection with `H3_NO_ERROR`.
    pub async fn close(mut self) -> Result<(), ClientError> {
        let code = quicweb_h3::error::code::H3_NO_ERROR as u32;
        self.quic.close_connection(self.conn, code, b"");
        self.transmit().await
    }

    // ── Driver ──────────────────────────────────────────────────────

    /// Run the socket, timers and session until `done` holds, the
    /// connection ends, or `deadline` passes.
    async fn drive_until(
        &mut self,
        deadline: Instant,
        done: impl Fn(&Self) -> bool,
    ) -> Result<(), ClientError> {
        loop {
            self.process_events()?;
            self.transmit().await?;
            if done(self) {
                return Ok(());
            }
            if let Some(reason) = &self.closed {
                return Err(ClientError::TransportClosed(reason.clone()));
            }
            if Instant::now() >= deadline {
                return Err(ClientError::Timeout(self.timeout));
            }

            let wake = self
                .quic
                .next_timeout()
                .map_or(deadline, |timer| timer.min(deadline));
            tokio::select! {
                received = self.socket.recv_from(&mut self.recv_buf) => {
                    let (n, from) = received?;
                    trace!(bytes = n, %from, "datagram");
                    self.quic.handle_datagram(Instant::now(), &self.recv_buf[..n], from);
                }
                () = tokio::time::sleep_until(wake.into()) => {
                    self.quic.drive_timers(Instant::now());
                }
            }
        }
    }

    fn process_events(&mut self) -> Result<(), ClientError> {
        while let Some(event) = self.quic.poll_event() {
            if let QuicEvent::ConnectionClosed { reason, .. } = &event {
                self.closed.get_or_insert_with(|| reason.to_string());
            }
            for h3_event in self.h3.handle_transport_event(&mut self.quic, &event)? {
                self.on_h3_event(h3_event);
            }
        }
        Ok(())
    }

    fn on_h3_event(&mut self, event: H3Event) {
        match event {
            H3Event::HeadersReceived { stream_id, headers } => {
                let Some(exchange) = self.exchanges.get_mut(&stream_id) else {
                    return;
                };
                for field in &headers {
                    debug!(
                        stream = %stream_id,
                        name = %String::from_utf8_lossy(&field.name),
                        value = %String::from_utf8_lossy(&field.value),
                        "response header"
                    );
                }
                if let Err(e) = exchange.on_headers(headers) {
                    exchange.fail(e);
                }
            }
            H3Event::DataReceived {
                stream_id,
                data,
                end_stream,
            } => {
                let Some(exchange) = self.exchanges.get_mut(&stream_id) else {
                    return;
                };
                if let Err(e) = exchange.on_data(&data, end_stream, Instant::now()) {
                    exchange.fail(e);
                }
            }
            H3Event::StreamError { stream_id, error } => {
                debug!(stream = %stream_id, %error, "stream failed");
                if let Some(exchange) = self.exchanges.get_mut(&stream_id) {
                    exchange.on_stream_error(error);
                }
            }
            H3Event::GoAway { stream_id } => {
                info!(stream_id, "server is going away");
            }
            H3Event::ConnectionError(error) => {
                self.closed.get_or_insert_with(|| error.to_string());
            }
            H3Event::Closed => {
                self.closed
                    .get_or_insert_with(|| "connection closed".to_string());
            }
        }
    }

    async fn transmit(&mut self) -> Result<(), ClientError> {
        self.quic.flush(Instant::now());
        while let Some((dest, data)) = self.quic.poll_send() {
            self.socket.send_to(&data, dest).await?;
        }
        Ok(())
    }
}

/// Resolve the URL's host, connect, fetch, and close.
pub async fn fetch(url: &str, config: &ClientConfig) -> Result<Response, ClientError> {
    let request = Request::get(url)?;
    let target = Target::from_url(&Url::parse(url)?)?;
    let peer = tokio::net::lookup_host((target.server_name.as_str(), target.port))
        .await?
        .next()
        .ok_or_else(|| ClientError::Resolve(target.authority.clone()))?;

    let mut client = Client::connect(peer, &target.server_name, config).await?;
    let stream = client.send(&request)?;
    let response = client.wait(stream).await;
    // Best effort; the response is what matters.
    let _ = client.close().await;
    response
}

#[cfg(test)]
mod tests {
    use quicweb_quic::{Dir, Side};

    use super::*;

    fn stream() -> StreamId {
        StreamId::new(Side::Client, Dir::Bi, 0)
    }

    fn status(code: &str) -> Vec<HeaderField> {
        vec![HeaderField::new(":status", code)]
    }

    #[test]
    fn get_with_empty_path_targets_root() {
        let request = Request::get("https://127.0.0.1:4433").unwrap();
        assert_eq!(request.path, "/");
        assert_eq!(request.authority, "127.0.0.1:4433");
        assert_eq!(request.method, "GET");
    }

    #[test]
    fn get_keeps_query_and_drops_default_port() {
        let request = Request::get("https://example.com:443/search?q=h3#top").unwrap();
        assert_eq!(request.path, "/search?q=h3");
        assert_eq!(request.authority, "example.com");
    }

    #[test]
    fn ipv6_authority_is_bracketed() {
        let url = Url::parse("https://[::1]:8443/").unwrap();
        let target = Target::from_url(&url).unwrap();
        assert_eq!(target.authority, "[::1]:8443");
        assert_eq!(target.server_name, "::1");
        assert_eq!(target.port, 8443);
    }

    #[test]
    fn non_https_rejected() {
        assert!(matches!(
            Request::get("http://example.com/"),
            Err(ClientError::UnsupportedUrl(_))
        ));
        assert!(matches!(Request::get("not a url"), Err(ClientError::Url(_))));
    }

    #[test]
    fn request_headers_in_pseudo_first_order() {
        let headers = Request::get("https://localhost/a.txt").unwrap().headers();
        let names: Vec<&[u8]> = headers.iter().map(|h| h.name.as_slice()).collect();
        assert_eq!(
            names,
            [
                &b":method"[..],
                b":scheme",
                b":authority",
                b":path",
                b"user-agent"
            ]
        );
    }

    #[test]
    fn exchange_collects_body_in_order() {
        let start = Instant::now();
        let mut exchange = Exchange::new(stream());
        assert_eq!(exchange.state(), ExchangeState::Idle);
        exchange.mark_sent(start);
        assert_eq!(exchange.state(), ExchangeState::Sent);

        exchange.on_headers(status("200")).unwrap();
        assert_eq!(exchange.state(), ExchangeState::HeadersReceived);
        exchange.on_data(b"<h1>", false, start).unwrap();
        assert!(!exchange.is_settled());
        let end = start + Duration::from_millis(5);
        exchange.on_data(b"hi</h1>", true, end).unwrap();
        assert_eq!(exchange.state(), ExchangeState::Complete);

        let response = exchange.into_response().unwrap();
        assert_eq!(response.status, 200);
        assert_eq!(response.body, b"<h1>hi</h1>");
        assert_eq!(response.elapsed(), Duration::from_millis(5));
    }

    #[test]
    fn second_end_of_stream_rejected() {
        let now = Instant::now();
        let mut exchange = Exchange::new(stream());
        exchange.mark_sent(now);
        exchange.on_headers(status("200")).unwrap();
        exchange.on_data(b"done", true, now).unwrap();

        let err = exchange.on_data(b"", true, now).unwrap_err();
        assert!(matches!(err, ClientError::DuplicateEnd(s) if s == stream()));
        // The completed body is frozen.
        assert_eq!(exchange.into_response().unwrap().body, b"done");
    }

    #[test]
    fn incomplete_exchange_has_no_response() {
        let mut exchange = Exchange::new(stream());
        exchange.mark_sent(Instant::now());
        exchange.on_headers(status("200")).unwrap();
        exchange.on_data(b"partial", false, Instant::now()).unwrap();
        assert!(exchange.into_response().is_err());
    }

    #[test]
    fn stream_error_before_headers_is_transport_closed() {
        let mut exchange = Exchange::new(stream());
        exchange.mark_sent(Instant::now());
        exchange.on_stream_error(H3Error::StreamReset(0x10b));
        assert!(exchange.is_settled());
        assert!(matches!(
            exchange.into_response(),
            Err(ClientError::TransportClosed(_))
        ));
    }

    #[test]
    fn stream_error_after_headers_is_stream_error() {
        let mut exchange = Exchange::new(stream());
        exchange.mark_sent(Instant::now());
        exchange.on_headers(status("200")).unwrap();
        exchange.on_stream_error(H3Error::FrameUnexpected);
        assert!(matches!(
            exchange.into_response(),
            Err(ClientError::Stream {
                error: H3Error::FrameUnexpected,
                ..
            })
        ));
    }

    #[test]
    fn lossy_body_never_fails() {
        let response = Response {
            status: 200,
            headers: status("200"),
            body: vec![b'o', b'k', 0xff],
            elapsed: Duration::ZERO,
        };
        assert_eq!(response.body_lossy(), "ok\u{fffd}");
        assert_eq!(response.header(":status"), Some(&b"200"[..]));
    }
}
