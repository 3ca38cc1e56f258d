//! Static file server over HTTP/3.
//!
//! One task owns the UDP socket, the [`QuicEndpoint`] and one
//! [`H3Connection`] per QUIC connection. Requests are routed by [`Router`];
//! file reads run in spawned tasks and report back over a channel so a slow
//! disk never holds up other streams.

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use quicweb_h3::qpack::{self, HeaderField};
use quicweb_h3::{H3Connection, H3Error, H3Event, Role, Settings};
use quicweb_quic::{QuicConfig, QuicConnId, QuicEndpoint, QuicEvent, StreamId};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::config::ServerConfig;
use crate::error::ServerError;
use crate::tls;

const MAX_DATAGRAM: usize = 65536;
const LOADED_CHANNEL_CAPACITY: usize = 256;

/// Where a request path leads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    /// A candidate file under the content root (it may not exist).
    File(PathBuf),
    /// The path tries to leave the content root.
    Forbidden,
}

/// A response ready to be written to a stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponsePlan {
    pub status: u16,
    pub content_type: &'static str,
    pub body: Vec<u8>,
}

impl ResponsePlan {
    pub fn ok(content_type: &'static str, body: Vec<u8>) -> Self {
        Self {
            status: 200,
            content_type,
            body,
        }
    }

    /// Plain-text error page with body `Error <status>`.
    pub fn error(status: u16) -> Self {
        Self {
            status,
            content_type: "text/plain",
            body: format!("Error {status}").into_bytes(),
        }
    }

    pub fn headers(&self) -> Vec<HeaderField> {
        let mut headers = vec![
            HeaderField::new(":status", self.status.to_string()),
            HeaderField::new("content-type", self.content_type),
            HeaderField::new("content-length", self.body.len().to_string()),
        ];
        if self.status == 405 {
            headers.push(HeaderField::new("allow", "GET"));
        }
        headers
    }
}

/// Maps request paths onto files under a content root.
#[derive(Debug, Clone)]
pub struct Router {
    /// Canonical content root.
    root: PathBuf,
}

impl Router {
    /// The root must exist; it is canonicalized once here.
    pub fn new(root: &Path) -> Result<Self, ServerError> {
        let root = std::fs::canonicalize(root).map_err(|source| ServerError::Root {
            path: root.to_owned(),
            source,
        })?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve a `:path` value without touching the filesystem.
    ///
    /// Query and fragment are dropped and `/` becomes `/index.html`. Any `..`
    /// segment, NUL or backslash is forbidden outright.
    pub fn resolve(&self, raw_path: &str) -> Route {
        let path = raw_path.split(['?', '#']).next().unwrap_or_default();
        let path = if path.is_empty() || path == "/" {
            "/index.html"
        } else {
            path
        };
        if path.contains(['\0', '\\']) {
            return Route::Forbidden;
        }

        let mut resolved = self.root.clone();
        for segment in path.split('/') {
            match segment {
                "" | "." => {}
                ".." => return Route::Forbidden,
                segment => resolved.push(segment),
            }
        }
        Route::File(resolved)
    }

    /// Build the response for a request header block.
    pub async fn respond(&self, headers: &[HeaderField]) -> ResponsePlan {
        if qpack::find(headers, b":method") != Some(&b"GET"[..]) {
            return ResponsePlan::error(405);
        }
        let path = qpack::find(headers, b":path")
            .map(String::from_utf8_lossy)
            .unwrap_or_default();
        match self.resolve(&path) {
            Route::Forbidden => ResponsePlan::error(403),
            Route::File(file) => self.load(&file).await,
        }
    }

    async fn load(&self, file: &Path) -> ResponsePlan {
        // Symlinks may still point outside the root.
        let real = match tokio::fs::canonicalize(file).await {
            Ok(real) => real,
            Err(e) => return io_error_response(file, &e),
        };
        if !real.starts_with(&self.root) {
            return ResponsePlan::error(403);
        }
        match tokio::fs::metadata(&real).await {
            Ok(meta) if meta.is_file() => {}
            Ok(_) => return ResponsePlan::error(404),
            Err(e) => return io_error_response(file, &e),
        }
        match tokio::fs::read(&real).await {
            Ok(body) => ResponsePlan::ok(content_type(&real), body),
            Err(e) => io_error_response(file, &e),
        }
    }
}

fn io_error_response(file: &Path, error: &io::Error) -> ResponsePlan {
    match error.kind() {
        io::ErrorKind::NotFound | io::ErrorKind::NotADirectory => ResponsePlan::error(404),
        _ => {
            warn!(path = %file.display(), %error, "read failed");
            ResponsePlan::error(500)
        }
    }
}

/// Content type from the file extension.
pub fn content_type(path: &Path) -> &'static str {
    let ext = path
        .extension()
        .and_then(|ext| ext.to_str())
        .map(str::to_ascii_lowercase)
        .unwrap_or_default();
    match ext.as_str() {
        "html" | "htm" => "text/html; charset=utf-8",
        "css" => "text/css",
        "js" | "mjs" => "text/javascript",
        "json" => "application/json",
        "txt" => "text/plain; charset=utf-8",
        "xml" => "application/xml",
        "svg" => "image/svg+xml",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "webp" => "image/webp",
        "ico" => "image/x-icon",
        "wasm" => "application/wasm",
        "pdf" => "application/pdf",
        _ => "application/octet-stream",
    }
}

/// A response computed off the connection task.
#[derive(Debug)]
struct Loaded {
    conn: QuicConnId,
    stream: StreamId,
    plan: ResponsePlan,
}

pub struct Server {
    socket: UdpSocket,
    quic: QuicEndpoint,
    router: Arc<Router>,
    sessions: HashMap<QuicConnId, H3Connection>,
    recv_buf: Vec<u8>,
}

impl Server {
    /// Load the certificate and key, check the content root and bind.
    pub async fn bind(config: &ServerConfig) -> Result<Self, ServerError> {
        let router = Router::new(&config.root)?;
        let quic_config = tls::server_quic_config(config)?;
        Self::bind_with(config.listen, router, quic_config).await
    }

    pub async fn bind_with(
        listen: SocketAddr,
        router: Router,
        quic_config: QuicConfig,
    ) -> Result<Self, ServerError> {
        let socket = UdpSocket::bind(listen).await?;
        let local_addr = socket.local_addr()?;
        Ok(Self {
            socket,
            quic: QuicEndpoint::new(quic_config, local_addr),
            router: Arc::new(router),
            sessions: HashMap::new(),
            recv_buf: vec![0u8; MAX_DATAGRAM],
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Serve until `shutdown` is cancelled, then send GOAWAY and close every
    /// connection.
    pub async fn run(mut self, shutdown: CancellationToken) -> Result<(), ServerError> {
        let (loaded_tx, mut loaded_rx) = mpsc::channel::<Loaded>(LOADED_CHANNEL_CAPACITY);
        info!(
            addr = %self.local_addr()?,
            root = %self.router.root().display(),
            "listening"
        );

        loop {
            self.process_events(&loaded_tx);
            self.transmit().await;

            let wake = self.quic.next_timeout();
            let timer = async {
                match wake {
                    Some(at) => tokio::time::sleep_until(at.into()).await,
                    None => std::future::pending().await,
                }
            };

            tokio::select! {
                () = shutdown.cancelled() => break,
                received = self.socket.recv_from(&mut self.recv_buf) => match received {
                    Ok((n, from)) => {
                        trace!(bytes = n, %from, "datagram");
                        self.quic.handle_datagram(Instant::now(), &self.recv_buf[..n], from);
                    }
                    // ICMP errors surface here on some platforms; QUIC copes.
                    Err(error) => debug!(%error, "recv failed"),
                },
                Some(loaded) = loaded_rx.recv() => self.deliver(loaded),
                () = timer => self.quic.drive_timers(Instant::now()),
            }
        }

        self.shutdown().await;
        Ok(())
    }

    fn process_events(&mut self, loaded_tx: &mpsc::Sender<Loaded>) {
        while let Some(event) = self.quic.poll_event() {
            let conn = event.conn();
            match &event {
                QuicEvent::NewConnection(_) => {
                    info!(%conn, peer = ?self.quic.remote_addr(conn), "connection accepted");
                    self.sessions
                        .insert(conn, H3Connection::new(Role::Server, Settings::default()));
                }
                QuicEvent::ConnectionClosed { reason, .. } => {
                    info!(%conn, %reason, "connection closed");
                }
                _ => {}
            }

            let Some(session) = self.sessions.get_mut(&conn) else {
                continue;
            };
            let events = match session.handle_transport_event(&mut self.quic, &event) {
                Ok(events) => events,
                Err(error) => {
                    warn!(%conn, %error, "transport rejected an operation");
                    continue;
                }
            };
            if session.is_closed() {
                self.sessions.remove(&conn);
            }
            for h3_event in events {
                self.on_h3_event(conn, h3_event, loaded_tx);
            }
        }
    }

    fn on_h3_event(&mut self, conn: QuicConnId, event: H3Event, loaded_tx: &mpsc::Sender<Loaded>) {
        match event {
            H3Event::HeadersReceived { stream_id, headers } => {
                debug!(
                    %conn,
                    stream = %stream_id,
                    method = %lossy(qpack::find(&headers, b":method")),
                    path = %lossy(qpack::find(&headers, b":path")),
                    "request"
                );
                let router = Arc::clone(&self.router);
                let loaded_tx = loaded_tx.clone();
                tokio::spawn(async move {
                    let plan = router.respond(&headers).await;
                    // The server is gone if the receiver is; nothing to do.
                    let _ = loaded_tx
                        .send(Loaded {
                            conn,
                            stream: stream_id,
                            plan,
                        })
                        .await;
                });
            }
            // Request bodies are not read.
            H3Event::DataReceived { .. } => {}
            H3Event::StreamError { stream_id, error } => {
                debug!(%conn, stream = %stream_id, %error, "stream failed");
            }
            H3Event::GoAway { stream_id } => {
                debug!(%conn, stream_id, "client sent GOAWAY");
            }
            H3Event::ConnectionError(error) => {
                warn!(%conn, %error, "connection error");
            }
            H3Event::Closed => {}
        }
    }

    /// Write a finished response. The connection or stream may be gone by now.
    fn deliver(&mut self, loaded: Loaded) {
        let Loaded { conn, stream, plan } = loaded;
        let Some(session) = self.sessions.get_mut(&conn) else {
            return;
        };
        let result = send_response(session, &mut self.quic, stream, &plan);
        match result {
            Ok(()) => info!(
                %conn,
                stream = %stream,
                status = plan.status,
                bytes = plan.body.len(),
                "response"
            ),
            Err(error) => debug!(%conn, stream = %stream, %error, "response dropped"),
        }
    }

    async fn transmit(&mut self) {
        self.quic.flush(Instant::now());
        while let Some((dest, data)) = self.quic.poll_send() {
            if let Err(error) = self.socket.send_to(&data, dest).await {
                // Lost datagrams are retransmitted by QUIC.
                debug!(%dest, %error, "send failed");
            }
        }
    }

    async fn shutdown(&mut self) {
        info!(connections = self.sessions.len(), "shutting down");
        for session in self.sessions.values_mut() {
            let _ = session.send_goaway(&mut self.quic);
        }
        self.transmit().await;
        let code = quicweb_h3::error::code::H3_NO_ERROR as u32;
        self.quic.close_all(code, b"server shutting down");
        self.transmit().await;
        self.sessions.clear();
    }
}

/// Headers without end-of-stream, then the body as one DATA frame that ends it.
fn send_response(
    session: &mut H3Connection,
    quic: &mut QuicEndpoint,
    stream: StreamId,
    plan: &ResponsePlan,
) -> Result<(), H3Error> {
    session.send_headers(quic, stream, &plan.headers(), false)?;
    session.send_data(quic, stream, &plan.body, true)
}

fn lossy(value: Option<&[u8]>) -> std::borrow::Cow<'_, str> {
    String::from_utf8_lossy(value.unwrap_or_default())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(method: &str, path: &str) -> Vec<HeaderField> {
        vec![
            HeaderField::new(":method", method),
            HeaderField::new(":scheme", "https"),
            HeaderField::new(":authority", "localhost"),
            HeaderField::new(":path", path),
        ]
    }

    fn site() -> (tempfile::TempDir, Router) {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("index.html"), "<h1>hi</h1>").unwrap();
        std::fs::create_dir(dir.path().join("css")).unwrap();
        std::fs::write(dir.path().join("css/site.css"), "body{}").unwrap();
        let router = Router::new(dir.path()).unwrap();
        (dir, router)
    }

    #[test]
    fn root_maps_to_index() {
        let (_dir, router) = site();
        assert_eq!(router.resolve("/"), Route::File(router.root().join("index.html")));
        assert_eq!(router.resolve(""), Route::File(router.root().join("index.html")));
        assert_eq!(router.resolve("/?v=2"), Route::File(router.root().join("index.html")));
    }

    #[test]
    fn query_and_fragment_stripped() {
        let (_dir, router) = site();
        let expected = Route::File(router.root().join("css").join("site.css"));
        assert_eq!(router.resolve("/css/site.css?v=1"), expected);
        assert_eq!(router.resolve("/css/site.css#top"), expected);
        assert_eq!(router.resolve("//css/./site.css"), expected);
    }

    #[test]
    fn traversal_forbidden() {
        let (_dir, router) = site();
        assert_eq!(router.resolve("/../etc/passwd"), Route::Forbidden);
        assert_eq!(router.resolve("/css/../../secret"), Route::Forbidden);
        assert_eq!(router.resolve("/a\\..\\b"), Route::Forbidden);
        assert_eq!(router.resolve("/a\0b"), Route::Forbidden);
    }

    #[test]
    fn missing_root_is_an_error() {
        let err = Router::new(Path::new("/definitely/not/here")).unwrap_err();
        assert!(matches!(err, ServerError::Root { .. }));
    }

    #[test]
    fn content_types() {
        assert_eq!(content_type(Path::new("a.html")), "text/html; charset=utf-8");
        assert_eq!(content_type(Path::new("A.PNG")), "image/png");
        assert_eq!(content_type(Path::new("app.js")), "text/javascript");
        assert_eq!(content_type(Path::new("README")), "application/octet-stream");
    }

    #[test]
    fn error_plan_headers() {
        let plan = ResponsePlan::error(405);
        assert_eq!(plan.body, b"Error 405");
        let headers = plan.headers();
        assert_eq!(qpack::find(&headers, b":status"), Some(&b"405"[..]));
        assert_eq!(qpack::find(&headers, b"content-type"), Some(&b"text/plain"[..]));
        assert_eq!(qpack::find(&headers, b"content-length"), Some(&b"9"[..]));
        assert_eq!(qpack::find(&headers, b"allow"), Some(&b"GET"[..]));
        assert!(qpack::find(&ResponsePlan::error(404).headers(), b"allow").is_none());
    }

    #[tokio::test]
    async fn serves_existing_file() {
        let (_dir, router) = site();
        let plan = router.respond(&request("GET", "/")).await;
        assert_eq!(plan.status, 200);
        assert_eq!(plan.body, b"<h1>hi</h1>");
        assert_eq!(plan.content_type, "text/html; charset=utf-8");

        let plan = router.respond(&request("GET", "/css/site.css")).await;
        assert_eq!(plan.content_type, "text/css");
    }

    #[tokio::test]
    async fn missing_and_directory_are_404() {
        let (_dir, router) = site();
        assert_eq!(router.respond(&request("GET", "/missing.html")).await, ResponsePlan::error(404));
        assert_eq!(router.respond(&request("GET", "/css")).await, ResponsePlan::error(404));
        assert_eq!(
            router.respond(&request("GET", "/index.html/extra")).await,
            ResponsePlan::error(404)
        );
    }

    #[tokio::test]
    async fn non_get_is_405() {
        let (_dir, router) = site();
        let plan = router.respond(&request("POST", "/")).await;
        assert_eq!(plan.status, 405);
        assert_eq!(plan.body, b"Error 405");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn symlink_out_of_root_is_403() {
        let outside = tempfile::tempdir().unwrap();
        std::fs::write(outside.path().join("secret.txt"), "nope").unwrap();
        let (dir, router) = site();
        std::os::unix::fs::symlink(outside.path().join("secret.txt"), dir.path().join("leak.txt"))
            .unwrap();
        assert_eq!(router.respond(&request("GET", "/leak.txt")).await, ResponsePlan::error(403));
    }
}
