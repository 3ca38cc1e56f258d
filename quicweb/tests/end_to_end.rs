//! End-to-end tests: a real `Server` and `Client` over loopback UDP.
//!
//! Each test writes a self-signed certificate and a small content root into a
//! temporary directory, starts the server on an ephemeral port, and trusts the
//! certificate explicitly on the client side.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use quicweb::client::Request;
use quicweb::{Client, ClientConfig, ClientError, Server, ServerConfig, ServerError};
use tempfile::TempDir;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

struct TestServer {
    addr: SocketAddr,
    ca_cert: PathBuf,
    shutdown: CancellationToken,
    handle: JoinHandle<Result<(), ServerError>>,
    _dir: TempDir,
}

impl TestServer {
    async fn start(files: &[(&str, &[u8])]) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("www");
        std::fs::create_dir(&root).unwrap();
        for (name, contents) in files {
            std::fs::write(root.join(name), contents).unwrap();
        }
        std::fs::write(dir.path().join("secret.txt"), "outside the root").unwrap();

        let cert = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
        let cert_path = dir.path().join("server.crt");
        let key_path = dir.path().join("server.key");
        std::fs::write(&cert_path, cert.cert.pem()).unwrap();
        std::fs::write(&key_path, cert.key_pair.serialize_pem()).unwrap();

        let config = ServerConfig {
            listen: "127.0.0.1:0".parse().unwrap(),
            root,
            cert: cert_path.clone(),
            key: key_path,
            ..ServerConfig::default()
        };
        let server = Server::bind(&config).await.unwrap();
        let addr = server.local_addr().unwrap();
        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(server.run(shutdown.clone()));

        TestServer {
            addr,
            ca_cert: cert_path,
            shutdown,
            handle,
            _dir: dir,
        }
    }

    fn client_config(&self) -> ClientConfig {
        ClientConfig {
            timeout: Duration::from_secs(5),
            ca_cert: Some(self.ca_cert.clone()),
            ..ClientConfig::default()
        }
    }

    async fn connect(&self) -> Client {
        Client::connect(self.addr, "localhost", &self.client_config())
            .await
            .unwrap()
    }

    fn url(&self, path: &str) -> String {
        format!("https://localhost:{}{path}", self.addr.port())
    }

    async fn stop(self) {
        self.shutdown.cancel();
        self.handle.await.unwrap().unwrap();
    }
}

fn raw_request(method: &str, path: &str) -> Request {
    Request {
        method: method.into(),
        authority: "localhost".into(),
        path: path.into(),
    }
}

#[tokio::test]
async fn root_serves_index() {
    let server = TestServer::start(&[("index.html", b"<h1>hi</h1>")]).await;
    let mut client = server.connect().await;

    let response = client.get(&server.url("/")).await.unwrap();
    assert_eq!(response.status, 200);
    assert_eq!(response.body_lossy(), "<h1>hi</h1>");
    assert_eq!(response.header("content-type"), Some(&b"text/html; charset=utf-8"[..]));
    assert_eq!(response.header("content-length"), Some(&b"11"[..]));

    client.close().await.unwrap();
    server.stop().await;
}

#[tokio::test]
async fn missing_file_is_404() {
    let server = TestServer::start(&[("index.html", b"<h1>hi</h1>")]).await;
    let mut client = server.connect().await;

    let response = client.get(&server.url("/missing.html")).await.unwrap();
    assert_eq!(response.status, 404);
    assert_eq!(response.body, b"Error 404");
    assert_eq!(response.header("content-type"), Some(&b"text/plain"[..]));

    server.stop().await;
}

#[tokio::test]
async fn concurrent_requests_share_a_connection() {
    let big: Vec<u8> = (0..300_000u32).map(|i| b'a' + (i % 26) as u8).collect();
    let server = TestServer::start(&[
        ("index.html", b"<h1>hi</h1>"),
        ("big.txt", big.as_slice()),
        ("small.txt", b"small"),
    ])
    .await;
    let mut client = server.connect().await;

    let urls = [
        server.url("/big.txt"),
        server.url("/small.txt"),
        server.url("/nope"),
    ];
    let urls: Vec<&str> = urls.iter().map(String::as_str).collect();
    let responses = client.get_all(&urls).await.unwrap();

    assert_eq!(responses[0].status, 200);
    assert!(responses[0].body == big);
    assert_eq!(responses[1].body, b"small");
    assert_eq!(responses[2].status, 404);
    for response in &responses {
        assert!(response.elapsed() <= Duration::from_secs(5));
    }

    server.stop().await;
}

#[tokio::test]
async fn traversal_is_forbidden() {
    let server = TestServer::start(&[("index.html", b"<h1>hi</h1>")]).await;
    let mut client = server.connect().await;

    // URL parsing would normalize the dot segments away, so build the
    // request by hand.
    let stream = client.send(&raw_request("GET", "/../secret.txt")).unwrap();
    let response = client.wait(stream).await.unwrap();
    assert_eq!(response.status, 403);
    assert_eq!(response.body, b"Error 403");

    server.stop().await;
}

#[tokio::test]
async fn non_get_is_405() {
    let server = TestServer::start(&[("index.html", b"<h1>hi</h1>")]).await;
    let mut client = server.connect().await;

    let stream = client.send(&raw_request("DELETE", "/index.html")).unwrap();
    let response = client.wait(stream).await.unwrap();
    assert_eq!(response.status, 405);
    assert_eq!(response.header("allow"), Some(&b"GET"[..]));

    server.stop().await;
}

#[tokio::test]
async fn insecure_client_accepts_self_signed() {
    let server = TestServer::start(&[("index.html", b"<h1>hi</h1>")]).await;
    let config = ClientConfig {
        insecure: true,
        timeout: Duration::from_secs(5),
        ..ClientConfig::default()
    };
    let mut client = Client::connect(server.addr, "localhost", &config).await.unwrap();
    let response = client.get(&server.url("/")).await.unwrap();
    assert_eq!(response.status, 200);

    server.stop().await;
}

#[tokio::test]
async fn untrusted_certificate_fails_handshake() {
    let server = TestServer::start(&[("index.html", b"<h1>hi</h1>")]).await;
    let config = ClientConfig {
        timeout: Duration::from_secs(5),
        ..ClientConfig::default()
    };
    let result = Client::connect(server.addr, "localhost", &config).await;
    assert!(matches!(result, Err(ClientError::TransportClosed(_))));

    server.stop().await;
}

#[tokio::test]
async fn silent_peer_times_out() {
    // Bound but never read: the handshake can never complete.
    let silent = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let config = ClientConfig {
        insecure: true,
        timeout: Duration::from_millis(300),
        ..ClientConfig::default()
    };
    let result = Client::connect(silent.local_addr().unwrap(), "localhost", &config).await;
    assert!(matches!(result, Err(ClientError::Timeout(_))));
}

#[tokio::test]
async fn fetch_resolves_and_closes() {
    let server = TestServer::start(&[("index.html", b"<h1>hi</h1>")]).await;
    // An IP literal avoids depending on how `localhost` resolves; the
    // certificate only names `localhost`, so verification is off.
    let url = format!("https://127.0.0.1:{}/index.html", server.addr.port());
    let config = ClientConfig {
        insecure: true,
        timeout: Duration::from_secs(5),
        ..ClientConfig::default()
    };

    let response = quicweb::client::fetch(&url, &config).await.unwrap();
    assert_eq!(response.status, 200);
    assert_eq!(response.body, b"<h1>hi</h1>");

    server.stop().await;
}

#[tokio::test]
async fn shutdown_closes_client_connections() {
    let server = TestServer::start(&[("index.html", b"<h1>hi</h1>")]).await;
    let mut client = server.connect().await;
    let url = server.url("/");
    client.get(&url).await.unwrap();

    server.stop().await;

    let result = client.get(&url).await;
    assert!(matches!(
        result,
        Err(ClientError::TransportClosed(_) | ClientError::Timeout(_))
    ));
}
