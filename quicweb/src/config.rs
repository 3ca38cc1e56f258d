//! Client and server configuration, and the command lines that fill them.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use quicweb_quic::TransportSettings;

/// How long a client waits for the handshake or a response by default.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// HTTP/3 client settings.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Deadline for the handshake and for each response. Default: 10s.
    pub timeout: Duration,
    /// Skip server certificate verification.
    pub insecure: bool,
    /// Trust only the CA certificates in this PEM file instead of the
    /// WebPKI roots.
    pub ca_cert: Option<PathBuf>,
    pub transport: TransportSettings,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_TIMEOUT,
            insecure: false,
            ca_cert: None,
            transport: TransportSettings::default(),
        }
    }
}

/// Static file server settings.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// UDP address to listen on. Default: `127.0.0.1:4433`.
    pub listen: SocketAddr,
    /// Directory served as `/`. Default: `./www`.
    pub root: PathBuf,
    /// PEM certificate chain. Default: `server.crt`.
    pub cert: PathBuf,
    /// PEM private key. Default: `server.key`.
    pub key: PathBuf,
    pub transport: TransportSettings,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([127, 0, 0, 1], 4433)),
            root: PathBuf::from("./www"),
            cert: PathBuf::from("server.crt"),
            key: PathBuf::from("server.key"),
            transport: TransportSettings::default(),
        }
    }
}

#[derive(Debug, Parser)]
#[command(name = "quicweb-get")]
#[command(about = "Fetch a URL over HTTP/3 and print the response")]
#[command(version)]
pub struct GetArgs {
    /// https:// URL to fetch
    pub url: String,

    /// Accept any server certificate
    #[arg(long)]
    pub insecure: bool,

    /// PEM file with the CA certificates to trust
    #[arg(long, value_name = "PATH")]
    pub ca_cert: Option<PathBuf>,

    /// Seconds to wait for the connection and the response
    #[arg(long, value_name = "SECS", default_value_t = DEFAULT_TIMEOUT.as_secs())]
    pub timeout: u64,
}

impl GetArgs {
    pub fn client_config(&self) -> ClientConfig {
        ClientConfig {
            timeout: Duration::from_secs(self.timeout),
            insecure: self.insecure,
            ca_cert: self.ca_cert.clone(),
            ..ClientConfig::default()
        }
    }
}

#[derive(Debug, Parser)]
#[command(name = "quicweb-serve")]
#[command(about = "Serve a directory of static files over HTTP/3")]
#[command(version)]
pub struct ServeArgs {
    /// UDP address to listen on
    #[arg(short, long, default_value = "127.0.0.1:4433")]
    pub listen: SocketAddr,

    /// Directory to serve
    #[arg(short, long, default_value = "./www")]
    pub root: PathBuf,

    /// PEM certificate chain
    #[arg(long, default_value = "server.crt")]
    pub cert: PathBuf,

    /// PEM private key
    #[arg(long, default_value = "server.key")]
    pub key: PathBuf,
}

impl ServeArgs {
    pub fn server_config(&self) -> ServerConfig {
        ServerConfig {
            listen: self.listen,
            root: self.root.clone(),
            cert: self.cert.clone(),
            key: self.key.clone(),
            ..ServerConfig::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serve_defaults_match_config_defaults() {
        let args = ServeArgs::try_parse_from(["quicweb-serve"]).unwrap();
        let config = args.server_config();
        let defaults = ServerConfig::default();
        assert_eq!(config.listen, defaults.listen);
        assert_eq!(config.root, defaults.root);
        assert_eq!(config.cert, defaults.cert);
        assert_eq!(config.key, defaults.key);
    }

    #[test]
    fn serve_overrides() {
        let args = ServeArgs::try_parse_from([
            "quicweb-serve",
            "--listen",
            "0.0.0.0:8443",
            "--root",
            "/srv/www",
        ])
        .unwrap();
        let config = args.server_config();
        assert_eq!(config.listen, "0.0.0.0:8443".parse().unwrap());
        assert_eq!(config.root, PathBuf::from("/srv/www"));
    }

    #[test]
    fn get_flags() {
        let args = GetArgs::try_parse_from([
            "quicweb-get",
            "https://example.com/",
            "--insecure",
            "--timeout",
            "3",
        ])
        .unwrap();
        let config = args.client_config();
        assert_eq!(args.url, "https://example.com/");
        assert!(config.insecure);
        assert_eq!(config.timeout, Duration::from_secs(3));
        assert!(config.ca_cert.is_none());
    }

    #[test]
    fn get_requires_url() {
        assert!(GetArgs::try_parse_from(["quicweb-get"]).is_err());
    }

    #[test]
    fn get_default_timeout() {
        let args = GetArgs::try_parse_from(["quicweb-get", "https://localhost/"]).unwrap();
        assert_eq!(args.client_config().timeout, DEFAULT_TIMEOUT);
    }
}
