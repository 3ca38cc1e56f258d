use std::sync::Arc;
use std::time::Duration;

use quinn_proto::crypto::rustls::{QuicClientConfig, QuicServerConfig};
use quinn_proto::{ClientConfig, EndpointConfig, IdleTimeout, ServerConfig, TransportConfig};

use crate::error::Error;

/// Transport parameters applied to every connection of an endpoint.
#[derive(Debug, Clone)]
pub struct TransportSettings {
    /// Peer-initiated bidirectional streams allowed at once. Default: 100.
    pub max_concurrent_bidi_streams: u32,
    /// Peer-initiated unidirectional streams allowed at once. Default: 16.
    pub max_concurrent_uni_streams: u32,
    /// Close a connection after this long without traffic. Default: 30s.
    pub idle_timeout: Duration,
}

impl Default for TransportSettings {
    fn default() -> Self {
        Self {
            max_concurrent_bidi_streams: 100,
            max_concurrent_uni_streams: 16,
            idle_timeout: Duration::from_secs(30),
        }
    }
}

impl TransportSettings {
    fn to_transport_config(&self) -> Arc<TransportConfig> {
        let mut transport = TransportConfig::default();
        transport.max_concurrent_bidi_streams(self.max_concurrent_bidi_streams.into());
        transport.max_concurrent_uni_streams(self.max_concurrent_uni_streams.into());
        transport.max_idle_timeout(IdleTimeout::try_from(self.idle_timeout).ok());
        Arc::new(transport)
    }
}

/// Configuration for a [`QuicEndpoint`](crate::QuicEndpoint).
pub struct QuicConfig {
    /// Shared endpoint configuration (connection IDs, supported versions, etc.).
    pub endpoint_config: Arc<EndpointConfig>,
    /// Server-side TLS/QUIC config. `None` for client-only endpoints.
    pub server_config: Option<Arc<ServerConfig>>,
    /// Client-side TLS/QUIC config. `None` for server-only endpoints.
    pub client_config: Option<ClientConfig>,
    /// Maximum queued outgoing packets before dropping. Default: 4096.
    pub send_queue_capacity: usize,
    /// Allow path MTU discovery. Default: true.
    pub allow_mtud: bool,
    /// Deterministic RNG seed for testing. Default: `None` (random).
    pub rng_seed: Option<[u8; 32]>,
}

impl QuicConfig {
    /// Create a server-only config from a rustls server config.
    ///
    /// `alpn` replaces the TLS config's application protocol list; the
    /// handshake fails for clients that offer none of them.
    pub fn server(
        mut tls: rustls::ServerConfig,
        alpn: &[&[u8]],
        settings: &TransportSettings,
    ) -> Result<Self, Error> {
        tls.alpn_protocols = alpn.iter().map(|p| p.to_vec()).collect();
        let crypto = QuicServerConfig::try_from(tls)?;
        let mut server_config = ServerConfig::with_crypto(Arc::new(crypto));
        server_config.transport_config(settings.to_transport_config());
        Ok(Self::with_roles(Some(Arc::new(server_config)), None))
    }

    /// Create a client-only config from a rustls client config.
    pub fn client(
        mut tls: rustls::ClientConfig,
        alpn: &[&[u8]],
        settings: &TransportSettings,
    ) -> Result<Self, Error> {
        tls.alpn_protocols = alpn.iter().map(|p| p.to_vec()).collect();
        let crypto = QuicClientConfig::try_from(tls)?;
        let mut client_config = ClientConfig::new(Arc::new(crypto));
        client_config.transport_config(settings.to_transport_config());
        Ok(Self::with_roles(None, Some(client_config)))
    }

    fn with_roles(
        server_config: Option<Arc<ServerConfig>>,
        client_config: Option<ClientConfig>,
    ) -> Self {
        Self {
            endpoint_config: Arc::new(EndpointConfig::default()),
            server_config,
            client_config,
            send_queue_capacity: 4096,
            allow_mtud: true,
            rng_seed: None,
        }
    }
}
