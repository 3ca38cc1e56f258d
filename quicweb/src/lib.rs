//! quicweb: a minimal HTTP/3 GET client and static-file server.
//!
//! Built on two sans-IO crates: [`quicweb_quic`] (QUIC via quinn-proto) and
//! [`quicweb_h3`] (HTTP/3 framing and QPACK). This crate adds the tokio
//! drivers that move datagrams, the TLS setup, and the two roles:
//!
//! - [`client::Client`]: connects, sends GET requests on independent streams,
//!   and collects each response with a deadline.
//! - [`server::Server`]: accepts connections and serves files from a content
//!   root through [`server::Router`].
//!
//! ```rust,ignore
//! let config = ClientConfig::default();
//! let response = quicweb::client::fetch("https://localhost:4433/", &config).await?;
//! println!("{} {}", response.status, response.body_lossy());
//! ```

pub mod client;
pub mod config;
pub mod error;
pub mod logging;
pub mod server;
pub mod tls;

pub use client::{Client, Request, Response};
pub use config::{ClientConfig, ServerConfig};
pub use error::{ClientError, ServerError, TlsError};
pub use server::{Router, Server};
