//! quicweb-quic: the QUIC transport beneath quicweb's HTTP/3 layer.
//!
//! Wraps [quinn-proto](https://docs.rs/quinn-proto)'s sans-IO state machine
//! behind an event queue. Everything transport-related (handshake, ALPN
//! negotiation, loss recovery, flow control) happens in quinn-proto; this
//! crate only moves datagrams in and out and exposes per-stream operations.
//!
//! # Example
//!
//! ```rust,ignore
//! use quicweb_quic::{QuicConfig, QuicEndpoint, QuicEvent};
//!
//! quic.handle_datagram(Instant::now(), data, peer);
//! while let Some(event) = quic.poll_event() {
//!     match event {
//!         QuicEvent::NewConnection(conn) => { /* ... */ }
//!         QuicEvent::StreamReadable { conn, stream } => {
//!             let mut buf = [0u8; 4096];
//!             let (n, fin) = quic.stream_recv(conn, stream, &mut buf)?;
//!             quic.stream_send(conn, stream, &buf[..n])?;
//!         }
//!         _ => {}
//!     }
//! }
//! quic.flush(Instant::now());
//! while let Some((dest, data)) = quic.poll_send() {
//!     udp.send_to(&data, dest).await?;
//! }
//! ```

pub mod config;
pub mod endpoint;
pub mod error;
pub mod event;

pub use config::{QuicConfig, TransportSettings};
pub use endpoint::QuicEndpoint;
pub use error::Error;
pub use event::{QuicConnId, QuicEvent};

// Re-export commonly used quinn-proto types for convenience.
pub use quinn_proto::{ConnectionError, Dir, Side, StreamId};
