//! HTTP/3 session layer for quicweb-quic.
//!
//! This crate provides a sans-IO HTTP/3 session that sits on top of any
//! [`Transport`] (in practice [`quicweb_quic::QuicEndpoint`]). It handles:
//!
//! - HTTP/3 frame encoding/decoding (DATA, HEADERS, SETTINGS, GOAWAY)
//! - QPACK header compression (static table and literals, no dynamic table)
//! - Control stream management (SETTINGS exchange, GOAWAY)
//! - Mapping QUIC stream events to request/response events for either role
//!
//! # Architecture
//!
//! ```text
//!   UDP datagrams
//!        │
//!   ┌────▼────────┐
//!   │quicweb-quic │  QUIC transport (quinn-proto wrapper)
//!   │QuicEndpoint │  QuicEvent: StreamReadable, StreamOpened, etc.
//!   └────┬────────┘
//!        │ Transport: stream_recv() / stream_send()
//!   ┌────▼────────┐
//!   │ quicweb-h3  │  HTTP/3 framing + QPACK
//!   │ H3Connection│  H3Event: HeadersReceived, DataReceived, etc.
//!   └─────────────┘
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! use quicweb_h3::{H3Connection, H3Event, HeaderField, Role, Settings};
//!
//! let mut h3 = H3Connection::new(Role::Server, Settings::default());
//!
//! // After quic.poll_event():
//! for h3_event in h3.handle_transport_event(&mut quic, &event)? {
//!     if let H3Event::HeadersReceived { stream_id, .. } = h3_event {
//!         let response = vec![HeaderField::new(":status", "200")];
//!         h3.send_headers(&mut quic, stream_id, &response, false)?;
//!         h3.send_data(&mut quic, stream_id, b"hello", true)?;
//!     }
//! }
//! ```

pub mod connection;
pub mod error;
pub mod frame;
mod huffman;
pub mod qpack;
pub mod settings;
mod stream;
pub mod transport;

pub use connection::{H3Connection, H3Event, Role};
pub use error::H3Error;
pub use frame::Frame;
pub use qpack::HeaderField;
pub use settings::Settings;
pub use transport::Transport;
