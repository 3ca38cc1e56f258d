//! HTTP/3 frame encoding/decoding and QUIC variable-length integer codec.
//!
//! HTTP/3 frames consist of a varint type, varint length, and payload.
//! Stream multiplexing and flow control belong to QUIC, so there are no
//! stream ids or flags in the frame itself: the end of a message is the
//! QUIC FIN on its stream.

use crate::error::H3Error;
use crate::settings::Settings;

// ── Frame type constants (RFC 9114 Section 7.2) ─────────────────────

pub const FRAME_DATA: u64 = 0x00;
pub const FRAME_HEADERS: u64 = 0x01;
pub const FRAME_CANCEL_PUSH: u64 = 0x03;
pub const FRAME_SETTINGS: u64 = 0x04;
pub const FRAME_PUSH_PROMISE: u64 = 0x05;
pub const FRAME_GOAWAY: u64 = 0x07;
pub const FRAME_MAX_PUSH_ID: u64 = 0x0d;

/// HTTP/2 frame types that MUST NOT appear in HTTP/3 (RFC 9114 Section 7.2.8).
const RESERVED_H2_TYPES: &[u64] = &[0x02, 0x06, 0x08, 0x09];

// ── QUIC Variable-Length Integer (RFC 9000 Section 16) ──────────────

/// Encode a QUIC variable-length integer into `buf`.
///
/// The two high bits of the first byte give the length: 1, 2, 4 or 8 bytes.
pub fn encode_varint(buf: &mut Vec<u8>, value: u64) {
    debug_assert!(value < (1 << 62), "varint value too large");
    let len = varint_len(value);
    let tag = (len.trailing_zeros() as u8) << 6;
    let bytes = value.to_be_bytes();
    let start = buf.len();
    buf.extend_from_slice(&bytes[8 - len..]);
    buf[start] |= tag;
}

/// Decode a QUIC variable-length integer from the start of `buf`.
///
/// Returns `(value, bytes_consumed)`, or `None` until enough bytes arrived.
pub fn decode_varint(buf: &[u8]) -> Option<(u64, usize)> {
    let first = *buf.first()?;
    let len = 1usize << (first >> 6);
    let encoded = buf.get(..len)?;
    let value = encoded[1..]
        .iter()
        .fold(u64::from(first & 0x3f), |acc, &b| (acc << 8) | u64::from(b));
    Some((value, len))
}

/// Encoded size of `value` as a varint.
pub fn varint_len(value: u64) -> usize {
    match value {
        0..0x40 => 1,
        0x40..0x4000 => 2,
        0x4000..0x4000_0000 => 4,
        _ => 8,
    }
}

// ── Frame types ─────────────────────────────────────────────────────

/// An HTTP/3 frame.
#[derive(Debug, Clone)]
pub enum Frame {
    /// DATA frame (type 0x00): carries request or response body.
    Data { payload: Vec<u8> },
    /// HEADERS frame (type 0x01): QPACK-encoded header block.
    Headers { encoded: Vec<u8> },
    /// SETTINGS frame (type 0x04): configuration parameters.
    Settings(Settings),
    /// GOAWAY frame (type 0x07): graceful shutdown with last stream ID.
    GoAway { stream_id: u64 },
    /// Unknown frame type: MUST be ignored (RFC 9114 Section 7.2.8).
    Unknown { frame_type: u64, payload: Vec<u8> },
}

// ── Frame encoding ──────────────────────────────────────────────────

/// Encode a frame header (type + length varints) into `buf`.
pub fn encode_frame_header(buf: &mut Vec<u8>, frame_type: u64, payload_len: u64) {
    encode_varint(buf, frame_type);
    encode_varint(buf, payload_len);
}

/// Encode only the header of a DATA frame carrying `payload_len` bytes.
///
/// Lets callers append a large body without building a `Frame::Data` copy.
pub fn encode_data_header(buf: &mut Vec<u8>, payload_len: usize) {
    encode_frame_header(buf, FRAME_DATA, payload_len as u64);
}

impl Frame {
    /// Encode this frame into `buf` (header + payload).
    pub fn encode(&self, buf: &mut Vec<u8>) {
        match self {
            Frame::Data { payload } => {
                encode_frame_header(buf, FRAME_DATA, payload.len() as u64);
                buf.extend_from_slice(payload);
            }
            Frame::Headers { encoded } => {
                encode_frame_header(buf, FRAME_HEADERS, encoded.len() as u64);
                buf.extend_from_slice(encoded);
            }
            Frame::Settings(settings) => {
                let payload_len = settings.encoded_len();
                encode_frame_header(buf, FRAME_SETTINGS, payload_len as u64);
                settings.encode(buf);
            }
            Frame::GoAway { stream_id } => {
                encode_frame_header(buf, FRAME_GOAWAY, varint_len(*stream_id) as u64);
                encode_varint(buf, *stream_id);
            }
            Frame::Unknown {
                frame_type,
                payload,
            } => {
                encode_frame_header(buf, *frame_type, payload.len() as u64);
                buf.extend_from_slice(payload);
            }
        }
    }
}

// ── Frame decoding ──────────────────────────────────────────────────

/// Type and length prefix of a frame, parsed before its payload is complete.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub frame_type: u64,
    pub payload_len: u64,
    /// Bytes taken by the type and length varints.
    pub header_len: usize,
}

impl FrameHeader {
    /// Total encoded size of the frame, header included.
    pub fn frame_len(&self) -> usize {
        self.header_len + self.payload_len as usize
    }

    /// Whether `buf` (starting at this header) holds the whole payload.
    pub fn is_complete_in(&self, buf: &[u8]) -> bool {
        (buf.len() - self.header_len) as u64 >= self.payload_len
    }
}

/// Decode the type and length of the frame at the start of `buf`.
///
/// Returns `Ok(None)` if the two varints are not yet complete. Reserved
/// HTTP/2 frame types are rejected as soon as their type is known.
pub fn decode_frame_header(buf: &[u8]) -> Result<Option<FrameHeader>, H3Error> {
    let Some((frame_type, type_len)) = decode_varint(buf) else {
        return Ok(None);
    };
    if RESERVED_H2_TYPES.contains(&frame_type) {
        return Err(H3Error::FrameUnexpected);
    }
    let Some((payload_len, len_len)) = decode_varint(&buf[type_len..]) else {
        return Ok(None);
    };
    Ok(Some(FrameHeader {
        frame_type,
        payload_len,
        header_len: type_len + len_len,
    }))
}

/// Decode one complete frame from the start of `buf`.
///
/// Returns `Ok(Some((frame, bytes_consumed)))` on success,
/// `Ok(None)` if the buffer is incomplete (need more data),
/// or `Err` on protocol error.
pub fn decode_frame(buf: &[u8]) -> Result<Option<(Frame, usize)>, H3Error> {
    let Some(header) = decode_frame_header(buf)? else {
        return Ok(None);
    };
    if !header.is_complete_in(buf) {
        return Ok(None);
    }
    let total_len = header.frame_len();
    let payload = &buf[header.header_len..total_len];

    let frame = match header.frame_type {
        FRAME_DATA => Frame::Data {
            payload: payload.to_vec(),
        },
        FRAME_HEADERS => Frame::Headers {
            encoded: payload.to_vec(),
        },
        FRAME_SETTINGS => Frame::Settings(Settings::decode(payload)?),
        FRAME_GOAWAY => {
            let (stream_id, n) = decode_varint(payload).ok_or(H3Error::FrameError)?;
            if n != payload.len() {
                return Err(H3Error::FrameError);
            }
            Frame::GoAway { stream_id }
        }
        frame_type => Frame::Unknown {
            frame_type,
            payload: payload.to_vec(),
        },
    };

    Ok(Some((frame, total_len)))
}
