//! QPACK header compression: static table only (RFC 9204).
//!
//! We advertise a zero-capacity dynamic table, so peers may only reference the
//! 99-entry static table or send literals. Encoder and decoder streams carry
//! nothing and are drained by the connection.

use crate::error::H3Error;

/// A single header name-value pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeaderField {
    pub name: Vec<u8>,
    pub value: Vec<u8>,
}

impl HeaderField {
    pub fn new(name: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }

    /// Pseudo-header fields (`:method`, `:status`, ...) start with a colon.
    pub fn is_pseudo(&self) -> bool {
        self.name.first() == Some(&b':')
    }

    /// Size counted against SETTINGS_MAX_FIELD_SECTION_SIZE (RFC 9114 Section 4.2.2).
    pub fn size(&self) -> u64 {
        (self.name.len() + self.value.len() + 32) as u64
    }
}

/// Value of the first field named `name`.
pub fn find<'a>(headers: &'a [HeaderField], name: &[u8]) -> Option<&'a [u8]> {
    headers
        .iter()
        .find(|h| h.name == name)
        .map(|h| h.value.as_slice())
}

/// Total size of a field section, as compared with the peer's limit.
pub fn field_section_size(headers: &[HeaderField]) -> u64 {
    headers.iter().map(HeaderField::size).sum()
}

// ── QPACK prefix integer codec (RFC 9204 Section 4.1.1) ────────────
//
// Different from QUIC varints! Uses a prefix of N bits. If the value fits
// in N bits (< 2^N - 1), encode directly. Otherwise, encode 2^N - 1 in
// the prefix bits and the remainder in subsequent bytes using 7-bit chunks.

fn encode_prefix_int(buf: &mut Vec<u8>, value: u64, prefix_bits: u8, pattern: u8) {
    let max = (1u64 << prefix_bits) - 1;
    if value < max {
        buf.push(pattern | value as u8);
    } else {
        buf.push(pattern | max as u8);
        let mut remaining = value - max;
        while remaining >= 128 {
            buf.push(0x80 | (remaining & 0x7f) as u8);
            remaining >>= 7;
        }
        buf.push(remaining as u8);
    }
}

fn decode_prefix_int(buf: &[u8], prefix_bits: u8) -> Option<(u64, usize)> {
    if buf.is_empty() {
        return None;
    }
    let max = (1u64 << prefix_bits) - 1;
    let value = u64::from(buf[0]) & max;
    if value < max {
        return Some((value, 1));
    }
    // Multi-byte encoding.
    let mut value = max;
    let mut shift = 0u32;
    for (i, &b) in buf[1..].iter().enumerate() {
        value += u64::from(b & 0x7f) << shift;
        shift += 7;
        if b & 0x80 == 0 {
            return Some((value, i + 2));
        }
        if shift > 56 {
            return None; // overflow protection
        }
    }
    None // incomplete
}

// ── Static table (RFC 9204 Appendix A) ──────────────────────────────

/// QPACK static table entries: (name, value). 99 entries indexed 0..98.
const STATIC_TABLE: &[(&[u8], &[u8])] = &[
    (b":authority", b""),                                    // 0
    (b":path", b"/"),                                        // 1
    (b"age", b"0"),                                          // 2
    (b"content-disposition", b""),                           // 3
    (b"content-length", b"0"),                               // 4
    (b"cookie", b""),                                        // 5
    (b"date", b""),                                          // 6
    (b"etag", b""),                                          // 7
    (b"if-modified-since", b""),                             // 8
    (b"if-none-match", b""),                                 // 9
    (b"last-modified", b""),                                 // 10
    (b"link", b""),                                          // 11
    (b"location", b""),                                      // 12
    (b"referer", b""),                                       // 13
    (b"set-cookie", b""),                                    // 14
    (b":method", b"CONNECT"),                                // 15
    (b":method", b"DELETE"),                                 // 16
    (b":method", b"GET"),                                    // 17
    (b":method", b"HEAD"),                                   // 18
    (b":method", b"OPTIONS"),                                // 19
    (b":method", b"POST"),                                   // 20
    (b":method", b"PUT"),                                    // 21
    (b":scheme", b"http"),                                   // 22
    (b":scheme", b"https"),                                  // 23
    (b":status", b"103"),                                    // 24
    (b":status", b"200"),                                    // 25
    (b":status", b"304"),                                    // 26
    (b":status", b"404"),                                    // 27
    (b":status", b"503"),                                    // 28
    (b"accept", b"*/*"),                                     // 29
    (b"accept", b"application/dns-message"),                 // 30
    (b"accept-encoding", b"gzip, deflate, br"),              // 31
    (b"accept-ranges", b"bytes"),                            // 32
    (b"access-control-allow-headers", b"cache-control"),     // 33
    (b"access-control-allow-headers", b"content-type"),      // 34
    (b"access-control-allow-origin", b"*"),                  // 35
    (b"cache-control", b"max-age=0"),                        // 36
    (b"cache-control", b"max-age=2592000"),                  // 37
    (b"cache-control", b"max-age=604800"),                   // 38
    (b"cache-control", b"no-cache"),                         // 39
    (b"cache-control", b"no-store"),                         // 40
    (b"cache-control", b"public, max-age=31536000"),         // 41
    (b"content-encoding", b"br"),                            // 42
    (b"content-encoding", b"gzip"),                          // 43
    (b"content-type", b"application/dns-message"),           // 44
    (b"content-type", b"application/javascript"),            // 45
    (b"content-type", b"application/json"),                  // 46
    (b"content-type", b"application/x-www-form-urlencoded"), // 47
    (b"content-type", b"image/gif"),                         // 48
    (b"content-type", b"image/jpeg"),                        // 49
    (b"content-type", b"image/png"),                         // 50
    (b"content-type", b"text/css"),                          // 51
    (b"content-type", b"text/html; charset=utf-8"),          // 52
    (b"content-type", b"text/plain"),                        // 53
    (b"content-type", b"text/plain;charset=utf-8"),          // 54
    (b"range", b"bytes=0-"),                                 // 55
    (b"strict-transport-security", b"max-age=31536000"),     // 56
    (
        b"strict-transport-security",
        b"max-age=31536000; includesubdomains",
    ), // 57
    (
        b"strict-transport-security",
        b"max-age=31536000; includesubdomains; preload",
    ), // 58
    (b"vary", b"accept-encoding"),                           // 59
    (b"vary", b"origin"),                                    // 60
    (b"x-content-type-options", b"nosniff"),                 // 61
    (b"x-xss-protection", b"1; mode=block"),                 // 62
    (b":status", b"100"),                                    // 63
    (b":status", b"204"),                                    // 64
    (b":status", b"206"),                                    // 65
    (b":status", b"302"),                                    // 66
    (b":status", b"400"),                                    // 67
    (b":status", b"403"),                                    // 68
    (b":status", b"421"),                                    // 69
    (b":status", b"425"),                                    // 70
    (b":status", b"500"),                                    // 71
    (b"accept-language", b""),                               // 72
    (b"access-control-allow-credentials", b"FALSE"),         // 73
    (b"access-control-allow-credentials", b"TRUE"),          // 74
    (b"access-control-allow-headers", b"*"),                 // 75
    (b"access-control-allow-methods", b"get"),               // 76
    (b"access-control-allow-methods", b"get, post, options"), // 77
    (b"access-control-allow-methods", b"options"),           // 78
    (b"access-control-expose-headers", b"content-length"),   // 79
    (b"access-control-request-headers", b"content-type"),    // 80
    (b"access-control-request-method", b"get"),              // 81
    (b"access-control-request-method", b"post"),             // 82
    (b"alt-svc", b"clear"),                                  // 83
    (b"authorization", b""),                                 // 84
    (
        b"content-security-policy",
        b"script-src 'none'; object-src 'none'; base-uri 'none'",
    ), // 85
    (b"early-data", b"1"),                                   // 86
    (b"expect-ct", b""),                                     // 87
    (b"forwarded", b""),                                     // 88
    (b"if-range", b""),                                      // 89
    (b"origin", b""),                                        // 90
    (b"purpose", b"prefetch"),                               // 91
    (b"server", b""),                                        // 92
    (b"timing-allow-origin", b"*"),                          // 93
    (b"upgrade-insecure-requests", b"1"),                    // 94
    (b"user-agent", b""),                                    // 95
    (b"x-forwarded-for", b""),                               // 96
    (b"x-frame-options", b"deny"),                           // 97
    (b"x-frame-options", b"sameorigin"),                     // 98
];

fn static_entry(index: u64) -> Result<&'static (&'static [u8], &'static [u8]), H3Error> {
    usize::try_from(index)
        .ok()
        .and_then(|i| STATIC_TABLE.get(i))
        .ok_or(H3Error::QpackDecodingFailed)
}

/// How a field is best represented against the static table.
enum StaticMatch {
    /// Name and value both match entry `n`.
    Full(usize),
    /// Only the name matches entry `n`.
    Name(usize),
    None,
}

fn static_match(field: &HeaderField) -> StaticMatch {
    let mut name_only = None;
    for (i, (name, value)) in STATIC_TABLE.iter().enumerate() {
        if *name != field.name.as_slice() {
            continue;
        }
        if *value == field.value.as_slice() {
            return StaticMatch::Full(i);
        }
        name_only.get_or_insert(i);
    }
    name_only.map_or(StaticMatch::None, StaticMatch::Name)
}

// ── Encoder ─────────────────────────────────────────────────────────

/// Write a string literal whose length prefix is `prefix_bits` wide, with the
/// Huffman flag just above the prefix. Huffman is used only when shorter.
fn encode_string(buf: &mut Vec<u8>, data: &[u8], prefix_bits: u8, pattern: u8) {
    let huffman_flag = 1u8 << prefix_bits;
    let huffman_len = crate::huffman::encoded_len(data);
    if huffman_len < data.len() {
        encode_prefix_int(buf, huffman_len as u64, prefix_bits, pattern | huffman_flag);
        crate::huffman::encode(data, buf);
    } else {
        encode_prefix_int(buf, data.len() as u64, prefix_bits, pattern);
        buf.extend_from_slice(data);
    }
}

/// Append a header block for `headers` that references only the static table.
pub fn encode(headers: &[HeaderField], buf: &mut Vec<u8>) {
    // Required Insert Count and Delta Base are both zero (RFC 9204 Section 4.5.1).
    buf.extend_from_slice(&[0x00, 0x00]);

    for field in headers {
        match static_match(field) {
            // Indexed field line, T=1 (Section 4.5.2).
            StaticMatch::Full(index) => encode_prefix_int(buf, index as u64, 6, 0xc0),
            // Literal with static name reference, N=0 T=1 (Section 4.5.4).
            StaticMatch::Name(index) => {
                encode_prefix_int(buf, index as u64, 4, 0x50);
                encode_string(buf, &field.value, 7, 0x00);
            }
            // Literal with literal name, N=0 (Section 4.5.6).
            StaticMatch::None => {
                encode_string(buf, &field.name, 3, 0x20);
                encode_string(buf, &field.value, 7, 0x00);
            }
        }
    }
}

// ── Decoder ─────────────────────────────────────────────────────────

/// Reads field lines off a header block.
struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn peek(&self) -> Option<u8> {
        self.buf.get(self.pos).copied()
    }

    fn int(&mut self, prefix_bits: u8) -> Result<u64, H3Error> {
        let (value, n) =
            decode_prefix_int(&self.buf[self.pos..], prefix_bits).ok_or(H3Error::QpackDecodingFailed)?;
        self.pos += n;
        Ok(value)
    }

    fn bytes(&mut self, len: u64) -> Result<&'a [u8], H3Error> {
        let len = usize::try_from(len).map_err(|_| H3Error::QpackDecodingFailed)?;
        let end = self
            .pos
            .checked_add(len)
            .filter(|&end| end <= self.buf.len())
            .ok_or(H3Error::QpackDecodingFailed)?;
        let bytes = &self.buf[self.pos..end];
        self.pos = end;
        Ok(bytes)
    }

    /// A string literal with its Huffman flag just above a `prefix_bits` length.
    fn string(&mut self, prefix_bits: u8) -> Result<Vec<u8>, H3Error> {
        let first = self.peek().ok_or(H3Error::QpackDecodingFailed)?;
        let huffman = first & (1 << prefix_bits) != 0;
        let len = self.int(prefix_bits)?;
        let raw = self.bytes(len)?;
        if huffman {
            crate::huffman::decode(raw)
        } else {
            Ok(raw.to_vec())
        }
    }
}

/// Decode a header block. Any reference to the dynamic table fails, since
/// its capacity is always zero.
pub fn decode(buf: &[u8]) -> Result<Vec<HeaderField>, H3Error> {
    let mut cursor = Cursor { buf, pos: 0 };
    if cursor.int(8)? != 0 {
        return Err(H3Error::QpackDecodingFailed);
    }
    // Delta Base is meaningless without dynamic entries.
    cursor.int(7)?;

    let mut headers = Vec::new();
    while let Some(first) = cursor.peek() {
        let field = match first {
            // 1Txxxxxx: indexed field line; T=0 is dynamic.
            b if b & 0xc0 == 0xc0 => {
                let (name, value) = static_entry(cursor.int(6)?)?;
                HeaderField::new(*name, *value)
            }
            // 01NTxxxx: literal with name reference; T=0 is dynamic.
            b if b & 0xd0 == 0x50 => {
                let (name, _) = static_entry(cursor.int(4)?)?;
                HeaderField::new(*name, cursor.string(7)?)
            }
            // 001NHxxx: literal with literal name.
            b if b & 0xe0 == 0x20 => {
                let name = cursor.string(3)?;
                HeaderField::new(name, cursor.string(7)?)
            }
            // Dynamic indexed, dynamic name reference, or post-base forms.
            _ => return Err(H3Error::QpackDecodingFailed),
        };
        headers.push(field);
    }
    Ok(headers)
}
