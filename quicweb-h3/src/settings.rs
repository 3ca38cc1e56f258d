use crate::error::H3Error;
use crate::frame::{decode_varint, encode_varint, varint_len};

const SETTINGS_QPACK_MAX_TABLE_CAPACITY: u64 = 0x01;
const SETTINGS_MAX_FIELD_SECTION_SIZE: u64 = 0x06;
const SETTINGS_QPACK_BLOCKED_STREAMS: u64 = 0x07;

/// HTTP/2 setting identifiers that MUST NOT appear in HTTP/3
/// (RFC 9114 Section 7.2.4.1).
const RESERVED_H2_SETTINGS: &[u64] = &[0x02, 0x03, 0x04, 0x05];

/// HTTP/3 SETTINGS parameters (RFC 9114 Section 7.2.4.1).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    /// SETTINGS_QPACK_MAX_TABLE_CAPACITY (0x01). Default 0 (no dynamic table).
    pub qpack_max_table_capacity: u64,
    /// SETTINGS_MAX_FIELD_SECTION_SIZE (0x06). Default unlimited.
    pub max_field_section_size: u64,
    /// SETTINGS_QPACK_BLOCKED_STREAMS (0x07). Default 0.
    pub qpack_blocked_streams: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            qpack_max_table_capacity: 0,
            max_field_section_size: u64::MAX,
            qpack_blocked_streams: 0,
        }
    }
}

impl Settings {
    /// Identifier/value pairs that differ from the protocol defaults.
    fn non_default(&self) -> impl Iterator<Item = (u64, u64)> {
        [
            (SETTINGS_QPACK_MAX_TABLE_CAPACITY, self.qpack_max_table_capacity, 0),
            (SETTINGS_MAX_FIELD_SECTION_SIZE, self.max_field_section_size, u64::MAX),
            (SETTINGS_QPACK_BLOCKED_STREAMS, self.qpack_blocked_streams, 0),
        ]
        .into_iter()
        .filter(|&(_, value, default)| value != default)
        .map(|(id, value, _)| (id, value))
    }

    /// Encode settings as a sequence of (identifier, value) varint pairs.
    /// Defaults are omitted.
    pub fn encode(&self, buf: &mut Vec<u8>) {
        for (id, value) in self.non_default() {
            encode_varint(buf, id);
            encode_varint(buf, value);
        }
    }

    /// Decode settings from a SETTINGS frame payload.
    ///
    /// Unknown identifiers are ignored; repeated or HTTP/2-reserved ones are
    /// a connection error.
    pub fn decode(mut buf: &[u8]) -> Result<Self, H3Error> {
        let mut settings = Settings::default();
        let mut seen = Vec::new();
        while !buf.is_empty() {
            let (id, n) = decode_varint(buf).ok_or(H3Error::FrameError)?;
            buf = &buf[n..];
            let (value, n) = decode_varint(buf).ok_or(H3Error::FrameError)?;
            buf = &buf[n..];

            if RESERVED_H2_SETTINGS.contains(&id) || seen.contains(&id) {
                return Err(H3Error::SettingsError);
            }
            seen.push(id);

            match id {
                SETTINGS_QPACK_MAX_TABLE_CAPACITY => settings.qpack_max_table_capacity = value,
                SETTINGS_MAX_FIELD_SECTION_SIZE => settings.max_field_section_size = value,
                SETTINGS_QPACK_BLOCKED_STREAMS => settings.qpack_blocked_streams = value,
                _ => {}
            }
        }
        Ok(settings)
    }

    /// Byte length when encoded.
    pub fn encoded_len(&self) -> usize {
        self.non_default()
            .map(|(id, value)| varint_len(id) + varint_len(value))
            .sum()
    }
}
