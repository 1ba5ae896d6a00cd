//! Binary codec: bincode serialization + LZ4 compression.
//!
//! Wire format:
//! ```text
//! ┌───────┬─────────┬───────┬──────────────────────────────────────┐
//! │ magic │ version │ flags │ body                                 │
//! │ 0xC7  │ 1 byte  │ 1 byte│ bincode(WireMessage), LZ4 if flag 0  │
//! └───────┴─────────┴───────┴──────────────────────────────────────┘
//! ```
//!
//! Decoding fails closed: a wrong magic, an unknown version or flag, a
//! failed decompression or trailing bytes all reject the whole message.
//!
//! Reference: Patterson & Hennessy, Section 5.7 — Data Compression

use crate::protocol::WireMessage;

/// First byte of every payload.
pub const PROTOCOL_MAGIC: u8 = 0xC7;
/// Bumped on any incompatible change to [`WireMessage`].
pub const WIRE_VERSION: u8 = 1;
/// Bytes before the body.
pub const HEADER_LEN: usize = 3;
/// Upper bound on a decoded body (after decompression).
pub const MAX_DECODED_BYTES: usize = 1 << 20;

const FLAG_COMPRESSED: u8 = 0b0000_0001;
const KNOWN_FLAGS: u8 = FLAG_COMPRESSED;

fn wire_config() -> impl bincode::config::Config {
    bincode::config::standard().with_limit::<MAX_DECODED_BYTES>()
}

/// Codec errors. Every variant means "drop the message".
#[derive(Debug, Clone, PartialEq)]
pub enum CodecError {
    /// Fewer bytes than a header
    Truncated(usize),
    BadMagic(u8),
    VersionMismatch { expected: u8, got: u8 },
    UnknownFlags(u8),
    DecompressionFailed(String),
    /// Declared decompressed size above [`MAX_DECODED_BYTES`]
    TooLarge(usize),
    SerializationError(String),
    DeserializationError(String),
    TrailingBytes(usize),
}

impl std::fmt::Display for CodecError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Truncated(len) => write!(f, "Payload truncated: {len} bytes"),
            Self::BadMagic(b) => write!(f, "Bad magic byte: {b:#04x}"),
            Self::VersionMismatch { expected, got } => {
                write!(f, "Wire version mismatch: expected {expected}, got {got}")
            }
            Self::UnknownFlags(flags) => write!(f, "Unknown header flags: {flags:#010b}"),
            Self::DecompressionFailed(e) => write!(f, "Decompression failed: {e}"),
            Self::TooLarge(size) => write!(f, "Decoded size {size} exceeds limit"),
            Self::SerializationError(e) => write!(f, "Serialization error: {e}"),
            Self::DeserializationError(e) => write!(f, "Deserialization error: {e}"),
            Self::TrailingBytes(n) => write!(f, "{n} trailing bytes after message"),
        }
    }
}

impl std::error::Error for CodecError {}

/// Encoder/decoder for [`WireMessage`]s.
#[derive(Debug, Clone, Copy)]
pub struct Codec {
    /// Bodies shorter than this are sent raw.
    compression_threshold: usize,
    /// Never compress (older clients).
    legacy: bool,
}

impl Codec {
    pub fn new(compression_threshold: usize, legacy: bool) -> Self {
        Self {
            compression_threshold,
            legacy,
        }
    }

    /// Serialize and, when worthwhile, compress a message.
    ///
    /// Fails with [`CodecError::TooLarge`] when the serialized body exceeds
    /// [`MAX_DECODED_BYTES`]. Fragments are never compressed: they carry
    /// slices of an already encoded payload.
    pub fn encode(&self, msg: &WireMessage) -> Result<Vec<u8>, CodecError> {
        let body = bincode::serde::encode_to_vec(msg, bincode::config::standard())
            .map_err(|e| CodecError::SerializationError(e.to_string()))?;
        // Receivers would reject it; the caller must send smaller messages.
        if body.len() > MAX_DECODED_BYTES {
            return Err(CodecError::TooLarge(body.len()));
        }

        let compress =
            !self.legacy && !msg.is_fragment() && body.len() >= self.compression_threshold;

        let mut out;
        if compress {
            let compressed = lz4_flex::compress_prepend_size(&body);
            // Incompressible bodies go out raw
            if compressed.len() < body.len() {
                out = Vec::with_capacity(HEADER_LEN + compressed.len());
                out.extend_from_slice(&[PROTOCOL_MAGIC, WIRE_VERSION, FLAG_COMPRESSED]);
                out.extend_from_slice(&compressed);
                return Ok(out);
            }
        }

        out = Vec::with_capacity(HEADER_LEN + body.len());
        out.extend_from_slice(&[PROTOCOL_MAGIC, WIRE_VERSION, 0]);
        out.extend_from_slice(&body);
        Ok(out)
    }

    /// Validate the header, decompress and deserialize.
    pub fn decode(&self, bytes: &[u8]) -> Result<WireMessage, CodecError> {
        decode(bytes)
    }
}

impl Default for Codec {
    fn default() -> Self {
        Self::new(64, false)
    }
}

/// Decode a payload produced by any [`Codec`] configuration.
pub fn decode(bytes: &[u8]) -> Result<WireMessage, CodecError> {
    if bytes.len() < HEADER_LEN {
        return Err(CodecError::Truncated(bytes.len()));
    }
    if bytes[0] != PROTOCOL_MAGIC {
        return Err(CodecError::BadMagic(bytes[0]));
    }
    if bytes[1] != WIRE_VERSION {
        return Err(CodecError::VersionMismatch {
            expected: WIRE_VERSION,
            got: bytes[1],
        });
    }
    let flags = bytes[2];
    if flags & !KNOWN_FLAGS != 0 {
        return Err(CodecError::UnknownFlags(flags));
    }

    let raw = &bytes[HEADER_LEN..];
    let decompressed;
    let body: &[u8] = if flags & FLAG_COMPRESSED != 0 {
        decompressed = decompress(raw)?;
        &decompressed
    } else {
        raw
    };

    let (msg, consumed): (WireMessage, usize) =
        bincode::serde::decode_from_slice(body, wire_config())
            .map_err(|e| CodecError::DeserializationError(e.to_string()))?;
    if consumed != body.len() {
        return Err(CodecError::TrailingBytes(body.len() - consumed));
    }
    Ok(msg)
}

/// LZ4 with a guard on the prepended size so a forged header cannot
/// force a huge allocation.
fn decompress(raw: &[u8]) -> Result<Vec<u8>, CodecError> {
    if raw.len() < 4 {
        return Err(CodecError::DecompressionFailed("missing size prefix".into()));
    }
    let declared = u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]) as usize;
    if declared > MAX_DECODED_BYTES {
        return Err(CodecError::TooLarge(declared));
    }
    lz4_flex::decompress_size_prepended(raw)
        .map_err(|e| CodecError::DecompressionFailed(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::framer::Chunk;
    use crate::protocol::{ControlMessage, RecordBatch};
    use crate::record::{
        MaterialCount, MaterialSnapshot, PeerId, Record, RecordId, RecordPayload, Tombstone,
    };

    fn sample_batch(n: usize) -> RecordBatch {
        let owner = PeerId::from("Jaina-Proudmoore");
        let records = (0..n)
            .map(|i| {
                Record::new(
                    RecordId::new(format!("materials:{i}")),
                    RecordPayload::Materials(MaterialSnapshot {
                        owner: owner.clone(),
                        items: vec![MaterialCount { item_id: 2589, count: i as u32 }; 8],
                    }),
                    1,
                    1_700_000_000,
                    owner.clone(),
                )
            })
            .collect();
        RecordBatch {
            records,
            tombstones: vec![Tombstone::new(RecordId::from("gone"), 5, owner, 3)],
        }
    }

    #[test]
    fn test_delta_roundtrip_compressed() {
        let codec = Codec::default();
        let msg = WireMessage::Delta(sample_batch(50));
        let encoded = codec.encode(&msg).unwrap();

        assert_eq!(encoded[0], PROTOCOL_MAGIC);
        assert_eq!(encoded[2] & FLAG_COMPRESSED, FLAG_COMPRESSED);
        assert_eq!(codec.decode(&encoded).unwrap(), msg);
    }

    #[test]
    fn test_small_message_sent_raw() {
        let codec = Codec::default();
        let msg = WireMessage::Control(ControlMessage::RequestFullState);
        let encoded = codec.encode(&msg).unwrap();
        assert_eq!(encoded[2], 0);
        assert_eq!(decode(&encoded).unwrap(), msg);
    }

    #[test]
    fn test_legacy_never_compresses() {
        let codec = Codec::new(0, true);
        let msg = WireMessage::FullState(sample_batch(50));
        let encoded = codec.encode(&msg).unwrap();
        assert_eq!(encoded[2], 0);
        // Modern decoders accept it
        assert_eq!(Codec::default().decode(&encoded).unwrap(), msg);
    }

    #[test]
    fn test_fragment_never_compressed() {
        let codec = Codec::new(0, false);
        let msg = WireMessage::Fragment(Chunk {
            message_id: 9,
            index: 0,
            total: 2,
            data: vec![0u8; 512],
        });
        let encoded = codec.encode(&msg).unwrap();
        assert_eq!(encoded[2], 0);
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(matches!(decode(&[0xFF, 0xFE]), Err(CodecError::Truncated(2))));
        assert!(matches!(decode(&[0x00, 1, 0, 1]), Err(CodecError::BadMagic(0))));
        assert!(decode(&[PROTOCOL_MAGIC, WIRE_VERSION, 0, 0xFF, 0xFE, 0xFD]).is_err());
    }

    #[test]
    fn test_decode_rejects_version_mismatch() {
        let mut encoded = Codec::default()
            .encode(&WireMessage::Control(ControlMessage::RequestFullState))
            .unwrap();
        encoded[1] = WIRE_VERSION + 1;
        assert_eq!(
            decode(&encoded),
            Err(CodecError::VersionMismatch {
                expected: WIRE_VERSION,
                got: WIRE_VERSION + 1
            })
        );
    }

    #[test]
    fn test_decode_rejects_unknown_flags() {
        let mut encoded = Codec::default()
            .encode(&WireMessage::Control(ControlMessage::RequestFullState))
            .unwrap();
        encoded[2] = 0b1000_0000;
        assert!(matches!(decode(&encoded), Err(CodecError::UnknownFlags(_))));
    }

    #[test]
    fn test_decode_rejects_corrupt_compression() {
        let codec = Codec::default();
        let mut encoded = codec.encode(&WireMessage::Delta(sample_batch(50))).unwrap();
        // Clobber the compressed stream, keep the size prefix
        for b in encoded.iter_mut().skip(HEADER_LEN + 4) {
            *b = 0xFF;
        }
        assert!(codec.decode(&encoded).is_err());
    }

    #[test]
    fn test_decode_rejects_oversized_declaration() {
        let mut bytes = vec![PROTOCOL_MAGIC, WIRE_VERSION, FLAG_COMPRESSED];
        bytes.extend_from_slice(&u32::MAX.to_le_bytes());
        bytes.extend_from_slice(&[0u8; 16]);
        assert!(matches!(decode(&bytes), Err(CodecError::TooLarge(_))));
    }

    #[test]
    fn test_encode_refuses_body_over_decode_limit() {
        let chunk = Chunk {
            message_id: 0,
            index: 0,
            total: 1,
            data: vec![7; MAX_DECODED_BYTES],
        };
        let err = Codec::default().encode(&WireMessage::Fragment(chunk)).unwrap_err();
        assert!(matches!(err, CodecError::TooLarge(n) if n > MAX_DECODED_BYTES));
    }

    #[test]
    fn test_decode_rejects_trailing_bytes() {
        let mut encoded = Codec::new(usize::MAX, false)
            .encode(&WireMessage::Control(ControlMessage::RequestFullState))
            .unwrap();
        encoded.extend_from_slice(&[0, 0, 0]);
        assert_eq!(decode(&encoded), Err(CodecError::TrailingBytes(3)));
    }

    #[test]
    fn test_compression_shrinks_repetitive_batch() {
        let codec = Codec::default();
        let raw = Codec::new(usize::MAX, false)
            .encode(&WireMessage::FullState(sample_batch(200)))
            .unwrap();
        let compressed = codec.encode(&WireMessage::FullState(sample_batch(200))).unwrap();
        assert!(
            compressed.len() * 2 < raw.len(),
            "compressed {} vs raw {}",
            compressed.len(),
            raw.len()
        );
    }

    #[test]
    fn test_codec_error_display() {
        let err = CodecError::VersionMismatch { expected: 1, got: 2 };
        assert!(err.to_string().contains("expected 1"));
        assert!(CodecError::TrailingBytes(4).to_string().contains('4'));
    }
}
