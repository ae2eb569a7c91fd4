//! Wire-format definitions for TCP segments.
//!
//! Every segment exchanged through the simulated network is a [`Segment`].
//! This module is responsible for:
//! - Defining the on-wire binary layout (fixed header, options, payload).
//! - Serialising a [`Segment`] into a byte buffer ready for the link.
//! - Deserialising a raw byte slice back into a [`Segment`], returning errors
//!   for malformed or truncated input.
//!
//! No I/O happens here; this is pure data transformation.
//!
//! # Wire format
//!
//! All multi-byte integers are **big-endian**.
//!
//! ```text
//!  0               1               2               3
//!  0 1 2 3 4 5 6 7 0 1 2 3 4 5 6 7 0 1 2 3 4 5 6 7 0 1 2 3 4 5 6 7
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |          Source Port          |       Destination Port        |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                        Sequence Number                        |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                    Acknowledgment Number                      |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |  Data |       |     Flags     |            Window             |
//! | Offset|       |               |                               |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |           Checksum            |         Urgent Pointer        |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                    Options (0..40 bytes)      |    Padding    |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                        Payload ...                            |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! ```
//!
//! Fixed header size: [`HEADER_LEN`] = 20 bytes.  The checksum covers the
//! whole serialised segment (there is no IP pseudo-header in the simulation).
//!
//! # Options
//!
//! Options form a closed set, [`TcpOption`].  Encoding and decoding of every
//! kind happens in one `match` each; unknown kinds are skipped by length.

use std::fmt;

use thiserror::Error;

use crate::seq::SequenceNumber;

/// Bit-flag constants for the `flags` header field.
pub mod flags {
    /// No more data from sender.
    pub const FIN: u8 = 0x01;
    /// Synchronise sequence numbers.
    pub const SYN: u8 = 0x02;
    /// Reset the connection.
    pub const RST: u8 = 0x04;
    /// Push function.
    pub const PSH: u8 = 0x08;
    /// Acknowledgement field is significant.
    pub const ACK: u8 = 0x10;
    /// Urgent pointer field is significant.
    pub const URG: u8 = 0x20;

    /// Human-readable `SYN|ACK` style rendering used in log lines.
    pub fn describe(bits: u8) -> String {
        const NAMES: [(u8, &str); 6] = [
            (FIN, "FIN"),
            (SYN, "SYN"),
            (RST, "RST"),
            (PSH, "PSH"),
            (ACK, "ACK"),
            (URG, "URG"),
        ];
        let parts: Vec<&str> = NAMES
            .iter()
            .filter(|(bit, _)| bits & bit != 0)
            .map(|(_, name)| *name)
            .collect();
        if parts.is_empty() {
            "-".to_string()
        } else {
            parts.join("|")
        }
    }
}

/// Option kind numbers (IANA).
pub mod option_kind {
    pub const END: u8 = 0;
    pub const NOP: u8 = 1;
    pub const MSS: u8 = 2;
    pub const WINDOW_SCALE: u8 = 3;
    pub const SACK_PERMITTED: u8 = 4;
    pub const SACK: u8 = 5;
    pub const TIMESTAMP: u8 = 8;
}

/// Byte length of the fixed-size header on the wire.
pub const HEADER_LEN: usize = 20;

/// Maximum number of option bytes a header may carry.
pub const MAX_OPTION_LEN: usize = 40;

// Byte offsets of each field within the serialised header.
const OFF_SRC_PORT: usize = 0;
const OFF_DST_PORT: usize = 2;
const OFF_SEQ: usize = 4;
const OFF_ACK: usize = 8;
const OFF_DATA_OFFSET: usize = 12;
const OFF_FLAGS: usize = 13;
const OFF_WINDOW: usize = 14;
const OFF_CHECKSUM: usize = 16;
const OFF_URGENT: usize = 18;

// ---------------------------------------------------------------------------
// Options
// ---------------------------------------------------------------------------

/// One SACK block: the half-open range `[left, right)` held by the receiver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SackBlock {
    pub left: SequenceNumber,
    pub right: SequenceNumber,
}

impl SackBlock {
    pub fn new(left: SequenceNumber, right: SequenceNumber) -> Self {
        Self { left, right }
    }
}

impl fmt::Display for SackBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{};{})", self.left, self.right)
    }
}

/// Every option this stack understands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TcpOption {
    /// Window-scale shift count (RFC 7323 §2).
    WindowScale(u8),
    /// SACK may be used on this connection (RFC 2018 §2).
    SackPermitted,
    /// Out-of-order ranges held by the receiver (RFC 2018 §3).
    Sack(Vec<SackBlock>),
    /// Timestamp value and echo reply (RFC 7323 §3).
    Timestamp { value: u32, echo: u32 },
}

impl TcpOption {
    pub fn kind(&self) -> u8 {
        match self {
            TcpOption::WindowScale(_) => option_kind::WINDOW_SCALE,
            TcpOption::SackPermitted => option_kind::SACK_PERMITTED,
            TcpOption::Sack(_) => option_kind::SACK,
            TcpOption::Timestamp { .. } => option_kind::TIMESTAMP,
        }
    }

    /// Bytes this option occupies on the wire, kind and length included.
    pub fn encoded_len(&self) -> usize {
        match self {
            TcpOption::WindowScale(_) => 3,
            TcpOption::SackPermitted => 2,
            TcpOption::Sack(blocks) => 2 + 8 * blocks.len(),
            TcpOption::Timestamp { .. } => 10,
        }
    }

    fn encode_into(&self, buf: &mut Vec<u8>) {
        buf.push(self.kind());
        buf.push(self.encoded_len() as u8);
        match self {
            TcpOption::WindowScale(shift) => buf.push(*shift),
            TcpOption::SackPermitted => {}
            TcpOption::Sack(blocks) => {
                for block in blocks {
                    buf.extend_from_slice(&block.left.value().to_be_bytes());
                    buf.extend_from_slice(&block.right.value().to_be_bytes());
                }
            }
            TcpOption::Timestamp { value, echo } => {
                buf.extend_from_slice(&value.to_be_bytes());
                buf.extend_from_slice(&echo.to_be_bytes());
            }
        }
    }

    /// Decode the body of one option.  `Ok(None)` means the kind is not one
    /// we understand and should be skipped.
    fn decode(kind: u8, body: &[u8]) -> Result<Option<Self>, PacketError> {
        let malformed = PacketError::MalformedOption { kind };
        let opt = match kind {
            option_kind::WINDOW_SCALE => match body {
                [shift] => TcpOption::WindowScale(*shift),
                _ => return Err(malformed),
            },
            option_kind::SACK_PERMITTED => {
                if !body.is_empty() {
                    return Err(malformed);
                }
                TcpOption::SackPermitted
            }
            option_kind::SACK => {
                if body.is_empty() || body.len() % 8 != 0 {
                    return Err(malformed);
                }
                let blocks = body
                    .chunks_exact(8)
                    .map(|c| {
                        SackBlock::new(
                            SequenceNumber::new(be_u32(&c[0..4])),
                            SequenceNumber::new(be_u32(&c[4..8])),
                        )
                    })
                    .collect();
                TcpOption::Sack(blocks)
            }
            option_kind::TIMESTAMP => {
                if body.len() != 8 {
                    return Err(malformed);
                }
                TcpOption::Timestamp {
                    value: be_u32(&body[0..4]),
                    echo: be_u32(&body[4..8]),
                }
            }
            _ => return Ok(None),
        };
        Ok(Some(opt))
    }
}

fn be_u16(b: &[u8]) -> u16 {
    u16::from_be_bytes([b[0], b[1]])
}

fn be_u32(b: &[u8]) -> u32 {
    u32::from_be_bytes([b[0], b[1], b[2], b[3]])
}

// ---------------------------------------------------------------------------
// Header
// ---------------------------------------------------------------------------

/// TCP header, fields in host order.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TcpHeader {
    pub source_port: u16,
    pub destination_port: u16,
    /// Sequence number of the first payload byte (or of the SYN/FIN).
    pub seq: SequenceNumber,
    /// Next sequence number expected from the peer.
    pub ack: SequenceNumber,
    /// Bitmask of [`flags`] constants.
    pub flags: u8,
    /// Advertised receive window, already right-shifted by the window scale.
    pub window: u16,
    /// Options in the order they appear on the wire.
    pub options: Vec<TcpOption>,
}

impl TcpHeader {
    pub fn has_flag(&self, flag: u8) -> bool {
        self.flags & flag != 0
    }

    pub fn has_option(&self, kind: u8) -> bool {
        self.options.iter().any(|o| o.kind() == kind)
    }

    pub fn option(&self, kind: u8) -> Option<&TcpOption> {
        self.options.iter().find(|o| o.kind() == kind)
    }

    /// Unpadded bytes taken by the options currently present.
    pub fn options_len(&self) -> usize {
        self.options.iter().map(TcpOption::encoded_len).sum()
    }

    /// Append `opt` if it still fits within [`MAX_OPTION_LEN`].
    ///
    /// Returns `false` (and leaves the header untouched) otherwise.
    pub fn append_option(&mut self, opt: TcpOption) -> bool {
        if self.options_len() + opt.encoded_len() > MAX_OPTION_LEN {
            return false;
        }
        self.options.push(opt);
        true
    }

    /// Header length on the wire including option padding.
    pub fn serialized_len(&self) -> usize {
        HEADER_LEN + (self.options_len() + 3) / 4 * 4
    }
}

impl fmt::Display for TcpHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} > {} [{}] Seq={} Ack={} Win={}",
            self.source_port,
            self.destination_port,
            flags::describe(self.flags),
            self.seq,
            self.ack,
            self.window
        )
    }
}

// ---------------------------------------------------------------------------
// Segment
// ---------------------------------------------------------------------------

/// A complete TCP segment: header + payload bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    pub header: TcpHeader,
    pub payload: Vec<u8>,
}

impl Segment {
    pub fn new(header: TcpHeader, payload: Vec<u8>) -> Self {
        Self { header, payload }
    }

    /// Serialise this segment into a newly allocated byte vector.
    ///
    /// The data offset and checksum are computed here.
    ///
    /// # Panics
    ///
    /// Panics if the options exceed [`MAX_OPTION_LEN`]; [`TcpHeader::append_option`]
    /// prevents that from happening.
    pub fn encode(&self) -> Vec<u8> {
        let h = &self.header;
        let header_len = h.serialized_len();
        assert!(
            header_len - HEADER_LEN <= MAX_OPTION_LEN,
            "options overflow the TCP header ({} bytes)",
            h.options_len()
        );

        let mut buf = vec![0u8; HEADER_LEN];
        buf[OFF_SRC_PORT..OFF_SRC_PORT + 2].copy_from_slice(&h.source_port.to_be_bytes());
        buf[OFF_DST_PORT..OFF_DST_PORT + 2].copy_from_slice(&h.destination_port.to_be_bytes());
        buf[OFF_SEQ..OFF_SEQ + 4].copy_from_slice(&h.seq.value().to_be_bytes());
        buf[OFF_ACK..OFF_ACK + 4].copy_from_slice(&h.ack.value().to_be_bytes());
        buf[OFF_DATA_OFFSET] = ((header_len / 4) as u8) << 4;
        buf[OFF_FLAGS] = h.flags;
        buf[OFF_WINDOW..OFF_WINDOW + 2].copy_from_slice(&h.window.to_be_bytes());
        // Checksum and urgent pointer stay zero for now.

        for opt in &h.options {
            opt.encode_into(&mut buf);
        }
        while buf.len() < header_len {
            buf.push(option_kind::END);
        }
        buf.extend_from_slice(&self.payload);

        let csum = internet_checksum(&buf);
        buf[OFF_CHECKSUM..OFF_CHECKSUM + 2].copy_from_slice(&csum.to_be_bytes());
        buf
    }

    /// Parse a [`Segment`] from a raw byte slice.
    ///
    /// Returns [`Err`] if:
    /// - `buf` is shorter than [`HEADER_LEN`],
    /// - the data offset points outside `buf`,
    /// - the checksum does not verify, or
    /// - an understood option has an impossible length.
    pub fn decode(buf: &[u8]) -> Result<Self, PacketError> {
        if buf.len() < HEADER_LEN {
            return Err(PacketError::BufferTooShort);
        }

        let header_len = usize::from(buf[OFF_DATA_OFFSET] >> 4) * 4;
        if header_len < HEADER_LEN || header_len > buf.len() {
            return Err(PacketError::BadDataOffset(header_len));
        }

        // Verify checksum: zero the stored field, recompute, compare.
        let stored = be_u16(&buf[OFF_CHECKSUM..]);
        let mut scratch = buf.to_vec();
        scratch[OFF_CHECKSUM..OFF_CHECKSUM + 2].copy_from_slice(&0u16.to_be_bytes());
        if internet_checksum(&scratch) != stored {
            return Err(PacketError::ChecksumFailed);
        }

        let header = TcpHeader {
            source_port: be_u16(&buf[OFF_SRC_PORT..]),
            destination_port: be_u16(&buf[OFF_DST_PORT..]),
            seq: SequenceNumber::new(be_u32(&buf[OFF_SEQ..])),
            ack: SequenceNumber::new(be_u32(&buf[OFF_ACK..])),
            flags: buf[OFF_FLAGS],
            window: be_u16(&buf[OFF_WINDOW..]),
            options: decode_options(&buf[OFF_URGENT + 2..header_len])?,
        };

        Ok(Segment {
            header,
            payload: buf[header_len..].to_vec(),
        })
    }
}

fn decode_options(mut raw: &[u8]) -> Result<Vec<TcpOption>, PacketError> {
    let mut options = Vec::new();
    while let Some(&kind) = raw.first() {
        match kind {
            option_kind::END => break,
            option_kind::NOP => {
                raw = &raw[1..];
            }
            _ => {
                let len = usize::from(*raw.get(1).ok_or(PacketError::MalformedOption { kind })?);
                if len < 2 || len > raw.len() {
                    return Err(PacketError::MalformedOption { kind });
                }
                if let Some(opt) = TcpOption::decode(kind, &raw[2..len])? {
                    options.push(opt);
                }
                raw = &raw[len..];
            }
        }
    }
    Ok(options)
}

/// Errors that can arise when parsing a raw segment.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PacketError {
    #[error("buffer too short to contain a header")]
    BufferTooShort,
    #[error("data offset of {0} bytes is outside the segment")]
    BadDataOffset(usize),
    #[error("checksum verification failed")]
    ChecksumFailed,
    #[error("malformed option of kind {kind}")]
    MalformedOption { kind: u8 },
}

/// Compute the Internet checksum (RFC 1071) over `data`.
///
/// Sum consecutive 16-bit big-endian words, fold the carry, return the
/// one's-complement.  The caller must zero any checksum field within `data`
/// before calling this function.
fn internet_checksum(data: &[u8]) -> u16 {
    let mut sum: u32 = 0;
    let mut i = 0;

    while i + 1 < data.len() {
        sum += u32::from(u16::from_be_bytes([data[i], data[i + 1]]));
        i += 2;
    }
    // Odd trailing byte: pad with a zero byte on the right.
    if i < data.len() {
        sum += u32::from(data[i]) << 8;
    }

    // Fold 32-bit sum into 16 bits.
    while sum >> 16 != 0 {
        sum = (sum & 0xffff) + (sum >> 16);
    }

    !(sum as u16)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_segment(seq: u32, ack: u32, flag_bits: u8, window: u16, payload: &[u8]) -> Segment {
        Segment::new(
            TcpHeader {
                source_port: 49153,
                destination_port: 50000,
                seq: SequenceNumber::new(seq),
                ack: SequenceNumber::new(ack),
                flags: flag_bits,
                window,
                options: Vec::new(),
            },
            payload.to_vec(),
        )
    }

    #[test]
    fn encode_decode_roundtrip() {
        let seg = make_segment(42, 7, flags::SYN | flags::ACK, 4096, b"hello");
        let decoded = Segment::decode(&seg.encode()).unwrap();
        assert_eq!(decoded, seg);
    }

    #[test]
    fn options_roundtrip_with_padding() {
        let mut seg = make_segment(1, 2, flags::SYN, 1000, b"");
        assert!(seg.header.append_option(TcpOption::WindowScale(7)));
        assert!(seg.header.append_option(TcpOption::SackPermitted));
        assert!(seg.header.append_option(TcpOption::Timestamp { value: 10, echo: 0 }));
        // 3 + 2 + 10 = 15 option bytes, padded to 16.
        assert_eq!(seg.header.serialized_len(), HEADER_LEN + 16);

        let bytes = seg.encode();
        assert_eq!(bytes[OFF_DATA_OFFSET] >> 4, 9);
        let decoded = Segment::decode(&bytes).unwrap();
        assert_eq!(decoded.header.options, seg.header.options);
    }

    #[test]
    fn sack_blocks_survive_the_wire() {
        let mut seg = make_segment(100, 200, flags::ACK, 512, b"xyz");
        let blocks = vec![
            SackBlock::new(SequenceNumber::new(300), SequenceNumber::new(400)),
            SackBlock::new(SequenceNumber::new(500), SequenceNumber::new(650)),
        ];
        assert!(seg.header.append_option(TcpOption::Sack(blocks.clone())));
        let decoded = Segment::decode(&seg.encode()).unwrap();
        assert_eq!(decoded.header.option(option_kind::SACK), Some(&TcpOption::Sack(blocks)));
        assert_eq!(decoded.payload, b"xyz");
    }

    #[test]
    fn append_option_refuses_overflow() {
        let mut h = TcpHeader::default();
        assert!(h.append_option(TcpOption::Timestamp { value: 1, echo: 2 }));
        let four = vec![SackBlock::new(SequenceNumber::new(0), SequenceNumber::new(1)); 4];
        // 10 + 34 = 44 > 40
        assert!(!h.append_option(TcpOption::Sack(four)));
        let three = vec![SackBlock::new(SequenceNumber::new(0), SequenceNumber::new(1)); 3];
        assert!(h.append_option(TcpOption::Sack(three)));
        assert_eq!(h.options_len(), 36);
    }

    #[test]
    fn unknown_option_is_skipped() {
        let mut bytes = make_segment(0, 0, flags::ACK, 0, b"").encode();
        // MSS (kind 2, len 4), NOP, NOP, END, END: 8 option bytes.
        bytes.extend_from_slice(&[option_kind::MSS, 4, 0x05, 0xb4, 1, 1, 0, 0]);
        bytes[OFF_DATA_OFFSET] = 7 << 4;
        bytes[OFF_CHECKSUM..OFF_CHECKSUM + 2].copy_from_slice(&[0, 0]);
        let csum = internet_checksum(&bytes);
        bytes[OFF_CHECKSUM..OFF_CHECKSUM + 2].copy_from_slice(&csum.to_be_bytes());

        let decoded = Segment::decode(&bytes).unwrap();
        assert!(decoded.header.options.is_empty());
        assert!(decoded.payload.is_empty());
    }

    #[test]
    fn decode_empty_buffer_returns_error() {
        assert_eq!(Segment::decode(&[]), Err(PacketError::BufferTooShort));
    }

    #[test]
    fn decode_short_header_returns_error() {
        assert_eq!(
            Segment::decode(&[0u8; HEADER_LEN - 1]),
            Err(PacketError::BufferTooShort)
        );
    }

    #[test]
    fn decode_bad_data_offset_returns_error() {
        let mut bytes = make_segment(0, 0, 0, 0, b"").encode();
        bytes[OFF_DATA_OFFSET] = 15 << 4;
        assert_eq!(Segment::decode(&bytes), Err(PacketError::BadDataOffset(60)));
    }

    #[test]
    fn decode_corrupt_byte_returns_checksum_error() {
        let mut bytes = make_segment(99, 0, flags::SYN, 1024, b"test").encode();
        bytes[OFF_SEQ] ^= 0xff;
        assert_eq!(Segment::decode(&bytes), Err(PacketError::ChecksumFailed));
    }

    #[test]
    fn seq_ack_big_endian_on_wire() {
        let bytes = make_segment(0x0102_0304, 0x0506_0708, 0, 0, b"").encode();
        assert_eq!(&bytes[OFF_SEQ..OFF_SEQ + 4], &[0x01, 0x02, 0x03, 0x04]);
        assert_eq!(&bytes[OFF_ACK..OFF_ACK + 4], &[0x05, 0x06, 0x07, 0x08]);
    }

    #[test]
    fn describe_flags() {
        assert_eq!(flags::describe(flags::SYN | flags::ACK), "SYN|ACK");
        assert_eq!(flags::describe(0), "-");
    }
}
