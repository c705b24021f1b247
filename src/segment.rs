//! On-wire segment format.
//!
//! A segment is a fixed-size header followed by the payload, all in network
//! byte order:
//!
//! ```text
//! offset 0   u32  sequence number (byte offset; SYN and FIN consume one)
//! offset 4   u32  cumulative ack number (valid on ACK-bearing segments)
//! offset 8   u8   flags
//! offset 9   u16  advertised receive window, in segments
//! offset 11  u16  payload length
//! offset 13  u32  CRC-32 over the segment with this field zeroed
//! offset 17  ...  payload
//! ```
//!
//! Decoding is strict: short buffers, length mismatches, unknown flag bits and
//! checksum failures are all reported as [DecodeError] so the receive loop can
//! drop the datagram without ever panicking on hostile input.

use bitflags::bitflags;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use bytes_varint::try_get_fixed::TryGetFixedSupport;
use crc::Crc;
use thiserror::Error;

/// Size of the fixed segment header in bytes.
pub const HEADER_LEN: usize = 17;

const CHECKSUM_OFFSET: usize = 13;

const CRC32: Crc<u32> = Crc::<u32>::new(&crc::CRC_32_ISCSI);

bitflags! {
    /// Role markers of a segment. DATA segments piggyback an ACK, so DATA and
    ///  ACK regularly occur together.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct SegmentFlags: u8 {
        const SYN  = 0b0000_0001;
        const ACK  = 0b0000_0010;
        const FIN  = 0b0000_0100;
        const DATA = 0b0000_1000;
    }
}

/// Why an incoming datagram failed to parse as a segment.
///
/// These are never fatal: the receiving loop counts the failure, drops the
///  datagram and relies on retransmission to repair the stream.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum DecodeError {
    #[error("malformed segment: {0}")]
    Malformed(&'static str),
    #[error("segment checksum mismatch")]
    ChecksumMismatch,
}

/// The atomic unit on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    pub seq: u32,
    pub ack: u32,
    pub flags: SegmentFlags,
    pub window: u16,
    pub payload: Bytes,
}

impl Segment {
    pub fn syn(seq: u32, window: u16) -> Segment {
        Segment {
            seq,
            ack: 0,
            flags: SegmentFlags::SYN,
            window,
            payload: Bytes::new(),
        }
    }

    pub fn syn_ack(seq: u32, ack: u32, window: u16) -> Segment {
        Segment {
            seq,
            ack,
            flags: SegmentFlags::SYN | SegmentFlags::ACK,
            window,
            payload: Bytes::new(),
        }
    }

    pub fn ack(ack: u32, window: u16) -> Segment {
        Segment {
            seq: 0,
            ack,
            flags: SegmentFlags::ACK,
            window,
            payload: Bytes::new(),
        }
    }

    pub fn data(seq: u32, ack: u32, window: u16, payload: Bytes) -> Segment {
        Segment {
            seq,
            ack,
            flags: SegmentFlags::DATA | SegmentFlags::ACK,
            window,
            payload,
        }
    }

    pub fn fin(seq: u32) -> Segment {
        Segment {
            seq,
            ack: 0,
            flags: SegmentFlags::FIN,
            window: 0,
            payload: Bytes::new(),
        }
    }

    pub fn fin_ack(ack: u32, window: u16) -> Segment {
        Segment {
            seq: 0,
            ack,
            flags: SegmentFlags::FIN | SegmentFlags::ACK,
            window,
            payload: Bytes::new(),
        }
    }

    /// Serializes the segment into `buf`, appending header and payload and
    ///  patching in the checksum. Total for any segment whose payload length
    ///  fits the wire format (which the segmenting caller guarantees).
    pub fn encode(&self, buf: &mut BytesMut) {
        debug_assert!(self.payload.len() <= u16::MAX as usize);

        let start = buf.len();
        buf.put_u32(self.seq);
        buf.put_u32(self.ack);
        buf.put_u8(self.flags.bits());
        buf.put_u16(self.window);
        buf.put_u16(self.payload.len() as u16);
        buf.put_u32(0);
        buf.put_slice(&self.payload);

        let checksum = CRC32.checksum(&buf[start..]);
        let checksum_start = start + CHECKSUM_OFFSET;
        buf[checksum_start..checksum_start + 4].copy_from_slice(&checksum.to_be_bytes());
    }

    /// Parses one datagram. The datagram must contain exactly one segment,
    ///  trailing bytes are treated as corruption.
    pub fn decode(datagram: &[u8]) -> Result<Segment, DecodeError> {
        let mut buf = datagram;
        let seq = buf.try_get_u32().map_err(|_| DecodeError::Malformed("truncated header"))?;
        let ack = buf.try_get_u32().map_err(|_| DecodeError::Malformed("truncated header"))?;
        let raw_flags = buf.try_get_u8().map_err(|_| DecodeError::Malformed("truncated header"))?;
        let window = buf.try_get_u16().map_err(|_| DecodeError::Malformed("truncated header"))?;
        let payload_len = buf.try_get_u16().map_err(|_| DecodeError::Malformed("truncated header"))?;
        let checksum = buf.try_get_u32().map_err(|_| DecodeError::Malformed("truncated header"))?;

        let flags = SegmentFlags::from_bits(raw_flags)
            .ok_or(DecodeError::Malformed("unknown flag bits"))?;

        if buf.remaining() < payload_len as usize {
            return Err(DecodeError::Malformed("payload shorter than declared"));
        }
        if buf.remaining() > payload_len as usize {
            return Err(DecodeError::Malformed("trailing bytes after payload"));
        }

        let mut digest = CRC32.digest();
        digest.update(&datagram[..CHECKSUM_OFFSET]);
        digest.update(&[0u8; 4]);
        digest.update(buf);
        if digest.finalize() != checksum {
            return Err(DecodeError::ChecksumMismatch);
        }

        Ok(Segment {
            seq,
            ack,
            flags,
            window,
            payload: Bytes::copy_from_slice(buf),
        })
    }
}
