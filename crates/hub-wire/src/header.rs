//! Frame header serialization and parsing.
//!
//! Every frame on the wire is a fixed 24-byte big-endian header followed by
//! `payload_len` payload bytes. The first byte packs the frame class
//! (`major`, bits 0-1) together with the sub-protocol selector (bits 2-7).

use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};

/// Size of the fixed frame header in bytes.
pub const HEADER_LEN: usize = 24;

/// Maximum payload size accepted by the decoder (16 MiB).
pub const MAX_PAYLOAD: usize = 16 * 1024 * 1024;

/// Sub-protocol selector carried by authentication frames.
pub const SUB_PROTO_AUTH: u8 = 2;

/// Highest encodable sub-protocol selector (6 bits).
pub const MAX_SUB_PROTO: u8 = 63;

/// Frame class carried in bits 0-1 of the first header byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Major {
    /// Successful response.
    OkResp = 0,
    /// Error response.
    ErrResp = 1,
    /// One-way message.
    Msg = 2,
    /// Command expecting a response.
    Cmd = 3,
}

impl Major {
    /// Decodes the two low bits of a `TypeFmt` byte.
    #[must_use]
    pub const fn from_bits(bits: u8) -> Self {
        match bits & 0b11 {
            0 => Self::OkResp,
            1 => Self::ErrResp,
            2 => Self::Msg,
            _ => Self::Cmd,
        }
    }
}

/// Errors that can occur while encoding or decoding frames.
#[derive(Debug, Error)]
pub enum WireError {
    /// Underlying I/O error, including short reads mid-frame.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// The declared payload length exceeds [`MAX_PAYLOAD`].
    #[error("frame too large: max {max}, got {actual}")]
    FrameTooLarge {
        /// Maximum accepted payload size.
        max: usize,
        /// Declared payload size.
        actual: usize,
    },
    /// The sub-protocol selector does not fit in 6 bits.
    #[error("sub proto {0} out of range")]
    SubProtoOutOfRange(u8),
}

/// A parsed 24-byte frame header.
///
/// The two reserved trailing bytes are not represented: they encode as zero
/// and are ignored on decode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    /// Frame class (response / message / command).
    pub major: Major,
    /// Sub-protocol selector, `0..=63`.
    pub sub_proto: u8,
    /// Reserved bitfield (compression, priority); round-trips unchanged.
    pub flags: u8,
    /// Opaque correlation id chosen by the originator.
    pub msg_id: u32,
    /// Node id of the sender; 0 = unauthenticated.
    pub source: u32,
    /// Node id of the receiver; 0 = nearest handler / broadcast.
    pub target: u32,
    /// UTC seconds.
    pub timestamp: u32,
    /// Length of the payload following the header.
    pub payload_len: u32,
}

impl Header {
    /// Creates a header with the given class and sub-protocol, timestamped
    /// now, with all routing fields zeroed.
    ///
    /// # Errors
    ///
    /// Returns [`WireError::SubProtoOutOfRange`] if `sub_proto > 63`.
    pub fn new(major: Major, sub_proto: u8) -> Result<Self, WireError> {
        if sub_proto > MAX_SUB_PROTO {
            return Err(WireError::SubProtoOutOfRange(sub_proto));
        }
        Ok(Self {
            major,
            sub_proto,
            flags: 0,
            msg_id: 0,
            source: 0,
            target: 0,
            timestamp: unix_ts(),
            payload_len: 0,
        })
    }

    /// Returns the packed `TypeFmt` byte.
    #[must_use]
    pub const fn type_fmt(&self) -> u8 {
        (self.sub_proto << 2) | self.major as u8
    }

    /// Parses a raw 24-byte header. Reserved bytes are ignored.
    #[must_use]
    pub fn parse(buf: &[u8; HEADER_LEN]) -> Self {
        Self {
            major: Major::from_bits(buf[0]),
            sub_proto: (buf[0] >> 2) & 0x3F,
            flags: buf[1],
            msg_id: u32::from_be_bytes([buf[2], buf[3], buf[4], buf[5]]),
            source: u32::from_be_bytes([buf[6], buf[7], buf[8], buf[9]]),
            target: u32::from_be_bytes([buf[10], buf[11], buf[12], buf[13]]),
            timestamp: u32::from_be_bytes([buf[14], buf[15], buf[16], buf[17]]),
            payload_len: u32::from_be_bytes([buf[18], buf[19], buf[20], buf[21]]),
        }
    }

    /// Writes the header into `buf`. Reserved bytes are zeroed.
    pub fn write_to(&self, buf: &mut [u8; HEADER_LEN]) {
        buf[0] = self.type_fmt();
        buf[1] = self.flags;
        buf[2..6].copy_from_slice(&self.msg_id.to_be_bytes());
        buf[6..10].copy_from_slice(&self.source.to_be_bytes());
        buf[10..14].copy_from_slice(&self.target.to_be_bytes());
        buf[14..18].copy_from_slice(&self.timestamp.to_be_bytes());
        buf[18..22].copy_from_slice(&self.payload_len.to_be_bytes());
        buf[22] = 0;
        buf[23] = 0;
    }

    /// Derives a response header from a request header: same correlation id
    /// and flags, given class, re-stamped timestamp.
    #[must_use]
    pub fn reply(&self, major: Major) -> Self {
        Self {
            major,
            timestamp: unix_ts(),
            ..*self
        }
    }
}

/// Serializes a header plus payload into a single wire frame.
///
/// The header's `payload_len` is stamped from the payload slice, so the
/// output is always exactly `24 + payload.len()` bytes.
#[must_use]
#[allow(clippy::cast_possible_truncation)]
pub fn encode(hdr: &Header, payload: &[u8]) -> Vec<u8> {
    let mut stamped = *hdr;
    stamped.payload_len = payload.len() as u32;
    let mut out = Vec::with_capacity(HEADER_LEN + payload.len());
    let mut buf = [0u8; HEADER_LEN];
    stamped.write_to(&mut buf);
    out.extend_from_slice(&buf);
    out.extend_from_slice(payload);
    out
}

/// Reads exactly one frame from the stream, blocking until complete.
///
/// The payload buffer is only allocated after the declared length passes the
/// [`MAX_PAYLOAD`] check.
///
/// # Errors
///
/// Returns [`WireError::Io`] on short reads or transport failures and
/// [`WireError::FrameTooLarge`] when the declared payload exceeds the cap.
pub async fn read_frame<R>(reader: &mut R) -> Result<(Header, Vec<u8>), WireError>
where
    R: AsyncRead + Unpin,
{
    let mut buf = [0u8; HEADER_LEN];
    reader.read_exact(&mut buf).await?;
    let hdr = Header::parse(&buf);
    let len = hdr.payload_len as usize;
    if len > MAX_PAYLOAD {
        return Err(WireError::FrameTooLarge {
            max: MAX_PAYLOAD,
            actual: len,
        });
    }
    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;
    Ok((hdr, payload))
}

/// Current UTC time in whole seconds, truncated to the header field width.
#[must_use]
#[allow(clippy::cast_possible_truncation)]
pub fn unix_ts() -> u32 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as u32
}


#[cfg(test)]
mod proptests {
    use super::*;
    use proptest::prelude::*;

    fn arb_major() -> impl Strategy<Value = Major> {
        prop_oneof![
            Just(Major::OkResp),
            Just(Major::ErrResp),
            Just(Major::Msg),
            Just(Major::Cmd),
        ]
    }

    proptest! {
        #[test]
        fn header_write_parse_roundtrip(
            major in arb_major(),
            sub in 0u8..=63,
            flags in any::<u8>(),
            msg_id in any::<u32>(),
            source in any::<u32>(),
            target in any::<u32>(),
            timestamp in any::<u32>(),
            payload_len in any::<u32>(),
        ) {
            let hdr = Header {
                major, sub_proto: sub, flags, msg_id,
                source, target, timestamp, payload_len,
            };
            let mut buf = [0u8; HEADER_LEN];
            hdr.write_to(&mut buf);
            prop_assert_eq!(Header::parse(&buf), hdr);
        }

        #[test]
        fn bit_packing_preserves_major_and_sub(major in arb_major(), sub in 0u8..=63) {
            let hdr = Header::new(major, sub).unwrap();
            let mut buf = [0u8; HEADER_LEN];
            hdr.write_to(&mut buf);
            let parsed = Header::parse(&buf);
            prop_assert_eq!(parsed.major, major);
            prop_assert_eq!(parsed.sub_proto, sub);
        }

        #[test]
        fn encode_stamps_payload_len(payload in prop::collection::vec(any::<u8>(), 0..2048)) {
            let hdr = Header::new(Major::Msg, 1).unwrap();
            let frame = encode(&hdr, &payload);
            prop_assert_eq!(frame.len(), HEADER_LEN + payload.len());
            let mut raw = [0u8; HEADER_LEN];
            raw.copy_from_slice(&frame[..HEADER_LEN]);
            prop_assert_eq!(Header::parse(&raw).payload_len as usize, payload.len());
        }
    }
}
