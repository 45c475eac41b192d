//! Metadata header codec for raw-PCM audio frames.
//!
//! Clients that declare `pcm: true` prefix every binary frame with a 16-byte
//! little-endian header carrying the capture sequence number, the end-of-chunk
//! wall-clock timestamp, and the chunk duration. The header is what makes
//! transcript latency attribution possible without server-side clocking.

use bytes::{Bytes, BytesMut};

use crate::error::AudioError;
use crate::protocol_constants::FRAME_HEADER_LEN;

/// Parsed metadata header of a raw-PCM frame.
///
/// `seq` wraps at 2^32; consumers must not assume monotonicity beyond
/// per-channel ordering. `capture_ts_ms` is end-of-chunk wall-clock.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FrameHeader {
    /// Per-channel frame sequence number.
    pub seq: u32,
    /// End-of-chunk capture timestamp (ms since epoch).
    pub capture_ts_ms: f64,
    /// Chunk duration (ms).
    pub duration_ms: f32,
}

impl FrameHeader {
    /// Encodes the header followed by the PCM payload into one wire frame.
    pub fn encode(&self, payload: &[u8]) -> Bytes {
        let mut buf = BytesMut::with_capacity(FRAME_HEADER_LEN + payload.len());
        buf.extend_from_slice(&self.seq.to_le_bytes());
        buf.extend_from_slice(&self.capture_ts_ms.to_le_bytes());
        buf.extend_from_slice(&self.duration_ms.to_le_bytes());
        buf.extend_from_slice(payload);
        buf.freeze()
    }

    /// Decodes a wire frame into its header and PCM payload.
    ///
    /// Fails when the frame is not strictly longer than the header; a frame
    /// with an empty payload carries no audio and is equally invalid.
    pub fn decode(frame: &Bytes) -> Result<(Self, Bytes), AudioError> {
        if frame.len() <= FRAME_HEADER_LEN {
            return Err(AudioError::InvalidFrame { len: frame.len() });
        }

        let seq = u32::from_le_bytes([frame[0], frame[1], frame[2], frame[3]]);
        let capture_ts_ms = f64::from_le_bytes([
            frame[4], frame[5], frame[6], frame[7], frame[8], frame[9], frame[10], frame[11],
        ]);
        let duration_ms = f32::from_le_bytes([frame[12], frame[13], frame[14], frame[15]]);

        let payload = frame.slice(FRAME_HEADER_LEN..);
        Ok((
            Self {
                seq,
                capture_ts_ms,
                duration_ms,
            },
            payload,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_preserves_header_and_payload() {
        let header = FrameHeader {
            seq: 42,
            capture_ts_ms: 1_700_000_123_456.789,
            duration_ms: 50.0,
        };
        let payload = vec![1u8, 2, 3, 4, 5, 6];

        let frame = header.encode(&payload);
        assert_eq!(frame.len(), FRAME_HEADER_LEN + payload.len());

        let (decoded, body) = FrameHeader::decode(&frame).unwrap();
        assert_eq!(decoded, header);
        assert_eq!(&body[..], &payload[..]);
    }

    #[test]
    fn seq_wraps_at_u32_max() {
        let header = FrameHeader {
            seq: u32::MAX,
            capture_ts_ms: 0.0,
            duration_ms: 20.0,
        };
        let frame = header.encode(&[0u8; 2]);
        let (decoded, _) = FrameHeader::decode(&frame).unwrap();
        assert_eq!(decoded.seq, u32::MAX);
        assert_eq!(decoded.seq.wrapping_add(1), 0);
    }

    #[test]
    fn decode_rejects_header_only_frame() {
        let frame = Bytes::from(vec![0u8; FRAME_HEADER_LEN]);
        let err = FrameHeader::decode(&frame).unwrap_err();
        assert!(matches!(err, AudioError::InvalidFrame { len: 16 }));
    }

    #[test]
    fn decode_rejects_short_frame() {
        let frame = Bytes::from(vec![0u8; 7]);
        assert!(FrameHeader::decode(&frame).is_err());
    }

    #[test]
    fn header_fields_land_at_documented_offsets() {
        let header = FrameHeader {
            seq: 0x0403_0201,
            capture_ts_ms: 2.0,
            duration_ms: 1.5,
        };
        let frame = header.encode(&[0xAA]);
        assert_eq!(&frame[0..4], &[0x01, 0x02, 0x03, 0x04]);
        assert_eq!(&frame[4..12], &2.0f64.to_le_bytes());
        assert_eq!(&frame[12..16], &1.5f32.to_le_bytes());
        assert_eq!(frame[16], 0xAA);
    }
}
