//! Binary framing for the wire protocol
//!
//! Each frame is an unsigned LEB128 varint length prefix followed by one
//! bincode-serialized [`Envelope`]. The decoder is incremental: feed it raw
//! byte chunks as they arrive and drain complete envelopes.

use crate::envelope::Envelope;
use crate::errors::WireError;

// ----------------------------------------------------------------------------
// Constants
// ----------------------------------------------------------------------------

/// Default upper bound on a single frame body.
pub const DEFAULT_MAX_FRAME_SIZE: usize = 8 * 1024 * 1024;

/// Longest accepted varint prefix (5 bytes covers the full u32 range).
const MAX_VARINT_LEN: usize = 5;

// ----------------------------------------------------------------------------
// Varint Encoding
// ----------------------------------------------------------------------------

fn write_uvarint(buf: &mut Vec<u8>, mut value: u32) {
    while value >= 0x80 {
        buf.push((value as u8 & 0x7f) | 0x80);
        value >>= 7;
    }
    buf.push(value as u8);
}

/// Decode a varint from the head of `buf`. Returns the value and its encoded
/// width, or `None` when more bytes are needed.
fn read_uvarint(buf: &[u8]) -> Result<Option<(u32, usize)>, WireError> {
    let mut value: u64 = 0;
    for (index, byte) in buf.iter().enumerate() {
        if index == MAX_VARINT_LEN {
            return Err(WireError::LengthOverflow);
        }
        value |= u64::from(byte & 0x7f) << (7 * index);
        if byte & 0x80 == 0 {
            if value > u64::from(u32::MAX) {
                return Err(WireError::LengthOverflow);
            }
            return Ok(Some((value as u32, index + 1)));
        }
    }
    Ok(None)
}

// ----------------------------------------------------------------------------
// Frame Encoding
// ----------------------------------------------------------------------------

/// Serialize one envelope into a length-prefixed frame.
pub fn encode_frame(envelope: &Envelope, limit: usize) -> Result<Vec<u8>, WireError> {
    let body = bincode::serialize(envelope).map_err(WireError::Encode)?;
    if body.len() > limit {
        return Err(WireError::FrameTooLarge {
            length: body.len(),
            limit,
        });
    }

    let mut frame = Vec::with_capacity(body.len() + MAX_VARINT_LEN);
    write_uvarint(&mut frame, body.len() as u32);
    frame.extend_from_slice(&body);
    Ok(frame)
}

// ----------------------------------------------------------------------------
// Frame Decoding
// ----------------------------------------------------------------------------

/// Incremental frame decoder.
///
/// A [`WireError::Body`] from [`next_frame`](Self::next_frame) consumed the
/// offending frame, so decoding may continue on the same stream; any other
/// error means the stream has lost frame alignment and must be abandoned.
#[derive(Debug)]
pub struct FrameDecoder {
    buf: Vec<u8>,
    limit: usize,
}

impl FrameDecoder {
    /// Create a decoder enforcing the given frame-size limit
    pub fn new(limit: usize) -> Self {
        FrameDecoder {
            buf: Vec::new(),
            limit,
        }
    }

    /// Append raw bytes received from the transport
    pub fn feed(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Number of buffered, not yet consumed bytes
    pub fn pending_bytes(&self) -> usize {
        self.buf.len()
    }

    /// Drain the next complete envelope, if one is buffered
    pub fn next_frame(&mut self) -> Result<Option<Envelope>, WireError> {
        let (length, prefix) = match read_uvarint(&self.buf)? {
            Some(header) => header,
            None => return Ok(None),
        };

        let length = length as usize;
        if length > self.limit {
            return Err(WireError::FrameTooLarge {
                length,
                limit: self.limit,
            });
        }

        if self.buf.len() < prefix + length {
            return Ok(None);
        }

        let body: Vec<u8> = self.buf.drain(..prefix + length).skip(prefix).collect();
        match bincode::deserialize(&body) {
            Ok(envelope) => Ok(Some(envelope)),
            Err(error) => Err(WireError::Body(error)),
        }
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cvid::{Cvid, InstanceRole};
    use crate::payload::{Echo, Ping};

    fn sample_envelope() -> Envelope {
        Envelope::request(
            Cvid::generate(InstanceRole::Agent),
            Cvid::generate(InstanceRole::Server),
            Echo {
                data: "frame me".into(),
            },
        )
    }

    #[test]
    fn test_varint_roundtrip() {
        for value in [0u32, 1, 127, 128, 300, 65_535, u32::MAX] {
            let mut buf = Vec::new();
            write_uvarint(&mut buf, value);
            let (decoded, width) = read_uvarint(&buf).unwrap().unwrap();
            assert_eq!(decoded, value);
            assert_eq!(width, buf.len());
        }
    }

    #[test]
    fn test_varint_incomplete() {
        assert!(read_uvarint(&[0x80]).unwrap().is_none());
        assert!(read_uvarint(&[]).unwrap().is_none());
    }

    #[test]
    fn test_varint_overflow() {
        assert!(read_uvarint(&[0xff, 0xff, 0xff, 0xff, 0xff, 0x01]).is_err());
    }

    #[test]
    fn test_frame_roundtrip() {
        let envelope = sample_envelope();
        let frame = encode_frame(&envelope, DEFAULT_MAX_FRAME_SIZE).unwrap();

        let mut decoder = FrameDecoder::new(DEFAULT_MAX_FRAME_SIZE);
        decoder.feed(&frame);

        let decoded = decoder.next_frame().unwrap().unwrap();
        assert_eq!(decoded, envelope);
        assert!(decoder.next_frame().unwrap().is_none());
        assert_eq!(decoder.pending_bytes(), 0);
    }

    #[test]
    fn test_partial_feeds() {
        let envelope = sample_envelope();
        let frame = encode_frame(&envelope, DEFAULT_MAX_FRAME_SIZE).unwrap();

        let mut decoder = FrameDecoder::new(DEFAULT_MAX_FRAME_SIZE);
        for byte in &frame[..frame.len() - 1] {
            decoder.feed(&[*byte]);
            assert!(decoder.next_frame().unwrap().is_none());
        }
        decoder.feed(&frame[frame.len() - 1..]);
        assert_eq!(decoder.next_frame().unwrap().unwrap(), envelope);
    }

    #[test]
    fn test_multiple_frames_in_one_chunk() {
        let first = sample_envelope();
        let second = Envelope::new(Cvid::generate(InstanceRole::Client), Cvid::NONE, Ping);

        let mut chunk = encode_frame(&first, DEFAULT_MAX_FRAME_SIZE).unwrap();
        chunk.extend(encode_frame(&second, DEFAULT_MAX_FRAME_SIZE).unwrap());

        let mut decoder = FrameDecoder::new(DEFAULT_MAX_FRAME_SIZE);
        decoder.feed(&chunk);

        assert_eq!(decoder.next_frame().unwrap().unwrap(), first);
        assert_eq!(decoder.next_frame().unwrap().unwrap(), second);
        assert!(decoder.next_frame().unwrap().is_none());
    }

    #[test]
    fn test_oversize_frame_rejected() {
        let envelope = sample_envelope();
        let frame = encode_frame(&envelope, DEFAULT_MAX_FRAME_SIZE).unwrap();

        let mut decoder = FrameDecoder::new(4);
        decoder.feed(&frame);
        match decoder.next_frame() {
            Err(WireError::FrameTooLarge { .. }) => {}
            other => panic!("expected FrameTooLarge, got {:?}", other),
        }
    }

    #[test]
    fn test_undecodable_body_consumes_frame() {
        let mut decoder = FrameDecoder::new(DEFAULT_MAX_FRAME_SIZE);

        // A well-framed body that is not a valid envelope.
        let mut garbage = Vec::new();
        write_uvarint(&mut garbage, 3);
        garbage.extend_from_slice(&[0xff, 0xff, 0xff]);
        decoder.feed(&garbage);

        let error = decoder.next_frame().unwrap_err();
        assert!(error.is_recoverable());

        // The stream stays aligned: a valid frame afterwards still decodes.
        let envelope = sample_envelope();
        decoder.feed(&encode_frame(&envelope, DEFAULT_MAX_FRAME_SIZE).unwrap());
        assert_eq!(decoder.next_frame().unwrap().unwrap(), envelope);
    }

    #[test]
    fn test_encode_respects_limit() {
        let envelope = sample_envelope();
        assert!(matches!(
            encode_frame(&envelope, 2),
            Err(WireError::FrameTooLarge { .. })
        ));
    }
}
