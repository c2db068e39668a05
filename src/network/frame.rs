//! Length-prefixed framing
//!
//! Each frame is a 4-byte big-endian header followed by the payload. Only the
//! low 24 bits of the header carry the length; the high byte is written as
//! zero, which the listener relies on to tell link traffic from HTTP.

use bytes::{BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder, LengthDelimitedCodec};

use crate::error::{Error, Result};

/// Frame header size in bytes
pub const FRAME_HEADER_LEN: usize = 4;

/// Largest payload a header can describe
pub const MAX_FRAME_LEN: usize = 0x00ff_ffff;

/// Codec for length-prefixed frames
///
/// Decoding is delegated to a [`LengthDelimitedCodec`] reading the 3-byte
/// length at offset 1 and skipping the whole header.
#[derive(Debug, Clone)]
pub struct FrameCodec {
    inner: LengthDelimitedCodec,
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameCodec {
    pub fn new() -> Self {
        let inner = LengthDelimitedCodec::builder()
            .big_endian()
            .length_field_offset(1)
            .length_field_length(3)
            .length_adjustment(0)
            .num_skip(FRAME_HEADER_LEN)
            .max_frame_length(MAX_FRAME_LEN)
            .new_codec();
        Self { inner }
    }

    /// Decode the payload length from a header
    pub fn frame_len(header: [u8; FRAME_HEADER_LEN]) -> usize {
        (u32::from_be_bytes(header) & MAX_FRAME_LEN as u32) as usize
    }

    /// Frame a payload into a fresh buffer
    pub fn frame(payload: &[u8]) -> Result<Bytes> {
        let mut dst = BytesMut::with_capacity(FRAME_HEADER_LEN + payload.len());
        FrameCodec::new().encode(Bytes::copy_from_slice(payload), &mut dst)?;
        Ok(dst.freeze())
    }
}

impl Decoder for FrameCodec {
    type Item = BytesMut;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<BytesMut>> {
        Ok(self.inner.decode(src)?)
    }
}

impl Encoder<Bytes> for FrameCodec {
    type Error = Error;

    fn encode(&mut self, payload: Bytes, dst: &mut BytesMut) -> Result<()> {
        if payload.len() > MAX_FRAME_LEN {
            return Err(Error::Frame(format!(
                "payload of {} bytes exceeds {} byte limit",
                payload.len(),
                MAX_FRAME_LEN
            )));
        }
        dst.reserve(FRAME_HEADER_LEN + payload.len());
        dst.put_u32(payload.len() as u32);
        dst.extend_from_slice(&payload);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_multiple_buffered_frames() {
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::new();
        codec.encode(Bytes::from_static(b"first"), &mut buf).unwrap();
        codec.encode(Bytes::from_static(b"second"), &mut buf).unwrap();

        assert_eq!(&codec.decode(&mut buf).unwrap().unwrap()[..], b"first");
        assert_eq!(&codec.decode(&mut buf).unwrap().unwrap()[..], b"second");
        assert!(codec.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn test_decode_empty_frame() {
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::from(&[0u8, 0, 0, 0, 0, 0, 0, 1, b'x'][..]);
        assert!(codec.decode(&mut buf).unwrap().unwrap().is_empty());
        assert_eq!(&codec.decode(&mut buf).unwrap().unwrap()[..], b"x");
        assert!(buf.is_empty());
    }

    #[test]
    fn test_decode_partial_frame() {
        let frame = FrameCodec::frame(b"hello world").unwrap();
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::new();

        buf.extend_from_slice(&frame[..2]);
        assert!(codec.decode(&mut buf).unwrap().is_none());
        buf.extend_from_slice(&frame[2..7]);
        assert!(codec.decode(&mut buf).unwrap().is_none());
        buf.extend_from_slice(&frame[7..]);
        assert_eq!(&codec.decode(&mut buf).unwrap().unwrap()[..], b"hello world");
    }

    #[test]
    fn test_header_high_byte_ignored() {
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::new();
        buf.put_u32(0xAB00_0003);
        buf.extend_from_slice(b"abc");
        assert_eq!(&codec.decode(&mut buf).unwrap().unwrap()[..], b"abc");
        assert_eq!(FrameCodec::frame_len([0xff, 0, 1, 0]), 256);
    }

    #[test]
    fn test_header_is_big_endian_with_zero_high_byte() {
        let frame = FrameCodec::frame(&[7u8; 300]).unwrap();
        assert_eq!(&frame[..4], &[0, 0, 1, 44]);
        assert_eq!(frame.len(), 304);
    }

    #[test]
    fn test_oversized_payload_rejected() {
        let payload = Bytes::from(vec![0u8; MAX_FRAME_LEN + 1]);
        let mut buf = BytesMut::new();
        assert!(FrameCodec::new().encode(payload, &mut buf).is_err());
    }
}
