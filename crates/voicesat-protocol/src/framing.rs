//! Varint length-prefixed framing.
//!
//! ```text
//! +------+-----------------+------------------+-----------------+
//! | 0x00 | varint length   | varint type id   | payload         |
//! +------+-----------------+------------------+-----------------+
//! ```
//!
//! [`FrameCodec`] plugs into `tokio_util::codec::Framed`; it buffers partial
//! reads and yields zero or more frames per chunk.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::MAX_FRAME_SIZE;
use crate::error::{ProtocolError, ProtocolResult};

/// Indicator byte of a plaintext frame.
pub const FRAME_INDICATOR: u8 = 0x00;

/// Longest legal varint encoding of a u64.
const MAX_VARINT_LEN: usize = 10;

/// One type-tagged unit on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Message type identifier.
    pub type_id: u32,
    /// Encoded payload.
    pub payload: Bytes,
}

impl Frame {
    /// Creates a new frame.
    pub fn new(type_id: u32, payload: impl Into<Bytes>) -> Self {
        Self {
            type_id,
            payload: payload.into(),
        }
    }

    /// Number of bytes this frame occupies on the wire.
    pub fn encoded_len(&self) -> usize {
        1 + prost::encoding::encoded_len_varint(self.payload.len() as u64)
            + prost::encoding::encoded_len_varint(u64::from(self.type_id))
            + self.payload.len()
    }
}

/// Encodes a frame.
///
/// # Example
///
/// ```rust
/// use voicesat_protocol::encode_frame;
///
/// let bytes = encode_frame(7, &[]).unwrap();
/// assert_eq!(&bytes[..], &[0x00, 0x00, 0x07]);
/// ```
pub fn encode_frame(type_id: u32, payload: &[u8]) -> ProtocolResult<BytesMut> {
    let mut dst = BytesMut::new();
    encode_into(type_id, payload, &mut dst)?;
    Ok(dst)
}

fn encode_into(type_id: u32, payload: &[u8], dst: &mut BytesMut) -> ProtocolResult<()> {
    if payload.len() > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge {
            size: payload.len() as u64,
            max: MAX_FRAME_SIZE,
        });
    }

    dst.reserve(1 + 2 * MAX_VARINT_LEN + payload.len());
    dst.put_u8(FRAME_INDICATOR);
    prost::encoding::encode_varint(payload.len() as u64, dst);
    prost::encoding::encode_varint(u64::from(type_id), dst);
    dst.put_slice(payload);
    Ok(())
}

/// Decodes the first frame in `data`.
///
/// Returns the frame and the number of bytes it consumed, or `Ok(None)`
/// when `data` does not yet hold a complete frame.
///
/// # Example
///
/// ```rust
/// use voicesat_protocol::{decode_frame, encode_frame};
///
/// let bytes = encode_frame(9, b"hi").unwrap();
/// assert!(decode_frame(&bytes[..2]).unwrap().is_none());
///
/// let (frame, used) = decode_frame(&bytes).unwrap().unwrap();
/// assert_eq!(frame.type_id, 9);
/// assert_eq!(used, bytes.len());
/// ```
pub fn decode_frame(data: &[u8]) -> ProtocolResult<Option<(Frame, usize)>> {
    let Some(header) = parse_header(data, MAX_FRAME_SIZE)? else {
        return Ok(None);
    };
    let end = header.len + header.payload_len;
    if data.len() < end {
        return Ok(None);
    }

    let frame = Frame::new(header.type_id, Bytes::copy_from_slice(&data[header.len..end]));
    Ok(Some((frame, end)))
}

struct Header {
    type_id: u32,
    /// Bytes taken by indicator and both varints.
    len: usize,
    payload_len: usize,
}

fn parse_header(data: &[u8], max_frame_size: usize) -> ProtocolResult<Option<Header>> {
    let Some(&indicator) = data.first() else {
        return Ok(None);
    };
    if indicator != FRAME_INDICATOR {
        return Err(ProtocolError::InvalidPreamble(indicator));
    }

    let mut offset = 1;
    let Some((payload_len, used)) = read_varint(&data[offset..])? else {
        return Ok(None);
    };
    // Checked before the type varint so a hostile length is refused early.
    if payload_len > max_frame_size as u64 {
        return Err(ProtocolError::FrameTooLarge {
            size: payload_len,
            max: max_frame_size,
        });
    }
    offset += used;

    let Some((type_id, used)) = read_varint(&data[offset..])? else {
        return Ok(None);
    };
    let type_id = u32::try_from(type_id).map_err(|_| ProtocolError::VarintOverflow)?;
    offset += used;

    Ok(Some(Header {
        type_id,
        len: offset,
        payload_len: payload_len as usize,
    }))
}

/// Reads a base-128 varint, `Ok(None)` if the input ends mid-varint.
fn read_varint(data: &[u8]) -> ProtocolResult<Option<(u64, usize)>> {
    let mut value: u64 = 0;
    for (i, &byte) in data.iter().enumerate() {
        if i == MAX_VARINT_LEN {
            return Err(ProtocolError::VarintOverflow);
        }
        let bits = u64::from(byte & 0x7f);
        if i == MAX_VARINT_LEN - 1 && bits > 1 {
            return Err(ProtocolError::VarintOverflow);
        }
        value |= bits << (7 * i);
        if byte & 0x80 == 0 {
            return Ok(Some((value, i + 1)));
        }
    }
    if data.len() >= MAX_VARINT_LEN {
        return Err(ProtocolError::VarintOverflow);
    }
    Ok(None)
}

/// Streaming codec for use with `tokio_util::codec::Framed`.
#[derive(Debug, Clone)]
pub struct FrameCodec {
    max_frame_size: usize,
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameCodec {
    /// Creates a codec with the default size limit.
    pub fn new() -> Self {
        Self {
            max_frame_size: MAX_FRAME_SIZE,
        }
    }

    /// Creates a codec with a custom size limit.
    pub fn with_max_frame_size(max_frame_size: usize) -> Self {
        Self { max_frame_size }
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, ProtocolError> {
        let Some(header) = parse_header(src, self.max_frame_size)? else {
            return Ok(None);
        };
        let end = header.len + header.payload_len;
        if src.len() < end {
            src.reserve(end - src.len());
            return Ok(None);
        }

        src.advance(header.len);
        let payload = src.split_to(header.payload_len).freeze();
        Ok(Some(Frame::new(header.type_id, payload)))
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = ProtocolError;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<(), ProtocolError> {
        encode_into(frame.type_id, &frame.payload, dst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feed(codec: &mut FrameCodec, buffer: &mut BytesMut, chunk: &[u8]) -> Vec<Frame> {
        buffer.extend_from_slice(chunk);
        let mut frames = Vec::new();
        while let Some(frame) = codec.decode(buffer).unwrap() {
            frames.push(frame);
        }
        frames
    }

    fn sample_stream() -> (Vec<Frame>, Vec<u8>) {
        let frames = vec![
            Frame::new(1, b"hello".to_vec()),
            Frame::new(7, Bytes::new()),
            Frame::new(106, vec![0xABu8; 300]),
            Frame::new(9999, b"future".to_vec()),
        ];
        let mut bytes = Vec::new();
        for frame in &frames {
            bytes.extend_from_slice(&encode_frame(frame.type_id, &frame.payload).unwrap());
        }
        (frames, bytes)
    }

    #[test]
    fn encode_layout() {
        let bytes = encode_frame(300, b"abc").unwrap();
        // 300 = 0b1_0010_1100 -> 0xAC 0x02
        assert_eq!(&bytes[..], &[0x00, 0x03, 0xAC, 0x02, b'a', b'b', b'c']);
    }

    #[test]
    fn encoded_len_matches() {
        let frame = Frame::new(300, vec![1u8; 200]);
        let bytes = encode_frame(frame.type_id, &frame.payload).unwrap();
        assert_eq!(frame.encoded_len(), bytes.len());
    }

    #[test]
    fn decode_roundtrip() {
        let bytes = encode_frame(92, b"payload").unwrap();
        let (frame, used) = decode_frame(&bytes).unwrap().unwrap();
        assert_eq!(frame, Frame::new(92, b"payload".to_vec()));
        assert_eq!(used, bytes.len());
    }

    #[test]
    fn decode_needs_more_data() {
        let bytes = encode_frame(92, b"payload").unwrap();
        for cut in 0..bytes.len() {
            assert!(decode_frame(&bytes[..cut]).unwrap().is_none(), "cut at {cut}");
        }
    }

    #[test]
    fn decode_reports_consumed_bytes_with_trailing_data() {
        let mut bytes = encode_frame(8, &[]).unwrap();
        bytes.extend_from_slice(&[0x00, 0x05]);
        let (frame, used) = decode_frame(&bytes).unwrap().unwrap();
        assert_eq!(frame.type_id, 8);
        assert_eq!(used, 3);
    }

    #[test]
    fn invalid_indicator_is_fatal() {
        let err = decode_frame(&[0x01, 0x00, 0x07]).unwrap_err();
        assert!(matches!(err, ProtocolError::InvalidPreamble(0x01)));
        assert!(err.is_fatal());
    }

    #[test]
    fn oversized_length_is_rejected_before_payload_arrives() {
        let mut bytes = vec![0x00];
        prost::encoding::encode_varint((MAX_FRAME_SIZE + 1) as u64, &mut bytes);
        let err = decode_frame(&bytes).unwrap_err();
        assert!(matches!(err, ProtocolError::FrameTooLarge { .. }));
    }

    #[test]
    fn encode_rejects_oversized_payload() {
        let payload = vec![0u8; MAX_FRAME_SIZE + 1];
        assert!(matches!(
            encode_frame(1, &payload),
            Err(ProtocolError::FrameTooLarge { .. })
        ));
    }

    #[test]
    fn overlong_varint_is_rejected() {
        let mut bytes = vec![0x00];
        bytes.extend_from_slice(&[0xFF; 11]);
        assert!(matches!(
            decode_frame(&bytes),
            Err(ProtocolError::VarintOverflow)
        ));
    }

    #[test]
    fn type_id_beyond_u32_is_rejected() {
        let mut bytes = vec![0x00, 0x00];
        prost::encoding::encode_varint(u64::from(u32::MAX) + 1, &mut bytes);
        assert!(matches!(
            decode_frame(&bytes),
            Err(ProtocolError::VarintOverflow)
        ));
    }

    #[test]
    fn codec_yields_every_frame_of_one_chunk() {
        let (expected, bytes) = sample_stream();
        let mut codec = FrameCodec::new();
        let mut buffer = BytesMut::new();
        assert_eq!(feed(&mut codec, &mut buffer, &bytes), expected);
        assert!(buffer.is_empty());
    }

    #[test]
    fn codec_reassembles_across_any_split() {
        let (expected, bytes) = sample_stream();
        for split in 0..=bytes.len() {
            let mut codec = FrameCodec::new();
            let mut buffer = BytesMut::new();
            let mut frames = feed(&mut codec, &mut buffer, &bytes[..split]);
            frames.extend(feed(&mut codec, &mut buffer, &bytes[split..]));
            assert_eq!(frames, expected, "split at {split}");
        }
    }

    #[test]
    fn codec_reassembles_byte_by_byte() {
        let (expected, bytes) = sample_stream();
        let mut codec = FrameCodec::new();
        let mut buffer = BytesMut::new();
        let mut frames = Vec::new();
        for byte in &bytes {
            frames.extend(feed(&mut codec, &mut buffer, std::slice::from_ref(byte)));
        }
        assert_eq!(frames, expected);
    }

    #[test]
    fn codec_honours_custom_limit() {
        let bytes = encode_frame(1, &[0u8; 64]).unwrap();
        let mut codec = FrameCodec::with_max_frame_size(16);
        let mut buffer = BytesMut::from(&bytes[..]);
        assert!(matches!(
            codec.decode(&mut buffer),
            Err(ProtocolError::FrameTooLarge { size: 64, max: 16 })
        ));
    }

    #[test]
    fn codec_encoder_matches_encode_frame() {
        let mut codec = FrameCodec::new();
        let mut dst = BytesMut::new();
        codec.encode(Frame::new(64, b"state".to_vec()), &mut dst).unwrap();
        assert_eq!(dst, encode_frame(64, b"state").unwrap());
    }
}
