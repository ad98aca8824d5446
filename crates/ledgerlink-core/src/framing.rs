//! Message framing for the data channel
//!
//! Messages of any length are split into frames that each fit one datagram
//! of the underlying channel.
//!
//! Wire format (big-endian, one frame per datagram):
//! - 4 bytes: message id
//! - 4 bytes: frame index
//! - 4 bytes: frame count
//! - N bytes: payload (0..=FRAME_PAYLOAD_SIZE)

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder};

/// Payload bytes carried by every frame except the last one of a message.
///
/// Shared protocol constant: peers using a different value cannot interoperate.
pub const FRAME_PAYLOAD_SIZE: usize = 16 * 1024;

/// Fixed header length
pub const FRAME_HEADER_LEN: usize = 12;

/// Largest datagram the codec produces
pub const MAX_FRAME_LEN: usize = FRAME_HEADER_LEN + FRAME_PAYLOAD_SIZE;

/// Framing errors
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("Datagram too short for frame header: {0} bytes")]
    Truncated(usize),
    #[error("Frame payload too large: {0} bytes (max {FRAME_PAYLOAD_SIZE})")]
    PayloadTooLarge(usize),
    #[error("Frame count must be at least 1")]
    ZeroFrameCount,
    #[error("Frame index {index} out of range for {count} frames")]
    IndexOutOfRange { index: u32, count: u32 },
    #[error("Non-final frame {index} carries {len} bytes (expected {FRAME_PAYLOAD_SIZE})")]
    ShortFrame { index: u32, len: usize },
    #[error("Message too large to frame: {0} bytes")]
    MessageTooLarge(usize),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// A single frame of a message
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Frame {
    /// Sender-local message identifier
    pub message_id: u32,
    /// Position of this frame within the message
    pub frame_index: u32,
    /// Total frames in the message (at least 1)
    pub frame_count: u32,
    /// Payload slice
    pub payload: Bytes,
}

impl Frame {
    /// Create a new frame
    pub fn new(message_id: u32, frame_index: u32, frame_count: u32, payload: impl Into<Bytes>) -> Self {
        Self {
            message_id,
            frame_index,
            frame_count,
            payload: payload.into(),
        }
    }

    /// Whether this frame holds the final index of its message
    pub fn is_final(&self) -> bool {
        self.frame_index.checked_add(1) == Some(self.frame_count)
    }

    /// Byte offset of this frame's payload within the reassembled message
    pub fn offset(&self) -> usize {
        self.frame_index as usize * FRAME_PAYLOAD_SIZE
    }

    /// Check the structural invariants of a frame
    pub fn validate(&self) -> Result<(), FrameError> {
        if self.frame_count == 0 {
            return Err(FrameError::ZeroFrameCount);
        }
        if self.frame_index >= self.frame_count {
            return Err(FrameError::IndexOutOfRange {
                index: self.frame_index,
                count: self.frame_count,
            });
        }
        if self.payload.len() > FRAME_PAYLOAD_SIZE {
            return Err(FrameError::PayloadTooLarge(self.payload.len()));
        }
        if !self.is_final() && self.payload.len() != FRAME_PAYLOAD_SIZE {
            return Err(FrameError::ShortFrame {
                index: self.frame_index,
                len: self.payload.len(),
            });
        }
        Ok(())
    }

    /// Encoded length on the wire
    pub fn encoded_len(&self) -> usize {
        FRAME_HEADER_LEN + self.payload.len()
    }
}

/// Number of frames needed for a message of `len` bytes (never less than 1)
pub fn frame_count_for(len: usize) -> usize {
    len.div_ceil(FRAME_PAYLOAD_SIZE).max(1)
}

/// Split a message into its frames, in ascending index order.
///
/// Payloads are zero-copy slices of `message`. An empty message yields a
/// single empty frame.
pub fn split_message(message_id: u32, message: &Bytes) -> Result<Vec<Frame>, FrameError> {
    let count = frame_count_for(message.len());
    let frame_count = u32::try_from(count).map_err(|_| FrameError::MessageTooLarge(message.len()))?;

    let frames = (0..count)
        .map(|index| {
            let start = index * FRAME_PAYLOAD_SIZE;
            let end = (start + FRAME_PAYLOAD_SIZE).min(message.len());
            Frame::new(message_id, index as u32, frame_count, message.slice(start..end))
        })
        .collect();
    Ok(frames)
}

/// Datagram codec for frames
///
/// Every buffer handed to [`Decoder::decode`] is treated as exactly one
/// datagram: the header is read and the remainder becomes the payload.
#[derive(Clone, Copy, Debug, Default)]
pub struct FrameCodec;

impl FrameCodec {
    /// Create a new codec
    pub fn new() -> Self {
        Self
    }

    /// Encode a frame into a standalone datagram
    pub fn encode_frame(&mut self, frame: Frame) -> Result<Bytes, FrameError> {
        let mut buf = BytesMut::with_capacity(frame.encoded_len());
        self.encode(frame, &mut buf)?;
        Ok(buf.freeze())
    }

    /// Decode one datagram into a frame
    pub fn decode_datagram(&mut self, datagram: &[u8]) -> Result<Frame, FrameError> {
        let mut buf = BytesMut::from(datagram);
        self.decode(&mut buf)?.ok_or(FrameError::Truncated(0))
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = FrameError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.is_empty() {
            return Ok(None);
        }
        if src.len() < FRAME_HEADER_LEN {
            let len = src.len();
            src.clear();
            return Err(FrameError::Truncated(len));
        }

        let message_id = src.get_u32();
        let frame_index = src.get_u32();
        let frame_count = src.get_u32();
        let payload = src.split().freeze();

        let frame = Frame {
            message_id,
            frame_index,
            frame_count,
            payload,
        };
        frame.validate()?;
        Ok(Some(frame))
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = FrameError;

    fn encode(&mut self, item: Frame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        item.validate()?;

        dst.reserve(item.encoded_len());
        dst.put_u32(item.message_id);
        dst.put_u32(item.frame_index);
        dst.put_u32(item.frame_count);
        dst.put_slice(&item.payload);

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_layout() {
        let mut codec = FrameCodec::new();
        let frame = Frame::new(1, 0, 1, vec![0x01, 0x02, 0x03]);

        let wire = codec.encode_frame(frame.clone()).unwrap();
        assert_eq!(
            wire.as_ref(),
            &[0, 0, 0, 1, 0, 0, 0, 0, 0, 0, 0, 1, 0x01, 0x02, 0x03]
        );

        let decoded = codec.decode_datagram(&wire).unwrap();
        assert_eq!(decoded, frame);
    }

    #[test]
    fn test_empty_payload_frame() {
        let mut codec = FrameCodec::new();
        let wire = codec.encode_frame(Frame::new(9, 0, 1, Bytes::new())).unwrap();
        assert_eq!(wire.len(), FRAME_HEADER_LEN);

        let decoded = codec.decode_datagram(&wire).unwrap();
        assert!(decoded.payload.is_empty());
        assert!(decoded.is_final());
    }

    #[test]
    fn test_truncated_datagram() {
        let mut codec = FrameCodec::new();
        let result = codec.decode_datagram(&[0, 0, 0, 1, 0]);
        assert!(matches!(result, Err(FrameError::Truncated(5))));
    }

    #[test]
    fn test_rejects_bad_indices() {
        let mut codec = FrameCodec::new();
        let zero_count = [0, 0, 0, 1, 0, 0, 0, 0, 0, 0, 0, 0];
        assert!(matches!(
            codec.decode_datagram(&zero_count),
            Err(FrameError::ZeroFrameCount)
        ));

        let out_of_range = [0, 0, 0, 1, 0, 0, 0, 2, 0, 0, 0, 2];
        assert!(matches!(
            codec.decode_datagram(&out_of_range),
            Err(FrameError::IndexOutOfRange { index: 2, count: 2 })
        ));
    }

    #[test]
    fn test_is_final_at_index_limit() {
        assert!(!Frame::new(1, u32::MAX, u32::MAX, Bytes::new()).is_final());
        assert!(Frame::new(1, u32::MAX - 1, u32::MAX, Bytes::new()).is_final());

        let mut codec = FrameCodec::new();
        let max_index = [0, 0, 0, 1, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff];
        assert!(matches!(
            codec.decode_datagram(&max_index),
            Err(FrameError::IndexOutOfRange { .. })
        ));
    }

    #[test]
    fn test_rejects_short_non_final_frame() {
        let mut codec = FrameCodec::new();
        let frame = Frame::new(1, 0, 2, vec![0u8; 10]);
        assert!(matches!(
            codec.encode_frame(frame),
            Err(FrameError::ShortFrame { index: 0, len: 10 })
        ));
    }

    #[test]
    fn test_rejects_oversized_payload() {
        let mut codec = FrameCodec::new();
        let mut wire = vec![0, 0, 0, 1, 0, 0, 0, 0, 0, 0, 0, 1];
        wire.extend(std::iter::repeat(0u8).take(FRAME_PAYLOAD_SIZE + 1));
        assert!(matches!(
            codec.decode_datagram(&wire),
            Err(FrameError::PayloadTooLarge(_))
        ));
    }

    #[test]
    fn test_frame_count_for() {
        assert_eq!(frame_count_for(0), 1);
        assert_eq!(frame_count_for(1), 1);
        assert_eq!(frame_count_for(FRAME_PAYLOAD_SIZE - 1), 1);
        assert_eq!(frame_count_for(FRAME_PAYLOAD_SIZE), 1);
        assert_eq!(frame_count_for(FRAME_PAYLOAD_SIZE + 1), 2);
    }

    #[test]
    fn test_split_message_sizes() {
        let message = Bytes::from(vec![0xabu8; FRAME_PAYLOAD_SIZE * 2 + 5]);
        let frames = split_message(3, &message).unwrap();

        assert_eq!(frames.len(), 3);
        assert!(frames.iter().all(|f| f.frame_count == 3 && f.message_id == 3));
        assert_eq!(frames[0].payload.len(), FRAME_PAYLOAD_SIZE);
        assert_eq!(frames[1].payload.len(), FRAME_PAYLOAD_SIZE);
        assert_eq!(frames[2].payload.len(), 5);
        for (i, frame) in frames.iter().enumerate() {
            assert_eq!(frame.frame_index as usize, i);
            frame.validate().unwrap();
        }
    }

    #[test]
    fn test_split_empty_message() {
        let frames = split_message(0, &Bytes::new()).unwrap();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].frame_count, 1);
        assert!(frames[0].payload.is_empty());
    }
}
