//! Length-prefixed binary framing of envelopes
//!
//! Each frame is a 4-byte big-endian length followed by that many bytes of
//! UTF-8 JSON. One WebSocket binary message may carry several concatenated
//! frames; the decoder consumes them all.

use crate::protocol::constants::MAX_FRAME_SIZE;
use crate::{Error, Result};

/// Frame a payload for transmission.
///
/// Rejects payloads over the wire cap before any bytes hit a socket.
pub fn encode_frame(payload: &[u8]) -> Result<Vec<u8>> {
    if payload.len() > MAX_FRAME_SIZE {
        return Err(Error::PayloadTooLarge {
            size: payload.len(),
            max: MAX_FRAME_SIZE,
        });
    }

    let mut frame = Vec::with_capacity(4 + payload.len());
    frame.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    frame.extend_from_slice(payload);
    Ok(frame)
}

/// Incremental frame decoder.
///
/// Owned by exactly one reader task per socket; the buffer is never shared.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buffer: Vec<u8>,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one binary message and drain every complete frame it holds.
    ///
    /// Oversized length prefixes fail the whole connection; a decoder that
    /// skipped ahead would desynchronize from the stream.
    pub fn push(&mut self, data: &[u8]) -> Result<Vec<Vec<u8>>> {
        self.buffer.extend_from_slice(data);

        let mut frames = Vec::new();
        loop {
            if self.buffer.len() < 4 {
                break;
            }

            let len = u32::from_be_bytes(
                self.buffer[..4].try_into().expect("slice of length 4"),
            ) as usize;

            if len > MAX_FRAME_SIZE {
                return Err(Error::PayloadTooLarge {
                    size: len,
                    max: MAX_FRAME_SIZE,
                });
            }

            if self.buffer.len() < 4 + len {
                break;
            }

            let frame = self.buffer[4..4 + len].to_vec();
            self.buffer.drain(..4 + len);
            frames.push(frame);
        }

        Ok(frames)
    }

    /// Bytes held waiting for the rest of a frame
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roundtrip() {
        let payload = br#"{"hello":"world"}"#;
        let frame = encode_frame(payload).unwrap();

        let mut decoder = FrameDecoder::new();
        let frames = decoder.push(&frame).unwrap();

        assert_eq!(frames, vec![payload.to_vec()]);
        assert_eq!(decoder.pending(), 0);
    }

    #[test]
    fn test_concatenated_frames_in_one_message() {
        let mut message = encode_frame(b"first").unwrap();
        message.extend(encode_frame(b"second").unwrap());
        message.extend(encode_frame(b"third").unwrap());

        let mut decoder = FrameDecoder::new();
        let frames = decoder.push(&message).unwrap();

        assert_eq!(frames.len(), 3);
        assert_eq!(frames[0], b"first");
        assert_eq!(frames[1], b"second");
        assert_eq!(frames[2], b"third");
    }

    #[test]
    fn test_split_frame_across_messages() {
        let frame = encode_frame(b"split payload").unwrap();
        let (head, tail) = frame.split_at(7);

        let mut decoder = FrameDecoder::new();
        assert!(decoder.push(head).unwrap().is_empty());
        let frames = decoder.push(tail).unwrap();

        assert_eq!(frames, vec![b"split payload".to_vec()]);
    }

    #[test]
    fn test_empty_frame() {
        let frame = encode_frame(b"").unwrap();
        let mut decoder = FrameDecoder::new();
        assert_eq!(decoder.push(&frame).unwrap(), vec![Vec::<u8>::new()]);
    }

    #[test]
    fn test_encode_rejects_oversized() {
        let payload = vec![0u8; MAX_FRAME_SIZE + 1];
        assert!(matches!(
            encode_frame(&payload),
            Err(Error::PayloadTooLarge { .. })
        ));
    }

    #[test]
    fn test_encode_accepts_exactly_max() {
        let payload = vec![0u8; MAX_FRAME_SIZE];
        assert!(encode_frame(&payload).is_ok());
    }

    #[test]
    fn test_decode_rejects_oversized_prefix() {
        let mut message = ((MAX_FRAME_SIZE + 1) as u32).to_be_bytes().to_vec();
        message.extend_from_slice(&[0u8; 16]);

        let mut decoder = FrameDecoder::new();
        assert!(matches!(
            decoder.push(&message),
            Err(Error::PayloadTooLarge { .. })
        ));
    }
}
