//! Wire protocol codec for Unix domain socket IPC.
//!
//! Every message travels as one length-prefixed frame:
//!
//! ```text
//! [u32 LE length] [payload: length bytes]
//! ```
//!
//! The payload is opaque binary. A zero-length payload is a valid frame and
//! is distinct from "nothing buffered yet".

use bytes::{Buf, Bytes, BytesMut};

use crate::error::{IpcError, Result};

/// Size of the length header in bytes.
pub const HEADER_LEN: usize = 4;

/// Default maximum frame payload size (16 MB).
pub const DEFAULT_MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Largest payload the `u32` length header can describe.
const WIRE_LIMIT: usize = u32::MAX as usize;

/// Encode a payload into a wire-format frame.
///
/// Returns `[u32 LE length][payload]`.
///
/// # Errors
///
/// Returns [`IpcError::FrameTooLarge`] if the payload exceeds `max_frame_size`.
pub fn encode_frame(payload: &[u8], max_frame_size: usize) -> Result<Bytes> {
    let max = max_frame_size.min(WIRE_LIMIT);
    if payload.len() > max {
        return Err(IpcError::FrameTooLarge {
            size: payload.len(),
            max,
        });
    }

    let mut buf = BytesMut::with_capacity(HEADER_LEN + payload.len());
    buf.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    buf.extend_from_slice(payload);
    Ok(buf.freeze())
}

/// Incremental frame decoder that handles partial reads.
///
/// Feed bytes via [`FrameDecoder::feed`] and pull complete payloads with
/// [`FrameDecoder::next_frame`] or the [`FrameDecoder::frames`] iterator.
/// Partial frames stay buffered between calls, so the output does not depend
/// on how the stream was chunked.
///
/// A header declaring more than the maximum size yields a single
/// [`IpcError::FrameTooLarge`]; the declared payload bytes are then skipped
/// and decoding resumes at the next header.
#[derive(Debug)]
pub struct FrameDecoder {
    buf: BytesMut,
    max_frame_size: usize,
    /// Payload bytes of a rejected frame still to be dropped.
    discard: usize,
}

impl FrameDecoder {
    /// Create a new decoder with the default size limit.
    pub fn new() -> Self {
        Self::with_max_frame_size(DEFAULT_MAX_FRAME_SIZE)
    }

    /// Create a new decoder that rejects payloads above `max_frame_size`.
    pub fn with_max_frame_size(max_frame_size: usize) -> Self {
        Self {
            buf: BytesMut::new(),
            max_frame_size: max_frame_size.min(WIRE_LIMIT),
            discard: 0,
        }
    }

    /// The payload size limit enforced by this decoder.
    pub fn max_frame_size(&self) -> usize {
        self.max_frame_size
    }

    /// Append received bytes to the internal buffer.
    pub fn feed(&mut self, bytes: &[u8]) {
        if self.discard > 0 {
            let skip = self.discard.min(bytes.len());
            self.discard -= skip;
            self.buf.extend_from_slice(&bytes[skip..]);
        } else {
            self.buf.extend_from_slice(bytes);
        }
    }

    /// Extract the next complete frame, if one is buffered.
    ///
    /// Returns `None` when more bytes are needed.
    pub fn next_frame(&mut self) -> Option<Result<Bytes>> {
        if self.discard > 0 {
            let skip = self.discard.min(self.buf.len());
            self.buf.advance(skip);
            self.discard -= skip;
            if self.discard > 0 {
                return None;
            }
        }

        // Need at least 4 bytes for the length header
        if self.buf.len() < HEADER_LEN {
            return None;
        }

        let length =
            u32::from_le_bytes([self.buf[0], self.buf[1], self.buf[2], self.buf[3]]) as usize;

        if length > self.max_frame_size {
            self.buf.advance(HEADER_LEN);
            let skip = length.min(self.buf.len());
            self.buf.advance(skip);
            self.discard = length - skip;
            return Some(Err(IpcError::FrameTooLarge {
                size: length,
                max: self.max_frame_size,
            }));
        }

        if self.buf.len() < HEADER_LEN + length {
            return None; // Incomplete frame, wait for more data
        }

        self.buf.advance(HEADER_LEN);
        Some(Ok(self.buf.split_to(length).freeze()))
    }

    /// Iterate over every complete frame currently buffered.
    ///
    /// The iterator ends when the buffer holds no further complete frame;
    /// call [`FrameDecoder::feed`] and iterate again to continue.
    pub fn frames(&mut self) -> Frames<'_> {
        Frames { decoder: self }
    }

    /// Returns true if the decoder has buffered partial data.
    pub fn has_partial(&self) -> bool {
        !self.buf.is_empty() || self.discard > 0
    }
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new()
    }
}

/// Iterator returned by [`FrameDecoder::frames`].
#[derive(Debug)]
pub struct Frames<'a> {
    decoder: &'a mut FrameDecoder,
}

impl Iterator for Frames<'_> {
    type Item = Result<Bytes>;

    fn next(&mut self) -> Option<Self::Item> {
        self.decoder.next_frame()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn collect_ok(decoder: &mut FrameDecoder) -> Vec<Bytes> {
        decoder.frames().map(|f| f.unwrap()).collect()
    }

    #[test]
    fn test_round_trip() {
        let encoded = encode_frame(b"greetings\n", DEFAULT_MAX_FRAME_SIZE).unwrap();
        assert_eq!(&encoded[..4], &10u32.to_le_bytes());

        let mut decoder = FrameDecoder::new();
        decoder.feed(&encoded);
        let frames = collect_ok(&mut decoder);
        assert_eq!(frames, vec![Bytes::from_static(b"greetings\n")]);
        assert!(!decoder.has_partial());
    }

    #[test]
    fn test_empty_payload_is_a_frame() {
        let encoded = encode_frame(b"", DEFAULT_MAX_FRAME_SIZE).unwrap();
        assert_eq!(encoded.len(), HEADER_LEN);

        let mut decoder = FrameDecoder::new();
        assert!(decoder.next_frame().is_none());

        decoder.feed(&encoded);
        let frame = decoder.next_frame().unwrap().unwrap();
        assert!(frame.is_empty());
        assert!(decoder.next_frame().is_none());
    }

    #[test]
    fn test_multiple_frames_in_single_feed() {
        let mut buf = Vec::new();
        for payload in [&b"one"[..], b"", b"three"] {
            buf.extend_from_slice(&encode_frame(payload, DEFAULT_MAX_FRAME_SIZE).unwrap());
        }

        let mut decoder = FrameDecoder::new();
        decoder.feed(&buf);
        let frames = collect_ok(&mut decoder);
        assert_eq!(frames.len(), 3);
        assert_eq!(&frames[0][..], b"one");
        assert!(frames[1].is_empty());
        assert_eq!(&frames[2][..], b"three");
    }

    #[test]
    fn test_partial_frame_reassembly() {
        let encoded = encode_frame(b"key=value", DEFAULT_MAX_FRAME_SIZE).unwrap();
        let mut decoder = FrameDecoder::new();

        // Feed first half
        let mid = encoded.len() / 2;
        decoder.feed(&encoded[..mid]);
        assert!(decoder.next_frame().is_none());
        assert!(decoder.has_partial());

        // Feed second half
        decoder.feed(&encoded[mid..]);
        assert_eq!(&decoder.next_frame().unwrap().unwrap()[..], b"key=value");
        assert!(!decoder.has_partial());
    }

    #[test]
    fn test_byte_at_a_time_matches_single_feed() {
        let mut stream = Vec::new();
        let payloads: Vec<Vec<u8>> =
            vec![b"a".to_vec(), vec![], vec![0, 255, 7, 0], b"tail".to_vec()];
        for p in &payloads {
            stream.extend_from_slice(&encode_frame(p, DEFAULT_MAX_FRAME_SIZE).unwrap());
        }

        let mut whole = FrameDecoder::new();
        whole.feed(&stream);
        let expected = collect_ok(&mut whole);

        let mut chunked = FrameDecoder::new();
        let mut got = Vec::new();
        for byte in &stream {
            chunked.feed(std::slice::from_ref(byte));
            got.extend(collect_ok(&mut chunked));
        }

        assert_eq!(got, expected);
        assert_eq!(got.len(), payloads.len());
        assert!(!chunked.has_partial());
    }

    #[test]
    fn test_encode_rejects_oversized_payload() {
        let err = encode_frame(&[0u8; 9], 8).unwrap_err();
        match err {
            IpcError::FrameTooLarge { size, max } => {
                assert_eq!(size, 9);
                assert_eq!(max, 8);
            }
            other => panic!("Expected FrameTooLarge, got: {other:?}"),
        }
        assert!(encode_frame(&[0u8; 8], 8).is_ok());
    }

    #[test]
    fn test_oversized_frame_rejected_then_decoding_resumes() {
        let mut stream = Vec::new();
        stream.extend_from_slice(&32u32.to_le_bytes());
        stream.extend_from_slice(&[0xAA; 32]);
        stream.extend_from_slice(&encode_frame(b"after", 16).unwrap());

        let mut decoder = FrameDecoder::with_max_frame_size(16);
        decoder.feed(&stream);

        match decoder.next_frame() {
            Some(Err(IpcError::FrameTooLarge { size: 32, max: 16 })) => {}
            other => panic!("Expected FrameTooLarge, got: {other:?}"),
        }
        assert_eq!(&decoder.next_frame().unwrap().unwrap()[..], b"after");
        assert!(decoder.next_frame().is_none());
    }

    #[test]
    fn test_oversized_frame_skipped_across_chunks() {
        let mut stream = Vec::new();
        stream.extend_from_slice(&100u32.to_le_bytes());
        stream.extend_from_slice(&[0x55; 100]);
        stream.extend_from_slice(&encode_frame(b"ok", 16).unwrap());

        let mut decoder = FrameDecoder::with_max_frame_size(16);
        let mut errors = 0;
        let mut frames = Vec::new();
        for chunk in stream.chunks(7) {
            decoder.feed(chunk);
            for frame in decoder.frames() {
                match frame {
                    Ok(payload) => frames.push(payload),
                    Err(IpcError::FrameTooLarge { .. }) => errors += 1,
                    Err(other) => panic!("unexpected error: {other:?}"),
                }
            }
        }

        assert_eq!(errors, 1);
        assert_eq!(frames, vec![Bytes::from_static(b"ok")]);
        assert!(!decoder.has_partial());
    }

    #[test]
    fn test_large_payload() {
        let data = vec![0x42u8; 256 * 1024]; // 256KB
        let encoded = encode_frame(&data, DEFAULT_MAX_FRAME_SIZE).unwrap();
        let mut decoder = FrameDecoder::new();
        decoder.feed(&encoded);
        let frame = decoder.next_frame().unwrap().unwrap();
        assert_eq!(frame.len(), data.len());
    }
}
