//! Byte-level frame envelope and the resynchronizing decoder.
//!
//! # Wire format
//!
//! ```text
//! [0x7E][command][lenHi][lenLo][payload ...][0xEF]
//! ```
//!
//! The two length bytes describe the payload length, except for
//! [`Command::FileTransProc`] frames where they are repurposed to carry
//! the package index (the package size is fixed by the transfer
//! protocol, so no length is needed on the wire).
//!
//! The historical firmware combined the two length bytes with a bitwise
//! OR, which cannot represent any length whose high and low bytes share
//! set bits. This implementation uses shift-combine (`hi << 8 | lo`) on
//! both ends; see DESIGN.md for the rationale.

use bytes::{Buf, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::command::Command;
use crate::error::EngineError;

/// Start-of-frame marker.
pub const START_BYTE: u8 = 0x7E;
/// End-of-frame marker.
pub const END_BYTE: u8 = 0xEF;
/// Bytes of envelope surrounding the payload (start, command, two
/// length bytes, end).
pub const FRAME_OVERHEAD: usize = 5;
/// Largest payload the two length bytes can describe.
pub const MAX_PAYLOAD_LEN: usize = u16::MAX as usize;

// ── Frame ────────────────────────────────────────────────────────

/// One complete protocol message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub command: Command,
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn new(command: Command, payload: Vec<u8>) -> Self {
        Self { command, payload }
    }

    /// A frame with an empty payload.
    pub fn empty(command: Command) -> Self {
        Self {
            command,
            payload: Vec::new(),
        }
    }

    /// Encode into the on-wire byte sequence.
    pub fn encode(&self) -> Result<Vec<u8>, EngineError> {
        if self.payload.len() > MAX_PAYLOAD_LEN {
            return Err(EngineError::PayloadTooLarge {
                size: self.payload.len(),
                max: MAX_PAYLOAD_LEN,
            });
        }
        Ok(self.encode_raw((self.payload.len() >> 8) as u8, self.payload.len() as u8))
    }

    /// Encode with the length field carrying `package_index` instead of
    /// the payload length (package frames of the file-transfer path).
    pub fn encode_with_index(&self, package_index: u16) -> Vec<u8> {
        self.encode_raw((package_index >> 8) as u8, package_index as u8)
    }

    fn encode_raw(&self, hi: u8, lo: u8) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(self.payload.len() + FRAME_OVERHEAD);
        bytes.push(START_BYTE);
        bytes.push(self.command as u8);
        bytes.push(hi);
        bytes.push(lo);
        bytes.extend_from_slice(&self.payload);
        bytes.push(END_BYTE);
        bytes
    }
}

// ── FrameDecoder ─────────────────────────────────────────────────

/// Streaming decoder that tolerates garbage between frames.
///
/// A candidate frame starting at a `0x7E` is accepted only when the
/// byte at the offset implied by the length field is `0xEF` *and* the
/// command byte is a recognized code. A malformed candidate costs one
/// byte: the scan resumes at the next start marker, so a valid frame
/// sitting behind garbage is never lost. Partial data at the tail is
/// kept for the next read.
#[derive(Debug, Default)]
pub struct FrameDecoder;

impl Decoder for FrameDecoder {
    type Item = Frame;
    type Error = EngineError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, Self::Error> {
        loop {
            let Some(start) = src.iter().position(|&b| b == START_BYTE) else {
                // Nothing frameable in the buffer; drop it all.
                src.clear();
                return Ok(None);
            };
            if start > 0 {
                src.advance(start);
            }
            if src.len() < 4 {
                // Envelope header not fully buffered yet.
                return Ok(None);
            }
            let len = ((src[2] as usize) << 8) | src[3] as usize;
            let end = 4 + len;
            if end >= src.len() {
                // Frame body not fully buffered yet.
                return Ok(None);
            }
            if src[end] == END_BYTE {
                if let Ok(command) = Command::try_from(src[1]) {
                    let mut raw = src.split_to(end + 1);
                    raw.advance(4);
                    raw.truncate(len);
                    return Ok(Some(Frame::new(command, raw.to_vec())));
                }
            }
            // Malformed candidate: discard the start marker and rescan
            // from the next one.
            src.advance(1);
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, Self::Error> {
        let frame = self.decode(src)?;
        if frame.is_none() {
            // A partial frame can never complete once the peer is gone.
            src.clear();
        }
        Ok(frame)
    }
}

impl Encoder<Frame> for FrameDecoder {
    type Error = EngineError;

    fn encode(&mut self, item: Frame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        dst.extend_from_slice(&item.encode()?);
        Ok(())
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn decode_all(bytes: &[u8]) -> Vec<Frame> {
        let mut decoder = FrameDecoder;
        let mut buf = BytesMut::from(bytes);
        let mut frames = Vec::new();
        while let Some(frame) = decoder.decode(&mut buf).unwrap() {
            frames.push(frame);
        }
        frames
    }

    #[test]
    fn encode_layout() {
        let frame = Frame::new(Command::Volume, vec![0x00, 0x0F]);
        assert_eq!(
            frame.encode().unwrap(),
            vec![0x7E, 0xF4, 0x00, 0x02, 0x00, 0x0F, 0xEF]
        );
    }

    #[test]
    fn encode_decode_roundtrip() {
        let frame = Frame::new(Command::SetTimingAlarm, vec![1, 2, 3, 4, 5]);
        let decoded = decode_all(&frame.encode().unwrap());
        assert_eq!(decoded, vec![frame]);
    }

    #[test]
    fn roundtrip_survives_marker_bytes_in_payload() {
        // Payload containing 0x7E and 0xEF must not confuse the scan.
        let frame = Frame::new(Command::FileTransReq, vec![0x7E, 0xEF, 0x7E]);
        let decoded = decode_all(&frame.encode().unwrap());
        assert_eq!(decoded, vec![frame]);
    }

    #[test]
    fn long_payload_uses_shift_combined_length() {
        // 1024 = 0x0400: the historical OR-combine would read this as 4.
        let frame = Frame::new(Command::FileTransProc, vec![0xAB; 1024]);
        let bytes = frame.encode().unwrap();
        assert_eq!(bytes[2], 0x04);
        assert_eq!(bytes[3], 0x00);
        let decoded = decode_all(&bytes);
        assert_eq!(decoded.len(), 1);
        assert_eq!(decoded[0].payload.len(), 1024);
    }

    #[test]
    fn package_index_in_length_field() {
        let frame = Frame::new(Command::FileTransProc, vec![0u8; 8]);
        let bytes = frame.encode_with_index(0x0102);
        assert_eq!(bytes[2], 0x01);
        assert_eq!(bytes[3], 0x02);
        assert_eq!(*bytes.last().unwrap(), END_BYTE);
    }

    #[test]
    fn resync_after_garbled_candidate() {
        // A bogus frame start (bad command byte) directly followed by a
        // valid heartbeat: the decoder must still deliver the heartbeat.
        let mut bytes = vec![0x7E, 0x99, 0x00, 0x00, 0xEF];
        bytes.extend(Frame::empty(Command::Heartbeat).encode().unwrap());
        let decoded = decode_all(&bytes);
        assert_eq!(decoded, vec![Frame::empty(Command::Heartbeat)]);
    }

    #[test]
    fn resync_after_wrong_end_marker() {
        let mut bytes = vec![0x7E, 0x01, 0x00, 0x01, 0xAA, 0x00];
        bytes.extend(Frame::new(Command::Login, b"DEV00001".to_vec()).encode().unwrap());
        let decoded = decode_all(&bytes);
        assert_eq!(decoded.len(), 1);
        assert_eq!(decoded[0].command, Command::Login);
    }

    #[test]
    fn partial_frame_kept_across_reads() {
        let frame = Frame::new(Command::Play, vec![9, 9, 9]);
        let bytes = frame.encode().unwrap();

        let mut decoder = FrameDecoder;
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&bytes[..4]);
        assert!(decoder.decode(&mut buf).unwrap().is_none());

        buf.extend_from_slice(&bytes[4..]);
        assert_eq!(decoder.decode(&mut buf).unwrap(), Some(frame));
        assert!(buf.is_empty());
    }

    #[test]
    fn leading_garbage_discarded() {
        let mut bytes = vec![0x00, 0x12, 0x34];
        bytes.extend(Frame::empty(Command::Pause).encode().unwrap());
        let decoded = decode_all(&bytes);
        assert_eq!(decoded, vec![Frame::empty(Command::Pause)]);
    }

    #[test]
    fn multiple_frames_in_one_buffer() {
        let a = Frame::empty(Command::Heartbeat);
        let b = Frame::new(Command::Volume, vec![0x00, 0x1E]);
        let mut bytes = a.encode().unwrap();
        bytes.extend(b.encode().unwrap());
        assert_eq!(decode_all(&bytes), vec![a, b]);
    }

    #[test]
    fn oversized_payload_rejected() {
        let frame = Frame::new(Command::FileTransProc, vec![0; MAX_PAYLOAD_LEN + 1]);
        assert!(matches!(
            frame.encode(),
            Err(EngineError::PayloadTooLarge { .. })
        ));
    }
}
