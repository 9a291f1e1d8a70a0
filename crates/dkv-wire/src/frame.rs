//! Length-prefixed frame envelope.

use bytes::{Buf, BufMut, BytesMut};

use crate::{WireError, WireResult};

/// Size of the frame header: a big-endian u32 body length.
pub const FRAME_HEADER_SIZE: usize = 4;

/// Maximum frame body size. Large enough for a full snapshot chunk, small
/// enough to bound a malicious peer's allocation.
pub const MAX_FRAME_SIZE: usize = 32 * 1024 * 1024;

/// A single length-prefixed message on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// The frame body.
    pub body: Vec<u8>,
}

impl Frame {
    /// Wraps a body in a frame.
    pub fn new(body: Vec<u8>) -> Self {
        Self { body }
    }

    /// Appends the encoded frame to `buf`.
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.reserve(FRAME_HEADER_SIZE + self.body.len());
        buf.put_u32(self.body.len() as u32);
        buf.put_slice(&self.body);
    }

    /// Attempts to decode one frame from the front of `buf`.
    ///
    /// Returns `Ok(None)` when the buffer does not yet hold a complete
    /// frame; the buffer is only consumed once a whole frame is available.
    pub fn decode(buf: &mut BytesMut) -> WireResult<Option<Frame>> {
        if buf.len() < FRAME_HEADER_SIZE {
            return Ok(None);
        }
        let len = u32::from_be_bytes(buf[0..4].try_into().expect("4 bytes")) as usize;
        if len > MAX_FRAME_SIZE {
            return Err(WireError::FrameTooLarge {
                size: len,
                max: MAX_FRAME_SIZE,
            });
        }
        if buf.len() < FRAME_HEADER_SIZE + len {
            return Ok(None);
        }
        buf.advance(FRAME_HEADER_SIZE);
        let body = buf.split_to(len).to_vec();
        Ok(Some(Frame { body }))
    }
}

/// Reads one frame from a blocking reader.
///
/// EOF before the header is an `UnexpectedEof` I/O error; a torn frame is
/// too.
pub fn read_frame(reader: &mut impl std::io::Read) -> WireResult<Frame> {
    let mut header = [0u8; FRAME_HEADER_SIZE];
    reader.read_exact(&mut header)?;
    let len = u32::from_be_bytes(header) as usize;
    if len > MAX_FRAME_SIZE {
        return Err(WireError::FrameTooLarge {
            size: len,
            max: MAX_FRAME_SIZE,
        });
    }
    let mut body = vec![0u8; len];
    reader.read_exact(&mut body)?;
    Ok(Frame { body })
}

/// Writes one frame to a blocking writer and flushes.
pub fn write_frame(writer: &mut impl std::io::Write, frame: &Frame) -> WireResult<()> {
    writer.write_all(&(frame.body.len() as u32).to_be_bytes())?;
    writer.write_all(&frame.body)?;
    writer.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_blocking_roundtrip() {
        let frame = Frame::new(b"blocking".to_vec());
        let mut buf = Vec::new();
        write_frame(&mut buf, &frame).unwrap();
        let decoded = read_frame(&mut buf.as_slice()).unwrap();
        assert_eq!(decoded, frame);
    }

    #[test]
    fn test_roundtrip() {
        let frame = Frame::new(b"hello".to_vec());
        let mut buf = BytesMut::new();
        frame.encode(&mut buf);

        let decoded = Frame::decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded, frame);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_partial_header_yields_none() {
        let mut buf = BytesMut::from(&[0u8, 0][..]);
        assert!(Frame::decode(&mut buf).unwrap().is_none());
        assert_eq!(buf.len(), 2);
    }

    #[test]
    fn test_partial_body_yields_none() {
        let frame = Frame::new(vec![7; 16]);
        let mut full = BytesMut::new();
        frame.encode(&mut full);

        let mut buf = BytesMut::from(&full[..10]);
        assert!(Frame::decode(&mut buf).unwrap().is_none());
        // Nothing consumed until the frame completes.
        assert_eq!(buf.len(), 10);
    }

    #[test]
    fn test_split_delivery() {
        let frame = Frame::new(b"split across reads".to_vec());
        let mut full = BytesMut::new();
        frame.encode(&mut full);

        let mut buf = BytesMut::new();
        for chunk in full.chunks(3) {
            buf.extend_from_slice(chunk);
        }
        let decoded = Frame::decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded, frame);
    }

    #[test]
    fn test_two_frames_back_to_back() {
        let a = Frame::new(b"a".to_vec());
        let b = Frame::new(b"bb".to_vec());
        let mut buf = BytesMut::new();
        a.encode(&mut buf);
        b.encode(&mut buf);

        assert_eq!(Frame::decode(&mut buf).unwrap().unwrap(), a);
        assert_eq!(Frame::decode(&mut buf).unwrap().unwrap(), b);
        assert!(Frame::decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn test_oversized_frame_rejected() {
        let mut buf = BytesMut::new();
        buf.put_u32(u32::MAX);
        assert!(matches!(
            Frame::decode(&mut buf),
            Err(WireError::FrameTooLarge { .. })
        ));
    }
}
