//! Self-delimiting byte frames: `<decimal-length>:<payload>,`.
//!
//! The length is ASCII decimal, the payload is raw bytes (digits, colons and
//! commas included), the trailing comma closes the frame.

use std::io::{self, Read, Write};

/// Upper bound on a single frame's payload. A peer announcing more than this
/// is treated as malformed rather than trusted with the allocation.
pub const MAX_FRAME_LEN: usize = 64 * 1024 * 1024;

const MAX_LENGTH_DIGITS: usize = 9;

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("malformed frame length: {0}")]
    BadLength(String),
    #[error("frame of {0} bytes exceeds the {MAX_FRAME_LEN} byte cap")]
    Oversize(usize),
    #[error("frame missing ',' terminator (got 0x{0:02x})")]
    BadTerminator(u8),
    #[error("stream ended mid-frame")]
    TruncatedFrame,
}

/// Writes one frame and flushes it.
pub fn write_frame(writer: &mut impl Write, payload: &[u8]) -> Result<(), FrameError> {
    write!(writer, "{}:", payload.len())?;
    writer.write_all(payload)?;
    writer.write_all(b",")?;
    writer.flush()?;
    Ok(())
}

/// Reads one frame. Returns `Ok(None)` on a clean end-of-stream before the
/// first length byte; EOF anywhere else inside a frame is an error.
pub fn read_frame(reader: &mut impl Read) -> Result<Option<Vec<u8>>, FrameError> {
    let mut digits = Vec::new();
    loop {
        let mut byte = [0u8; 1];
        match reader.read(&mut byte) {
            Ok(0) => {
                if digits.is_empty() {
                    return Ok(None);
                }
                return Err(FrameError::TruncatedFrame);
            }
            Ok(_) => {}
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => return Err(err.into()),
        }
        match byte[0] {
            b'0'..=b'9' => {
                if digits.len() >= MAX_LENGTH_DIGITS {
                    return Err(FrameError::BadLength("length field too long".into()));
                }
                digits.push(byte[0]);
            }
            b':' => break,
            other => {
                return Err(FrameError::BadLength(format!(
                    "unexpected 0x{other:02x} in length field"
                )));
            }
        }
    }
    if digits.is_empty() {
        return Err(FrameError::BadLength("empty length field".into()));
    }
    let len: usize = std::str::from_utf8(&digits)
        .map_err(|err| FrameError::BadLength(format!("{err}")))?
        .parse()
        .map_err(|err| FrameError::BadLength(format!("{err}")))?;
    if len > MAX_FRAME_LEN {
        return Err(FrameError::Oversize(len));
    }

    let mut payload = vec![0u8; len];
    reader
        .read_exact(&mut payload)
        .map_err(|err| match err.kind() {
            io::ErrorKind::UnexpectedEof => FrameError::TruncatedFrame,
            _ => FrameError::Io(err),
        })?;

    let mut terminator = [0u8; 1];
    reader
        .read_exact(&mut terminator)
        .map_err(|err| match err.kind() {
            io::ErrorKind::UnexpectedEof => FrameError::TruncatedFrame,
            _ => FrameError::Io(err),
        })?;
    if terminator[0] != b',' {
        return Err(FrameError::BadTerminator(terminator[0]));
    }
    Ok(Some(payload))
}

/// Encodes a frame into a fresh buffer, for tests and transcript capture.
pub fn encode(payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(payload.len() + 12);
    write_frame(&mut out, payload).expect("vec write cannot fail");
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn round_trip(payload: &[u8]) -> Vec<u8> {
        let encoded = encode(payload);
        read_frame(&mut Cursor::new(encoded))
            .expect("decode")
            .expect("frame present")
    }

    #[test]
    fn round_trips_arbitrary_payloads() {
        assert_eq!(round_trip(b""), b"");
        assert_eq!(round_trip(b"hello"), b"hello");
        // Payload bytes that collide with framing characters.
        assert_eq!(round_trip(b"12:34,56:78,"), b"12:34,56:78,");
        assert_eq!(round_trip(&[0u8, 255, 58, 44, 48]), vec![0u8, 255, 58, 44, 48]);
    }

    #[test]
    fn encodes_expected_wire_form() {
        assert_eq!(encode(b"deliver"), b"7:deliver,");
        assert_eq!(encode(b""), b"0:,");
    }

    #[test]
    fn sequential_frames_decode_in_order() {
        let mut wire = Vec::new();
        wire.extend_from_slice(&encode(b"one"));
        wire.extend_from_slice(&encode(b"two"));
        let mut cursor = Cursor::new(wire);
        assert_eq!(read_frame(&mut cursor).unwrap().unwrap(), b"one");
        assert_eq!(read_frame(&mut cursor).unwrap().unwrap(), b"two");
        assert!(read_frame(&mut cursor).unwrap().is_none());
    }

    #[test]
    fn clean_eof_yields_none() {
        let mut cursor = Cursor::new(Vec::new());
        assert!(read_frame(&mut cursor).unwrap().is_none());
    }

    #[test]
    fn eof_inside_frame_is_truncation() {
        let mut cursor = Cursor::new(b"5:ab".to_vec());
        assert!(matches!(
            read_frame(&mut cursor),
            Err(FrameError::TruncatedFrame)
        ));
        let mut cursor = Cursor::new(b"12".to_vec());
        assert!(matches!(
            read_frame(&mut cursor),
            Err(FrameError::TruncatedFrame)
        ));
    }

    #[test]
    fn rejects_bad_length_and_terminator() {
        let mut cursor = Cursor::new(b"x:abc,".to_vec());
        assert!(matches!(
            read_frame(&mut cursor),
            Err(FrameError::BadLength(_))
        ));
        let mut cursor = Cursor::new(b"3:abc;".to_vec());
        assert!(matches!(
            read_frame(&mut cursor),
            Err(FrameError::BadTerminator(b';'))
        ));
        let mut cursor = Cursor::new(b":abc,".to_vec());
        assert!(matches!(
            read_frame(&mut cursor),
            Err(FrameError::BadLength(_))
        ));
    }
}
