//! Streaming snapshot record codec.
//!
//! A snapshot is a sequence of `(key, value)` records:
//!
//! - key length as big-endian u32
//! - value length as big-endian u32
//! - key bytes
//! - value bytes
//!
//! Length prefixes rather than separators, so keys and values may contain
//! anything: commas, newlines, quotes, NUL. The stream ends cleanly at a
//! record boundary; ending anywhere else is an error.

use std::io::{self, Read, Write};

use crate::{WireError, WireResult};

/// Largest accepted key or value, guarding restore against corrupt input.
const MAX_FIELD_LEN: u32 = 64 * 1024 * 1024;

/// Writes snapshot records to an underlying sink.
pub struct SnapshotWriter<W: Write> {
    out: W,
}

impl<W: Write> SnapshotWriter<W> {
    /// Wraps a sink.
    pub fn new(out: W) -> Self {
        Self { out }
    }

    /// Appends one record.
    pub fn write_record(&mut self, key: &str, value: &str) -> WireResult<()> {
        self.out.write_all(&(key.len() as u32).to_be_bytes())?;
        self.out.write_all(&(value.len() as u32).to_be_bytes())?;
        self.out.write_all(key.as_bytes())?;
        self.out.write_all(value.as_bytes())?;
        Ok(())
    }

    /// Flushes and returns the sink.
    pub fn finish(mut self) -> WireResult<W> {
        self.out.flush()?;
        Ok(self.out)
    }
}

/// Reads snapshot records from an underlying source.
pub struct SnapshotReader<R: Read> {
    input: R,
}

impl<R: Read> SnapshotReader<R> {
    /// Wraps a source.
    pub fn new(input: R) -> Self {
        Self { input }
    }

    /// Reads the next record, or `None` at a clean end of stream.
    pub fn read_record(&mut self) -> WireResult<Option<(String, String)>> {
        let mut header = [0u8; 8];
        match read_exact_or_eof(&mut self.input, &mut header)? {
            ReadOutcome::Eof => return Ok(None),
            ReadOutcome::Full => {}
        }
        let key_len = u32::from_be_bytes(header[0..4].try_into().expect("4 bytes"));
        let value_len = u32::from_be_bytes(header[4..8].try_into().expect("4 bytes"));
        if key_len > MAX_FIELD_LEN || value_len > MAX_FIELD_LEN {
            return Err(WireError::Snapshot(format!(
                "field length {key_len}/{value_len} exceeds limit"
            )));
        }

        let mut key = vec![0u8; key_len as usize];
        self.input
            .read_exact(&mut key)
            .map_err(|e| WireError::Snapshot(format!("truncated key: {e}")))?;
        let mut value = vec![0u8; value_len as usize];
        self.input
            .read_exact(&mut value)
            .map_err(|e| WireError::Snapshot(format!("truncated value: {e}")))?;

        let key = String::from_utf8(key)
            .map_err(|e| WireError::Snapshot(format!("key is not utf-8: {e}")))?;
        let value = String::from_utf8(value)
            .map_err(|e| WireError::Snapshot(format!("value is not utf-8: {e}")))?;
        Ok(Some((key, value)))
    }
}

enum ReadOutcome {
    Full,
    Eof,
}

/// Reads the whole buffer, distinguishing clean EOF (nothing read) from a
/// truncated record (partial read).
fn read_exact_or_eof<R: Read>(input: &mut R, buf: &mut [u8]) -> WireResult<ReadOutcome> {
    let mut filled = 0;
    while filled < buf.len() {
        match input.read(&mut buf[filled..]) {
            Ok(0) => {
                if filled == 0 {
                    return Ok(ReadOutcome::Eof);
                }
                return Err(WireError::Snapshot("truncated record header".into()));
            }
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(WireError::Io(e)),
        }
    }
    Ok(ReadOutcome::Full)
}
