//! Low-level field readers and writers shared by requests and replies.

use bson::Document;

use crate::error::{ExecutionError, MongoWireError, ProtocolError, Result};

/// Cursor over the bytes of one message body.
pub(crate) struct WireReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> WireReader<'a> {
    pub(crate) fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub(crate) fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    fn take(&mut self, n: usize) -> std::result::Result<&'a [u8], ProtocolError> {
        if self.remaining() < n {
            return Err(ProtocolError::Truncated {
                needed: n,
                available: self.remaining(),
            });
        }
        let slice = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    pub(crate) fn read_i32(&mut self) -> std::result::Result<i32, ProtocolError> {
        let mut raw = [0u8; 4];
        raw.copy_from_slice(self.take(4)?);
        Ok(i32::from_le_bytes(raw))
    }

    pub(crate) fn read_i64(&mut self) -> std::result::Result<i64, ProtocolError> {
        let mut raw = [0u8; 8];
        raw.copy_from_slice(self.take(8)?);
        Ok(i64::from_le_bytes(raw))
    }

    pub(crate) fn read_cstring(&mut self) -> std::result::Result<String, ProtocolError> {
        let rest = &self.buf[self.pos..];
        let nul = rest
            .iter()
            .position(|b| *b == 0)
            .ok_or_else(|| ProtocolError::InvalidDocument("unterminated cstring".to_string()))?;
        let value = std::str::from_utf8(&rest[..nul])
            .map_err(|e| ProtocolError::InvalidDocument(format!("cstring is not UTF-8: {e}")))?
            .to_string();
        self.pos += nul + 1;
        Ok(value)
    }

    pub(crate) fn read_document(&mut self) -> std::result::Result<Document, ProtocolError> {
        let start = self.pos;
        let declared = self.read_i32()?;
        self.pos = start;
        if declared < 5 {
            return Err(ProtocolError::InvalidDocument(format!(
                "document length {declared} is too small"
            )));
        }
        let bytes = self.take(declared as usize)?;
        Document::from_reader(bytes).map_err(|e| ProtocolError::InvalidDocument(e.to_string()))
    }

    /// Fail if anything is left unread.
    pub(crate) fn finish(&self) -> std::result::Result<(), ProtocolError> {
        match self.remaining() {
            0 => Ok(()),
            n => Err(ProtocolError::TrailingBytes(n)),
        }
    }
}

pub(crate) fn put_i32(buf: &mut Vec<u8>, value: i32) {
    buf.extend_from_slice(&value.to_le_bytes());
}

pub(crate) fn put_i64(buf: &mut Vec<u8>, value: i64) {
    buf.extend_from_slice(&value.to_le_bytes());
}

pub(crate) fn put_cstring(buf: &mut Vec<u8>, value: &str) -> Result<()> {
    if value.as_bytes().contains(&0) {
        return Err(MongoWireError::Execution(ExecutionError::InvalidParameters(
            format!("'{}' contains a NUL byte", value.escape_debug()),
        )));
    }
    buf.extend_from_slice(value.as_bytes());
    buf.push(0);
    Ok(())
}

pub(crate) fn put_document(buf: &mut Vec<u8>, doc: &Document) -> Result<()> {
    doc.to_writer(buf)?;
    Ok(())
}

/// Overwrite the length prefix once the whole message has been written.
pub(crate) fn patch_length(buf: &mut [u8]) -> Result<()> {
    let len = i32::try_from(buf.len())
        .map_err(|_| ProtocolError::MessageTooLarge {
            length: buf.len(),
            max: i32::MAX as usize,
        })?;
    buf[..4].copy_from_slice(&len.to_le_bytes());
    Ok(())
}
