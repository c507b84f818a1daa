use crate::error::ProtocolError;

/// Size of the standard message header in bytes.
pub const HEADER_LEN: usize = 16;

/// Opcodes of the legacy wire protocol understood by this client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpCode {
    Reply,
    Insert,
    Query,
    GetMore,
    Delete,
    KillCursors,
}

impl OpCode {
    /// Numeric value written into the header.
    pub fn as_i32(self) -> i32 {
        match self {
            OpCode::Reply => 1,
            OpCode::Insert => 2002,
            OpCode::Query => 2004,
            OpCode::GetMore => 2005,
            OpCode::Delete => 2006,
            OpCode::KillCursors => 2007,
        }
    }

    /// Parse a numeric opcode.
    pub fn from_i32(value: i32) -> Result<Self, ProtocolError> {
        match value {
            1 => Ok(OpCode::Reply),
            2002 => Ok(OpCode::Insert),
            2004 => Ok(OpCode::Query),
            2005 => Ok(OpCode::GetMore),
            2006 => Ok(OpCode::Delete),
            2007 => Ok(OpCode::KillCursors),
            other => Err(ProtocolError::UnexpectedOpCode(other)),
        }
    }
}

/// Standard message header.
///
/// `message_length` counts the whole message, header included, which is
/// what lets a reader skip a frame it does not want without parsing it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageHeader {
    pub message_length: i32,
    pub request_id: i32,
    pub response_to: i32,
    pub op_code: OpCode,
}

impl MessageHeader {
    /// Parse the header at the start of `bytes`.
    pub fn parse(bytes: &[u8]) -> Result<Self, ProtocolError> {
        if bytes.len() < HEADER_LEN {
            return Err(ProtocolError::Truncated {
                needed: HEADER_LEN,
                available: bytes.len(),
            });
        }

        let message_length = read_i32_at(bytes, 0);
        if message_length < HEADER_LEN as i32 {
            return Err(ProtocolError::InvalidLength(message_length));
        }

        Ok(Self {
            message_length,
            request_id: read_i32_at(bytes, 4),
            response_to: read_i32_at(bytes, 8),
            op_code: OpCode::from_i32(read_i32_at(bytes, 12))?,
        })
    }

    /// Append the header to `buf`.
    pub fn write_to(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&self.message_length.to_le_bytes());
        buf.extend_from_slice(&self.request_id.to_le_bytes());
        buf.extend_from_slice(&self.response_to.to_le_bytes());
        buf.extend_from_slice(&self.op_code.as_i32().to_le_bytes());
    }
}

/// Read the 4-byte little-endian length prefix of a frame, if present.
pub fn frame_length(prefix: &[u8]) -> Option<i32> {
    if prefix.len() < 4 {
        None
    } else {
        Some(read_i32_at(prefix, 0))
    }
}

fn read_i32_at(bytes: &[u8], offset: usize) -> i32 {
    let mut raw = [0u8; 4];
    raw.copy_from_slice(&bytes[offset..offset + 4]);
    i32::from_le_bytes(raw)
}
