//! OP_REPLY decoding (and encoding for in-process servers).

use bson::Document;

use super::codec::{WireReader, patch_length, put_document, put_i32, put_i64};
use super::header::{HEADER_LEN, MessageHeader, OpCode};
use crate::error::{ProtocolError, Result};

/// OP_REPLY `responseFlags` bits.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReplyFlags(i32);

impl ReplyFlags {
    /// The get-more referenced a cursor the server does not know.
    pub const CURSOR_NOT_FOUND: ReplyFlags = ReplyFlags(1);
    /// The query failed; the single document carries `$err`.
    pub const QUERY_FAILURE: ReplyFlags = ReplyFlags(1 << 1);
    pub const AWAIT_CAPABLE: ReplyFlags = ReplyFlags(1 << 3);

    pub fn bits(self) -> i32 {
        self.0
    }

    pub fn from_bits(bits: i32) -> Self {
        ReplyFlags(bits)
    }

    pub fn contains(self, other: ReplyFlags) -> bool {
        self.0 & other.0 == other.0
    }
}

/// A decoded OP_REPLY.
#[derive(Debug, Clone, PartialEq)]
pub struct Reply {
    /// Request id this reply answers.
    pub response_to: i32,
    pub flags: ReplyFlags,
    /// Server cursor id; 0 when the server kept no cursor.
    pub cursor_id: i64,
    pub starting_from: i32,
    pub documents: Vec<Document>,
}

impl Reply {
    /// Decode a complete OP_REPLY frame.
    ///
    /// Every field is validated against the frame: the declared length must
    /// match, `numberReturned` must match the documents present and nothing
    /// may trail the last document.
    pub fn decode(frame: &[u8]) -> Result<Self> {
        let header = MessageHeader::parse(frame)?;
        if header.op_code != OpCode::Reply {
            return Err(ProtocolError::UnexpectedOpCode(header.op_code.as_i32()).into());
        }
        if header.message_length as usize != frame.len() {
            return Err(ProtocolError::InvalidLength(header.message_length).into());
        }

        let mut r = WireReader::new(&frame[HEADER_LEN..]);
        let flags = ReplyFlags::from_bits(r.read_i32()?);
        let cursor_id = r.read_i64()?;
        let starting_from = r.read_i32()?;
        let number_returned = r.read_i32()?;
        if number_returned < 0 {
            return Err(ProtocolError::DocumentCountMismatch {
                declared: number_returned,
                found: 0,
            }
            .into());
        }

        // A BSON document is at least 5 bytes; never trust the declared count.
        let mut documents = Vec::with_capacity((number_returned as usize).min(r.remaining() / 5));
        while r.remaining() > 0 {
            documents.push(r.read_document()?);
        }
        r.finish()?;

        if documents.len() != number_returned as usize {
            return Err(ProtocolError::DocumentCountMismatch {
                declared: number_returned,
                found: documents.len(),
            }
            .into());
        }

        Ok(Self {
            response_to: header.response_to,
            flags,
            cursor_id,
            starting_from,
            documents,
        })
    }

    /// Encode the reply as a complete frame.
    pub fn encode(&self, request_id: i32) -> Result<Vec<u8>> {
        let mut buf = Vec::with_capacity(64);
        MessageHeader {
            message_length: 0,
            request_id,
            response_to: self.response_to,
            op_code: OpCode::Reply,
        }
        .write_to(&mut buf);

        put_i32(&mut buf, self.flags.bits());
        put_i64(&mut buf, self.cursor_id);
        put_i32(&mut buf, self.starting_from);
        put_i32(&mut buf, self.documents.len() as i32);
        for doc in &self.documents {
            put_document(&mut buf, doc)?;
        }

        patch_length(&mut buf)?;
        Ok(buf)
    }

    pub fn is_query_failure(&self) -> bool {
        self.flags.contains(ReplyFlags::QUERY_FAILURE)
    }

    pub fn is_cursor_not_found(&self) -> bool {
        self.flags.contains(ReplyFlags::CURSOR_NOT_FOUND)
    }

    /// The first document, which carries the result of a command or `$err`.
    pub fn first_document(&self) -> Option<&Document> {
        self.documents.first()
    }
}

/// Read only the `responseTo` and cursor id of a reply frame.
///
/// Used when draining a stale reply: the documents are never decoded, but
/// a cursor the server opened for an abandoned query still has to be killed.
pub fn peek_reply(frame: &[u8]) -> std::result::Result<(i32, i64), ProtocolError> {
    let header = MessageHeader::parse(frame)?;
    if header.op_code != OpCode::Reply {
        return Err(ProtocolError::UnexpectedOpCode(header.op_code.as_i32()));
    }
    let mut r = WireReader::new(&frame[HEADER_LEN..]);
    r.read_i32()?;
    let cursor_id = r.read_i64()?;
    Ok((header.response_to, cursor_id))
}
