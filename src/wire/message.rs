//! Client-to-server request messages.

use bson::Document;

use super::codec::{WireReader, patch_length, put_cstring, put_document, put_i32, put_i64};
use super::header::{HEADER_LEN, MessageHeader, OpCode};
use crate::error::{ProtocolError, Result};

/// OP_QUERY flag bits.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueryFlags(i32);

impl QueryFlags {
    /// Allow reads from a secondary.
    pub const SLAVE_OK: QueryFlags = QueryFlags(1 << 2);
    /// Ask the server not to time out an idle cursor.
    pub const NO_CURSOR_TIMEOUT: QueryFlags = QueryFlags(1 << 4);

    pub fn bits(self) -> i32 {
        self.0
    }

    pub fn from_bits(bits: i32) -> Self {
        QueryFlags(bits)
    }

    pub fn contains(self, other: QueryFlags) -> bool {
        self.0 & other.0 == other.0
    }

    /// Return a copy with `flag` set or cleared.
    pub fn with(self, flag: QueryFlags, enabled: bool) -> Self {
        if enabled {
            QueryFlags(self.0 | flag.0)
        } else {
            QueryFlags(self.0 & !flag.0)
        }
    }
}

/// OP_QUERY: open a cursor or run a command against `db.$cmd`.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryMessage {
    pub flags: QueryFlags,
    pub namespace: String,
    pub number_to_skip: i32,
    pub number_to_return: i32,
    pub query: Document,
    pub return_fields: Option<Document>,
}

/// OP_GET_MORE: fetch the next batch of an open server cursor.
#[derive(Debug, Clone, PartialEq)]
pub struct GetMoreMessage {
    pub namespace: String,
    pub number_to_return: i32,
    pub cursor_id: i64,
}

/// OP_KILL_CURSORS: release server cursors. The server never replies.
#[derive(Debug, Clone, PartialEq)]
pub struct KillCursorsMessage {
    pub cursor_ids: Vec<i64>,
}

/// OP_INSERT: insert documents. The server never replies.
#[derive(Debug, Clone, PartialEq)]
pub struct InsertMessage {
    pub continue_on_error: bool,
    pub namespace: String,
    pub documents: Vec<Document>,
}

/// OP_DELETE: remove matching documents. The server never replies.
#[derive(Debug, Clone, PartialEq)]
pub struct DeleteMessage {
    pub namespace: String,
    pub single_remove: bool,
    pub selector: Document,
}

/// Any request this client can put on the wire.
#[derive(Debug, Clone, PartialEq)]
pub enum Request {
    Query(QueryMessage),
    GetMore(GetMoreMessage),
    KillCursors(KillCursorsMessage),
    Insert(InsertMessage),
    Delete(DeleteMessage),
}

impl Request {
    pub fn op_code(&self) -> OpCode {
        match self {
            Request::Query(_) => OpCode::Query,
            Request::GetMore(_) => OpCode::GetMore,
            Request::KillCursors(_) => OpCode::KillCursors,
            Request::Insert(_) => OpCode::Insert,
            Request::Delete(_) => OpCode::Delete,
        }
    }

    /// Whether the server answers this request with an OP_REPLY.
    pub fn expects_reply(&self) -> bool {
        matches!(self, Request::Query(_) | Request::GetMore(_))
    }

    /// Short name used in log lines.
    pub fn name(&self) -> &'static str {
        match self {
            Request::Query(_) => "query",
            Request::GetMore(_) => "get_more",
            Request::KillCursors(_) => "kill_cursors",
            Request::Insert(_) => "insert",
            Request::Delete(_) => "delete",
        }
    }

    /// Encode the request as one length-prefixed message.
    ///
    /// # Arguments
    /// * `request_id` - Identifier the server echoes back in `responseTo`
    ///
    /// # Returns
    /// * `Result<Vec<u8>>` - Complete message bytes
    pub fn encode(&self, request_id: i32) -> Result<Vec<u8>> {
        let mut buf = Vec::with_capacity(128);
        MessageHeader {
            message_length: 0,
            request_id,
            response_to: 0,
            op_code: self.op_code(),
        }
        .write_to(&mut buf);

        match self {
            Request::Query(q) => {
                put_i32(&mut buf, q.flags.bits());
                put_cstring(&mut buf, &q.namespace)?;
                put_i32(&mut buf, q.number_to_skip);
                put_i32(&mut buf, q.number_to_return);
                put_document(&mut buf, &q.query)?;
                if let Some(fields) = &q.return_fields {
                    put_document(&mut buf, fields)?;
                }
            }
            Request::GetMore(g) => {
                put_i32(&mut buf, 0);
                put_cstring(&mut buf, &g.namespace)?;
                put_i32(&mut buf, g.number_to_return);
                put_i64(&mut buf, g.cursor_id);
            }
            Request::KillCursors(k) => {
                put_i32(&mut buf, 0);
                put_i32(&mut buf, k.cursor_ids.len() as i32);
                for id in &k.cursor_ids {
                    put_i64(&mut buf, *id);
                }
            }
            Request::Insert(i) => {
                put_i32(&mut buf, i32::from(i.continue_on_error));
                put_cstring(&mut buf, &i.namespace)?;
                for doc in &i.documents {
                    put_document(&mut buf, doc)?;
                }
            }
            Request::Delete(d) => {
                put_i32(&mut buf, 0);
                put_cstring(&mut buf, &d.namespace)?;
                put_i32(&mut buf, i32::from(d.single_remove));
                put_document(&mut buf, &d.selector)?;
            }
        }

        patch_length(&mut buf)?;
        Ok(buf)
    }

    /// Decode one complete request frame.
    ///
    /// Used by in-process servers; the client itself only encodes requests.
    pub fn decode(frame: &[u8]) -> Result<(MessageHeader, Request)> {
        let header = MessageHeader::parse(frame)?;
        if header.message_length as usize != frame.len() {
            return Err(ProtocolError::InvalidLength(header.message_length).into());
        }

        let mut r = WireReader::new(&frame[HEADER_LEN..]);
        let request = match header.op_code {
            OpCode::Query => {
                let flags = QueryFlags::from_bits(r.read_i32()?);
                let namespace = r.read_cstring()?;
                let number_to_skip = r.read_i32()?;
                let number_to_return = r.read_i32()?;
                let query = r.read_document()?;
                let return_fields = if r.remaining() > 0 {
                    Some(r.read_document()?)
                } else {
                    None
                };
                Request::Query(QueryMessage {
                    flags,
                    namespace,
                    number_to_skip,
                    number_to_return,
                    query,
                    return_fields,
                })
            }
            OpCode::GetMore => {
                r.read_i32()?;
                let namespace = r.read_cstring()?;
                let number_to_return = r.read_i32()?;
                let cursor_id = r.read_i64()?;
                Request::GetMore(GetMoreMessage {
                    namespace,
                    number_to_return,
                    cursor_id,
                })
            }
            OpCode::KillCursors => {
                r.read_i32()?;
                let count = r.read_i32()?;
                let mut cursor_ids = Vec::with_capacity((count.max(0) as usize).min(r.remaining() / 8));
                for _ in 0..count {
                    cursor_ids.push(r.read_i64()?);
                }
                Request::KillCursors(KillCursorsMessage { cursor_ids })
            }
            OpCode::Insert => {
                let continue_on_error = r.read_i32()? & 1 == 1;
                let namespace = r.read_cstring()?;
                let mut documents = Vec::new();
                while r.remaining() > 0 {
                    documents.push(r.read_document()?);
                }
                Request::Insert(InsertMessage {
                    continue_on_error,
                    namespace,
                    documents,
                })
            }
            OpCode::Delete => {
                r.read_i32()?;
                let namespace = r.read_cstring()?;
                let single_remove = r.read_i32()? & 1 == 1;
                let selector = r.read_document()?;
                Request::Delete(DeleteMessage {
                    namespace,
                    single_remove,
                    selector,
                })
            }
            OpCode::Reply => return Err(ProtocolError::UnexpectedOpCode(1).into()),
        };
        r.finish()?;

        Ok((header, request))
    }
}
