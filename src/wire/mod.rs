//! Legacy MongoDB wire protocol codec
//!
//! This module encodes the requests a cursor needs and decodes the server's
//! replies:
//! - OP_QUERY, OP_GET_MORE, OP_KILL_CURSORS, OP_INSERT, OP_DELETE
//! - OP_REPLY with cursor id, starting position and document batch
//!
//! Every message starts with a 4-byte little-endian length covering the
//! whole message. Readers rely on that prefix to split the byte stream into
//! frames, and to skip frames nobody is waiting for anymore.

mod codec;
pub mod header;
pub mod message;
pub mod reply;

pub use header::{HEADER_LEN, MessageHeader, OpCode, frame_length};
pub use message::{
    DeleteMessage, GetMoreMessage, InsertMessage, KillCursorsMessage, QueryFlags, QueryMessage,
    Request,
};
pub use reply::{Reply, ReplyFlags, peek_reply};

/// Default upper bound on a single message, matching the server's limit.
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 48_000_000;
