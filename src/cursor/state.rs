use std::fmt;

use serde::Serialize;

use crate::query::QuerySummary;

/// Lifecycle of a client cursor.
///
/// `Unopened → Open → (Exhausted | Closed)`. A timed-out get-more leaves
/// an `Open` cursor `Open`; a timed-out first query closes it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CursorState {
    Unopened,
    Open,
    Exhausted,
    Closed,
}

impl CursorState {
    /// No further document will ever be produced.
    pub fn is_terminal(self) -> bool {
        matches!(self, CursorState::Exhausted | CursorState::Closed)
    }
}

impl fmt::Display for CursorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CursorState::Unopened => "unopened",
            CursorState::Open => "open",
            CursorState::Exhausted => "exhausted",
            CursorState::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Serialisable snapshot of a cursor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CursorInfo {
    pub query: QuerySummary,
    pub state: CursorState,
    pub cursor_id: i64,

    /// Documents received from the server, after limit truncation
    pub received: i64,

    /// Documents handed to the caller
    pub returned: i64,

    /// Documents buffered but not yet returned
    pub buffered: usize,

    /// A get-more is in flight and will be resumed on the next read
    pub get_more_pending: bool,
}
