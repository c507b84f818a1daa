//! Lazy client cursors
//!
//! A [`Cursor`] opens its server cursor on the first read, hands out one
//! buffered document at a time and fetches the next batch with OP_GET_MORE
//! when the buffer runs dry.
//!
//! Reads are bounded by the query's timeout. A timed-out get-more changes
//! nothing visible: the buffer, counters and server cursor id stay as they
//! were, and the reply is parked on the connection. The next read waits for
//! that same reply instead of asking again, so no batch is ever skipped.

use std::collections::VecDeque;
use std::sync::Arc;

use bson::Document;
use futures::Stream;
use tracing::{debug, warn};

use crate::connection::{Connection, Disposition};
use crate::error::{ExecutionError, MongoWireError, Result, ServerErrorInfo};
use crate::query::QueryDescriptor;
use crate::wire::{GetMoreMessage, KillCursorsMessage, Reply, Request};

pub mod state;

pub use state::{CursorInfo, CursorState};

/// Iterator over the results of one query.
pub struct Cursor {
    connection: Arc<Connection>,
    descriptor: QueryDescriptor,
    state: CursorState,
    cursor_id: i64,
    batch: VecDeque<Document>,
    received: i64,
    returned: i64,
    pending_get_more: Option<i32>,
    generation: u64,
}

impl Cursor {
    /// Create an unopened cursor. Nothing is sent until the first read.
    pub fn new(connection: Arc<Connection>, descriptor: QueryDescriptor) -> Self {
        Self {
            connection,
            descriptor,
            state: CursorState::Unopened,
            cursor_id: 0,
            batch: VecDeque::new(),
            received: 0,
            returned: 0,
            pending_get_more: None,
            generation: 0,
        }
    }

    pub fn state(&self) -> CursorState {
        self.state
    }

    /// Server cursor id, 0 when the server holds no cursor.
    pub fn cursor_id(&self) -> i64 {
        self.cursor_id
    }

    pub fn descriptor(&self) -> &QueryDescriptor {
        &self.descriptor
    }

    /// Send the query and install the first batch.
    ///
    /// Does nothing on a cursor that is already past `Unopened`. Any
    /// failure closes the cursor. On timeout the unanswered reply is left
    /// for the connection to drain; a server cursor it may carry is killed
    /// then.
    ///
    /// # Returns
    /// * `Ok(())` - Cursor is `Open` (or already terminal)
    /// * `Err(Timeout)` - No reply within the query timeout; cursor is `Closed`
    /// * `Err(QueryFailed)` - Server rejected the query; cursor is `Closed`
    pub async fn open(&mut self) -> Result<()> {
        if self.state != CursorState::Unopened {
            return Ok(());
        }

        let connection = Arc::clone(&self.connection);
        let request = Request::Query(self.descriptor.to_query_message());
        let timeout = self.descriptor.get_timeout();

        let outcome = async {
            let mut guard = connection.lock().await?;
            let generation = guard.generation();
            let request_id = guard.send(&request, Disposition::Discard).await?;
            let reply = guard.receive(request_id, timeout).await?;
            Ok::<_, MongoWireError>((generation, reply))
        }
        .await;

        match outcome {
            Ok((generation, reply)) => {
                self.generation = generation;
                self.state = CursorState::Open;
                self.install(reply)?;
                debug!(
                    "Opened cursor {} on {} with {} document(s)",
                    self.cursor_id,
                    self.descriptor.namespace(),
                    self.batch.len()
                );
                Ok(())
            }
            Err(err) => {
                debug!(
                    "Query on {} failed, closing cursor: {}",
                    self.descriptor.namespace(),
                    err
                );
                self.state = CursorState::Closed;
                Err(err)
            }
        }
    }

    /// Next document, fetching a batch if needed.
    ///
    /// # Returns
    /// * `Ok(Some(doc))` - Next document in server order
    /// * `Ok(None)` - Cursor is exhausted or closed
    /// * `Err(Timeout)` - Nothing arrived in time; retrying resumes the same fetch
    pub async fn get_next(&mut self) -> Result<Option<Document>> {
        if !self.fill().await? {
            return Ok(None);
        }
        let document = self.batch.pop_front();
        if document.is_some() {
            self.returned += 1;
        }
        Ok(document)
    }

    /// Whether another document is available, fetching a batch if needed.
    pub async fn has_next(&mut self) -> Result<bool> {
        self.fill().await
    }

    /// Release the server cursor and close.
    ///
    /// Kill failures are logged, never returned.
    pub async fn close(&mut self) -> Result<()> {
        if let Some(request_id) = self.pending_get_more.take() {
            self.connection.abandon(request_id);
        }
        let cursor_id = std::mem::take(&mut self.cursor_id);
        self.batch.clear();
        self.state = CursorState::Closed;

        if cursor_id != 0 && self.connection.generation() == self.generation {
            let request = Request::KillCursors(KillCursorsMessage {
                cursor_ids: vec![cursor_id],
            });
            match self.connection.send_only(&request).await {
                Ok(_) => debug!("Killed cursor {}", cursor_id),
                Err(err) => warn!("Failed to kill cursor {}: {}", cursor_id, err),
            }
        }
        Ok(())
    }

    pub fn info(&self) -> CursorInfo {
        CursorInfo {
            query: self.descriptor.summary(),
            state: self.state,
            cursor_id: self.cursor_id,
            received: self.received,
            returned: self.returned,
            buffered: self.batch.len(),
            get_more_pending: self.pending_get_more.is_some(),
        }
    }

    /// Adapt the cursor into a stream of documents.
    ///
    /// The stream ends after the first error.
    pub fn into_stream(self) -> impl Stream<Item = Result<Document>> + Send {
        futures::stream::try_unfold(self, |mut cursor| async move {
            Ok(cursor.get_next().await?.map(|doc| (doc, cursor)))
        })
    }

    /// Make sure a document is buffered, returning false when none will come.
    async fn fill(&mut self) -> Result<bool> {
        if self.state == CursorState::Unopened {
            self.open().await?;
        }

        loop {
            if self.state.is_terminal() {
                return Ok(false);
            }
            if !self.batch.is_empty() {
                return Ok(true);
            }
            if self.cursor_id == 0 {
                debug!(
                    "Cursor on {} exhausted after {} document(s)",
                    self.descriptor.namespace(),
                    self.returned
                );
                self.state = CursorState::Exhausted;
                return Ok(false);
            }
            self.get_more().await?;
        }
    }

    async fn get_more(&mut self) -> Result<()> {
        let connection = Arc::clone(&self.connection);
        let mut guard = connection.lock().await?;

        if guard.generation() != self.generation {
            debug!(
                "Cursor {} belongs to a previous connection, closing",
                self.cursor_id
            );
            self.pending_get_more = None;
            self.cursor_id = 0;
            self.state = CursorState::Closed;
            return Err(ExecutionError::CursorInvalidated.into());
        }

        let request_id = match self.pending_get_more {
            Some(request_id) => {
                debug!(
                    "Resuming get-more {} for cursor {}",
                    request_id, self.cursor_id
                );
                request_id
            }
            None => {
                let request = Request::GetMore(GetMoreMessage {
                    namespace: self.descriptor.namespace().to_string(),
                    number_to_return: self.descriptor.get_more_number_to_return(self.received),
                    cursor_id: self.cursor_id,
                });
                let request_id = guard.send(&request, Disposition::Park).await?;
                self.pending_get_more = Some(request_id);
                request_id
            }
        };

        match guard.receive(request_id, self.descriptor.get_timeout()).await {
            Ok(reply) => {
                self.pending_get_more = None;
                drop(guard);
                self.install(reply)
            }
            Err(err) => {
                if !err.is_timeout() {
                    self.pending_get_more = None;
                }
                Err(err)
            }
        }
    }

    /// Swap in a freshly received batch.
    fn install(&mut self, reply: Reply) -> Result<()> {
        if reply.is_cursor_not_found() {
            let cursor_id = std::mem::take(&mut self.cursor_id);
            self.batch.clear();
            self.state = CursorState::Closed;
            return Err(ExecutionError::CursorNotFound(cursor_id).into());
        }
        if reply.is_query_failure() {
            let info = reply
                .first_document()
                .map(ServerErrorInfo::from_query_failure)
                .unwrap_or_default();
            self.cursor_id = 0;
            self.batch.clear();
            self.state = CursorState::Closed;
            return Err(ExecutionError::QueryFailed(info).into());
        }

        let mut documents = reply.documents;
        if let Some(remaining) = self.remaining_limit()
            && documents.len() as i64 > remaining
        {
            documents.truncate(remaining as usize);
        }
        self.received += documents.len() as i64;
        self.batch = documents.into();
        self.cursor_id = reply.cursor_id;

        let limit_reached = self.remaining_limit() == Some(0);
        if self.cursor_id != 0 && (limit_reached || self.descriptor.is_single_batch()) {
            debug!("Limit reached, releasing cursor {}", self.cursor_id);
            self.connection.orphan_cursor(self.cursor_id);
            self.cursor_id = 0;
        }
        Ok(())
    }

    fn remaining_limit(&self) -> Option<i64> {
        match self.descriptor.get_limit() {
            0 => None,
            limit => Some((i64::from(limit.unsigned_abs()) - self.received).max(0)),
        }
    }
}

impl Drop for Cursor {
    fn drop(&mut self) {
        if let Some(request_id) = self.pending_get_more.take() {
            self.connection.abandon(request_id);
        }
        if self.cursor_id != 0 && self.connection.generation() == self.generation {
            self.connection.orphan_cursor(self.cursor_id);
        }
    }
}

impl std::fmt::Debug for Cursor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cursor")
            .field("namespace", &self.descriptor.namespace())
            .field("state", &self.state)
            .field("cursor_id", &self.cursor_id)
            .field("buffered", &self.batch.len())
            .field("returned", &self.returned)
            .finish()
    }
}
