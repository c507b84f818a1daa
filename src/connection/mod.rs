//! Connection management for the wire protocol
//!
//! This module provides:
//! - A shared connection that serialises request/response exchanges
//! - The reply ledger that keeps the byte stream framed after timeouts
//! - Deferred cursor cleanup (kill cursors before the next request)
//! - Reconnection with generation tracking
//!
//! # Stale replies
//!
//! A timed-out read does not stop the server from answering. Each request
//! that expects a reply is recorded with a [`Disposition`]. When a later
//! exchange reads a frame that answers someone else, the frame's length
//! prefix lets it be skipped whole. It is then dropped (`Discard`) or kept
//! for the cursor that will come back for it (`Park`). A reply that answers
//! nothing in the ledger means the stream is desynchronised, and the
//! connection is marked broken.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{Mutex as AsyncMutex, MutexGuard as AsyncMutexGuard};
use tracing::{debug, info, trace, warn};

use crate::config::ConnectionConfig;
use crate::error::{ConnectionError, ExecutionError, MongoWireError, ProtocolError, Result};
use crate::transport::{self, Transport};
use crate::wire::{DEFAULT_MAX_MESSAGE_SIZE, KillCursorsMessage, Reply, Request, peek_reply};

pub mod timeout;

#[cfg(test)]
pub(crate) mod testing;

pub use timeout::Deadline;

/// What to do with a reply whose requester stopped waiting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Drain and drop it.
    Discard,

    /// Keep it until the requester comes back for it.
    Park,
}

/// Transport settings for a connection
#[derive(Debug, Clone)]
pub struct ConnectionOptions {
    /// Upper bound on TCP connection establishment
    pub connect_timeout: Duration,

    /// Largest frame accepted from the server
    pub max_message_size: usize,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
        }
    }
}

impl From<&ConnectionConfig> for ConnectionOptions {
    fn from(config: &ConnectionConfig) -> Self {
        Self {
            connect_timeout: Duration::from_secs(config.connect_timeout),
            max_message_size: config.max_message_size,
        }
    }
}

/// Snapshot of the reply ledger
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConnectionStats {
    /// Requests still waiting for a reply
    pub outstanding: usize,

    /// Replies held for a requester that timed out
    pub parked: usize,

    /// Cursor ids queued for OP_KILL_CURSORS
    pub orphaned_cursors: usize,

    /// Stale replies skipped so far
    pub drained_replies: u64,

    /// Incremented on every reconnect
    pub generation: u64,

    /// Why the connection is unusable, if it is
    pub broken: Option<String>,
}

#[derive(Debug, Default)]
struct ReplyLedger {
    outstanding: HashMap<i32, Disposition>,
    parked: HashMap<i32, Vec<u8>>,
    orphaned_cursors: Vec<i64>,
    drained_replies: u64,
    write_in_progress: bool,
    broken: Option<String>,
    generation: u64,
}

impl ReplyLedger {
    fn orphan(&mut self, cursor_id: i64) {
        if cursor_id != 0 && !self.orphaned_cursors.contains(&cursor_id) {
            self.orphaned_cursors.push(cursor_id);
        }
    }
}

/// A single server connection shared by every cursor of a client.
pub struct Connection {
    address: Option<String>,
    options: ConnectionOptions,
    io: AsyncMutex<Box<dyn Transport>>,
    ledger: Mutex<ReplyLedger>,
    next_request_id: AtomicI32,
}

impl Connection {
    /// Wrap an already connected transport.
    ///
    /// Connections built this way cannot [`reconnect`](Self::reconnect).
    pub fn new(transport: Box<dyn Transport>, options: ConnectionOptions) -> Self {
        Self {
            address: None,
            options,
            io: AsyncMutex::new(transport),
            ledger: Mutex::new(ReplyLedger::default()),
            next_request_id: AtomicI32::new(1),
        }
    }

    /// Open a TCP connection to `address`.
    ///
    /// # Arguments
    /// * `address` - `host:port` of the server
    /// * `options` - Transport settings
    ///
    /// # Returns
    /// * `Result<Self>` - Connected instance or connection error
    pub async fn connect(address: &str, options: ConnectionOptions) -> Result<Self> {
        let transport =
            transport::connect(address, options.connect_timeout, options.max_message_size)
                .await?;
        info!("Connected to {}", address);

        let mut connection = Self::new(Box::new(transport), options);
        connection.address = Some(address.to_string());
        Ok(connection)
    }

    /// Address this connection dials on reconnect.
    pub fn address(&self) -> Option<&str> {
        self.address.as_deref()
    }

    /// Incremented each time the underlying transport is replaced.
    pub fn generation(&self) -> u64 {
        self.ledger().generation
    }

    /// Reason the connection is unusable, if it is.
    pub fn broken_reason(&self) -> Option<String> {
        self.ledger().broken.clone()
    }

    /// Current ledger counters.
    pub fn stats(&self) -> ConnectionStats {
        let ledger = self.ledger();
        ConnectionStats {
            outstanding: ledger.outstanding.len(),
            parked: ledger.parked.len(),
            orphaned_cursors: ledger.orphaned_cursors.len(),
            drained_replies: ledger.drained_replies,
            generation: ledger.generation,
            broken: ledger.broken.clone(),
        }
    }

    /// Acquire exclusive use of the connection for one exchange.
    ///
    /// Orphaned cursors are killed before the guard is handed out, so
    /// their OP_KILL_CURSORS never interleaves with someone else's request.
    ///
    /// # Returns
    /// * `Result<ConnectionGuard>` - Guard, or `Broken` if the stream is unusable
    pub async fn lock(&self) -> Result<ConnectionGuard<'_>> {
        let transport = self.io.lock().await;
        {
            let mut ledger = self.ledger();
            if ledger.write_in_progress {
                ledger.write_in_progress = false;
                ledger.broken = Some("a request was interrupted mid-write".to_string());
                warn!("Connection poisoned by an interrupted write");
            }
            if let Some(reason) = &ledger.broken {
                return Err(ConnectionError::Broken(reason.clone()).into());
            }
        }

        let mut guard = ConnectionGuard {
            conn: self,
            transport,
        };
        guard.flush_orphans().await?;
        Ok(guard)
    }

    /// Send a request that has no reply (insert, delete, kill cursors).
    pub async fn send_only(&self, request: &Request) -> Result<i32> {
        let mut guard = self.lock().await?;
        guard.send(request, Disposition::Discard).await
    }

    /// Send a request and wait for its reply.
    ///
    /// On timeout the reply is marked for discard; it is drained by a
    /// later exchange.
    ///
    /// # Arguments
    /// * `request` - Query or get-more to send
    /// * `timeout` - Client-side read deadline, `None` to wait indefinitely
    ///
    /// # Returns
    /// * `Result<Reply>` - The reply to this request
    pub async fn call(&self, request: &Request, timeout: Option<Duration>) -> Result<Reply> {
        let mut guard = self.lock().await?;
        let request_id = guard.send(request, Disposition::Discard).await?;
        guard.receive(request_id, timeout).await
    }

    /// Stop caring about the reply to `request_id`.
    ///
    /// A parked reply is dropped at once; an outstanding one is drained
    /// when it arrives.
    pub fn abandon(&self, request_id: i32) {
        let mut ledger = self.ledger();
        if let Some(frame) = ledger.parked.remove(&request_id) {
            if let Ok((_, cursor_id)) = peek_reply(&frame) {
                ledger.orphan(cursor_id);
            }
            trace!("Dropped parked reply to request {}", request_id);
        } else if let Some(disposition) = ledger.outstanding.get_mut(&request_id) {
            *disposition = Disposition::Discard;
        }
    }

    /// Queue a server cursor for OP_KILL_CURSORS before the next request.
    pub fn orphan_cursor(&self, cursor_id: i64) {
        self.ledger().orphan(cursor_id);
    }

    /// Dial the original address again and replace the transport.
    ///
    /// Cursors opened before the reconnect are invalidated.
    pub async fn reconnect(&self) -> Result<()> {
        let Some(address) = self.address.clone() else {
            return Err(ConnectionError::ReconnectUnsupported.into());
        };
        let transport = transport::connect(
            &address,
            self.options.connect_timeout,
            self.options.max_message_size,
        )
        .await?;
        self.replace_transport(Box::new(transport)).await;
        info!("Reconnected to {}", address);
        Ok(())
    }

    /// Swap in a fresh transport and reset the ledger.
    pub async fn replace_transport(&self, transport: Box<dyn Transport>) {
        let mut io = self.io.lock().await;
        *io = transport;

        let mut ledger = self.ledger();
        *ledger = ReplyLedger {
            generation: ledger.generation + 1,
            drained_replies: ledger.drained_replies,
            ..ReplyLedger::default()
        };
    }

    fn ledger(&self) -> MutexGuard<'_, ReplyLedger> {
        self.ledger
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn mark_broken(&self, reason: String) {
        warn!("Connection marked unusable: {}", reason);
        self.ledger().broken = Some(reason);
    }

    fn next_request_id(&self) -> i32 {
        let id = self.next_request_id.fetch_add(1, Ordering::Relaxed) & i32::MAX;
        id.max(1)
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("address", &self.address)
            .field("stats", &self.stats())
            .field("transport", &"<Transport>")
            .finish()
    }
}

/// Exclusive use of a connection for one send/receive pair.
pub struct ConnectionGuard<'a> {
    conn: &'a Connection,
    transport: AsyncMutexGuard<'a, Box<dyn Transport>>,
}

impl ConnectionGuard<'_> {
    /// Generation of the transport this guard holds.
    pub fn generation(&self) -> u64 {
        self.conn.generation()
    }

    /// Encode and write `request`.
    ///
    /// # Arguments
    /// * `request` - Request to send
    /// * `disposition` - Fate of the reply if its requester stops waiting
    ///
    /// # Returns
    /// * `Result<i32>` - Request id used on the wire
    pub async fn send(&mut self, request: &Request, disposition: Disposition) -> Result<i32> {
        let request_id = self.conn.next_request_id();
        let bytes = request.encode(request_id)?;

        self.conn.ledger().write_in_progress = true;
        if let Err(err) = self.transport.send(&bytes).await {
            self.conn.mark_broken(format!("send failed: {err}"));
            return Err(err);
        }
        {
            let mut ledger = self.conn.ledger();
            ledger.write_in_progress = false;
            if request.expects_reply() {
                ledger.outstanding.insert(request_id, disposition);
            }
        }

        debug!(
            "Sent {} request {} to {} ({} bytes)",
            request.name(),
            request_id,
            self.transport.peer(),
            bytes.len()
        );
        Ok(request_id)
    }

    /// Wait for the reply to `request_id`, draining stale replies on the way.
    ///
    /// # Arguments
    /// * `request_id` - Id returned by [`send`](Self::send)
    /// * `timeout` - Read deadline, measured from now
    ///
    /// # Returns
    /// * `Ok(Reply)` - The reply, removed from the ledger
    /// * `Err(Timeout)` - Nothing arrived in time; the request stays outstanding
    /// * `Err(Io | Protocol)` - The connection is now broken
    pub async fn receive(&mut self, request_id: i32, timeout: Option<Duration>) -> Result<Reply> {
        let parked = self.conn.ledger().parked.remove(&request_id);
        if let Some(frame) = parked {
            debug!("Claimed parked reply to request {}", request_id);
            return self.decode(&frame);
        }

        let known = self.conn.ledger().outstanding.contains_key(&request_id);
        if !known {
            return Err(ExecutionError::InvalidParameters(format!(
                "request {request_id} has no outstanding reply"
            ))
            .into());
        }

        let deadline = Deadline::after(timeout);
        loop {
            let frame = match self.transport.receive(deadline).await {
                Ok(frame) => frame,
                Err(MongoWireError::Timeout(mut err)) => {
                    err.request_id = Some(request_id);
                    debug!("{}", err);
                    return Err(err.into());
                }
                Err(err) => {
                    self.conn.mark_broken(err.to_string());
                    return Err(err);
                }
            };

            let (response_to, cursor_id) = match peek_reply(&frame) {
                Ok(ids) => ids,
                Err(err) => {
                    self.conn.mark_broken(err.to_string());
                    return Err(err.into());
                }
            };

            if response_to == request_id {
                self.conn.ledger().outstanding.remove(&request_id);
                return self.decode(&frame);
            }

            let disposition = self.conn.ledger().outstanding.remove(&response_to);
            match disposition {
                Some(Disposition::Discard) => {
                    let mut ledger = self.conn.ledger();
                    ledger.drained_replies += 1;
                    ledger.orphan(cursor_id);
                    debug!(
                        "Drained stale reply to request {} ({} bytes)",
                        response_to,
                        frame.len()
                    );
                }
                Some(Disposition::Park) => {
                    debug!("Parked reply to request {}", response_to);
                    self.conn.ledger().parked.insert(response_to, frame);
                }
                None => {
                    let err = ProtocolError::UnexpectedResponse {
                        expected: request_id,
                        found: response_to,
                    };
                    self.conn.mark_broken(err.to_string());
                    return Err(err.into());
                }
            }
        }
    }

    fn decode(&self, frame: &[u8]) -> Result<Reply> {
        Reply::decode(frame).inspect_err(|err| self.conn.mark_broken(err.to_string()))
    }

    async fn flush_orphans(&mut self) -> Result<()> {
        let cursor_ids = std::mem::take(&mut self.conn.ledger().orphaned_cursors);
        if cursor_ids.is_empty() {
            return Ok(());
        }

        debug!("Killing {} orphaned cursor(s)", cursor_ids.len());
        let request = Request::KillCursors(KillCursorsMessage { cursor_ids });
        self.send(&request, Disposition::Discard).await.map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::testing::{answer, pair, read_request};
    use super::*;
    use crate::transport::StreamTransport;
    use crate::wire::{GetMoreMessage, QueryFlags, QueryMessage};
    use bson::doc;
    use tokio::io::duplex;
    use tokio_test::{assert_err, assert_ok};

    fn query(tag: i32) -> Request {
        Request::Query(QueryMessage {
            flags: QueryFlags::default(),
            namespace: "db.$cmd".to_string(),
            number_to_skip: 0,
            number_to_return: -1,
            query: doc! { "tag": tag },
            return_fields: None,
        })
    }

    #[tokio::test]
    async fn test_call_returns_matching_reply() {
        let (connection, mut peer) = pair();
        let server = tokio::spawn(async move {
            let (id, _) = read_request(&mut peer).await;
            answer(&mut peer, id, 0, vec![doc! { "ok": 1 }]).await;
        });

        let reply = assert_ok!(connection.call(&query(1), None).await);
        assert_eq!(reply.documents, vec![doc! { "ok": 1 }]);
        assert_eq!(connection.stats().outstanding, 0);
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_stale_reply_drained_before_next_answer() {
        let (connection, mut peer) = pair();
        let server = tokio::spawn(async move {
            let (slow, _) = read_request(&mut peer).await;
            let (fast, _) = read_request(&mut peer).await;
            answer(&mut peer, slow, 0, vec![doc! { "stale": true }]).await;
            answer(&mut peer, fast, 0, vec![doc! { "fresh": true }]).await;
        });

        let err = assert_err!(
            connection
                .call(&query(1), Some(Duration::from_millis(50)))
                .await
        );
        assert!(err.is_timeout());
        assert_eq!(connection.stats().outstanding, 1);

        let reply = assert_ok!(connection.call(&query(2), None).await);
        assert_eq!(reply.documents, vec![doc! { "fresh": true }]);

        let stats = connection.stats();
        assert_eq!(stats.drained_replies, 1);
        assert_eq!(stats.outstanding, 0);
        assert_eq!(stats.broken, None);
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_parked_reply_claimed_by_owner() {
        let (connection, mut peer) = pair();
        let server = tokio::spawn(async move {
            let (first, _) = read_request(&mut peer).await;
            let (second, _) = read_request(&mut peer).await;
            answer(&mut peer, first, 77, vec![doc! { "batch": 2 }]).await;
            answer(&mut peer, second, 0, vec![doc! { "other": 1 }]).await;
        });

        let get_more = Request::GetMore(GetMoreMessage {
            namespace: "db.c".to_string(),
            number_to_return: 0,
            cursor_id: 77,
        });
        let pending = {
            let mut guard = connection.lock().await.unwrap();
            let id = guard.send(&get_more, Disposition::Park).await.unwrap();
            let err = assert_err!(guard.receive(id, Some(Duration::from_millis(50))).await);
            assert!(err.is_timeout());
            id
        };

        assert_ok!(connection.call(&query(3), None).await);
        assert_eq!(connection.stats().parked, 1);

        let mut guard = connection.lock().await.unwrap();
        let reply = assert_ok!(guard.receive(pending, Some(Duration::from_millis(1))).await);
        assert_eq!(reply.cursor_id, 77);
        assert_eq!(reply.documents, vec![doc! { "batch": 2 }]);
        drop(guard);
        assert_eq!(connection.stats().parked, 0);
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_drained_cursor_is_killed_before_next_request() {
        let (connection, mut peer) = pair();
        let server = tokio::spawn(async move {
            let (slow, _) = read_request(&mut peer).await;
            let (fast, _) = read_request(&mut peer).await;
            answer(&mut peer, slow, 4242, vec![doc! { "n": 1 }]).await;
            answer(&mut peer, fast, 0, vec![]).await;
            let (_, kill) = read_request(&mut peer).await;
            let (last, _) = read_request(&mut peer).await;
            answer(&mut peer, last, 0, vec![]).await;
            kill
        });

        assert_err!(
            connection
                .call(&query(1), Some(Duration::from_millis(30)))
                .await
        );
        assert_ok!(connection.call(&query(2), None).await);
        assert_eq!(connection.stats().orphaned_cursors, 1);
        assert_ok!(connection.call(&query(3), None).await);

        let kill = server.await.unwrap();
        assert_eq!(
            kill,
            Request::KillCursors(KillCursorsMessage {
                cursor_ids: vec![4242]
            })
        );
        assert_eq!(connection.stats().orphaned_cursors, 0);
    }

    #[tokio::test]
    async fn test_unknown_response_breaks_connection() {
        let (connection, mut peer) = pair();
        let server = tokio::spawn(async move {
            let (id, _) = read_request(&mut peer).await;
            answer(&mut peer, id + 500, 0, vec![]).await;
            peer
        });

        let err = assert_err!(connection.call(&query(1), None).await);
        assert!(matches!(
            err,
            MongoWireError::Protocol(ProtocolError::UnexpectedResponse { .. })
        ));

        let again = assert_err!(connection.call(&query(2), None).await);
        assert!(matches!(
            again,
            MongoWireError::Connection(ConnectionError::Broken(_))
        ));
        assert!(connection.broken_reason().is_some());
        drop(server.await.unwrap());
    }

    #[tokio::test]
    async fn test_abandoned_park_becomes_discard() {
        let (connection, mut peer) = pair();
        let server = tokio::spawn(async move {
            let (first, _) = read_request(&mut peer).await;
            let (second, _) = read_request(&mut peer).await;
            answer(&mut peer, first, 0, vec![]).await;
            answer(&mut peer, second, 0, vec![]).await;
        });

        let pending = {
            let mut guard = connection.lock().await.unwrap();
            let id = guard.send(&query(1), Disposition::Park).await.unwrap();
            assert_err!(guard.receive(id, Some(Duration::from_millis(30))).await);
            id
        };
        connection.abandon(pending);

        assert_ok!(connection.call(&query(2), None).await);
        let stats = connection.stats();
        assert_eq!(stats.parked, 0);
        assert_eq!(stats.drained_replies, 1);
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_reconnect_requires_address() {
        let (connection, _peer) = pair();
        let err = assert_err!(connection.reconnect().await);
        assert!(matches!(
            err,
            MongoWireError::Connection(ConnectionError::ReconnectUnsupported)
        ));
    }

    #[tokio::test]
    async fn test_replace_transport_bumps_generation() {
        let (connection, _peer) = pair();
        connection.orphan_cursor(12);
        let (fresh, _other) = duplex(1024);
        connection
            .replace_transport(Box::new(StreamTransport::new(fresh, "fresh")))
            .await;

        let stats = connection.stats();
        assert_eq!(stats.generation, 1);
        assert_eq!(stats.orphaned_cursors, 0);
    }
}
