//! Client facade
//!
//! [`Client`] owns the shared connection. [`Database`] and [`Collection`]
//! are cheap handles that build queries and run commands on it:
//!
//! ```rust,no_run
//! use bson::doc;
//! use mongowire::client::{Client, ClientOptions};
//!
//! # async fn demo() -> mongowire::Result<()> {
//! let client = Client::connect("localhost:27017", ClientOptions::default()).await?;
//! let people = client.database("test").collection("people");
//!
//! people.insert(doc! { "name": "ann" }).await?;
//! let mut cursor = people.find(doc! {}).timeout_ms(500).cursor();
//! while let Some(doc) = cursor.get_next().await? {
//!     println!("{doc}");
//! }
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;
use std::time::Duration;

use bson::oid::ObjectId;
use bson::{Bson, Document, doc};
use tracing::{debug, info};

use crate::config::Config;
use crate::connection::{Connection, ConnectionOptions, Disposition};
use crate::error::{ExecutionError, MongoWireError, Result, ServerErrorInfo};
use crate::gridfs::GridFs;
use crate::query::{Query, QueryDescriptor};
use crate::transport::Transport;
use crate::wire::{DEFAULT_MAX_MESSAGE_SIZE, DeleteMessage, InsertMessage, Request};

/// Server error code for a missing namespace.
const NAMESPACE_NOT_FOUND: i32 = 26;

/// Client-wide settings
#[derive(Debug, Clone)]
pub struct ClientOptions {
    /// Seeds the timeout of every query and command. `None` blocks indefinitely.
    pub query_timeout: Option<Duration>,

    /// Follow each write with `getlasterror` and report write errors
    pub acknowledge_writes: bool,

    pub connect_timeout: Duration,
    pub max_message_size: usize,

    /// Seeds the batch size of every query. Zero lets the server decide.
    pub batch_size: i32,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            query_timeout: None,
            acknowledge_writes: true,
            connect_timeout: Duration::from_secs(10),
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            batch_size: 0,
        }
    }
}

impl From<&Config> for ClientOptions {
    fn from(config: &Config) -> Self {
        Self {
            query_timeout: config.query.default_timeout(),
            acknowledge_writes: config.query.acknowledge_writes,
            connect_timeout: Duration::from_secs(config.connection.connect_timeout),
            max_message_size: config.connection.max_message_size,
            batch_size: config.query.batch_size,
        }
    }
}

impl ClientOptions {
    fn connection_options(&self) -> ConnectionOptions {
        ConnectionOptions {
            connect_timeout: self.connect_timeout,
            max_message_size: self.max_message_size,
        }
    }
}

/// Entry point: one connection, many databases.
#[derive(Debug, Clone)]
pub struct Client {
    connection: Arc<Connection>,
    options: ClientOptions,
}

impl Client {
    /// Connect over TCP.
    ///
    /// # Arguments
    /// * `address` - `host:port` of the server
    /// * `options` - Client settings
    ///
    /// # Returns
    /// * `Result<Self>` - Connected client or connection error
    pub async fn connect(address: &str, options: ClientOptions) -> Result<Self> {
        let connection = Connection::connect(address, options.connection_options()).await?;
        Ok(Self {
            connection: Arc::new(connection),
            options,
        })
    }

    /// Build a client over an existing transport (in-memory peers, tunnels).
    pub fn with_transport(transport: Box<dyn Transport>, options: ClientOptions) -> Self {
        let connection = Connection::new(transport, options.connection_options());
        Self {
            connection: Arc::new(connection),
            options,
        }
    }

    pub fn database(&self, name: &str) -> Database {
        Database {
            client: self.clone(),
            name: name.to_string(),
        }
    }

    /// Replace a broken connection. Open cursors are invalidated.
    pub async fn reconnect(&self) -> Result<()> {
        self.connection.reconnect().await
    }

    pub fn connection(&self) -> &Arc<Connection> {
        &self.connection
    }

    pub fn options(&self) -> &ClientOptions {
        &self.options
    }
}

/// Handle to one database.
#[derive(Debug, Clone)]
pub struct Database {
    client: Client,
    name: String,
}

impl Database {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn collection(&self, name: &str) -> Collection {
        Collection {
            database: self.clone(),
            name: name.to_string(),
        }
    }

    /// Run a command with the client's default timeout.
    pub async fn command(&self, command: Document) -> Result<Document> {
        self.command_with_timeout(command, self.client.options.query_timeout)
            .await
    }

    /// Run a command against `db.$cmd`.
    ///
    /// # Arguments
    /// * `command` - Command document, command name first
    /// * `timeout` - Read deadline for the reply
    ///
    /// # Returns
    /// * `Ok(reply)` - Reply with `ok: 1`
    /// * `Err(CommandFailed)` - Reply with `ok: 0`
    pub async fn command_with_timeout(
        &self,
        command: Document,
        timeout: Option<Duration>,
    ) -> Result<Document> {
        let name = command.keys().next().cloned().unwrap_or_default();
        debug!("Running command '{}' on {}", name, self.name);

        let descriptor = QueryDescriptor::new(self.command_namespace(), command)
            .limit(-1)
            .with_timeout(timeout);
        let mut cursor = Query::new(Arc::clone(&self.client.connection), descriptor).cursor();
        let reply = cursor.get_next().await?.ok_or_else(|| {
            MongoWireError::from(ExecutionError::InvalidParameters(format!(
                "command '{name}' returned no reply"
            )))
        })?;

        if reply.get("ok").and_then(as_i64) == Some(1) {
            Ok(reply)
        } else {
            Err(ExecutionError::CommandFailed(ServerErrorInfo::from_command_reply(&reply)).into())
        }
    }

    /// Evaluate a server-side script and return its `retval`.
    ///
    /// The script is sent as is and never interpreted by the client.
    pub async fn eval(&self, code: &str, args: Vec<Bson>) -> Result<Bson> {
        let reply = self.command(doc! { "$eval": code, "args": args }).await?;
        Ok(reply.get("retval").cloned().unwrap_or(Bson::Null))
    }

    /// GridFS bucket under the default `fs` prefix.
    pub fn gridfs(&self) -> GridFs {
        GridFs::with_prefix(self, "fs")
    }

    fn command_namespace(&self) -> String {
        format!("{}.$cmd", self.name)
    }

    async fn write(&self, request: Request) -> Result<Option<Document>> {
        self.write_with(request, self.client.options.acknowledge_writes)
            .await
    }

    /// Send a write, then `getlasterror` under the same lock when `acknowledge` is set.
    pub(crate) async fn write_with(
        &self,
        request: Request,
        acknowledge: bool,
    ) -> Result<Option<Document>> {
        let connection = &self.client.connection;
        let mut guard = connection.lock().await?;
        guard.send(&request, Disposition::Discard).await?;

        if !acknowledge {
            return Ok(None);
        }

        let last_error = QueryDescriptor::new(self.command_namespace(), doc! { "getlasterror": 1 })
            .limit(-1)
            .to_query_message();
        let request_id = guard
            .send(&Request::Query(last_error), Disposition::Discard)
            .await?;
        let reply = guard
            .receive(request_id, self.client.options.query_timeout)
            .await?;
        let status = reply.documents.into_iter().next().unwrap_or_default();

        match status.get("err") {
            Some(Bson::String(_)) => Err(ExecutionError::WriteFailed(
                ServerErrorInfo::from_last_error(&status),
            )
            .into()),
            _ => Ok(Some(status)),
        }
    }
}

/// Handle to one collection.
#[derive(Debug, Clone)]
pub struct Collection {
    database: Database,
    name: String,
}

impl Collection {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn database(&self) -> &Database {
        &self.database
    }

    /// `db.collection`
    pub fn namespace(&self) -> String {
        format!("{}.{}", self.database.name, self.name)
    }

    /// Start a query. The client's default timeout and batch size apply
    /// until overridden.
    pub fn find(&self, filter: Document) -> Query {
        let options = &self.database.client.options;
        let descriptor = QueryDescriptor::new(self.namespace(), filter)
            .batch_size(options.batch_size)
            .with_timeout(options.query_timeout);
        Query::new(Arc::clone(&self.database.client.connection), descriptor)
    }

    /// First matching document, if any.
    pub async fn find_one(&self, filter: Document) -> Result<Option<Document>> {
        self.find(filter).limit(-1).cursor().get_next().await
    }

    /// Insert one document, returning its `_id`.
    pub async fn insert(&self, document: Document) -> Result<Bson> {
        let mut ids = self.insert_many(vec![document]).await?;
        Ok(ids.pop().unwrap_or(Bson::Null))
    }

    /// Insert documents in one OP_INSERT, returning their `_id`s in order.
    ///
    /// Documents without an `_id` get a fresh ObjectId.
    pub async fn insert_many(&self, documents: Vec<Document>) -> Result<Vec<Bson>> {
        let acknowledge = self.database.client.options.acknowledge_writes;
        self.insert_documents(documents, acknowledge).await
    }

    pub(crate) async fn insert_documents(
        &self,
        documents: Vec<Document>,
        acknowledge: bool,
    ) -> Result<Vec<Bson>> {
        if documents.is_empty() {
            return Err(ExecutionError::InvalidParameters(
                "insert requires at least one document".to_string(),
            )
            .into());
        }

        let documents: Vec<Document> = documents.into_iter().map(with_object_id).collect();
        let ids = documents
            .iter()
            .map(|doc| doc.get("_id").cloned().unwrap_or(Bson::Null))
            .collect();
        let count = documents.len();

        self.database
            .write_with(
                Request::Insert(InsertMessage {
                    continue_on_error: false,
                    namespace: self.namespace(),
                    documents,
                }),
                acknowledge,
            )
            .await?;
        debug!("Inserted {} document(s) into {}", count, self.namespace());
        Ok(ids)
    }

    /// Remove every matching document.
    ///
    /// # Returns
    /// * `Result<Option<i64>>` - Number removed when writes are acknowledged
    pub async fn remove(&self, selector: Document) -> Result<Option<i64>> {
        let status = self
            .database
            .write(Request::Delete(DeleteMessage {
                namespace: self.namespace(),
                single_remove: false,
                selector,
            }))
            .await?;
        Ok(status.and_then(|s| s.get("n").and_then(as_i64)))
    }

    /// Number of matching documents.
    pub async fn count(&self, filter: Document) -> Result<u64> {
        let reply = self
            .database
            .command(doc! { "count": self.name.as_str(), "query": filter })
            .await?;
        let n = reply.get("n").and_then(as_i64).unwrap_or(0);
        Ok(n.max(0) as u64)
    }

    /// Drop the collection.
    ///
    /// # Returns
    /// * `Result<bool>` - `false` when the collection did not exist
    pub async fn drop(&self) -> Result<bool> {
        match self
            .database
            .command(doc! { "drop": self.name.as_str() })
            .await
        {
            Ok(_) => {
                info!("Dropped collection {}", self.namespace());
                Ok(true)
            }
            Err(MongoWireError::Execution(ExecutionError::CommandFailed(info)))
                if is_namespace_missing(&info) =>
            {
                Ok(false)
            }
            Err(err) => Err(err),
        }
    }
}

fn with_object_id(document: Document) -> Document {
    if document.contains_key("_id") {
        return document;
    }
    let mut with_id = doc! { "_id": ObjectId::new() };
    for (key, value) in document {
        with_id.insert(key, value);
    }
    with_id
}

fn is_namespace_missing(info: &ServerErrorInfo) -> bool {
    info.code() == Some(NAMESPACE_NOT_FOUND)
        || info
            .message()
            .is_some_and(|msg| msg.contains("ns not found"))
}

/// Numeric reply fields arrive as int32, int64 or double depending on the server.
pub(crate) fn as_i64(value: &Bson) -> Option<i64> {
    match value {
        Bson::Int32(n) => Some(i64::from(*n)),
        Bson::Int64(n) => Some(*n),
        Bson::Double(n) => Some(*n as i64),
        Bson::Boolean(b) => Some(i64::from(*b)),
        _ => None,
    }
}
