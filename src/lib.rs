//! mongowire: MongoDB legacy wire-protocol client
//!
//! This library issues queries over a persistent connection, iterates server
//! cursors lazily batch by batch, and bounds every blocking read with a
//! client-side timeout. A timed-out read leaves both the connection and the
//! cursor usable: late replies are drained by their length prefix, and a
//! cursor retrying a get-more picks up the very reply it was waiting for.
//!
//! # Modules
//!
//! - `cli`: Command-line interface and argument parsing
//! - `client`: `Client`, `Database` and `Collection` handles
//! - `config`: Configuration management
//! - `connection`: Shared connection, reply ledger and deadlines
//! - `cursor`: Lazy cursors and their state machine
//! - `error`: Error types and handling
//! - `gridfs`: Chunked file storage on top of collections
//! - `query`: Query descriptors and builders
//! - `transport`: Frame-oriented byte transports
//! - `wire`: Wire protocol codec
//!
//! # Example
//!
//! ```no_run
//! use bson::doc;
//! use mongowire::{Client, ClientOptions};
//!
//! #[tokio::main]
//! async fn main() -> mongowire::Result<()> {
//!     let client = Client::connect("localhost:27017", ClientOptions::default()).await?;
//!     let people = client.database("test").collection("people");
//!
//!     let mut cursor = people.find(doc! { "age": 30 }).timeout_ms(500).cursor();
//!     loop {
//!         match cursor.get_next().await {
//!             Ok(Some(doc)) => println!("{doc}"),
//!             Ok(None) => break,
//!             Err(e) if e.is_timeout() => continue,
//!             Err(e) => return Err(e),
//!         }
//!     }
//!     Ok(())
//! }
//! ```

pub mod cli;
pub mod client;
pub mod config;
pub mod connection;
pub mod cursor;
pub mod error;
pub mod gridfs;
pub mod query;
pub mod transport;
pub mod wire;

// Re-export commonly used types
pub use client::{Client, ClientOptions, Collection, Database};
pub use config::Config;
pub use connection::{Connection, Deadline};
pub use cursor::{Cursor, CursorInfo, CursorState};
pub use error::{MongoWireError, Result};
pub use gridfs::{GridFile, GridFs, GridFsCursor};
pub use query::{Query, QueryDescriptor};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Get library version string
///
/// # Returns
/// * `&str` - Version string
pub fn version() -> &'static str {
    VERSION
}
