//! Error handling module for wire-protocol operations.
//!
//! This module provides:
//! - The crate error type with the timeout / I/O / protocol taxonomy
//! - Structured server error extraction from reply documents
//!
//! # Example
//!
//! ```rust,no_run
//! use mongowire::error::{MongoWireError, Result};
//!
//! fn handle(result: Result<()>) {
//!     match result {
//!         Err(e) if e.is_timeout() => eprintln!("timed out, connection still usable"),
//!         Err(e) if e.is_connection_fatal() => eprintln!("reconnect needed: {e}"),
//!         Err(e) => eprintln!("{e}"),
//!         Ok(()) => {}
//!     }
//! }
//! ```

pub mod kinds;
pub mod server;

// Re-export commonly used types
pub use kinds::{
    ConfigError, ConnectionError, ExecutionError, MongoWireError, ProtocolError, Result,
    TimeoutError,
};
pub use server::ServerErrorInfo;
