//! Query building
//!
//! A [`QueryDescriptor`] captures everything needed to open a cursor:
//! namespace, filter, limit and batching, modifiers, flags and the
//! client-side timeout. Builder methods consume the descriptor and return
//! the updated value, so two queries never share mutable state.
//!
//! [`Query`] pairs a descriptor with the connection it will run on and is
//! what [`Collection::find`](crate::client::Collection::find) hands out.

use std::sync::Arc;
use std::time::Duration;

use bson::{Bson, Document};
use serde::Serialize;

use crate::connection::Connection;
use crate::cursor::Cursor;
use crate::wire::{QueryFlags, QueryMessage};

/// Immutable description of a query.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryDescriptor {
    namespace: String,
    filter: Document,
    limit: i32,
    skip: i32,
    batch_size: i32,
    fields: Option<Document>,
    sort: Option<Document>,
    hint: Option<Document>,
    options: Document,
    flags: QueryFlags,
    timeout: Option<Duration>,
}

impl QueryDescriptor {
    /// Create a descriptor for `namespace` (`db.collection`) matching `filter`.
    pub fn new(namespace: impl Into<String>, filter: Document) -> Self {
        Self {
            namespace: namespace.into(),
            filter,
            limit: 0,
            skip: 0,
            batch_size: 0,
            fields: None,
            sort: None,
            hint: None,
            options: Document::new(),
            flags: QueryFlags::default(),
            timeout: None,
        }
    }

    /// Cap the number of documents.
    ///
    /// Zero means no limit. A negative value asks for a single batch of at
    /// most `|n|` documents, after which the server keeps no cursor.
    pub fn limit(mut self, n: i32) -> Self {
        self.limit = n;
        self
    }

    pub fn skip(mut self, n: i32) -> Self {
        self.skip = n;
        self
    }

    /// Preferred number of documents per batch. Zero lets the server decide.
    pub fn batch_size(mut self, n: i32) -> Self {
        self.batch_size = n;
        self
    }

    /// Projection applied by the server.
    pub fn fields(mut self, fields: Document) -> Self {
        self.fields = Some(fields);
        self
    }

    pub fn sort(mut self, sort: Document) -> Self {
        self.sort = Some(sort);
        self
    }

    pub fn hint(mut self, hint: Document) -> Self {
        self.hint = Some(hint);
        self
    }

    /// Add a query modifier such as `$maxScan` or `$comment`.
    pub fn add_option(mut self, key: impl Into<String>, value: impl Into<Bson>) -> Self {
        self.options.insert(key.into(), value.into());
        self
    }

    pub fn slave_okay(mut self, enabled: bool) -> Self {
        self.flags = self.flags.with(QueryFlags::SLAVE_OK, enabled);
        self
    }

    pub fn no_cursor_timeout(mut self, enabled: bool) -> Self {
        self.flags = self.flags.with(QueryFlags::NO_CURSOR_TIMEOUT, enabled);
        self
    }

    /// Client-side read timeout. `Duration::ZERO` disables it.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = (!timeout.is_zero()).then_some(timeout);
        self
    }

    /// Client-side read timeout in milliseconds. Zero or negative disables it.
    pub fn timeout_ms(mut self, millis: i64) -> Self {
        self.timeout = u64::try_from(millis)
            .ok()
            .filter(|ms| *ms > 0)
            .map(Duration::from_millis);
        self
    }

    pub(crate) fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout.filter(|t| !t.is_zero());
        self
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn filter(&self) -> &Document {
        &self.filter
    }

    pub fn get_limit(&self) -> i32 {
        self.limit
    }

    pub fn get_skip(&self) -> i32 {
        self.skip
    }

    pub fn get_batch_size(&self) -> i32 {
        self.batch_size
    }

    pub fn flags(&self) -> QueryFlags {
        self.flags
    }

    pub fn get_timeout(&self) -> Option<Duration> {
        self.timeout
    }

    /// Database part of the namespace.
    pub fn database(&self) -> &str {
        self.namespace
            .split_once('.')
            .map_or(self.namespace.as_str(), |(db, _)| db)
    }

    /// Whether this query targets the command pseudo-collection.
    pub fn is_command(&self) -> bool {
        self.namespace.ends_with(".$cmd")
    }

    /// The single-batch flavour requested with a negative limit.
    pub fn is_single_batch(&self) -> bool {
        self.limit < 0
    }

    /// numberToReturn for the opening OP_QUERY.
    pub fn number_to_return(&self) -> i32 {
        match (self.limit, self.batch_size) {
            (limit, _) if limit < 0 => limit,
            (limit, batch) if limit > 0 && batch > 0 => limit.min(batch),
            (limit, _) if limit > 0 => limit,
            (_, batch) => batch,
        }
    }

    /// numberToReturn for an OP_GET_MORE after `received` documents.
    pub fn get_more_number_to_return(&self, received: i64) -> i32 {
        if self.limit > 0 {
            let remaining = (i64::from(self.limit) - received).max(0) as i32;
            if self.batch_size > 0 {
                remaining.min(self.batch_size)
            } else {
                remaining
            }
        } else {
            self.batch_size
        }
    }

    /// Query document as sent on the wire.
    ///
    /// Wrapped in `$query` when sort, hint or other modifiers are present.
    pub fn query_document(&self) -> Document {
        if self.sort.is_none() && self.hint.is_none() && self.options.is_empty() {
            return self.filter.clone();
        }

        let mut query = Document::new();
        query.insert("$query", self.filter.clone());
        if let Some(sort) = &self.sort {
            query.insert("$orderby", sort.clone());
        }
        if let Some(hint) = &self.hint {
            query.insert("$hint", hint.clone());
        }
        for (key, value) in &self.options {
            query.insert(key.clone(), value.clone());
        }
        query
    }

    /// The opening OP_QUERY for this descriptor.
    pub fn to_query_message(&self) -> QueryMessage {
        QueryMessage {
            flags: self.flags,
            namespace: self.namespace.clone(),
            number_to_skip: self.skip,
            number_to_return: self.number_to_return(),
            query: self.query_document(),
            return_fields: self.fields.clone(),
        }
    }

    /// Serialisable summary used by cursor info and logs.
    pub fn summary(&self) -> QuerySummary {
        QuerySummary {
            namespace: self.namespace.clone(),
            limit: self.limit,
            skip: self.skip,
            batch_size: self.batch_size,
            timeout_ms: self.timeout.map(|t| t.as_millis() as u64),
        }
    }
}

/// Flat view of a descriptor's scalar settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QuerySummary {
    pub namespace: String,
    pub limit: i32,
    pub skip: i32,
    pub batch_size: i32,
    pub timeout_ms: Option<u64>,
}

/// A descriptor bound to a connection, ready to produce a cursor.
#[derive(Debug, Clone)]
pub struct Query {
    connection: Arc<Connection>,
    descriptor: QueryDescriptor,
}

impl Query {
    pub fn new(connection: Arc<Connection>, descriptor: QueryDescriptor) -> Self {
        Self {
            connection,
            descriptor,
        }
    }

    fn map(mut self, f: impl FnOnce(QueryDescriptor) -> QueryDescriptor) -> Self {
        self.descriptor = f(self.descriptor);
        self
    }

    pub fn limit(self, n: i32) -> Self {
        self.map(|d| d.limit(n))
    }

    pub fn skip(self, n: i32) -> Self {
        self.map(|d| d.skip(n))
    }

    pub fn batch_size(self, n: i32) -> Self {
        self.map(|d| d.batch_size(n))
    }

    pub fn fields(self, fields: Document) -> Self {
        self.map(|d| d.fields(fields))
    }

    pub fn sort(self, sort: Document) -> Self {
        self.map(|d| d.sort(sort))
    }

    pub fn hint(self, hint: Document) -> Self {
        self.map(|d| d.hint(hint))
    }

    pub fn add_option(self, key: impl Into<String>, value: impl Into<Bson>) -> Self {
        self.map(|d| d.add_option(key, value))
    }

    pub fn slave_okay(self, enabled: bool) -> Self {
        self.map(|d| d.slave_okay(enabled))
    }

    pub fn no_cursor_timeout(self, enabled: bool) -> Self {
        self.map(|d| d.no_cursor_timeout(enabled))
    }

    pub fn timeout(self, timeout: Duration) -> Self {
        self.map(|d| d.timeout(timeout))
    }

    pub fn timeout_ms(self, millis: i64) -> Self {
        self.map(|d| d.timeout_ms(millis))
    }

    pub fn descriptor(&self) -> &QueryDescriptor {
        &self.descriptor
    }

    /// Create an unopened cursor. Nothing is sent until the first read.
    pub fn cursor(self) -> Cursor {
        Cursor::new(self.connection, self.descriptor)
    }
}
