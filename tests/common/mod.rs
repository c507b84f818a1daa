//! In-process mock server speaking the legacy wire protocol over TCP.
//!
//! Supports equality filters, `$orderby`, skip, batching with server
//! cursors, kill cursors, inserts, deletes and a handful of `$cmd` commands. `$eval` and
//! OP_GET_MORE replies can be delayed to exercise client timeouts. Requests
//! on one connection are answered strictly in order, like a real server.

#![allow(dead_code)]

use std::cmp::Ordering as CmpOrdering;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bson::{Bson, Document, doc};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

use mongowire::transport::{StreamTransport, Transport};
use mongowire::wire::{
    DeleteMessage, GetMoreMessage, InsertMessage, QueryMessage, Reply, ReplyFlags, Request,
};
use mongowire::{Client, ClientOptions, Deadline};

const DEFAULT_BATCH: usize = 101;

struct ServerCursor {
    namespace: String,
    remaining: VecDeque<Document>,
}

#[derive(Default)]
struct ServerState {
    collections: HashMap<String, Vec<Document>>,
    cursors: HashMap<i64, ServerCursor>,
    next_cursor_id: i64,
    killed: Vec<i64>,
    get_more_count: usize,
    last_error: Document,
    eval_delay: Duration,
    get_more_delay: Duration,
    rejected_namespaces: HashSet<String>,
}

pub struct MockServer {
    address: String,
    state: Arc<Mutex<ServerState>>,
    disconnect: Arc<AtomicBool>,
    accept_loop: JoinHandle<()>,
}

impl MockServer {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();
        let state = Arc::new(Mutex::new(ServerState {
            next_cursor_id: 1000,
            ..ServerState::default()
        }));
        let disconnect = Arc::new(AtomicBool::new(false));

        let accept_loop = {
            let state = Arc::clone(&state);
            let disconnect = Arc::clone(&disconnect);
            tokio::spawn(async move {
                while let Ok((stream, _)) = listener.accept().await {
                    tokio::spawn(serve(
                        stream,
                        Arc::clone(&state),
                        Arc::clone(&disconnect),
                    ));
                }
            })
        };

        Self {
            address,
            state,
            disconnect,
            accept_loop,
        }
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub async fn client(&self, options: ClientOptions) -> Client {
        Client::connect(&self.address, options).await.unwrap()
    }

    pub fn set_eval_delay(&self, delay: Duration) {
        self.state.lock().unwrap().eval_delay = delay;
    }

    pub fn set_get_more_delay(&self, delay: Duration) {
        self.state.lock().unwrap().get_more_delay = delay;
    }

    /// Fail every later insert into `namespace` with a write error.
    pub fn reject_inserts(&self, namespace: &str) {
        self.state
            .lock()
            .unwrap()
            .rejected_namespaces
            .insert(namespace.to_string());
    }

    /// Close the connection that sends the next request, without replying.
    pub fn disconnect_next(&self) {
        self.disconnect.store(true, Ordering::SeqCst);
    }

    pub fn killed_cursors(&self) -> Vec<i64> {
        self.state.lock().unwrap().killed.clone()
    }

    pub fn open_cursors(&self) -> usize {
        self.state.lock().unwrap().cursors.len()
    }

    pub fn get_more_count(&self) -> usize {
        self.state.lock().unwrap().get_more_count
    }

    pub fn documents(&self, namespace: &str) -> Vec<Document> {
        self.state
            .lock()
            .unwrap()
            .collections
            .get(namespace)
            .cloned()
            .unwrap_or_default()
    }
}

impl Drop for MockServer {
    fn drop(&mut self) {
        self.accept_loop.abort();
    }
}

async fn serve(stream: TcpStream, state: Arc<Mutex<ServerState>>, disconnect: Arc<AtomicBool>) {
    let mut transport = StreamTransport::new(stream, "mock-client");
    let mut next_id = 1;

    while let Ok(frame) = transport.receive(Deadline::never()).await {
        if disconnect.swap(false, Ordering::SeqCst) {
            return;
        }
        let Ok((header, request)) = Request::decode(&frame) else {
            return;
        };

        let (delay, reply) = handle(&state, request);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if let Some(mut reply) = reply {
            reply.response_to = header.request_id;
            next_id += 1;
            let bytes = reply.encode(next_id).unwrap();
            if transport.send(&bytes).await.is_err() {
                return;
            }
        }
    }
}

fn handle(state: &Mutex<ServerState>, request: Request) -> (Duration, Option<Reply>) {
    let mut state = state.lock().unwrap();
    match request {
        Request::Query(query) if query.namespace.ends_with(".$cmd") => {
            let delay = if query.query.contains_key("$eval") {
                state.eval_delay
            } else {
                Duration::ZERO
            };
            (delay, Some(single(run_command(&mut state, &query))))
        }
        Request::Query(query) => (Duration::ZERO, Some(run_query(&mut state, query))),
        Request::GetMore(get_more) => {
            state.get_more_count += 1;
            (state.get_more_delay, Some(run_get_more(&mut state, get_more)))
        }
        Request::KillCursors(kill) => {
            for id in kill.cursor_ids {
                state.cursors.remove(&id);
                state.killed.push(id);
            }
            (Duration::ZERO, None)
        }
        Request::Insert(insert) => {
            run_insert(&mut state, insert);
            (Duration::ZERO, None)
        }
        Request::Delete(delete) => {
            run_delete(&mut state, delete);
            (Duration::ZERO, None)
        }
    }
}

fn single(document: Document) -> Reply {
    Reply {
        response_to: 0,
        flags: ReplyFlags::default(),
        cursor_id: 0,
        starting_from: 0,
        documents: vec![document],
    }
}

fn matches(filter: &Document, document: &Document) -> bool {
    filter
        .iter()
        .all(|(key, value)| document.get(key) == Some(value))
}

/// Order documents by the `$orderby` keys; only numbers and strings compare.
fn compare_by(order: &Document, a: &Document, b: &Document) -> CmpOrdering {
    for (key, direction) in order {
        let ordering = match (a.get(key), b.get(key)) {
            (Some(Bson::String(x)), Some(Bson::String(y))) => x.cmp(y),
            (Some(x), Some(y)) => match (number(x), number(y)) {
                (Some(x), Some(y)) => x.partial_cmp(&y).unwrap_or(CmpOrdering::Equal),
                _ => CmpOrdering::Equal,
            },
            _ => CmpOrdering::Equal,
        };
        let ordering = if number(direction).is_some_and(|d| d < 0.0) {
            ordering.reverse()
        } else {
            ordering
        };
        if ordering != CmpOrdering::Equal {
            return ordering;
        }
    }
    CmpOrdering::Equal
}

fn number(value: &Bson) -> Option<f64> {
    match value {
        Bson::Int32(n) => Some(f64::from(*n)),
        Bson::Int64(n) => Some(*n as f64),
        Bson::Double(n) => Some(*n),
        _ => None,
    }
}

fn run_command(state: &mut ServerState, query: &QueryMessage) -> Document {
    let command = match query.query.get("$query") {
        Some(Bson::Document(inner)) => inner.clone(),
        _ => query.query.clone(),
    };
    let db = query.namespace.trim_end_matches(".$cmd");
    let name = command.keys().next().cloned().unwrap_or_default();

    match name.as_str() {
        "$eval" => {
            let retval = match command.get("args") {
                Some(Bson::Array(args)) => args.first().cloned().unwrap_or(Bson::Null),
                _ => Bson::Null,
            };
            doc! { "retval": retval, "ok": 1.0 }
        }
        "getlasterror" => {
            let mut status = state.last_error.clone();
            status.insert("ok", 1.0);
            status
        }
        "ping" => doc! { "ok": 1.0 },
        "filemd5" => {
            // Stand-in digest: the chunk count and total size, not a real MD5.
            let id = command.get("filemd5").cloned().unwrap_or(Bson::Null);
            let root = command.get_str("root").unwrap_or("fs");
            let (count, size) = state
                .collections
                .get(&format!("{db}.{root}.chunks"))
                .map_or((0, 0), |chunks| {
                    chunks
                        .iter()
                        .filter(|c| c.get("files_id") == Some(&id))
                        .fold((0, 0), |(count, size), c| {
                            let len = c.get_binary_generic("data").map_or(0, Vec::len);
                            (count + 1, size + len)
                        })
                });
            doc! { "md5": format!("{count:016x}{size:016x}"), "numChunks": count, "ok": 1.0 }
        }
        "count" => {
            let ns = format!("{db}.{}", command.get_str("count").unwrap_or_default());
            let filter = command.get_document("query").cloned().unwrap_or_default();
            let n = state
                .collections
                .get(&ns)
                .map_or(0, |docs| docs.iter().filter(|d| matches(&filter, d)).count());
            doc! { "n": n as f64, "ok": 1.0 }
        }
        "drop" => {
            let ns = format!("{db}.{}", command.get_str("drop").unwrap_or_default());
            if state.collections.remove(&ns).is_some() {
                doc! { "ns": ns, "ok": 1.0 }
            } else {
                doc! { "ok": 0.0, "errmsg": "ns not found", "code": 26 }
            }
        }
        other => doc! { "ok": 0.0, "errmsg": format!("no such cmd: {other}"), "code": 59 },
    }
}

fn run_query(state: &mut ServerState, query: QueryMessage) -> Reply {
    let (filter, order) = match query.query.get("$query") {
        Some(Bson::Document(inner)) => (
            inner.clone(),
            query.query.get_document("$orderby").cloned().unwrap_or_default(),
        ),
        _ => (query.query.clone(), Document::new()),
    };
    if filter.contains_key("$fail") {
        return Reply {
            flags: ReplyFlags::QUERY_FAILURE,
            ..single(doc! { "$err": "forced failure", "code": 2 })
        };
    }

    let mut found: Vec<Document> = state
        .collections
        .get(&query.namespace)
        .map(|docs| docs.iter().filter(|d| matches(&filter, d)).cloned().collect())
        .unwrap_or_default();
    found.sort_by(|a, b| compare_by(&order, a, b));
    let results: VecDeque<Document> = found
        .into_iter()
        .skip(query.number_to_skip.max(0) as usize)
        .collect();

    let n = query.number_to_return;
    let single_batch = n < 0 || n == 1;
    let batch = match n {
        0 => DEFAULT_BATCH,
        n => n.unsigned_abs() as usize,
    };
    batch_reply(state, &query.namespace, results, batch, single_batch, None)
}

fn run_get_more(state: &mut ServerState, get_more: GetMoreMessage) -> Reply {
    let Some(cursor) = state.cursors.remove(&get_more.cursor_id) else {
        return Reply {
            flags: ReplyFlags::CURSOR_NOT_FOUND,
            documents: vec![],
            ..single(Document::new())
        };
    };
    let batch = match get_more.number_to_return {
        0 => DEFAULT_BATCH,
        n => n.unsigned_abs() as usize,
    };
    batch_reply(
        state,
        &cursor.namespace,
        cursor.remaining,
        batch,
        false,
        Some(get_more.cursor_id),
    )
}

/// Reply with the next `batch` results, parking the rest under a cursor id.
fn batch_reply(
    state: &mut ServerState,
    namespace: &str,
    mut results: VecDeque<Document>,
    batch: usize,
    single_batch: bool,
    existing_id: Option<i64>,
) -> Reply {
    let take = batch.min(results.len());
    let documents: Vec<Document> = results.drain(..take).collect();

    let cursor_id = if results.is_empty() || single_batch {
        0
    } else {
        let id = existing_id.unwrap_or_else(|| {
            state.next_cursor_id += 1;
            state.next_cursor_id
        });
        state.cursors.insert(
            id,
            ServerCursor {
                namespace: namespace.to_string(),
                remaining: results,
            },
        );
        id
    };

    Reply {
        response_to: 0,
        flags: ReplyFlags::default(),
        cursor_id,
        starting_from: 0,
        documents,
    }
}

fn run_insert(state: &mut ServerState, insert: InsertMessage) {
    if state.rejected_namespaces.contains(&insert.namespace) {
        state.last_error = doc! { "err": "insert rejected", "code": 10003, "n": 0 };
        return;
    }
    let docs = state.collections.entry(insert.namespace).or_default();
    let mut ids: HashSet<String> = docs
        .iter()
        .filter_map(|d| d.get("_id").map(|id| id.to_string()))
        .collect();
    for document in insert.documents {
        if let Some(id) = document.get("_id")
            && !ids.insert(id.to_string())
        {
            state.last_error = doc! { "err": "E11000 duplicate key error", "code": 11000, "n": 0 };
            return;
        }
        docs.push(document);
    }
    state.last_error = doc! { "err": Bson::Null, "n": 0 };
}

fn run_delete(state: &mut ServerState, delete: DeleteMessage) {
    let docs = state.collections.entry(delete.namespace).or_default();
    let before = docs.len();
    if delete.single_remove {
        if let Some(pos) = docs.iter().position(|d| matches(&delete.selector, d)) {
            docs.remove(pos);
        }
    } else {
        docs.retain(|d| !matches(&delete.selector, d));
    }
    let removed = (before - docs.len()) as i32;
    state.last_error = doc! { "err": Bson::Null, "n": removed };
}
