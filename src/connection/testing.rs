//! Scripted in-memory peer for unit tests.

use bson::Document;
use tokio::io::{DuplexStream, duplex};

use super::{Connection, ConnectionOptions, Deadline};
use crate::transport::{StreamTransport, Transport};
use crate::wire::{Reply, ReplyFlags, Request};

pub(crate) type Peer = StreamTransport<DuplexStream>;

/// A connection whose other end is driven by the test.
pub(crate) fn pair() -> (Connection, Peer) {
    let (client, server) = duplex(256 * 1024);
    let connection = Connection::new(
        Box::new(StreamTransport::new(client, "client")),
        ConnectionOptions::default(),
    );
    (connection, StreamTransport::new(server, "server"))
}

pub(crate) async fn read_request(peer: &mut Peer) -> (i32, Request) {
    let frame = peer.receive(Deadline::never()).await.unwrap();
    let (header, request) = Request::decode(&frame).unwrap();
    (header.request_id, request)
}

pub(crate) async fn answer(peer: &mut Peer, response_to: i32, cursor_id: i64, docs: Vec<Document>) {
    answer_with_flags(peer, response_to, ReplyFlags::default(), cursor_id, docs).await;
}

pub(crate) async fn answer_with_flags(
    peer: &mut Peer,
    response_to: i32,
    flags: ReplyFlags,
    cursor_id: i64,
    docs: Vec<Document>,
) {
    let reply = Reply {
        response_to,
        flags,
        cursor_id,
        starting_from: 0,
        documents: docs,
    };
    peer.send(&reply.encode(1000 + response_to).unwrap())
        .await
        .unwrap();
}
