//! GridFS storage against a mock server: chunking, reassembly, removal and rollback.

mod common;

use bson::spec::BinarySubtype;
use bson::{Binary, Bson, Document, doc};
use mongowire::error::ExecutionError;
use mongowire::{ClientOptions, GridFsCursor, MongoWireError};
use tokio_test::{assert_err, assert_ok};

use common::MockServer;

fn payload(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

fn chunk(files_id: i32, n: i32, data: &[u8]) -> Document {
    doc! {
        "files_id": files_id,
        "n": n,
        "data": Binary { subtype: BinarySubtype::Generic, bytes: data.to_vec() },
    }
}

#[tokio::test]
async fn test_store_bytes_and_read_back() {
    let server = MockServer::start().await;
    let client = server.client(ClientOptions::default()).await;
    let fs = client.database("test").gridfs();

    let data = payload(4500);
    let id = assert_ok!(
        fs.store_bytes(&data, doc! { "filename": "blob.bin", "chunkSize": 1000 })
            .await
    );
    assert!(matches!(id, Bson::ObjectId(_)));

    let chunks = server.documents("test.fs.chunks");
    assert_eq!(chunks.len(), 5);
    assert!(chunks.iter().all(|c| c.get("files_id") == Some(&id)));

    let file = assert_ok!(fs.find_one_by_filename("blob.bin").await).unwrap();
    assert_eq!(file.id(), Some(&id));
    assert_eq!(file.filename(), Some("blob.bin"));
    assert_eq!(file.size(), Some(4500));
    assert_eq!(file.md5(), Some("00000000000000050000000000001194"));
    assert_eq!(assert_ok!(file.get_bytes().await), data);

    let indexes = server.documents("test.system.indexes");
    assert_eq!(indexes[0].get_str("ns").unwrap(), "test.fs.chunks");
    assert_eq!(indexes[0].get_str("name").unwrap(), "files_id_1_n_1");
}

#[tokio::test]
async fn test_chunks_reassembled_in_n_order() {
    let server = MockServer::start().await;
    let client = server.client(ClientOptions::default()).await;
    let db = client.database("test");
    let fs = db.gridfs();

    assert_ok!(
        fs.chunks()
            .insert_many(vec![chunk(1, 2, b"ef"), chunk(1, 0, b"ab"), chunk(1, 1, b"cd")])
            .await
    );
    assert_ok!(
        fs.files()
            .insert(doc! { "_id": 1, "filename": "rev", "length": 6_i64, "chunkSize": 2 })
            .await
    );

    let file = assert_ok!(fs.get(1).await).unwrap();
    assert_eq!(assert_ok!(file.get_bytes().await), b"abcdef");
}

#[tokio::test]
async fn test_damaged_files_are_reported() {
    let server = MockServer::start().await;
    let client = server.client(ClientOptions::default()).await;
    let fs = client.database("test").gridfs();

    // chunk 1 is missing
    assert_ok!(
        fs.chunks()
            .insert_many(vec![chunk(1, 0, b"ab"), chunk(1, 2, b"ef")])
            .await
    );
    assert_ok!(fs.files().insert(doc! { "_id": 1, "length": 6_i64 }).await);
    // chunks are complete but shorter than declared
    assert_ok!(fs.chunks().insert(chunk(2, 0, b"ab")).await);
    assert_ok!(fs.files().insert(doc! { "_id": 2, "length": 6_i64 }).await);

    for id in [1, 2] {
        let file = assert_ok!(fs.get(id).await).unwrap();
        match assert_err!(file.get_bytes().await) {
            MongoWireError::Execution(ExecutionError::GridFs(_)) => {}
            other => panic!("unexpected error for file {id}: {other}"),
        }
    }
}

#[tokio::test]
async fn test_remove_takes_chunks_along() {
    let server = MockServer::start().await;
    let client = server.client(ClientOptions::default()).await;
    let fs = client.database("test").gridfs();

    assert_ok!(fs.store_bytes(&payload(30), doc! { "filename": "a", "chunkSize": 10 }).await);
    let b = assert_ok!(fs.store_bytes(&payload(25), doc! { "filename": "b", "chunkSize": 10 }).await);
    assert_eq!(server.documents("test.fs.chunks").len(), 6);

    assert_eq!(assert_ok!(fs.remove(doc! { "filename": "a" }).await), Some(1));
    assert!(assert_ok!(fs.find_one_by_filename("a").await).is_none());
    let left = server.documents("test.fs.chunks");
    assert_eq!(left.len(), 3);
    assert!(left.iter().all(|c| c.get("files_id") == Some(&b)));

    assert_eq!(assert_ok!(fs.delete(b).await), Some(1));
    assert!(server.documents("test.fs.files").is_empty());
    assert!(server.documents("test.fs.chunks").is_empty());
}

#[tokio::test]
async fn test_cursor_over_files_interleaves_chunk_reads() {
    let server = MockServer::start().await;
    let client = server.client(ClientOptions::default()).await;
    let fs = client.database("test").gridfs();

    for i in (0..5).rev() {
        let name = format!("f{i}");
        assert_ok!(
            fs.store_bytes(&payload(i * 7 + 3), doc! { "filename": name, "chunkSize": 4 })
                .await
        );
    }

    let query = fs.files().find(doc! {}).sort(doc! { "filename": 1 }).batch_size(2);
    let mut cursor = GridFsCursor::new(fs.clone(), query);
    let mut names = Vec::new();
    while let Some(file) = assert_ok!(cursor.get_next().await) {
        let i = names.len();
        assert_eq!(assert_ok!(file.get_bytes().await), payload(i * 7 + 3));
        names.push(file.filename().unwrap().to_string());
    }

    assert_eq!(names, vec!["f0", "f1", "f2", "f3", "f4"]);
    assert!(server.get_more_count() >= 2);
    assert!(!assert_ok!(cursor.has_next().await));
}

#[tokio::test]
async fn test_failed_store_removes_written_chunks() {
    let server = MockServer::start().await;
    let client = server.client(ClientOptions::default()).await;
    let fs = client.database("test").gridfs();
    server.reject_inserts("test.fs.files");

    let err = assert_err!(
        fs.store_bytes(&payload(50), doc! { "filename": "lost", "chunkSize": 10 })
            .await
    );
    assert!(matches!(
        err,
        MongoWireError::Execution(ExecutionError::WriteFailed(_))
    ));
    assert!(server.documents("test.fs.chunks").is_empty());
    assert!(server.documents("test.fs.files").is_empty());
}

#[tokio::test]
async fn test_duplicate_id_leaves_existing_file_intact() {
    let server = MockServer::start().await;
    let client = server.client(ClientOptions::default()).await;
    let fs = client.database("test").gridfs();

    assert_ok!(fs.store_bytes(b"original", doc! { "_id": 5, "chunkSize": 3 }).await);
    match assert_err!(fs.store_bytes(b"replacement", doc! { "_id": 5 }).await) {
        MongoWireError::Execution(ExecutionError::GridFs(msg)) => {
            assert!(msg.contains("already exists"));
        }
        other => panic!("unexpected error: {other}"),
    }

    let file = assert_ok!(fs.get(5).await).unwrap();
    assert_eq!(assert_ok!(file.get_bytes().await), b"original");
}

#[tokio::test]
async fn test_store_file_and_write_back() {
    let server = MockServer::start().await;
    let client = server.client(ClientOptions::default()).await;
    let fs = client.database("test").gridfs();

    let dir = std::env::temp_dir().join(format!("mongowire-gridfs-{}", bson::oid::ObjectId::new()));
    std::fs::create_dir_all(&dir).unwrap();
    let source = dir.join("source.bin");
    let target = dir.join("target.bin");
    let data = payload(700_000);
    std::fs::write(&source, &data).unwrap();

    let id = assert_ok!(fs.put(&source).await);
    let file = assert_ok!(fs.get(id).await).unwrap();
    assert_eq!(file.filename(), Some(source.to_string_lossy().as_ref()));
    assert_eq!(server.documents("test.fs.chunks").len(), 3);

    assert_eq!(assert_ok!(file.write(Some(target.as_path())).await), 700_000);
    assert_eq!(std::fs::read(&target).unwrap(), data);

    std::fs::remove_dir_all(&dir).unwrap();
}

#[tokio::test]
async fn test_empty_file_and_drop() {
    let server = MockServer::start().await;
    let client = server.client(ClientOptions::default()).await;
    let fs = client.database("test").gridfs();

    let id = assert_ok!(fs.store_bytes(b"", doc! { "filename": "empty" }).await);
    assert!(server.documents("test.fs.chunks").is_empty());
    let file = assert_ok!(fs.get(id).await).unwrap();
    assert_eq!(file.size(), Some(0));
    assert!(assert_ok!(file.get_bytes().await).is_empty());

    assert!(assert_ok!(fs.drop().await));
    assert!(server.documents("test.fs.files").is_empty());
    assert!(!assert_ok!(fs.drop().await));
}
