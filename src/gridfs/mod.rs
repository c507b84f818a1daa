//! GridFS file storage
//!
//! A file is one metadata document in `<prefix>.files` (`_id`, `length`,
//! `chunkSize`, `uploadDate`, `md5` and an optional `filename`) plus its
//! contents split into `<prefix>.chunks` documents of the form
//! `{ files_id, n, data }`, with `n` counting from zero.
//!
//! ```rust,no_run
//! use bson::doc;
//! use mongowire::{Client, ClientOptions};
//!
//! # async fn demo() -> mongowire::Result<()> {
//! let client = Client::connect("localhost:27017", ClientOptions::default()).await?;
//! let fs = client.database("test").gridfs();
//!
//! fs.store_bytes(b"hello", doc! { "filename": "hello.txt" }).await?;
//! if let Some(file) = fs.find_one_by_filename("hello.txt").await? {
//!     assert_eq!(file.get_bytes().await?, b"hello");
//! }
//! # Ok(())
//! # }
//! ```

use std::path::Path;

use bson::oid::ObjectId;
use bson::spec::BinarySubtype;
use bson::{Binary, Bson, DateTime, Document, doc};
use tracing::{debug, info, warn};

use crate::client::{Collection, Database, as_i64};
use crate::cursor::{Cursor, CursorInfo};
use crate::error::{ExecutionError, MongoWireError, Result};
use crate::query::Query;
use crate::wire::{InsertMessage, QueryFlags, Request};

/// Chunk size used when the file document does not set a positive `chunkSize`.
pub const DEFAULT_CHUNK_SIZE: usize = 256 * 1024;

const CHUNK_INDEX_NAME: &str = "files_id_1_n_1";

/// A GridFS bucket: the `<prefix>.files` and `<prefix>.chunks` collections.
#[derive(Debug, Clone)]
pub struct GridFs {
    database: Database,
    prefix: String,
    files: Collection,
    chunks: Collection,
}

impl GridFs {
    /// Open the bucket named `prefix` in `database`.
    ///
    /// # Returns
    /// * `Err(InvalidParameters)` - Empty prefix
    pub fn new(database: &Database, prefix: &str) -> Result<Self> {
        if prefix.is_empty() {
            return Err(ExecutionError::InvalidParameters(
                "GridFS prefix must not be empty".to_string(),
            )
            .into());
        }
        Ok(Self::with_prefix(database, prefix))
    }

    pub(crate) fn with_prefix(database: &Database, prefix: &str) -> Self {
        Self {
            database: database.clone(),
            prefix: prefix.to_string(),
            files: database.collection(&format!("{prefix}.files")),
            chunks: database.collection(&format!("{prefix}.chunks")),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn files(&self) -> &Collection {
        &self.files
    }

    pub fn chunks(&self) -> &Collection {
        &self.chunks
    }

    /// Store `bytes` as a new file.
    ///
    /// Fields of `extra` are copied into the file document. `_id`,
    /// `chunkSize`, `length` and `uploadDate` are filled in only when
    /// missing. A store that fails part way removes the chunks it wrote.
    ///
    /// # Returns
    /// * `Result<Bson>` - `_id` of the stored file
    pub async fn store_bytes(&self, bytes: &[u8], extra: Document) -> Result<Bson> {
        let pending = PendingFile::new(extra, None, bytes.len());
        self.store(pending, bytes).await
    }

    /// Store the contents of a local file. `filename` defaults to the path.
    pub async fn store_file(&self, path: impl AsRef<Path>, extra: Document) -> Result<Bson> {
        let path = path.as_ref();
        let bytes = tokio::fs::read(path).await?;
        let filename = path.to_string_lossy();
        let pending = PendingFile::new(extra, Some(&filename), bytes.len());
        self.store(pending, &bytes).await
    }

    /// [`store_file`](Self::store_file) without extra fields.
    pub async fn put(&self, path: impl AsRef<Path>) -> Result<Bson> {
        self.store_file(path, Document::new()).await
    }

    /// Files matching `filter`, in server order.
    pub fn find(&self, filter: Document) -> GridFsCursor {
        GridFsCursor::new(self.clone(), self.files.find(filter))
    }

    pub async fn find_one(&self, filter: Document) -> Result<Option<GridFile>> {
        let mut cursor = GridFsCursor::new(self.clone(), self.files.find(filter).limit(-1));
        cursor.get_next().await
    }

    pub async fn find_one_by_filename(&self, filename: &str) -> Result<Option<GridFile>> {
        self.find_one(doc! { "filename": filename }).await
    }

    /// The file whose `_id` is `id`.
    pub async fn get(&self, id: impl Into<Bson>) -> Result<Option<GridFile>> {
        self.find_one(doc! { "_id": id.into() }).await
    }

    /// Remove every file matching `filter` together with its chunks.
    ///
    /// # Returns
    /// * `Result<Option<i64>>` - Number of file documents removed when writes are acknowledged
    pub async fn remove(&self, filter: Document) -> Result<Option<i64>> {
        self.ensure_chunk_index().await?;

        let mut cursor = self
            .files
            .find(filter.clone())
            .fields(doc! { "_id": 1 })
            .cursor();
        while let Some(file) = cursor.get_next().await? {
            if let Some(id) = file.get("_id") {
                self.chunks.remove(doc! { "files_id": id.clone() }).await?;
            }
        }
        self.files.remove(filter).await
    }

    /// Remove the file whose `_id` is `id`.
    pub async fn delete(&self, id: impl Into<Bson>) -> Result<Option<i64>> {
        self.remove(doc! { "_id": id.into() }).await
    }

    /// Drop both collections.
    ///
    /// # Returns
    /// * `Result<bool>` - `false` when the files collection did not exist
    pub async fn drop(&self) -> Result<bool> {
        self.chunks.drop().await?;
        self.files.drop().await
    }

    async fn store(&self, pending: PendingFile, bytes: &[u8]) -> Result<Bson> {
        self.ensure_chunk_index().await?;

        // Chunks are keyed by files_id alone; an id in use must not receive new chunks.
        if self.files.find_one(doc! { "_id": pending.id.clone() }).await?.is_some() {
            return Err(ExecutionError::GridFs(format!(
                "a file with _id {} already exists",
                pending.id
            ))
            .into());
        }

        let id = pending.id.clone();
        match self.write_file(pending, bytes).await {
            Ok(chunks) => {
                info!(
                    "Stored {} byte(s) as {} chunk(s) in {} for file {}",
                    bytes.len(),
                    chunks,
                    self.prefix,
                    id
                );
                Ok(id)
            }
            Err(err) => {
                warn!("Could not store file {}: {}", id, err);
                self.discard(&id).await;
                Err(err)
            }
        }
    }

    async fn write_file(&self, mut pending: PendingFile, bytes: &[u8]) -> Result<usize> {
        let mut written = 0;
        for (n, data) in bytes.chunks(pending.chunk_size).enumerate() {
            let chunk = chunk_document(&pending.id, n, data)?;
            self.chunks.insert_documents(vec![chunk], true).await?;
            written += 1;
        }

        self.add_md5(&mut pending).await;
        self.files
            .insert_documents(vec![pending.document], true)
            .await?;
        Ok(written)
    }

    /// Ask the server for the digest of the stored chunks. Servers without
    /// `filemd5` leave the field unset.
    async fn add_md5(&self, pending: &mut PendingFile) {
        if pending.document.contains_key("md5") {
            return;
        }
        let command = doc! { "filemd5": pending.id.clone(), "root": self.prefix.as_str() };
        match self.database.command(command).await {
            Ok(reply) => {
                if let Some(md5) = reply.get("md5") {
                    pending.document.insert("md5", md5.clone());
                }
            }
            Err(err) => debug!("filemd5 failed for {}: {}", pending.id, err),
        }
    }

    /// Best-effort removal of a partially stored file.
    async fn discard(&self, id: &Bson) {
        if let Err(err) = self.chunks.remove(doc! { "files_id": id.clone() }).await {
            warn!("Could not remove chunks of failed file {}: {}", id, err);
        }
        if let Err(err) = self.files.remove(doc! { "_id": id.clone() }).await {
            warn!("Could not remove failed file {}: {}", id, err);
        }
    }

    /// Unique `{ files_id: 1, n: 1 }` index on the chunks, created through
    /// `system.indexes` without waiting for an answer.
    async fn ensure_chunk_index(&self) -> Result<()> {
        let index = doc! {
            "ns": self.chunks.namespace(),
            "key": { "files_id": 1, "n": 1 },
            "name": CHUNK_INDEX_NAME,
            "unique": true,
        };
        self.database
            .write_with(
                Request::Insert(InsertMessage {
                    continue_on_error: false,
                    namespace: format!("{}.system.indexes", self.database.name()),
                    documents: vec![index],
                }),
                false,
            )
            .await?;
        Ok(())
    }
}

/// A file document waiting for its chunks to be written.
struct PendingFile {
    document: Document,
    id: Bson,
    chunk_size: usize,
}

impl PendingFile {
    fn new(extra: Document, filename: Option<&str>, length: usize) -> Self {
        let mut document = extra;

        let id = match document.get("_id") {
            Some(id) => id.clone(),
            None => {
                let id = Bson::ObjectId(ObjectId::new());
                document.insert("_id", id.clone());
                id
            }
        };
        if let Some(name) = filename
            && !document.contains_key("filename")
        {
            document.insert("filename", name);
        }
        if !document.contains_key("uploadDate") {
            document.insert("uploadDate", DateTime::now());
        }
        if !document.contains_key("length") {
            document.insert("length", length as i64);
        }

        let chunk_size = match document.get("chunkSize").and_then(as_i64) {
            Some(size) if size > 0 => size as usize,
            _ => {
                document.insert("chunkSize", DEFAULT_CHUNK_SIZE as i32);
                DEFAULT_CHUNK_SIZE
            }
        };

        Self {
            document,
            id,
            chunk_size,
        }
    }
}

fn chunk_document(id: &Bson, n: usize, data: &[u8]) -> Result<Document> {
    let n = i32::try_from(n).map_err(|_| {
        MongoWireError::from(ExecutionError::GridFs(format!(
            "file needs more than {} chunks",
            i32::MAX
        )))
    })?;
    Ok(doc! {
        "files_id": id.clone(),
        "n": n,
        "data": Binary {
            subtype: BinarySubtype::Generic,
            bytes: data.to_vec(),
        },
    })
}

/// Append one chunk's payload, checking it is chunk number `expected`.
fn append_chunk(bytes: &mut Vec<u8>, chunk: &Document, expected: i64) -> Result<()> {
    let n = chunk.get("n").and_then(as_i64);
    if n != Some(expected) {
        let found = n.map_or_else(|| "none".to_string(), |n| n.to_string());
        return Err(
            ExecutionError::GridFs(format!("expected chunk {expected}, found {found}")).into(),
        );
    }

    match chunk.get("data") {
        Some(Bson::Binary(binary)) => bytes.extend_from_slice(&binary.bytes),
        // written by drivers that predate binary chunks
        Some(Bson::String(raw)) => bytes.extend_from_slice(raw.as_bytes()),
        _ => {
            return Err(
                ExecutionError::GridFs(format!("chunk {expected} carries no data")).into(),
            );
        }
    }
    Ok(())
}

/// A stored file: its metadata document plus access to its chunks.
#[derive(Debug, Clone)]
pub struct GridFile {
    gridfs: GridFs,
    document: Document,
    slave_okay: bool,
}

impl GridFile {
    pub fn document(&self) -> &Document {
        &self.document
    }

    pub fn id(&self) -> Option<&Bson> {
        self.document.get("_id")
    }

    pub fn filename(&self) -> Option<&str> {
        self.document.get_str("filename").ok()
    }

    /// Declared `length` in bytes.
    pub fn size(&self) -> Option<i64> {
        self.document.get("length").and_then(as_i64)
    }

    pub fn md5(&self) -> Option<&str> {
        self.document.get_str("md5").ok()
    }

    /// Read every chunk in `n` order and reassemble the contents.
    ///
    /// # Returns
    /// * `Err(GridFs)` - A chunk is missing or out of place, or the total
    ///   does not match `length`
    pub async fn get_bytes(&self) -> Result<Vec<u8>> {
        let id = self
            .id()
            .cloned()
            .ok_or_else(|| ExecutionError::GridFs("file document has no _id".to_string()))?;
        let length = self
            .size()
            .ok_or_else(|| ExecutionError::GridFs(format!("file {id} has no length")))?;

        let mut cursor = self
            .gridfs
            .chunks
            .find(doc! { "files_id": id.clone() })
            .sort(doc! { "n": 1 })
            .slave_okay(self.slave_okay)
            .cursor();

        let mut bytes = Vec::new();
        let mut expected = 0;
        while let Some(chunk) = cursor.get_next().await? {
            append_chunk(&mut bytes, &chunk, expected)?;
            expected += 1;
        }

        if bytes.len() as i64 != length {
            return Err(ExecutionError::GridFs(format!(
                "file {id} declares {length} bytes but its chunks hold {}",
                bytes.len()
            ))
            .into());
        }
        Ok(bytes)
    }

    /// Write the contents to `path`, or to the stored filename when `None`.
    ///
    /// # Returns
    /// * `Result<u64>` - Bytes written
    pub async fn write(&self, path: Option<&Path>) -> Result<u64> {
        let path = match (path, self.filename()) {
            (Some(path), _) => path.to_path_buf(),
            (None, Some(name)) => Path::new(name).to_path_buf(),
            (None, None) => {
                return Err(ExecutionError::InvalidParameters(
                    "file has no filename; pass a destination path".to_string(),
                )
                .into());
            }
        };

        let bytes = self.get_bytes().await?;
        tokio::fs::write(&path, &bytes).await?;
        debug!("Wrote {} byte(s) to {}", bytes.len(), path.display());
        Ok(bytes.len() as u64)
    }
}

/// Cursor over file documents, yielding [`GridFile`] handles.
#[derive(Debug)]
pub struct GridFsCursor {
    gridfs: GridFs,
    cursor: Cursor,
    slave_okay: bool,
}

impl GridFsCursor {
    /// Wrap a query over the bucket's files collection. Chunk reads of the
    /// returned files inherit its slave-ok flag.
    pub fn new(gridfs: GridFs, query: Query) -> Self {
        let slave_okay = query.descriptor().flags().contains(QueryFlags::SLAVE_OK);
        Self {
            gridfs,
            cursor: query.cursor(),
            slave_okay,
        }
    }

    pub async fn get_next(&mut self) -> Result<Option<GridFile>> {
        let next = self.cursor.get_next().await?;
        Ok(next.map(|document| GridFile {
            gridfs: self.gridfs.clone(),
            document,
            slave_okay: self.slave_okay,
        }))
    }

    pub async fn has_next(&mut self) -> Result<bool> {
        self.cursor.has_next().await
    }

    pub async fn close(&mut self) -> Result<()> {
        self.cursor.close().await
    }

    pub fn info(&self) -> CursorInfo {
        self.cursor.info()
    }
}
