//! Thin, retrying wrapper around the document-store driver. See spec
//! §4.1 and §6 (collection naming, required index).

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use bson::oid::ObjectId;
use bson::{doc, Bson, Document};
use mongodb::options::{FindOneAndUpdateOptions, IndexOptions, ReturnDocument};
use mongodb::sync::{Client, Collection, Database};
use mongodb::IndexModel;

use crate::config::Config;
use crate::error::{Error, Result};
use crate::inode::{Inode, InodeType, LockRecord};
use crate::store::cache::{ChunkRangeCache, MetadataCache};
use crate::store::ChunkDoc;

/// How long a single failed attempt sleeps before retrying, per spec §4.1.
const RETRY_BACKOFF: Duration = Duration::from_millis(500);

/// `StoreClient` wraps the MongoDB driver handle, the two collections
/// (inodes, chunks), and the read-through caches. It is the only module
/// that imports `mongodb` directly, per the narrow-interface boundary of
/// spec §1.
pub struct StoreClient {
    client: Arc<parking_lot::Mutex<Client>>,
    uri: String,
    database: String,
    files_coll: String,
    chunks_coll: String,
    chunk_size: u32,
    access_attempt_budget: Duration,
    metadata_cache: MetadataCache,
    chunk_cache: ChunkRangeCache,
    /// Invoked once the retry budget is exhausted, before the store error
    /// is returned. In production this detaches the mount and terminates
    /// the process (spec §4.1's "mount-abort routine"); tests supply a
    /// no-op so the call returns instead of aborting.
    abort_hook: Arc<dyn Fn() + Send + Sync>,
}

fn mongo_uri(hosts: &[String]) -> String {
    format!("mongodb://{}", hosts.join(","))
}

impl StoreClient {
    /// Connect and ensure the required index exists. See spec §6.
    pub fn connect(config: &Config, abort_hook: Arc<dyn Fn() + Send + Sync>) -> Result<StoreClient> {
        let uri = mongo_uri(&config.mongo_hosts);
        let client = Client::with_uri_str(&uri)?;

        let store = StoreClient {
            client: Arc::new(parking_lot::Mutex::new(client)),
            uri,
            database: config.mongo_database.clone(),
            files_coll: format!("{}files.files", config.mongo_prefix),
            chunks_coll: format!("{}files.chunks", config.mongo_prefix),
            chunk_size: config.chunk_size,
            access_attempt_budget: config.mongo_access_attempt,
            metadata_cache: MetadataCache::new(config.cache_timeout, config.cache_max_elements),
            chunk_cache: ChunkRangeCache::new(config.data_cache_timeout, config.data_cache_max_elements),
            abort_hook,
        };
        store.create_indexes()?;
        Ok(store)
    }

    pub fn chunk_size(&self) -> u32 {
        self.chunk_size
    }

    fn db(&self) -> Database {
        self.client.lock().database(&self.database)
    }

    fn files(&self) -> Collection<Document> {
        self.db().collection(&self.files_coll)
    }

    fn chunks(&self) -> Collection<Document> {
        self.db().collection(&self.chunks_coll)
    }

    fn create_indexes(&self) -> Result<()> {
        self.with_retry(|| {
            let model = IndexModel::builder()
                .keys(doc! {"parent_id": 1, "filename": 1})
                .options(IndexOptions::builder().unique(true).build())
                .build();
            self.files().create_index(model).run()
        })?;
        Ok(())
    }

    /// Reconnect after a transport failure. The sync driver pools
    /// connections internally; we still rebuild the top-level handle so a
    /// poisoned pool cannot wedge every subsequent call, and reset both
    /// caches per spec §4.2 ("on reconnection, both caches are reset").
    fn reconnect(&self) {
        if let Ok(fresh) = Client::with_uri_str(&self.uri) {
            *self.client.lock() = fresh;
        }
        self.metadata_cache.reset();
        self.chunk_cache.reset();
    }

    /// Retry a store operation on transport failure, per spec §4.1: sleep
    /// 500ms, reconnect, retry, accumulating elapsed time across attempts;
    /// once the budget is exhausted, invoke the abort hook. Non-transport
    /// errors are surfaced immediately, unretried.
    fn with_retry<T>(&self, mut f: impl FnMut() -> mongodb::error::Result<T>) -> Result<T> {
        let start = Instant::now();
        loop {
            match f() {
                Ok(v) => return Ok(v),
                Err(e) if is_transport_error(&e) => {
                    if start.elapsed() >= self.access_attempt_budget {
                        (self.abort_hook)();
                        return Err(Error::StoreUnreachable(e.to_string()));
                    }
                    thread::sleep(RETRY_BACKOFF);
                    self.reconnect();
                }
                Err(e) => return Err(Error::Store(e)),
            }
        }
    }

    // -- inode operations -------------------------------------------------

    /// Read-through `find_one` on `(parent_id, filename[, type])`. See
    /// spec §4.2: a field mismatch between the cached document and the
    /// query is checked in memory rather than reloaded.
    pub fn find_inode(
        &self,
        parent_id: Option<ObjectId>,
        filename: &str,
        expect_type: Option<InodeType>,
    ) -> Result<Option<Inode>> {
        let cache_key = parent_id.map(|p| p.to_hex()).unwrap_or_default();
        if let Some(cached) = self.metadata_cache.get(&cache_key, filename) {
            if let Some(expected) = expect_type {
                if cached.kind != expected {
                    return Ok(None);
                }
            }
            return Ok(Some(cached));
        }

        let mut query = doc! {"filename": filename};
        query.insert("parent_id", parent_id.map(Bson::ObjectId).unwrap_or(Bson::Null));
        if let Some(t) = expect_type {
            query.insert("type", type_tag(t));
        }

        let doc = self.with_retry(|| self.files().find_one(query.clone()).run())?;
        match doc {
            Some(d) => {
                let inode = Inode::from_document(&d)?;
                self.metadata_cache.put(&cache_key, filename, inode.clone());
                Ok(Some(inode))
            }
            None => Ok(None),
        }
    }

    pub fn find_inode_by_id(&self, id: ObjectId) -> Result<Option<Inode>> {
        let doc = self.with_retry(|| self.files().find_one(doc! {"_id": id}).run())?;
        doc.map(|d| Inode::from_document(&d)).transpose()
    }

    pub fn find_children(&self, parent_id: ObjectId) -> Result<Vec<Inode>> {
        let cursor = self.with_retry(|| self.files().find(doc! {"parent_id": parent_id}).run())?;
        let mut out = Vec::new();
        for doc in cursor {
            out.push(Inode::from_document(&doc?)?);
        }
        Ok(out)
    }

    pub fn count_children(&self, parent_id: ObjectId) -> Result<u64> {
        self.with_retry(|| self.files().count_documents(doc! {"parent_id": parent_id}).run())
    }

    pub fn insert_inode(&self, inode: &Inode) -> Result<()> {
        let document = inode_to_document(inode);
        self.with_retry(|| self.files().insert_one(document.clone()).run())?;
        self.metadata_cache.reset();
        self.chunk_cache.reset();
        Ok(())
    }

    /// `add_nlink_directory`: increment/decrement a directory's `nlink` by
    /// an atomic `$inc`, returning the updated document. See spec §4.4/§9
    /// (the preserved rename direction quirk lives in the caller, not
    /// here).
    pub fn add_nlink(&self, id: ObjectId, delta: i32) -> Result<Inode> {
        let options = FindOneAndUpdateOptions::builder()
            .return_document(ReturnDocument::After)
            .build();
        let updated = self.with_retry(|| {
            self.files()
                .find_one_and_update(doc! {"_id": id}, doc! {"$inc": {"metadata.nlink": delta}})
                .with_options(options.clone())
                .run()
        })?;
        let doc = updated.ok_or(Error::NotFound)?;
        let inode = Inode::from_document(&doc)?;
        self.metadata_cache.reset();
        self.chunk_cache.reset();
        Ok(inode)
    }

    pub fn save_basic(&self, inode: &Inode) -> Result<Inode> {
        let options = FindOneAndUpdateOptions::builder()
            .return_document(ReturnDocument::After)
            .build();
        let update = doc! {"$set": {
            "metadata": metadata_to_document(inode),
            "attrs": attrs_to_document(inode),
            "host": &inode.host,
            "uname": &inode.uname,
            "gname": &inode.gname,
        }};
        let updated = self.with_retry(|| {
            self.files()
                .find_one_and_update(doc! {"_id": inode.id}, update.clone())
                .with_options(options.clone())
                .run()
        })?;
        let doc = updated.ok_or(Error::NotFound)?;
        let result = Inode::from_document(&doc)?;
        let cache_key = inode.parent_id.map(|p| p.to_hex()).unwrap_or_default();
        self.metadata_cache.put(&cache_key, &inode.filename, result.clone());
        self.chunk_cache.reset();
        Ok(result)
    }

    pub fn rename_inode(
        &self,
        id: ObjectId,
        new_parent: Option<ObjectId>,
        new_filename: &str,
    ) -> Result<Inode> {
        let options = FindOneAndUpdateOptions::builder()
            .return_document(ReturnDocument::After)
            .build();
        let mut set = Document::new();
        set.insert("parent_id", new_parent.map(Bson::ObjectId).unwrap_or(Bson::Null));
        set.insert("filename", new_filename);
        let updated = self.with_retry(|| {
            self.files()
                .find_one_and_update(doc! {"_id": id}, doc! {"$set": set.clone()})
                .with_options(options.clone())
                .run()
        })?;
        let doc = updated.ok_or(Error::NotFound)?;
        let inode = Inode::from_document(&doc)?;
        self.metadata_cache.reset();
        self.chunk_cache.reset();
        Ok(inode)
    }

    /// Insert the inode document via the large-object handle factory. Our
    /// document shape carries fields (lock, attrs, parent_id, ...) that do
    /// not fit the driver's built-in GridFS bucket metadata, so this
    /// simply inserts into the `files.files` collection directly; the
    /// behavioral contract (the store owns chunk allocation/deletion for
    /// the file) is preserved by always pairing it with
    /// `delete_inode_and_chunks`. See DESIGN.md.
    pub fn largeobj_new(&self, inode: &Inode) -> Result<()> {
        self.insert_inode(inode)
    }

    pub fn largeobj_delete(&self, id: ObjectId) -> Result<()> {
        self.delete_inode_and_chunks(id)
    }

    pub fn delete_inode_and_chunks(&self, id: ObjectId) -> Result<()> {
        self.with_retry(|| self.chunks().delete_many(doc! {"files_id": id}).run())?;
        self.with_retry(|| self.files().delete_many(doc! {"_id": id}).run())?;
        self.metadata_cache.reset();
        self.chunk_cache.reset();
        Ok(())
    }

    // -- chunk operations ---------------------------------------------------

    pub fn find_chunks_range(&self, files_id: ObjectId, lo: i64, hi: i64) -> Result<Vec<ChunkDoc>> {
        let key = files_id.to_hex();
        if let Some(cached) = self.chunk_cache.get(&key, lo, hi) {
            return Ok(cached);
        }
        let cursor = self.with_retry(|| {
            self.chunks()
                .find(doc! {"files_id": files_id, "n": {"$gte": lo, "$lte": hi}})
                .sort(doc! {"n": 1})
                .run()
        })?;
        let mut out = Vec::new();
        for doc in cursor {
            out.push(ChunkDoc::from_document(&doc?)?);
        }
        self.chunk_cache.put(&key, lo, hi, out.clone());
        Ok(out)
    }

    pub fn find_chunks_from(&self, files_id: ObjectId, n_min: i64) -> Result<Vec<ChunkDoc>> {
        let cursor = self.with_retry(|| {
            self.chunks()
                .find(doc! {"files_id": files_id, "n": {"$gte": n_min}})
                .sort(doc! {"n": 1})
                .run()
        })?;
        let mut out = Vec::new();
        for doc in cursor {
            out.push(ChunkDoc::from_document(&doc?)?);
        }
        Ok(out)
    }

    pub fn update_chunk_data(&self, id: ObjectId, data: Vec<u8>) -> Result<()> {
        self.with_retry(|| {
            self.chunks()
                .find_one_and_update(doc! {"_id": id}, doc! {"$set": {"data": Bson::Binary(bson::Binary{subtype: bson::spec::BinarySubtype::Generic, bytes: data.clone()})}})
                .run()
        })?;
        self.chunk_cache.reset();
        Ok(())
    }

    pub fn insert_chunks(&self, chunks: &[ChunkDoc]) -> Result<()> {
        if chunks.is_empty() {
            return Ok(());
        }
        let docs: Vec<Document> = chunks.iter().map(ChunkDoc::to_document).collect();
        self.with_retry(|| self.chunks().insert_many(docs.clone()).run())?;
        self.chunk_cache.reset();
        Ok(())
    }

    pub fn delete_chunks_from(&self, files_id: ObjectId, n_min: i64) -> Result<()> {
        self.with_retry(|| self.chunks().delete_many(doc! {"files_id": files_id, "n": {"$gte": n_min}}).run())?;
        self.chunk_cache.reset();
        Ok(())
    }

    pub fn update_inode_length(&self, id: ObjectId, length: u64, now: i64) -> Result<Inode> {
        let options = FindOneAndUpdateOptions::builder()
            .return_document(ReturnDocument::After)
            .build();
        let blocks = crate::inode::size_to_blocks(length);
        let update = doc! {"$set": {
            "length": length as i64,
            "metadata.size": length as i64,
            "metadata.blocks": blocks as i64,
            "metadata.mtime": now,
            "metadata.atime": now,
            "metadata.ctime": now,
        }};
        let updated = self.with_retry(|| {
            self.files()
                .find_one_and_update(doc! {"_id": id}, update.clone())
                .with_options(options.clone())
                .run()
        })?;
        let doc = updated.ok_or(Error::NotFound)?;
        let inode = Inode::from_document(&doc)?;
        self.metadata_cache.reset();
        self.chunk_cache.reset();
        Ok(inode)
    }

    // -- lock operations (compare-and-set primitive for LockManager) -------

    /// Conditional update of the lock vector: succeeds only if the
    /// document's current `lock_version` still equals `expected_version`,
    /// per the optimistic-concurrency scheme of spec §4.6.
    pub fn cas_lock(
        &self,
        id: ObjectId,
        expected_version: i64,
        new_lock: Option<&[LockRecord]>,
        new_version: i64,
    ) -> Result<Option<Inode>> {
        let update = match new_lock {
            Some(records) => doc! {"$set": {
                "lock": records.iter().map(lock_record_to_document).collect::<Vec<_>>(),
                "lock_version": new_version,
            }},
            None => doc! {"$unset": {"lock": ""}, "$set": {"lock_version": new_version}},
        };
        let options = FindOneAndUpdateOptions::builder()
            .return_document(ReturnDocument::After)
            .build();
        let updated = self.with_retry(|| {
            self.files()
                .find_one_and_update(doc! {"_id": id, "lock_version": expected_version}, update.clone())
                .with_options(options.clone())
                .run()
        })?;
        match updated {
            Some(d) => {
                let inode = Inode::from_document(&d)?;
                self.metadata_cache.reset();
                Ok(Some(inode))
            }
            None => Ok(None),
        }
    }

    /// Development-mode startup wipe. See spec §6.
    pub fn drop_all(&self) -> Result<()> {
        self.with_retry(|| self.files().drop().run())?;
        self.with_retry(|| self.chunks().drop().run())?;
        self.metadata_cache.reset();
        self.chunk_cache.reset();
        Ok(())
    }
}

fn is_transport_error(err: &mongodb::error::Error) -> bool {
    use mongodb::error::ErrorKind;
    matches!(
        err.kind.as_ref(),
        ErrorKind::Io(..) | ErrorKind::ConnectionPoolCleared { .. } | ErrorKind::ServerSelection { .. }
    )
}

fn type_tag(kind: InodeType) -> &'static str {
    match kind {
        InodeType::Regular => "regular",
        InodeType::Directory => "directory",
        InodeType::Symlink => "symlink",
    }
}

fn metadata_to_document(inode: &Inode) -> Document {
    doc! {
        "size": inode.metadata.size as i64,
        "ctime": inode.metadata.ctime,
        "mtime": inode.metadata.mtime,
        "atime": inode.metadata.atime,
        "uid": inode.metadata.uid as i32,
        "gid": inode.metadata.gid as i32,
        "mode": inode.metadata.mode as i32,
        "nlink": inode.metadata.nlink as i32,
        "blocks": inode.metadata.blocks as i64,
    }
}

fn attrs_to_document(inode: &Inode) -> Document {
    let mut d = Document::new();
    for (k, v) in &inode.attrs {
        d.insert(
            k,
            Bson::Binary(bson::Binary {
                subtype: bson::spec::BinarySubtype::Generic,
                bytes: v.clone(),
            }),
        );
    }
    d
}

fn lock_record_to_document(rec: &LockRecord) -> Document {
    let kind = match rec.kind {
        crate::inode::LockKind::Shared => "shared",
        crate::inode::LockKind::Exclusive => "exclusive",
        crate::inode::LockKind::UnlockIntent => "unlock-intent",
    };
    doc! {
        "creation_time": rec.creation_time,
        "id": &rec.id,
        "type": kind,
        "hostname": &rec.hostname,
    }
}

fn inode_to_document(inode: &Inode) -> Document {
    let mut d = doc! {
        "_id": inode.id,
        "parent_id": inode.parent_id.map(Bson::ObjectId).unwrap_or(Bson::Null),
        "filename": &inode.filename,
        "type": type_tag(inode.kind),
        "chunk_size": inode.chunk_size as i32,
        "length": inode.length as i64,
        "metadata": metadata_to_document(inode),
        "attrs": attrs_to_document(inode),
        "lock_version": inode.lock_version,
        "host": &inode.host,
        "uname": &inode.uname,
        "gname": &inode.gname,
    };
    if !inode.lock.is_empty() {
        d.insert(
            "lock",
            inode.lock.iter().map(lock_record_to_document).collect::<Vec<_>>(),
        );
    }
    if let Some(target) = &inode.target {
        d.insert("target", target);
    }
    d
}

