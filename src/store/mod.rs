//! The document-store boundary: [`StoreClient`] and the caches that sit
//! in front of it. See spec §4.1–§4.2.

mod cache;
mod client;

pub use client::StoreClient;

use bson::oid::ObjectId;
use bson::Document;

use crate::error::{Error, Result};

/// One fixed-size slice of a regular file's bytes. See spec §3.
#[derive(Debug, Clone)]
pub struct ChunkDoc {
    pub id: ObjectId,
    pub files_id: ObjectId,
    pub n: i64,
    pub data: Vec<u8>,
}

impl ChunkDoc {
    pub fn from_document(doc: &Document) -> Result<ChunkDoc> {
        let id = doc
            .get_object_id("_id")
            .map_err(|_| Error::Corrupt("chunk missing _id".into()))?;
        let files_id = doc
            .get_object_id("files_id")
            .map_err(|_| Error::Corrupt("chunk missing files_id".into()))?;
        let n = doc.get_i64("n").map_err(|_| Error::Corrupt("chunk missing n".into()))?;
        let data = match doc.get("data") {
            Some(bson::Bson::Binary(bin)) => bin.bytes.clone(),
            _ => return Err(Error::Corrupt("chunk missing data".into())),
        };
        Ok(ChunkDoc { id, files_id, n, data })
    }

    pub fn to_document(&self) -> Document {
        bson::doc! {
            "_id": self.id,
            "files_id": self.files_id,
            "n": self.n,
            "data": bson::Binary {
                subtype: bson::spec::BinarySubtype::Generic,
                bytes: self.data.clone(),
            },
        }
    }
}
