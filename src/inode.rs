//! In-memory representation of one filesystem object, and conversions to
//! and from the document shape stored by [`crate::store::StoreClient`].

use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

use bson::oid::ObjectId;
use bson::{Bson, Document};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::store::StoreClient;
use crate::user::UserInfo;

/// Discriminates the three filesystem object kinds. Collapses the
/// source's File/Directory/SymbolicLink class hierarchy into one tagged
/// struct, per the redesign guidance in spec §9.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InodeType {
    Regular,
    Directory,
    Symlink,
}

impl InodeType {
    pub fn to_fuse(self) -> fuser::FileType {
        match self {
            InodeType::Regular => fuser::FileType::RegularFile,
            InodeType::Directory => fuser::FileType::Directory,
            InodeType::Symlink => fuser::FileType::Symlink,
        }
    }

    fn mode_bits(self) -> u32 {
        match self {
            InodeType::Regular => libc::S_IFREG,
            InodeType::Directory => libc::S_IFDIR,
            InodeType::Symlink => libc::S_IFLNK,
        }
    }
}

/// Advisory lock kind. See spec §4.6.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LockKind {
    Shared,
    Exclusive,
    UnlockIntent,
}

/// One entry in an inode's lock vector.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockRecord {
    pub creation_time: i64,
    pub id: String,
    #[serde(rename = "type")]
    pub kind: LockKind,
    pub hostname: String,
}

impl LockRecord {
    /// Build the `"<absolute_path>;<pid>;<hostname>"` id used to identify
    /// a lock holder. See spec §3.
    pub fn make_id(path: &str, pid: u32, hostname: &str) -> String {
        format!("{path};{pid};{hostname}")
    }
}

/// POSIX-style attributes, mirrored onto [`fuser::FileAttr`] at the engine
/// boundary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Metadata {
    pub size: u64,
    pub ctime: i64,
    pub mtime: i64,
    pub atime: i64,
    pub uid: u32,
    pub gid: u32,
    pub mode: u32,
    pub nlink: u32,
    pub blocks: u64,
}

pub fn now_unix() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}

/// `metadata.blocks = ceil(length / (65536 * 8))`, per spec §3.
pub fn size_to_blocks(length: u64) -> u64 {
    const BLOCK_UNIT: u64 = 65_536 * 8;
    length.div_ceil(BLOCK_UNIT)
}

/// One inode document, fully materialised.
#[derive(Debug, Clone)]
pub struct Inode {
    pub id: ObjectId,
    pub parent_id: Option<ObjectId>,
    pub filename: String,
    pub kind: InodeType,
    pub chunk_size: u32,
    pub length: u64,
    pub metadata: Metadata,
    pub attrs: HashMap<String, Vec<u8>>,
    pub lock: Vec<LockRecord>,
    pub lock_version: i64,
    pub target: Option<String>,
    pub host: String,
    pub uname: String,
    pub gname: String,
}

/// Access bits requested of [`Inode::has_access`].
pub mod access {
    pub const READ: u32 = 0o4;
    pub const WRITE: u32 = 0o2;
    pub const EXEC: u32 = 0o1;
}

impl Inode {
    /// Decode a raw BSON document fetched from the `files` collection.
    pub fn from_document(doc: &Document) -> Result<Inode> {
        let id = doc
            .get_object_id("_id")
            .map_err(|_| Error::Corrupt("missing _id".into()))?;
        let parent_id = match doc.get("parent_id") {
            Some(Bson::ObjectId(oid)) => Some(*oid),
            _ => None,
        };
        let filename = doc
            .get_str("filename")
            .map_err(|_| Error::Corrupt("missing filename".into()))?
            .to_string();
        let kind = match doc.get_str("type").unwrap_or("") {
            "regular" => InodeType::Regular,
            "directory" => InodeType::Directory,
            "symlink" => InodeType::Symlink,
            other => return Err(Error::Corrupt(format!("unknown type {other:?}"))),
        };
        let chunk_size = doc.get_i32("chunk_size").unwrap_or(0).max(0) as u32;
        let length = doc.get_i64("length").unwrap_or(0).max(0) as u64;

        let meta_doc = doc
            .get_document("metadata")
            .map_err(|_| Error::Corrupt("missing metadata".into()))?;
        let metadata = Metadata {
            size: meta_doc.get_i64("size").unwrap_or(0).max(0) as u64,
            ctime: meta_doc.get_i64("ctime").unwrap_or(0),
            mtime: meta_doc.get_i64("mtime").unwrap_or(0),
            atime: meta_doc.get_i64("atime").unwrap_or(0),
            uid: meta_doc.get_i32("uid").unwrap_or(0).max(0) as u32,
            gid: meta_doc.get_i32("gid").unwrap_or(0).max(0) as u32,
            mode: meta_doc.get_i32("mode").unwrap_or(0).max(0) as u32,
            nlink: meta_doc.get_i32("nlink").unwrap_or(1).max(0) as u32,
            blocks: meta_doc.get_i64("blocks").unwrap_or(0).max(0) as u64,
        };

        let mut attrs = HashMap::new();
        if let Ok(attrs_doc) = doc.get_document("attrs") {
            for (k, v) in attrs_doc {
                if let Bson::Binary(bin) = v {
                    attrs.insert(k.clone(), bin.bytes.clone());
                }
            }
        }

        let mut lock = Vec::new();
        if let Ok(lock_arr) = doc.get_array("lock") {
            for item in lock_arr {
                if let Bson::Document(rec) = item {
                    let kind = match rec.get_str("type").unwrap_or("") {
                        "shared" => LockKind::Shared,
                        "exclusive" => LockKind::Exclusive,
                        "unlock-intent" => LockKind::UnlockIntent,
                        _ => continue,
                    };
                    lock.push(LockRecord {
                        creation_time: rec.get_i64("creation_time").unwrap_or(0),
                        id: rec.get_str("id").unwrap_or("").to_string(),
                        kind,
                        hostname: rec.get_str("hostname").unwrap_or("").to_string(),
                    });
                }
            }
        }
        let lock_version = doc.get_i64("lock_version").unwrap_or(0);
        let target = doc.get_str("target").ok().map(|s| s.to_string());
        let host = doc.get_str("host").unwrap_or("").to_string();
        let uname = doc.get_str("uname").unwrap_or("").to_string();
        let gname = doc.get_str("gname").unwrap_or("").to_string();

        Ok(Inode {
            id,
            parent_id,
            filename,
            kind,
            chunk_size,
            length,
            metadata,
            attrs,
            lock,
            lock_version,
            target,
            host,
            uname,
            gname,
        })
    }

    pub fn is_file(&self) -> bool {
        self.kind == InodeType::Regular
    }
    pub fn is_dir(&self) -> bool {
        self.kind == InodeType::Directory
    }
    pub fn is_link(&self) -> bool {
        self.kind == InodeType::Symlink
    }

    /// Permission check per spec §4.4: root bypasses everything; otherwise
    /// OR together the owner/group/other bit classes that apply and test
    /// against `rights`.
    pub fn has_access(&self, rights: u32, user: &UserInfo) -> bool {
        if user.uid == 0 {
            return true;
        }
        let mut effective = (self.metadata.mode) & 0o7;
        if self.metadata.uid == user.uid {
            effective |= (self.metadata.mode >> 6) & 0o7;
        }
        if user.gids.contains(&self.metadata.gid) {
            effective |= (self.metadata.mode >> 3) & 0o7;
        }
        (effective & rights) != 0
    }

    /// Translate into the shape `fuser` expects in a `getattr`/`lookup`
    /// reply.
    pub fn to_fuse_attr(&self, ino: u64) -> fuser::FileAttr {
        let secs_to_time = |s: i64| {
            if s >= 0 {
                UNIX_EPOCH + std::time::Duration::from_secs(s as u64)
            } else {
                UNIX_EPOCH
            }
        };
        fuser::FileAttr {
            ino,
            size: self.metadata.size,
            blocks: self.metadata.blocks,
            atime: secs_to_time(self.metadata.atime),
            mtime: secs_to_time(self.metadata.mtime),
            ctime: secs_to_time(self.metadata.ctime),
            crtime: secs_to_time(self.metadata.ctime),
            kind: self.kind.to_fuse(),
            perm: (self.metadata.mode & 0o7777) as u16,
            nlink: self.metadata.nlink,
            uid: self.metadata.uid,
            gid: self.metadata.gid,
            rdev: 0,
            blksize: 65536,
            flags: 0,
        }
    }

    /// Validate and insert a new inode document, bumping the parent's
    /// `nlink` per the open question recorded in DESIGN.md. See spec §4.4.
    #[allow(clippy::too_many_arguments)]
    pub fn create(
        store: &StoreClient,
        parent_id: Option<ObjectId>,
        parent_dir: Option<&Inode>,
        filename: &str,
        mode: u32,
        kind: InodeType,
        target: Option<String>,
        user: &UserInfo,
        host: &str,
    ) -> Result<Inode> {
        if let Some(parent) = parent_dir {
            if !parent.has_access(access::WRITE, user) {
                return Err(Error::PermissionDenied);
            }
        }

        let now = now_unix();
        let gid = match parent_dir {
            // setgid bit on the parent: new file inherits the parent's gid.
            Some(p) if p.metadata.mode & 0o2000 != 0 => p.metadata.gid,
            _ => user.gid,
        };

        let (nlink, size, blocks) = match kind {
            InodeType::Regular => (1u32, 0u64, 0u64),
            InodeType::Directory => (2u32, 0u64, 0u64),
            InodeType::Symlink => (1u32, filename.len() as u64, 1u64),
        };

        let metadata = Metadata {
            size,
            ctime: now,
            mtime: now,
            atime: now,
            uid: user.uid,
            gid,
            mode: kind.mode_bits() | (mode & 0o7777),
            nlink,
            blocks,
        };

        let inode = Inode {
            id: ObjectId::new(),
            parent_id,
            filename: filename.to_string(),
            kind,
            chunk_size: store.chunk_size(),
            length: size,
            metadata,
            attrs: HashMap::new(),
            lock: Vec::new(),
            lock_version: 0,
            target,
            host: host.to_string(),
            uname: user.uname.clone(),
            gname: user.gnames.first().cloned().unwrap_or_default(),
        };

        store.insert_inode(&inode)?;

        if let Some(pid) = parent_id {
            store.add_nlink(pid, 1)?;
        }

        Ok(inode)
    }

    /// Persist the mutable `(metadata, attrs, host, uname, gname)` tuple.
    /// See spec §4.4.
    pub fn basic_save(&self, store: &StoreClient) -> Result<Inode> {
        store.save_basic(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::user::UserInfo;

    fn user(uid: u32, gid: u32) -> UserInfo {
        UserInfo {
            uid,
            gid,
            pid: 1,
            uname: "alice".into(),
            gids: vec![gid],
            gnames: vec!["alice".into()],
        }
    }

    fn inode_with_mode(mode: u32, uid: u32, gid: u32) -> Inode {
        Inode {
            id: ObjectId::new(),
            parent_id: None,
            filename: "f".into(),
            kind: InodeType::Regular,
            chunk_size: 1024,
            length: 0,
            metadata: Metadata {
                size: 0,
                ctime: 0,
                mtime: 0,
                atime: 0,
                uid,
                gid,
                mode,
                nlink: 1,
                blocks: 0,
            },
            attrs: HashMap::new(),
            lock: Vec::new(),
            lock_version: 0,
            target: None,
            host: "h".into(),
            uname: "root".into(),
            gname: "root".into(),
        }
    }

    #[test]
    fn root_always_has_access() {
        let inode = inode_with_mode(0o000, 5, 5);
        assert!(inode.has_access(access::READ | access::WRITE, &user(0, 0)));
    }

    #[test]
    fn owner_bits_apply_to_owner_only() {
        let inode = inode_with_mode(0o600, 5, 5);
        assert!(inode.has_access(access::READ | access::WRITE, &user(5, 9)));
        assert!(!inode.has_access(access::READ, &user(6, 9)));
    }

    #[test]
    fn group_bits_apply_when_gid_matches() {
        let inode = inode_with_mode(0o040, 5, 7);
        let mut u = user(9, 1);
        u.gids = vec![7];
        assert!(inode.has_access(access::READ, &u));
    }

    #[test]
    fn other_bits_always_considered() {
        let inode = inode_with_mode(0o004, 5, 7);
        assert!(inode.has_access(access::READ, &user(9, 9)));
        assert!(!inode.has_access(access::WRITE, &user(9, 9)));
    }

    #[test]
    fn size_to_blocks_rounds_up() {
        assert_eq!(size_to_blocks(0), 0);
        assert_eq!(size_to_blocks(1), 1);
        assert_eq!(size_to_blocks(524288), 1);
        assert_eq!(size_to_blocks(524289), 2);
    }
}
