//! [`FilesystemEngine`]: the `fuser::Filesystem` implementation that ties
//! path resolution, locking, chunk I/O and the store together. See spec
//! §4.8.
//!
//! FUSE addresses objects by a process-local 64-bit `ino`; the store
//! addresses them by `ObjectId`. [`InoTable`] is the (small, in-memory,
//! never persisted) mapping between the two, assigned lazily on first
//! `lookup`/`readdir` sighting, with `1` reserved for the root.

use std::collections::HashMap;
use std::ffi::OsStr;
use std::path::Path;
use std::time::{Duration, SystemTime};

use bson::oid::ObjectId;
use fuser::{
    FileAttr, FileType, Filesystem, KernelConfig, ReplyAttr, ReplyCreate, ReplyData,
    ReplyDirectory, ReplyEmpty, ReplyEntry, ReplyLock, ReplyOpen, ReplyStatfs, ReplyWrite,
    ReplyXattr, Request, TimeOrNow,
};
use parking_lot::Mutex;

use crate::chunkio::{ChunkIO, WriteBuffer};
use crate::config::Config;
use crate::error::{to_errno_legacy, Error, Result};
use crate::inode::{access, now_unix, Inode, InodeType, LockKind};
use crate::lock::{LockManager, LockRequest};
use crate::path::PathResolver;
use crate::store::StoreClient;
use crate::user::{UserInfo, UserResolver};

const ATTR_TTL: Duration = Duration::from_secs(1);
const ROOT_INO: u64 = 1;

struct InoTable {
    forward: HashMap<u64, ObjectId>,
    backward: HashMap<ObjectId, u64>,
    next: u64,
}

impl InoTable {
    fn new(root: ObjectId) -> Self {
        let mut forward = HashMap::new();
        let mut backward = HashMap::new();
        forward.insert(ROOT_INO, root);
        backward.insert(root, ROOT_INO);
        InoTable {
            forward,
            backward,
            next: ROOT_INO + 1,
        }
    }

    fn ino_for(&mut self, oid: ObjectId) -> u64 {
        if let Some(ino) = self.backward.get(&oid) {
            return *ino;
        }
        let ino = self.next;
        self.next += 1;
        self.forward.insert(ino, oid);
        self.backward.insert(oid, ino);
        ino
    }

    fn oid_for(&self, ino: u64) -> Option<ObjectId> {
        self.forward.get(&ino).copied()
    }
}

pub struct FilesystemEngine {
    store: StoreClient,
    users: UserResolver,
    write_buffer: WriteBuffer,
    inodes: Mutex<InoTable>,
    hostname: String,
    lock_timeout: Duration,
    lock_access_attempt: Duration,
    legacy_lock_errno: bool,
}

impl FilesystemEngine {
    /// Ensure the root inode exists (creating it with `default_root_mode`
    /// if absent, or rewriting its mode if `force_root_mode` is set), then
    /// build the engine around it. See spec §3 "Lifecycles".
    pub fn new(store: StoreClient, config: &Config) -> Result<FilesystemEngine> {
        let root = match store.find_inode(None, "", Some(InodeType::Directory))? {
            Some(mut root) if config.force_root_mode => {
                root.metadata.mode = libc::S_IFDIR | (config.default_root_mode & 0o7777);
                root.basic_save(&store)?
            }
            Some(root) => root,
            None => {
                let now = now_unix();
                let root = Inode {
                    id: ObjectId::new(),
                    parent_id: None,
                    filename: String::new(),
                    kind: InodeType::Directory,
                    chunk_size: store.chunk_size(),
                    length: 0,
                    metadata: crate::inode::Metadata {
                        size: 0,
                        ctime: now,
                        mtime: now,
                        atime: now,
                        uid: 0,
                        gid: 0,
                        mode: libc::S_IFDIR | (config.default_root_mode & 0o7777),
                        nlink: 2,
                        blocks: 0,
                    },
                    attrs: HashMap::new(),
                    lock: Vec::new(),
                    lock_version: 0,
                    target: None,
                    host: config.host.clone(),
                    uname: String::new(),
                    gname: String::new(),
                };
                store.insert_inode(&root)?;
                root
            }
        };

        Ok(FilesystemEngine {
            inodes: Mutex::new(InoTable::new(root.id)),
            store,
            users: UserResolver::new(),
            write_buffer: WriteBuffer::new(),
            hostname: config.host.clone(),
            lock_timeout: config.lock_timeout,
            lock_access_attempt: config.lock_access_attempt,
            legacy_lock_errno: config.legacy_lock_errno,
        })
    }

    fn errno(&self, err: &Error) -> i32 {
        if self.legacy_lock_errno {
            to_errno_legacy(err)
        } else {
            err.to_errno()
        }
    }

    fn ino_for(&self, oid: ObjectId) -> u64 {
        self.inodes.lock().ino_for(oid)
    }

    fn oid_for(&self, ino: u64) -> Option<ObjectId> {
        self.inodes.lock().oid_for(ino)
    }

    fn resolve_user(&self, req: &Request) -> UserInfo {
        self.users.resolve(req.uid(), req.gid(), req.pid())
    }

    fn lock_manager(&self) -> LockManager<'_> {
        LockManager::new(&self.store, self.hostname.clone(), self.lock_timeout)
    }

    fn path_resolver(&self) -> PathResolver<'_> {
        PathResolver::new(&self.store)
    }

    /// Reconstruct the absolute path of `oid` by walking `parent_id`
    /// chains, needed only where the kernel bridge hands us a bare `ino`
    /// but the lock vector's `id` is keyed on a path string. See spec §3.
    fn path_of(&self, oid: ObjectId) -> Result<String> {
        let mut components = Vec::new();
        let mut current = oid;
        loop {
            let inode = self.store.find_inode_by_id(current)?.ok_or(Error::NotFound)?;
            match inode.parent_id {
                Some(parent) => {
                    components.push(inode.filename.clone());
                    current = parent;
                }
                None => break,
            }
        }
        components.reverse();
        Ok(format!("/{}", components.join("/")))
    }

    fn lookup_child(&self, parent_oid: ObjectId, leaf: &str) -> Result<Inode> {
        self.store.find_inode(Some(parent_oid), leaf, None)?.ok_or(Error::NotFound)
    }

    fn to_attr(&self, inode: &Inode, ino: u64) -> FileAttr {
        let mut attr = inode.to_fuse_attr(ino);
        if inode.host != self.hostname {
            if attr.uid != 0 {
                if let Some(uid) = UserResolver::uid_for_uname(&inode.uname) {
                    attr.uid = uid;
                }
            }
            if attr.gid != 0 {
                if let Some(gid) = UserResolver::gid_for_gname(&inode.gname) {
                    attr.gid = gid;
                }
            }
        }
        attr
    }

    fn create_entry(
        &self,
        req: &Request,
        parent: u64,
        name: &OsStr,
        mode: u32,
        kind: InodeType,
        target: Option<String>,
    ) -> Result<(Inode, u64)> {
        let parent_oid = self.oid_for(parent).ok_or(Error::NotFound)?;
        let leaf = name.to_str().ok_or(Error::NotFound)?;
        let parent_dir = self.store.find_inode_by_id(parent_oid)?.ok_or(Error::NotFound)?;
        if self.store.find_inode(Some(parent_oid), leaf, None)?.is_some() {
            return Err(Error::AlreadyExists);
        }
        let user = self.resolve_user(req);
        let inode = Inode::create(
            &self.store,
            Some(parent_oid),
            Some(&parent_dir),
            leaf,
            mode,
            kind,
            target,
            &user,
            &self.hostname,
        )?;
        let ino = self.ino_for(inode.id);
        Ok((inode, ino))
    }

    fn remove_entry(&self, req: &Request, parent: u64, name: &OsStr, require_dir: bool) -> Result<()> {
        let parent_oid = self.oid_for(parent).ok_or(Error::NotFound)?;
        let leaf = name.to_str().ok_or(Error::NotFound)?;
        let parent_dir = self.store.find_inode_by_id(parent_oid)?.ok_or(Error::NotFound)?;
        let user = self.resolve_user(req);
        if !parent_dir.has_access(access::WRITE, &user) {
            return Err(Error::PermissionDenied);
        }
        let target = self.lookup_child(parent_oid, leaf)?;
        if require_dir && !target.is_dir() {
            return Err(Error::NotFound);
        }
        if !require_dir && target.is_dir() {
            return Err(Error::PermissionDenied);
        }
        if !target.has_access(access::WRITE, &user) {
            return Err(Error::PermissionDenied);
        }
        if target.is_dir() && self.store.count_children(target.id)? > 0 {
            return Err(Error::NotEmpty);
        }
        self.store.largeobj_delete(target.id)?;
        self.store.add_nlink(parent_oid, -1)?;
        Ok(())
    }
}

impl Filesystem for FilesystemEngine {
    fn init(&mut self, _req: &Request<'_>, _config: &mut KernelConfig) -> std::result::Result<(), libc::c_int> {
        Ok(())
    }

    fn lookup(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEntry) {
        let Some(parent_oid) = self.oid_for(parent) else {
            reply.error(libc::ENOENT);
            return;
        };
        let Some(leaf) = name.to_str() else {
            reply.error(libc::ENOENT);
            return;
        };
        match self.store.find_inode(Some(parent_oid), leaf, None) {
            Ok(Some(inode)) => {
                let ino = self.ino_for(inode.id);
                reply.entry(&ATTR_TTL, &self.to_attr(&inode, ino), 0);
            }
            Ok(None) => reply.error(libc::ENOENT),
            Err(e) => reply.error(self.errno(&e)),
        }
    }

    fn getattr(&mut self, _req: &Request<'_>, ino: u64, reply: ReplyAttr) {
        let Some(oid) = self.oid_for(ino) else {
            reply.error(libc::ENOENT);
            return;
        };
        match self.store.find_inode_by_id(oid) {
            Ok(Some(inode)) => reply.attr(&ATTR_TTL, &self.to_attr(&inode, ino)),
            Ok(None) => reply.error(libc::ENOENT),
            Err(e) => reply.error(self.errno(&e)),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn setattr(
        &mut self,
        req: &Request<'_>,
        ino: u64,
        mode: Option<u32>,
        uid: Option<u32>,
        gid: Option<u32>,
        size: Option<u64>,
        atime: Option<TimeOrNow>,
        mtime: Option<TimeOrNow>,
        _ctime: Option<SystemTime>,
        _fh: Option<u64>,
        _crtime: Option<SystemTime>,
        _chgtime: Option<SystemTime>,
        _bkuptime: Option<SystemTime>,
        _flags: Option<u32>,
        reply: ReplyAttr,
    ) {
        let result = (|| -> Result<Inode> {
            let oid = self.oid_for(ino).ok_or(Error::NotFound)?;
            let mut inode = self.store.find_inode_by_id(oid)?.ok_or(Error::NotFound)?;
            let user = self.resolve_user(req);

            if let Some(length) = size {
                if !inode.has_access(access::WRITE, &user) {
                    return Err(Error::PermissionDenied);
                }
                self.write_buffer.flush(&self.store, &inode)?;
                inode = ChunkIO::truncate(&self.store, &inode, length)?;
            }

            let mut dirty = false;
            if let Some(m) = mode {
                if user.uid != 0 && user.uid != inode.metadata.uid {
                    return Err(Error::PermissionDenied);
                }
                inode.metadata.mode = (inode.metadata.mode & !0o7777) | (m & 0o7777);
                dirty = true;
            }
            if uid.is_some() || gid.is_some() {
                if let Some(u) = uid {
                    inode.metadata.uid = u;
                    inode.uname = user.uname.clone();
                }
                if let Some(g) = gid {
                    inode.metadata.gid = g;
                    inode.gname = user.gnames.first().cloned().unwrap_or_default();
                }
                inode.host = self.hostname.clone();
                dirty = true;
            }
            let resolve_time = |t: TimeOrNow| match t {
                TimeOrNow::Now => now_unix(),
                TimeOrNow::SpecificTime(t) => t
                    .duration_since(std::time::UNIX_EPOCH)
                    .map(|d| d.as_secs() as i64)
                    .unwrap_or(0),
            };
            if let Some(a) = atime {
                inode.metadata.atime = resolve_time(a);
                dirty = true;
            }
            if let Some(m) = mtime {
                inode.metadata.mtime = resolve_time(m);
                dirty = true;
            }
            if dirty {
                inode.metadata.ctime = now_unix();
                inode = inode.basic_save(&self.store)?;
            }
            Ok(inode)
        })();

        match result {
            Ok(inode) => reply.attr(&ATTR_TTL, &self.to_attr(&inode, ino)),
            Err(e) => reply.error(self.errno(&e)),
        }
    }

    fn readlink(&mut self, _req: &Request<'_>, ino: u64, reply: ReplyData) {
        let Some(oid) = self.oid_for(ino) else {
            reply.error(libc::ENOENT);
            return;
        };
        match self.store.find_inode_by_id(oid) {
            Ok(Some(inode)) if inode.is_link() => {
                reply.data(inode.target.unwrap_or_default().as_bytes())
            }
            Ok(Some(_)) => reply.error(libc::EINVAL),
            Ok(None) => reply.error(libc::ENOENT),
            Err(e) => reply.error(self.errno(&e)),
        }
    }

    fn mkdir(&mut self, req: &Request<'_>, parent: u64, name: &OsStr, mode: u32, _umask: u32, reply: ReplyEntry) {
        match self.create_entry(req, parent, name, mode, InodeType::Directory, None) {
            Ok((inode, ino)) => reply.entry(&ATTR_TTL, &self.to_attr(&inode, ino), 0),
            Err(e) => reply.error(self.errno(&e)),
        }
    }

    fn unlink(&mut self, req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        match self.remove_entry(req, parent, name, false) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(self.errno(&e)),
        }
    }

    fn rmdir(&mut self, req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        match self.remove_entry(req, parent, name, true) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(self.errno(&e)),
        }
    }

    fn symlink(
        &mut self,
        req: &Request<'_>,
        parent: u64,
        link_name: &OsStr,
        target: &Path,
        reply: ReplyEntry,
    ) {
        let target = target.to_string_lossy().into_owned();
        match self.create_entry(req, parent, link_name, 0o777, InodeType::Symlink, Some(target)) {
            Ok((inode, ino)) => reply.entry(&ATTR_TTL, &self.to_attr(&inode, ino), 0),
            Err(e) => reply.error(self.errno(&e)),
        }
    }

    fn rename(
        &mut self,
        req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        newparent: u64,
        newname: &OsStr,
        _flags: u32,
        reply: ReplyEmpty,
    ) {
        let result = (|| -> Result<()> {
            let parent_oid = self.oid_for(parent).ok_or(Error::NotFound)?;
            let new_parent_oid = self.oid_for(newparent).ok_or(Error::NotFound)?;
            let leaf = name.to_str().ok_or(Error::NotFound)?;
            let new_leaf = newname.to_str().ok_or(Error::NotFound)?;

            let new_parent_dir = self.store.find_inode_by_id(new_parent_oid)?.ok_or(Error::NotFound)?;
            let user = self.resolve_user(req);
            if !new_parent_dir.has_access(access::WRITE, &user) {
                return Err(Error::PermissionDenied);
            }

            let source = self.lookup_child(parent_oid, leaf)?;
            if let Ok(existing) = self.lookup_child(new_parent_oid, new_leaf) {
                if existing.is_dir() && self.store.count_children(existing.id)? > 0 {
                    return Err(Error::NotEmpty);
                }
                self.store.largeobj_delete(existing.id)?;
                self.store.add_nlink(new_parent_oid, -1)?;
            }

            self.store.rename_inode(source.id, Some(new_parent_oid), new_leaf)?;
            self.store.add_nlink(parent_oid, -1)?;
            self.store.add_nlink(new_parent_oid, 1)?;
            Ok(())
        })();

        match result {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(self.errno(&e)),
        }
    }

    fn open(&mut self, _req: &Request<'_>, _ino: u64, _flags: i32, reply: ReplyOpen) {
        reply.opened(0, 0);
    }

    fn read(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        let result = (|| -> Result<Vec<u8>> {
            let oid = self.oid_for(ino).ok_or(Error::NotFound)?;
            let inode = self.store.find_inode_by_id(oid)?.ok_or(Error::NotFound)?;
            ChunkIO::read(&self.store, &inode, offset.max(0) as u64, size)
        })();

        match result {
            Ok(data) => reply.data(&data),
            Err(e) => reply.error(self.errno(&e)),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn write(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        data: &[u8],
        _write_flags: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyWrite,
    ) {
        let result = (|| -> Result<u32> {
            let oid = self.oid_for(ino).ok_or(Error::NotFound)?;
            let inode = self.store.find_inode_by_id(oid)?.ok_or(Error::NotFound)?;
            self.write_buffer.write(&self.store, &inode, data, offset.max(0) as u64)?;
            Ok(data.len() as u32)
        })();

        match result {
            Ok(n) => reply.written(n),
            Err(e) => reply.error(self.errno(&e)),
        }
    }

    fn flush(&mut self, _req: &Request<'_>, ino: u64, _fh: u64, _lock_owner: u64, reply: ReplyEmpty) {
        let result = (|| -> Result<()> {
            let oid = self.oid_for(ino).ok_or(Error::NotFound)?;
            let inode = self.store.find_inode_by_id(oid)?.ok_or(Error::NotFound)?;
            self.write_buffer.flush(&self.store, &inode)?;
            Ok(())
        })();

        match result {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(self.errno(&e)),
        }
    }

    fn release(
        &mut self,
        req: &Request<'_>,
        ino: u64,
        _fh: u64,
        _flags: i32,
        _lock_owner: Option<u64>,
        _flush: bool,
        reply: ReplyEmpty,
    ) {
        let result = (|| -> Result<()> {
            let oid = self.oid_for(ino).ok_or(Error::NotFound)?;
            let inode = self.store.find_inode_by_id(oid)?.ok_or(Error::NotFound)?;
            self.write_buffer.flush(&self.store, &inode)?;
            if !inode.lock.is_empty() {
                let path = self.path_of(oid)?;
                self.lock_manager().release(&path, req.pid(), &inode)?;
            }
            Ok(())
        })();

        match result {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(self.errno(&e)),
        }
    }

    fn opendir(&mut self, _req: &Request<'_>, _ino: u64, _flags: i32, reply: ReplyOpen) {
        reply.opened(0, 0);
    }

    fn readdir(&mut self, req: &Request<'_>, ino: u64, _fh: u64, offset: i64, mut reply: ReplyDirectory) {
        let result = (|| -> Result<Vec<(u64, FileType, String)>> {
            let oid = self.oid_for(ino).ok_or(Error::NotFound)?;
            let inode = self.store.find_inode_by_id(oid)?.ok_or(Error::NotFound)?;
            let user = self.resolve_user(req);
            if !inode.has_access(access::EXEC, &user) {
                return Err(Error::PermissionDenied);
            }
            let parent_ino = inode.parent_id.map(|p| self.ino_for(p)).unwrap_or(ROOT_INO);
            let mut entries = vec![
                (ino, FileType::Directory, ".".to_string()),
                (parent_ino, FileType::Directory, "..".to_string()),
            ];
            for child in self.store.find_children(oid)? {
                let cino = self.ino_for(child.id);
                entries.push((cino, child.kind.to_fuse(), child.filename));
            }
            Ok(entries)
        })();

        match result {
            Ok(entries) => {
                for (i, (eino, kind, name)) in entries.into_iter().enumerate().skip(offset.max(0) as usize) {
                    if reply.add(eino, (i + 1) as i64, kind, name) {
                        break;
                    }
                }
                reply.ok();
            }
            Err(e) => reply.error(self.errno(&e)),
        }
    }

    fn releasedir(&mut self, req: &Request<'_>, ino: u64, _fh: u64, _flags: i32, reply: ReplyEmpty) {
        let result = (|| -> Result<()> {
            let oid = self.oid_for(ino).ok_or(Error::NotFound)?;
            let inode = self.store.find_inode_by_id(oid)?.ok_or(Error::NotFound)?;
            if !inode.lock.is_empty() {
                let path = self.path_of(oid)?;
                self.lock_manager().release(&path, req.pid(), &inode)?;
            }
            Ok(())
        })();

        match result {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(self.errno(&e)),
        }
    }

    fn statfs(&mut self, _req: &Request<'_>, _ino: u64, reply: ReplyStatfs) {
        reply.statfs(0, 0, 0, 0, 0, 65536, 255, 0);
    }

    fn setxattr(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        name: &OsStr,
        value: &[u8],
        _flags: i32,
        _position: u32,
        reply: ReplyEmpty,
    ) {
        let result = (|| -> Result<()> {
            let oid = self.oid_for(ino).ok_or(Error::NotFound)?;
            let mut inode = self.store.find_inode_by_id(oid)?.ok_or(Error::NotFound)?;
            let key = name.to_str().ok_or(Error::NotFound)?.to_string();
            inode.attrs.insert(key, value.to_vec());
            inode.basic_save(&self.store)?;
            Ok(())
        })();

        match result {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(self.errno(&e)),
        }
    }

    fn getxattr(&mut self, _req: &Request<'_>, ino: u64, name: &OsStr, size: u32, reply: ReplyXattr) {
        let result = (|| -> Result<Vec<u8>> {
            let oid = self.oid_for(ino).ok_or(Error::NotFound)?;
            let inode = self.store.find_inode_by_id(oid)?.ok_or(Error::NotFound)?;
            let key = name.to_str().ok_or(Error::NotFound)?;
            inode.attrs.get(key).cloned().ok_or(Error::NoAttribute)
        })();

        match result {
            Ok(value) if size == 0 => reply.size(value.len() as u32),
            Ok(value) if (value.len() as u32) <= size => reply.data(&value),
            Ok(_) => reply.error(libc::ERANGE),
            Err(e) => reply.error(self.errno(&e)),
        }
    }

    fn listxattr(&mut self, _req: &Request<'_>, ino: u64, size: u32, reply: ReplyXattr) {
        let result = (|| -> Result<Vec<u8>> {
            let oid = self.oid_for(ino).ok_or(Error::NotFound)?;
            let inode = self.store.find_inode_by_id(oid)?.ok_or(Error::NotFound)?;
            let mut buf = Vec::new();
            for key in inode.attrs.keys() {
                buf.extend_from_slice(key.as_bytes());
                buf.push(0);
            }
            Ok(buf)
        })();

        match result {
            Ok(buf) if size == 0 => reply.size(buf.len() as u32),
            Ok(buf) if (buf.len() as u32) <= size => reply.data(&buf),
            Ok(_) => reply.error(libc::ERANGE),
            Err(e) => reply.error(self.errno(&e)),
        }
    }

    fn removexattr(&mut self, _req: &Request<'_>, ino: u64, name: &OsStr, reply: ReplyEmpty) {
        let result = (|| -> Result<()> {
            let oid = self.oid_for(ino).ok_or(Error::NotFound)?;
            let mut inode = self.store.find_inode_by_id(oid)?.ok_or(Error::NotFound)?;
            let key = name.to_str().ok_or(Error::NotFound)?;
            if inode.attrs.remove(key).is_none() {
                return Err(Error::NoAttribute);
            }
            inode.basic_save(&self.store)?;
            Ok(())
        })();

        match result {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(self.errno(&e)),
        }
    }

    fn access(&mut self, req: &Request<'_>, ino: u64, mask: i32, reply: ReplyEmpty) {
        let result = (|| -> Result<()> {
            let oid = self.oid_for(ino).ok_or(Error::NotFound)?;
            let inode = self.store.find_inode_by_id(oid)?.ok_or(Error::NotFound)?;
            let user = self.resolve_user(req);
            let mut rights = 0u32;
            if mask & libc::R_OK != 0 {
                rights |= access::READ;
            }
            if mask & libc::W_OK != 0 {
                rights |= access::WRITE;
            }
            if mask & libc::X_OK != 0 {
                rights |= access::EXEC;
            }
            if rights != 0 && !inode.has_access(rights, &user) {
                return Err(Error::PermissionDenied);
            }
            Ok(())
        })();

        match result {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(self.errno(&e)),
        }
    }

    fn create(
        &mut self,
        req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        _umask: u32,
        _flags: i32,
        reply: ReplyCreate,
    ) {
        match self.create_entry(req, parent, name, mode, InodeType::Regular, None) {
            Ok((inode, ino)) => reply.created(&ATTR_TTL, &self.to_attr(&inode, ino), 0, 0, 0),
            Err(e) => reply.error(self.errno(&e)),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn getlk(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        _lock_owner: u64,
        _start: u64,
        _end: u64,
        _typ: i32,
        pid: u32,
        reply: ReplyLock,
    ) {
        let result = (|| -> Result<Option<(i32, u32)>> {
            let oid = self.oid_for(ino).ok_or(Error::NotFound)?;
            let path = self.path_of(oid)?;
            let (parent_oid, leaf) = self.path_resolver().split(&path)?;
            let candidate = LockRequest {
                kind: LockKind::Exclusive,
                wait: false,
                path: path.clone(),
                pid,
            };
            let blocker = self.lock_manager().test_lock(parent_oid, &leaf, &candidate)?;
            Ok(blocker.map(|rec| {
                let typ = match rec.kind {
                    LockKind::Shared => libc::F_RDLCK,
                    _ => libc::F_WRLCK,
                };
                (typ, pid)
            }))
        })();

        match result {
            Ok(Some((typ, holder_pid))) => reply.locked(0, 0, typ, holder_pid),
            Ok(None) => reply.locked(0, 0, libc::F_UNLCK, 0),
            Err(e) => reply.error(self.errno(&e)),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn setlk(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        _lock_owner: u64,
        _start: u64,
        _end: u64,
        typ: i32,
        pid: u32,
        sleep: bool,
        reply: ReplyEmpty,
    ) {
        let result = (|| -> Result<()> {
            let oid = self.oid_for(ino).ok_or(Error::NotFound)?;
            let path = self.path_of(oid)?;
            let kind = match typ {
                libc::F_RDLCK => LockKind::Shared,
                libc::F_WRLCK => LockKind::Exclusive,
                libc::F_UNLCK => LockKind::UnlockIntent,
                _ => return Err(Error::BadFileDescriptor),
            };
            let (parent_oid, leaf) = self.path_resolver().split(&path)?;
            self.lock_manager().acquire(
                parent_oid,
                &leaf,
                &LockRequest {
                    kind,
                    wait: sleep,
                    path,
                    pid,
                },
                self.lock_access_attempt,
            )?;
            Ok(())
        })();

        match result {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(self.errno(&e)),
        }
    }
}
