//! Database-backed end-to-end scenarios, driven directly against the
//! resolver/lock/chunk layers that `FilesystemEngine` composes (building
//! a real kernel-bridge mount inside a test harness is out of scope — the
//! bridge is an external collaborator per spec §1). Requires a reachable
//! MongoDB; skipped with a notice otherwise. See spec §8.
//!
//! Point `MONGOFS_TEST_URI` at a `host[:port][,host...]` list, e.g.
//! `MONGOFS_TEST_URI=localhost:27017`.

use std::collections::HashMap;
use std::io::Write;
use std::sync::Arc;

use bson::oid::ObjectId;
use mongofs::chunkio::{ChunkIO, WriteBuffer};
use mongofs::inode::{Inode, InodeType, LockKind, Metadata};
use mongofs::lock::{LockManager, LockRequest};
use mongofs::path::PathResolver;
use mongofs::store::StoreClient;
use mongofs::user::UserInfo;
use mongofs::Config;

fn test_config(database: &str) -> Config {
    let hosts = std::env::var("MONGOFS_TEST_URI").unwrap_or_default();
    let hosts_json: Vec<String> = hosts.split(',').filter(|s| !s.is_empty()).map(String::from).collect();
    let body = serde_json::json!({
        "mongo": {
            "hosts": hosts_json,
            "database": database,
            "prefix": "",
            "access_attempt_s": 5,
            "write_acknowledgement": 1,
            "write_j": false,
            "chunk_size": 262_144,
        },
        "lock": {"timeout_s": 60, "access_attempt_s": 3},
        "cache": {"timeout_s": 5, "max_elements": 1000},
        "data_cache": {"timeout_s": 5, "max_elements": 1000},
        "host": "test-node",
        "development": true,
        "default_root_mode": "0755",
        "force_root_mode": false,
    });
    let mut file = tempfile::NamedTempFile::new().expect("tempfile");
    write!(file, "{body}").unwrap();
    Config::load(file.path()).expect("valid test config")
}

/// Returns `None` (and prints a skip notice) when no test database is
/// configured, matching the teacher's own environment-gated integration
/// tests.
fn connect(name: &str) -> Option<(StoreClient, Config)> {
    if std::env::var("MONGOFS_TEST_URI").is_err() {
        println!("skipping {name}: MONGOFS_TEST_URI not set");
        return None;
    }
    let config = test_config(&format!("mongofs_test_{name}"));
    let store = StoreClient::connect(&config, Arc::new(|| {})).expect("connect to test store");
    store.drop_all().expect("wipe test database");
    Some((store, config))
}

fn root_user() -> UserInfo {
    UserInfo {
        uid: 0,
        gid: 0,
        pid: 1000,
        uname: "root".into(),
        gids: vec![0],
        gnames: vec!["root".into()],
    }
}

/// Create and insert the root directory inode, mirroring
/// `FilesystemEngine::new`'s bootstrap (root has the empty filename and no
/// parent). Returns the inserted inode.
fn ensure_root(store: &StoreClient, config: &Config) -> Inode {
    if let Some(root) = store.find_inode(None, "", Some(InodeType::Directory)).unwrap() {
        return root;
    }
    let now = mongofs::inode::now_unix();
    let root = Inode {
        id: ObjectId::new(),
        parent_id: None,
        filename: String::new(),
        kind: InodeType::Directory,
        chunk_size: store.chunk_size(),
        length: 0,
        metadata: Metadata {
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
    store.insert_inode(&root).unwrap();
    root
}

#[test]
fn scenario_mkdir_touch_write_read() {
    let Some((store, config)) = connect("mkdir_touch_write_read") else { return };
    ensure_root(&store, &config);
    let resolver = PathResolver::new(&store);
    let user = root_user();

    let (parent, leaf) = resolver.split("/a").unwrap();
    let a = Inode::create(&store, parent, None, &leaf, 0o755, InodeType::Directory, None, &user, "h").unwrap();

    let (parent, leaf) = resolver.split("/a/b").unwrap();
    let a_dir = store.find_inode_by_id(a.id).unwrap().unwrap();
    let b = Inode::create(&store, parent, Some(&a_dir), &leaf, 0o644, InodeType::Regular, None, &user, "h").unwrap();

    let wb = WriteBuffer::new();
    let b = wb.write(&store, &b, b"hello\n", 0).unwrap();
    let b = wb.flush(&store, &b).unwrap();

    let data = ChunkIO::read(&store, &b, 0, 6).unwrap();
    assert_eq!(data, b"hello\n");
    assert_eq!(b.length, 6);

    let a_after = store.find_inode_by_id(a.id).unwrap().unwrap();
    assert_eq!(a_after.metadata.nlink, 3);
}

#[test]
fn scenario_symlink_follow() {
    let Some((store, config)) = connect("symlink_follow") else { return };
    ensure_root(&store, &config);
    let resolver = PathResolver::new(&store);
    let user = root_user();

    let (parent, leaf) = resolver.split("/x").unwrap();
    let x = Inode::create(&store, parent, None, &leaf, 0o644, InodeType::Regular, None, &user, "h").unwrap();
    let wb = WriteBuffer::new();
    let x = wb.write(&store, &x, b"data", 0).unwrap();
    wb.flush(&store, &x).unwrap();

    let (parent, leaf) = resolver.split("/y").unwrap();
    let y = Inode::create(
        &store,
        parent,
        None,
        &leaf,
        0o777,
        InodeType::Symlink,
        Some("/x".to_string()),
        &user,
        "h",
    )
    .unwrap();

    assert!(y.is_link());
    assert_eq!(y.target.as_deref(), Some("/x"));

    let resolved = resolver.get_inode("/x").unwrap();
    let data = ChunkIO::read(&store, &resolved, 0, 4).unwrap();
    assert_eq!(data, b"data");
}

#[test]
fn scenario_rmdir_requires_empty() {
    let Some((store, config)) = connect("rmdir_requires_empty") else { return };
    ensure_root(&store, &config);
    let resolver = PathResolver::new(&store);
    let user = root_user();

    let (parent, leaf) = resolver.split("/d").unwrap();
    let d = Inode::create(&store, parent, None, &leaf, 0o755, InodeType::Directory, None, &user, "h").unwrap();
    let (parent, leaf) = resolver.split("/d/f").unwrap();
    let d_dir = store.find_inode_by_id(d.id).unwrap().unwrap();
    let f = Inode::create(&store, parent, Some(&d_dir), &leaf, 0o644, InodeType::Regular, None, &user, "h").unwrap();

    let root = resolver.get_inode("/").unwrap();
    assert_eq!(store.count_children(d.id).unwrap(), 1, "rmdir should be rejected while non-empty");

    store.delete_inode_and_chunks(f.id).unwrap();
    store.add_nlink(d.id, -1).unwrap();
    assert_eq!(store.count_children(d.id).unwrap(), 0);

    store.delete_inode_and_chunks(d.id).unwrap();
    let root_after = store.add_nlink(root.id, -1).unwrap();
    assert_eq!(root_after.metadata.nlink, root.metadata.nlink - 1);
}

#[test]
fn scenario_exclusive_lock_blocks_nonwaiting_acquire() {
    let Some((store, config)) = connect("lock_blocks") else { return };
    ensure_root(&store, &config);
    let resolver = PathResolver::new(&store);
    let user = root_user();

    let (parent_id, leaf) = resolver.split("/f").unwrap();
    Inode::create(&store, parent_id, None, &leaf, 0o644, InodeType::Regular, None, &user, "h").unwrap();

    let lm_a = LockManager::new(&store, "host-a".into(), config.lock_timeout);
    let lm_b = LockManager::new(&store, "host-b".into(), config.lock_timeout);

    let req_a = LockRequest { kind: LockKind::Exclusive, wait: false, path: "/f".into(), pid: 1 };
    lm_a.acquire(parent_id, &leaf, &req_a, config.lock_access_attempt).unwrap();

    let req_b = LockRequest { kind: LockKind::Exclusive, wait: false, path: "/f".into(), pid: 2 };
    let err = lm_b.acquire(parent_id, &leaf, &req_b, config.lock_access_attempt).unwrap_err();
    assert!(matches!(err, mongofs::Error::Locked));

    let released = store.find_inode(parent_id, &leaf, None).unwrap().unwrap();
    lm_a.release("/f", 1, &released).unwrap();

    lm_b.acquire(parent_id, &leaf, &req_b, config.lock_access_attempt).unwrap();
}

#[test]
fn scenario_overlapping_writes_within_one_chunk() {
    let Some((store, config)) = connect("overlapping_writes") else { return };
    ensure_root(&store, &config);
    let resolver = PathResolver::new(&store);
    let user = root_user();

    let (parent, leaf) = resolver.split("/f").unwrap();
    let f = Inode::create(&store, parent, None, &leaf, 0o644, InodeType::Regular, None, &user, "h").unwrap();

    let first = vec![0xAAu8; 1024 * 1024];
    let f = ChunkIO::write_direct(&store, &f, &first, 0).unwrap();
    let f = ChunkIO::write_direct(&store, &f, &[0xBB; 6], 2).unwrap();

    let whole = ChunkIO::read(&store, &f, 0, 1024 * 1024).unwrap();
    assert_eq!(&whole[0..2], &[0xAA, 0xAA]);
    assert_eq!(&whole[2..8], &[0xBB; 6]);
    assert_eq!(&whole[8..], vec![0xAA; 1024 * 1024 - 8]);
}

#[test]
fn scenario_rename_preserves_descendant_reachability() {
    let Some((store, config)) = connect("rename_descendants") else { return };
    ensure_root(&store, &config);
    let resolver = PathResolver::new(&store);
    let user = root_user();

    let (parent, leaf) = resolver.split("/dir0").unwrap();
    let dir0 = Inode::create(&store, parent, None, &leaf, 0o755, InodeType::Directory, None, &user, "h").unwrap();
    let (parent, leaf) = resolver.split("/dir0/dir1").unwrap();
    let dir0_doc = store.find_inode_by_id(dir0.id).unwrap().unwrap();
    let dir1 =
        Inode::create(&store, parent, Some(&dir0_doc), &leaf, 0o755, InodeType::Directory, None, &user, "h").unwrap();
    let (parent, leaf) = resolver.split("/dir0/dir1/dir2").unwrap();
    let dir1_doc = store.find_inode_by_id(dir1.id).unwrap().unwrap();
    let dir2 =
        Inode::create(&store, parent, Some(&dir1_doc), &leaf, 0o755, InodeType::Directory, None, &user, "h").unwrap();
    let (parent, leaf) = resolver.split("/dir0/dir1/dir2/f").unwrap();
    let dir2_doc = store.find_inode_by_id(dir2.id).unwrap().unwrap();
    let f = Inode::create(&store, parent, Some(&dir2_doc), &leaf, 0o644, InodeType::Regular, None, &user, "h").unwrap();
    let wb = WriteBuffer::new();
    let f = wb.write(&store, &f, b"some text\n", 0).unwrap();
    wb.flush(&store, &f).unwrap();

    let root = resolver.get_inode("/").unwrap();
    store.rename_inode(dir0.id, Some(root.id), "renamed").unwrap();

    let moved = resolver.get_inode("/renamed/dir1/dir2/f").unwrap();
    let data = ChunkIO::read(&store, &moved, 0, 10).unwrap();
    assert_eq!(data, b"some text\n");

    assert!(resolver.get_inode("/dir0").is_err());
}
