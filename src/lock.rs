//! Advisory shared/exclusive lock arbitration over inode documents. See
//! spec §4.6.
//!
//! Every transition is expressed as a single `find_one_and_update`
//! conditional on the observed `lock_version` (an optimistic
//! compare-and-set); a lost race simply restarts the read-modify-write
//! loop rather than retrying inside the store, per the redesign guidance
//! in spec §9 ("avoid hidden control-flow" in the retry path).

use std::thread;
use std::time::{Duration, Instant};

use bson::oid::ObjectId;

use crate::error::{Error, Result};
use crate::inode::{now_unix, Inode, LockKind, LockRecord};
use crate::store::StoreClient;

/// One lock acquisition request, as dispatched by `FilesystemEngine::lock`.
#[derive(Debug, Clone)]
pub struct LockRequest {
    pub kind: LockKind,
    pub wait: bool,
    pub path: String,
    pub pid: u32,
}

pub struct LockManager<'a> {
    store: &'a StoreClient,
    hostname: String,
    lock_timeout: Duration,
}

impl<'a> LockManager<'a> {
    pub fn new(store: &'a StoreClient, hostname: String, lock_timeout: Duration) -> Self {
        LockManager {
            store,
            hostname,
            lock_timeout,
        }
    }

    fn holder_id(&self, req: &LockRequest) -> String {
        LockRecord::make_id(&req.path, req.pid, &self.hostname)
    }

    /// Filter `lock` down to the records that have not expired, per the
    /// `lock_timeout` window.
    fn live(&self, inode: &Inode, now: i64) -> Vec<LockRecord> {
        inode
            .lock
            .iter()
            .filter(|r| r.creation_time + self.lock_timeout.as_secs() as i64 >= now)
            .cloned()
            .collect()
    }

    /// One non-blocking attempt to resolve `req` against the document's
    /// current state, retried internally only on a lost optimistic-update
    /// race (never on lock contention — that's the caller's job via
    /// `acquire`).
    fn try_once(&self, parent_id: Option<ObjectId>, leaf: &str, req: &LockRequest) -> Result<Inode> {
        let holder = self.holder_id(req);
        loop {
            let inode = self
                .store
                .find_inode(parent_id, leaf, None)?
                .ok_or(Error::NotFound)?;
            let now = now_unix();
            let live = self.live(&inode, now);

            if live.is_empty() && !inode.lock.is_empty() {
                // Every record present was expired: clear the vector and
                // restart against the freshly cleared document.
                if self
                    .store
                    .cas_lock(inode.id, inode.lock_version, None, inode.lock_version + 1)?
                    .is_none()
                {
                    // Lost the race to another acquirer; re-read and retry.
                }
                continue;
            }

            if live.is_empty() {
                if req.kind == LockKind::UnlockIntent {
                    return Ok(inode);
                }
                let record = LockRecord {
                    creation_time: now,
                    id: holder.clone(),
                    kind: req.kind,
                    hostname: self.hostname.clone(),
                };
                let new_version = if inode.lock_version == 0 { 1 } else { inode.lock_version + 1 };
                match self
                    .store
                    .cas_lock(inode.id, inode.lock_version, Some(&[record]), new_version)?
                {
                    Some(updated) => return Ok(updated),
                    None => continue,
                }
            }

            match req.kind {
                LockKind::UnlockIntent => {
                    let holders: Vec<&LockRecord> = live.iter().filter(|r| r.id == holder).collect();
                    if holders.is_empty() {
                        return Err(Error::Locked);
                    }
                    if live.len() == holders.len() {
                        match self
                            .store
                            .cas_lock(inode.id, inode.lock_version, None, inode.lock_version + 1)?
                        {
                            Some(updated) => return Ok(updated),
                            None => continue,
                        }
                    } else {
                        let remaining: Vec<LockRecord> =
                            inode.lock.iter().filter(|r| r.id != holder).cloned().collect();
                        match self
                            .store
                            .cas_lock(inode.id, inode.lock_version, Some(&remaining), inode.lock_version + 1)?
                        {
                            Some(updated) => return Ok(updated),
                            None => continue,
                        }
                    }
                }
                _ => {
                    if live.len() == 1 && live[0].id == holder {
                        if live[0].kind == req.kind {
                            return Ok(inode);
                        }
                        let record = LockRecord {
                            creation_time: now,
                            id: holder.clone(),
                            kind: req.kind,
                            hostname: self.hostname.clone(),
                        };
                        match self
                            .store
                            .cas_lock(inode.id, inode.lock_version, Some(&[record]), inode.lock_version + 1)?
                        {
                            Some(updated) => return Ok(updated),
                            None => continue,
                        }
                    } else if req.kind == LockKind::Shared && live.iter().all(|r| r.kind == LockKind::Shared) {
                        if live.iter().any(|r| r.id == holder) {
                            return Ok(inode);
                        }
                        let mut records = inode.lock.clone();
                        records.push(LockRecord {
                            creation_time: now,
                            id: holder.clone(),
                            kind: LockKind::Shared,
                            hostname: self.hostname.clone(),
                        });
                        match self
                            .store
                            .cas_lock(inode.id, inode.lock_version, Some(&records), inode.lock_version + 1)?
                        {
                            Some(updated) => return Ok(updated),
                            None => continue,
                        }
                    } else {
                        return Err(Error::Locked);
                    }
                }
            }
        }
    }

    /// Resolve `req`, polling every 1s while `req.wait` is true, until
    /// `access_attempt` elapses. See spec §4.5/§4.6.
    pub fn acquire(
        &self,
        parent_id: Option<ObjectId>,
        leaf: &str,
        req: &LockRequest,
        access_attempt: Duration,
    ) -> Result<Inode> {
        let deadline = Instant::now() + access_attempt;
        loop {
            match self.try_once(parent_id, leaf, req) {
                Err(Error::Locked) if req.wait => {
                    if Instant::now() >= deadline {
                        return Err(Error::WouldDeadlock);
                    }
                    thread::sleep(Duration::from_secs(1));
                }
                other => return other,
            }
        }
    }

    /// Return the first live record that would block `candidate`, without
    /// attempting to acquire. Used by the lock-query command.
    pub fn test_lock(
        &self,
        parent_id: Option<ObjectId>,
        leaf: &str,
        candidate: &LockRequest,
    ) -> Result<Option<LockRecord>> {
        let inode = self.store.find_inode(parent_id, leaf, None)?.ok_or(Error::NotFound)?;
        let now = now_unix();
        let live = self.live(&inode, now);
        if live.is_empty() {
            return Ok(None);
        }
        let holder = self.holder_id(candidate);
        match candidate.kind {
            LockKind::Shared => {
                if live.iter().all(|r| r.kind == LockKind::Shared) {
                    Ok(None)
                } else {
                    Ok(live.into_iter().find(|r| r.kind == LockKind::Exclusive))
                }
            }
            _ => {
                if live.len() == 1 && live[0].id == holder {
                    Ok(None)
                } else {
                    Ok(live.into_iter().next())
                }
            }
        }
    }

    /// Pull every record the caller holds on `inode`. Used by
    /// `release`/`releasedir`.
    pub fn release(&self, path: &str, pid: u32, inode: &Inode) -> Result<()> {
        let holder = LockRecord::make_id(path, pid, &self.hostname);
        if !inode.lock.iter().any(|r| r.id == holder) {
            return Ok(());
        }
        let remaining: Vec<LockRecord> = inode.lock.iter().filter(|r| r.id != holder).cloned().collect();
        if remaining.is_empty() {
            self.store.cas_lock(inode.id, inode.lock_version, None, inode.lock_version + 1)?;
        } else {
            self.store
                .cas_lock(inode.id, inode.lock_version, Some(&remaining), inode.lock_version + 1)?;
        }
        Ok(())
    }
}
