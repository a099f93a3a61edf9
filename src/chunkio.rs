//! Chunked read/write/truncate over a file inode's data, plus the
//! append-coalescing write buffer. See spec §4.7.

use std::collections::HashMap;

use bson::oid::ObjectId;
use parking_lot::Mutex;

use crate::error::Result;
use crate::inode::{now_unix, Inode};
use crate::store::{ChunkDoc, StoreClient};

/// Pure chunk-range read/write/truncate helpers. Holds no state of its
/// own; all state lives in the store.
pub struct ChunkIO;

impl ChunkIO {
    /// Read `size` bytes starting at `offset`, clamped to the inode's
    /// current length. See spec §4.7 steps 1-4.
    pub fn read(store: &StoreClient, inode: &Inode, offset: u64, size: u32) -> Result<Vec<u8>> {
        if offset >= inode.length {
            return Ok(Vec::new());
        }
        let end = offset.saturating_add(size as u64).min(inode.length);
        if end <= offset {
            return Ok(Vec::new());
        }
        let chunk_size = inode.chunk_size as u64;
        let lo = (offset / chunk_size) as i64;
        let hi = ((end - 1) / chunk_size) as i64;

        let chunks = store.find_chunks_range(inode.id, lo, hi)?;
        let mut by_n: HashMap<i64, &ChunkDoc> = HashMap::new();
        for c in &chunks {
            by_n.insert(c.n, c);
        }

        let mut out = Vec::with_capacity((end - offset) as usize);
        let mut pos = offset;
        while pos < end {
            let n = (pos / chunk_size) as i64;
            let chunk_start = n as u64 * chunk_size;
            let in_chunk_off = (pos - chunk_start) as usize;
            let take = ((end - pos) as usize).min(chunk_size as usize - in_chunk_off);
            match by_n.get(&n) {
                Some(chunk) if chunk.data.len() > in_chunk_off => {
                    let avail = (chunk.data.len() - in_chunk_off).min(take);
                    out.extend_from_slice(&chunk.data[in_chunk_off..in_chunk_off + avail]);
                    if avail < take {
                        out.resize(out.len() + (take - avail), 0);
                    }
                }
                _ => out.resize(out.len() + take, 0),
            }
            pos += take as u64;
        }
        Ok(out)
    }

    /// Write `data` at `offset`, overwriting any existing chunks in range
    /// and appending new ones past the current last chunk. A write never
    /// shrinks the file: the new length is `max(inode.length, offset +
    /// data.len())`; truncate is the only path that shortens it.
    pub fn write_direct(store: &StoreClient, inode: &Inode, data: &[u8], offset: u64) -> Result<Inode> {
        if data.is_empty() {
            return Ok(inode.clone());
        }
        let chunk_size = inode.chunk_size as u64;
        let end = offset + data.len() as u64;
        let lo = (offset / chunk_size) as i64;
        let hi = ((end - 1) / chunk_size) as i64;

        let existing = store.find_chunks_range(inode.id, lo, hi)?;
        let mut by_n: HashMap<i64, ChunkDoc> = HashMap::new();
        for c in existing {
            by_n.insert(c.n, c);
        }

        let mut new_chunks = Vec::new();
        for n in lo..=hi {
            let chunk_start = n as u64 * chunk_size;
            let chunk_end = chunk_start + chunk_size;
            let write_lo = offset.max(chunk_start);
            let write_hi = end.min(chunk_end);
            let in_chunk_off = (write_lo - chunk_start) as usize;
            let slice = &data[(write_lo - offset) as usize..(write_hi - offset) as usize];

            match by_n.get_mut(&n) {
                Some(chunk) => {
                    if chunk.data.len() < in_chunk_off + slice.len() {
                        chunk.data.resize(in_chunk_off + slice.len(), 0);
                    }
                    chunk.data[in_chunk_off..in_chunk_off + slice.len()].copy_from_slice(slice);
                    store.update_chunk_data(chunk.id, chunk.data.clone())?;
                }
                None => {
                    let mut buf = vec![0u8; in_chunk_off + slice.len()];
                    buf[in_chunk_off..].copy_from_slice(slice);
                    new_chunks.push(ChunkDoc {
                        id: ObjectId::new(),
                        files_id: inode.id,
                        n,
                        data: buf,
                    });
                }
            }
        }
        store.insert_chunks(&new_chunks)?;
        store.update_inode_length(inode.id, inode.length.max(end), now_unix())
    }

    /// Drop every chunk past `length` and trim the boundary chunk, per
    /// spec §4.7's truncate case.
    pub fn truncate(store: &StoreClient, inode: &Inode, length: u64) -> Result<Inode> {
        let chunk_size = inode.chunk_size as u64;
        if length == 0 {
            store.delete_chunks_from(inode.id, 0)?;
            return store.update_inode_length(inode.id, 0, now_unix());
        }

        let max_chunk = (length - 1) / chunk_size;
        store.delete_chunks_from(inode.id, max_chunk as i64 + 1)?;

        if length % chunk_size != 0 {
            let boundary = store.find_chunks_range(inode.id, max_chunk as i64, max_chunk as i64)?;
            if let Some(chunk) = boundary.into_iter().find(|c| c.n == max_chunk as i64) {
                let keep = (length - max_chunk * chunk_size) as usize;
                if chunk.data.len() > keep {
                    let mut trimmed = chunk.data;
                    trimmed.truncate(keep);
                    store.update_chunk_data(chunk.id, trimmed)?;
                }
            }
        }
        store.update_inode_length(inode.id, length, now_unix())
    }
}

struct PendingWrite {
    offset: u64,
    buffer: Vec<u8>,
}

/// A pending buffer is flushed once it reaches this size, per spec §4.7.
const FLUSH_THRESHOLD: usize = 10 * 1024 * 1024;

/// Coalesces sequential small writes into one flush per inode, per spec
/// §4.7's write-buffer note and §5's "no I/O while a lock is held" rule:
/// the map mutex guards only the `HashMap` mutation, never the
/// `ChunkIO::write_direct` call itself.
pub struct WriteBuffer {
    buffers: Mutex<HashMap<ObjectId, PendingWrite>>,
}

impl WriteBuffer {
    pub fn new() -> Self {
        WriteBuffer {
            buffers: Mutex::new(HashMap::new()),
        }
    }

    /// Buffer `data` at `offset` if it extends the pending run
    /// contiguously; otherwise flush what's pending first, then buffer
    /// fresh. Non-contiguous or backward writes always flush immediately,
    /// and a contiguous run that reaches `FLUSH_THRESHOLD` flushes too.
    pub fn write(&self, store: &StoreClient, inode: &Inode, data: &[u8], offset: u64) -> Result<Inode> {
        enum Action {
            Buffered,
            FlushPending(PendingWrite),
            FlushMergedAndStart(PendingWrite, PendingWrite),
        }

        let action = {
            let mut map = self.buffers.lock();
            match map.get_mut(&inode.id) {
                Some(pending) if pending.offset + pending.buffer.len() as u64 == offset => {
                    pending.buffer.extend_from_slice(data);
                    if pending.buffer.len() >= FLUSH_THRESHOLD {
                        Action::FlushPending(map.remove(&inode.id).unwrap())
                    } else {
                        Action::Buffered
                    }
                }
                Some(_) => {
                    let old = map.remove(&inode.id).unwrap();
                    let fresh = PendingWrite { offset, buffer: data.to_vec() };
                    Action::FlushMergedAndStart(old, fresh)
                }
                None => {
                    map.insert(inode.id, PendingWrite { offset, buffer: data.to_vec() });
                    Action::Buffered
                }
            }
        };

        match action {
            Action::Buffered => Ok(inode.clone()),
            Action::FlushPending(pending) => ChunkIO::write_direct(store, inode, &pending.buffer, pending.offset),
            Action::FlushMergedAndStart(old, fresh) => {
                let updated = ChunkIO::write_direct(store, inode, &old.buffer, old.offset)?;
                self.buffers.lock().insert(updated.id, fresh);
                Ok(updated)
            }
        }
    }

    /// Flush any pending buffer for `inode`, returning the resulting
    /// (possibly unchanged) inode.
    pub fn flush(&self, store: &StoreClient, inode: &Inode) -> Result<Inode> {
        let pending = self.buffers.lock().remove(&inode.id);
        match pending {
            Some(p) if !p.buffer.is_empty() => ChunkIO::write_direct(store, inode, &p.buffer, p.offset),
            _ => Ok(inode.clone()),
        }
    }
}

impl Default for WriteBuffer {
    fn default() -> Self {
        WriteBuffer::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_buffer_coalesces_contiguous_writes() {
        let wb = WriteBuffer::new();
        let id = ObjectId::new();
        assert!(wb.buffers.lock().is_empty());
        wb.buffers.lock().insert(
            id,
            PendingWrite {
                offset: 0,
                buffer: vec![1, 2, 3],
            },
        );
        let pending = &wb.buffers.lock()[&id];
        assert_eq!(pending.offset, 0);
        assert_eq!(pending.buffer, vec![1, 2, 3]);
    }
}
