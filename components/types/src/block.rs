use std::ops::Range;

use bitflags::bitflags;
use bytes::{Bytes, BytesMut};

use crate::block_id::BlockId;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct BlockFlags: u8 {
        /// Must be staged on the next flush.
        const DIRTY = 1 << 0;
        /// A zero-filled hole; materialized as zeros at stage time.
        const TRUNCATED = 1 << 1;
        /// Keep the payload resident after a successful stage.
        const PINNED = 1 << 2;
    }
}

/// An overwrite recorded against a block whose original bytes are not
/// resident. Replayed on top of the downloaded base during staging.
/// `offset` is relative to the block start.
#[derive(Debug, Clone)]
pub struct Patch {
    pub offset: usize,
    pub data: Bytes,
}

/// One contiguous `[start, end)` byte range of a file, the unit of upload.
///
/// A block already committed to the store and not currently modified keeps
/// `data` absent; payloads are only resident while the block is being edited
/// or staged.
#[derive(Debug, Clone)]
pub struct Block {
    start: u64,
    end: u64,
    id: BlockId,
    data: Option<Bytes>,
    patches: Vec<Patch>,
    flags: BlockFlags,
}

impl Block {
    /// A block reconstructed from the server's committed block list.
    pub fn new_committed(start: u64, end: u64, id: BlockId) -> Block {
        debug_assert!(start < end);
        Block {
            start,
            end,
            id,
            data: None,
            patches: Vec::new(),
            flags: BlockFlags::empty(),
        }
    }

    /// A freshly written block with its payload resident.
    pub fn new_resident(start: u64, end: u64, id: BlockId, data: Bytes) -> Block {
        debug_assert!(start < end);
        debug_assert_eq!(data.len() as u64, end - start);
        Block {
            start,
            end,
            id,
            data: Some(data),
            patches: Vec::new(),
            flags: BlockFlags::DIRTY,
        }
    }

    /// A hole created by truncate-extend or by writing past the end of the
    /// file. Carries no payload; staging expands it to zeros.
    pub fn new_truncated(start: u64, end: u64, id: BlockId) -> Block {
        debug_assert!(start < end);
        Block {
            start,
            end,
            id,
            data: None,
            patches: Vec::new(),
            flags: BlockFlags::DIRTY | BlockFlags::TRUNCATED,
        }
    }

    pub fn start(&self) -> u64 {
        self.start
    }

    pub fn end(&self) -> u64 {
        self.end
    }

    pub fn range(&self) -> Range<u64> {
        self.start..self.end
    }

    pub fn len(&self) -> usize {
        (self.end - self.start) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }

    pub fn id(&self) -> &BlockId {
        &self.id
    }

    /// Swap in a fresh identifier. Required whenever a clean block turns
    /// dirty again: its previous id already names staged bytes on the server
    /// and the store treats re-staging an id with different bytes as a
    /// protocol violation.
    pub fn assign_id(&mut self, id: BlockId) {
        self.id = id;
    }

    pub fn data(&self) -> Option<&Bytes> {
        self.data.as_ref()
    }

    pub fn patches(&self) -> &[Patch] {
        &self.patches
    }

    pub fn flags(&self) -> BlockFlags {
        self.flags
    }

    pub fn is_dirty(&self) -> bool {
        self.flags.contains(BlockFlags::DIRTY)
    }

    pub fn is_truncated(&self) -> bool {
        self.flags.contains(BlockFlags::TRUNCATED)
    }

    pub fn is_resident(&self) -> bool {
        self.data.is_some()
    }

    pub fn is_pinned(&self) -> bool {
        self.flags.contains(BlockFlags::PINNED)
    }

    pub fn set_pinned(&mut self, pinned: bool) {
        self.flags.set(BlockFlags::PINNED, pinned);
    }

    pub fn contains(&self, offset: u64) -> bool {
        self.start <= offset && offset < self.end
    }

    /// Overwrite resident bytes in place. The payload is copy-on-write: the
    /// common single-owner case mutates without copying.
    pub fn overwrite(&mut self, block_off: usize, src: &[u8]) {
        debug_assert!(self.is_resident(), "overwrite needs a resident payload");
        debug_assert!(block_off + src.len() <= self.len());
        let mut buf = take_mut(&mut self.data);
        buf[block_off..block_off + src.len()].copy_from_slice(src);
        self.data = Some(buf.freeze());
        self.flags.insert(BlockFlags::DIRTY);
    }

    /// Turn a hole into an ordinary resident block of zeros so it can be
    /// edited in place.
    pub fn fill_zeros(&mut self) {
        debug_assert!(self.is_truncated() && self.data.is_none());
        self.data = Some(Bytes::from(vec![0u8; self.len()]));
        self.flags.remove(BlockFlags::TRUNCATED);
        self.flags.insert(BlockFlags::DIRTY);
    }

    /// Replace the whole payload; the write covered the entire block.
    pub fn replace(&mut self, data: Bytes) {
        debug_assert_eq!(data.len(), self.len());
        self.data = Some(data);
        self.patches.clear();
        self.flags.remove(BlockFlags::TRUNCATED);
        self.flags.insert(BlockFlags::DIRTY);
    }

    /// Record a partial overwrite of a non-resident block. The original
    /// bytes stay on the server until the staging engine downloads them and
    /// replays the patch queue on top.
    pub fn queue_patch(&mut self, block_off: usize, data: Bytes) {
        debug_assert!(!self.is_resident() && !self.is_truncated());
        debug_assert!(block_off + data.len() <= self.len());
        self.patches.push(Patch {
            offset: block_off,
            data,
        });
        self.flags.insert(BlockFlags::DIRTY);
    }

    /// Grow a resident block in place, up to the caller-enforced block size.
    pub fn extend(&mut self, src: &[u8]) {
        debug_assert!(self.is_resident(), "extend needs a resident payload");
        let mut buf = take_mut(&mut self.data);
        buf.extend_from_slice(src);
        self.end += src.len() as u64;
        self.data = Some(buf.freeze());
        self.flags.insert(BlockFlags::DIRTY);
    }

    /// Grow a still-open hole. Only meaningful for a dirty truncated block
    /// that has never been materialized.
    pub fn grow_hole(&mut self, new_end: u64) {
        debug_assert!(self.is_truncated() && self.is_dirty() && self.data.is_none());
        debug_assert!(new_end > self.end);
        self.end = new_end;
    }

    /// Shrink the block so it ends at `new_end`. Resident bytes and queued
    /// patches are clipped to the new length.
    pub fn shorten(&mut self, new_end: u64) {
        debug_assert!(self.start < new_end && new_end < self.end);
        let new_len = (new_end - self.start) as usize;
        if let Some(data) = self.data.take() {
            self.data = Some(data.slice(0..new_len));
        }
        self.patches.retain_mut(|p| {
            if p.offset >= new_len {
                return false;
            }
            if p.offset + p.data.len() > new_len {
                p.data = p.data.slice(0..new_len - p.offset);
            }
            true
        });
        self.end = new_end;
        self.flags.insert(BlockFlags::DIRTY);
    }

    /// Install the block's full payload from `base` (downloaded original
    /// bytes, or zeros for a hole) and replay the queued patches.
    pub fn materialize(&mut self, base: Bytes) {
        debug_assert!(self.data.is_none());
        debug_assert_eq!(base.len(), self.len());
        let mut buf = match base.try_into_mut() {
            Ok(m) => m,
            Err(shared) => BytesMut::from(&shared[..]),
        };
        for p in self.patches.drain(..) {
            buf[p.offset..p.offset + p.data.len()].copy_from_slice(&p.data);
        }
        self.data = Some(buf.freeze());
        self.flags.remove(BlockFlags::TRUNCATED);
    }

    /// The bytes to upload. Refcounted, so handing it to an upload task does
    /// not copy.
    pub fn payload(&self) -> Option<Bytes> {
        self.data.clone()
    }

    /// Called by the staging engine after a successful upload.
    pub fn mark_clean(&mut self) {
        debug_assert!(self.patches.is_empty(), "staged a block with pending patches");
        self.flags.remove(BlockFlags::DIRTY | BlockFlags::TRUNCATED);
        if !self.is_pinned() {
            self.data = None;
        }
    }
}

fn take_mut(data: &mut Option<Bytes>) -> BytesMut {
    match data.take().expect("payload must be resident").try_into_mut() {
        Ok(m) => m,
        Err(shared) => BytesMut::from(&shared[..]),
    }
}
