use std::{
    cmp::{max, min},
    ops::Range,
};

use bitflags::bitflags;
use bytes::{Bytes, BytesMut};
use snafu::{ensure, ResultExt};

use tsumiki_common::{BlockIndex, DEFAULT_BLOCK_ID_RAW_LEN, MAX_BLOCKS_PER_OBJECT};
use tsumiki_store::Properties;
use tsumiki_types::block::Block;
use tsumiki_types::block_id::BlockId;

use crate::err::{BlockLimitExceededSnafu, MalformedBlockListSnafu, MintSnafu, Result};

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ListFlags: u8 {
        /// The object is a single whole-object put with no block list on the
        /// server; `blocks` is empty and the bytes live in `small_buf` or
        /// remotely.
        const SMALL_FILE = 1 << 0;
        /// The server object reflects this list; cleared by every mutation.
        const CONSISTENT = 1 << 1;
    }
}

/// What a write will do to each affected block. Planning never performs
/// I/O; read-modify-write segments only record the work the staging engine
/// will do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentKind {
    /// The block is resident (or a hole): patched in memory.
    Overwrite,
    /// The block's original bytes are on the server and the write covers
    /// only part of it: queued as a patch, resolved at stage time.
    ReadModifyWrite,
    /// The write covers the whole block at its exact boundaries.
    Replace,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteSegment {
    pub block: BlockIndex,
    pub block_off: usize,
    pub buf_start: usize,
    pub len: usize,
    pub kind: SegmentKind,
}

/// In-place growth of the trailing block, up to the block size.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TailExtend {
    pub block: BlockIndex,
    pub buf_start: usize,
    pub len: usize,
}

/// A fresh block appended past the current end of file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TailAppend {
    pub start: u64,
    pub buf_start: usize,
    pub len: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WritePlan {
    /// Holes to create when the write begins past the end of file; all but
    /// the last are full block-size ranges.
    pub gap_blocks: Vec<Range<u64>>,
    pub segments: Vec<WriteSegment>,
    pub extend: Option<TailExtend>,
    pub appends: Vec<TailAppend>,
}

impl WritePlan {
    pub fn is_empty(&self) -> bool {
        self.gap_blocks.is_empty()
            && self.segments.is_empty()
            && self.extend.is_none()
            && self.appends.is_empty()
    }
}

/// The in-memory picture of one open file: an ordered, contiguous,
/// non-overlapping sequence of blocks covering `[0, file_size)`.
///
/// Existing block boundaries are never moved by writes; splits happen only
/// at those boundaries, and only the trailing block ever changes length
/// (append growth, truncate). All mutations are pure memory operations; the
/// staging engine performs the deferred downloads.
#[derive(Debug)]
pub struct BlockList {
    blocks: Vec<Block>,
    /// Upper bound for blocks this list creates. Blocks inherited from the
    /// server keep their committed size even if it is larger.
    block_size: usize,
    /// Fixed from first observation onward; every id minted for this file
    /// uses it so one commit never mixes encoded lengths.
    id_raw_len: u16,
    flags: ListFlags,

    // small-file mode
    small_len: u64,
    small_buf: Option<BytesMut>,
    small_dirty: bool,
}

impl BlockList {
    /// A brand-new, empty file. Starts in small-file mode with an empty
    /// resident buffer.
    pub fn new_empty(block_size: usize) -> BlockList {
        BlockList {
            blocks: Vec::new(),
            block_size,
            id_raw_len: DEFAULT_BLOCK_ID_RAW_LEN,
            flags: ListFlags::SMALL_FILE | ListFlags::CONSISTENT,
            small_len: 0,
            small_buf: Some(BytesMut::new()),
            small_dirty: false,
        }
    }

    /// Rebuild the list from the server's view of the object. An object
    /// without a block list is recognized as small-file mode.
    pub fn from_properties(props: &Properties, block_size: usize) -> Result<BlockList> {
        let committed = match &props.block_list {
            None => {
                return Ok(BlockList {
                    blocks: Vec::new(),
                    block_size,
                    id_raw_len: DEFAULT_BLOCK_ID_RAW_LEN,
                    flags: ListFlags::SMALL_FILE | ListFlags::CONSISTENT,
                    small_len: props.size,
                    small_buf: None,
                    small_dirty: false,
                });
            }
            Some(list) => list,
        };

        let id_raw_len = committed
            .first()
            .map(|b| b.id.raw_len())
            .unwrap_or(DEFAULT_BLOCK_ID_RAW_LEN);
        let mut blocks = Vec::with_capacity(committed.len());
        let mut pos = 0u64;
        for cb in committed {
            ensure!(
                cb.id.raw_len() == id_raw_len,
                MalformedBlockListSnafu {
                    reason: "mixed id lengths".to_string(),
                }
            );
            ensure!(
                cb.size > 0,
                MalformedBlockListSnafu {
                    reason: "zero-sized block".to_string(),
                }
            );
            ensure!(
                blocks
                    .iter()
                    .all(|b: &Block| b.id().as_str() != cb.id.as_str()),
                MalformedBlockListSnafu {
                    reason: format!("duplicate block id {}", cb.id),
                }
            );
            blocks.push(Block::new_committed(pos, pos + cb.size, cb.id.clone()));
            pos += cb.size;
        }
        ensure!(
            pos == props.size,
            MalformedBlockListSnafu {
                reason: format!("block sizes sum to {pos}, object size is {}", props.size),
            }
        );
        Ok(BlockList {
            blocks,
            block_size,
            id_raw_len,
            flags: ListFlags::CONSISTENT,
            small_len: 0,
            small_buf: None,
            small_dirty: false,
        })
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    pub fn id_raw_len(&self) -> u16 {
        self.id_raw_len
    }

    pub fn is_small_file(&self) -> bool {
        self.flags.contains(ListFlags::SMALL_FILE)
    }

    pub fn is_consistent(&self) -> bool {
        self.flags.contains(ListFlags::CONSISTENT)
    }

    pub fn mark_consistent(&mut self) {
        self.flags.insert(ListFlags::CONSISTENT);
    }

    fn taint(&mut self) {
        self.flags.remove(ListFlags::CONSISTENT);
    }

    pub fn file_size(&self) -> u64 {
        if self.is_small_file() {
            self.small_len
        } else {
            self.blocks.last().map(|b| b.end()).unwrap_or(0)
        }
    }

    pub fn blocks(&self) -> &[Block] {
        &self.blocks
    }

    pub fn block_mut(&mut self, idx: BlockIndex) -> &mut Block {
        &mut self.blocks[idx]
    }

    pub fn block_ids(&self) -> Vec<BlockId> {
        self.blocks.iter().map(|b| b.id().clone()).collect()
    }

    pub fn has_dirty(&self) -> bool {
        if self.is_small_file() {
            self.small_dirty
        } else {
            self.blocks.iter().any(|b| b.is_dirty())
        }
    }

    /// Dirty blocks in `start` order, for the staging engine.
    pub fn iter_dirty(&mut self) -> impl Iterator<Item = &mut Block> {
        self.blocks.iter_mut().filter(|b| b.is_dirty())
    }

    pub fn mark_block_clean(&mut self, idx: BlockIndex) {
        self.blocks[idx].mark_clean();
    }

    /// Index of the block containing `offset`. Ranges are half-open, so an
    /// offset sitting on a boundary belongs to the following block.
    pub fn find(&self, offset: u64) -> Option<BlockIndex> {
        let idx = self.blocks.partition_point(|b| b.end() <= offset);
        (idx < self.blocks.len()).then_some(idx)
    }

    /// The store rejects commit lists past [`MAX_BLOCKS_PER_OBJECT`]; refuse
    /// growth that would run into that instead of failing at commit time.
    fn ensure_block_capacity(&self, additional: usize) -> Result<()> {
        ensure!(
            self.blocks.len() + additional <= MAX_BLOCKS_PER_OBJECT,
            BlockLimitExceededSnafu {
                count: self.blocks.len() + additional,
                limit: MAX_BLOCKS_PER_OBJECT,
            }
        );
        Ok(())
    }

    /// Give `idx` a fresh identity if it is currently clean. A clean block's
    /// id names already-committed bytes; staging different bytes under it
    /// would violate the store's idempotency rule.
    fn dirty_block(&mut self, idx: BlockIndex) -> Result<&mut Block> {
        if !self.blocks[idx].is_dirty() {
            let id = BlockId::mint(self.id_raw_len).context(MintSnafu)?;
            self.blocks[idx].assign_id(id);
        }
        Ok(&mut self.blocks[idx])
    }

    /// Describe what a write of `len` bytes at `offset` would touch, without
    /// performing it. Splits occur only at existing block boundaries; the
    /// appended tail is carved into blocks of at most `block_size`.
    pub fn plan_write(&self, offset: u64, len: usize) -> WritePlan {
        debug_assert!(!self.is_small_file());
        let mut plan = WritePlan::default();
        if len == 0 {
            return plan;
        }
        let fsize = self.file_size();
        let write_end = offset + len as u64;

        if offset > fsize {
            let mut pos = fsize;
            while pos < offset {
                let end = min(pos + self.block_size as u64, offset);
                plan.gap_blocks.push(pos..end);
                pos = end;
            }
        }

        if offset < fsize {
            let cap = min(write_end, fsize);
            let mut idx = self.find(offset).expect("offset is below the file size");
            let mut pos = offset;
            while pos < cap {
                let b = &self.blocks[idx];
                let block_off = (pos - b.start()) as usize;
                let seg_end = min(b.end(), cap);
                let seg_len = (seg_end - pos) as usize;
                let kind = if block_off == 0 && seg_len == b.len() {
                    SegmentKind::Replace
                } else if b.is_resident() || b.is_truncated() {
                    SegmentKind::Overwrite
                } else {
                    SegmentKind::ReadModifyWrite
                };
                plan.segments.push(WriteSegment {
                    block: idx,
                    block_off,
                    buf_start: (pos - offset) as usize,
                    len: seg_len,
                    kind,
                });
                pos = seg_end;
                idx += 1;
            }
        }

        let mut tail = max(offset, fsize);
        if write_end > tail {
            // Grow the trailing block in place while it is still this
            // session's to grow: dirty and materializable without a server
            // round trip. Committed boundaries are never moved.
            if offset <= fsize {
                if let Some(last) = self.blocks.last() {
                    if last.is_dirty()
                        && (last.is_resident() || last.is_truncated())
                        && last.len() < self.block_size
                    {
                        let grow = min(self.block_size - last.len(), (write_end - tail) as usize);
                        plan.extend = Some(TailExtend {
                            block: self.blocks.len() - 1,
                            buf_start: (tail - offset) as usize,
                            len: grow,
                        });
                        tail += grow as u64;
                    }
                }
            }
            while tail < write_end {
                let end = min(tail + self.block_size as u64, write_end);
                plan.appends.push(TailAppend {
                    start: tail,
                    buf_start: (tail - offset) as usize,
                    len: (end - tail) as usize,
                });
                tail = end;
            }
        }
        plan
    }

    /// Apply a write to the in-memory list. No I/O happens here: resident
    /// blocks are patched directly, non-resident partial overwrites are
    /// queued for the staging engine, and holes/appends become new blocks.
    pub fn apply_write(&mut self, offset: u64, data: &[u8]) -> Result<WritePlan> {
        debug_assert!(!self.is_small_file());
        if data.is_empty() {
            return Ok(WritePlan::default());
        }
        let plan = self.plan_write(offset, data.len());
        self.ensure_block_capacity(plan.gap_blocks.len() + plan.appends.len())?;

        for gap in &plan.gap_blocks {
            let id = BlockId::mint(self.id_raw_len).context(MintSnafu)?;
            self.blocks.push(Block::new_truncated(gap.start, gap.end, id));
        }

        for seg in &plan.segments {
            let src = &data[seg.buf_start..seg.buf_start + seg.len];
            let block = self.dirty_block(seg.block)?;
            match seg.kind {
                SegmentKind::Replace => block.replace(Bytes::copy_from_slice(src)),
                SegmentKind::Overwrite => {
                    if block.is_truncated() {
                        block.fill_zeros();
                    }
                    block.overwrite(seg.block_off, src);
                }
                SegmentKind::ReadModifyWrite => {
                    block.queue_patch(seg.block_off, Bytes::copy_from_slice(src))
                }
            }
        }

        if let Some(ext) = &plan.extend {
            let src = &data[ext.buf_start..ext.buf_start + ext.len];
            let block = self.dirty_block(ext.block)?;
            if block.is_truncated() {
                block.fill_zeros();
            }
            block.extend(src);
        }

        for app in &plan.appends {
            let src = &data[app.buf_start..app.buf_start + app.len];
            let id = BlockId::mint(self.id_raw_len).context(MintSnafu)?;
            self.blocks.push(Block::new_resident(
                app.start,
                app.start + app.len as u64,
                id,
                Bytes::copy_from_slice(src),
            ));
        }

        self.taint();
        Ok(plan)
    }

    /// Append a pre-sized buffer as one fresh block, for callers that manage
    /// their own chunking.
    pub fn append_block(&mut self, data: Bytes) -> Result<()> {
        debug_assert!(!self.is_small_file());
        debug_assert!(!data.is_empty() && data.len() <= self.block_size);
        self.ensure_block_capacity(1)?;
        let start = self.file_size();
        let id = BlockId::mint(self.id_raw_len).context(MintSnafu)?;
        self.blocks
            .push(Block::new_resident(start, start + data.len() as u64, id, data));
        self.taint();
        Ok(())
    }

    /// Resize the file. Shrinking clips exactly one block and drops its
    /// successors; growing appends holes.
    pub fn truncate(&mut self, new_size: u64) -> Result<()> {
        if self.is_small_file() {
            return self.small_truncate(new_size);
        }
        let fsize = self.file_size();
        match new_size.cmp(&fsize) {
            std::cmp::Ordering::Equal => Ok(()),
            std::cmp::Ordering::Greater => {
                self.extend_truncated(new_size)?;
                self.taint();
                Ok(())
            }
            std::cmp::Ordering::Less => {
                if new_size == 0 {
                    self.blocks.clear();
                } else {
                    let idx = self.find(new_size).expect("new size is below the file size");
                    if new_size == self.blocks[idx].start() {
                        // Falls on a boundary: the predecessor already ends
                        // here, nothing needs re-staging.
                        self.blocks.truncate(idx);
                    } else {
                        self.blocks.truncate(idx + 1);
                        let block = self.dirty_block(idx)?;
                        block.shorten(new_size);
                    }
                }
                self.taint();
                Ok(())
            }
        }
    }

    fn extend_truncated(&mut self, new_size: u64) -> Result<()> {
        let mut pos = self.file_size();
        // Re-open a trailing hole that has not reached the block size yet.
        let mut grow_to = None;
        if let Some(last) = self.blocks.last() {
            if last.is_truncated() && last.is_dirty() && !last.is_resident() {
                let grow_end = min(last.start() + self.block_size as u64, new_size);
                if grow_end > last.end() {
                    grow_to = Some(grow_end);
                    pos = grow_end;
                }
            }
        }
        self.ensure_block_capacity((new_size - pos).div_ceil(self.block_size as u64) as usize)?;
        if let Some(grow_end) = grow_to {
            self.blocks
                .last_mut()
                .expect("a trailing hole was found above")
                .grow_hole(grow_end);
        }
        while pos < new_size {
            let end = min(pos + self.block_size as u64, new_size);
            let id = BlockId::mint(self.id_raw_len).context(MintSnafu)?;
            self.blocks.push(Block::new_truncated(pos, end, id));
            pos = end;
        }
        Ok(())
    }

    // ---- small-file mode ----------------------------------------------

    pub fn small_resident(&self) -> bool {
        self.small_buf.is_some()
    }

    pub fn is_small_dirty(&self) -> bool {
        self.small_dirty
    }

    /// Install the whole-object content the caller downloaded.
    pub fn set_small_buf(&mut self, content: Bytes) {
        debug_assert!(self.is_small_file());
        debug_assert_eq!(content.len() as u64, self.small_len);
        self.small_buf = Some(BytesMut::from(&content[..]));
    }

    pub fn small_write(&mut self, offset: u64, data: &[u8]) {
        debug_assert!(self.is_small_file());
        let buf = self
            .small_buf
            .as_mut()
            .expect("small payload must be resident before writing");
        let offset = offset as usize;
        let end = offset + data.len();
        if buf.len() < end {
            // Fills any seek-past-end hole with zeros.
            buf.resize(end, 0);
        }
        buf[offset..end].copy_from_slice(data);
        self.small_len = buf.len() as u64;
        self.small_dirty = true;
        self.taint();
    }

    fn small_truncate(&mut self, new_size: u64) -> Result<()> {
        debug_assert!(self.is_small_file());
        if new_size == self.small_len {
            return Ok(());
        }
        let buf = self
            .small_buf
            .as_mut()
            .expect("small payload must be resident before truncating");
        buf.resize(new_size as usize, 0);
        self.small_len = new_size;
        self.small_dirty = true;
        self.taint();
        Ok(())
    }

    /// The whole-object payload for a small-file flush.
    pub fn small_payload(&self) -> Option<Bytes> {
        self.small_buf
            .as_ref()
            .map(|b| Bytes::copy_from_slice(&b[..]))
    }

    pub fn mark_small_clean(&mut self) {
        self.small_dirty = false;
    }

    pub fn small_read(&self, offset: u64, dst: &mut [u8]) -> usize {
        debug_assert!(self.is_small_file());
        let buf = self.small_buf.as_ref().expect("small payload resident");
        if offset as usize >= buf.len() {
            return 0;
        }
        let n = min(dst.len(), buf.len() - offset as usize);
        dst[..n].copy_from_slice(&buf[offset as usize..offset as usize + n]);
        n
    }

    /// Whether an operation growing the file to `projected` bytes forces the
    /// transition out of small-file mode.
    pub fn needs_promotion(&self, projected: u64) -> bool {
        self.is_small_file() && projected > self.block_size as u64
    }

    /// Leave small-file mode: the resident whole-object buffer becomes
    /// dirty resident blocks. Everything is re-uploaded under fresh ids on
    /// the next flush, since the server object has no block list to reuse.
    pub fn promote(&mut self) -> Result<()> {
        debug_assert!(self.is_small_file());
        let content_len = self
            .small_buf
            .as_ref()
            .expect("small payload must be resident before promotion")
            .len();
        self.ensure_block_capacity(content_len.div_ceil(self.block_size))?;
        let content = self
            .small_buf
            .take()
            .expect("small payload must be resident before promotion")
            .freeze();
        debug_assert_eq!(content.len() as u64, self.small_len);
        self.flags.remove(ListFlags::SMALL_FILE);
        self.small_len = 0;
        self.small_dirty = false;

        let mut pos = 0usize;
        while pos < content.len() {
            let end = min(pos + self.block_size, content.len());
            let id = BlockId::mint(self.id_raw_len).context(MintSnafu)?;
            self.blocks.push(Block::new_resident(
                pos as u64,
                end as u64,
                id,
                content.slice(pos..end),
            ));
            pos = end;
        }
        self.taint();
        Ok(())
    }

    /// Test/debug helper: assert every structural invariant.
    pub fn check_invariants(&self) {
        if self.is_small_file() {
            assert!(self.blocks.is_empty(), "small files carry no blocks");
            return;
        }
        assert!(self.blocks.len() <= MAX_BLOCKS_PER_OBJECT);
        let mut pos = 0u64;
        let mut seen = std::collections::HashSet::new();
        for b in &self.blocks {
            assert_eq!(b.start(), pos, "blocks must be contiguous from zero");
            assert!(b.start() < b.end());
            assert!(
                !b.is_dirty() || b.len() <= self.block_size,
                "dirty blocks never exceed the block size"
            );
            assert_eq!(b.id().raw_len(), self.id_raw_len);
            assert!(seen.insert(b.id().as_str().to_string()), "duplicate block id");
            if b.is_dirty() && !b.is_truncated() {
                assert!(
                    b.is_resident() || !b.patches().is_empty(),
                    "a dirty block is resident or carries patches"
                );
            }
            if let Some(data) = b.data() {
                assert_eq!(data.len(), b.len());
            }
            pos = b.end();
        }
        assert_eq!(pos, self.file_size());
    }
}
