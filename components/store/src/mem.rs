use std::{
    collections::HashMap,
    ops::Range,
    sync::atomic::{AtomicU64, Ordering},
};

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use snafu::{ensure, ResultExt};
use tracing::debug;

use tsumiki_types::block_id::BlockId;

use crate::error::{
    BackingSnafu, ConditionNotMetSnafu, MixedIdLengthSnafu, NotFoundSnafu, OutOfRangeSnafu,
    Result, UnknownBlockSnafu, UnsupportedSnafu,
};
use crate::{Acl, AccessTier, CommitOptions, CommittedBlock, Etag, ObjectStore, Properties};

/// In-memory object store emulator.
///
/// Raw bytes live in an opendal memory operator; etags, ACLs, committed
/// block lists and the staged-block area are tracked beside it. Tests and
/// local runs use this in place of a real blob endpoint.
pub struct MemStore {
    op: opendal::Operator,
    meta: DashMap<String, ObjectMeta>,
    // (path, encoded id) -> staged size
    staged: DashMap<(String, String), u64>,
    supports_acl: bool,
    etag_seq: AtomicU64,
    stats: Stats,
}

#[derive(Debug, Clone)]
struct ObjectMeta {
    size: u64,
    etag: Etag,
    acl: Option<Acl>,
    tier: Option<AccessTier>,
    content_type: Option<String>,
    blocks: Option<Vec<CommittedBlock>>,
}

#[derive(Debug, Default)]
struct Stats {
    staged: AtomicU64,
    commits: AtomicU64,
    puts: AtomicU64,
    downloads: AtomicU64,
}

/// Operation counters, for tests that assert "no second commit happened".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreStats {
    pub staged_blocks: u64,
    pub commits: u64,
    pub puts: u64,
    pub downloads: u64,
}

impl MemStore {
    /// Flat blob-style store: no ACL support.
    pub fn new() -> MemStore {
        Self::with_acl_support(false)
    }

    /// Hierarchical (data-lake style) store: ACLs round-trip, and a commit
    /// resets them to the default, which is exactly why the flush protocol
    /// preserves them explicitly.
    pub fn new_hierarchical() -> MemStore {
        Self::with_acl_support(true)
    }

    fn with_acl_support(supports_acl: bool) -> MemStore {
        Self::new_on(
            tsumiki_utils::object_storage::new_mem_operator("/"),
            supports_acl,
        )
    }

    /// Run the emulator over any operator, e.g. a filesystem-backed one for
    /// debugging; only the raw bytes go through it, the bookkeeping stays in
    /// memory.
    pub fn new_on(op: opendal::Operator, supports_acl: bool) -> MemStore {
        MemStore {
            op,
            meta: DashMap::new(),
            staged: DashMap::new(),
            supports_acl,
            etag_seq: AtomicU64::new(1),
            stats: Stats::default(),
        }
    }

    pub fn stats(&self) -> StoreStats {
        StoreStats {
            staged_blocks: self.stats.staged.load(Ordering::Acquire),
            commits: self.stats.commits.load(Ordering::Acquire),
            puts: self.stats.puts.load(Ordering::Acquire),
            downloads: self.stats.downloads.load(Ordering::Acquire),
        }
    }

    fn obj_key(path: &str) -> String {
        format!("obj/{path}")
    }

    fn stage_key(path: &str, id: &str) -> String {
        format!("stage/{path}/{id}")
    }

    fn fresh_etag(&self) -> Etag {
        format!("0x{:016x}", self.etag_seq.fetch_add(1, Ordering::Relaxed))
    }

    fn check_match(&self, path: &str, opts: &CommitOptions) -> Result<()> {
        if let Some(expected) = &opts.if_match {
            let matches = self
                .meta
                .get(path)
                .map(|m| m.etag == *expected)
                .unwrap_or(false);
            ensure!(
                matches,
                ConditionNotMetSnafu {
                    path,
                    expected: expected.clone(),
                }
            );
        }
        Ok(())
    }

    fn created_acl(&self) -> Option<Acl> {
        self.supports_acl.then(Acl::default)
    }

    async fn purge_staged(&self, path: &str) -> Result<()> {
        let keys = self
            .staged
            .iter()
            .filter(|e| e.key().0 == path)
            .map(|e| e.key().clone())
            .collect::<Vec<_>>();
        for key in keys {
            self.op
                .delete(&Self::stage_key(&key.0, &key.1))
                .await
                .context(BackingSnafu)?;
            self.staged.remove(&key);
        }
        Ok(())
    }
}

impl Default for MemStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ObjectStore for MemStore {
    async fn stage_block(&self, path: &str, id: &BlockId, data: Bytes) -> Result<()> {
        let size = data.len() as u64;
        self.op
            .write(&Self::stage_key(path, id.as_str()), data)
            .await
            .context(BackingSnafu)?;
        self.staged
            .insert((path.to_string(), id.as_str().to_string()), size);
        self.stats.staged.fetch_add(1, Ordering::AcqRel);
        debug!("staged block {id} ({size} bytes) for {path}");
        Ok(())
    }

    async fn commit_block_list(
        &self,
        path: &str,
        ids: &[BlockId],
        opts: &CommitOptions,
    ) -> Result<Etag> {
        self.check_match(path, opts)?;
        if let Some(first) = ids.first() {
            ensure!(
                ids.iter().all(|id| id.as_str().len() == first.as_str().len()),
                MixedIdLengthSnafu { path }
            );
        }

        // Offsets of the currently committed blocks, for entries that reuse
        // them instead of naming freshly staged bytes.
        let mut committed_at: HashMap<String, Range<u64>> = HashMap::new();
        if let Some(meta) = self.meta.get(path) {
            if let Some(blocks) = &meta.blocks {
                let mut off = 0u64;
                for b in blocks {
                    committed_at.insert(b.id.as_str().to_string(), off..off + b.size);
                    off += b.size;
                }
            }
        }
        let mut prior_content: Option<Vec<u8>> = None;

        let mut content = Vec::new();
        let mut blocks = Vec::with_capacity(ids.len());
        for id in ids {
            let staged_key = (path.to_string(), id.as_str().to_string());
            if self.staged.contains_key(&staged_key) {
                let bytes = self
                    .op
                    .read(&Self::stage_key(path, id.as_str()))
                    .await
                    .context(BackingSnafu)?;
                blocks.push(CommittedBlock {
                    id: id.clone(),
                    size: bytes.len() as u64,
                });
                content.extend_from_slice(&bytes);
            } else if let Some(range) = committed_at.get(id.as_str()) {
                if prior_content.is_none() {
                    prior_content = Some(
                        self.op
                            .read(&Self::obj_key(path))
                            .await
                            .context(BackingSnafu)?,
                    );
                }
                let prior = prior_content.as_ref().expect("read above");
                blocks.push(CommittedBlock {
                    id: id.clone(),
                    size: range.end - range.start,
                });
                content.extend_from_slice(&prior[range.start as usize..range.end as usize]);
            } else {
                return UnknownBlockSnafu {
                    path,
                    id: id.to_string(),
                }
                .fail();
            }
        }

        let size = content.len() as u64;
        self.op
            .write(&Self::obj_key(path), content)
            .await
            .context(BackingSnafu)?;
        // A commit discards every uncommitted block and resets the ACL.
        self.purge_staged(path).await?;
        let etag = self.fresh_etag();
        self.meta.insert(
            path.to_string(),
            ObjectMeta {
                size,
                etag: etag.clone(),
                acl: self.created_acl(),
                tier: opts.tier,
                content_type: opts.content_type.clone(),
                blocks: Some(blocks),
            },
        );
        self.stats.commits.fetch_add(1, Ordering::AcqRel);
        debug!("committed {} blocks ({size} bytes) to {path}", ids.len());
        Ok(etag)
    }

    async fn put_object(&self, path: &str, data: Bytes, opts: &CommitOptions) -> Result<Etag> {
        self.check_match(path, opts)?;
        let size = data.len() as u64;
        self.op
            .write(&Self::obj_key(path), data)
            .await
            .context(BackingSnafu)?;
        self.purge_staged(path).await?;
        let etag = self.fresh_etag();
        self.meta.insert(
            path.to_string(),
            ObjectMeta {
                size,
                etag: etag.clone(),
                acl: self.created_acl(),
                tier: opts.tier,
                content_type: opts.content_type.clone(),
                blocks: None,
            },
        );
        self.stats.puts.fetch_add(1, Ordering::AcqRel);
        Ok(etag)
    }

    async fn download_range(&self, path: &str, range: Range<u64>) -> Result<Bytes> {
        let size = self
            .meta
            .get(path)
            .map(|m| m.size)
            .ok_or_else(|| NotFoundSnafu { path }.build())?;
        if range.start == range.end {
            return Ok(Bytes::new());
        }
        ensure!(
            range.start < range.end && range.end <= size,
            OutOfRangeSnafu {
                path,
                start: range.start,
                end: range.end,
                size,
            }
        );
        let bytes = self
            .op
            .read_with(&Self::obj_key(path))
            .range(range)
            .await
            .context(BackingSnafu)?;
        self.stats.downloads.fetch_add(1, Ordering::AcqRel);
        Ok(Bytes::from(bytes))
    }

    async fn get_properties(&self, path: &str) -> Result<Properties> {
        let meta = self.meta.get(path).ok_or_else(|| NotFoundSnafu { path }.build())?;
        Ok(Properties {
            size: meta.size,
            etag: meta.etag.clone(),
            acl: meta.acl.clone(),
            block_list: meta.blocks.clone(),
        })
    }

    async fn get_acl(&self, path: &str) -> Result<Acl> {
        ensure!(self.supports_acl, UnsupportedSnafu { op: "get_acl" });
        let meta = self.meta.get(path).ok_or_else(|| NotFoundSnafu { path }.build())?;
        Ok(meta.acl.clone().unwrap_or_default())
    }

    async fn set_acl(&self, path: &str, acl: &Acl) -> Result<()> {
        ensure!(self.supports_acl, UnsupportedSnafu { op: "set_acl" });
        let mut meta = self
            .meta
            .get_mut(path)
            .ok_or_else(|| NotFoundSnafu { path }.build())?;
        meta.acl = Some(acl.clone());
        Ok(())
    }

    async fn delete(&self, path: &str) -> Result<()> {
        let existed = self.meta.remove(path).is_some();
        ensure!(existed, NotFoundSnafu { path });
        self.op
            .delete(&Self::obj_key(path))
            .await
            .context(BackingSnafu)?;
        self.purge_staged(path).await
    }
}
