use snafu::ResultExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument};

use tsumiki_store::{AccessTier, Acl, CommitOptions, CpkInfo, Etag, ObjectStoreRef};
use tsumiki_utils::ReadableSize;

use crate::block_list::BlockList;
use crate::err::{CancelledSnafu, Result, StoreSnafu};
use crate::stager::Stager;

#[derive(Debug, Clone, Default)]
pub struct FlushOptions {
    /// Capture the object's ACL before the commit and re-apply it after:
    /// the store resets ACLs when a commit replaces the object.
    pub preserve_acl: bool,
    /// Commit conditionally on the handle's last-known etag; a concurrent
    /// writer then surfaces as a condition failure instead of silently
    /// losing.
    pub use_etag_guard: bool,
    pub tier: Option<AccessTier>,
    pub content_type: Option<String>,
    pub cpk: Option<CpkInfo>,
}

/// Drives a block list to the server: stage every dirty block, then commit
/// the complete ordered id list in one request. The commit is atomic on the
/// server side; staged-but-uncommitted blocks are garbage it sweeps on its
/// own.
pub struct Flusher {
    store: ObjectStoreRef,
    stager: Stager,
    opts: FlushOptions,
}

impl Flusher {
    pub fn new(store: ObjectStoreRef, stager: Stager, opts: FlushOptions) -> Flusher {
        Flusher {
            store,
            stager,
            opts,
        }
    }

    fn commit_options(&self, etag: Option<&Etag>) -> CommitOptions {
        CommitOptions {
            content_type: self.opts.content_type.clone(),
            tier: self.opts.tier,
            if_match: if self.opts.use_etag_guard {
                etag.cloned()
            } else {
                None
            },
            cpk: self.opts.cpk.clone(),
        }
    }

    /// Make the server object reflect `list`. Returns the new etag when a
    /// put or commit happened, `None` when there was nothing to do. A second
    /// flush right after a successful one is that `None` no-op.
    #[instrument(skip_all, fields(path = %path))]
    pub async fn flush(
        &self,
        path: &str,
        list: &mut BlockList,
        etag: Option<&Etag>,
        cancel: &CancellationToken,
    ) -> Result<Option<Etag>> {
        if list.is_small_file() {
            if !list.is_small_dirty() {
                return Ok(None);
            }
            let payload = list.small_payload().expect("a dirty small file is resident");
            debug!(
                "whole-object put of {} to {path}",
                ReadableSize(payload.len() as u64)
            );
            let opts = self.commit_options(etag);
            let new_etag = tokio::select! {
                biased;
                _ = cancel.cancelled() => return CancelledSnafu.fail(),
                r = self.store.put_object(path, payload, &opts) => {
                    r.context(StoreSnafu)?
                }
            };
            list.mark_small_clean();
            list.mark_consistent();
            return Ok(Some(new_etag));
        }

        if list.is_consistent() && !list.has_dirty() {
            debug!("{path} is already consistent, nothing to flush");
            return Ok(None);
        }

        self.stager.stage(path, list, cancel).await?;

        // The commit names every block, not only those staged this flush:
        // the request replaces the server's block list entirely.
        let ids = list.block_ids();
        debug_assert!(
            ids.windows(2).all(|w| w[0].as_str().len() == w[1].as_str().len()),
            "one commit never mixes id lengths"
        );

        let prior_acl = if self.opts.preserve_acl {
            self.fetch_acl(path).await?
        } else {
            None
        };

        let opts = self.commit_options(etag);
        let new_etag = tokio::select! {
            biased;
            _ = cancel.cancelled() => return CancelledSnafu.fail(),
            r = self.store.commit_block_list(path, &ids, &opts) => {
                r.context(StoreSnafu)?
            }
        };

        if let Some(acl) = prior_acl {
            self.store.set_acl(path, &acl).await.context(StoreSnafu)?;
        }

        list.mark_consistent();
        info!("committed {} blocks to {path}", ids.len());
        Ok(Some(new_etag))
    }

    async fn fetch_acl(&self, path: &str) -> Result<Option<Acl>> {
        match self.store.get_acl(path).await {
            Ok(acl) => Ok(Some(acl)),
            Err(e) if e.is_unsupported() || e.is_not_found() => Ok(None),
            Err(e) => Err(e).context(StoreSnafu),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use bytes::Bytes;
    use tsumiki_store::mem::MemStore;
    use tsumiki_store::ObjectStore;

    use super::*;
    use crate::block_list::BlockList;

    const BS: usize = 8;

    fn flusher_for(store: Arc<MemStore>, opts: FlushOptions) -> Flusher {
        let stager = Stager::new(store.clone(), 4);
        Flusher::new(store, stager, opts)
    }

    #[tokio::test]
    async fn small_file_flush_is_one_put() {
        let store = Arc::new(MemStore::new());
        let flusher = flusher_for(store.clone(), FlushOptions::default());
        let cancel = CancellationToken::new();

        let mut list = BlockList::new_empty(BS);
        list.small_write(0, b"test");
        let etag = flusher.flush("f", &mut list, None, &cancel).await.unwrap();
        assert!(etag.is_some());
        assert_eq!(store.stats().puts, 1);
        assert_eq!(store.stats().commits, 0);

        let props = store.get_properties("f").await.unwrap();
        assert_eq!(props.size, 4);
        assert!(props.block_list.is_none());

        // nothing dirty: the next flush does not touch the store
        let etag = flusher.flush("f", &mut list, None, &cancel).await.unwrap();
        assert!(etag.is_none());
        assert_eq!(store.stats().puts, 1);
    }

    #[tokio::test]
    async fn block_flush_commits_the_full_list() {
        let store = Arc::new(MemStore::new());
        let flusher = flusher_for(store.clone(), FlushOptions::default());
        let cancel = CancellationToken::new();

        let mut list = BlockList::new_empty(BS);
        list.small_write(0, &[1u8; 20]);
        list.promote().unwrap();
        flusher.flush("f", &mut list, None, &cancel).await.unwrap();

        // touch one block only; the next commit still lists all three
        list.apply_write(0, &[2u8; 4]).unwrap();
        flusher.flush("f", &mut list, None, &cancel).await.unwrap();
        assert_eq!(store.stats().commits, 2);

        let props = store.get_properties("f").await.unwrap();
        assert_eq!(props.block_list.unwrap().len(), 3);
        let head = store.download_range("f", 0..8).await.unwrap();
        assert_eq!(head.as_ref(), &[2, 2, 2, 2, 1, 1, 1, 1]);

        // flush; flush: the second issues neither stage nor commit
        flusher.flush("f", &mut list, None, &cancel).await.unwrap();
        assert_eq!(store.stats().commits, 2);
    }

    #[tokio::test]
    async fn preserves_acl_across_commit() {
        let store = Arc::new(MemStore::new_hierarchical());
        let flusher = flusher_for(
            store.clone(),
            FlushOptions {
                preserve_acl: true,
                ..Default::default()
            },
        );
        let cancel = CancellationToken::new();

        let mut list = BlockList::new_empty(BS);
        list.small_write(0, &[1u8; 20]);
        list.promote().unwrap();
        flusher.flush("f", &mut list, None, &cancel).await.unwrap();

        let custom = Acl::from_mode(0o700);
        store.set_acl("f", &custom).await.unwrap();

        list.apply_write(0, b"x").unwrap();
        flusher.flush("f", &mut list, None, &cancel).await.unwrap();
        // the commit reset the ACL server-side; the flush restored it
        assert_eq!(store.get_acl("f").await.unwrap(), custom);
    }

    #[tokio::test]
    async fn acl_preservation_tolerates_flat_stores() {
        let store = Arc::new(MemStore::new());
        let flusher = flusher_for(
            store.clone(),
            FlushOptions {
                preserve_acl: true,
                ..Default::default()
            },
        );
        let cancel = CancellationToken::new();

        let mut list = BlockList::new_empty(BS);
        list.small_write(0, &[1u8; 20]);
        list.promote().unwrap();
        flusher.flush("f", &mut list, None, &cancel).await.unwrap();
        assert_eq!(store.stats().commits, 1);
    }

    #[tokio::test]
    async fn etag_guard_rejects_stale_commit() {
        let store = Arc::new(MemStore::new());
        let flusher = flusher_for(
            store.clone(),
            FlushOptions {
                use_etag_guard: true,
                ..Default::default()
            },
        );
        let cancel = CancellationToken::new();

        let mut list = BlockList::new_empty(BS);
        list.small_write(0, &[1u8; 20]);
        list.promote().unwrap();
        let etag = flusher
            .flush("f", &mut list, None, &cancel)
            .await
            .unwrap()
            .unwrap();

        // another writer replaces the object; our etag goes stale
        store
            .put_object("f", Bytes::from_static(b"other"), &Default::default())
            .await
            .unwrap();

        // full-block replacement: stages fresh bytes, no read-modify-write
        list.apply_write(0, &[3u8; BS]).unwrap();
        let err = flusher
            .flush("f", &mut list, Some(&etag), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(
            err.as_store(),
            Some(tsumiki_store::Error::ConditionNotMet { .. })
        ));
    }
}
