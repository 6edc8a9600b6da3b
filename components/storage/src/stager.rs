use std::sync::Arc;

use bytes::Bytes;
use futures::future::join_all;
use snafu::ResultExt;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument};

use tsumiki_store::ObjectStoreRef;
use tsumiki_utils::ReadableSize;

use crate::block_list::BlockList;
use crate::err::{CancelledSnafu, JoinErrSnafu, Result, StoreSnafu};

/// Uploads every dirty block of a list, bounded by a maximum number of
/// in-flight requests. Stage order is irrelevant: only the commit list
/// defines the final object.
pub struct Stager {
    store: ObjectStoreRef,
    max_concurrency: usize,
}

impl Stager {
    pub fn new(store: ObjectStoreRef, max_concurrency: usize) -> Stager {
        Stager {
            store,
            max_concurrency: max_concurrency.max(1),
        }
    }

    /// Materialize and upload every dirty block of `list`.
    ///
    /// Partial success is visible in the list itself: blocks that uploaded
    /// are marked clean (payload released unless pinned) even when a sibling
    /// fails, and the first failure is reported once all in-flight work has
    /// settled. Re-invoking after a transient failure re-stages only what is
    /// still dirty; re-staging an id with identical bytes is idempotent.
    #[instrument(skip_all, fields(path = %path))]
    pub async fn stage(
        &self,
        path: &str,
        list: &mut BlockList,
        cancel: &CancellationToken,
    ) -> Result<()> {
        debug_assert!(!list.is_small_file());

        self.materialize_dirty(path, list, cancel).await?;

        let jobs = list
            .blocks()
            .iter()
            .enumerate()
            .filter(|(_, b)| b.is_dirty())
            .map(|(idx, b)| {
                let payload = b.payload().expect("dirty blocks are resident after materialization");
                (idx, b.id().clone(), payload)
            })
            .collect::<Vec<_>>();
        if jobs.is_empty() {
            return Ok(());
        }
        debug!(
            "staging {} blocks ({}) for {path}",
            jobs.len(),
            ReadableSize(jobs.iter().map(|(_, _, p)| p.len() as u64).sum())
        );

        let sem = Arc::new(Semaphore::new(self.max_concurrency));
        let handles = jobs
            .into_iter()
            .map(|(idx, id, payload)| {
                let store = self.store.clone();
                let path = path.to_string();
                let sem = sem.clone();
                let cancel = cancel.clone();
                tokio::spawn(async move {
                    let _permit = sem.acquire_owned().await.expect("semaphore closed");
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => CancelledSnafu.fail(),
                        r = store.stage_block(&path, &id, payload) => {
                            r.context(StoreSnafu).map(|_| idx)
                        }
                    }
                })
            })
            .collect::<Vec<_>>();

        let mut first_err = None;
        for joined in join_all(handles).await {
            let outcome = match joined {
                Ok(inner) => inner,
                Err(e) => Err(e).context(JoinErrSnafu),
            };
            match outcome {
                Ok(idx) => list.mark_block_clean(idx),
                Err(e) => {
                    first_err.get_or_insert(e);
                }
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Read-modify-write pre-fetch. Dirty blocks whose original bytes are
    /// still on the server get their `[start, end)` range downloaded and the
    /// queued patches replayed on top; holes expand to zeros without I/O.
    async fn materialize_dirty(
        &self,
        path: &str,
        list: &mut BlockList,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let fetches = list
            .blocks()
            .iter()
            .enumerate()
            .filter(|(_, b)| b.is_dirty() && !b.is_resident() && !b.is_truncated())
            .map(|(idx, b)| (idx, b.range()))
            .collect::<Vec<_>>();

        if !fetches.is_empty() {
            let sem = Arc::new(Semaphore::new(self.max_concurrency));
            let handles = fetches
                .into_iter()
                .map(|(idx, range)| {
                    let store = self.store.clone();
                    let path = path.to_string();
                    let sem = sem.clone();
                    let cancel = cancel.clone();
                    tokio::spawn(async move {
                        let _permit = sem.acquire_owned().await.expect("semaphore closed");
                        tokio::select! {
                            biased;
                            _ = cancel.cancelled() => CancelledSnafu.fail(),
                            r = store.download_range(&path, range) => {
                                r.context(StoreSnafu).map(|bytes| (idx, bytes))
                            }
                        }
                    })
                })
                .collect::<Vec<_>>();
            for joined in join_all(handles).await {
                let (idx, bytes) = match joined {
                    Ok(inner) => inner?,
                    Err(e) => return Err(e).context(JoinErrSnafu),
                };
                list.block_mut(idx).materialize(bytes);
            }
        }

        // Holes become zeros; one shared buffer serves them all.
        let has_holes = list
            .blocks()
            .iter()
            .any(|b| b.is_dirty() && b.is_truncated() && !b.is_resident());
        if has_holes {
            let zeros = Bytes::from(vec![0u8; list.block_size()]);
            for b in list.iter_dirty() {
                if b.is_truncated() && !b.is_resident() {
                    let len = b.len();
                    b.materialize(zeros.slice(0..len));
                }
            }
        }
        Ok(())
    }
}
