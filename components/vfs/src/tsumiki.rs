use std::cmp::{max, min};
use std::sync::Arc;

use bytes::Bytes;
use snafu::{ensure, ResultExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument};

use tsumiki_common::FH;
use tsumiki_store::{Acl, CommitOptions, ObjectStoreRef, Properties};
use tsumiki_storage::{BlockList, Flusher, Stager};

use crate::config::Config;
use crate::err::{
    BadHandleSnafu, LibcSnafu, OutOfRangeSnafu, Result, StorageSnafu, StoreSnafu,
    UnsupportedOpSnafu,
};
use crate::handle::{FileHandle, HandleState, HandleTable};

/// The POSIX-facing surface of the pipeline: open files by path, push byte
/// ranges at arbitrary offsets, and flush them as block commits.
pub struct TsumikiFs {
    store: ObjectStoreRef,
    flusher: Flusher,
    handles: HandleTable,
    config: Config,
    cancel_token: CancellationToken,
}

impl TsumikiFs {
    pub fn new(store: ObjectStoreRef, config: Config) -> TsumikiFs {
        let config = config.normalized();
        let stager = Stager::new(store.clone(), config.max_concurrency);
        let flusher = Flusher::new(store.clone(), stager, config.flush_options());
        TsumikiFs {
            store,
            flusher,
            handles: HandleTable::new(),
            config,
            cancel_token: CancellationToken::new(),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Abort in-flight staging and commits; handles stay open but their
    /// next flush fails as cancelled.
    pub fn shutdown(&self) {
        self.cancel_token.cancel();
    }

    /// Create a fresh, empty object and open a handle on it.
    #[instrument(skip(self))]
    pub async fn create(&self, path: &str) -> Result<FH> {
        match self.store.get_properties(path).await {
            Ok(_) => {
                return LibcSnafu {
                    errno: libc::EEXIST,
                }
                .fail()
            }
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e).context(StoreSnafu),
        }
        let etag = self
            .store
            .put_object(path, Bytes::new(), &CommitOptions::default())
            .await
            .context(StoreSnafu)?;
        let list = BlockList::new_empty(self.config.block_size());
        Ok(self.handles.insert(path, list, Some(etag)))
    }

    /// Open an existing object, rebuilding its block list from the server.
    #[instrument(skip(self))]
    pub async fn open(&self, path: &str) -> Result<FH> {
        let props = self.store.get_properties(path).await.context(StoreSnafu)?;
        let list =
            BlockList::from_properties(&props, self.config.block_size()).context(StorageSnafu)?;
        debug!(
            "opened {path}: {} bytes, {}",
            props.size,
            if list.is_small_file() {
                "no block list".to_string()
            } else {
                format!("{} blocks", list.blocks().len())
            }
        );
        Ok(self.handles.insert(path, list, Some(props.etag)))
    }

    fn handle(&self, fh: FH) -> Result<Arc<FileHandle>> {
        self.handles.get(fh).ok_or_else(|| BadHandleSnafu { fh }.build())
    }

    #[instrument(skip(self, data), fields(write_len = data.len()))]
    pub async fn write(&self, fh: FH, offset: u64, data: &[u8]) -> Result<usize> {
        if data.is_empty() {
            return Ok(0);
        }
        let h = self.handle(fh)?;
        let mut st = h.state.lock().await;

        if st.list.is_small_file() {
            self.ensure_small_resident(&h.path, &mut st).await?;
            let projected = max(st.list.file_size(), offset + data.len() as u64);
            if st.list.needs_promotion(projected) {
                st.list.promote().context(StorageSnafu)?;
                st.list.apply_write(offset, data).context(StorageSnafu)?;
            } else {
                st.list.small_write(offset, data);
            }
        } else {
            st.list.apply_write(offset, data).context(StorageSnafu)?;
        }
        Ok(data.len())
    }

    #[instrument(skip(self))]
    pub async fn truncate(&self, fh: FH, new_size: u64) -> Result<()> {
        let h = self.handle(fh)?;
        let mut st = h.state.lock().await;
        if st.list.is_small_file() {
            self.ensure_small_resident(&h.path, &mut st).await?;
            if st.list.needs_promotion(new_size) {
                st.list.promote().context(StorageSnafu)?;
            }
        }
        st.list.truncate(new_size).context(StorageSnafu)
    }

    /// Read through the handle's view of the file: resident payloads from
    /// memory, holes as zeros, committed blocks from the store.
    #[instrument(skip(self, dst), fields(read_len = dst.len()))]
    pub async fn read(&self, fh: FH, offset: u64, dst: &mut [u8]) -> Result<usize> {
        let h = self.handle(fh)?;
        let mut st = h.state.lock().await;
        let size = st.list.file_size();
        ensure!(offset < size, OutOfRangeSnafu { offset, size });
        if dst.is_empty() {
            return Ok(0);
        }
        let want = min(dst.len() as u64, size - offset) as usize;

        if st.list.is_small_file() {
            self.ensure_small_resident(&h.path, &mut st).await?;
            return Ok(st.list.small_read(offset, &mut dst[..want]));
        }

        let mut done = 0usize;
        while done < want {
            let pos = offset + done as u64;
            let idx = st.list.find(pos).expect("pos is below the file size");

            // a pending read-modify-write resolves to its materialized form
            let needs_fetch = {
                let b = &st.list.blocks()[idx];
                b.is_dirty() && !b.is_resident() && !b.is_truncated()
            };
            if needs_fetch {
                let range = st.list.blocks()[idx].range();
                let base = self
                    .store
                    .download_range(&h.path, range)
                    .await
                    .context(StoreSnafu)?;
                st.list.block_mut(idx).materialize(base);
            }

            let b = &st.list.blocks()[idx];
            let block_off = (pos - b.start()) as usize;
            let n = min(want - done, (b.end() - pos) as usize);
            if b.is_truncated() {
                dst[done..done + n].fill(0);
            } else if let Some(data) = b.data() {
                dst[done..done + n].copy_from_slice(&data[block_off..block_off + n]);
            } else {
                // clean and absent: its range still maps one-to-one onto the
                // committed object, boundaries never move under a block
                let bytes = self
                    .store
                    .download_range(&h.path, pos..pos + n as u64)
                    .await
                    .context(StoreSnafu)?;
                dst[done..done + n].copy_from_slice(&bytes);
            }
            done += n;
        }
        Ok(done)
    }

    pub async fn flush(&self, fh: FH) -> Result<()> {
        let h = self.handle(fh)?;
        let mut st = h.state.lock().await;
        self.flush_locked(&h.path, &mut st).await
    }

    async fn flush_locked(&self, path: &str, st: &mut HandleState) -> Result<()> {
        let cancel = self.cancel_token.child_token();
        let known_etag = st.etag.clone();
        if let Some(new_etag) = self
            .flusher
            .flush(path, &mut st.list, known_etag.as_ref(), &cancel)
            .await
            .context(StorageSnafu)?
        {
            st.etag = Some(new_etag);
        }
        Ok(())
    }

    /// Flush, then drop the handle.
    #[instrument(skip(self))]
    pub async fn release(&self, fh: FH) -> Result<()> {
        let h = self.handle(fh)?;
        {
            let mut st = h.state.lock().await;
            self.flush_locked(&h.path, &mut st).await?;
        }
        self.handles.remove(fh);
        Ok(())
    }

    #[instrument(skip(self))]
    pub async fn unlink(&self, path: &str) -> Result<()> {
        self.store.delete(path).await.context(StoreSnafu)
    }

    pub async fn stat(&self, path: &str) -> Result<Properties> {
        self.store.get_properties(path).await.context(StoreSnafu)
    }

    /// Permission update, routed to the store's ACL surface. Backends
    /// without one either swallow it or refuse, per configuration.
    #[instrument(skip(self))]
    pub async fn chmod(&self, path: &str, mode: u32) -> Result<()> {
        let acl = Acl::from_mode(mode);
        match self.store.set_acl(path, &acl).await {
            Ok(()) => Ok(()),
            Err(e) if e.is_unsupported() => {
                if self.config.fail_unsupported_op {
                    UnsupportedOpSnafu { op: "chmod" }.fail()
                } else {
                    debug!("store cannot express permissions, ignoring chmod on {path}");
                    Ok(())
                }
            }
            Err(e) => Err(e).context(StoreSnafu),
        }
    }

    /// Append a caller-chunked buffer as one fresh block.
    pub async fn append_block(&self, fh: FH, data: Bytes) -> Result<()> {
        let h = self.handle(fh)?;
        let mut st = h.state.lock().await;
        if st.list.is_small_file() {
            self.ensure_small_resident(&h.path, &mut st).await?;
            st.list.promote().context(StorageSnafu)?;
        }
        st.list.append_block(data).context(StorageSnafu)
    }

    /// Small files edit a whole-object buffer; download it on first touch.
    async fn ensure_small_resident(&self, path: &str, st: &mut HandleState) -> Result<()> {
        if !st.list.is_small_file() || st.list.small_resident() {
            return Ok(());
        }
        let size = st.list.file_size();
        let content = if size == 0 {
            Bytes::new()
        } else {
            self.store
                .download_range(path, 0..size)
                .await
                .context(StoreSnafu)?
        };
        st.list.set_small_buf(content);
        Ok(())
    }
}
