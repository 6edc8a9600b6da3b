use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};

use dashmap::DashMap;
use tokio::sync::Mutex;

use tsumiki_common::FH;
use tsumiki_store::Etag;
use tsumiki_storage::BlockList;

/// One open file: the path, its block list, and the last etag the server
/// handed back.
///
/// Every mutation of the list (write, truncate, flush, and reads that
/// materialize payloads) runs under the state mutex, which is what gives
/// the pipeline its per-handle serialization. Two handles on the same path
/// are allowed; they race with last-writer-wins unless the etag guard is
/// configured.
pub struct FileHandle {
    pub fh: FH,
    pub path: String,
    pub(crate) state: Mutex<HandleState>,
}

pub(crate) struct HandleState {
    pub list: BlockList,
    pub etag: Option<Etag>,
}

pub struct HandleTable {
    handles: DashMap<FH, Arc<FileHandle>>,
    next_fh: AtomicU64,
}

impl Default for HandleTable {
    fn default() -> Self {
        Self::new()
    }
}

impl HandleTable {
    pub fn new() -> HandleTable {
        HandleTable {
            handles: DashMap::new(),
            next_fh: AtomicU64::new(1),
        }
    }

    pub(crate) fn insert(&self, path: &str, list: BlockList, etag: Option<Etag>) -> FH {
        let fh = self.next_fh.fetch_add(1, Ordering::SeqCst);
        self.handles.insert(
            fh,
            Arc::new(FileHandle {
                fh,
                path: path.to_string(),
                state: Mutex::new(HandleState { list, etag }),
            }),
        );
        fh
    }

    pub fn get(&self, fh: FH) -> Option<Arc<FileHandle>> {
        self.handles.get(&fh).map(|h| h.value().clone())
    }

    pub fn remove(&self, fh: FH) -> Option<Arc<FileHandle>> {
        self.handles.remove(&fh).map(|(_, h)| h)
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }
}
