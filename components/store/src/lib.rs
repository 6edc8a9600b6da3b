use std::{fmt, ops::Range, str::FromStr, sync::Arc};

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

use tsumiki_types::block_id::BlockId;

pub mod error;
pub mod mem;

pub use error::{Error, Result};

/// Opaque server-side version token, compared on conditional commits.
pub type Etag = String;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccessTier {
    Hot,
    Cool,
    Cold,
    Archive,
}

impl FromStr for AccessTier {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "hot" => Ok(AccessTier::Hot),
            "cool" => Ok(AccessTier::Cool),
            "cold" => Ok(AccessTier::Cold),
            "archive" => Ok(AccessTier::Archive),
            other => Err(format!("unknown access tier `{other}`")),
        }
    }
}

/// POSIX-style access document, carried opaquely: the pipeline only ever
/// round-trips it across a commit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Acl(pub String);

impl Default for Acl {
    fn default() -> Self {
        Acl("user::rw-,group::r--,other::r--".to_string())
    }
}

impl Acl {
    pub fn from_mode(mode: u32) -> Acl {
        let rwx = |bits: u32| {
            let mut s = String::with_capacity(3);
            s.push(if bits & 0b100 != 0 { 'r' } else { '-' });
            s.push(if bits & 0b010 != 0 { 'w' } else { '-' });
            s.push(if bits & 0b001 != 0 { 'x' } else { '-' });
            s
        };
        Acl(format!(
            "user::{},group::{},other::{}",
            rwx(mode >> 6),
            rwx(mode >> 3),
            rwx(mode)
        ))
    }
}

impl fmt::Display for Acl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Customer-provided key material, forwarded opaquely with every request
/// that touches object payloads.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CpkInfo {
    pub key: String,
    pub key_sha256: String,
}

#[derive(Debug, Clone, Default)]
pub struct CommitOptions {
    pub content_type: Option<String>,
    pub tier: Option<AccessTier>,
    /// Conditional commit: reject unless the server object still carries
    /// this etag.
    pub if_match: Option<Etag>,
    pub cpk: Option<CpkInfo>,
}

/// One entry of a committed block list, in object order.
#[derive(Debug, Clone)]
pub struct CommittedBlock {
    pub id: BlockId,
    pub size: u64,
}

#[derive(Debug, Clone)]
pub struct Properties {
    pub size: u64,
    pub etag: Etag,
    pub acl: Option<Acl>,
    /// `None` for objects stored by a whole-object put: such files have
    /// never been blockified.
    pub block_list: Option<Vec<CommittedBlock>>,
}

/// The capability set this pipeline needs from a remote object store.
///
/// Backend variance is expressed per operation: a flat blob store answers
/// `get_acl`/`set_acl` with [`Error::Unsupported`] rather than existing as a
/// separate subtype.
#[async_trait]
pub trait ObjectStore: Send + Sync + 'static {
    /// Idempotently upload `data` under `id` for `path` without altering the
    /// object's current content.
    async fn stage_block(&self, path: &str, id: &BlockId, data: Bytes) -> Result<()>;

    /// Atomically replace `path`'s content with the ordered concatenation of
    /// previously staged (or already committed) `ids`.
    async fn commit_block_list(
        &self,
        path: &str,
        ids: &[BlockId],
        opts: &CommitOptions,
    ) -> Result<Etag>;

    /// Whole-object upload; the resulting object carries no block list.
    async fn put_object(&self, path: &str, data: Bytes, opts: &CommitOptions) -> Result<Etag>;

    /// Raw bytes for a half-open range of the committed object.
    async fn download_range(&self, path: &str, range: Range<u64>) -> Result<Bytes>;

    async fn get_properties(&self, path: &str) -> Result<Properties>;

    async fn get_acl(&self, path: &str) -> Result<Acl>;

    async fn set_acl(&self, path: &str, acl: &Acl) -> Result<()>;

    async fn delete(&self, path: &str) -> Result<()>;
}

pub type ObjectStoreRef = Arc<dyn ObjectStore>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acl_from_mode() {
        assert_eq!(Acl::from_mode(0o640).0, "user::rw-,group::r--,other::---");
        assert_eq!(Acl::from_mode(0o755).0, "user::rwx,group::r-x,other::r-x");
    }

    #[test]
    fn tier_parses_case_insensitively() {
        assert_eq!("Hot".parse::<AccessTier>().unwrap(), AccessTier::Hot);
        assert_eq!("ARCHIVE".parse::<AccessTier>().unwrap(), AccessTier::Archive);
        assert!("frozen".parse::<AccessTier>().is_err());
    }
}
