use serde::{Deserialize, Serialize};
use tracing::warn;

use tsumiki_common::{DEFAULT_BLOCK_SIZE, DEFAULT_MAX_CONCURRENCY};
use tsumiki_store::{AccessTier, CpkInfo};
use tsumiki_storage::FlushOptions;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct Config {
    /// Upper bound for blocks created by this mount, in MiB.
    pub block_size_mb: usize,
    /// Outstanding stage uploads per flush.
    pub max_concurrency: usize,
    /// Round-trip the object's ACL across every commit.
    pub preserve_acl: bool,
    /// Access tier requested on commit, when the account supports tiering.
    pub default_tier: Option<AccessTier>,
    pub cpk_key: Option<String>,
    pub cpk_key_sha256: Option<String>,
    /// Whether operations the backend cannot express (chmod on a flat blob
    /// store, say) fail with ENOTSUP or silently succeed.
    pub fail_unsupported_op: bool,
    /// Commit conditionally on the last-known etag instead of relying on
    /// the server's last-writer-wins.
    pub use_etag_guard: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            block_size_mb: DEFAULT_BLOCK_SIZE >> 20,
            max_concurrency: DEFAULT_MAX_CONCURRENCY,
            preserve_acl: false,
            default_tier: None,
            cpk_key: None,
            cpk_key_sha256: None,
            fail_unsupported_op: false,
            use_etag_guard: false,
        }
    }
}

impl Config {
    /// Clamp out-of-range values instead of refusing to mount.
    pub fn normalized(mut self) -> Self {
        if self.block_size_mb < 1 {
            warn!("block-size-mb must be at least 1, clamping");
            self.block_size_mb = 1;
        }
        if self.max_concurrency < 1 {
            warn!("max-concurrency must be at least 1, clamping");
            self.max_concurrency = 1;
        }
        self
    }

    pub fn block_size(&self) -> usize {
        self.block_size_mb << 20
    }

    pub fn flush_options(&self) -> FlushOptions {
        FlushOptions {
            preserve_acl: self.preserve_acl,
            use_etag_guard: self.use_etag_guard,
            tier: self.default_tier,
            content_type: None,
            cpk: match (&self.cpk_key, &self.cpk_key_sha256) {
                (Some(key), Some(sha)) => Some(CpkInfo {
                    key: key.clone(),
                    key_sha256: sha.clone(),
                }),
                _ => None,
            },
        }
    }
}
