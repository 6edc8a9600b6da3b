pub const TSUMIKI: &str = "tsumiki";

/// Upper bound for a single block created by this pipeline, unless the
/// configuration lowers it. Mirrors the 8 MiB the service side is tuned for.
pub const DEFAULT_BLOCK_SIZE: usize = 8 << 20; // 8 MiB

pub const MIN_BLOCK_SIZE: usize = 1 << 20; // 1 MiB

/// How many stage uploads a single flush may keep in flight.
pub const DEFAULT_MAX_CONCURRENCY: usize = 32;

/// Raw (pre-encoding) byte length of block identifiers minted for new files.
/// Files opened from an existing block list inherit the length observed there.
pub const DEFAULT_BLOCK_ID_RAW_LEN: u16 = 16;

/// The store rejects commit lists longer than this.
pub const MAX_BLOCKS_PER_OBJECT: usize = 50_000;

pub type BlockIndex = usize;
pub type BlockSize = usize;
pub type FileOffset = u64;

pub type FH = u64;
