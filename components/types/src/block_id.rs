use std::fmt::{Display, Formatter};

use base64::{engine::general_purpose::STANDARD, Engine};
use rand::{rngs::OsRng, TryRngCore};
use snafu::{ensure, Location, ResultExt, Snafu};

use tsumiki_common::DEFAULT_BLOCK_ID_RAW_LEN;

#[derive(Snafu, Debug)]
#[snafu(visibility(pub))]
pub enum Error {
    #[snafu(display("system entropy source failed"))]
    EntropyExhausted {
        #[snafu(implicit)]
        location: Location,
    },

    #[snafu(display("block id `{id}` is not valid base64"))]
    MalformedId {
        id: String,
        source: base64::DecodeError,
        #[snafu(implicit)]
        location: Location,
    },

    #[snafu(display("block id must carry at least one byte"))]
    EmptyId {
        #[snafu(implicit)]
        location: Location,
    },
}

pub type Result<T> = std::result::Result<T, Error>;

/// Name of one uploaded block, as the object store sees it.
///
/// The store only accepts commit lists whose entries all have the same
/// encoded length, so the raw byte length is fixed per file: either the
/// length observed in the file's existing block list, or
/// [`DEFAULT_BLOCK_ID_RAW_LEN`] for files that have never been blockified.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlockId {
    encoded: String,
    raw_len: u16,
}

impl BlockId {
    /// Mint a fresh identifier of `raw_len` random bytes, wrapped in the
    /// store's printable encoding. Ids minted with equal `raw_len` encode to
    /// equal length.
    pub fn mint(raw_len: u16) -> Result<BlockId> {
        ensure!(raw_len > 0, EmptyIdSnafu);
        let mut raw = vec![0u8; raw_len as usize];
        OsRng
            .try_fill_bytes(&mut raw)
            .map_err(|_| EntropyExhaustedSnafu.build())?;
        Ok(BlockId {
            encoded: STANDARD.encode(&raw),
            raw_len,
        })
    }

    pub fn mint_default() -> Result<BlockId> {
        Self::mint(DEFAULT_BLOCK_ID_RAW_LEN)
    }

    /// Accept an identifier observed in a server-side block list.
    pub fn from_encoded(encoded: &str) -> Result<BlockId> {
        let raw = STANDARD
            .decode(encoded)
            .context(MalformedIdSnafu { id: encoded })?;
        ensure!(!raw.is_empty(), EmptyIdSnafu);
        Ok(BlockId {
            encoded: encoded.to_string(),
            raw_len: raw.len() as u16,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.encoded
    }

    pub fn raw_len(&self) -> u16 {
        self.raw_len
    }

    /// Encoded length (with padding) produced by [`BlockId::mint`] for a
    /// given raw length.
    pub const fn encoded_len(raw_len: u16) -> usize {
        (raw_len as usize).div_ceil(3) * 4
    }
}

impl Display for BlockId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.encoded)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mint_produces_fixed_length() {
        let ids = (0..64)
            .map(|_| BlockId::mint(16).unwrap())
            .collect::<Vec<_>>();
        for id in &ids {
            assert_eq!(id.as_str().len(), BlockId::encoded_len(16));
            assert_eq!(id.raw_len(), 16);
        }
    }

    #[test]
    fn mint_does_not_repeat() {
        let mut seen = std::collections::HashSet::new();
        for _ in 0..256 {
            assert!(seen.insert(BlockId::mint(16).unwrap()));
        }
    }

    #[test]
    fn round_trips_through_encoding() {
        let id = BlockId::mint(32).unwrap();
        let back = BlockId::from_encoded(id.as_str()).unwrap();
        assert_eq!(back, id);
        assert_eq!(back.raw_len(), 32);
    }

    #[test]
    fn rejects_garbage() {
        assert!(BlockId::from_encoded("not base64 at all!").is_err());
        assert!(BlockId::from_encoded("").is_err());
        assert!(BlockId::mint(0).is_err());
    }

    #[test]
    fn encoded_len_matches_encoder() {
        for raw_len in [1u16, 2, 3, 15, 16, 17, 32, 64] {
            let id = BlockId::mint(raw_len).unwrap();
            assert_eq!(id.as_str().len(), BlockId::encoded_len(raw_len));
        }
    }
}
