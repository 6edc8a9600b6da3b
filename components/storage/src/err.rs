use snafu::{Location, Snafu};

#[derive(Snafu, Debug)]
#[snafu(visibility(pub))]
pub enum Error {
    #[snafu(display("object store operation failed"))]
    Store {
        source: tsumiki_store::Error,
        #[snafu(implicit)]
        location: Location,
    },

    #[snafu(display("block id mint failed"))]
    Mint {
        source: tsumiki_types::block_id::Error,
        #[snafu(implicit)]
        location: Location,
    },

    JoinErr {
        source: tokio::task::JoinError,
        #[snafu(implicit)]
        location: Location,
    },

    #[snafu(display("flush cancelled"))]
    Cancelled {
        #[snafu(implicit)]
        location: Location,
    },

    #[snafu(display("server block list is malformed: {reason}"))]
    MalformedBlockList {
        reason: String,
        #[snafu(implicit)]
        location: Location,
    },

    #[snafu(display("block count {count} exceeds the store limit of {limit}"))]
    BlockLimitExceeded {
        count: usize,
        limit: usize,
        #[snafu(implicit)]
        location: Location,
    },
}

impl Error {
    pub fn as_store(&self) -> Option<&tsumiki_store::Error> {
        match self {
            Error::Store { source, .. } => Some(source),
            _ => None,
        }
    }

    pub fn is_not_found(&self) -> bool {
        self.as_store().map(|e| e.is_not_found()).unwrap_or(false)
    }
}

pub type Result<T> = std::result::Result<T, Error>;
