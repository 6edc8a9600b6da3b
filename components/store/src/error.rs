use snafu::{Location, Snafu};

#[derive(Snafu, Debug)]
#[snafu(visibility(pub))]
pub enum Error {
    #[snafu(display("object `{path}` does not exist"))]
    NotFound {
        path: String,
        #[snafu(implicit)]
        location: Location,
    },

    #[snafu(display("object `{path}` already exists"))]
    AlreadyExists {
        path: String,
        #[snafu(implicit)]
        location: Location,
    },

    #[snafu(display("access to `{path}` denied"))]
    PermissionDenied {
        path: String,
        #[snafu(implicit)]
        location: Location,
    },

    #[snafu(display("`{op}` is not supported by this store"))]
    Unsupported {
        op: String,
        #[snafu(implicit)]
        location: Location,
    },

    #[snafu(display("commit of `{path}` rejected: expected etag {expected}"))]
    ConditionNotMet {
        path: String,
        expected: String,
        #[snafu(implicit)]
        location: Location,
    },

    #[snafu(display("range {start}..{end} lies outside `{path}` (size {size})"))]
    OutOfRange {
        path: String,
        start: u64,
        end: u64,
        size: u64,
        #[snafu(implicit)]
        location: Location,
    },

    #[snafu(display("commit list for `{path}` names unknown block {id}"))]
    UnknownBlock {
        path: String,
        id: String,
        #[snafu(implicit)]
        location: Location,
    },

    #[snafu(display("commit list for `{path}` mixes id lengths"))]
    MixedIdLength {
        path: String,
        #[snafu(implicit)]
        location: Location,
    },

    #[snafu(display("backing storage failed"))]
    Backing {
        #[snafu(source)]
        error: opendal::Error,
        #[snafu(implicit)]
        location: Location,
    },
}

impl Error {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound { .. })
            || matches!(self, Error::Backing { error, .. }
                if error.kind() == opendal::ErrorKind::NotFound)
    }

    pub fn is_unsupported(&self) -> bool {
        matches!(self, Error::Unsupported { .. })
    }

    /// Whether a retry at the transport layer could have helped. Everything
    /// else is fatal for the flush in progress.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Backing { error, .. } if error.is_temporary())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
