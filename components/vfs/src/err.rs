use snafu::{Location, Snafu};

use tsumiki_common::FH;
use tsumiki_types::{Errno, ToErrno};

#[derive(Snafu, Debug)]
#[snafu(visibility(pub))]
pub enum Error {
    #[snafu(display("object store failed"))]
    Store {
        source: tsumiki_store::Error,
        #[snafu(implicit)]
        location: Location,
    },

    #[snafu(display("write pipeline failed"))]
    Storage {
        source: tsumiki_storage::Error,
        #[snafu(implicit)]
        location: Location,
    },

    #[snafu(display("bad file handle {fh}"))]
    BadHandle {
        fh: FH,
        #[snafu(implicit)]
        location: Location,
    },

    #[snafu(display("read at {offset} is at or past the end of file ({size} bytes)"))]
    OutOfRange {
        offset: u64,
        size: u64,
        #[snafu(implicit)]
        location: Location,
    },

    #[snafu(display("`{op}` is not supported by the store"))]
    UnsupportedOp {
        op: String,
        #[snafu(implicit)]
        location: Location,
    },

    LibcError {
        errno: Errno,
        #[snafu(implicit)]
        location: Location,
    },
}

pub type Result<T> = std::result::Result<T, Error>;

/// Store errors translate exactly once, here, into the POSIX-ish surface;
/// transport-specific types never leak past this boundary.
fn store_errno(e: &tsumiki_store::Error) -> Errno {
    use tsumiki_store::Error as StoreError;
    match e {
        StoreError::NotFound { .. } => libc::ENOENT,
        StoreError::AlreadyExists { .. } => libc::EEXIST,
        StoreError::PermissionDenied { .. } => libc::EACCES,
        StoreError::Unsupported { .. } => libc::ENOTSUP,
        StoreError::ConditionNotMet { .. } => libc::EIO,
        StoreError::OutOfRange { .. } => libc::ERANGE,
        StoreError::UnknownBlock { .. }
        | StoreError::MixedIdLength { .. }
        | StoreError::Backing { .. } => libc::EIO,
    }
}

impl ToErrno for Error {
    fn to_errno(&self) -> Errno {
        match self {
            Error::Store { source, .. } => store_errno(source),
            Error::Storage { source, .. } => {
                source.as_store().map(store_errno).unwrap_or(libc::EIO)
            }
            Error::BadHandle { .. } => libc::EBADF,
            Error::OutOfRange { .. } => libc::ERANGE,
            Error::UnsupportedOp { .. } => libc::ENOTSUP,
            Error::LibcError { errno, .. } => *errno,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_errors_map_to_posix() {
        let e = Error::Store {
            source: tsumiki_store::Error::NotFound {
                path: "x".into(),
                location: snafu::location!(),
            },
            location: snafu::location!(),
        };
        assert_eq!(e.to_errno(), libc::ENOENT);

        let e = Error::OutOfRange {
            offset: 10,
            size: 5,
            location: snafu::location!(),
        };
        assert_eq!(e.to_errno(), libc::ERANGE);
    }
}
