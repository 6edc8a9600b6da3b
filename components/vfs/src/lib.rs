mod config;
mod err;
mod handle;
mod tsumiki;

pub use config::Config;
pub use err::{Error, Result};
pub use handle::{FileHandle, HandleTable};
pub use tsumiki::TsumikiFs;
