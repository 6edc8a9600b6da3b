pub mod block_list;
pub mod err;
pub mod flusher;
pub mod stager;

pub use block_list::{BlockList, SegmentKind, WritePlan};
pub use err::{Error, Result};
pub use flusher::{FlushOptions, Flusher};
pub use stager::Stager;
