#![forbid(unsafe_code)]
//! On-disk record codecs.
//!
//! Pure parsing crate: no I/O, no side effects. Decodes block-sized byte
//! slices into typed records (disk lock descriptors, extent lists and
//! extent blocks, group descriptors, chain lists, dinodes, directory
//! entries, and the coordination region's config, publish and vote
//! records) and encodes them back in place.

pub mod chain;
pub mod dinode;
pub mod dir;
pub mod dlm;
pub mod extent;
pub mod group;
pub mod lock;

pub use chain::{ChainList, ChainRec};
pub use dinode::{Dinode, DinodeBody, InodeFlags, LocalAllocHeader, SuperblockInfo};
pub use dir::{DirEntry, FileType};
pub use dlm::{
    NodeConfigEntry, NodeConfigHeader, PublishRecord, RequestFlags, VoteFlags, VoteRecord,
};
pub use extent::{ExtentBlock, ExtentList, ExtentRec};
pub use group::GroupDesc;
pub use lock::{DiskLock, LockLevel, NodeMap};

use cfs_error::CfsError;
use cfs_types::ParseError;

/// Attach block context to a parse failure.
pub trait ParseResultExt<T> {
    /// Convert a `ParseError` into `CfsError::Corruption` for `block`.
    fn at_block(self, block: u64) -> Result<T, CfsError>;
}

impl<T> ParseResultExt<T> for Result<T, ParseError> {
    fn at_block(self, block: u64) -> Result<T, CfsError> {
        self.map_err(|err| CfsError::Corruption {
            block,
            detail: err.to_string(),
        })
    }
}
