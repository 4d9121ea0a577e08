#![forbid(unsafe_code)]
//! Disk-mediated cluster coordination.
//!
//! Nodes sharing one block device agree on lock ownership without any
//! network lock manager. Each node owns one registry, one publish and one
//! vote block in the coordination region and only ever writes those; it
//! learns about the others by reading their blocks.
//!
//! - [`layout`]: block offsets of the region.
//! - [`registry`]: node identities per slot.
//! - [`state`]: the lock descriptor state machine.
//! - [`board`]: newest-wins view of publish records.
//! - [`protocol`]: publish, vote, commit, release.

pub mod board;
pub mod layout;
pub mod protocol;
pub mod registry;
pub mod state;

pub use board::PublishBoard;
pub use layout::DlmLayout;
pub use protocol::{ClusterNode, LockRequest, VotePolicy, VoteTally};
pub use registry::{NodeIdentity, NodeRegistry};
pub use state::LockState;

use cfs_block::BlockDevice;
use cfs_error::{CfsError, Result};
use cfs_ondisk::{NodeConfigHeader, ParseResultExt, PublishRecord, VoteRecord};
use cfs_types::{BlockNumber, ParseError};
use tracing::debug;

pub(crate) fn read_record<T>(
    dev: &dyn BlockDevice,
    block: BlockNumber,
    parse: impl FnOnce(&[u8]) -> std::result::Result<T, ParseError>,
) -> Result<T> {
    let buf = dev.read_block(block)?;
    parse(buf.as_slice()).at_block(block.0)
}

pub(crate) fn write_record(
    dev: &dyn BlockDevice,
    block: BlockNumber,
    write: impl FnOnce(&mut [u8]) -> std::result::Result<(), ParseError>,
) -> Result<()> {
    let mut buf = vec![0_u8; dev.block_size() as usize];
    write(&mut buf).map_err(|e| CfsError::Format(format!("encoding block {block}: {e}")))?;
    dev.write_block(block, &buf)
}

/// Write a fresh coordination region: empty header, staging block and
/// registry, unmounted publish records and blank votes.
pub fn initialize_region(dev: &dyn BlockDevice, layout: &DlmLayout) -> Result<()> {
    write_record(dev, layout.config_header(), |b| {
        NodeConfigHeader::default().write(b)
    })?;
    write_record(dev, layout.staging(), |b| {
        b.fill(0);
        Ok(())
    })?;
    for slot in layout.slots() {
        write_record(dev, layout.registry_block(slot)?, |b| {
            b.fill(0);
            Ok(())
        })?;
        write_record(dev, layout.publish_block(slot)?, |b| {
            PublishRecord::default().write(b)
        })?;
        write_record(dev, layout.vote_block(slot)?, |b| VoteRecord::default().write(b))?;
    }
    for block in layout.config_lock_blocks() {
        write_record(dev, BlockNumber(block), |b| {
            b.fill(0);
            Ok(())
        })?;
    }
    debug!(
        start = layout.start().0,
        max_nodes = layout.max_nodes(),
        blocks = layout.region_blocks(),
        "initialized coordination region"
    );
    Ok(())
}
