//! Lazy, cycle-detecting extent tree traversal.
//!
//! [`ExtentWalker`] yields data extents in `cpos` order, reading extent
//! blocks only when the traversal reaches them. It fails with
//! `CorruptExtentTree` when
//!
//! - an extent block is reached twice,
//! - a child's depth is not its parent's depth minus one,
//! - a child's records fall outside the parent record's range,
//! - a leaf's `next_leaf_blk` points backward or disagrees with index
//!   order.
//!
//! After the first error the walker yields nothing more until
//! [`ExtentWalker::seek`] restarts it.

use crate::validate;
use cfs_block::BlockDevice;
use cfs_error::{CfsError, Result};
use cfs_ondisk::{ExtentBlock, ExtentList, ExtentRec};
use cfs_types::BlockNumber;
use std::collections::BTreeSet;
use std::ops::ControlFlow;
use tracing::{error, trace};

fn tree_corrupt(block: u64, detail: String) -> CfsError {
    error!(block, detail = %detail, "extent_tree_corruption");
    CfsError::CorruptExtentTree { block, detail }
}

#[derive(Debug)]
struct Frame {
    block: u64,
    depth: u16,
    recs: Vec<ExtentRec>,
    pos: usize,
}

/// Iterator over the data extents of one tree.
pub struct ExtentWalker<'a> {
    dev: &'a dyn BlockDevice,
    owner: BlockNumber,
    root: ExtentList,
    stack: Vec<Frame>,
    visited: BTreeSet<u64>,
    /// Previous leaf block and its `next_leaf_blk`.
    prev_leaf: Option<(u64, u64)>,
    last_end: u64,
    from_cpos: u32,
    failed: bool,
}

impl<'a> ExtentWalker<'a> {
    /// Walker over the tree rooted in `root`, the list stored in block
    /// `owner` (a dinode or extent block).
    pub fn new(dev: &'a dyn BlockDevice, owner: BlockNumber, root: &ExtentList) -> Result<Self> {
        validate(root, owner)?;
        let mut walker = Self {
            dev,
            owner,
            root: root.clone(),
            stack: Vec::new(),
            visited: BTreeSet::new(),
            prev_leaf: None,
            last_end: 0,
            from_cpos: 0,
            failed: false,
        };
        walker.seek(0);
        Ok(walker)
    }

    /// Restart the traversal at the first extent ending after `cpos`.
    pub fn seek(&mut self, cpos: u32) {
        self.stack.clear();
        self.stack.push(Frame {
            block: self.owner.0,
            depth: self.root.tree_depth,
            recs: self.root.recs.clone(),
            pos: 0,
        });
        self.visited.clear();
        self.visited.insert(self.owner.0);
        self.prev_leaf = None;
        self.last_end = 0;
        self.from_cpos = cpos;
        self.failed = false;
    }

    fn descend(&mut self, parent: &ExtentRec, parent_depth: u16) -> Result<Frame> {
        let blkno = parent.blkno;
        if !self.visited.insert(blkno) {
            return Err(tree_corrupt(blkno, "extent block reached twice".into()));
        }
        if blkno >= self.dev.block_count() {
            return Err(tree_corrupt(blkno, "extent block past end of device".into()));
        }

        let buf = self.dev.read_block(BlockNumber(blkno))?;
        let eb =
            ExtentBlock::parse(buf.as_slice()).map_err(|e| tree_corrupt(blkno, e.to_string()))?;
        if eb.blkno != blkno {
            return Err(tree_corrupt(
                blkno,
                format!("extent block records block number {}", eb.blkno),
            ));
        }
        validate(&eb.list, BlockNumber(blkno))?;

        let expected_depth = parent_depth - 1;
        if eb.list.tree_depth != expected_depth {
            return Err(tree_corrupt(
                blkno,
                format!(
                    "child depth {} under parent depth {parent_depth}",
                    eb.list.tree_depth
                ),
            ));
        }
        if let (Some(first), Some(last)) = (eb.list.recs.first(), eb.list.recs.last()) {
            if first.cpos < parent.cpos || last.end_cpos() > parent.end_cpos() {
                return Err(tree_corrupt(
                    blkno,
                    format!(
                        "child covers [{}, {}) outside parent record [{}, {})",
                        first.cpos,
                        last.end_cpos(),
                        parent.cpos,
                        parent.end_cpos()
                    ),
                ));
            }
        }

        if eb.list.is_leaf() {
            self.check_leaf_link(blkno, eb.next_leaf_blk)?;
        }

        trace!(
            block = blkno,
            depth = eb.list.tree_depth,
            records = eb.list.recs.len(),
            "descend"
        );
        Ok(Frame {
            block: blkno,
            depth: eb.list.tree_depth,
            recs: eb.list.recs,
            pos: 0,
        })
    }

    fn check_leaf_link(&mut self, blkno: u64, next_leaf: u64) -> Result<()> {
        if next_leaf != 0 && self.visited.contains(&next_leaf) {
            return Err(tree_corrupt(
                blkno,
                format!("next_leaf_blk {next_leaf} points backward"),
            ));
        }
        if let Some((prev, prev_next)) = self.prev_leaf {
            if prev_next != blkno {
                return Err(tree_corrupt(
                    prev,
                    format!(
                        "next_leaf_blk {prev_next} disagrees with index order (next leaf is {blkno})"
                    ),
                ));
            }
        }
        self.prev_leaf = Some((blkno, next_leaf));
        Ok(())
    }

    fn fail(&mut self, err: CfsError) -> Option<Result<ExtentRec>> {
        self.failed = true;
        self.stack.clear();
        Some(Err(err))
    }
}

impl Iterator for ExtentWalker<'_> {
    type Item = Result<ExtentRec>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        loop {
            let Some(frame) = self.stack.last_mut() else {
                if let Some((last, next)) = self.prev_leaf.take() {
                    if next != 0 {
                        let err =
                            tree_corrupt(last, format!("last leaf has next_leaf_blk {next}"));
                        return self.fail(err);
                    }
                }
                return None;
            };
            if frame.pos >= frame.recs.len() {
                self.stack.pop();
                continue;
            }
            let rec = frame.recs[frame.pos];
            frame.pos += 1;
            let (depth, block) = (frame.depth, frame.block);

            if depth == 0 {
                if u64::from(rec.cpos) < self.last_end {
                    let err = tree_corrupt(
                        block,
                        format!("extent at cpos {} precedes end {}", rec.cpos, self.last_end),
                    );
                    return self.fail(err);
                }
                self.last_end = rec.end_cpos();
                if rec.end_cpos() <= u64::from(self.from_cpos) {
                    continue;
                }
                return Some(Ok(rec));
            }

            // Subtrees wholly before the seek point are never read.
            if rec.end_cpos() <= u64::from(self.from_cpos) {
                continue;
            }
            match self.descend(&rec, depth) {
                Ok(child) => self.stack.push(child),
                Err(err) => return self.fail(err),
            }
        }
    }
}

/// Visit every data extent of the tree rooted in `root` in `cpos` order.
/// Returns the number of extents visited; `visit` may stop early.
pub fn walk<F>(
    dev: &dyn BlockDevice,
    owner: BlockNumber,
    root: &ExtentList,
    mut visit: F,
) -> Result<usize>
where
    F: FnMut(&ExtentRec) -> ControlFlow<()>,
{
    let mut count = 0_usize;
    for rec in ExtentWalker::new(dev, owner, root)? {
        let rec = rec?;
        count += 1;
        if visit(&rec).is_break() {
            break;
        }
    }
    Ok(count)
}

/// Physical block backing logical cluster `cpos`, or `None` for a hole.
pub fn resolve(
    dev: &dyn BlockDevice,
    owner: BlockNumber,
    root: &ExtentList,
    cpos: u32,
    blocks_per_cluster: u64,
) -> Result<Option<BlockNumber>> {
    let mut walker = ExtentWalker::new(dev, owner, root)?;
    walker.seek(cpos);
    let Some(rec) = walker.next().transpose()? else {
        return Ok(None);
    };
    if rec.cpos > cpos {
        return Ok(None);
    }
    let offset = u64::from(cpos - rec.cpos) * blocks_per_cluster;
    Ok(rec.blkno.checked_add(offset).map(BlockNumber))
}
