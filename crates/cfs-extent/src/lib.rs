#![forbid(unsafe_code)]
//! Extent lists: validation, traversal and logical-to-physical mapping.
//!
//! An extent list maps logical clusters (`cpos`) to physical blocks. A list
//! of depth 0 holds data extents; deeper lists hold records pointing at
//! extent blocks one level down. Lists live inline in a dinode or inside
//! an extent block.
//!
//! `cfs-ondisk` only checks that the bytes are readable. This crate adds
//! the structural rules (depth bound, non-empty records, strictly
//! increasing non-overlapping `cpos`) and the tree rules enforced during
//! traversal (see [`walker`]).

pub mod walker;

pub use walker::{ExtentWalker, resolve, walk};

use cfs_error::{CfsError, Result};
use cfs_ondisk::extent::{EXTENT_LIST_HEADER_SIZE, EXTENT_REC_SIZE};
use cfs_ondisk::{ExtentList, ExtentRec};
use cfs_types::BlockNumber;
use tracing::{error, trace};

// ── Constants ───────────────────────────────────────────────────────────────

/// Deepest tree accepted. Depth 4 with 4K blocks addresses far more
/// clusters than a 32-bit `cpos` can name.
pub const MAX_TREE_DEPTH: u16 = 4;

// ── Validation ──────────────────────────────────────────────────────────────

fn list_corrupt(block: BlockNumber, detail: String) -> CfsError {
    CfsError::CorruptExtentList {
        block: block.0,
        detail,
    }
}

/// Check the structural rules of one list. `block` is only error context.
pub fn validate(list: &ExtentList, block: BlockNumber) -> Result<()> {
    if list.tree_depth > MAX_TREE_DEPTH {
        error!(
            invariant = "tree_depth<=MAX_TREE_DEPTH",
            block = block.0,
            depth = list.tree_depth,
            "extent_invariant_violation"
        );
        return Err(list_corrupt(
            block,
            format!("tree depth {} exceeds {MAX_TREE_DEPTH}", list.tree_depth),
        ));
    }
    if list.recs.len() > usize::from(list.count) {
        return Err(list_corrupt(
            block,
            format!("{} records exceed capacity {}", list.recs.len(), list.count),
        ));
    }

    let mut prev_end: Option<u64> = None;
    for (i, rec) in list.recs.iter().enumerate() {
        if rec.clusters == 0 {
            error!(
                invariant = "clusters>0",
                block = block.0,
                index = i,
                "extent_invariant_violation"
            );
            return Err(list_corrupt(block, format!("record {i} covers no clusters")));
        }
        if rec.blkno == 0 {
            return Err(list_corrupt(block, format!("record {i} points at block 0")));
        }
        if rec.end_cpos() > u64::from(u32::MAX) + 1 {
            return Err(list_corrupt(
                block,
                format!("record {i} runs past the logical cluster space"),
            ));
        }
        if let Some(end) = prev_end {
            if u64::from(rec.cpos) < end {
                error!(
                    invariant = "cpos strictly increasing and non-overlapping",
                    block = block.0,
                    index = i,
                    cpos = rec.cpos,
                    prev_end = end,
                    "extent_invariant_violation"
                );
                return Err(list_corrupt(
                    block,
                    format!("record {i} at cpos {} overlaps or precedes end {end}", rec.cpos),
                ));
            }
        }
        prev_end = Some(rec.end_cpos());
    }
    Ok(())
}

// ── Codec ───────────────────────────────────────────────────────────────────

/// Decode and validate the list whose header starts at `bytes[0]`.
pub fn decode(bytes: &[u8], block: BlockNumber) -> Result<ExtentList> {
    let list = ExtentList::parse(bytes).map_err(|e| list_corrupt(block, e.to_string()))?;
    validate(&list, block)?;
    trace!(
        block = block.0,
        depth = list.tree_depth,
        records = list.recs.len(),
        "decoded extent list"
    );
    Ok(list)
}

/// [`decode`], additionally requiring the records to cover exactly
/// `expected_clusters` (the owner's recorded size).
pub fn decode_checked(
    bytes: &[u8],
    block: BlockNumber,
    expected_clusters: u64,
) -> Result<ExtentList> {
    let list = decode(bytes, block)?;
    let total = list.total_clusters();
    if total != expected_clusters {
        return Err(list_corrupt(
            block,
            format!("records cover {total} clusters, owner records {expected_clusters}"),
        ));
    }
    Ok(list)
}

/// Encode `list` into `buf`. Unsorted, overlapping or otherwise invalid
/// lists are rejected before any byte is written.
pub fn encode(list: &ExtentList, buf: &mut [u8]) -> Result<()> {
    validate(list, BlockNumber(0))?;
    list.write(buf)
        .map_err(|e| list_corrupt(BlockNumber(0), e.to_string()))
}

/// Encoded length of a list with capacity `count`.
#[must_use]
pub fn encoded_len(count: u16) -> usize {
    EXTENT_LIST_HEADER_SIZE + usize::from(count) * EXTENT_REC_SIZE
}

// ── Mutation ────────────────────────────────────────────────────────────────

/// Append a data extent to a depth-0 list.
///
/// The extent must start at or after the current tail. When it continues
/// the tail both logically and physically the tail grows instead of a new
/// record being used. `blocks_per_cluster` converts cluster counts to
/// block distances.
pub fn append_extent(
    list: &mut ExtentList,
    rec: ExtentRec,
    blocks_per_cluster: u64,
) -> Result<()> {
    if !list.is_leaf() {
        return Err(CfsError::Format(format!(
            "cannot append to an interior list of depth {}",
            list.tree_depth
        )));
    }
    if rec.clusters == 0 || rec.blkno == 0 {
        return Err(CfsError::Format("empty or unplaced extent".into()));
    }

    if let Some(tail) = list.recs.last_mut() {
        let tail_end = tail.end_cpos();
        if u64::from(rec.cpos) < tail_end {
            return Err(CfsError::Format(format!(
                "extent at cpos {} overlaps tail ending at {tail_end}",
                rec.cpos
            )));
        }
        let physical_end = u64::from(tail.clusters)
            .checked_mul(blocks_per_cluster)
            .and_then(|blocks| tail.blkno.checked_add(blocks));
        if u64::from(rec.cpos) == tail_end && physical_end == Some(rec.blkno) {
            if let Some(merged) = tail.clusters.checked_add(rec.clusters) {
                tail.clusters = merged;
                trace!(cpos = tail.cpos, clusters = merged, "merged extent into tail");
                return Ok(());
            }
        }
    }

    if list.recs.len() >= usize::from(list.count) {
        return Err(CfsError::ExtentListFull { count: list.count });
    }
    list.recs.push(rec);
    trace!(
        cpos = rec.cpos,
        clusters = rec.clusters,
        blkno = rec.blkno,
        "appended extent"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn rec(cpos: u32, clusters: u32, blkno: u64) -> ExtentRec {
        ExtentRec {
            cpos,
            clusters,
            blkno,
        }
    }

    fn leaf(recs: Vec<ExtentRec>) -> ExtentList {
        ExtentList {
            tree_depth: 0,
            count: 8,
            recs,
        }
    }

    #[test]
    fn decode_accepts_sorted_list() {
        let list = leaf(vec![rec(0, 4, 100), rec(4, 2, 300), rec(10, 1, 50)]);
        let mut buf = vec![0_u8; encoded_len(8)];
        encode(&list, &mut buf).unwrap();
        assert_eq!(decode(&buf, BlockNumber(7)).unwrap(), list);
        assert_eq!(decode_checked(&buf, BlockNumber(7), 7).unwrap(), list);
    }

    #[test]
    fn size_disagreement_is_corrupt() {
        let list = leaf(vec![rec(0, 4, 100)]);
        let mut buf = vec![0_u8; encoded_len(8)];
        encode(&list, &mut buf).unwrap();
        assert!(matches!(
            decode_checked(&buf, BlockNumber(7), 5),
            Err(CfsError::CorruptExtentList { block: 7, .. })
        ));
    }

    #[test]
    fn encode_rejects_overlap_and_disorder() {
        let mut buf = vec![0xAA_u8; encoded_len(8)];
        let overlapping = leaf(vec![rec(0, 4, 100), rec(3, 2, 300)]);
        assert!(matches!(
            encode(&overlapping, &mut buf),
            Err(CfsError::CorruptExtentList { .. })
        ));
        let unsorted = leaf(vec![rec(8, 1, 100), rec(2, 1, 300)]);
        assert!(encode(&unsorted, &mut buf).is_err());
        // nothing was written
        assert!(buf.iter().all(|b| *b == 0xAA));
    }

    #[test]
    fn decode_rejects_empty_record_and_deep_tree() {
        let mut buf = vec![0_u8; encoded_len(8)];
        let mut list = leaf(vec![rec(0, 1, 100)]);
        list.write(&mut buf).unwrap();
        // clusters = 0 in record 0
        buf[EXTENT_LIST_HEADER_SIZE + 4..EXTENT_LIST_HEADER_SIZE + 8].fill(0);
        assert!(matches!(
            decode(&buf, BlockNumber(1)),
            Err(CfsError::CorruptExtentList { .. })
        ));

        list.tree_depth = MAX_TREE_DEPTH + 1;
        list.write(&mut buf).unwrap();
        assert!(decode(&buf, BlockNumber(1)).is_err());
    }

    #[test]
    fn decode_maps_header_errors() {
        let mut buf = vec![0_u8; 48];
        buf[2] = 1; // count
        buf[4] = 2; // next_free_rec
        let err = decode(&buf, BlockNumber(9)).unwrap_err();
        match err {
            CfsError::CorruptExtentList { block, detail } => {
                assert_eq!(block, 9);
                assert!(detail.contains("l_next_free_rec"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn append_merges_contiguous_tail() {
        let mut list = ExtentList::empty(2);
        append_extent(&mut list, rec(0, 2, 64), 8).unwrap();
        append_extent(&mut list, rec(2, 3, 80), 8).unwrap();
        assert_eq!(list.recs, vec![rec(0, 5, 64)]);

        // logically contiguous, physically not
        append_extent(&mut list, rec(5, 1, 400), 8).unwrap();
        assert_eq!(list.recs.len(), 2);

        let err = append_extent(&mut list, rec(20, 1, 900), 8).unwrap_err();
        assert!(matches!(err, CfsError::ExtentListFull { count: 2 }));
        // a merge still works on a full list
        append_extent(&mut list, rec(6, 1, 408), 8).unwrap();
        assert_eq!(list.recs[1], rec(5, 2, 400));
    }

    #[test]
    fn append_rejects_overlap_and_interior() {
        let mut list = leaf(vec![rec(0, 4, 100)]);
        assert!(matches!(
            append_extent(&mut list, rec(2, 1, 500), 1),
            Err(CfsError::Format(_))
        ));
        list.tree_depth = 1;
        assert!(append_extent(&mut list, rec(10, 1, 500), 1).is_err());
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        #[test]
        fn appended_lists_always_validate_and_decode(
            steps in proptest::collection::vec((0_u32..4, 1_u32..6, any::<bool>()), 1..40),
        ) {
            let mut list = ExtentList::empty(12);
            let mut cpos = 0_u32;
            let mut next_block = 1000_u64;
            for (gap, clusters, contiguous) in steps {
                cpos += gap;
                if !contiguous {
                    next_block += 50;
                }
                match append_extent(&mut list, rec(cpos, clusters, next_block), 1) {
                    Ok(()) | Err(CfsError::ExtentListFull { .. }) => {}
                    Err(other) => prop_assert!(false, "unexpected error {other:?}"),
                }
                cpos += clusters;
                next_block += u64::from(clusters);
            }
            let mut buf = vec![0_u8; encoded_len(12)];
            encode(&list, &mut buf).unwrap();
            prop_assert_eq!(decode(&buf, BlockNumber(3)).unwrap(), list);
        }
    }
}
