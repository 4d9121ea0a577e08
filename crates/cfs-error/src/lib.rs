#![forbid(unsafe_code)]
//! Error types for the cluster filesystem tooling.
//!
//! # Error Taxonomy
//!
//! Two layers:
//!
//! | Layer | Type | Crate | Purpose |
//! |-------|------|-------|---------|
//! | Parsing | `ParseError` | `cfs-types` | Byte-level format violations found while decoding a record |
//! | Runtime | `CfsError` | `cfs-error` (this crate) | Allocator, traversal, protocol and device errors |
//!
//! ## Mapping Policy: ParseError → CfsError
//!
//! `cfs-error` does not depend on `cfs-types`. The conversion is done in
//! `cfs-ondisk` (`ParseResultExt::at_block`), where the block being decoded
//! is known:
//!
//! | ParseError Variant | CfsError Variant |
//! |--------------------|------------------|
//! | `InsufficientData` | `Corruption { block, detail }` |
//! | `InvalidSignature` | `Corruption { block, detail }` |
//! | `InvalidField` | `Corruption { block, detail }` |
//! | `IntegerConversion` | `Corruption { block, detail }` |
//!
//! Extent list and extent tree decoding use the dedicated
//! `CorruptExtentList` / `CorruptExtentTree` variants instead.
//!
//! ## errno Mapping
//!
//! Every variant maps to exactly one errno via [`CfsError::to_errno`]. The
//! match is exhaustive so a new variant does not compile until it has one.
//!
//! | Variant | errno |
//! |---------|-------|
//! | `Io` | raw OS error or `EIO` |
//! | `Corruption` | `EIO` |
//! | `CorruptExtentList` | `EIO` |
//! | `CorruptExtentTree` | `EIO` |
//! | `Format` | `EINVAL` |
//! | `Parse` | `EINVAL` |
//! | `InvalidGeometry` | `EINVAL` |
//! | `OutOfSpace` | `ENOSPC` |
//! | `ExtentListFull` | `ENOSPC` |
//! | `DoubleFree` | `EUCLEAN` |
//! | `SlotOccupied` | `EEXIST` |
//! | `NotRegistered` | `ENOENT` |
//! | `NotFound` | `ENOENT` |
//! | `LockDenied` | `EAGAIN` |
//! | `ProtocolTimeout` | `ETIMEDOUT` |
//! | `ReadOnly` | `EROFS` |

use thiserror::Error;

/// Unified runtime error type.
#[derive(Debug, Error)]
pub enum CfsError {
    /// Operating system I/O error (wraps `std::io::Error`).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// On-disk metadata corruption detected at a known block.
    #[error("corrupt metadata at block {block}: {detail}")]
    Corruption { block: u64, detail: String },

    /// Structurally invalid input that is not tied to a block, e.g. a
    /// malformed request or a device that does not hold this filesystem.
    #[error("invalid on-disk format: {0}")]
    Format(String),

    /// Parse-layer error surfaced without block context.
    #[error("parse error: {0}")]
    Parse(String),

    /// Geometry out of range: block or cluster size, node count, volume size.
    #[error("invalid geometry: {0}")]
    InvalidGeometry(String),

    /// No group of the bitmap holds the requested contiguous run.
    #[error("no space left on device")]
    OutOfSpace,

    /// Release of a bit that is already clear. The bitmap was not modified.
    #[error("double free: bit {bit} is already clear")]
    DoubleFree { bit: u64 },

    /// Extent list violates its structural rules.
    #[error("corrupt extent list at block {block}: {detail}")]
    CorruptExtentList { block: u64, detail: String },

    /// Extent tree traversal found a cycle or inconsistent depth.
    #[error("corrupt extent tree at block {block}: {detail}")]
    CorruptExtentTree { block: u64, detail: String },

    /// Inline extent list has no free record slot.
    #[error("extent list full ({count} records)")]
    ExtentListFull { count: u16 },

    /// Node registry slot holds a different node.
    #[error("node slot {slot} is occupied by another node")]
    SlotOccupied { slot: u16 },

    /// The local node has no registry entry.
    #[error("node is not registered")]
    NotRegistered,

    /// Another node holds or won the lock.
    #[error("lock {lock_id:#x} denied by node {node}")]
    LockDenied { lock_id: u64, node: u16 },

    /// Not every required voter answered before the deadline.
    #[error("lock {lock_id:#x}: no unanimous response for seq {seq_num} before deadline")]
    ProtocolTimeout { lock_id: u64, seq_num: u64 },

    /// Named system file or directory entry not found.
    #[error("not found: {0}")]
    NotFound(String),

    /// Session was opened read-only and a write was attempted.
    #[error("read-only filesystem")]
    ReadOnly,
}

impl CfsError {
    /// Convert this error into a POSIX errno.
    ///
    /// `DoubleFree` maps to `EUCLEAN`: releasing a clear bit means the
    /// caller's view of the bitmap and the bitmap disagree.
    #[must_use]
    pub fn to_errno(&self) -> libc::c_int {
        match self {
            Self::Io(err) => err.raw_os_error().unwrap_or(libc::EIO),
            Self::Corruption { .. }
            | Self::CorruptExtentList { .. }
            | Self::CorruptExtentTree { .. } => libc::EIO,
            Self::Format(_) | Self::Parse(_) | Self::InvalidGeometry(_) => libc::EINVAL,
            Self::OutOfSpace | Self::ExtentListFull { .. } => libc::ENOSPC,
            Self::DoubleFree { .. } => libc::EUCLEAN,
            Self::SlotOccupied { .. } => libc::EEXIST,
            Self::NotRegistered | Self::NotFound(_) => libc::ENOENT,
            Self::LockDenied { .. } => libc::EAGAIN,
            Self::ProtocolTimeout { .. } => libc::ETIMEDOUT,
            Self::ReadOnly => libc::EROFS,
        }
    }

    /// Errors that a lock request may retry after backing off.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::LockDenied { .. } | Self::ProtocolTimeout { .. })
    }
}

/// Result alias using `CfsError`.
pub type Result<T> = std::result::Result<T, CfsError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errno_mapping_covers_all_variants() {
        let cases: Vec<(CfsError, libc::c_int)> = vec![
            (CfsError::Io(std::io::Error::other("test")), libc::EIO),
            (
                CfsError::Corruption {
                    block: 0,
                    detail: "test".into(),
                },
                libc::EIO,
            ),
            (CfsError::Format("test".into()), libc::EINVAL),
            (CfsError::Parse("test".into()), libc::EINVAL),
            (CfsError::InvalidGeometry("max_nodes=0".into()), libc::EINVAL),
            (CfsError::OutOfSpace, libc::ENOSPC),
            (CfsError::DoubleFree { bit: 9 }, libc::EUCLEAN),
            (
                CfsError::CorruptExtentList {
                    block: 1,
                    detail: "test".into(),
                },
                libc::EIO,
            ),
            (
                CfsError::CorruptExtentTree {
                    block: 1,
                    detail: "test".into(),
                },
                libc::EIO,
            ),
            (CfsError::ExtentListFull { count: 4 }, libc::ENOSPC),
            (CfsError::SlotOccupied { slot: 2 }, libc::EEXIST),
            (CfsError::NotRegistered, libc::ENOENT),
            (
                CfsError::LockDenied {
                    lock_id: 0x40,
                    node: 2,
                },
                libc::EAGAIN,
            ),
            (
                CfsError::ProtocolTimeout {
                    lock_id: 0x40,
                    seq_num: 7,
                },
                libc::ETIMEDOUT,
            ),
            (CfsError::NotFound("journal:0000".into()), libc::ENOENT),
            (CfsError::ReadOnly, libc::EROFS),
        ];

        for (error, expected_errno) in &cases {
            assert_eq!(
                error.to_errno(),
                *expected_errno,
                "wrong errno for {error:?}",
            );
        }
    }

    #[test]
    fn io_error_preserves_raw_os_error() {
        let raw = std::io::Error::from_raw_os_error(libc::EPERM);
        assert_eq!(CfsError::Io(raw).to_errno(), libc::EPERM);
    }

    #[test]
    fn display_formatting() {
        let err = CfsError::Corruption {
            block: 42,
            detail: "bad signature".into(),
        };
        assert_eq!(err.to_string(), "corrupt metadata at block 42: bad signature");

        let denied = CfsError::LockDenied {
            lock_id: 0x1a0,
            node: 2,
        };
        assert_eq!(denied.to_string(), "lock 0x1a0 denied by node 2");

        let df = CfsError::DoubleFree { bit: 17 };
        assert_eq!(df.to_string(), "double free: bit 17 is already clear");
    }

    #[test]
    fn only_protocol_outcomes_are_retryable() {
        assert!(
            CfsError::LockDenied {
                lock_id: 1,
                node: 0
            }
            .is_retryable()
        );
        assert!(
            CfsError::ProtocolTimeout {
                lock_id: 1,
                seq_num: 2
            }
            .is_retryable()
        );
        assert!(!CfsError::OutOfSpace.is_retryable());
        assert!(!CfsError::DoubleFree { bit: 0 }.is_retryable());
    }
}
