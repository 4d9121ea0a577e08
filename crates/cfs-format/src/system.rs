//! The system file table.
//!
//! Global files exist once per volume; per-slot files exist once for every
//! node slot and carry the slot in their name (`journal:0003`). The table
//! order is the order in which [`layout`](crate::layout()) places them.

use cfs_ondisk::InodeFlags;
use cfs_ondisk::dinode::{S_IFDIR, S_IFREG};
use cfs_types::NodeSlot;
use serde::{Deserialize, Serialize};

/// What a system file holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SystemFileKind {
    /// Plain file or directory with an extent list.
    Other,
    /// Chain-allocated suballocator (inodes or extent blocks).
    Chain,
    /// The global cluster bitmap.
    Cluster,
    /// Coordination region: node registry, publish and vote blocks.
    Dlm,
    /// One heartbeat block per node slot.
    Heartbeat,
    Journal,
    /// Node-local window onto the global bitmap.
    LocalAlloc,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SystemFileInfo {
    pub name: &'static str,
    pub kind: SystemFileKind,
    pub global: bool,
    pub mode: u16,
}

const FILE_MODE: u16 = S_IFREG | 0o644;
const DIR_MODE: u16 = S_IFDIR | 0o755;

pub const SYSTEM_FILES: &[SystemFileInfo] = &[
    SystemFileInfo {
        name: "bad_blocks",
        kind: SystemFileKind::Other,
        global: true,
        mode: FILE_MODE,
    },
    SystemFileInfo {
        name: "global_inode_alloc",
        kind: SystemFileKind::Chain,
        global: true,
        mode: FILE_MODE,
    },
    SystemFileInfo {
        name: "dlm",
        kind: SystemFileKind::Dlm,
        global: true,
        mode: FILE_MODE,
    },
    SystemFileInfo {
        name: "heartbeat",
        kind: SystemFileKind::Heartbeat,
        global: true,
        mode: FILE_MODE,
    },
    SystemFileInfo {
        name: "global_bitmap",
        kind: SystemFileKind::Cluster,
        global: true,
        mode: FILE_MODE,
    },
    SystemFileInfo {
        name: "orphan_dir",
        kind: SystemFileKind::Other,
        global: true,
        mode: DIR_MODE,
    },
    SystemFileInfo {
        name: "extent_alloc",
        kind: SystemFileKind::Chain,
        global: false,
        mode: FILE_MODE,
    },
    SystemFileInfo {
        name: "inode_alloc",
        kind: SystemFileKind::Chain,
        global: false,
        mode: FILE_MODE,
    },
    SystemFileInfo {
        name: "journal",
        kind: SystemFileKind::Journal,
        global: false,
        mode: FILE_MODE,
    },
    SystemFileInfo {
        name: "local_alloc",
        kind: SystemFileKind::LocalAlloc,
        global: false,
        mode: FILE_MODE,
    },
];

impl SystemFileInfo {
    /// Table entry named `base` (without any slot suffix).
    #[must_use]
    pub fn find(base: &str) -> Option<&'static Self> {
        SYSTEM_FILES.iter().find(|info| info.name == base)
    }

    #[must_use]
    pub fn is_dir(&self) -> bool {
        self.mode & S_IFDIR == S_IFDIR
    }

    /// Dinode flags of files of this kind.
    #[must_use]
    pub fn flags(&self) -> InodeFlags {
        let base = InodeFlags::VALID | InodeFlags::SYSTEM;
        base | match self.kind {
            SystemFileKind::Other => InodeFlags::empty(),
            SystemFileKind::Chain => InodeFlags::CHAIN,
            SystemFileKind::Cluster => InodeFlags::BITMAP | InodeFlags::CHAIN,
            SystemFileKind::Dlm => InodeFlags::DLM,
            SystemFileKind::Heartbeat => InodeFlags::HEARTBEAT,
            SystemFileKind::Journal => InodeFlags::JOURNAL,
            SystemFileKind::LocalAlloc => InodeFlags::BITMAP | InodeFlags::LOCAL_ALLOC,
        }
    }
}

/// One concrete system file: a table entry, bound to a slot if per-slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SystemFile {
    pub info: &'static SystemFileInfo,
    pub slot: Option<NodeSlot>,
}

impl SystemFile {
    /// Directory entry name: `journal:0003` for per-slot files.
    #[must_use]
    pub fn name(&self) -> String {
        match self.slot {
            Some(slot) => format!("{}:{:04}", self.info.name, slot.0),
            None => self.info.name.to_owned(),
        }
    }

    /// Inverse of [`name`](Self::name).
    #[must_use]
    pub fn parse(name: &str) -> Option<Self> {
        match name.split_once(':') {
            Some((base, slot)) => {
                let info = SystemFileInfo::find(base).filter(|i| !i.global)?;
                if slot.len() != 4 {
                    return None;
                }
                let slot = slot.parse::<u16>().ok()?;
                Some(Self {
                    info,
                    slot: Some(NodeSlot(slot)),
                })
            }
            None => {
                let info = SystemFileInfo::find(name).filter(|i| i.global)?;
                Some(Self { info, slot: None })
            }
        }
    }
}

/// Every system file of a volume with `max_nodes` slots, in table order;
/// each per-slot entry is expanded for slots `0..max_nodes`.
#[must_use]
pub fn system_files(max_nodes: u16) -> Vec<SystemFile> {
    let mut files = Vec::new();
    for info in SYSTEM_FILES {
        if info.global {
            files.push(SystemFile { info, slot: None });
        } else {
            files.extend((0..max_nodes).map(|s| SystemFile {
                info,
                slot: Some(NodeSlot(s)),
            }));
        }
    }
    files
}
