#![forbid(unsafe_code)]
//! Volume formatting.
//!
//! - [`system`]: the system file table and slot-qualified names.
//! - [`layout`](mod@layout): pure, deterministic placement of every structure.
//! - [`write`]: puts a computed layout on a device.
//!
//! ```text
//! block 0..2   leading space
//! block 2      superblock
//! fcg          group 0 descriptor (first cluster boundary after the superblock)
//! fcg+1 clu.   system group: global_inode_alloc descriptor + system dinodes
//! ...          directory, coordination, heartbeat, journal, local-alloc runs
//! ```

pub mod layout;
pub mod system;
pub mod write;

pub use layout::{BitInfo, FsLayout, Geometry, SystemFileRecord, layout};
pub use system::{SYSTEM_FILES, SystemFile, SystemFileInfo, SystemFileKind, system_files};
pub use write::format_device;

use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

/// Options for [`format_device`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FormatOptions {
    pub block_size: u32,
    pub cluster_size: u32,
    /// Node slots; sizes the coordination region and per-slot files.
    pub max_nodes: u16,
    /// Per-slot journal bytes. `None` picks a share of the volume.
    pub journal_size: Option<u64>,
    /// Bytes of the device to use. `None` uses all of it.
    pub volume_size: Option<u64>,
    pub label: String,
    /// `None` derives one from the label and format time.
    pub uuid: Option<[u8; 16]>,
    /// Seconds since the epoch stamped into every dinode.
    pub format_time: u64,
}

impl Default for FormatOptions {
    fn default() -> Self {
        Self {
            block_size: 4096,
            cluster_size: 4096,
            max_nodes: 4,
            journal_size: None,
            volume_size: None,
            label: String::new(),
            uuid: None,
            format_time: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map_or(0, |d| d.as_secs()),
        }
    }
}
