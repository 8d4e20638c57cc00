use thiserror::Error;

/// Errors raised by the on-disk engine.
///
/// Device and geometry faults abort the current operation; FAT anomalies
/// are repaired interactively in fsck and reported-and-skipped in the
/// other modes. Per-entry faults never escape the entry that raised them.
#[derive(Error, Debug)]
pub enum FatxError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Unreachable block at 0x{0:016X}")]
    DeviceUnreachable(u64),

    #[error("Short transfer at 0x{offset:016X} ({size} bytes)")]
    DeviceShort { offset: u64, size: usize },

    #[error("{kind} out of bounds (0x{value:08X})")]
    OutOfBounds { kind: &'static str, value: u64 },

    #[error("Cluster value in FAT out of bounds (0x{value:08X}) for cluster 0x{cluster:08X}")]
    BadChainCell { cluster: u32, value: u32 },

    #[error("Circular reference in FAT chain starting at 0x{0:08X}")]
    Cycle(u32),

    #[error("Not enough disk space for {0} cluster allocation")]
    NoSpace(u32),

    #[error("Duplicate reference in directory {parent} for entry {name}")]
    DuplicateName { parent: String, name: String },

    #[error("Circular reference for entry {0}")]
    CircularParent(String),

    #[error("No FATX partition found")]
    FormatUnrecognized,

    #[error("usage error: {0}")]
    Usage(String),
}

pub type Result<T> = std::result::Result<T, FatxError>;
