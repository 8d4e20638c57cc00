//! Read/write support for the FATX on-disk filesystem used by the
//! original Xbox and Xbox 360 consoles, over a block device or image
//! file.
//!
//! The crate is the on-disk engine: partition auto-detection, the
//! cluster-chain allocator, the directory-entry tree with its
//! valid/deleted/invalid status model, the caching layer, and the
//! cross-mode algorithms behind `fsck.fatx` and `unrm.fatx`. A host
//! filesystem adapter drives the same engine through
//! [`mount::MountDispatch`].

pub mod areas;
pub mod buffer;
pub mod cache;
pub mod date;
pub mod device;
pub mod entry;
pub mod error;
pub mod fat;
pub mod mount;
pub mod options;
pub mod overlay;
pub mod partition;
pub mod run;
pub mod volume;
