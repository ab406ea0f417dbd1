#![forbid(unsafe_code)]
//! SnapFS core: a writable-snapshot layer for a journaled block
//! filesystem.
//!
//! An administrator freezes the live volume at an instant, producing a
//! read-only point-in-time image that stays mountable while the live
//! volume keeps accepting writes. Snapshots form a chronologically
//! ordered chain; the newest one is *active* and receives every block
//! preserved by copy-on-write (metadata) or move-on-write (file data).
//!
//! Module map:
//!
//! - [`context`] — the mounted-volume context: superblock, group state,
//!   snapshot chain, active-snapshot pointer, allocation.
//! - [`inode`] — inode cache and the snapshot-file block mapper.
//! - [`mkfs`] — minimal volume formatter.
//! - [`snapshot`] — the snapshot engine itself: COW bitmap cache, COW
//!   and MOW decision paths, image read router, lifecycle manager and
//!   the journal access hooks the host calls.

pub mod context;
pub mod inode;
pub mod mkfs;
pub mod snapshot;

pub use context::{FsContext, MountOptions};
pub use inode::{MapIntent, MapResult};
pub use mkfs::{FormatParams, format};
