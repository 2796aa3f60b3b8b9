//! Cache fixed-size device blocks in a bounded pool of buffers.
//!
//! # Status
//!
//! `bcache` is **ALPHA** software and is not yet recommended for production use. Developers should
//! expect breaking changes and occasional instability.
//!
//! [Cache] is the layer every block read or write passes through on its way to a [Device]. It
//! guarantees that at most one in-memory copy of any `(device, block)` pair exists, serves repeated
//! accesses without going back to the device, and defers writes until they are synced or until the
//! buffer holding them is needed for another block.
//!
//! # Design
//!
//! The cache owns a fixed pool of buffer descriptors, each bound for its lifetime to one
//! [BLOCK_SIZE] region of memory. The pool is carved once from a [Layout] at startup and never
//! grows. Two structures are threaded through the pool by descriptor index:
//!
//! * A hash index keyed by `(device, block)`, containing exactly the descriptors that currently
//!   have an identity.
//! * A circular free list containing every descriptor exactly once. Scans start at the list's
//!   anchor, where the least recently bound descriptors live, and a descriptor moves to the back
//!   of the list whenever it is bound to a new identity.
//!
//! To find a buffer for an uncached block, the free list is scanned for the unheld descriptor with
//! the lowest badness (`2 * dirty + locked`). Dirty candidates are written back (along with every
//! other dirty buffer of the same device) before they are reused.
//!
//! # Suspension
//!
//! Tasks suspend while waiting for a buffer's I/O to complete, while waiting for any buffer to be
//! released when the whole pool is held, and while waiting for write-back. Device completions run
//! in their own tasks and may change buffer state at any of these points, so every decision made
//! before a suspension is re-validated after it (and the allocation restarts from scratch when a
//! decision no longer holds).
//!
//! # Holding Buffers
//!
//! Every [Buffer] handle counts as one hold on its descriptor. A held descriptor is never rebound
//! to another block. Dropping the handle releases the hold. Holders share the block's content
//! without further arbitration: coordinating concurrent writers is left to the caller.
//!
//! # Example
//!
//! ```rust
//! use bcache::{mocks, Cache, Config, DeviceId, Layout};
//! use commonware_runtime::{deterministic, Runner};
//! use std::time::Duration;
//!
//! let executor = deterministic::Runner::default();
//! executor.start(|context| async move {
//!     // Create a cache in front of an in-memory disk
//!     let disk = mocks::Disk::new(context.clone(), Duration::from_millis(5));
//!     let cache = Cache::init(
//!         context.clone(),
//!         Config::new(Layout::for_buffers(16)),
//!         disk.clone(),
//!         mocks::Mounts::default(),
//!     );
//!
//!     // Read a block and modify it
//!     let hda = DeviceId::new(3, 0);
//!     let buffer = cache.read(hda, 1).await.unwrap();
//!     buffer.write_at(0, b"hello");
//!     drop(buffer);
//!
//!     // Write the modified block back to the device
//!     cache.sync_device(hda).await;
//!     assert_eq!(&disk.get(hda, 1).unwrap()[..5], b"hello");
//! });
//! ```

use bytes::Bytes;
use std::{fmt, future::Future, num::NonZeroUsize, ops::Range};
use thiserror::Error;

mod buffer;
mod cache;
mod metrics;
pub mod mocks;
mod pool;
mod sync;
mod wait;

pub use buffer::Buffer;
pub use cache::Cache;

/// The size of every cached block, in bytes.
pub const BLOCK_SIZE: usize = 1024;

/// The default number of hash buckets. Prime, to spread `(device, block)` keys.
pub const BUCKETS: NonZeroUsize = match NonZeroUsize::new(307) {
    Some(buckets) => buckets,
    None => unreachable!(),
};

/// The bytes of memory consumed by each buffer descriptor when carving a [Layout].
pub const DESCRIPTOR_SIZE: usize = 64;

/// The major number of floppy drives, the default removable device class.
pub const FLOPPY_MAJOR: u8 = 2;

/// Block number that marks a hole in a page passed to [Cache::read_page].
pub const HOLE: u32 = 0;

/// Errors that can occur when interacting with the [Cache].
#[derive(Debug, Error)]
pub enum Error {
    #[error("block unreadable: {0}/{1}")]
    Unreadable(DeviceId, u32),
    #[error("page too small: {0}")]
    PageTooSmall(usize),
    #[error("device error: {0}")]
    Device(String),
}

/// A device number, composed of a major number (the device class) and a minor number (the unit
/// within that class).
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DeviceId(u16);

impl DeviceId {
    /// Create a device number from its major and minor parts.
    pub const fn new(major: u8, minor: u8) -> Self {
        Self(((major as u16) << 8) | minor as u16)
    }

    /// The device class.
    pub const fn major(self) -> u8 {
        (self.0 >> 8) as u8
    }

    /// The unit within the device class.
    pub const fn minor(self) -> u8 {
        self.0 as u8
    }

    /// The packed device number.
    pub const fn raw(self) -> u16 {
        self.0
    }
}

impl From<u16> for DeviceId {
    fn from(raw: u16) -> Self {
        Self(raw)
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.major(), self.minor())
    }
}

/// Interface to the block device driver.
///
/// Requests are submitted by the [Cache] from their own task, so implementations may take as long
/// as they need to complete without blocking the caller that triggered them.
pub trait Device: Clone + Send + Sync + 'static {
    /// Read the [BLOCK_SIZE] bytes of `block` from `device`.
    fn read(
        &self,
        device: DeviceId,
        block: u32,
    ) -> impl Future<Output = Result<Bytes, Error>> + Send;

    /// Write `data` (exactly [BLOCK_SIZE] bytes) to `block` of `device`.
    fn write(
        &self,
        device: DeviceId,
        block: u32,
        data: Bytes,
    ) -> impl Future<Output = Result<(), Error>> + Send;

    /// Return whether the medium in a removable `device` has changed since the last query.
    ///
    /// Only called for devices whose major number is configured as removable.
    fn media_changed(&self, device: DeviceId) -> bool;
}

/// Interface to the filesystem layers sitting above the [Cache].
pub trait Filesystem: Clone + Send + Sync + 'static {
    /// Write all modified in-memory inodes into their (cached) blocks.
    ///
    /// Called by [Cache::sync] and [Cache::sync_device]. Blocks dirtied here are written back by
    /// the same sync.
    fn sync_inodes(&self) -> impl Future<Output = ()> + Send;

    /// The devices that currently have a mounted superblock.
    fn mounted(&self) -> Vec<DeviceId>;

    /// Drop the mounted superblock of `device`.
    fn put_super(&self, device: DeviceId);

    /// Drop all in-memory inodes of `device`.
    fn invalidate_inodes(&self, device: DeviceId);
}

/// The memory region dedicated to the buffer pool.
///
/// Block-sized data regions are carved downward from `end` while descriptors grow upward from
/// `start`, until the next block would overlap the descriptors. Blocks overlapping `hole` are
/// never handed out.
#[derive(Clone, Debug)]
pub struct Layout {
    /// The first address available to the pool (where descriptors are placed).
    pub start: usize,

    /// The address one past the end of the pool's memory.
    pub end: usize,

    /// The bytes consumed by each descriptor.
    pub descriptor: usize,

    /// An address range inside the region that cannot hold buffers.
    pub hole: Option<Range<usize>>,
}

impl Layout {
    /// A region that yields exactly `buffers` descriptors.
    pub const fn for_buffers(buffers: usize) -> Self {
        Self {
            start: 0,
            end: buffers * (BLOCK_SIZE + DESCRIPTOR_SIZE),
            descriptor: DESCRIPTOR_SIZE,
            hole: None,
        }
    }
}

/// Configuration for the [Cache].
#[derive(Clone, Debug)]
pub struct Config {
    /// The memory region the pool is carved from.
    pub layout: Layout,

    /// The number of hash buckets used to index cached blocks.
    pub buckets: NonZeroUsize,

    /// The major numbers of removable device classes, checked by [Cache::check_media_change].
    pub removable: Vec<u8>,
}

impl Config {
    /// A configuration using [BUCKETS] hash buckets and treating floppy drives as removable.
    pub fn new(layout: Layout) -> Self {
        Self {
            layout,
            buckets: BUCKETS,
            removable: vec![FLOPPY_MAJOR],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_id() {
        let device = DeviceId::new(3, 1);
        assert_eq!(device.major(), 3);
        assert_eq!(device.minor(), 1);
        assert_eq!(device.raw(), 0x0301);
        assert_eq!(DeviceId::from(0x0301), device);
        assert_eq!(device.to_string(), "3:1");
    }

    #[test]
    fn test_config_defaults() {
        let cfg = Config::new(Layout::for_buffers(4));
        assert_eq!(cfg.buckets.get(), 307);
        assert_eq!(cfg.removable, vec![FLOPPY_MAJOR]);
        assert_eq!(cfg.layout.end, 4 * (BLOCK_SIZE + DESCRIPTOR_SIZE));
    }
}
