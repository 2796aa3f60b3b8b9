//! Handles to cached blocks.

use crate::{
    pool::{wait_unlocked, Descriptor, Key, Pool},
    DeviceId, BLOCK_SIZE,
};
use std::{
    fmt,
    sync::{Arc, Mutex},
};

/// A hold on a cached block.
///
/// While any [Buffer] for a descriptor is alive, the descriptor stays bound to its block. Cloning
/// a [Buffer] takes another hold on the same descriptor and dropping it releases one.
///
/// All holders share the same content. Content should not be modified while the buffer
/// [is locked](Buffer::is_locked).
pub struct Buffer {
    pool: Arc<Mutex<Pool>>,
    index: usize,
    key: Key,
}

impl Buffer {
    /// Wrap a hold already taken on `index`.
    pub(crate) fn new(pool: Arc<Mutex<Pool>>, index: usize, key: Key) -> Self {
        Self { pool, index, key }
    }

    fn with<R>(&self, f: impl FnOnce(&mut Descriptor) -> R) -> R {
        let mut pool = self.pool.lock().unwrap();
        f(&mut pool[self.index])
    }

    /// The descriptor backing this buffer. Two buffers with the same id share the same content.
    pub fn id(&self) -> usize {
        self.index
    }

    /// The device the block belongs to.
    pub fn device(&self) -> DeviceId {
        self.key.0
    }

    /// The block number on the device.
    pub fn block(&self) -> u32 {
        self.key.1
    }

    /// The address of the block's data region within the pool's layout.
    pub fn address(&self) -> usize {
        self.with(|descriptor| descriptor.address)
    }

    /// The number of live holds on this buffer's descriptor.
    pub fn refs(&self) -> usize {
        self.with(|descriptor| descriptor.refs)
    }

    /// Whether the content is a valid image of the device block.
    pub fn is_uptodate(&self) -> bool {
        self.with(|descriptor| descriptor.uptodate)
    }

    /// Whether the content must be written back to the device.
    pub fn is_dirty(&self) -> bool {
        self.with(|descriptor| descriptor.dirty)
    }

    /// Whether an I/O request is in flight.
    pub fn is_locked(&self) -> bool {
        self.with(|descriptor| descriptor.locked)
    }

    /// Copy the start of the block into `buf` (up to [BLOCK_SIZE] bytes).
    pub fn copy_to(&self, buf: &mut [u8]) {
        self.with(|descriptor| {
            let len = buf.len().min(BLOCK_SIZE);
            buf[..len].copy_from_slice(&descriptor.data[..len]);
        })
    }

    /// Copy the block into a new vector.
    pub fn to_vec(&self) -> Vec<u8> {
        self.with(|descriptor| descriptor.data.to_vec())
    }

    /// Overwrite part of the block at `offset` and mark it dirty.
    ///
    /// # Panics
    ///
    /// Panics if the write extends past the end of the block.
    pub fn write_at(&self, offset: usize, buf: &[u8]) {
        assert!(offset + buf.len() <= BLOCK_SIZE, "write past end of block");
        self.with(|descriptor| {
            descriptor.data[offset..offset + buf.len()].copy_from_slice(buf);
            descriptor.dirty = true;
        })
    }

    /// Overwrite the whole block, marking it up to date and dirty.
    ///
    /// # Panics
    ///
    /// Panics if `buf` is not exactly [BLOCK_SIZE] bytes.
    pub fn fill(&self, buf: &[u8]) {
        assert_eq!(buf.len(), BLOCK_SIZE);
        self.with(|descriptor| {
            descriptor.data.copy_from_slice(buf);
            descriptor.uptodate = true;
            descriptor.dirty = true;
        })
    }

    /// Mark the block dirty.
    pub fn mark_dirty(&self) {
        self.with(|descriptor| descriptor.dirty = true)
    }

    /// Suspend until no I/O is in flight on this buffer.
    pub async fn wait(&self) {
        wait_unlocked(&self.pool, self.index).await
    }

    /// Release this hold (equivalent to dropping the buffer).
    pub fn release(self) {}
}

impl Clone for Buffer {
    fn clone(&self) -> Self {
        self.pool.lock().unwrap().hold(self.index);
        Self::new(self.pool.clone(), self.index, self.key)
    }
}

impl Drop for Buffer {
    fn drop(&mut self) {
        let Ok(mut pool) = self.pool.lock() else {
            return;
        };
        pool.release(self.index);
    }
}

impl fmt::Debug for Buffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Buffer")
            .field("id", &self.index)
            .field("device", &self.key.0)
            .field("block", &self.key.1)
            .finish()
    }
}
