//! The fixed arena of buffer descriptors and the two structures threaded through it.

use crate::{wait::WaitSet, DeviceId, Layout, BLOCK_SIZE};
use std::{
    num::NonZeroUsize,
    ops::{Index, IndexMut},
    sync::Mutex,
};

mod hash;
mod list;

pub(crate) use hash::Key;
use hash::Table;
use list::Ring;

/// One slot of the pool, bound for its lifetime to a single block-sized data region.
pub(crate) struct Descriptor {
    /// The block cached by this descriptor, if any. Descriptors with a key are exactly those in
    /// the hash index.
    pub key: Option<Key>,

    /// The content differs from the device image and must be written back before reuse.
    pub dirty: bool,

    /// The content is a valid image of the device block.
    pub uptodate: bool,

    /// An I/O request is in flight on this descriptor.
    pub locked: bool,

    /// The number of live [crate::Buffer] handles.
    pub refs: usize,

    /// The address of the data region within the pool's [Layout].
    pub address: usize,

    /// The block content.
    pub data: Box<[u8]>,

    /// Tasks waiting for this descriptor to unlock.
    pub waiters: WaitSet,
}

impl Descriptor {
    fn new(address: usize) -> Self {
        Self {
            key: None,
            dirty: false,
            uptodate: false,
            locked: false,
            refs: 0,
            address,
            data: vec![0; BLOCK_SIZE].into_boxed_slice(),
            waiters: WaitSet::default(),
        }
    }

    /// The device this descriptor currently caches a block of.
    pub fn owner(&self) -> Option<DeviceId> {
        self.key.map(|(device, _)| device)
    }

    /// How costly it is to reuse this descriptor: dirty buffers need a write-back and locked
    /// buffers need to wait for their I/O.
    fn badness(&self) -> u8 {
        (u8::from(self.dirty) << 1) + u8::from(self.locked)
    }
}

/// The buffer pool: every descriptor, the hash index over the bound ones, and the free list over
/// all of them.
pub(crate) struct Pool {
    descriptors: Vec<Descriptor>,
    hash: Table,
    free: Ring,

    /// Tasks waiting for any descriptor to become reusable.
    pub waiters: WaitSet,
}

impl Pool {
    /// Carve a pool out of `layout`, indexed by `buckets` hash chains.
    pub fn new(layout: &Layout, buckets: NonZeroUsize) -> Self {
        let descriptors: Vec<_> = carve(layout).into_iter().map(Descriptor::new).collect();
        let len = descriptors.len();
        Self {
            descriptors,
            hash: Table::new(buckets, len),
            free: Ring::new(len),
            waiters: WaitSet::default(),
        }
    }

    pub fn len(&self) -> usize {
        self.descriptors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.descriptors.is_empty()
    }

    /// Find the descriptor caching `key`.
    pub fn find(&self, key: Key) -> Option<usize> {
        self.hash.find(key, |index| self.descriptors[index].key)
    }

    /// Scan the free list for the unheld descriptor that is cheapest to reuse.
    ///
    /// Returns `None` if every descriptor is held.
    pub fn candidate(&self) -> Option<usize> {
        let mut best: Option<usize> = None;
        for index in self.free.iter() {
            let descriptor = &self.descriptors[index];
            if descriptor.refs > 0 {
                continue;
            }
            if best.map_or(true, |best| descriptor.badness() < self.descriptors[best].badness()) {
                best = Some(index);
                if descriptor.badness() == 0 {
                    break;
                }
            }
        }
        best
    }

    /// Whether `index` can be rebound right now: unheld, unlocked, and clean.
    pub fn claimable(&self, index: usize) -> bool {
        let descriptor = &self.descriptors[index];
        descriptor.refs == 0 && !descriptor.locked && !descriptor.dirty
    }

    /// Bind `index` to `key`, taking the first hold on it.
    ///
    /// The descriptor leaves its old hash chain, moves to the back of the free list, and joins the
    /// chain for `key`. Its content is not up to date until read or filled.
    ///
    /// # Panics
    ///
    /// Panics if the descriptor is not claimable.
    pub fn rebind(&mut self, index: usize, key: Key) {
        assert!(self.claimable(index), "rebinding busy buffer");
        if let Some(old) = self.descriptors[index].key {
            self.hash.remove(index, old);
        }
        let descriptor = &mut self.descriptors[index];
        descriptor.key = Some(key);
        descriptor.refs = 1;
        descriptor.dirty = false;
        descriptor.uptodate = false;
        self.free.move_to_back(index);
        self.hash.insert(index, key);
    }

    /// Take an additional hold on `index`.
    pub fn hold(&mut self, index: usize) {
        self.descriptors[index].refs += 1;
    }

    /// Drop a hold on `index` and wake tasks waiting for a reusable descriptor.
    ///
    /// # Panics
    ///
    /// Panics if `index` is not held.
    pub fn release(&mut self, index: usize) {
        let descriptor = &mut self.descriptors[index];
        if descriptor.refs == 0 {
            panic!("trying to free free buffer");
        }
        descriptor.refs -= 1;
        self.waiters.wake_all();
    }

    /// Clear the lock on `index` and wake tasks waiting for it.
    pub fn unlock(&mut self, index: usize) {
        let descriptor = &mut self.descriptors[index];
        descriptor.locked = false;
        descriptor.waiters.wake_all();
    }

    /// Assert the structural invariants of the pool.
    #[cfg(test)]
    pub fn check(&self) {
        use std::collections::HashSet;

        // Every descriptor is on the free list exactly once
        self.free.check();

        // The hash index holds exactly the descriptors with a key, and keys are unique
        let mut chained: Vec<_> = self.hash.iter().collect();
        chained.sort_unstable();
        let keyed: Vec<_> = (0..self.len())
            .filter(|&index| self.descriptors[index].key.is_some())
            .collect();
        assert_eq!(chained, keyed);
        let mut keys = HashSet::new();
        for &index in &keyed {
            let key = self.descriptors[index].key.unwrap();
            assert!(keys.insert(key), "duplicate key {key:?}");
            assert_eq!(self.find(key), Some(index));
        }

        // Unkeyed descriptors are never dirty
        for descriptor in &self.descriptors {
            if descriptor.key.is_none() {
                assert!(!descriptor.dirty);
            }
        }
    }
}

impl Index<usize> for Pool {
    type Output = Descriptor;

    fn index(&self, index: usize) -> &Self::Output {
        &self.descriptors[index]
    }
}

impl IndexMut<usize> for Pool {
    fn index_mut(&mut self, index: usize) -> &mut Self::Output {
        &mut self.descriptors[index]
    }
}

/// Suspend until descriptor `index` is unlocked.
pub(crate) async fn wait_unlocked(pool: &Mutex<Pool>, index: usize) {
    loop {
        let waiter = {
            let mut pool = pool.lock().unwrap();
            let descriptor = &mut pool[index];
            if !descriptor.locked {
                return;
            }
            descriptor.waiters.register()
        };
        let _ = waiter.await;
    }
}

/// Compute the address of every data region carved from `layout`, highest first.
fn carve(layout: &Layout) -> Vec<usize> {
    let mut addresses = Vec::new();
    let mut cursor = layout.end;
    loop {
        let Some(mut address) = cursor.checked_sub(BLOCK_SIZE) else {
            break;
        };
        if let Some(hole) = &layout.hole {
            if address < hole.end && address + BLOCK_SIZE > hole.start {
                let Some(below) = hole.start.checked_sub(BLOCK_SIZE) else {
                    break;
                };
                address = below;
            }
        }

        // Stop once the block would overlap the descriptor that describes it
        let descriptors = layout.start + (addresses.len() + 1) * layout.descriptor;
        if address < descriptors {
            break;
        }
        addresses.push(address);
        cursor = address;
    }
    addresses
}
