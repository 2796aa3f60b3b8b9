//! In-memory implementations of [Device] and [Filesystem] for testing.

use crate::{Buffer, Device, DeviceId, Error, Filesystem, BLOCK_SIZE};
use bytes::Bytes;
use commonware_runtime::Clock;
use std::{
    collections::{HashMap, HashSet},
    sync::{Arc, Mutex},
    time::Duration,
};

#[derive(Default)]
struct DiskState {
    blocks: HashMap<(DeviceId, u32), Vec<u8>>,
    failing: HashSet<(DeviceId, u32)>,
    changed: HashSet<DeviceId>,
    reads: Vec<(DeviceId, u32)>,
    writes: Vec<(DeviceId, u32)>,
}

/// A set of in-memory block devices that complete every request after a fixed latency.
///
/// Blocks that were never written read as zeros. Requests are recorded (and writes applied) when
/// they are issued.
#[derive(Clone)]
pub struct Disk<E: Clock> {
    context: E,
    latency: Duration,
    state: Arc<Mutex<DiskState>>,
}

impl<E: Clock> Disk<E> {
    pub fn new(context: E, latency: Duration) -> Self {
        Self {
            context,
            latency,
            state: Arc::new(Mutex::new(DiskState::default())),
        }
    }

    /// Store `data` as the content of `block` without going through a request.
    pub fn put(&self, device: DeviceId, block: u32, data: &[u8]) {
        assert_eq!(data.len(), BLOCK_SIZE);
        let mut state = self.state.lock().unwrap();
        state.blocks.insert((device, block), data.to_vec());
    }

    /// The stored content of `block`, if it was ever written.
    pub fn get(&self, device: DeviceId, block: u32) -> Option<Vec<u8>> {
        self.state.lock().unwrap().blocks.get(&(device, block)).cloned()
    }

    /// Make every request for `block` fail.
    pub fn fail(&self, device: DeviceId, block: u32) {
        self.state.lock().unwrap().failing.insert((device, block));
    }

    /// Let requests for `block` succeed again.
    pub fn heal(&self, device: DeviceId, block: u32) {
        self.state.lock().unwrap().failing.remove(&(device, block));
    }

    /// Swap the medium in `device`.
    pub fn change(&self, device: DeviceId) {
        self.state.lock().unwrap().changed.insert(device);
    }

    /// Every read issued so far, in order.
    pub fn reads(&self) -> Vec<(DeviceId, u32)> {
        self.state.lock().unwrap().reads.clone()
    }

    /// Every write issued so far (including failed ones), in order.
    pub fn writes(&self) -> Vec<(DeviceId, u32)> {
        self.state.lock().unwrap().writes.clone()
    }
}

impl<E: Clock> Device for Disk<E> {
    async fn read(&self, device: DeviceId, block: u32) -> Result<Bytes, Error> {
        let result = {
            let mut state = self.state.lock().unwrap();
            state.reads.push((device, block));
            if state.failing.contains(&(device, block)) {
                Err(Error::Device(format!("read of {device}/{block} failed")))
            } else {
                Ok(state
                    .blocks
                    .get(&(device, block))
                    .map(|data| Bytes::copy_from_slice(data))
                    .unwrap_or_else(|| Bytes::from(vec![0; BLOCK_SIZE])))
            }
        };
        self.context.sleep(self.latency).await;
        result
    }

    async fn write(&self, device: DeviceId, block: u32, data: Bytes) -> Result<(), Error> {
        let result = {
            let mut state = self.state.lock().unwrap();
            state.writes.push((device, block));
            if state.failing.contains(&(device, block)) {
                Err(Error::Device(format!("write of {device}/{block} failed")))
            } else {
                state.blocks.insert((device, block), data.to_vec());
                Ok(())
            }
        };
        self.context.sleep(self.latency).await;
        result
    }

    fn media_changed(&self, device: DeviceId) -> bool {
        self.state.lock().unwrap().changed.remove(&device)
    }
}

#[derive(Default)]
struct MountsState {
    mounted: Vec<DeviceId>,
    staged: Vec<(Buffer, usize, Vec<u8>)>,
    syncs: usize,
    put_supers: Vec<DeviceId>,
    invalidated: Vec<DeviceId>,
}

/// A filesystem layer that records the calls made to it.
///
/// Modified inodes are modeled as staged writes into held buffers, applied on the next
/// [Filesystem::sync_inodes].
#[derive(Clone, Default)]
pub struct Mounts {
    state: Arc<Mutex<MountsState>>,
}

impl Mounts {
    /// Mount a superblock on `device`.
    pub fn mount(&self, device: DeviceId) {
        let mut state = self.state.lock().unwrap();
        if !state.mounted.contains(&device) {
            state.mounted.push(device);
        }
    }

    /// Write `data` at `offset` of `buffer` (releasing it) on the next inode sync.
    pub fn stage(&self, buffer: Buffer, offset: usize, data: &[u8]) {
        let mut state = self.state.lock().unwrap();
        state.staged.push((buffer, offset, data.to_vec()));
    }

    /// The number of inode syncs so far.
    pub fn syncs(&self) -> usize {
        self.state.lock().unwrap().syncs
    }

    /// The devices whose superblock was dropped, in order.
    pub fn put_supers(&self) -> Vec<DeviceId> {
        self.state.lock().unwrap().put_supers.clone()
    }

    /// The devices whose inodes were invalidated, in order.
    pub fn invalidated(&self) -> Vec<DeviceId> {
        self.state.lock().unwrap().invalidated.clone()
    }
}

impl Filesystem for Mounts {
    async fn sync_inodes(&self) {
        let staged = {
            let mut state = self.state.lock().unwrap();
            state.syncs += 1;
            std::mem::take(&mut state.staged)
        };
        for (buffer, offset, data) in staged {
            buffer.wait().await;
            buffer.write_at(offset, &data);
        }
    }

    fn mounted(&self) -> Vec<DeviceId> {
        self.state.lock().unwrap().mounted.clone()
    }

    fn put_super(&self, device: DeviceId) {
        let mut state = self.state.lock().unwrap();
        state.mounted.retain(|mounted| *mounted != device);
        state.put_supers.push(device);
    }

    fn invalidate_inodes(&self, device: DeviceId) {
        self.state.lock().unwrap().invalidated.push(device);
    }
}
