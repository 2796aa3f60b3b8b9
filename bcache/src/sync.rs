//! Write-back, invalidation, and removable media handling.

use crate::{
    cache::{Cache, Op},
    pool::wait_unlocked,
    Device, DeviceId, Filesystem,
};
use commonware_runtime::{Metrics, Spawner};
use tracing::debug;

impl<E: Spawner + Metrics, D: Device, F: Filesystem> Cache<E, D, F> {
    /// Submit a write for every dirty buffer (of `device`, if given), in pool order.
    ///
    /// Locked buffers are waited on before being checked. Returns the buffers written, without
    /// waiting for the writes to complete.
    pub(crate) async fn write_back(&self, device: Option<DeviceId>) -> Vec<usize> {
        let len = self.size();
        let mut written = Vec::new();
        for index in 0..len {
            let matches = {
                let pool = self.pool.lock().unwrap();
                let descriptor = &pool[index];
                descriptor.key.is_some()
                    && device.map_or(true, |device| descriptor.owner() == Some(device))
            };
            if !matches {
                continue;
            }
            wait_unlocked(&self.pool, index).await;
            let dirty = {
                let pool = self.pool.lock().unwrap();
                let descriptor = &pool[index];
                descriptor.dirty && device.map_or(true, |device| descriptor.owner() == Some(device))
            };
            if dirty {
                self.submit(index, Op::Write).await;
                written.push(index);
            }
        }
        if !written.is_empty() {
            debug!(
                device = ?device,
                buffers = written.len(),
                "wrote back dirty buffers"
            );
        }
        written
    }

    /// Wait for the I/O in flight on each of `buffers` to complete.
    async fn settle(&self, buffers: &[usize]) {
        for &index in buffers {
            wait_unlocked(&self.pool, index).await;
        }
    }

    /// Flush modified inodes into their blocks, then write back every dirty buffer.
    ///
    /// Returns once the writes submitted by this call have completed. Buffers whose write failed
    /// stay dirty.
    pub async fn sync(&self) {
        self.filesystem.sync_inodes().await;
        let written = self.write_back(None).await;
        self.settle(&written).await;
        debug!(buffers = written.len(), "synced all devices");
    }

    /// Write back every dirty buffer of `device`, including blocks dirtied by flushing modified
    /// inodes.
    ///
    /// Data blocks are written first, then inodes are flushed into their blocks, then the blocks
    /// dirtied by that flush are written. Returns once every write has completed.
    pub async fn sync_device(&self, device: DeviceId) {
        let mut written = self.write_back(Some(device)).await;
        self.filesystem.sync_inodes().await;
        written.extend(self.write_back(Some(device)).await);
        self.settle(&written).await;
        debug!(%device, buffers = written.len(), "synced device");
    }

    /// Discard the content of every cached block of `device`.
    ///
    /// Each buffer's in-flight I/O completes first. Discarded buffers keep their identity (and
    /// any holds), but are neither up to date nor dirty, so their next read goes to the device.
    /// Pending modifications are lost.
    pub async fn invalidate(&self, device: DeviceId) {
        let len = self.size();
        let mut invalidated = 0;
        for index in 0..len {
            let owned = self.pool.lock().unwrap()[index].owner() == Some(device);
            if !owned {
                continue;
            }
            wait_unlocked(&self.pool, index).await;

            // The buffer may have been rebound while we waited
            let mut pool = self.pool.lock().unwrap();
            let descriptor = &mut pool[index];
            if descriptor.owner() != Some(device) {
                continue;
            }
            descriptor.uptodate = false;
            descriptor.dirty = false;
            invalidated += 1;
        }
        self.metrics.invalidations.inc_by(invalidated);
        debug!(%device, buffers = invalidated, "invalidated device");
    }

    /// Check whether the medium in a removable `device` was changed and, if so, forget everything
    /// cached about it.
    ///
    /// On a change, the device's mounted superblock is dropped, its inodes are invalidated, and
    /// its cached blocks are invalidated. Devices whose major number is not configured as
    /// removable are never checked. Returns whether a change was detected.
    pub async fn check_media_change(&self, device: DeviceId) -> bool {
        if !self.removable.contains(&device.major()) {
            return false;
        }
        if !self.device.media_changed(device) {
            return false;
        }
        debug!(%device, "media changed");
        if self.filesystem.mounted().contains(&device) {
            self.filesystem.put_super(device);
        }
        self.filesystem.invalidate_inodes(device);
        self.invalidate(device).await;
        true
    }
}

#[cfg(test)]
mod tests {
    use crate::{
        cache::Op,
        mocks::{Disk, Mounts},
        Buffer, Cache, Config, DeviceId, Filesystem, Layout, BLOCK_SIZE, FLOPPY_MAJOR,
    };
    use commonware_macros::test_traced;
    use commonware_runtime::{deterministic, Clock, Metrics, Runner, Spawner};
    use std::time::Duration;

    const HDA: DeviceId = DeviceId::new(3, 0);
    const HDB: DeviceId = DeviceId::new(3, 64);
    const FD0: DeviceId = DeviceId::new(FLOPPY_MAJOR, 0);

    type TestCache = Cache<deterministic::Context, Disk<deterministic::Context>, Mounts>;

    fn setup(
        context: &deterministic::Context,
        buffers: usize,
    ) -> (TestCache, Disk<deterministic::Context>, Mounts) {
        let disk = Disk::new(context.clone(), Duration::from_millis(10));
        let mounts = Mounts::default();
        let cache = Cache::init(
            context.with_label("cache"),
            Config::new(Layout::for_buffers(buffers)),
            disk.clone(),
            mounts.clone(),
        );
        (cache, disk, mounts)
    }

    async fn dirty(cache: &TestCache, device: DeviceId, block: u32, byte: u8) -> Buffer {
        let buffer = cache.get(device, block).await;
        buffer.fill(&[byte; BLOCK_SIZE]);
        buffer
    }

    #[test_traced]
    fn test_sync_device_writes_only_device() {
        let executor = deterministic::Runner::default();
        executor.start(|context| async move {
            let (cache, disk, mounts) = setup(&context, 8);
            for block in 1..=3 {
                dirty(&cache, HDA, block, block as u8).await.release();
            }
            dirty(&cache, HDB, 1, 0xBB).await.release();

            cache.sync_device(HDA).await;
            let mut written = disk.writes();
            written.sort();
            assert_eq!(written, vec![(HDA, 1), (HDA, 2), (HDA, 3)]);
            for block in 1..=3 {
                assert!(!cache.lookup(HDA, block).await.unwrap().is_dirty());
            }
            assert!(cache.lookup(HDB, 1).await.unwrap().is_dirty());
            assert_eq!(mounts.syncs(), 1);
        });
    }

    #[test_traced]
    fn test_sync_device_flushes_inodes_between_passes() {
        let executor = deterministic::Runner::default();
        executor.start(|context| async move {
            let (cache, disk, mounts) = setup(&context, 8);

            // Block 1 holds data, block 2 an inode table dirtied only by the inode flush, and
            // block 3 is dirty both before and after it
            dirty(&cache, HDA, 1, 1).await.release();
            let table = cache.read(HDA, 2).await.unwrap();
            mounts.stage(table, 8, b"inode-2");
            let shared = dirty(&cache, HDA, 3, 3).await;
            mounts.stage(shared, 0, b"inode-3");

            cache.sync_device(HDA).await;
            let mut written = disk.writes();
            written.sort();
            assert_eq!(written, vec![(HDA, 1), (HDA, 2), (HDA, 3), (HDA, 3)]);
            assert_eq!(disk.get(HDA, 1).unwrap(), vec![1; BLOCK_SIZE]);
            assert_eq!(&disk.get(HDA, 2).unwrap()[8..15], b"inode-2");
            let shared = disk.get(HDA, 3).unwrap();
            assert_eq!(&shared[..7], b"inode-3");
            assert_eq!(shared[7], 3);
            assert_eq!(mounts.syncs(), 1);
            for block in 1..=3 {
                assert!(!cache.lookup(HDA, block).await.unwrap().is_dirty());
            }
        });
    }

    #[test_traced]
    fn test_sync_all() {
        let executor = deterministic::Runner::default();
        executor.start(|context| async move {
            let (cache, disk, mounts) = setup(&context, 8);
            dirty(&cache, HDA, 1, 1).await.release();
            dirty(&cache, HDB, 2, 2).await.release();
            let table = cache.read(HDA, 3).await.unwrap();
            mounts.stage(table, 0, b"inode");

            cache.sync().await;
            let mut written = disk.writes();
            written.sort();
            assert_eq!(written, vec![(HDA, 1), (HDA, 3), (HDB, 2)]);
            assert_eq!(&disk.get(HDA, 3).unwrap()[..5], b"inode");
            for (device, block) in written {
                assert!(!cache.lookup(device, block).await.unwrap().is_dirty());
            }

            // Nothing left to write
            cache.sync().await;
            assert_eq!(disk.writes().len(), 3);
            assert_eq!(mounts.syncs(), 2);

            let buffer = context.encode();
            assert!(buffer.contains("cache_writes_total 3"));
        });
    }

    #[test_traced]
    fn test_sync_waits_for_in_flight_write() {
        let executor = deterministic::Runner::default();
        executor.start(|context| async move {
            let (cache, disk, _) = setup(&context, 4);
            let buffer = dirty(&cache, HDA, 1, 1).await;

            // Start a write from another task
            let flush = context.with_label("flush").spawn({
                let cache = cache.clone();
                let buffer = buffer.clone();
                move |_| async move { cache.flush(&buffer).await }
            });
            context.sleep(Duration::from_millis(5)).await;
            assert!(buffer.is_locked());

            // The sync waits for it instead of writing again
            cache.sync_device(HDA).await;
            assert!(!buffer.is_locked());
            assert!(!buffer.is_dirty());
            assert_eq!(disk.writes(), vec![(HDA, 1)]);
            flush.await.unwrap();
        });
    }

    #[test_traced]
    fn test_sync_keeps_failed_writes_dirty() {
        let executor = deterministic::Runner::default();
        executor.start(|context| async move {
            let (cache, disk, _) = setup(&context, 4);
            dirty(&cache, HDA, 1, 1).await.release();
            dirty(&cache, HDA, 2, 2).await.release();
            disk.fail(HDA, 2);

            cache.sync_device(HDA).await;
            assert!(!cache.lookup(HDA, 1).await.unwrap().is_dirty());
            assert!(cache.lookup(HDA, 2).await.unwrap().is_dirty());

            disk.heal(HDA, 2);
            cache.sync_device(HDA).await;
            assert!(!cache.lookup(HDA, 2).await.unwrap().is_dirty());
            assert_eq!(disk.get(HDA, 2).unwrap()[0], 2);
        });
    }

    #[test_traced]
    fn test_invalidate() {
        let executor = deterministic::Runner::default();
        executor.start(|context| async move {
            let (cache, disk, _) = setup(&context, 8);
            disk.put(HDA, 1, &[1; BLOCK_SIZE]);
            cache.read(HDA, 1).await.unwrap().release();
            dirty(&cache, HDA, 2, 2).await.release();
            let other = cache.read(HDB, 1).await.unwrap();

            // A held buffer keeps its identity but loses its content
            let held = cache.lookup(HDA, 1).await.unwrap();
            cache.invalidate(HDA).await;
            assert_eq!(held.block(), 1);
            assert!(!held.is_uptodate());
            assert!(!held.is_dirty());
            drop(held);

            // Pending modifications are dropped
            let pending = cache.lookup(HDA, 2).await.unwrap();
            assert!(!pending.is_uptodate());
            assert!(!pending.is_dirty());
            drop(pending);
            cache.sync().await;
            assert!(disk.writes().is_empty());

            // Other devices are untouched
            assert!(other.is_uptodate());

            // The next read goes back to the device
            let reads = disk.reads().len();
            let buffer = cache.read(HDA, 1).await.unwrap();
            assert!(buffer.is_uptodate());
            assert_eq!(disk.reads().len(), reads + 1);

            let buffer = context.encode();
            assert!(buffer.contains("cache_invalidations_total 2"));
        });
    }

    #[test_traced]
    fn test_invalidate_waits_for_io() {
        let executor = deterministic::Runner::default();
        executor.start(|context| async move {
            let (cache, disk, _) = setup(&context, 4);
            disk.put(HDA, 1, &[1; BLOCK_SIZE]);

            // Invalidate while a read is in flight
            let buffer = cache.get(HDA, 1).await;
            cache.submit(buffer.id(), Op::Read).await;
            assert!(buffer.is_locked());
            cache.invalidate(HDA).await;

            // The read completed first, then its content was discarded
            assert!(!buffer.is_locked());
            assert!(!buffer.is_uptodate());
            assert_eq!(disk.reads(), vec![(HDA, 1)]);
        });
    }

    #[test_traced]
    fn test_media_change() {
        let executor = deterministic::Runner::default();
        executor.start(|context| async move {
            let (cache, disk, mounts) = setup(&context, 4);
            mounts.mount(FD0);
            disk.put(FD0, 1, &[1; BLOCK_SIZE]);
            let buffer = cache.read(FD0, 1).await.unwrap();

            // Nothing happens until the medium changes
            assert!(!cache.check_media_change(FD0).await);
            assert!(buffer.is_uptodate());

            // A changed medium drops the superblock, inodes, and cached blocks
            disk.change(FD0);
            assert!(cache.check_media_change(FD0).await);
            assert!(!buffer.is_uptodate());
            assert_eq!(mounts.put_supers(), vec![FD0]);
            assert_eq!(mounts.invalidated(), vec![FD0]);
            assert!(mounts.mounted().is_empty());

            // The change is reported once
            assert!(!cache.check_media_change(FD0).await);
        });
    }

    #[test_traced]
    fn test_media_change_unmounted() {
        let executor = deterministic::Runner::default();
        executor.start(|context| async move {
            let (cache, disk, mounts) = setup(&context, 4);
            disk.change(FD0);
            assert!(cache.check_media_change(FD0).await);
            assert!(mounts.put_supers().is_empty());
            assert_eq!(mounts.invalidated(), vec![FD0]);
        });
    }

    #[test_traced]
    fn test_media_change_fixed_disk() {
        let executor = deterministic::Runner::default();
        executor.start(|context| async move {
            let (cache, disk, mounts) = setup(&context, 4);
            mounts.mount(HDA);
            disk.put(HDA, 1, &[1; BLOCK_SIZE]);
            let buffer = cache.read(HDA, 1).await.unwrap();

            // Fixed disks are never checked
            disk.change(HDA);
            assert!(!cache.check_media_change(HDA).await);
            assert!(buffer.is_uptodate());
            assert!(mounts.put_supers().is_empty());
            assert!(mounts.invalidated().is_empty());
        });
    }
}
