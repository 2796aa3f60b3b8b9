//! Block allocation, release, and the read paths.

use crate::{
    metrics,
    pool::{wait_unlocked, Key, Pool},
    Buffer, Config, Device, DeviceId, Error, Filesystem, BLOCK_SIZE, HOLE,
};
use bytes::Bytes;
use commonware_runtime::{Metrics, Spawner};
use std::sync::{Arc, Mutex};
use tracing::{debug, trace, warn};

/// The kind of I/O request submitted for a buffer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Op {
    Read,
    ReadAhead,
    Write,
}

/// A request handed to the [Device], carrying the content to write.
enum Request {
    Read,
    Write(Bytes),
}

/// A cache of device blocks, backed by a fixed pool of buffers.
///
/// See the [crate] documentation for the allocation protocol.
#[derive(Clone)]
pub struct Cache<E: Spawner + Metrics, D: Device, F: Filesystem> {
    pub(crate) context: E,
    pub(crate) device: D,
    pub(crate) filesystem: F,
    pub(crate) removable: Arc<Vec<u8>>,
    pub(crate) pool: Arc<Mutex<Pool>>,
    pub(crate) metrics: Arc<metrics::Metrics>,
}

impl<E: Spawner + Metrics, D: Device, F: Filesystem> Cache<E, D, F> {
    /// Carve the buffer pool described by `cfg` and start caching blocks of `device`.
    pub fn init(context: E, cfg: Config, device: D, filesystem: F) -> Self {
        let pool = Pool::new(&cfg.layout, cfg.buckets);
        let metrics = metrics::Metrics::init(&context);
        metrics.buffers.set(pool.len() as i64);
        debug!(
            buffers = pool.len(),
            buckets = cfg.buckets.get(),
            "initialized buffer cache"
        );

        Self {
            context,
            device,
            filesystem,
            removable: Arc::new(cfg.removable),
            pool: Arc::new(Mutex::new(pool)),
            metrics: Arc::new(metrics),
        }
    }

    /// The number of buffers in the pool.
    pub fn size(&self) -> usize {
        self.pool.lock().unwrap().len()
    }

    fn refs(&self, index: usize) -> usize {
        self.pool.lock().unwrap()[index].refs
    }

    /// Return a hold on the buffer caching `block` of `device`, if it is cached.
    ///
    /// Waits for any I/O in flight on the buffer to complete before returning it.
    pub async fn lookup(&self, device: DeviceId, block: u32) -> Option<Buffer> {
        let key = (device, block);
        loop {
            let index = {
                let mut pool = self.pool.lock().unwrap();
                let index = pool.find(key)?;
                pool.hold(index);
                index
            };
            wait_unlocked(&self.pool, index).await;

            // The hold keeps the descriptor bound, but confirm before handing it out
            let mut pool = self.pool.lock().unwrap();
            if pool[index].key == Some(key) {
                self.metrics.hits.inc();
                return Some(Buffer::new(self.pool.clone(), index, key));
            }
            pool.release(index);
        }
    }

    /// Return a hold on the buffer for `block` of `device`, binding a reusable buffer to it if it
    /// is not cached.
    ///
    /// A newly bound buffer is not up to date: its content must be read or filled before use.
    /// Suspends while every buffer is held.
    ///
    /// # Panics
    ///
    /// Panics if the pool has no buffers.
    pub async fn get(&self, device: DeviceId, block: u32) -> Buffer {
        let key = (device, block);
        'repeat: loop {
            if let Some(buffer) = self.lookup(device, block).await {
                return buffer;
            }

            // Pick the cheapest buffer to reuse, or wait for a release if all are held
            let candidate = {
                let mut pool = self.pool.lock().unwrap();
                if pool.is_empty() {
                    panic!("allocation from empty buffer pool");
                }
                match pool.candidate() {
                    Some(index) => Ok(index),
                    None => Err(pool.waiters.register()),
                }
            };
            let index = match candidate {
                Ok(index) => index,
                Err(waiter) => {
                    self.metrics.exhausted.inc();
                    debug!(%device, block, "all buffers held: waiting for release");
                    let _ = waiter.await;
                    continue;
                }
            };

            // Let in-flight I/O finish, then make sure nobody took the candidate meanwhile
            wait_unlocked(&self.pool, index).await;
            if self.refs(index) > 0 {
                continue;
            }

            // Write back the candidate's device until the candidate itself is clean
            loop {
                let owner = {
                    let pool = self.pool.lock().unwrap();
                    let descriptor = &pool[index];
                    if !descriptor.dirty {
                        break;
                    }
                    match descriptor.owner() {
                        Some(owner) => owner,
                        None => panic!("dirty buffer without identity"),
                    }
                };
                self.write_back(Some(owner)).await;
                wait_unlocked(&self.pool, index).await;
                if self.refs(index) > 0 {
                    continue 'repeat;
                }
            }

            // Someone may have cached this block while we slept
            let mut pool = self.pool.lock().unwrap();
            if pool.find(key).is_some() || !pool.claimable(index) {
                continue;
            }
            let evicted = pool[index].key;
            pool.rebind(index, key);
            drop(pool);

            self.metrics.misses.inc();
            if let Some((old_device, old_block)) = evicted {
                self.metrics.evictions.inc();
                debug!(
                    %device,
                    block,
                    %old_device,
                    old_block,
                    buffer = index,
                    "evicted block"
                );
            }
            return Buffer::new(self.pool.clone(), index, key);
        }
    }

    /// Return a hold on an up-to-date buffer for `block` of `device`, reading it from the device
    /// if it is not cached.
    ///
    /// Returns [Error::Unreadable] (and releases the buffer) if the read fails.
    pub async fn read(&self, device: DeviceId, block: u32) -> Result<Buffer, Error> {
        let buffer = self.get(device, block).await;
        if buffer.is_uptodate() {
            return Ok(buffer);
        }
        self.submit(buffer.id(), Op::Read).await;
        buffer.wait().await;
        if buffer.is_uptodate() {
            return Ok(buffer);
        }
        Err(Error::Unreadable(device, block))
    }

    /// Read several blocks of `device` into consecutive [BLOCK_SIZE] chunks of `page`.
    ///
    /// Reads for every block are submitted before waiting on any of them, so the device can
    /// service them together. Blocks numbered [HOLE] are skipped, as are blocks that fail to read
    /// (their chunk of `page` is left untouched). Returns the number of blocks copied.
    pub async fn read_page(
        &self,
        device: DeviceId,
        blocks: &[u32],
        page: &mut [u8],
    ) -> Result<usize, Error> {
        let required = blocks.len() * BLOCK_SIZE;
        if page.len() < required {
            return Err(Error::PageTooSmall(page.len()));
        }

        // Submit every read first
        let mut buffers = Vec::with_capacity(blocks.len());
        for &block in blocks {
            if block == HOLE {
                buffers.push(None);
                continue;
            }
            let buffer = self.get(device, block).await;
            if !buffer.is_uptodate() {
                self.submit(buffer.id(), Op::Read).await;
            }
            buffers.push(Some(buffer));
        }

        // Then collect the results
        let mut copied = 0;
        for (chunk, buffer) in page.chunks_mut(BLOCK_SIZE).zip(buffers) {
            let Some(buffer) = buffer else {
                continue;
            };
            buffer.wait().await;
            if buffer.is_uptodate() {
                buffer.copy_to(chunk);
                copied += 1;
            }
        }
        Ok(copied)
    }

    /// Read `block` of `device` like [Cache::read], additionally starting read-ahead of each of
    /// `ahead` (in order) without waiting for them.
    ///
    /// Read-ahead buffers are released as soon as their request is submitted. A failed read-ahead
    /// is only noticed when the block is next read.
    pub async fn read_ahead(
        &self,
        device: DeviceId,
        block: u32,
        ahead: &[u32],
    ) -> Result<Buffer, Error> {
        let buffer = self.get(device, block).await;
        if !buffer.is_uptodate() {
            self.submit(buffer.id(), Op::Read).await;
        }
        for &next in ahead {
            let prefetch = self.get(device, next).await;
            if !prefetch.is_uptodate() {
                self.submit(prefetch.id(), Op::ReadAhead).await;
            }
        }
        buffer.wait().await;
        if buffer.is_uptodate() {
            return Ok(buffer);
        }
        Err(Error::Unreadable(device, block))
    }

    /// Write `buffer` back to its device (if dirty) and wait for the write to complete.
    ///
    /// The buffer stays dirty if the write fails.
    pub async fn flush(&self, buffer: &Buffer) {
        self.submit(buffer.id(), Op::Write).await;
        buffer.wait().await;
    }

    /// Lock the buffer at `index` and submit `op` for it, waiting for in-flight I/O first.
    ///
    /// Reads of up-to-date buffers and writes of clean buffers are dropped. Read-ahead never
    /// waits: it is dropped if the buffer is locked.
    pub(crate) async fn submit(&self, index: usize, op: Op) {
        loop {
            let waiter = {
                let mut pool = self.pool.lock().unwrap();
                let descriptor = &mut pool[index];
                if !descriptor.locked {
                    let needed = match op {
                        Op::Read | Op::ReadAhead => !descriptor.uptodate,
                        Op::Write => descriptor.dirty,
                    };
                    let Some(key) = descriptor.key else {
                        return;
                    };
                    if !needed {
                        return;
                    }
                    descriptor.locked = true;
                    let request = match op {
                        Op::Read | Op::ReadAhead => Request::Read,
                        Op::Write => Request::Write(Bytes::copy_from_slice(&descriptor.data)),
                    };
                    drop(pool);
                    self.dispatch(index, key, op, request);
                    return;
                }
                if op == Op::ReadAhead {
                    return;
                }
                descriptor.waiters.register()
            };
            let _ = waiter.await;
        }
    }

    /// Hand a request to the device from a dedicated task, which completes it.
    fn dispatch(&self, index: usize, key: Key, op: Op, request: Request) {
        match op {
            Op::Read => self.metrics.reads.inc(),
            Op::ReadAhead => self.metrics.read_aheads.inc(),
            Op::Write => self.metrics.writes.inc(),
        };
        let (device, block) = key;
        trace!(%device, block, ?op, buffer = index, "submitted request");

        let driver = self.device.clone();
        let pool = self.pool.clone();
        self.context
            .with_label("io")
            .spawn(move |_| async move {
                match request {
                    Request::Read => {
                        let result = driver.read(device, block).await;
                        complete_read(&pool, index, key, result);
                    }
                    Request::Write(data) => {
                        let result = driver.write(device, block, data).await;
                        complete_write(&pool, index, key, result);
                    }
                }
            });
    }
}

/// Install the result of a read and unlock the buffer.
fn complete_read(
    pool: &Mutex<Pool>,
    index: usize,
    (device, block): Key,
    result: Result<Bytes, Error>,
) {
    let mut pool = pool.lock().unwrap();
    let descriptor = &mut pool[index];
    match result {
        Ok(data) if data.len() == BLOCK_SIZE => {
            descriptor.data.copy_from_slice(&data);
            descriptor.uptodate = true;
            trace!(%device, block, buffer = index, "read completed");
        }
        Ok(data) => {
            descriptor.uptodate = false;
            warn!(%device, block, len = data.len(), "short read");
        }
        Err(err) => {
            descriptor.uptodate = false;
            warn!(%device, block, ?err, "read failed");
        }
    }
    pool.unlock(index);
}

/// Record the result of a write and unlock the buffer.
fn complete_write(
    pool: &Mutex<Pool>,
    index: usize,
    (device, block): Key,
    result: Result<(), Error>,
) {
    let mut pool = pool.lock().unwrap();
    match result {
        Ok(()) => {
            pool[index].dirty = false;
            trace!(%device, block, buffer = index, "write completed");
        }
        Err(err) => {
            warn!(%device, block, ?err, "write failed: buffer stays dirty");
        }
    }
    pool.unlock(index);
}
