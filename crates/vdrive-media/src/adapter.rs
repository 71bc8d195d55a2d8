//! Routes storage operations to the block cache or the container.
//!
//! A medium either has a block cache, in which case every operation goes through the cache, or
//! it talks to the container directly. Synchronous callers reach the cache through the same
//! enqueue API as requests and wait for the completion.

use std::sync::Arc;

use vdrive_storage::{ByteRange, DiskError};

use crate::block_cache::BlockCache;
use crate::buffer::IoBuffer;
use crate::container::{wait_for_completion, AsyncIo, DiskContainer, DiskResult, IoCompletion};

#[derive(Debug)]
pub(crate) enum StorageOp {
    Read { offset: u64, buf: IoBuffer },
    Write { offset: u64, buf: IoBuffer },
    Flush,
    Discard { ranges: Vec<ByteRange> },
}

/// The mounted medium.
pub(crate) struct StorageAdapter {
    container: Arc<dyn DiskContainer>,
    cache: Option<Arc<dyn BlockCache>>,
}

impl StorageAdapter {
    pub(crate) fn new(container: Arc<dyn DiskContainer>, cache: Option<Arc<dyn BlockCache>>) -> Self {
        Self { container, cache }
    }

    pub(crate) fn cache(&self) -> Option<&Arc<dyn BlockCache>> {
        self.cache.as_ref()
    }

    pub(crate) fn capacity_bytes(&self) -> u64 {
        self.container.capacity_bytes()
    }

    pub(crate) fn dispatch(&self, op: StorageOp, done: IoCompletion) -> AsyncIo {
        match &self.cache {
            Some(cache) => match op {
                StorageOp::Read { offset, buf } => cache.read(offset, buf, done),
                StorageOp::Write { offset, buf } => cache.write(offset, buf, done),
                StorageOp::Flush => cache.flush(done),
                StorageOp::Discard { ranges } => cache.discard(ranges, done),
            },
            None => match op {
                StorageOp::Read { offset, buf } => self.container.start_read(offset, buf, done),
                StorageOp::Write { offset, buf } => self.container.start_write(offset, buf, done),
                StorageOp::Flush => self.container.start_flush(done),
                StorageOp::Discard { ranges } => self.container.start_discard(ranges, done),
            },
        }
    }

    fn run_cached(&self, cache: &Arc<dyn BlockCache>, op: StorageOp) -> DiskResult<Option<IoBuffer>> {
        let outcome = wait_for_completion(|done| match op {
            StorageOp::Read { offset, buf } => cache.read(offset, buf, done),
            StorageOp::Write { offset, buf } => cache.write(offset, buf, done),
            StorageOp::Flush => cache.flush(done),
            StorageOp::Discard { ranges } => cache.discard(ranges, done),
        })?;
        outcome.result?;
        Ok(outcome.buf)
    }

    pub(crate) fn read(&self, offset: u64, out: &mut [u8]) -> DiskResult<()> {
        let Some(cache) = &self.cache else {
            return self.container.read(offset, out);
        };
        let buf = bounce_buffer(out.len())?;
        let buf = self
            .run_cached(cache, StorageOp::Read { offset, buf })?
            .ok_or_else(|| DiskError::Io("block cache returned no read buffer".into()))?;
        out.copy_from_slice(&buf);
        Ok(())
    }

    pub(crate) fn write(&self, offset: u64, data: &[u8]) -> DiskResult<()> {
        let Some(cache) = &self.cache else {
            return self.container.write(offset, data);
        };
        let mut buf = bounce_buffer(data.len())?;
        buf.copy_from_slice(data);
        self.run_cached(cache, StorageOp::Write { offset, buf }).map(drop)
    }

    pub(crate) fn flush(&self) -> DiskResult<()> {
        match &self.cache {
            Some(cache) => self.run_cached(cache, StorageOp::Flush).map(drop),
            None => self.container.flush(),
        }
    }

    pub(crate) fn discard(&self, ranges: &[ByteRange]) -> DiskResult<()> {
        match &self.cache {
            Some(cache) => {
                let ranges = ranges.to_vec();
                self.run_cached(cache, StorageOp::Discard { ranges }).map(drop)
            }
            None => self.container.discard(ranges),
        }
    }

    /// Writes back the cache, then merges inside the container.
    pub(crate) fn merge(
        &self,
        source: u32,
        target: u32,
        progress: &mut dyn FnMut(u32),
    ) -> DiskResult<()> {
        if let Some(cache) = &self.cache {
            cache.clear()?;
        }
        self.container.merge(source, target, progress)
    }
}

fn bounce_buffer(len: usize) -> DiskResult<IoBuffer> {
    IoBuffer::page_aligned(len).map_err(|err| DiskError::Io(err.to_string()))
}
