use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex, MutexGuard};

use lru::LruCache;
use vdrive_storage::{checked_range, ByteRange, DiskError};

use crate::buffer::IoBuffer;
use crate::container::{AsyncIo, DiskContainer, DiskResult, IoCompletion, IoOutcome};

/// Enqueue-style cache sitting between the request engine and the container.
///
/// It replaces the container's `start_*` API one for one: a driver with a block cache never
/// dispatches requests to the container directly.
pub trait BlockCache: Send + Sync {
    fn read(&self, offset: u64, buf: IoBuffer, done: IoCompletion) -> AsyncIo;

    fn write(&self, offset: u64, buf: IoBuffer, done: IoCompletion) -> AsyncIo;

    fn flush(&self, done: IoCompletion) -> AsyncIo;

    fn discard(&self, ranges: Vec<ByteRange>, done: IoCompletion) -> AsyncIo;

    /// Writes back dirty data and holds off further write-backs until [`BlockCache::resume`].
    fn suspend(&self) -> DiskResult<()>;

    fn resume(&self) -> DiskResult<()>;

    /// Writes back dirty data and drops every cached block.
    fn clear(&self) -> DiskResult<()>;
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BlockCacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub writebacks: u64,
}

struct CachedBlock {
    data: Vec<u8>,
    dirty: bool,
}

struct CacheState {
    blocks: LruCache<u64, CachedBlock>,
    stats: BlockCacheStats,
    suspended: bool,
}

/// LRU write-back cache of fixed-size blocks over a [`DiskContainer`].
///
/// Every operation completes during submission. While suspended, dirty blocks stay in memory
/// and a miss that would have to evict a dirty block fails with
/// [`DiskError::InvalidState`].
pub struct LruBlockCache {
    container: Arc<dyn DiskContainer>,
    block_size: usize,
    state: Mutex<CacheState>,
}

pub const DEFAULT_CACHE_BLOCK_SIZE: usize = 64 * 1024;
pub const DEFAULT_CACHE_BLOCKS: usize = 256;

impl LruBlockCache {
    pub fn new(
        container: Arc<dyn DiskContainer>,
        block_size: usize,
        max_blocks: usize,
    ) -> DiskResult<Self> {
        if block_size == 0 {
            return Err(DiskError::InvalidConfig("block_size must be > 0"));
        }
        let max_blocks = NonZeroUsize::new(max_blocks)
            .ok_or(DiskError::InvalidConfig("max_blocks must be > 0"))?;
        Ok(Self {
            container,
            block_size,
            state: Mutex::new(CacheState {
                blocks: LruCache::new(max_blocks),
                stats: BlockCacheStats::default(),
                suspended: false,
            }),
        })
    }

    pub fn with_defaults(container: Arc<dyn DiskContainer>) -> DiskResult<Self> {
        Self::new(container, DEFAULT_CACHE_BLOCK_SIZE, DEFAULT_CACHE_BLOCKS)
    }

    pub fn stats(&self) -> BlockCacheStats {
        self.lock().stats
    }

    pub fn is_suspended(&self) -> bool {
        self.lock().suspended
    }

    fn lock(&self) -> MutexGuard<'_, CacheState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn block_start(&self, idx: u64) -> DiskResult<u64> {
        idx.checked_mul(self.block_size as u64)
            .ok_or(DiskError::OffsetOverflow)
    }

    /// Bytes of block `idx` that lie inside the disk.
    fn block_len(&self, idx: u64) -> DiskResult<usize> {
        let start = self.block_start(idx)?;
        let capacity = self.container.capacity_bytes();
        Ok(capacity.saturating_sub(start).min(self.block_size as u64) as usize)
    }

    /// Calls `f(block_idx, offset_in_block, range_in_request)` for every block `[offset,
    /// offset + len)` touches.
    fn for_each_block(
        &self,
        offset: u64,
        len: usize,
        mut f: impl FnMut(u64, usize, std::ops::Range<usize>) -> DiskResult<()>,
    ) -> DiskResult<()> {
        let mut pos = 0usize;
        while pos < len {
            let abs = offset + pos as u64;
            let idx = abs / self.block_size as u64;
            let within = (abs % self.block_size as u64) as usize;
            let chunk = (self.block_size - within).min(len - pos);
            f(idx, within, pos..pos + chunk)?;
            pos += chunk;
        }
        Ok(())
    }

    fn write_back(&self, state: &mut CacheState, idx: u64, block: &CachedBlock) -> DiskResult<()> {
        if !block.dirty {
            return Ok(());
        }
        let len = self.block_len(idx)?;
        if len > 0 {
            self.container
                .write(self.block_start(idx)?, &block.data[..len])?;
        }
        state.stats.writebacks += 1;
        Ok(())
    }

    fn make_room(&self, state: &mut CacheState) -> DiskResult<()> {
        while state.blocks.len() >= state.blocks.cap().get() {
            let Some((&idx, lru)) = state.blocks.peek_lru() else {
                break;
            };
            if lru.dirty && state.suspended {
                return Err(DiskError::InvalidState("block cache is suspended".into()));
            }
            let Some((idx2, block)) = state.blocks.pop_lru() else {
                break;
            };
            debug_assert_eq!(idx, idx2);
            if let Err(err) = self.write_back(state, idx, &block) {
                // Keep the dirty data rather than lose it.
                state.blocks.put(idx, block);
                return Err(err);
            }
            state.stats.evictions += 1;
        }
        Ok(())
    }

    /// Makes block `idx` resident, reading it from the container on a miss.
    fn load<'a>(&self, state: &'a mut CacheState, idx: u64) -> DiskResult<&'a mut CachedBlock> {
        if state.blocks.contains(&idx) {
            state.stats.hits += 1;
        } else {
            state.stats.misses += 1;
            let mut data = Vec::new();
            data.try_reserve_exact(self.block_size)
                .map_err(|_| DiskError::QuotaExceeded)?;
            data.resize(self.block_size, 0);
            let len = self.block_len(idx)?;
            self.container.read(self.block_start(idx)?, &mut data[..len])?;
            self.make_room(state)?;
            state.blocks.put(idx, CachedBlock { data, dirty: false });
        }
        state
            .blocks
            .get_mut(&idx)
            .ok_or_else(|| DiskError::Io("cache lost a block it just loaded".into()))
    }

    fn read_into(&self, offset: u64, buf: &mut [u8]) -> DiskResult<()> {
        checked_range(offset, buf.len(), self.container.capacity_bytes())?;
        let mut state = self.lock();
        self.for_each_block(offset, buf.len(), |idx, within, range| {
            let block = self.load(&mut state, idx)?;
            let len = range.len();
            buf[range].copy_from_slice(&block.data[within..within + len]);
            Ok(())
        })
    }

    fn write_from(&self, offset: u64, buf: &[u8]) -> DiskResult<()> {
        if self.container.is_read_only() {
            return Err(DiskError::NotSupported("read-only image".into()));
        }
        checked_range(offset, buf.len(), self.container.capacity_bytes())?;
        let mut state = self.lock();
        self.for_each_block(offset, buf.len(), |idx, within, range| {
            let block = self.load(&mut state, idx)?;
            let len = range.len();
            block.data[within..within + len].copy_from_slice(&buf[range]);
            block.dirty = true;
            Ok(())
        })
    }

    fn write_back_all(&self, state: &mut CacheState) -> DiskResult<()> {
        let keys: Vec<u64> = state.blocks.iter().map(|(k, _)| *k).collect();
        for idx in keys {
            let Some(block) = state.blocks.peek(&idx) else {
                continue;
            };
            if !block.dirty {
                continue;
            }
            let len = self.block_len(idx)?;
            if len > 0 {
                self.container.write(self.block_start(idx)?, &block.data[..len])?;
            }
            state.stats.writebacks += 1;
            if let Some(block) = state.blocks.peek_mut(&idx) {
                block.dirty = false;
            }
        }
        Ok(())
    }

    fn flush_all(&self) -> DiskResult<()> {
        let mut state = self.lock();
        self.write_back_all(&mut state)?;
        drop(state);
        self.container.flush()
    }

    fn discard_ranges(&self, ranges: &[ByteRange]) -> DiskResult<()> {
        let mut state = self.lock();
        for range in ranges.iter().filter(|r| !r.is_empty()) {
            let first = range.start / self.block_size as u64;
            let last = (range.end - 1) / self.block_size as u64;
            let touched: Vec<u64> = state
                .blocks
                .iter()
                .map(|(k, _)| *k)
                .filter(|k| (first..=last).contains(k))
                .collect();
            // Dirty bytes outside the discarded range must survive the invalidation.
            for idx in touched {
                if let Some(block) = state.blocks.pop(&idx) {
                    if let Err(err) = self.write_back(&mut state, idx, &block) {
                        state.blocks.put(idx, block);
                        return Err(err);
                    }
                }
            }
        }
        drop(state);
        self.container.discard(ranges)
    }
}

impl BlockCache for LruBlockCache {
    fn read(&self, offset: u64, mut buf: IoBuffer, done: IoCompletion) -> AsyncIo {
        drop(done);
        let result = self.read_into(offset, &mut buf);
        AsyncIo::Done(IoOutcome::new(Some(buf), result))
    }

    fn write(&self, offset: u64, buf: IoBuffer, done: IoCompletion) -> AsyncIo {
        drop(done);
        let result = self.write_from(offset, &buf);
        AsyncIo::Done(IoOutcome::new(Some(buf), result))
    }

    fn flush(&self, done: IoCompletion) -> AsyncIo {
        drop(done);
        AsyncIo::Done(IoOutcome::new(None, self.flush_all()))
    }

    fn discard(&self, ranges: Vec<ByteRange>, done: IoCompletion) -> AsyncIo {
        drop(done);
        AsyncIo::Done(IoOutcome::new(None, self.discard_ranges(&ranges)))
    }

    fn suspend(&self) -> DiskResult<()> {
        let mut state = self.lock();
        self.write_back_all(&mut state)?;
        state.suspended = true;
        tracing::debug!(blocks = state.blocks.len(), "block cache suspended");
        Ok(())
    }

    fn resume(&self) -> DiskResult<()> {
        self.lock().suspended = false;
        Ok(())
    }

    fn clear(&self) -> DiskResult<()> {
        let mut state = self.lock();
        self.write_back_all(&mut state)?;
        state.blocks.clear();
        Ok(())
    }
}
