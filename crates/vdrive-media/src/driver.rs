//! The media driver: the asynchronous request engine and the synchronous media interface of
//! one attached medium.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use vdrive_storage::{ByteRange, DiskError};
use zeroize::Zeroizing;

use crate::adapter::{StorageAdapter, StorageOp};
use crate::block_cache::{BlockCache, LruBlockCache};
use crate::boot_accel::BootAccel;
use crate::buffer::{IoBufAllocator, IoBuffer};
use crate::config::MediaConfig;
use crate::container::{AsyncIo, DiskContainer, DiskResult, IoCompletion, IoOutcome};
use crate::keys::{SecKeyHelper, SecKeyStore};
use crate::merge::MergeGate;
use crate::port::MediaExPort;
use crate::registry::RequestRegistry;
use crate::request::{IoReqFlags, IoReqHandle, IoReqKind, IoRequest, RequestArena};
use crate::state::ReqState;
use crate::{MediaError, Result};

/// How a submitted request was accepted.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IoStatus {
    /// Finished during submission. The controller is not notified.
    Completed,
    /// [`MediaExPort::io_req_complete_notify`] will be called exactly once.
    InProgress,
}

#[derive(Debug)]
enum Submission {
    Read { offset: u64, len: usize },
    Write { offset: u64, len: usize },
    Flush,
    Discard(Vec<ByteRange>),
}

impl Submission {
    fn kind(&self) -> IoReqKind {
        match self {
            Submission::Read { .. } => IoReqKind::Read,
            Submission::Write { .. } => IoReqKind::Write,
            Submission::Flush => IoReqKind::Flush,
            Submission::Discard(_) => IoReqKind::Discard,
        }
    }

    fn extent(&self) -> (u64, usize) {
        match self {
            Submission::Read { offset, len } | Submission::Write { offset, len } => (*offset, *len),
            Submission::Flush | Submission::Discard(_) => (0, 0),
        }
    }
}

#[derive(Default)]
struct KeyState {
    store: Option<Arc<dyn SecKeyStore>>,
    helper: Option<Arc<dyn SecKeyHelper>>,
    dek: Option<Arc<Zeroizing<Vec<u8>>>>,
}

struct Shared {
    config: MediaConfig,
    read_only: bool,
    /// Writes are refused until power-on or resume.
    temp_read_only: AtomicBool,
    medium: MergeGate<Option<StorageAdapter>>,
    port: Option<Arc<dyn MediaExPort>>,
    arena: RequestArena,
    registry: RequestRegistry,
    active: AtomicU32,
    buffers: IoBufAllocator,
    boot: BootAccel,
    locked: AtomicBool,
    written_since_flush: AtomicU64,
    keys: RwLock<KeyState>,
}

/// Builder for [`MediaDriver`].
pub struct MediaDriverBuilder {
    config: MediaConfig,
    container: Arc<dyn DiskContainer>,
    port: Option<Arc<dyn MediaExPort>>,
    block_cache: Option<Arc<dyn BlockCache>>,
    key_store: Option<Arc<dyn SecKeyStore>>,
    key_helper: Option<Arc<dyn SecKeyHelper>>,
}

impl MediaDriverBuilder {
    /// Enables the request engine. Without a port only the synchronous interface works.
    pub fn port(mut self, port: Arc<dyn MediaExPort>) -> Self {
        self.port = Some(port);
        self
    }

    /// Uses `cache` instead of the default LRU cache when the configuration allows a cache.
    pub fn block_cache(mut self, cache: Arc<dyn BlockCache>) -> Self {
        self.block_cache = Some(cache);
        self
    }

    pub fn sec_key_if(
        mut self,
        store: Option<Arc<dyn SecKeyStore>>,
        helper: Option<Arc<dyn SecKeyHelper>>,
    ) -> Self {
        self.key_store = store;
        self.key_helper = helper;
        self
    }

    pub fn build(self) -> Result<MediaDriver> {
        let config = self.config;
        config.validate()?;
        let container = self.container;

        let cache = if config.block_cache_allowed() {
            match self.block_cache {
                Some(cache) => Some(cache),
                None => Some(
                    Arc::new(LruBlockCache::with_defaults(Arc::clone(&container))?)
                        as Arc<dyn BlockCache>,
                ),
            }
        } else {
            if config.block_cache || self.block_cache.is_some() {
                tracing::info!(
                    shareable = config.shareable,
                    discard = config.discard,
                    encrypted = config.encrypted,
                    "block cache disabled for this medium"
                );
            }
            None
        };

        let boot_accel = config.boot_acceleration_allowed() && !container.is_shareable();
        let read_only = config.read_only || container.is_read_only();
        tracing::info!(
            capacity = container.capacity_bytes(),
            read_only,
            temp_read_only = config.temp_read_only,
            block_cache = cache.is_some(),
            boot_acceleration = boot_accel,
            boot_acceleration_buffer = config.boot_acceleration_buffer,
            flush_interval = config.flush_interval,
            bw_group = ?config.bw_group,
            "attached medium"
        );

        let merge = config.merge_request();
        if let Some((source, target)) = merge {
            tracing::info!(source, target, "merge armed");
        }

        let shared = Shared {
            read_only,
            temp_read_only: AtomicBool::new(config.temp_read_only),
            medium: MergeGate::new(Some(StorageAdapter::new(container, cache)), merge),
            port: self.port,
            arena: RequestArena::new(0),
            registry: RequestRegistry::new(),
            active: AtomicU32::new(0),
            buffers: IoBufAllocator::new(config.encrypted),
            boot: BootAccel::new(boot_accel, config.boot_acceleration_buffer),
            locked: AtomicBool::new(false),
            written_since_flush: AtomicU64::new(0),
            keys: RwLock::new(KeyState::default()),
            config,
        };
        let driver = MediaDriver {
            shared: Arc::new(shared),
        };
        if self.key_store.is_some() || self.key_helper.is_some() {
            driver.set_sec_key_if(self.key_store, self.key_helper)?;
        }
        Ok(driver)
    }
}

/// Driver for one attached medium.
///
/// Clones share the same medium and request table. Completions may arrive on any thread; the
/// controller is notified exactly once for every request whose submission returned
/// [`IoStatus::InProgress`].
#[derive(Clone)]
pub struct MediaDriver {
    shared: Arc<Shared>,
}

impl MediaDriver {
    pub fn builder(config: MediaConfig, container: Arc<dyn DiskContainer>) -> MediaDriverBuilder {
        MediaDriverBuilder {
            config,
            container,
            port: None,
            block_cache: None,
            key_store: None,
            key_helper: None,
        }
    }

    pub fn config(&self) -> &MediaConfig {
        &self.shared.config
    }

    // Request engine.

    /// Sets the size of the controller-owned bytes carried by every request.
    ///
    /// Fails with [`MediaError::InvalidState`] once a request was allocated.
    pub fn io_req_alloc_size_set(&self, size: usize) -> Result<()> {
        self.shared.arena.set_alloc_size(size)
    }

    pub fn io_req_alloc(&self, id: u64, flags: IoReqFlags) -> Result<IoReqHandle> {
        let shared = &self.shared;
        shared.port()?;
        let req = shared.arena.acquire(id, flags)?;
        let handle = req.handle();
        if let Err(err) = shared.registry.insert(&req) {
            // The slot was never visible to anyone else.
            if req.state.retire(handle.generation()).is_ok() {
                shared.arena.release(&req);
            }
            return Err(err);
        }
        tracing::debug!(id, %handle, ?flags, "allocated request");
        Ok(handle)
    }

    /// Returns a request to the free-list.
    ///
    /// Allowed from `Allocated` and `Completed`, and from `Canceled` once storage no longer
    /// holds the request.
    pub fn io_req_free(&self, handle: IoReqHandle) -> Result<()> {
        let shared = &self.shared;
        let req = shared.arena.get(handle)?;
        if let Err(seen) = req.state.retire(handle.generation()) {
            if seen.generation != handle.generation() || seen.state == ReqState::Free {
                return Err(MediaError::InvalidHandle);
            }
            return Err(MediaError::InvalidState("request is still in flight"));
        }

        let id = req.id();
        shared.registry.remove(&req);
        shared.arena.release(&req);
        tracing::debug!(id, %handle, "freed request");
        Ok(())
    }

    pub fn io_req_read(&self, handle: IoReqHandle, offset: u64, len: usize) -> Result<IoStatus> {
        self.submit(handle, Submission::Read { offset, len })
    }

    pub fn io_req_write(&self, handle: IoReqHandle, offset: u64, len: usize) -> Result<IoStatus> {
        self.submit(handle, Submission::Write { offset, len })
    }

    pub fn io_req_flush(&self, handle: IoReqHandle) -> Result<IoStatus> {
        self.submit(handle, Submission::Flush)
    }

    pub fn io_req_discard(&self, handle: IoReqHandle, ranges: Vec<ByteRange>) -> Result<IoStatus> {
        self.submit(handle, Submission::Discard(ranges))
    }

    /// Cancels the request registered under `id`.
    ///
    /// Storage I/O already under way is not aborted; the request reports
    /// [`MediaError::Canceled`] when it comes back.
    pub fn io_req_cancel(&self, id: u64) -> Result<()> {
        self.shared.registry.find_and_cancel(id, &self.shared.active)
    }

    pub fn io_req_cancel_all(&self) -> usize {
        let canceled = self.shared.registry.cancel_all(&self.shared.active);
        if canceled > 0 {
            tracing::debug!(canceled, "canceled all requests");
        }
        canceled
    }

    pub fn io_req_active_count(&self) -> u32 {
        self.shared.active.load(Ordering::Acquire)
    }

    pub fn io_req_query_state(&self, handle: IoReqHandle) -> Result<ReqState> {
        Ok(self.shared.arena.get(handle)?.state.load())
    }

    /// Lends the request's controller-owned bytes to `f`.
    pub fn io_req_with_alloc<R>(
        &self,
        handle: IoReqHandle,
        f: impl FnOnce(&mut [u8]) -> R,
    ) -> Result<R> {
        let req = self.shared.arena.get(handle)?;
        let mut alloc = req.alloc();
        Ok(f(&mut alloc))
    }

    fn submit(&self, handle: IoReqHandle, submission: Submission) -> Result<IoStatus> {
        let shared = &self.shared;
        let port = shared.port()?;
        let req = shared.arena.get(handle)?;
        match req.state.load() {
            ReqState::Allocated => {}
            ReqState::Canceled => return Err(MediaError::Canceled),
            _ => return Err(MediaError::InvalidState("request was already submitted")),
        }

        let kind = submission.kind();
        let (offset, len) = submission.extent();
        {
            let mut data = req.data();
            // Freed and recycled since the lookup.
            if req.state.generation() != handle.generation() {
                return Err(MediaError::InvalidHandle);
            }
            match data.kind {
                None => data.kind = Some(kind),
                Some(set) if set == kind => {}
                Some(_) => return Err(MediaError::InvalidState("request type is already set")),
            }
            data.offset = offset;
            data.len = len;
        }

        if matches!(kind, IoReqKind::Write | IoReqKind::Discard) {
            shared.check_writable()?;
        }
        if kind == IoReqKind::Discard && !shared.config.discard {
            return Err(DiskError::NotSupported("discard is disabled".into()).into());
        }
        shared.check_key_prereqs()?;

        let medium = shared.medium.read();
        let adapter = medium.as_ref().ok_or(MediaError::NotMounted)?;
        shared.boot.deactivate();

        let op = match submission {
            Submission::Read { offset, len } => Some(StorageOp::Read {
                offset,
                buf: shared.buffers.alloc(len)?,
            }),
            Submission::Write { offset, len } => {
                let mut buf = shared.buffers.alloc(len)?;
                port.io_req_copy_from_buf(handle, &mut req.alloc(), 0, &mut buf)?;
                Some(StorageOp::Write { offset, buf })
            }
            Submission::Flush if shared.config.ignore_flush_async => None,
            Submission::Flush => Some(StorageOp::Flush),
            Submission::Discard(ranges) => {
                shared.boot.invalidate();
                Some(StorageOp::Discard { ranges })
            }
        };

        // Storage owns the request from here; a cancel arriving now leaves it unfreeable until
        // the completion comes back. The compare-exchange includes the generation, so a
        // submission that waited out a cancel, free and reallocation of its slot loses here.
        shared.active.fetch_add(1, Ordering::AcqRel);
        let generation = handle.generation();
        if let Err(seen) = req
            .state
            .transition(generation, ReqState::Allocated, ReqState::Active)
        {
            shared.active.fetch_sub(1, Ordering::AcqRel);
            return Err(match seen.state {
                _ if seen.generation != generation => MediaError::InvalidHandle,
                ReqState::Canceled => MediaError::Canceled,
                _ => MediaError::InvalidState("request was already submitted"),
            });
        }
        tracing::trace!(id = req.id(), %handle, ?kind, offset, len, "dispatching request");

        let outcome = match op {
            None => IoOutcome::ok(None),
            Some(op) => match adapter.dispatch(op, shared.completion(&req, handle)) {
                AsyncIo::Done(outcome) => outcome,
                AsyncIo::InProgress => return Ok(IoStatus::InProgress),
            },
        };
        drop(medium);

        let Some(result) = shared.settle(&req, handle, outcome) else {
            return Err(MediaError::InvalidState("request completed twice"));
        };
        shared.seal(&req, handle);
        result.map(|()| IoStatus::Completed)
    }

    // Synchronous media interface.

    pub fn read(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let shared = &self.shared;
        shared.check_key_prereqs()?;
        let medium = shared.medium.read();
        let adapter = medium.as_ref().ok_or(MediaError::NotMounted)?;
        let len = buf.len();
        shared
            .boot
            .read(offset, buf, adapter.capacity_bytes(), |offset, out| {
                adapter.read(offset, out)
            })
            .inspect_err(|err| tracing::warn!(offset, len, error = %err, "read failed"))?;
        Ok(())
    }

    pub fn write(&self, offset: u64, data: &[u8]) -> Result<()> {
        let shared = &self.shared;
        shared.check_writable()?;
        shared.check_key_prereqs()?;
        let medium = shared.medium.read();
        let adapter = medium.as_ref().ok_or(MediaError::NotMounted)?;

        shared.boot.invalidate();
        adapter
            .write(offset, data)
            .inspect_err(|err| tracing::warn!(offset, len = data.len(), error = %err, "write failed"))?;

        let interval = shared.config.flush_interval;
        if interval > 0 {
            let len = data.len() as u64;
            let written = shared.written_since_flush.fetch_add(len, Ordering::AcqRel) + len;
            if written > interval {
                shared.written_since_flush.store(0, Ordering::Release);
                tracing::trace!(written, interval, "flush interval reached");
                adapter.flush()?;
            }
        }
        Ok(())
    }

    pub fn flush(&self) -> Result<()> {
        let medium = self.shared.medium.read();
        let adapter = medium.as_ref().ok_or(MediaError::NotMounted)?;
        if self.shared.config.ignore_flush {
            return Ok(());
        }
        adapter
            .flush()
            .inspect_err(|err| tracing::warn!(error = %err, "flush failed"))?;
        Ok(())
    }

    pub fn discard(&self, ranges: &[ByteRange]) -> Result<()> {
        let shared = &self.shared;
        shared.check_writable()?;
        if !shared.config.discard {
            return Err(DiskError::NotSupported("discard is disabled".into()).into());
        }
        shared.check_key_prereqs()?;
        let medium = shared.medium.read();
        let adapter = medium.as_ref().ok_or(MediaError::NotMounted)?;
        shared.boot.invalidate();
        adapter.discard(ranges)?;
        Ok(())
    }

    /// Runs the merge armed at attach time, at most once.
    ///
    /// All other I/O on this medium waits until the merge is done. Calls after the first, or
    /// after power-off, do nothing.
    pub fn merge(&self, progress: &mut dyn FnMut(u32)) -> Result<()> {
        let ran = self.shared.medium.run_pending(|medium, source, target| -> Result<()> {
            let adapter = medium.as_ref().ok_or(MediaError::NotMounted)?;
            tracing::debug!(source, target, "merging images");
            adapter.merge(source, target, progress)?;
            Ok(())
        });
        match ran {
            None => Ok(()),
            Some(result) => result
                .inspect(|()| tracing::info!("merge finished"))
                .inspect_err(|err| tracing::error!(error = %err, "merge failed")),
        }
    }

    pub fn is_boot_acceleration_active(&self) -> bool {
        self.shared.boot.is_active()
    }

    pub fn is_merge_pending(&self) -> bool {
        self.shared.medium.is_pending()
    }

    pub fn get_size(&self) -> Result<u64> {
        let medium = self.shared.medium.read();
        let adapter = medium.as_ref().ok_or(MediaError::NotMounted)?;
        Ok(adapter.capacity_bytes())
    }

    /// Whether writes are currently refused, permanently or until power-on/resume.
    pub fn is_read_only(&self) -> bool {
        self.shared.read_only || self.shared.temp_read_only.load(Ordering::Acquire)
    }

    pub fn io_buf_alloc(&self, size: usize) -> Result<IoBuffer> {
        self.shared.buffers.alloc(size)
    }

    pub fn io_buf_free(&self, buf: IoBuffer, size: usize) -> Result<()> {
        self.shared.buffers.free(buf, size)
    }

    // Lifecycle.

    /// VM reset: drops cached blocks and re-arms boot acceleration.
    pub fn reset(&self) {
        let medium = self.shared.medium.read();
        if let Some(cache) = medium.as_ref().and_then(StorageAdapter::cache) {
            if let Err(err) = cache.clear() {
                tracing::warn!(error = %err, "failed to clear block cache on reset");
            }
        }
        drop(medium);
        self.shared.boot.reset();
        tracing::debug!("medium reset");
    }

    /// Makes a medium attached with `temp_read_only` writable.
    pub fn power_on(&self) {
        self.set_temp_read_only(false);
    }

    /// Writes the block cache back and refuses writes until [`MediaDriver::resume`].
    pub fn suspend(&self) -> Result<()> {
        self.with_cache(|cache| cache.suspend())?;
        self.set_temp_read_only(true);
        Ok(())
    }

    pub fn resume(&self) -> Result<()> {
        self.set_temp_read_only(false);
        self.with_cache(|cache| cache.resume())
    }

    fn set_temp_read_only(&self, temp: bool) {
        if self.shared.temp_read_only.swap(temp, Ordering::AcqRel) != temp {
            tracing::debug!(temp_read_only = temp, "medium write access changed");
        }
    }

    fn with_cache(&self, f: impl FnOnce(&Arc<dyn BlockCache>) -> DiskResult<()>) -> Result<()> {
        let medium = self.shared.medium.read();
        if let Some(cache) = medium.as_ref().and_then(StorageAdapter::cache) {
            f(cache)?;
        }
        Ok(())
    }

    /// Tears the medium down: drops a pending merge, cancels every outstanding request and
    /// unmounts.
    pub fn power_off(&self) {
        let shared = &self.shared;
        if shared.medium.disarm() {
            tracing::info!("pending merge dropped at power-off");
        }
        let canceled = shared.registry.cancel_all(&shared.active);
        let adapter = shared.medium.write().take();
        if let Some(adapter) = adapter {
            close(adapter);
        }
        shared.release_key(&mut shared.keys_mut());
        tracing::info!(canceled, "medium powered off");
    }

    pub fn is_mounted(&self) -> bool {
        self.shared.medium.read().is_some()
    }

    pub fn lock(&self) -> Result<()> {
        self.set_locked(true)
    }

    pub fn unlock(&self) -> Result<()> {
        self.set_locked(false)
    }

    fn set_locked(&self, locked: bool) -> Result<()> {
        if !self.is_mounted() {
            return Err(MediaError::NotMounted);
        }
        self.shared.locked.store(locked, Ordering::Release);
        tracing::debug!(locked, "medium lock changed");
        Ok(())
    }

    pub fn is_locked(&self) -> bool {
        self.shared.locked.load(Ordering::Acquire)
    }

    /// Removes the medium. A locked medium is only removed with `force`.
    pub fn unmount(&self, force: bool) -> Result<()> {
        let shared = &self.shared;
        if shared.locked.load(Ordering::Acquire) && !force {
            return Err(MediaError::MediaLocked);
        }
        let adapter = shared.medium.write().take().ok_or(MediaError::NotMounted)?;
        close(adapter);
        shared.locked.store(false, Ordering::Release);
        tracing::info!(force, "medium unmounted");
        Ok(())
    }

    // Encryption.

    /// Installs the secure key store and helper, releasing any key held from a previous store.
    ///
    /// For an encrypted medium the configured key is retained right away; a missing key fails
    /// the call and leaves no store installed.
    pub fn set_sec_key_if(
        &self,
        store: Option<Arc<dyn SecKeyStore>>,
        helper: Option<Arc<dyn SecKeyHelper>>,
    ) -> Result<()> {
        let shared = &self.shared;
        let mut keys = shared.keys_mut();
        shared.release_key(&mut keys);
        keys.helper = helper;

        let Some(store) = store else {
            return Ok(());
        };
        if let (true, Some(id)) = (shared.config.encrypted, shared.config.key_id.as_deref()) {
            keys.dek = Some(store.key_retain(id)?);
            tracing::debug!(key_id = id, "retained data encryption key");
        }
        keys.store = Some(store);
        Ok(())
    }
}

/// Writes back the block cache of a medium being removed.
fn close(adapter: StorageAdapter) {
    if let Some(cache) = adapter.cache() {
        if let Err(err) = cache.clear() {
            tracing::error!(error = %err, "block cache write-back failed while closing medium");
        }
    }
}

impl Shared {
    fn port(&self) -> Result<&Arc<dyn MediaExPort>> {
        self.port
            .as_ref()
            .ok_or(MediaError::InvalidState("no controller port attached"))
    }

    fn keys(&self) -> RwLockReadGuard<'_, KeyState> {
        self.keys.read().unwrap_or_else(|p| p.into_inner())
    }

    fn keys_mut(&self) -> RwLockWriteGuard<'_, KeyState> {
        self.keys.write().unwrap_or_else(|p| p.into_inner())
    }

    fn check_writable(&self) -> Result<()> {
        if self.read_only || self.temp_read_only.load(Ordering::Acquire) {
            return Err(MediaError::ReadOnly);
        }
        Ok(())
    }

    fn check_key_prereqs(&self) -> Result<()> {
        if !self.config.encrypted {
            return Ok(());
        }
        let keys = self.keys();
        if keys.dek.is_some() {
            return Ok(());
        }
        if let Some(helper) = &keys.helper {
            helper.key_missing_notify();
        }
        tracing::warn!(key_id = ?self.config.key_id, "data encryption key is missing");
        Err(MediaError::DekMissing)
    }

    fn release_key(&self, keys: &mut KeyState) {
        let dek = keys.dek.take();
        let store = keys.store.take();
        if let (Some(store), Some(_), Some(id)) = (store, dek, self.config.key_id.as_deref()) {
            if let Err(err) = store.key_release(id) {
                tracing::warn!(key_id = id, error = %err, "failed to release data encryption key");
            }
        }
    }

    fn completion(self: &Arc<Self>, req: &Arc<IoRequest>, handle: IoReqHandle) -> IoCompletion {
        let shared = Arc::downgrade(self);
        let req = Arc::clone(req);
        IoCompletion::new(move |outcome| match shared.upgrade() {
            Some(shared) => shared.complete_deferred(&req, handle, outcome),
            None => tracing::debug!(%handle, "completion after driver teardown dropped"),
        })
    }

    fn complete_deferred(&self, req: &IoRequest, handle: IoReqHandle, outcome: IoOutcome) {
        let Some(result) = self.settle(req, handle, outcome) else {
            return;
        };
        // A slot whose trailing bytes are lent is never recycled, so holding them across the
        // terminal store keeps `handle` valid until the controller has been notified.
        let mut alloc = req.alloc();
        self.seal(req, handle);
        match &self.port {
            Some(port) => port.io_req_complete_notify(handle, &mut alloc, result),
            None => tracing::error!(%handle, "completed request has no port to notify"),
        }
    }

    /// Runs the completion path shared by immediate and deferred completions, up to the
    /// terminal store made by [`Shared::seal`].
    ///
    /// Returns `None` for a completion of a request that was not in flight under `handle`.
    fn settle(
        &self,
        req: &IoRequest,
        handle: IoReqHandle,
        outcome: IoOutcome,
    ) -> Option<Result<()>> {
        let IoOutcome { buf, result } = outcome;
        let generation = handle.generation();
        let won = match req
            .state
            .transition(generation, ReqState::Active, ReqState::Completing)
        {
            Ok(()) => {
                self.active.fetch_sub(1, Ordering::AcqRel);
                true
            }
            Err(seen) if seen.generation == generation && seen.state == ReqState::Canceled => {
                // The canceler already took the request out of the active count.
                let settled =
                    req.state
                        .transition(generation, ReqState::Canceled, ReqState::Completing);
                if let Err(seen) = settled {
                    tracing::error!(
                        %handle,
                        state = ?seen.state,
                        "canceled request changed state in flight"
                    );
                    return None;
                }
                false
            }
            Err(seen) => {
                tracing::error!(
                    %handle,
                    state = ?seen.state,
                    generation = seen.generation,
                    "completion for a request not in flight"
                );
                return None;
            }
        };

        let result = if won {
            self.read_back(req, handle, buf.as_ref(), result)
        } else {
            Err(MediaError::Canceled)
        };
        if let Err(err) = &result {
            if !err.is_canceled() {
                let data = req.data();
                tracing::warn!(
                    id = req.id(),
                    %handle,
                    kind = ?data.kind,
                    flags = ?data.flags,
                    offset = data.offset,
                    len = data.len,
                    error = %err,
                    "request failed"
                );
            }
        }
        req.data().buf = buf;
        Some(result)
    }

    /// `Completing -> Completed`. Clears the storage-holds-it flag in the same step, after
    /// which the controller may free the request.
    fn seal(&self, req: &IoRequest, handle: IoReqHandle) {
        match req
            .state
            .transition(handle.generation(), ReqState::Completing, ReqState::Completed)
        {
            Ok(()) => tracing::trace!(id = req.id(), %handle, "request completed"),
            Err(seen) => {
                tracing::error!(%handle, state = ?seen.state, "completing request changed owner")
            }
        }
    }

    /// Copies a successful read out to the controller.
    fn read_back(
        &self,
        req: &IoRequest,
        handle: IoReqHandle,
        buf: Option<&IoBuffer>,
        result: DiskResult<()>,
    ) -> Result<()> {
        result?;
        let Some(buf) = buf else {
            return Ok(());
        };
        if req.data().kind != Some(IoReqKind::Read) {
            return Ok(());
        }
        self.port()?
            .io_req_copy_to_buf(handle, &mut req.alloc(), 0, buf)
    }
}

impl Drop for Shared {
    fn drop(&mut self) {
        self.medium.disarm();
        let mut keys = std::mem::take(self.keys.get_mut().unwrap_or_else(|p| p.into_inner()));
        self.release_key(&mut keys);
    }
}
