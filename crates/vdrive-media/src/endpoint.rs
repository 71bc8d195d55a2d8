//! Asynchronous-completion endpoints and the raw image built on them.
//!
//! An endpoint is one backing file of the host's completion-based I/O layer: operations are
//! submitted with a completion callback and finish either during submission or later on an
//! arbitrary thread. [`EndpointStorage`] adds the blocking convenience path on top, and
//! [`EndpointImage`] presents an endpoint as a [`DiskContainer`].

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tokio::runtime::Handle;
use vdrive_storage::{ByteRange, DiskError, StdFileBackend, StorageBackend};

use crate::buffer::IoBuffer;
use crate::config::MediaConfig;
use crate::container::{
    wait_for_completion, AsyncIo, DiskContainer, DiskResult, IoCompletion, IoOutcome,
};
use crate::{MediaError, Result};

#[derive(Debug)]
pub enum EndpointOp {
    Read { offset: u64, buf: IoBuffer },
    Write { offset: u64, buf: IoBuffer },
    Flush,
}

pub trait AsyncEndpoint: Send + Sync {
    fn size(&self) -> DiskResult<u64>;

    fn is_read_only(&self) -> bool;

    /// Starts `op`. `done` is invoked exactly once unless the operation finishes during
    /// submission, in which case the outcome is returned as [`AsyncIo::Done`].
    fn submit(&self, op: EndpointOp, done: IoCompletion) -> AsyncIo;
}

/// Endpoint servicing a [`StorageBackend`] on a tokio runtime's blocking pool.
///
/// Completions run on blocking-pool threads, never on the submitting thread.
pub struct BackendEndpoint<B> {
    backend: Arc<Mutex<B>>,
    runtime: Handle,
    read_only: bool,
}

impl<B: StorageBackend + Send + 'static> BackendEndpoint<B> {
    pub fn new(backend: B, runtime: Handle) -> Self {
        let read_only = backend.is_read_only();
        Self {
            backend: Arc::new(Mutex::new(backend)),
            runtime,
            read_only,
        }
    }

    fn run(backend: &Mutex<B>, op: EndpointOp) -> IoOutcome {
        let mut backend = backend.lock().unwrap_or_else(|p| p.into_inner());
        match op {
            EndpointOp::Read { offset, mut buf } => {
                let result = backend.read_at(offset, &mut buf);
                IoOutcome::new(Some(buf), result)
            }
            EndpointOp::Write { offset, buf } => {
                let result = backend.write_at(offset, &buf);
                IoOutcome::new(Some(buf), result)
            }
            EndpointOp::Flush => IoOutcome::new(None, backend.flush()),
        }
    }
}

impl<B: StorageBackend + Send + 'static> AsyncEndpoint for BackendEndpoint<B> {
    fn size(&self) -> DiskResult<u64> {
        self.backend.lock().unwrap_or_else(|p| p.into_inner()).len()
    }

    fn is_read_only(&self) -> bool {
        self.read_only
    }

    fn submit(&self, op: EndpointOp, done: IoCompletion) -> AsyncIo {
        let backend = Arc::clone(&self.backend);
        // The join handle is dropped: completion is reported through `done` only.
        let _task = self.runtime.spawn_blocking(move || {
            let outcome = Self::run(&backend, op);
            if let Err(err) = &outcome.result {
                tracing::warn!(error = %err, "endpoint operation failed");
            }
            done.complete(outcome);
        });
        AsyncIo::InProgress
    }
}

/// Storage over an endpoint, with a blocking path for callers that cannot take completions.
///
/// At most one synchronous call may be outstanding per storage; a second concurrent one is
/// refused with [`DiskError::InvalidState`].
pub struct EndpointStorage<E> {
    endpoint: E,
    sync_pending: AtomicBool,
}

/// Clears the storage's pending flag when the synchronous call returns.
struct SyncSlot<'a>(&'a AtomicBool);

impl Drop for SyncSlot<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl<E: AsyncEndpoint> EndpointStorage<E> {
    pub fn new(endpoint: E) -> Self {
        Self {
            endpoint,
            sync_pending: AtomicBool::new(false),
        }
    }

    pub fn endpoint(&self) -> &E {
        &self.endpoint
    }

    /// Submits `op` and blocks until it completes.
    ///
    /// Must not be called from inside an async runtime worker.
    fn run_sync(&self, op: EndpointOp) -> DiskResult<Option<IoBuffer>> {
        if self.sync_pending.swap(true, Ordering::AcqRel) {
            return Err(DiskError::InvalidState(
                "synchronous request already pending".into(),
            ));
        }
        let _slot = SyncSlot(&self.sync_pending);

        let outcome = wait_for_completion(|done| self.endpoint.submit(op, done))?;
        outcome.result?;
        Ok(outcome.buf)
    }

    pub fn read_sync(&self, offset: u64, out: &mut [u8]) -> DiskResult<()> {
        let buf = IoBuffer::page_aligned(out.len()).map_err(|err| DiskError::Io(err.to_string()))?;
        let buf = self.run_sync(EndpointOp::Read { offset, buf })?;
        let buf = buf.ok_or_else(|| DiskError::Io("endpoint returned no read buffer".into()))?;
        out.copy_from_slice(&buf);
        Ok(())
    }

    pub fn write_sync(&self, offset: u64, data: &[u8]) -> DiskResult<()> {
        let mut buf =
            IoBuffer::page_aligned(data.len()).map_err(|err| DiskError::Io(err.to_string()))?;
        buf.copy_from_slice(data);
        self.run_sync(EndpointOp::Write { offset, buf }).map(drop)
    }

    pub fn flush_sync(&self) -> DiskResult<()> {
        self.run_sync(EndpointOp::Flush).map(drop)
    }

    pub fn submit(&self, op: EndpointOp, done: IoCompletion) -> AsyncIo {
        self.endpoint.submit(op, done)
    }
}

/// Raw image over an asynchronous endpoint.
///
/// Synchronous container calls are serialized onto the storage's single blocking channel;
/// `start_*` calls go straight to the endpoint.
pub struct EndpointImage<E> {
    storage: EndpointStorage<E>,
    sync_lock: Mutex<()>,
    capacity: u64,
    read_only: bool,
    shareable: bool,
}

impl<E: AsyncEndpoint> EndpointImage<E> {
    pub fn new(endpoint: E) -> DiskResult<Self> {
        let capacity = endpoint.size()?;
        let read_only = endpoint.is_read_only();
        Ok(Self {
            storage: EndpointStorage::new(endpoint),
            sync_lock: Mutex::new(()),
            capacity,
            read_only,
            shareable: false,
        })
    }

    pub fn with_shareable(mut self, shareable: bool) -> Self {
        self.shareable = shareable;
        self
    }

    pub fn storage(&self) -> &EndpointStorage<E> {
        &self.storage
    }

    fn check_range(&self, offset: u64, len: usize) -> DiskResult<()> {
        vdrive_storage::checked_range(offset, len, self.capacity).map(drop)
    }

    fn ensure_writable(&self) -> DiskResult<()> {
        if self.read_only {
            return Err(DiskError::NotSupported("read-only image".into()));
        }
        Ok(())
    }

    fn with_sync<R>(&self, f: impl FnOnce(&EndpointStorage<E>) -> R) -> R {
        let _guard = self.sync_lock.lock().unwrap_or_else(|p| p.into_inner());
        f(&self.storage)
    }
}

impl<E: AsyncEndpoint> DiskContainer for EndpointImage<E> {
    fn capacity_bytes(&self) -> u64 {
        self.capacity
    }

    fn is_read_only(&self) -> bool {
        self.read_only
    }

    fn is_shareable(&self) -> bool {
        self.shareable
    }

    fn read(&self, offset: u64, buf: &mut [u8]) -> DiskResult<()> {
        self.check_range(offset, buf.len())?;
        self.with_sync(|storage| storage.read_sync(offset, buf))
    }

    fn write(&self, offset: u64, buf: &[u8]) -> DiskResult<()> {
        self.ensure_writable()?;
        self.check_range(offset, buf.len())?;
        self.with_sync(|storage| storage.write_sync(offset, buf))
    }

    fn flush(&self) -> DiskResult<()> {
        self.with_sync(|storage| storage.flush_sync())
    }

    fn discard(&self, _ranges: &[ByteRange]) -> DiskResult<()> {
        Err(DiskError::NotSupported(
            "raw endpoint images cannot discard".into(),
        ))
    }

    fn start_read(&self, offset: u64, buf: IoBuffer, done: IoCompletion) -> AsyncIo {
        if let Err(err) = self.check_range(offset, buf.len()) {
            return AsyncIo::Done(IoOutcome::new(Some(buf), Err(err)));
        }
        self.storage.submit(EndpointOp::Read { offset, buf }, done)
    }

    fn start_write(&self, offset: u64, buf: IoBuffer, done: IoCompletion) -> AsyncIo {
        if let Err(err) = self
            .ensure_writable()
            .and_then(|()| self.check_range(offset, buf.len()))
        {
            return AsyncIo::Done(IoOutcome::new(Some(buf), Err(err)));
        }
        self.storage.submit(EndpointOp::Write { offset, buf }, done)
    }

    fn start_flush(&self, done: IoCompletion) -> AsyncIo {
        self.storage.submit(EndpointOp::Flush, done)
    }
}

/// Opens the raw image named by `config` on a host file.
pub fn open_raw_file(
    config: &MediaConfig,
    runtime: Handle,
) -> Result<EndpointImage<BackendEndpoint<StdFileBackend>>> {
    if !config.format.eq_ignore_ascii_case("raw") {
        return Err(MediaError::Storage(DiskError::NotSupported(format!(
            "image format {}",
            config.format
        ))));
    }
    let path = config
        .path
        .as_deref()
        .ok_or(MediaError::Storage(DiskError::InvalidConfig("image path is missing")))?;
    let backend = open_backend(path, config.read_only)?;
    let image = EndpointImage::new(BackendEndpoint::new(backend, runtime))?;
    tracing::info!(path = %path.display(), capacity = image.capacity_bytes(), "opened raw image");
    Ok(image.with_shareable(config.shareable))
}

fn open_backend(path: &Path, read_only: bool) -> DiskResult<StdFileBackend> {
    if read_only {
        StdFileBackend::open_read_only(path)
    } else {
        StdFileBackend::open(path)
    }
}
