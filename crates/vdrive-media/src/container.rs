//! The virtual-disk container the driver sits on.
//!
//! A container exposes synchronous I/O for BIOS-style callers and an asynchronous `start_*`
//! API for the request engine. Asynchronous I/O uses owned buffers: the request's data
//! segment moves into the container and comes back with the completion, so storage never
//! borrows memory from a request that may be canceled underneath it.

use std::fmt;
use std::sync::Mutex;

use tokio::sync::oneshot;
use vdrive_storage::{ByteRange, DiskError, VirtualDisk};

use crate::buffer::IoBuffer;

pub type DiskResult<T> = vdrive_storage::Result<T>;

/// Result of one storage operation together with the buffer it was handed.
#[derive(Debug)]
pub struct IoOutcome {
    pub buf: Option<IoBuffer>,
    pub result: DiskResult<()>,
}

impl IoOutcome {
    pub fn new(buf: Option<IoBuffer>, result: DiskResult<()>) -> Self {
        Self { buf, result }
    }

    pub fn ok(buf: Option<IoBuffer>) -> Self {
        Self::new(buf, Ok(()))
    }
}

/// Completion callback for an operation reported as [`AsyncIo::InProgress`].
///
/// The callback carries its own context (the request it belongs to), and may be invoked on
/// any thread. It must be invoked at most once; dropping it without invoking it leaves the
/// request in flight.
pub struct IoCompletion(Box<dyn FnOnce(IoOutcome) + Send + 'static>);

impl IoCompletion {
    pub fn new(f: impl FnOnce(IoOutcome) + Send + 'static) -> Self {
        Self(Box::new(f))
    }

    pub fn complete(self, outcome: IoOutcome) {
        (self.0)(outcome)
    }
}

impl fmt::Debug for IoCompletion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("IoCompletion")
    }
}

/// How a storage operation was accepted.
#[derive(Debug)]
pub enum AsyncIo {
    /// Finished during submission; the completion callback was dropped unused.
    Done(IoOutcome),
    /// The completion callback will be invoked later.
    InProgress,
}

/// Starts an operation and blocks the calling thread until it completes.
///
/// Must not be called from inside an async runtime worker. A completion dropped without being
/// invoked is reported as [`DiskError::BackendUnavailable`].
pub(crate) fn wait_for_completion(
    start: impl FnOnce(IoCompletion) -> AsyncIo,
) -> DiskResult<IoOutcome> {
    let (tx, rx) = oneshot::channel();
    let done = IoCompletion::new(move |outcome| {
        // The waiter only goes away if the calling thread unwound.
        let _ = tx.send(outcome);
    });
    match start(done) {
        AsyncIo::Done(outcome) => Ok(outcome),
        AsyncIo::InProgress => rx.blocking_recv().map_err(|_| DiskError::BackendUnavailable),
    }
}

pub trait DiskContainer: Send + Sync {
    fn capacity_bytes(&self) -> u64;

    fn is_read_only(&self) -> bool;

    /// Whether the image may be attached to several VMs at once.
    fn is_shareable(&self) -> bool {
        false
    }

    fn read(&self, offset: u64, buf: &mut [u8]) -> DiskResult<()>;

    fn write(&self, offset: u64, buf: &[u8]) -> DiskResult<()>;

    fn flush(&self) -> DiskResult<()>;

    fn discard(&self, ranges: &[ByteRange]) -> DiskResult<()>;

    /// Merges image `source` of the chain into image `target`, reporting percent done.
    fn merge(&self, source: u32, target: u32, progress: &mut dyn FnMut(u32)) -> DiskResult<()> {
        let _ = (source, target, progress);
        Err(DiskError::NotSupported("container has no image chain".into()))
    }

    // The default `start_*` methods run synchronously; containers without an asynchronous
    // path still complete through the same request state machine.

    fn start_read(&self, offset: u64, mut buf: IoBuffer, done: IoCompletion) -> AsyncIo {
        drop(done);
        let result = self.read(offset, &mut buf);
        AsyncIo::Done(IoOutcome::new(Some(buf), result))
    }

    fn start_write(&self, offset: u64, buf: IoBuffer, done: IoCompletion) -> AsyncIo {
        drop(done);
        let result = self.write(offset, &buf);
        AsyncIo::Done(IoOutcome::new(Some(buf), result))
    }

    fn start_flush(&self, done: IoCompletion) -> AsyncIo {
        drop(done);
        AsyncIo::Done(IoOutcome::new(None, self.flush()))
    }

    fn start_discard(&self, ranges: Vec<ByteRange>, done: IoCompletion) -> AsyncIo {
        drop(done);
        AsyncIo::Done(IoOutcome::new(None, self.discard(&ranges)))
    }
}

/// Container over a single [`VirtualDisk`], serialized by a mutex.
pub struct DiskImage<D> {
    disk: Mutex<D>,
    capacity: u64,
    read_only: bool,
    shareable: bool,
}

impl<D: VirtualDisk + Send> DiskImage<D> {
    pub fn new(disk: D) -> Self {
        let capacity = disk.capacity_bytes();
        let read_only = disk.is_read_only();
        Self {
            disk: Mutex::new(disk),
            capacity,
            read_only,
            shareable: false,
        }
    }

    pub fn with_read_only(mut self, read_only: bool) -> Self {
        self.read_only |= read_only;
        self
    }

    pub fn with_shareable(mut self, shareable: bool) -> Self {
        self.shareable = shareable;
        self
    }

    pub fn into_inner(self) -> D {
        self.disk.into_inner().unwrap_or_else(|p| p.into_inner())
    }

    fn with_disk<R>(&self, f: impl FnOnce(&mut D) -> R) -> R {
        // A poisoned lock only means another caller panicked mid-operation; the disk itself
        // stays usable.
        let mut disk = self.disk.lock().unwrap_or_else(|p| p.into_inner());
        f(&mut disk)
    }

    fn ensure_writable(&self) -> DiskResult<()> {
        if self.read_only {
            return Err(DiskError::NotSupported("read-only image".into()));
        }
        Ok(())
    }
}

impl<D: VirtualDisk + Send> DiskContainer for DiskImage<D> {
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
        self.with_disk(|disk| disk.read_at(offset, buf))
    }

    fn write(&self, offset: u64, buf: &[u8]) -> DiskResult<()> {
        self.ensure_writable()?;
        self.with_disk(|disk| disk.write_at(offset, buf))
    }

    fn flush(&self) -> DiskResult<()> {
        self.with_disk(|disk| disk.flush())
    }

    fn discard(&self, ranges: &[ByteRange]) -> DiskResult<()> {
        self.ensure_writable()?;
        self.with_disk(|disk| {
            ranges
                .iter()
                .filter(|range| !range.is_empty())
                .try_for_each(|range| disk.discard_range(range.start, range.len()))
        })
    }
}

#[cfg(all(test, not(feature = "loom")))]
mod tests {
    use super::*;
    use vdrive_storage::{MemBackend, RawDisk};

    fn image(capacity: u64) -> DiskImage<RawDisk<MemBackend>> {
        DiskImage::new(RawDisk::create(MemBackend::new(), capacity).unwrap())
    }

    #[test]
    fn default_start_methods_complete_inline() {
        let image = image(8192);
        let mut buf = IoBuffer::page_aligned(512).unwrap();
        buf.fill(0x42);

        let outcome = match image.start_write(1024, buf, IoCompletion::new(|_| unreachable!())) {
            AsyncIo::Done(outcome) => outcome,
            AsyncIo::InProgress => panic!("synchronous container reported in-progress"),
        };
        outcome.result.unwrap();
        assert_eq!(outcome.buf.map(|b| b.len()), Some(512));

        let buf = IoBuffer::page_aligned(512).unwrap();
        let AsyncIo::Done(outcome) = image.start_read(1024, buf, IoCompletion::new(|_| {})) else {
            panic!("synchronous container reported in-progress");
        };
        outcome.result.unwrap();
        assert!(outcome.buf.unwrap().iter().all(|b| *b == 0x42));
    }

    #[test]
    fn read_only_images_reject_mutation() {
        let image = image(4096).with_read_only(true);
        assert!(image.is_read_only());
        assert!(matches!(
            image.write(0, &[1, 2, 3]).unwrap_err(),
            DiskError::NotSupported(_)
        ));
        assert!(matches!(
            image.discard(&[ByteRange::new(0, 512)]).unwrap_err(),
            DiskError::NotSupported(_)
        ));
        let mut buf = [0u8; 16];
        image.read(0, &mut buf).unwrap();
    }

    #[test]
    fn merge_is_unsupported_on_single_images() {
        let image = image(4096);
        assert!(matches!(
            image.merge(1, 0, &mut |_| {}).unwrap_err(),
            DiskError::NotSupported(_)
        ));
    }
}
