#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

use vdrive_media::{
    AsyncIo, DiskContainer, DiskImage, DiskResult, IoBuffer, IoCompletion, IoOutcome,
    IoReqHandle, MediaError, MediaExPort, Result,
};
use vdrive_storage::{ByteRange, DiskError, MemBackend, RawDisk};

pub type MemImage = DiskImage<RawDisk<MemBackend>>;

pub fn mem_image(capacity: u64) -> MemImage {
    DiskImage::new(RawDisk::create(MemBackend::new(), capacity).unwrap())
}

/// Routes driver logs to the test harness.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::DEBUG)
        .try_init();
}

pub fn pattern(seed: u8, len: usize) -> Vec<u8> {
    (0..len).map(|i| seed.wrapping_add(i as u8)).collect()
}

/// Controller side of the port: hands out write data, records read data and notifications.
#[derive(Default)]
pub struct TestPort {
    write_source: Mutex<Vec<u8>>,
    reads: Mutex<HashMap<IoReqHandle, Vec<u8>>>,
    notified: Mutex<Vec<(IoReqHandle, Result<()>)>>,
    notify_cv: Condvar,
}

impl TestPort {
    pub fn set_write_source(&self, data: &[u8]) {
        *self.write_source.lock().unwrap() = data.to_vec();
    }

    pub fn read_data(&self, req: IoReqHandle) -> Option<Vec<u8>> {
        self.reads.lock().unwrap().get(&req).cloned()
    }

    pub fn notifications(&self) -> Vec<(IoReqHandle, Result<()>)> {
        self.notified.lock().unwrap().clone()
    }

    /// Waits until at least `count` notifications arrived.
    pub fn wait_for_notifications(&self, count: usize) -> Vec<(IoReqHandle, Result<()>)> {
        let deadline = Instant::now() + Duration::from_secs(10);
        let mut notified = self.notified.lock().unwrap();
        while notified.len() < count {
            let left = deadline
                .checked_duration_since(Instant::now())
                .expect("timed out waiting for completion notifications");
            notified = self.notify_cv.wait_timeout(notified, left).unwrap().0;
        }
        notified.clone()
    }
}

impl MediaExPort for TestPort {
    fn io_req_copy_from_buf(
        &self,
        _req: IoReqHandle,
        _alloc: &mut [u8],
        offset: usize,
        dst: &mut [u8],
    ) -> Result<()> {
        let src = self.write_source.lock().unwrap();
        let src = src
            .get(offset..offset + dst.len())
            .ok_or_else(|| MediaError::Port("write source too short".into()))?;
        dst.copy_from_slice(src);
        Ok(())
    }

    fn io_req_copy_to_buf(
        &self,
        req: IoReqHandle,
        _alloc: &mut [u8],
        offset: usize,
        src: &[u8],
    ) -> Result<()> {
        let mut reads = self.reads.lock().unwrap();
        let data = reads.entry(req).or_default();
        data.resize(offset + src.len(), 0);
        data[offset..].copy_from_slice(src);
        Ok(())
    }

    fn io_req_complete_notify(&self, req: IoReqHandle, _alloc: &mut [u8], result: Result<()>) {
        self.notified.lock().unwrap().push((req, result));
        self.notify_cv.notify_all();
    }
}

#[derive(Debug)]
pub enum ParkedOp {
    Read { offset: u64, buf: IoBuffer },
    Write { offset: u64, buf: IoBuffer },
    Flush,
    Discard(Vec<ByteRange>),
}

/// Container whose asynchronous operations wait until the test releases them.
pub struct ParkedContainer {
    inner: MemImage,
    parked: Mutex<Vec<(ParkedOp, IoCompletion)>>,
}

impl ParkedContainer {
    pub fn new(capacity: u64) -> Self {
        Self {
            inner: mem_image(capacity),
            parked: Mutex::new(Vec::new()),
        }
    }

    pub fn parked(&self) -> usize {
        self.parked.lock().unwrap().len()
    }

    fn take(&self) -> Vec<(ParkedOp, IoCompletion)> {
        std::mem::take(&mut *self.parked.lock().unwrap())
    }

    fn run(&self, op: ParkedOp) -> IoOutcome {
        match op {
            ParkedOp::Read { offset, mut buf } => {
                let result = self.inner.read(offset, &mut buf);
                IoOutcome::new(Some(buf), result)
            }
            ParkedOp::Write { offset, buf } => {
                let result = self.inner.write(offset, &buf);
                IoOutcome::new(Some(buf), result)
            }
            ParkedOp::Flush => IoOutcome::new(None, self.inner.flush()),
            ParkedOp::Discard(ranges) => IoOutcome::new(None, self.inner.discard(&ranges)),
        }
    }

    /// Runs every parked operation and completes it. Completions run on the calling thread.
    pub fn release_all(&self) -> usize {
        let parked = self.take();
        let count = parked.len();
        for (op, done) in parked {
            let outcome = self.run(op);
            done.complete(outcome);
        }
        count
    }

    /// Completes every parked operation with `err` without touching the image.
    pub fn fail_all(&self, err: DiskError) -> usize {
        let parked = self.take();
        let count = parked.len();
        for (op, done) in parked {
            let buf = match op {
                ParkedOp::Read { buf, .. } | ParkedOp::Write { buf, .. } => Some(buf),
                ParkedOp::Flush | ParkedOp::Discard(_) => None,
            };
            done.complete(IoOutcome::new(buf, Err(err.clone())));
        }
        count
    }

    fn park(&self, op: ParkedOp, done: IoCompletion) -> AsyncIo {
        self.parked.lock().unwrap().push((op, done));
        AsyncIo::InProgress
    }
}

impl DiskContainer for ParkedContainer {
    fn capacity_bytes(&self) -> u64 {
        self.inner.capacity_bytes()
    }

    fn is_read_only(&self) -> bool {
        false
    }

    fn read(&self, offset: u64, buf: &mut [u8]) -> DiskResult<()> {
        self.inner.read(offset, buf)
    }

    fn write(&self, offset: u64, buf: &[u8]) -> DiskResult<()> {
        self.inner.write(offset, buf)
    }

    fn flush(&self) -> DiskResult<()> {
        self.inner.flush()
    }

    fn discard(&self, ranges: &[ByteRange]) -> DiskResult<()> {
        self.inner.discard(ranges)
    }

    fn start_read(&self, offset: u64, buf: IoBuffer, done: IoCompletion) -> AsyncIo {
        self.park(ParkedOp::Read { offset, buf }, done)
    }

    fn start_write(&self, offset: u64, buf: IoBuffer, done: IoCompletion) -> AsyncIo {
        self.park(ParkedOp::Write { offset, buf }, done)
    }

    fn start_flush(&self, done: IoCompletion) -> AsyncIo {
        self.park(ParkedOp::Flush, done)
    }

    fn start_discard(&self, ranges: Vec<ByteRange>, done: IoCompletion) -> AsyncIo {
        self.park(ParkedOp::Discard(ranges), done)
    }
}

/// Synchronous container counting the calls that reach it.
pub struct CountingContainer {
    inner: MemImage,
    shareable: bool,
    pub reads: AtomicUsize,
    pub writes: AtomicUsize,
    pub flushes: AtomicUsize,
}

impl CountingContainer {
    pub fn new(capacity: u64) -> Self {
        Self {
            inner: mem_image(capacity),
            shareable: false,
            reads: AtomicUsize::new(0),
            writes: AtomicUsize::new(0),
            flushes: AtomicUsize::new(0),
        }
    }

    pub fn shareable(mut self) -> Self {
        self.shareable = true;
        self
    }

    pub fn reads(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }

    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    pub fn flushes(&self) -> usize {
        self.flushes.load(Ordering::SeqCst)
    }
}

impl DiskContainer for CountingContainer {
    fn capacity_bytes(&self) -> u64 {
        self.inner.capacity_bytes()
    }

    fn is_read_only(&self) -> bool {
        false
    }

    fn is_shareable(&self) -> bool {
        self.shareable
    }

    fn read(&self, offset: u64, buf: &mut [u8]) -> DiskResult<()> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        self.inner.read(offset, buf)
    }

    fn write(&self, offset: u64, buf: &[u8]) -> DiskResult<()> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        self.inner.write(offset, buf)
    }

    fn flush(&self) -> DiskResult<()> {
        self.flushes.fetch_add(1, Ordering::SeqCst);
        self.inner.flush()
    }

    fn discard(&self, ranges: &[ByteRange]) -> DiskResult<()> {
        self.inner.discard(ranges)
    }
}
