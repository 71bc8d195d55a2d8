use crate::util::checked_range;
use crate::{DiskError, Result, StorageBackend};

/// Fixed-capacity, byte-addressed virtual disk.
pub trait VirtualDisk {
    fn capacity_bytes(&self) -> u64;

    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<()>;

    fn write_at(&mut self, offset: u64, buf: &[u8]) -> Result<()>;

    fn flush(&mut self) -> Result<()>;

    /// Hints that `[offset, offset + len)` is no longer needed.
    ///
    /// The default implementation only validates the range; disks that can reclaim space
    /// override it.
    fn discard_range(&mut self, offset: u64, len: u64) -> Result<()> {
        let end = offset.checked_add(len).ok_or(DiskError::OffsetOverflow)?;
        if end > self.capacity_bytes() {
            return Err(DiskError::OutOfBounds {
                offset,
                len: usize::try_from(len).unwrap_or(usize::MAX),
                capacity: self.capacity_bytes(),
            });
        }
        Ok(())
    }

    fn is_read_only(&self) -> bool {
        false
    }
}

impl<D: VirtualDisk + ?Sized> VirtualDisk for Box<D> {
    fn capacity_bytes(&self) -> u64 {
        (**self).capacity_bytes()
    }

    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<()> {
        (**self).read_at(offset, buf)
    }

    fn write_at(&mut self, offset: u64, buf: &[u8]) -> Result<()> {
        (**self).write_at(offset, buf)
    }

    fn flush(&mut self) -> Result<()> {
        (**self).flush()
    }

    fn discard_range(&mut self, offset: u64, len: u64) -> Result<()> {
        (**self).discard_range(offset, len)
    }

    fn is_read_only(&self) -> bool {
        (**self).is_read_only()
    }
}

/// Raw image: the backend's bytes are the disk's bytes.
///
/// Capacity is fixed when the disk is created or opened; the backend is never resized
/// afterwards.
#[derive(Debug)]
pub struct RawDisk<B> {
    backend: B,
    capacity: u64,
}

impl<B: StorageBackend> RawDisk<B> {
    pub fn create(mut backend: B, capacity: u64) -> Result<Self> {
        backend.set_len(capacity)?;
        Ok(Self { backend, capacity })
    }

    pub fn open(mut backend: B) -> Result<Self> {
        let capacity = backend.len()?;
        Ok(Self { backend, capacity })
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn into_backend(self) -> B {
        self.backend
    }
}

impl<B: StorageBackend> VirtualDisk for RawDisk<B> {
    fn capacity_bytes(&self) -> u64 {
        self.capacity
    }

    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<()> {
        checked_range(offset, buf.len(), self.capacity)?;
        self.backend.read_at(offset, buf)
    }

    fn write_at(&mut self, offset: u64, buf: &[u8]) -> Result<()> {
        checked_range(offset, buf.len(), self.capacity)?;
        self.backend.write_at(offset, buf)
    }

    fn flush(&mut self) -> Result<()> {
        self.backend.flush()
    }

    fn is_read_only(&self) -> bool {
        self.backend.is_read_only()
    }
}
