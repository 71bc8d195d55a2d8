use crate::{DiskError, Result};

/// Validates that `[offset, offset + len)` lies inside a store of `capacity` bytes and returns
/// the exclusive end offset.
pub fn checked_range(offset: u64, len: usize, capacity: u64) -> Result<u64> {
    let end = offset
        .checked_add(len as u64)
        .ok_or(DiskError::OffsetOverflow)?;
    if end > capacity {
        return Err(DiskError::OutOfBounds {
            offset,
            len,
            capacity,
        });
    }
    Ok(end)
}
