//! Read-ahead buffer for the dense, mostly sequential reads of early guest boot.
//!
//! A single buffer holds `valid` bytes of the disk starting at `origin`. Reads inside it are
//! served from memory; a short read outside it refills the buffer at the read's offset. The
//! cache switches itself off once a read no longer fits the buffer, once the request engine
//! takes over, or when disabled by configuration; a VM reset switches it back on.

use std::sync::{Mutex, MutexGuard};

use vdrive_storage::checked_range;

use crate::container::DiskResult;

struct BootAccelState {
    active: bool,
    buf: Vec<u8>,
    origin: u64,
    valid: usize,
}

pub(crate) struct BootAccel {
    enabled: bool,
    state: Mutex<BootAccelState>,
}

impl BootAccel {
    pub(crate) fn new(enabled: bool, size: usize) -> Self {
        let buf = if enabled { vec![0u8; size] } else { Vec::new() };
        Self {
            enabled,
            state: Mutex::new(BootAccelState {
                active: enabled,
                buf,
                origin: 0,
                valid: 0,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, BootAccelState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub(crate) fn is_active(&self) -> bool {
        self.enabled && self.lock().active
    }

    /// Reads `out` at `offset`, going to `disk_read` only for what the buffer cannot serve.
    pub(crate) fn read(
        &self,
        mut offset: u64,
        mut out: &mut [u8],
        capacity: u64,
        mut disk_read: impl FnMut(u64, &mut [u8]) -> DiskResult<()>,
    ) -> DiskResult<()> {
        if !self.enabled {
            return disk_read(offset, out);
        }
        let mut state = self.lock();
        if !state.active {
            drop(state);
            return disk_read(offset, out);
        }
        checked_range(offset, out.len(), capacity)?;

        if offset >= state.origin && offset - state.origin < state.valid as u64 {
            let start = (offset - state.origin) as usize;
            let n = out.len().min(state.valid - start);
            out[..n].copy_from_slice(&state.buf[start..start + n]);
            offset += n as u64;
            let rest = out;
            out = &mut rest[n..];
        }
        if out.is_empty() {
            return Ok(());
        }

        if out.len() >= state.buf.len() {
            tracing::debug!(len = out.len(), "boot acceleration outgrown, deactivating");
            state.active = false;
            drop(state);
            return disk_read(offset, out);
        }

        let fill = (capacity - offset).min(state.buf.len() as u64) as usize;
        state.origin = offset;
        state.valid = 0;
        let state = &mut *state;
        disk_read(offset, &mut state.buf[..fill])?;
        state.valid = fill;
        out.copy_from_slice(&state.buf[..out.len()]);
        Ok(())
    }

    /// Drops buffered data; called before every write.
    pub(crate) fn invalidate(&self) {
        if !self.enabled {
            return;
        }
        let mut state = self.lock();
        state.valid = 0;
        state.origin = 0;
    }

    pub(crate) fn deactivate(&self) {
        if !self.enabled {
            return;
        }
        let mut state = self.lock();
        if state.active {
            tracing::debug!("boot acceleration deactivated by asynchronous I/O");
        }
        state.active = false;
        state.valid = 0;
    }

    pub(crate) fn reset(&self) {
        if !self.enabled {
            return;
        }
        let mut state = self.lock();
        state.active = true;
        state.origin = 0;
        state.valid = 0;
    }
}
