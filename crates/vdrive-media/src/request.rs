//! Request slots and the arena that recycles them.
//!
//! Controllers refer to requests through an [`IoReqHandle`]: a slot index plus the slot's
//! generation. Freeing a request starts the slot's next generation, so a handle kept past
//! `free` is rejected instead of aliasing whatever request reuses the slot.

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};

use bitflags::bitflags;

use crate::buffer::IoBuffer;
use crate::state::{ReqState, StateWord};
use crate::{MediaError, Result};

/// Stable reference to a request slot.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct IoReqHandle {
    index: u32,
    generation: u32,
}

impl IoReqHandle {
    pub fn index(&self) -> u32 {
        self.index
    }

    pub(crate) fn generation(&self) -> u32 {
        self.generation
    }
}

impl fmt::Display for IoReqHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.index, self.generation)
    }
}

bitflags! {
    /// Controller-supplied request flags. Carried with the request, never interpreted here.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct IoReqFlags: u32 {
        /// The controller wants the VM suspended instead of seeing a recoverable error.
        const SUSPEND_ON_RECOVERABLE_ERR = 1 << 0;
        /// The controller syncs buffers itself.
        const DONT_SYNC_BUFFERS = 1 << 1;
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum IoReqKind {
    Read,
    Write,
    Flush,
    Discard,
}

/// Mutable per-request payload. Only touched by whoever owns the request in its current
/// state, the mutex just makes that hand-over visible to the compiler.
#[derive(Debug, Default)]
pub(crate) struct RequestData {
    pub(crate) flags: IoReqFlags,
    pub(crate) kind: Option<IoReqKind>,
    pub(crate) offset: u64,
    pub(crate) len: usize,
    /// Data segment; moved into storage while the request is in flight.
    pub(crate) buf: Option<IoBuffer>,
}

pub(crate) struct IoRequest {
    index: u32,
    id: AtomicU64,
    /// Generation, state and the storage-holds-it flag, all moved together.
    pub(crate) state: StateWord,
    data: Mutex<RequestData>,
    /// Controller-owned trailing bytes. The engine never reads them.
    alloc: Mutex<Box<[u8]>>,
}

impl IoRequest {
    fn new(index: u32, alloc_size: usize) -> Self {
        Self {
            index,
            id: AtomicU64::new(0),
            state: StateWord::new(),
            data: Mutex::new(RequestData::default()),
            alloc: Mutex::new(vec![0u8; alloc_size].into_boxed_slice()),
        }
    }

    pub(crate) fn id(&self) -> u64 {
        self.id.load(Ordering::Acquire)
    }

    pub(crate) fn handle(&self) -> IoReqHandle {
        IoReqHandle {
            index: self.index,
            generation: self.state.generation(),
        }
    }

    pub(crate) fn data(&self) -> MutexGuard<'_, RequestData> {
        self.data.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub(crate) fn alloc(&self) -> MutexGuard<'_, Box<[u8]>> {
        self.alloc.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Whether the trailing bytes are currently lent to a controller callback.
    fn alloc_is_lent(&self) -> bool {
        self.alloc.try_lock().is_err()
    }
}

impl fmt::Debug for IoRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IoRequest")
            .field("handle", &self.handle())
            .field("id", &self.id())
            .field("state", &self.state.load())
            .finish_non_exhaustive()
    }
}

/// Arena of request slots with a free-list.
///
/// Slots are never deallocated while the driver lives; a freed slot goes back to the
/// free-list and is recycled by a later allocation.
pub(crate) struct RequestArena {
    alloc_size: AtomicUsize,
    slots: RwLock<Vec<Arc<IoRequest>>>,
    free: Mutex<VecDeque<u32>>,
}

impl RequestArena {
    pub(crate) fn new(alloc_size: usize) -> Self {
        Self {
            alloc_size: AtomicUsize::new(alloc_size),
            slots: RwLock::new(Vec::new()),
            free: Mutex::new(VecDeque::new()),
        }
    }

    pub(crate) fn alloc_size(&self) -> usize {
        self.alloc_size.load(Ordering::Acquire)
    }

    /// Changes the size of the trailing bytes. Only possible before the first slot exists.
    pub(crate) fn set_alloc_size(&self, size: usize) -> Result<()> {
        let slots = self.slots.write().unwrap_or_else(|p| p.into_inner());
        if !slots.is_empty() {
            return Err(MediaError::InvalidState(
                "request allocation size is fixed after the first allocation",
            ));
        }
        self.alloc_size.store(size, Ordering::Release);
        Ok(())
    }

    /// Takes a slot off the free-list (or grows the arena) and puts it in `Allocated`.
    pub(crate) fn acquire(&self, id: u64, flags: IoReqFlags) -> Result<Arc<IoRequest>> {
        let req = match self.pop_free() {
            Some(req) => {
                req.alloc().fill(0);
                req
            }
            None => self.grow()?,
        };

        req.id.store(id, Ordering::Release);
        *req.data() = RequestData {
            flags,
            ..RequestData::default()
        };
        req.state
            .transition(req.state.generation(), ReqState::Free, ReqState::Allocated)
            .map_err(|_| MediaError::InvalidState("free-list slot was not free"))?;
        Ok(req)
    }

    fn pop_free(&self) -> Option<Arc<IoRequest>> {
        let mut free = self.free.lock().unwrap_or_else(|p| p.into_inner());
        let slots = self.slots.read().unwrap_or_else(|p| p.into_inner());
        // A slot freed from inside a completion callback is still lending its trailing bytes
        // to that callback; skip it until the callback returns.
        for _ in 0..free.len() {
            let index = free.pop_front()?;
            let req = &slots[index as usize];
            if req.alloc_is_lent() {
                free.push_back(index);
                continue;
            }
            return Some(Arc::clone(req));
        }
        None
    }

    fn grow(&self) -> Result<Arc<IoRequest>> {
        let mut slots = self.slots.write().unwrap_or_else(|p| p.into_inner());
        let alloc_size = self.alloc_size();
        let index =
            u32::try_from(slots.len()).map_err(|_| MediaError::OutOfMemory(alloc_size))?;
        slots
            .try_reserve(1)
            .map_err(|_| MediaError::OutOfMemory(alloc_size))?;
        let req = Arc::new(IoRequest::new(index, alloc_size));
        slots.push(Arc::clone(&req));
        Ok(req)
    }

    /// Resolves a live handle.
    pub(crate) fn get(&self, handle: IoReqHandle) -> Result<Arc<IoRequest>> {
        let slots = self.slots.read().unwrap_or_else(|p| p.into_inner());
        let req = slots
            .get(handle.index as usize)
            .ok_or(MediaError::InvalidHandle)?;
        let seen = req.state.snapshot();
        if seen.generation != handle.generation || seen.state == ReqState::Free {
            return Err(MediaError::InvalidHandle);
        }
        Ok(Arc::clone(req))
    }

    /// Returns a slot to the free-list. The caller must have retired the slot's generation.
    pub(crate) fn release(&self, req: &Arc<IoRequest>) {
        let payload = std::mem::take(&mut *req.data());
        drop(payload);
        let mut free = self.free.lock().unwrap_or_else(|p| p.into_inner());
        free.push_back(req.index);
    }

    #[cfg(all(test, not(feature = "loom")))]
    pub(crate) fn slot_count(&self) -> usize {
        self.slots.read().unwrap_or_else(|p| p.into_inner()).len()
    }
}
