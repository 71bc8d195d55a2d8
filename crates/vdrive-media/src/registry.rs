use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::request::{IoReqHandle, IoRequest};
use crate::state::CancelOutcome;
use crate::{MediaError, Result};

/// Number of independently locked bins. Must stay a power of two.
pub const REQ_BINS: usize = 8;

/// Maps controller request IDs to live requests.
///
/// IDs are spread over [`REQ_BINS`] bins by `id % REQ_BINS`; each bin has its own lock, so
/// operations on different bins never contend.
pub(crate) struct RequestRegistry {
    bins: [Mutex<Vec<Entry>>; REQ_BINS],
}

/// A registered request and the handle it was registered under.
struct Entry {
    handle: IoReqHandle,
    req: Arc<IoRequest>,
}

impl RequestRegistry {
    pub(crate) fn new() -> Self {
        Self {
            bins: std::array::from_fn(|_| Mutex::new(Vec::new())),
        }
    }

    fn bin(&self, id: u64) -> MutexGuard<'_, Vec<Entry>> {
        self.bins[(id % REQ_BINS as u64) as usize]
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Registers `req` under its ID unless that ID is already registered.
    pub(crate) fn insert(&self, req: &Arc<IoRequest>) -> Result<()> {
        let id = req.id();
        let mut bin = self.bin(id);
        if bin.iter().any(|other| other.req.id() == id) {
            return Err(MediaError::IdConflict(id));
        }
        bin.push(Entry {
            handle: req.handle(),
            req: Arc::clone(req),
        });
        Ok(())
    }

    pub(crate) fn remove(&self, req: &Arc<IoRequest>) {
        let mut bin = self.bin(req.id());
        bin.retain(|other| !Arc::ptr_eq(&other.req, req));
    }

    /// Cancels the request registered under `id`.
    ///
    /// Winning `Active -> Canceled` takes the request out of the active count here; the
    /// completion that eventually arrives for it leaves the counter alone.
    pub(crate) fn find_and_cancel(&self, id: u64, active: &AtomicU32) -> Result<()> {
        let bin = self.bin(id);
        let entry = bin
            .iter()
            .find(|entry| entry.req.id() == id)
            .ok_or(MediaError::IdNotFound(id))?;
        match entry.req.state.cancel(entry.handle.generation()) {
            CancelOutcome::Canceled { was_active } => {
                if was_active {
                    active.fetch_sub(1, Ordering::AcqRel);
                }
                tracing::debug!(id, handle = %entry.handle, was_active, "canceled request");
                Ok(())
            }
            CancelOutcome::TooLate(state) => {
                tracing::trace!(id, ?state, "cancel lost against completion");
                Err(MediaError::AlreadyCompleted(id))
            }
        }
    }

    /// Cancels every registered request still in `Allocated` or `Active`.
    pub(crate) fn cancel_all(&self, active: &AtomicU32) -> usize {
        let mut canceled = 0;
        for bin in &self.bins {
            let bin = bin.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            for entry in bin.iter() {
                let outcome = entry.req.state.cancel(entry.handle.generation());
                if let CancelOutcome::Canceled { was_active } = outcome {
                    if was_active {
                        active.fetch_sub(1, Ordering::AcqRel);
                    }
                    canceled += 1;
                }
            }
        }
        canceled
    }

    #[cfg(all(test, not(feature = "loom")))]
    pub(crate) fn len(&self) -> usize {
        self.bins
            .iter()
            .map(|bin| bin.lock().unwrap_or_else(|p| p.into_inner()).len())
            .sum()
    }
}
