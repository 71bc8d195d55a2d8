//! Reader/writer gate between ordinary I/O and image merges.
//!
//! The gate owns the mounted medium. I/O takes the reader side for the duration of each
//! container call, a merge takes the writer side for the whole merge, and power-off takes the
//! writer side to unmount. A separate teardown mutex guards the one-shot "merge pending"
//! flag: whichever of `run_pending` and `disarm` gets the mutex first decides, and the other
//! finds the flag already cleared.

use std::sync::{Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};

#[derive(Debug, Clone, Copy)]
struct MergeArm {
    pending: bool,
    source: u32,
    target: u32,
}

pub(crate) struct MergeGate<T> {
    lock: RwLock<T>,
    arm: Mutex<MergeArm>,
}

impl<T> MergeGate<T> {
    pub(crate) fn new(value: T, merge: Option<(u32, u32)>) -> Self {
        let (source, target) = merge.unwrap_or_default();
        Self {
            lock: RwLock::new(value),
            arm: Mutex::new(MergeArm {
                pending: merge.is_some(),
                source,
                target,
            }),
        }
    }

    pub(crate) fn read(&self) -> RwLockReadGuard<'_, T> {
        self.lock.read().unwrap_or_else(|p| p.into_inner())
    }

    pub(crate) fn write(&self) -> RwLockWriteGuard<'_, T> {
        self.lock.write().unwrap_or_else(|p| p.into_inner())
    }

    fn arm(&self) -> MutexGuard<'_, MergeArm> {
        self.arm.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub(crate) fn is_pending(&self) -> bool {
        self.arm().pending
    }

    /// Runs the armed merge under the writer side, at most once.
    ///
    /// Returns `None` when no merge is pending. The flag is cleared whether or not the merge
    /// succeeds.
    pub(crate) fn run_pending<R>(&self, merge: impl FnOnce(&mut T, u32, u32) -> R) -> Option<R> {
        let mut arm = self.arm();
        if !arm.pending {
            return None;
        }
        let result = {
            let mut value = self.write();
            merge(&mut *value, arm.source, arm.target)
        };
        arm.pending = false;
        Some(result)
    }

    /// Clears the pending flag, waiting for a merge that already started.
    ///
    /// Returns whether a merge was still pending.
    pub(crate) fn disarm(&self) -> bool {
        std::mem::replace(&mut self.arm().pending, false)
    }
}

#[cfg(all(test, not(feature = "loom")))]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::{mpsc, Arc};
    use std::thread;
    use std::time::Duration;

    #[test]
    fn merge_runs_once() {
        let gate = MergeGate::new(0u32, Some((1, 0)));
        assert!(gate.is_pending());

        let ran = gate.run_pending(|value, source, target| {
            *value += 1;
            (source, target)
        });
        assert_eq!(ran, Some((1, 0)));
        assert!(!gate.is_pending());
        assert_eq!(gate.run_pending(|_, _, _| ()), None);
        assert_eq!(*gate.read(), 1);
    }

    #[test]
    fn disarm_before_merge_wins() {
        let gate = MergeGate::new((), Some((2, 1)));
        assert!(gate.disarm());
        assert!(!gate.disarm());
        assert_eq!(gate.run_pending(|_, _, _| ()), None);
    }

    #[test]
    fn unarmed_gate_never_merges() {
        let gate = MergeGate::new((), None);
        assert!(!gate.is_pending());
        assert_eq!(gate.run_pending(|_, _, _| ()), None);
    }

    #[test]
    fn disarm_waits_for_running_merge() {
        let gate = Arc::new(MergeGate::new((), Some((1, 0))));
        let finished = Arc::new(AtomicU32::new(0));
        let (started_tx, started_rx) = mpsc::channel();

        let merger = {
            let gate = Arc::clone(&gate);
            let finished = Arc::clone(&finished);
            thread::spawn(move || {
                gate.run_pending(|_, _, _| {
                    started_tx.send(()).unwrap();
                    thread::sleep(Duration::from_millis(50));
                    finished.fetch_add(1, Ordering::SeqCst);
                })
            })
        };

        started_rx.recv().unwrap();
        // The merge already owns the flag, so teardown finds nothing left to disarm.
        assert!(!gate.disarm());
        assert_eq!(finished.load(Ordering::SeqCst), 1);
        assert_eq!(merger.join().unwrap(), Some(()));
    }
}
