//! Lock-free lifecycle word of an I/O request.
//!
//! The word packs the slot's generation, the request state and a flag telling whether storage
//! holds the request. Every transition is a compare-exchange on the whole word, so a caller
//! holding a handle from an earlier generation can never move a recycled slot, and exactly one
//! of the submitter, the completion path and a canceler wins each step.

#[cfg(all(feature = "loom", test))]
use loom::sync::atomic::AtomicU64;
#[cfg(not(all(feature = "loom", test)))]
use std::sync::atomic::AtomicU64;

use std::sync::atomic::Ordering;

const STATE_MASK: u64 = 0xff;
const IN_FLIGHT: u64 = 1 << 8;
const GENERATION_SHIFT: u32 = 32;

/// Lifecycle state of a request slot.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ReqState {
    /// Slot is on the free-list.
    Free = 1,
    /// Allocated by the controller, not submitted yet.
    Allocated = 2,
    /// Submitted to storage; counted in the active-request counter.
    Active = 3,
    /// The completion path won the request and is syncing buffers.
    Completing = 4,
    Completed = 5,
    /// Canceled by ID. A request canceled while `Active` moves on to `Completed` once storage
    /// reports back.
    Canceled = 6,
}

impl ReqState {
    fn from_raw(raw: u64) -> Self {
        match raw {
            1 => ReqState::Free,
            2 => ReqState::Allocated,
            3 => ReqState::Active,
            4 => ReqState::Completing,
            5 => ReqState::Completed,
            6 => ReqState::Canceled,
            _ => unreachable!("invalid request state word {raw}"),
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, ReqState::Completed | ReqState::Canceled)
    }
}

/// Decoded contents of a [`StateWord`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct Snapshot {
    pub(crate) generation: u32,
    pub(crate) state: ReqState,
    /// Storage holds the request and has not reported back yet.
    pub(crate) in_flight: bool,
}

impl Snapshot {
    fn decode(raw: u64) -> Self {
        Self {
            generation: (raw >> GENERATION_SHIFT) as u32,
            state: ReqState::from_raw(raw & STATE_MASK),
            in_flight: raw & IN_FLIGHT != 0,
        }
    }

    fn encode(self) -> u64 {
        let flag = if self.in_flight { IN_FLIGHT } else { 0 };
        (u64::from(self.generation) << GENERATION_SHIFT) | flag | self.state as u64
    }

    /// Whether `io_req_free` may take the slot back.
    fn is_freeable(self) -> bool {
        match self.state {
            ReqState::Allocated | ReqState::Completed => true,
            ReqState::Canceled => !self.in_flight,
            ReqState::Free | ReqState::Active | ReqState::Completing => false,
        }
    }
}

/// Outcome of [`StateWord::cancel`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum CancelOutcome {
    /// The canceler won. `was_active` tells whether the active counter must be decremented.
    Canceled { was_active: bool },
    /// The request was already past the point where it can be canceled, or the slot was
    /// recycled.
    TooLate(ReqState),
}

pub(crate) struct StateWord(AtomicU64);

impl StateWord {
    pub(crate) fn new() -> Self {
        let free = Snapshot {
            generation: 0,
            state: ReqState::Free,
            in_flight: false,
        };
        Self(AtomicU64::new(free.encode()))
    }

    pub(crate) fn snapshot(&self) -> Snapshot {
        Snapshot::decode(self.0.load(Ordering::Acquire))
    }

    pub(crate) fn load(&self) -> ReqState {
        self.snapshot().state
    }

    pub(crate) fn generation(&self) -> u32 {
        self.snapshot().generation
    }

    /// Moves `from -> to` within `generation`, returning what was observed when the word did
    /// not hold `from` in that generation.
    ///
    /// Entering `Active` marks the request as held by storage; entering `Completed` clears the
    /// mark in the same step.
    pub(crate) fn transition(
        &self,
        generation: u32,
        from: ReqState,
        to: ReqState,
    ) -> Result<(), Snapshot> {
        self.update(|seen| {
            if seen.generation != generation || seen.state != from {
                return None;
            }
            let in_flight = match to {
                ReqState::Active => true,
                ReqState::Free | ReqState::Allocated | ReqState::Completed => false,
                ReqState::Completing | ReqState::Canceled => seen.in_flight,
            };
            Some(Snapshot {
                state: to,
                in_flight,
                ..seen
            })
        })
        .map(|_| ())
    }

    /// Frees the slot and starts its next generation. Returns the state it was freed from.
    pub(crate) fn retire(&self, generation: u32) -> Result<ReqState, Snapshot> {
        self.update(|seen| {
            if seen.generation != generation || !seen.is_freeable() {
                return None;
            }
            Some(Snapshot {
                generation: generation.wrapping_add(1),
                state: ReqState::Free,
                in_flight: false,
            })
        })
        .map(|freed| freed.state)
    }

    /// Cancels from whichever of `Allocated`/`Active` is current, retrying when the submitter
    /// moves the request between the two underneath us.
    pub(crate) fn cancel(&self, generation: u32) -> CancelOutcome {
        let mut seen = self.snapshot();
        loop {
            if seen.generation != generation {
                return CancelOutcome::TooLate(ReqState::Free);
            }
            match seen.state {
                ReqState::Allocated | ReqState::Active => {
                    match self.transition(generation, seen.state, ReqState::Canceled) {
                        Ok(()) => {
                            return CancelOutcome::Canceled {
                                was_active: seen.state == ReqState::Active,
                            }
                        }
                        Err(observed) => seen = observed,
                    }
                    test_yield();
                }
                other => return CancelOutcome::TooLate(other),
            }
        }
    }

    /// Applies `f` with a compare-exchange loop. Returns the snapshot `f` accepted, or the one
    /// it refused.
    fn update(&self, f: impl Fn(Snapshot) -> Option<Snapshot>) -> Result<Snapshot, Snapshot> {
        let mut raw = self.0.load(Ordering::Acquire);
        loop {
            let seen = Snapshot::decode(raw);
            let next = f(seen).ok_or(seen)?;
            match self
                .0
                .compare_exchange(raw, next.encode(), Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return Ok(seen),
                Err(observed) => raw = observed,
            }
        }
    }
}

#[cfg(all(test, feature = "loom"))]
#[inline]
fn test_yield() {
    loom::thread::yield_now();
}

#[cfg(all(test, not(feature = "loom")))]
#[inline]
fn test_yield() {
    std::thread::yield_now();
}

#[cfg(not(test))]
#[inline]
fn test_yield() {}


#[cfg(all(test, feature = "loom"))]
mod loom_tests {
    use super::*;

    use loom::sync::atomic::AtomicU32;
    use loom::sync::Arc;

    fn active() -> StateWord {
        let word = StateWord::new();
        word.transition(0, ReqState::Free, ReqState::Allocated).unwrap();
        word.transition(0, ReqState::Allocated, ReqState::Active).unwrap();
        word
    }

    #[test]
    fn active_counter_is_decremented_exactly_once() {
        loom::model(|| {
            let word = Arc::new(active());
            let active = Arc::new(AtomicU32::new(1));

            let completer = {
                let word = word.clone();
                let active = active.clone();
                loom::thread::spawn(move || {
                    if word
                        .transition(0, ReqState::Active, ReqState::Completing)
                        .is_ok()
                    {
                        active.fetch_sub(1, Ordering::AcqRel);
                        word.transition(0, ReqState::Completing, ReqState::Completed).unwrap();
                        true
                    } else {
                        false
                    }
                })
            };

            let canceled = match word.cancel(0) {
                CancelOutcome::Canceled { .. } => {
                    active.fetch_sub(1, Ordering::AcqRel);
                    true
                }
                CancelOutcome::TooLate(_) => false,
            };
            let completed = completer.join().unwrap();

            assert!(canceled ^ completed);
            assert_eq!(active.load(Ordering::SeqCst), 0);
        });
    }

    #[test]
    fn cancel_observes_submission_between_load_and_cas() {
        loom::model(|| {
            let word = StateWord::new();
            word.transition(0, ReqState::Free, ReqState::Allocated).unwrap();
            let word = Arc::new(word);

            let submitter = {
                let word = word.clone();
                loom::thread::spawn(move || {
                    word.transition(0, ReqState::Allocated, ReqState::Active).is_ok()
                })
            };

            let outcome = word.cancel(0);
            let submitted = submitter.join().unwrap();

            match outcome {
                CancelOutcome::Canceled { was_active } => assert_eq!(was_active, submitted),
                CancelOutcome::TooLate(state) => panic!("cancel lost to {state:?}"),
            }
            assert_eq!(word.load(), ReqState::Canceled);
            assert_eq!(word.snapshot().in_flight, submitted);
        });
    }

    #[test]
    fn free_and_stale_submit_never_both_win() {
        loom::model(|| {
            let word = StateWord::new();
            word.transition(0, ReqState::Free, ReqState::Allocated).unwrap();
            let word = Arc::new(word);

            let stale = {
                let word = word.clone();
                loom::thread::spawn(move || {
                    word.transition(0, ReqState::Allocated, ReqState::Active).is_ok()
                })
            };

            let freed = word.retire(0).is_ok();
            let submitted = stale.join().unwrap();
            assert!(freed ^ submitted);
        });
    }
}
