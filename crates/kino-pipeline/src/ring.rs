//! Fixed-capacity fragment ring shared by a track's fetchers and its injector
//!
//! Fetchers reserve a slot, download into their own buffer and publish the
//! finished fragment; publishing moves it into the slot at the fetch cursor.
//! The injector takes fragments from the inject cursor in publish order and
//! releases each slot once the downstream hand-off is done. A slot counts
//! toward occupancy from publish until release, and reservations count
//! toward capacity, so a publish can never land on an unreleased slot.

use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex, MutexGuard};
use tracing::{debug, trace, warn};

use crate::fragment::CachedFragment;
use crate::types::TrackType;
use crate::{Error, Result};

/// How a fetcher waits for a free slot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchWait {
    /// Block until a slot frees up or the ring is aborted
    Blocking,
    /// Block for at most the given duration
    Timeout(Duration),
    /// Fail with [`Error::RingFull`] immediately
    NonBlocking,
}

/// Proof that a fetcher holds a slot
#[must_use = "a reservation holds ring capacity until published or cancelled"]
#[derive(Debug)]
pub struct SlotReservation {
    generation: u64,
    initialize: bool,
}

impl SlotReservation {
    /// The fetcher asked for a freshly initialized buffer
    pub fn initialize(&self) -> bool {
        self.initialize
    }
}

/// Proof that the injector took a fragment whose slot is still held
#[must_use = "the slot stays occupied until the ticket is released"]
#[derive(Debug)]
pub struct InjectTicket {
    sequence: u64,
    generation: u64,
}

impl InjectTicket {
    pub fn sequence(&self) -> u64 {
        self.sequence
    }
}

/// A fragment moved out of the ring, with the ticket that frees its slot
#[derive(Debug)]
pub struct TakenFragment {
    pub ticket: InjectTicket,
    pub fragment: CachedFragment,
}

/// Result of scanning the queued fragments for a discontinuity
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct FutureDiscontinuity {
    pub present: bool,
    /// Queued duration up to and including the discontinuity (or all of it)
    pub cached_duration: f64,
}

struct RingState {
    slots: Vec<Option<CachedFragment>>,
    fetch_cursor: usize,
    inject_cursor: usize,
    /// Published and not yet released
    occupancy: usize,
    /// Published and not yet taken
    pending: usize,
    reserved: usize,
    next_take_seq: u64,
    next_release_seq: u64,
    generation: u64,
    aborted: bool,
    inject_aborted: bool,
    eos: bool,
}

impl RingState {
    fn new(capacity: usize) -> Self {
        Self {
            slots: (0..capacity).map(|_| None).collect(),
            fetch_cursor: 0,
            inject_cursor: 0,
            occupancy: 0,
            pending: 0,
            reserved: 0,
            next_take_seq: 0,
            next_release_seq: 0,
            generation: 0,
            aborted: false,
            inject_aborted: false,
            eos: false,
        }
    }

    fn queued(&self) -> impl Iterator<Item = &CachedFragment> {
        let capacity = self.slots.len();
        (0..self.pending).filter_map(move |i| self.slots[(self.inject_cursor + i) % capacity].as_ref())
    }
}

/// Per-track ring of cached fragments
pub struct FragmentSlotRing {
    track: TrackType,
    capacity: usize,
    state: Mutex<RingState>,
    slot_freed: Condvar,
    fragment_ready: Condvar,
}

impl FragmentSlotRing {
    /// Create a ring with a fixed number of slots
    pub fn new(track: TrackType, capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            track,
            capacity,
            state: Mutex::new(RingState::new(capacity)),
            slot_freed: Condvar::new(),
            fragment_ready: Condvar::new(),
        }
    }

    pub fn track(&self) -> TrackType {
        self.track
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Reserve a slot for a fragment about to be downloaded
    pub fn reserve_for_fetch(&self, initialize: bool, wait: FetchWait) -> Result<SlotReservation> {
        let deadline = match wait {
            FetchWait::Timeout(timeout) => Some(Instant::now() + timeout),
            _ => None,
        };
        let mut state = self.state.lock();
        loop {
            if state.aborted {
                return Err(Error::Aborted { track: self.track });
            }
            if state.occupancy + state.reserved < self.capacity {
                break;
            }
            match wait {
                FetchWait::NonBlocking => return Err(Error::RingFull { track: self.track }),
                FetchWait::Blocking => self.slot_freed.wait(&mut state),
                FetchWait::Timeout(_) => {
                    let Some(deadline) = deadline else {
                        return Err(Error::RingFull { track: self.track });
                    };
                    if self.slot_freed.wait_until(&mut state, deadline).timed_out()
                        && state.occupancy + state.reserved >= self.capacity
                    {
                        if state.aborted {
                            return Err(Error::Aborted { track: self.track });
                        }
                        return Err(Error::RingFull { track: self.track });
                    }
                }
            }
        }
        state.reserved += 1;
        trace!(
            track = %self.track,
            occupancy = state.occupancy,
            reserved = state.reserved,
            "Slot reserved"
        );
        Ok(SlotReservation {
            generation: state.generation,
            initialize,
        })
    }

    /// Give back a reservation whose download failed
    pub fn cancel(&self, reservation: SlotReservation) {
        let mut state = self.state.lock();
        if reservation.generation == state.generation && state.reserved > 0 {
            state.reserved -= 1;
            self.slot_freed.notify_one();
        }
    }

    /// Move a downloaded fragment into the ring and wake the injector
    ///
    /// Returns the occupancy after publishing.
    pub fn publish(&self, reservation: SlotReservation, fragment: CachedFragment) -> Result<usize> {
        let mut state = self.state.lock();
        if reservation.generation != state.generation || state.reserved == 0 {
            warn!(
                track = %self.track,
                position = fragment.position,
                "Publish rejected: reservation does not belong to this ring generation"
            );
            return Err(Error::SlotNotReserved { track: self.track });
        }
        let index = state.fetch_cursor;
        if state.occupancy >= self.capacity || state.slots[index].is_some() {
            warn!(
                track = %self.track,
                occupancy = state.occupancy,
                "Publish rejected: ring would overflow"
            );
            return Err(Error::RingFull { track: self.track });
        }

        state.reserved -= 1;
        state.slots[index] = Some(fragment);
        state.fetch_cursor = (index + 1) % self.capacity;
        state.occupancy += 1;
        state.pending += 1;
        let occupancy = state.occupancy;
        drop(state);

        self.fragment_ready.notify_one();
        Ok(occupancy)
    }

    /// Take the oldest published fragment, blocking while the ring is empty
    pub fn take_for_inject(&self) -> Result<TakenFragment> {
        let state = self.state.lock();
        match self.take_locked(state, None)? {
            Some(taken) => Ok(taken),
            None => Err(Error::Aborted { track: self.track }),
        }
    }

    /// Like [`take_for_inject`](Self::take_for_inject) but gives up after `timeout`
    pub fn take_for_inject_timeout(&self, timeout: Duration) -> Result<Option<TakenFragment>> {
        let state = self.state.lock();
        self.take_locked(state, Some(Instant::now() + timeout))
    }

    fn take_locked(
        &self,
        mut state: MutexGuard<'_, RingState>,
        deadline: Option<Instant>,
    ) -> Result<Option<TakenFragment>> {
        loop {
            if state.aborted || state.inject_aborted {
                return Err(Error::Aborted { track: self.track });
            }
            if state.pending > 0 {
                break;
            }
            if state.eos {
                return Err(Error::EndOfStream { track: self.track });
            }
            match deadline {
                None => self.fragment_ready.wait(&mut state),
                Some(deadline) => {
                    if self.fragment_ready.wait_until(&mut state, deadline).timed_out()
                        && state.pending == 0
                        && !state.aborted
                        && !state.inject_aborted
                        && !state.eos
                    {
                        return Ok(None);
                    }
                }
            }
        }

        let index = state.inject_cursor;
        let Some(fragment) = state.slots[index].take() else {
            return Err(Error::SlotNotReserved { track: self.track });
        };
        state.inject_cursor = (index + 1) % self.capacity;
        state.pending -= 1;
        let sequence = state.next_take_seq;
        state.next_take_seq += 1;

        Ok(Some(TakenFragment {
            ticket: InjectTicket {
                sequence,
                generation: state.generation,
            },
            fragment,
        }))
    }

    /// Free the slot of a taken fragment and wake a blocked fetcher
    pub fn release(&self, ticket: InjectTicket) -> Result<()> {
        let mut state = self.state.lock();
        if ticket.generation != state.generation {
            debug!(track = %self.track, sequence = ticket.sequence, "Release of flushed slot ignored");
            return Err(Error::StaleTicket { track: self.track });
        }
        if ticket.sequence != state.next_release_seq || state.occupancy == state.pending {
            warn!(
                track = %self.track,
                expected = state.next_release_seq,
                got = ticket.sequence,
                "Release rejected"
            );
            return Err(Error::ReleaseOutOfOrder {
                track: self.track,
                expected: state.next_release_seq,
                got: ticket.sequence,
            });
        }
        state.next_release_seq += 1;
        state.occupancy -= 1;
        drop(state);

        self.slot_freed.notify_one();
        Ok(())
    }

    /// Drop every queued fragment and invalidate outstanding tickets and reservations
    ///
    /// Returns the number of fragments dropped.
    pub fn flush(&self) -> usize {
        let mut state = self.state.lock();
        let dropped = state.pending;
        let generation = state.generation + 1;
        let (aborted, inject_aborted) = (state.aborted, state.inject_aborted);
        *state = RingState::new(self.capacity);
        state.generation = generation;
        state.aborted = aborted;
        state.inject_aborted = inject_aborted;
        drop(state);

        self.slot_freed.notify_all();
        self.fragment_ready.notify_all();
        debug!(track = %self.track, dropped, "Ring flushed");
        dropped
    }

    /// Scan queued fragments for a pending discontinuity
    pub fn future_discontinuity(&self) -> FutureDiscontinuity {
        let state = self.state.lock();
        let mut result = FutureDiscontinuity::default();
        for fragment in state.queued() {
            result.cached_duration += fragment.duration;
            if fragment.discontinuity {
                result.present = true;
                break;
            }
        }
        result
    }

    /// Total duration of fragments published but not yet taken
    pub fn queued_duration(&self) -> f64 {
        self.state.lock().queued().map(|f| f.duration).sum()
    }

    pub fn occupancy(&self) -> usize {
        self.state.lock().occupancy
    }

    /// Fragments waiting to be taken
    pub fn pending(&self) -> usize {
        self.state.lock().pending
    }

    pub fn is_full(&self) -> bool {
        self.state.lock().occupancy >= self.capacity
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().pending == 0
    }

    /// Wake every waiter and fail further waits until [`clear_abort`](Self::clear_abort)
    pub fn abort(&self) {
        self.state.lock().aborted = true;
        self.slot_freed.notify_all();
        self.fragment_ready.notify_all();
    }

    /// Stop the injector without affecting fetchers
    pub fn abort_inject(&self) {
        self.state.lock().inject_aborted = true;
        self.fragment_ready.notify_all();
    }

    pub fn clear_abort(&self) {
        let mut state = self.state.lock();
        state.aborted = false;
        state.inject_aborted = false;
    }

    pub fn is_aborted(&self) -> bool {
        let state = self.state.lock();
        state.aborted || state.inject_aborted
    }

    /// No more fragments will be published; the injector drains and stops
    pub fn set_eos(&self) {
        self.state.lock().eos = true;
        self.fragment_ready.notify_all();
    }

    pub fn is_eos(&self) -> bool {
        self.state.lock().eos
    }
}
