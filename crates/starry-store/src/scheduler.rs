//! Reader/writer admission keyed by overlapping member sets.
//!
//! Every depot operation names the top-level keys it touches (its members),
//! or [`Members::All`] for whole-depot work. An operation waits at entry
//! until no conflicting operation is active and the starvation ratio lets
//! its class go next:
//!
//! - a reader conflicts with active writers whose members intersect its own;
//! - a writer conflicts with active readers and active writers alike;
//! - while writers are waiting, readers defer unless more than `rw_ratio`
//!   readers wait per waiting writer, and writers defer otherwise.
//!
//! Once admitted, an operation runs to completion without rechecking. The
//! returned [`Admission`] releases the slot and wakes every waiter on drop.

use std::collections::BTreeSet;
use std::sync::{Condvar, Mutex};

/// Default number of waiting readers tolerated per waiting writer.
pub const DEFAULT_RW_RATIO: usize = 5;

/// The keys an operation touches.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Members {
    /// The whole depot. Intersects everything.
    All,
    Keys(BTreeSet<String>),
}

impl Members {
    pub fn key(key: impl Into<String>) -> Self {
        Members::Keys(BTreeSet::from([key.into()]))
    }

    pub fn keys<S: Into<String>>(keys: impl IntoIterator<Item = S>) -> Self {
        Members::Keys(keys.into_iter().map(Into::into).collect())
    }

    pub fn intersects(&self, other: &Members) -> bool {
        match (self, other) {
            (Members::All, _) | (_, Members::All) => true,
            (Members::Keys(a), Members::Keys(b)) => !a.is_disjoint(b),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Mode {
    Read,
    Write,
}

#[derive(Debug, Default)]
struct State {
    read_wait: usize,
    write_wait: usize,
    readers: Vec<(u64, Members)>,
    writers: Vec<(u64, Members)>,
    next_ticket: u64,
}

impl State {
    fn conflicts(active: &[(u64, Members)], members: &Members) -> bool {
        active.iter().any(|(_, m)| m.intersects(members))
    }

    /// Whether an operation of `mode` on `members` must keep waiting.
    fn must_wait(&self, mode: Mode, members: &Members, rw_ratio: usize) -> bool {
        let writers_backlogged = self.write_wait > 0;
        let readers_ahead = self.read_wait > rw_ratio.saturating_mul(self.write_wait);
        match mode {
            Mode::Read => {
                (writers_backlogged && !readers_ahead) || Self::conflicts(&self.writers, members)
            }
            Mode::Write => {
                (writers_backlogged && readers_ahead)
                    || Self::conflicts(&self.readers, members)
                    || Self::conflicts(&self.writers, members)
            }
        }
    }
}

/// Point-in-time counters, for diagnostics and tests.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SchedulerSnapshot {
    pub read_wait: usize,
    pub write_wait: usize,
    pub active_readers: usize,
    pub active_writers: usize,
}

/// Fairness monitor guarding one depot.
#[derive(Debug)]
pub struct Scheduler {
    state: Mutex<State>,
    changed: Condvar,
    rw_ratio: usize,
}

impl Scheduler {
    pub fn new(rw_ratio: usize) -> Self {
        Self {
            state: Mutex::new(State::default()),
            changed: Condvar::new(),
            rw_ratio,
        }
    }

    pub fn rw_ratio(&self) -> usize {
        self.rw_ratio
    }

    /// Block until a read over `members` may proceed.
    pub fn read(&self, members: Members) -> Admission<'_> {
        self.admit(Mode::Read, members)
    }

    /// Block until a write over `members` may proceed.
    pub fn write(&self, members: Members) -> Admission<'_> {
        self.admit(Mode::Write, members)
    }

    fn admit(&self, mode: Mode, members: Members) -> Admission<'_> {
        let mut state = self.state.lock().expect("scheduler lock poisoned");
        match mode {
            Mode::Read => state.read_wait += 1,
            Mode::Write => state.write_wait += 1,
        }

        let mut state = self
            .changed
            .wait_while(state, |s| s.must_wait(mode, &members, self.rw_ratio))
            .expect("scheduler lock poisoned");

        let ticket = state.next_ticket;
        state.next_ticket += 1;
        match mode {
            Mode::Read => {
                state.read_wait -= 1;
                state.readers.push((ticket, members));
            }
            Mode::Write => {
                state.write_wait -= 1;
                state.writers.push((ticket, members));
            }
        }
        drop(state);

        // The waiting counts moved, which can flip the ratio for others.
        self.changed.notify_all();

        Admission {
            scheduler: self,
            mode,
            ticket,
        }
    }

    fn release(&self, mode: Mode, ticket: u64) {
        let mut state = self.state.lock().expect("scheduler lock poisoned");
        let active = match mode {
            Mode::Read => &mut state.readers,
            Mode::Write => &mut state.writers,
        };
        active.retain(|(t, _)| *t != ticket);
        drop(state);
        self.changed.notify_all();
    }

    /// Forget every active reader and writer.
    ///
    /// Outstanding [`Admission`]s still release cleanly afterwards.
    pub fn reset(&self) {
        let mut state = self.state.lock().expect("scheduler lock poisoned");
        state.readers.clear();
        state.writers.clear();
        drop(state);
        self.changed.notify_all();
    }

    pub fn snapshot(&self) -> SchedulerSnapshot {
        let state = self.state.lock().expect("scheduler lock poisoned");
        SchedulerSnapshot {
            read_wait: state.read_wait,
            write_wait: state.write_wait,
            active_readers: state.readers.len(),
            active_writers: state.writers.len(),
        }
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new(DEFAULT_RW_RATIO)
    }
}

/// An admitted operation. Dropping it releases the slot.
#[must_use = "the slot is released as soon as the admission is dropped"]
#[derive(Debug)]
pub struct Admission<'a> {
    scheduler: &'a Scheduler,
    mode: Mode,
    ticket: u64,
}

impl Admission<'_> {
    pub fn mode(&self) -> Mode {
        self.mode
    }
}

impl Drop for Admission<'_> {
    fn drop(&mut self) {
        self.scheduler.release(self.mode, self.ticket);
    }
}
