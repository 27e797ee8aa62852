//! Watchdogs - time-ordered deferred routines
//!
//! The watchdog header keeps pending routines ordered by expiration tick in
//! a red-black tree. The clock tick advances the time base and the kernel
//! then pops every expired routine in deadline order; routines with the
//! same deadline fire in insertion order.
//!
//! Routines are plain data naming the object to act on. The owner of a
//! watchdog must cancel it before destroying the object it names; a
//! routine referring to a dead object is a kernel bug and is caught by a
//! debug assertion where it is executed.

use crate::kern::rbtree::{RbHandle, RbTree};
use crate::types::{PeriodId, ThreadId, Ticks, TimerId};

// ============================================================================
// Watchdog Routines
// ============================================================================

/// What to do when a watchdog expires
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchdogRoutine {
    /// End the wait or delay of a thread with a timeout
    ThreadTimeout(ThreadId),
    /// Fire a timer object
    Timer(TimerId),
    /// End the current period of a rate-monotonic period object
    PeriodEnd(PeriodId),
}

/// Handle to an armed watchdog
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WatchdogId(RbHandle);

// ============================================================================
// Watchdog Header
// ============================================================================

/// Time base and pending watchdogs
#[derive(Debug)]
pub struct WatchdogHeader {
    tree: RbTree<(Ticks, u64), WatchdogRoutine>,
    now: Ticks,
    sequence: u64,
    fired: u64,
}

impl WatchdogHeader {
    /// Create a header with room for `capacity` pending watchdogs
    pub fn new(capacity: usize) -> Self {
        Self {
            tree: RbTree::with_capacity(capacity),
            now: 0,
            sequence: 0,
            fired: 0,
        }
    }

    /// Current tick count
    pub fn now(&self) -> Ticks {
        self.now
    }

    /// Number of pending watchdogs
    pub fn pending(&self) -> usize {
        self.tree.len()
    }

    /// Number of watchdogs fired since initialization
    pub fn fired(&self) -> u64 {
        self.fired
    }

    /// Arm a routine for an absolute tick
    pub fn insert_absolute(&mut self, expire: Ticks, routine: WatchdogRoutine) -> WatchdogId {
        self.sequence += 1;
        WatchdogId(self.tree.insert((expire, self.sequence), routine))
    }

    /// Arm a routine `interval` ticks from now
    pub fn insert_relative(&mut self, interval: Ticks, routine: WatchdogRoutine) -> WatchdogId {
        self.insert_absolute(self.now.saturating_add(interval), routine)
    }

    /// Disarm a watchdog; returns whether it was still pending
    pub fn cancel(&mut self, id: WatchdogId) -> bool {
        self.tree.remove(id.0).is_some()
    }

    pub fn is_armed(&self, id: WatchdogId) -> bool {
        self.tree.contains(id.0)
    }

    /// Expiration tick of a pending watchdog
    pub fn expire(&self, id: WatchdogId) -> Option<Ticks> {
        self.tree.get(id.0).map(|((expire, _), _)| *expire)
    }

    /// Ticks left until a pending watchdog fires
    pub fn remaining(&self, id: WatchdogId) -> Option<Ticks> {
        self.expire(id).map(|e| e.saturating_sub(self.now))
    }

    /// Earliest pending expiration
    pub fn next_expire(&self) -> Option<Ticks> {
        self.tree
            .min()
            .and_then(|h| self.tree.get(h))
            .map(|((expire, _), _)| *expire)
    }

    /// Advance the time base by one tick
    pub fn tick(&mut self) -> Ticks {
        self.now += 1;
        self.now
    }

    /// Remove and return the earliest routine whose deadline has elapsed
    pub fn pop_expired(&mut self) -> Option<WatchdogRoutine> {
        let first = self.tree.min()?;
        let ((expire, _), _) = self.tree.get(first)?;
        if *expire > self.now {
            return None;
        }
        let (_, routine) = self.tree.remove(first)?;
        self.fired += 1;
        Some(routine)
    }

    /// Whether any pending watchdog names `routine`
    pub fn is_pending(&self, routine: WatchdogRoutine) -> bool {
        self.tree.iter().any(|(_, _, r)| *r == routine)
    }
}
