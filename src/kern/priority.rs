//! Thread priorities
//!
//! Priorities are unsigned; a numerically lower value is more important.
//! Every thread has a *real* priority assigned through the thread
//! directives and a *current* priority that the scheduler actually uses.
//! The current priority is the most important of the real priority and
//! every active contribution:
//!
//! ```text
//! current = min(real, inherit(M1), inherit(M2), ceiling(M3), job deadline)
//! ```
//!
//! Contributions are keyed by their source, so releasing one mutex removes
//! exactly its boost and leaves boosts from other held mutexes in place.

use heapless::Vec;

use crate::error::{Result, Status};
use crate::types::MutexId;

// ============================================================================
// Priority Constants
// ============================================================================

/// Default number of priority levels
pub const PRIORITY_DEFAULT_MAXIMUM: u64 = 255;

/// Upper bound for priorities handled by the bitmap scheduler
pub const PRIORITY_BITMAP_MAXIMUM: u64 = 4095;

/// Most contributions a single thread can carry at once
pub const PRIORITY_CONTRIBUTIONS_MAX: usize = 16;

/// Scheduling priority; lower is more important
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Priority(pub u64);

impl Priority {
    /// The most important priority value
    pub const HIGHEST: Priority = Priority(0);

    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    pub const fn value(self) -> u64 {
        self.0
    }

    /// Whether `self` is strictly more important than `other`
    pub fn is_higher_than(self, other: Priority) -> bool {
        self.0 < other.0
    }

    /// The more important of two priorities
    pub fn highest(self, other: Priority) -> Priority {
        if other.is_higher_than(self) {
            other
        } else {
            self
        }
    }
}

impl From<u64> for Priority {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

// ============================================================================
// Priority Aggregation
// ============================================================================

/// Origin of a priority contribution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PrioritySource {
    /// Highest waiter of an owned priority-inheritance mutex
    Inherit(MutexId),
    /// Ceiling of an owned priority-ceiling mutex
    Ceiling(MutexId),
    /// Deadline of the current job of a rate-monotonic period
    Job,
}

/// Real priority plus the active contributions
#[derive(Debug, Clone)]
pub struct PriorityAggregation {
    real: Priority,
    contributions: Vec<(PrioritySource, Priority), PRIORITY_CONTRIBUTIONS_MAX>,
}

impl PriorityAggregation {
    pub fn new(real: Priority) -> Self {
        Self {
            real,
            contributions: Vec::new(),
        }
    }

    /// Assigned priority
    pub fn real(&self) -> Priority {
        self.real
    }

    pub fn set_real(&mut self, real: Priority) {
        self.real = real;
    }

    /// Effective priority
    pub fn current(&self) -> Priority {
        self.contributions
            .iter()
            .fold(self.real, |best, (_, p)| best.highest(*p))
    }

    /// Priority contributed by `source`, if active
    pub fn contribution(&self, source: PrioritySource) -> Option<Priority> {
        self.contributions
            .iter()
            .find(|(s, _)| *s == source)
            .map(|(_, p)| *p)
    }

    /// Add or replace the contribution of `source`
    pub fn set(&mut self, source: PrioritySource, priority: Priority) -> Result<()> {
        if let Some(entry) = self.contributions.iter_mut().find(|(s, _)| *s == source) {
            entry.1 = priority;
            return Ok(());
        }
        self.contributions
            .push((source, priority))
            .map_err(|_| Status::NoMemory)
    }

    /// Remove the contribution of `source`; returns whether it was present
    pub fn remove(&mut self, source: PrioritySource) -> bool {
        match self.contributions.iter().position(|(s, _)| *s == source) {
            Some(at) => {
                self.contributions.swap_remove(at);
                true
            }
            None => false,
        }
    }

    /// Drop every contribution except those from owned mutexes
    pub fn clear_transient(&mut self) {
        self.contributions
            .retain(|(s, _)| matches!(s, PrioritySource::Inherit(_) | PrioritySource::Ceiling(_)));
    }

    pub fn has_contributions(&self) -> bool {
        !self.contributions.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ObjectClass, ObjectId, TypedId};

    fn mutex(index: u32) -> MutexId {
        MutexId::from_object_id(ObjectId::new(ObjectClass::Mutex, index, 1))
    }

    fn inherit(index: u32) -> PrioritySource {
        PrioritySource::Inherit(mutex(index))
    }

    fn ceiling(index: u32) -> PrioritySource {
        PrioritySource::Ceiling(mutex(index))
    }

    #[test]
    fn test_priority_ordering() {
        assert!(Priority(2).is_higher_than(Priority(5)));
        assert!(!Priority(5).is_higher_than(Priority(5)));
        assert_eq!(Priority(7).highest(Priority(3)), Priority(3));
        assert_eq!(Priority::from(9).value(), 9);
    }

    #[test]
    fn test_nested_inheritance_releases_independently() {
        let mut agg = PriorityAggregation::new(Priority(10));
        agg.set(inherit(0), Priority(4)).unwrap();
        agg.set(inherit(1), Priority(6)).unwrap();
        assert_eq!(agg.current(), Priority(4));

        assert!(agg.remove(inherit(0)));
        assert_eq!(agg.current(), Priority(6));
        assert!(!agg.remove(inherit(0)));

        agg.set(inherit(1), Priority(12)).unwrap();
        assert_eq!(agg.current(), Priority(10));
        assert_eq!(agg.contribution(inherit(1)), Some(Priority(12)));
    }

    #[test]
    fn test_real_priority_change_under_boost() {
        let mut agg = PriorityAggregation::new(Priority(10));
        agg.set(ceiling(2), Priority(3)).unwrap();
        agg.set_real(Priority(1));
        assert_eq!(agg.current(), Priority(1));
        agg.set_real(Priority(8));
        assert_eq!(agg.current(), Priority(3));
        assert_eq!(agg.real(), Priority(8));
    }

    #[test]
    fn test_clear_transient_keeps_mutex_boosts() {
        let mut agg = PriorityAggregation::new(Priority(10));
        agg.set(PrioritySource::Job, Priority(2)).unwrap();
        agg.set(inherit(0), Priority(5)).unwrap();
        agg.clear_transient();
        assert_eq!(agg.current(), Priority(5));
        assert!(agg.has_contributions());
    }

    #[test]
    fn test_contribution_capacity() {
        let mut agg = PriorityAggregation::new(Priority(10));
        for i in 0..PRIORITY_CONTRIBUTIONS_MAX as u32 {
            agg.set(inherit(i), Priority(5)).unwrap();
        }
        assert_eq!(agg.set(inherit(99), Priority(5)), Err(Status::NoMemory));
    }
}
