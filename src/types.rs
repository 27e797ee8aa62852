//! Common types used across the core
//!
//! Object identifiers, processor masks and wait descriptors shared by the
//! kernel, the schedulers and the synchronization objects. Kept here to
//! avoid circular dependencies between those modules.

use core::fmt;

/// Clock ticks since kernel initialization
pub type Ticks = u64;

/// Slot index of a thread in the thread table
///
/// Schedulers, wait queues and processors refer to threads by this index.
/// It is only meaningful while the thread is alive; directives take a
/// generation-checked [`ThreadId`] instead.
pub type ThreadIndex = usize;

/// Maximum number of processors a [`ProcessorMask`] can describe
pub const MAX_PROCESSORS: usize = 64;

// ============================================================================
// Object Identifiers
// ============================================================================

/// Kind of kernel object an id refers to
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum ObjectClass {
    Thread = 1,
    Mutex = 2,
    Semaphore = 3,
    ConditionVariable = 4,
    MessageQueue = 5,
    Barrier = 6,
    Timer = 7,
    Period = 8,
}

/// Object identifier: class, arena slot and slot generation
///
/// The generation is bumped every time a slot is freed, so an id kept past
/// the death of its object never resolves to the slot's next occupant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ObjectId {
    class: ObjectClass,
    index: u32,
    generation: u32,
}

impl ObjectId {
    /// Create an object id
    pub const fn new(class: ObjectClass, index: u32, generation: u32) -> Self {
        Self {
            class,
            index,
            generation,
        }
    }

    /// Object class
    pub const fn class(&self) -> ObjectClass {
        self.class
    }

    /// Arena slot
    pub const fn index(&self) -> u32 {
        self.index
    }

    /// Slot generation
    pub const fn generation(&self) -> u32 {
        self.generation
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}#{}.{}", self.class, self.index, self.generation)
    }
}

/// Id type bound to one object class
pub trait TypedId: Copy + Eq + fmt::Debug {
    /// Class of the objects this id names
    const CLASS: ObjectClass;

    /// Wrap a raw object id; the class must match
    fn from_object_id(id: ObjectId) -> Self;

    /// Raw object id
    fn object_id(self) -> ObjectId;

    /// Arena slot of the object
    fn index(self) -> usize {
        self.object_id().index() as usize
    }
}

macro_rules! typed_id {
    ($(#[$meta:meta])* $name:ident => $class:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
        pub struct $name(ObjectId);

        impl TypedId for $name {
            const CLASS: ObjectClass = ObjectClass::$class;

            fn from_object_id(id: ObjectId) -> Self {
                debug_assert_eq!(id.class(), ObjectClass::$class);
                Self(id)
            }

            fn object_id(self) -> ObjectId {
                self.0
            }
        }

        impl From<$name> for ObjectId {
            fn from(id: $name) -> ObjectId {
                id.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                self.0.fmt(f)
            }
        }
    };
}

typed_id!(
    /// Thread identifier
    ThreadId => Thread
);
typed_id!(
    /// Mutex identifier
    MutexId => Mutex
);
typed_id!(
    /// Counting semaphore identifier
    SemaphoreId => Semaphore
);
typed_id!(
    /// Condition variable identifier
    CondVarId => ConditionVariable
);
typed_id!(
    /// Message queue identifier
    MessageQueueId => MessageQueue
);
typed_id!(
    /// Barrier identifier
    BarrierId => Barrier
);
typed_id!(
    /// Timer identifier
    TimerId => Timer
);
typed_id!(
    /// Rate-monotonic period identifier
    PeriodId => Period
);

// ============================================================================
// Waiting
// ============================================================================

/// How long a blocking directive may wait
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Timeout {
    /// Fail with `Unsatisfied` instead of blocking
    NoWait,
    /// Block until satisfied, flushed or deleted
    #[default]
    Forever,
    /// Block for at most this many ticks; zero means forever
    Ticks(Ticks),
}

impl Timeout {
    /// Ticks to arm a watchdog for, if any
    pub fn interval(self) -> Option<Ticks> {
        match self {
            Timeout::Ticks(n) if n > 0 => Some(n),
            _ => None,
        }
    }
}

/// Immediate outcome of a blocking directive for the calling thread
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    /// The request was satisfied without blocking
    Satisfied,
    /// The caller blocked; its final status is delivered when it wakes
    Blocked,
}

// ============================================================================
// Processor Masks
// ============================================================================

/// Set of processors, used for affinity and scheduler ownership
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct ProcessorMask(u64);

impl ProcessorMask {
    /// Empty set
    pub const fn empty() -> Self {
        Self(0)
    }

    /// Processors `0..count`
    pub const fn first(count: usize) -> Self {
        if count >= MAX_PROCESSORS {
            Self(u64::MAX)
        } else {
            Self((1u64 << count) - 1)
        }
    }

    /// Single processor
    pub const fn single(processor: usize) -> Self {
        Self(1u64 << processor)
    }

    /// Raw bits
    pub const fn bits(&self) -> u64 {
        self.0
    }

    /// Build from raw bits
    pub const fn from_bits(bits: u64) -> Self {
        Self(bits)
    }

    pub fn contains(&self, processor: usize) -> bool {
        processor < MAX_PROCESSORS && self.0 & (1u64 << processor) != 0
    }

    pub fn insert(&mut self, processor: usize) {
        self.0 |= 1u64 << processor;
    }

    pub fn remove(&mut self, processor: usize) {
        self.0 &= !(1u64 << processor);
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    /// Number of processors in the set
    pub fn count(&self) -> usize {
        self.0.count_ones() as usize
    }

    /// Lowest processor in the set
    pub fn lowest(&self) -> Option<usize> {
        if self.0 == 0 {
            None
        } else {
            Some(self.0.trailing_zeros() as usize)
        }
    }

    pub fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    pub fn intersection(self, other: Self) -> Self {
        Self(self.0 & other.0)
    }

    pub fn difference(self, other: Self) -> Self {
        Self(self.0 & !other.0)
    }

    pub fn is_subset(&self, other: &Self) -> bool {
        self.0 & !other.0 == 0
    }

    /// Iterate processors in ascending order
    pub fn iter(self) -> impl Iterator<Item = usize> {
        let mut bits = self.0;
        core::iter::from_fn(move || {
            if bits == 0 {
                return None;
            }
            let next = bits.trailing_zeros() as usize;
            bits &= bits - 1;
            Some(next)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_object_id_display() {
        let id = ObjectId::new(ObjectClass::Thread, 3, 7);
        assert_eq!(alloc::format!("{}", id), "Thread#3.7");
    }

    #[test]
    fn test_typed_id() {
        let raw = ObjectId::new(ObjectClass::Mutex, 2, 1);
        let id = MutexId::from_object_id(raw);
        assert_eq!(id.index(), 2);
        assert_eq!(ObjectId::from(id), raw);
        assert_eq!(MutexId::CLASS, ObjectClass::Mutex);
    }

    #[test]
    fn test_timeout_interval() {
        assert_eq!(Timeout::NoWait.interval(), None);
        assert_eq!(Timeout::Forever.interval(), None);
        assert_eq!(Timeout::Ticks(0).interval(), None);
        assert_eq!(Timeout::Ticks(10).interval(), Some(10));
    }

    #[test]
    fn test_processor_mask() {
        let mut mask = ProcessorMask::first(3);
        assert_eq!(mask.count(), 3);
        assert!(mask.contains(2));
        assert!(!mask.contains(3));
        mask.remove(1);
        assert_eq!(mask.iter().collect::<alloc::vec::Vec<_>>(), [0, 2]);
        assert_eq!(mask.lowest(), Some(0));
        assert!(ProcessorMask::single(2).is_subset(&mask));
        assert!(mask.difference(ProcessorMask::single(0)).contains(2));
        assert_eq!(ProcessorMask::first(64).bits(), u64::MAX);
        assert!(ProcessorMask::empty().is_empty());
    }
}
