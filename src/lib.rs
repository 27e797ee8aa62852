//! SuperCore - scheduler, thread-state and dispatch core of a real-time
//! executive
//!
//! The crate holds the part of a kernel that decides which thread runs on
//! which processor: thread control blocks and their blocking states,
//! pluggable scheduler algorithms (fixed priority, EDF, global SMP),
//! thread queues for the synchronization objects built on top of them,
//! watchdogs driven by the clock tick, and the dispatch engine that turns a
//! scheduling decision into a context switch through the CPU port.
//!
//! All state lives in one [`Kernel`] value; directives are methods on it.
//!
//! ```ignore
//! let port = Arc::new(SimulatedPort::new(1));
//! let mut kernel = Kernel::new(Configuration::default(), port)?;
//! let worker = kernel.thread_create(&ThreadAttributes::new("WORK", 10))?;
//! kernel.thread_start(worker, ThreadEntry::default())?;
//! ```

#![cfg_attr(not(test), no_std)]
// Kernel types have specialized initialization that doesn't fit Default
#![allow(clippy::new_without_default)]
// Object tables expose len() without a meaningful is_empty() in places
#![allow(clippy::len_without_is_empty)]

extern crate alloc;

pub mod config;
pub mod error;
pub mod kern;
pub mod ratemon;
pub mod sched;
pub mod sync;
pub mod timer;
pub mod types;

pub use config::{Configuration, SchedulerAlgorithm, SchedulerConfig};
pub use error::{InternalError, Result, Status};
pub use kern::{
    BudgetAlgorithm, CpuPort, Kernel, Priority, QueueDiscipline, QueueRef, SharedKernel,
    SimulatedPort, ThreadAttributes, ThreadEntry, ThreadStates, WaitStatus,
};
pub use ratemon::{PeriodState, PeriodStatus};
pub use sync::{
    BarrierRelease, EventCondition, EventOutcome, EventSet, LockingProtocol, MessageQueueAttributes,
    MutexAttributes, ReceiveOutcome, SemaphoreAttributes,
};
pub use timer::{TimerAction, TimerCallback};
pub use types::{
    BarrierId, CondVarId, MessageQueueId, MutexId, PeriodId, ProcessorMask, SemaphoreId, ThreadId,
    Ticks, Timeout, TimerId, WaitOutcome,
};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
