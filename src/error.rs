//! Status codes and internal error codes
//!
//! Two families of failure exist in the core:
//!
//! - [`Status`] is returned to the caller of a directive. Invalid ids,
//!   invalid priorities, exhausted object tables and wait outcomes such as
//!   a timeout all land here. The core keeps running.
//! - [`InternalError`] describes a broken kernel invariant. These are never
//!   returned; they are handed to [`crate::kern::fatal::fatal`] which halts
//!   the system through the CPU port.

use thiserror::Error;

// ============================================================================
// User-visible status
// ============================================================================

/// Status returned by kernel directives and delivered to woken threads
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Error)]
pub enum Status {
    /// Object id is unknown, stale, or of the wrong class
    #[error("invalid object id")]
    InvalidId,
    /// Priority outside the valid range of the scheduler instance
    #[error("invalid priority")]
    InvalidPriority,
    /// Numeric argument out of range
    #[error("invalid number")]
    InvalidNumber,
    /// Size argument out of range
    #[error("invalid size")]
    InvalidSize,
    /// Object table is full
    #[error("too many objects")]
    TooMany,
    /// Fixed-capacity storage exhausted
    #[error("out of memory")]
    NoMemory,
    /// Resource not available and the caller did not wait
    #[error("request not satisfied")]
    Unsatisfied,
    /// Wait ended because its timeout elapsed
    #[error("timed out")]
    Timeout,
    /// Object was deleted while the thread waited on it
    #[error("object was deleted")]
    ObjectWasDeleted,
    /// Object still in use
    #[error("resource in use")]
    ResourceInUse,
    /// Caller does not own the resource
    #[error("not owner of resource")]
    NotOwnerOfResource,
    /// Object is in the wrong state for this operation
    #[error("incorrect state")]
    IncorrectState,
    /// Thread is already suspended
    #[error("already suspended")]
    AlreadySuspended,
    /// Waiting would close a cycle of mutex owners
    #[error("deadlock detected")]
    Deadlock,
    /// Caller priority is above the mutex ceiling
    #[error("priority ceiling violated")]
    CeilingViolated,
    /// Operation is not permitted on the calling thread or an idle thread
    #[error("illegal on this thread")]
    IllegalOnThread,
    /// Attribute combination is not supported
    #[error("not defined")]
    NotDefined,
    /// No thread is executing on the current processor
    #[error("no executing thread")]
    NoExecutingThread,
}

/// Result type used by all directives
pub type Result<T> = core::result::Result<T, Status>;

// ============================================================================
// Internal (fatal) errors
// ============================================================================

/// Broken kernel invariant; always fatal
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum InternalError {
    /// Dispatcher entered while dispatching was disabled
    #[error("thread dispatch with disable level {0}")]
    BadThreadDispatchDisableLevel(u32),
    /// Dispatch enable without matching disable
    #[error("unbalanced thread dispatch enable")]
    UnbalancedDispatchEnable,
    /// ISR exit without matching ISR enter
    #[error("unbalanced interrupt nesting")]
    UnbalancedIsrNesting,
    /// Scheduler operation violated its contract
    #[error("scheduler contract violated: {0}")]
    SchedulerContract(&'static str),
    /// Thread queue linkage does not match the thread state
    #[error("thread queue corrupted")]
    ThreadQueueCorrupted,
    /// A processor ended up without any thread to run
    #[error("no heir on processor {0}")]
    NoHeir(usize),
    /// A configured processor could not be started
    #[error("processor {0} failed to start")]
    StartProcessorFailed(usize),
    /// Kernel objects could not be created during initialization
    #[error("initialization failed: {0}")]
    Initialization(&'static str),
    /// A thread index refers to an empty slot of the thread table
    #[error("no thread in slot {0}")]
    NoThread(usize),
    /// A scheduler instance was asked about a thread it holds no node for
    #[error("no scheduler node for thread {0}")]
    NoSchedulerNode(usize),
}
