//! Synchronization objects
//!
//! Each object is a thin wrapper around one [`ThreadQueue`] plus its own
//! payload (owner and nesting, counter, pending messages). The directives
//! are implemented on [`Kernel`] next to the object type, the same way the
//! thread directives live in `kern::thread`.
//!
//! [`ThreadQueue`]: crate::kern::threadq::ThreadQueue
//! [`Kernel`]: crate::kern::kernel::Kernel

pub mod barrier;
pub mod condvar;
pub mod event;
pub mod msgq;
pub mod mutex;
pub mod semaphore;

pub use barrier::{Barrier, BarrierRelease};
pub use condvar::ConditionVariable;
pub use event::{EventCondition, EventOutcome, EventSet};
pub use msgq::{Message, MessageQueue, MessageQueueAttributes, ReceiveOutcome, MESSAGE_SIZE_MAX};
pub use mutex::{LockingProtocol, Mutex, MutexAttributes};
pub use semaphore::{Semaphore, SemaphoreAttributes};
