//! Kern subsystem - scheduling core primitives
//!
//! Data structures (chains, red-black trees, priority bitmaps, object
//! tables), the CPU port contract, per-processor state, threads and thread
//! queues, the watchdog header and the dispatch engine, all tied together
//! by the [`Kernel`] context object.

pub mod bitmap;
pub mod chain;
pub mod dispatch;
pub mod fatal;
pub mod isr;
pub mod kernel;
pub mod object;
pub mod percpu;
pub mod port;
pub mod priority;
pub mod rbtree;
pub mod thread;
pub mod threadq;
pub mod watchdog;

pub use fatal::FatalSource;
pub use isr::{IsrGuard, IsrLock};
pub use kernel::{InvariantViolation, Kernel, SharedKernel};
pub use object::ObjectTable;
pub use percpu::{Processor, ProcessorState};
pub use port::{CpuPort, SimulatedPort, ThreadEntry};
pub use priority::{Priority, PriorityAggregation, PrioritySource};
pub use thread::{
    BudgetAlgorithm, ThreadAttributes, ThreadControl, ThreadStates, WaitClass, WaitState,
    WaitStatus,
};
pub use threadq::{QueueDiscipline, QueueRef, ThreadQueue};
pub use watchdog::{WatchdogHeader, WatchdogRoutine};
