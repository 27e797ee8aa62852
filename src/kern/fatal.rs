//! Fatal error path
//!
//! Invariant violations in the scheduling core cannot be isolated, so there
//! is exactly one way out: log the error and hand control to the CPU port,
//! which halts or resets the system.

use crate::error::InternalError;
use crate::kern::port::CpuPort;

/// Subsystem that detected a fatal error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FatalSource {
    /// Kernel initialization
    Initialization,
    /// Dispatch engine
    Dispatch,
    /// Scheduler algorithm
    Scheduler,
    /// Thread queues
    ThreadQueue,
    /// Thread table
    Thread,
    /// Interrupt entry and exit
    Interrupt,
}

/// Report a fatal error and halt
#[cold]
pub fn fatal(port: &dyn CpuPort, source: FatalSource, error: InternalError) -> ! {
    log::error!("FATAL [{:?}]: {}", source, error);
    port.fatal_halt(source, error)
}
