//! CPU port contract
//!
//! Everything architecture specific that the core depends on: local
//! interrupt masking, the identity of the executing processor, the context
//! switch, inter-processor interrupts, processor start-up and the final
//! halt on a fatal error. A board support package implements [`CpuPort`];
//! the core only ever calls through this trait.
//!
//! [`SimulatedPort`] is a hosted implementation that records context
//! switches and interrupts so the scheduling core can be exercised in
//! ordinary unit tests.

use alloc::vec::Vec;
use core::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use spin::Mutex;

use crate::error::InternalError;
use crate::kern::fatal::FatalSource;
use crate::types::ThreadId;

/// Saved interrupt level returned by [`CpuPort::interrupt_disable`]
pub type IsrLevel = u32;

/// Entry point handed to the port when a thread starts
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ThreadEntry {
    /// Address of the thread body
    pub entry: usize,
    /// Argument passed to the body
    pub argument: usize,
}

/// Architecture interface consumed by the core
pub trait CpuPort: Send + Sync {
    /// Disable local interrupts and return the previous level
    fn interrupt_disable(&self) -> IsrLevel;

    /// Restore a level returned by `interrupt_disable`
    fn interrupt_restore(&self, level: IsrLevel);

    /// Index of the processor executing the caller
    fn current_processor(&self) -> usize;

    /// Number of processors present; queried once at initialization
    fn processor_count(&self) -> usize {
        1
    }

    /// Bring a secondary processor online
    fn start_processor(&self, _processor: usize) -> bool {
        true
    }

    /// Prepare the register context of a thread about to start
    fn context_initialize(&self, _thread: ThreadId, _entry: ThreadEntry) {}

    /// Save the context of `executing` and resume `heir` on `processor`
    fn context_switch(&self, processor: usize, executing: ThreadId, heir: ThreadId);

    /// Post an inter-processor interrupt so `target` re-evaluates its heir
    fn send_interrupt(&self, target: usize);

    /// Stop the system; never returns
    fn fatal_halt(&self, source: FatalSource, error: InternalError) -> !;
}

// ============================================================================
// Simulated Port
// ============================================================================

/// A context switch recorded by [`SimulatedPort`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContextSwitch {
    pub processor: usize,
    pub from: ThreadId,
    pub to: ThreadId,
}

/// Hosted port that records what the core asked of the hardware
#[derive(Debug)]
pub struct SimulatedPort {
    processors: usize,
    current: AtomicUsize,
    level: AtomicU32,
    switches: Mutex<Vec<ContextSwitch>>,
    interrupts: Mutex<Vec<usize>>,
    started: Mutex<Vec<(ThreadId, ThreadEntry)>>,
}

impl SimulatedPort {
    /// Create a port with `processors` processors, executing on processor 0
    pub fn new(processors: usize) -> Self {
        Self {
            processors,
            current: AtomicUsize::new(0),
            level: AtomicU32::new(0),
            switches: Mutex::new(Vec::new()),
            interrupts: Mutex::new(Vec::new()),
            started: Mutex::new(Vec::new()),
        }
    }

    /// Pretend subsequent calls run on `processor`
    pub fn set_current_processor(&self, processor: usize) {
        assert!(processor < self.processors);
        self.current.store(processor, Ordering::SeqCst);
    }

    /// Whether interrupts are currently enabled
    pub fn interrupts_enabled(&self) -> bool {
        self.level.load(Ordering::SeqCst) == 0
    }

    /// Context switches performed so far
    pub fn switches(&self) -> Vec<ContextSwitch> {
        self.switches.lock().clone()
    }

    /// Drain recorded inter-processor interrupts
    pub fn take_interrupts(&self) -> Vec<usize> {
        core::mem::take(&mut *self.interrupts.lock())
    }

    /// Threads whose context was initialized
    pub fn started(&self) -> Vec<(ThreadId, ThreadEntry)> {
        self.started.lock().clone()
    }
}

impl CpuPort for SimulatedPort {
    fn interrupt_disable(&self) -> IsrLevel {
        self.level.fetch_add(1, Ordering::SeqCst)
    }

    fn interrupt_restore(&self, level: IsrLevel) {
        self.level.store(level, Ordering::SeqCst);
    }

    fn current_processor(&self) -> usize {
        self.current.load(Ordering::SeqCst)
    }

    fn processor_count(&self) -> usize {
        self.processors
    }

    fn context_initialize(&self, thread: ThreadId, entry: ThreadEntry) {
        self.started.lock().push((thread, entry));
    }

    fn context_switch(&self, processor: usize, executing: ThreadId, heir: ThreadId) {
        self.switches.lock().push(ContextSwitch {
            processor,
            from: executing,
            to: heir,
        });
    }

    fn send_interrupt(&self, target: usize) {
        self.interrupts.lock().push(target);
    }

    fn fatal_halt(&self, source: FatalSource, error: InternalError) -> ! {
        panic!("fatal error ({:?}): {}", source, error)
    }
}
