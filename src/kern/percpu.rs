//! Per-processor control
//!
//! Each processor tracks the thread it is executing, the heir chosen by
//! its scheduler instance, whether a dispatch is pending, and the two
//! nesting counters that defer dispatching (thread dispatch disable level
//! and interrupt nest level).
//!
//! Changing the heir of a processor other than the current one records a
//! pending inter-processor interrupt; the kernel posts those through the
//! CPU port once the state change is complete.
//!
//! A processor whose new heir still executes on another processor cannot
//! switch to it yet. It saves the context of its own thread, leaves
//! `executing` empty and waits in the dispatcher; the processor that
//! switches away from the heir posts it an inter-processor interrupt so
//! it can complete the switch.
//!
//! Every processor also owns a help-request chain: threads that became
//! ready but could not be scheduled by their own scheduler instance wait
//! there until the processor next dispatches and offers them to other
//! instances.

use alloc::vec;
use alloc::vec::Vec;

use crate::kern::chain::{Chain, ChainNode};
use crate::types::{ProcessorMask, ThreadIndex};

// ============================================================================
// Processor State
// ============================================================================

/// Processor states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessorState {
    /// Not in the system
    OffLine,
    /// Started and owned by a scheduler instance
    Online,
}

/// Dispatch counters of a processor
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProcessorStats {
    /// Context switches performed
    pub context_switches: u64,
    /// Heir changes requested
    pub heir_updates: u64,
    /// Inter-processor interrupts received
    pub interrupts: u64,
    /// Clock ticks spent in the idle thread
    pub idle_ticks: u64,
}

/// Control block of one processor
#[derive(Debug, Clone)]
pub struct Processor {
    index: usize,
    pub(crate) state: ProcessorState,
    pub(crate) executing: Option<ThreadIndex>,
    /// Thread whose context was saved while waiting for the heir
    pub(crate) saved: Option<ThreadIndex>,
    pub(crate) heir: Option<ThreadIndex>,
    pub(crate) idle: Option<ThreadIndex>,
    pub(crate) dispatch_necessary: bool,
    pub(crate) dispatch_disable_level: u32,
    pub(crate) isr_nest_level: u32,
    pub(crate) scheduler: Option<usize>,
    pub(crate) help_requests: Chain,
    pub(crate) stats: ProcessorStats,
}

impl Processor {
    fn new(index: usize) -> Self {
        Self {
            index,
            state: ProcessorState::OffLine,
            executing: None,
            saved: None,
            heir: None,
            idle: None,
            dispatch_necessary: false,
            dispatch_disable_level: 0,
            isr_nest_level: 0,
            scheduler: None,
            help_requests: Chain::new(),
            stats: ProcessorStats::default(),
        }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn state(&self) -> ProcessorState {
        self.state
    }

    /// Thread running on this processor
    pub fn executing(&self) -> Option<ThreadIndex> {
        self.executing
    }

    /// Whether the processor waits in the dispatcher for its heir to be
    /// released by another processor
    pub fn is_waiting_for_heir(&self) -> bool {
        self.executing.is_none() && self.heir.is_some()
    }

    /// Thread selected to run next
    pub fn heir(&self) -> Option<ThreadIndex> {
        self.heir
    }

    /// Idle thread of this processor
    pub fn idle(&self) -> Option<ThreadIndex> {
        self.idle
    }

    pub fn dispatch_necessary(&self) -> bool {
        self.dispatch_necessary
    }

    pub fn dispatch_disable_level(&self) -> u32 {
        self.dispatch_disable_level
    }

    pub fn isr_nest_level(&self) -> u32 {
        self.isr_nest_level
    }

    /// Scheduler instance owning this processor
    pub fn scheduler(&self) -> Option<usize> {
        self.scheduler
    }

    /// Number of pending help requests
    pub fn help_requests(&self) -> usize {
        self.help_requests.len()
    }

    pub fn stats(&self) -> ProcessorStats {
        self.stats
    }
}

// ============================================================================
// Processor Table
// ============================================================================

/// All processors plus the identity of the current one
#[derive(Debug)]
pub struct Processors {
    cpus: Vec<Processor>,
    current: usize,
    pending_interrupts: ProcessorMask,
    help_links: Vec<ChainNode>,
    help_owner: Vec<Option<usize>>,
}

impl Processors {
    /// Create `count` offline processors; `threads` sizes the help links
    pub fn new(count: usize, threads: usize) -> Self {
        Self {
            cpus: (0..count).map(Processor::new).collect(),
            current: 0,
            pending_interrupts: ProcessorMask::empty(),
            help_links: vec![ChainNode::new(); threads],
            help_owner: vec![None; threads],
        }
    }

    pub fn count(&self) -> usize {
        self.cpus.len()
    }

    pub fn get(&self, processor: usize) -> &Processor {
        &self.cpus[processor]
    }

    pub fn get_mut(&mut self, processor: usize) -> &mut Processor {
        &mut self.cpus[processor]
    }

    pub fn iter(&self) -> impl Iterator<Item = &Processor> {
        self.cpus.iter()
    }

    /// Index of the processor executing the kernel
    pub fn current(&self) -> usize {
        self.current
    }

    pub fn set_current(&mut self, processor: usize) {
        debug_assert!(processor < self.cpus.len());
        self.current = processor;
    }

    /// Bring a processor online under a scheduler instance with its idle thread
    pub fn start(&mut self, processor: usize, scheduler: usize, idle: ThreadIndex) {
        let cpu = &mut self.cpus[processor];
        cpu.state = ProcessorState::Online;
        cpu.scheduler = Some(scheduler);
        cpu.idle = Some(idle);
        cpu.executing = Some(idle);
        cpu.heir = Some(idle);
    }

    /// Select a new heir; remote processors get an interrupt
    pub fn update_heir(&mut self, processor: usize, heir: ThreadIndex) {
        let cpu = &mut self.cpus[processor];
        if cpu.heir == Some(heir) && !cpu.dispatch_necessary && cpu.executing == Some(heir) {
            return;
        }
        log::trace!("cpu{}: heir {:?} -> {}", processor, cpu.heir, heir);
        cpu.heir = Some(heir);
        cpu.dispatch_necessary = true;
        cpu.stats.heir_updates += 1;
        if processor != self.current {
            self.pending_interrupts.insert(processor);
        }
    }

    /// Processor whose heir or executing thread is `thread`, or that still
    /// holds its saved context
    pub fn running(&self, thread: ThreadIndex) -> Option<usize> {
        self.cpus.iter().position(|cpu| {
            cpu.heir == Some(thread) || cpu.executing == Some(thread) || cpu.saved == Some(thread)
        })
    }

    /// Whether `thread` executes on any processor
    pub fn is_executing(&self, thread: ThreadIndex) -> bool {
        self.cpus.iter().any(|cpu| cpu.executing == Some(thread))
    }

    /// Whether `thread` executes on a processor other than `processor`
    pub fn executes_elsewhere(&self, thread: ThreadIndex, processor: usize) -> bool {
        self.cpus
            .iter()
            .any(|cpu| cpu.index != processor && cpu.executing == Some(thread))
    }

    /// `processor` stopped executing `thread`: interrupt every processor
    /// waiting to switch to it
    pub fn release_executing(&mut self, thread: ThreadIndex, processor: usize) {
        for cpu in self.cpus.iter() {
            if cpu.index != processor && cpu.dispatch_necessary && cpu.heir == Some(thread) {
                self.pending_interrupts.insert(cpu.index);
            }
        }
    }

    /// `processor` resumes `thread`: a processor still holding its saved
    /// context no longer switches away from it
    pub fn claim_saved(&mut self, thread: ThreadIndex, processor: usize) {
        for cpu in self.cpus.iter_mut() {
            if cpu.index != processor && cpu.saved == Some(thread) {
                cpu.saved = None;
            }
        }
    }

    /// Take the set of processors owed an inter-processor interrupt
    pub fn take_pending_interrupts(&mut self) -> ProcessorMask {
        core::mem::take(&mut self.pending_interrupts)
    }

    // ========================================================================
    // Help requests
    // ========================================================================

    /// Queue a help request for `thread` on `processor`
    pub fn request_help(&mut self, processor: usize, thread: ThreadIndex) {
        if self.help_owner[thread].is_some() {
            return;
        }
        self.cpus[processor]
            .help_requests
            .append(&mut self.help_links, thread);
        self.help_owner[thread] = Some(processor);
    }

    /// Withdraw a pending help request of `thread`
    pub fn cancel_help(&mut self, thread: ThreadIndex) {
        if let Some(processor) = self.help_owner[thread].take() {
            self.cpus[processor]
                .help_requests
                .extract(&mut self.help_links, thread);
        }
    }

    /// Pop the oldest help request of `processor`
    pub fn take_help_request(&mut self, processor: usize) -> Option<ThreadIndex> {
        let thread = self.cpus[processor]
            .help_requests
            .get_first(&mut self.help_links)?;
        self.help_owner[thread] = None;
        Some(thread)
    }
}
