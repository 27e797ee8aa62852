//! Pluggable scheduler algorithms
//!
//! A scheduler instance owns the ready set of the threads assigned to it
//! and decides the heir of every processor it owns. All algorithms share
//! the [`Scheduler`] operation contract and differ only in how they order
//! the ready set ([`ReadyQueue`]) and whether they drive one or several
//! processors:
//!
//! | Algorithm        | Ready queue              | Processors |
//! |------------------|--------------------------|------------|
//! | `PriorityBitmap` | bitmap + FIFO per level  | one        |
//! | `Simple`         | single ordered chain     | one        |
//! | `Edf`            | red-black tree           | one        |
//! | `PrioritySmp`    | bitmap + FIFO per level  | many       |
//! | `SimpleSmp`      | single ordered chain     | many       |
//! | `EdfSmp`         | red-black tree           | many       |
//!
//! ## Ordering
//!
//! Every ready thread is keyed by `(priority, sequence)`. The sequence is
//! drawn from a counter when the thread is appended (increasing) or
//! prepended (decreasing) and survives priority changes, so a thread that
//! is boosted and later restored returns to its original place among its
//! peers.

pub mod edf;
pub mod priority;
pub mod simple;
pub mod smp;
pub mod uniprocessor;

use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::fmt;

use crate::config::{SchedulerAlgorithm, SchedulerConfig};
use crate::error::{InternalError, Result, Status};
use crate::kern::fatal::{fatal, FatalSource};
use crate::kern::percpu::Processors;
use crate::kern::port::CpuPort;
use crate::kern::priority::Priority;
use crate::types::{ProcessorMask, ThreadIndex, Ticks};

pub use edf::EdfReadyQueue;
pub use priority::PriorityReadyQueue;
pub use simple::SimpleReadyQueue;
pub use smp::Smp;
pub use uniprocessor::Uniprocessor;

// ============================================================================
// Scheduler Nodes
// ============================================================================

/// Scheduling state of a thread within its instance
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeState {
    /// Not in the ready set
    Blocked,
    /// In the ready set, not assigned a processor
    Ready,
    /// Assigned a processor (SMP instances only)
    Scheduled,
}

/// Attributes fixed when a node is created
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeAttributes {
    pub preemptible: bool,
    pub affinity: ProcessorMask,
    pub idle: bool,
}

/// Per-thread bookkeeping of a scheduler instance
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchedulerNode {
    /// Mapped current priority
    pub priority: Priority,
    /// Position among threads of equal priority
    pub sequence: i64,
    pub state: NodeState,
    pub preemptible: bool,
    pub affinity: ProcessorMask,
    /// Processor assigned while scheduled
    pub processor: Option<usize>,
    pub idle: bool,
}

impl SchedulerNode {
    /// Ordering key within the ready set
    pub fn key(&self) -> (Priority, i64) {
        (self.priority, self.sequence)
    }
}

/// Node storage indexed by thread
///
/// Asking for the node of a thread the instance does not hold is a broken
/// kernel invariant and goes down the fatal path of `port`.
pub(crate) struct NodeTable {
    nodes: Vec<Option<SchedulerNode>>,
    append: i64,
    prepend: i64,
    port: Arc<dyn CpuPort>,
}

impl fmt::Debug for NodeTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeTable")
            .field("nodes", &self.nodes)
            .field("append", &self.append)
            .field("prepend", &self.prepend)
            .finish_non_exhaustive()
    }
}

impl NodeTable {
    pub(crate) fn new(threads: usize, port: Arc<dyn CpuPort>) -> Self {
        let mut nodes = Vec::with_capacity(threads);
        nodes.resize(threads, None);
        Self {
            nodes,
            append: 0,
            prepend: 0,
            port,
        }
    }

    /// Thread slots the table was sized for
    pub(crate) fn capacity(&self) -> usize {
        self.nodes.len()
    }

    pub(crate) fn initialize(
        &mut self,
        thread: ThreadIndex,
        priority: Priority,
        attributes: NodeAttributes,
    ) {
        if thread >= self.nodes.len() {
            self.nodes.resize(thread + 1, None);
        }
        self.nodes[thread] = Some(SchedulerNode {
            priority,
            sequence: 0,
            state: NodeState::Blocked,
            preemptible: attributes.preemptible,
            affinity: attributes.affinity,
            processor: None,
            idle: attributes.idle,
        });
    }

    pub(crate) fn destroy(&mut self, thread: ThreadIndex) -> Option<SchedulerNode> {
        self.nodes.get_mut(thread).and_then(Option::take)
    }

    pub(crate) fn get(&self, thread: ThreadIndex) -> Option<&SchedulerNode> {
        self.nodes.get(thread).and_then(Option::as_ref)
    }

    pub(crate) fn node(&self, thread: ThreadIndex) -> &SchedulerNode {
        match self.nodes.get(thread) {
            Some(Some(node)) => node,
            _ => fatal(
                self.port.as_ref(),
                FatalSource::Scheduler,
                InternalError::NoSchedulerNode(thread),
            ),
        }
    }

    pub(crate) fn node_mut(&mut self, thread: ThreadIndex) -> &mut SchedulerNode {
        match self.nodes.get_mut(thread) {
            Some(Some(node)) => node,
            _ => fatal(
                self.port.as_ref(),
                FatalSource::Scheduler,
                InternalError::NoSchedulerNode(thread),
            ),
        }
    }

    pub(crate) fn key(&self, thread: ThreadIndex) -> (Priority, i64) {
        self.node(thread).key()
    }

    pub(crate) fn next_append(&mut self) -> i64 {
        self.append += 1;
        self.append
    }

    pub(crate) fn next_prepend(&mut self) -> i64 {
        self.prepend -= 1;
        self.prepend
    }
}

// ============================================================================
// Priority Mapping
// ============================================================================

/// Background bit of EDF priorities: threads without a job sort after all
/// threads with a deadline
pub const EDF_BACKGROUND: u64 = 1 << 62;

/// Translation between user priorities and scheduler priorities
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PriorityMapping {
    /// Scheduler priority equals the user priority
    Identity,
    /// EDF: user priorities become background priorities; job deadlines
    /// are used directly
    Deadline,
}

impl PriorityMapping {
    pub fn map(self, priority: Priority) -> Priority {
        match self {
            PriorityMapping::Identity => priority,
            PriorityMapping::Deadline => Priority(EDF_BACKGROUND | priority.0),
        }
    }

    pub fn unmap(self, priority: Priority) -> Priority {
        match self {
            PriorityMapping::Identity => priority,
            PriorityMapping::Deadline => Priority(priority.0 & !EDF_BACKGROUND),
        }
    }

    /// Scheduler priority of a job with an absolute deadline
    pub fn job(self, deadline: Ticks) -> Option<Priority> {
        match self {
            PriorityMapping::Identity => None,
            PriorityMapping::Deadline => Some(Priority(deadline.min(EDF_BACKGROUND - 1))),
        }
    }
}

// ============================================================================
// Ready Queues
// ============================================================================

/// Ordered ready set keyed by `(priority, sequence)`
pub trait ReadyQueue: Send {
    /// Create a queue for priorities `0..levels` and `threads` thread slots
    fn new(levels: usize, threads: usize) -> Self
    where
        Self: Sized;

    fn insert(&mut self, thread: ThreadIndex, priority: Priority, sequence: i64);

    fn extract(&mut self, thread: ThreadIndex);

    /// Highest-priority thread, FIFO among equals
    fn first(&self) -> Option<ThreadIndex>;

    /// Highest-priority thread accepted by `filter`
    fn first_matching(&self, filter: &mut dyn FnMut(ThreadIndex) -> bool) -> Option<ThreadIndex>;

    fn contains(&self, thread: ThreadIndex) -> bool;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// ============================================================================
// Scheduler Contract
// ============================================================================

/// Operations every scheduler algorithm implements
///
/// Threads are addressed by their thread-table index. `cpus` is the
/// processor table; schedulers only touch the processors they own and
/// communicate decisions exclusively through [`Processors::update_heir`].
pub trait Scheduler: Send {
    /// Instance name from the configuration
    fn name(&self) -> &'static str;

    fn algorithm(&self) -> SchedulerAlgorithm;

    /// Processors owned by this instance
    fn processors(&self) -> ProcessorMask;

    /// Least important valid user priority (the idle priority)
    fn maximum_priority(&self) -> Priority;

    fn mapping(&self) -> PriorityMapping;

    /// User priority to scheduler priority
    fn map_priority(&self, priority: Priority) -> Priority {
        self.mapping().map(priority)
    }

    /// Scheduler priority to user priority
    fn unmap_priority(&self, priority: Priority) -> Priority {
        self.mapping().unmap(priority)
    }

    /// Priority of a released job, for deadline-driven algorithms
    fn job_priority(&self, deadline: Ticks) -> Option<Priority> {
        self.mapping().job(deadline)
    }

    /// Create the node of a thread joining this instance (blocked)
    fn node_initialize(
        &mut self,
        thread: ThreadIndex,
        priority: Priority,
        attributes: NodeAttributes,
    );

    /// Remove the node of a thread leaving this instance; it must be blocked
    fn node_destroy(&mut self, thread: ThreadIndex);

    fn node(&self, thread: ThreadIndex) -> Option<&SchedulerNode>;

    /// Make a thread ready behind its peers, preempting if it outranks
    fn enqueue(&mut self, cpus: &mut Processors, thread: ThreadIndex);

    /// Make a thread ready in front of its peers, preempting if it outranks
    ///
    /// The kernel does not prepend on its own paths: a thread released from
    /// a boost goes through [`Scheduler::update_priority`], which keeps its
    /// sequence and so returns it to its original place among its peers.
    fn enqueue_first(&mut self, cpus: &mut Processors, thread: ThreadIndex);

    /// Remove a thread from the ready set
    fn extract(&mut self, cpus: &mut Processors, thread: ThreadIndex);

    /// Recompute the heir of every owned processor
    fn schedule(&mut self, cpus: &mut Processors);

    /// A ready thread blocks
    fn block(&mut self, cpus: &mut Processors, thread: ThreadIndex);

    /// A blocked thread becomes ready
    fn unblock(&mut self, cpus: &mut Processors, thread: ThreadIndex) {
        self.enqueue(cpus, thread);
    }

    /// New scheduler priority; FIFO position among peers is preserved
    fn update_priority(&mut self, cpus: &mut Processors, thread: ThreadIndex, priority: Priority);

    /// Move a ready thread behind its peers
    fn yield_thread(&mut self, cpus: &mut Processors, thread: ThreadIndex);

    /// Put the idle thread of `processor` into service
    fn start_idle(&mut self, cpus: &mut Processors, thread: ThreadIndex, processor: usize);

    fn set_preemptible(
        &mut self,
        cpus: &mut Processors,
        thread: ThreadIndex,
        preemptible: bool,
    ) -> Result<()>;

    fn set_affinity(
        &mut self,
        cpus: &mut Processors,
        thread: ThreadIndex,
        affinity: ProcessorMask,
    ) -> Result<()>;

    /// Whether this instance would run a thread of `priority` right away
    /// on one of the processors in `affinity`
    fn ask_for_help(&self, cpus: &Processors, priority: Priority, affinity: ProcessorMask) -> bool;

    /// Whether `thread` holds (or is about to hold) a processor
    fn is_scheduled(&self, cpus: &Processors, thread: ThreadIndex) -> bool;

    /// Number of threads in the ready set, scheduled ones included
    fn ready_count(&self) -> usize;
}

/// Build a scheduler instance from its configuration
pub fn create(
    config: &SchedulerConfig,
    threads: usize,
    port: &Arc<dyn CpuPort>,
) -> Result<Box<dyn Scheduler>> {
    let levels = config.maximum_priority as usize + 1;
    let maximum = Priority(config.maximum_priority);
    let nodes = || NodeTable::new(threads, port.clone());
    let uniprocessor = || -> Result<usize> {
        match config.processors.count() {
            1 => config.processors.lowest().ok_or(Status::InvalidNumber),
            _ => Err(Status::InvalidNumber),
        }
    };

    let scheduler: Box<dyn Scheduler> = match config.algorithm {
        SchedulerAlgorithm::PriorityBitmap => Box::new(Uniprocessor::new(
            config,
            uniprocessor()?,
            maximum,
            PriorityMapping::Identity,
            PriorityReadyQueue::new(levels, threads),
            nodes(),
        )),
        SchedulerAlgorithm::Simple => Box::new(Uniprocessor::new(
            config,
            uniprocessor()?,
            maximum,
            PriorityMapping::Identity,
            SimpleReadyQueue::new(levels, threads),
            nodes(),
        )),
        SchedulerAlgorithm::Edf => Box::new(Uniprocessor::new(
            config,
            uniprocessor()?,
            maximum,
            PriorityMapping::Deadline,
            EdfReadyQueue::new(levels, threads),
            nodes(),
        )),
        SchedulerAlgorithm::PrioritySmp => Box::new(Smp::new(
            config,
            maximum,
            PriorityMapping::Identity,
            PriorityReadyQueue::new(levels, threads),
            nodes(),
        )),
        SchedulerAlgorithm::SimpleSmp => Box::new(Smp::new(
            config,
            maximum,
            PriorityMapping::Identity,
            SimpleReadyQueue::new(levels, threads),
            nodes(),
        )),
        SchedulerAlgorithm::EdfSmp => Box::new(Smp::new(
            config,
            maximum,
            PriorityMapping::Deadline,
            EdfReadyQueue::new(levels, threads),
            nodes(),
        )),
    };
    log::debug!(
        "scheduler {} ({:?}) on processors {:#x}",
        config.name,
        config.algorithm,
        config.processors.bits()
    );
    Ok(scheduler)
}
