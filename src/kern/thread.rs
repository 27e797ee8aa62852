//! Thread control
//!
//! The thread control block (TCB) and the thread lifecycle directives.
//!
//! A thread's `state` is an OR of independent blocking reasons. The thread
//! is ready exactly when no bit is set; [`Kernel::set_state`] and
//! [`Kernel::clear_state`] are the only code paths that change the bits and
//! they are where the scheduler learns that a thread blocked or became
//! ready again.
//!
//! Priorities are two-valued. The real priority is the one assigned by the
//! user; the current priority is the best of the real priority and every
//! active contribution (inheritance and ceiling mutexes, released EDF
//! jobs). Both are kept in scheduler space, i.e. already mapped by the
//! thread's scheduler instance. Every change of the current priority is
//! routed through [`Kernel::update_priority`] so the ready set and any wait
//! queue the thread sits on stay ordered.
//!
//! Lifecycle:
//!
//! ```text
//! create -> Dormant --start--> Ready <-> Executing
//!                                ^            |
//!                                |         block
//!                                +- Blocked <-+
//! delete/exit (any state) -> Zombie -> reaped after its last dispatch
//! ```

use bitflags::bitflags;
use heapless::String;

use crate::error::{InternalError, Result, Status};
use crate::kern::fatal::{fatal, FatalSource};
use crate::kern::kernel::Kernel;
use crate::kern::port::ThreadEntry;
use crate::kern::priority::{Priority, PriorityAggregation, PrioritySource};
use crate::kern::threadq::QueueRef;
use crate::kern::watchdog::{WatchdogId, WatchdogRoutine};
use crate::sched::{NodeAttributes, NodeState};
use crate::sync::event::{EventCondition, EventSet};
use crate::sync::msgq::Message;
use crate::types::{MutexId, ProcessorMask, ThreadId, ThreadIndex, Ticks, TypedId, WaitOutcome};

/// Longest thread name kept in the TCB; longer names are truncated
pub const THREAD_NAME_MAX: usize = 16;

/// Final status of a wait, delivered to the woken thread
pub type WaitStatus = core::result::Result<(), Status>;

// ============================================================================
// Thread States
// ============================================================================

bitflags! {
    /// Reasons a thread is not ready
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct ThreadStates: u32 {
        /// Created but never started
        const DORMANT = 1 << 0;
        /// Suspended by a directive
        const SUSPENDED = 1 << 1;
        /// Delayed, or waiting for a timeout only
        const WAITING_FOR_TIME = 1 << 2;
        const WAITING_FOR_MUTEX = 1 << 3;
        const WAITING_FOR_SEMAPHORE = 1 << 4;
        const WAITING_FOR_CONDITION_VARIABLE = 1 << 5;
        const WAITING_FOR_MESSAGE = 1 << 6;
        const WAITING_FOR_BARRIER = 1 << 7;
        const WAITING_FOR_EVENT = 1 << 8;
        const WAITING_FOR_PERIOD = 1 << 9;
        /// Deleted, waiting to be reaped
        const ZOMBIE = 1 << 10;

        /// Waits that keep the thread on a thread queue
        const WAITING_ON_QUEUE = Self::WAITING_FOR_MUTEX.bits()
            | Self::WAITING_FOR_SEMAPHORE.bits()
            | Self::WAITING_FOR_CONDITION_VARIABLE.bits()
            | Self::WAITING_FOR_MESSAGE.bits()
            | Self::WAITING_FOR_BARRIER.bits();

        /// Every wait that ends through an unblock or a timeout
        const BLOCKED = Self::WAITING_ON_QUEUE.bits()
            | Self::WAITING_FOR_TIME.bits()
            | Self::WAITING_FOR_EVENT.bits()
            | Self::WAITING_FOR_PERIOD.bits();
    }
}

// ============================================================================
// Wait Information
// ============================================================================

/// What a thread is waiting for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitClass {
    None,
    /// A thread queue of a synchronization object
    Object,
    Event,
    Period,
    Time,
}

/// Progress of the blocking protocol
///
/// A blocking thread first announces its intent, then commits. An unblock
/// or timeout that arrives between the two moves the thread to
/// `ReadyAgain`, and the commit step notices and undoes the block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitState {
    Ready,
    IntendToBlock,
    Blocked,
    ReadyAgain,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaitFlags {
    pub class: WaitClass,
    pub state: WaitState,
}

impl WaitFlags {
    pub const READY: Self = Self {
        class: WaitClass::None,
        state: WaitState::Ready,
    };

    pub const fn new(class: WaitClass, state: WaitState) -> Self {
        Self { class, state }
    }

    /// Change the state if it is still `expected`
    pub fn try_change(&mut self, expected: WaitState, desired: WaitState) -> bool {
        if self.state == expected {
            self.state = desired;
            true
        } else {
            false
        }
    }
}

/// Object-specific data carried across a wait
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum WaitPayload {
    #[default]
    None,
    /// Events a receiver waits for
    Events {
        wanted: EventSet,
        condition: EventCondition,
    },
    /// Events handed to a woken receiver
    EventsReceived(EventSet),
    /// Message handed to a woken receiver
    Message(Message),
    /// Condition variable waiter; reacquires `mutex` when woken
    CondVar { mutex: MutexId },
    /// Former condition variable waiter queued on its mutex; `status` is
    /// delivered once the mutex is granted
    Reacquire { mutex: MutexId, status: WaitStatus },
}

/// Wait bookkeeping of a thread
#[derive(Debug, Clone)]
pub struct WaitInfo {
    pub(crate) queue: Option<QueueRef>,
    pub(crate) flags: WaitFlags,
    pub(crate) status: WaitStatus,
    pub(crate) timer: Option<WatchdogId>,
    pub(crate) payload: WaitPayload,
}

impl WaitInfo {
    fn new() -> Self {
        Self {
            queue: None,
            flags: WaitFlags::READY,
            status: Ok(()),
            timer: None,
            payload: WaitPayload::None,
        }
    }

    /// Thread queue the thread is blocked on
    pub fn queue(&self) -> Option<QueueRef> {
        self.queue
    }

    pub fn flags(&self) -> WaitFlags {
        self.flags
    }

    /// Status of the last completed wait
    pub fn status(&self) -> WaitStatus {
        self.status
    }

    /// Whether a timeout watchdog is armed
    pub fn has_timeout(&self) -> bool {
        self.timer.is_some()
    }
}

// ============================================================================
// Attributes
// ============================================================================

/// CPU budget accounting
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BudgetAlgorithm {
    /// Run until blocked or preempted
    #[default]
    None,
    /// Timeslice, refilled whenever the thread is dispatched
    ResetTimeslice,
    /// Timeslice, refilled only when it runs out
    ExhaustTimeslice,
}

/// Creation parameters of a thread
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThreadAttributes {
    pub name: &'static str,
    /// User priority, `1 .. maximum_priority` of the scheduler instance
    pub priority: Priority,
    /// Scheduler instance index
    pub scheduler: usize,
    /// Processors the thread may run on; defaults to the instance's
    pub affinity: Option<ProcessorMask>,
    pub preemptible: bool,
    pub budget: BudgetAlgorithm,
}

impl ThreadAttributes {
    pub const fn new(name: &'static str, priority: u64) -> Self {
        Self {
            name,
            priority: Priority(priority),
            scheduler: 0,
            affinity: None,
            preemptible: true,
            budget: BudgetAlgorithm::None,
        }
    }

    pub const fn with_scheduler(mut self, scheduler: usize) -> Self {
        self.scheduler = scheduler;
        self
    }

    pub const fn with_affinity(mut self, affinity: ProcessorMask) -> Self {
        self.affinity = Some(affinity);
        self
    }

    pub const fn with_preemptible(mut self, preemptible: bool) -> Self {
        self.preemptible = preemptible;
        self
    }

    pub const fn with_budget(mut self, budget: BudgetAlgorithm) -> Self {
        self.budget = budget;
        self
    }
}

// ============================================================================
// Thread Control Block
// ============================================================================

/// Thread control block
#[derive(Debug, Clone)]
pub struct ThreadControl {
    id: ThreadId,
    name: String<THREAD_NAME_MAX>,
    pub(crate) state: ThreadStates,
    pub(crate) priority: PriorityAggregation,
    /// Current priority as last routed to the scheduler
    pub(crate) current_priority: Priority,
    /// User priority given at creation, restored on restart
    pub(crate) initial_priority: Priority,
    /// Instance holding the scheduler node
    pub(crate) scheduler: usize,
    /// Instance the thread returns to when it stops being helped
    pub(crate) home_scheduler: usize,
    pub(crate) affinity: ProcessorMask,
    pub(crate) preemptible: bool,
    pub(crate) budget: BudgetAlgorithm,
    pub(crate) timeslice: u32,
    pub(crate) wait: WaitInfo,
    pub(crate) entry: Option<ThreadEntry>,
    pub(crate) pending_events: EventSet,
    /// Mutexes currently owned
    pub(crate) resource_count: u32,
    pub(crate) is_idle: bool,
    pub(crate) restarts: u32,
    pub(crate) cpu_time: Ticks,
}

impl ThreadControl {
    pub(crate) fn new(
        id: ThreadId,
        attributes: &ThreadAttributes,
        mapped: Priority,
        affinity: ProcessorMask,
        timeslice: u32,
    ) -> Self {
        let mut name = String::new();
        for c in attributes.name.chars() {
            if name.push(c).is_err() {
                break;
            }
        }
        Self {
            id,
            name,
            state: ThreadStates::DORMANT,
            priority: PriorityAggregation::new(mapped),
            current_priority: mapped,
            initial_priority: attributes.priority,
            scheduler: attributes.scheduler,
            home_scheduler: attributes.scheduler,
            affinity,
            preemptible: attributes.preemptible,
            budget: attributes.budget,
            timeslice,
            wait: WaitInfo::new(),
            entry: None,
            pending_events: EventSet::empty(),
            resource_count: 0,
            is_idle: false,
            restarts: 0,
            cpu_time: 0,
        }
    }

    /// Idle thread of `processor`: ready from the start, never blocks
    pub(crate) fn idle(
        id: ThreadId,
        scheduler: usize,
        processor: usize,
        maximum: Priority,
        mapped: Priority,
    ) -> Self {
        let attributes = ThreadAttributes {
            name: "IDLE",
            priority: maximum,
            scheduler,
            affinity: Some(ProcessorMask::single(processor)),
            preemptible: true,
            budget: BudgetAlgorithm::None,
        };
        let mut tcb = Self::new(id, &attributes, mapped, ProcessorMask::single(processor), 0);
        tcb.state = ThreadStates::empty();
        tcb.is_idle = true;
        tcb
    }

    pub fn id(&self) -> ThreadId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> ThreadStates {
        self.state
    }

    pub fn is_ready(&self) -> bool {
        self.state.is_empty()
    }

    /// Real priority in scheduler space
    pub fn real_priority(&self) -> Priority {
        self.priority.real()
    }

    /// Current priority in scheduler space
    pub fn current_priority(&self) -> Priority {
        self.current_priority
    }

    pub fn wait(&self) -> &WaitInfo {
        &self.wait
    }

    /// Final status of the last wait
    pub fn wait_status(&self) -> WaitStatus {
        self.wait.status
    }

    /// Scheduler instance currently holding the thread
    pub fn scheduler(&self) -> usize {
        self.scheduler
    }

    pub fn home_scheduler(&self) -> usize {
        self.home_scheduler
    }

    pub fn affinity(&self) -> ProcessorMask {
        self.affinity
    }

    pub fn is_preemptible(&self) -> bool {
        self.preemptible
    }

    pub fn budget(&self) -> BudgetAlgorithm {
        self.budget
    }

    /// Ticks left in the current timeslice
    pub fn timeslice(&self) -> u32 {
        self.timeslice
    }

    pub fn pending_events(&self) -> EventSet {
        self.pending_events
    }

    /// Number of mutexes owned
    pub fn resource_count(&self) -> u32 {
        self.resource_count
    }

    pub fn is_idle(&self) -> bool {
        self.is_idle
    }

    pub fn restarts(&self) -> u32 {
        self.restarts
    }

    /// Clock ticks charged to the thread
    pub fn cpu_time(&self) -> Ticks {
        self.cpu_time
    }
}

/// User priorities run from 1 to one below the idle priority
fn validate_priority(priority: Priority, maximum: Priority) -> Result<()> {
    if priority.0 == 0 || priority.0 >= maximum.0 {
        return Err(Status::InvalidPriority);
    }
    Ok(())
}

// ============================================================================
// State Transitions
// ============================================================================

impl Kernel {
    pub(crate) fn tcb(&self, thread: ThreadIndex) -> &ThreadControl {
        match self.threads.by_index(thread) {
            Some(tcb) => tcb,
            None => self.fatal(FatalSource::Thread, InternalError::NoThread(thread)),
        }
    }

    pub(crate) fn tcb_mut(&mut self, thread: ThreadIndex) -> &mut ThreadControl {
        match self.threads.by_index_mut(thread) {
            Some(tcb) => tcb,
            None => fatal(
                self.port.as_ref(),
                FatalSource::Thread,
                InternalError::NoThread(thread),
            ),
        }
    }

    /// Resolve a thread id; zombies are no longer addressable
    pub(crate) fn thread_index(&self, id: ThreadId) -> Result<ThreadIndex> {
        match self.threads.get(id) {
            Some(tcb) if !tcb.state.contains(ThreadStates::ZOMBIE) => Ok(id.index()),
            _ => Err(Status::InvalidId),
        }
    }

    /// Thread executing on the current processor, on whose behalf a
    /// directive runs
    pub(crate) fn calling_thread(&self) -> Result<ThreadIndex> {
        let thread = self
            .processors
            .get(self.port.current_processor())
            .executing()
            .ok_or(Status::NoExecutingThread)?;
        if self.tcb(thread).is_idle {
            return Err(Status::IllegalOnThread);
        }
        Ok(thread)
    }

    /// Add blocking reasons; a ready thread leaves its ready set
    pub(crate) fn set_state(&mut self, thread: ThreadIndex, states: ThreadStates) -> ThreadStates {
        let tcb = self.tcb_mut(thread);
        let previous = tcb.state;
        tcb.state |= states;
        if previous.is_empty() && !states.is_empty() {
            let scheduler = tcb.scheduler;
            log::trace!("thread {} blocks ({:?})", tcb.id, states);
            self.processors.cancel_help(thread);
            self.schedulers[scheduler].block(&mut self.processors, thread);
        }
        previous
    }

    /// Remove blocking reasons; the thread becomes ready when none remain
    pub(crate) fn clear_state(
        &mut self,
        thread: ThreadIndex,
        states: ThreadStates,
    ) -> ThreadStates {
        let tcb = self.tcb_mut(thread);
        let previous = tcb.state;
        tcb.state = previous.difference(states);
        if previous.is_empty() || !tcb.state.is_empty() {
            return previous;
        }

        log::trace!("thread {} ready", tcb.id);
        let (scheduler, home) = (tcb.scheduler, tcb.home_scheduler);
        if scheduler != home {
            self.migrate(thread, home);
        }
        self.schedulers[home].unblock(&mut self.processors, thread);
        self.request_help_if_needed(thread);
        previous
    }

    /// Move the scheduler node of a thread to another instance
    pub(crate) fn migrate(&mut self, thread: ThreadIndex, to: usize) {
        let tcb = self.tcb(thread);
        let from = tcb.scheduler;
        let priority = tcb.current_priority;
        let attributes = NodeAttributes {
            preemptible: tcb.preemptible,
            affinity: tcb.affinity,
            idle: false,
        };
        let ready = self.schedulers[from]
            .node(thread)
            .is_some_and(|node| node.state != NodeState::Blocked);

        log::debug!(
            "thread {} moves from {} to {}",
            tcb.id,
            self.schedulers[from].name(),
            self.schedulers[to].name()
        );
        if ready {
            self.schedulers[from].block(&mut self.processors, thread);
        }
        self.schedulers[from].node_destroy(thread);
        self.schedulers[to].node_initialize(thread, priority, attributes);
        self.tcb_mut(thread).scheduler = to;
        if ready {
            self.schedulers[to].unblock(&mut self.processors, thread);
        }
    }

    /// Leave a help request if the thread could run on processors outside
    /// its instance but did not get one of its own
    fn request_help_if_needed(&mut self, thread: ThreadIndex) {
        let tcb = self.tcb(thread);
        let scheduler = &self.schedulers[tcb.scheduler];
        if tcb.affinity.difference(scheduler.processors()).is_empty()
            || scheduler.is_scheduled(&self.processors, thread)
        {
            return;
        }
        let cpu = self.processors.current();
        self.processors.request_help(cpu, thread);
    }

    /// Propagate a change of the priority aggregation of `thread`
    ///
    /// The new current priority goes to the scheduler and, if the thread
    /// waits on a priority queue, its position there is re-derived. A
    /// waiter on an inheritance mutex then refreshes the owner's
    /// contribution and the walk continues with the owner.
    pub(crate) fn update_priority(&mut self, thread: ThreadIndex) {
        let mut current = thread;
        for _ in 0..=self.threads.maximum() {
            let tcb = self.tcb_mut(current);
            let priority = tcb.priority.current();
            if priority == tcb.current_priority {
                return;
            }
            tcb.current_priority = priority;
            let (scheduler, queue) = (tcb.scheduler, tcb.wait.queue);
            log::trace!("thread {} priority {}", tcb.id, priority.0);
            self.schedulers[scheduler].update_priority(&mut self.processors, current, priority);

            let Some(queue) = queue else {
                return;
            };
            self.tq_reposition(queue, current, priority);
            match queue {
                QueueRef::Mutex(mutex) => match self.mutex_refresh_inheritance(mutex) {
                    Some(owner) => current = owner,
                    None => return,
                },
                _ => return,
            }
        }
        log::warn!("priority propagation from {} did not settle", thread);
    }

    // ========================================================================
    // Lifecycle Directives
    // ========================================================================

    /// Create a dormant thread
    pub fn thread_create(&mut self, attributes: &ThreadAttributes) -> Result<ThreadId> {
        let instance = attributes.scheduler;
        let scheduler = self.schedulers.get(instance).ok_or(Status::InvalidId)?;
        validate_priority(attributes.priority, scheduler.maximum_priority())?;

        let owned = scheduler.processors();
        let affinity = attributes.affinity.unwrap_or(owned);
        if affinity.intersection(owned).is_empty() {
            return Err(Status::InvalidNumber);
        }
        if !attributes.preemptible && !scheduler.algorithm().is_uniprocessor() {
            return Err(Status::NotDefined);
        }
        if self.threads.len() - self.idle_threads >= self.config.maximum_threads {
            return Err(Status::TooMany);
        }

        let mapped = scheduler.map_priority(attributes.priority);
        let timeslice = self.config.ticks_per_timeslice;
        let id = self
            .threads
            .allocate_with(|id| ThreadControl::new(id, attributes, mapped, affinity, timeslice))?;
        self.schedulers[instance].node_initialize(
            id.index(),
            mapped,
            NodeAttributes {
                preemptible: attributes.preemptible,
                affinity,
                idle: false,
            },
        );
        log::debug!(
            "thread {} '{}' created at priority {}",
            id,
            attributes.name,
            attributes.priority.0
        );
        Ok(id)
    }

    /// Make a dormant thread ready
    pub fn thread_start(&mut self, id: ThreadId, entry: ThreadEntry) -> Result<()> {
        let thread = self.thread_index(id)?;
        if !self.tcb(thread).state.contains(ThreadStates::DORMANT) {
            return Err(Status::IncorrectState);
        }
        self.directive(|k| {
            k.tcb_mut(thread).entry = Some(entry);
            k.port.context_initialize(id, entry);
            k.clear_state(thread, ThreadStates::DORMANT);
        });
        log::debug!("thread {} started", id);
        Ok(())
    }

    /// Abandon whatever the thread is doing and run its entry point again
    /// with a new argument
    pub fn thread_restart(&mut self, id: ThreadId, argument: usize) -> Result<()> {
        let thread = self.thread_index(id)?;
        let tcb = self.tcb(thread);
        if tcb.is_idle {
            return Err(Status::IllegalOnThread);
        }
        if tcb.state.contains(ThreadStates::DORMANT) {
            return Err(Status::IncorrectState);
        }
        let Some(mut entry) = tcb.entry else {
            return Err(Status::IncorrectState);
        };
        entry.argument = argument;

        self.directive(|k| {
            k.thread_cancel_wait(thread);
            k.periods_release_owner(thread);
            let timeslice = k.config.ticks_per_timeslice;
            let home = k.tcb(thread).home_scheduler;
            let real = k.schedulers[home].map_priority(k.tcb(thread).initial_priority);
            let tcb = k.tcb_mut(thread);
            tcb.entry = Some(entry);
            tcb.restarts += 1;
            tcb.pending_events = EventSet::empty();
            tcb.timeslice = timeslice;
            tcb.priority.set_real(real);
            tcb.priority.remove(PrioritySource::Job);
            k.update_priority(thread);
            k.port.context_initialize(id, entry);
            k.clear_state(thread, ThreadStates::BLOCKED | ThreadStates::SUSPENDED);
        });
        log::debug!("thread {} restarted", id);
        Ok(())
    }

    /// Delete a thread; it becomes a zombie until no processor runs it
    pub fn thread_delete(&mut self, id: ThreadId) -> Result<()> {
        let thread = self.thread_index(id)?;
        let tcb = self.tcb(thread);
        if tcb.is_idle {
            return Err(Status::IllegalOnThread);
        }
        if tcb.resource_count > 0 {
            return Err(Status::ResourceInUse);
        }
        self.directive(|k| {
            k.thread_cancel_wait(thread);
            k.periods_release_owner(thread);
            k.processors.cancel_help(thread);
            k.set_state(thread, ThreadStates::ZOMBIE);
            k.zombies.push(thread);
        });
        log::debug!("thread {} deleted", id);
        Ok(())
    }

    /// Delete the calling thread
    pub fn thread_exit(&mut self) -> Result<()> {
        let thread = self.calling_thread()?;
        let id = self.tcb(thread).id;
        self.thread_delete(id)
    }

    pub fn thread_suspend(&mut self, id: ThreadId) -> Result<()> {
        let thread = self.thread_index(id)?;
        let tcb = self.tcb(thread);
        if tcb.is_idle {
            return Err(Status::IllegalOnThread);
        }
        if tcb.state.contains(ThreadStates::SUSPENDED) {
            return Err(Status::AlreadySuspended);
        }
        self.directive(|k| {
            k.set_state(thread, ThreadStates::SUSPENDED);
        });
        Ok(())
    }

    pub fn thread_resume(&mut self, id: ThreadId) -> Result<()> {
        let thread = self.thread_index(id)?;
        if !self.tcb(thread).state.contains(ThreadStates::SUSPENDED) {
            return Err(Status::IncorrectState);
        }
        self.directive(|k| {
            k.clear_state(thread, ThreadStates::SUSPENDED);
        });
        Ok(())
    }

    pub fn thread_is_suspended(&self, id: ThreadId) -> Result<bool> {
        let thread = self.thread_index(id)?;
        Ok(self.tcb(thread).state.contains(ThreadStates::SUSPENDED))
    }

    /// Set the real priority; `None` only queries it. Returns the previous
    /// real priority.
    pub fn thread_set_priority(
        &mut self,
        id: ThreadId,
        priority: Option<Priority>,
    ) -> Result<Priority> {
        let thread = self.thread_index(id)?;
        let tcb = self.tcb(thread);
        if tcb.is_idle {
            return Err(Status::IllegalOnThread);
        }
        let scheduler = &self.schedulers[tcb.home_scheduler];
        let old = scheduler.unmap_priority(tcb.priority.real());
        let Some(priority) = priority else {
            return Ok(old);
        };
        validate_priority(priority, scheduler.maximum_priority())?;
        let mapped = scheduler.map_priority(priority);

        self.directive(|k| {
            k.tcb_mut(thread).priority.set_real(mapped);
            k.update_priority(thread);
        });
        Ok(old)
    }

    /// Real and current priority as user priorities
    ///
    /// Under EDF a released job reports its deadline as current priority.
    pub fn thread_get_priority(&self, id: ThreadId) -> Result<(Priority, Priority)> {
        let thread = self.thread_index(id)?;
        let tcb = self.tcb(thread);
        let scheduler = &self.schedulers[tcb.scheduler];
        Ok((
            scheduler.unmap_priority(tcb.priority.real()),
            scheduler.unmap_priority(tcb.current_priority),
        ))
    }

    /// Move the calling thread behind its peers
    pub fn thread_yield(&mut self) -> Result<()> {
        let thread = self.calling_thread()?;
        self.directive(|k| {
            let timeslice = k.config.ticks_per_timeslice;
            let tcb = k.tcb_mut(thread);
            tcb.timeslice = timeslice;
            let scheduler = tcb.scheduler;
            k.schedulers[scheduler].yield_thread(&mut k.processors, thread);
        });
        Ok(())
    }

    /// Block the calling thread for `ticks` clock ticks; zero yields
    pub fn thread_wake_after(&mut self, ticks: Ticks) -> Result<WaitOutcome> {
        let thread = self.calling_thread()?;
        if ticks == 0 {
            self.thread_yield()?;
            return Ok(WaitOutcome::Satisfied);
        }
        let id = self.tcb(thread).id;
        self.directive(|k| {
            let timer = k
                .watchdogs
                .insert_relative(ticks, WatchdogRoutine::ThreadTimeout(id));
            let tcb = k.tcb_mut(thread);
            tcb.wait.timer = Some(timer);
            tcb.wait.status = Ok(());
            tcb.wait.flags = WaitFlags::new(WaitClass::Time, WaitState::Blocked);
            k.set_state(thread, ThreadStates::WAITING_FOR_TIME);
        });
        Ok(WaitOutcome::Blocked)
    }

    pub fn thread_set_affinity(&mut self, id: ThreadId, affinity: ProcessorMask) -> Result<()> {
        let thread = self.thread_index(id)?;
        let tcb = self.tcb(thread);
        if tcb.is_idle {
            return Err(Status::IllegalOnThread);
        }
        let online = ProcessorMask::first(self.processors.count());
        let scheduler = tcb.scheduler;
        if affinity.is_empty()
            || !affinity.is_subset(&online)
            || affinity
                .intersection(self.schedulers[scheduler].processors())
                .is_empty()
        {
            return Err(Status::InvalidNumber);
        }
        self.directive(|k| {
            k.schedulers[scheduler].set_affinity(&mut k.processors, thread, affinity)?;
            k.tcb_mut(thread).affinity = affinity;
            Ok(())
        })
    }

    pub fn thread_get_affinity(&self, id: ThreadId) -> Result<ProcessorMask> {
        let thread = self.thread_index(id)?;
        Ok(self.tcb(thread).affinity)
    }

    /// Move a thread to another scheduler instance with a new priority
    ///
    /// Fails with `ResourceInUse` while the thread owns mutexes or waits on
    /// a thread queue. If the affinity does not cover any processor of the
    /// new instance it is reset to the instance's processors.
    pub fn thread_set_scheduler(
        &mut self,
        id: ThreadId,
        instance: usize,
        priority: Priority) -> Result<()> {
        let thread = self.thread_index(id)?;
        let tcb = self.tcb(thread);
        if tcb.is_idle {
            return Err(Status::IllegalOnThread);
        }
        let target = self.schedulers.get(instance).ok_or(Status::InvalidId)?;
        if tcb.resource_count > 0 || tcb.wait.queue.is_some() {
            return Err(Status::ResourceInUse);
        }
        validate_priority(priority, target.maximum_priority())?;
        if !tcb.preemptible && !target.algorithm().is_uniprocessor() {
            return Err(Status::NotDefined);
        }
        let owned = target.processors();
        let affinity = if tcb.affinity.intersection(owned).is_empty() {
            owned
        } else {
            tcb.affinity
        };
        let mapped = target.map_priority(priority);

        self.directive(|k| {
            let tcb = k.tcb_mut(thread);
            tcb.priority = PriorityAggregation::new(mapped);
            tcb.current_priority = mapped;
            tcb.home_scheduler = instance;
            tcb.affinity = affinity;
            k.processors.cancel_help(thread);
            k.migrate(thread, instance);
            if k.tcb(thread).state.is_empty() {
                k.request_help_if_needed(thread);
            }
        });
        Ok(())
    }

    /// Change preemptibility; returns the previous setting
    pub fn thread_set_preemptible(&mut self, id: ThreadId, preemptible: bool) -> Result<bool> {
        let thread = self.thread_index(id)?;
        let tcb = self.tcb(thread);
        if tcb.is_idle {
            return Err(Status::IllegalOnThread);
        }
        let (scheduler, old) = (tcb.scheduler, tcb.preemptible);
        self.directive(|k| {
            k.schedulers[scheduler].set_preemptible(&mut k.processors, thread, preemptible)?;
            k.tcb_mut(thread).preemptible = preemptible;
            Ok(old)
        })
    }

    pub fn thread_set_budget(&mut self, id: ThreadId, budget: BudgetAlgorithm) -> Result<()> {
        let thread = self.thread_index(id)?;
        let timeslice = self.config.ticks_per_timeslice;
        let tcb = self.tcb_mut(thread);
        tcb.budget = budget;
        tcb.timeslice = timeslice;
        Ok(())
    }

    /// Status of the thread's last completed wait
    pub fn thread_wait_status(&self, id: ThreadId) -> Result<WaitStatus> {
        let thread = self.thread_index(id)?;
        Ok(self.tcb(thread).wait.status)
    }

    /// Take the message delivered to a receiver that blocked
    pub fn thread_take_message(&mut self, id: ThreadId) -> Result<Option<Message>> {
        let thread = self.thread_index(id)?;
        let payload = &mut self.tcb_mut(thread).wait.payload;
        match core::mem::take(payload) {
            WaitPayload::Message(message) => Ok(Some(message)),
            other => {
                *payload = other;
                Ok(None)
            }
        }
    }

    /// Take the events delivered to a receiver that blocked
    pub fn thread_take_events(&mut self, id: ThreadId) -> Result<EventSet> {
        let thread = self.thread_index(id)?;
        let payload = &mut self.tcb_mut(thread).wait.payload;
        match core::mem::take(payload) {
            WaitPayload::EventsReceived(events) => Ok(events),
            other => {
                *payload = other;
                Ok(EventSet::empty())
            }
        }
    }

    /// Drop every wait of a thread without waking it
    pub(crate) fn thread_cancel_wait(&mut self, thread: ThreadIndex) {
        if let Some(timer) = self.tcb_mut(thread).wait.timer.take() {
            self.watchdogs.cancel(timer);
        }
        if let Some(queue) = self.tq_remove(thread) {
            self.queue_extracted(queue);
        }
        let tcb = self.tcb_mut(thread);
        tcb.wait.flags = WaitFlags::READY;
        tcb.wait.payload = WaitPayload::None;
    }

    /// Free the zombies no processor executes anymore
    pub(crate) fn reap_zombies(&mut self) {
        let mut i = 0;
        while i < self.zombies.len() {
            let thread = self.zombies[i];
            if self.processors.running(thread).is_some() {
                i += 1;
                continue;
            }
            self.zombies.swap_remove(i);
            let scheduler = self.tcb(thread).scheduler;
            self.schedulers[scheduler].node_destroy(thread);
            if let Some(id) = self.threads.id_at(thread) {
                self.threads.free(id);
                log::trace!("thread {} reaped", id);
            }
        }
    }
}
