//! The kernel context object
//!
//! [`Kernel`] owns every piece of mutable scheduling state: object tables,
//! scheduler instances, processors, the watchdog header. Directives are
//! methods on it, implemented next to the subsystem they belong to
//! (`kern::thread`, `sync::*`, `timer`, `ratemon`). There is no global
//! instance; an embedding system that runs the kernel on several
//! processors wraps it in a [`SharedKernel`].

use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec::Vec;
use thiserror::Error;

use crate::config::Configuration;
use crate::error::{InternalError, Result, Status};
use crate::kern::fatal::{self, FatalSource};
use crate::kern::isr::{IsrLock, IsrLockGuard};
use crate::kern::object::ObjectTable;
use crate::kern::percpu::{Processor, ProcessorState, Processors};
use crate::kern::port::{CpuPort, ThreadEntry};
use crate::kern::thread::{BudgetAlgorithm, ThreadControl, ThreadStates};
use crate::kern::threadq::WaitNodes;
use crate::kern::watchdog::{WatchdogHeader, WatchdogRoutine};
use crate::ratemon::Period;
use crate::sched::{self, NodeAttributes, NodeState, Scheduler, SchedulerNode};
use crate::sync::barrier::Barrier;
use crate::sync::condvar::ConditionVariable;
use crate::sync::msgq::MessageQueue;
use crate::sync::mutex::Mutex;
use crate::sync::semaphore::Semaphore;
use crate::timer::Timer;
use crate::types::{
    BarrierId, CondVarId, MessageQueueId, MutexId, PeriodId, ProcessorMask, SemaphoreId, ThreadId,
    ThreadIndex, Ticks, TimerId, TypedId,
};

/// A broken kernel invariant found by [`Kernel::check_invariants`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("{reason} (thread {thread:?}, processor {processor:?})")]
pub struct InvariantViolation {
    pub reason: &'static str,
    pub thread: Option<ThreadId>,
    pub processor: Option<usize>,
}

impl InvariantViolation {
    fn thread(reason: &'static str, thread: ThreadId) -> Self {
        Self {
            reason,
            thread: Some(thread),
            processor: None,
        }
    }

    fn processor(reason: &'static str, processor: usize) -> Self {
        Self {
            reason,
            thread: None,
            processor: Some(processor),
        }
    }
}

/// Scheduling core state
pub struct Kernel {
    pub(crate) config: Configuration,
    pub(crate) port: Arc<dyn CpuPort>,
    pub(crate) threads: ObjectTable<ThreadId, ThreadControl>,
    pub(crate) idle_threads: usize,
    pub(crate) zombies: Vec<ThreadIndex>,
    pub(crate) wait_nodes: WaitNodes,
    pub(crate) schedulers: Vec<Box<dyn Scheduler>>,
    pub(crate) processors: Processors,
    pub(crate) watchdogs: WatchdogHeader,
    pub(crate) mutexes: ObjectTable<MutexId, Mutex>,
    pub(crate) semaphores: ObjectTable<SemaphoreId, Semaphore>,
    pub(crate) condvars: ObjectTable<CondVarId, ConditionVariable>,
    pub(crate) message_queues: ObjectTable<MessageQueueId, MessageQueue>,
    pub(crate) barriers: ObjectTable<BarrierId, Barrier>,
    pub(crate) timers: ObjectTable<TimerId, Timer>,
    pub(crate) periods: ObjectTable<PeriodId, Period>,
}

impl Kernel {
    /// Validate the configuration, build the scheduler instances and bring
    /// every configured processor online with its idle thread
    pub fn new(config: Configuration, port: Arc<dyn CpuPort>) -> Result<Self> {
        config.validate()?;
        if port.processor_count() < config.processors {
            return Err(Status::InvalidNumber);
        }

        let capacity = config.maximum_threads + config.processors;
        let schedulers = config
            .schedulers
            .iter()
            .map(|scheduler| sched::create(scheduler, capacity, &port))
            .collect::<Result<Vec<_>>>()?;

        let mut kernel = Self {
            threads: ObjectTable::new(capacity),
            idle_threads: 0,
            zombies: Vec::with_capacity(capacity),
            wait_nodes: WaitNodes::new(capacity),
            schedulers,
            processors: Processors::new(config.processors, capacity),
            watchdogs: WatchdogHeader::new(
                capacity + config.maximum_timers + config.maximum_periods,
            ),
            mutexes: ObjectTable::new(config.maximum_mutexes),
            semaphores: ObjectTable::new(config.maximum_semaphores),
            condvars: ObjectTable::new(config.maximum_condition_variables),
            message_queues: ObjectTable::new(config.maximum_message_queues),
            barriers: ObjectTable::new(config.maximum_barriers),
            timers: ObjectTable::new(config.maximum_timers),
            periods: ObjectTable::new(config.maximum_periods),
            config,
            port,
        };

        for instance in 0..kernel.schedulers.len() {
            let owned = kernel.schedulers[instance].processors();
            for cpu in owned.iter() {
                if cpu != 0 && !kernel.port.start_processor(cpu) {
                    kernel.fatal(
                        FatalSource::Initialization,
                        InternalError::StartProcessorFailed(cpu),
                    );
                }
                let idle = kernel.create_idle(instance, cpu)?;
                kernel.processors.start(cpu, instance, idle);
                kernel.schedulers[instance].start_idle(&mut kernel.processors, idle, cpu);
            }
        }

        log::info!(
            "supercore: {} processor(s), {} scheduler instance(s), {} threads max",
            kernel.config.processors,
            kernel.schedulers.len(),
            kernel.config.maximum_threads
        );
        Ok(kernel)
    }

    fn create_idle(&mut self, instance: usize, cpu: usize) -> Result<ThreadIndex> {
        let maximum = self.schedulers[instance].maximum_priority();
        let mapped = self.schedulers[instance].map_priority(maximum);
        let id = self
            .threads
            .allocate_with(|id| ThreadControl::idle(id, instance, cpu, maximum, mapped))?;
        self.idle_threads += 1;
        self.schedulers[instance].node_initialize(
            id.index(),
            mapped,
            NodeAttributes {
                preemptible: true,
                affinity: ProcessorMask::single(cpu),
                idle: true,
            },
        );
        self.port.context_initialize(id, ThreadEntry::default());
        Ok(id.index())
    }

    /// Report a broken invariant and halt
    pub fn fatal(&self, source: FatalSource, error: InternalError) -> ! {
        fatal::fatal(&*self.port, source, error)
    }

    // ========================================================================
    // Clock
    // ========================================================================

    /// Clock interrupt: advance the time base, fire expired watchdogs and
    /// charge the executing threads' budgets
    pub fn clock_tick(&mut self) {
        self.isr_enter();
        self.watchdogs.tick();
        while let Some(routine) = self.watchdogs.pop_expired() {
            self.run_watchdog(routine);
        }
        self.budget_tick();
        self.isr_exit();
    }

    /// Run `ticks` clock ticks
    pub fn advance(&mut self, ticks: Ticks) {
        for _ in 0..ticks {
            self.clock_tick();
        }
    }

    fn run_watchdog(&mut self, routine: WatchdogRoutine) {
        match routine {
            WatchdogRoutine::ThreadTimeout(thread) => self.thread_timeout(thread),
            WatchdogRoutine::Timer(timer) => self.timer_fire(timer),
            WatchdogRoutine::PeriodEnd(period) => self.period_end(period),
        }
    }

    fn budget_tick(&mut self) {
        let timeslice = self.config.ticks_per_timeslice;
        for cpu in 0..self.processors.count() {
            let Some(thread) = self.processors.get(cpu).executing() else {
                continue;
            };
            let tcb = self.tcb_mut(thread);
            if tcb.is_idle {
                self.processors.get_mut(cpu).stats.idle_ticks += 1;
                continue;
            }
            tcb.cpu_time += 1;
            if tcb.budget == BudgetAlgorithm::None || !tcb.preemptible || !tcb.state.is_empty() {
                continue;
            }
            tcb.timeslice = tcb.timeslice.saturating_sub(1);
            if tcb.timeslice > 0 {
                continue;
            }
            tcb.timeslice = timeslice;
            let scheduler = tcb.scheduler;
            log::trace!("thread {} timeslice expired", tcb.id());
            self.schedulers[scheduler].yield_thread(&mut self.processors, thread);
        }
    }

    // ========================================================================
    // Accessors
    // ========================================================================

    pub fn config(&self) -> &Configuration {
        &self.config
    }

    /// Ticks since initialization
    pub fn ticks(&self) -> Ticks {
        self.watchdogs.now()
    }

    /// Number of armed watchdogs
    pub fn pending_watchdogs(&self) -> usize {
        self.watchdogs.pending()
    }

    pub fn port(&self) -> &Arc<dyn CpuPort> {
        &self.port
    }

    pub fn processor_count(&self) -> usize {
        self.processors.count()
    }

    pub fn processor(&self, cpu: usize) -> &Processor {
        self.processors.get(cpu)
    }

    fn id_of(&self, thread: Option<ThreadIndex>) -> Option<ThreadId> {
        thread.and_then(|t| self.threads.id_at(t))
    }

    /// Thread executing on the current processor
    pub fn executing(&self) -> Option<ThreadId> {
        self.executing_on(self.port.current_processor())
    }

    pub fn executing_on(&self, cpu: usize) -> Option<ThreadId> {
        self.id_of(self.processors.get(cpu).executing())
    }

    pub fn heir_on(&self, cpu: usize) -> Option<ThreadId> {
        self.id_of(self.processors.get(cpu).heir())
    }

    pub fn idle_thread(&self, cpu: usize) -> Option<ThreadId> {
        self.id_of(self.processors.get(cpu).idle())
    }

    /// TCB of a live thread (zombies included)
    pub fn thread(&self, id: ThreadId) -> Result<&ThreadControl> {
        self.threads.lookup(id)
    }

    /// Number of threads, idle threads and zombies excluded
    pub fn thread_count(&self) -> usize {
        self.threads.len() - self.idle_threads - self.zombies.len()
    }

    pub fn scheduler_count(&self) -> usize {
        self.schedulers.len()
    }

    pub fn scheduler_name(&self, instance: usize) -> Option<&'static str> {
        self.schedulers.get(instance).map(|s| s.name())
    }

    /// Ready threads of an instance, scheduled ones included
    pub fn ready_count(&self, instance: usize) -> Option<usize> {
        self.schedulers.get(instance).map(|s| s.ready_count())
    }

    /// Scheduler node of a thread in the instance currently holding it
    pub fn scheduler_node(&self, id: ThreadId) -> Result<SchedulerNode> {
        let tcb = self.threads.lookup(id)?;
        self.schedulers[tcb.scheduler]
            .node(id.index())
            .copied()
            .ok_or(Status::InvalidId)
    }

    // ========================================================================
    // Invariants
    // ========================================================================

    /// Verify that every thread is accounted for exactly once and that no
    /// thread is heir or executing on two processors
    pub fn check_invariants(&self) -> core::result::Result<(), InvariantViolation> {
        for (id, tcb) in self.threads.iter() {
            let thread = id.index();
            let in_ready_set = |instance: usize| {
                self.schedulers[instance]
                    .node(thread)
                    .is_some_and(|node| node.state != NodeState::Blocked)
            };
            for instance in 0..self.schedulers.len() {
                if instance != tcb.scheduler && self.schedulers[instance].node(thread).is_some() {
                    return Err(InvariantViolation::thread("node in two scheduler instances", id));
                }
            }
            if self.schedulers[tcb.scheduler].node(thread).is_none() {
                return Err(InvariantViolation::thread("thread without scheduler node", id));
            }

            let on_queue = match tcb.wait.queue {
                Some(queue) => match self.thread_queue(queue) {
                    Some(q) if q.contains(&self.wait_nodes, thread) => true,
                    _ => return Err(InvariantViolation::thread("stale wait queue link", id)),
                },
                None => false,
            };

            if tcb.state.is_empty() {
                if !in_ready_set(tcb.scheduler) {
                    return Err(InvariantViolation::thread("ready thread not in a ready set", id));
                }
                if on_queue {
                    return Err(InvariantViolation::thread("ready thread on a wait queue", id));
                }
            } else {
                if in_ready_set(tcb.scheduler) {
                    return Err(InvariantViolation::thread("blocked thread in a ready set", id));
                }
                if tcb.state.intersects(ThreadStates::WAITING_ON_QUEUE) != on_queue {
                    return Err(InvariantViolation::thread(
                        "wait state and wait queue disagree",
                        id,
                    ));
                }
            }
        }

        let mut heirs = Vec::with_capacity(self.processors.count());
        let mut executing = Vec::with_capacity(self.processors.count());
        for cpu in self.processors.iter() {
            if cpu.state() != ProcessorState::Online {
                continue;
            }
            let Some(heir) = cpu.heir() else {
                return Err(InvariantViolation::processor(
                    "online processor without heir",
                    cpu.index(),
                ));
            };
            if !self.tcb(heir).is_ready() {
                return Err(InvariantViolation::processor("heir is not ready", cpu.index()));
            }
            if heirs.contains(&heir) {
                return Err(InvariantViolation::processor("thread is heir twice", cpu.index()));
            }
            heirs.push(heir);
            if let Some(thread) = cpu.executing() {
                if executing.contains(&thread) {
                    return Err(InvariantViolation::processor("thread executes twice", cpu.index()));
                }
                executing.push(thread);
            }
        }
        Ok(())
    }
}

// ============================================================================
// Shared Kernel
// ============================================================================

/// A kernel shared between processors behind an ISR lock
pub struct SharedKernel {
    port: Arc<dyn CpuPort>,
    kernel: IsrLock<Kernel>,
}

impl SharedKernel {
    pub fn new(kernel: Kernel) -> Self {
        Self {
            port: kernel.port.clone(),
            kernel: IsrLock::new(kernel),
        }
    }

    /// Disable local interrupts and acquire the kernel
    pub fn lock(&self) -> IsrLockGuard<'_, Kernel> {
        self.kernel.lock(self.port.clone())
    }

    /// Run `f` with the kernel acquired
    pub fn with<R>(&self, f: impl FnOnce(&mut Kernel) -> R) -> R {
        let mut kernel = self.lock();
        f(&mut *kernel)
    }

    pub fn into_inner(self) -> Kernel {
        self.kernel.into_inner()
    }
}
