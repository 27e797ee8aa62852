//! Thread queues
//!
//! Every synchronization object parks its blocked threads on one
//! [`ThreadQueue`]. The discipline is fixed at object creation:
//!
//! - FIFO: a [`Chain`] in arrival order.
//! - Priority: a red-black tree keyed by `(current priority, arrival)`,
//!   so equal priorities stay FIFO. A waiter whose priority changes is
//!   re-inserted under its new priority with its original arrival number.
//!
//! The link storage for all queues lives in one [`WaitNodes`] table indexed
//! by thread; a thread waits on at most one queue at a time and its TCB
//! records which one ([`QueueRef`]).
//!
//! The blocking protocol on the kernel side:
//!
//! 1. [`Kernel::tq_enqueue`] inserts the thread, arms the timeout watchdog
//!    and sets the waiting state (which blocks it in its scheduler).
//! 2. The thread is released by exactly one of: a satisfying dequeue
//!    ([`Kernel::tq_dequeue`] + [`Kernel::tq_unblock`]), a flush, an
//!    explicit extract, or its timeout ([`Kernel::thread_timeout`]).
//!    The first to run removes the thread from the queue and cancels the
//!    watchdog; the others find it gone and do nothing.

use alloc::vec;
use alloc::vec::Vec;

use crate::error::{InternalError, Status};
use crate::kern::chain::{Chain, ChainNode};
use crate::kern::fatal::FatalSource;
use crate::kern::kernel::Kernel;
use crate::kern::priority::Priority;
use crate::kern::rbtree::{RbHandle, RbTree};
use crate::kern::thread::{ThreadStates, WaitClass, WaitFlags, WaitPayload, WaitState, WaitStatus};
use crate::kern::watchdog::WatchdogRoutine;
use crate::types::{
    BarrierId, CondVarId, MessageQueueId, MutexId, SemaphoreId, ThreadId, ThreadIndex, Timeout,
    TypedId,
};

// ============================================================================
// Queue Storage
// ============================================================================

/// Order in which a queue releases its waiters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum QueueDiscipline {
    #[default]
    Fifo,
    Priority,
}

/// Per-thread link storage shared by all thread queues
#[derive(Debug)]
pub struct WaitNodes {
    links: Vec<ChainNode>,
    handles: Vec<Option<RbHandle>>,
    arrival: Vec<u64>,
    next: u64,
}

impl WaitNodes {
    pub fn new(threads: usize) -> Self {
        Self {
            links: vec![ChainNode::new(); threads],
            handles: vec![None; threads],
            arrival: vec![0; threads],
            next: 0,
        }
    }
}

#[derive(Debug)]
enum Heads {
    Fifo(Chain),
    Priority(RbTree<(Priority, u64), ThreadIndex>),
}

/// Blocked threads of one synchronization object
#[derive(Debug)]
pub struct ThreadQueue {
    heads: Heads,
}

impl ThreadQueue {
    pub fn new(discipline: QueueDiscipline) -> Self {
        let heads = match discipline {
            QueueDiscipline::Fifo => Heads::Fifo(Chain::new()),
            QueueDiscipline::Priority => Heads::Priority(RbTree::new()),
        };
        Self { heads }
    }

    pub fn discipline(&self) -> QueueDiscipline {
        match self.heads {
            Heads::Fifo(_) => QueueDiscipline::Fifo,
            Heads::Priority(_) => QueueDiscipline::Priority,
        }
    }

    pub fn len(&self) -> usize {
        match &self.heads {
            Heads::Fifo(chain) => chain.len(),
            Heads::Priority(tree) => tree.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub(crate) fn enqueue(
        &mut self,
        nodes: &mut WaitNodes,
        thread: ThreadIndex,
        priority: Priority,
    ) {
        match &mut self.heads {
            Heads::Fifo(chain) => chain.append(&mut nodes.links, thread),
            Heads::Priority(tree) => {
                nodes.next += 1;
                nodes.arrival[thread] = nodes.next;
                nodes.handles[thread] = Some(tree.insert((priority, nodes.next), thread));
            }
        }
    }

    /// Remove `thread`; returns false if it is not queued
    pub(crate) fn extract(&mut self, nodes: &mut WaitNodes, thread: ThreadIndex) -> bool {
        match &mut self.heads {
            Heads::Fifo(chain) => {
                if !nodes.links[thread].is_on_chain() {
                    return false;
                }
                chain.extract(&mut nodes.links, thread);
                true
            }
            Heads::Priority(tree) => match nodes.handles[thread].take() {
                Some(handle) => tree.remove(handle).is_some(),
                None => false,
            },
        }
    }

    /// Thread the queue releases next
    pub fn first(&self) -> Option<ThreadIndex> {
        match &self.heads {
            Heads::Fifo(chain) => chain.first(),
            Heads::Priority(tree) => tree.get(tree.min()?).map(|(_, thread)| *thread),
        }
    }

    pub(crate) fn dequeue(&mut self, nodes: &mut WaitNodes) -> Option<ThreadIndex> {
        let thread = self.first()?;
        self.extract(nodes, thread);
        Some(thread)
    }

    /// Re-derive the position of a waiter after a priority change
    pub(crate) fn reposition(
        &mut self,
        nodes: &mut WaitNodes,
        thread: ThreadIndex,
        priority: Priority,
    ) {
        if let Heads::Priority(tree) = &mut self.heads {
            if let Some(handle) = nodes.handles[thread].take() {
                tree.remove(handle);
                let arrival = nodes.arrival[thread];
                nodes.handles[thread] = Some(tree.insert((priority, arrival), thread));
            }
        }
    }

    pub fn contains(&self, nodes: &WaitNodes, thread: ThreadIndex) -> bool {
        match &self.heads {
            Heads::Fifo(chain) => chain.iter(&nodes.links).any(|t| t == thread),
            Heads::Priority(tree) => nodes.handles[thread].is_some_and(|h| tree.contains(h)),
        }
    }

    /// Waiters in release order
    pub fn threads(&self, nodes: &WaitNodes) -> Vec<ThreadIndex> {
        match &self.heads {
            Heads::Fifo(chain) => chain.iter(&nodes.links).collect(),
            Heads::Priority(tree) => tree.iter().map(|(_, _, thread)| *thread).collect(),
        }
    }
}

/// The thread queue a blocked thread waits on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueueRef {
    Mutex(MutexId),
    Semaphore(SemaphoreId),
    ConditionVariable(CondVarId),
    MessageQueue(MessageQueueId),
    Barrier(BarrierId),
}

impl QueueRef {
    /// Waiting state of threads on this queue
    pub fn blocking_state(self) -> ThreadStates {
        match self {
            QueueRef::Mutex(_) => ThreadStates::WAITING_FOR_MUTEX,
            QueueRef::Semaphore(_) => ThreadStates::WAITING_FOR_SEMAPHORE,
            QueueRef::ConditionVariable(_) => ThreadStates::WAITING_FOR_CONDITION_VARIABLE,
            QueueRef::MessageQueue(_) => ThreadStates::WAITING_FOR_MESSAGE,
            QueueRef::Barrier(_) => ThreadStates::WAITING_FOR_BARRIER,
        }
    }
}

// ============================================================================
// Kernel Operations
// ============================================================================

impl Kernel {
    pub(crate) fn thread_queue(&self, queue: QueueRef) -> Option<&ThreadQueue> {
        match queue {
            QueueRef::Mutex(id) => self.mutexes.get(id).map(|o| &o.queue),
            QueueRef::Semaphore(id) => self.semaphores.get(id).map(|o| &o.queue),
            QueueRef::ConditionVariable(id) => self.condvars.get(id).map(|o| &o.queue),
            QueueRef::MessageQueue(id) => self.message_queues.get(id).map(|o| &o.queue),
            QueueRef::Barrier(id) => self.barriers.get(id).map(|o| &o.queue),
        }
    }

    fn with_queue<R>(
        &mut self,
        queue: QueueRef,
        f: impl FnOnce(&mut ThreadQueue, &mut WaitNodes) -> R,
    ) -> Option<R> {
        let nodes = &mut self.wait_nodes;
        let target = match queue {
            QueueRef::Mutex(id) => &mut self.mutexes.get_mut(id)?.queue,
            QueueRef::Semaphore(id) => &mut self.semaphores.get_mut(id)?.queue,
            QueueRef::ConditionVariable(id) => &mut self.condvars.get_mut(id)?.queue,
            QueueRef::MessageQueue(id) => &mut self.message_queues.get_mut(id)?.queue,
            QueueRef::Barrier(id) => &mut self.barriers.get_mut(id)?.queue,
        };
        Some(f(target, nodes))
    }

    /// Waiters of a queue in release order
    pub fn waiters(&self, queue: QueueRef) -> crate::error::Result<Vec<ThreadId>> {
        let target = self.thread_queue(queue).ok_or(Status::InvalidId)?;
        Ok(target
            .threads(&self.wait_nodes)
            .into_iter()
            .filter_map(|thread| self.threads.id_at(thread))
            .collect())
    }

    /// Block `thread` with a wait class and state, arming a timeout
    ///
    /// The thread may have been released between announcing the wait and
    /// committing it; the commit then finds `ReadyAgain` and undoes the
    /// block.
    pub(crate) fn thread_block(
        &mut self,
        thread: ThreadIndex,
        class: WaitClass,
        state: ThreadStates,
        timeout: Timeout,
    ) {
        let tcb = self.tcb_mut(thread);
        let id = tcb.id();
        tcb.wait.status = Ok(());
        tcb.wait.flags = WaitFlags::new(class, WaitState::IntendToBlock);
        if let Some(interval) = timeout.interval() {
            let timer = self
                .watchdogs
                .insert_relative(interval, WatchdogRoutine::ThreadTimeout(id));
            self.tcb_mut(thread).wait.timer = Some(timer);
        }
        self.set_state(thread, state);
        if !self
            .tcb_mut(thread)
            .wait
            .flags
            .try_change(WaitState::IntendToBlock, WaitState::Blocked)
        {
            self.tq_unblock(thread);
        }
    }

    /// Park `thread` on `queue` in the queue's order
    pub(crate) fn tq_enqueue(&mut self, thread: ThreadIndex, queue: QueueRef, timeout: Timeout) {
        let priority = self.tcb(thread).current_priority;
        let inserted = self.with_queue(queue, |q, nodes| q.enqueue(nodes, thread, priority));
        if inserted.is_none() {
            self.fatal(
                FatalSource::ThreadQueue,
                InternalError::ThreadQueueCorrupted,
            );
        }
        self.tcb_mut(thread).wait.queue = Some(queue);
        log::trace!("thread {} waits on {:?}", self.tcb(thread).id(), queue);
        self.thread_block(thread, WaitClass::Object, queue.blocking_state(), timeout);
    }

    /// Take a thread off the queue its TCB names, without waking it
    pub(crate) fn tq_remove(&mut self, thread: ThreadIndex) -> Option<QueueRef> {
        let queue = self.tcb(thread).wait.queue?;
        let removed = self
            .with_queue(queue, |q, nodes| q.extract(nodes, thread))
            .unwrap_or(false);
        if !removed {
            self.fatal(
                FatalSource::ThreadQueue,
                InternalError::ThreadQueueCorrupted,
            );
        }
        let tcb = self.tcb_mut(thread);
        tcb.wait.queue = None;
        tcb.wait.flags.state = WaitState::ReadyAgain;
        Some(queue)
    }

    /// Remove the first waiter of a queue, without waking it
    pub(crate) fn tq_dequeue(&mut self, queue: QueueRef) -> Option<ThreadIndex> {
        let thread = self
            .with_queue(queue, |q, nodes| q.dequeue(nodes))
            .flatten()?;
        let tcb = self.tcb_mut(thread);
        tcb.wait.queue = None;
        tcb.wait.flags.state = WaitState::ReadyAgain;
        Some(thread)
    }

    pub(crate) fn tq_reposition(
        &mut self,
        queue: QueueRef,
        thread: ThreadIndex,
        priority: Priority,
    ) {
        self.with_queue(queue, |q, nodes| q.reposition(nodes, thread, priority));
    }

    /// Park a thread that was just taken off one queue on another, without
    /// letting it become ready in between; the new wait has no timeout
    pub(crate) fn tq_requeue(&mut self, thread: ThreadIndex, queue: QueueRef) {
        if let Some(timer) = self.tcb_mut(thread).wait.timer.take() {
            self.watchdogs.cancel(timer);
        }
        let priority = self.tcb(thread).current_priority;
        let inserted = self.with_queue(queue, |q, nodes| q.enqueue(nodes, thread, priority));
        if inserted.is_none() {
            self.fatal(
                FatalSource::ThreadQueue,
                InternalError::ThreadQueueCorrupted,
            );
        }
        let tcb = self.tcb_mut(thread);
        let previous = tcb.state & ThreadStates::WAITING_ON_QUEUE;
        tcb.wait.queue = Some(queue);
        tcb.wait.flags = WaitFlags::new(WaitClass::Object, WaitState::Blocked);
        log::trace!("thread {} moves to {:?}", tcb.id(), queue);
        self.set_state(thread, queue.blocking_state());
        self.clear_state(thread, previous.difference(queue.blocking_state()));
    }

    /// End the wait of a thread that is off its queue: cancel the timeout
    /// and clear every waiting state
    pub(crate) fn tq_unblock(&mut self, thread: ThreadIndex) {
        if let Some(timer) = self.tcb_mut(thread).wait.timer.take() {
            self.watchdogs.cancel(timer);
        }
        self.tcb_mut(thread).wait.flags = WaitFlags::READY;
        self.clear_state(thread, ThreadStates::BLOCKED);
    }

    /// Extract a specific waiter and wake it with `status`
    ///
    /// Returns false if the thread was not on a queue, which happens when
    /// a concurrent release already took it.
    pub(crate) fn tq_extract(&mut self, thread: ThreadIndex, status: WaitStatus) -> bool {
        let Some(queue) = self.tq_remove(thread) else {
            return false;
        };
        self.tcb_mut(thread).wait.status = status;
        self.queue_extracted(queue);
        match queue {
            QueueRef::ConditionVariable(condvar) => self.condvar_reacquire(condvar, thread, status),
            _ => self.tq_unblock(thread),
        }
        true
    }

    /// Wake every waiter with `status`; returns how many were woken
    pub(crate) fn tq_flush(&mut self, queue: QueueRef, status: Status) -> usize {
        let mut count = 0;
        while let Some(thread) = self.tq_dequeue(queue) {
            let tcb = self.tcb_mut(thread);
            tcb.wait.status = Err(status);
            tcb.wait.payload = WaitPayload::None;
            self.tq_unblock(thread);
            count += 1;
        }
        if count > 0 {
            log::debug!("flushed {} waiters of {:?} ({})", count, queue, status);
        }
        count
    }

    /// Bookkeeping after a waiter left `queue` other than by a grant
    pub(crate) fn queue_extracted(&mut self, queue: QueueRef) {
        if let QueueRef::Mutex(mutex) = queue {
            if let Some(owner) = self.mutex_refresh_inheritance(mutex) {
                self.update_priority(owner);
            }
        }
    }

    /// Watchdog routine ending a wait or delay
    pub(crate) fn thread_timeout(&mut self, id: ThreadId) {
        let Some(tcb) = self.threads.get_mut(id) else {
            debug_assert!(false, "timeout of dead thread {}", id);
            log::warn!("timeout of dead thread {}", id);
            return;
        };
        tcb.wait.timer = None;
        let state = tcb.wait.flags.state;
        if matches!(state, WaitState::Ready | WaitState::ReadyAgain) {
            return;
        }
        let thread = id.index();
        if tcb.state.contains(ThreadStates::WAITING_FOR_TIME) {
            tcb.wait.status = Ok(());
            self.tq_unblock(thread);
            return;
        }

        log::trace!("thread {} timed out", id);
        let status = Err(Status::Timeout);
        if !self.tq_extract(thread, status) {
            let tcb = self.tcb_mut(thread);
            tcb.wait.status = status;
            tcb.wait.payload = WaitPayload::None;
            self.tq_unblock(thread);
        }
    }
}
