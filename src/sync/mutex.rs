//! Mutexes
//!
//! A mutex has at most one owner. Waiters park on the mutex's thread
//! queue and ownership is handed directly to the first waiter on release,
//! so a released mutex is never observed free while threads wait on it.
//!
//! Locking protocols:
//!
//! - `None`: plain ownership.
//! - `Inherit`: the owner's current priority is raised to the current
//!   priority of its highest waiter. The boost is a contribution keyed by
//!   the mutex, so an owner of several mutexes loses exactly one boost per
//!   release. A waiter whose own priority rises propagates the change
//!   along the owner chain (see [`Kernel::update_priority`]).
//! - `Ceiling(p)`: the owner runs at priority `p` (at least) while it holds
//!   the mutex. Obtaining it with a current priority above the ceiling is
//!   `CeilingViolated`.
//!
//! Both protocols need a priority-ordered queue.

use crate::error::{Result, Status};
use crate::kern::kernel::Kernel;
use crate::kern::priority::{Priority, PrioritySource};
use crate::kern::thread::{WaitPayload, WaitStatus};
use crate::kern::threadq::{QueueDiscipline, QueueRef, ThreadQueue};
use crate::types::{MutexId, ThreadId, ThreadIndex, Timeout, WaitOutcome};

/// Priority protocol of a mutex
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LockingProtocol {
    #[default]
    None,
    Inherit,
    /// Ceiling as a user priority
    Ceiling(Priority),
}

/// Creation parameters of a mutex
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MutexAttributes {
    pub name: &'static str,
    pub protocol: LockingProtocol,
    pub discipline: QueueDiscipline,
    /// Allow the owner to obtain the mutex again
    pub recursive: bool,
}

impl MutexAttributes {
    pub const fn new(name: &'static str) -> Self {
        Self {
            name,
            protocol: LockingProtocol::None,
            discipline: QueueDiscipline::Priority,
            recursive: false,
        }
    }

    pub const fn with_protocol(mut self, protocol: LockingProtocol) -> Self {
        self.protocol = protocol;
        self
    }

    pub const fn with_discipline(mut self, discipline: QueueDiscipline) -> Self {
        self.discipline = discipline;
        self
    }

    pub const fn with_recursive(mut self, recursive: bool) -> Self {
        self.recursive = recursive;
        self
    }
}

#[derive(Debug)]
pub struct Mutex {
    name: &'static str,
    protocol: LockingProtocol,
    recursive: bool,
    pub(crate) owner: Option<ThreadIndex>,
    nest_count: u32,
    pub(crate) queue: ThreadQueue,
}

impl Mutex {
    fn new(attributes: &MutexAttributes) -> Self {
        Self {
            name: attributes.name,
            protocol: attributes.protocol,
            recursive: attributes.recursive,
            owner: None,
            nest_count: 0,
            queue: ThreadQueue::new(attributes.discipline),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn protocol(&self) -> LockingProtocol {
        self.protocol
    }

    pub fn is_recursive(&self) -> bool {
        self.recursive
    }

    pub fn is_locked(&self) -> bool {
        self.owner.is_some()
    }

    /// How many times the owner obtained the mutex
    pub fn nest_count(&self) -> u32 {
        self.nest_count
    }

    /// Number of blocked waiters
    pub fn waiting(&self) -> usize {
        self.queue.len()
    }
}

impl Kernel {
    pub fn mutex_create(&mut self, attributes: &MutexAttributes) -> Result<MutexId> {
        match attributes.protocol {
            LockingProtocol::None => {}
            LockingProtocol::Inherit | LockingProtocol::Ceiling(_)
                if attributes.discipline == QueueDiscipline::Fifo =>
            {
                return Err(Status::NotDefined);
            }
            LockingProtocol::Inherit => {}
            LockingProtocol::Ceiling(ceiling) => {
                if ceiling.0 == 0 || ceiling.0 >= self.schedulers[0].maximum_priority().0 {
                    return Err(Status::InvalidPriority);
                }
            }
        }
        let id = self.mutexes.allocate(Mutex::new(attributes))?;
        log::debug!(
            "mutex {} '{}' created ({:?})",
            id,
            attributes.name,
            attributes.protocol
        );
        Ok(id)
    }

    /// Delete an unowned mutex
    pub fn mutex_delete(&mut self, id: MutexId) -> Result<()> {
        if self.mutexes.lookup(id)?.owner.is_some() {
            return Err(Status::ResourceInUse);
        }
        self.directive(|k| {
            k.tq_flush(QueueRef::Mutex(id), Status::ObjectWasDeleted);
            k.mutexes.free(id);
        });
        log::debug!("mutex {} deleted", id);
        Ok(())
    }

    /// Obtain a mutex for the calling thread
    pub fn mutex_obtain(&mut self, id: MutexId, timeout: Timeout) -> Result<WaitOutcome> {
        let thread = self.calling_thread()?;
        let mutex = self.mutexes.lookup(id)?;
        let protocol = mutex.protocol;
        match mutex.owner {
            None => {
                if let LockingProtocol::Ceiling(ceiling) = protocol {
                    let tcb = self.tcb(thread);
                    let mapped = self.schedulers[tcb.scheduler].map_priority(ceiling);
                    if tcb.current_priority.is_higher_than(mapped) {
                        return Err(Status::CeilingViolated);
                    }
                }
                self.directive(|k| k.mutex_grant(id, thread));
                Ok(WaitOutcome::Satisfied)
            }
            Some(owner) if owner == thread => {
                if !mutex.recursive {
                    return Err(Status::Deadlock);
                }
                if let Some(mutex) = self.mutexes.get_mut(id) {
                    mutex.nest_count += 1;
                }
                Ok(WaitOutcome::Satisfied)
            }
            Some(owner) => {
                if timeout == Timeout::NoWait {
                    return Err(Status::Unsatisfied);
                }
                if protocol == LockingProtocol::Inherit
                    && self.mutex_would_deadlock(owner, thread)
                {
                    return Err(Status::Deadlock);
                }
                self.directive(|k| {
                    k.tq_enqueue(thread, QueueRef::Mutex(id), timeout);
                    if let Some(owner) = k.mutex_refresh_inheritance(id) {
                        k.update_priority(owner);
                    }
                });
                Ok(WaitOutcome::Blocked)
            }
        }
    }

    /// Release a mutex owned by the calling thread
    pub fn mutex_release(&mut self, id: MutexId) -> Result<()> {
        let thread = self.calling_thread()?;
        let mutex = self.mutexes.lookup_mut(id)?;
        if mutex.owner != Some(thread) {
            return Err(Status::NotOwnerOfResource);
        }
        if mutex.nest_count > 1 {
            mutex.nest_count -= 1;
            return Ok(());
        }
        self.directive(|k| k.mutex_surrender(id, thread));
        Ok(())
    }

    /// Current owner of a mutex
    pub fn mutex_owner(&self, id: MutexId) -> Result<Option<ThreadId>> {
        let mutex = self.mutexes.lookup(id)?;
        Ok(mutex.owner.and_then(|owner| self.threads.id_at(owner)))
    }

    pub fn mutex(&self, id: MutexId) -> Result<&Mutex> {
        self.mutexes.lookup(id)
    }

    /// Whether `thread` waiting for a mutex owned by `owner` closes a cycle
    fn mutex_would_deadlock(&self, owner: ThreadIndex, thread: ThreadIndex) -> bool {
        let mut current = owner;
        for _ in 0..=self.threads.maximum() {
            if current == thread {
                return true;
            }
            let Some(QueueRef::Mutex(waiting_for)) = self.tcb(current).wait.queue else {
                return false;
            };
            match self.mutexes.get(waiting_for).and_then(|m| m.owner) {
                Some(next) => current = next,
                None => return false,
            }
        }
        true
    }

    /// Make `thread` the owner and apply the protocol's contribution
    fn mutex_grant(&mut self, id: MutexId, thread: ThreadIndex) {
        let Some(mutex) = self.mutexes.get_mut(id) else {
            return;
        };
        mutex.owner = Some(thread);
        mutex.nest_count = 1;
        let protocol = mutex.protocol;
        self.tcb_mut(thread).resource_count += 1;

        match protocol {
            LockingProtocol::None => {}
            LockingProtocol::Inherit => {
                self.mutex_refresh_inheritance(id);
                self.update_priority(thread);
            }
            LockingProtocol::Ceiling(ceiling) => {
                let scheduler = self.tcb(thread).scheduler;
                let mapped = self.schedulers[scheduler].map_priority(ceiling);
                if self
                    .tcb_mut(thread)
                    .priority
                    .set(PrioritySource::Ceiling(id), mapped)
                    .is_err()
                {
                    log::warn!(
                        "thread {} holds too many boosts; ceiling of {} ignored",
                        thread,
                        id
                    );
                }
                self.update_priority(thread);
            }
        }
        log::trace!("mutex {} owned by {}", id, self.tcb(thread).id());
    }

    /// Drop ownership and hand the mutex to the first waiter
    pub(crate) fn mutex_surrender(&mut self, id: MutexId, owner: ThreadIndex) {
        let Some(mutex) = self.mutexes.get_mut(id) else {
            return;
        };
        mutex.owner = None;
        mutex.nest_count = 0;

        let tcb = self.tcb_mut(owner);
        tcb.resource_count = tcb.resource_count.saturating_sub(1);
        tcb.priority.remove(PrioritySource::Inherit(id));
        tcb.priority.remove(PrioritySource::Ceiling(id));
        self.update_priority(owner);

        let Some(next) = self.tq_dequeue(QueueRef::Mutex(id)) else {
            return;
        };
        let tcb = self.tcb_mut(next);
        tcb.wait.status = match core::mem::take(&mut tcb.wait.payload) {
            WaitPayload::Reacquire { status, .. } => status,
            _ => Ok(()),
        };
        self.mutex_grant(id, next);
        self.tq_unblock(next);
    }

    /// Re-derive the inheritance contribution of a mutex to its owner from
    /// the highest waiter; returns the owner if the protocol is `Inherit`
    pub(crate) fn mutex_refresh_inheritance(&mut self, id: MutexId) -> Option<ThreadIndex> {
        let mutex = self.mutexes.get(id)?;
        if mutex.protocol != LockingProtocol::Inherit {
            return None;
        }
        let owner = mutex.owner?;
        let top = mutex.queue.first().map(|w| self.tcb(w).current_priority);
        let source = PrioritySource::Inherit(id);
        let aggregation = &mut self.tcb_mut(owner).priority;
        match top {
            Some(priority) => {
                if aggregation.set(source, priority).is_err() {
                    log::warn!(
                        "thread {} holds too many boosts; inheritance from {} ignored",
                        owner,
                        id
                    );
                }
            }
            None => {
                aggregation.remove(source);
            }
        }
        Some(owner)
    }

    /// Move a blocked former condition variable waiter onto the mutex it
    /// has to reacquire, or grant it right away if the mutex is free
    pub(crate) fn mutex_reacquire(&mut self, id: MutexId, thread: ThreadIndex, status: WaitStatus) {
        let owner = match self.mutexes.get(id) {
            Some(mutex) => mutex.owner,
            None => {
                let tcb = self.tcb_mut(thread);
                tcb.wait.status = Err(Status::ObjectWasDeleted);
                self.tq_unblock(thread);
                return;
            }
        };
        if owner.is_none() {
            self.tcb_mut(thread).wait.status = status;
            self.mutex_grant(id, thread);
            self.tq_unblock(thread);
            return;
        }
        self.tcb_mut(thread).wait.payload = WaitPayload::Reacquire { mutex: id, status };
        self.tq_requeue(thread, QueueRef::Mutex(id));
        if let Some(owner) = self.mutex_refresh_inheritance(id) {
            self.update_priority(owner);
        }
    }
}
