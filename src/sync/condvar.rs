//! Condition variables
//!
//! Waiting releases the associated mutex and blocks on the condition
//! variable in one step. A woken waiter must hold the mutex again before it
//! runs: if the mutex is free it is granted on the spot, otherwise the
//! waiter is moved straight onto the mutex's queue and stays blocked. The
//! status of the condition wait (`Ok` or `Timeout`) is delivered once the
//! mutex is granted.
//!
//! All concurrent waiters must use the same mutex; the binding is dropped
//! when the last waiter leaves.

use crate::error::{Result, Status};
use crate::kern::kernel::Kernel;
use crate::kern::thread::{WaitPayload, WaitStatus};
use crate::kern::threadq::{QueueDiscipline, QueueRef, ThreadQueue};
use crate::types::{CondVarId, MutexId, ThreadIndex, Timeout, WaitOutcome};

#[derive(Debug)]
pub struct ConditionVariable {
    name: &'static str,
    mutex: Option<MutexId>,
    pub(crate) queue: ThreadQueue,
}

impl ConditionVariable {
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Mutex the current waiters are bound to
    pub fn mutex(&self) -> Option<MutexId> {
        self.mutex
    }

    pub fn waiting(&self) -> usize {
        self.queue.len()
    }
}

impl Kernel {
    pub fn condvar_create(
        &mut self,
        name: &'static str,
        discipline: QueueDiscipline,
    ) -> Result<CondVarId> {
        let id = self.condvars.allocate(ConditionVariable {
            name,
            mutex: None,
            queue: ThreadQueue::new(discipline),
        })?;
        log::debug!("condition variable {} '{}' created", id, name);
        Ok(id)
    }

    /// Delete a condition variable nobody waits on
    pub fn condvar_delete(&mut self, id: CondVarId) -> Result<()> {
        if !self.condvars.lookup(id)?.queue.is_empty() {
            return Err(Status::ResourceInUse);
        }
        self.condvars.free(id);
        log::debug!("condition variable {} deleted", id);
        Ok(())
    }

    /// Release `mutex` and wait for a signal
    ///
    /// The calling thread must own `mutex` exactly once.
    pub fn condvar_wait(
        &mut self,
        id: CondVarId,
        mutex: MutexId,
        timeout: Timeout,
    ) -> Result<WaitOutcome> {
        let thread = self.calling_thread()?;
        let bound = self.condvars.lookup(id)?.mutex;
        if bound.is_some_and(|bound| bound != mutex) {
            return Err(Status::IncorrectState);
        }
        let held = self.mutexes.lookup(mutex)?;
        if held.owner != Some(thread) {
            return Err(Status::NotOwnerOfResource);
        }
        if held.nest_count() > 1 {
            return Err(Status::IncorrectState);
        }
        if timeout == Timeout::NoWait {
            return Err(Status::Unsatisfied);
        }

        self.directive(|k| {
            if let Some(condvar) = k.condvars.get_mut(id) {
                condvar.mutex = Some(mutex);
            }
            k.mutex_surrender(mutex, thread);
            k.tcb_mut(thread).wait.payload = WaitPayload::CondVar { mutex };
            k.tq_enqueue(thread, QueueRef::ConditionVariable(id), timeout);
        });
        Ok(WaitOutcome::Blocked)
    }

    /// Wake the first waiter, if any
    pub fn condvar_signal(&mut self, id: CondVarId) -> Result<()> {
        self.condvars.lookup(id)?;
        self.directive(|k| {
            if let Some(thread) = k.tq_dequeue(QueueRef::ConditionVariable(id)) {
                k.condvar_reacquire(id, thread, Ok(()));
            }
        });
        Ok(())
    }

    /// Wake every waiter; returns how many were woken
    pub fn condvar_broadcast(&mut self, id: CondVarId) -> Result<usize> {
        self.condvars.lookup(id)?;
        Ok(self.directive(|k| {
            let mut count = 0;
            while let Some(thread) = k.tq_dequeue(QueueRef::ConditionVariable(id)) {
                k.condvar_reacquire(id, thread, Ok(()));
                count += 1;
            }
            count
        }))
    }

    pub fn condvar(&self, id: CondVarId) -> Result<&ConditionVariable> {
        self.condvars.lookup(id)
    }

    /// Second half of a condition wait for a thread already taken off the
    /// condition variable queue
    pub(crate) fn condvar_reacquire(
        &mut self,
        id: CondVarId,
        thread: ThreadIndex,
        status: WaitStatus,
    ) {
        let payload = core::mem::take(&mut self.tcb_mut(thread).wait.payload);
        let WaitPayload::CondVar { mutex } = payload else {
            debug_assert!(false, "condition waiter without a mutex");
            self.tcb_mut(thread).wait.status = status;
            self.tq_unblock(thread);
            return;
        };

        if let Some(condvar) = self.condvars.get_mut(id) {
            if condvar.queue.is_empty() {
                condvar.mutex = None;
            }
        }
        self.mutex_reacquire(mutex, thread, status);
    }
}
