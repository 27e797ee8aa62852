//! Barriers

use crate::error::{Result, Status};
use crate::kern::kernel::Kernel;
use crate::kern::threadq::{QueueDiscipline, QueueRef, ThreadQueue};
use crate::types::{BarrierId, Timeout, WaitOutcome};

/// When a barrier lets its waiters go
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BarrierRelease {
    /// Once this many threads arrived, the last one included
    Automatic(u32),
    /// Only through [`Kernel::barrier_release`]
    Manual,
}

#[derive(Debug)]
pub struct Barrier {
    name: &'static str,
    release: BarrierRelease,
    pub(crate) queue: ThreadQueue,
}

impl Barrier {
    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn release(&self) -> BarrierRelease {
        self.release
    }

    pub fn waiting(&self) -> usize {
        self.queue.len()
    }
}

impl Kernel {
    pub fn barrier_create(
        &mut self,
        name: &'static str,
        release: BarrierRelease,
    ) -> Result<BarrierId> {
        if release == BarrierRelease::Automatic(0) {
            return Err(Status::InvalidNumber);
        }
        let id = self.barriers.allocate(Barrier {
            name,
            release,
            queue: ThreadQueue::new(QueueDiscipline::Fifo),
        })?;
        log::debug!("barrier {} '{}' created ({:?})", id, name, release);
        Ok(id)
    }

    pub fn barrier_delete(&mut self, id: BarrierId) -> Result<()> {
        self.barriers.lookup(id)?;
        self.directive(|k| {
            k.tq_flush(QueueRef::Barrier(id), Status::ObjectWasDeleted);
            k.barriers.free(id);
        });
        log::debug!("barrier {} deleted", id);
        Ok(())
    }

    /// Arrive at the barrier; the arrival that completes an automatic
    /// barrier releases everybody and does not block
    pub fn barrier_wait(&mut self, id: BarrierId, timeout: Timeout) -> Result<WaitOutcome> {
        let thread = self.calling_thread()?;
        let barrier = self.barriers.lookup(id)?;
        if let BarrierRelease::Automatic(count) = barrier.release {
            if barrier.queue.len() + 1 >= count as usize {
                self.directive(|k| k.barrier_open(id));
                return Ok(WaitOutcome::Satisfied);
            }
        }
        if timeout == Timeout::NoWait {
            return Err(Status::Unsatisfied);
        }
        self.directive(|k| k.tq_enqueue(thread, QueueRef::Barrier(id), timeout));
        Ok(WaitOutcome::Blocked)
    }

    /// Release every waiter; returns how many were released
    pub fn barrier_release(&mut self, id: BarrierId) -> Result<usize> {
        self.barriers.lookup(id)?;
        Ok(self.directive(|k| k.barrier_open(id)))
    }

    pub fn barrier(&self, id: BarrierId) -> Result<&Barrier> {
        self.barriers.lookup(id)
    }

    fn barrier_open(&mut self, id: BarrierId) -> usize {
        let mut count = 0;
        while let Some(thread) = self.tq_dequeue(QueueRef::Barrier(id)) {
            self.tcb_mut(thread).wait.status = Ok(());
            self.tq_unblock(thread);
            count += 1;
        }
        count
    }
}
