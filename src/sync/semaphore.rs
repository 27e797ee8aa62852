//! Counting semaphores

use crate::error::{Result, Status};
use crate::kern::kernel::Kernel;
use crate::kern::threadq::{QueueDiscipline, QueueRef, ThreadQueue};
use crate::types::{SemaphoreId, Timeout, WaitOutcome};

/// Creation parameters of a counting semaphore
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SemaphoreAttributes {
    pub name: &'static str,
    pub initial: u32,
    /// Highest count a release may reach
    pub maximum: u32,
    pub discipline: QueueDiscipline,
}

impl SemaphoreAttributes {
    pub const fn new(name: &'static str, initial: u32) -> Self {
        Self {
            name,
            initial,
            maximum: u32::MAX,
            discipline: QueueDiscipline::Fifo,
        }
    }

    pub const fn with_maximum(mut self, maximum: u32) -> Self {
        self.maximum = maximum;
        self
    }

    pub const fn with_discipline(mut self, discipline: QueueDiscipline) -> Self {
        self.discipline = discipline;
        self
    }
}

#[derive(Debug)]
pub struct Semaphore {
    name: &'static str,
    count: u32,
    maximum: u32,
    pub(crate) queue: ThreadQueue,
}

impl Semaphore {
    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn count(&self) -> u32 {
        self.count
    }

    pub fn maximum(&self) -> u32 {
        self.maximum
    }

    pub fn waiting(&self) -> usize {
        self.queue.len()
    }
}

impl Kernel {
    pub fn semaphore_create(&mut self, attributes: &SemaphoreAttributes) -> Result<SemaphoreId> {
        if attributes.maximum == 0 || attributes.initial > attributes.maximum {
            return Err(Status::InvalidNumber);
        }
        let id = self.semaphores.allocate(Semaphore {
            name: attributes.name,
            count: attributes.initial,
            maximum: attributes.maximum,
            queue: ThreadQueue::new(attributes.discipline),
        })?;
        log::debug!(
            "semaphore {} '{}' created with count {}",
            id,
            attributes.name,
            attributes.initial
        );
        Ok(id)
    }

    /// Delete a semaphore; its waiters wake with `ObjectWasDeleted`
    pub fn semaphore_delete(&mut self, id: SemaphoreId) -> Result<()> {
        self.semaphores.lookup(id)?;
        self.directive(|k| {
            k.tq_flush(QueueRef::Semaphore(id), Status::ObjectWasDeleted);
            k.semaphores.free(id);
        });
        log::debug!("semaphore {} deleted", id);
        Ok(())
    }

    pub fn semaphore_obtain(&mut self, id: SemaphoreId, timeout: Timeout) -> Result<WaitOutcome> {
        let thread = self.calling_thread()?;
        let semaphore = self.semaphores.lookup_mut(id)?;
        if semaphore.count > 0 {
            semaphore.count -= 1;
            return Ok(WaitOutcome::Satisfied);
        }
        if timeout == Timeout::NoWait {
            return Err(Status::Unsatisfied);
        }
        self.directive(|k| k.tq_enqueue(thread, QueueRef::Semaphore(id), timeout));
        Ok(WaitOutcome::Blocked)
    }

    /// Wake the first waiter, or count up; fails with `Unsatisfied` if the
    /// count is already at its maximum. Callable from interrupt context.
    pub fn semaphore_release(&mut self, id: SemaphoreId) -> Result<()> {
        self.semaphores.lookup(id)?;
        self.directive(|k| {
            if let Some(thread) = k.tq_dequeue(QueueRef::Semaphore(id)) {
                k.tcb_mut(thread).wait.status = Ok(());
                k.tq_unblock(thread);
                return Ok(());
            }
            let semaphore = k.semaphores.lookup_mut(id)?;
            if semaphore.count >= semaphore.maximum {
                return Err(Status::Unsatisfied);
            }
            semaphore.count += 1;
            Ok(())
        })
    }

    /// Wake every waiter with `Unsatisfied`; returns how many were woken
    pub fn semaphore_flush(&mut self, id: SemaphoreId) -> Result<usize> {
        self.semaphores.lookup(id)?;
        Ok(self.directive(|k| k.tq_flush(QueueRef::Semaphore(id), Status::Unsatisfied)))
    }

    pub fn semaphore(&self, id: SemaphoreId) -> Result<&Semaphore> {
        self.semaphores.lookup(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_attributes_defaults() {
        let attributes = SemaphoreAttributes::new("s", 2);
        assert_eq!(attributes.maximum, u32::MAX);
        assert_eq!(attributes.discipline, QueueDiscipline::Fifo);
        let bounded = attributes
            .with_maximum(3)
            .with_discipline(QueueDiscipline::Priority);
        assert_eq!(bounded.maximum, 3);
        assert_eq!(bounded.discipline, QueueDiscipline::Priority);
    }
}
