//! Rate-monotonic periods
//!
//! A period belongs to the thread that created it. Each call of
//! [`Kernel::period_wait`] ends the current job and starts the next one:
//!
//! - Inactive: the first period starts now and the call returns at once.
//! - Active: the caller blocks until the running period ends; the next
//!   period starts at that instant.
//! - Expired: the period ended while the owner was still working. The
//!   call returns `Timeout` right away and releases the postponed job.
//!   The period keeps running on its own while jobs are postponed, so
//!   the owner can catch up by calling again until nothing is postponed.
//!
//! Under a deadline-driven scheduler every released job gives the owner a
//! `Job` priority contribution equal to its absolute deadline.

use alloc::vec::Vec;

use crate::error::{Result, Status};
use crate::kern::kernel::Kernel;
use crate::kern::priority::PrioritySource;
use crate::kern::thread::{ThreadStates, WaitClass};
use crate::kern::watchdog::{WatchdogId, WatchdogRoutine};
use crate::types::{PeriodId, ThreadId, ThreadIndex, Ticks, Timeout, TypedId, WaitOutcome};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PeriodState {
    #[default]
    Inactive,
    Active,
    Expired,
}

/// Snapshot of a period
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeriodStatus {
    pub owner: ThreadId,
    pub state: PeriodState,
    pub length: Ticks,
    /// Jobs released so far
    pub count: u32,
    /// Periods that ended before the owner was done
    pub missed: u32,
    /// Jobs whose release is still pending
    pub postponed: u32,
    /// Ticks until the running period ends
    pub remaining: Option<Ticks>,
}

#[derive(Debug)]
pub struct Period {
    name: &'static str,
    owner: ThreadId,
    state: PeriodState,
    length: Ticks,
    watchdog: Option<WatchdogId>,
    /// The owner is blocked until this period ends
    waiting: bool,
    count: u32,
    missed: u32,
    postponed: u32,
}

impl Period {
    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn owner(&self) -> ThreadId {
        self.owner
    }

    pub fn state(&self) -> PeriodState {
        self.state
    }
}

impl Kernel {
    /// Create a period owned by the calling thread
    pub fn period_create(&mut self, name: &'static str) -> Result<PeriodId> {
        let thread = self.calling_thread()?;
        let owner = self.tcb(thread).id();
        let id = self.periods.allocate(Period {
            name,
            owner,
            state: PeriodState::Inactive,
            length: 0,
            watchdog: None,
            waiting: false,
            count: 0,
            missed: 0,
            postponed: 0,
        })?;
        log::debug!("period {} '{}' created for {}", id, name, owner);
        Ok(id)
    }

    /// End the current job and start the next period of `length` ticks
    pub fn period_wait(&mut self, id: PeriodId, length: Ticks) -> Result<WaitOutcome> {
        let thread = self.calling_thread()?;
        let caller = self.tcb(thread).id();
        let period = self.periods.lookup_mut(id)?;
        if period.owner != caller {
            return Err(Status::NotOwnerOfResource);
        }
        if length == 0 {
            return Err(Status::InvalidNumber);
        }
        period.length = length;

        match period.state {
            PeriodState::Inactive => {
                self.directive(|k| k.period_release(id, thread));
                Ok(WaitOutcome::Satisfied)
            }
            PeriodState::Active => {
                period.waiting = true;
                self.directive(|k| {
                    k.thread_block(
                        thread,
                        WaitClass::Period,
                        ThreadStates::WAITING_FOR_PERIOD,
                        Timeout::Forever,
                    );
                });
                Ok(WaitOutcome::Blocked)
            }
            PeriodState::Expired => {
                period.postponed = period.postponed.saturating_sub(1);
                period.count += 1;
                if period.postponed == 0 {
                    period.state = PeriodState::Active;
                }
                log::debug!("period {} released a postponed job", id);
                Err(Status::Timeout)
            }
        }
    }

    /// Stop a period; the owner's job priority is dropped
    pub fn period_cancel(&mut self, id: PeriodId) -> Result<()> {
        let thread = self.calling_thread()?;
        if self.periods.lookup(id)?.owner != self.tcb(thread).id() {
            return Err(Status::NotOwnerOfResource);
        }
        self.directive(|k| {
            k.period_stop(id);
            if k.tcb_mut(thread).priority.remove(PrioritySource::Job) {
                k.update_priority(thread);
            }
        });
        Ok(())
    }

    /// Delete a period; an owner waiting on it wakes with `ObjectWasDeleted`
    pub fn period_delete(&mut self, id: PeriodId) -> Result<()> {
        let period = self.periods.lookup(id)?;
        let (owner, waiting) = (period.owner, period.waiting);
        self.directive(|k| {
            k.period_stop(id);
            if let Ok(thread) = k.thread_index(owner) {
                if waiting {
                    k.tcb_mut(thread).wait.status = Err(Status::ObjectWasDeleted);
                    k.tq_unblock(thread);
                }
            }
            k.periods.free(id);
        });
        log::debug!("period {} deleted", id);
        Ok(())
    }

    pub fn period_status(&self, id: PeriodId) -> Result<PeriodStatus> {
        let period = self.periods.lookup(id)?;
        Ok(PeriodStatus {
            owner: period.owner,
            state: period.state,
            length: period.length,
            count: period.count,
            missed: period.missed,
            postponed: period.postponed,
            remaining: period
                .watchdog
                .and_then(|watchdog| self.watchdogs.remaining(watchdog)),
        })
    }

    pub fn period(&self, id: PeriodId) -> Result<&Period> {
        self.periods.lookup(id)
    }

    /// Start a new period now and release its job
    fn period_release(&mut self, id: PeriodId, owner: ThreadIndex) {
        let now = self.watchdogs.now();
        let Some(period) = self.periods.get_mut(id) else {
            return;
        };
        let deadline = now + period.length;
        period.state = PeriodState::Active;
        period.count += 1;
        period.watchdog = Some(
            self.watchdogs
                .insert_absolute(deadline, WatchdogRoutine::PeriodEnd(id)),
        );
        self.period_job(owner, deadline);
    }

    /// Give the owner the priority of a job with `deadline`
    fn period_job(&mut self, owner: ThreadIndex, deadline: Ticks) {
        let tcb = self.tcb(owner);
        let Some(priority) = self.schedulers[tcb.scheduler].job_priority(deadline) else {
            return;
        };
        if self
            .tcb_mut(owner)
            .priority
            .set(PrioritySource::Job, priority)
            .is_err()
        {
            log::warn!("thread {} holds too many boosts; job ignored", owner);
            return;
        }
        self.update_priority(owner);
    }

    fn period_stop(&mut self, id: PeriodId) {
        let Some(period) = self.periods.get_mut(id) else {
            return;
        };
        if let Some(watchdog) = period.watchdog.take() {
            self.watchdogs.cancel(watchdog);
        }
        period.state = PeriodState::Inactive;
        period.postponed = 0;
        period.waiting = false;
    }

    /// Watchdog routine at the end of a period
    pub(crate) fn period_end(&mut self, id: PeriodId) {
        let Some(period) = self.periods.get_mut(id) else {
            debug_assert!(false, "end of deleted period {}", id);
            log::warn!("end of deleted period {}", id);
            return;
        };
        period.watchdog = None;
        let owner = period.owner.index();

        if period.waiting {
            period.waiting = false;
            self.period_release(id, owner);
            self.tcb_mut(owner).wait.status = Ok(());
            self.tq_unblock(owner);
            return;
        }

        period.state = PeriodState::Expired;
        period.missed += 1;
        period.postponed += 1;
        let deadline = self.watchdogs.now() + period.length;
        period.watchdog = Some(
            self.watchdogs
                .insert_absolute(deadline, WatchdogRoutine::PeriodEnd(id)),
        );
        log::debug!("period {} missed its deadline", id);
        self.period_job(owner, deadline);
    }

    /// Stop every period owned by a thread that is deleted or restarted
    pub(crate) fn periods_release_owner(&mut self, thread: ThreadIndex) {
        let owned: Vec<PeriodId> = self
            .periods
            .iter()
            .filter(|(_, period)| period.owner.index() == thread)
            .map(|(id, _)| id)
            .collect();
        for id in owned {
            self.period_stop(id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_state() {
        assert_eq!(PeriodState::default(), PeriodState::Inactive);
    }
}
