//! Timer objects
//!
//! A timer arms one watchdog that runs a [`TimerAction`] on expiry, once
//! or every `interval` ticks. Actions run from the clock interrupt, so they
//! are restricted to things that never block: a plain function, posting
//! events to a thread, or releasing a semaphore.

use crate::error::{Result, Status};
use crate::kern::kernel::Kernel;
use crate::kern::watchdog::{WatchdogId, WatchdogRoutine};
use crate::sync::event::EventSet;
use crate::types::{SemaphoreId, ThreadId, Ticks, TimerId};

/// Callback of a timer: the timer's id and the user argument
pub type TimerCallback = fn(TimerId, usize);

/// What an expired timer does
#[derive(Debug, Clone, Copy)]
pub enum TimerAction {
    Callback(TimerCallback, usize),
    SendEvents(ThreadId, EventSet),
    ReleaseSemaphore(SemaphoreId),
}

#[derive(Debug)]
pub struct Timer {
    name: &'static str,
    action: Option<TimerAction>,
    interval: Ticks,
    periodic: bool,
    watchdog: Option<WatchdogId>,
    fired: u64,
}

impl Timer {
    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn is_armed(&self) -> bool {
        self.watchdog.is_some()
    }

    pub fn is_periodic(&self) -> bool {
        self.periodic
    }

    pub fn interval(&self) -> Ticks {
        self.interval
    }

    /// Number of expirations so far
    pub fn fired(&self) -> u64 {
        self.fired
    }
}

impl Kernel {
    pub fn timer_create(&mut self, name: &'static str) -> Result<TimerId> {
        let id = self.timers.allocate(Timer {
            name,
            action: None,
            interval: 0,
            periodic: false,
            watchdog: None,
            fired: 0,
        })?;
        log::debug!("timer {} '{}' created", id, name);
        Ok(id)
    }

    /// Delete a timer; a pending expiry is cancelled first
    pub fn timer_delete(&mut self, id: TimerId) -> Result<()> {
        self.timer_cancel(id)?;
        self.timers.free(id);
        log::debug!("timer {} deleted", id);
        Ok(())
    }

    /// Run `action` once, `ticks` from now
    pub fn timer_fire_after(
        &mut self,
        id: TimerId,
        ticks: Ticks,
        action: TimerAction) -> Result<()> {
        self.timer_arm(id, ticks, action, false)
    }

    /// Run `action` every `ticks`, starting `ticks` from now
    pub fn timer_fire_every(
        &mut self,
        id: TimerId,
        ticks: Ticks,
        action: TimerAction) -> Result<()> {
        self.timer_arm(id, ticks, action, true)
    }

    /// Re-arm a timer with its last interval and action
    pub fn timer_reset(&mut self, id: TimerId) -> Result<()> {
        let timer = self.timers.lookup(id)?;
        let Some(action) = timer.action else {
            return Err(Status::NotDefined);
        };
        let (interval, periodic) = (timer.interval, timer.periodic);
        self.timer_arm(id, interval, action, periodic)
    }

    /// Stop a timer; cancelling an idle timer is not an error
    pub fn timer_cancel(&mut self, id: TimerId) -> Result<()> {
        let timer = self.timers.lookup_mut(id)?;
        if let Some(watchdog) = timer.watchdog.take() {
            self.watchdogs.cancel(watchdog);
        }
        Ok(())
    }

    /// Ticks until the next expiry of an armed timer
    pub fn timer_remaining(&self, id: TimerId) -> Result<Option<Ticks>> {
        let timer = self.timers.lookup(id)?;
        Ok(timer.watchdog.and_then(|w| self.watchdogs.remaining(w)))
    }

    pub fn timer(&self, id: TimerId) -> Result<&Timer> {
        self.timers.lookup(id)
    }

    fn timer_arm(
        &mut self,
        id: TimerId,
        ticks: Ticks,
        action: TimerAction,
        periodic: bool) -> Result<()> {
        if ticks == 0 {
            return Err(Status::InvalidNumber);
        }
        let timer = self.timers.lookup_mut(id)?;
        if let Some(watchdog) = timer.watchdog.take() {
            self.watchdogs.cancel(watchdog);
        }
        timer.action = Some(action);
        timer.interval = ticks;
        timer.periodic = periodic;
        let routine = WatchdogRoutine::Timer(id);
        timer.watchdog = Some(self.watchdogs.insert_relative(ticks, routine));
        Ok(())
    }

    /// Watchdog routine of an expired timer
    pub(crate) fn timer_fire(&mut self, id: TimerId) {
        let Some(timer) = self.timers.get_mut(id) else {
            debug_assert!(false, "expiry of deleted timer {}", id);
            log::warn!("expiry of deleted timer {}", id);
            return;
        };
        timer.watchdog = None;
        timer.fired += 1;
        if timer.periodic {
            timer.watchdog = Some(
                self.watchdogs
                    .insert_relative(timer.interval, WatchdogRoutine::Timer(id)),
            );
        }
        let Some(action) = timer.action else {
            return;
        };

        log::trace!("timer {} fires", id);
        let result = match action {
            TimerAction::Callback(callback, argument) => {
                callback(id, argument);
                Ok(())
            }
            TimerAction::SendEvents(thread, events) => self.event_send(thread, events),
            TimerAction::ReleaseSemaphore(semaphore) => self.semaphore_release(semaphore),
        };
        if let Err(status) = result {
            log::warn!("timer {} action failed: {}", id, status);
        }
    }
}
