//! Thread events
//!
//! Every thread owns a 32-bit set of pending events. Senders OR events into
//! the set; a receiver asks for a set of wanted events with an `All` or
//! `Any` condition. Events that satisfy a receive are consumed; the others
//! stay pending.

use bitflags::bitflags;

use crate::error::{Result, Status};
use crate::kern::kernel::Kernel;
use crate::kern::thread::{ThreadStates, WaitClass, WaitPayload};
use crate::types::{ThreadId, ThreadIndex, Timeout};

bitflags! {
    /// A set of events, one bit each
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct EventSet: u32 {
        const _ = !0;
    }
}

impl EventSet {
    /// Event number `n` (0..32)
    pub const fn event(n: u32) -> Self {
        Self::from_bits_retain(1 << n)
    }
}

/// How a receive is satisfied
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EventCondition {
    /// Every wanted event is pending
    #[default]
    All,
    /// At least one wanted event is pending
    Any,
}

impl EventCondition {
    /// The events a receive consumes from `pending`, if it is satisfied
    pub fn seize(self, pending: EventSet, wanted: EventSet) -> Option<EventSet> {
        let seized = pending.intersection(wanted);
        let satisfied = match self {
            EventCondition::All => seized == wanted,
            EventCondition::Any => !seized.is_empty(),
        };
        satisfied.then_some(seized)
    }
}

/// Result of a receive for the calling thread
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventOutcome {
    Received(EventSet),
    /// The caller blocked; the events are taken with
    /// [`Kernel::thread_take_events`] once it wakes
    Blocked,
}

impl Kernel {
    /// Post events to a thread, waking it if its receive is now satisfied
    pub fn event_send(&mut self, id: ThreadId, events: EventSet) -> Result<()> {
        let thread = self.thread_index(id)?;
        self.directive(|k| k.event_surrender(thread, events));
        Ok(())
    }

    /// Receive events for the calling thread
    ///
    /// An empty `wanted` set only reports the pending events.
    pub fn event_receive(
        &mut self,
        wanted: EventSet,
        condition: EventCondition,
        timeout: Timeout,
    ) -> Result<EventOutcome> {
        let thread = self.calling_thread()?;
        let tcb = self.tcb_mut(thread);
        if wanted.is_empty() {
            return Ok(EventOutcome::Received(tcb.pending_events));
        }
        if let Some(seized) = condition.seize(tcb.pending_events, wanted) {
            tcb.pending_events.remove(seized);
            return Ok(EventOutcome::Received(seized));
        }
        if timeout == Timeout::NoWait {
            return Err(Status::Unsatisfied);
        }
        self.directive(|k| {
            k.tcb_mut(thread).wait.payload = WaitPayload::Events { wanted, condition };
            k.thread_block(
                thread,
                WaitClass::Event,
                ThreadStates::WAITING_FOR_EVENT,
                timeout,
            );
        });
        Ok(EventOutcome::Blocked)
    }

    fn event_surrender(&mut self, thread: ThreadIndex, events: EventSet) {
        let tcb = self.tcb_mut(thread);
        tcb.pending_events.insert(events);
        if !tcb.state.contains(ThreadStates::WAITING_FOR_EVENT) {
            return;
        }
        let WaitPayload::Events { wanted, condition } = tcb.wait.payload else {
            return;
        };
        let Some(seized) = condition.seize(tcb.pending_events, wanted) else {
            return;
        };
        tcb.pending_events.remove(seized);
        tcb.wait.payload = WaitPayload::EventsReceived(seized);
        tcb.wait.status = Ok(());
        log::trace!("thread {} receives events {:#x}", tcb.id(), seized.bits());
        self.tq_unblock(thread);
    }
}
