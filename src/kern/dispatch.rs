//! Dispatch engine
//!
//! Schedulers only ever change the heir of a processor and raise its
//! `dispatch_necessary` flag. Turning the heir into the executing thread
//! happens here, and only when the processor's thread dispatch disable
//! level is zero and it is not servicing an interrupt:
//!
//! - [`Kernel::dispatch_disable`] / [`Kernel::dispatch_enable`] nest. The
//!   enable that returns the level to zero dispatches if needed.
//! - [`Kernel::isr_enter`] / [`Kernel::isr_exit`] bracket interrupt
//!   handlers; the outermost exit dispatches.
//! - [`Kernel::thread_dispatch`] re-reads heir and executing with
//!   interrupts disabled on every pass, so a heir change made during the
//!   switch itself is picked up by the next pass instead of being lost.
//! - A heir that still executes on another processor is not switched to.
//!   The processor saves its context and keeps `dispatch_necessary` set;
//!   the other processor interrupts it once it has switched away.
//!
//! Entering the dispatcher with dispatching disabled is a fatal error.

use crate::error::InternalError;
use crate::kern::fatal::FatalSource;
use crate::kern::isr::IsrGuard;
use crate::kern::kernel::Kernel;
use crate::kern::thread::BudgetAlgorithm;
use crate::types::ThreadIndex;

impl Kernel {
    /// Synchronize the current processor with the port
    fn enter_processor(&mut self) -> usize {
        let current = self.port.current_processor();
        self.processors.set_current(current);
        current
    }

    /// Run `f` with thread dispatching disabled
    pub(crate) fn directive<R>(&mut self, f: impl FnOnce(&mut Self) -> R) -> R {
        self.dispatch_disable();
        let result = f(self);
        self.dispatch_enable();
        result
    }

    /// Disable thread dispatching on the current processor; returns the
    /// new nesting level
    pub fn dispatch_disable(&mut self) -> u32 {
        let cpu = self.enter_processor();
        let processor = self.processors.get_mut(cpu);
        processor.dispatch_disable_level += 1;
        processor.dispatch_disable_level
    }

    /// Undo one [`Kernel::dispatch_disable`]; the outermost enable
    /// processes help requests and dispatches if a heir change is pending
    pub fn dispatch_enable(&mut self) {
        let cpu = self.processors.current();
        let processor = self.processors.get_mut(cpu);
        if processor.dispatch_disable_level == 0 {
            self.fatal(
                FatalSource::Dispatch,
                InternalError::UnbalancedDispatchEnable,
            );
        }
        processor.dispatch_disable_level -= 1;
        if processor.dispatch_disable_level > 0 || processor.isr_nest_level > 0 {
            return;
        }

        self.process_help_requests(cpu);
        self.send_pending_interrupts();
        if self.processors.get(cpu).dispatch_necessary {
            self.thread_dispatch();
        }
        self.reap_zombies();
    }

    /// Switch the current processor to its heir until no change is pending
    pub fn thread_dispatch(&mut self) {
        let cpu = self.enter_processor();
        let level = self.processors.get(cpu).dispatch_disable_level;
        if level != 0 {
            self.fatal(
                FatalSource::Dispatch,
                InternalError::BadThreadDispatchDisableLevel(level),
            );
        }
        self.processors.get_mut(cpu).dispatch_disable_level = 1;

        loop {
            let (executing, heir) = {
                let _isr = IsrGuard::new(self.port.clone());
                let processor = self.processors.get(cpu);
                if !processor.dispatch_necessary {
                    break;
                }
                let Some(heir) = processor.heir else {
                    self.fatal(FatalSource::Dispatch, InternalError::NoHeir(cpu));
                };
                if processor.executing != Some(heir)
                    && self.processors.executes_elsewhere(heir, cpu)
                {
                    // Save our context and wait for the other processor to
                    // switch away from the heir
                    let processor = self.processors.get_mut(cpu);
                    if let Some(previous) = processor.executing.take() {
                        processor.saved = Some(previous);
                    }
                    log::trace!("cpu{}: heir {} still executes elsewhere", cpu, heir);
                    break;
                }
                self.processors.claim_saved(heir, cpu);
                let processor = self.processors.get_mut(cpu);
                processor.dispatch_necessary = false;
                let executing = processor.executing.take().or(processor.saved.take());
                processor.executing = Some(heir);
                if executing == Some(heir) {
                    continue;
                }
                processor.stats.context_switches += 1;
                (executing, heir)
            };
            self.switch_to(cpu, executing, heir);
            if let Some(previous) = executing {
                self.processors.release_executing(previous, cpu);
            }
        }

        self.processors.get_mut(cpu).dispatch_disable_level = 0;
        self.send_pending_interrupts();
    }

    fn switch_to(&mut self, cpu: usize, executing: Option<ThreadIndex>, heir: ThreadIndex) {
        let timeslice = self.config.ticks_per_timeslice;
        let tcb = self.tcb_mut(heir);
        if tcb.budget == BudgetAlgorithm::ResetTimeslice {
            tcb.timeslice = timeslice;
        }
        let to = tcb.id();
        match executing.and_then(|thread| self.threads.id_at(thread)) {
            Some(from) => {
                log::trace!("cpu{}: switch {} -> {}", cpu, from, to);
                self.port.context_switch(cpu, from, to);
            }
            // The previous thread was reaped before the switch
            None => log::trace!("cpu{}: resume {}", cpu, to),
        }
    }

    /// Interrupt entry: nest and disable thread dispatching
    pub fn isr_enter(&mut self) {
        let cpu = self.enter_processor();
        let processor = self.processors.get_mut(cpu);
        processor.isr_nest_level += 1;
        processor.dispatch_disable_level += 1;
    }

    /// Interrupt exit: the outermost exit dispatches if needed
    pub fn isr_exit(&mut self) {
        let cpu = self.processors.current();
        let processor = self.processors.get_mut(cpu);
        if processor.isr_nest_level == 0 {
            self.fatal(FatalSource::Interrupt, InternalError::UnbalancedIsrNesting);
        }
        processor.isr_nest_level -= 1;
        self.dispatch_enable();
    }

    /// Inter-processor interrupt handler: the sender changed our heir
    pub fn handle_inter_processor_interrupt(&mut self) {
        self.isr_enter();
        let cpu = self.processors.current();
        self.processors.get_mut(cpu).stats.interrupts += 1;
        self.isr_exit();
    }

    pub(crate) fn send_pending_interrupts(&mut self) {
        for target in self.processors.take_pending_interrupts().iter() {
            log::trace!("ipi -> cpu{}", target);
            self.port.send_interrupt(target);
        }
    }

    /// Offer the threads that asked for help on `cpu` to other scheduler
    /// instances; an instance that would run one right away adopts it
    pub(crate) fn process_help_requests(&mut self, cpu: usize) {
        while let Some(thread) = self.processors.take_help_request(cpu) {
            let Some(tcb) = self.threads.by_index(thread) else {
                continue;
            };
            if !tcb.state.is_empty() {
                continue;
            }
            let from = tcb.scheduler;
            let (priority, affinity) = (tcb.current_priority, tcb.affinity);
            if self.schedulers[from].is_scheduled(&self.processors, thread) {
                continue;
            }
            let mapping = self.schedulers[from].mapping();
            let helper = (0..self.schedulers.len()).find(|&i| {
                let candidate = &self.schedulers[i];
                i != from
                    && candidate.mapping() == mapping
                    && candidate.ask_for_help(&self.processors, priority, affinity)
            });
            if let Some(helper) = helper {
                log::debug!(
                    "{} helps thread {}",
                    self.schedulers[helper].name(),
                    tcb.id()
                );
                self.migrate(thread, helper);
            }
        }
    }
}
