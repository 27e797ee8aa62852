//! Property-based tests for the scheduler core
//!
//! Random directive sequences must leave the kernel consistent, and the
//! ready order must stay "highest priority first, FIFO among equals" no
//! matter how the threads got there.

mod common;

use std::collections::BTreeSet;
use std::sync::Arc;

use common::*;
use proptest::prelude::*;
use supercore::{
    Configuration, Kernel, LockingProtocol, MutexAttributes, MutexId, Priority, QueueDiscipline,
    QueueRef, SchedulerAlgorithm, SemaphoreAttributes, SemaphoreId, SimulatedPort, Status,
    ThreadId, TimerAction, Timeout,
};

// ════════════════════════════════════════════════════════════
// Strategies
// ════════════════════════════════════════════════════════════

/// A directive issued by whichever thread executes, or a change of the
/// processor that issues the next one
#[derive(Debug, Clone)]
enum Op {
    Spawn(u64),
    Suspend(usize),
    Resume(usize),
    Delete(usize),
    SetPriority(usize, u64),
    Yield,
    MutexObtain(usize, u64),
    MutexRelease(usize),
    SemaphoreObtain(u64),
    SemaphoreRelease,
    Tick(u64),
    /// Continue on another processor
    Switch(usize),
    /// Let one processor act on its pending interrupt
    Interrupt(usize),
}

fn priority() -> impl Strategy<Value = u64> {
    1u64..20
}

fn algorithm() -> impl Strategy<Value = SchedulerAlgorithm> {
    prop_oneof![
        Just(SchedulerAlgorithm::PriorityBitmap),
        Just(SchedulerAlgorithm::Simple),
        Just(SchedulerAlgorithm::Edf),
        Just(SchedulerAlgorithm::PrioritySmp),
        Just(SchedulerAlgorithm::SimpleSmp),
        Just(SchedulerAlgorithm::EdfSmp),
    ]
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        3 => priority().prop_map(Op::Spawn),
        1 => any::<usize>().prop_map(Op::Suspend),
        1 => any::<usize>().prop_map(Op::Resume),
        1 => any::<usize>().prop_map(Op::Delete),
        1 => (any::<usize>(), priority()).prop_map(|(t, p)| Op::SetPriority(t, p)),
        1 => Just(Op::Yield),
        2 => (0usize..3, 0u64..4).prop_map(|(m, t)| Op::MutexObtain(m, t)),
        2 => (0usize..3).prop_map(Op::MutexRelease),
        1 => (0u64..4).prop_map(Op::SemaphoreObtain),
        1 => Just(Op::SemaphoreRelease),
        2 => (1u64..4).prop_map(Op::Tick),
        2 => (0usize..2).prop_map(Op::Switch),
        2 => (0usize..2).prop_map(Op::Interrupt),
    ]
}

fn pick(threads: &[ThreadId], index: usize) -> Option<ThreadId> {
    (!threads.is_empty()).then(|| threads[index % threads.len()])
}

fn timeout(ticks: u64) -> Timeout {
    match ticks {
        0 => Timeout::Forever,
        n => Timeout::Ticks(n),
    }
}

/// A kernel under random load, with the interrupts its processors have
/// not yet acted on
struct System {
    port: Arc<SimulatedPort>,
    kernel: Kernel,
    threads: Vec<ThreadId>,
    mutexes: Vec<MutexId>,
    semaphore: SemaphoreId,
    pending: BTreeSet<usize>,
    current: usize,
}

impl System {
    /// Uniprocessor algorithms get one processor, global ones two
    fn new(algorithm: SchedulerAlgorithm) -> Self {
        let (port, mut kernel) = if algorithm.is_uniprocessor() {
            with_config(Configuration::uniprocessor(algorithm), 1)
        } else {
            with_config(Configuration::smp(algorithm, 2), 2)
        };
        let inherit = MutexAttributes::new("M")
            .with_protocol(LockingProtocol::Inherit)
            .with_discipline(QueueDiscipline::Priority);
        let mutexes = (0..3)
            .map(|_| kernel.mutex_create(&inherit).unwrap())
            .collect();
        let semaphore = kernel
            .semaphore_create(&SemaphoreAttributes::new("S", 1).with_maximum(4))
            .unwrap();
        Self {
            port,
            kernel,
            threads: Vec::new(),
            mutexes,
            semaphore,
            pending: BTreeSet::new(),
            current: 0,
        }
    }

    /// Apply one operation; errors are part of normal operation here
    fn apply(&mut self, op: &Op) {
        let kernel = &mut self.kernel;
        match *op {
            Op::Spawn(priority) => {
                if kernel.thread_count() < 12 {
                    self.threads.push(spawn(kernel, "T", priority));
                }
            }
            Op::Suspend(t) => {
                if let Some(id) = pick(&self.threads, t) {
                    let _ = kernel.thread_suspend(id);
                }
            }
            Op::Resume(t) => {
                if let Some(id) = pick(&self.threads, t) {
                    let _ = kernel.thread_resume(id);
                }
            }
            Op::Delete(t) => {
                if let Some(id) = pick(&self.threads, t) {
                    let _ = kernel.thread_delete(id);
                }
            }
            Op::SetPriority(t, priority) => {
                if let Some(id) = pick(&self.threads, t) {
                    let _ = kernel.thread_set_priority(id, Some(Priority(priority)));
                }
            }
            Op::Yield => {
                let _ = kernel.thread_yield();
            }
            Op::MutexObtain(m, ticks) => {
                let _ = kernel.mutex_obtain(self.mutexes[m], timeout(ticks));
            }
            Op::MutexRelease(m) => {
                let _ = kernel.mutex_release(self.mutexes[m]);
            }
            Op::SemaphoreObtain(ticks) => {
                let _ = kernel.semaphore_obtain(self.semaphore, timeout(ticks));
            }
            Op::SemaphoreRelease => {
                let _ = kernel.semaphore_release(self.semaphore);
            }
            Op::Tick(ticks) => kernel.advance(ticks),
            Op::Switch(cpu) => {
                self.current = cpu % kernel.processor_count();
                self.port.set_current_processor(self.current);
            }
            Op::Interrupt(cpu) => {
                let cpu = cpu % kernel.processor_count();
                if self.pending.remove(&cpu) {
                    self.port.set_current_processor(cpu);
                    kernel.handle_inter_processor_interrupt();
                    self.port.set_current_processor(self.current);
                }
            }
        }
        self.pending.extend(self.port.take_interrupts());
    }

    /// No ready thread left out of the scheduled set may outrank the heir
    /// of a processor it is allowed to run on
    fn check_heirs(&self) -> Result<(), String> {
        let kernel = &self.kernel;
        let heirs: Vec<_> = (0..kernel.processor_count())
            .map(|cpu| kernel.heir_on(cpu))
            .collect();
        for &thread in &self.threads {
            let Ok(node) = kernel.scheduler_node(thread) else {
                continue;
            };
            if !is_ready(kernel, thread) || heirs.contains(&Some(thread)) {
                continue;
            }
            for (cpu, heir) in heirs.iter().enumerate() {
                let Some(heir) = *heir else {
                    return Err(format!("cpu{} has no heir", cpu));
                };
                if !node.affinity.contains(cpu) {
                    continue;
                }
                let heir_priority = kernel
                    .scheduler_node(heir)
                    .map_err(|status| format!("heir {}: {}", heir, status))?
                    .priority;
                if node.priority.is_higher_than(heir_priority) {
                    return Err(format!(
                        "{} at {:?} waits while cpu{} runs {} at {:?}",
                        thread, node.priority, cpu, heir, heir_priority
                    ));
                }
            }
        }
        Ok(())
    }
}

// ════════════════════════════════════════════════════════════
// Consistency
// ════════════════════════════════════════════════════════════

proptest! {
    #![proptest_config(ProptestConfig::with_cases(200))]

    /// Every directive leaves heirs, ready sets and queues consistent, and
    /// every processor's heir is among the best threads it may run
    #[test]
    fn random_directives_keep_kernel_consistent(
        algorithm in algorithm(),
        ops in prop::collection::vec(op(), 1..60),
    ) {
        let mut system = System::new(algorithm);

        for op in &ops {
            system.apply(op);
            if let Err(violation) = system.kernel.check_invariants() {
                prop_assert!(false, "{:?} after {:?}: {}", algorithm, op, violation);
            }
            if let Err(reason) = system.check_heirs() {
                prop_assert!(false, "{:?} after {:?}: {}", algorithm, op, reason);
            }
        }
    }
}

// ════════════════════════════════════════════════════════════
// Ready Order
// ════════════════════════════════════════════════════════════

proptest! {
    #![proptest_config(ProptestConfig::with_cases(100))]

    /// Threads of equal priority run in the order they became ready
    #[test]
    fn equal_priorities_run_fifo(count in 1usize..10, level in priority()) {
        let (_port, mut kernel) = uniprocessor();
        let threads = spawn_all(&mut kernel, &vec![level; count]);
        prop_assert_eq!(drain_by_suspending(&mut kernel, count), threads);
    }

    /// The execution order is a stable sort of the start order by priority
    #[test]
    fn order_is_stable_sort_by_priority(priorities in prop::collection::vec(1u64..6, 1..12)) {
        let (_port, mut kernel) = uniprocessor();
        let threads = spawn_all(&mut kernel, &priorities);

        let mut expected: Vec<(u64, ThreadId)> = priorities
            .iter()
            .copied()
            .zip(threads.iter().copied())
            .collect();
        expected.sort_by_key(|&(priority, _)| priority);
        let expected: Vec<ThreadId> = expected.into_iter().map(|(_, id)| id).collect();

        prop_assert_eq!(drain_by_suspending(&mut kernel, threads.len()), expected);
    }

    /// Raising a priority and restoring it keeps the thread's FIFO place
    #[test]
    fn priority_round_trip_keeps_place(
        count in 2usize..8,
        pick in any::<usize>(),
        boost in 1u64..10,
    ) {
        let (_port, mut kernel) = uniprocessor();
        let threads = spawn_all(&mut kernel, &vec![10; count]);
        let target = threads[pick % count];

        kernel.dispatch_disable();
        kernel
            .thread_set_priority(target, Some(Priority(boost)))
            .unwrap();
        kernel
            .thread_set_priority(target, Some(Priority(10)))
            .unwrap();
        kernel.dispatch_enable();

        prop_assert_eq!(drain_by_suspending(&mut kernel, count), threads);
    }
}

// ════════════════════════════════════════════════════════════
// Timeouts
// ════════════════════════════════════════════════════════════

proptest! {
    #![proptest_config(ProptestConfig::with_cases(100))]

    /// A wait ends exactly once, whether by release or by timeout
    #[test]
    fn timeout_and_release_deliver_one_outcome(timeout in 1u64..8, release in 1u64..8) {
        let (_port, mut kernel) = uniprocessor();
        let semaphore = kernel
            .semaphore_create(&SemaphoreAttributes::new("S", 0))
            .unwrap();
        let timer = kernel.timer_create("REL").unwrap();
        let t = spawn(&mut kernel, "T", 10);
        kernel
            .timer_fire_after(timer, release, TimerAction::ReleaseSemaphore(semaphore))
            .unwrap();
        kernel
            .semaphore_obtain(semaphore, Timeout::Ticks(timeout))
            .unwrap();

        kernel.advance(timeout.max(release));

        prop_assert!(is_ready(&kernel, t));
        let queued = kernel.waiters(QueueRef::Semaphore(semaphore)).unwrap();
        prop_assert!(queued.is_empty());
        prop_assert_eq!(kernel.pending_watchdogs(), 0);
        let count = kernel.semaphore(semaphore).unwrap().count();
        match kernel.thread_wait_status(t).unwrap() {
            Ok(()) => {
                prop_assert!(release <= timeout);
                prop_assert_eq!(count, 0);
            }
            Err(Status::Timeout) => {
                prop_assert!(timeout <= release);
                prop_assert_eq!(count, 1);
            }
            Err(other) => prop_assert!(false, "unexpected status {}", other),
        }
        assert_consistent(&kernel);
    }

    /// Deleted timers and threads leave no watchdog behind
    #[test]
    fn deletion_cancels_watchdogs(
        timers in prop::collection::vec((1u64..10, any::<bool>()), 0..8),
        sleepers in prop::collection::vec((1u64..10, any::<bool>()), 0..6),
    ) {
        let (_port, mut kernel) = uniprocessor();
        let semaphore = kernel
            .semaphore_create(&SemaphoreAttributes::new("S", 0).with_maximum(16))
            .unwrap();

        let mut kept_timers = 0;
        for &(ticks, keep) in &timers {
            let timer = kernel.timer_create("T").unwrap();
            kernel
                .timer_fire_after(timer, ticks, TimerAction::ReleaseSemaphore(semaphore))
                .unwrap();
            if keep {
                kept_timers += 1;
            } else {
                kernel.timer_delete(timer).unwrap();
            }
        }

        let mut kept_threads = Vec::new();
        let mut doomed = Vec::new();
        for &(ticks, keep) in &sleepers {
            let t = spawn(&mut kernel, "S", 10);
            kernel.thread_wake_after(ticks).unwrap();
            if keep {
                kept_threads.push(t);
            } else {
                doomed.push(t);
            }
        }
        for t in doomed {
            kernel.thread_delete(t).unwrap();
        }
        prop_assert_eq!(kernel.pending_watchdogs(), kept_timers + kept_threads.len());

        kernel.advance(10);
        prop_assert_eq!(kernel.pending_watchdogs(), 0);
        prop_assert_eq!(
            kernel.semaphore(semaphore).unwrap().count() as usize,
            kept_timers
        );
        for t in kept_threads {
            prop_assert!(is_ready(&kernel, t));
        }
    }
}
