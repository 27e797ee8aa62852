//! Shared helpers for the integration tests
//!
//! Every test drives a [`Kernel`] over a [`SimulatedPort`]. A directive
//! acting "for the calling thread" runs on behalf of whichever thread the
//! current processor executes, so helpers that need a specific caller check
//! that it is executing first.

#![allow(dead_code)]

use std::sync::Arc;

use supercore::{
    Configuration, Kernel, SchedulerAlgorithm, SimulatedPort, ThreadAttributes, ThreadEntry,
    ThreadId,
};

/// Uniprocessor kernel with a bitmap priority scheduler
pub fn uniprocessor() -> (Arc<SimulatedPort>, Kernel) {
    let config = Configuration::uniprocessor(SchedulerAlgorithm::PriorityBitmap);
    with_config(config, 1)
}

/// Kernel for `config` on a simulated port with `processors` processors
pub fn with_config(config: Configuration, processors: usize) -> (Arc<SimulatedPort>, Kernel) {
    let port = Arc::new(SimulatedPort::new(processors));
    let kernel = Kernel::new(config, port.clone()).expect("kernel initialization failed");
    (port, kernel)
}

/// Create and start a thread at `priority`
pub fn spawn(kernel: &mut Kernel, name: &'static str, priority: u64) -> ThreadId {
    let id = kernel
        .thread_create(&ThreadAttributes::new(name, priority))
        .expect("thread create failed");
    kernel
        .thread_start(id, ThreadEntry::default())
        .expect("thread start failed");
    id
}

/// Start several threads with dispatching disabled, so they all become
/// ready before the processor picks one
pub fn spawn_all(kernel: &mut Kernel, priorities: &[u64]) -> Vec<ThreadId> {
    kernel.dispatch_disable();
    let threads = priorities
        .iter()
        .map(|&priority| spawn(kernel, "T", priority))
        .collect();
    kernel.dispatch_enable();
    threads
}

/// Assert that `thread` is executing on the current processor
pub fn assert_running(kernel: &Kernel, thread: ThreadId) {
    assert_eq!(
        kernel.executing(),
        Some(thread),
        "expected {} to execute",
        thread
    );
}

/// Let every thread suspend itself in turn and record the execution order
pub fn drain_by_suspending(kernel: &mut Kernel, count: usize) -> Vec<ThreadId> {
    let mut order = Vec::with_capacity(count);
    for _ in 0..count {
        let running = kernel.executing().expect("no executing thread");
        order.push(running);
        kernel.thread_suspend(running).expect("suspend failed");
    }
    order
}

/// Whether `thread` has no blocking reason left
pub fn is_ready(kernel: &Kernel, thread: ThreadId) -> bool {
    kernel.thread(thread).is_ok_and(|tcb| tcb.is_ready())
}

pub fn assert_consistent(kernel: &Kernel) {
    if let Err(violation) = kernel.check_invariants() {
        panic!("kernel invariant broken: {}", violation);
    }
}
