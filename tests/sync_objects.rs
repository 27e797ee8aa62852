//! Synchronization objects built on the thread queues
//!
//! Mutexes, counting semaphores, condition variables, message queues,
//! barriers and thread events, driven through their directives.

mod common;

use common::*;
use supercore::{
    BarrierRelease, EventCondition, EventOutcome, EventSet, LockingProtocol, MessageQueueAttributes,
    MutexAttributes, Priority, QueueDiscipline, QueueRef, ReceiveOutcome, SemaphoreAttributes,
    Status, Timeout, WaitOutcome,
};

// ════════════════════════════════════════════════════════════
// Mutexes
// ════════════════════════════════════════════════════════════

#[test]
fn test_mutex_create_rejects_bad_attributes() {
    let (_port, mut kernel) = uniprocessor();
    let fifo = MutexAttributes::new("M").with_discipline(QueueDiscipline::Fifo);
    assert_eq!(
        kernel.mutex_create(&fifo.with_protocol(LockingProtocol::Inherit)),
        Err(Status::NotDefined)
    );
    for ceiling in [0, 255] {
        let attributes =
            MutexAttributes::new("M").with_protocol(LockingProtocol::Ceiling(Priority(ceiling)));
        assert_eq!(
            kernel.mutex_create(&attributes),
            Err(Status::InvalidPriority)
        );
    }
    assert!(kernel.mutex_create(&fifo).is_ok());
}

#[test]
fn test_mutex_ownership_rules() {
    let (_port, mut kernel) = uniprocessor();
    let plain = kernel.mutex_create(&MutexAttributes::new("M")).unwrap();
    let recursive = kernel
        .mutex_create(&MutexAttributes::new("R").with_recursive(true))
        .unwrap();

    // Directives on behalf of a thread need one
    assert_eq!(
        kernel.mutex_obtain(plain, Timeout::Forever),
        Err(Status::IllegalOnThread)
    );

    let owner = spawn(&mut kernel, "OWN", 10);
    assert_eq!(
        kernel.mutex_obtain(plain, Timeout::Forever),
        Ok(WaitOutcome::Satisfied)
    );
    assert_eq!(
        kernel.mutex_obtain(plain, Timeout::Forever),
        Err(Status::Deadlock)
    );
    assert_eq!(kernel.mutex_delete(plain), Err(Status::ResourceInUse));
    assert_eq!(kernel.thread_delete(owner), Err(Status::ResourceInUse));

    kernel.mutex_obtain(recursive, Timeout::Forever).unwrap();
    kernel.mutex_obtain(recursive, Timeout::Forever).unwrap();
    assert_eq!(kernel.mutex(recursive).unwrap().nest_count(), 2);
    assert_eq!(kernel.thread(owner).unwrap().resource_count(), 2);
    kernel.mutex_release(recursive).unwrap();
    assert_eq!(kernel.mutex_owner(recursive), Ok(Some(owner)));
    kernel.mutex_release(recursive).unwrap();
    assert_eq!(kernel.mutex_owner(recursive), Ok(None));

    let other = spawn(&mut kernel, "OTH", 5);
    assert_running(&kernel, other);
    assert_eq!(kernel.mutex_release(plain), Err(Status::NotOwnerOfResource));
    assert_eq!(
        kernel.mutex_obtain(plain, Timeout::NoWait),
        Err(Status::Unsatisfied)
    );
    assert_consistent(&kernel);
}

#[test]
fn test_mutex_ceiling_boosts_owner() {
    let (_port, mut kernel) = uniprocessor();
    let ceiling = MutexAttributes::new("C").with_protocol(LockingProtocol::Ceiling(Priority(3)));
    let mutex = kernel.mutex_create(&ceiling).unwrap();
    let t = spawn(&mut kernel, "T", 10);
    kernel.mutex_obtain(mutex, Timeout::Forever).unwrap();
    assert_eq!(
        kernel.thread_get_priority(t),
        Ok((Priority(10), Priority(3)))
    );

    // A thread between the owner's real priority and the ceiling waits
    let middle = spawn(&mut kernel, "MID", 6);
    assert_running(&kernel, t);
    kernel.mutex_release(mutex).unwrap();
    assert_eq!(
        kernel.thread_get_priority(t),
        Ok((Priority(10), Priority(10)))
    );
    assert_running(&kernel, middle);

    let urgent = spawn(&mut kernel, "URG", 2);
    assert_running(&kernel, urgent);
    assert_eq!(
        kernel.mutex_obtain(mutex, Timeout::Forever),
        Err(Status::CeilingViolated)
    );
}

#[test]
fn test_mutex_deadlock_detected() {
    let (_port, mut kernel) = uniprocessor();
    let inherit = MutexAttributes::new("M").with_protocol(LockingProtocol::Inherit);
    let first = kernel.mutex_create(&inherit).unwrap();
    let second = kernel.mutex_create(&inherit).unwrap();

    let a = spawn(&mut kernel, "A", 10);
    kernel.mutex_obtain(first, Timeout::Forever).unwrap();
    let b = spawn(&mut kernel, "B", 5);
    kernel.mutex_obtain(second, Timeout::Forever).unwrap();
    kernel.thread_wake_after(5).unwrap();

    assert_running(&kernel, a);
    assert_eq!(
        kernel.mutex_obtain(second, Timeout::Forever),
        Ok(WaitOutcome::Blocked)
    );
    kernel.advance(5);
    assert_running(&kernel, b);
    assert_eq!(
        kernel.mutex_obtain(first, Timeout::Forever),
        Err(Status::Deadlock)
    );
    assert_consistent(&kernel);
}

#[test]
fn test_mutex_waiters_ordered_by_priority() {
    let (_port, mut kernel) = uniprocessor();
    let mutex = kernel.mutex_create(&MutexAttributes::new("M")).unwrap();
    let owner = spawn(&mut kernel, "OWN", 1);
    kernel.mutex_obtain(mutex, Timeout::Forever).unwrap();
    kernel.thread_suspend(owner).unwrap();

    let low = spawn(&mut kernel, "LOW", 20);
    kernel.mutex_obtain(mutex, Timeout::Forever).unwrap();
    let high = spawn(&mut kernel, "HIGH", 10);
    kernel.mutex_obtain(mutex, Timeout::Forever).unwrap();
    assert_eq!(kernel.waiters(QueueRef::Mutex(mutex)).unwrap(), [high, low]);

    kernel.thread_resume(owner).unwrap();
    kernel.mutex_release(mutex).unwrap();
    assert_eq!(kernel.mutex_owner(mutex), Ok(Some(high)));
    assert_eq!(kernel.waiters(QueueRef::Mutex(mutex)).unwrap(), [low]);
}

// ════════════════════════════════════════════════════════════
// Semaphores
// ════════════════════════════════════════════════════════════

#[test]
fn test_semaphore_counting() {
    let (_port, mut kernel) = uniprocessor();
    assert_eq!(
        kernel.semaphore_create(&SemaphoreAttributes::new("S", 3).with_maximum(2)),
        Err(Status::InvalidNumber)
    );
    let semaphore = kernel
        .semaphore_create(&SemaphoreAttributes::new("S", 1).with_maximum(2))
        .unwrap();
    spawn(&mut kernel, "T", 10);

    assert_eq!(
        kernel.semaphore_obtain(semaphore, Timeout::NoWait),
        Ok(WaitOutcome::Satisfied)
    );
    assert_eq!(
        kernel.semaphore_obtain(semaphore, Timeout::NoWait),
        Err(Status::Unsatisfied)
    );
    kernel.semaphore_release(semaphore).unwrap();
    kernel.semaphore_release(semaphore).unwrap();
    assert_eq!(
        kernel.semaphore_release(semaphore),
        Err(Status::Unsatisfied)
    );
    assert_eq!(kernel.semaphore(semaphore).unwrap().count(), 2);
}

#[test]
fn test_semaphore_priority_discipline() {
    let (_port, mut kernel) = uniprocessor();
    let attributes = SemaphoreAttributes::new("S", 0).with_discipline(QueueDiscipline::Priority);
    let semaphore = kernel.semaphore_create(&attributes).unwrap();
    let mut waiters = Vec::new();
    for priority in [30, 10, 20, 10] {
        waiters.push(spawn(&mut kernel, "W", priority));
        kernel
            .semaphore_obtain(semaphore, Timeout::Forever)
            .unwrap();
    }
    let expected = vec![waiters[1], waiters[3], waiters[2], waiters[0]];
    assert_eq!(
        kernel.waiters(QueueRef::Semaphore(semaphore)).unwrap(),
        expected
    );

    for &next in &expected {
        kernel.semaphore_release(semaphore).unwrap();
        assert!(is_ready(&kernel, next));
    }
}

#[test]
fn test_stale_id_rejected() {
    let (_port, mut kernel) = uniprocessor();
    let old = kernel
        .semaphore_create(&SemaphoreAttributes::new("S", 0))
        .unwrap();
    kernel.semaphore_delete(old).unwrap();
    let new = kernel
        .semaphore_create(&SemaphoreAttributes::new("S", 0))
        .unwrap();
    assert_ne!(old, new);
    assert_eq!(kernel.semaphore_release(old), Err(Status::InvalidId));
    assert!(kernel.semaphore(new).is_ok());
}

// ════════════════════════════════════════════════════════════
// Condition variables
// ════════════════════════════════════════════════════════════

#[test]
fn test_condvar_signal_moves_waiter_to_mutex() {
    let (_port, mut kernel) = uniprocessor();
    let mutex = kernel.mutex_create(&MutexAttributes::new("M")).unwrap();
    let condvar = kernel
        .condvar_create("CV", QueueDiscipline::Priority)
        .unwrap();

    let waiter = spawn(&mut kernel, "W", 10);
    kernel.mutex_obtain(mutex, Timeout::Forever).unwrap();
    assert_eq!(
        kernel.condvar_wait(condvar, mutex, Timeout::Forever),
        Ok(WaitOutcome::Blocked)
    );
    assert_eq!(kernel.mutex_owner(mutex), Ok(None));
    assert_eq!(kernel.condvar(condvar).unwrap().mutex(), Some(mutex));

    let signaller = spawn(&mut kernel, "SIG", 5);
    kernel.mutex_obtain(mutex, Timeout::Forever).unwrap();
    kernel.condvar_signal(condvar).unwrap();

    // Still blocked, now on the mutex
    assert!(!is_ready(&kernel, waiter));
    assert_eq!(kernel.condvar(condvar).unwrap().waiting(), 0);
    assert_eq!(kernel.condvar(condvar).unwrap().mutex(), None);
    assert_eq!(kernel.waiters(QueueRef::Mutex(mutex)).unwrap(), [waiter]);
    assert_consistent(&kernel);

    kernel.mutex_release(mutex).unwrap();
    assert_eq!(kernel.mutex_owner(mutex), Ok(Some(waiter)));
    assert_eq!(kernel.thread_wait_status(waiter), Ok(Ok(())));
    assert_running(&kernel, signaller);
    assert_consistent(&kernel);
}

#[test]
fn test_condvar_timeout_reported_after_reacquire() {
    let (_port, mut kernel) = uniprocessor();
    let mutex = kernel.mutex_create(&MutexAttributes::new("M")).unwrap();
    let condvar = kernel.condvar_create("CV", QueueDiscipline::Fifo).unwrap();

    let waiter = spawn(&mut kernel, "W", 10);
    kernel.mutex_obtain(mutex, Timeout::Forever).unwrap();
    kernel
        .condvar_wait(condvar, mutex, Timeout::Ticks(5))
        .unwrap();

    let holder = spawn(&mut kernel, "HOLD", 5);
    kernel.mutex_obtain(mutex, Timeout::Forever).unwrap();
    kernel.advance(5);
    assert_running(&kernel, holder);
    assert_eq!(kernel.waiters(QueueRef::Mutex(mutex)).unwrap(), [waiter]);

    kernel.mutex_release(mutex).unwrap();
    assert_eq!(kernel.mutex_owner(mutex), Ok(Some(waiter)));
    assert_eq!(kernel.thread_wait_status(waiter), Ok(Err(Status::Timeout)));
}

#[test]
fn test_condvar_broadcast_with_free_mutex() {
    let (_port, mut kernel) = uniprocessor();
    let mutex = kernel.mutex_create(&MutexAttributes::new("M")).unwrap();
    let condvar = kernel.condvar_create("CV", QueueDiscipline::Fifo).unwrap();
    let mut waiters = Vec::new();
    for _ in 0..3 {
        waiters.push(spawn(&mut kernel, "W", 10));
        kernel.mutex_obtain(mutex, Timeout::Forever).unwrap();
        kernel
            .condvar_wait(condvar, mutex, Timeout::Forever)
            .unwrap();
    }
    assert_eq!(kernel.condvar_delete(condvar), Err(Status::ResourceInUse));

    // The first waiter gets the free mutex, the others queue on it
    assert_eq!(kernel.condvar_broadcast(condvar), Ok(3));
    assert_eq!(kernel.mutex_owner(mutex), Ok(Some(waiters[0])));
    assert_eq!(
        kernel.waiters(QueueRef::Mutex(mutex)).unwrap(),
        &waiters[1..]
    );
    assert_running(&kernel, waiters[0]);
    assert_consistent(&kernel);

    kernel.mutex_release(mutex).unwrap();
    assert_eq!(kernel.mutex_owner(mutex), Ok(Some(waiters[1])));
    assert!(kernel.condvar_delete(condvar).is_ok());
}

#[test]
fn test_condvar_wait_checks_mutex() {
    let (_port, mut kernel) = uniprocessor();
    let first = kernel.mutex_create(&MutexAttributes::new("M1")).unwrap();
    let second = kernel.mutex_create(&MutexAttributes::new("M2")).unwrap();
    let condvar = kernel.condvar_create("CV", QueueDiscipline::Fifo).unwrap();

    spawn(&mut kernel, "A", 10);
    assert_eq!(
        kernel.condvar_wait(condvar, first, Timeout::Forever),
        Err(Status::NotOwnerOfResource)
    );
    kernel.mutex_obtain(first, Timeout::Forever).unwrap();
    assert_eq!(
        kernel.condvar_wait(condvar, first, Timeout::NoWait),
        Err(Status::Unsatisfied)
    );
    kernel
        .condvar_wait(condvar, first, Timeout::Forever)
        .unwrap();

    spawn(&mut kernel, "B", 10);
    kernel.mutex_obtain(second, Timeout::Forever).unwrap();
    assert_eq!(
        kernel.condvar_wait(condvar, second, Timeout::Forever),
        Err(Status::IncorrectState)
    );
}

// ════════════════════════════════════════════════════════════
// Message queues
// ════════════════════════════════════════════════════════════

fn received(outcome: supercore::Result<ReceiveOutcome>) -> Vec<u8> {
    match outcome {
        Ok(ReceiveOutcome::Message(message)) => message.to_vec(),
        other => panic!("expected a message, got {:?}", other),
    }
}

#[test]
fn test_message_queue_buffers_in_order() {
    let (_port, mut kernel) = uniprocessor();
    assert_eq!(
        kernel.message_queue_create(&MessageQueueAttributes::new("Q", 2, 65)),
        Err(Status::InvalidSize)
    );
    let queue = kernel
        .message_queue_create(&MessageQueueAttributes::new("Q", 3, 8))
        .unwrap();
    spawn(&mut kernel, "R", 10);

    kernel.message_queue_send(queue, b"one").unwrap();
    kernel.message_queue_send(queue, b"two").unwrap();
    kernel.message_queue_urgent(queue, b"now").unwrap();
    assert_eq!(
        kernel.message_queue_send(queue, b"four"),
        Err(Status::TooMany)
    );
    assert_eq!(
        kernel.message_queue_send(queue, b"too long!"),
        Err(Status::InvalidSize)
    );

    assert_eq!(
        received(kernel.message_queue_receive(queue, Timeout::NoWait)),
        b"now"
    );
    assert_eq!(
        received(kernel.message_queue_receive(queue, Timeout::NoWait)),
        b"one"
    );
    assert_eq!(kernel.message_queue_flush(queue), Ok(1));
    assert_eq!(
        kernel.message_queue_receive(queue, Timeout::NoWait),
        Err(Status::Unsatisfied)
    );
}

#[test]
fn test_message_handed_to_blocked_receiver() {
    let (_port, mut kernel) = uniprocessor();
    let queue = kernel
        .message_queue_create(&MessageQueueAttributes::new("Q", 1, 16))
        .unwrap();
    let receiver = spawn(&mut kernel, "R", 10);
    assert_eq!(
        kernel.message_queue_receive(queue, Timeout::Forever),
        Ok(ReceiveOutcome::Blocked)
    );

    kernel.message_queue_send(queue, b"hello").unwrap();
    assert_eq!(kernel.message_queue(queue).unwrap().pending(), 0);
    assert_running(&kernel, receiver);
    let message = kernel.thread_take_message(receiver).unwrap().unwrap();
    assert_eq!(message.as_slice(), b"hello");
    assert_eq!(kernel.thread_take_message(receiver), Ok(None));
}

#[test]
fn test_message_broadcast_reaches_every_receiver() {
    let (_port, mut kernel) = uniprocessor();
    let queue = kernel
        .message_queue_create(&MessageQueueAttributes::new("Q", 1, 16))
        .unwrap();
    let receivers: Vec<_> = (0..2)
        .map(|_| {
            let t = spawn(&mut kernel, "R", 10);
            kernel
                .message_queue_receive(queue, Timeout::Forever)
                .unwrap();
            t
        })
        .collect();

    assert_eq!(kernel.message_queue_broadcast(queue, b"all"), Ok(2));
    for receiver in receivers {
        let message = kernel.thread_take_message(receiver).unwrap().unwrap();
        assert_eq!(message.as_slice(), b"all");
    }
    assert_eq!(kernel.message_queue_broadcast(queue, b"none"), Ok(0));
    assert_eq!(kernel.message_queue(queue).unwrap().pending(), 0);
}

#[test]
fn test_message_queue_delete_wakes_receiver() {
    let (_port, mut kernel) = uniprocessor();
    let queue = kernel
        .message_queue_create(&MessageQueueAttributes::new("Q", 1, 16))
        .unwrap();
    let receiver = spawn(&mut kernel, "R", 10);
    kernel
        .message_queue_receive(queue, Timeout::Forever)
        .unwrap();
    kernel.message_queue_delete(queue).unwrap();
    assert_eq!(
        kernel.thread_wait_status(receiver),
        Ok(Err(Status::ObjectWasDeleted))
    );
    assert_eq!(kernel.thread_take_message(receiver), Ok(None));
}

// ════════════════════════════════════════════════════════════
// Barriers
// ════════════════════════════════════════════════════════════

#[test]
fn test_automatic_barrier() {
    let (_port, mut kernel) = uniprocessor();
    assert_eq!(
        kernel.barrier_create("B", BarrierRelease::Automatic(0)),
        Err(Status::InvalidNumber)
    );
    let barrier = kernel
        .barrier_create("B", BarrierRelease::Automatic(3))
        .unwrap();

    let first = spawn(&mut kernel, "A", 10);
    assert_eq!(
        kernel.barrier_wait(barrier, Timeout::Forever),
        Ok(WaitOutcome::Blocked)
    );
    let second = spawn(&mut kernel, "B", 11);
    assert_eq!(
        kernel.barrier_wait(barrier, Timeout::Forever),
        Ok(WaitOutcome::Blocked)
    );
    assert_eq!(kernel.barrier(barrier).unwrap().waiting(), 2);

    spawn(&mut kernel, "C", 12);
    assert_eq!(
        kernel.barrier_wait(barrier, Timeout::Forever),
        Ok(WaitOutcome::Satisfied)
    );
    assert_eq!(kernel.barrier(barrier).unwrap().waiting(), 0);
    assert!(is_ready(&kernel, second));
    assert_running(&kernel, first);
    assert_consistent(&kernel);
}

#[test]
fn test_manual_barrier() {
    let (_port, mut kernel) = uniprocessor();
    let barrier = kernel.barrier_create("B", BarrierRelease::Manual).unwrap();
    let waiter = spawn(&mut kernel, "W", 10);
    assert_eq!(
        kernel.barrier_wait(barrier, Timeout::NoWait),
        Err(Status::Unsatisfied)
    );
    kernel.barrier_wait(barrier, Timeout::Forever).unwrap();
    assert_eq!(kernel.barrier_release(barrier), Ok(1));
    assert_eq!(kernel.thread_wait_status(waiter), Ok(Ok(())));
    assert_eq!(kernel.barrier_release(barrier), Ok(0));
}

// ════════════════════════════════════════════════════════════
// Events
// ════════════════════════════════════════════════════════════

#[test]
fn test_events_all_condition_blocks_until_complete() {
    let (_port, mut kernel) = uniprocessor();
    let receiver = spawn(&mut kernel, "R", 10);
    let wanted = EventSet::event(1) | EventSet::event(2);
    assert_eq!(
        kernel.event_receive(wanted, EventCondition::All, Timeout::Forever),
        Ok(EventOutcome::Blocked)
    );

    kernel.event_send(receiver, EventSet::event(1)).unwrap();
    assert!(!is_ready(&kernel, receiver));
    kernel
        .event_send(receiver, EventSet::event(2) | EventSet::event(7))
        .unwrap();
    assert_running(&kernel, receiver);
    assert_eq!(kernel.thread_take_events(receiver), Ok(wanted));

    // Unwanted events stay pending
    assert_eq!(
        kernel.event_receive(EventSet::empty(), EventCondition::All, Timeout::NoWait),
        Ok(EventOutcome::Received(EventSet::event(7)))
    );
}

#[test]
fn test_events_any_condition() {
    let (_port, mut kernel) = uniprocessor();
    let receiver = spawn(&mut kernel, "R", 10);
    let wanted = EventSet::event(3) | EventSet::event(4);
    assert_eq!(
        kernel.event_receive(wanted, EventCondition::Any, Timeout::NoWait),
        Err(Status::Unsatisfied)
    );
    kernel.event_send(receiver, EventSet::event(4)).unwrap();
    assert_eq!(
        kernel.event_receive(wanted, EventCondition::Any, Timeout::NoWait),
        Ok(EventOutcome::Received(EventSet::event(4)))
    );
    assert!(kernel.thread(receiver).unwrap().pending_events().is_empty());
}

#[test]
fn test_event_receive_times_out() {
    let (_port, mut kernel) = uniprocessor();
    let receiver = spawn(&mut kernel, "R", 10);
    kernel
        .event_receive(EventSet::event(0), EventCondition::All, Timeout::Ticks(3))
        .unwrap();
    kernel.advance(3);
    assert_running(&kernel, receiver);
    assert_eq!(
        kernel.thread_wait_status(receiver),
        Ok(Err(Status::Timeout))
    );

    // A late send only leaves the event pending
    kernel.event_send(receiver, EventSet::event(0)).unwrap();
    assert_eq!(
        kernel.thread(receiver).unwrap().pending_events(),
        EventSet::event(0)
    );
}
