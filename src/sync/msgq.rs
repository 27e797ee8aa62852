//! Message queues
//!
//! Bounded queues of fixed-capacity messages. A send to a queue with a
//! blocked receiver hands the message straight to that receiver; otherwise
//! the message is buffered. Senders never block: a full queue fails with
//! `TooMany`.

use alloc::collections::VecDeque;

use crate::error::{Result, Status};
use crate::kern::kernel::Kernel;
use crate::kern::thread::WaitPayload;
use crate::kern::threadq::{QueueDiscipline, QueueRef, ThreadQueue};
use crate::types::{MessageQueueId, Timeout};

/// Largest message any queue can carry
pub const MESSAGE_SIZE_MAX: usize = 64;

pub type Message = heapless::Vec<u8, MESSAGE_SIZE_MAX>;

/// Creation parameters of a message queue
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageQueueAttributes {
    pub name: &'static str,
    /// Messages buffered at most
    pub maximum_pending: usize,
    /// Largest message accepted, up to [`MESSAGE_SIZE_MAX`]
    pub maximum_size: usize,
    pub discipline: QueueDiscipline,
}

impl MessageQueueAttributes {
    pub const fn new(name: &'static str, maximum_pending: usize, maximum_size: usize) -> Self {
        Self {
            name,
            maximum_pending,
            maximum_size,
            discipline: QueueDiscipline::Fifo,
        }
    }

    pub const fn with_discipline(mut self, discipline: QueueDiscipline) -> Self {
        self.discipline = discipline;
        self
    }
}

/// Result of a receive for the calling thread
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReceiveOutcome {
    Message(Message),
    /// The caller blocked; the message is taken with
    /// [`Kernel::thread_take_message`] once it wakes
    Blocked,
}

#[derive(Debug)]
pub struct MessageQueue {
    name: &'static str,
    maximum_pending: usize,
    maximum_size: usize,
    pending: VecDeque<Message>,
    pub(crate) queue: ThreadQueue,
}

impl MessageQueue {
    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    pub fn maximum_pending(&self) -> usize {
        self.maximum_pending
    }

    pub fn maximum_size(&self) -> usize {
        self.maximum_size
    }

    /// Receivers blocked on the queue
    pub fn waiting(&self) -> usize {
        self.queue.len()
    }

    fn message(&self, buffer: &[u8]) -> Result<Message> {
        if buffer.len() > self.maximum_size {
            return Err(Status::InvalidSize);
        }
        Message::from_slice(buffer).map_err(|_| Status::InvalidSize)
    }
}

impl Kernel {
    pub fn message_queue_create(
        &mut self,
        attributes: &MessageQueueAttributes,
    ) -> Result<MessageQueueId> {
        if attributes.maximum_size == 0 || attributes.maximum_size > MESSAGE_SIZE_MAX {
            return Err(Status::InvalidSize);
        }
        if attributes.maximum_pending == 0 {
            return Err(Status::InvalidNumber);
        }
        let id = self.message_queues.allocate(MessageQueue {
            name: attributes.name,
            maximum_pending: attributes.maximum_pending,
            maximum_size: attributes.maximum_size,
            pending: VecDeque::with_capacity(attributes.maximum_pending),
            queue: ThreadQueue::new(attributes.discipline),
        })?;
        log::debug!(
            "message queue {} '{}' created ({} x {} bytes)",
            id,
            attributes.name,
            attributes.maximum_pending,
            attributes.maximum_size
        );
        Ok(id)
    }

    /// Delete a message queue; blocked receivers wake with
    /// `ObjectWasDeleted` and buffered messages are dropped
    pub fn message_queue_delete(&mut self, id: MessageQueueId) -> Result<()> {
        self.message_queues.lookup(id)?;
        self.directive(|k| {
            k.tq_flush(QueueRef::MessageQueue(id), Status::ObjectWasDeleted);
            k.message_queues.free(id);
        });
        log::debug!("message queue {} deleted", id);
        Ok(())
    }

    /// Append a message
    pub fn message_queue_send(&mut self, id: MessageQueueId, buffer: &[u8]) -> Result<()> {
        self.message_queue_submit(id, buffer, false)
    }

    /// Prepend a message, so it is received before every buffered one
    pub fn message_queue_urgent(&mut self, id: MessageQueueId, buffer: &[u8]) -> Result<()> {
        self.message_queue_submit(id, buffer, true)
    }

    fn message_queue_submit(
        &mut self,
        id: MessageQueueId,
        buffer: &[u8],
        urgent: bool) -> Result<()> {
        let message = self.message_queues.lookup(id)?.message(buffer)?;
        self.directive(|k| {
            if let Some(thread) = k.tq_dequeue(QueueRef::MessageQueue(id)) {
                let tcb = k.tcb_mut(thread);
                tcb.wait.status = Ok(());
                tcb.wait.payload = WaitPayload::Message(message);
                k.tq_unblock(thread);
                return Ok(());
            }
            let queue = k.message_queues.lookup_mut(id)?;
            if queue.pending.len() >= queue.maximum_pending {
                return Err(Status::TooMany);
            }
            if urgent {
                queue.pending.push_front(message);
            } else {
                queue.pending.push_back(message);
            }
            Ok(())
        })
    }

    /// Hand a copy of the message to every blocked receiver; nothing is
    /// buffered. Returns how many receivers got it.
    pub fn message_queue_broadcast(&mut self, id: MessageQueueId, buffer: &[u8]) -> Result<usize> {
        let message = self.message_queues.lookup(id)?.message(buffer)?;
        Ok(self.directive(|k| {
            let mut count = 0;
            while let Some(thread) = k.tq_dequeue(QueueRef::MessageQueue(id)) {
                let tcb = k.tcb_mut(thread);
                tcb.wait.status = Ok(());
                tcb.wait.payload = WaitPayload::Message(message.clone());
                k.tq_unblock(thread);
                count += 1;
            }
            count
        }))
    }

    pub fn message_queue_receive(
        &mut self,
        id: MessageQueueId,
        timeout: Timeout,
    ) -> Result<ReceiveOutcome> {
        let thread = self.calling_thread()?;
        let queue = self.message_queues.lookup_mut(id)?;
        if let Some(message) = queue.pending.pop_front() {
            return Ok(ReceiveOutcome::Message(message));
        }
        if timeout == Timeout::NoWait {
            return Err(Status::Unsatisfied);
        }
        self.directive(|k| k.tq_enqueue(thread, QueueRef::MessageQueue(id), timeout));
        Ok(ReceiveOutcome::Blocked)
    }

    /// Drop every buffered message; returns how many were dropped
    pub fn message_queue_flush(&mut self, id: MessageQueueId) -> Result<usize> {
        let queue = self.message_queues.lookup_mut(id)?;
        let count = queue.pending.len();
        queue.pending.clear();
        Ok(count)
    }

    pub fn message_queue(&self, id: MessageQueueId) -> Result<&MessageQueue> {
        self.message_queues.lookup(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn queue(maximum_size: usize) -> MessageQueue {
        MessageQueue {
            name: "q",
            maximum_pending: 2,
            maximum_size,
            pending: VecDeque::new(),
            queue: ThreadQueue::new(QueueDiscipline::Fifo),
        }
    }

    #[test]
    fn test_message_size_checked() {
        let q = queue(4);
        assert_eq!(q.message(b"abcd").unwrap().as_slice(), b"abcd");
        assert_eq!(q.message(b"abcde"), Err(Status::InvalidSize));
        assert!(q.message(b"").unwrap().is_empty());
    }

    #[test]
    fn test_message_capacity() {
        let q = queue(MESSAGE_SIZE_MAX);
        assert!(q.message(&[0u8; MESSAGE_SIZE_MAX]).is_ok());
        assert_eq!(
            q.message(&[0u8; MESSAGE_SIZE_MAX + 1]),
            Err(Status::InvalidSize)
        );
    }
}
