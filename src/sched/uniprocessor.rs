//! Uniprocessor scheduler over any ready queue
//!
//! The executing thread stays in the ready set; the heir is simply the
//! first thread of the ready queue. A newly ready thread preempts only if
//! it is strictly more important than the current heir and the heir is
//! preemptible. Blocking or yielding the heir forces a new selection even
//! when the heir is not preemptible.

use super::{
    NodeAttributes, NodeState, NodeTable, PriorityMapping, ReadyQueue, Scheduler, SchedulerNode,
};
use crate::config::{SchedulerAlgorithm, SchedulerConfig};
use crate::error::{Result, Status};
use crate::kern::percpu::Processors;
use crate::kern::priority::Priority;
use crate::types::{ProcessorMask, ThreadIndex};

/// Scheduler instance owning exactly one processor
#[derive(Debug)]
pub struct Uniprocessor<Q: ReadyQueue> {
    name: &'static str,
    algorithm: SchedulerAlgorithm,
    processor: usize,
    maximum: Priority,
    mapping: PriorityMapping,
    ready: Q,
    nodes: NodeTable,
}

impl<Q: ReadyQueue> Uniprocessor<Q> {
    pub fn new(
        config: &SchedulerConfig,
        processor: usize,
        maximum: Priority,
        mapping: PriorityMapping,
        ready: Q,
        nodes: NodeTable,
    ) -> Self {
        Self {
            name: config.name,
            algorithm: config.algorithm,
            processor,
            maximum,
            mapping,
            ready,
            nodes,
        }
    }

    /// Install `new_heir` unless the current heir refuses preemption
    fn update_heir(&self, cpus: &mut Processors, new_heir: ThreadIndex, force: bool) {
        let heir = cpus.get(self.processor).heir();
        if heir == Some(new_heir) {
            return;
        }
        // A heir that blocked or left this instance is always replaced.
        let replaceable = heir
            .and_then(|h| self.nodes.get(h))
            .map_or(true, |node| {
                node.preemptible || node.state == NodeState::Blocked
            });
        if replaceable || force {
            cpus.update_heir(self.processor, new_heir);
        }
    }

    fn schedule_body(&self, cpus: &mut Processors, force: bool) {
        if let Some(first) = self.ready.first() {
            self.update_heir(cpus, first, force);
        }
    }

    fn insert_ready(&mut self, cpus: &mut Processors, thread: ThreadIndex, first: bool) {
        let sequence = if first {
            self.nodes.next_prepend()
        } else {
            self.nodes.next_append()
        };
        let node = self.nodes.node_mut(thread);
        if node.state != NodeState::Blocked {
            return;
        }
        node.sequence = sequence;
        node.state = NodeState::Ready;
        let priority = node.priority;
        self.ready.insert(thread, priority, sequence);

        let heir_priority = cpus
            .get(self.processor)
            .heir()
            .and_then(|h| self.nodes.get(h))
            .filter(|node| node.state != NodeState::Blocked)
            .map(|node| node.priority);
        match heir_priority {
            Some(heir) if !priority.is_higher_than(heir) => {}
            _ => self.update_heir(cpus, thread, false),
        }
    }
}

impl<Q: ReadyQueue> Scheduler for Uniprocessor<Q> {
    fn name(&self) -> &'static str {
        self.name
    }

    fn algorithm(&self) -> SchedulerAlgorithm {
        self.algorithm
    }

    fn processors(&self) -> ProcessorMask {
        ProcessorMask::single(self.processor)
    }

    fn maximum_priority(&self) -> Priority {
        self.maximum
    }

    fn mapping(&self) -> PriorityMapping {
        self.mapping
    }

    fn node_initialize(
        &mut self,
        thread: ThreadIndex,
        priority: Priority,
        attributes: NodeAttributes,
    ) {
        self.nodes.initialize(thread, priority, attributes);
    }

    fn node_destroy(&mut self, thread: ThreadIndex) {
        self.ready.extract(thread);
        self.nodes.destroy(thread);
    }

    fn node(&self, thread: ThreadIndex) -> Option<&SchedulerNode> {
        self.nodes.get(thread)
    }

    fn enqueue(&mut self, cpus: &mut Processors, thread: ThreadIndex) {
        self.insert_ready(cpus, thread, false);
    }

    fn enqueue_first(&mut self, cpus: &mut Processors, thread: ThreadIndex) {
        self.insert_ready(cpus, thread, true);
    }

    fn extract(&mut self, _cpus: &mut Processors, thread: ThreadIndex) {
        self.ready.extract(thread);
        self.nodes.node_mut(thread).state = NodeState::Blocked;
    }

    fn schedule(&mut self, cpus: &mut Processors) {
        self.schedule_body(cpus, false);
    }

    fn block(&mut self, cpus: &mut Processors, thread: ThreadIndex) {
        if self.nodes.node(thread).state == NodeState::Blocked {
            return;
        }
        self.extract(cpus, thread);
        let cpu = cpus.get(self.processor);
        if cpu.executing() == Some(thread) || cpu.heir() == Some(thread) {
            self.schedule_body(cpus, true);
        }
    }

    fn update_priority(&mut self, cpus: &mut Processors, thread: ThreadIndex, priority: Priority) {
        let node = self.nodes.node_mut(thread);
        node.priority = priority;
        if node.state == NodeState::Blocked {
            return;
        }
        let sequence = node.sequence;
        self.ready.extract(thread);
        self.ready.insert(thread, priority, sequence);
        self.schedule_body(cpus, false);
    }

    fn yield_thread(&mut self, cpus: &mut Processors, thread: ThreadIndex) {
        if self.nodes.node(thread).state == NodeState::Blocked {
            return;
        }
        let sequence = self.nodes.next_append();
        let node = self.nodes.node_mut(thread);
        node.sequence = sequence;
        let priority = node.priority;
        self.ready.extract(thread);
        self.ready.insert(thread, priority, sequence);
        self.schedule_body(cpus, true);
    }

    fn start_idle(&mut self, _cpus: &mut Processors, thread: ThreadIndex, processor: usize) {
        debug_assert_eq!(processor, self.processor);
        let sequence = self.nodes.next_append();
        let node = self.nodes.node_mut(thread);
        node.sequence = sequence;
        node.state = NodeState::Ready;
        let priority = node.priority;
        self.ready.insert(thread, priority, sequence);
    }

    fn set_preemptible(
        &mut self,
        cpus: &mut Processors,
        thread: ThreadIndex,
        preemptible: bool,
    ) -> Result<()> {
        self.nodes.node_mut(thread).preemptible = preemptible;
        if preemptible {
            self.schedule_body(cpus, false);
        }
        Ok(())
    }

    fn set_affinity(
        &mut self,
        _cpus: &mut Processors,
        thread: ThreadIndex,
        affinity: ProcessorMask,
    ) -> Result<()> {
        if !affinity.contains(self.processor) {
            return Err(Status::InvalidNumber);
        }
        self.nodes.node_mut(thread).affinity = affinity;
        Ok(())
    }

    fn ask_for_help(&self, cpus: &Processors, priority: Priority, affinity: ProcessorMask) -> bool {
        if !affinity.contains(self.processor) {
            return false;
        }
        let heir = cpus.get(self.processor).heir();
        match heir.and_then(|h| self.nodes.get(h)) {
            Some(heir) => heir.preemptible && priority.is_higher_than(heir.priority),
            None => true,
        }
    }

    fn is_scheduled(&self, cpus: &Processors, thread: ThreadIndex) -> bool {
        cpus.get(self.processor).heir() == Some(thread)
    }

    fn ready_count(&self) -> usize {
        self.ready.len()
    }
}
