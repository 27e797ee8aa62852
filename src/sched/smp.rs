//! Global SMP scheduler
//!
//! One instance drives several processors. Its threads are split in two
//! sets:
//!
//! - the *scheduled* chain: one thread per owned processor, ordered by
//!   `(priority, sequence)` so the least important scheduled thread is at
//!   the tail;
//! - the *ready* queue: every other ready thread.
//!
//! Idle threads are ordinary nodes pinned to their processor at the lowest
//! priority, so a processor always has a candidate and the ready queue is
//! never empty while a processor needs a thread.
//!
//! After every operation the instance rebalances: as long as some ready
//! thread outranks the least important scheduled thread on a processor in
//! its affinity, the two trade places. Each trade updates exactly one
//! processor's heir, and no thread is ever scheduled on two processors.

use alloc::vec;
use alloc::vec::Vec;

use super::{
    NodeAttributes, NodeState, NodeTable, PriorityMapping, ReadyQueue, Scheduler, SchedulerNode,
};
use crate::config::{SchedulerAlgorithm, SchedulerConfig};
use crate::error::{Result, Status};
use crate::kern::chain::{Chain, ChainNode};
use crate::kern::percpu::Processors;
use crate::kern::priority::Priority;
use crate::types::{ProcessorMask, ThreadIndex};

/// Global fixed-priority (or EDF) scheduler for a processor set
#[derive(Debug)]
pub struct Smp<Q: ReadyQueue> {
    name: &'static str,
    algorithm: SchedulerAlgorithm,
    processors: ProcessorMask,
    maximum: Priority,
    mapping: PriorityMapping,
    ready: Q,
    scheduled: Chain,
    links: Vec<ChainNode>,
    nodes: NodeTable,
}

/// Least important scheduled thread running on a processor in `affinity`
fn lowest_scheduled(
    scheduled: &Chain,
    links: &[ChainNode],
    nodes: &NodeTable,
    affinity: ProcessorMask,
) -> Option<ThreadIndex> {
    let mut cursor = scheduled.last();
    while let Some(thread) = cursor {
        let processor = nodes.node(thread).processor;
        if processor.is_some_and(|p| affinity.contains(p)) {
            return Some(thread);
        }
        cursor = links[thread].prev();
    }
    None
}

impl<Q: ReadyQueue> Smp<Q> {
    pub fn new(
        config: &SchedulerConfig,
        maximum: Priority,
        mapping: PriorityMapping,
        ready: Q,
        nodes: NodeTable,
    ) -> Self {
        Self {
            name: config.name,
            algorithm: config.algorithm,
            processors: config.processors,
            maximum,
            mapping,
            ready,
            scheduled: Chain::new(),
            links: vec![ChainNode::new(); nodes.capacity()],
            nodes,
        }
    }

    fn insert_scheduled(&mut self, thread: ThreadIndex) {
        if thread >= self.links.len() {
            self.links.resize(thread + 1, ChainNode::new());
        }
        let nodes = &self.nodes;
        self.scheduled
            .insert_ordered(&mut self.links, thread, |a, b| nodes.key(a) < nodes.key(b));
    }

    /// Give `processor` to `thread`, which must not be in either set
    fn schedule_on(&mut self, cpus: &mut Processors, thread: ThreadIndex, processor: usize) {
        let node = self.nodes.node_mut(thread);
        node.state = NodeState::Scheduled;
        node.processor = Some(processor);
        self.insert_scheduled(thread);
        cpus.update_heir(processor, thread);
    }

    /// Take the processor away from a scheduled thread and return it
    fn unschedule(&mut self, thread: ThreadIndex) -> Option<usize> {
        self.scheduled.extract(&mut self.links, thread);
        let node = self.nodes.node_mut(thread);
        node.state = NodeState::Blocked;
        node.processor.take()
    }

    fn make_ready(&mut self, thread: ThreadIndex) {
        let node = self.nodes.node_mut(thread);
        node.state = NodeState::Ready;
        let (priority, sequence) = node.key();
        self.ready.insert(thread, priority, sequence);
    }

    /// Hand `processor` to the best ready thread allowed on it
    fn fill(&mut self, cpus: &mut Processors, processor: usize) {
        let nodes = &self.nodes;
        let candidate = self
            .ready
            .first_matching(&mut |t| nodes.node(t).affinity.contains(processor));
        match candidate {
            Some(thread) => {
                self.ready.extract(thread);
                self.schedule_on(cpus, thread, processor);
            }
            None => log::warn!("{}: no ready thread for cpu{}", self.name, processor),
        }
    }

    /// Trade places until no ready thread outranks a scheduled one it may
    /// replace
    fn rebalance(&mut self, cpus: &mut Processors) {
        loop {
            let trade = {
                let Self {
                    ready,
                    scheduled,
                    links,
                    nodes,
                    processors,
                    ..
                } = &*self;
                let victim_for = |thread: ThreadIndex| {
                    let node = nodes.node(thread);
                    let affinity = node.affinity.intersection(*processors);
                    lowest_scheduled(scheduled, links, nodes, affinity)
                        .filter(|victim| node.key() < nodes.key(*victim))
                };
                ready
                    .first_matching(&mut |t| victim_for(t).is_some())
                    .and_then(|t| victim_for(t).map(|victim| (t, victim)))
            };
            let Some((thread, victim)) = trade else { break };
            let Some(processor) = self.unschedule(victim) else { break };
            log::trace!(
                "{}: thread {} preempts {} on cpu{}",
                self.name,
                thread,
                victim,
                processor
            );
            self.make_ready(victim);
            self.ready.extract(thread);
            self.schedule_on(cpus, thread, processor);
        }
    }

    fn enqueue_with(&mut self, cpus: &mut Processors, thread: ThreadIndex, first: bool) {
        if self.nodes.node(thread).state != NodeState::Blocked {
            return;
        }
        let sequence = if first {
            self.nodes.next_prepend()
        } else {
            self.nodes.next_append()
        };
        self.nodes.node_mut(thread).sequence = sequence;
        self.make_ready(thread);
        self.rebalance(cpus);
    }
}

impl<Q: ReadyQueue> Scheduler for Smp<Q> {
    fn name(&self) -> &'static str {
        self.name
    }

    fn algorithm(&self) -> SchedulerAlgorithm {
        self.algorithm
    }

    fn processors(&self) -> ProcessorMask {
        self.processors
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
        if let Some(node) = self.nodes.get(thread) {
            debug_assert_eq!(node.state, NodeState::Blocked, "destroying a ready node");
        }
        self.ready.extract(thread);
        self.nodes.destroy(thread);
    }

    fn node(&self, thread: ThreadIndex) -> Option<&SchedulerNode> {
        self.nodes.get(thread)
    }

    fn enqueue(&mut self, cpus: &mut Processors, thread: ThreadIndex) {
        self.enqueue_with(cpus, thread, false);
    }

    fn enqueue_first(&mut self, cpus: &mut Processors, thread: ThreadIndex) {
        self.enqueue_with(cpus, thread, true);
    }

    fn extract(&mut self, cpus: &mut Processors, thread: ThreadIndex) {
        self.block(cpus, thread);
    }

    fn schedule(&mut self, cpus: &mut Processors) {
        self.rebalance(cpus);
    }

    fn block(&mut self, cpus: &mut Processors, thread: ThreadIndex) {
        match self.nodes.node(thread).state {
            NodeState::Scheduled => {
                if let Some(processor) = self.unschedule(thread) {
                    self.fill(cpus, processor);
                }
            }
            NodeState::Ready => {
                self.ready.extract(thread);
                self.nodes.node_mut(thread).state = NodeState::Blocked;
            }
            NodeState::Blocked => return,
        }
        self.rebalance(cpus);
    }

    fn update_priority(&mut self, cpus: &mut Processors, thread: ThreadIndex, priority: Priority) {
        let state = self.nodes.node(thread).state;
        match state {
            NodeState::Blocked => {
                self.nodes.node_mut(thread).priority = priority;
                return;
            }
            NodeState::Ready => {
                self.ready.extract(thread);
                self.nodes.node_mut(thread).priority = priority;
                self.make_ready(thread);
            }
            NodeState::Scheduled => {
                self.scheduled.extract(&mut self.links, thread);
                self.nodes.node_mut(thread).priority = priority;
                self.insert_scheduled(thread);
            }
        }
        self.rebalance(cpus);
    }

    fn yield_thread(&mut self, cpus: &mut Processors, thread: ThreadIndex) {
        let state = self.nodes.node(thread).state;
        if state == NodeState::Blocked {
            return;
        }
        let sequence = self.nodes.next_append();
        match state {
            NodeState::Scheduled => {
                let processor = self.unschedule(thread);
                self.nodes.node_mut(thread).sequence = sequence;
                self.make_ready(thread);
                if let Some(processor) = processor {
                    self.fill(cpus, processor);
                }
            }
            _ => {
                self.ready.extract(thread);
                self.nodes.node_mut(thread).sequence = sequence;
                self.make_ready(thread);
            }
        }
        self.rebalance(cpus);
    }

    fn start_idle(&mut self, _cpus: &mut Processors, thread: ThreadIndex, processor: usize) {
        let sequence = self.nodes.next_append();
        let node = self.nodes.node_mut(thread);
        node.sequence = sequence;
        node.state = NodeState::Scheduled;
        node.processor = Some(processor);
        self.insert_scheduled(thread);
    }

    fn set_preemptible(
        &mut self,
        _cpus: &mut Processors,
        thread: ThreadIndex,
        preemptible: bool,
    ) -> Result<()> {
        // Non-preemptible threads are not supported across processors.
        if !preemptible {
            return Err(Status::NotDefined);
        }
        self.nodes.node_mut(thread).preemptible = true;
        Ok(())
    }

    fn set_affinity(
        &mut self,
        cpus: &mut Processors,
        thread: ThreadIndex,
        affinity: ProcessorMask,
    ) -> Result<()> {
        if affinity.intersection(self.processors).is_empty() {
            return Err(Status::InvalidNumber);
        }
        let node = self.nodes.node_mut(thread);
        node.affinity = affinity;
        let evicted = match (node.state, node.processor) {
            (NodeState::Scheduled, Some(p)) if !affinity.contains(p) => Some(p),
            _ => None,
        };
        if let Some(processor) = evicted {
            self.unschedule(thread);
            self.make_ready(thread);
            self.fill(cpus, processor);
        }
        self.rebalance(cpus);
        Ok(())
    }

    fn ask_for_help(
        &self,
        _cpus: &Processors,
        priority: Priority,
        affinity: ProcessorMask,
    ) -> bool {
        lowest_scheduled(
            &self.scheduled,
            &self.links,
            &self.nodes,
            affinity.intersection(self.processors),
        )
        .is_some_and(|victim| priority.is_higher_than(self.nodes.node(victim).priority))
    }

    fn is_scheduled(&self, _cpus: &Processors, thread: ThreadIndex) -> bool {
        self.nodes
            .get(thread)
            .is_some_and(|node| node.state == NodeState::Scheduled)
    }

    fn ready_count(&self) -> usize {
        self.ready.len() + self.scheduled.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::sync::Arc;

    use crate::kern::port::SimulatedPort;
    use crate::sched::PriorityReadyQueue;

    fn setup(cpus: usize, threads: &[(ThreadIndex, u64)]) -> (Smp<PriorityReadyQueue>, Processors) {
        let config = SchedulerConfig::new("smp", SchedulerAlgorithm::PrioritySmp)
            .with_processors(ProcessorMask::first(cpus));
        let mut sched = Smp::new(
            &config,
            Priority(255),
            PriorityMapping::Identity,
            PriorityReadyQueue::new(256, 16),
            NodeTable::new(16, Arc::new(SimulatedPort::new(cpus))),
        );
        let mut table = Processors::new(cpus, 16);
        for cpu in 0..cpus {
            sched.node_initialize(
                cpu,
                Priority(255),
                NodeAttributes {
                    preemptible: true,
                    affinity: ProcessorMask::single(cpu),
                    idle: true,
                },
            );
            table.start(cpu, 0, cpu);
            sched.start_idle(&mut table, cpu, cpu);
        }
        for (thread, priority) in threads {
            sched.node_initialize(
                *thread,
                Priority(*priority),
                NodeAttributes {
                    preemptible: true,
                    affinity: ProcessorMask::first(cpus),
                    idle: false,
                },
            );
        }
        (sched, table)
    }

    fn heirs(cpus: &Processors) -> Vec<Option<ThreadIndex>> {
        cpus.iter().map(|cpu| cpu.heir()).collect()
    }

    #[test]
    fn test_fills_idle_processors_first() {
        let (mut sched, mut cpus) = setup(2, &[(10, 5), (11, 6)]);
        sched.unblock(&mut cpus, 10);
        sched.unblock(&mut cpus, 11);
        let h = heirs(&cpus);
        assert!(h.contains(&Some(10)));
        assert!(h.contains(&Some(11)));
        assert_eq!(sched.ready_count(), 4);
    }

    #[test]
    fn test_higher_priority_preempts_lowest_only() {
        let (mut sched, mut cpus) = setup(2, &[(10, 5), (11, 6), (12, 2)]);
        sched.unblock(&mut cpus, 10);
        sched.unblock(&mut cpus, 11);
        let before = heirs(&cpus);
        let updates: u64 = cpus.iter().map(|c| c.stats().heir_updates).sum();

        sched.unblock(&mut cpus, 12);
        let after = heirs(&cpus);
        let changed = before.iter().zip(&after).filter(|(a, b)| a != b).count();
        assert_eq!(changed, 1);
        assert!(after.contains(&Some(12)));
        assert!(after.contains(&Some(10)));
        assert_eq!(
            cpus.iter().map(|c| c.stats().heir_updates).sum::<u64>(),
            updates + 1
        );
        assert!(!sched.is_scheduled(&cpus, 11));
    }

    #[test]
    fn test_block_hands_processor_to_best_ready() {
        let (mut sched, mut cpus) = setup(2, &[(10, 5), (11, 6), (12, 7)]);
        for t in [10, 11, 12] {
            sched.unblock(&mut cpus, t);
        }
        assert!(!sched.is_scheduled(&cpus, 12));
        sched.block(&mut cpus, 10);
        assert!(sched.is_scheduled(&cpus, 12));
        assert!(sched.is_scheduled(&cpus, 11));
        sched.block(&mut cpus, 11);
        sched.block(&mut cpus, 12);
        assert_eq!(heirs(&cpus), [Some(0), Some(1)]);
    }

    #[test]
    fn test_affinity_respected() {
        let (mut sched, mut cpus) = setup(2, &[(10, 5), (11, 3)]);
        sched
            .set_affinity(&mut cpus, 11, ProcessorMask::single(1))
            .unwrap();
        sched.unblock(&mut cpus, 10);
        sched.unblock(&mut cpus, 11);
        assert_eq!(cpus.get(1).heir(), Some(11));
        assert_eq!(cpus.get(0).heir(), Some(10));
        sched
            .set_affinity(&mut cpus, 11, ProcessorMask::single(0))
            .unwrap();
        assert_eq!(cpus.get(0).heir(), Some(11));
        assert_eq!(cpus.get(1).heir(), Some(10));
        assert_eq!(
            sched.set_affinity(&mut cpus, 11, ProcessorMask::single(5)),
            Err(Status::InvalidNumber)
        );
    }

    #[test]
    fn test_priority_drop_gives_processor_away() {
        let (mut sched, mut cpus) = setup(1, &[(10, 5), (11, 6)]);
        sched.unblock(&mut cpus, 10);
        sched.unblock(&mut cpus, 11);
        assert_eq!(cpus.get(0).heir(), Some(10));
        sched.update_priority(&mut cpus, 10, Priority(9));
        assert_eq!(cpus.get(0).heir(), Some(11));
        sched.update_priority(&mut cpus, 10, Priority(5));
        assert_eq!(cpus.get(0).heir(), Some(10));
    }

    #[test]
    fn test_yield_and_help() {
        let (mut sched, mut cpus) = setup(1, &[(10, 5), (11, 5)]);
        sched.unblock(&mut cpus, 10);
        sched.unblock(&mut cpus, 11);
        assert_eq!(cpus.get(0).heir(), Some(10));
        sched.yield_thread(&mut cpus, 10);
        assert_eq!(cpus.get(0).heir(), Some(11));
        assert!(sched.ask_for_help(&cpus, Priority(4), ProcessorMask::first(1)));
        assert!(!sched.ask_for_help(&cpus, Priority(5), ProcessorMask::first(1)));
        assert_eq!(
            sched.set_preemptible(&mut cpus, 10, false),
            Err(Status::NotDefined)
        );
    }
}
