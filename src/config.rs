//! Kernel configuration
//!
//! Object maxima, time base, priority range and the scheduler instances
//! that partition the processors. Everything the kernel allocates is sized
//! from here at initialization; nothing grows afterwards.
//!
//! ```ignore
//! let config = Configuration::smp(SchedulerAlgorithm::PrioritySmp, 4)
//!     .with_maximum_threads(64)
//!     .with_ticks_per_timeslice(10);
//! ```

use heapless::Vec;

use crate::error::{Result, Status};
use crate::kern::bitmap::BITMAP_MAX_LEVELS;
use crate::kern::priority::{PRIORITY_BITMAP_MAXIMUM, PRIORITY_DEFAULT_MAXIMUM};
use crate::types::{ProcessorMask, MAX_PROCESSORS};

/// Most scheduler instances a configuration can name
pub const MAX_SCHEDULERS: usize = 8;

/// Scheduler algorithm of an instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SchedulerAlgorithm {
    /// Fixed priority with a bitmap-indexed ready queue
    PriorityBitmap,
    /// Fixed priority with a single ordered chain
    Simple,
    /// Earliest deadline first
    Edf,
    /// Global fixed priority across processors
    PrioritySmp,
    /// Global fixed priority with a single ordered chain
    SimpleSmp,
    /// Global earliest deadline first
    EdfSmp,
}

impl SchedulerAlgorithm {
    /// Whether the algorithm drives exactly one processor
    pub fn is_uniprocessor(self) -> bool {
        matches!(
            self,
            SchedulerAlgorithm::PriorityBitmap
                | SchedulerAlgorithm::Simple
                | SchedulerAlgorithm::Edf
        )
    }

    fn uses_bitmap(self) -> bool {
        matches!(
            self,
            SchedulerAlgorithm::PriorityBitmap | SchedulerAlgorithm::PrioritySmp
        )
    }
}

/// One scheduler instance
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchedulerConfig {
    pub name: &'static str,
    pub algorithm: SchedulerAlgorithm,
    /// Processors owned by the instance
    pub processors: ProcessorMask,
    /// Least important user priority; also the idle priority
    pub maximum_priority: u64,
}

impl SchedulerConfig {
    /// Instance owning processor 0 with the default priority range
    pub const fn new(name: &'static str, algorithm: SchedulerAlgorithm) -> Self {
        Self {
            name,
            algorithm,
            processors: ProcessorMask::single(0),
            maximum_priority: PRIORITY_DEFAULT_MAXIMUM,
        }
    }

    pub const fn with_processors(mut self, processors: ProcessorMask) -> Self {
        self.processors = processors;
        self
    }

    pub const fn with_maximum_priority(mut self, maximum: u64) -> Self {
        self.maximum_priority = maximum;
        self
    }
}

/// Complete kernel configuration
#[derive(Debug, Clone)]
pub struct Configuration {
    pub maximum_threads: usize,
    pub maximum_mutexes: usize,
    pub maximum_semaphores: usize,
    pub maximum_condition_variables: usize,
    pub maximum_message_queues: usize,
    pub maximum_barriers: usize,
    pub maximum_timers: usize,
    pub maximum_periods: usize,
    /// Length of a clock tick
    pub microseconds_per_tick: u32,
    /// Ticks a timesliced thread may run before it yields
    pub ticks_per_timeslice: u32,
    /// Processors to bring online
    pub processors: usize,
    pub schedulers: Vec<SchedulerConfig, MAX_SCHEDULERS>,
}

impl Default for Configuration {
    fn default() -> Self {
        Self::uniprocessor(SchedulerAlgorithm::PriorityBitmap)
    }
}

impl Configuration {
    fn base(processors: usize, scheduler: SchedulerConfig) -> Self {
        let mut schedulers = Vec::new();
        // Capacity is at least one.
        let _ = schedulers.push(scheduler);
        Self {
            maximum_threads: 32,
            maximum_mutexes: 32,
            maximum_semaphores: 32,
            maximum_condition_variables: 16,
            maximum_message_queues: 8,
            maximum_barriers: 8,
            maximum_timers: 16,
            maximum_periods: 8,
            microseconds_per_tick: 10_000,
            ticks_per_timeslice: 50,
            processors,
            schedulers,
        }
    }

    /// One processor, one instance of `algorithm`
    pub fn uniprocessor(algorithm: SchedulerAlgorithm) -> Self {
        Self::base(1, SchedulerConfig::new("UPD", algorithm))
    }

    /// `processors` processors under one global instance of `algorithm`
    pub fn smp(algorithm: SchedulerAlgorithm, processors: usize) -> Self {
        let scheduler = SchedulerConfig::new("SMP", algorithm)
            .with_processors(ProcessorMask::first(processors));
        Self::base(processors, scheduler)
    }

    /// One uniprocessor instance of `algorithm` per processor
    pub fn partitioned(algorithm: SchedulerAlgorithm, processors: usize) -> Self {
        const NAMES: [&str; MAX_SCHEDULERS] = ["P0", "P1", "P2", "P3", "P4", "P5", "P6", "P7"];
        let mut config = Self::base(processors, SchedulerConfig::new(NAMES[0], algorithm));
        config.schedulers.clear();
        for (cpu, name) in NAMES.iter().enumerate().take(processors) {
            let _ = config.schedulers.push(
                SchedulerConfig::new(name, algorithm).with_processors(ProcessorMask::single(cpu)),
            );
        }
        config
    }

    pub fn with_maximum_threads(mut self, maximum: usize) -> Self {
        self.maximum_threads = maximum;
        self
    }

    pub fn with_maximum_mutexes(mut self, maximum: usize) -> Self {
        self.maximum_mutexes = maximum;
        self
    }

    pub fn with_maximum_semaphores(mut self, maximum: usize) -> Self {
        self.maximum_semaphores = maximum;
        self
    }

    pub fn with_maximum_timers(mut self, maximum: usize) -> Self {
        self.maximum_timers = maximum;
        self
    }

    pub fn with_ticks_per_timeslice(mut self, ticks: u32) -> Self {
        self.ticks_per_timeslice = ticks;
        self
    }

    pub fn with_microseconds_per_tick(mut self, microseconds: u32) -> Self {
        self.microseconds_per_tick = microseconds;
        self
    }

    /// Apply a priority range to every scheduler instance
    pub fn with_maximum_priority(mut self, maximum: u64) -> Self {
        for scheduler in self.schedulers.iter_mut() {
            scheduler.maximum_priority = maximum;
        }
        self
    }

    /// Replace the scheduler instances
    pub fn with_schedulers(mut self, schedulers: &[SchedulerConfig]) -> Result<Self> {
        self.schedulers = Vec::from_slice(schedulers).map_err(|_| Status::TooMany)?;
        Ok(self)
    }

    /// Convert milliseconds to clock ticks, rounding up
    pub fn ms_to_ticks(&self, ms: u64) -> u64 {
        let us = ms.saturating_mul(1000);
        let per_tick = u64::from(self.microseconds_per_tick.max(1));
        us.div_ceil(per_tick)
    }

    /// Check internal consistency
    pub fn validate(&self) -> Result<()> {
        if self.processors == 0 || self.processors > MAX_PROCESSORS {
            return Err(Status::InvalidNumber);
        }
        if self.maximum_threads == 0 || self.microseconds_per_tick == 0 {
            return Err(Status::InvalidNumber);
        }
        if self.schedulers.is_empty() {
            return Err(Status::InvalidNumber);
        }

        let online = ProcessorMask::first(self.processors);
        let mut owned = ProcessorMask::empty();
        for scheduler in &self.schedulers {
            let cpus = scheduler.processors;
            if cpus.is_empty() || !cpus.is_subset(&online) {
                return Err(Status::InvalidNumber);
            }
            if !cpus.intersection(owned).is_empty() {
                return Err(Status::ResourceInUse);
            }
            if scheduler.algorithm.is_uniprocessor() && cpus.count() != 1 {
                return Err(Status::InvalidNumber);
            }
            if scheduler.maximum_priority < 2 {
                return Err(Status::InvalidPriority);
            }
            if scheduler.algorithm.uses_bitmap()
                && (scheduler.maximum_priority > PRIORITY_BITMAP_MAXIMUM
                    || scheduler.maximum_priority as usize >= BITMAP_MAX_LEVELS)
            {
                return Err(Status::InvalidPriority);
            }
            owned = owned.union(cpus);
        }
        if owned != online {
            return Err(Status::InvalidNumber);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        let config = Configuration::default();
        assert_eq!(config.validate(), Ok(()));
        assert_eq!(config.schedulers.len(), 1);
    }

    #[test]
    fn test_smp_and_partitioned() {
        let smp = Configuration::smp(SchedulerAlgorithm::PrioritySmp, 4);
        assert_eq!(smp.validate(), Ok(()));
        let partitioned = Configuration::partitioned(SchedulerAlgorithm::Edf, 3);
        assert_eq!(partitioned.schedulers.len(), 3);
        assert_eq!(partitioned.validate(), Ok(()));
    }

    #[test]
    fn test_rejects_bad_layouts() {
        let uni_on_two = Configuration::smp(SchedulerAlgorithm::PriorityBitmap, 2);
        assert_eq!(uni_on_two.validate(), Err(Status::InvalidNumber));

        let overlap = Configuration::smp(SchedulerAlgorithm::PrioritySmp, 2)
            .with_schedulers(&[
                SchedulerConfig::new("A", SchedulerAlgorithm::PrioritySmp)
                    .with_processors(ProcessorMask::first(2)),
                SchedulerConfig::new("B", SchedulerAlgorithm::Simple),
            ])
            .unwrap();
        assert_eq!(overlap.validate(), Err(Status::ResourceInUse));

        let uncovered = Configuration::smp(SchedulerAlgorithm::PrioritySmp, 2)
            .with_schedulers(&[SchedulerConfig::new("A", SchedulerAlgorithm::Simple)])
            .unwrap();
        assert_eq!(uncovered.validate(), Err(Status::InvalidNumber));

        let too_many_levels = Configuration::default().with_maximum_priority(5000);
        assert_eq!(too_many_levels.validate(), Err(Status::InvalidPriority));
    }

    #[test]
    fn test_ms_to_ticks() {
        let config = Configuration::default().with_microseconds_per_tick(1000);
        assert_eq!(config.ms_to_ticks(10), 10);
        let coarse = Configuration::default();
        assert_eq!(coarse.ms_to_ticks(15), 2);
        assert_eq!(coarse.ms_to_ticks(0), 0);
    }
}
