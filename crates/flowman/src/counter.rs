//! Counter pool.
//!
//! Counters are indices into one device-side block. The block only ever
//! grows, by asking the device for a larger total; released counters go
//! back on a free list for reuse.

use flowman_dev::{CounterId, FlowApi};
use log::{debug, error};

use crate::error::{FlowError, Result};

/// Free list of device counters, grown on demand.
#[derive(Debug, Clone)]
pub struct CounterPool {
    free: Vec<CounterId>,
    allocated: u32,
    expand: u32,
    max: Option<u32>,
}

impl CounterPool {
    /// Creates an empty pool growing by `expand` counters per step, up to
    /// `max` counters in total.
    pub fn new(expand: u32, max: Option<u32>) -> Self {
        Self {
            free: Vec::new(),
            allocated: 0,
            expand,
            max,
        }
    }

    /// Number of counters obtained from the device.
    pub fn allocated(&self) -> u32 {
        self.allocated
    }

    /// Number of counters ready for reuse.
    pub fn available(&self) -> usize {
        self.free.len()
    }

    /// Number of counters held by flows.
    pub fn in_use(&self) -> usize {
        (self.allocated as usize).saturating_sub(self.free.len())
    }

    /// Grows the device block by one step.
    pub fn grow<D: FlowApi>(&mut self, device: &mut D) -> Result<()> {
        let mut total = self.allocated.saturating_add(self.expand);
        if let Some(max) = self.max {
            total = total.min(max);
        }
        if total <= self.allocated {
            debug!(
                "FlowManager: counter pool growth declined at {} counters",
                self.allocated
            );
            return Err(FlowError::CounterResourceExhausted {
                allocated: self.allocated,
                source: None,
            });
        }

        device.counter_alloc_block(total).map_err(|e| {
            error!("FlowManager: failed to grow counters to {}: {}", total, e);
            FlowError::CounterResourceExhausted {
                allocated: self.allocated,
                source: Some(e),
            }
        })?;

        // Lowest ids are handed out first.
        self.free.extend((self.allocated..total).rev().map(CounterId));
        debug!(
            "FlowManager: counter pool grown from {} to {}",
            self.allocated, total
        );
        self.allocated = total;
        Ok(())
    }

    /// Takes a counter, growing the pool when the free list is empty.
    pub fn alloc<D: FlowApi>(&mut self, device: &mut D) -> Result<CounterId> {
        if self.free.is_empty() {
            self.grow(device)?;
        }
        self.free.pop().ok_or(FlowError::CounterResourceExhausted {
            allocated: self.allocated,
            source: None,
        })
    }

    /// Returns a counter to the free list.
    pub fn free(&mut self, counter: CounterId) {
        debug_assert!(counter.0 < self.allocated);
        self.free.push(counter);
    }

    /// Clears a counter's totals on the device.
    pub fn zero<D: FlowApi>(&self, device: &mut D, counter: CounterId) -> Result<()> {
        device.counter_query(counter, true)?;
        Ok(())
    }

    /// Releases the whole block on the device.
    pub fn release_all<D: FlowApi>(&mut self, device: &mut D) -> Result<()> {
        let result = device.counter_alloc_block(0);
        self.forget();
        result.map_err(FlowError::from)
    }

    /// Drops all counters without telling the device.
    pub fn forget(&mut self) {
        self.free.clear();
        self.allocated = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flowman_dev::sim::SimDevice;
    use flowman_dev::{CounterStats, DevStatus, Opcode};
    use pretty_assertions::assert_eq;

    #[test]
    fn test_grows_on_demand() {
        let mut dev = SimDevice::new();
        let mut pool = CounterPool::new(2, None);

        assert_eq!(pool.alloc(&mut dev).unwrap(), CounterId(0));
        assert_eq!(pool.alloc(&mut dev).unwrap(), CounterId(1));
        assert_eq!(dev.counters_total(), 2);

        assert_eq!(pool.alloc(&mut dev).unwrap(), CounterId(2));
        assert_eq!(dev.counters_total(), 4);
        assert_eq!(pool.allocated(), 4);
        assert_eq!(pool.in_use(), 3);
        assert_eq!(dev.command_count(Opcode::CounterAllocBlock), 2);
    }

    #[test]
    fn test_free_is_reused() {
        let mut dev = SimDevice::new();
        let mut pool = CounterPool::new(4, None);
        let a = pool.alloc(&mut dev).unwrap();
        pool.free(a);
        assert_eq!(pool.alloc(&mut dev).unwrap(), a);
        assert_eq!(dev.command_count(Opcode::CounterAllocBlock), 1);
    }

    #[test]
    fn test_growth_declined_at_max() {
        let mut dev = SimDevice::new();
        let mut pool = CounterPool::new(2, Some(3));
        for _ in 0..3 {
            pool.alloc(&mut dev).unwrap();
        }
        assert_eq!(pool.allocated(), 3);
        let err = pool.alloc(&mut dev).unwrap_err();
        assert_eq!(
            err,
            FlowError::CounterResourceExhausted {
                allocated: 3,
                source: None
            }
        );
    }

    #[test]
    fn test_device_refuses_growth() {
        let mut dev = SimDevice::new();
        dev.fail_next(Opcode::CounterAllocBlock, DevStatus::NoSpace);
        let mut pool = CounterPool::new(8, None);
        let err = pool.alloc(&mut dev).unwrap_err();
        assert!(matches!(
            err,
            FlowError::CounterResourceExhausted {
                allocated: 0,
                source: Some(_)
            }
        ));
        assert_eq!(pool.available(), 0);
    }

    #[test]
    fn test_zero_and_release() {
        let mut dev = SimDevice::new();
        let mut pool = CounterPool::new(4, None);
        let c = pool.alloc(&mut dev).unwrap();
        dev.set_counter(c, CounterStats { hits: 5, bytes: 500 });
        pool.zero(&mut dev, c).unwrap();
        assert_eq!(dev.counter_query(c, false).unwrap(), CounterStats::default());

        pool.release_all(&mut dev).unwrap();
        assert_eq!(dev.counters_total(), 0);
        assert_eq!(pool.allocated(), 0);
        assert_eq!(pool.available(), 0);
    }
}
