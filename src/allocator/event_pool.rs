//! Per-device completion-event pool
//!
//! Creating and destroying a driver event per deferred free would put
//! two driver calls on the hot path; instead events are recycled
//! through a per-device LIFO. Events are created lazily, returned on
//! drop of the [`PooledEvent`] guard, and only truly destroyed when
//! the pool itself is emptied or dropped.

use std::ops::Deref;
use std::sync::{Arc, Mutex};

use crate::backend::npu_backend::{NpuDriver, NpuEvent, NpuResult};

#[derive(Debug)]
pub(crate) struct EventPool {
    pools: Vec<Mutex<Vec<NpuEvent>>>,
}

impl EventPool {
    pub(crate) fn new(device_count: usize) -> Self {
        EventPool {
            pools: (0..device_count).map(|_| Mutex::new(Vec::new())).collect(),
        }
    }

    /// Pop a pooled event for `device`, creating one if the LIFO is
    /// empty. The guard returns the event on drop.
    pub(crate) fn get(
        self: &Arc<Self>,
        device: usize,
        driver: &Arc<dyn NpuDriver>,
    ) -> NpuResult<PooledEvent> {
        let recycled = {
            let mut pool = self.pools[device].lock()?;
            pool.pop()
        };
        let event = match recycled {
            Some(event) => event,
            None => NpuEvent::new(Arc::clone(driver), device)?,
        };
        Ok(PooledEvent {
            event: Some(event),
            pool: Arc::clone(self),
            device,
        })
    }

    /// Drop every pooled event (destroying the driver handles).
    pub(crate) fn empty_cache(&self) {
        for pool in &self.pools {
            match pool.lock() {
                Ok(mut events) => events.clear(),
                Err(poisoned) => poisoned.into_inner().clear(),
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn pooled_count(&self, device: usize) -> usize {
        self.pools[device].lock().unwrap().len()
    }
}

/// An event borrowed from the pool; returns itself on drop.
#[derive(Debug)]
pub(crate) struct PooledEvent {
    event: Option<NpuEvent>,
    pool: Arc<EventPool>,
    device: usize,
}

impl Deref for PooledEvent {
    type Target = NpuEvent;

    fn deref(&self) -> &NpuEvent {
        self.event.as_ref().expect("pooled event taken before drop")
    }
}

impl Drop for PooledEvent {
    fn drop(&mut self) {
        if let Some(event) = self.event.take() {
            match self.pool.pools[self.device].lock() {
                Ok(mut pool) => pool.push(event),
                // Poisoned pool: let the event destroy itself instead.
                Err(_) => drop(event),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::npu_backend::SimDriver;

    fn driver() -> (Arc<SimDriver>, Arc<dyn NpuDriver>) {
        let sim = Arc::new(SimDriver::new(2, 1 << 20));
        let driver: Arc<dyn NpuDriver> = sim.clone();
        (sim, driver)
    }

    #[test]
    fn events_are_recycled_lifo() {
        let (sim, driver) = driver();
        let pool = Arc::new(EventPool::new(2));

        let event = pool.get(0, &driver).unwrap();
        assert_eq!(pool.pooled_count(0), 0);
        drop(event);
        assert_eq!(pool.pooled_count(0), 1);

        // The next get reuses the pooled event instead of creating one
        let before = sim.event_count();
        let _event = pool.get(0, &driver).unwrap();
        assert_eq!(sim.event_count(), before);
        assert_eq!(pool.pooled_count(0), 0);
    }

    #[test]
    fn pools_are_per_device() {
        let (_sim, driver) = driver();
        let pool = Arc::new(EventPool::new(2));
        drop(pool.get(1, &driver).unwrap());
        assert_eq!(pool.pooled_count(0), 0);
        assert_eq!(pool.pooled_count(1), 1);
    }

    #[test]
    fn empty_cache_destroys_pooled_events() {
        let (sim, driver) = driver();
        let pool = Arc::new(EventPool::new(2));
        drop(pool.get(0, &driver).unwrap());
        assert_eq!(sim.event_count(), 1);
        pool.empty_cache();
        assert_eq!(sim.event_count(), 0);
    }
}
