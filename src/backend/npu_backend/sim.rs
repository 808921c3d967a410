//! Simulated driver for host-only development and testing
//!
//! Implements the full [`NpuDriver`] contract without hardware:
//! allocations are fake bump-pointer addresses, device memory is a
//! counter, and event completion is driven by marking streams busy or
//! complete from the test. No actual device memory is touched.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use crate::backend::npu_backend::driver::{DevicePtr, EventHandle, NpuDriver};
use crate::backend::npu_backend::error::{NpuError, NpuResult};
use crate::backend::npu_backend::stream::NpuStream;

// Fake device address space starts above zero so DevicePtr::NULL never
// collides with a real allocation.
const BASE_ADDR: u64 = 0x10000;
const ADDR_ALIGN: u64 = 512;

#[derive(Debug)]
struct SimDevice {
    free: usize,
    total: usize,
}

#[derive(Debug, Clone, Copy)]
struct Allocation {
    device: usize,
    size: usize,
}

#[derive(Debug)]
struct SimEvent {
    device: usize,
    /// `Some(stream)` while the recording stream still has unfinished
    /// work; `None` once fired.
    pending_on: Option<NpuStream>,
}

#[derive(Debug)]
struct SimState {
    devices: Vec<SimDevice>,
    next_addr: u64,
    next_event: u64,
    allocations: HashMap<u64, Allocation>,
    events: HashMap<u64, SimEvent>,
    busy_streams: HashSet<NpuStream>,
    current_device: usize,
}

/// Host-simulated NPU driver.
#[derive(Debug)]
pub struct SimDriver {
    state: Mutex<SimState>,
}

impl SimDriver {
    /// A driver with `device_count` devices of `bytes_per_device` each.
    pub fn new(device_count: usize, bytes_per_device: usize) -> Self {
        let devices = (0..device_count)
            .map(|_| SimDevice {
                free: bytes_per_device,
                total: bytes_per_device,
            })
            .collect();
        SimDriver {
            state: Mutex::new(SimState {
                devices,
                next_addr: BASE_ADDR,
                next_event: 1,
                allocations: HashMap::new(),
                events: HashMap::new(),
                busy_streams: HashSet::new(),
                current_device: 0,
            }),
        }
    }

    /// Mark `stream` as having unfinished work: events recorded on it
    /// stay pending until [`complete_stream`](Self::complete_stream) or
    /// a synchronize call.
    pub fn set_stream_busy(&self, stream: NpuStream) {
        let mut state = self.state.lock().unwrap();
        state.busy_streams.insert(stream);
    }

    /// Finish all outstanding work on `stream`: fires its pending
    /// events and clears the busy mark.
    pub fn complete_stream(&self, stream: NpuStream) {
        let mut state = self.state.lock().unwrap();
        state.busy_streams.remove(&stream);
        for event in state.events.values_mut() {
            if event.pending_on == Some(stream) {
                event.pending_on = None;
            }
        }
    }

    /// Free device memory remaining on `device`.
    pub fn free_memory(&self, device: usize) -> usize {
        self.state.lock().unwrap().devices[device].free
    }

    /// Number of live driver allocations (for leak checks in tests).
    pub fn allocation_count(&self) -> usize {
        self.state.lock().unwrap().allocations.len()
    }

    /// Number of live (undestroyed) events.
    pub fn event_count(&self) -> usize {
        self.state.lock().unwrap().events.len()
    }
}

impl NpuDriver for SimDriver {
    fn device_count(&self) -> NpuResult<usize> {
        Ok(self.state.lock()?.devices.len())
    }

    fn set_device(&self, device: usize) -> NpuResult<()> {
        let mut state = self.state.lock()?;
        if device >= state.devices.len() {
            return Err(NpuError::DeviceError(format!(
                "set_device: no such device {}",
                device
            )));
        }
        state.current_device = device;
        Ok(())
    }

    fn current_device(&self) -> NpuResult<usize> {
        Ok(self.state.lock()?.current_device)
    }

    fn mem_get_info(&self, device: usize) -> NpuResult<(usize, usize)> {
        let state = self.state.lock()?;
        let dev = state.devices.get(device).ok_or_else(|| {
            NpuError::MemoryQueryFailed(format!("mem_get_info: no such device {}", device))
        })?;
        Ok((dev.free, dev.total))
    }

    fn device_alloc(&self, device: usize, size: usize) -> NpuResult<DevicePtr> {
        let mut state = self.state.lock()?;
        let dev = state.devices.get_mut(device).ok_or_else(|| {
            NpuError::DeviceError(format!("device_alloc: no such device {}", device))
        })?;
        if size > dev.free {
            return Err(NpuError::OutOfMemory(format!(
                "simulated device {} out of memory: requested {} bytes, {} free",
                device, size, dev.free
            )));
        }
        dev.free -= size;
        let addr = state.next_addr;
        state.next_addr += ((size as u64 + ADDR_ALIGN - 1) / ADDR_ALIGN) * ADDR_ALIGN;
        state.allocations.insert(addr, Allocation { device, size });
        tracing::trace!("SimDriver: alloc {} bytes at 0x{:x} on device {}", size, addr, device);
        Ok(DevicePtr(addr))
    }

    fn device_free(&self, ptr: DevicePtr) -> NpuResult<()> {
        let mut state = self.state.lock()?;
        let alloc = state.allocations.remove(&ptr.0).ok_or_else(|| {
            NpuError::InvalidDevicePointer(format!("{}", ptr))
        })?;
        state.devices[alloc.device].free += alloc.size;
        tracing::trace!("SimDriver: free {} bytes at {}", alloc.size, ptr);
        Ok(())
    }

    fn stream_synchronize(&self, stream: NpuStream) -> NpuResult<()> {
        // Host-side wait: all work queued on the stream finishes.
        let mut state = self.state.lock()?;
        state.busy_streams.remove(&stream);
        for event in state.events.values_mut() {
            if event.pending_on == Some(stream) {
                event.pending_on = None;
            }
        }
        Ok(())
    }

    fn device_synchronize(&self, device: usize) -> NpuResult<()> {
        let mut state = self.state.lock()?;
        state.busy_streams.retain(|s| s.device_index() != device);
        for event in state.events.values_mut() {
            if event.device == device {
                event.pending_on = None;
            }
        }
        Ok(())
    }

    fn event_create(&self, device: usize) -> NpuResult<EventHandle> {
        let mut state = self.state.lock()?;
        let handle = state.next_event;
        state.next_event += 1;
        state.events.insert(
            handle,
            SimEvent {
                device,
                pending_on: None,
            },
        );
        Ok(EventHandle(handle))
    }

    fn event_destroy(&self, event: EventHandle) -> NpuResult<()> {
        let mut state = self.state.lock()?;
        state
            .events
            .remove(&event.0)
            .ok_or_else(|| NpuError::DeviceError(format!("destroy of unknown event {:?}", event)))?;
        Ok(())
    }

    fn event_record(&self, event: EventHandle, stream: NpuStream) -> NpuResult<()> {
        let mut state = self.state.lock()?;
        let busy = state.busy_streams.contains(&stream);
        let ev = state
            .events
            .get_mut(&event.0)
            .ok_or_else(|| NpuError::DeviceError(format!("record on unknown event {:?}", event)))?;
        // On an idle stream the event fires immediately.
        ev.pending_on = if busy { Some(stream) } else { None };
        Ok(())
    }

    fn event_query(&self, event: EventHandle) -> NpuResult<bool> {
        let state = self.state.lock()?;
        let ev = state
            .events
            .get(&event.0)
            .ok_or_else(|| NpuError::DeviceError(format!("query of unknown event {:?}", event)))?;
        Ok(ev.pending_on.is_none())
    }

    fn event_synchronize(&self, event: EventHandle) -> NpuResult<()> {
        // A host wait on the event forces the recorded stream's work to
        // completion, as it would on hardware.
        let mut state = self.state.lock()?;
        let ev = state
            .events
            .get_mut(&event.0)
            .ok_or_else(|| NpuError::DeviceError(format!("sync of unknown event {:?}", event)))?;
        ev.pending_on = None;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alloc_free_roundtrip_restores_free_memory() {
        let driver = SimDriver::new(1, 1024);
        let ptr = driver.device_alloc(0, 512).unwrap();
        assert_eq!(driver.free_memory(0), 512);
        driver.device_free(ptr).unwrap();
        assert_eq!(driver.free_memory(0), 1024);
        assert_eq!(driver.allocation_count(), 0);
    }

    #[test]
    fn alloc_beyond_free_is_oom() {
        let driver = SimDriver::new(1, 1024);
        let err = driver.device_alloc(0, 2048).unwrap_err();
        assert!(err.is_oom(), "expected OOM, got {:?}", err);
    }

    #[test]
    fn double_free_is_invalid_pointer() {
        let driver = SimDriver::new(1, 1024);
        let ptr = driver.device_alloc(0, 64).unwrap();
        driver.device_free(ptr).unwrap();
        assert!(matches!(
            driver.device_free(ptr),
            Err(NpuError::InvalidDevicePointer(_))
        ));
    }

    #[test]
    fn event_on_busy_stream_stays_pending_until_completion() {
        let driver = SimDriver::new(1, 1024);
        let stream = NpuStream::new(0, 7);
        let event = driver.event_create(0).unwrap();

        driver.set_stream_busy(stream);
        driver.event_record(event, stream).unwrap();
        assert!(!driver.event_query(event).unwrap());

        driver.complete_stream(stream);
        assert!(driver.event_query(event).unwrap());
    }

    #[test]
    fn event_on_idle_stream_fires_immediately() {
        let driver = SimDriver::new(1, 1024);
        let stream = NpuStream::new(0, 7);
        let event = driver.event_create(0).unwrap();
        driver.event_record(event, stream).unwrap();
        assert!(driver.event_query(event).unwrap());
    }

    #[test]
    fn event_synchronize_forces_completion() {
        let driver = SimDriver::new(1, 1024);
        let stream = NpuStream::new(0, 3);
        let event = driver.event_create(0).unwrap();
        driver.set_stream_busy(stream);
        driver.event_record(event, stream).unwrap();
        driver.event_synchronize(event).unwrap();
        assert!(driver.event_query(event).unwrap());
    }
}
