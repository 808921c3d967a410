//! ACL runtime driver implementation

use std::ffi::c_void;
use std::ptr;

use crate::backend::npu_backend::driver::{DevicePtr, EventHandle, NpuDriver};
use crate::backend::npu_backend::error::{NpuError, NpuResult};
use crate::backend::npu_backend::ffi;
use crate::backend::npu_backend::stream::NpuStream;

// aclrtMalloc requires 32-byte aligned sizes; round up before calling.
const ALLOC_ALIGN: usize = 32;

/// Driver backed by the real CANN ACL runtime.
///
/// Stateless: every handle lives in the driver, this type only wraps
/// the FFI calls with error mapping.
#[derive(Debug, Default)]
pub struct AclDriver;

impl AclDriver {
    pub fn new() -> Self {
        AclDriver
    }
}

fn check(ret: i32, what: &str) -> NpuResult<()> {
    if ret != ffi::ACL_SUCCESS {
        return Err(NpuError::DeviceError(format!(
            "{} failed with code {}",
            what, ret
        )));
    }
    Ok(())
}

impl NpuDriver for AclDriver {
    fn device_count(&self) -> NpuResult<usize> {
        let mut count: u32 = 0;
        check(unsafe { ffi::aclrtGetDeviceCount(&mut count) }, "aclrtGetDeviceCount")?;
        Ok(count as usize)
    }

    fn set_device(&self, device: usize) -> NpuResult<()> {
        check(unsafe { ffi::aclrtSetDevice(device as i32) }, "aclrtSetDevice")
    }

    fn current_device(&self) -> NpuResult<usize> {
        let mut device: i32 = 0;
        check(unsafe { ffi::aclrtGetDevice(&mut device) }, "aclrtGetDevice")?;
        Ok(device as usize)
    }

    fn mem_get_info(&self, device: usize) -> NpuResult<(usize, usize)> {
        self.set_device(device)?;
        let mut free: usize = 0;
        let mut total: usize = 0;
        let ret = unsafe { ffi::aclrtGetMemInfo(ffi::ACL_HBM_MEM, &mut free, &mut total) };
        if ret != ffi::ACL_SUCCESS {
            return Err(NpuError::MemoryQueryFailed(format!(
                "aclrtGetMemInfo failed with code {}",
                ret
            )));
        }
        Ok((free, total))
    }

    fn device_alloc(&self, device: usize, size: usize) -> NpuResult<DevicePtr> {
        self.set_device(device)?;
        let aligned = (size + ALLOC_ALIGN - 1) / ALLOC_ALIGN * ALLOC_ALIGN;
        let mut raw: *mut c_void = ptr::null_mut();
        let ret = unsafe { ffi::aclrtMalloc(&mut raw, aligned, ffi::ACL_MEM_MALLOC_HUGE_FIRST) };
        if ret == ffi::ACL_ERROR_RT_MEMORY_ALLOCATION {
            return Err(NpuError::OutOfMemory(format!(
                "aclrtMalloc failed with code {} for {} bytes",
                ret, aligned
            )));
        }
        if ret != ffi::ACL_SUCCESS {
            return Err(NpuError::MemoryAllocationFailed(format!(
                "aclrtMalloc failed with code {} for {} bytes",
                ret, aligned
            )));
        }
        if raw.is_null() {
            return Err(NpuError::MemoryAllocationFailed(format!(
                "aclrtMalloc returned null pointer for {} bytes",
                aligned
            )));
        }
        Ok(DevicePtr(raw as u64))
    }

    fn device_free(&self, ptr: DevicePtr) -> NpuResult<()> {
        check(unsafe { ffi::aclrtFree(ptr.0 as *mut c_void) }, "aclrtFree")
    }

    fn stream_synchronize(&self, stream: NpuStream) -> NpuResult<()> {
        check(
            unsafe { ffi::aclrtSynchronizeStream(stream.handle() as *mut c_void) },
            "aclrtSynchronizeStream",
        )
    }

    fn device_synchronize(&self, device: usize) -> NpuResult<()> {
        self.set_device(device)?;
        check(unsafe { ffi::aclrtSynchronizeDevice() }, "aclrtSynchronizeDevice")
    }

    fn event_create(&self, device: usize) -> NpuResult<EventHandle> {
        self.set_device(device)?;
        let mut raw: *mut c_void = ptr::null_mut();
        check(
            unsafe { ffi::aclrtCreateEventWithFlag(&mut raw, ffi::ACL_EVENT_CAPTURE_STREAM_PROGRESS) },
            "aclrtCreateEventWithFlag",
        )?;
        Ok(EventHandle(raw as u64))
    }

    fn event_destroy(&self, event: EventHandle) -> NpuResult<()> {
        check(unsafe { ffi::aclrtDestroyEvent(event.0 as *mut c_void) }, "aclrtDestroyEvent")
    }

    fn event_record(&self, event: EventHandle, stream: NpuStream) -> NpuResult<()> {
        check(
            unsafe { ffi::aclrtRecordEvent(event.0 as *mut c_void, stream.handle() as *mut c_void) },
            "aclrtRecordEvent",
        )
    }

    fn event_query(&self, event: EventHandle) -> NpuResult<bool> {
        let mut status: i32 = 0;
        check(
            unsafe { ffi::aclrtQueryEvent(event.0 as *mut c_void, &mut status) },
            "aclrtQueryEvent",
        )?;
        Ok(status == ffi::ACL_EVENT_STATUS_COMPLETE)
    }

    fn event_synchronize(&self, event: EventHandle) -> NpuResult<()> {
        check(
            unsafe { ffi::aclrtSynchronizeEvent(event.0 as *mut c_void) },
            "aclrtSynchronizeEvent",
        )
    }
}
