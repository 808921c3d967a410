//! ACL runtime FFI bindings
//!
//! FFI declarations bound to the CANN ACL runtime (libascendcl). All
//! functions are called through the [`AclDriver`](super::AclDriver)
//! wrapper methods. The dead_code allowance is needed because FFI
//! symbols appear unused to the compiler (they're only called through
//! unsafe blocks).

use std::ffi::c_void;

#[link(name = "ascendcl")]
#[allow(dead_code)]
extern "C" {
    pub fn aclrtSetDevice(deviceId: i32) -> i32;
    pub fn aclrtGetDevice(deviceId: *mut i32) -> i32;
    pub fn aclrtGetDeviceCount(count: *mut u32) -> i32;
    pub fn aclrtMalloc(devPtr: *mut *mut c_void, size: usize, policy: i32) -> i32;
    pub fn aclrtFree(devPtr: *mut c_void) -> i32;
    pub fn aclrtGetMemInfo(attr: i32, free: *mut usize, total: *mut usize) -> i32;
    pub fn aclrtSynchronizeStream(stream: *mut c_void) -> i32;
    pub fn aclrtSynchronizeDevice() -> i32;
    pub fn aclrtCreateEventWithFlag(event: *mut *mut c_void, flag: u32) -> i32;
    pub fn aclrtDestroyEvent(event: *mut c_void) -> i32;
    pub fn aclrtRecordEvent(event: *mut c_void, stream: *mut c_void) -> i32;
    pub fn aclrtQueryEvent(event: *mut c_void, status: *mut i32) -> i32;
    pub fn aclrtSynchronizeEvent(event: *mut c_void) -> i32;
}

/// ACL success code
pub const ACL_SUCCESS: i32 = 0;

/// Runtime memory-allocation failure (driver out of memory)
pub const ACL_ERROR_RT_MEMORY_ALLOCATION: i32 = 207001;

/// Prefer huge-page backed device memory
pub const ACL_MEM_MALLOC_HUGE_FIRST: i32 = 0;

/// Memory attribute selecting the HBM pool for aclrtGetMemInfo
pub const ACL_HBM_MEM: i32 = 1;

/// Event flag: event captures stream progress (synchronization only)
pub const ACL_EVENT_CAPTURE_STREAM_PROGRESS: u32 = 0x1;

/// aclrtQueryEvent status values
pub const ACL_EVENT_STATUS_COMPLETE: i32 = 0;
#[allow(dead_code)]
pub const ACL_EVENT_STATUS_NOT_READY: i32 = 1;
