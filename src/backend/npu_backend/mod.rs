//! NPU driver backend
//!
//! This module is the seam between the runtime core (allocator, task
//! queue) and the vendor driver. Everything above it talks to the
//! [`NpuDriver`] trait; the `acl` feature provides the real CANN/ACL
//! implementation, and [`SimDriver`] provides a host-only simulated
//! driver for development and tests on machines without the hardware.

#[cfg(feature = "acl")]
mod acl;
mod driver;
mod error;
mod event;
#[cfg(feature = "acl")]
mod ffi;
mod sim;
mod stream;

#[cfg(feature = "acl")]
pub use acl::AclDriver;
pub use driver::{DevicePtr, EventHandle, NpuDriver};
pub use error::{NpuError, NpuResult};
pub use event::NpuEvent;
pub use sim::SimDriver;
pub use stream::NpuStream;
