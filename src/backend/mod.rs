//! NPU backend module

pub mod npu_backend;

pub use npu_backend::*;
