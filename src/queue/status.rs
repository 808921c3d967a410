//! Queue lifecycle status
//!
//! Shutdown is a cooperative transition `Run -> NeedExit -> CanExit`:
//! the host requests the exit, the worker observes it once its ring is
//! empty and acknowledges by moving to `CanExit`.

use std::sync::atomic::{AtomicU32, Ordering};

#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RepoStatus {
    Init = 0,
    Run = 1,
    NeedExit = 2,
    CanExit = 3,
}

impl RepoStatus {
    fn from_u32(value: u32) -> RepoStatus {
        match value {
            0 => RepoStatus::Init,
            1 => RepoStatus::Run,
            2 => RepoStatus::NeedExit,
            _ => RepoStatus::CanExit,
        }
    }
}

#[derive(Debug)]
pub(crate) struct AtomicStatus(AtomicU32);

impl AtomicStatus {
    pub(crate) fn new(status: RepoStatus) -> Self {
        AtomicStatus(AtomicU32::new(status as u32))
    }

    pub(crate) fn load(&self) -> RepoStatus {
        RepoStatus::from_u32(self.0.load(Ordering::SeqCst))
    }

    pub(crate) fn store(&self, status: RepoStatus) {
        self.0.store(status as u32, Ordering::SeqCst);
    }

    /// Transition `expected -> desired`; other states are untouched.
    pub(crate) fn change(&self, expected: RepoStatus, desired: RepoStatus) -> bool {
        self.0
            .compare_exchange(
                expected as u32,
                desired as u32,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_ok()
    }
}
