//! Release ring
//!
//! Destructor work for consumed task records runs on a dedicated
//! releaser thread so the submission worker never pays for parameter
//! teardown. Structurally a smaller sibling of the submission ring:
//! bounded power-of-two SPSC ring, but with no wake handshake — the
//! producer spins when full (space is always imminent, the releaser
//! only runs destructors) and the consumer sleeps 1 microsecond
//! between attempts when empty.

use std::sync::atomic::{fence, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use crate::queue::callbacks::{CopyReleaseParamFn, DeleteBufferFn, QueueCallbacks, ReleaseParamFn};
use crate::queue::status::{AtomicStatus, RepoStatus};
use crate::queue::{QueueError, QueueResult};

const RELEASE_QUEUE_CAPACITY: usize = 8192;
const RELEASE_QUEUE_MASK: usize = RELEASE_QUEUE_CAPACITY - 1;

struct ReleaseShared {
    buffer: *mut u8,
    record_size: usize,
    write_idx: AtomicUsize,
    read_idx: AtomicUsize,
    status: AtomicStatus,
    copy_release_param: CopyReleaseParamFn,
    release_param: ReleaseParamFn,
    delete_buffer: DeleteBufferFn,
}

// SAFETY: strict single-producer (submission worker) / single-consumer
// (releaser thread) discipline: a slot between read_idx and write_idx
// is owned by the consumer, everything else by the producer, and the
// fences around every index move publish the slot bytes before the
// index. The raw buffer pointer itself never moves.
unsafe impl Send for ReleaseShared {}
unsafe impl Sync for ReleaseShared {}

impl ReleaseShared {
    fn is_empty(&self) -> bool {
        self.read_idx.load(Ordering::SeqCst) == self.write_idx.load(Ordering::SeqCst)
    }

    fn is_full(&self) -> bool {
        (self.write_idx.load(Ordering::SeqCst) + 1) & RELEASE_QUEUE_MASK
            == self.read_idx.load(Ordering::SeqCst)
    }

    fn write(&self, src: *const u8) -> bool {
        if self.is_full() {
            return false;
        }
        fence(Ordering::SeqCst);
        let write = self.write_idx.load(Ordering::Relaxed);
        // SAFETY: write is in-bounds (masked) and this slot is owned by
        // the producer until write_idx moves past it.
        let slot = unsafe { self.buffer.add(write * self.record_size) };
        (self.copy_release_param)(slot, src);
        fence(Ordering::SeqCst);
        self.write_idx.store((write + 1) & RELEASE_QUEUE_MASK, Ordering::SeqCst);
        true
    }

    fn read(&self) -> bool {
        if self.is_empty() {
            return false;
        }
        fence(Ordering::SeqCst);
        let read = self.read_idx.load(Ordering::Relaxed);
        // SAFETY: read < capacity and the slot was published by the
        // producer's fence before write_idx moved past it.
        let slot = unsafe { self.buffer.add(read * self.record_size) };
        // Destructor failures never propagate from the release thread;
        // log and keep draining.
        let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            (self.release_param)(slot)
        }));
        if outcome.is_err() {
            tracing::error!("release callback panicked; continuing with remaining records");
        }
        fence(Ordering::SeqCst);
        self.read_idx.store((read + 1) & RELEASE_QUEUE_MASK, Ordering::SeqCst);
        true
    }
}

impl Drop for ReleaseShared {
    fn drop(&mut self) {
        (self.delete_buffer)(self.buffer);
    }
}

/// The worker-to-releaser ring.
pub struct ReleaseQueue {
    shared: Arc<ReleaseShared>,
    releaser: Mutex<Option<JoinHandle<()>>>,
}

impl ReleaseQueue {
    pub(crate) fn new(callbacks: &QueueCallbacks) -> QueueResult<Self> {
        let buffer = (callbacks.new_buffer)(RELEASE_QUEUE_CAPACITY, callbacks.record_size);
        if buffer.is_null() {
            return Err(QueueError::Internal(
                "release ring buffer allocation failed".to_string(),
            ));
        }
        let shared = Arc::new(ReleaseShared {
            buffer,
            record_size: callbacks.record_size,
            write_idx: AtomicUsize::new(0),
            read_idx: AtomicUsize::new(0),
            status: AtomicStatus::new(RepoStatus::Init),
            copy_release_param: Arc::clone(&callbacks.copy_release_param),
            release_param: Arc::clone(&callbacks.release_param),
            delete_buffer: Arc::clone(&callbacks.delete_buffer),
        });

        let thread_shared = Arc::clone(&shared);
        let releaser = std::thread::Builder::new()
            .name("npu_release_thread".to_string())
            .spawn(move || release_loop(thread_shared))
            .map_err(|e| QueueError::Internal(format!("failed to spawn release thread: {}", e)))?;
        shared.status.store(RepoStatus::Run);

        Ok(ReleaseQueue {
            shared,
            releaser: Mutex::new(Some(releaser)),
        })
    }

    /// Queue one release-parameter record. Called by the submission
    /// worker's release callback; spins while the ring is full.
    pub fn push(&self, params: *const u8) {
        if self.shared.status.load() == RepoStatus::Init {
            tracing::error!("release queue is not initialized, ignoring push");
            return;
        }
        while !self.shared.write(params) {
            std::hint::spin_loop();
        }
    }
}

fn release_loop(shared: Arc<ReleaseShared>) {
    while shared.status.load() != RepoStatus::CanExit {
        if !shared.read() {
            // Remaining records are drained before the exit transition:
            // the transition only happens on an empty ring.
            if shared.status.load() == RepoStatus::NeedExit {
                shared.status.change(RepoStatus::NeedExit, RepoStatus::CanExit);
                break;
            }
            std::thread::sleep(Duration::from_micros(1));
        }
    }
}

impl Drop for ReleaseQueue {
    fn drop(&mut self) {
        self.shared.status.store(RepoStatus::NeedExit);
        let handle = match self.releaser.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(handle) = handle {
            if handle.join().is_err() {
                tracing::error!("release thread exited with a panic");
            }
        }
    }
}
