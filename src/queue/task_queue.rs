//! Submission ring
//!
//! Host threads enqueue fixed-size kernel-launch records; a dedicated
//! per-device consumer thread replays them against the driver in FIFO
//! order and hands each consumed record's destructor work to the
//! release ring. The ring is bounded (power-of-two capacity, bit-mask
//! indices) and the two sides synchronise through three one-shot wake
//! primitives:
//!
//! - the producer blocks on `efd_write` when the ring is full and is
//!   woken after a dequeue,
//! - the consumer blocks on `efd_read` when the ring is empty and is
//!   woken after an enqueue,
//! - a drain (`make_sure_queue_empty`) blocks on `efd_empty`, which the
//!   consumer signals when it empties the ring with the `need_empty`
//!   flag set.
//!
//! If a launch fails, the consumer stops submitting, drains the rest of
//! the ring through the release callback only, and parks the failure;
//! the next host-visible call (`enqueue` or the drain) surfaces it.

use std::sync::atomic::{fence, AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use crate::backend::npu_backend::NpuDriver;
use crate::queue::callbacks::QueueCallbacks;
use crate::queue::notify::Notifier;
use crate::queue::release_queue::ReleaseQueue;
use crate::queue::runtime_shim;
use crate::queue::status::{AtomicStatus, RepoStatus};
use crate::queue::{QueueError, QueueResult};

// If the capacity is too large, a full ring pins a large amount of
// device memory at once; too small, and a fast host thread cannot keep
// the consumer busy.
const QUEUE_CAPACITY: usize = 4096;
const QUEUE_MASK: usize = QUEUE_CAPACITY - 1;

enum ReadOutcome {
    /// Nothing to consume.
    Empty,
    /// One record executed and released.
    Processed,
    /// The execute callback failed; the ring has been drained through
    /// the release callback.
    Failed(i32),
}

struct QueueShared {
    buffer: *mut u8,
    record_size: usize,
    device: usize,
    driver: Arc<dyn NpuDriver>,
    callbacks: QueueCallbacks,
    release_queue: Arc<ReleaseQueue>,
    /// Bypass the ring and run every record on the producer thread.
    synchronous: bool,

    write_idx: AtomicUsize,
    read_idx: AtomicUsize,
    write_working: AtomicBool,
    read_working: AtomicBool,
    need_empty: AtomicBool,
    status: AtomicStatus,

    efd_read: Notifier,
    efd_write: Notifier,
    efd_empty: Notifier,

    /// Serialises producers (a safety net if several ever appear).
    enqueue_mutex: Mutex<()>,
    /// Serialises drain waiters.
    empty_mutex: Mutex<()>,
    /// A kernel failure parked by the consumer, surfaced at the next
    /// host-visible call.
    fatal_error: Mutex<Option<QueueError>>,
}

// SAFETY: the slot range [read_idx, write_idx) is owned by the
// consumer, the rest by the (mutex-serialised) producer; every index
// advance is fenced after the slot bytes are written or consumed, so
// no slot is ever touched from two threads at once. The raw buffer
// pointer itself is set once at init and freed only after both
// threads are joined.
unsafe impl Send for QueueShared {}
unsafe impl Sync for QueueShared {}

impl QueueShared {
    fn is_empty(&self) -> bool {
        self.read_idx.load(Ordering::SeqCst) == self.write_idx.load(Ordering::SeqCst)
    }

    fn is_full(&self) -> bool {
        (self.write_idx.load(Ordering::SeqCst) + 1) & QUEUE_MASK
            == self.read_idx.load(Ordering::SeqCst)
    }

    fn fatal(&self) -> Option<QueueError> {
        match self.fatal_error.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    fn set_fatal(&self, error: QueueError) {
        let mut slot = match self.fatal_error.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        slot.get_or_insert(error);
    }

    fn write_queue(&self, record: *const u8) -> bool {
        let _guard = match self.enqueue_mutex.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if self.is_full() {
            return false;
        }
        fence(Ordering::SeqCst);
        let write = self.write_idx.load(Ordering::Relaxed);
        // SAFETY: write is masked in-bounds and the slot is owned by
        // the producer until write_idx moves past it.
        let slot = unsafe { self.buffer.add(write * self.record_size) };
        (self.callbacks.copy)(slot, record);
        fence(Ordering::SeqCst);
        self.write_idx.store((write + 1) & QUEUE_MASK, Ordering::SeqCst);
        true
    }

    fn read_queue(&self) -> ReadOutcome {
        if self.is_empty() {
            return ReadOutcome::Empty;
        }
        fence(Ordering::SeqCst);
        let read = self.read_idx.load(Ordering::Relaxed);
        // SAFETY: read is masked in-bounds and the producer's fence
        // published the slot before write_idx moved past it.
        let slot = unsafe { self.buffer.add(read * self.record_size) };
        let ret = (self.callbacks.execute)(slot);
        if ret != 0 {
            tracing::error!(
                "task execution failed: device = {}, write_idx = {}, read_idx = {}, ret = {}",
                self.device,
                self.write_idx.load(Ordering::SeqCst),
                read,
                ret
            );
            // Further launches are meaningless after a failure, but the
            // queued records' release work must still run.
            let mut idx = read;
            while !self.is_empty() {
                // SAFETY: same slot ownership argument as above.
                let slot = unsafe { self.buffer.add(idx * self.record_size) };
                (self.callbacks.release)(slot, &self.release_queue);
                idx = (idx + 1) & QUEUE_MASK;
                self.read_idx.store(idx, Ordering::SeqCst);
            }
            return ReadOutcome::Failed(ret);
        }
        (self.callbacks.release)(slot, &self.release_queue);
        fence(Ordering::SeqCst);
        self.read_idx.store((read + 1) & QUEUE_MASK, Ordering::SeqCst);
        ReadOutcome::Processed
    }
}

impl Drop for QueueShared {
    fn drop(&mut self) {
        (self.callbacks.delete_buffer)(self.buffer);
    }
}

/// The host-to-worker submission ring for one device.
pub struct TaskQueue {
    shared: Arc<QueueShared>,
    consumer: Mutex<Option<JoinHandle<()>>>,
}

impl TaskQueue {
    /// Build the ring and start the consumer thread. Whether the ring
    /// is actually used follows the process-wide option toggles.
    pub fn new(
        device: usize,
        driver: Arc<dyn NpuDriver>,
        callbacks: QueueCallbacks,
    ) -> QueueResult<Self> {
        let synchronous = !crate::options::task_queue_enabled();
        Self::with_mode(device, driver, callbacks, synchronous)
    }

    /// Build with an explicit submission mode. `synchronous` bypasses
    /// the ring: every record runs on the producer thread.
    pub fn with_mode(
        device: usize,
        driver: Arc<dyn NpuDriver>,
        callbacks: QueueCallbacks,
        synchronous: bool,
    ) -> QueueResult<Self> {
        if callbacks.record_size == 0 {
            return Err(QueueError::Internal("record size must be non-zero".to_string()));
        }
        let release_queue = Arc::new(ReleaseQueue::new(&callbacks)?);

        let buffer = (callbacks.new_buffer)(QUEUE_CAPACITY, callbacks.record_size);
        if buffer.is_null() {
            return Err(QueueError::Internal(
                "submission ring buffer allocation failed".to_string(),
            ));
        }
        let shared = Arc::new(QueueShared {
            buffer,
            record_size: callbacks.record_size,
            device,
            driver,
            callbacks,
            release_queue,
            synchronous,
            write_idx: AtomicUsize::new(0),
            read_idx: AtomicUsize::new(0),
            write_working: AtomicBool::new(false),
            read_working: AtomicBool::new(false),
            need_empty: AtomicBool::new(false),
            status: AtomicStatus::new(RepoStatus::Init),
            efd_read: Notifier::new(),
            efd_write: Notifier::new(),
            efd_empty: Notifier::new(),
            enqueue_mutex: Mutex::new(()),
            empty_mutex: Mutex::new(()),
            fatal_error: Mutex::new(None),
        });

        let consumer = if synchronous {
            tracing::info!("task queue disabled for device {}: synchronous submission", device);
            None
        } else {
            let thread_shared = Arc::clone(&shared);
            let handle = std::thread::Builder::new()
                .name(format!("npu_queue_{}", device))
                .spawn(move || consume_loop(thread_shared))
                .map_err(|e| {
                    QueueError::Internal(format!("failed to spawn consumer thread: {}", e))
                })?;
            tracing::info!("task queue enabled for device {}", device);
            Some(handle)
        };
        shared.status.store(RepoStatus::Run);

        Ok(TaskQueue {
            shared,
            consumer: Mutex::new(consumer),
        })
    }

    pub fn status(&self) -> RepoStatus {
        self.shared.status.load()
    }

    /// Copy one record into the ring. Blocks while the ring is full.
    ///
    /// Calls after the consumer has exited are logged and ignored; a
    /// kernel failure parked by the consumer is returned instead.
    pub fn enqueue(&self, record: *const u8) -> QueueResult<()> {
        if let Some(error) = self.shared.fatal() {
            return Err(error);
        }
        if self.shared.synchronous {
            return self.run_synchronous(record);
        }
        let status = self.shared.status.load();
        if status != RepoStatus::Run && status != RepoStatus::Init {
            tracing::error!("task queue thread has exited, ignoring enqueue");
            return Ok(());
        }

        let shared = &self.shared;
        shared.write_working.store(true, Ordering::SeqCst);
        loop {
            if shared.write_queue(record) {
                fence(Ordering::SeqCst);
                if !shared.read_working.load(Ordering::SeqCst) {
                    shared.efd_read.notify();
                }
                break;
            }
            shared.write_working.store(false, Ordering::SeqCst);
            fence(Ordering::SeqCst);
            if shared.is_full() {
                // The wait may suspend the host for a while; any
                // embedding-runtime lock must not be held across it.
                runtime_shim::blocking_region(|| shared.efd_write.wait());
            }
            if let Some(error) = shared.fatal() {
                return Err(error);
            }
            let status = shared.status.load();
            if status != RepoStatus::Run && status != RepoStatus::Init {
                tracing::error!("task queue thread exited while enqueue was blocked");
                return Ok(());
            }
            shared.write_working.store(true, Ordering::SeqCst);
        }
        shared.write_working.store(false, Ordering::SeqCst);
        Ok(())
    }

    /// Block until the consumer has drained every queued record.
    pub fn make_sure_queue_empty(&self) -> QueueResult<()> {
        let shared = &self.shared;
        if shared.synchronous {
            return match shared.fatal() {
                Some(error) => Err(error),
                None => Ok(()),
            };
        }
        loop {
            if let Some(error) = shared.fatal() {
                return Err(error);
            }
            if shared.is_empty() {
                return Ok(());
            }
            if shared.status.load() == RepoStatus::CanExit {
                return Err(QueueError::Internal(
                    "task queue exited with records still pending".to_string(),
                ));
            }
            let _guard = match shared.empty_mutex.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            shared.need_empty.store(true, Ordering::SeqCst);
            fence(Ordering::SeqCst);
            // Double-check before sleeping: the consumer may have
            // drained the ring between the check and the flag.
            if !shared.is_empty() {
                runtime_shim::blocking_region(|| shared.efd_empty.wait());
            }
            shared.need_empty.store(false, Ordering::SeqCst);
        }
    }

    fn run_synchronous(&self, record: *const u8) -> QueueResult<()> {
        let shared = &self.shared;
        let mut scratch = vec![0u8; shared.record_size];
        let slot = scratch.as_mut_ptr();
        (shared.callbacks.copy)(slot, record);
        let ret = (shared.callbacks.execute)(slot);
        if ret != 0 {
            return Err(QueueError::KernelFailure { code: ret });
        }
        (shared.callbacks.release)(slot, &shared.release_queue);
        Ok(())
    }
}

fn consume_loop(shared: Arc<QueueShared>) {
    // Kernel launches from this thread target the queue's device.
    if let Err(e) = shared.driver.set_device(shared.device) {
        tracing::error!("task queue consumer failed to set device {}: {}", shared.device, e);
    }
    while shared.status.load() != RepoStatus::CanExit {
        dequeue(&shared);
    }
}

/// One consumer round: block until a record was processed (or an exit
/// was observed), then run the post-consume handshakes.
fn dequeue(shared: &QueueShared) {
    shared.read_working.store(true, Ordering::SeqCst);
    let mut processed = false;
    while !processed && shared.status.load() != RepoStatus::CanExit {
        match shared.read_queue() {
            ReadOutcome::Empty => {
                if shared.status.load() == RepoStatus::NeedExit {
                    shared.status.change(RepoStatus::NeedExit, RepoStatus::CanExit);
                    break;
                }
                shared.read_working.store(false, Ordering::SeqCst);
                fence(Ordering::SeqCst);
                if shared.is_empty() {
                    shared.efd_read.wait();
                    shared.read_working.store(true, Ordering::SeqCst);
                }
            }
            ReadOutcome::Failed(code) => {
                shared.set_fatal(QueueError::KernelFailure { code });
                shared.status.store(RepoStatus::CanExit);
                // Release every waiter so the parked failure can
                // surface at the next host call.
                shared.efd_write.notify();
                shared.efd_empty.notify();
                break;
            }
            ReadOutcome::Processed => {
                fence(Ordering::SeqCst);
                if shared.need_empty.load(Ordering::SeqCst) && shared.is_empty() {
                    shared.efd_empty.notify();
                }
                if !shared.write_working.load(Ordering::SeqCst) {
                    shared.efd_write.notify();
                }
                processed = true;
            }
        }
    }
    shared.read_working.store(false, Ordering::SeqCst);
}

impl Drop for TaskQueue {
    fn drop(&mut self) {
        let handle = match self.consumer.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(handle) = handle {
            self.shared.status.store(RepoStatus::NeedExit);
            // Escape a blocked wait so the consumer can observe the
            // status and acknowledge with CanExit.
            self.shared.efd_read.notify();
            if handle.join().is_err() {
                tracing::error!("task queue consumer exited with a panic");
            }
            self.shared.efd_empty.notify();
        }
    }
}
