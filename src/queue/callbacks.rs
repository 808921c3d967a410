//! Task-record capability registration
//!
//! The queue never inspects the records it moves: the operator layer
//! registers, once per process, the capabilities needed to copy,
//! execute, and destroy records of its (fixed) size. Both rings share
//! one registration; the release ring only uses the release-param pair
//! and the buffer pair.

use std::alloc::Layout;
use std::sync::{Arc, Mutex};

use once_cell::sync::OnceCell;

use crate::queue::release_queue::ReleaseQueue;
use crate::queue::QueueError;

/// Launch the record's kernel; non-zero means the launch failed.
pub type ExecuteFn = Arc<dyn Fn(*mut u8) -> i32 + Send + Sync>;
/// Copy a caller record into a ring slot.
pub type CopyFn = Arc<dyn Fn(*mut u8, *const u8) + Send + Sync>;
/// Hand a consumed record's release work to the release ring.
pub type ReleaseFn = Arc<dyn Fn(*mut u8, &ReleaseQueue) + Send + Sync>;
/// Allocate a ring buffer of `capacity` records of `record_size` bytes.
pub type NewBufferFn = Arc<dyn Fn(usize, usize) -> *mut u8 + Send + Sync>;
/// Free a buffer produced by the paired [`NewBufferFn`].
pub type DeleteBufferFn = Arc<dyn Fn(*mut u8) + Send + Sync>;
/// Copy a release-parameter record into a release-ring slot.
pub type CopyReleaseParamFn = Arc<dyn Fn(*mut u8, *const u8) + Send + Sync>;
/// Run the destructor work of a release-parameter record.
pub type ReleaseParamFn = Arc<dyn Fn(*mut u8) + Send + Sync>;

/// The seven capabilities plus the per-record size, supplied once at
/// registration. The queues are polymorphic over this record.
#[derive(Clone)]
pub struct QueueCallbacks {
    pub execute: ExecuteFn,
    pub copy: CopyFn,
    pub release: ReleaseFn,
    pub new_buffer: NewBufferFn,
    pub delete_buffer: DeleteBufferFn,
    pub copy_release_param: CopyReleaseParamFn,
    pub release_param: ReleaseParamFn,
    /// Fixed size of every record, in bytes.
    pub record_size: usize,
}

impl std::fmt::Debug for QueueCallbacks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueCallbacks")
            .field("record_size", &self.record_size)
            .finish_non_exhaustive()
    }
}

/// Plain byte-array buffer callbacks for record types with no special
/// allocation needs. Both rings share one pair, so the layout of each
/// buffer is remembered by address for the matching deallocation.
pub fn byte_buffer_callbacks() -> (NewBufferFn, DeleteBufferFn) {
    let layouts: Arc<Mutex<std::collections::HashMap<usize, Layout>>> =
        Arc::new(Mutex::new(std::collections::HashMap::new()));

    let alloc_layouts = Arc::clone(&layouts);
    let new_buffer: NewBufferFn = Arc::new(move |capacity, record_size| {
        let layout = match Layout::array::<u8>(capacity * record_size) {
            Ok(layout) => layout,
            Err(_) => return std::ptr::null_mut(),
        };
        // SAFETY: the layout has non-zero size for any real ring.
        let ptr = unsafe { std::alloc::alloc_zeroed(layout) };
        if !ptr.is_null() {
            let mut table = match alloc_layouts.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            table.insert(ptr as usize, layout);
        }
        ptr
    });

    let delete_buffer: DeleteBufferFn = Arc::new(move |ptr| {
        if ptr.is_null() {
            return;
        }
        let layout = {
            let mut table = match layouts.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            table.remove(&(ptr as usize))
        };
        if let Some(layout) = layout {
            // SAFETY: ptr came from alloc_zeroed with this layout.
            unsafe { std::alloc::dealloc(ptr, layout) }
        }
    });

    (new_buffer, delete_buffer)
}

static QUEUE_CALLBACKS: OnceCell<QueueCallbacks> = OnceCell::new();

/// One-time process-wide registration of the task-record capabilities.
pub fn register_queue_callbacks(callbacks: QueueCallbacks) -> Result<(), QueueError> {
    if callbacks.record_size == 0 {
        return Err(QueueError::Internal("record size must be non-zero".to_string()));
    }
    QUEUE_CALLBACKS
        .set(callbacks)
        .map_err(|_| QueueError::AlreadyRegistered)
}

pub(crate) fn registered_callbacks() -> Option<&'static QueueCallbacks> {
    QUEUE_CALLBACKS.get()
}
