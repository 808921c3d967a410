//! Embedding-runtime coupling shim
//!
//! When the producer thread blocks on a full ring while holding an
//! embedding runtime's global lock (a Python GIL, say), the lock must
//! be released around the wait or the worker can deadlock against it
//! (operator compilation on the worker may want the same lock). That
//! coupling lives behind this single function; in a build with no such
//! runtime it is a plain call.

/// Run `f` with any embedding-runtime global lock released.
#[inline]
pub(crate) fn blocking_region<R>(f: impl FnOnce() -> R) -> R {
    // No embedding runtime in this build.
    f()
}
