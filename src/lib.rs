//! Manual reference-counted memory manager.
//!
//! Blocks are handed out with an owner count of zero. Owners call [`retain`]
//! and [`release`]; when the count drops back to zero the block is queued and
//! reclaimed a few at a time (the cascade limit) by later allocate/release
//! calls, or all at once by [`cleanup`] and [`shutdown`].
//!
//! Teardown is either a custom [`Destructor`] or a conservative scan of the
//! payload that releases every word equal to the address of a live block.
//!
//! ```
//! let node = refmem::allocate(2 * size_of::<usize>(), None).unwrap();
//! let leaf = refmem::allocate(16, None).unwrap();
//! unsafe {
//!   refmem::retain(node);
//!   refmem::retain(leaf);
//!   // `node` owns `leaf`; the scan will release it when `node` goes away.
//!   node.as_ptr::<usize>().write(leaf.addr());
//!   refmem::release(node);
//! }
//! refmem::cleanup();
//! assert!(!refmem::is_registered(leaf.addr()));
//! ```
//!
//! The free functions operate on a per-thread [`RefMem`] configured from the
//! environment (see [`Config::from_env`]). Create a `RefMem` directly to
//! manage an independent heap.

#![allow(clippy::missing_safety_doc)]

mod block;
mod config;
mod error;
mod heap;
mod queue;
mod registry;

pub use block::{Destructor, Handle, MAX_BLOCK_SIZE, MAX_COUNT};
pub use config::{Config, DEFAULT_CASCADE_LIMIT};
pub use error::{RefMemError, Result};
pub use heap::{RefMem, Stats};

// =============================================================================
// TLS
// =============================================================================

thread_local! {
  static HEAP: RefMem = RefMem::with_config(Config::from_env());
}

/// Runs `f` against this thread's default allocator.
///
/// Destructors should use the `&RefMem` they are given rather than the free
/// functions: while the thread is exiting the default instance is already
/// being torn down and can no longer be reached through here.
pub fn with_heap<R, F: FnOnce(&RefMem) -> R>(f: F) -> R {
  HEAP.with(f)
}

// =============================================================================
// Default-instance API
// =============================================================================

/// [`RefMem::allocate`] on this thread's default heap.
pub fn allocate(size: usize, destructor: Option<Destructor>) -> Result<Handle> {
  with_heap(|heap| heap.allocate(size, destructor))
}

/// [`RefMem::allocate_array`] on this thread's default heap.
pub fn allocate_array(
  elements: usize,
  element_size: usize,
  destructor: Option<Destructor>,
) -> Result<Handle> {
  with_heap(|heap| heap.allocate_array(elements, element_size, destructor))
}

/// [`RefMem::allocate_str`] on this thread's default heap.
pub fn allocate_str(s: &str) -> Result<Handle> {
  with_heap(|heap| heap.allocate_str(s))
}

/// [`RefMem::retain`] on this thread's default heap.
///
/// # Safety
/// `handle` must come from this thread's default heap and must not have been
/// reclaimed.
pub unsafe fn retain(handle: Handle) {
  with_heap(|heap| unsafe { heap.retain(handle) })
}

/// [`RefMem::release`] on this thread's default heap.
///
/// # Safety
/// `handle` must come from this thread's default heap and must not have been
/// reclaimed.
pub unsafe fn release(handle: Handle) {
  with_heap(|heap| unsafe { heap.release(handle) })
}

/// # Safety
/// Same as [`release`] for `Some`.
pub unsafe fn release_opt(handle: Option<Handle>) {
  with_heap(|heap| unsafe { heap.release_opt(handle) })
}

/// # Safety
/// `handle` must not have been reclaimed.
pub unsafe fn count_of(handle: Handle) -> u16 {
  with_heap(|heap| unsafe { heap.count_of(handle) })
}

/// Sets how many queued blocks each allocate or release may reclaim.
pub fn set_cascade_limit(limit: usize) {
  with_heap(|heap| heap.set_cascade_limit(limit))
}

pub fn cascade_limit() -> usize {
  with_heap(|heap| heap.cascade_limit())
}

/// Whether `addr` is a live block of this thread's default heap.
pub fn is_registered(addr: usize) -> bool {
  with_heap(|heap| heap.is_registered(addr))
}

pub fn stats() -> Stats {
  with_heap(|heap| heap.stats())
}

/// Drains the default heap's free queue completely.
pub fn cleanup() -> usize {
  with_heap(|heap| heap.cleanup())
}

/// [`RefMem::shutdown`] on this thread's default heap.
pub fn shutdown() {
  with_heap(|heap| heap.shutdown())
}
