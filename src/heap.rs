use core::cell::Cell;

use crate::block::{
  Destructor, Handle, Header, MAX_COUNT, WORD, alloc_block, check_header, free_block,
};
use crate::config::{Config, DEFAULT_CASCADE_LIMIT};
use crate::error::{RefMemError, Result};
use crate::queue::FreeQueue;
use crate::registry::Registry;

// =============================================================================
// Types
// =============================================================================

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum Lifecycle {
  /// Nothing allocated since construction or the last shutdown.
  Uninitialized,
  Active,
}

/// Point-in-time view of allocator bookkeeping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Stats {
  /// Registered blocks, including those waiting in the free queue.
  pub live: usize,
  /// Blocks at count zero that have not been reclaimed yet.
  pub pending: usize,
  /// Blocks handed out since the last shutdown.
  pub allocations: u64,
  /// Blocks physically freed since the last shutdown.
  pub reclamations: u64,
}

/// Reference-counting allocator context.
///
/// Owns the live-block registry, the deferred-free queue and the cascade
/// limit. Single-threaded: the type is neither `Send` nor `Sync`.
///
/// Every `allocate*` call and every release that drops a count to zero also
/// reclaims up to `cascade_limit` queued blocks, oldest first. Reclamation
/// triggered from inside a destructor is only queued, never run recursively.
///
/// Blocks without a destructor are torn down by a conservative scan: each
/// pointer-sized slot of the payload that equals the address of a live block
/// is released once. The scan cannot tell owning references from stray bit
/// patterns or borrowed back-pointers, so types holding non-owning references
/// to other blocks need a custom [`Destructor`] that skips them.
pub struct RefMem {
  config: Config,
  cascade_limit: Cell<usize>,
  registry: Registry,
  queue: FreeQueue,
  state: Cell<Lifecycle>,
  /// Set while a reclamation is running; suppresses nested drains.
  reclaiming: Cell<bool>,
  allocations: Cell<u64>,
  reclamations: Cell<u64>,
}

/// Restores the previous `reclaiming` value on drop, panics included.
struct ReclaimGuard<'a> {
  flag: &'a Cell<bool>,
  prev: bool,
}

impl<'a> ReclaimGuard<'a> {
  fn enter(flag: &'a Cell<bool>) -> Self {
    let prev = flag.replace(true);
    Self { flag, prev }
  }
}

impl Drop for ReclaimGuard<'_> {
  fn drop(&mut self) {
    self.flag.set(self.prev);
  }
}

impl Default for RefMem {
  fn default() -> Self {
    Self::new()
  }
}

impl RefMem {
  pub const fn new() -> Self {
    Self::with_config(Config {
      cascade_limit: DEFAULT_CASCADE_LIMIT,
    })
  }

  pub const fn with_config(config: Config) -> Self {
    Self {
      config,
      cascade_limit: Cell::new(config.cascade_limit),
      registry: Registry::new(),
      queue: FreeQueue::new(),
      state: Cell::new(Lifecycle::Uninitialized),
      reclaiming: Cell::new(false),
      allocations: Cell::new(0),
      reclamations: Cell::new(0),
    }
  }

  // ===========================================================================
  // Allocation
  // ===========================================================================

  /// Allocates `size` zeroed bytes with owner count 0.
  ///
  /// The caller normally `retain`s the result right away. Also reclaims up to
  /// `cascade_limit` queued blocks.
  pub fn allocate(&self, size: usize, destructor: Option<Destructor>) -> Result<Handle> {
    self.activate();
    self.drain(self.cascade_limit.get());

    let block = alloc_block(size, destructor).inspect_err(|err| {
      log::warn!("[refmem] allocate({}) failed: {}", size, err);
    })?;
    unsafe { self.registry.append(block) };
    self.allocations.set(self.allocations.get() + 1);

    let handle = unsafe { Handle::from_header(block) };
    log::trace!("[refmem] allocate({}) -> {:?}", size, handle);
    Ok(handle)
  }

  /// Allocates room for `elements` items of `element_size` bytes each.
  pub fn allocate_array(
    &self,
    elements: usize,
    element_size: usize,
    destructor: Option<Destructor>,
  ) -> Result<Handle> {
    let size = elements
      .checked_mul(element_size)
      .ok_or(RefMemError::SizeOverflow {
        elements,
        element_size,
      })?;
    self.allocate(size, destructor)
  }

  /// Copies `s` plus a trailing NUL into a new block and retains it once.
  pub fn allocate_str(&self, s: &str) -> Result<Handle> {
    let handle = self.allocate_array(s.len() + 1, 1, None)?;
    unsafe {
      core::ptr::copy_nonoverlapping(s.as_ptr(), handle.as_ptr::<u8>(), s.len());
      self.retain(handle);
    }
    Ok(handle)
  }

  fn activate(&self) {
    if self.state.get() == Lifecycle::Uninitialized {
      self.state.set(Lifecycle::Active);
      log::debug!(
        "[refmem] initialized (cascade limit {})",
        self.cascade_limit.get()
      );
    }
  }

  // ===========================================================================
  // Reference counting
  // ===========================================================================

  /// Adds an owner to `handle`.
  ///
  /// A block already at [`MAX_COUNT`](crate::MAX_COUNT) owners is treated as
  /// leaked and reclaimed on the spot instead; the handle is dangling after
  /// such a call.
  ///
  /// # Panics
  /// If the block already lost its last owner and sits in the free queue.
  ///
  /// # Safety
  /// `handle` must come from this allocator and must not have been reclaimed.
  pub unsafe fn retain(&self, handle: Handle) {
    let block = handle.header();
    unsafe { check_header(block) };

    if unsafe { (*block).queued } {
      log::error!(
        "[refmem] retain({:?}) on a block queued for reclamation; its last owner is gone",
        handle
      );
      panic!(
        "refmem: retain of {:p} after its last release (block is queued for reclamation)",
        handle.as_ptr::<u8>()
      );
    }

    let count = unsafe { (*block).count };
    if count == MAX_COUNT {
      log::debug!(
        "[refmem] retain({:?}) would overflow the owner count, reclaiming",
        handle
      );
      let _guard = ReclaimGuard::enter(&self.reclaiming);
      unsafe { self.reclaim(block) };
      return;
    }

    unsafe { (*block).count = count + 1 };
    log::trace!("[refmem] retain({:?}) -> {}", handle, count + 1);
  }

  /// Drops an owner from `handle`.
  ///
  /// At zero the block is queued for reclamation, then a bounded drain runs.
  ///
  /// # Panics
  /// If the block has no owners left or is already queued for reclamation.
  /// That means the ownership graph is already corrupt somewhere else.
  ///
  /// # Safety
  /// `handle` must come from this allocator and must not have been reclaimed.
  pub unsafe fn release(&self, handle: Handle) {
    let block = handle.header();
    unsafe { check_header(block) };

    if unsafe { (*block).queued } {
      log::error!(
        "[refmem] release({:?}) on a block queued for reclamation; more releases than retains",
        handle
      );
      panic!(
        "refmem: release of {:p} while queued for reclamation (more releases than retains)",
        handle.as_ptr::<u8>()
      );
    }

    let count = unsafe { (*block).count };
    if count == 0 {
      log::error!(
        "[refmem] release({:?}) on a block with no owners; more releases than retains",
        handle
      );
      panic!(
        "refmem: release of {:p} with zero owners (more releases than retains)",
        handle.as_ptr::<u8>()
      );
    }

    unsafe { (*block).count = count - 1 };
    log::trace!("[refmem] release({:?}) -> {}", handle, count - 1);

    if count == 1 {
      unsafe { self.queue.enqueue(block) };
      self.drain(self.cascade_limit.get());
    }
  }

  /// `release` that accepts an absent handle as a no-op.
  ///
  /// # Safety
  /// Same as [`RefMem::release`] for `Some`.
  pub unsafe fn release_opt(&self, handle: Option<Handle>) {
    if let Some(handle) = handle {
      unsafe { self.release(handle) };
    }
  }

  /// Current owner count. Diagnostic only.
  ///
  /// # Safety
  /// `handle` must not have been reclaimed.
  pub unsafe fn count_of(&self, handle: Handle) -> u16 {
    let block = handle.header();
    unsafe {
      check_header(block);
      (*block).count
    }
  }

  /// Payload length in bytes.
  ///
  /// # Safety
  /// `handle` must not have been reclaimed.
  pub unsafe fn size_of(&self, handle: Handle) -> usize {
    let block = handle.header();
    unsafe {
      check_header(block);
      (*block).size as usize
    }
  }

  /// # Safety
  /// `handle` must not have been reclaimed.
  pub unsafe fn destructor_of(&self, handle: Handle) -> Option<Destructor> {
    let block = handle.header();
    unsafe {
      check_header(block);
      (*block).destructor
    }
  }

  // ===========================================================================
  // Deferred reclamation
  // ===========================================================================

  /// Reclaims up to `limit` queued blocks in FIFO order. Returns how many.
  ///
  /// Does nothing when called from inside a destructor.
  pub fn drain(&self, limit: usize) -> usize {
    if self.reclaiming.get() || limit == 0 {
      return 0;
    }
    let _guard = ReclaimGuard::enter(&self.reclaiming);

    let mut freed = 0;
    while freed < limit {
      let Some(block) = self.queue.dequeue() else {
        break;
      };
      unsafe { self.reclaim(block) };
      freed += 1;
    }

    if freed > 0 {
      log::debug!(
        "[refmem] drained {} block(s), {} still queued",
        freed,
        self.queue.len()
      );
    }
    freed
  }

  /// Reclaims until the queue is empty, following any cascade to the end.
  pub fn drain_all(&self) -> usize {
    self.drain(usize::MAX)
  }

  /// Runs teardown, unregisters and frees. Caller holds the reclaim guard.
  unsafe fn reclaim(&self, block: *mut Header) {
    debug_assert!(self.reclaiming.get());
    let handle = unsafe { Handle::from_header(block) };

    match unsafe { (*block).destructor } {
      Some(destructor) => destructor(self, handle),
      None => unsafe { self.scan(handle) },
    }

    unsafe {
      self.registry.remove(block);
      free_block(block);
    }
    self.reclamations.set(self.reclamations.get() + 1);
    log::trace!("[refmem] reclaimed {:?}", handle);
  }

  /// Default teardown: release every payload word that names a live block.
  ///
  /// Only whole words are inspected; a trailing partial word is skipped. A
  /// word holding the block's own address is skipped too, since a block can
  /// never own itself.
  unsafe fn scan(&self, handle: Handle) {
    let block = handle.header();
    let slots = unsafe { (*block).size as usize } / WORD;
    let base = handle.as_ptr::<usize>();

    for i in 0..slots {
      let candidate = unsafe { base.add(i).read() };
      if candidate == handle.addr() {
        continue;
      }
      if let Some(child) = self.registry.find(candidate) {
        log::trace!(
          "[refmem] scan {:?}: slot {} holds {:#x}",
          handle,
          i,
          candidate
        );
        unsafe { self.release(Handle::from_header(child)) };
      }
    }
  }

  // ===========================================================================
  // Settings & diagnostics
  // ===========================================================================

  pub fn set_cascade_limit(&self, limit: usize) {
    self.cascade_limit.set(limit);
  }

  pub fn cascade_limit(&self) -> usize {
    self.cascade_limit.get()
  }

  /// Whether `addr` is the payload address of a block that is not yet freed.
  pub fn is_registered(&self, addr: usize) -> bool {
    self.registry.contains(addr)
  }

  pub fn stats(&self) -> Stats {
    Stats {
      live: self.registry.len(),
      pending: self.queue.len(),
      allocations: self.allocations.get(),
      reclamations: self.reclamations.get(),
    }
  }

  // ===========================================================================
  // Lifecycle
  // ===========================================================================

  /// Drains the free queue completely. Registry and counts stay as they are.
  pub fn cleanup(&self) -> usize {
    self.drain_all()
  }

  /// Tears the allocator down to its pre-initialization state.
  ///
  /// Drains the queue, forgets every block that is still owned (those are
  /// leaked and reported, not freed) and resets counters and the cascade
  /// limit. The next `allocate` starts a fresh cycle. A leaked block stays
  /// valid memory; releasing it to zero later still queues and reclaims it,
  /// at the latest when the context is dropped.
  pub fn shutdown(&self) {
    if self.reclaiming.get() {
      log::error!("[refmem] shutdown requested from inside a destructor; ignored");
      return;
    }
    if self.state.get() == Lifecycle::Uninitialized {
      log::warn!("[refmem] shutdown on an allocator that is not initialized");
      return;
    }

    let drained = self.cleanup();
    let leaked = self.registry.detach_all();
    if leaked > 0 {
      log::warn!(
        "[refmem] shutdown: {} block(s) still owned, leaking them",
        leaked
      );
    }
    debug_assert!(self.queue.is_empty() && self.registry.is_empty());

    log::debug!(
      "[refmem] shutdown: {} allocated, {} reclaimed ({} in final drain)",
      self.allocations.get(),
      self.reclamations.get(),
      drained
    );
    self.cascade_limit.set(self.config.cascade_limit);
    self.allocations.set(0);
    self.reclamations.set(0);
    self.state.set(Lifecycle::Uninitialized);
  }

  pub fn is_active(&self) -> bool {
    self.state.get() == Lifecycle::Active
  }
}

impl Drop for RefMem {
  fn drop(&mut self) {
    if self.is_active() {
      self.shutdown();
    } else if !self.queue.is_empty() {
      // Blocks leaked by an earlier shutdown and released since.
      self.drain_all();
    }
  }
}
