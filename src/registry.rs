use core::{cell::Cell, ptr::null_mut};

use crate::block::{HEADER_SIZE, Header};

/// Set of live blocks, threaded through the block headers.
///
/// Appending and removing never allocate, so the registry exists before the
/// first block does and needs no bootstrap allocation of its own.
pub(crate) struct Registry {
  head: Cell<*mut Header>,
  tail: Cell<*mut Header>,
  len: Cell<usize>,
}

impl Registry {
  pub(crate) const fn new() -> Self {
    Self {
      head: Cell::new(null_mut()),
      tail: Cell::new(null_mut()),
      len: Cell::new(0),
    }
  }

  #[inline]
  pub(crate) fn len(&self) -> usize {
    self.len.get()
  }

  #[inline]
  pub(crate) fn is_empty(&self) -> bool {
    self.len.get() == 0
  }

  /// Link `block` at the tail.
  pub(crate) unsafe fn append(&self, block: *mut Header) {
    debug_assert!(unsafe { !(*block).registered });
    let tail = self.tail.get();
    unsafe {
      (*block).prev = tail;
      (*block).next = null_mut();
      (*block).registered = true;
    }

    if tail.is_null() {
      self.head.set(block);
    } else {
      unsafe { (*tail).next = block };
    }
    self.tail.set(block);
    self.len.set(self.len.get() + 1);
  }

  /// Unlink `block` in O(1). Blocks that were detached by a shutdown are ignored.
  pub(crate) unsafe fn remove(&self, block: *mut Header) {
    if unsafe { !(*block).registered } {
      return;
    }

    let (prev, next) = unsafe { ((*block).prev, (*block).next) };
    if prev.is_null() {
      self.head.set(next);
    } else {
      unsafe { (*prev).next = next };
    }
    if next.is_null() {
      self.tail.set(prev);
    } else {
      unsafe { (*next).prev = prev };
    }

    unsafe {
      (*block).prev = null_mut();
      (*block).next = null_mut();
      (*block).registered = false;
    }
    self.len.set(self.len.get() - 1);
  }

  /// Header of the live block whose payload starts at `addr`, if any.
  ///
  /// Compares addresses only: `addr` itself is never dereferenced, so any bit
  /// pattern is a safe query.
  pub(crate) fn find(&self, addr: usize) -> Option<*mut Header> {
    let mut cur = self.head.get();
    while !cur.is_null() {
      if cur as usize + HEADER_SIZE == addr {
        return Some(cur);
      }
      cur = unsafe { (*cur).next };
    }
    None
  }

  #[inline]
  pub(crate) fn contains(&self, addr: usize) -> bool {
    self.find(addr).is_some()
  }

  /// Forget every block without freeing it. Returns how many were dropped.
  pub(crate) fn detach_all(&self) -> usize {
    let detached = self.len.get();
    let mut cur = self.head.get();
    while !cur.is_null() {
      unsafe {
        let next = (*cur).next;
        (*cur).prev = null_mut();
        (*cur).next = null_mut();
        (*cur).registered = false;
        cur = next;
      }
    }

    self.head.set(null_mut());
    self.tail.set(null_mut());
    self.len.set(0);
    detached
  }
}
