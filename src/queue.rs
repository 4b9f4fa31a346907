use core::{cell::Cell, ptr::null_mut};

use crate::block::Header;

/// FIFO of blocks whose count reached zero, linked through `queue_next`.
pub(crate) struct FreeQueue {
  head: Cell<*mut Header>,
  tail: Cell<*mut Header>,
  len: Cell<usize>,
}

impl FreeQueue {
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
    self.head.get().is_null()
  }

  pub(crate) unsafe fn enqueue(&self, block: *mut Header) {
    debug_assert!(unsafe { !(*block).queued }, "refmem: block {:p} queued twice", block);
    unsafe {
      (*block).queue_next = null_mut();
      (*block).queued = true;
    }

    let tail = self.tail.get();
    if tail.is_null() {
      self.head.set(block);
    } else {
      unsafe { (*tail).queue_next = block };
    }
    self.tail.set(block);
    self.len.set(self.len.get() + 1);
  }

  pub(crate) fn dequeue(&self) -> Option<*mut Header> {
    let head = self.head.get();
    if head.is_null() {
      return None;
    }

    unsafe {
      let next = (*head).queue_next;
      self.head.set(next);
      if next.is_null() {
        self.tail.set(null_mut());
      }
      (*head).queue_next = null_mut();
      (*head).queued = false;
    }
    self.len.set(self.len.get() - 1);
    Some(head)
  }
}
