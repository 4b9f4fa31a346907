use core::{
  fmt,
  mem::{align_of, size_of},
  ptr::{self, NonNull, null_mut},
};

use crate::error::{RefMemError, Result};
use crate::heap::RefMem;

// =============================================================================
// Constants
// =============================================================================

/// Magic number stamped into every live header.
pub(crate) const BLOCK_MAGIC: u32 = 0x5245_464D; // "REFM"

pub(crate) const HEADER_SIZE: usize = size_of::<Header>();
const HEADER_ALIGN: usize = align_of::<Header>();

/// Width of one conservative-scan slot.
pub(crate) const WORD: usize = size_of::<usize>();

/// Owner count at which `retain` reclaims instead of incrementing.
pub const MAX_COUNT: u16 = u16::MAX;

/// Largest payload a single block can describe.
pub const MAX_BLOCK_SIZE: usize = u32::MAX as usize;

// =============================================================================
// Compile-Time Assertions
// =============================================================================

const _: () = assert!(HEADER_SIZE % 16 == 0);
const _: () = assert!(HEADER_ALIGN == 16);
const _: () = assert!(HEADER_ALIGN >= size_of::<*mut u8>());
const _: () = assert!(size_of::<Option<Destructor>>() == size_of::<usize>());

// =============================================================================
// Types
// =============================================================================

/// Custom teardown for a block. Runs once, right before the block is freed.
///
/// The destructor gets the owning allocator so it can release the handles the
/// block holds. It must not release the block itself.
pub type Destructor = fn(&RefMem, Handle);

/// Block metadata. Sits directly in front of the payload.
#[repr(C, align(16))]
pub(crate) struct Header {
  /// Registry links (intrusive, doubly linked).
  pub(crate) prev: *mut Header,
  pub(crate) next: *mut Header,
  /// Deferred-free queue link (intrusive, singly linked).
  pub(crate) queue_next: *mut Header,
  /// `None` = conservative scan on teardown.
  pub(crate) destructor: Option<Destructor>,
  /// Payload length in bytes.
  pub(crate) size: u32,
  pub(crate) magic: u32,
  /// Retaining owners, saturating at `MAX_COUNT`.
  pub(crate) count: u16,
  pub(crate) queued: bool,
  pub(crate) registered: bool,
}

/// Opaque reference to one managed allocation.
///
/// Points at the first payload byte. Copying a handle does not retain it;
/// ownership is tracked explicitly with `retain`/`release`.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct Handle(NonNull<u8>);

impl Handle {
  /// Rebuilds a handle from a payload pointer previously obtained from
  /// [`Handle::as_ptr`]. Returns `None` for null.
  ///
  /// # Safety
  /// A non-null `ptr` must be the payload address of a block allocated by a
  /// `RefMem` that has not been reclaimed yet.
  pub unsafe fn from_ptr(ptr: *mut u8) -> Option<Self> {
    NonNull::new(ptr).map(Self)
  }

  #[inline]
  pub fn as_ptr<T>(self) -> *mut T {
    self.0.as_ptr().cast()
  }

  #[inline]
  pub fn addr(self) -> usize {
    self.0.as_ptr() as usize
  }

  #[inline]
  pub(crate) fn header(self) -> *mut Header {
    self.0.as_ptr().wrapping_sub(HEADER_SIZE).cast()
  }

  #[inline]
  pub(crate) unsafe fn from_header(header: *mut Header) -> Self {
    Self(unsafe { NonNull::new_unchecked(header.cast::<u8>().add(HEADER_SIZE)) })
  }
}

impl fmt::Debug for Handle {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "Handle({:p})", self.0)
  }
}

// =============================================================================
// Platform
// =============================================================================

/// Allocates a zeroed header + payload with `count = 0` and no links.
pub(crate) fn alloc_block(size: usize, destructor: Option<Destructor>) -> Result<*mut Header> {
  if size > MAX_BLOCK_SIZE {
    return Err(RefMemError::TooLarge {
      requested: size,
      max: MAX_BLOCK_SIZE,
    });
  }

  let Some(total) = HEADER_SIZE.checked_add(size) else {
    return Err(RefMemError::TooLarge {
      requested: size,
      max: MAX_BLOCK_SIZE,
    });
  };
  let mut raw: *mut libc::c_void = null_mut();
  let rc = unsafe { libc::posix_memalign(&mut raw, HEADER_ALIGN, total) };
  if rc != 0 || raw.is_null() {
    return Err(RefMemError::OutOfMemory { requested: size });
  }

  let header = raw.cast::<Header>();
  unsafe {
    ptr::write_bytes(raw.cast::<u8>(), 0, total);
    header.write(Header {
      prev: null_mut(),
      next: null_mut(),
      queue_next: null_mut(),
      destructor,
      size: size as u32,
      magic: BLOCK_MAGIC,
      count: 0,
      queued: false,
      registered: false,
    });
  }
  Ok(header)
}

/// Returns a block to the system. The header must already be unlinked.
pub(crate) unsafe fn free_block(header: *mut Header) {
  debug_assert!(unsafe { !(*header).registered && !(*header).queued });
  // Clear so a stale handle trips `check_header` while the memory is still mapped.
  unsafe { (*header).magic = 0 };
  unsafe { libc::free(header.cast()) };
}

#[inline]
pub(crate) unsafe fn check_header(header: *mut Header) {
  debug_assert!(header.is_aligned(), "refmem: misaligned handle {:p}", header);
  debug_assert!(
    unsafe { (*header).magic } == BLOCK_MAGIC,
    "refmem: {:p} is not a live refmem block",
    header
  );
}
