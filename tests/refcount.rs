/*!
 * Reference counting tests
 * Counting, saturation, over-release and allocation failures
 */

use pretty_assertions::assert_eq;
use proptest::prelude::*;
use refmem::{Handle, MAX_COUNT, RefMem, RefMemError, Stats};
use std::cell::Cell;

thread_local! {
  static TORN_DOWN: Cell<usize> = const { Cell::new(0) };
}

fn count_teardown(_heap: &RefMem, _handle: Handle) {
  TORN_DOWN.with(|n| n.set(n.get() + 1));
}

fn torn_down() -> usize {
  TORN_DOWN.with(|n| n.get())
}

#[test]
fn fresh_block_has_no_owners() {
  let heap = RefMem::new();
  let handle = heap.allocate(32, None).unwrap();

  unsafe {
    assert_eq!(heap.count_of(handle), 0);
    assert_eq!(heap.size_of(handle), 32);
    assert!(heap.destructor_of(handle).is_none());
  }
  assert!(heap.is_registered(handle.addr()));
}

#[test]
fn retain_and_release_move_count_by_one() {
  let heap = RefMem::new();
  let handle = heap.allocate(8, None).unwrap();

  unsafe {
    for expected in 1..=4 {
      heap.retain(handle);
      assert_eq!(heap.count_of(handle), expected);
    }
    for expected in (1..=3).rev() {
      heap.release(handle);
      assert_eq!(heap.count_of(handle), expected);
    }
  }
}

#[test]
fn allocate_retain_release_release_reclaims() {
  let heap = RefMem::new();
  let handle = heap.allocate(16, Some(count_teardown)).unwrap();

  unsafe {
    heap.retain(handle);
    heap.retain(handle);
    heap.release(handle);
    assert!(heap.is_registered(handle.addr()));
    heap.release(handle);
  }

  assert!(!heap.is_registered(handle.addr()));
  assert_eq!(torn_down(), 1);
  assert_eq!(heap.stats().reclamations, 1);
}

#[test]
fn release_of_absent_handle_is_noop() {
  let heap = RefMem::new();
  unsafe { heap.release_opt(None) };
  assert_eq!(heap.stats(), Stats::default());
}

#[test]
#[should_panic(expected = "more releases than retains")]
fn release_at_zero_is_fatal() {
  let heap = RefMem::new();
  let handle = heap.allocate(8, None).unwrap();
  unsafe { heap.release(handle) };
}

#[test]
#[should_panic(expected = "more releases than retains")]
fn release_of_queued_block_is_fatal() {
  let heap = RefMem::new();
  heap.set_cascade_limit(0);
  let handle = heap.allocate(8, None).unwrap();
  unsafe {
    heap.retain(handle);
    heap.release(handle);
    // Still registered and queued, count is zero.
    heap.release(handle);
  }
}

#[test]
#[should_panic(expected = "after its last release")]
fn retain_after_last_release_is_fatal() {
  let heap = RefMem::new();
  heap.set_cascade_limit(0);
  let handle = heap.allocate(8, Some(count_teardown)).unwrap();
  unsafe {
    heap.retain(handle);
    heap.release(handle);
    // Queued but not yet reclaimed; resurrecting it would free a live owner.
    heap.retain(handle);
  }
}

#[test]
fn rejected_retain_leaves_block_queued() {
  let heap = RefMem::new();
  heap.set_cascade_limit(0);
  let handle = heap.allocate(8, Some(count_teardown)).unwrap();
  unsafe {
    heap.retain(handle);
    heap.release(handle);
  }

  let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| unsafe {
    heap.retain(handle)
  }));
  assert!(outcome.is_err());
  assert_eq!(unsafe { heap.count_of(handle) }, 0);
  assert_eq!(heap.stats().pending, 1);

  assert_eq!(heap.drain(4), 1);
  assert_eq!(heap.stats().pending, 0);
  assert_eq!(torn_down(), 1);
}

// Saturation reclaims instead of overflowing. The handle dangles afterwards,
// so the test only looks at side effects.
#[test]
fn retain_at_max_count_reclaims_immediately() {
  let heap = RefMem::new();
  let handle = heap.allocate(8, Some(count_teardown)).unwrap();

  unsafe {
    for _ in 0..MAX_COUNT {
      heap.retain(handle);
    }
    assert_eq!(heap.count_of(handle), MAX_COUNT);
    assert_eq!(torn_down(), 0);

    heap.retain(handle);
  }

  assert_eq!(torn_down(), 1);
  assert!(!heap.is_registered(handle.addr()));
  assert_eq!(heap.stats().live, 0);
}

#[test]
fn custom_destructor_is_recorded() {
  let heap = RefMem::new();
  let handle = heap.allocate(8, Some(count_teardown)).unwrap();
  let stored = unsafe { heap.destructor_of(handle) }.unwrap();

  stored(&heap, handle);
  assert_eq!(torn_down(), 1);
}

#[test]
fn array_size_is_elements_times_element_size() {
  let heap = RefMem::new();
  let handle = heap.allocate_array(7, 12, None).unwrap();
  assert_eq!(unsafe { heap.size_of(handle) }, 84);
}

#[test]
fn array_size_overflow_is_reported() {
  let heap = RefMem::new();
  let err = heap.allocate_array(usize::MAX, 2, None).unwrap_err();
  assert_eq!(
    err,
    RefMemError::SizeOverflow {
      elements: usize::MAX,
      element_size: 2
    }
  );
  assert_eq!(heap.stats().live, 0);
}

#[test]
fn oversized_block_is_reported() {
  let heap = RefMem::new();
  let err = heap.allocate(refmem::MAX_BLOCK_SIZE + 1, None).unwrap_err();
  assert!(matches!(err, RefMemError::TooLarge { .. }));
}

#[test]
fn allocate_str_copies_and_owns() {
  let heap = RefMem::new();
  let handle = heap.allocate_str("refmem").unwrap();

  unsafe {
    assert_eq!(heap.count_of(handle), 1);
    assert_eq!(heap.size_of(handle), 7);
    let bytes = std::slice::from_raw_parts(handle.as_ptr::<u8>(), 7);
    assert_eq!(bytes, b"refmem\0");
    heap.release(handle);
  }
  assert!(!heap.is_registered(handle.addr()));
}

#[test]
fn payload_is_zeroed() {
  let heap = RefMem::new();
  let handle = heap.allocate(64, None).unwrap();
  let bytes = unsafe { std::slice::from_raw_parts(handle.as_ptr::<u8>(), 64) };
  assert!(bytes.iter().all(|&b| b == 0));
}

#[test]
fn handle_survives_pointer_round_trip() {
  let heap = RefMem::new();
  let handle = heap.allocate(8, None).unwrap();
  let back = unsafe { Handle::from_ptr(handle.as_ptr()) }.unwrap();
  assert_eq!(back, handle);
}

proptest! {
  #[test]
  fn count_tracks_retains_and_releases(ops in prop::collection::vec(any::<bool>(), 1..64)) {
    let heap = RefMem::new();
    let handle = heap.allocate(8, None).unwrap();
    unsafe { heap.retain(handle) };
    let mut model: u16 = 1;

    for retain in ops {
      if retain {
        unsafe { heap.retain(handle) };
        model += 1;
      } else if model > 1 {
        unsafe { heap.release(handle) };
        model -= 1;
      }
      prop_assert_eq!(unsafe { heap.count_of(handle) }, model);
      prop_assert!(heap.is_registered(handle.addr()));
    }

    for _ in 0..model {
      unsafe { heap.release(handle) };
    }
    heap.cleanup();
    prop_assert!(!heap.is_registered(handle.addr()));
  }
}
