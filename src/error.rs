use thiserror::Error;

/// Result alias for fallible allocator calls.
pub type Result<T> = std::result::Result<T, RefMemError>;

/// Recoverable allocator failures.
///
/// Ownership misuse (releasing a block with no owners) is not represented here:
/// it aborts the offending call with a panic.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefMemError {
  #[error("out of memory: calloc failed for {requested} payload bytes")]
  OutOfMemory { requested: usize },

  #[error("allocation of {requested} bytes exceeds the {max} byte block limit")]
  TooLarge { requested: usize, max: usize },

  #[error("array of {elements} x {element_size} bytes overflows usize")]
  SizeOverflow { elements: usize, element_size: usize },
}
