use thiserror::Error;

/// Errors surfaced by the heap region manager.
///
/// None of them leave the allocator in an unusable state: the ledger is only
/// touched once the OS has handed the bytes over.
#[derive(Debug, Error, Copy, Clone, Eq, PartialEq)]
pub enum AllocatorError {
    /// The OS refused the initial reservation, or returned a base that is not
    /// word aligned.
    #[error("OS refused to reserve {size} bytes for the heap")]
    OsReservationFailed { size: usize },
    /// The heap could not be extended, or the extension was not contiguous
    /// with the end of the managed region.
    #[error("heap exhausted while growing by {requested} bytes")]
    HeapExhausted { requested: usize },
    /// The requested region can't hold a single header plus one word.
    #[error("heap of {size} bytes is too small to hold a block")]
    RegionTooSmall { size: usize },
    /// Growth was attempted before `init`.
    #[error("heap is not initialized")]
    Uninitialized,
}

pub type Result<T> = core::result::Result<T, AllocatorError>;
