use thiserror::Error;

/// Why an allocation request could not be satisfied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum AllocError {
    #[error("zero-sized allocation request")]
    ZeroSize,
    #[error("requested size overflows the address space")]
    SizeOverflow,
    #[error("heap source refused to grow the heap by {0} bytes")]
    OutOfMemory(usize),
    #[error("alignment {0} is not a power of two")]
    InvalidAlignment(usize),
}

/// Structural damage found by [`crate::Heap::verify`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HeapCorruption {
    #[error("block at {offset:#x} has invalid size word {size:#x}")]
    BadSize { offset: usize, size: usize },
    #[error("block at {offset:#x} of {size} bytes runs past the heap end at {heap_len:#x}")]
    Overrun { offset: usize, size: usize, heap_len: usize },
    #[error("boundary tag at {offset:#x} records {recorded} bytes but the predecessor has {actual}")]
    BoundaryTag { offset: usize, recorded: usize, actual: usize },
    #[error("adjacent free blocks at {first:#x} and {second:#x}")]
    AdjacentFree { first: usize, second: usize },
    #[error("free list entry {offset:#x}: {reason}")]
    FreeList { offset: usize, reason: &'static str },
    #[error("heap records {recorded:?} as its last block but the walk ends at {actual:?}")]
    LastBlock { recorded: Option<usize>, actual: Option<usize> },
    #[error("free list holds {listed} blocks but the heap has {found} free blocks")]
    FreeCount { listed: usize, found: usize },
}
