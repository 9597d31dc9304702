//! Heap consistency checking.
//!
//! The checker walks the heap from its first byte to its end using nothing
//! but the block sizes, then replays the free list against what the walk saw.
//! It is meant for tests and debugging, not for allocation hot paths.

use crate::{
    block::{ALIGNMENT, BlockState, HEADER_SIZE, MIN_BLOCK_SIZE, NIL},
    error::HeapCorruption,
    heap::Heap,
};

/// What a successful [`Heap::verify`] found.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct HeapSummary {
    pub heap_size: usize,
    pub allocated_blocks: usize,
    pub allocated_bytes: usize,
    pub free_blocks: usize,
    pub free_bytes: usize,
}

impl HeapSummary {
    pub fn blocks(&self) -> usize {
        self.allocated_blocks + self.free_blocks
    }
}

impl<S> Heap<S> {
    /// Checks the structure of the heap:
    ///
    /// - block sizes are multiples of [`ALIGNMENT`], at least a header long,
    ///   and add up to exactly the heap size,
    /// - every boundary tag matches the size of the block before it,
    /// - no two neighboring blocks are free,
    /// - the free list holds exactly the free blocks, in address order, with
    ///   consistent back links.
    pub fn verify(&self) -> Result<HeapSummary, HeapCorruption> {
        let arena = &self.arena;
        let heap_len = arena.len();

        let mut summary = HeapSummary {
            heap_size: heap_len,
            ..HeapSummary::default()
        };

        let mut offset = 0;
        let mut prev: Option<(usize, usize, BlockState)> = None;

        // Next entry the free list should produce and the one it produced last.
        let mut listed = self.free.first();
        let mut last_listed = NIL;

        while offset < heap_len {
            if offset + HEADER_SIZE > heap_len {
                return Err(HeapCorruption::Overrun {
                    offset,
                    size: HEADER_SIZE,
                    heap_len,
                });
            }

            let header = arena.header(offset);
            let size = header.size();

            if size < MIN_BLOCK_SIZE || size % ALIGNMENT != 0 || !header.has_valid_flags() {
                return Err(HeapCorruption::BadSize {
                    offset,
                    size: header.raw_size(),
                });
            }

            if offset.checked_add(size).is_none_or(|end| end > heap_len) {
                return Err(HeapCorruption::Overrun {
                    offset,
                    size,
                    heap_len,
                });
            }

            let expected_tag = prev.map_or(0, |(_, prev_size, _)| prev_size);

            if header.prev_size != expected_tag {
                return Err(HeapCorruption::BoundaryTag {
                    offset,
                    recorded: header.prev_size,
                    actual: expected_tag,
                });
            }

            match header.state() {
                BlockState::Allocated => {
                    summary.allocated_blocks += 1;
                    summary.allocated_bytes += size;
                }
                BlockState::Free => {
                    if let Some((prev_offset, _, BlockState::Free)) = prev {
                        return Err(HeapCorruption::AdjacentFree {
                            first: prev_offset,
                            second: offset,
                        });
                    }

                    if listed != Some(offset) {
                        return Err(HeapCorruption::FreeList {
                            offset,
                            reason: "free block is not the next free list entry",
                        });
                    }

                    if header.prev_free != last_listed {
                        return Err(HeapCorruption::FreeList {
                            offset,
                            reason: "back link does not point at the previous entry",
                        });
                    }

                    summary.free_blocks += 1;
                    summary.free_bytes += size;

                    last_listed = offset;
                    listed = (header.next_free != NIL).then_some(header.next_free);
                }
            }

            prev = Some((offset, size, header.state()));
            offset += size;
        }

        if let Some(offset) = listed {
            return Err(HeapCorruption::FreeList {
                offset,
                reason: "entry past the last free block",
            });
        }

        if let Some(tail) = self.free.last().filter(|&tail| tail != last_listed) {
            return Err(HeapCorruption::FreeList {
                offset: tail,
                reason: "tail is not the last free block",
            });
        }

        if self.free.len() != summary.free_blocks {
            return Err(HeapCorruption::FreeCount {
                listed: self.free.len(),
                found: summary.free_blocks,
            });
        }

        let last_block = prev.map(|(offset, _, _)| offset);

        if self.last != last_block {
            return Err(HeapCorruption::LastBlock {
                recorded: self.last,
                actual: last_block,
            });
        }

        Ok(summary)
    }

    /// Runs [`Heap::verify`] and aborts the process if the heap is damaged.
    pub fn check_heap(&self) -> HeapSummary {
        or_abort(self.verify())
    }
}

/// Unwraps a verification result, reporting the corruption and aborting if
/// there is one. Continuing would only spread the damage.
///
/// Callers holding the heap lock must release it first, the logger may
/// allocate.
pub(crate) fn or_abort(verified: Result<HeapSummary, HeapCorruption>) -> HeapSummary {
    match verified {
        Ok(summary) => summary,
        Err(corruption) => {
            log::error!("heap corruption: {corruption}");
            eprintln!("heap corruption: {corruption}");

            std::process::abort()
        }
    }
}
