use std::{mem, ptr::NonNull};

/// Every block size and every payload address is a multiple of this.
pub const ALIGNMENT: usize = 8;

/// Header size of a block. The header is the only part of a block the allocator
/// ever writes to, the payload behind it belongs to the caller.
pub const HEADER_SIZE: usize = mem::size_of::<BlockHeader>();

/// Smallest block we ever create. Free blocks keep their list links in the
/// header so an empty payload is enough.
pub const MIN_BLOCK_SIZE: usize = HEADER_SIZE;

/// Offset value used for "no block" inside a header link.
pub(crate) const NIL: usize = usize::MAX;

const ALLOCATED: usize = 0b1;
const FLAGS_MASK: usize = ALIGNMENT - 1;

/// This is the structure of a block header. The payload is placed right after it.
///
/// ```text
/// +---------------------+ <------+
/// |  size | allocated   |        |
/// +---------------------+        |
/// |      prev_size      |        |
/// +---------------------+        | -> Header
/// |      next_free      |        |
/// +---------------------+        |
/// |      prev_free      |        |
/// +---------------------+ <------+ <- pointer handed to the caller
/// |       Payload       |        |
/// |         ...         |        | -> Addressable content
/// |                     |        |
/// +---------------------+ <------+
/// ```
///
/// `size` covers header and payload and is always a multiple of [`ALIGNMENT`],
/// which leaves its low bits free for the state flag. `prev_size` is the
/// boundary tag of the physical predecessor (0 for the first block) so both
/// neighbors of a block can be found by arithmetic alone. The free links are
/// heap offsets and only meaningful while the block is free.
#[repr(C)]
pub(crate) struct BlockHeader {
    size: usize,
    pub prev_size: usize,
    pub next_free: usize,
    pub prev_free: usize,
}

impl BlockHeader {
    #[inline]
    pub fn size(&self) -> usize {
        self.size & !FLAGS_MASK
    }

    #[inline]
    pub fn state(&self) -> BlockState {
        if self.size & ALLOCATED == 0 {
            BlockState::Free
        } else {
            BlockState::Allocated
        }
    }

    #[inline]
    pub fn is_free(&self) -> bool {
        self.state() == BlockState::Free
    }

    /// Raw size word, flags included. Only the heap checker needs this.
    #[inline]
    pub fn raw_size(&self) -> usize {
        self.size
    }

    /// No bits besides the state flag are set below the size.
    #[inline]
    pub fn has_valid_flags(&self) -> bool {
        self.size & FLAGS_MASK & !ALLOCATED == 0
    }

    #[inline]
    pub fn set_size(&mut self, size: usize) {
        debug_assert_eq!(size & FLAGS_MASK, 0, "unaligned block size {size}");
        self.size = size | (self.size & FLAGS_MASK);
    }

    #[inline]
    pub fn set_state(&mut self, state: BlockState) {
        self.size = match state {
            BlockState::Free => self.size & !ALLOCATED,
            BlockState::Allocated => self.size | ALLOCATED,
        };
    }
}

/// Whether a block is handed out or waiting in the free list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockState {
    Free,
    Allocated,
}

/// Snapshot of one block, as produced by [`crate::Heap::blocks`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockInfo {
    /// Offset of the header from the start of the heap.
    pub offset: usize,
    /// Total size, header included.
    pub size: usize,
    pub state: BlockState,
}

impl BlockInfo {
    /// Bytes available to the caller.
    pub fn payload_size(&self) -> usize {
        self.size - HEADER_SIZE
    }
}

/// The heap span as seen by the allocator: a base address and the number of
/// bytes obtained from the heap source so far.
///
/// Blocks are addressed by their offset from `base`. Accessors check the
/// offset against the span in debug builds only.
pub(crate) struct Arena {
    base: Option<NonNull<u8>>,
    len: usize,
}

impl Arena {
    pub const fn new() -> Self {
        Self { base: None, len: 0 }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn base(&self) -> Option<NonNull<u8>> {
        self.base
    }

    /// Address one past the last byte of the heap.
    #[inline]
    pub fn end_addr(&self) -> Option<usize> {
        self.base.map(|base| base.as_ptr() as usize + self.len)
    }

    /// Adopts `base` as the start of the heap. Only valid while empty.
    pub fn set_base(&mut self, base: NonNull<u8>) {
        debug_assert!(self.base.is_none() && self.len == 0);
        self.base = Some(base);
    }

    /// Accounts for `increment` more bytes at the end of the heap.
    pub fn extend(&mut self, increment: usize) {
        debug_assert!(self.base.is_some());
        self.len += increment;
    }

    #[inline]
    fn header_ptr(&self, offset: usize) -> *mut BlockHeader {
        debug_assert!(
            offset % ALIGNMENT == 0 && offset + HEADER_SIZE <= self.len,
            "block offset {offset:#x} outside heap of {} bytes",
            self.len
        );

        match self.base {
            // SAFETY: the heap keeps every block offset inside the span it got
            // from the heap source, so the header lies in memory we own.
            Some(base) => unsafe { base.as_ptr().add(offset).cast() },
            None => unreachable!("header access on an empty heap"),
        }
    }

    #[inline]
    pub fn header(&self, offset: usize) -> &BlockHeader {
        // SAFETY: see `header_ptr`. Headers are 8-byte aligned because the base
        // and every block size are.
        unsafe { &*self.header_ptr(offset) }
    }

    #[inline]
    pub fn header_mut(&mut self, offset: usize) -> &mut BlockHeader {
        // SAFETY: see `header`. `&mut self` guarantees exclusive access.
        unsafe { &mut *self.header_ptr(offset) }
    }

    /// Writes a fresh header at `offset`.
    pub fn write_header(&mut self, offset: usize, size: usize, prev_size: usize, state: BlockState) {
        let header = self.header_ptr(offset);

        // SAFETY: `offset` is inside the span and the memory may hold stale
        // payload bytes, so we overwrite instead of reading.
        unsafe {
            header.write(BlockHeader {
                size,
                prev_size,
                next_free: NIL,
                prev_free: NIL,
            });
            (*header).set_state(state);
        }
    }

    /// Pointer handed to the caller for the block at `offset`.
    #[inline]
    pub fn payload(&self, offset: usize) -> NonNull<u8> {
        // SAFETY: the header pointer is non-null and the payload follows it.
        unsafe { NonNull::new_unchecked(self.header_ptr(offset).cast::<u8>().add(HEADER_SIZE)) }
    }

    /// Inverse of [`Arena::payload`].
    #[inline]
    pub fn offset_of(&self, payload: NonNull<u8>) -> usize {
        let base = self.base.map_or(0, |base| base.as_ptr() as usize);
        let offset = (payload.as_ptr() as usize).wrapping_sub(base).wrapping_sub(HEADER_SIZE);

        debug_assert!(
            offset < self.len && offset % ALIGNMENT == 0,
            "pointer {payload:?} was not handed out by this heap"
        );

        offset
    }

    /// Physical successor of the block at `offset`, if any.
    #[inline]
    pub fn next_of(&self, offset: usize) -> Option<usize> {
        let next = offset + self.header(offset).size();
        (next < self.len).then_some(next)
    }

    /// Physical predecessor of the block at `offset`, found through its boundary tag.
    #[inline]
    pub fn prev_of(&self, offset: usize) -> Option<usize> {
        match self.header(offset).prev_size {
            0 => None,
            prev_size => Some(offset - prev_size),
        }
    }

    pub fn info(&self, offset: usize) -> BlockInfo {
        let header = self.header(offset);

        BlockInfo {
            offset,
            size: header.size(),
            state: header.state(),
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Word-aligned scratch memory posing as a heap span.
    pub(crate) fn scratch_arena(words: &mut [u64]) -> Arena {
        let mut arena = Arena::new();
        arena.set_base(NonNull::new(words.as_mut_ptr().cast()).unwrap());
        arena.extend(words.len() * mem::size_of::<u64>());
        arena
    }

    #[test]
    fn header_is_word_multiple() {
        assert_eq!(HEADER_SIZE % ALIGNMENT, 0);
        assert_eq!(HEADER_SIZE, 4 * mem::size_of::<usize>());
    }

    #[test]
    fn state_flag_does_not_leak_into_size() {
        let mut words = [0u64; 16];
        let mut arena = scratch_arena(&mut words);

        arena.write_header(0, 64, 0, BlockState::Allocated);
        assert_eq!(arena.header(0).size(), 64);
        assert_eq!(arena.header(0).state(), BlockState::Allocated);

        arena.header_mut(0).set_size(96);
        assert_eq!(arena.header(0).size(), 96);
        assert_eq!(arena.header(0).state(), BlockState::Allocated);

        arena.header_mut(0).set_state(BlockState::Free);
        assert!(arena.header(0).is_free());
        assert_eq!(arena.header(0).size(), 96);
    }

    #[test]
    fn payload_and_offset_round_trip() {
        let mut words = [0u64; 32];
        let arena = scratch_arena(&mut words);

        for offset in [0, 64, 128] {
            let payload = arena.payload(offset);
            assert_eq!(payload.as_ptr() as usize % ALIGNMENT, 0);
            assert_eq!(arena.offset_of(payload), offset);
        }
    }

    #[test]
    fn neighbors_follow_sizes_and_boundary_tags() {
        let mut words = [0u64; 32];
        let mut arena = scratch_arena(&mut words);

        arena.write_header(0, 64, 0, BlockState::Allocated);
        arena.write_header(64, 64, 64, BlockState::Free);
        arena.write_header(128, 128, 64, BlockState::Allocated);

        assert_eq!(arena.prev_of(0), None);
        assert_eq!(arena.next_of(0), Some(64));
        assert_eq!(arena.prev_of(64), Some(0));
        assert_eq!(arena.next_of(64), Some(128));
        assert_eq!(arena.prev_of(128), Some(64));
        assert_eq!(arena.next_of(128), None);
    }
}
