use std::ptr::{self, NonNull};

use crate::{
    block::{ALIGNMENT, Arena, BlockInfo, BlockState, HEADER_SIZE, MIN_BLOCK_SIZE},
    error::AllocError,
    freelist::FreeList,
    kernel::HeapSource,
    utils::checked_align,
};

/// Total block size, header included, needed to hand out `size` bytes.
pub fn block_size(size: usize) -> Result<usize, AllocError> {
    if size == 0 {
        return Err(AllocError::ZeroSize);
    }

    size.checked_add(HEADER_SIZE)
        .and_then(|total| checked_align(total, ALIGNMENT))
        .filter(|&total| total <= isize::MAX as usize)
        .ok_or(AllocError::SizeOverflow)
}

/// Bytes to skip from `payload` so that the payload becomes `align` aligned.
/// A non-zero gap must be able to hold a free block of its own.
fn lead(payload: usize, align: usize) -> usize {
    let mut gap = payload.next_multiple_of(align) - payload;

    while gap != 0 && gap < MIN_BLOCK_SIZE {
        gap += align;
    }

    gap
}

/// A single contiguous heap carved into blocks.
///
/// ```text
///   base                                                        base + size()
///    +--------+-----------+--------+----------------+-----------+
///    | Block  | Free      | Block  | Free           | Block     |
///    +--------+-----------+--------+----------------+-----------+
///                 ^                     ^
///                 +---- free list ------+
/// ```
///
/// Every byte between `base` and the heap end belongs to exactly one block
/// and no two neighboring blocks are free. Requests are served first-fit from
/// the free list, splitting off whatever is left. Only when nothing fits does
/// the heap ask its [`HeapSource`] for more memory, and exactly as much as
/// the new block needs.
///
/// The heap has no locking of its own, see [`crate::MemAlloc`] for that.
pub struct Heap<S> {
    pub(crate) source: S,
    pub(crate) arena: Arena,
    pub(crate) free: FreeList,
    /// Offset of the block that ends at the heap end.
    pub(crate) last: Option<usize>,
}

// SAFETY: the heap exclusively owns the memory behind its arena.
unsafe impl<S: Send> Send for Heap<S> {}

impl<S> Heap<S> {
    pub const fn new(source: S) -> Self {
        Self {
            source,
            arena: Arena::new(),
            free: FreeList::new(),
            last: None,
        }
    }

    /// Bytes obtained from the heap source so far.
    pub fn size(&self) -> usize {
        self.arena.len()
    }

    /// Start of the heap, once it has one.
    pub fn base(&self) -> Option<NonNull<u8>> {
        self.arena.base()
    }

    /// Every block in address order.
    pub fn blocks(&self) -> Blocks<'_> {
        Blocks {
            arena: &self.arena,
            offset: 0,
        }
    }

    /// The free blocks in free list order, which is address order.
    pub fn free_blocks(&self) -> impl Iterator<Item = BlockInfo> + '_ {
        self.free.iter(&self.arena).map(|offset| self.arena.info(offset))
    }

    /// Payload bytes of the block behind `ptr`.
    ///
    /// # Safety
    ///
    /// `ptr` must be a live allocation of this heap.
    pub unsafe fn usable_size(&self, ptr: NonNull<u8>) -> usize {
        self.arena.header(self.arena.offset_of(ptr)).size() - HEADER_SIZE
    }
}

impl<S: HeapSource> Heap<S> {
    /// Allocates at least `size` bytes aligned to [`ALIGNMENT`].
    pub fn allocate(&mut self, size: usize) -> Result<NonNull<u8>, AllocError> {
        let total = block_size(size)?;

        let offset = match self.free.first_fit(&self.arena, |_, block| block >= total) {
            Some(offset) => self.carve(offset, 0, total),
            None => self.grow(total)?,
        };

        Ok(self.arena.payload(offset))
    }

    /// Allocates at least `size` bytes aligned to `align`.
    ///
    /// A free block whose payload is not suitably aligned is entered far enough
    /// to leave a free block in front of the aligned payload.
    pub fn allocate_aligned(&mut self, size: usize, align: usize) -> Result<NonNull<u8>, AllocError> {
        if !align.is_power_of_two() {
            return Err(AllocError::InvalidAlignment(align));
        }

        if align <= ALIGNMENT {
            return self.allocate(size);
        }

        let total = block_size(size)?;

        let (offset, lead) = match self.find_aligned(total, align) {
            Some(found) => found,
            None => {
                // Enough room for the block, the worst alignment gap and the
                // free block that gap turns into.
                let padded = total
                    .checked_add(align)
                    .and_then(|padded| padded.checked_add(HEADER_SIZE))
                    .ok_or(AllocError::SizeOverflow)?;

                let offset = self.grow(padded)?;
                self.free_block(offset);

                self.find_aligned(total, align)
                    .ok_or(AllocError::OutOfMemory(padded))?
            }
        };

        let block = self.carve(offset, lead, total);

        Ok(self.arena.payload(block))
    }

    /// Allocates `size` bytes aligned to `align` and fills them with zeros.
    pub fn allocate_zeroed(&mut self, size: usize, align: usize) -> Result<NonNull<u8>, AllocError> {
        let ptr = self.allocate_aligned(size, align)?;

        // SAFETY: the block has at least `size` payload bytes. Reused blocks
        // hold stale data so this can't be skipped.
        unsafe { ptr.as_ptr().write_bytes(0, size) };

        Ok(ptr)
    }

    /// Allocates `count * size` zeroed bytes, failing on overflow instead of
    /// allocating a truncated size.
    pub fn zero_allocate(&mut self, count: usize, size: usize) -> Result<NonNull<u8>, AllocError> {
        let bytes = count.checked_mul(size).ok_or(AllocError::SizeOverflow)?;

        self.allocate_zeroed(bytes, ALIGNMENT)
    }

    /// Gives the block behind `ptr` back to the heap, merging it with free
    /// neighbors.
    ///
    /// # Safety
    ///
    /// `ptr` must have been returned by this heap and not released since.
    pub unsafe fn release(&mut self, ptr: NonNull<u8>) {
        let offset = self.arena.offset_of(ptr);

        debug_assert!(
            !self.arena.header(offset).is_free(),
            "double release of {ptr:?}"
        );

        self.free_block(offset);
    }

    /// Resizes the allocation behind `ptr` to `new_size` bytes.
    ///
    /// The block is resized in place when possible: shrinking splits off the
    /// surplus, growing absorbs a free successor or extends the heap if the
    /// block is the last one. Otherwise the payload moves to a new block
    /// aligned to `align`. The first `min(old, new_size)` bytes are preserved
    /// either way. On error the original allocation is left untouched.
    ///
    /// # Safety
    ///
    /// `ptr` must be a live allocation of this heap, aligned to `align`.
    pub unsafe fn reallocate(
        &mut self,
        ptr: NonNull<u8>,
        new_size: usize,
        align: usize,
    ) -> Result<NonNull<u8>, AllocError> {
        let total = block_size(new_size)?;
        let offset = self.arena.offset_of(ptr);
        let size = self.arena.header(offset).size();

        if total <= size {
            self.shrink(offset, total);
            return Ok(ptr);
        }

        if let Some(next) = self.arena.next_of(offset) {
            let next_header = self.arena.header(next);

            if next_header.is_free() && size + next_header.size() >= total {
                self.free.remove(&mut self.arena, next);
                self.merge(offset, next);
                self.shrink(offset, total);
                return Ok(ptr);
            }
        }

        if self.last == Some(offset) && self.sbrk(total - size).is_ok() {
            self.arena.header_mut(offset).set_size(total);
            return Ok(ptr);
        }

        let moved = self.allocate_aligned(new_size, align)?;

        // SAFETY: both blocks are live and distinct, and the copy fits in both
        // payloads.
        unsafe {
            ptr::copy_nonoverlapping(
                ptr.as_ptr(),
                moved.as_ptr(),
                (size - HEADER_SIZE).min(new_size),
            );
        }

        self.free_block(offset);

        Ok(moved)
    }

    /// Moves the heap end forward by `increment` bytes and returns the offset
    /// of the new space.
    fn sbrk(&mut self, increment: usize) -> Result<usize, AllocError> {
        if self.arena.base().is_none() {
            let end = self.source.sbrk(0).ok_or(AllocError::OutOfMemory(increment))?;
            let padding = end.as_ptr().align_offset(ALIGNMENT);

            if padding != 0 {
                self.source
                    .sbrk(padding)
                    .ok_or(AllocError::OutOfMemory(increment))?;
            }

            // SAFETY: the padding bytes were just handed to us.
            self.arena.set_base(unsafe { end.add(padding) });
        }

        let start = self
            .source
            .sbrk(increment)
            .ok_or(AllocError::OutOfMemory(increment))?;

        if Some(start.as_ptr() as usize) != self.arena.end_addr() {
            // The source broke its contract, the heap can't span the gap.
            return Err(AllocError::OutOfMemory(increment));
        }

        let offset = self.arena.len();
        self.arena.extend(increment);

        Ok(offset)
    }

    /// Appends an allocated block of `total` bytes at the heap end.
    fn grow(&mut self, total: usize) -> Result<usize, AllocError> {
        let offset = self.sbrk(total)?;
        let prev_size = self.last.map_or(0, |last| self.arena.header(last).size());

        self.arena.write_header(offset, total, prev_size, BlockState::Allocated);
        self.last = Some(offset);

        Ok(offset)
    }
}

impl<S> Heap<S> {
    /// Hands out `total` bytes of the listed free block at `offset`, starting
    /// `lead` bytes into it, and returns the offset of the allocated block.
    fn carve(&mut self, offset: usize, lead: usize, total: usize) -> usize {
        let block = match lead {
            0 => offset,
            lead => {
                // The leading gap keeps the old offset and its list position.
                let rest = self.split(offset, lead);
                debug_assert_eq!(rest, Some(offset + lead));
                offset + lead
            }
        };

        match (lead, self.split(block, total)) {
            (0, Some(rest)) => self.free.replace(&mut self.arena, block, rest),
            (0, None) => self.free.remove(&mut self.arena, block),
            (_, Some(rest)) => self.free.insert(&mut self.arena, rest),
            (_, None) => {}
        }

        self.arena.header_mut(block).set_state(BlockState::Allocated);

        block
    }

    /// Cuts the block at `offset` down to `total` bytes. The rest becomes a
    /// new free block, which is returned, unless it is too small to hold a
    /// header, in which case the block is left as is.
    ///
    /// The new block is not put in the free list.
    fn split(&mut self, offset: usize, total: usize) -> Option<usize> {
        let remainder = self.arena.header(offset).size() - total;

        if remainder < MIN_BLOCK_SIZE {
            return None;
        }

        let rest = offset + total;

        self.arena.header_mut(offset).set_size(total);
        self.arena.write_header(rest, remainder, total, BlockState::Free);
        self.update_successor(rest);

        if self.last == Some(offset) {
            self.last = Some(rest);
        }

        Some(rest)
    }

    fn shrink(&mut self, offset: usize, total: usize) {
        if let Some(rest) = self.split(offset, total) {
            self.free_block(rest);
        }
    }

    /// Grows `low` over its physical successor `high`.
    fn merge(&mut self, low: usize, high: usize) {
        debug_assert_eq!(self.arena.next_of(low), Some(high));

        let size = self.arena.header(low).size() + self.arena.header(high).size();

        self.arena.header_mut(low).set_size(size);
        self.update_successor(low);

        if self.last == Some(high) {
            self.last = Some(low);
        }
    }

    /// Refreshes the boundary tag of the block following `offset`.
    fn update_successor(&mut self, offset: usize) {
        if let Some(next) = self.arena.next_of(offset) {
            let size = self.arena.header(offset).size();
            self.arena.header_mut(next).prev_size = size;
        }
    }

    /// Marks the block at `offset` free, merges it with free physical
    /// neighbors and puts the result in the free list.
    fn free_block(&mut self, offset: usize) {
        self.arena.header_mut(offset).set_state(BlockState::Free);

        let prev = self
            .arena
            .prev_of(offset)
            .filter(|&prev| self.arena.header(prev).is_free());
        let next = self
            .arena
            .next_of(offset)
            .filter(|&next| self.arena.header(next).is_free());

        match (prev, next) {
            (None, None) => self.free.insert(&mut self.arena, offset),
            (None, Some(next)) => {
                // Nothing free lies between us and `next`, take its place.
                self.free.replace(&mut self.arena, next, offset);
                self.merge(offset, next);
            }
            (Some(prev), None) => self.merge(prev, offset),
            (Some(prev), Some(next)) => {
                self.free.remove(&mut self.arena, next);
                self.merge(prev, offset);
                self.merge(prev, next);
            }
        }
    }

    /// First free block that can hold `total` bytes behind an `align`
    /// aligned payload, along with the gap in front of that payload.
    fn find_aligned(&self, total: usize, align: usize) -> Option<(usize, usize)> {
        let arena = &self.arena;
        let lead_of = |offset| lead(arena.payload(offset).as_ptr() as usize, align);

        let offset = self
            .free
            .first_fit(arena, |offset, size| lead_of(offset) + total <= size)?;

        Some((offset, lead_of(offset)))
    }
}

/// Walks the heap block by block, see [`Heap::blocks`].
pub struct Blocks<'a> {
    arena: &'a Arena,
    offset: usize,
}

impl Iterator for Blocks<'_> {
    type Item = BlockInfo;

    fn next(&mut self) -> Option<Self::Item> {
        if self.offset + HEADER_SIZE > self.arena.len() {
            return None;
        }

        let info = self.arena.info(self.offset);

        // A broken size would loop forever or jump out of the heap,
        // `Heap::verify` reports those.
        let end = self.offset.checked_add(info.size);

        if info.size < MIN_BLOCK_SIZE || end.is_none_or(|end| end > self.arena.len()) {
            self.offset = self.arena.len();
            return None;
        }

        self.offset += info.size;

        Some(info)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{kernel::BufferSource, utils::align8};

    fn heap(capacity: usize) -> Heap<BufferSource> {
        Heap::new(BufferSource::new(capacity).unwrap())
    }

    fn fill(ptr: NonNull<u8>, len: usize, byte: u8) {
        unsafe { ptr.as_ptr().write_bytes(byte, len) }
    }

    fn holds(ptr: NonNull<u8>, len: usize, byte: u8) -> bool {
        unsafe { std::slice::from_raw_parts(ptr.as_ptr(), len).iter().all(|&b| b == byte) }
    }

    #[test]
    fn block_size_rounds_up() {
        assert_eq!(block_size(1), Ok(align8(1 + HEADER_SIZE)));
        assert_eq!(block_size(8), Ok(8 + HEADER_SIZE));
        assert_eq!(block_size(9), Ok(16 + HEADER_SIZE));
    }

    #[test]
    fn block_size_rejects_zero_and_overflow() {
        assert_eq!(block_size(0), Err(AllocError::ZeroSize));
        assert_eq!(block_size(usize::MAX), Err(AllocError::SizeOverflow));
        assert_eq!(block_size(usize::MAX - HEADER_SIZE), Err(AllocError::SizeOverflow));
        assert_eq!(block_size(isize::MAX as usize), Err(AllocError::SizeOverflow));
    }

    #[test]
    fn lead_is_zero_or_a_whole_block() {
        for payload in (0..512).step_by(ALIGNMENT) {
            for align in [16, 32, 64, 128] {
                let gap = lead(payload, align);

                assert_eq!((payload + gap) % align, 0);
                assert!(gap == 0 || gap >= MIN_BLOCK_SIZE);
            }
        }
    }

    #[test]
    fn allocation_size_round_trip() {
        let mut heap = heap(1 << 16);

        for size in 1..200 {
            let ptr = heap.allocate(size).unwrap();
            let usable = unsafe { heap.usable_size(ptr) };

            assert_eq!(usable, align8(size + HEADER_SIZE) - HEADER_SIZE);
            assert!(usable >= size);
            assert_eq!(ptr.as_ptr() as usize % ALIGNMENT, 0);
        }

        heap.verify().unwrap();
    }

    #[test]
    fn grows_by_exactly_the_block_size() {
        let mut heap = heap(1 << 16);

        heap.allocate(10).unwrap();
        assert_eq!(heap.size(), align8(10 + HEADER_SIZE));

        heap.allocate(100).unwrap();
        assert_eq!(heap.size(), align8(10 + HEADER_SIZE) + align8(100 + HEADER_SIZE));
    }

    #[test]
    fn zero_size_is_rejected() {
        let mut heap = heap(1024);

        assert_eq!(heap.allocate(0), Err(AllocError::ZeroSize));
        assert_eq!(heap.zero_allocate(0, 16), Err(AllocError::ZeroSize));
        assert_eq!(heap.size(), 0);
    }

    #[test]
    fn zero_allocate_detects_overflow() {
        let mut heap = heap(1024);

        assert_eq!(heap.zero_allocate(usize::MAX, 2), Err(AllocError::SizeOverflow));
        assert_eq!(heap.zero_allocate(usize::MAX / 2 + 1, 2), Err(AllocError::SizeOverflow));
        assert_eq!(heap.size(), 0);
    }

    #[test]
    fn released_block_is_reused() {
        let mut heap = heap(1 << 16);

        let first = heap.allocate(64).unwrap();
        let _guard = heap.allocate(64).unwrap();
        let size = heap.size();

        unsafe { heap.release(first) };
        let second = heap.allocate(48).unwrap();

        assert_eq!(first, second);
        assert_eq!(heap.size(), size);
        heap.verify().unwrap();
    }

    #[test]
    fn split_leaves_remainder_in_free_list() {
        let mut heap = heap(1 << 16);

        let big = heap.allocate(256).unwrap();
        let _guard = heap.allocate(8).unwrap();
        unsafe { heap.release(big) };

        let small = heap.allocate(16).unwrap();
        assert_eq!(small, big);

        let free: Vec<_> = heap.free_blocks().collect();
        assert_eq!(free.len(), 1);
        assert_eq!(free[0].offset, align8(16 + HEADER_SIZE));
        assert_eq!(free[0].size, align8(256 + HEADER_SIZE) - align8(16 + HEADER_SIZE));
        heap.verify().unwrap();
    }

    #[test]
    fn slivers_are_not_split_off() {
        let mut heap = heap(1 << 16);

        let first = heap.allocate(40).unwrap();
        let _guard = heap.allocate(8).unwrap();
        unsafe { heap.release(first) };

        // 72 - 56 leaves 16 bytes, too little for a header.
        let second = heap.allocate(24).unwrap();

        assert_eq!(second, first);
        assert_eq!(unsafe { heap.usable_size(second) }, 40);
        assert_eq!(heap.free_blocks().count(), 0);
        heap.verify().unwrap();
    }

    #[test]
    fn coalescing_enables_larger_reuse() {
        for reversed in [false, true] {
            let mut heap = heap(1 << 16);

            let a = heap.allocate(64).unwrap();
            let b = heap.allocate(64).unwrap();
            let _c = heap.allocate(64).unwrap();
            let size = heap.size();

            unsafe {
                if reversed {
                    heap.release(b);
                    heap.release(a);
                } else {
                    heap.release(a);
                    heap.release(b);
                }
            }

            assert_eq!(heap.free_blocks().count(), 1);

            let combined = heap.allocate(100).unwrap();
            assert_eq!(combined, a);
            assert_eq!(heap.size(), size);
            heap.verify().unwrap();
        }
    }

    #[test]
    fn release_merges_both_neighbors() {
        let mut heap = heap(1 << 16);

        let a = heap.allocate(64).unwrap();
        let b = heap.allocate(64).unwrap();
        let c = heap.allocate(64).unwrap();
        let _d = heap.allocate(64).unwrap();

        unsafe {
            heap.release(a);
            heap.release(c);
            assert_eq!(heap.free_blocks().count(), 2);

            heap.release(b);
        }

        let free: Vec<_> = heap.free_blocks().collect();
        assert_eq!(free.len(), 1);
        assert_eq!(free[0].offset, 0);
        assert_eq!(free[0].size, 3 * align8(64 + HEADER_SIZE));
        heap.verify().unwrap();
    }

    #[test]
    fn releasing_everything_leaves_one_block() {
        let mut heap = heap(1 << 16);
        let ptrs: Vec<_> = (1..20).map(|i| heap.allocate(i * 12).unwrap()).collect();

        for ptr in ptrs.iter().step_by(2).chain(ptrs.iter().skip(1).step_by(2)) {
            unsafe { heap.release(*ptr) };
            heap.verify().unwrap();
        }

        let blocks: Vec<_> = heap.blocks().collect();
        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0].state, BlockState::Free);
        assert_eq!(blocks[0].size, heap.size());
    }

    #[test]
    fn free_list_stays_address_ordered() {
        let mut heap = heap(1 << 16);
        let ptrs: Vec<_> = (0..10).map(|_| heap.allocate(32).unwrap()).collect();

        for i in [8, 2, 6, 0, 4] {
            unsafe { heap.release(ptrs[i]) };
        }

        let offsets: Vec<_> = heap.free_blocks().map(|block| block.offset).collect();
        let mut sorted = offsets.clone();
        sorted.sort_unstable();

        assert_eq!(offsets.len(), 5);
        assert_eq!(offsets, sorted);
        heap.verify().unwrap();
    }

    #[test]
    fn first_fit_takes_lowest_block() {
        let mut heap = heap(1 << 16);

        let low = heap.allocate(128).unwrap();
        let _guard = heap.allocate(8).unwrap();
        let high = heap.allocate(64).unwrap();
        let _guard = heap.allocate(8).unwrap();

        unsafe {
            heap.release(high);
            heap.release(low);
        }

        // Both fit, the lower address wins even though `high` fits better.
        assert_eq!(heap.allocate(64).unwrap(), low);
    }

    #[test]
    fn shrink_in_place_keeps_data() {
        let mut heap = heap(1 << 16);

        let ptr = heap.allocate(256).unwrap();
        let _guard = heap.allocate(8).unwrap();
        fill(ptr, 256, 0x5A);

        let shrunk = unsafe { heap.reallocate(ptr, 64, ALIGNMENT) }.unwrap();

        assert_eq!(shrunk, ptr);
        assert!(holds(shrunk, 64, 0x5A));
        assert_eq!(unsafe { heap.usable_size(shrunk) }, 64);
        assert_eq!(heap.free_blocks().count(), 1);
        heap.verify().unwrap();
    }

    #[test]
    fn shrink_surplus_merges_with_free_successor() {
        let mut heap = heap(1 << 16);

        let ptr = heap.allocate(256).unwrap();
        let next = heap.allocate(64).unwrap();
        let _guard = heap.allocate(8).unwrap();

        unsafe {
            heap.release(next);
            heap.reallocate(ptr, 32, ALIGNMENT).unwrap();
        }

        let free: Vec<_> = heap.free_blocks().collect();
        assert_eq!(free.len(), 1);
        assert_eq!(free[0].offset, align8(32 + HEADER_SIZE));
        heap.verify().unwrap();
    }

    #[test]
    fn grow_in_place_absorbs_free_successor() {
        let mut heap = heap(1 << 16);

        let ptr = heap.allocate(64).unwrap();
        let next = heap.allocate(256).unwrap();
        let _guard = heap.allocate(8).unwrap();
        fill(ptr, 64, 0x11);
        let size = heap.size();

        unsafe { heap.release(next) };
        let grown = unsafe { heap.reallocate(ptr, 200, ALIGNMENT) }.unwrap();

        assert_eq!(grown, ptr);
        assert!(holds(grown, 64, 0x11));
        assert!(unsafe { heap.usable_size(grown) } >= 200);
        assert_eq!(heap.size(), size);
        heap.verify().unwrap();
    }

    #[test]
    fn grow_in_place_extends_last_block() {
        let mut heap = heap(1 << 16);

        let _first = heap.allocate(8).unwrap();
        let ptr = heap.allocate(64).unwrap();
        fill(ptr, 64, 0x22);
        let size = heap.size();

        let grown = unsafe { heap.reallocate(ptr, 1000, ALIGNMENT) }.unwrap();

        assert_eq!(grown, ptr);
        assert!(holds(grown, 64, 0x22));
        assert_eq!(heap.size(), size + align8(1000 + HEADER_SIZE) - align8(64 + HEADER_SIZE));
        heap.verify().unwrap();
    }

    #[test]
    fn grow_moves_when_boxed_in() {
        let mut heap = heap(1 << 16);

        let ptr = heap.allocate(64).unwrap();
        let _guard = heap.allocate(8).unwrap();
        fill(ptr, 64, 0x33);

        let moved = unsafe { heap.reallocate(ptr, 512, ALIGNMENT) }.unwrap();

        assert_ne!(moved, ptr);
        assert!(holds(moved, 64, 0x33));

        let free: Vec<_> = heap.free_blocks().collect();
        assert_eq!(free.len(), 1);
        assert_eq!(free[0].offset, 0);
        heap.verify().unwrap();
    }

    #[test]
    fn failed_reallocation_keeps_original() {
        let mut heap = heap(512);

        let ptr = heap.allocate(64).unwrap();
        let _guard = heap.allocate(8).unwrap();
        fill(ptr, 64, 0x44);

        let result = unsafe { heap.reallocate(ptr, 4096, ALIGNMENT) };

        assert!(matches!(result, Err(AllocError::OutOfMemory(_))));
        assert!(holds(ptr, 64, 0x44));
        assert_eq!(heap.free_blocks().count(), 0);
        heap.verify().unwrap();
    }

    #[test]
    fn out_of_memory_is_recoverable() {
        let mut heap = heap(256);

        assert_eq!(
            heap.allocate(300),
            Err(AllocError::OutOfMemory(align8(300 + HEADER_SIZE)))
        );

        let ptr = heap.allocate(100).unwrap();
        assert!(heap.allocate(150).is_err());

        let size = heap.size();
        unsafe { heap.release(ptr) };
        assert!(heap.allocate(90).is_ok());
        assert_eq!(heap.size(), size);
        heap.verify().unwrap();
    }

    #[test]
    fn zero_allocate_clears_reused_memory() {
        let mut heap = heap(1 << 16);

        let dirty = heap.allocate(64).unwrap();
        let _guard = heap.allocate(8).unwrap();
        fill(dirty, 64, 0xFF);
        unsafe { heap.release(dirty) };

        let zeroed = heap.zero_allocate(8, 8).unwrap();

        assert_eq!(zeroed, dirty);
        assert!(holds(zeroed, 64, 0));
    }

    #[test]
    fn aligned_allocations() {
        let mut heap = heap(1 << 20);
        let mut ptrs = Vec::new();

        for align in [16, 32, 64, 256, 4096] {
            for size in [1, 24, 100, 1000] {
                let ptr = heap.allocate_aligned(size, align).unwrap();

                assert_eq!(ptr.as_ptr() as usize % align, 0);
                fill(ptr, size, 0x77);
                heap.verify().unwrap();
                ptrs.push(ptr);
            }
        }

        for ptr in ptrs {
            unsafe { heap.release(ptr) };
        }

        heap.verify().unwrap();
        assert_eq!(heap.blocks().count(), 1);
    }

    #[test]
    fn aligned_allocation_reuses_free_blocks() {
        let mut heap = heap(1 << 16);

        let big = heap.allocate(1024).unwrap();
        let _guard = heap.allocate(8).unwrap();
        unsafe { heap.release(big) };
        let size = heap.size();

        let ptr = heap.allocate_aligned(64, 128).unwrap();

        assert_eq!(ptr.as_ptr() as usize % 128, 0);
        assert_eq!(heap.size(), size);
        heap.verify().unwrap();
    }

    #[test]
    fn invalid_alignment_is_rejected() {
        let mut heap = heap(1024);

        assert_eq!(heap.allocate_aligned(8, 24), Err(AllocError::InvalidAlignment(24)));
        assert_eq!(heap.allocate_aligned(8, 0), Err(AllocError::InvalidAlignment(0)));
    }

    #[test]
    fn blocks_cover_the_heap() {
        let mut heap = heap(1 << 16);

        let a = heap.allocate(10).unwrap();
        heap.allocate(20).unwrap();
        heap.allocate(30).unwrap();
        unsafe { heap.release(a) };

        let blocks: Vec<_> = heap.blocks().collect();
        let covered: usize = blocks.iter().map(|block| block.size).sum();

        assert_eq!(blocks.len(), 3);
        assert_eq!(blocks[0].state, BlockState::Free);
        assert_eq!(blocks[1].state, BlockState::Allocated);
        assert_eq!(blocks[1].payload_size(), align8(20 + HEADER_SIZE) - HEADER_SIZE);
        assert_eq!(covered, heap.size());
    }
}
