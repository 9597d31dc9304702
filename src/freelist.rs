use crate::block::{Arena, NIL};

/// Linked list to keep track of free blocks, ordered by address.
///
/// The list does not own any storage. Its links live in the headers of the
/// free blocks themselves and are stored as heap offsets, so nothing the
/// allocator follows is reachable through a caller-visible payload.
///
/// ```text
///                       Free List (ascending address)
///
///               next_free                       next_free
///         +--------------------+  +--------------------------------------+
///         |                    |  |                                      |
/// +-------|------+  +-------+  +--|---|------+  +-------+  +-------+  +--|---------+
/// | Free (hdr)   |  | Block |  | Free (hdr)  |  | Block |  | Block |  | Free (hdr) |
/// +--------------+  +-------+  +-------------+  +-------+  +-------+  +------------+
/// ```
///
/// Physical neighbors are not found through this list but through the block
/// sizes and boundary tags, see [`Arena::next_of`] and [`Arena::prev_of`].
pub(crate) struct FreeList {
    head: usize,
    tail: usize,
    len: usize,
}

/// Ascending iterator over the offsets of the free blocks.
pub(crate) struct Iter<'a> {
    arena: &'a Arena,
    current: usize,
    remaining: usize,
}

impl FreeList {
    /// Creates a new empty List
    pub const fn new() -> Self {
        Self {
            head: NIL,
            tail: NIL,
            len: 0,
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn first(&self) -> Option<usize> {
        (self.head != NIL).then_some(self.head)
    }

    #[inline]
    pub fn last(&self) -> Option<usize> {
        (self.tail != NIL).then_some(self.tail)
    }

    /// Inserts the free block at `offset` keeping the list sorted.
    ///
    /// Blocks past the current tail are appended in O(1), which covers fresh
    /// heap growth and releases at the end of the heap. Everything else walks
    /// the list from the head to find the predecessor.
    pub fn insert(&mut self, arena: &mut Arena, offset: usize) {
        if self.tail == NIL || self.tail < offset {
            self.link(arena, self.tail, offset, NIL);
            return;
        }

        let mut prev = NIL;
        let mut current = self.head;

        while current != NIL && current < offset {
            prev = current;
            current = arena.header(current).next_free;
        }

        debug_assert_ne!(current, offset, "block {offset:#x} is already free");

        self.link(arena, prev, offset, current);
    }

    /// Unlinks the block at `offset` in O(1).
    pub fn remove(&mut self, arena: &mut Arena, offset: usize) {
        let header = arena.header(offset);
        let (prev, next) = (header.prev_free, header.next_free);

        if prev == NIL {
            self.head = next;
        } else {
            arena.header_mut(prev).next_free = next;
        }

        if next == NIL {
            self.tail = prev;
        } else {
            arena.header_mut(next).prev_free = prev;
        }

        self.len -= 1;
    }

    /// Puts the block at `new` where `old` was.
    ///
    /// Only valid when no other free block lies between `old` and `new`, which
    /// is the case when `new` was split off `old` or `new` absorbs `old` as its
    /// physical successor. The header of `old` must still hold its links.
    pub fn replace(&mut self, arena: &mut Arena, old: usize, new: usize) {
        let header = arena.header(old);
        let (prev, next) = (header.prev_free, header.next_free);

        debug_assert!(prev == NIL || prev < new);
        debug_assert!(next == NIL || new < next);

        let header = arena.header_mut(new);
        header.prev_free = prev;
        header.next_free = next;

        if prev == NIL {
            self.head = new;
        } else {
            arena.header_mut(prev).next_free = new;
        }

        if next == NIL {
            self.tail = new;
        } else {
            arena.header_mut(next).prev_free = new;
        }
    }

    /// Returns the first block, in address order, accepted by `fits`.
    ///
    /// This is the first-fit policy: the scan stops at the first match, there
    /// is no search for a better one.
    pub fn first_fit(&self, arena: &Arena, mut fits: impl FnMut(usize, usize) -> bool) -> Option<usize> {
        self.iter(arena)
            .find(|&offset| fits(offset, arena.header(offset).size()))
    }

    pub fn iter<'a>(&self, arena: &'a Arena) -> Iter<'a> {
        Iter {
            arena,
            current: self.head,
            remaining: self.len,
        }
    }

    fn link(&mut self, arena: &mut Arena, prev: usize, offset: usize, next: usize) {
        let header = arena.header_mut(offset);
        header.prev_free = prev;
        header.next_free = next;

        if prev == NIL {
            self.head = offset;
        } else {
            arena.header_mut(prev).next_free = offset;
        }

        if next == NIL {
            self.tail = offset;
        } else {
            arena.header_mut(next).prev_free = offset;
        }

        self.len += 1;
    }
}

impl Iterator for Iter<'_> {
    type Item = usize;

    fn next(&mut self) -> Option<Self::Item> {
        if self.current == NIL || self.remaining == 0 {
            return None;
        }

        let offset = self.current;
        self.current = self.arena.header(offset).next_free;
        self.remaining -= 1;

        Some(offset)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (0, Some(self.remaining))
    }
}
