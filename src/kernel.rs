use std::{
    alloc::{GlobalAlloc, Layout, System},
    ptr::NonNull,
};

use crate::{error::AllocError, utils::align};

/// Address space reserved up front by [`Kernel::new`].
#[cfg(target_pointer_width = "64")]
pub const DEFAULT_RESERVE: usize = 16 << 30;
#[cfg(not(target_pointer_width = "64"))]
pub const DEFAULT_RESERVE: usize = 512 << 20;

/// Primitive the heap uses to obtain address space, modeled after `sbrk(2)`.
///
/// # Safety
///
/// Implementors must hand out a single contiguous span: every successful call
/// returns the previous end of the span and moves the end forward by exactly
/// `increment` bytes, which must stay readable and writable for as long as the
/// source lives. The first address must be a multiple of
/// [`crate::ALIGNMENT`]. Memory is never taken back.
pub unsafe trait HeapSource {
    /// Extends the heap by `increment` bytes and returns the old end, or `None`
    /// if the heap cannot grow. An `increment` of 0 queries the current end.
    fn sbrk(&mut self, increment: usize) -> Option<NonNull<u8>>;
}

/// The process heap segment.
///
/// Instead of moving the real program break, which the system allocator also
/// uses, the kernel reserves one large span of address space on first use and
/// commits it page by page as the break advances. The heap therefore stays
/// contiguous no matter who else is allocating in the process.
///
/// ```text
///  start                 brk        committed                     reserved
///    |<----- heap ------->|<- ready ->|<------- inaccessible -------->|
/// ```
pub struct Kernel {
    start: Option<NonNull<u8>>,
    /// Bytes handed out to the heap.
    brk: usize,
    /// Bytes readable and writable.
    committed: usize,
    /// Size of the reservation.
    reserve: usize,
    page_size: usize,
}

/// This trait provides an abstraction to handle low level memory operations
/// and syscalls. As the allocator, our top level view of this, has nothing
/// to do with the concrete implementations / APIs offered by each kernel.
trait PlatformMemory {
    /// Reserves `len` bytes of inaccessible address space.
    unsafe fn reserve_memory(len: usize) -> Option<NonNull<u8>>;

    /// Makes `len` bytes starting at `addr` readable and writable. Both are
    /// page aligned and inside a reservation.
    unsafe fn commit_memory(addr: NonNull<u8>, len: usize) -> bool;

    /// Returns the virtual memory page size of the computer in bytes.
    unsafe fn page_size() -> usize;
}

impl Kernel {
    /// Creates a kernel source reserving [`DEFAULT_RESERVE`] bytes on first use.
    pub const fn new() -> Self {
        Self::with_reserve(DEFAULT_RESERVE)
    }

    /// Creates a kernel source that can hand out at most `reserve` bytes.
    pub const fn with_reserve(reserve: usize) -> Self {
        Self {
            start: None,
            brk: 0,
            committed: 0,
            reserve,
            page_size: 0,
        }
    }

    fn start(&mut self) -> Option<NonNull<u8>> {
        if self.start.is_none() {
            // SAFETY: plain syscalls without preconditions.
            unsafe {
                self.page_size = Self::page_size();
                self.reserve = align(self.reserve, self.page_size);
                self.start = Self::reserve_memory(self.reserve);
            }
        }

        self.start
    }
}

impl Default for Kernel {
    fn default() -> Self {
        Self::new()
    }
}

// SAFETY: `start..start + brk` only grows, is committed before it is handed
// out and is never unmapped. The reservation is page aligned.
unsafe impl HeapSource for Kernel {
    fn sbrk(&mut self, increment: usize) -> Option<NonNull<u8>> {
        let start = self.start()?;
        let old_brk = self.brk;
        let new_brk = old_brk.checked_add(increment).filter(|&brk| brk <= self.reserve)?;

        if new_brk > self.committed {
            let target = align(new_brk, self.page_size).min(self.reserve);

            // SAFETY: `committed..target` is page aligned and inside the reservation.
            let committed = unsafe {
                Self::commit_memory(start.add(self.committed), target - self.committed)
            };

            if !committed {
                return None;
            }

            self.committed = target;
        }

        self.brk = new_brk;

        // SAFETY: `old_brk` is within the reservation.
        Some(unsafe { start.add(old_brk) })
    }
}

// SAFETY: the reservation is owned exclusively by this value.
unsafe impl Send for Kernel {}

#[cfg(unix)]
mod unix {
    use super::{Kernel, PlatformMemory};

    use libc::{mmap, mprotect, off_t, size_t};

    use std::{
        os::raw::{c_int, c_void},
        ptr::NonNull,
    };

    impl PlatformMemory for Kernel {
        unsafe fn reserve_memory(len: usize) -> Option<NonNull<u8>> {
            // mmap parameters.
            const ADDR: *mut c_void = std::ptr::null_mut::<c_void>();
            // Nothing is accessible until committed.
            const PROT: c_int = libc::PROT_NONE;
            const FLAGS: c_int = libc::MAP_PRIVATE | libc::MAP_ANONYMOUS;
            const FD: c_int = -1;
            const OFFSET: off_t = 0;

            unsafe {
                let addr = mmap(ADDR, len as size_t, PROT, FLAGS, FD, OFFSET);

                match addr {
                    libc::MAP_FAILED => None,
                    addr => NonNull::new(addr.cast::<u8>()),
                }
            }
        }

        unsafe fn commit_memory(addr: NonNull<u8>, len: usize) -> bool {
            // Read-Write only memory.
            const PROT: c_int = libc::PROT_READ | libc::PROT_WRITE;

            unsafe { mprotect(addr.as_ptr().cast(), len as size_t, PROT) == 0 }
        }

        unsafe fn page_size() -> usize {
            unsafe { libc::sysconf(libc::_SC_PAGE_SIZE) as usize }
        }
    }
}

#[cfg(windows)]
mod windows {
    use std::{mem::MaybeUninit, os::raw::c_void, ptr::NonNull};

    use crate::kernel::{Kernel, PlatformMemory};

    use windows::Win32::System::{Memory, SystemInformation};

    impl PlatformMemory for Kernel {
        unsafe fn reserve_memory(len: usize) -> Option<NonNull<u8>> {
            unsafe {
                let addr = Memory::VirtualAlloc(None, len, Memory::MEM_RESERVE, Memory::PAGE_NOACCESS);

                NonNull::new(addr.cast())
            }
        }

        unsafe fn commit_memory(addr: NonNull<u8>, len: usize) -> bool {
            unsafe {
                let committed = Memory::VirtualAlloc(
                    Some(addr.as_ptr() as *const c_void),
                    len,
                    Memory::MEM_COMMIT,
                    Memory::PAGE_READWRITE,
                );

                !committed.is_null()
            }
        }

        unsafe fn page_size() -> usize {
            unsafe {
                let mut system_info = MaybeUninit::uninit();
                SystemInformation::GetSystemInfo(system_info.as_mut_ptr());

                system_info.assume_init().dwPageSize as usize
            }
        }
    }
}

/// Fixed-capacity heap source over a buffer from the system allocator.
///
/// Used for isolated allocator instances. Running past the capacity behaves
/// like the OS refusing to grow the heap.
pub struct BufferSource {
    start: NonNull<u8>,
    brk: usize,
    capacity: usize,
}

impl BufferSource {
    const ALIGN: usize = 16;

    pub fn new(capacity: usize) -> Result<Self, AllocError> {
        let layout = Layout::from_size_align(capacity.max(Self::ALIGN), Self::ALIGN)
            .map_err(|_| AllocError::SizeOverflow)?;

        // SAFETY: the layout has a non-zero size.
        let start = NonNull::new(unsafe { System.alloc(layout) })
            .ok_or(AllocError::OutOfMemory(layout.size()))?;

        Ok(Self {
            start,
            brk: 0,
            capacity,
        })
    }

    /// Bytes not handed out yet.
    pub fn remaining(&self) -> usize {
        self.capacity - self.brk
    }
}

// SAFETY: the buffer is exclusively owned, contiguous and 16-byte aligned.
unsafe impl HeapSource for BufferSource {
    fn sbrk(&mut self, increment: usize) -> Option<NonNull<u8>> {
        if increment > self.remaining() {
            return None;
        }

        let old_brk = self.brk;
        self.brk += increment;

        // SAFETY: `old_brk <= capacity`.
        Some(unsafe { self.start.add(old_brk) })
    }
}

impl Drop for BufferSource {
    fn drop(&mut self) {
        // SAFETY: same layout as in `new`.
        unsafe {
            let layout = Layout::from_size_align_unchecked(self.capacity.max(Self::ALIGN), Self::ALIGN);
            System.dealloc(self.start.as_ptr(), layout);
        }
    }
}

// SAFETY: the buffer is owned exclusively by this value.
unsafe impl Send for BufferSource {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn buffer_source_moves_break() {
        let mut source = BufferSource::new(256).unwrap();

        let start = source.sbrk(0).unwrap();
        assert_eq!(start.as_ptr() as usize % BufferSource::ALIGN, 0);

        let first = source.sbrk(64).unwrap();
        assert_eq!(first, start);

        let second = source.sbrk(32).unwrap();
        assert_eq!(second.as_ptr() as usize, start.as_ptr() as usize + 64);
        assert_eq!(source.remaining(), 160);
    }

    #[test]
    fn buffer_source_refuses_to_overflow() {
        let mut source = BufferSource::new(128).unwrap();

        assert!(source.sbrk(96).is_some());
        assert!(source.sbrk(64).is_none());
        // A failed request leaves the break untouched.
        assert!(source.sbrk(32).is_some());
        assert_eq!(source.remaining(), 0);
        assert!(source.sbrk(1).is_none());
    }

    #[cfg(any(unix, windows))]
    #[test]
    fn kernel_commits_contiguous_memory() {
        let mut kernel = Kernel::with_reserve(1 << 20);

        let start = kernel.sbrk(0).unwrap();
        let first = kernel.sbrk(100).unwrap();
        let second = kernel.sbrk(10_000).unwrap();

        assert_eq!(start, first);
        assert_eq!(second.as_ptr() as usize, start.as_ptr() as usize + 100);

        unsafe {
            // Everything up to the break is writable.
            second.as_ptr().write_bytes(0xAB, 10_000);
            assert_eq!(*second.as_ptr().add(9_999), 0xAB);
        }
    }

    #[cfg(any(unix, windows))]
    #[test]
    fn kernel_stops_at_reservation() {
        let mut kernel = Kernel::with_reserve(1 << 16);

        assert!(kernel.sbrk(1 << 16).is_some());
        assert!(kernel.sbrk(1).is_none());
        assert!(kernel.sbrk(0).is_some());
    }
}
