//! C entry points over [`global`], built with the `c-abi` feature.
//!
//! Building the crate as a `cdylib` with this feature yields a library that
//! can be preloaded to replace the allocator of any dynamically linked
//! program. Failures are reported the C way, as null pointers.

use std::{
    os::raw::{c_int, c_void},
    ptr::{self, NonNull},
};

use crate::{
    block::ALIGNMENT,
    error::AllocError,
    memalloc::{RawAlloc, global},
};

fn into_raw(result: Result<NonNull<u8>, AllocError>) -> *mut c_void {
    result.map_or(ptr::null_mut(), |ptr| ptr.as_ptr().cast())
}

/// # Safety
///
/// The returned pointer must only be released through this library.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn malloc(size: usize) -> *mut c_void {
    into_raw(global().allocate(size))
}

/// # Safety
///
/// `ptr` must be null or a live allocation of this library.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn free(ptr: *mut c_void) {
    unsafe { global().release(NonNull::new(ptr.cast())) }
}

/// # Safety
///
/// `ptr` must be null or a live allocation of this library.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn realloc(ptr: *mut c_void, size: usize) -> *mut c_void {
    match unsafe { global().reallocate(NonNull::new(ptr.cast()), size) } {
        Ok(Some(ptr)) => ptr.as_ptr().cast(),
        Ok(None) | Err(_) => ptr::null_mut(),
    }
}

/// # Safety
///
/// The returned pointer must only be released through this library.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn calloc(count: usize, size: usize) -> *mut c_void {
    into_raw(global().zero_allocate(count, size))
}

/// # Safety
///
/// `ptr` must be null or a live allocation of this library.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn malloc_usable_size(ptr: *mut c_void) -> usize {
    unsafe { global().query_size(NonNull::new(ptr.cast())) }
}

/// Returns `EINVAL` for an alignment that is not a power of two multiple of
/// the pointer size. Any other failure is `ENOMEM`, including a `size` of 0,
/// which this allocator never satisfies.
///
/// # Safety
///
/// `memptr` must be valid for a pointer-sized write.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn posix_memalign(
    memptr: *mut *mut c_void,
    alignment: usize,
    size: usize,
) -> c_int {
    if !alignment.is_power_of_two() || alignment % size_of::<usize>() != 0 {
        return libc::EINVAL;
    }

    match global().allocate_aligned(size, alignment) {
        Ok(ptr) => {
            // SAFETY: guaranteed by the caller.
            unsafe { *memptr = ptr.as_ptr().cast() };
            0
        }
        Err(_) => libc::ENOMEM,
    }
}

/// # Safety
///
/// The returned pointer must only be released through this library.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn aligned_alloc(alignment: usize, size: usize) -> *mut c_void {
    into_raw(global().allocate_aligned(size, alignment.max(ALIGNMENT)))
}

/// # Safety
///
/// The returned pointer must only be released through this library.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn memalign(alignment: usize, size: usize) -> *mut c_void {
    into_raw(global().allocate_aligned(size, alignment.max(ALIGNMENT)))
}

/// Aborts the process if the heap is corrupted.
#[unsafe(no_mangle)]
pub extern "C" fn check_heap() {
    global().check_heap();
}
