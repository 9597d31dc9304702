//! Drives an allocator instance by hand and prints what happens to its heap.

use std::{io, ptr::NonNull};

use heapalloc::{AllocError, MemAlloc, RawAlloc};

fn log_alloc(size: usize, addr: NonNull<u8>) {
    println!("Requested {size} bytes of memory");
    println!("Received this address: {addr:?}");
}

fn main() -> Result<(), AllocError> {
    let allocator = MemAlloc::new();

    let addr1 = allocator.allocate(8)?;
    log_alloc(8, addr1);

    let addr2 = allocator.allocate(100)?;
    log_alloc(100, addr2);

    let addr3 = allocator.zero_allocate(4, 16)?;
    log_alloc(64, addr3);

    unsafe {
        allocator.release(Some(addr1));
        allocator.release(Some(addr2));

        // Fits in the block merged from the first two.
        let addr4 = allocator.allocate(120)?;
        println!("Reused {addr1:?}: {}", addr4 == addr1);

        let addr4 = allocator.reallocate(Some(addr4), 1000)?;
        println!("Reallocated to {addr4:?}");

        allocator.release(addr4);
        allocator.release(Some(addr3));
    }

    let summary = allocator.check_heap();
    println!(
        "{} blocks, {} free bytes",
        summary.blocks(),
        summary.free_bytes
    );

    // Nothing sensible to do if stdout is gone.
    let _ = allocator.report(&mut io::stdout());

    Ok(())
}
