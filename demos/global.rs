//! This example is designed to test the implementation of
//! the trait `GlobalAlloc` on our allocator. See [`GlobalMemAlloc`] to
//! see the actual trait implementation.
//!
//! The heap statistics are printed when the process exits, run with
//! `MALLOCVERBOSE=NO` to silence them.

use heapalloc::GlobalMemAlloc;
use std::thread;

#[global_allocator]
static ALLOCATOR: GlobalMemAlloc = GlobalMemAlloc;

fn main() {
    // Box example
    let val_box = Box::new(22);
    println!("Box Value: {}, At: {:p}", val_box, val_box);

    // Vec example
    let mut v = Vec::new();
    for i in 0..5 {
        v.push(i * 10);
        println!("Added {}; Capacity: {}; At: {:p}", v[i], v.capacity(), v.as_ptr());
    }

    // String example
    let msg = String::from("Heap Testing");
    println!("\nString '{}' - At: {:p}", msg, msg.as_ptr());

    // Merge example
    let a = Box::new([0u8; 64]);
    let b = Box::new([0u8; 64]);
    let ptr_a = a.as_ptr();

    drop(a);
    drop(b);

    let c = Box::new([0u8; 128]);
    let ptr_c = c.as_ptr();

    if ptr_a == ptr_c {
        println!("Correctly reused at {:p}", ptr_c);
    } else {
        println!("Not reused. A was at {:p} and C is at {:p}", ptr_a, ptr_c);
    }

    // Thread example
    let handles: Vec<_> = (0..4)
        .map(|i| {
            thread::spawn(move || {
                let data: Vec<u64> = (0..1000).map(|n| n * i).collect();
                data.iter().sum::<u64>()
            })
        })
        .collect();

    for handle in handles {
        println!("Thread sum: {}", handle.join().unwrap());
    }

    let summary = heapalloc::global().check_heap();
    println!("\nHeap has {} blocks, {} free", summary.blocks(), summary.free_blocks);
}
