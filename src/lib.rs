//! A first-fit free-list heap allocator.
//!
//! The heap is one contiguous span that only ever grows. It is carved into
//! blocks, each starting with a header that records its size, its state and
//! the size of the block before it (a boundary tag). Free blocks are kept in
//! an address-ordered list and released blocks are merged with free
//! neighbors right away, so no two neighboring blocks are ever free.
//!
//! ```text
//! +--------+---------+--------+-------------+--------+
//! | Header | Payload | Header | Free        | Header | ...
//! +--------+---------+--------+-------------+--------+
//! ```
//!
//! The crate is layered:
//!
//! - [`HeapSource`] hands out address space, [`Kernel`] being the process
//!   heap segment and [`BufferSource`] a fixed buffer.
//! - [`Heap`] is the single-threaded allocator core.
//! - [`MemAlloc`] adds locking, call counters and lazy initialization, and
//!   implements both [`RawAlloc`] and [`std::alloc::GlobalAlloc`].
//! - [`global`] is the process-wide instance. [`GlobalMemAlloc`] plugs it in
//!   as the Rust global allocator and the `c-abi` feature exports it as
//!   `malloc` and friends.
//!
//! The exit-time report of the process-wide instance can be turned off with
//! `MALLOCVERBOSE=NO`.

mod block;
mod check;
mod config;
mod error;
mod freelist;
mod heap;
mod kernel;
mod memalloc;
mod stats;
mod utils;

#[cfg(all(feature = "c-abi", unix, not(test)))]
mod ffi;

pub use block::{ALIGNMENT, BlockInfo, BlockState, HEADER_SIZE, MIN_BLOCK_SIZE};
pub use check::HeapSummary;
pub use config::{Config, VERBOSE_ENV, VERBOSE_OFF};
pub use error::{AllocError, HeapCorruption};
pub use heap::{Blocks, Heap, block_size};
pub use kernel::{BufferSource, DEFAULT_RESERVE, HeapSource, Kernel};
pub use memalloc::{GlobalMemAlloc, MemAlloc, RawAlloc, global};
pub use stats::Stats;
pub use utils::align8;
