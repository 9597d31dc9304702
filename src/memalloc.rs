//! Thread-safe allocator front end.
//!
//! [`MemAlloc`] puts a [`Heap`] behind a single spin lock, counts the calls
//! made through each entry point and initializes itself on first use. The
//! process-wide instance lives behind [`global`] and is what
//! [`GlobalMemAlloc`] and the C entry points forward to.
//!
//! A spin lock is used because the usual blocking mutexes may allocate, which
//! is not an option inside the allocator itself. For the same reason nothing
//! is logged while the lock is held.

use std::{
    alloc::{GlobalAlloc, Layout},
    cell::Cell,
    io,
    ptr::{self, NonNull},
};

use log::{debug, info, trace, warn};
use spin::Mutex;

use crate::{
    block::ALIGNMENT,
    check::{HeapSummary, or_abort},
    config::Config,
    error::{AllocError, HeapCorruption},
    heap::Heap,
    kernel::{HeapSource, Kernel},
    stats::{Counters, Stats},
};

/// The allocation interface exposed by this crate: `malloc`, `free`,
/// `realloc`, `calloc` and `malloc_usable_size` expressed in Rust types.
///
/// # Safety
///
/// Implementors must return memory that is valid for reads and writes of at
/// least the requested size, aligned to [`ALIGNMENT`] and not handed out
/// again until it is released.
pub unsafe trait RawAlloc {
    /// Allocates at least `size` bytes.
    fn allocate(&self, size: usize) -> Result<NonNull<u8>, AllocError>;

    /// Releases `ptr`. Releasing `None` does nothing.
    ///
    /// # Safety
    ///
    /// `ptr` must be a live allocation of this allocator.
    unsafe fn release(&self, ptr: Option<NonNull<u8>>);

    /// Resizes `ptr` to `new_size` bytes, preserving its contents up to the
    /// smaller of both sizes. `None` allocates, a size of 0 releases `ptr` and
    /// returns `None`. On error `ptr` stays valid.
    ///
    /// # Safety
    ///
    /// `ptr` must be a live allocation of this allocator.
    unsafe fn reallocate(
        &self,
        ptr: Option<NonNull<u8>>,
        new_size: usize,
    ) -> Result<Option<NonNull<u8>>, AllocError>;

    /// Allocates `count * size` zeroed bytes.
    fn zero_allocate(&self, count: usize, size: usize) -> Result<NonNull<u8>, AllocError>;

    /// Bytes usable behind `ptr`, 0 for `None`.
    ///
    /// # Safety
    ///
    /// `ptr` must be a live allocation of this allocator.
    unsafe fn query_size(&self, ptr: Option<NonNull<u8>>) -> usize;
}

struct State<S> {
    heap: Heap<S>,
    counters: Counters,
    /// Fixed at construction or read from the environment on first use.
    config: Option<Config>,
    initialized: bool,
}

impl<S> State<S> {
    /// Returns the configuration if this is the first call.
    fn initialize(&mut self) -> Option<Config> {
        if self.initialized {
            return None;
        }

        self.initialized = true;

        Some(*self.config.get_or_insert_with(Config::from_env))
    }
}

/// Heap allocator safe to share between threads.
///
/// ```
/// use heapalloc::{BufferSource, MemAlloc, RawAlloc};
///
/// let allocator = MemAlloc::with_source(BufferSource::new(4096).unwrap());
/// let ptr = allocator.allocate(100).unwrap();
///
/// assert!(unsafe { allocator.query_size(Some(ptr)) } >= 100);
/// unsafe { allocator.release(Some(ptr)) };
///
/// assert_eq!(allocator.stats().malloc_calls, 1);
/// assert_eq!(allocator.stats().free_calls, 1);
/// ```
pub struct MemAlloc<S = Kernel> {
    state: Mutex<State<S>>,
    /// Whether this is the instance behind [`global`].
    process_wide: bool,
}

impl MemAlloc<Kernel> {
    /// Allocator over its own [`Kernel`] heap segment.
    pub const fn new() -> Self {
        Self::with_source(Kernel::new())
    }

    const fn process_wide() -> Self {
        Self::build(Kernel::new(), None, true)
    }
}

impl Default for MemAlloc<Kernel> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S> MemAlloc<S> {
    /// Allocator over `source`, configured from the environment on first use.
    pub const fn with_source(source: S) -> Self {
        Self::build(source, None, false)
    }

    /// Allocator over `source` that never looks at the environment.
    pub const fn with_config(source: S, config: Config) -> Self {
        Self::build(source, Some(config), false)
    }

    const fn build(source: S, config: Option<Config>, process_wide: bool) -> Self {
        Self {
            state: Mutex::new(State {
                heap: Heap::new(source),
                counters: Counters::new(),
                config,
                initialized: false,
            }),
            process_wide,
        }
    }

    /// Heap size and call counters so far.
    pub fn stats(&self) -> Stats {
        let state = self.state.lock();

        Stats::new(state.heap.size(), state.counters)
    }

    /// Writes the usage report to `out`.
    pub fn report(&self, out: &mut impl io::Write) -> io::Result<()> {
        let stats = self.stats();

        write!(out, "{stats}")
    }

    /// See [`Heap::verify`].
    pub fn verify(&self) -> Result<HeapSummary, HeapCorruption> {
        self.state.lock().heap.verify()
    }

    /// Verifies the heap and aborts the process if it is corrupted. The
    /// lock is released before anything is reported.
    pub fn check_heap(&self) -> HeapSummary {
        let verified = self.verify();

        or_abort(verified)
    }

    /// Runs `op` under the lock, initializing the allocator first if needed.
    /// Anything worth logging is logged after the lock is gone.
    fn locked<R>(&self, op: impl FnOnce(&mut State<S>) -> R) -> R {
        let (result, init, before, after) = {
            let mut state = self.state.lock();

            let init = state.initialize();
            let before = state.heap.size();
            let result = op(&mut *state);

            (result, init, before, state.heap.size())
        };

        if let Some(config) = init {
            self.on_init(config);
        }

        if after != before {
            emit(|| debug!("heap grew from {before} to {after} bytes"));
        }

        result
    }

    fn on_init(&self, config: Config) {
        emit(|| {
            info!(
                "allocator initialized, exit report {}",
                if config.verbose { "enabled" } else { "disabled" }
            )
        });

        if self.process_wide && config.verbose {
            register_exit_report();
        }
    }
}

impl<S: HeapSource> MemAlloc<S> {
    /// Allocates at least `size` bytes aligned to `align`. Counted as a
    /// `malloc` call.
    pub fn allocate_aligned(&self, size: usize, align: usize) -> Result<NonNull<u8>, AllocError> {
        let result = self.locked(|state| {
            state.counters.malloc_calls += 1;
            state.heap.allocate_aligned(size, align)
        });

        log_result("memalign", size, &result);

        result
    }

    /// Like [`RawAlloc::reallocate`] but keeps the allocation aligned to
    /// `align` should it have to move.
    ///
    /// # Safety
    ///
    /// `ptr` must be a live allocation of this allocator aligned to `align`.
    pub unsafe fn reallocate_aligned(
        &self,
        ptr: Option<NonNull<u8>>,
        new_size: usize,
        align: usize,
    ) -> Result<Option<NonNull<u8>>, AllocError> {
        let result = self.locked(|state| {
            state.counters.realloc_calls += 1;

            match (ptr, new_size) {
                (None, size) => state.heap.allocate_aligned(size, align).map(Some),
                (Some(ptr), 0) => {
                    // SAFETY: guaranteed by the caller.
                    unsafe { state.heap.release(ptr) };
                    Ok(None)
                }
                // SAFETY: guaranteed by the caller.
                (Some(ptr), size) => unsafe { state.heap.reallocate(ptr, size, align) }.map(Some),
            }
        });

        emit(|| match &result {
            Ok(moved) => trace!("realloc({ptr:?}, {new_size}) -> {moved:?}"),
            Err(AllocError::ZeroSize) => trace!("realloc({ptr:?}, 0) -> null"),
            Err(err) => warn!("realloc({ptr:?}, {new_size}) failed: {err}"),
        });

        result
    }
}

// SAFETY: every pointer comes from the heap, which never hands out a block
// twice. The lock serializes all heap access.
unsafe impl<S: HeapSource> RawAlloc for MemAlloc<S> {
    fn allocate(&self, size: usize) -> Result<NonNull<u8>, AllocError> {
        let result = self.locked(|state| {
            state.counters.malloc_calls += 1;
            state.heap.allocate(size)
        });

        log_result("malloc", size, &result);

        result
    }

    unsafe fn release(&self, ptr: Option<NonNull<u8>>) {
        self.locked(|state| {
            state.counters.free_calls += 1;

            if let Some(ptr) = ptr {
                // SAFETY: guaranteed by the caller.
                unsafe { state.heap.release(ptr) };
            }
        });

        emit(|| trace!("free({ptr:?})"));
    }

    unsafe fn reallocate(
        &self,
        ptr: Option<NonNull<u8>>,
        new_size: usize,
    ) -> Result<Option<NonNull<u8>>, AllocError> {
        // SAFETY: guaranteed by the caller, every allocation is 8-byte aligned.
        unsafe { self.reallocate_aligned(ptr, new_size, ALIGNMENT) }
    }

    fn zero_allocate(&self, count: usize, size: usize) -> Result<NonNull<u8>, AllocError> {
        let result = self.locked(|state| {
            state.counters.calloc_calls += 1;
            state.heap.zero_allocate(count, size)
        });

        emit(|| match &result {
            Ok(ptr) => trace!("calloc({count}, {size}) -> {ptr:?}"),
            Err(AllocError::ZeroSize) => trace!("calloc({count}, {size}) -> null"),
            Err(err) => warn!("calloc({count}, {size}) failed: {err}"),
        });

        result
    }

    unsafe fn query_size(&self, ptr: Option<NonNull<u8>>) -> usize {
        match ptr {
            // SAFETY: guaranteed by the caller.
            Some(ptr) => self.locked(|state| unsafe { state.heap.usable_size(ptr) }),
            None => 0,
        }
    }
}

unsafe impl<S: HeapSource> GlobalAlloc for MemAlloc<S> {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        self.allocate_aligned(layout.size(), layout.align())
            .map_or(ptr::null_mut(), NonNull::as_ptr)
    }

    unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
        // SAFETY: `ptr` was allocated by us, see `GlobalAlloc::dealloc`.
        unsafe { self.release(NonNull::new(ptr)) }
    }

    unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
        let result = self.locked(|state| {
            state.counters.calloc_calls += 1;
            state.heap.allocate_zeroed(layout.size(), layout.align())
        });

        log_result("calloc", layout.size(), &result);

        result.map_or(ptr::null_mut(), NonNull::as_ptr)
    }

    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        // SAFETY: `ptr` is a live allocation with `layout`, see `GlobalAlloc::realloc`.
        let result = unsafe { self.reallocate_aligned(NonNull::new(ptr), new_size, layout.align()) };

        match result {
            Ok(Some(ptr)) => ptr.as_ptr(),
            Ok(None) | Err(_) => ptr::null_mut(),
        }
    }
}

static GLOBAL: MemAlloc<Kernel> = MemAlloc::process_wide();

/// The process-wide allocator. Prints its report on exit unless
/// `MALLOCVERBOSE=NO`.
pub fn global() -> &'static MemAlloc<Kernel> {
    &GLOBAL
}

/// Handle to [`global`] usable as the Rust global allocator.
///
/// ```no_run
/// #[global_allocator]
/// static ALLOCATOR: heapalloc::GlobalMemAlloc = heapalloc::GlobalMemAlloc;
///
/// fn main() {
///     let boxed = Box::new(42);
///     assert_eq!(*boxed, 42);
/// }
/// ```
#[derive(Debug, Default, Clone, Copy)]
pub struct GlobalMemAlloc;

unsafe impl GlobalAlloc for GlobalMemAlloc {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        unsafe { GLOBAL.alloc(layout) }
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        unsafe { GLOBAL.dealloc(ptr, layout) }
    }

    unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
        unsafe { GLOBAL.alloc_zeroed(layout) }
    }

    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        unsafe { GLOBAL.realloc(ptr, layout, new_size) }
    }
}

// SAFETY: forwards to the global instance.
unsafe impl RawAlloc for GlobalMemAlloc {
    fn allocate(&self, size: usize) -> Result<NonNull<u8>, AllocError> {
        GLOBAL.allocate(size)
    }

    unsafe fn release(&self, ptr: Option<NonNull<u8>>) {
        unsafe { GLOBAL.release(ptr) }
    }

    unsafe fn reallocate(
        &self,
        ptr: Option<NonNull<u8>>,
        new_size: usize,
    ) -> Result<Option<NonNull<u8>>, AllocError> {
        unsafe { GLOBAL.reallocate(ptr, new_size) }
    }

    fn zero_allocate(&self, count: usize, size: usize) -> Result<NonNull<u8>, AllocError> {
        GLOBAL.zero_allocate(count, size)
    }

    unsafe fn query_size(&self, ptr: Option<NonNull<u8>>) -> usize {
        unsafe { GLOBAL.query_size(ptr) }
    }
}

#[cfg(unix)]
fn register_exit_report() {
    extern "C" fn exit_report() {
        // Nowhere left to report a failed write to.
        let _ = GLOBAL.report(&mut io::stdout().lock());
    }

    // SAFETY: `exit_report` is a plain function that outlives the process.
    if unsafe { libc::atexit(exit_report) } != 0 {
        emit(|| warn!("could not register the exit report"));
    }
}

#[cfg(not(unix))]
fn register_exit_report() {}

thread_local! {
    static LOGGING: Cell<bool> = const { Cell::new(false) };
}

/// Marks the current thread as logging on behalf of the allocator.
struct LogGuard;

impl LogGuard {
    fn enter() -> Option<Self> {
        LOGGING
            .try_with(|logging| !logging.replace(true))
            .ok()
            .and_then(|entered| entered.then_some(LogGuard))
    }
}

impl Drop for LogGuard {
    fn drop(&mut self) {
        let _ = LOGGING.try_with(|logging| logging.set(false));
    }
}

/// Runs `log` unless this thread is already logging for the allocator, which
/// happens when the logger itself allocates.
fn emit(log: impl FnOnce()) {
    if let Some(_guard) = LogGuard::enter() {
        log();
    }
}

fn log_result(op: &str, size: usize, result: &Result<NonNull<u8>, AllocError>) {
    emit(|| match result {
        Ok(ptr) => trace!("{op}({size}) -> {ptr:?}"),
        Err(AllocError::ZeroSize) => trace!("{op}(0) -> null"),
        Err(err) => warn!("{op}({size}) failed: {err}"),
    });
}
