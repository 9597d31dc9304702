use std::fmt;

/// Number of calls made through each public entry point.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Counters {
    pub malloc_calls: u64,
    pub free_calls: u64,
    pub realloc_calls: u64,
    pub calloc_calls: u64,
}

impl Counters {
    pub const fn new() -> Self {
        Self {
            malloc_calls: 0,
            free_calls: 0,
            realloc_calls: 0,
            calloc_calls: 0,
        }
    }
}

/// Usage report of an allocator.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Stats {
    /// Bytes obtained from the heap source.
    pub heap_size: usize,
    pub malloc_calls: u64,
    pub free_calls: u64,
    pub realloc_calls: u64,
    pub calloc_calls: u64,
}

impl Stats {
    pub(crate) fn new(heap_size: usize, counters: Counters) -> Self {
        Self {
            heap_size,
            malloc_calls: counters.malloc_calls,
            free_calls: counters.free_calls,
            realloc_calls: counters.realloc_calls,
            calloc_calls: counters.calloc_calls,
        }
    }

    /// Sum of all counted calls.
    pub fn total_calls(&self) -> u64 {
        self.malloc_calls + self.free_calls + self.realloc_calls + self.calloc_calls
    }
}

/// The exit-time report.
impl fmt::Display for Stats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f)?;
        writeln!(f, "-------------------")?;
        writeln!(f, "HeapSize:\t{} bytes", self.heap_size)?;
        writeln!(f, "# mallocs:\t{}", self.malloc_calls)?;
        writeln!(f, "# reallocs:\t{}", self.realloc_calls)?;
        writeln!(f, "# callocs:\t{}", self.calloc_calls)?;
        writeln!(f, "# frees:\t{}", self.free_calls)?;
        writeln!(f)?;
        writeln!(f, "-------------------")
    }
}
