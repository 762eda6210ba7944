pub(crate) mod sync;

// public module: contains implementation details (hidden via pub(crate))
// and TEST_MUTEX (public for tests)
pub mod memory;

// pool
pub use memory::geometry::{
    Buddy, DEFAULT_NCHUNKS_ORDER, Geometry, Handle, MAX_NCHUNKS_ORDER, MIN_NCHUNKS_ORDER,
    Z3foldConfig,
};
pub use memory::header::{PageFlags, Z3foldHeader};
pub use memory::z3fold::{EvictionHandler, PoolStats, Z3foldPool};

// page sources
pub use memory::page_source::{HeapPageSource, PageArena, PageSource};

// zpool glue
pub use memory::zpool::{
    GlobalZpoolRegistry, MapMode, Z3foldDriver, ZpoolBackend, ZpoolDriver, ZpoolOps,
    ZpoolRegistry,
};

// stats
pub use memory::stats::{MemoryStats, snapshot as memory_stats};

// errors
pub use memory::vm::VmError;
pub use memory::z3fold::Z3foldError;
