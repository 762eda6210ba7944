#[cfg(all(test, not(loom)))]
mod tests {
    use crate::memory::geometry::Handle;
    use crate::memory::page_source::{HeapPageSource, PageArena, PageSource};
    use crate::memory::stats;
    use crate::memory::z3fold::{EvictionHandler, Z3foldError, Z3foldPool};
    use crate::memory::zpool::{MapMode, ZpoolBackend, ZpoolOps, ZpoolRegistry};
    use crate::sync::barrier::Barrier;
    use crate::sync::thread;
    use std::collections::HashMap;
    use crate::sync::atomic::{AtomicU64, Ordering};
    use std::sync::{Arc, Mutex as StdMutex};

    const PAGE: usize = 4096;

    fn init_logger() {
        let _ = env_logger::builder().is_test(true).try_init();
    }

    /// Deterministic xorshift so failures reproduce.
    struct Rng(u64);

    impl Rng {
        fn next(&mut self) -> u64 {
            self.0 ^= self.0 << 13;
            self.0 ^= self.0 >> 7;
            self.0 ^= self.0 << 17;
            self.0
        }

        fn size(&mut self) -> usize {
            // Mostly compressible-page sizes, some headless.
            match self.next() % 10 {
                0 => PAGE - (self.next() % 64) as usize,
                _ => 1 + (self.next() % 2000) as usize,
            }
        }
    }

    fn fill(pool: &Z3foldPool, handle: Handle, len: usize, tag: u8) {
        let ptr = pool.map(handle).unwrap();
        // Safety: Test code; the object holds `len` bytes.
        unsafe { std::ptr::write_bytes(ptr.as_ptr(), tag, len) };
        pool.unmap(handle);
    }

    fn verify(pool: &Z3foldPool, handle: Handle, len: usize, tag: u8) {
        let ptr = pool.map(handle).unwrap();
        // Safety: Test code.
        let bytes = unsafe { std::slice::from_raw_parts(ptr.as_ptr(), len) };
        assert!(
            bytes.iter().all(|&b| b == tag),
            "object {handle} of {len} bytes corrupted"
        );
        pool.unmap(handle);
    }

    #[test]
    fn test_integration_threads_alloc_free() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        init_logger();
        let arena = Arc::new(PageArena::new(PAGE, 4096 * PAGE).unwrap());
        let pool = Arc::new(Z3foldPool::new(arena.clone(), None).unwrap());
        let threads = 4;
        let barrier = Arc::new(Barrier::new(threads));

        let handles: Vec<_> = (0..threads)
            .map(|t| {
                let pool = pool.clone();
                let barrier = barrier.clone();
                thread::spawn(move || {
                    let mut rng = Rng(0x9e37_79b9_7f4a_7c15 ^ (t as u64 + 1));
                    let tag = t as u8 + 1;
                    let mut live: Vec<(Handle, usize)> = Vec::new();
                    barrier.wait();
                    for i in 0..2000 {
                        if live.len() < 64 && (i % 3 != 0 || live.is_empty()) {
                            let size = rng.size();
                            let h = pool.alloc(size, false).unwrap();
                            fill(&pool, h, size, tag);
                            live.push((h, size));
                        } else {
                            let idx = (rng.next() as usize) % live.len();
                            let (h, size) = live.swap_remove(idx);
                            verify(&pool, h, size, tag);
                            pool.free(h);
                        }
                    }
                    for (h, size) in live {
                        verify(&pool, h, size, tag);
                        pool.free(h);
                    }
                })
            })
            .collect();

        for h in handles {
            h.join().unwrap();
        }

        pool.check_invariants();
        assert_eq!(pool.size(), 0);
        assert_eq!(arena.live_pages(), 0);

        arena.trim();
        assert_eq!(arena.committed_bytes(), 0);
    }

    /// Owners and the eviction handler race to free the same objects; the
    /// `live` map decides who wins. Handle values are reused once freed, so
    /// each object also carries a unique id.
    struct Owners {
        live: StdMutex<HashMap<Handle, u64>>,
        next_id: AtomicU64,
    }

    impl EvictionHandler for Owners {
        fn evict(&self, pool: &Z3foldPool, handle: Handle) -> Result<(), Z3foldError> {
            let mut live = self.live.lock().unwrap();
            if live.remove(&handle).is_some() {
                pool.free(handle);
            }
            Ok(())
        }
    }

    #[test]
    fn test_integration_reclaim_races_owners() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        init_logger();
        let source = Arc::new(HeapPageSource::new(PAGE).unwrap());
        let owners = Arc::new(Owners {
            live: StdMutex::new(HashMap::new()),
            next_id: AtomicU64::new(0),
        });
        let handler: Arc<dyn EvictionHandler> = owners.clone();
        let pool = Arc::new(Z3foldPool::new(source.clone(), Some(handler)).unwrap());

        let workers: Vec<_> = (0..3)
            .map(|t| {
                let pool = pool.clone();
                let owners = owners.clone();
                thread::spawn(move || {
                    let mut rng = Rng(0xdead_beef ^ (t as u64 + 7));
                    let tag = 0x40 + t as u8;
                    let mut mine: Vec<(Handle, usize, u64)> = Vec::new();
                    for i in 0..1500 {
                        if i % 2 == 0 {
                            let size = rng.size();
                            let h = pool.alloc(size, false).unwrap();
                            fill(&pool, h, size, tag);
                            let id = owners.next_id.fetch_add(1, Ordering::Relaxed);
                            owners.live.lock().unwrap().insert(h, id);
                            mine.push((h, size, id));
                        } else if !mine.is_empty() {
                            let idx = (rng.next() as usize) % mine.len();
                            let (h, size, id) = mine.swap_remove(idx);
                            let mut live = owners.live.lock().unwrap();
                            // Otherwise the handler already evicted it.
                            if live.get(&h) == Some(&id) {
                                live.remove(&h);
                                verify(&pool, h, size, tag);
                                pool.free(h);
                            }
                        }
                    }
                    for (h, _, id) in mine {
                        let mut live = owners.live.lock().unwrap();
                        if live.get(&h) == Some(&id) {
                            live.remove(&h);
                            pool.free(h);
                        }
                    }
                })
            })
            .collect();

        let reclaimer = {
            let pool = pool.clone();
            thread::spawn(move || {
                let mut freed = 0;
                for _ in 0..500 {
                    if pool.reclaim(4).is_ok() {
                        freed += 1;
                    }
                    thread::yield_now();
                }
                freed
            })
        };

        for w in workers {
            w.join().unwrap();
        }
        let freed = reclaimer.join().unwrap();
        log::info!("reclaimer freed {freed} page(s)");

        pool.check_invariants();
        assert!(owners.live.lock().unwrap().is_empty());
        assert_eq!(pool.size(), 0);
        assert_eq!(source.live_pages(), 0);
    }

    #[test]
    fn test_integration_arena_exhaustion_and_reuse() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        init_logger();
        let arena = Arc::new(PageArena::new(PAGE, 16 * PAGE).unwrap());
        let capacity = arena.capacity_pages();
        let pool = Z3foldPool::new(arena.clone(), None).unwrap();

        let mut handles = Vec::new();
        let err = loop {
            match pool.alloc(1500, false) {
                Ok(h) => handles.push(h),
                Err(e) => break e,
            }
        };
        assert!(matches!(err, Z3foldError::OutOfMemory(_)));
        assert_eq!(pool.size(), capacity as u64);
        // 1500 bytes = 24 chunks: two per page, the third does not fit.
        assert_eq!(handles.len(), 2 * capacity);

        // Smaller objects still fit in the gap left on each page.
        let small = pool.alloc(500, false).unwrap();
        assert_eq!(pool.size(), capacity as u64);
        pool.check_invariants();

        pool.free(small);
        for h in handles {
            pool.free(h);
        }
        assert_eq!(arena.live_pages(), 0);
        assert!(pool.alloc(1500, false).is_ok());
    }

    #[test]
    fn test_integration_pool_on_large_pages() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let arena = Arc::new(PageArena::new(65536, 8 * 65536).unwrap());
        assert_eq!(arena.page_size(), 65536);
        let pool = Z3foldPool::new(arena.clone(), None).unwrap();
        assert_eq!(pool.geometry().chunk_size(), 1024);

        let a = pool.alloc(20_000, false).unwrap();
        let b = pool.alloc(20_000, false).unwrap();
        let c = pool.alloc(20_000, false).unwrap();
        assert_eq!(pool.size(), 1);
        fill(&pool, a, 20_000, 1);
        fill(&pool, b, 20_000, 2);
        fill(&pool, c, 20_000, 3);
        verify(&pool, a, 20_000, 1);
        verify(&pool, b, 20_000, 2);
        verify(&pool, c, 20_000, 3);

        pool.free(a);
        pool.free(b);
        // c was compacted into FIRST; its contents came along.
        verify(&pool, c, 20_000, 3);
        pool.free(c);
        assert_eq!(arena.live_pages(), 0);
    }

    struct FreeingOps;

    impl ZpoolOps for FreeingOps {
        fn evict(&self, pool: &dyn ZpoolBackend, handle: Handle) -> Result<(), Z3foldError> {
            pool.free(handle);
            Ok(())
        }
    }

    #[test]
    fn test_integration_zpool_over_arena() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        init_logger();
        let arena = Arc::new(PageArena::new(PAGE, 64 * PAGE).unwrap());
        let registry = ZpoolRegistry::with_default_drivers(arena.clone());
        let ops: Arc<dyn ZpoolOps> = Arc::new(FreeingOps);
        let zpool = registry.create_pool("z3fold", "zswap", Some(ops)).unwrap();

        let handles: Vec<_> = (0..30).map(|_| zpool.malloc(1000, false).unwrap()).collect();
        for (i, &h) in handles.iter().enumerate() {
            let ptr = zpool.map(h, MapMode::WriteOnly).unwrap();
            // Safety: Test code; objects are 1000 bytes.
            unsafe { std::ptr::write_bytes(ptr.as_ptr(), i as u8, 1000) };
            zpool.unmap(h);
        }
        let pages = arena.live_pages();
        assert_eq!(zpool.total_size(), (pages * PAGE) as u64);

        assert_eq!(zpool.shrink(pages).unwrap(), pages);
        assert_eq!(zpool.total_size(), 0);
        assert_eq!(arena.live_pages(), 0);
    }

    #[test]
    fn test_integration_global_counters_move() {
        let _guard = crate::memory::TEST_MUTEX.write().unwrap();
        let before = stats::snapshot();
        let source = Arc::new(HeapPageSource::new(PAGE).unwrap());
        let handler: Arc<dyn EvictionHandler> =
            Arc::new(|pool: &Z3foldPool, handle: Handle| -> Result<(), Z3foldError> {
                pool.free(handle);
                Ok(())
            });
        let pool = Z3foldPool::new(source, Some(handler)).unwrap();

        let a = pool.alloc(500, false).unwrap();
        let b = pool.alloc(500, false).unwrap();
        let _c = pool.alloc(500, false).unwrap();
        pool.free(a);
        pool.free(b);
        // Unit tests elsewhere run concurrently; only monotonic counters are
        // compared.
        let mid = stats::snapshot();
        assert!(mid.z3fold_compactions > before.z3fold_compactions);

        pool.reclaim(1).unwrap();
        let after = stats::snapshot();
        assert!(after.z3fold_reclaimed > before.z3fold_reclaimed);
        assert_eq!(pool.size(), 0);
    }
}
