//! Named-driver glue: exposes z3fold through a generic compressed-page-pool
//! interface so a host can pick an allocator by type name.

use super::geometry::{Handle, Z3foldConfig};
use super::page_source::{HeapPageSource, PageSource};
use super::vm::{PlatformVmOps, VmOps};
use super::z3fold::{EvictionHandler, Z3foldError, Z3foldPool};
use crate::sync::{OnceLock, RwLock};
use std::collections::HashMap;
use std::ptr::NonNull;
use std::sync::{Arc, PoisonError};

/// Reclaim attempts per page requested from [`ZpoolBackend::shrink`].
const SHRINK_RECLAIM_RETRIES: usize = 8;

/// How the caller intends to touch a mapped object. z3fold maps everything
/// directly, so the mode is advisory.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MapMode {
    ReadOnly,
    WriteOnly,
    ReadWrite,
}

/// Callbacks a pool user supplies when creating a pool.
pub trait ZpoolOps: Send + Sync {
    /// Move the object behind `handle` elsewhere and free it in `pool`.
    ///
    /// # Errors
    ///
    /// Any error leaves the object in place.
    fn evict(&self, pool: &dyn ZpoolBackend, handle: Handle) -> Result<(), Z3foldError>;
}

/// A pool created by a [`ZpoolDriver`].
pub trait ZpoolBackend: Send + Sync {
    /// # Errors
    ///
    /// See [`Z3foldPool::alloc`].
    fn malloc(&self, size: usize, allow_high_memory: bool) -> Result<Handle, Z3foldError>;

    fn free(&self, handle: Handle);

    /// Reclaim up to `pages` pages.
    ///
    /// # Errors
    ///
    /// Returns the first reclaim error if not a single page was freed.
    fn shrink(&self, pages: usize) -> Result<usize, Z3foldError>;

    fn map(&self, handle: Handle, mode: MapMode) -> Option<NonNull<u8>>;

    fn unmap(&self, handle: Handle);

    /// Bytes of pages currently held.
    fn total_size(&self) -> u64;
}

impl ZpoolBackend for Z3foldPool {
    fn malloc(&self, size: usize, allow_high_memory: bool) -> Result<Handle, Z3foldError> {
        self.alloc(size, allow_high_memory)
    }

    fn free(&self, handle: Handle) {
        Z3foldPool::free(self, handle);
    }

    fn shrink(&self, pages: usize) -> Result<usize, Z3foldError> {
        if pages > 0 && !self.has_eviction_handler() {
            return Err(Z3foldError::InvalidState("pool created without evict ops"));
        }
        let mut reclaimed = 0;
        while reclaimed < pages {
            match self.reclaim(SHRINK_RECLAIM_RETRIES) {
                Ok(()) => reclaimed += 1,
                Err(e) if reclaimed == 0 => return Err(e),
                Err(e) => {
                    log::debug!("zpool: shrink stopped after {reclaimed} page(s): {e}");
                    break;
                }
            }
        }
        Ok(reclaimed)
    }

    fn map(&self, handle: Handle, _mode: MapMode) -> Option<NonNull<u8>> {
        Z3foldPool::map(self, handle)
    }

    fn unmap(&self, handle: Handle) {
        Z3foldPool::unmap(self, handle);
    }

    fn total_size(&self) -> u64 {
        Z3foldPool::total_size(self)
    }
}

/// Routes pool evictions to the user's [`ZpoolOps`].
struct OpsEvictor(Arc<dyn ZpoolOps>);

impl EvictionHandler for OpsEvictor {
    fn evict(&self, pool: &Z3foldPool, handle: Handle) -> Result<(), Z3foldError> {
        self.0.evict(pool, handle)
    }
}

/// Factory for pools of one allocator type.
pub trait ZpoolDriver: Send + Sync {
    fn type_name(&self) -> &'static str;

    /// # Errors
    ///
    /// Returns whatever the allocator reports for an unusable configuration.
    fn create(
        &self,
        name: &str,
        ops: Option<Arc<dyn ZpoolOps>>,
    ) -> Result<Box<dyn ZpoolBackend>, Z3foldError>;
}

pub struct Z3foldDriver {
    source: Arc<dyn PageSource>,
    config: Z3foldConfig,
}

impl Z3foldDriver {
    pub const TYPE_NAME: &'static str = "z3fold";

    #[must_use]
    pub fn new(source: Arc<dyn PageSource>) -> Self {
        Self::with_config(source, Z3foldConfig::default())
    }

    #[must_use]
    pub fn with_config(source: Arc<dyn PageSource>, config: Z3foldConfig) -> Self {
        Self { source, config }
    }
}

impl ZpoolDriver for Z3foldDriver {
    fn type_name(&self) -> &'static str {
        Self::TYPE_NAME
    }

    fn create(
        &self,
        name: &str,
        ops: Option<Arc<dyn ZpoolOps>>,
    ) -> Result<Box<dyn ZpoolBackend>, Z3foldError> {
        // Without ops the pool has no eviction handler and cannot shrink.
        let handler = ops.map(|ops| Arc::new(OpsEvictor(ops)) as Arc<dyn EvictionHandler>);
        let pool = Z3foldPool::with_config(self.source.clone(), handler, &self.config)?;
        log::debug!("zpool: created {} pool {name:?}", Self::TYPE_NAME);
        Ok(Box::new(pool))
    }
}

/// Drivers by type name.
pub struct ZpoolRegistry {
    drivers: RwLock<HashMap<&'static str, Arc<dyn ZpoolDriver>>>,
}

impl Default for ZpoolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ZpoolRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self {
            drivers: RwLock::new(HashMap::new()),
        }
    }

    /// A registry with the z3fold driver registered over `source`.
    #[must_use]
    pub fn with_default_drivers(source: Arc<dyn PageSource>) -> Self {
        let registry = Self::new();
        let mut drivers = registry
            .drivers
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        drivers.insert(Z3foldDriver::TYPE_NAME, Arc::new(Z3foldDriver::new(source)));
        drop(drivers);
        registry
    }

    /// # Errors
    ///
    /// Returns `DriverExists` if a driver with the same type name is present.
    pub fn register_driver(&self, driver: Arc<dyn ZpoolDriver>) -> Result<(), Z3foldError> {
        let name = driver.type_name();
        let mut drivers = self.drivers.write().unwrap_or_else(PoisonError::into_inner);
        if drivers.contains_key(name) {
            return Err(Z3foldError::DriverExists(name.to_owned()));
        }
        drivers.insert(name, driver);
        log::debug!("zpool: registered driver {name:?}");
        Ok(())
    }

    /// Pools already created by the driver keep working.
    ///
    /// # Errors
    ///
    /// Returns `UnknownDriver` if nothing is registered under `name`.
    pub fn unregister_driver(&self, name: &str) -> Result<(), Z3foldError> {
        let mut drivers = self.drivers.write().unwrap_or_else(PoisonError::into_inner);
        match drivers.remove(name) {
            Some(_) => {
                log::debug!("zpool: unregistered driver {name:?}");
                Ok(())
            }
            None => Err(Z3foldError::UnknownDriver(name.to_owned())),
        }
    }

    #[must_use]
    pub fn has_driver(&self, name: &str) -> bool {
        self.drivers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(name)
    }

    /// Create a pool named `name` from the driver registered as `type_name`.
    ///
    /// # Errors
    ///
    /// Returns `UnknownDriver` for an unregistered type, or the driver's own
    /// creation error.
    pub fn create_pool(
        &self,
        type_name: &str,
        name: &str,
        ops: Option<Arc<dyn ZpoolOps>>,
    ) -> Result<Box<dyn ZpoolBackend>, Z3foldError> {
        let driver = self
            .drivers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(type_name)
            .cloned()
            .ok_or_else(|| Z3foldError::UnknownDriver(type_name.to_owned()))?;
        driver.create(name, ops)
    }
}

/// Process-wide registry, populated with the default drivers over a heap
/// page source on first use.
pub struct GlobalZpoolRegistry;

impl GlobalZpoolRegistry {
    pub fn get() -> &'static ZpoolRegistry {
        static REGISTRY: OnceLock<ZpoolRegistry> = OnceLock::new();
        REGISTRY.get_or_init(|| match HeapPageSource::new(PlatformVmOps::page_size()) {
            Ok(source) => ZpoolRegistry::with_default_drivers(Arc::new(source)),
            Err(e) => {
                log::error!("zpool: no default page source: {e}");
                ZpoolRegistry::new()
            }
        })
    }
}
