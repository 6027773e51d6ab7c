//! Shared services for the scheduler and its jobs.
//!
//! [`AppContext`] is cloned into every Job. It wraps the catalog pool, the
//! lease manager, the processor registry and the storage layout in `Arc`s so
//! a clone is cheap.

use std::sync::Arc;

use ingestd_db::pool::DbPool;

use crate::lease::LeaseManager;
use crate::processor::ProcessorRegistry;
use crate::shutdown::Shutdown;
use crate::storage::Storage;

#[derive(Clone)]
pub struct AppContext {
    pub pool: DbPool,
    pub leases: Arc<LeaseManager>,
    pub processors: Arc<ProcessorRegistry>,
    pub storage: Arc<Storage>,
    pub shutdown: Shutdown,
    /// Give processors a private copy of the source instead of the original.
    pub work_with_copy: bool,
}

impl AppContext {
    pub fn new(
        pool: DbPool,
        leases: Arc<LeaseManager>,
        processors: ProcessorRegistry,
        storage: Storage,
        shutdown: Shutdown,
        work_with_copy: bool,
    ) -> Self {
        Self {
            pool,
            leases,
            processors: Arc::new(processors),
            storage: Arc::new(storage),
            shutdown,
            work_with_copy,
        }
    }
}
