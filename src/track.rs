use std::sync::Arc;
use std::time::Instant;
use log::debug;
use parking_lot::{RwLock, RwLockWriteGuard};
use crate::cache::Cache;
use crate::data::{Process, ProcessId};

// Shared view of a queue's process cache. Lookups take the read lock and
// return copies, so they never see a record mid-update and stay valid after
// the process is evicted.
#[derive(Clone, Debug)]
pub struct Tracker {
    table: Arc<RwLock<Cache>>,
}

impl Tracker {
    pub fn new(cache: Cache) -> Self {
        let table = Arc::new(RwLock::new(cache));
        Self { table }
    }

    pub fn get(&self, pid: u32) -> Option<Process> {
        self.table.read().lookup(pid, Instant::now()).cloned()
    }

    pub fn get_id(&self, id: &ProcessId) -> Option<Process> {
        self.table.read().lookup_id(id).cloned()
    }

    pub fn len(&self) -> usize {
        self.table.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.read().is_empty()
    }

    pub(crate) fn write(&self) -> RwLockWriteGuard<'_, Cache> {
        self.table.write()
    }

    pub(crate) fn sweep(&self, now: Instant) {
        let evicted = self.table.write().expire(now);
        if evicted > 0 {
            debug!("swept {} exited processes", evicted);
        }
    }

    pub(crate) fn stats(&self) -> (usize, usize, u64, u64) {
        let cache = self.table.read();
        (cache.len(), cache.live(), cache.over_limit(), cache.replaced())
    }

    pub(crate) fn clear(&self) {
        self.table.write().clear();
    }
}
