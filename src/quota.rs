use crate::store::Store;
use anyhow::{Context, Result};

/// Connections reserved for job processing. Kept below the replica cluster's
/// real per-user ceiling so interactive traffic still gets through.
pub const HARD_QUOTA: u32 = 5;

/// Reports how many connections to the replica cluster are open right now.
pub trait ConnectionMonitor {
    fn open_connections(&self) -> Result<u32>;
}

/// Treats every busy job in the shared state database as one held replica
/// connection, which is what each running statistics computation uses.
pub struct BusyJobMonitor<'a> {
    store: &'a Store,
}

impl<'a> BusyJobMonitor<'a> {
    pub fn new(store: &'a Store) -> Self {
        Self { store }
    }
}

impl ConnectionMonitor for BusyJobMonitor<'_> {
    fn open_connections(&self) -> Result<u32> {
        self.store.count_busy()
    }
}

pub struct QuotaMonitor<'a> {
    monitor: &'a dyn ConnectionMonitor,
    hard_quota: u32,
}

impl<'a> QuotaMonitor<'a> {
    pub fn new(monitor: &'a dyn ConnectionMonitor, hard_quota: u32) -> Self {
        Self {
            monitor,
            hard_quota,
        }
    }

    pub fn hard_quota(&self) -> u32 {
        self.hard_quota
    }

    /// Polled fresh on every call; nothing is reserved, so concurrent
    /// dispatchers may together overshoot the hard quota.
    pub fn available_quota(&self) -> Result<u32> {
        let open = self
            .monitor
            .open_connections()
            .context("query open replica connections")?;
        Ok(self.hard_quota.saturating_sub(open))
    }
}
