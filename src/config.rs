//! Runtime configuration of a hazard domain and the structures built on it.
//!
//! The size of the thread table is a compile time choice made through cargo features, everything
//! else is carried by `Config`.

use crate::arena::MAX_ARENA_CAPACITY;
use crate::error::Error;

cfg_if! {
    if #[cfg(feature = "max_thread_count_4096")] {
        pub const MAX_THREAD_COUNT: usize = 4096;
    } else if #[cfg(feature = "max_thread_count_256")] {
        pub const MAX_THREAD_COUNT: usize = 256;
    } else if #[cfg(feature = "max_thread_count_16")] {
        pub const MAX_THREAD_COUNT: usize = 16;
    } else {
        /// Maximum number of threads that may hold a lease on one domain at the same time
        pub const MAX_THREAD_COUNT: usize = 128;
    }
}

/// Hazard slots owned by each thread record. The queue needs two: one for the node being read
/// and one for its successor.
pub const HAZARDS_PER_THREAD: usize = 2;

/// Limits of the `Backoff` used by every CAS retry loop.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct BackoffPolicy {
    /// Steps up to this one busy-spin `2^step` times.
    pub spin_limit: u32,
    /// Steps past `spin_limit` yield to the scheduler; past `yield_limit` the backoff is
    /// reported as completed and stops growing.
    pub yield_limit: u32,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        BackoffPolicy {
            spin_limit: 6,
            yield_limit: 10,
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Config {
    /// A thread scans its retire list once the list holds
    /// `scan_threshold_factor * registered threads * HAZARDS_PER_THREAD` nodes.
    pub scan_threshold_factor: usize,
    /// Lower bound of the scan threshold.
    pub min_scan_threshold: usize,
    /// Idle time (microsecond) after which a lease may be taken back by
    /// `HazardDomain::reclaim_expired_leases`. 0 disables expiry.
    pub lease_timeout_us: i64,
    /// Capacity of the node arena.
    pub max_nodes: u32,
    pub backoff: BackoffPolicy,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            scan_threshold_factor: 2,
            min_scan_threshold: 64,
            lease_timeout_us: 0,
            max_nodes: MAX_ARENA_CAPACITY,
            backoff: BackoffPolicy::default(),
        }
    }
}

impl Config {
    pub fn with_scan_threshold(mut self, factor: usize, min: usize) -> Self {
        self.scan_threshold_factor = factor;
        self.min_scan_threshold = min;
        self
    }

    pub fn with_lease_timeout_us(mut self, lease_timeout_us: i64) -> Self {
        self.lease_timeout_us = lease_timeout_us;
        self
    }

    pub fn with_max_nodes(mut self, max_nodes: u32) -> Self {
        self.max_nodes = max_nodes;
        self
    }

    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn validate(&self) -> Result<(), Error> {
        if self.min_scan_threshold == 0
            || self.lease_timeout_us < 0
            || self.max_nodes == 0
            || self.max_nodes > MAX_ARENA_CAPACITY
            || self.backoff.spin_limit > self.backoff.yield_limit
            || self.backoff.yield_limit >= 32
        {
            warn!("invalid config {:?}", self);
            return Err(Error::InvalidParam);
        }
        Ok(())
    }

    /// Retire list length that triggers a scan for the given number of registered threads.
    pub fn scan_threshold(&self, registered: usize) -> usize {
        let proportional = self
            .scan_threshold_factor
            .saturating_mul(registered)
            .saturating_mul(HAZARDS_PER_THREAD);
        if proportional > self.min_scan_threshold {
            proportional
        } else {
            self.min_scan_threshold
        }
    }
}
